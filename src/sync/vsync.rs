// Copyright © 2022 Kim Altintop <kim@eagain.io>
// SPDX-License-Identifier: GPL-2.0-only WITH openvpn-openssl-exception

//! State-vector dissemination: each peer periodically re-announces its
//! latest branch-head set as a sync interest, and surfaces announcements
//! that differ from its own.
//!
//! Reliability comes from the periodic retransmission alone; individual
//! sends are fire-and-forget. The `bouncing_updates` set keeps a pair of
//! peers that answer each other's announcements from ping-ponging
//! forever: a digest seen twice without our own content changing in
//! between is not re-announced.

use std::{
    cell::RefCell,
    collections::HashSet,
    rc::Rc,
    time::Duration,
};

use digest::Digest;
use log::debug;
use sha2::Sha256;

use crate::ndn::{
    face,
    Face,
    Interest,
    Name,
};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

pub type Digest32 = [u8; 32];

pub type OnUpdate = Rc<dyn Fn(&[u8], Digest32)>;

pub struct VSync {
    face: Rc<dyn Face>,
    prefix: Name,
    interval: Duration,
    on_update: OnUpdate,
    content_latest: RefCell<Option<Vec<u8>>>,
    bouncing_updates: RefCell<HashSet<Digest32>>,
}

impl VSync {
    pub fn new(
        face: Rc<dyn Face>,
        prefix: Name,
        interval: Duration,
        on_update: OnUpdate,
    ) -> Rc<Self> {
        let this = Rc::new(Self {
            face,
            prefix,
            interval,
            on_update,
            content_latest: RefCell::new(None),
            bouncing_updates: RefCell::new(HashSet::new()),
        });

        let recv = Rc::clone(&this);
        this.face.register(
            this.prefix.clone(),
            face::handler(move |interest: Interest| {
                let recv = Rc::clone(&recv);
                async move {
                    recv.on_interest(interest);
                    None
                }
            }),
        );
        this
    }

    fn on_interest(&self, interest: Interest) {
        let param = match interest.app_param {
            Some(param) => param,
            None => return,
        };
        if self.content_latest.borrow().as_ref() == Some(&param) {
            return;
        }
        let digest: Digest32 = Sha256::digest(&param).into();
        (self.on_update)(&param, digest);
    }

    /// Record `content` as this peer's latest announcement and schedule
    /// sending it.
    ///
    /// `respond_to` is the digest of the incoming announcement this
    /// publication responds to, if any; announcing the same response
    /// twice is suppressed until our own content changes.
    pub fn publish_update(&self, content: Vec<u8>, respond_to: Option<Digest32>) {
        if self.content_latest.borrow().as_ref() != Some(&content) {
            self.bouncing_updates.borrow_mut().clear();
        }
        *self.content_latest.borrow_mut() = Some(content.clone());

        if let Some(digest) = respond_to {
            if !self.bouncing_updates.borrow_mut().insert(digest) {
                debug!("Suppressed bouncing announcement on {}", self.prefix);
                return;
            }
        }

        let face = Rc::clone(&self.face);
        let prefix = self.prefix.clone();
        tokio::task::spawn_local(send_update(face, prefix, content));
    }

    /// Re-announce every `interval` until the task is dropped.
    pub async fn run(self: Rc<Self>) {
        loop {
            tokio::time::sleep(self.interval).await;
            self.send_latest().await;
        }
    }

    async fn send_latest(&self) {
        let content = match &*self.content_latest.borrow() {
            Some(content) => content.clone(),
            None => return,
        };
        send_update(Rc::clone(&self.face), self.prefix.clone(), content).await
    }
}

async fn send_update(face: Rc<dyn Face>, prefix: Name, content: Vec<u8>) {
    let interest = Interest::new(prefix.clone()).with_param(content);
    // timeouts and nacks are absorbed, periodic retx is the recovery
    if let Err(e) = face.express(interest).await {
        debug!("Sync interest on {} not answered: {}", prefix, e);
    }
}
