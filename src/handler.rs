// Copyright © 2022 Kim Altintop <kim@eagain.io>
// SPDX-License-Identifier: GPL-2.0-only WITH openvpn-openssl-exception

//! The per-repository request surface: ref enumeration and pushes.

use std::{
    fmt::Write as _,
    rc::Rc,
    time::{
        Duration,
        SystemTime,
    },
};

use log::{
    info,
    warn,
};

use crate::{
    git::{
        GitRepo,
        Refname,
    },
    ndn::{
        face,
        Component,
        Face,
        Interest,
        Name,
        Reply,
    },
    sync::{
        fetch::ObjectFetcher,
        packet::PushRequest,
        pipeline::RepoSyncPipeline,
    },
};

const REPLY_FRESHNESS: Duration = Duration::from_secs(1);

pub struct Handler {
    repo: Rc<GitRepo>,
    pipeline: Rc<RepoSyncPipeline>,
    fetcher: Rc<ObjectFetcher>,
}

impl Handler {
    /// Registers `<prefix>/ref-list` and `<prefix>/push`.
    pub fn new(
        face: Rc<dyn Face>,
        prefix: Name,
        repo: Rc<GitRepo>,
        pipeline: Rc<RepoSyncPipeline>,
        fetcher: Rc<ObjectFetcher>,
    ) -> Rc<Self> {
        let this = Rc::new(Self {
            repo,
            pipeline,
            fetcher,
        });

        let on_ref_list = Rc::clone(&this);
        face.register(
            prefix.clone().append(Component::from_bytes("ref-list")),
            face::handler(move |interest: Interest| {
                let this = Rc::clone(&on_ref_list);
                async move { this.ref_list(interest) }
            }),
        );
        let on_push = Rc::clone(&this);
        face.register(
            prefix.append(Component::from_bytes("push")),
            face::handler(move |interest: Interest| {
                let this = Rc::clone(&on_push);
                async move { this.push(interest).await }
            }),
        );
        this
    }

    /// `<hex-head> <ref-name>` per line.
    fn ref_list(&self, interest: Interest) -> Option<Reply> {
        let heads = match self.repo.ref_heads() {
            Ok(heads) => heads,
            Err(e) => {
                warn!("Unable to enumerate refs of {}: {}", self.repo.name(), e);
                return None;
            },
        };
        let mut result = String::new();
        for (name, head) in heads {
            writeln!(result, "{} {}", head, name).expect("writing to a string");
        }
        if result.is_empty() {
            result.push('\n');
        }

        let name = interest
            .name
            .append(Component::from_timestamp(timestamp_millis()));
        Some(Reply::new(name, result.into_bytes()).with_freshness(REPLY_FRESHNESS))
    }

    /// Reply `SUCCEEDED`/`FAILED` if the push settles within half the
    /// interest lifetime, `PENDING` otherwise; a pending push keeps
    /// running and a retry of the same request is idempotent.
    async fn push(&self, interest: Interest) -> Option<Reply> {
        let request = match interest.app_param.as_deref().map(PushRequest::parse) {
            Some(Ok(request)) => request,
            _ => {
                warn!("Invalid push request {}", interest.name);
                return None;
            },
        };
        let name = match Refname::from_wire(&request.ref_info.ref_name) {
            Ok(name) => name,
            Err(e) => {
                warn!("Invalid push ref name: {}", e);
                return None;
            },
        };
        let head = request.ref_info.ref_head;
        info!("On push request: {} {}", name, head);

        let repo = Rc::clone(&self.repo);
        let pipeline = Rc::clone(&self.pipeline);
        let fetcher = Rc::clone(&self.fetcher);
        let task = tokio::task::spawn_local(async move {
            process_push(repo, pipeline, fetcher, name, head, request.force).await
        });

        let content = match tokio::time::timeout(interest.lifetime / 2, task).await {
            Ok(Ok(Ok(true))) => "SUCCEEDED",
            Ok(Ok(Ok(false))) => "FAILED",
            Ok(Ok(Err(e))) => {
                warn!("Push of {} failed: {:#}", head, e);
                "FAILED"
            },
            Ok(Err(e)) => {
                warn!("Push task died: {}", e);
                "FAILED"
            },
            // the task keeps running to completion
            Err(_elapsed) => "PENDING",
        };
        let name = interest
            .name
            .append(Component::from_timestamp(timestamp_millis()));
        Some(Reply::new(name, content.into()).with_freshness(REPLY_FRESHNESS))
    }
}

async fn process_push(
    repo: Rc<GitRepo>,
    pipeline: Rc<RepoSyncPipeline>,
    fetcher: Rc<ObjectFetcher>,
    name: Refname,
    head: git2::Oid,
    force: bool,
) -> crate::Result<bool> {
    if let Err(e) = fetcher.fetch(Some(git2::ObjectType::Commit), head).await {
        warn!("Unable to fetch pushed commit {}: {}", head, e);
        return Ok(false);
    }

    if force {
        repo.set_head(&name, head)?;
        pipeline.send_sync_update(None)?;
        return Ok(true);
    }

    let accepted = pipeline.linear_update(&name, head)?;
    if accepted {
        pipeline.send_sync_update(None)?;
    }
    Ok(accepted)
}

fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
