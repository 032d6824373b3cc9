// Copyright © 2022 Kim Altintop <kim@eagain.io>
// SPDX-License-Identifier: GPL-2.0-only WITH openvpn-openssl-exception

//! The segmented, type-aware, recursive object fetcher.
//!
//! One `fetch` walks the commit → tree → blob closure depth-first and
//! serially; in-flight work is bounded by issuing concurrent fetches only
//! at the root, per ref. The same module answers incoming object
//! interests by segmenting stored objects.

use std::{
    future::Future,
    pin::Pin,
    rc::Rc,
    time::Duration,
};

use log::{
    info,
    warn,
};

use super::packet::SyncObject;
use crate::{
    git::{
        commit,
        tree,
        GitRepo,
    },
    ndn::{
        face,
        Component,
        Face,
        Interest,
        Name,
        Reply,
    },
};

pub const SEGMENT_SIZE: usize = 4000;
const FRESHNESS: Duration = Duration::from_secs(3600);

pub mod error {
    use thiserror::Error;

    use crate::{
        git::{
            commit,
            tree,
        },
        ndn::{
            face,
            DecodeError,
        },
    };

    #[derive(Debug, Error)]
    pub enum Fetch {
        #[error(transparent)]
        Expressed(#[from] face::error::Expressed),
        #[error("invalid object payload")]
        Decode(#[from] DecodeError),
        #[error("{expected} is expected but got {got}")]
        TypeMismatch {
            expected: git2::ObjectType,
            got: String,
        },
        #[error("unknown object type {0}")]
        UnknownType(String),
        #[error(transparent)]
        Commit(#[from] commit::error::Commit),
        #[error(transparent)]
        Tree(#[from] tree::error::Tree),
        #[error("object store failure")]
        Store(#[from] git2::Error),
    }
}

pub struct ObjectFetcher {
    face: Rc<dyn Face>,
    repo: Rc<GitRepo>,
    prefix: Name,
}

impl ObjectFetcher {
    /// `prefix` is the repo's objects prefix; the fetcher also answers
    /// interests under it out of the local store.
    pub fn new(face: Rc<dyn Face>, repo: Rc<GitRepo>, prefix: Name) -> Rc<Self> {
        let this = Rc::new(Self {
            face,
            repo,
            prefix,
        });

        let serve = Rc::clone(&this);
        this.face.register(
            this.prefix.clone(),
            face::handler(move |interest: Interest| {
                let serve = Rc::clone(&serve);
                async move { serve.on_interest(&interest) }
            }),
        );
        this
    }

    pub fn close(&self) {
        self.face.unregister(&self.prefix);
    }

    /// Fetch `oid` and everything reachable from it, deduplicating
    /// against the local store. A failure may leave a partial graph
    /// behind; re-runs pick up where it stopped.
    pub async fn fetch(
        &self,
        expected: Option<git2::ObjectType>,
        oid: git2::Oid,
    ) -> Result<(), error::Fetch> {
        self.fetch_rec(expected, oid).await
    }

    fn fetch_rec<'a>(
        &'a self,
        expected: Option<git2::ObjectType>,
        oid: git2::Oid,
    ) -> Pin<Box<dyn Future<Output = Result<(), error::Fetch>> + 'a>> {
        Box::pin(async move {
            if self.repo.has_obj(oid)? {
                return Ok(());
            }

            let (kind, data) = self.fetch_segments(oid).await?;
            let kind_str = String::from_utf8_lossy(&kind).into_owned();
            let kind = match git2::ObjectType::from_str(&kind_str) {
                Some(kind @ (git2::ObjectType::Blob
                | git2::ObjectType::Tree
                | git2::ObjectType::Commit)) => kind,
                _ => return Err(error::Fetch::UnknownType(kind_str)),
            };
            if let Some(expected) = expected {
                if expected != kind {
                    return Err(error::Fetch::TypeMismatch {
                        expected,
                        got: kind_str,
                    });
                }
            }
            self.repo.store_obj(kind, &data)?;

            match kind {
                git2::ObjectType::Commit => {
                    let links = commit::links(&data)?;
                    if let Some(tree) = links.tree {
                        self.fetch_rec(Some(git2::ObjectType::Tree), tree).await?;
                    }
                    for parent in links.parents {
                        self.fetch_rec(Some(git2::ObjectType::Commit), parent)
                            .await?;
                    }
                },
                git2::ObjectType::Tree => {
                    for entry in tree::parse(&data)?.values() {
                        let expected = if entry.is_blob() {
                            git2::ObjectType::Blob
                        } else {
                            git2::ObjectType::Tree
                        };
                        self.fetch_rec(Some(expected), entry.oid).await?;
                    }
                },
                _ => {},
            }
            Ok(())
        })
    }

    /// Reassemble the object from its segments. Every segment carries
    /// the object type; the final-block indicator terminates.
    async fn fetch_segments(&self, oid: git2::Oid) -> Result<(Vec<u8>, Vec<u8>), error::Fetch> {
        let base = self
            .prefix
            .clone()
            .append(Component::from_bytes(oid.as_bytes()));

        let mut obj_type: Option<Vec<u8>> = None;
        let mut data = Vec::new();
        let mut seg = 0u64;
        loop {
            let name = base.clone().append(Component::from_segment(seg));
            let reply = self.face.express(Interest::new(name)).await?;
            let pack = SyncObject::parse(&reply.content)?;
            match &obj_type {
                None => obj_type = Some(pack.obj_type),
                Some(first) if *first != pack.obj_type => {
                    return Err(error::Fetch::TypeMismatch {
                        expected: git2::ObjectType::from_str(
                            &String::from_utf8_lossy(first),
                        )
                        .unwrap_or(git2::ObjectType::Any),
                        got: String::from_utf8_lossy(&pack.obj_type).into_owned(),
                    })
                },
                Some(_) => {},
            }
            data.extend_from_slice(&pack.obj_data);

            match reply.final_block_id {
                Some(fb) if fb.is_segment() && fb.to_number() > seg => seg += 1,
                _ => break,
            }
        }
        Ok((obj_type.expect("at least one segment was fetched"), data))
    }

    /// Answer an object interest with the requested segment.
    fn on_interest(&self, interest: &Interest) -> Option<Reply> {
        let name = &interest.name;
        let (obj_name, seg_no) = match name.from_end(1) {
            Some(c) if c.is_segment() => (name.from_end(2)?, c.to_number()),
            Some(c) => (c, 0),
            None => return None,
        };
        let oid = match git2::Oid::from_bytes(obj_name.value()) {
            Ok(oid) => oid,
            Err(_) => return None,
        };

        let (kind, data) = match self.repo.read_obj(oid) {
            Ok(read) => read,
            Err(_) => {
                warn!(
                    "Requested object {} does not exist in repo {}",
                    oid,
                    self.repo.name()
                );
                return None;
            },
        };

        let start = (seg_no as usize * SEGMENT_SIZE).min(data.len());
        let end = (start + SEGMENT_SIZE).min(data.len());
        let pack = SyncObject {
            obj_type: kind.str().as_bytes().to_vec(),
            obj_data: data[start..end].to_vec(),
        };
        let final_block = (data.len() + SEGMENT_SIZE - 1) / SEGMENT_SIZE;

        let data_name = self
            .prefix
            .clone()
            .append(Component::from_bytes(oid.as_bytes()))
            .append(Component::from_segment(seg_no));
        info!(
            "Responded {} segment {} in repo {}",
            oid,
            seg_no,
            self.repo.name()
        );
        Some(
            Reply::new(data_name, pack.encode())
                .with_freshness(FRESHNESS)
                .with_final_block(Component::from_segment(final_block as u64)),
        )
    }
}
