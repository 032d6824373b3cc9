// Copyright © 2022 Kim Altintop <kim@eagain.io>
// SPDX-License-Identifier: GPL-2.0-only WITH openvpn-openssl-exception

//! The per-repository sync pipeline: reacts to remote announcements,
//! fetches missing objects, verifies signatures, and applies updates
//! under the linear or merge policy.

use std::{
    cell::{
        Cell,
        RefCell,
    },
    process,
    rc::Rc,
};

use log::{
    debug,
    error,
    warn,
};

use super::{
    fetch::{
        error::Fetch,
        ObjectFetcher,
    },
    merger::{
        error::Merge,
        Merger,
    },
    packet::{
        RefInfo,
        SyncUpdate,
    },
    vsync::{
        Digest32,
        VSync,
    },
};
use crate::{
    account::Accounts,
    git::{
        tree,
        GitRepo,
        Refname,
    },
    proto,
};

pub struct RepoSyncPipeline {
    fetcher: Rc<ObjectFetcher>,
    repo: Rc<GitRepo>,
    accounts: Rc<Accounts>,
    transport: RefCell<Option<Rc<VSync>>>,
    updated: Cell<bool>,
}

impl RepoSyncPipeline {
    pub fn new(
        fetcher: Rc<ObjectFetcher>,
        repo: Rc<GitRepo>,
        accounts: Rc<Accounts>,
    ) -> Rc<Self> {
        Rc::new(Self {
            fetcher,
            repo,
            accounts,
            transport: RefCell::new(None),
            updated: Cell::new(false),
        })
    }

    pub fn set_transport(&self, transport: Rc<VSync>) {
        *self.transport.borrow_mut() = Some(transport);
    }

    /// Entry point for announcements surfaced by the sync transport.
    pub fn on_update(self: Rc<Self>, param: &[u8], digest: Digest32) {
        let update = match SyncUpdate::parse(param) {
            Ok(update) => update,
            Err(e) => {
                warn!("Invalid sync update - {}", e);
                return;
            },
        };
        let mut ref_updates = Vec::new();
        for info in update.ref_info {
            match Refname::from_wire(&info.ref_name) {
                Ok(name) => ref_updates.push((name, info.ref_head)),
                Err(e) => warn!("Invalid ref name in sync update - {}", e),
            }
        }
        debug!("On sync update {:?}", ref_updates);

        tokio::task::spawn_local(async move {
            if let Err(e) = self.after_update(ref_updates, Some(digest)).await {
                // only unrecoverable store failures end up here
                error!("Object store failure, giving up - {:#}", e);
                process::exit(1);
            }
        });
    }

    pub async fn after_update(
        &self,
        ref_updates: Vec<(Refname, git2::Oid)>,
        respond_to: Option<Digest32>,
    ) -> crate::Result<()> {
        self.updated.set(false);
        for (name, head) in ref_updates {
            // Fetch the closure of the announced head
            if let Err(e) = self.fetcher.fetch(Some(git2::ObjectType::Commit), head).await {
                match e {
                    Fetch::Store(e) => return Err(e.into()),
                    e => {
                        warn!("Fetching error - {}", e);
                        continue;
                    },
                }
            }
            // Linear update: compare history
            let accepted = self.linear_update(&name, head)?;
            // Merge update: for append-only branches
            if !accepted && is_mergeable_branch(&name) {
                self.merge_update(&name, head)?;
            }
        }
        if self.updated.get() {
            self.send_sync_update(respond_to)?;
        }
        Ok(())
    }

    /// Fast-forward `name` onto `new_head`, commit by commit.
    ///
    /// Returns `false` if the ref cannot be set linearly. The ref is
    /// advanced per verified commit rather than once at the end:
    /// certificates imported by an earlier commit may be needed to
    /// verify a later one, and a failed walk must retain its progress.
    pub fn linear_update(&self, name: &Refname, new_head: git2::Oid) -> crate::Result<bool> {
        let ori_head = self.repo.get_head(name)?;
        if let Some(ori) = ori_head {
            match self.repo.is_ancestor(ori, new_head) {
                Ok(true) => {},
                Ok(false) => return Ok(false),
                Err(e) => {
                    error!("Fetched commit is not recognized - {}", e);
                    return Ok(false);
                },
            }
        }
        // Immutable branch: ignore the change
        if is_immutable_branch(name) && ori_head.is_some() {
            return Ok(true);
        }
        if ori_head == Some(new_head) {
            return Ok(true);
        }

        for commit in self.repo.commits_between(ori_head, new_head)? {
            if !self.security_check(name, commit)? {
                break;
            }
            debug!("Set head {} -> {}", name, commit);
            self.repo.set_head(name, commit)?;
        }
        self.updated.set(true);
        Ok(true)
    }

    /// Three-way merge of `name`'s current head with `new_head`.
    pub fn merge_update(&self, name: &Refname, new_head: git2::Oid) -> crate::Result<bool> {
        let ori_head = match self.repo.get_head(name)? {
            Some(head) => head,
            None => return Ok(false),
        };
        // An announced head we already contain needs no merge; merging it
        // anyway would mint a fresh merge commit per stale announcement
        if self.repo.is_ancestor(new_head, ori_head)? {
            return Ok(true);
        }
        let (ori_tree, new_tree) =
            match (self.repo.tree_of(ori_head), self.repo.tree_of(new_head)) {
                (Ok(ori), Ok(new)) => (ori, new),
                _ => {
                    warn!("Merge head of {} is not a commit", name);
                    return Ok(false);
                },
            };

        // Equal trees need no merge; the smaller head wins so that both
        // sides settle on the same commit
        if ori_tree == new_tree {
            if new_head < ori_head {
                self.repo.set_head(name, new_head)?;
            }
            self.updated.set(true);
            return Ok(true);
        }

        // A common base is required (as the config records must have a
        // shared history)
        let base = match self.repo.merge_base(ori_head, new_head) {
            Ok(base) => base,
            Err(e) => {
                warn!(
                    "No common base for merge {} {}->{}: {}",
                    name, new_head, ori_head, e
                );
                return Ok(false);
            },
        };

        for commit in self.repo.commits_between(Some(base), new_head)? {
            if !self.security_check(name, commit)? {
                warn!("Security check failed, not merging {}", name);
                return Ok(false);
            }
            if !self.mergeability_check(base, ori_head, new_head)? {
                warn!("Both sides changed a common file, not merging {}", name);
                return Ok(false);
            }
        }

        let merged = match Merger::new(Rc::clone(&self.repo)).create_commit(
            base, ori_head, new_head,
        ) {
            Ok(merged) => merged,
            Err(Merge::Git(e)) => return Err(e.into()),
            Err(e) => {
                warn!("Unable to merge {} {}->{}: {}", name, new_head, ori_head, e);
                return Ok(false);
            },
        };
        self.repo.set_head(name, merged)?;
        self.updated.set(true);
        Ok(true)
    }

    /// Policy gate run for every commit a ref is advanced over.
    pub fn security_check(&self, name: &Refname, commit: git2::Oid) -> crate::Result<bool> {
        if !self.check_signatures(name, commit)? {
            return Ok(false);
        }
        if name.starts_with("refs/users/") && !self.check_user_branch(name, commit)? {
            return Ok(false);
        }
        if is_change_meta_branch(name) && !self.check_change_meta_branch(name, commit) {
            return Ok(false);
        }
        Ok(true)
    }

    /// No common-base blob may differ from the base on both sides, and
    /// no common-base file may be missing on either side.
    fn mergeability_check(
        &self,
        base: git2::Oid,
        lhs: git2::Oid,
        rhs: git2::Oid,
    ) -> crate::Result<bool> {
        let lhs_files = self.flatten_tree(self.repo.tree_of(lhs)?)?;
        let rhs_files = self.flatten_tree(self.repo.tree_of(rhs)?)?;

        for (path, entry) in self.flatten_tree(self.repo.tree_of(base)?)? {
            let (l, r) = match (lhs_files.get(&path), rhs_files.get(&path)) {
                (Some(l), Some(r)) => (l.oid, r.oid),
                // A file is missing in one branch
                _ => return Ok(false),
            };
            if l != entry.oid && r != entry.oid {
                // Both changed the file
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Verify every signed record and certificate in the commit's tree.
    fn check_signatures(&self, name: &Refname, commit: git2::Oid) -> crate::Result<bool> {
        // No need to check signatures for code branches
        if is_code_branch(name) {
            return Ok(true);
        }

        let tree_oid = match self.repo.tree_of(commit) {
            Ok(tree) => tree,
            Err(e) => {
                error!("Unreadable commit {}@{} - {}", name, commit, e);
                return Ok(false);
            },
        };
        let mut stack = vec![tree_oid];
        while let Some(tree_oid) = stack.pop() {
            let (_, content) = self.repo.read_obj(tree_oid)?;
            let entries = match tree::parse(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    error!("Malformed tree in {}@{} - {}", name, commit, e);
                    return Ok(false);
                },
            };
            for (file, entry) in entries {
                if !entry.is_blob() {
                    stack.push(entry.oid);
                    continue;
                }
                let is_tlv = file.ends_with(b".tlv");
                let is_cert = file.ends_with(b".cert");
                if !is_tlv && !is_cert {
                    continue;
                }
                let (_, wire) = self.repo.read_obj(entry.oid)?;
                let file = String::from_utf8_lossy(&file).into_owned();

                // Verify the signature without considering the signer's
                // privileges
                let verified = if is_tlv {
                    match proto::parse(&wire) {
                        Ok((_, ptrs)) => self.accounts.verify(&ptrs),
                        Err(e) => {
                            error!("Malformed file {}@{} - {}", name, file, e);
                            return Ok(false);
                        },
                    }
                } else {
                    match crate::ndn::Data::parse(&wire) {
                        Ok(data) => self.accounts.verify(&data.sig_ptrs),
                        Err(e) => {
                            error!("Malformed file {}@{} - {}", name, file, e);
                            return Ok(false);
                        },
                    }
                };
                if !verified {
                    error!("Unable to verify the signature {}@{}", name, file);
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// `account.tlv` must be an account record owned by the branch user.
    fn check_user_branch(&self, name: &Refname, commit: git2::Oid) -> crate::Result<bool> {
        let account = self
            .repo
            .tree_of(commit)
            .and_then(|tree| self.repo.read_obj(tree))
            .ok()
            .and_then(|(_, content)| tree::parse(&content).ok())
            .and_then(|entries| entries.get(b"account.tlv".as_slice()).map(|e| e.oid));
        let account = match account {
            Some(oid) => oid,
            None => {
                error!("File {}@account.tlv does not exist", name);
                return Ok(false);
            },
        };

        let (_, wire) = self.repo.read_obj(account)?;
        let config = match proto::parse(&wire) {
            Ok((proto::Record::AccountConfig(config), _)) => config,
            Ok(_) => {
                error!("File {}@account.tlv is not of type AccountConfig", name);
                return Ok(false);
            },
            Err(e) => {
                error!("Malformed file {}@account.tlv - {}", name, e);
                return Ok(false);
            },
        };

        let expected_user = name.last_segment().as_bytes();
        if config.user_id.as_deref() != Some(expected_user) {
            error!(
                "File {}@account.tlv does not belong to user {}",
                name,
                name.last_segment()
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Reserved: comments and votes are append-only by construction, a
    /// stricter policy is future work.
    fn check_change_meta_branch(&self, _name: &Refname, _commit: git2::Oid) -> bool {
        true
    }

    /// Announce the current ref heads through the sync transport.
    pub fn send_sync_update(&self, respond_to: Option<Digest32>) -> crate::Result<()> {
        let transport = match &*self.transport.borrow() {
            Some(transport) => Rc::clone(transport),
            None => return Ok(()),
        };
        let update = SyncUpdate {
            ref_info: self
                .repo
                .ref_heads()?
                .into_iter()
                .map(|(name, head)| RefInfo {
                    ref_name: String::from(name).into_bytes(),
                    ref_head: head,
                })
                .collect(),
        };
        transport.publish_update(update.encode(), respond_to);
        Ok(())
    }

    /// Path → blob map of the full tree of a commit.
    fn flatten_tree(&self, root: git2::Oid) -> crate::Result<tree::Entries> {
        let mut files = tree::Entries::new();
        let mut stack = vec![(Vec::new(), root)];
        while let Some((path, tree_oid)) = stack.pop() {
            let (_, content) = self.repo.read_obj(tree_oid)?;
            for (name, entry) in tree::parse(&content).map_err(crate::Error::from)? {
                let mut child = path.clone();
                if !child.is_empty() {
                    child.push(b'/');
                }
                child.extend_from_slice(&name);
                if entry.is_blob() {
                    files.insert(child, entry);
                } else {
                    stack.push((child, entry.oid));
                }
            }
        }
        Ok(files)
    }
}

/// `refs/changes/<pp>/<id>/<patch-set>`, except the `meta` leaf.
pub fn is_immutable_branch(name: &str) -> bool {
    name.starts_with("refs/changes/") && !name.ends_with("/meta")
}

pub fn is_code_branch(name: &str) -> bool {
    is_immutable_branch(name) || name.starts_with("refs/heads/")
}

pub fn is_change_meta_branch(name: &str) -> bool {
    name.starts_with("refs/changes/") && name.ends_with("/meta")
}

/// Appending files is the only mutation on these, which is what the
/// merger supports.
pub fn is_mergeable_branch(name: &str) -> bool {
    name.starts_with("refs/users/") || is_change_meta_branch(name)
}
