// Copyright © 2022 Kim Altintop <kim@eagain.io>
// SPDX-License-Identifier: GPL-2.0-only WITH openvpn-openssl-exception

//! Three-way tree merge for append-only branches.
//!
//! The merge cannot represent deletions: entries present on either side
//! survive. That is exactly the contract of the mergeable ref classes
//! (user branches and change metadata), where appending files is the
//! only legal mutation.

use std::rc::Rc;

use crate::git::{
    tree,
    GitRepo,
};

pub mod error {
    use thiserror::Error;

    use crate::git::tree;

    #[derive(Debug, Error)]
    pub enum Merge {
        #[error("merge conflict")]
        Conflict,
        #[error(transparent)]
        Git(#[from] git2::Error),
        #[error(transparent)]
        Tree(#[from] tree::error::Tree),
    }
}

pub struct Merger {
    repo: Rc<GitRepo>,
}

impl Merger {
    pub fn new(repo: Rc<GitRepo>) -> Self {
        Self { repo }
    }

    /// Compute the merged object of `ori` and `new` over the optional
    /// common `base`, writing any newly created trees to the store.
    pub fn merge_step(
        &self,
        base: Option<git2::Oid>,
        ori: git2::Oid,
        new: git2::Oid,
    ) -> Result<git2::Oid, error::Merge> {
        // If only one side changed it, pick that one
        if ori == new {
            return Ok(ori);
        }
        if let Some(base) = base {
            if ori == base {
                return Ok(new);
            }
            if new == base {
                return Ok(ori);
            }
        }

        // Both sides changed: this must be a tree, file merges are not
        // supported
        let (ori_kind, ori_tree) = self.repo.read_obj(ori)?;
        let (new_kind, new_tree) = self.repo.read_obj(new)?;
        if ori_kind != git2::ObjectType::Tree || new_kind != git2::ObjectType::Tree {
            return Err(error::Merge::Conflict);
        }
        let base_entries = match base {
            Some(base) => {
                let (_, content) = self.repo.read_obj(base)?;
                tree::parse(&content)?
            },
            None => tree::Entries::new(),
        };
        let ori_entries = tree::parse(&ori_tree)?;
        let new_entries = tree::parse(&new_tree)?;

        let mut merged = tree::Entries::new();
        for (name, ori_entry) in &ori_entries {
            let new_entry = match new_entries.get(name) {
                Some(entry) => entry,
                None => continue,
            };
            if ori_entry.mode != new_entry.mode {
                return Err(error::Merge::Conflict);
            }
            let base_oid = base_entries.get(name).map(|e| e.oid);
            let oid = self.merge_step(base_oid, ori_entry.oid, new_entry.oid)?;
            merged.insert(
                name.clone(),
                tree::Entry {
                    mode: ori_entry.mode.clone(),
                    oid,
                },
            );
        }
        // One-sided entries are taken as-is; deletion is not modeled
        for (name, entry) in ori_entries.iter().chain(new_entries.iter()) {
            if !merged.contains_key(name) {
                merged.insert(name.clone(), entry.clone());
            }
        }

        let content = tree::encode(&merged);
        Ok(self.repo.store_obj(git2::ObjectType::Tree, &content)?)
    }

    /// Merge the trees of `lhs` and `rhs` over `base` and write the
    /// joining commit.
    pub fn create_commit(
        &self,
        base: git2::Oid,
        lhs: git2::Oid,
        rhs: git2::Oid,
    ) -> Result<git2::Oid, error::Merge> {
        let base_tree = self.repo.tree_of(base)?;
        let lhs_tree = self.repo.tree_of(lhs)?;
        let rhs_tree = self.repo.tree_of(rhs)?;
        let merged = self.merge_step(Some(base_tree), lhs_tree, rhs_tree)?;
        Ok(self.repo.create_merge_commit(merged, lhs, rhs)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scratch {
        _dir: tempfile::TempDir,
        repo: Rc<GitRepo>,
    }

    fn scratch() -> Scratch {
        let dir = tempfile::tempdir().unwrap();
        let repo = Rc::new(GitRepo::create(dir.path(), "t.git").unwrap());
        Scratch { _dir: dir, repo }
    }

    fn blob(repo: &GitRepo, content: &[u8]) -> git2::Oid {
        repo.store_obj(git2::ObjectType::Blob, content).unwrap()
    }

    fn write_tree(repo: &GitRepo, files: &[(&[u8], git2::Oid)]) -> git2::Oid {
        let mut entries = tree::Entries::new();
        for &(name, oid) in files {
            entries.insert(name.to_vec(), tree::Entry::blob(oid));
        }
        repo.store_obj(git2::ObjectType::Tree, &tree::encode(&entries))
            .unwrap()
    }

    #[test]
    fn merge_identities() {
        let s = scratch();
        let a = blob(&s.repo, b"a");
        let b = blob(&s.repo, b"b");
        let base = write_tree(&s.repo, &[(b"f", a)]);
        let x = write_tree(&s.repo, &[(b"f", a), (b"x", b)]);
        let y = write_tree(&s.repo, &[(b"f", a), (b"y", b)]);

        let merger = Merger::new(Rc::clone(&s.repo));
        assert_eq!(merger.merge_step(Some(base), x, x).unwrap(), x);
        assert_eq!(merger.merge_step(Some(base), base, y).unwrap(), y);
        assert_eq!(merger.merge_step(Some(base), x, base).unwrap(), x);
    }

    #[test]
    fn merge_is_symmetric_union() {
        let s = scratch();
        let a = blob(&s.repo, b"a");
        let k2 = blob(&s.repo, b"key two");
        let k3 = blob(&s.repo, b"key three");
        let base = write_tree(&s.repo, &[(b"account.tlv", a)]);
        let x = write_tree(&s.repo, &[(b"account.tlv", a), (b"k2.cert", k2)]);
        let y = write_tree(&s.repo, &[(b"account.tlv", a), (b"k3.cert", k3)]);

        let merger = Merger::new(Rc::clone(&s.repo));
        let xy = merger.merge_step(Some(base), x, y).unwrap();
        let yx = merger.merge_step(Some(base), y, x).unwrap();
        assert_eq!(xy, yx);

        let (_, content) = s.repo.read_obj(xy).unwrap();
        let entries = tree::parse(&content).unwrap();
        assert_eq!(
            entries.keys().cloned().collect::<Vec<_>>(),
            vec![
                b"account.tlv".to_vec(),
                b"k2.cert".to_vec(),
                b"k3.cert".to_vec()
            ]
        );
    }

    #[test]
    fn both_sides_changed_blob_conflicts() {
        let s = scratch();
        let a = blob(&s.repo, b"a");
        let b = blob(&s.repo, b"b");
        let c = blob(&s.repo, b"c");
        let base = write_tree(&s.repo, &[(b"f", a)]);
        let x = write_tree(&s.repo, &[(b"f", b)]);
        let y = write_tree(&s.repo, &[(b"f", c)]);

        let merger = Merger::new(Rc::clone(&s.repo));
        assert!(matches!(
            merger.merge_step(Some(base), x, y),
            Err(error::Merge::Conflict)
        ));
    }

    #[test]
    fn nested_trees_merge_recursively() {
        let s = scratch();
        let a = blob(&s.repo, b"account");
        let k1 = blob(&s.repo, b"k1");
        let k2 = blob(&s.repo, b"k2");
        let k3 = blob(&s.repo, b"k3");

        let key_base = write_tree(&s.repo, &[(b"k1.cert", k1)]);
        let key_x = write_tree(&s.repo, &[(b"k1.cert", k1), (b"k2.cert", k2)]);
        let key_y = write_tree(&s.repo, &[(b"k1.cert", k1), (b"k3.cert", k3)]);

        let subtree = |keys| {
            let mut entries = tree::Entries::new();
            entries.insert(b"account.tlv".to_vec(), tree::Entry::blob(a));
            entries.insert(b"KEY".to_vec(), tree::Entry::tree(keys));
            s.repo
                .store_obj(git2::ObjectType::Tree, &tree::encode(&entries))
                .unwrap()
        };
        let base = subtree(key_base);
        let x = subtree(key_x);
        let y = subtree(key_y);

        let merger = Merger::new(Rc::clone(&s.repo));
        let merged = merger.merge_step(Some(base), x, y).unwrap();

        let (_, content) = s.repo.read_obj(merged).unwrap();
        let entries = tree::parse(&content).unwrap();
        let (_, keys) = s.repo.read_obj(entries[b"KEY".as_slice()].oid).unwrap();
        let keys = tree::parse(&keys).unwrap();
        assert_eq!(keys.len(), 3);
    }
}
