// Copyright © 2022 Kim Altintop <kim@eagain.io>
// SPDX-License-Identifier: GPL-2.0-only WITH openvpn-openssl-exception

//! The per-repository object store adapter: content-addressed objects,
//! the ref table, and the few ancestry queries the policies need.

use std::{
    collections::BTreeMap,
    path::Path,
};

use anyhow::{
    anyhow,
    Context,
};

use super::{
    if_not_found_none,
    Refname,
};

pub mod error {
    use thiserror::Error;

    /// Resolving a file inside the tree of a ref's head.
    ///
    /// The verifier distinguishes unknown user (ref) from unknown key
    /// (file), so this cannot collapse into one "not found".
    #[derive(Debug, Error)]
    pub enum ReadFile {
        #[error("repo {0} not found")]
        Repo(String),
        #[error("ref {0} not found")]
        Ref(String),
        #[error("file {0} not found")]
        File(String),
        #[error(transparent)]
        Git(#[from] git2::Error),
    }
}

pub struct GitRepo {
    name: String,
    repo: git2::Repository,
}

impl GitRepo {
    pub fn open(base: &Path, name: &str) -> super::Result<Self> {
        let repo = git2::Repository::open_bare(base.join(name))?;
        Ok(Self {
            name: name.to_owned(),
            repo,
        })
    }

    pub fn create(base: &Path, name: &str) -> super::Result<Self> {
        let repo = git2::Repository::init_opts(
            base.join(name),
            git2::RepositoryInitOptions::new()
                .no_reinit(true)
                .mkdir(true)
                .bare(true),
        )?;
        Ok(Self {
            name: name.to_owned(),
            repo,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_obj(&self, oid: git2::Oid) -> super::Result<bool> {
        Ok(self.repo.odb()?.exists(oid))
    }

    /// Idempotent: writing the same bytes yields the same hash.
    pub fn store_obj(&self, kind: git2::ObjectType, data: &[u8]) -> super::Result<git2::Oid> {
        self.repo.odb()?.write(kind, data)
    }

    pub fn read_obj(&self, oid: git2::Oid) -> super::Result<(git2::ObjectType, Vec<u8>)> {
        let odb = self.repo.odb()?;
        let obj = odb.read(oid)?;
        Ok((obj.kind(), obj.data().to_vec()))
    }

    pub fn get_head(&self, name: &Refname) -> super::Result<Option<git2::Oid>> {
        let r = if_not_found_none(self.repo.find_reference(name))?;
        Ok(r.and_then(|r| r.target()))
    }

    pub fn set_head(&self, name: &Refname, head: git2::Oid) -> super::Result<()> {
        self.repo
            .reference(name, head, true, &format!("gitsync: update {}", name))?;
        Ok(())
    }

    pub fn delete_ref(&self, name: &Refname) -> super::Result<()> {
        match if_not_found_none(self.repo.find_reference(name))? {
            Some(mut r) => r.delete(),
            None => Ok(()),
        }
    }

    pub fn ref_heads(&self) -> super::Result<BTreeMap<Refname, git2::Oid>> {
        let mut heads = BTreeMap::new();
        for r in self.repo.references()? {
            let r = r?;
            if let (Some(name), Some(target)) = (r.name(), r.target()) {
                if let Ok(name) = name.parse() {
                    heads.insert(name, target);
                }
            }
        }
        Ok(heads)
    }

    pub fn has_refs(&self) -> super::Result<bool> {
        Ok(self.repo.references()?.names().next().is_some())
    }

    /// Whether `a` is reachable from `b` (inclusive).
    pub fn is_ancestor(&self, a: git2::Oid, b: git2::Oid) -> super::Result<bool> {
        Ok(a == b || self.repo.graph_descendant_of(b, a)?)
    }

    /// The unique merge base of `a` and `b`.
    ///
    /// Fails if there is none, or if there are several independent ones —
    /// the merger requires an unambiguous base.
    pub fn merge_base(&self, a: git2::Oid, b: git2::Oid) -> crate::Result<git2::Oid> {
        let bases = self
            .repo
            .merge_bases(a, b)
            .with_context(|| format!("no common base for {} and {}", a, b))?;
        match bases[..] {
            [base] => Ok(base),
            [] => Err(anyhow!("no common base for {} and {}", a, b)),
            _ => Err(anyhow!(
                "{} independent merge bases for {} and {}",
                bases.len(),
                a,
                b
            )),
        }
    }

    /// Commits after `ancestor` (exclusive) up to `head` (inclusive),
    /// oldest first.
    pub fn commits_between(
        &self,
        ancestor: Option<git2::Oid>,
        head: git2::Oid,
    ) -> super::Result<Vec<git2::Oid>> {
        let mut walk = self.repo.revwalk()?;
        walk.set_sorting(git2::Sort::TOPOLOGICAL | git2::Sort::REVERSE)?;
        walk.push(head)?;
        if let Some(ancestor) = ancestor {
            walk.hide(ancestor)?;
        }
        walk.collect()
    }

    /// The tree of a commit.
    pub fn tree_of(&self, commit: git2::Oid) -> super::Result<git2::Oid> {
        let (_, data) = self.read_obj(commit)?;
        super::commit::links(&data)
            .ok()
            .and_then(|l| l.tree)
            .ok_or_else(|| git2::Error::from_str("object is not a commit"))
    }

    /// Write the commit object joining two branches of a mergeable ref.
    ///
    /// The committer is fixed so that the object is a function of
    /// `(tree, lhs, rhs)` alone and peers converge on equal bytes.
    pub fn create_merge_commit(
        &self,
        tree: git2::Oid,
        lhs: git2::Oid,
        rhs: git2::Oid,
    ) -> super::Result<git2::Oid> {
        let sig = git2::Signature::new("gitsync", "gitsync@localhost", &git2::Time::new(0, 0))?;
        let tree = self.repo.find_tree(tree)?;
        let lhs = self.repo.find_commit(lhs)?;
        let rhs = self.repo.find_commit(rhs)?;
        self.repo
            .commit(None, &sig, &sig, "Automatic merge\n", &tree, &[&lhs, &rhs])
    }

    pub fn read_file(&self, name: &Refname, path: &str) -> Result<Vec<u8>, error::ReadFile> {
        let head = self
            .get_head(name)?
            .ok_or_else(|| error::ReadFile::Ref(name.to_string()))?;
        let commit = self.repo.find_commit(head)?;
        let entry = commit
            .tree()?
            .get_path(Path::new(path))
            .map_err(|e| match e.code() {
                git2::ErrorCode::NotFound => error::ReadFile::File(path.to_owned()),
                _ => error::ReadFile::Git(e),
            })?;
        let blob = self
            .repo
            .find_blob(entry.id())
            .map_err(error::ReadFile::Git)?;
        Ok(blob.content().to_vec())
    }

    pub(super) fn raw(&self) -> &git2::Repository {
        &self.repo
    }
}

#[cfg(test)]
mod tests {
    use super::{
        super::tree,
        *,
    };

    fn scratch() -> (tempfile::TempDir, GitRepo) {
        let dir = tempfile::tempdir().unwrap();
        let repo = GitRepo::create(dir.path(), "t.git").unwrap();
        (dir, repo)
    }

    #[test]
    fn store_is_idempotent() {
        let (_dir, repo) = scratch();
        let a = repo.store_obj(git2::ObjectType::Blob, b"hello").unwrap();
        let b = repo.store_obj(git2::ObjectType::Blob, b"hello").unwrap();
        assert_eq!(a, b);
        assert!(repo.has_obj(a).unwrap());
    }

    #[test]
    fn raw_tree_equals_libgit2_tree() {
        let (_dir, repo) = scratch();
        let blob = repo.store_obj(git2::ObjectType::Blob, b"content").unwrap();

        let mut entries = tree::Entries::new();
        entries.insert(b"file.tlv".to_vec(), tree::Entry::blob(blob));
        let raw = repo
            .store_obj(git2::ObjectType::Tree, &tree::encode(&entries))
            .unwrap();

        let mut builder = repo.raw().treebuilder(None).unwrap();
        builder
            .insert("file.tlv", blob, git2::FileMode::Blob.into())
            .unwrap();
        assert_eq!(builder.write().unwrap(), raw);
    }

    #[test]
    fn commits_between_is_oldest_first() {
        let (_dir, repo) = scratch();
        let sig = git2::Signature::now("t", "t@example.com").unwrap();
        let tree = {
            let b = repo.raw().treebuilder(None).unwrap();
            repo.raw().find_tree(b.write().unwrap()).unwrap()
        };
        let c1 = repo
            .raw()
            .commit(None, &sig, &sig, "one", &tree, &[])
            .unwrap();
        let c2 = {
            let parent = repo.raw().find_commit(c1).unwrap();
            repo.raw()
                .commit(None, &sig, &sig, "two", &tree, &[&parent])
                .unwrap()
        };

        assert_eq!(repo.commits_between(None, c2).unwrap(), vec![c1, c2]);
        assert_eq!(repo.commits_between(Some(c1), c2).unwrap(), vec![c2]);
        assert!(repo.commits_between(Some(c2), c2).unwrap().is_empty());
        assert!(repo.is_ancestor(c1, c2).unwrap());
        assert!(!repo.is_ancestor(c2, c1).unwrap());
    }
}
