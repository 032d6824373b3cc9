// Copyright © 2022 Kim Altintop <kim@eagain.io>
// SPDX-License-Identifier: GPL-2.0-only WITH openvpn-openssl-exception

//! The collection of repositories under the base directory, and the
//! server bootstrap that seeds the two special ones.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    fs,
    path::PathBuf,
    rc::Rc,
};

use anyhow::{
    bail,
    ensure,
    Context,
};
use log::info;

use super::{
    repo::error::ReadFile,
    GitRepo,
    Refname,
};
use crate::{
    keys::{
        EcdsaSigner,
        Signer,
    },
    proto,
};

/// Holds the per-project configuration records.
pub const ALL_PROJECTS: &str = "All-Projects.git";
/// Holds the user branches: accounts and certificates.
pub const ALL_USERS: &str = "All-Users.git";

pub struct GitRepos {
    base: PathBuf,
    repos: RefCell<BTreeMap<String, Rc<GitRepo>>>,
}

impl GitRepos {
    /// Open every repository under `base`, creating the directory and the
    /// two bootstrap repositories if they do not exist yet.
    pub fn open(base: PathBuf) -> crate::Result<Rc<Self>> {
        fs::create_dir_all(&base)
            .with_context(|| format!("unable to create {}", base.display()))?;

        let mut repos = BTreeMap::new();
        for entry in fs::read_dir(&base)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            let repo = GitRepo::open(&base, &name)
                .with_context(|| format!("unable to open repo {}", name))?;
            repos.insert(name, Rc::new(repo));
        }
        for name in [ALL_PROJECTS, ALL_USERS] {
            if !repos.contains_key(name) {
                repos.insert(name.to_owned(), Rc::new(GitRepo::create(&base, name)?));
                info!("Created bootstrap repo {}", name);
            }
        }

        Ok(Rc::new(Self {
            base,
            repos: RefCell::new(repos),
        }))
    }

    pub fn get(&self, name: &str) -> Option<Rc<GitRepo>> {
        self.repos.borrow().get(name).cloned()
    }

    pub fn all(&self) -> Vec<(String, Rc<GitRepo>)> {
        self.repos
            .borrow()
            .iter()
            .map(|(name, repo)| (name.clone(), Rc::clone(repo)))
            .collect()
    }

    pub fn create_repo(&self, name: &str) -> crate::Result<Rc<GitRepo>> {
        ensure!(valid_repo_name(name), "invalid repo name {:?}", name);
        if self.repos.borrow().contains_key(name) {
            bail!("repo {} already exists", name);
        }
        let repo = Rc::new(GitRepo::create(&self.base, name)?);
        self.repos
            .borrow_mut()
            .insert(name.to_owned(), Rc::clone(&repo));
        Ok(repo)
    }

    pub fn read_file(
        &self,
        repo_name: &str,
        refname: &Refname,
        path: &str,
    ) -> Result<Vec<u8>, ReadFile> {
        let repo = self
            .get(repo_name)
            .ok_or_else(|| ReadFile::Repo(repo_name.to_owned()))?;
        repo.read_file(refname, path)
    }

    /// Seed `All-Projects.git` with the root project configuration and
    /// `All-Users.git` with the admin account taken from the trust
    /// anchor. Refuses to touch repositories that already have refs.
    pub fn init_server(
        &self,
        signer: &EcdsaSigner,
        admin_user: &str,
        admin_key_id: &str,
        admin_cert: &[u8],
    ) -> crate::Result<bool> {
        let all_projects = self.get(ALL_PROJECTS).expect("bootstrap repo is opened");
        let all_users = self.get(ALL_USERS).expect("bootstrap repo is opened");
        if all_projects.has_refs()? || all_users.has_refs()? {
            return Ok(false);
        }

        let config = proto::Record::ProjectConfig(proto::ProjectConfig {
            project_id: Some(ALL_PROJECTS.trim_end_matches(".git").into()),
            description: Some(b"access rights inherited by all other projects".to_vec()),
            sync_interval: Some(10),
            ..Default::default()
        });
        let config = proto::encode(&config, Some(signer))?;
        commit_files(
            &all_projects,
            &"refs/meta/config".parse()?,
            "Initial project configuration",
            &[("project.tlv", &config)],
        )?;

        let account = proto::Record::AccountConfig(proto::AccountConfig {
            user_id: Some(admin_user.into()),
            full_name: Some(admin_user.into()),
            email: None,
        });
        let account = proto::encode(&account, Some(signer))?;
        let cert_path = format!("KEY/{}.cert", admin_key_id);
        commit_files(
            &all_users,
            &user_branch(admin_user)?,
            "Admin account",
            &[("account.tlv", &account), (&cert_path, admin_cert)],
        )?;

        info!("Server initialized, admin is {}", admin_user);
        Ok(true)
    }

    /// Create a user branch carrying the account record and the supplied
    /// certificate.
    pub fn add_account(
        &self,
        signer: &dyn Signer,
        user_id: &str,
        key_id: &str,
        cert: &[u8],
        full_name: &[u8],
        email: &[u8],
    ) -> crate::Result<bool> {
        let all_users = self.get(ALL_USERS).expect("bootstrap repo is opened");
        let branch = user_branch(user_id)?;
        if all_users.get_head(&branch)?.is_some() {
            info!("User {} already exists", user_id);
            return Ok(false);
        }

        let account = proto::Record::AccountConfig(proto::AccountConfig {
            user_id: Some(user_id.into()),
            full_name: Some(full_name.to_vec()),
            email: Some(email.to_vec()),
        });
        let account = proto::encode(&account, Some(signer))?;
        let cert_path = format!("KEY/{}.cert", key_id);
        commit_files(
            &all_users,
            &branch,
            &format!("Add user {}", user_id),
            &[("account.tlv", &account), (&cert_path, cert)],
        )?;

        info!("Added user {}", user_id);
        Ok(true)
    }
}

/// `refs/users/<first two chars>/<user>`, the sharded user branch name.
pub fn user_branch(user_id: &str) -> crate::Result<Refname> {
    ensure!(!user_id.is_empty(), "empty user id");
    let shard = &user_id[..user_id.len().min(2)];
    Ok(format!("refs/users/{}/{}", shard, user_id).parse()?)
}

fn valid_repo_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Write `files` as the tree of a new commit on `refname`, with the
/// current head (if any) as sole parent. Paths may have one directory
/// level, which is all the record layout uses.
fn commit_files(
    repo: &GitRepo,
    refname: &Refname,
    message: &str,
    files: &[(&str, &[u8])],
) -> crate::Result<git2::Oid> {
    let raw = repo.raw();

    let mut toplevel: BTreeMap<&str, Vec<(&str, git2::Oid)>> = BTreeMap::new();
    let mut blobs: Vec<(&str, git2::Oid)> = Vec::new();
    for &(path, content) in files {
        let blob = raw.blob(content)?;
        match path.split_once('/') {
            None => blobs.push((path, blob)),
            Some((dir, file)) => toplevel.entry(dir).or_default().push((file, blob)),
        }
    }

    let mut root = raw.treebuilder(None)?;
    for (name, blob) in blobs {
        root.insert(name, blob, git2::FileMode::Blob.into())?;
    }
    for (dir, entries) in toplevel {
        let mut sub = raw.treebuilder(None)?;
        for (name, blob) in entries {
            sub.insert(name, blob, git2::FileMode::Blob.into())?;
        }
        root.insert(dir, sub.write()?, git2::FileMode::Tree.into())?;
    }
    let tree = raw.find_tree(root.write()?)?;

    let sig = raw
        .signature()
        .or_else(|_| git2::Signature::now("gitsync", "gitsync@localhost"))?;
    let parent = repo.get_head(refname)?;
    let parents = parent
        .map(|oid| raw.find_commit(oid))
        .transpose()?;
    let parents: Vec<&git2::Commit> = parents.iter().collect();

    Ok(raw.commit(Some(refname.as_ref()), &sig, &sig, message, &tree, &parents)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ndn::Name;

    #[test]
    fn bootstrap_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let repos = GitRepos::open(dir.path().to_owned()).unwrap();
        let signer = EcdsaSigner::generate(
            "/t/users/admin/KEY/%01".parse::<Name>().unwrap(),
        );
        let cert = b"opaque cert bytes";

        assert!(repos.init_server(&signer, "admin", "01", cert).unwrap());
        // a second init must refuse
        assert!(!repos.init_server(&signer, "admin", "01", cert).unwrap());

        let all_users = repos.get(ALL_USERS).unwrap();
        let branch = user_branch("admin").unwrap();
        assert_eq!(&*branch, "refs/users/ad/admin");
        assert_eq!(all_users.read_file(&branch, "KEY/01.cert").unwrap(), cert);

        let account = all_users.read_file(&branch, "account.tlv").unwrap();
        let (record, ptrs) = proto::parse(&account).unwrap();
        assert!(matches!(
            record,
            proto::Record::AccountConfig(proto::AccountConfig { ref user_id, .. })
                if user_id.as_deref() == Some(b"admin".as_slice())
        ));
        assert!(ptrs.signature_value.is_some());
    }

    #[test]
    fn add_account_refuses_existing_user() {
        let dir = tempfile::tempdir().unwrap();
        let repos = GitRepos::open(dir.path().to_owned()).unwrap();
        let signer =
            EcdsaSigner::generate("/t/users/admin/KEY/%01".parse::<Name>().unwrap());

        assert!(repos
            .add_account(&signer, "alice", "0a", b"cert", b"Alice", b"a@example.com")
            .unwrap());
        assert!(!repos
            .add_account(&signer, "alice", "0a", b"cert", b"Alice", b"a@example.com")
            .unwrap());
    }

    #[test]
    fn repo_names_are_validated() {
        assert!(valid_repo_name("project.git"));
        assert!(!valid_repo_name(".hidden"));
        assert!(!valid_repo_name("a/b"));
        assert!(!valid_repo_name(""));
    }
}
