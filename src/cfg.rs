// Copyright © 2022 Kim Altintop <kim@eagain.io>
// SPDX-License-Identifier: GPL-2.0-only WITH openvpn-openssl-exception

use std::path::PathBuf;

use anyhow::Context;

use crate::ndn::{
    Component,
    Name,
};

pub mod env {
    /// Base directory holding the repositories (under `git/`).
    pub const BASEDIR: &str = "GIT_NDN_BASEDIR";
    /// NDN name prefix this daemon serves under.
    pub const PREFIX: &str = "GIT_NDN_PREFIX";
    /// Directory holding the signing keys.
    pub const KEYSTORE: &str = "GIT_NDN_KEYSTORE";
    /// Name of the signing key.
    pub const KEY: &str = "GIT_NDN_KEY";
    /// Path to the trust anchor certificate.
    pub const TRUST_ANCHOR: &str = "GIT_NDN_TRUST_ANCHOR";
}

#[derive(Clone, Debug)]
pub struct Cfg {
    pub base_dir: PathBuf,
    pub prefix: Name,
    pub keystore: PathBuf,
    pub key: Name,
    pub trust_anchor: PathBuf,
}

impl Cfg {
    pub fn from_env() -> crate::Result<Self> {
        fn var(name: &'static str) -> crate::Result<String> {
            std::env::var(name).with_context(|| format!("{} is not set", name))
        }

        Ok(Self {
            base_dir: var(env::BASEDIR)?.into(),
            prefix: var(env::PREFIX)?
                .parse()
                .with_context(|| format!("{} is not a valid name", env::PREFIX))?,
            keystore: var(env::KEYSTORE)?.into(),
            key: var(env::KEY)?
                .parse()
                .with_context(|| format!("{} is not a valid name", env::KEY))?,
            trust_anchor: var(env::TRUST_ANCHOR)?.into(),
        })
    }

    /// `<prefix>/<op>`, the global request endpoints.
    pub fn endpoint(&self, op: &str) -> Name {
        self.prefix.clone().append(Component::from_bytes(op))
    }

    /// `<prefix>/project/<repo>`, a repository's request surface.
    pub fn project_prefix(&self, repo: &str) -> Name {
        self.prefix
            .clone()
            .append(Component::from_bytes("project"))
            .append(Component::from_bytes(repo))
    }

    pub fn objects_prefix(&self, repo: &str) -> Name {
        self.project_prefix(repo)
            .append(Component::from_bytes("objects"))
    }

    pub fn sync_prefix(&self, repo: &str) -> Name {
        self.project_prefix(repo)
            .append(Component::from_bytes("sync"))
    }
}
