// Copyright © 2022 Kim Altintop <kim@eagain.io>
// SPDX-License-Identifier: GPL-2.0-only WITH openvpn-openssl-exception

//! The canonical git tree encoding: concatenated entries
//! `mode SP name NUL sha20`, ordered by the uppercased entry name.
//!
//! Operating on the raw encoding (rather than through libgit2 tree
//! objects) keeps the fetcher and the merger honest about what actually
//! hits the object store.

use std::collections::BTreeMap;

pub const HASH_LENGTH: usize = 20;

pub const MODE_BLOB: &[u8] = b"100644";
pub const MODE_TREE: &[u8] = b"40000";

pub mod error {
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub enum Tree {
        #[error("truncated tree entry at offset {0}")]
        Truncated(usize),
        #[error("tree entry name is empty")]
        EmptyName,
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Entry {
    pub mode: Vec<u8>,
    pub oid: git2::Oid,
}

impl Entry {
    pub fn blob(oid: git2::Oid) -> Self {
        Self {
            mode: MODE_BLOB.to_vec(),
            oid,
        }
    }

    pub fn tree(oid: git2::Oid) -> Self {
        Self {
            mode: MODE_TREE.to_vec(),
            oid,
        }
    }

    /// Regular-file modes start with '1' (`100644`, `100755`, `120000`);
    /// everything else names a sub-tree.
    pub fn is_blob(&self) -> bool {
        self.mode.first() == Some(&b'1')
    }
}

pub type Entries = BTreeMap<Vec<u8>, Entry>;

pub fn parse(content: &[u8]) -> Result<Entries, error::Tree> {
    let mut entries = Entries::new();
    let mut pos = 0;
    while pos < content.len() {
        let sp = content[pos..]
            .iter()
            .position(|b| *b == b' ')
            .map(|i| pos + i)
            .ok_or(error::Tree::Truncated(pos))?;
        let nul = content[sp..]
            .iter()
            .position(|b| *b == b'\0')
            .map(|i| sp + i)
            .ok_or(error::Tree::Truncated(sp))?;
        let sha_end = nul + 1 + HASH_LENGTH;
        if sha_end > content.len() {
            return Err(error::Tree::Truncated(nul));
        }

        let mode = content[pos..sp].to_vec();
        let name = content[sp + 1..nul].to_vec();
        if name.is_empty() {
            return Err(error::Tree::EmptyName);
        }
        let oid = git2::Oid::from_bytes(&content[nul + 1..sha_end])
            .expect("20 bytes are a valid git2::Oid");

        entries.insert(name, Entry { mode, oid });
        pos = sha_end;
    }
    Ok(entries)
}

pub fn encode(entries: &Entries) -> Vec<u8> {
    let mut sorted: Vec<_> = entries.iter().collect();
    sorted.sort_by_key(|(name, _)| name.to_ascii_uppercase());

    let mut out = Vec::new();
    for (name, Entry { mode, oid }) in sorted {
        out.extend_from_slice(mode);
        out.push(b' ');
        out.extend_from_slice(name);
        out.push(b'\0');
        out.extend_from_slice(oid.as_bytes());
    }
    out
}
