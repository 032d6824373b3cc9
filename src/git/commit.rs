// Copyright © 2022 Kim Altintop <kim@eagain.io>
// SPDX-License-Identifier: GPL-2.0-only WITH openvpn-openssl-exception

//! Header scanning over the raw commit encoding.
//!
//! A commit object starts with `tree <hex>` followed by zero or more
//! `parent <hex>` lines; the scan stops at the first line that is
//! neither, which is all the object graph traversal needs.

pub mod error {
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub enum Commit {
        #[error("commit header is not utf8")]
        Encoding,
        #[error("malformed commit header line {0:?}")]
        HeaderLine(String),
    }
}

/// The graph links of a commit: its tree and its parents.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Links {
    pub tree: Option<git2::Oid>,
    pub parents: Vec<git2::Oid>,
}

pub fn links(content: &[u8]) -> Result<Links, error::Commit> {
    let text = core::str::from_utf8(content).map_err(|_| error::Commit::Encoding)?;
    let mut links = Links::default();
    for line in text.split('\n') {
        let (label, hex) = match line.split_once(' ') {
            Some(split @ ("tree" | "parent", _)) => split,
            _ => break,
        };
        let oid = git2::Oid::from_str(hex)
            .map_err(|_| error::Commit::HeaderLine(line.to_owned()))?;
        match label {
            "tree" => links.tree = Some(oid),
            _ => links.parents.push(oid),
        }
    }
    Ok(links)
}
