// Copyright © 2022 Kim Altintop <kim@eagain.io>
// SPDX-License-Identifier: GPL-2.0-only WITH openvpn-openssl-exception

//! Resolving signers to verification keys, and verifying signatures.
//!
//! Certificates live as `.cert` blobs on user branches in
//! `All-Users.git`; the trust anchor is loaded from disk at startup and
//! breaks the bootstrap cycle (the first admin certificate cannot be
//! verified out of the repository it vouches for).

use std::{
    cell::RefCell,
    fs,
    path::Path,
    rc::Rc,
};

use anyhow::{
    anyhow,
    Context,
};
use log::{
    debug,
    info,
    warn,
};
use digest::Digest;
use p256::{
    ecdsa::{
        signature::DigestVerifier,
        Signature,
        VerifyingKey,
    },
    pkcs8::DecodePublicKey,
};
use sha2::Sha256;

use crate::{
    git::{
        repo::error::ReadFile,
        repos::{
            user_branch,
            ALL_USERS,
        },
        GitRepos,
    },
    ndn::{
        data::SigPtrs,
        Data,
        Name,
    },
};

/// `(user_id, key_id)` taken from a certificate name:
/// `…/<user>/KEY/<key-id>/<issuer>/<version>`.
pub fn cert_name_ids(name: &Name) -> Option<(String, String)> {
    let user = String::from_utf8(name.from_end(5)?.value().to_vec()).ok()?;
    let key = hex::encode(name.from_end(3)?.value());
    Some((user, key))
}

/// `(user_id, key_id)` taken from a key locator name:
/// `…/<user>/KEY/<key-id>`.
pub fn locator_ids(name: &Name) -> Option<(String, String)> {
    let user = String::from_utf8(name.from_end(3)?.value().to_vec()).ok()?;
    let key = hex::encode(name.from_end(1)?.value());
    Some((user, key))
}

pub struct TrustAnchor {
    pub user_id: String,
    pub key_id: String,
    pub wire: Vec<u8>,
    verifier: VerifyingKey,
}

pub struct Accounts {
    repos: Rc<GitRepos>,
    anchor: RefCell<Option<TrustAnchor>>,
}

impl Accounts {
    pub fn new(repos: Rc<GitRepos>) -> Rc<Self> {
        Rc::new(Self {
            repos,
            anchor: RefCell::new(None),
        })
    }

    pub fn read_trust_anchor(&self, path: &Path) -> crate::Result<()> {
        let wire = fs::read(path)
            .with_context(|| format!("unable to read trust anchor {}", path.display()))?;
        let data = Data::parse(&wire).context("malformed trust anchor certificate")?;
        let (user_id, key_id) = cert_name_ids(&data.name)
            .ok_or_else(|| anyhow!("{} is not a certificate name", data.name))?;
        let key_bits = data
            .content
            .ok_or_else(|| anyhow!("trust anchor certificate has no content"))?;
        let verifier = VerifyingKey::from_public_key_der(key_bits)
            .map_err(|e| anyhow!("trust anchor key is not an EC P-256 key: {}", e))?;

        info!("Trust anchor loaded: {}", data.name);
        *self.anchor.borrow_mut() = Some(TrustAnchor {
            user_id,
            key_id,
            wire,
            verifier,
        });
        Ok(())
    }

    /// `(user_id, key_id, certificate wire)` of the trust anchor, for the
    /// server bootstrap.
    pub fn trust_anchor_identity(&self) -> Option<(String, String, Vec<u8>)> {
        self.anchor
            .borrow()
            .as_ref()
            .map(|a| (a.user_id.clone(), a.key_id.clone(), a.wire.clone()))
    }

    /// Verify a signature against the current state of `All-Users.git`.
    ///
    /// Every failure mode maps to `false`: the caller only ever declines
    /// the update, the distinction is for the logs.
    pub fn verify(&self, ptrs: &SigPtrs) -> bool {
        let locator = match ptrs
            .signature_info
            .as_ref()
            .and_then(|info| info.key_locator.as_ref())
        {
            Some(locator) => locator,
            None => {
                info!("No signature");
                return false;
            },
        };
        let (user_id, key_id) = match locator_ids(locator) {
            Some(ids) => ids,
            None => {
                warn!("Key locator {} is not a key name", locator);
                return false;
            },
        };

        let verifier = {
            let anchor = self.anchor.borrow();
            match anchor.as_ref() {
                Some(a) if (a.user_id.as_str(), a.key_id.as_str())
                    == (user_id.as_str(), key_id.as_str()) =>
                {
                    a.verifier
                },
                _ => match self.resolve_certificate(&user_id, &key_id) {
                    Some(verifier) => verifier,
                    None => return false,
                },
            }
        };

        let signature = match ptrs.signature_value.map(Signature::from_der) {
            Some(Ok(signature)) => signature,
            _ => {
                info!("Signature of {}/KEY/{} is not DER ECDSA", user_id, key_id);
                return false;
            },
        };
        let mut digest = Sha256::new();
        for part in &ptrs.covered {
            digest.update(part);
        }
        match verifier.verify_digest(digest, &signature) {
            Ok(()) => {
                debug!("Verification passed");
                true
            },
            Err(_) => {
                info!(
                    "Unable to verify the signature: signed by {}/KEY/{}",
                    user_id, key_id
                );
                false
            },
        }
    }

    fn resolve_certificate(&self, user_id: &str, key_id: &str) -> Option<VerifyingKey> {
        let branch = match user_branch(user_id) {
            Ok(branch) => branch,
            Err(e) => {
                warn!("Unresolvable signer {}: {}", user_id, e);
                return None;
            },
        };
        let path = format!("KEY/{}.cert", key_id);
        let wire = match self.repos.read_file(ALL_USERS, &branch, &path) {
            Ok(wire) => wire,
            Err(ReadFile::Repo(repo)) => {
                warn!("Repo {} does not exist", repo);
                return None;
            },
            Err(ReadFile::Ref(_)) => {
                warn!("User {} does not exist", user_id);
                return None;
            },
            Err(ReadFile::File(_)) => {
                warn!("Certificate {}/KEY/{}.cert does not exist", user_id, key_id);
                return None;
            },
            Err(ReadFile::Git(e)) => {
                warn!("Unable to read certificate of {}: {}", user_id, e);
                return None;
            },
        };

        let malformed = || {
            warn!("Certificate {}/KEY/{}.cert is malformed", user_id, key_id);
            None
        };
        let data = match Data::parse(&wire) {
            Ok(data) => data,
            Err(_) => return malformed(),
        };
        match data.content.map(VerifyingKey::from_public_key_der) {
            Some(Ok(verifier)) => Some(verifier),
            _ => malformed(),
        }
    }
}
