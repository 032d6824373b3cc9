// Copyright © 2022 Kim Altintop <kim@eagain.io>
// SPDX-License-Identifier: GPL-2.0-only WITH openvpn-openssl-exception

use std::{
    fs,
    path::Path,
};

use anyhow::{
    anyhow,
    ensure,
    Context,
};
use p256::{
    ecdsa::{
        signature::Signer as _,
        Signature,
        SigningKey,
    },
    pkcs8::{
        DecodePrivateKey,
        EncodePublicKey,
    },
};

use crate::ndn::Name;

/// Something that can sign application records and certificates.
///
/// The locator is the NDN key name (`…/<user>/KEY/<key-id>`) receivers
/// resolve the verification key from; signatures are DER-encoded
/// ECDSA-P256 over SHA-256 of the message.
pub trait Signer {
    fn key_locator(&self) -> &Name;
    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, signature::Error>;
}

impl<T> Signer for Box<T>
where
    T: Signer + ?Sized,
{
    fn key_locator(&self) -> &Name {
        (**self).key_locator()
    }

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, signature::Error> {
        (**self).sign(msg)
    }
}

pub struct EcdsaSigner {
    key: SigningKey,
    locator: Name,
}

impl EcdsaSigner {
    /// Load the key named by `key_name` from the keystore directory.
    ///
    /// Keys are stored as PKCS#8 PEM files named after the hex of the
    /// key-id component.
    pub fn load(keystore: &Path, key_name: &Name) -> crate::Result<Self> {
        ensure!(
            key_name
                .from_end(2)
                .map(|c| c.value() == b"KEY")
                .unwrap_or(false),
            "{} is not a key name",
            key_name
        );
        let key_id = key_name
            .from_end(1)
            .ok_or_else(|| anyhow!("empty key name"))?;
        let path = keystore.join(format!("{}.key", hex::encode(key_id.value())));
        let pem = fs::read_to_string(&path)
            .with_context(|| format!("unable to read signing key {}", path.display()))?;
        let key = SigningKey::from_pkcs8_pem(&pem)
            .map_err(|e| anyhow!("invalid signing key {}: {}", path.display(), e))?;

        Ok(Self {
            key,
            locator: key_name.clone(),
        })
    }

    pub fn generate(locator: Name) -> Self {
        Self {
            key: SigningKey::random(&mut rand_core::OsRng),
            locator,
        }
    }

    /// DER-encoded SubjectPublicKeyInfo of the verification key, the form
    /// certificates carry.
    pub fn public_key_der(&self) -> crate::Result<Vec<u8>> {
        Ok(self
            .key
            .verifying_key()
            .to_public_key_der()
            .map_err(|e| anyhow!("public key encoding failed: {}", e))?
            .into_vec())
    }
}

impl Signer for EcdsaSigner {
    fn key_locator(&self) -> &Name {
        &self.locator
    }

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, signature::Error> {
        let sig: Signature = self.key.sign(msg);
        Ok(sig.to_der().as_bytes().to_vec())
    }
}
