// Copyright © 2022 Kim Altintop <kim@eagain.io>
// SPDX-License-Identifier: GPL-2.0-only WITH openvpn-openssl-exception

//! The NDN Data packet, as far as certificates need it.
//!
//! Certificates are ordinary Data packets whose content is a DER-encoded
//! public key. They are stored verbatim as `.cert` blobs inside
//! `All-Users.git`, and the trust anchor is one loaded from disk. The
//! signed region of a Data packet runs from the start of the Name through
//! the end of the SignatureInfo.

use std::time::Duration;

use super::{
    name::Name,
    tlv::{
        self,
        DecodeError,
        Reader,
    },
};
use crate::keys::Signer;

pub const TYPE_DATA: u64 = 0x06;
pub const TYPE_METAINFO: u64 = 0x14;
pub const TYPE_CONTENT: u64 = 0x15;
pub const TYPE_SIGNATURE_INFO: u64 = 0x16;
pub const TYPE_SIGNATURE_VALUE: u64 = 0x17;
pub const TYPE_CONTENT_TYPE: u64 = 0x18;
pub const TYPE_FRESHNESS_PERIOD: u64 = 0x19;
pub const TYPE_SIGNATURE_TYPE: u64 = 0x1b;
pub const TYPE_KEY_LOCATOR: u64 = 0x1c;

/// ContentType for certificate payloads.
pub const CONTENT_TYPE_KEY: u64 = 2;
/// SignatureType for ECDSA over SHA-256.
pub const SIGNATURE_SHA256_WITH_ECDSA: u64 = 3;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SignatureInfo {
    pub signature_type: u64,
    pub key_locator: Option<Name>,
}

impl SignatureInfo {
    pub fn ecdsa(key_locator: Name) -> Self {
        Self {
            signature_type: SIGNATURE_SHA256_WITH_ECDSA,
            key_locator: Some(key_locator),
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut value = Vec::new();
        tlv::write_uint(&mut value, TYPE_SIGNATURE_TYPE, self.signature_type);
        if let Some(name) = &self.key_locator {
            let mut locator = Vec::new();
            name.encode(&mut locator);
            tlv::write_tlv(&mut value, TYPE_KEY_LOCATOR, &locator);
        }
        tlv::write_tlv(buf, TYPE_SIGNATURE_INFO, &value);
    }

    pub fn decode_value(value: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(value);
        let mut info = Self::default();
        while !reader.is_empty() {
            let (typ, v) = reader.read_tlv()?;
            match typ {
                TYPE_SIGNATURE_TYPE => info.signature_type = tlv::read_uint(typ, v)?,
                TYPE_KEY_LOCATOR => {
                    let mut inner = Reader::new(v);
                    let (ityp, iv) = inner.read_tlv()?;
                    // KeyDigest locators are not resolvable here
                    if ityp == super::name::TYPE_NAME {
                        info.key_locator = Some(Name::decode_value(iv)?);
                    }
                },
                other if tlv::is_critical(other) => {
                    return Err(DecodeError::UnknownCritical(other))
                },
                _ => {},
            }
        }
        Ok(info)
    }
}

/// Borrowed view of the parts of a packet the verifier consumes: the
/// signature metadata, the covered byte ranges, and the raw signature.
#[derive(Clone, Debug, Default)]
pub struct SigPtrs<'a> {
    pub signature_info: Option<SignatureInfo>,
    pub covered: Vec<&'a [u8]>,
    pub signature_value: Option<&'a [u8]>,
}

/// A parsed Data packet, borrowing content from the wire buffer.
#[derive(Debug)]
pub struct Data<'a> {
    pub name: Name,
    pub content_type: Option<u64>,
    pub freshness: Option<Duration>,
    pub content: Option<&'a [u8]>,
    pub sig_ptrs: SigPtrs<'a>,
}

impl<'a> Data<'a> {
    /// Parse a Data packet including its outer TL.
    pub fn parse(wire: &'a [u8]) -> Result<Self, DecodeError> {
        let mut outer = Reader::new(wire);
        let value = outer.expect(TYPE_DATA)?;
        Self::parse_value(value)
    }

    fn parse_value(value: &'a [u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(value);
        let covered_start = reader.pos();

        let name = Name::decode(&mut reader)?;
        let mut data = Self {
            name,
            content_type: None,
            freshness: None,
            content: None,
            sig_ptrs: SigPtrs::default(),
        };

        while !reader.is_empty() {
            let (typ, v) = reader.read_tlv()?;
            match typ {
                TYPE_METAINFO => {
                    let mut meta = Reader::new(v);
                    while !meta.is_empty() {
                        let (mtyp, mv) = meta.read_tlv()?;
                        match mtyp {
                            TYPE_CONTENT_TYPE => {
                                data.content_type = Some(tlv::read_uint(mtyp, mv)?)
                            },
                            TYPE_FRESHNESS_PERIOD => {
                                data.freshness =
                                    Some(Duration::from_millis(tlv::read_uint(mtyp, mv)?))
                            },
                            _ => {},
                        }
                    }
                },
                TYPE_CONTENT => data.content = Some(v),
                TYPE_SIGNATURE_INFO => {
                    data.sig_ptrs.signature_info = Some(SignatureInfo::decode_value(v)?);
                    data.sig_ptrs.covered = vec![&value[covered_start..reader.pos()]];
                },
                TYPE_SIGNATURE_VALUE => data.sig_ptrs.signature_value = Some(v),
                other if tlv::is_critical(other) => {
                    return Err(DecodeError::UnknownCritical(other))
                },
                _ => {},
            }
        }

        Ok(data)
    }
}

/// Build and sign a certificate Data packet.
pub fn signed_certificate(
    name: Name,
    key_bits: &[u8],
    freshness: Duration,
    signer: &dyn Signer,
) -> crate::Result<Vec<u8>> {
    let mut value = Vec::new();
    name.encode(&mut value);

    let mut meta = Vec::new();
    tlv::write_uint(&mut meta, TYPE_CONTENT_TYPE, CONTENT_TYPE_KEY);
    tlv::write_uint(&mut meta, TYPE_FRESHNESS_PERIOD, freshness.as_millis() as u64);
    tlv::write_tlv(&mut value, TYPE_METAINFO, &meta);

    tlv::write_tlv(&mut value, TYPE_CONTENT, key_bits);
    SignatureInfo::ecdsa(signer.key_locator().clone()).encode(&mut value);

    let signature = signer.sign(&value)?;
    tlv::write_tlv(&mut value, TYPE_SIGNATURE_VALUE, &signature);

    let mut wire = Vec::with_capacity(tlv::tlv_len(TYPE_DATA, value.len()));
    tlv::write_tlv(&mut wire, TYPE_DATA, &value);
    Ok(wire)
}
