// Copyright © 2022 Kim Altintop <kim@eagain.io>
// SPDX-License-Identifier: GPL-2.0-only WITH openvpn-openssl-exception

//! The signed application-layer records carried in `.tlv` blobs.
//!
//! A record on the wire is the concatenation of exactly one variant TLV,
//! a `SignatureInfo` and a `SignatureValue`; the signed region runs from
//! the start of the buffer through the end of the `SignatureInfo`.

use crate::{
    keys::Signer,
    ndn::{
        data::{
            SigPtrs,
            SignatureInfo,
        },
        tlv::{
            self,
            Reader,
        },
    },
};

pub mod error {
    use thiserror::Error;

    use crate::ndn::DecodeError;

    #[derive(Debug, Error)]
    pub enum Parse {
        #[error("malformed record")]
        Malformed(#[from] DecodeError),
        #[error("record carries no variant")]
        EmptyVariant,
    }
}

pub use error::Parse as ParseError;

pub const TAG_PROJECT_CONFIG: u64 = 0xf0;
pub const TAG_ACCOUNT_CONFIG: u64 = 0xf1;
pub const TAG_KEY_REVOCATION: u64 = 0xf2;
pub const TAG_GROUP_CONFIG: u64 = 0xf3;
pub const TAG_HEAD_REF: u64 = 0xf4;
pub const TAG_CHANGE_META: u64 = 0xf5;
pub const TAG_VOTE: u64 = 0xf6;
pub const TAG_COMMENT: u64 = 0xf7;
pub const TAG_CATALOG: u64 = 0xf8;

pub const TAG_SIGNATURE_INFO: u64 = 0xe0;
pub const TAG_SIGNATURE_VALUE: u64 = 0xe1;

const TAG_PROJECT_ID: u64 = 0x80;
const TAG_USER_ID: u64 = 0x81;
const TAG_GROUP_ID: u64 = 0x82;
const TAG_KEY_ID: u64 = 0x83;
const TAG_HEAD: u64 = 0x84;
const TAG_CHANGE_ID: u64 = 0x85;
const TAG_PATCH_SET: u64 = 0x86;
const TAG_COMMENT_ID: u64 = 0x87;
const TAG_DESCRIPTION: u64 = 0x90;
const TAG_INHERIT_FROM: u64 = 0x91;
const TAG_SYNC_INTERVAL: u64 = 0x92;
const TAG_REF_CONFIG: u64 = 0x93;
const TAG_LABEL_CONFIG: u64 = 0x94;
const TAG_REF_NAME: u64 = 0x95;
const TAG_OPERATION_RULE: u64 = 0x96;
const TAG_LABEL_RULE: u64 = 0x97;
const TAG_LABEL: u64 = 0x98;
const TAG_FUNCTION: u64 = 0x99;
const TAG_DEFAULT_VALUE: u64 = 0x9a;
const TAG_LABEL_VALUE: u64 = 0x9b;
const TAG_OPERATION: u64 = 0x9c;
const TAG_ACCESS: u64 = 0x9d;
const TAG_MIN_VALUE: u64 = 0x9e;
const TAG_MAX_VALUE: u64 = 0x9f;
const TAG_VALUE: u64 = 0xa0;
const TAG_VALUE_DESCRIPTION: u64 = 0xa1;
const TAG_FULL_NAME: u64 = 0xa2;
const TAG_EMAIL: u64 = 0xa3;
const TAG_REVOKE_TIME: u64 = 0xa4;
const TAG_META_COMMIT: u64 = 0xa5;
const TAG_STATUS: u64 = 0xa6;
const TAG_SUBJECT: u64 = 0xa7;
const TAG_FILENAME: u64 = 0xa8;
const TAG_LINE_NBR: u64 = 0xa9;
const TAG_AUTHOR: u64 = 0xaa;
const TAG_WRITTEN_ON: u64 = 0xab;
const TAG_MESSAGE: u64 = 0xac;
const TAG_REV_ID: u64 = 0xad;
const TAG_UNSOLVED: u64 = 0xae;
const TAG_CATALOG_ENTRY: u64 = 0xaf;

fn put_bytes(buf: &mut Vec<u8>, tag: u64, v: &Option<Vec<u8>>) {
    if let Some(v) = v {
        tlv::write_tlv(buf, tag, v);
    }
}

fn put_uint(buf: &mut Vec<u8>, tag: u64, v: &Option<u64>) {
    if let Some(v) = v {
        tlv::write_uint(buf, tag, *v);
    }
}

/// Signed one-byte values travel biased by +128.
fn put_byte(buf: &mut Vec<u8>, tag: u64, v: &Option<i8>) {
    if let Some(v) = v {
        tlv::write_tlv(buf, tag, &[(*v as i16 + 128) as u8]);
    }
}

fn put_bool(buf: &mut Vec<u8>, tag: u64, v: bool) {
    if v {
        tlv::write_tlv(buf, tag, &[]);
    }
}

fn get_byte(typ: u64, v: &[u8]) -> Result<i8, ParseError> {
    match v {
        [b] => Ok((*b as i16 - 128) as i8),
        _ => Err(tlv::DecodeError::Value {
            typ,
            reason: "biased value must be exactly one byte",
        }
        .into()),
    }
}

fn unknown(typ: u64) -> Result<(), ParseError> {
    if tlv::is_critical(typ) {
        Err(tlv::DecodeError::UnknownCritical(typ).into())
    } else {
        Ok(())
    }
}

macro_rules! nested {
    ($buf:expr, $tag:expr, $model:expr) => {{
        let mut value = Vec::new();
        $model.encode_value(&mut value);
        tlv::write_tlv($buf, $tag, &value);
    }};
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct OperationRule {
    pub operation: Option<u64>,
    pub access: Option<u64>,
    pub user_id: Option<Vec<u8>>,
    pub group_id: Option<Vec<u8>>,
}

impl OperationRule {
    fn encode_value(&self, buf: &mut Vec<u8>) {
        put_uint(buf, TAG_OPERATION, &self.operation);
        put_uint(buf, TAG_ACCESS, &self.access);
        put_bytes(buf, TAG_USER_ID, &self.user_id);
        put_bytes(buf, TAG_GROUP_ID, &self.group_id);
    }

    fn decode_value(value: &[u8]) -> Result<Self, ParseError> {
        let mut reader = Reader::new(value);
        let mut out = Self::default();
        while !reader.is_empty() {
            let (typ, v) = reader.read_tlv()?;
            match typ {
                TAG_OPERATION => out.operation = Some(tlv::read_uint(typ, v)?),
                TAG_ACCESS => out.access = Some(tlv::read_uint(typ, v)?),
                TAG_USER_ID => out.user_id = Some(v.to_vec()),
                TAG_GROUP_ID => out.group_id = Some(v.to_vec()),
                other => unknown(other)?,
            }
        }
        Ok(out)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LabelRule {
    pub label: Option<Vec<u8>>,
    pub min_value: Option<i8>,
    pub max_value: Option<i8>,
    pub user_id: Option<Vec<u8>>,
    pub group_id: Option<Vec<u8>>,
}

impl LabelRule {
    fn encode_value(&self, buf: &mut Vec<u8>) {
        put_bytes(buf, TAG_LABEL, &self.label);
        put_byte(buf, TAG_MIN_VALUE, &self.min_value);
        put_byte(buf, TAG_MAX_VALUE, &self.max_value);
        put_bytes(buf, TAG_USER_ID, &self.user_id);
        put_bytes(buf, TAG_GROUP_ID, &self.group_id);
    }

    fn decode_value(value: &[u8]) -> Result<Self, ParseError> {
        let mut reader = Reader::new(value);
        let mut out = Self::default();
        while !reader.is_empty() {
            let (typ, v) = reader.read_tlv()?;
            match typ {
                TAG_LABEL => out.label = Some(v.to_vec()),
                TAG_MIN_VALUE => out.min_value = Some(get_byte(typ, v)?),
                TAG_MAX_VALUE => out.max_value = Some(get_byte(typ, v)?),
                TAG_USER_ID => out.user_id = Some(v.to_vec()),
                TAG_GROUP_ID => out.group_id = Some(v.to_vec()),
                other => unknown(other)?,
            }
        }
        Ok(out)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RefConfig {
    pub ref_name: Option<Vec<u8>>,
    pub operation_rules: Vec<OperationRule>,
    pub label_rules: Vec<LabelRule>,
}

impl RefConfig {
    fn encode_value(&self, buf: &mut Vec<u8>) {
        put_bytes(buf, TAG_REF_NAME, &self.ref_name);
        for rule in &self.operation_rules {
            nested!(buf, TAG_OPERATION_RULE, rule);
        }
        for rule in &self.label_rules {
            nested!(buf, TAG_LABEL_RULE, rule);
        }
    }

    fn decode_value(value: &[u8]) -> Result<Self, ParseError> {
        let mut reader = Reader::new(value);
        let mut out = Self::default();
        while !reader.is_empty() {
            let (typ, v) = reader.read_tlv()?;
            match typ {
                TAG_REF_NAME => out.ref_name = Some(v.to_vec()),
                TAG_OPERATION_RULE => out.operation_rules.push(OperationRule::decode_value(v)?),
                TAG_LABEL_RULE => out.label_rules.push(LabelRule::decode_value(v)?),
                other => unknown(other)?,
            }
        }
        Ok(out)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LabelValue {
    pub value: Option<i8>,
    pub description: Option<Vec<u8>>,
}

impl LabelValue {
    fn encode_value(&self, buf: &mut Vec<u8>) {
        put_byte(buf, TAG_VALUE, &self.value);
        put_bytes(buf, TAG_VALUE_DESCRIPTION, &self.description);
    }

    fn decode_value(value: &[u8]) -> Result<Self, ParseError> {
        let mut reader = Reader::new(value);
        let mut out = Self::default();
        while !reader.is_empty() {
            let (typ, v) = reader.read_tlv()?;
            match typ {
                TAG_VALUE => out.value = Some(get_byte(typ, v)?),
                TAG_VALUE_DESCRIPTION => out.description = Some(v.to_vec()),
                other => unknown(other)?,
            }
        }
        Ok(out)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LabelConfig {
    pub label: Option<Vec<u8>>,
    pub function: Option<u64>,
    pub default_value: Option<i8>,
    pub values: Vec<LabelValue>,
}

impl LabelConfig {
    fn encode_value(&self, buf: &mut Vec<u8>) {
        put_bytes(buf, TAG_LABEL, &self.label);
        put_uint(buf, TAG_FUNCTION, &self.function);
        put_byte(buf, TAG_DEFAULT_VALUE, &self.default_value);
        for value in &self.values {
            nested!(buf, TAG_LABEL_VALUE, value);
        }
    }

    fn decode_value(value: &[u8]) -> Result<Self, ParseError> {
        let mut reader = Reader::new(value);
        let mut out = Self::default();
        while !reader.is_empty() {
            let (typ, v) = reader.read_tlv()?;
            match typ {
                TAG_LABEL => out.label = Some(v.to_vec()),
                TAG_FUNCTION => out.function = Some(tlv::read_uint(typ, v)?),
                TAG_DEFAULT_VALUE => out.default_value = Some(get_byte(typ, v)?),
                TAG_LABEL_VALUE => out.values.push(LabelValue::decode_value(v)?),
                other => unknown(other)?,
            }
        }
        Ok(out)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProjectConfig {
    pub project_id: Option<Vec<u8>>,
    pub description: Option<Vec<u8>>,
    pub inherit_from: Option<Vec<u8>>,
    pub sync_interval: Option<u64>,
    pub ref_configs: Vec<RefConfig>,
    pub labels: Vec<LabelConfig>,
}

impl ProjectConfig {
    fn encode_value(&self, buf: &mut Vec<u8>) {
        put_bytes(buf, TAG_PROJECT_ID, &self.project_id);
        put_bytes(buf, TAG_DESCRIPTION, &self.description);
        put_bytes(buf, TAG_INHERIT_FROM, &self.inherit_from);
        put_uint(buf, TAG_SYNC_INTERVAL, &self.sync_interval);
        for rc in &self.ref_configs {
            nested!(buf, TAG_REF_CONFIG, rc);
        }
        for label in &self.labels {
            nested!(buf, TAG_LABEL_CONFIG, label);
        }
    }

    fn decode_value(value: &[u8]) -> Result<Self, ParseError> {
        let mut reader = Reader::new(value);
        let mut out = Self::default();
        while !reader.is_empty() {
            let (typ, v) = reader.read_tlv()?;
            match typ {
                TAG_PROJECT_ID => out.project_id = Some(v.to_vec()),
                TAG_DESCRIPTION => out.description = Some(v.to_vec()),
                TAG_INHERIT_FROM => out.inherit_from = Some(v.to_vec()),
                TAG_SYNC_INTERVAL => out.sync_interval = Some(tlv::read_uint(typ, v)?),
                TAG_REF_CONFIG => out.ref_configs.push(RefConfig::decode_value(v)?),
                TAG_LABEL_CONFIG => out.labels.push(LabelConfig::decode_value(v)?),
                other => unknown(other)?,
            }
        }
        Ok(out)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AccountConfig {
    pub user_id: Option<Vec<u8>>,
    pub full_name: Option<Vec<u8>>,
    pub email: Option<Vec<u8>>,
}

impl AccountConfig {
    fn encode_value(&self, buf: &mut Vec<u8>) {
        put_bytes(buf, TAG_USER_ID, &self.user_id);
        put_bytes(buf, TAG_FULL_NAME, &self.full_name);
        put_bytes(buf, TAG_EMAIL, &self.email);
    }

    fn decode_value(value: &[u8]) -> Result<Self, ParseError> {
        let mut reader = Reader::new(value);
        let mut out = Self::default();
        while !reader.is_empty() {
            let (typ, v) = reader.read_tlv()?;
            match typ {
                TAG_USER_ID => out.user_id = Some(v.to_vec()),
                TAG_FULL_NAME => out.full_name = Some(v.to_vec()),
                TAG_EMAIL => out.email = Some(v.to_vec()),
                other => unknown(other)?,
            }
        }
        Ok(out)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct KeyRevocation {
    pub key_id: Option<Vec<u8>>,
    pub revoke_time: Option<Vec<u8>>,
}

impl KeyRevocation {
    fn encode_value(&self, buf: &mut Vec<u8>) {
        put_bytes(buf, TAG_KEY_ID, &self.key_id);
        put_bytes(buf, TAG_REVOKE_TIME, &self.revoke_time);
    }

    fn decode_value(value: &[u8]) -> Result<Self, ParseError> {
        let mut reader = Reader::new(value);
        let mut out = Self::default();
        while !reader.is_empty() {
            let (typ, v) = reader.read_tlv()?;
            match typ {
                TAG_KEY_ID => out.key_id = Some(v.to_vec()),
                TAG_REVOKE_TIME => out.revoke_time = Some(v.to_vec()),
                other => unknown(other)?,
            }
        }
        Ok(out)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct GroupConfig {
    pub group_id: Option<Vec<u8>>,
    pub full_name: Option<Vec<u8>>,
    pub owner: Option<Vec<u8>>,
    pub members: Option<Vec<u8>>,
}

impl GroupConfig {
    fn encode_value(&self, buf: &mut Vec<u8>) {
        put_bytes(buf, TAG_GROUP_ID, &self.group_id);
        put_bytes(buf, TAG_FULL_NAME, &self.full_name);
        put_bytes(buf, TAG_EMAIL, &self.owner);
        put_bytes(buf, TAG_REVOKE_TIME, &self.members);
    }

    fn decode_value(value: &[u8]) -> Result<Self, ParseError> {
        let mut reader = Reader::new(value);
        let mut out = Self::default();
        while !reader.is_empty() {
            let (typ, v) = reader.read_tlv()?;
            match typ {
                TAG_GROUP_ID => out.group_id = Some(v.to_vec()),
                TAG_FULL_NAME => out.full_name = Some(v.to_vec()),
                TAG_EMAIL => out.owner = Some(v.to_vec()),
                TAG_REVOKE_TIME => out.members = Some(v.to_vec()),
                other => unknown(other)?,
            }
        }
        Ok(out)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HeadRef {
    pub head: Option<Vec<u8>>,
    pub change_id: Option<Vec<u8>>,
    pub change_id_meta_commit: Option<Vec<u8>>,
}

impl HeadRef {
    fn encode_value(&self, buf: &mut Vec<u8>) {
        put_bytes(buf, TAG_HEAD, &self.head);
        put_bytes(buf, TAG_CHANGE_ID, &self.change_id);
        put_bytes(buf, TAG_META_COMMIT, &self.change_id_meta_commit);
    }

    fn decode_value(value: &[u8]) -> Result<Self, ParseError> {
        let mut reader = Reader::new(value);
        let mut out = Self::default();
        while !reader.is_empty() {
            let (typ, v) = reader.read_tlv()?;
            match typ {
                TAG_HEAD => out.head = Some(v.to_vec()),
                TAG_CHANGE_ID => out.change_id = Some(v.to_vec()),
                TAG_META_COMMIT => out.change_id_meta_commit = Some(v.to_vec()),
                other => unknown(other)?,
            }
        }
        Ok(out)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ChangeMeta {
    pub change_id: Option<Vec<u8>>,
    pub status: Option<u64>,
    pub patch_set: Option<u64>,
    pub subject: Option<Vec<u8>>,
}

impl ChangeMeta {
    fn encode_value(&self, buf: &mut Vec<u8>) {
        put_bytes(buf, TAG_CHANGE_ID, &self.change_id);
        put_uint(buf, TAG_STATUS, &self.status);
        put_uint(buf, TAG_PATCH_SET, &self.patch_set);
        put_bytes(buf, TAG_SUBJECT, &self.subject);
    }

    fn decode_value(value: &[u8]) -> Result<Self, ParseError> {
        let mut reader = Reader::new(value);
        let mut out = Self::default();
        while !reader.is_empty() {
            let (typ, v) = reader.read_tlv()?;
            match typ {
                TAG_CHANGE_ID => out.change_id = Some(v.to_vec()),
                TAG_STATUS => out.status = Some(tlv::read_uint(typ, v)?),
                TAG_PATCH_SET => out.patch_set = Some(tlv::read_uint(typ, v)?),
                TAG_SUBJECT => out.subject = Some(v.to_vec()),
                other => unknown(other)?,
            }
        }
        Ok(out)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Vote {
    pub label: Option<Vec<u8>>,
    pub value: Option<i8>,
}

impl Vote {
    fn encode_value(&self, buf: &mut Vec<u8>) {
        put_bytes(buf, TAG_LABEL, &self.label);
        put_byte(buf, TAG_VALUE, &self.value);
    }

    fn decode_value(value: &[u8]) -> Result<Self, ParseError> {
        let mut reader = Reader::new(value);
        let mut out = Self::default();
        while !reader.is_empty() {
            let (typ, v) = reader.read_tlv()?;
            match typ {
                TAG_LABEL => out.label = Some(v.to_vec()),
                TAG_VALUE => out.value = Some(get_byte(typ, v)?),
                other => unknown(other)?,
            }
        }
        Ok(out)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Comment {
    pub comment_id: Option<Vec<u8>>,
    pub filename: Option<Vec<u8>>,
    pub line_nbr: Option<u64>,
    pub author: Option<Vec<u8>>,
    pub written_on: Option<Vec<u8>>,
    pub message: Option<Vec<u8>>,
    pub rev_id: Option<Vec<u8>>,
    pub unsolved: bool,
}

impl Comment {
    fn encode_value(&self, buf: &mut Vec<u8>) {
        put_bytes(buf, TAG_COMMENT_ID, &self.comment_id);
        put_bytes(buf, TAG_FILENAME, &self.filename);
        put_uint(buf, TAG_LINE_NBR, &self.line_nbr);
        put_bytes(buf, TAG_AUTHOR, &self.author);
        put_bytes(buf, TAG_WRITTEN_ON, &self.written_on);
        put_bytes(buf, TAG_MESSAGE, &self.message);
        put_bytes(buf, TAG_REV_ID, &self.rev_id);
        put_bool(buf, TAG_UNSOLVED, self.unsolved);
    }

    fn decode_value(value: &[u8]) -> Result<Self, ParseError> {
        let mut reader = Reader::new(value);
        let mut out = Self::default();
        while !reader.is_empty() {
            let (typ, v) = reader.read_tlv()?;
            match typ {
                TAG_COMMENT_ID => out.comment_id = Some(v.to_vec()),
                TAG_FILENAME => out.filename = Some(v.to_vec()),
                TAG_LINE_NBR => out.line_nbr = Some(tlv::read_uint(typ, v)?),
                TAG_AUTHOR => out.author = Some(v.to_vec()),
                TAG_WRITTEN_ON => out.written_on = Some(v.to_vec()),
                TAG_MESSAGE => out.message = Some(v.to_vec()),
                TAG_REV_ID => out.rev_id = Some(v.to_vec()),
                TAG_UNSOLVED => out.unsolved = true,
                other => unknown(other)?,
            }
        }
        Ok(out)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Catalog {
    pub entries: Vec<Vec<u8>>,
}

impl Catalog {
    fn encode_value(&self, buf: &mut Vec<u8>) {
        for entry in &self.entries {
            tlv::write_tlv(buf, TAG_CATALOG_ENTRY, entry);
        }
    }

    fn decode_value(value: &[u8]) -> Result<Self, ParseError> {
        let mut reader = Reader::new(value);
        let mut out = Self::default();
        while !reader.is_empty() {
            let (typ, v) = reader.read_tlv()?;
            match typ {
                TAG_CATALOG_ENTRY => out.entries.push(v.to_vec()),
                other => unknown(other)?,
            }
        }
        Ok(out)
    }
}

/// One record of each kind a `.tlv` blob may carry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Record {
    ProjectConfig(ProjectConfig),
    AccountConfig(AccountConfig),
    KeyRevocation(KeyRevocation),
    GroupConfig(GroupConfig),
    HeadRef(HeadRef),
    ChangeMeta(ChangeMeta),
    Vote(Vote),
    Comment(Comment),
    Catalog(Catalog),
}

impl Record {
    pub fn tag(&self) -> u64 {
        match self {
            Self::ProjectConfig(_) => TAG_PROJECT_CONFIG,
            Self::AccountConfig(_) => TAG_ACCOUNT_CONFIG,
            Self::KeyRevocation(_) => TAG_KEY_REVOCATION,
            Self::GroupConfig(_) => TAG_GROUP_CONFIG,
            Self::HeadRef(_) => TAG_HEAD_REF,
            Self::ChangeMeta(_) => TAG_CHANGE_META,
            Self::Vote(_) => TAG_VOTE,
            Self::Comment(_) => TAG_COMMENT,
            Self::Catalog(_) => TAG_CATALOG,
        }
    }

    fn encode_variant(&self, buf: &mut Vec<u8>) {
        match self {
            Self::ProjectConfig(m) => nested!(buf, TAG_PROJECT_CONFIG, m),
            Self::AccountConfig(m) => nested!(buf, TAG_ACCOUNT_CONFIG, m),
            Self::KeyRevocation(m) => nested!(buf, TAG_KEY_REVOCATION, m),
            Self::GroupConfig(m) => nested!(buf, TAG_GROUP_CONFIG, m),
            Self::HeadRef(m) => nested!(buf, TAG_HEAD_REF, m),
            Self::ChangeMeta(m) => nested!(buf, TAG_CHANGE_META, m),
            Self::Vote(m) => nested!(buf, TAG_VOTE, m),
            Self::Comment(m) => nested!(buf, TAG_COMMENT, m),
            Self::Catalog(m) => nested!(buf, TAG_CATALOG, m),
        }
    }

    fn decode_variant(tag: u64, value: &[u8]) -> Result<Option<Self>, ParseError> {
        Ok(Some(match tag {
            TAG_PROJECT_CONFIG => Self::ProjectConfig(ProjectConfig::decode_value(value)?),
            TAG_ACCOUNT_CONFIG => Self::AccountConfig(AccountConfig::decode_value(value)?),
            TAG_KEY_REVOCATION => Self::KeyRevocation(KeyRevocation::decode_value(value)?),
            TAG_GROUP_CONFIG => Self::GroupConfig(GroupConfig::decode_value(value)?),
            TAG_HEAD_REF => Self::HeadRef(HeadRef::decode_value(value)?),
            TAG_CHANGE_META => Self::ChangeMeta(ChangeMeta::decode_value(value)?),
            TAG_VOTE => Self::Vote(Vote::decode_value(value)?),
            TAG_COMMENT => Self::Comment(Comment::decode_value(value)?),
            TAG_CATALOG => Self::Catalog(Catalog::decode_value(value)?),
            _ => return Ok(None),
        }))
    }
}

/// Encode a record, signing it if a signer is given.
///
/// The signature covers everything written before the signature-value
/// element, i.e. the variant and the signature info.
pub fn encode(record: &Record, signer: Option<&dyn Signer>) -> crate::Result<Vec<u8>> {
    let mut buf = Vec::new();
    record.encode_variant(&mut buf);
    if let Some(signer) = signer {
        SignatureInfo::ecdsa(signer.key_locator().clone()).encode(&mut buf);
        let signature = signer.sign(&buf)?;
        tlv::write_tlv(&mut buf, TAG_SIGNATURE_VALUE, &signature);
    }
    Ok(buf)
}

/// Parse a record, returning it together with the pointers the verifier
/// needs (covered region, signature info, raw signature bytes).
pub fn parse(wire: &[u8]) -> Result<(Record, SigPtrs), ParseError> {
    let mut reader = Reader::new(wire);
    let mut record = None;
    let mut ptrs = SigPtrs::default();

    while !reader.is_empty() {
        let start = reader.pos();
        let (typ, value) = reader.read_tlv()?;
        match typ {
            TAG_SIGNATURE_INFO => {
                ptrs.signature_info = Some(SignatureInfo::decode_value(value)?);
            },
            TAG_SIGNATURE_VALUE => {
                ptrs.covered = vec![&wire[..start]];
                ptrs.signature_value = Some(value);
            },
            other => match Record::decode_variant(other, value)? {
                Some(variant) => {
                    // first variant wins
                    if record.is_none() {
                        record = Some(variant);
                    }
                },
                None => unknown(other)?,
            },
        }
    }

    record
        .map(|record| (record, ptrs))
        .ok_or(ParseError::EmptyVariant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::EcdsaSigner;

    fn roundtrip(record: Record) -> Record {
        let wire = encode(&record, None).unwrap();
        let (parsed, ptrs) = parse(&wire).unwrap();
        assert!(ptrs.signature_info.is_none());
        parsed
    }

    #[test]
    fn project_config_roundtrip() {
        let record = Record::ProjectConfig(ProjectConfig {
            project_id: Some(b"All-Projects".to_vec()),
            description: Some(b"root project".to_vec()),
            inherit_from: None,
            sync_interval: Some(10),
            ref_configs: vec![RefConfig {
                ref_name: Some(b"refs/heads/*".to_vec()),
                operation_rules: vec![OperationRule {
                    operation: Some(1),
                    access: Some(1),
                    user_id: Some(b"admin".to_vec()),
                    group_id: None,
                }],
                label_rules: vec![LabelRule {
                    label: Some(b"Code-Review".to_vec()),
                    min_value: Some(-2),
                    max_value: Some(2),
                    user_id: None,
                    group_id: Some(b"reviewers".to_vec()),
                }],
            }],
            labels: vec![LabelConfig {
                label: Some(b"Code-Review".to_vec()),
                function: Some(0),
                default_value: Some(0),
                values: vec![
                    LabelValue {
                        value: Some(-2),
                        description: Some(b"Do not submit".to_vec()),
                    },
                    LabelValue {
                        value: Some(2),
                        description: Some(b"Approved".to_vec()),
                    },
                ],
            }],
        });
        assert_eq!(roundtrip(record.clone()), record);
    }

    #[test]
    fn vote_bias_on_the_wire() {
        let record = Record::Vote(Vote {
            label: Some(b"Verified".to_vec()),
            value: Some(-1),
        });
        let wire = encode(&record, None).unwrap();
        // last element is 0xa0 0x01 <biased>
        assert_eq!(&wire[wire.len() - 3..], &[0xa0, 0x01, 127]);
        assert_eq!(roundtrip(record.clone()), record);
    }

    #[test]
    fn comment_presence_bool() {
        let record = Record::Comment(Comment {
            comment_id: Some(b"c1".to_vec()),
            unsolved: true,
            ..Default::default()
        });
        assert_eq!(roundtrip(record.clone()), record);

        let record = Record::Comment(Comment {
            comment_id: Some(b"c1".to_vec()),
            unsolved: false,
            ..Default::default()
        });
        assert_eq!(roundtrip(record.clone()), record);
    }

    #[test]
    fn empty_variant_rejected() {
        let mut wire = Vec::new();
        SignatureInfo::ecdsa("/k".parse().unwrap()).encode(&mut wire);
        assert!(matches!(parse(&wire), Err(ParseError::EmptyVariant)));
    }

    #[test]
    fn signed_record_exposes_covered_region() {
        let signer = EcdsaSigner::generate("/t/users/u/KEY/%01".parse().unwrap());
        let record = Record::AccountConfig(AccountConfig {
            user_id: Some(b"alice".to_vec()),
            full_name: Some(b"Alice".to_vec()),
            email: Some(b"alice@example.com".to_vec()),
        });
        let wire = encode(&record, Some(&signer)).unwrap();
        let (parsed, ptrs) = parse(&wire).unwrap();
        assert_eq!(parsed, record);

        let info = ptrs.signature_info.expect("signature info");
        assert_eq!(info.key_locator.as_ref().unwrap(), signer.key_locator());
        // covered region is the whole wire minus the signature value TLV
        let sig = ptrs.signature_value.expect("signature value");
        assert_eq!(
            ptrs.covered[0].len() + tlv::tlv_len(TAG_SIGNATURE_VALUE, sig.len()),
            wire.len()
        );
    }

    #[test]
    fn truncated_record_rejected() {
        let record = Record::Catalog(Catalog {
            entries: vec![b"one".to_vec(), b"two".to_vec()],
        });
        let wire = encode(&record, None).unwrap();
        assert!(matches!(
            parse(&wire[..wire.len() - 1]),
            Err(ParseError::Malformed(_))
        ));
    }
}
