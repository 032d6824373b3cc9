// Copyright © 2022 Kim Altintop <kim@eagain.io>
// SPDX-License-Identifier: GPL-2.0-only WITH openvpn-openssl-exception

//! The unsigned wire packets of the sync protocol.

use crate::ndn::tlv::{
    self,
    DecodeError,
    Reader,
};

pub const TAG_OBJ_TYPE: u64 = 0x01;
pub const TAG_OBJ_DATA: u64 = 0x02;
pub const TAG_REF_NAME: u64 = 0x03;
pub const TAG_REF_HEAD: u64 = 0x04;
pub const TAG_REF_INFO: u64 = 0x05;
pub const TAG_FORCE: u64 = 0x06;
pub const TAG_FULL_NAME: u64 = 0x07;
pub const TAG_EMAIL: u64 = 0x08;
pub const TAG_CERT: u64 = 0x09;

fn missing(typ: u64) -> DecodeError {
    DecodeError::Value {
        typ,
        reason: "required element is missing",
    }
}

/// One segment of a replicated git object.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SyncObject {
    pub obj_type: Vec<u8>,
    pub obj_data: Vec<u8>,
}

impl SyncObject {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        tlv::write_tlv(&mut buf, TAG_OBJ_TYPE, &self.obj_type);
        tlv::write_tlv(&mut buf, TAG_OBJ_DATA, &self.obj_data);
        buf
    }

    pub fn parse(wire: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(wire);
        let mut obj_type = None;
        let mut obj_data = None;
        while !reader.is_empty() {
            let (typ, v) = reader.read_tlv()?;
            match typ {
                TAG_OBJ_TYPE => obj_type = Some(v.to_vec()),
                TAG_OBJ_DATA => obj_data = Some(v.to_vec()),
                other if tlv::is_critical(other) => {
                    return Err(DecodeError::UnknownCritical(other))
                },
                _ => {},
            }
        }
        Ok(Self {
            obj_type: obj_type.ok_or_else(|| missing(TAG_OBJ_TYPE))?,
            obj_data: obj_data.ok_or_else(|| missing(TAG_OBJ_DATA))?,
        })
    }
}

/// The head of one ref.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RefInfo {
    pub ref_name: Vec<u8>,
    pub ref_head: git2::Oid,
}

impl RefInfo {
    fn encode_value(&self, buf: &mut Vec<u8>) {
        tlv::write_tlv(buf, TAG_REF_NAME, &self.ref_name);
        tlv::write_tlv(buf, TAG_REF_HEAD, self.ref_head.as_bytes());
    }

    fn decode_value(value: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(value);
        let mut ref_name = None;
        let mut ref_head = None;
        while !reader.is_empty() {
            let (typ, v) = reader.read_tlv()?;
            match typ {
                TAG_REF_NAME => ref_name = Some(v.to_vec()),
                TAG_REF_HEAD => {
                    ref_head = Some(git2::Oid::from_bytes(v).map_err(|_| {
                        DecodeError::Value {
                            typ,
                            reason: "ref head must be a 20-byte hash",
                        }
                    })?)
                },
                other if tlv::is_critical(other) => {
                    return Err(DecodeError::UnknownCritical(other))
                },
                _ => {},
            }
        }
        Ok(Self {
            ref_name: ref_name.ok_or_else(|| missing(TAG_REF_NAME))?,
            ref_head: ref_head.ok_or_else(|| missing(TAG_REF_HEAD))?,
        })
    }
}

/// A peer's announced set of branch heads.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SyncUpdate {
    pub ref_info: Vec<RefInfo>,
}

impl SyncUpdate {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for info in &self.ref_info {
            let mut value = Vec::new();
            info.encode_value(&mut value);
            tlv::write_tlv(&mut buf, TAG_REF_INFO, &value);
        }
        buf
    }

    pub fn parse(wire: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(wire);
        let mut update = Self::default();
        while !reader.is_empty() {
            let (typ, v) = reader.read_tlv()?;
            match typ {
                TAG_REF_INFO => update.ref_info.push(RefInfo::decode_value(v)?),
                other if tlv::is_critical(other) => {
                    return Err(DecodeError::UnknownCritical(other))
                },
                _ => {},
            }
        }
        Ok(update)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PushRequest {
    pub ref_info: RefInfo,
    pub force: bool,
}

impl PushRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut value = Vec::new();
        self.ref_info.encode_value(&mut value);
        tlv::write_tlv(&mut buf, TAG_REF_INFO, &value);
        // presence encodes truth
        if self.force {
            tlv::write_tlv(&mut buf, TAG_FORCE, &[]);
        }
        buf
    }

    pub fn parse(wire: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(wire);
        let mut ref_info = None;
        let mut force = false;
        while !reader.is_empty() {
            let (typ, v) = reader.read_tlv()?;
            match typ {
                TAG_REF_INFO => ref_info = Some(RefInfo::decode_value(v)?),
                TAG_FORCE => force = true,
                other if tlv::is_critical(other) => {
                    return Err(DecodeError::UnknownCritical(other))
                },
                _ => {},
            }
        }
        Ok(Self {
            ref_info: ref_info.ok_or_else(|| missing(TAG_REF_INFO))?,
            force,
        })
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AddUserReq {
    pub full_name: Vec<u8>,
    pub email: Vec<u8>,
    pub cert: Vec<u8>,
}

impl AddUserReq {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        tlv::write_tlv(&mut buf, TAG_FULL_NAME, &self.full_name);
        tlv::write_tlv(&mut buf, TAG_EMAIL, &self.email);
        tlv::write_tlv(&mut buf, TAG_CERT, &self.cert);
        buf
    }

    pub fn parse(wire: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(wire);
        let mut req = Self::default();
        while !reader.is_empty() {
            let (typ, v) = reader.read_tlv()?;
            match typ {
                TAG_FULL_NAME => req.full_name = v.to_vec(),
                TAG_EMAIL => req.email = v.to_vec(),
                TAG_CERT => req.cert = v.to_vec(),
                other if tlv::is_critical(other) => {
                    return Err(DecodeError::UnknownCritical(other))
                },
                _ => {},
            }
        }
        Ok(req)
    }
}
