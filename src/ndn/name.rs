// Copyright © 2022 Kim Altintop <kim@eagain.io>
// SPDX-License-Identifier: GPL-2.0-only WITH openvpn-openssl-exception

use core::{
    fmt,
    ops::Deref,
    str::FromStr,
};

use super::tlv::{
    self,
    DecodeError,
    Reader,
};

pub const TYPE_NAME: u64 = 0x07;

/// A single name component: a type number and an opaque value.
///
/// Only the component types the sync protocol uses are given constructors;
/// anything else round-trips through the generic codec.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Component {
    typ: u64,
    value: Vec<u8>,
}

impl Component {
    pub const TYPE_GENERIC: u64 = 0x08;
    pub const TYPE_SEGMENT: u64 = 0x32;
    pub const TYPE_TIMESTAMP: u64 = 0x38;

    pub fn new(typ: u64, value: impl Into<Vec<u8>>) -> Self {
        Self {
            typ,
            value: value.into(),
        }
    }

    pub fn from_bytes(value: impl Into<Vec<u8>>) -> Self {
        Self::new(Self::TYPE_GENERIC, value)
    }

    pub fn from_segment(seg: u64) -> Self {
        Self::new(Self::TYPE_SEGMENT, number_value(seg))
    }

    pub fn from_timestamp(millis: u64) -> Self {
        Self::new(Self::TYPE_TIMESTAMP, number_value(millis))
    }

    pub fn typ(&self) -> u64 {
        self.typ
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn is_segment(&self) -> bool {
        self.typ == Self::TYPE_SEGMENT
    }

    /// Big-endian number interpretation of the value, as used by segment
    /// and timestamp components.
    pub fn to_number(&self) -> u64 {
        let mut n: u64 = 0;
        for b in &self.value {
            n = n << 8 | u64::from(*b);
        }
        n
    }

    pub fn encoded_len(&self) -> usize {
        tlv::tlv_len(self.typ, self.value.len())
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        tlv::write_tlv(buf, self.typ, &self.value);
    }

    pub fn decode(reader: &mut Reader) -> Result<Self, DecodeError> {
        let (typ, value) = reader.read_tlv()?;
        Ok(Self::new(typ, value))
    }
}

fn number_value(n: u64) -> Vec<u8> {
    let bytes = n.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(7);
    bytes[skip..].to_vec()
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.typ {
            Self::TYPE_SEGMENT => return write!(f, "seg={}", self.to_number()),
            Self::TYPE_TIMESTAMP => return write!(f, "t={}", self.to_number()),
            Self::TYPE_GENERIC => {},
            other => write!(f, "{}=", other)?,
        }
        for b in &self.value {
            match b {
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                    write!(f, "{}", *b as char)?
                },
                _ => write!(f, "%{:02X}", b)?,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Component {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(seg) = s.strip_prefix("seg=") {
            let n = seg.parse().map_err(|_| DecodeError::Value {
                typ: Self::TYPE_SEGMENT,
                reason: "invalid segment number",
            })?;
            return Ok(Self::from_segment(n));
        }
        if let Some(ts) = s.strip_prefix("t=") {
            let n = ts.parse().map_err(|_| DecodeError::Value {
                typ: Self::TYPE_TIMESTAMP,
                reason: "invalid timestamp",
            })?;
            return Ok(Self::from_timestamp(n));
        }
        let (typ, rest) = match s.split_once('=') {
            Some((t, rest)) if t.bytes().all(|b| b.is_ascii_digit()) => {
                let typ = t.parse().map_err(|_| DecodeError::Value {
                    typ: 0,
                    reason: "invalid component type",
                })?;
                (typ, rest)
            },
            _ => (Self::TYPE_GENERIC, s),
        };
        Ok(Self::new(typ, unescape(rest)?))
    }
}

fn unescape(s: &str) -> Result<Vec<u8>, DecodeError> {
    const INVALID: DecodeError = DecodeError::Value {
        typ: Component::TYPE_GENERIC,
        reason: "invalid percent escape",
    };

    let mut out = Vec::with_capacity(s.len());
    let mut bytes = s.bytes();
    while let Some(b) = bytes.next() {
        if b != b'%' {
            out.push(b);
            continue;
        }
        let hi = bytes.next().ok_or(INVALID)?;
        let lo = bytes.next().ok_or(INVALID)?;
        let hex = [hi, lo];
        let s = core::str::from_utf8(&hex).map_err(|_| INVALID)?;
        out.push(u8::from_str_radix(s, 16).map_err(|_| INVALID)?);
    }
    Ok(out)
}

/// A hierarchical NDN name.
#[derive(Clone, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Name(Vec<Component>);

impl Name {
    pub fn new(components: Vec<Component>) -> Self {
        Self(components)
    }

    pub fn append(mut self, c: Component) -> Self {
        self.0.push(c);
        self
    }

    pub fn push(&mut self, c: Component) {
        self.0.push(c)
    }

    /// Component counted from the end: `from_end(1)` is the last one.
    pub fn from_end(&self, n: usize) -> Option<&Component> {
        self.0.len().checked_sub(n).map(|i| &self.0[i])
    }

    pub fn is_prefix_of(&self, other: &Name) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }

    /// Encoded size of the component sequence, without the Name TL.
    pub fn components_len(&self) -> usize {
        self.0.iter().map(Component::encoded_len).sum()
    }

    pub fn encode_components(&self, buf: &mut Vec<u8>) {
        for c in &self.0 {
            c.encode(buf);
        }
    }

    /// Encode as a complete Name TLV.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        tlv::write_varnum(buf, TYPE_NAME);
        tlv::write_varnum(buf, self.components_len() as u64);
        self.encode_components(buf);
    }

    /// Decode the component sequence inside a Name TLV value.
    pub fn decode_value(value: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(value);
        let mut components = Vec::new();
        while !reader.is_empty() {
            components.push(Component::decode(&mut reader)?);
        }
        Ok(Self(components))
    }

    /// Decode a complete Name TLV.
    pub fn decode(reader: &mut Reader) -> Result<Self, DecodeError> {
        let value = reader.expect(TYPE_NAME)?;
        Self::decode_value(value)
    }
}

impl Deref for Name {
    type Target = [Component];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<Component>> for Name {
    fn from(components: Vec<Component>) -> Self {
        Self(components)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for c in &self.0 {
            write!(f, "/{}", c)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Name {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split('/')
            .filter(|part| !part.is_empty())
            .map(Component::from_str)
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}
