// Copyright © 2022 Kim Altintop <kim@eagain.io>
// SPDX-License-Identifier: GPL-2.0-only WITH openvpn-openssl-exception

//! Just enough named-data networking to carry the sync protocol: TLV
//! primitives, names, the Data packet (for certificates), and the
//! forwarder seam.

pub mod data;
pub use data::{
    Data,
    SigPtrs,
    SignatureInfo,
};

pub mod face;
pub use face::{
    Face,
    Interest,
    Reply,
};

pub mod name;
pub use name::{
    Component,
    Name,
};

pub mod tlv;
pub use tlv::DecodeError;
