// Copyright © 2022 Kim Altintop <kim@eagain.io>
// SPDX-License-Identifier: GPL-2.0-only WITH openvpn-openssl-exception

pub mod account;
pub mod cfg;
pub mod git;
pub mod handler;
pub mod keys;
pub mod ndn;
pub mod proto;
pub mod server;
pub mod sync;

pub use cfg::Cfg;
pub use server::Server;

pub mod error;
pub use error::{
    Error,
    Result,
};
