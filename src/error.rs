// Copyright © 2022 Kim Altintop <kim@eagain.io>
// SPDX-License-Identifier: GPL-2.0-only WITH openvpn-openssl-exception

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T>;

/// A name that should resolve but doesn't: a repo the daemon does not
/// serve, a ref that was never created.
#[derive(Debug, thiserror::Error)]
#[error("{what} not found in {whence}")]
pub struct NotFound<T, U> {
    pub what: T,
    pub whence: U,
}
