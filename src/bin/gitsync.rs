// Copyright © 2022 Kim Altintop <kim@eagain.io>
// SPDX-License-Identifier: GPL-2.0-only WITH openvpn-openssl-exception

use std::path::PathBuf;

use clap::ValueHint;

use gitsync::{
    cfg,
    ndn::{
        face::Hub,
        Name,
    },
    Cfg,
    Server,
};

/// gitsync: signed multi-writer git replication over NDN
///
/// Runs one sync daemon over an in-process forwarder; connecting the
/// face to an external forwarder is a deployment concern.
#[derive(Debug, clap::Parser)]
#[clap(author, version, about, max_term_width = 100)]
struct GitSync {
    /// Base directory for repositories and state
    #[clap(
        long,
        value_parser,
        value_name = "DIR",
        env = cfg::env::BASEDIR,
        value_hint = ValueHint::DirPath,
    )]
    base_dir: PathBuf,
    /// Name prefix to serve under
    #[clap(long, value_parser, value_name = "NAME", env = cfg::env::PREFIX)]
    prefix: Name,
    /// Directory holding the signing keys
    #[clap(
        long,
        value_parser,
        value_name = "DIR",
        env = cfg::env::KEYSTORE,
        value_hint = ValueHint::DirPath,
    )]
    keystore: PathBuf,
    /// Name of the signing key
    #[clap(long, value_parser, value_name = "NAME", env = cfg::env::KEY)]
    key: Name,
    /// Path to the trust anchor certificate
    #[clap(
        long,
        value_parser,
        value_name = "FILE",
        env = cfg::env::TRUST_ANCHOR,
        value_hint = ValueHint::FilePath,
    )]
    trust_anchor: PathBuf,
}

fn main() -> gitsync::Result<()> {
    use clap::Parser as _;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = GitSync::parse();
    let cfg = Cfg {
        base_dir: args.base_dir,
        prefix: args.prefix,
        keystore: args.keystore,
        key: args.key,
        trust_anchor: args.trust_anchor,
    };

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, async move {
        let hub = Hub::new();
        let server = Server::new(hub.face(), cfg)?;
        server.start()?;
        std::future::pending::<gitsync::Result<()>>().await
    })
}
