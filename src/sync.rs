// Copyright © 2022 Kim Altintop <kim@eagain.io>
// SPDX-License-Identifier: GPL-2.0-only WITH openvpn-openssl-exception

pub mod fetch;
pub use fetch::ObjectFetcher;

pub mod merger;
pub use merger::Merger;

pub mod packet;

pub mod pipeline;
pub use pipeline::RepoSyncPipeline;

pub mod vsync;
pub use vsync::VSync;
