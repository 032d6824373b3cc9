// Copyright © 2022 Kim Altintop <kim@eagain.io>
// SPDX-License-Identifier: GPL-2.0-only WITH openvpn-openssl-exception

pub mod commit;
pub use commit::Links;

pub mod refs;
pub use refs::Refname;

pub mod repo;
pub use repo::GitRepo;

pub mod repos;
pub use repos::{
    GitRepos,
    ALL_PROJECTS,
    ALL_USERS,
};

pub mod tree;

pub type Result<T> = core::result::Result<T, git2::Error>;

pub fn if_not_found_none<T>(r: Result<T>) -> Result<Option<T>> {
    if_not_found_then(r.map(Some), || Ok(None))
}

pub fn if_not_found_then<F, T>(r: Result<T>, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    r.or_else(|e| match e.code() {
        git2::ErrorCode::NotFound => f(),
        _ => Err(e),
    })
}
