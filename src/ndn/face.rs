// Copyright © 2022 Kim Altintop <kim@eagain.io>
// SPDX-License-Identifier: GPL-2.0-only WITH openvpn-openssl-exception

//! The application's view of the forwarder.
//!
//! Transport below the application layer is out of scope here: the daemon
//! programs against [`Face`], and deployments provide the wire transport.
//! The in-memory [`Hub`] links several faces inside one process, which is
//! what the test suite (and single-process multi-repo operation) runs on.

use std::{
    cell::{
        Cell,
        RefCell,
    },
    future::Future,
    pin::Pin,
    rc::Rc,
    time::Duration,
};

use async_trait::async_trait;

use super::name::{
    Component,
    Name,
};

pub mod error {
    use thiserror::Error;

    pub const NACK_NO_ROUTE: u64 = 150;

    #[derive(Debug, Error)]
    pub enum Expressed {
        #[error("interest timed out")]
        Timeout,
        #[error("interest nacked, reason {reason}")]
        Nacked { reason: u64 },
        #[error("interest cancelled")]
        Cancelled,
    }
}

pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(4);

#[derive(Clone, Debug)]
pub struct Interest {
    pub name: Name,
    pub app_param: Option<Vec<u8>>,
    pub must_be_fresh: bool,
    pub can_be_prefix: bool,
    pub lifetime: Duration,
}

impl Interest {
    pub fn new(name: Name) -> Self {
        Self {
            name,
            app_param: None,
            must_be_fresh: false,
            can_be_prefix: false,
            lifetime: DEFAULT_LIFETIME,
        }
    }

    pub fn with_param(mut self, param: Vec<u8>) -> Self {
        self.app_param = Some(param);
        self
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }
}

#[derive(Clone, Debug)]
pub struct Reply {
    pub name: Name,
    pub content: Vec<u8>,
    pub freshness: Option<Duration>,
    pub final_block_id: Option<Component>,
}

impl Reply {
    pub fn new(name: Name, content: Vec<u8>) -> Self {
        Self {
            name,
            content,
            freshness: None,
            final_block_id: None,
        }
    }

    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = Some(freshness);
        self
    }

    pub fn with_final_block(mut self, final_block: Component) -> Self {
        self.final_block_id = Some(final_block);
        self
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Option<Reply>>>>;
pub type Handler = Rc<dyn Fn(Interest) -> HandlerFuture>;

#[async_trait(?Send)]
pub trait Face {
    async fn express(&self, interest: Interest) -> Result<Reply, error::Expressed>;
    fn register(&self, prefix: Name, handler: Handler);
    fn unregister(&self, prefix: &Name);
}

struct Route {
    prefix: Name,
    face_id: usize,
    handler: Handler,
}

#[derive(Default)]
struct State {
    routes: RefCell<Vec<Route>>,
    next_id: Cell<usize>,
}

/// In-process forwarder connecting any number of [`MemFace`]s.
///
/// The hub itself is a cheap handle; clones share the route table.
#[derive(Clone, Default)]
pub struct Hub {
    state: Rc<State>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn face(&self) -> Rc<MemFace> {
        let id = self.state.next_id.get() + 1;
        self.state.next_id.set(id);
        Rc::new(MemFace {
            hub: self.clone(),
            id,
        })
    }
}

pub struct MemFace {
    hub: Hub,
    id: usize,
}

#[async_trait(?Send)]
impl Face for MemFace {
    async fn express(&self, interest: Interest) -> Result<Reply, error::Expressed> {
        // Handlers may express interests themselves, so the route table
        // borrow must not be held across an await point.
        let handlers: Vec<Handler> = self
            .hub
            .state
            .routes
            .borrow()
            .iter()
            .filter(|r| r.face_id != self.id && r.prefix.is_prefix_of(&interest.name))
            .map(|r| Rc::clone(&r.handler))
            .collect();

        if handlers.is_empty() {
            return Err(error::Expressed::Nacked {
                reason: error::NACK_NO_ROUTE,
            });
        }

        let deadline = tokio::time::Instant::now() + interest.lifetime;
        for handler in handlers {
            let fut = handler(interest.clone());
            match tokio::time::timeout_at(deadline, fut).await {
                Ok(Some(reply)) => return Ok(reply),
                Ok(None) => continue,
                Err(_elapsed) => return Err(error::Expressed::Timeout),
            }
        }
        Err(error::Expressed::Timeout)
    }

    fn register(&self, prefix: Name, handler: Handler) {
        self.hub.state.routes.borrow_mut().push(Route {
            prefix,
            face_id: self.id,
            handler,
        });
    }

    fn unregister(&self, prefix: &Name) {
        self.hub
            .state
            .routes
            .borrow_mut()
            .retain(|r| !(r.face_id == self.id && &r.prefix == prefix));
    }
}

/// Wrap an async `Fn(Interest)` as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Interest) -> Fut + 'static,
    Fut: Future<Output = Option<Reply>> + 'static,
{
    Rc::new(move |interest| Box::pin(f(interest)) as HandlerFuture)
}
