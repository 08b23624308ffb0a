//! Offline-first request interception.
//!
//! Requests pass through a [`router::Router`] that picks one of two policies:
//! asset-first for static files (versioned precache, then network, then the
//! runtime cache and an offline document) and data-first for API calls
//! (network, then runtime cache). A [`lifecycle::Lifecycle`] populates the
//! precache on install and deletes superseded generations on activation.
//! Everything is wired together by [`interceptor::Interceptor`], which takes an
//! explicitly constructed [`cache::CacheStore`] and [`transport::Transport`].

pub mod cache;
pub mod config;
pub mod control;
pub mod error;
pub mod http;
pub mod interceptor;
pub mod lifecycle;
pub mod logging;
pub mod router;
pub mod strategy;
pub mod transport;

pub use error::{Error, Result};
pub use interceptor::{Event, Interceptor, Outcome};
