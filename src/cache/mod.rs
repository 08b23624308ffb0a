//! Versioned cache generations for offline support.
//!
//! This module provides the storage side of the interceptor:
//! - Named generations (precache and runtime) keyed by request identity
//! - Atomic writes, last write wins per key
//! - Listing and deletion of generations for upgrade cleanup

mod storage;
mod store;
mod types;

pub use storage::{CacheStorage, SqliteStorage};
#[cfg(test)]
pub(crate) use storage::failing::WriteFailingStorage;
pub use store::{CacheHandle, CacheStore};
pub use types::{CachedEntry, Generation, RequestKey, Served, Source};
