//! Error types for the interception layer.

use thiserror::Error;

/// Result type alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the cache store, transport, lifecycle and strategies.
#[derive(Debug, Error)]
pub enum Error {
  /// A precache manifest entry could not be fetched or was not a 200 response.
  #[error("failed to precache {url}: {reason}")]
  ManifestFetch { url: String, reason: String },

  /// The network attempt for a live request failed outright.
  #[error("network request to {url} failed: {message}")]
  Network { url: String, message: String },

  /// The cache store was unavailable or rejected the operation.
  #[error("cache store error while {context}: {message}")]
  Store { context: String, message: String },

  /// Only read-only retrieval requests can be cached.
  #[error("method {0} cannot be cached")]
  UnsupportedMethod(String),

  #[error("invalid url {url}: {reason}")]
  InvalidUrl { url: String, reason: String },

  /// A lifecycle step was requested from the wrong state.
  #[error("lifecycle error: {0}")]
  Lifecycle(String),

  #[error("configuration error: {0}")]
  Config(String),
}

impl Error {
  pub fn network(url: impl Into<String>, message: impl ToString) -> Self {
    Self::Network {
      url: url.into(),
      message: message.to_string(),
    }
  }

  pub fn store(context: impl Into<String>, message: impl ToString) -> Self {
    Self::Store {
      context: context.into(),
      message: message.to_string(),
    }
  }

  /// True for failures the strategies are allowed to recover from by falling back to a cache.
  pub fn is_network(&self) -> bool {
    matches!(self, Self::Network { .. })
  }
}
