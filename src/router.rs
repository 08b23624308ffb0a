//! Classification of intercepted requests.

use reqwest::Method;

use crate::http::Request;

/// Fetch policy chosen for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Precache, then network, then runtime cache / offline document
  CacheFirst,
  /// Network, then runtime cache
  NetworkFirst,
}

/// Pure, synchronous request classifier.
#[derive(Debug, Clone)]
pub struct Router {
  api_marker: String,
}

impl Router {
  pub fn new(api_marker: impl Into<String>) -> Self {
    Self {
      api_marker: api_marker.into(),
    }
  }

  /// Pick a strategy, or `None` to let the request through untouched.
  pub fn route(&self, request: &Request) -> Option<Strategy> {
    if request.method() != Method::GET {
      return None;
    }

    // Extension-local and other internal schemes never hit the network
    if !matches!(request.url().scheme(), "http" | "https") {
      return None;
    }

    if request.url().path().contains(&self.api_marker) {
      Some(Strategy::NetworkFirst)
    } else {
      Some(Strategy::CacheFirst)
    }
  }
}

impl Default for Router {
  fn default() -> Self {
    Self::new("/api/")
  }
}
