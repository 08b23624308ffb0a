//! Core types for the caching system.

use chrono::{DateTime, Utc};
use reqwest::Method;
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{Error, Result};
use crate::http::{Request, Response};

/// Name + version tag of one logical cache store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Generation {
  prefix: String,
  kind: GenerationKind,
  version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum GenerationKind {
  /// Build-time asset list, populated once at install
  Precache,
  /// Responses cached opportunistically from live traffic
  Runtime,
}

impl Generation {
  pub fn precache(prefix: &str, version: &str) -> Self {
    Self {
      prefix: prefix.to_string(),
      kind: GenerationKind::Precache,
      version: version.to_string(),
    }
  }

  pub fn runtime(prefix: &str, version: &str) -> Self {
    Self {
      prefix: prefix.to_string(),
      kind: GenerationKind::Runtime,
      version: version.to_string(),
    }
  }

  /// Storage name, e.g. `shell-v3` or `shell-runtime-v3`.
  pub fn name(&self) -> String {
    match self.kind {
      GenerationKind::Precache => format!("{}-{}", self.prefix, self.version),
      GenerationKind::Runtime => format!("{}-runtime-{}", self.prefix, self.version),
    }
  }
}

impl std::fmt::Display for Generation {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.name())
  }
}

/// Identity of a cached request: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  method: Method,
  url: Url,
}

impl RequestKey {
  /// Key for a request, rejecting anything but GET.
  pub fn for_request(request: &Request) -> Result<Self> {
    if request.method() != Method::GET {
      return Err(Error::UnsupportedMethod(request.method().to_string()));
    }
    Ok(Self::get(request.url()))
  }

  pub fn get(url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: Method::GET,
      url,
    }
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  /// SHA256 hash for stable, fixed-length storage keys.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A response read back from a cache generation.
#[derive(Debug)]
pub struct CachedEntry {
  pub response: Response,
  /// When the response was written
  pub cached_at: DateTime<Utc>,
}

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
  /// Fresh from the network
  Network,
  /// Versioned precache hit
  Precache,
  /// Runtime cache, served because the network failed
  Runtime,
  /// Offline document substituted for an unreachable HTML request
  OfflineDocument,
}

/// A response together with its provenance.
#[derive(Debug)]
pub struct Served {
  pub response: Response,
  pub source: Source,
}

impl Served {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: Source::Network,
    }
  }

  pub fn from_cache(response: Response, source: Source) -> Self {
    Self { response, source }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_generation_names() {
    assert_eq!(Generation::precache("shell", "v1").name(), "shell-v1");
    assert_eq!(Generation::runtime("shell", "v1").name(), "shell-runtime-v1");
  }

  #[test]
  fn test_key_ignores_fragment() {
    let a = RequestKey::get(&Url::parse("https://app.test/page#top").unwrap());
    let b = RequestKey::get(&Url::parse("https://app.test/page").unwrap());
    assert_eq!(a.cache_hash(), b.cache_hash());
  }

  #[test]
  fn test_key_distinguishes_query() {
    let a = RequestKey::get(&Url::parse("https://app.test/page?x=1").unwrap());
    let b = RequestKey::get(&Url::parse("https://app.test/page?x=2").unwrap());
    assert_ne!(a.cache_hash(), b.cache_hash());
  }

  #[test]
  fn test_key_rejects_post() {
    let request = Request::parse("POST", "https://app.test/api/items").unwrap();
    assert!(matches!(
      RequestKey::for_request(&request),
      Err(Error::UnsupportedMethod(m)) if m == "POST"
    ));
  }
}
