//! Async cache store shared by the lifecycle, strategies and control channel.

use std::collections::BTreeSet;
use std::sync::Arc;

use super::storage::CacheStorage;
use super::types::{CachedEntry, Generation, RequestKey};
use crate::error::{Error, Result};
use crate::http::{Request, Response};

/// Async front for a [`CacheStorage`] backend.
///
/// Storage calls are blocking, so each one runs on tokio's blocking pool. The
/// store is cheap to clone and is handed to every component at startup.
pub struct CacheStore<S: CacheStorage> {
  storage: Arc<S>,
}

impl<S: CacheStorage> CacheStore<S> {
  pub fn new(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
    }
  }

  async fn blocking<R, F>(&self, f: F) -> Result<R>
  where
    R: Send + 'static,
    F: FnOnce(&S) -> Result<R> + Send + 'static,
  {
    let storage = Arc::clone(&self.storage);
    tokio::task::spawn_blocking(move || f(&storage))
      .await
      .map_err(|e| Error::store("joining storage task", e))?
  }

  /// Open a generation, creating it if needed.
  pub async fn open(&self, generation: &Generation) -> Result<CacheHandle<S>> {
    let name = generation.name();
    let registered = name.clone();
    self
      .blocking(move |s| s.open_generation(&registered))
      .await?;

    Ok(CacheHandle {
      store: self.clone(),
      name,
    })
  }

  /// Handle to a generation without registering it. Reads from a generation
  /// that does not exist are misses.
  pub fn handle(&self, generation: &Generation) -> CacheHandle<S> {
    CacheHandle {
      store: self.clone(),
      name: generation.name(),
    }
  }

  /// Delete a generation by name. Returns whether anything was removed.
  pub async fn delete(&self, name: &str) -> Result<bool> {
    let name = name.to_string();
    self.blocking(move |s| s.delete_generation(&name)).await
  }

  pub async fn generation_names(&self) -> Result<BTreeSet<String>> {
    self.blocking(|s| s.generation_names()).await
  }

  pub async fn entry_urls(&self, name: &str) -> Result<Vec<String>> {
    let name = name.to_string();
    self.blocking(move |s| s.entry_urls(&name)).await
  }
}

impl<S: CacheStorage> Clone for CacheStore<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
    }
  }
}

/// An opened generation.
pub struct CacheHandle<S: CacheStorage> {
  store: CacheStore<S>,
  name: String,
}

impl<S: CacheStorage> CacheHandle<S> {
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Look up a request. Non-GET requests never match.
  pub async fn match_request(&self, request: &Request) -> Result<Option<CachedEntry>> {
    match RequestKey::for_request(request) {
      Ok(key) => self.match_key(key).await,
      Err(_) => Ok(None),
    }
  }

  pub async fn match_key(&self, key: RequestKey) -> Result<Option<CachedEntry>> {
    let name = self.name.clone();
    self
      .store
      .blocking(move |s| s.get_entry(&name, &key))
      .await
  }

  /// Persist one response. The response is consumed.
  pub async fn put(&self, request: &Request, response: Response) -> Result<()> {
    let key = RequestKey::for_request(request)?;
    self.put_all(vec![(key, response)]).await
  }

  /// Persist a batch atomically.
  pub async fn put_all(&self, entries: Vec<(RequestKey, Response)>) -> Result<()> {
    let name = self.name.clone();
    self
      .store
      .blocking(move |s| s.put_entries(&name, &entries))
      .await
  }
}

impl<S: CacheStorage> Clone for CacheHandle<S> {
  fn clone(&self) -> Self {
    Self {
      store: self.store.clone(),
      name: self.name.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::http::Headers;

  fn store() -> CacheStore<SqliteStorage> {
    CacheStore::new(SqliteStorage::in_memory().unwrap())
  }

  fn get(url: &str) -> Request {
    Request::parse("GET", url).unwrap()
  }

  #[tokio::test]
  async fn test_match_observes_completed_put() {
    let store = store();
    let handle = store.open(&Generation::runtime("shell", "v1")).await.unwrap();

    let request = get("https://app.test/data.json");
    assert!(handle.match_request(&request).await.unwrap().is_none());

    handle
      .put(&request, Response::new(200, Headers::new(), b"{}".to_vec()))
      .await
      .unwrap();

    let entry = handle.match_request(&request).await.unwrap().unwrap();
    assert_eq!(entry.response.body(), b"{}");
  }

  #[tokio::test]
  async fn test_put_rejects_post() {
    let store = store();
    let handle = store.open(&Generation::runtime("shell", "v1")).await.unwrap();
    let request = Request::parse("POST", "https://app.test/api/save").unwrap();

    let result = handle
      .put(&request, Response::new(200, Headers::new(), Vec::new()))
      .await;
    assert!(matches!(result, Err(Error::UnsupportedMethod(_))));
    assert!(handle.match_request(&request).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_open_registers_generation() {
    let store = store();
    store.open(&Generation::precache("shell", "v2")).await.unwrap();
    store.open(&Generation::runtime("shell", "v2")).await.unwrap();

    let names = store.generation_names().await.unwrap();
    assert!(names.contains("shell-v2"));
    assert!(names.contains("shell-runtime-v2"));

    assert!(store.delete("shell-v2").await.unwrap());
    assert!(!store.generation_names().await.unwrap().contains("shell-v2"));
  }

  #[tokio::test]
  async fn test_reading_deleted_generation_does_not_recreate_it() {
    let store = store();
    let generation = Generation::precache("shell", "v1");
    store
      .open(&generation)
      .await
      .unwrap()
      .put(&get("https://app.test/a.js"), Response::new(200, Headers::new(), b"a".to_vec()))
      .await
      .unwrap();
    assert!(store.delete("shell-v1").await.unwrap());

    let hit = store
      .handle(&generation)
      .match_request(&get("https://app.test/a.js"))
      .await
      .unwrap();
    assert!(hit.is_none());
    assert!(store.generation_names().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_concurrent_puts_to_distinct_keys() {
    let store = store();
    let handle = store.open(&Generation::runtime("shell", "v1")).await.unwrap();

    let writes = (0..16).map(|i| {
      let handle = handle.clone();
      async move {
        let request = get(&format!("https://app.test/item/{}", i));
        handle
          .put(&request, Response::new(200, Headers::new(), vec![i as u8]))
          .await
      }
    });
    for result in futures::future::join_all(writes).await {
      result.unwrap();
    }

    assert_eq!(store.entry_urls(handle.name()).await.unwrap().len(), 16);
  }
}
