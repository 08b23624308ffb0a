//! Asset-first and data-first fetch policies.

use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheStorage, CacheStore, CachedEntry, Generation, RequestKey, Served, Source};
use crate::error::Result;
use crate::http::{FetchMode, Request, Response};
use crate::transport::Transport;

/// Runs the fetch policies against the two current generations.
pub struct StrategyEngine<S: CacheStorage, T: Transport> {
  store: CacheStore<S>,
  transport: Arc<T>,
  precache: Generation,
  runtime: Generation,
  /// Precached document substituted for HTML requests while offline
  offline_document: Url,
  pending_writes: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: CacheStorage, T: Transport> StrategyEngine<S, T> {
  pub fn new(
    store: CacheStore<S>,
    transport: Arc<T>,
    precache: Generation,
    runtime: Generation,
    offline_document: Url,
  ) -> Self {
    Self {
      store,
      transport,
      precache,
      runtime,
      offline_document,
      pending_writes: Mutex::new(Vec::new()),
    }
  }

  /// Serve from precache; otherwise network, then runtime cache, then the
  /// offline document for HTML requests.
  pub async fn cache_first(&self, request: &Request) -> Result<Served> {
    if let Some(entry) = self.lookup(&self.precache, request).await {
      debug!(url = %request.url(), "serving from precache");
      return Ok(Served::from_cache(entry.response, Source::Precache));
    }

    let error = match self.transport.fetch(request, FetchMode::Default).await {
      Ok(response) => {
        let response = self.persist_in_background(request, response);
        return Ok(Served::from_network(response));
      }
      Err(e) => e,
    };
    warn!(url = %request.url(), error = %error, "fetch failed");

    if let Some(entry) = self.lookup(&self.runtime, request).await {
      debug!(url = %request.url(), cached_at = %entry.cached_at, "serving from runtime cache");
      return Ok(Served::from_cache(entry.response, Source::Runtime));
    }

    if request.accepts_html() {
      let key = RequestKey::get(&self.offline_document);
      if let Some(entry) = self.lookup_key(&self.precache, key).await {
        debug!(url = %request.url(), "serving offline document");
        return Ok(Served::from_cache(entry.response, Source::OfflineDocument));
      }
      warn!(document = %self.offline_document, "offline document missing from precache");
    }

    Err(error)
  }

  /// Always try the network; fall back to the runtime cache only on failure.
  pub async fn network_first(&self, request: &Request) -> Result<Served> {
    let error = match self.transport.fetch(request, FetchMode::Default).await {
      Ok(response) => {
        let response = self.persist_in_background(request, response);
        return Ok(Served::from_network(response));
      }
      Err(e) => e,
    };
    warn!(url = %request.url(), error = %error, "network request failed");

    match self.lookup(&self.runtime, request).await {
      Some(entry) => {
        debug!(url = %request.url(), cached_at = %entry.cached_at, "serving from runtime cache");
        Ok(Served::from_cache(entry.response, Source::Runtime))
      }
      None => Err(error),
    }
  }

  /// Wait for every background cache write started so far.
  pub async fn settle(&self) {
    let handles: Vec<JoinHandle<()>> = match self.pending_writes.lock() {
      Ok(mut pending) => pending.drain(..).collect(),
      Err(_) => return,
    };
    for handle in handles {
      let _ = handle.await;
    }
  }

  /// Hand back the response, writing a copy to the runtime cache without
  /// making the caller wait. Non-200 responses are returned untouched.
  fn persist_in_background(&self, request: &Request, response: Response) -> Response {
    if !response.is_cacheable() {
      return response;
    }

    let key = match RequestKey::for_request(request) {
      Ok(key) => key,
      Err(_) => return response,
    };

    let (response, copy) = response.tee();
    let store = self.store.clone();
    let runtime = self.runtime.clone();

    let handle = tokio::spawn(async move {
      let url = key.url().to_string();
      let result: Result<()> = async {
        let cache = store.open(&runtime).await?;
        cache.put_all(vec![(key, copy)]).await
      }
      .await;

      // A failed write never affects the response already returned
      if let Err(e) = result {
        warn!(url = %url, error = %e, "failed to write runtime cache");
      }
    });

    if let Ok(mut pending) = self.pending_writes.lock() {
      pending.retain(|h| !h.is_finished());
      pending.push(handle);
    }

    response
  }

  async fn lookup(&self, generation: &Generation, request: &Request) -> Option<CachedEntry> {
    match RequestKey::for_request(request) {
      Ok(key) => self.lookup_key(generation, key).await,
      Err(_) => None,
    }
  }

  /// Read failures are logged and treated as a miss. Never registers the
  /// generation, so a read cannot bring back one deleted by an upgrade.
  async fn lookup_key(&self, generation: &Generation, key: RequestKey) -> Option<CachedEntry> {
    match self.store.handle(generation).match_key(key).await {
      Ok(entry) => entry,
      Err(e) => {
        warn!(generation = %generation, error = %e, "cache read failed");
        None
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{SqliteStorage, WriteFailingStorage};
  use crate::http::Headers;
  use crate::transport::mock::MockTransport;

  const ORIGIN: &str = "https://app.test/";

  struct Fixture {
    store: CacheStore<SqliteStorage>,
    transport: Arc<MockTransport>,
    engine: StrategyEngine<SqliteStorage, MockTransport>,
  }

  fn fixture() -> Fixture {
    let store = CacheStore::new(SqliteStorage::in_memory().unwrap());
    let transport = Arc::new(MockTransport::new());
    let engine = StrategyEngine::new(
      store.clone(),
      Arc::clone(&transport),
      Generation::precache("shell", "v1"),
      Generation::runtime("shell", "v1"),
      Url::parse(ORIGIN).unwrap().join("./index.html").unwrap(),
    );
    Fixture {
      store,
      transport,
      engine,
    }
  }

  fn url(path: &str) -> String {
    Url::parse(ORIGIN).unwrap().join(path).unwrap().to_string()
  }

  fn get(path: &str) -> Request {
    Request::parse("GET", &url(path)).unwrap()
  }

  async fn precache(fx: &Fixture, path: &str, body: &str) {
    let cache = fx.store.open(&Generation::precache("shell", "v1")).await.unwrap();
    cache
      .put(&get(path), Response::new(200, Headers::new(), body.as_bytes().to_vec()))
      .await
      .unwrap();
  }

  async fn runtime_body(fx: &Fixture, path: &str) -> Option<Vec<u8>> {
    let cache = fx.store.open(&Generation::runtime("shell", "v1")).await.unwrap();
    cache
      .match_request(&get(path))
      .await
      .unwrap()
      .map(|e| e.response.into_body())
  }

  #[tokio::test]
  async fn test_cache_first_precache_hit_skips_network() {
    let fx = fixture();
    precache(&fx, "/main.js", "console.log(1)").await;
    fx.transport.respond(&url("/main.js"), 200, "newer");

    let served = fx.engine.cache_first(&get("/main.js")).await.unwrap();

    assert_eq!(served.source, Source::Precache);
    assert_eq!(served.response.body(), b"console.log(1)");
    assert!(fx.transport.calls().is_empty());
  }

  #[tokio::test]
  async fn test_cache_first_miss_persists_to_runtime() {
    let fx = fixture();
    fx.transport.respond(&url("/logo.png"), 200, "png");

    let served = fx.engine.cache_first(&get("/logo.png")).await.unwrap();
    assert_eq!(served.source, Source::Network);
    assert_eq!(served.response.body(), b"png");

    fx.engine.settle().await;
    assert_eq!(runtime_body(&fx, "/logo.png").await, Some(b"png".to_vec()));

    // Later outage is answered from the runtime cache
    fx.transport.go_offline();
    let served = fx.engine.cache_first(&get("/logo.png")).await.unwrap();
    assert_eq!(served.source, Source::Runtime);
    assert_eq!(served.response.body(), b"png");
  }

  #[tokio::test]
  async fn test_cache_first_does_not_persist_errors() {
    let fx = fixture();
    fx.transport.respond(&url("/missing.js"), 404, "not found");

    let served = fx.engine.cache_first(&get("/missing.js")).await.unwrap();
    assert_eq!(served.response.status(), 404);

    fx.engine.settle().await;
    assert_eq!(runtime_body(&fx, "/missing.js").await, None);
  }

  #[tokio::test]
  async fn test_cache_first_offline_document_for_html() {
    let fx = fixture();
    precache(&fx, "./index.html", "<html>shell</html>").await;

    let request = get("/settings").with_header("Accept", "text/html,*/*;q=0.8");
    let served = fx.engine.cache_first(&request).await.unwrap();

    assert_eq!(served.source, Source::OfflineDocument);
    assert_eq!(served.response.body(), b"<html>shell</html>");
  }

  #[tokio::test]
  async fn test_cache_first_propagates_failure_for_non_html() {
    let fx = fixture();
    precache(&fx, "./index.html", "<html>shell</html>").await;

    let with_accept = get("/data.bin").with_header("Accept", "application/octet-stream");
    assert!(fx.engine.cache_first(&with_accept).await.unwrap_err().is_network());

    // No Accept header at all counts as not HTML
    assert!(fx.engine.cache_first(&get("/data.bin")).await.unwrap_err().is_network());
  }

  #[tokio::test]
  async fn test_cache_first_propagates_when_offline_document_missing() {
    let fx = fixture();
    let request = get("/settings").with_header("Accept", "text/html");
    assert!(fx.engine.cache_first(&request).await.unwrap_err().is_network());
  }

  #[tokio::test]
  async fn test_network_first_prefers_network_over_cache() {
    let fx = fixture();
    fx.transport.respond(&url("/api/readings"), 200, "v1");
    fx.engine.network_first(&get("/api/readings")).await.unwrap();
    fx.engine.settle().await;

    fx.transport.respond(&url("/api/readings"), 200, "v2");
    let served = fx.engine.network_first(&get("/api/readings")).await.unwrap();

    assert_eq!(served.source, Source::Network);
    assert_eq!(served.response.body(), b"v2");
    assert_eq!(fx.transport.call_count(&url("/api/readings")), 2);

    fx.engine.settle().await;
    assert_eq!(runtime_body(&fx, "/api/readings").await, Some(b"v2".to_vec()));
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_runtime() {
    let fx = fixture();
    fx.transport.respond(&url("/api/readings"), 200, "cached");
    fx.engine.network_first(&get("/api/readings")).await.unwrap();
    fx.engine.settle().await;

    fx.transport.go_offline();
    let served = fx.engine.network_first(&get("/api/readings")).await.unwrap();
    assert_eq!(served.source, Source::Runtime);
    assert_eq!(served.response.body(), b"cached");
  }

  #[tokio::test]
  async fn test_network_first_ignores_precache_and_offline_document() {
    let fx = fixture();
    precache(&fx, "./index.html", "<html>shell</html>").await;
    precache(&fx, "/api/readings", "precached").await;

    let request = get("/api/readings").with_header("Accept", "text/html");
    assert!(fx.engine.network_first(&request).await.unwrap_err().is_network());
  }

  #[tokio::test]
  async fn test_network_first_returns_server_errors_as_is() {
    let fx = fixture();
    fx.transport.respond(&url("/api/readings"), 200, "good");
    fx.engine.network_first(&get("/api/readings")).await.unwrap();
    fx.engine.settle().await;

    fx.transport.respond(&url("/api/readings"), 503, "busy");
    let served = fx.engine.network_first(&get("/api/readings")).await.unwrap();
    assert_eq!(served.response.status(), 503);

    fx.engine.settle().await;
    assert_eq!(runtime_body(&fx, "/api/readings").await, Some(b"good".to_vec()));
  }

  #[tokio::test]
  async fn test_repeated_request_is_idempotent() {
    let fx = fixture();
    fx.transport.respond(&url("/font.woff2"), 200, "font");

    fx.engine.cache_first(&get("/font.woff2")).await.unwrap();
    fx.engine.settle().await;
    let once = fx.store.entry_urls("shell-runtime-v1").await.unwrap();

    fx.engine.cache_first(&get("/font.woff2")).await.unwrap();
    fx.engine.settle().await;
    let twice = fx.store.entry_urls("shell-runtime-v1").await.unwrap();

    assert_eq!(once, twice);
    assert_eq!(runtime_body(&fx, "/font.woff2").await, Some(b"font".to_vec()));
  }

  fn write_failing_engine() -> (
    StrategyEngine<WriteFailingStorage, MockTransport>,
    CacheStore<WriteFailingStorage>,
    Arc<MockTransport>,
  ) {
    let store = CacheStore::new(WriteFailingStorage::new());
    let transport = Arc::new(MockTransport::new());
    let engine = StrategyEngine::new(
      store.clone(),
      Arc::clone(&transport),
      Generation::precache("shell", "v1"),
      Generation::runtime("shell", "v1"),
      Url::parse(ORIGIN).unwrap().join("./index.html").unwrap(),
    );
    (engine, store, transport)
  }

  #[tokio::test]
  async fn test_cache_first_write_failure_keeps_response() {
    let (engine, store, transport) = write_failing_engine();
    transport.respond(&url("/logo.png"), 200, "png");

    let served = engine.cache_first(&get("/logo.png")).await.unwrap();
    assert_eq!(served.source, Source::Network);
    assert_eq!(served.response.status(), 200);
    assert_eq!(served.response.body(), b"png");

    engine.settle().await;
    assert!(store.entry_urls("shell-runtime-v1").await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_network_first_write_failure_keeps_response() {
    let (engine, store, transport) = write_failing_engine();
    transport.respond(&url("/api/readings"), 200, "[1]");

    let served = engine.network_first(&get("/api/readings")).await.unwrap();
    assert_eq!(served.source, Source::Network);
    assert_eq!(served.response.body(), b"[1]");

    engine.settle().await;
    assert!(store.entry_urls("shell-runtime-v1").await.unwrap().is_empty());

    // Nothing was stored, so an outage has no fallback
    transport.go_offline();
    assert!(engine
      .network_first(&get("/api/readings"))
      .await
      .unwrap_err()
      .is_network());
  }
}

