//! Out-of-band commands from the hosting application.

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, CacheStore, Generation, RequestKey};
use crate::http::{FetchMode, Request};
use crate::transport::Transport;

/// A command posted by the host app.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Activate a waiting version without waiting for old clients to close
  #[serde(alias = "SKIP_WAITING")]
  ForceActivate,
  /// Fetch the given URLs into the runtime cache
  CacheUrls {
    #[serde(default, deserialize_with = "deserialize_url_list")]
    urls: Vec<String>,
  },
  /// Any other type; ignored
  #[serde(other)]
  Unknown,
}

/// `null` reads as an empty list; entries that are not strings are skipped.
fn deserialize_url_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: Deserializer<'de>,
{
  let v: Option<Vec<Value>> = Option::deserialize(deserializer)?;
  Ok(
    v.unwrap_or_default()
      .into_iter()
      .filter_map(|entry| match entry {
        Value::String(url) => Some(url),
        other => {
          warn!(entry = %other, "skipping non-string url in CACHE_URLS");
          None
        }
      })
      .collect(),
  )
}

impl ControlMessage {
  /// Parse a posted JSON payload. Payloads that are not a typed object are dropped.
  pub fn from_json(payload: &Value) -> Option<Self> {
    match serde_json::from_value::<ControlMessage>(payload.clone()) {
      Ok(ControlMessage::Unknown) => {
        debug!(payload = %payload, "ignoring unknown message type");
        None
      }
      Ok(message) => Some(message),
      Err(e) => {
        debug!(payload = %payload, error = %e, "ignoring malformed message");
        None
      }
    }
  }
}

/// Sending half, held by the host app.
#[derive(Clone)]
pub struct ControlSender {
  tx: mpsc::UnboundedSender<ControlMessage>,
}

impl ControlSender {
  /// Queue a message. Returns false once the inbox is gone.
  pub fn send(&self, message: ControlMessage) -> bool {
    self.tx.send(message).is_ok()
  }

  /// Parse and queue a JSON payload; unrecognized payloads are silently dropped.
  pub fn post(&self, payload: &Value) -> bool {
    match ControlMessage::from_json(payload) {
      Some(message) => self.send(message),
      None => false,
    }
  }
}

/// Receiving half, drained by the interceptor in delivery order.
pub struct ControlInbox {
  rx: mpsc::UnboundedReceiver<ControlMessage>,
}

impl ControlInbox {
  /// Receive the next message
  pub async fn next(&mut self) -> Option<ControlMessage> {
    self.rx.recv().await
  }
}

/// Create a connected sender/inbox pair.
pub fn channel() -> (ControlSender, ControlInbox) {
  let (tx, rx) = mpsc::unbounded_channel();
  (ControlSender { tx }, ControlInbox { rx })
}

/// Outcome of a CACHE_URLS request.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BulkCacheReport {
  pub cached: Vec<String>,
  /// URL and reason for every entry that could not be cached
  pub failed: Vec<(String, String)>,
}

/// Best-effort bulk fetch into the runtime generation.
///
/// Every URL is attempted; reachable 200 responses are stored, everything
/// else is logged and reported but never raised.
pub async fn cache_urls<S: CacheStorage, T: Transport>(
  store: &CacheStore<S>,
  transport: &Arc<T>,
  runtime: &Generation,
  origin: &Url,
  urls: &[String],
) -> BulkCacheReport {
  let mut report = BulkCacheReport::default();

  let fetches = urls.iter().map(|raw| {
    let transport = Arc::clone(transport);
    async move {
      let url = origin.join(raw).map_err(|e| e.to_string())?;
      let response = transport
        .fetch(&Request::get(url.clone()), FetchMode::Default)
        .await
        .map_err(|e| e.to_string())?;
      if !response.is_cacheable() {
        return Err(format!("unexpected status {}", response.status()));
      }
      Ok::<_, String>((RequestKey::get(&url), response))
    }
  });

  let mut entries = Vec::new();
  for (raw, result) in urls.iter().zip(futures::future::join_all(fetches).await) {
    match result {
      Ok(entry) => {
        report.cached.push(entry.0.url().to_string());
        entries.push(entry);
      }
      Err(reason) => {
        warn!(url = %raw, reason = %reason, "could not cache url");
        report.failed.push((raw.clone(), reason));
      }
    }
  }

  if entries.is_empty() {
    return report;
  }

  let written: crate::error::Result<()> = async {
    let cache = store.open(runtime).await?;
    cache.put_all(entries).await
  }
  .await;

  match written {
    Ok(()) => info!(count = report.cached.len(), "cached urls on request"),
    Err(e) => {
      warn!(error = %e, "bulk cache write failed");
      let reason = e.to_string();
      report.failed.extend(
        report
          .cached
          .drain(..)
          .map(|url| (url, reason.clone())),
      );
    }
  }

  report
}
