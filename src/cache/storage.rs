//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;

use super::types::{CachedEntry, RequestKey};
use crate::error::{Error, Result};
use crate::http::{Headers, Response};

/// Trait for cache storage backends.
///
/// Every write is atomic: an entry is either fully present or fully absent.
pub trait CacheStorage: Send + Sync + 'static {
  /// Register a generation so it shows up in listings even while empty.
  fn open_generation(&self, name: &str) -> Result<()>;

  /// Look up one entry.
  fn get_entry(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedEntry>>;

  /// Write a batch of entries in a single transaction (last write wins per key).
  fn put_entries(&self, generation: &str, entries: &[(RequestKey, Response)]) -> Result<()>;

  /// Drop a generation and all of its entries. Returns whether it existed.
  fn delete_generation(&self, name: &str) -> Result<bool>;

  /// Names of every generation currently stored.
  fn generation_names(&self) -> Result<BTreeSet<String>>;

  /// URLs stored in a generation, in insertion order.
  fn entry_urls(&self, generation: &str) -> Result<Vec<String>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| Error::store("creating cache directory", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| Error::store(format!("opening {}", path.display()), e))?;

    Self::with_connection(conn)
  }

  /// Non-durable storage, used by tests and dry runs.
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory().map_err(|e| Error::store("opening memory db", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| Error::store("running migrations", e))
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::store("locking connection", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS entries (
    generation TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    seq INTEGER NOT NULL,
    PRIMARY KEY (generation, request_key)
);

CREATE INDEX IF NOT EXISTS idx_entries_generation ON entries(generation, seq);
"#;

impl CacheStorage for SqliteStorage {
  fn open_generation(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO generations (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| Error::store(format!("opening generation {}", name), e))?;
    Ok(())
  }

  fn get_entry(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM entries
         WHERE generation = ? AND request_key = ?",
        params![generation, key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| Error::store(format!("reading {} from {}", key.url(), generation), e))?;

    match row {
      Some((status, headers, body, cached_at)) => {
        let headers: Headers = serde_json::from_str(&headers)
          .map_err(|e| Error::store("decoding cached headers", e))?;
        Ok(Some(CachedEntry {
          response: Response::new(status, headers, body),
          cached_at: parse_datetime(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put_entries(&self, generation: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    let mut conn = self.lock()?;
    let context = format!("writing to {}", generation);

    let tx = conn
      .transaction()
      .map_err(|e| Error::store(&context, e))?;

    tx.execute(
      "INSERT OR IGNORE INTO generations (name) VALUES (?)",
      params![generation],
    )
    .map_err(|e| Error::store(&context, e))?;

    for (key, response) in entries {
      let headers =
        serde_json::to_string(response.headers()).map_err(|e| Error::store(&context, e))?;

      tx.execute(
        "INSERT OR REPLACE INTO entries
           (generation, request_key, url, status, headers, body, cached_at, seq)
         VALUES (?, ?, ?, ?, ?, ?, datetime('now'),
           (SELECT COALESCE(MAX(seq), 0) + 1 FROM entries WHERE generation = ?))",
        params![
          generation,
          key.cache_hash(),
          key.url().as_str(),
          response.status(),
          headers,
          response.body(),
          generation
        ],
      )
      .map_err(|e| Error::store(&context, e))?;
    }

    // Dropping an uncommitted transaction rolls it back
    tx.commit().map_err(|e| Error::store(&context, e))?;
    Ok(())
  }

  fn delete_generation(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let context = format!("deleting generation {}", name);

    let tx = conn
      .transaction()
      .map_err(|e| Error::store(&context, e))?;
    tx.execute("DELETE FROM entries WHERE generation = ?", params![name])
      .map_err(|e| Error::store(&context, e))?;
    let removed = tx
      .execute("DELETE FROM generations WHERE name = ?", params![name])
      .map_err(|e| Error::store(&context, e))?;
    tx.commit().map_err(|e| Error::store(&context, e))?;

    Ok(removed > 0)
  }

  fn generation_names(&self) -> Result<BTreeSet<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM generations")
      .map_err(|e| Error::store("listing generations", e))?;

    let names = stmt
      .query_map([], |row| row.get::<_, String>(0))
      .map_err(|e| Error::store("listing generations", e))?
      .collect::<rusqlite::Result<BTreeSet<String>>>()
      .map_err(|e| Error::store("listing generations", e))?;

    Ok(names)
  }

  fn entry_urls(&self, generation: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT url FROM entries WHERE generation = ? ORDER BY seq")
      .map_err(|e| Error::store("listing entries", e))?;

    let urls = stmt
      .query_map(params![generation], |row| row.get::<_, String>(0))
      .map_err(|e| Error::store("listing entries", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| Error::store("listing entries", e))?;

    Ok(urls)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| Error::store(format!("parsing timestamp '{}'", s), e))
}

/// Storage that reads normally but rejects every write, as a full disk would.
#[cfg(test)]
pub(crate) mod failing {
  use super::*;

  pub(crate) struct WriteFailingStorage {
    inner: SqliteStorage,
  }

  impl WriteFailingStorage {
    pub(crate) fn new() -> Self {
      Self {
        inner: SqliteStorage::in_memory().unwrap(),
      }
    }
  }

  impl CacheStorage for WriteFailingStorage {
    fn open_generation(&self, name: &str) -> Result<()> {
      self.inner.open_generation(name)
    }

    fn get_entry(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
      self.inner.get_entry(generation, key)
    }

    fn put_entries(&self, generation: &str, _entries: &[(RequestKey, Response)]) -> Result<()> {
      Err(Error::store(format!("writing to {}", generation), "quota exceeded"))
    }

    fn delete_generation(&self, name: &str) -> Result<bool> {
      self.inner.delete_generation(name)
    }

    fn generation_names(&self) -> Result<BTreeSet<String>> {
      self.inner.generation_names()
    }

    fn entry_urls(&self, generation: &str) -> Result<Vec<String>> {
      self.inner.entry_urls(generation)
    }
  }
}
