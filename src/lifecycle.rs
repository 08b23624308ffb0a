//! Install / activate lifecycle of one interceptor version.
//!
//! ```text
//! Uninstalled -> Installing -> Installed (waiting) -> Activating -> Active
//!                    |                                                 |
//!                    +-> Redundant (install failed) <-- superseded ----+
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheStorage, CacheStore, Generation, RequestKey};
use crate::error::{Error, Result};
use crate::http::{FetchMode, Request};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Uninstalled,
  Installing,
  /// Installed and waiting for the previous version to release its clients
  Installed,
  Activating,
  Active,
  /// Install failed or a newer version took over; this version is discarded
  Redundant,
}

/// Identifier of an open client session (a tab or window of the host app).
pub type ClientId = u64;

/// Open client sessions and the version controlling each one.
#[derive(Debug, Default)]
pub struct Clients {
  sessions: Mutex<HashMap<ClientId, Option<String>>>,
}

impl Clients {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record a session that no version controls yet.
  pub fn open(&self, id: ClientId) {
    if let Ok(mut sessions) = self.sessions.lock() {
      sessions.insert(id, None);
    }
  }

  /// Record a session already controlled by `version`.
  pub fn open_controlled(&self, id: ClientId, version: &str) {
    if let Ok(mut sessions) = self.sessions.lock() {
      sessions.insert(id, Some(version.to_string()));
    }
  }

  pub fn close(&self, id: ClientId) {
    if let Ok(mut sessions) = self.sessions.lock() {
      sessions.remove(&id);
    }
  }

  pub fn controller(&self, id: ClientId) -> Option<String> {
    self
      .sessions
      .lock()
      .ok()
      .and_then(|sessions| sessions.get(&id).cloned().flatten())
  }

  /// Sessions held by some version other than `version`.
  pub fn held_by_others(&self, version: &str) -> usize {
    self.sessions.lock().map_or(0, |sessions| {
      sessions
        .values()
        .filter(|c| matches!(c, Some(v) if v != version))
        .count()
    })
  }

  /// Take control of every open session. Returns how many changed hands.
  pub fn claim(&self, version: &str) -> usize {
    let Ok(mut sessions) = self.sessions.lock() else {
      return 0;
    };
    let mut claimed = 0;
    for controller in sessions.values_mut() {
      if controller.as_deref() != Some(version) {
        *controller = Some(version.to_string());
        claimed += 1;
      }
    }
    claimed
  }
}

/// What an activation did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ActivationReport {
  /// Generation names removed from the store
  pub deleted: Vec<String>,
  /// Sessions newly placed under this version's control
  pub claimed: usize,
}

/// Drives install and activation for the current precache/runtime generations.
pub struct Lifecycle<S: CacheStorage, T: Transport> {
  store: CacheStore<S>,
  transport: Arc<T>,
  precache: Generation,
  runtime: Generation,
  manifest: Vec<Url>,
  clients: Arc<Clients>,
  state: Mutex<LifecycleState>,
  skip_waiting: AtomicBool,
  /// One activation at a time
  activation: tokio::sync::Mutex<()>,
}

impl<S: CacheStorage, T: Transport> Lifecycle<S, T> {
  pub fn new(
    store: CacheStore<S>,
    transport: Arc<T>,
    precache: Generation,
    runtime: Generation,
    manifest: Vec<Url>,
    clients: Arc<Clients>,
  ) -> Self {
    Self {
      store,
      transport,
      precache,
      runtime,
      manifest,
      clients,
      state: Mutex::new(LifecycleState::Uninstalled),
      skip_waiting: AtomicBool::new(false),
      activation: tokio::sync::Mutex::new(()),
    }
  }

  pub fn state(&self) -> LifecycleState {
    self
      .state
      .lock()
      .map_or(LifecycleState::Redundant, |state| *state)
  }

  fn set_state(&self, next: LifecycleState) {
    if let Ok(mut state) = self.state.lock() {
      debug!(from = ?*state, to = ?next, "lifecycle transition");
      *state = next;
    }
  }

  /// Version label used to mark controlled clients.
  pub fn version(&self) -> String {
    self.precache.name()
  }

  /// Fetch and store every manifest URL, all or nothing.
  ///
  /// Any failed or non-200 fetch fails the install and leaves this version
  /// redundant. On success the version asks to skip the waiting phase.
  pub async fn install(&self) -> Result<usize> {
    {
      let mut state = self
        .state
        .lock()
        .map_err(|_| Error::Lifecycle("state lock poisoned".to_string()))?;
      if *state != LifecycleState::Uninstalled {
        return Err(Error::Lifecycle(format!(
          "cannot install from state {:?}",
          *state
        )));
      }
      *state = LifecycleState::Installing;
    }
    info!(generation = %self.precache, assets = self.manifest.len(), "installing");

    match self.precache_manifest().await {
      Ok(count) => {
        self.set_state(LifecycleState::Installed);
        self.skip_waiting();
        info!(generation = %self.precache, assets = count, "precache complete");
        Ok(count)
      }
      Err(e) => {
        self.set_state(LifecycleState::Redundant);
        error!(generation = %self.precache, error = %e, "precache failed");
        Err(e)
      }
    }
  }

  async fn precache_manifest(&self) -> Result<usize> {
    let fetches = self.manifest.iter().map(|url| {
      let transport = Arc::clone(&self.transport);
      async move {
        let request = Request::get(url.clone());
        let response = transport
          .fetch(&request, FetchMode::Reload)
          .await
          .map_err(|e| Error::ManifestFetch {
            url: url.to_string(),
            reason: e.to_string(),
          })?;

        if !response.is_cacheable() {
          return Err(Error::ManifestFetch {
            url: url.to_string(),
            reason: format!("unexpected status {}", response.status()),
          });
        }
        Ok::<_, Error>((RequestKey::get(url), response))
      }
    });

    // Nothing is written unless every fetch succeeded
    let entries = futures::future::try_join_all(fetches).await?;
    let count = entries.len();

    let cache = self.store.open(&self.precache).await?;
    cache.put_all(entries).await?;
    Ok(count)
  }

  /// Pick up a version whose install completed in an earlier run.
  ///
  /// The precache generation must hold every manifest URL; anything less is
  /// treated as never installed.
  pub async fn resume(&self) -> Result<LifecycleState> {
    if self.state() != LifecycleState::Uninstalled {
      return Ok(self.state());
    }

    let name = self.precache.name();
    if !self.store.generation_names().await?.contains(&name) {
      return Ok(LifecycleState::Uninstalled);
    }

    let stored: HashSet<String> = self.store.entry_urls(&name).await?.into_iter().collect();
    let complete = self
      .manifest
      .iter()
      .all(|url| stored.contains(RequestKey::get(url).url().as_str()));

    if complete {
      info!(generation = %self.precache, "resuming installed version");
      self.set_state(LifecycleState::Installed);
    }
    Ok(self.state())
  }

  /// Ask to activate without waiting for older clients to close.
  pub fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  /// Whether an installed version may activate now.
  pub fn ready_to_activate(&self) -> bool {
    self.state() == LifecycleState::Installed
      && (self.skip_waiting.load(Ordering::SeqCst)
        || self.clients.held_by_others(&self.version()) == 0)
  }

  /// Delete stale generations, then claim every open client.
  pub async fn activate(&self) -> Result<ActivationReport> {
    let _guard = self.activation.lock().await;

    match self.state() {
      LifecycleState::Installed => {}
      LifecycleState::Active => return Ok(ActivationReport::default()),
      other => {
        return Err(Error::Lifecycle(format!(
          "cannot activate from state {:?}",
          other
        )))
      }
    }

    info!(generation = %self.precache, "activating");
    self.set_state(LifecycleState::Activating);

    let deleted = match self.collect_stale_generations().await {
      Ok(deleted) => deleted,
      Err(e) => {
        self.set_state(LifecycleState::Installed);
        return Err(e);
      }
    };

    let claimed = self.clients.claim(&self.version());
    info!(claimed, "claimed clients");

    self.set_state(LifecycleState::Active);
    Ok(ActivationReport { deleted, claimed })
  }

  /// Whether this version still controls its clients.
  ///
  /// A newer version's activation deletes this precache generation. Once that
  /// happens this version becomes redundant and stops intercepting.
  pub async fn in_control(&self) -> bool {
    if self.state() != LifecycleState::Active {
      return false;
    }

    match self.store.generation_names().await {
      Ok(names) if !names.contains(&self.precache.name()) => {
        info!(generation = %self.precache, "superseded by a newer version");
        self.set_state(LifecycleState::Redundant);
        false
      }
      Ok(_) => true,
      Err(e) => {
        warn!(generation = %self.precache, error = %e, "could not list generations");
        true
      }
    }
  }

  async fn collect_stale_generations(&self) -> Result<Vec<String>> {
    let keep = [self.precache.name(), self.runtime.name()];
    let mut deleted = Vec::new();

    for name in self.store.generation_names().await? {
      if keep.contains(&name) {
        continue;
      }
      info!(generation = %name, "deleting old cache");
      self.store.delete(&name).await?;
      deleted.push(name);
    }

    Ok(deleted)
  }
}
