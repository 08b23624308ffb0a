//! Event dispatcher tying the lifecycle, router, strategies and control channel together.

use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, CacheStore, Generation, Served};
use crate::config::Config;
use crate::control::{self, BulkCacheReport, ControlInbox, ControlMessage};
use crate::error::Result;
use crate::http::Request;
use crate::lifecycle::{ActivationReport, Clients, Lifecycle, LifecycleState};
use crate::router::{Router, Strategy};
use crate::strategy::StrategyEngine;
use crate::transport::Transport;

/// Everything the host environment can deliver to the interceptor.
#[derive(Debug)]
pub enum Event {
  Install,
  Activate,
  Fetch(Request),
  Message(ControlMessage),
}

/// Result of handling one event.
#[derive(Debug)]
pub enum Outcome {
  Installed { assets: usize },
  Activated(ActivationReport),
  /// Not intercepted; the host performs the request natively
  Passthrough,
  Served(Served),
  Cached(BulkCacheReport),
  /// Message had no effect (e.g. FORCE_ACTIVATE with nothing waiting)
  Ignored,
}

/// One interceptor version with its injected store and transport.
pub struct Interceptor<S: CacheStorage, T: Transport> {
  store: CacheStore<S>,
  transport: Arc<T>,
  origin: Url,
  runtime: Generation,
  router: Router,
  strategies: StrategyEngine<S, T>,
  lifecycle: Lifecycle<S, T>,
  clients: Arc<Clients>,
}

impl<S: CacheStorage, T: Transport> Interceptor<S, T> {
  pub fn new(config: &Config, store: CacheStore<S>, transport: Arc<T>) -> Result<Self> {
    let precache = config.precache_generation();
    let runtime = config.runtime_generation();
    let clients = Arc::new(Clients::new());

    let strategies = StrategyEngine::new(
      store.clone(),
      Arc::clone(&transport),
      precache.clone(),
      runtime.clone(),
      config.offline_document_url()?,
    );
    let lifecycle = Lifecycle::new(
      store.clone(),
      Arc::clone(&transport),
      precache,
      runtime.clone(),
      config.manifest()?,
      Arc::clone(&clients),
    );

    Ok(Self {
      store,
      transport,
      origin: config.origin.clone(),
      runtime,
      router: Router::new(config.api_marker.clone()),
      strategies,
      lifecycle,
      clients,
    })
  }

  pub fn store(&self) -> &CacheStore<S> {
    &self.store
  }

  pub fn lifecycle(&self) -> &Lifecycle<S, T> {
    &self.lifecycle
  }

  pub fn clients(&self) -> &Arc<Clients> {
    &self.clients
  }

  pub async fn dispatch(&self, event: Event) -> Result<Outcome> {
    match event {
      Event::Install => self.on_install().await,
      Event::Activate => self.on_activate().await,
      Event::Fetch(request) => self.on_fetch(&request).await,
      Event::Message(message) => Ok(self.on_message(message).await),
    }
  }

  async fn on_install(&self) -> Result<Outcome> {
    let assets = self.lifecycle.install().await?;
    Ok(Outcome::Installed { assets })
  }

  async fn on_activate(&self) -> Result<Outcome> {
    let report = self.lifecycle.activate().await?;
    Ok(Outcome::Activated(report))
  }

  async fn on_fetch(&self, request: &Request) -> Result<Outcome> {
    // Requests are only intercepted while this version controls the page
    if !self.lifecycle.in_control().await {
      return Ok(Outcome::Passthrough);
    }

    let served = match self.router.route(request) {
      None => {
        debug!(method = %request.method(), url = %request.url(), "passthrough");
        return Ok(Outcome::Passthrough);
      }
      Some(Strategy::CacheFirst) => self.strategies.cache_first(request).await?,
      Some(Strategy::NetworkFirst) => self.strategies.network_first(request).await?,
    };
    Ok(Outcome::Served(served))
  }

  /// Messages never fail back to the sender; problems are logged.
  async fn on_message(&self, message: ControlMessage) -> Outcome {
    match message {
      ControlMessage::ForceActivate => {
        self.lifecycle.skip_waiting();
        if self.lifecycle.state() != LifecycleState::Installed {
          debug!(state = ?self.lifecycle.state(), "nothing waiting to activate");
          return Outcome::Ignored;
        }
        match self.lifecycle.activate().await {
          Ok(report) => Outcome::Activated(report),
          Err(e) => {
            warn!(error = %e, "forced activation failed");
            Outcome::Ignored
          }
        }
      }
      ControlMessage::CacheUrls { urls } => {
        let report = control::cache_urls(
          &self.store,
          &self.transport,
          &self.runtime,
          &self.origin,
          &urls,
        )
        .await;
        Outcome::Cached(report)
      }
      ControlMessage::Unknown => Outcome::Ignored,
    }
  }

  /// Drain the control inbox until every sender is dropped.
  pub async fn serve_messages(&self, mut inbox: ControlInbox) {
    while let Some(message) = inbox.next().await {
      debug!(message = ?message, "control message");
      let _ = self.on_message(message).await;
    }
  }

  /// Bring this version up: reuse a finished install from an earlier run or
  /// install now, then activate if nothing holds it back.
  pub async fn start(&self) -> Result<LifecycleState> {
    if self.lifecycle.resume().await? == LifecycleState::Uninstalled {
      self.lifecycle.install().await?;
    }

    if self.lifecycle.ready_to_activate() {
      self.lifecycle.activate().await?;
    } else {
      info!("installed, waiting for older clients to close");
    }
    Ok(self.lifecycle.state())
  }

  /// Wait for background cache writes to land.
  pub async fn settle(&self) {
    self.strategies.settle().await;
  }
}
