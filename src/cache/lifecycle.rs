//! Provisioning, activation and retirement of cache generations.

use futures::future::join_all;
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use url::Url;

use super::classify::Classifier;
use super::layer::TierManager;
use super::storage::CacheStorage;
use super::tiers::{Generation, Tier};
use crate::error::{LifecycleError, StoreError};
use crate::net::{Fetch, Request, RequestMode, Response};

/// Build-time list of what gets cached at install.
///
/// Any change to this list must come with a new cache version so the next
/// start provisions a fresh generation.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
  /// Critical assets; failing to cache any of them fails installation
  pub static_assets: Vec<String>,
  /// Application routes, pre-warmed best-effort
  pub pages: Vec<String>,
  /// Allow-listed third-party resources, pre-warmed best-effort
  pub external_assets: Vec<String>,
}

impl Default for Manifest {
  fn default() -> Self {
    let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
    Self {
      static_assets: owned(&[
        "/static/style.css",
        "/static/main.js",
        "/static/offline-manager.js",
        "/static/manifest.json",
        "/static/logo.png",
        "/static/splash.png",
      ]),
      pages: owned(&[
        "/",
        "/farmer",
        "/buyer",
        "/market",
        "/location",
        "/logistics",
        "/districts",
        "/technicians",
        "/knowledge",
        "/settings",
        "/qr-scanner",
        "/precautions",
        "/login",
        "/signup",
      ]),
      external_assets: owned(&[
        "https://fonts.googleapis.com/css2?family=Inter:wght@400;500;600;700;800&display=swap",
        "https://cdnjs.cloudflare.com/ajax/libs/qrcodejs/1.0.0/qrcode.min.js",
        "https://unpkg.com/html5-qrcode@2.3.8/html5-qrcode.min.js",
      ]),
    }
  }
}

/// Lifecycle of the generation this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
  /// Created, critical assets not yet cached
  Provisioning,
  /// Installed and pre-warmed, not yet serving
  Warm,
  /// Serving intercepted requests
  Active,
  /// A newer generation has taken over and purged this one
  Superseded,
}

impl GenerationState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Provisioning => "provisioning",
      Self::Warm => "warm",
      Self::Active => "active",
      Self::Superseded => "superseded",
    }
  }
}

/// What an install run managed to cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
  pub static_cached: usize,
  pub pages_cached: usize,
  pub pages_total: usize,
  pub external_cached: usize,
  pub external_total: usize,
}

/// One-shot commands from the foreground context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
  /// Fetch these routes and store them in the pages tier
  CachePages(Vec<String>),
  /// Activate immediately instead of waiting
  SkipWaiting,
}

/// Provisions the current generation and retires stale ones.
pub struct CacheLifecycle<S: CacheStorage> {
  storage: Arc<S>,
  fetcher: Arc<dyn Fetch>,
  generation: Generation,
  origin: Url,
  manifest: Manifest,
  state: Mutex<GenerationState>,
}

impl<S: CacheStorage + 'static> CacheLifecycle<S> {
  pub fn new(
    storage: Arc<S>,
    fetcher: Arc<dyn Fetch>,
    generation: Generation,
    origin: Url,
    manifest: Manifest,
  ) -> Self {
    Self {
      storage,
      fetcher,
      generation,
      origin,
      manifest,
      state: Mutex::new(GenerationState::Provisioning),
    }
  }

  pub fn state(&self) -> GenerationState {
    self
      .state
      .lock()
      .map(|s| *s)
      .unwrap_or(GenerationState::Superseded)
  }

  fn set_state(&self, next: GenerationState) {
    if let Ok(mut state) = self.state.lock() {
      *state = next;
    }
  }

  /// Cache the manifest into the current generation.
  ///
  /// Every static asset must be fetched successfully, and they are written in
  /// one batch, otherwise nothing is written and `InstallationFailure` is
  /// returned. Pages and external assets are best-effort. Entries are replaced
  /// by key, so re-running install never duplicates them.
  pub async fn install(&self) -> Result<InstallReport, LifecycleError> {
    let state = self.state();
    if state == GenerationState::Superseded {
      return Err(LifecycleError::InvalidTransition {
        action: "install",
        state: state.as_str(),
      });
    }
    info!(generation = %self.generation, "installing, pre-caching resources for offline use");

    let static_tag = self.generation.tag(Tier::Static);
    self.storage.open_tier(&static_tag)?;

    let static_requests = self
      .manifest
      .static_assets
      .iter()
      .map(|path| {
        self
          .resolve(path)
          .map(Request::get)
          .map_err(|e| self.install_failure(format!("bad manifest entry {}: {}", path, e)))
      })
      .collect::<Result<Vec<_>, _>>()?;
    let results = join_all(
      static_requests
        .iter()
        .map(|req| self.fetcher.fetch(req.clone())),
    )
    .await;

    let mut entries = Vec::with_capacity(results.len());
    for (request, result) in static_requests.iter().zip(results) {
      match result {
        Ok(response) if response.is_ok() => entries.push((request.identity(), response)),
        Ok(response) => {
          return Err(self.install_failure(format!(
            "{} answered with status {}",
            request.url, response.status
          )))
        }
        Err(e) => return Err(self.install_failure(e.to_string())),
      }
    }
    self
      .storage
      .store_all(&static_tag, &entries)
      .map_err(|e| self.install_failure(e.to_string()))?;
    info!(count = entries.len(), "static assets cached");

    let pages_tag = self.generation.tag(Tier::Pages);
    self.storage.open_tier(&pages_tag)?;
    let pages_cached = self.warm(&pages_tag, &self.manifest.pages, RequestMode::SameOrigin).await;
    info!(
      cached = pages_cached,
      total = self.manifest.pages.len(),
      "pages cached"
    );

    let external_cached = self
      .warm(&static_tag, &self.manifest.external_assets, RequestMode::Cors)
      .await;
    info!(
      cached = external_cached,
      total = self.manifest.external_assets.len(),
      "external assets cached"
    );

    if state == GenerationState::Provisioning {
      self.set_state(GenerationState::Warm);
    }
    info!(generation = %self.generation, "installation complete");

    Ok(InstallReport {
      static_cached: entries.len(),
      pages_cached,
      pages_total: self.manifest.pages.len(),
      external_cached,
      external_total: self.manifest.external_assets.len(),
    })
  }

  /// Pick up a generation installed by an earlier process.
  ///
  /// Moves from `Provisioning` to `Warm` when every static asset is already
  /// stored under this generation, without touching the network.
  pub fn resume(&self) -> Result<bool, LifecycleError> {
    match self.state() {
      GenerationState::Warm | GenerationState::Active => return Ok(true),
      GenerationState::Superseded => return Ok(false),
      GenerationState::Provisioning => {}
    }

    let tag = self.generation.tag(Tier::Static);
    if !self.storage.tier_names()?.contains(&tag)
      || self.storage.entry_count(&tag)? < self.manifest.static_assets.len()
    {
      return Ok(false);
    }
    for path in &self.manifest.static_assets {
      let Ok(url) = self.resolve(path) else {
        return Ok(false);
      };
      if self.storage.lookup(&tag, &Request::get(url).identity())?.is_none() {
        return Ok(false);
      }
    }

    self.set_state(GenerationState::Warm);
    info!(generation = %self.generation, "resumed installed generation");
    Ok(true)
  }

  /// Delete every tier that does not belong to the current generation and start
  /// serving. Returns the deleted tags.
  pub fn activate(&self) -> Result<Vec<String>, LifecycleError> {
    let state = self.state();
    if !matches!(state, GenerationState::Warm | GenerationState::Active) {
      return Err(LifecycleError::InvalidTransition {
        action: "activate",
        state: state.as_str(),
      });
    }

    let mut purged = Vec::new();
    for tag in self.storage.tier_names()? {
      if !self.generation.owns(&tag) {
        info!(tier = %tag, "deleting old cache");
        self.storage.delete_tier(&tag)?;
        purged.push(tag);
      }
    }
    for tier in Tier::ALL {
      self.storage.open_tier(&self.generation.tag(tier))?;
    }

    self.set_state(GenerationState::Active);
    info!(generation = %self.generation, purged = purged.len(), "activated");
    Ok(purged)
  }

  /// Notice whether a newer generation has purged ours.
  pub fn refresh_state(&self) -> Result<GenerationState, StoreError> {
    if self.state() == GenerationState::Active {
      let names = self.storage.tier_names()?;
      if !names.iter().any(|tag| self.generation.owns(tag)) {
        warn!(generation = %self.generation, "superseded by a newer generation");
        self.set_state(GenerationState::Superseded);
      }
    }
    Ok(self.state())
  }

  /// A tier manager for this generation. Only available once active.
  pub fn tier_manager(&self, classifier: Classifier) -> Result<TierManager<S>, LifecycleError> {
    let state = self.state();
    if state != GenerationState::Active {
      return Err(LifecycleError::InvalidTransition {
        action: "intercept requests",
        state: state.as_str(),
      });
    }
    Ok(TierManager::new(
      Arc::clone(&self.storage),
      Arc::clone(&self.fetcher),
      self.generation.clone(),
      classifier,
    ))
  }

  /// Fetch `routes` into the pages tier, tolerating individual failures.
  pub async fn recache_pages(&self, routes: &[String]) -> usize {
    let tag = self.generation.tag(Tier::Pages);
    self.warm(&tag, routes, RequestMode::SameOrigin).await
  }

  /// Apply a control command.
  pub async fn handle_control(&self, message: ControlMessage) {
    match message {
      ControlMessage::CachePages(routes) => {
        let cached = self.recache_pages(&routes).await;
        info!(cached, total = routes.len(), "pages re-cached on request");
      }
      ControlMessage::SkipWaiting => {
        if self.state() == GenerationState::Warm {
          if let Err(e) = self.activate() {
            error!(error = %e, "takeover failed");
          }
        }
      }
    }
  }

  /// Spawn a task consuming control commands; the returned sender is the
  /// fire-and-forget control channel.
  pub fn spawn_control(self: &Arc<Self>) -> mpsc::UnboundedSender<ControlMessage> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let lifecycle = Arc::clone(self);
    tokio::spawn(async move {
      while let Some(message) = rx.recv().await {
        lifecycle.handle_control(message).await;
      }
    });
    tx
  }

  async fn warm(&self, tag: &str, paths: &[String], mode: RequestMode) -> usize {
    let fetches = paths.iter().map(|path| async move {
      let url = match self.resolve(path) {
        Ok(url) => url,
        Err(e) => {
          warn!(%path, error = %e, "could not resolve");
          return false;
        }
      };
      let request = Request::get(url).with_mode(mode);
      match self.fetcher.fetch(request.clone()).await {
        Ok(response) if response.is_ok() => self.keep(tag, &request, &response),
        Ok(response) => {
          warn!(url = %request.url, status = response.status, "could not cache");
          false
        }
        Err(e) => {
          warn!(url = %request.url, error = %e, "could not cache");
          false
        }
      }
    });

    join_all(fetches).await.into_iter().filter(|ok| *ok).count()
  }

  fn keep(&self, tag: &str, request: &Request, response: &Response) -> bool {
    match self.storage.store(tag, &request.identity(), response) {
      Ok(()) => true,
      Err(e) => {
        warn!(tier = %tag, url = %request.url, error = %e, "cache write failed");
        false
      }
    }
  }

  fn resolve(&self, path: &str) -> Result<Url, url::ParseError> {
    self.origin.join(path)
  }

  fn install_failure(&self, reason: String) -> LifecycleError {
    error!(generation = %self.generation, %reason, "installation failed");
    LifecycleError::InstallationFailure {
      generation: self.generation.to_string(),
      reason,
    }
  }
}
