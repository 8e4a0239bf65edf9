//! Cache tier manager: per-request strategy selection and execution.

use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::classify::{Classifier, ResourceClass};
use super::offline;
use super::storage::CacheStorage;
use super::tiers::{Generation, Tier};
use crate::net::{Fetch, Request, RequestMode, Response};

/// Intercepts requests for the active generation and applies the strategy of
/// their resource class.
///
/// The request path never fails: storage and network errors become cached
/// fallbacks or synthesized offline responses. Cache writes run as detached
/// tasks and are attempted once.
pub struct TierManager<S: CacheStorage> {
  storage: Arc<S>,
  fetcher: Arc<dyn Fetch>,
  generation: Generation,
  classifier: Classifier,
  background: TaskTracker,
}

impl<S: CacheStorage + 'static> TierManager<S> {
  pub fn new(
    storage: Arc<S>,
    fetcher: Arc<dyn Fetch>,
    generation: Generation,
    classifier: Classifier,
  ) -> Self {
    Self {
      storage,
      fetcher,
      generation,
      classifier,
      background: TaskTracker::new(),
    }
  }

  /// Handle an outbound request.
  ///
  /// Returns `None` when the request is not intercepted (non-GET, or a
  /// cross-origin host outside the allow-list); the caller sends it as is.
  pub async fn handle(&self, request: Request) -> Option<Response> {
    let class = self.classifier.classify(&request)?;
    debug!(url = %request.url, ?class, "intercepted");

    let response = match class {
      ResourceClass::Static => self.cache_first(request).await,
      ResourceClass::Page => self.cache_first_with_refresh(request).await,
      ResourceClass::Dynamic => self.network_first(request).await,
      ResourceClass::External => self.cache_first_external(request).await,
    };
    Some(response)
  }

  /// Wait until every background cache write and refresh has finished.
  pub async fn settle(&self) {
    self.background.close();
    self.background.wait().await;
    self.background.reopen();
  }

  /// Static assets: serve from the static tier, otherwise fetch and keep a copy.
  async fn cache_first(&self, request: Request) -> Response {
    let tag = self.generation.tag(Tier::Static);
    if let Some(hit) = self.lookup(&tag, &request) {
      return hit;
    }

    match self.fetcher.fetch(request.clone()).await {
      Ok(response) => {
        if response.is_ok() {
          self.store_in_background(tag, &request, &response);
        }
        response
      }
      Err(e) => {
        debug!(error = %e, "static fetch failed");
        // A concurrent request may have filled the tier meanwhile.
        self
          .lookup(&tag, &request)
          .unwrap_or_else(offline::offline_error)
      }
    }
  }

  /// HTML pages: answer from the pages tier right away and refresh the entry
  /// in the background. Without an entry, wait for the network.
  async fn cache_first_with_refresh(&self, request: Request) -> Response {
    let tag = self.generation.tag(Tier::Pages);

    if let Some(hit) = self.lookup(&tag, &request) {
      let storage = Arc::clone(&self.storage);
      let refresh = self.fetcher.fetch(request.clone());
      let identity = request.identity();
      self.background.spawn(async move {
        match refresh.await {
          Ok(response) if response.is_ok() => {
            if let Err(e) = storage.store(&tag, &identity, &response) {
              warn!(tier = %tag, %identity, error = %e, "background page update not stored");
            }
          }
          Ok(response) => debug!(%identity, status = response.status, "background page update skipped"),
          Err(e) => debug!(%identity, error = %e, "background page update failed"),
        }
      });
      return hit;
    }

    match self.fetcher.fetch(request.clone()).await {
      Ok(response) => {
        if response.is_ok() {
          self.store_in_background(tag, &request, &response);
        }
        response
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "network failed, page not cached");
        offline::offline_page()
      }
    }
  }

  /// Dynamic content: network first, then the runtime tier, then any tier.
  async fn network_first(&self, request: Request) -> Response {
    let runtime = self.generation.tag(Tier::Runtime);

    match self.fetcher.fetch(request.clone()).await {
      Ok(response) => {
        if response.is_ok() {
          self.store_in_background(runtime, &request, &response);
        }
        response
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "network failed, falling back to cache");
        if let Some(hit) = self.lookup(&runtime, &request) {
          return hit;
        }

        let tiers = match self.storage.tier_names() {
          Ok(tiers) => tiers,
          Err(e) => {
            warn!(error = %e, "could not list cache tiers");
            Vec::new()
          }
        };
        tiers
          .iter()
          .filter(|tag| **tag != runtime)
          .find_map(|tag| self.lookup(tag, &request))
          .unwrap_or_else(offline::offline_error)
      }
    }
  }

  /// Allow-listed external resources: like static assets, but requested in
  /// cross-origin mode and with an empty fallback.
  async fn cache_first_external(&self, request: Request) -> Response {
    let tag = self.generation.tag(Tier::Static);
    if let Some(hit) = self.lookup(&tag, &request) {
      return hit;
    }

    let cors = request.clone().with_mode(RequestMode::Cors);
    match self.fetcher.fetch(cors).await {
      Ok(response) => {
        if response.is_ok() {
          self.store_in_background(tag, &request, &response);
        }
        response
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "external fetch failed");
        self
          .lookup(&tag, &request)
          .unwrap_or_else(offline::external_unavailable)
      }
    }
  }

  /// Storage errors count as a miss.
  fn lookup(&self, tag: &str, request: &Request) -> Option<Response> {
    match self.storage.lookup(tag, &request.identity()) {
      Ok(hit) => hit.map(|entry| {
        debug!(tier = %tag, identity = %entry.identity, cached_at = %entry.cached_at, "cache hit");
        entry.into_response(tag)
      }),
      Err(e) => {
        warn!(tier = %tag, url = %request.url, error = %e, "cache lookup failed");
        None
      }
    }
  }

  /// One write attempt on a detached task; failure is logged and dropped.
  fn store_in_background(&self, tag: String, request: &Request, response: &Response) {
    let storage = Arc::clone(&self.storage);
    let identity = request.identity();
    let response = response.clone();
    self.background.spawn(async move {
      if let Err(e) = storage.store(&tag, &identity, &response) {
        warn!(tier = %tag, %identity, error = %e, "cache write failed");
      }
    });
  }
}
