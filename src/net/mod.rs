//! Request/response model and the network seam.

pub mod client;
pub mod types;

pub use client::{BoxFuture, Fetch, HttpFetcher};
pub use types::{Request, RequestMode, Response, ResponseSource};

#[cfg(test)]
pub mod mock {
  //! Scripted fetcher for tests.

  use std::collections::HashMap;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::{Arc, Mutex};
  use tokio::sync::Semaphore;

  use super::*;
  use crate::error::NetworkError;

  /// Serves canned responses by URL. When offline, every fetch fails.
  #[derive(Default)]
  pub struct MockFetcher {
    routes: Mutex<HashMap<String, Response>>,
    offline: AtomicBool,
    calls: Mutex<Vec<Request>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
  }

  impl MockFetcher {
    pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
    }

    pub fn respond(&self, url: &str, status: u16, content_type: &str, body: &str) {
      self.routes.lock().unwrap().insert(
        url.to_string(),
        Response::new(status, Some(content_type), body.as_bytes().to_vec()),
      );
    }

    pub fn set_offline(&self, offline: bool) {
      self.offline.store(offline, Ordering::SeqCst);
    }

    /// Hold every fetch until `release` is called.
    pub fn hold(&self) {
      *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self) {
      if let Some(gate) = self.gate.lock().unwrap().take() {
        gate.add_permits(Semaphore::MAX_PERMITS / 2);
      }
    }

    pub fn calls(&self) -> Vec<Request> {
      self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, url: &str) -> usize {
      self
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.url.as_str() == url)
        .count()
    }
  }

  impl Fetch for MockFetcher {
    fn fetch(&self, request: Request) -> BoxFuture<Result<Response, NetworkError>> {
      self.calls.lock().unwrap().push(request.clone());
      let offline = self.offline.load(Ordering::SeqCst);
      let found = self.routes.lock().unwrap().get(request.url.as_str()).cloned();
      let gate = self.gate.lock().unwrap().clone();

      Box::pin(async move {
        if let Some(gate) = gate {
          let _ = gate.acquire().await;
        }
        let url = request.url.to_string();
        if offline {
          return Err(NetworkError::Transport {
            url,
            reason: "network unreachable".to_string(),
          });
        }
        Ok(found.unwrap_or_else(|| Response::new(404, Some("text/plain"), b"not found".to_vec())))
      })
    }
  }
}
