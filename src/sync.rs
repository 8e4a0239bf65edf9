//! Deferred delivery of outputs computed while offline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::connectivity::{CapabilityState, Replay};
use crate::db::{Collection, Record, Store, Stored};
use crate::error::{NetworkError, StoreError};
use crate::net::{BoxFuture, Fetch, Request};

/// Meta key holding the time of the last delivery.
pub const LAST_SYNC_KEY: &str = "lastSync";

/// A prediction computed locally and awaiting acknowledgment by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOutput {
  #[serde(rename = "type")]
  pub kind: String,
  pub inputs: serde_json::Value,
  pub output: serde_json::Value,
  pub timestamp: DateTime<Utc>,
  pub synced: bool,
}

impl Record for PendingOutput {
  fn accepts(collection: Collection) -> bool {
    collection == Collection::Predictions
  }

  fn validate(&self) -> Result<(), String> {
    if self.kind.trim().is_empty() {
      return Err("prediction type must not be empty".to_string());
    }
    Ok(())
  }
}

/// Delivers a pending record to the system of record.
///
/// The endpoint must accept replays of the same record: a crash between the
/// acknowledgment and the local `synced` flip redelivers it on the next flush.
pub trait Deliver: Send + Sync {
  fn deliver(&self, record: &Stored<PendingOutput>) -> BoxFuture<Result<(), NetworkError>>;
}

/// Posts records as JSON to `/api/sync-prediction`; any 2xx is an acknowledgment.
pub struct HttpDelivery {
  fetcher: Arc<dyn Fetch>,
  endpoint: Url,
}

impl HttpDelivery {
  pub fn new(fetcher: Arc<dyn Fetch>, origin: &Url) -> Result<Self, url::ParseError> {
    Ok(Self {
      fetcher,
      endpoint: origin.join("/api/sync-prediction")?,
    })
  }
}

impl Deliver for HttpDelivery {
  fn deliver(&self, record: &Stored<PendingOutput>) -> BoxFuture<Result<(), NetworkError>> {
    let endpoint = self.endpoint.clone();
    let body = serde_json::to_vec(record);
    let fetcher = Arc::clone(&self.fetcher);

    Box::pin(async move {
      let body = body.map_err(|e| NetworkError::Decode {
        url: endpoint.to_string(),
        reason: e.to_string(),
      })?;
      let response = fetcher.fetch(Request::post_json(endpoint.clone(), body)).await?;
      if response.is_ok() {
        Ok(())
      } else {
        Err(NetworkError::Status {
          url: endpoint.to_string(),
          status: response.status,
        })
      }
    })
  }
}

/// Outcome of one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
  /// The network was down; nothing was attempted
  pub skipped: bool,
  pub attempted: usize,
  pub delivered: usize,
  pub failed: usize,
}

/// Queue of pending outputs, stored in the predictions collection.
pub struct SyncQueue {
  store: Arc<Store>,
  delivery: Arc<dyn Deliver>,
  status: watch::Receiver<CapabilityState>,
  /// Serializes flushes so a record is never sent twice by this process.
  flushing: Mutex<()>,
}

impl SyncQueue {
  pub fn new(
    store: Arc<Store>,
    delivery: Arc<dyn Deliver>,
    status: watch::Receiver<CapabilityState>,
  ) -> Self {
    Self {
      store,
      delivery,
      status,
      flushing: Mutex::new(()),
    }
  }

  /// Record an output for later delivery.
  pub fn enqueue(
    &self,
    kind: &str,
    inputs: serde_json::Value,
    output: serde_json::Value,
  ) -> Result<Stored<PendingOutput>, StoreError> {
    let record = PendingOutput {
      kind: kind.to_string(),
      inputs,
      output,
      timestamp: Utc::now(),
      synced: false,
    };
    let stored = self.store.append(Collection::Predictions, &record)?;
    debug!(id = stored.id, kind, "prediction queued");
    Ok(stored)
  }

  /// Records not yet acknowledged.
  pub fn pending(&self) -> Result<Vec<Stored<PendingOutput>>, StoreError> {
    let all: Vec<Stored<PendingOutput>> = self.store.get_all(Collection::Predictions)?;
    Ok(all.into_iter().filter(|p| !p.record.synced).collect())
  }

  /// Deliver every unsynced record, each independently.
  ///
  /// A no-op while the network is down. A failed delivery leaves the record
  /// for the next flush and does not stop the others.
  pub async fn flush(&self) -> Result<FlushReport, StoreError> {
    if !self.status.borrow().network_reachable {
      debug!("offline, flush skipped");
      return Ok(FlushReport {
        skipped: true,
        ..FlushReport::default()
      });
    }

    let _guard = self.flushing.lock().await;
    let pending = self.pending()?;
    let mut report = FlushReport {
      attempted: pending.len(),
      ..FlushReport::default()
    };

    for mut record in pending {
      match self.delivery.deliver(&record).await {
        Ok(()) => {
          record.record.synced = true;
          match self.store.put(Collection::Predictions, &record) {
            Ok(()) => report.delivered += 1,
            Err(e) => {
              // Acknowledged but not marked; it will be sent again.
              error!(id = record.id, error = %e, "could not mark prediction as synced");
              report.failed += 1;
            }
          }
        }
        Err(e) => {
          warn!(id = record.id, error = %e, "prediction delivery failed");
          report.failed += 1;
        }
      }
    }

    if report.delivered > 0 {
      self.store.set_meta(LAST_SYNC_KEY, &Utc::now().to_rfc3339())?;
    }
    info!(
      attempted = report.attempted,
      failed = report.failed,
      "Synced {} predictions",
      report.delivered
    );
    Ok(report)
  }

  /// When the last delivery happened, if ever.
  pub fn last_sync(&self) -> Result<Option<String>, StoreError> {
    self.store.get_meta(LAST_SYNC_KEY)
  }
}

impl Replay for SyncQueue {
  fn replay(self: Arc<Self>) -> BoxFuture<()> {
    Box::pin(async move {
      if let Err(e) = self.flush().await {
        warn!(error = %e, "sync failed");
      }
    })
  }
}
