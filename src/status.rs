use serde::Serialize;

use crate::connectivity::{Badges, Capability, CapabilityState};
use crate::db::{Collection, Store};
use crate::error::StoreError;
use crate::sync::SyncQueue;

/// Snapshot of offline readiness, as shown on the settings screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineStatus {
  pub online: bool,
  pub live_data_allowed: bool,
  pub location: Capability,
  pub badges: Badges,
  /// Reference datasets with at least one stored row
  pub cached_datasets: usize,
  pub pending_outputs: usize,
  pub last_sync: String,
}

impl OfflineStatus {
  pub fn collect(
    store: &Store,
    queue: &SyncQueue,
    state: &CapabilityState,
  ) -> Result<Self, StoreError> {
    let mut cached_datasets = 0;
    for dataset in Collection::REFERENCE {
      if store.count(*dataset)? > 0 {
        cached_datasets += 1;
      }
    }

    let pending_outputs = queue.pending()?.len();
    let last_sync = queue.last_sync()?.unwrap_or_else(|| "Never".to_string());

    Ok(Self {
      online: state.network_reachable,
      live_data_allowed: state.live_data_allowed(),
      location: state.capability(),
      badges: state.badges(),
      cached_datasets,
      pending_outputs,
      last_sync,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::{DatasetRow, StoreLocation};
  use crate::net::mock::MockFetcher;
  use crate::sync::{HttpDelivery, LAST_SYNC_KEY};
  use serde_json::json;
  use std::sync::Arc;
  use tokio::sync::watch;
  use url::Url;

  fn store() -> Arc<Store> {
    let store = Store::new(StoreLocation::Memory);
    store.open().unwrap();
    store.ensure_schema(1, Collection::ALL).unwrap();
    Arc::new(store)
  }

  fn queue(store: &Arc<Store>, state: CapabilityState) -> SyncQueue {
    let origin = Url::parse("http://localhost:5000").unwrap();
    let delivery = HttpDelivery::new(MockFetcher::new(), &origin).unwrap();
    let (_tx, rx) = watch::channel(state);
    SyncQueue::new(Arc::clone(store), Arc::new(delivery), rx)
  }

  #[test]
  fn test_fresh_store() {
    let store = store();
    let state = CapabilityState::default();
    let status = OfflineStatus::collect(&store, &queue(&store, state), &state).unwrap();
    assert!(!status.online);
    assert_eq!(status.location, Capability::Unresolved);
    assert_eq!(status.cached_datasets, 0);
    assert_eq!(status.pending_outputs, 0);
    assert_eq!(status.last_sync, "Never");
  }

  #[test]
  fn test_counts_datasets_and_pending() {
    let store = store();
    let state = CapabilityState {
      network_reachable: true,
      location_granted: true,
      location_checked: true,
    };
    let queue = queue(&store, state);
    let row = |v: serde_json::Value| match v {
      serde_json::Value::Object(map) => DatasetRow(map),
      _ => unreachable!(),
    };
    store
      .replace_all(Collection::Feed, &[row(json!({"species": "tilapia"}))])
      .unwrap();
    queue.enqueue("feed", json!({}), json!({})).unwrap();
    store.set_meta(LAST_SYNC_KEY, &"2026-01-01T00:00:00Z").unwrap();

    let status = OfflineStatus::collect(&store, &queue, &state).unwrap();
    assert!(status.live_data_allowed);
    assert_eq!(status.location, Capability::Granted);
    assert_eq!(status.cached_datasets, 1);
    assert_eq!(status.pending_outputs, 1);
    assert_eq!(status.last_sync, "2026-01-01T00:00:00Z");

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["location"], "granted");
    assert_eq!(json["pendingOutputs"], 1);
  }
}
