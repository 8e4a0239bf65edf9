//! Bulk refresh of reference datasets, with the local store as fallback.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use crate::db::{Collection, DatasetRow, Store};
use crate::error::StoreError;
use crate::net::{Fetch, Request};

/// Meta key holding the time of the last dataset refresh that reached the network.
pub const REFRESHED_AT_KEY: &str = "datasetsRefreshedAt";

/// Where a dataset's current content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetSource {
  Network,
  Cache,
  /// Neither the network nor the store had any rows
  Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetReport {
  pub dataset: Collection,
  pub source: DatasetSource,
  pub records: usize,
}

pub struct DatasetSync {
  store: Arc<Store>,
  fetcher: Arc<dyn Fetch>,
  origin: Url,
}

impl DatasetSync {
  pub fn new(store: Arc<Store>, fetcher: Arc<dyn Fetch>, origin: Url) -> Self {
    Self {
      store,
      fetcher,
      origin,
    }
  }

  /// Refresh every dataset in `datasets`, one after another.
  pub async fn refresh_all(&self, datasets: &[Collection]) -> Result<Vec<DatasetReport>, StoreError> {
    let mut reports = Vec::with_capacity(datasets.len());
    for dataset in datasets {
      reports.push(self.refresh(*dataset).await?);
    }
    if reports.iter().any(|r| r.source == DatasetSource::Network) {
      self.store.set_meta(REFRESHED_AT_KEY, &Utc::now().to_rfc3339())?;
    }
    Ok(reports)
  }

  /// Replace `dataset` with what the server serves, or keep the stored rows
  /// when the server cannot be used.
  pub async fn refresh(&self, dataset: Collection) -> Result<DatasetReport, StoreError> {
    if let Some(rows) = self.download(dataset).await {
      match self.store.replace_all(dataset, &rows) {
        Ok(()) => {
          info!(%dataset, records = rows.len(), "dataset refreshed from network");
          return Ok(DatasetReport {
            dataset,
            source: DatasetSource::Network,
            records: rows.len(),
          });
        }
        Err(e @ StoreError::InvalidRecord { .. }) => {
          warn!(%dataset, error = %e, "server rows rejected, keeping cached copy");
        }
        Err(e) => return Err(e),
      }
    }

    let records = self.store.count(dataset)?;
    let source = if records > 0 {
      info!(%dataset, records, "using cached dataset");
      DatasetSource::Cache
    } else {
      warn!(%dataset, "dataset unavailable offline");
      DatasetSource::Missing
    };
    Ok(DatasetReport {
      dataset,
      source,
      records,
    })
  }

  async fn download(&self, dataset: Collection) -> Option<Vec<DatasetRow>> {
    let url = self
      .origin
      .join(&format!("/api/dataset/{}", dataset.name()))
      .ok()?;

    let response = match self.fetcher.fetch(Request::get(url.clone())).await {
      Ok(response) if response.is_ok() => response,
      Ok(response) => {
        warn!(%url, status = response.status, "dataset request failed");
        return None;
      }
      Err(e) => {
        warn!(%url, error = %e, "dataset request failed");
        return None;
      }
    };

    match response.json::<Vec<DatasetRow>>(&url) {
      // Identifiers are assigned locally.
      Ok(rows) => Some(
        rows
          .into_iter()
          .map(|mut row| {
            row.0.remove("id");
            row
          })
          .collect(),
      ),
      Err(e) => {
        warn!(%url, error = %e, "dataset body unusable");
        None
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::{StoreLocation, Stored};
  use crate::net::mock::MockFetcher;

  const DISEASE: &str = "http://localhost:5000/api/dataset/disease";

  fn setup() -> (Arc<Store>, Arc<MockFetcher>, DatasetSync) {
    let store = Store::new(StoreLocation::Memory);
    store.open().unwrap();
    store.ensure_schema(1, Collection::ALL).unwrap();
    let store = Arc::new(store);
    let fetcher = MockFetcher::new();
    let sync = DatasetSync::new(
      store.clone(),
      fetcher.clone(),
      Url::parse("http://localhost:5000").unwrap(),
    );
    (store, fetcher, sync)
  }

  fn stored(store: &Store, dataset: Collection) -> Vec<Stored<DatasetRow>> {
    store.get_all(dataset).unwrap()
  }

  #[tokio::test]
  async fn test_refresh_replaces_from_network() {
    let (store, fetcher, sync) = setup();
    fetcher.respond(
      DISEASE,
      200,
      "application/json",
      r#"[{"pH": "7.2", "risk": "LOW"}, {"pH": "5.1", "risk": "HIGH", "id": "9"}]"#,
    );

    let report = sync.refresh(Collection::Disease).await.unwrap();
    assert_eq!(report.source, DatasetSource::Network);
    assert_eq!(report.records, 2);

    let rows = stored(&store, Collection::Disease);
    assert_eq!(rows[1].record.get("risk").unwrap(), "HIGH");
    assert!(rows[1].record.get("id").is_none());

    // A second refresh replaces rather than accumulates.
    sync.refresh(Collection::Disease).await.unwrap();
    assert_eq!(store.count(Collection::Disease).unwrap(), 2);
  }

  #[tokio::test]
  async fn test_offline_falls_back_to_cache() {
    let (_store, fetcher, sync) = setup();
    fetcher.respond(DISEASE, 200, "application/json", r#"[{"pH": "7.2"}]"#);
    sync.refresh(Collection::Disease).await.unwrap();

    fetcher.set_offline(true);
    let report = sync.refresh(Collection::Disease).await.unwrap();
    assert_eq!(report.source, DatasetSource::Cache);
    assert_eq!(report.records, 1);
  }

  #[tokio::test]
  async fn test_error_status_keeps_cached_rows() {
    let (store, fetcher, sync) = setup();
    fetcher.respond(DISEASE, 200, "application/json", r#"[{"pH": "7.2"}]"#);
    sync.refresh(Collection::Disease).await.unwrap();

    fetcher.respond(DISEASE, 503, "application/json", r#"{"offline": true}"#);
    let report = sync.refresh(Collection::Disease).await.unwrap();
    assert_eq!(report.source, DatasetSource::Cache);
    assert_eq!(stored(&store, Collection::Disease).len(), 1);
  }

  #[tokio::test]
  async fn test_invalid_rows_keep_cached_rows() {
    let (store, fetcher, sync) = setup();
    fetcher.respond(DISEASE, 200, "application/json", r#"[{"pH": "7.2"}]"#);
    sync.refresh(Collection::Disease).await.unwrap();

    fetcher.respond(DISEASE, 200, "application/json", r#"[{"pH": "6.0"}, {}]"#);
    let report = sync.refresh(Collection::Disease).await.unwrap();
    assert_eq!(report.source, DatasetSource::Cache);
    assert_eq!(stored(&store, Collection::Disease)[0].record.get("pH").unwrap(), "7.2");
  }

  #[tokio::test]
  async fn test_refresh_all_reports_each_dataset() {
    let (store, fetcher, sync) = setup();
    fetcher.respond(DISEASE, 200, "application/json", r#"[{"pH": "7.2"}]"#);

    let reports = sync
      .refresh_all(&[Collection::Disease, Collection::Feed])
      .await
      .unwrap();
    assert_eq!(reports[0].source, DatasetSource::Network);
    assert_eq!(reports[1].source, DatasetSource::Missing);
    assert!(store.get_meta::<String>(REFRESHED_AT_KEY).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_unreachable_refresh_leaves_timestamp_unset() {
    let (store, fetcher, sync) = setup();
    fetcher.set_offline(true);
    sync.refresh_all(Collection::REFERENCE).await.unwrap();
    assert_eq!(store.get_meta::<String>(REFRESHED_AT_KEY).unwrap(), None);
  }
}
