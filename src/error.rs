//! Error taxonomy shared by the store, the cache tiers and the sync queue.

use thiserror::Error;

/// Errors raised by the local persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
  /// The platform refused durable storage (file system, permissions, locks).
  #[error("durable storage unavailable: {0}")]
  StorageUnavailable(String),

  /// The store was used before `open()`.
  #[error("store used before open()")]
  NotInitialized,

  #[error("collection {0} does not exist in the current schema")]
  UnknownCollection(String),

  #[error("record rejected by collection {collection}: {reason}")]
  InvalidRecord { collection: String, reason: String },

  #[error("stored schema version {stored} is newer than requested version {requested}")]
  SchemaDowngrade { stored: u32, requested: u32 },

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for StoreError {
  fn from(e: rusqlite::Error) -> Self {
    StoreError::StorageUnavailable(e.to_string())
  }
}

/// Transient network failures. Never surfaced to a cache caller.
#[derive(Debug, Clone, Error)]
pub enum NetworkError {
  #[error("request to {url} failed: {reason}")]
  Transport { url: String, reason: String },

  #[error("{url} answered with status {status}")]
  Status { url: String, status: u16 },

  #[error("could not decode response from {url}: {reason}")]
  Decode { url: String, reason: String },
}

/// Errors raised while provisioning or activating a cache generation.
#[derive(Debug, Error)]
pub enum LifecycleError {
  /// A critical manifest entry could not be cached; the install step must be retried.
  #[error("installation of generation {generation} failed: {reason}")]
  InstallationFailure { generation: String, reason: String },

  #[error("invalid cache version {0:?}: must be non-empty and must not contain '-'")]
  InvalidVersion(String),

  #[error("cannot {action} while generation is {state}")]
  InvalidTransition {
    action: &'static str,
    state: &'static str,
  },

  #[error(transparent)]
  Storage(#[from] StoreError),
}

/// Top-level error for callers that drive several subsystems at once.
#[derive(Debug, Error)]
pub enum OfflineError {
  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Network(#[from] NetworkError),

  #[error(transparent)]
  Lifecycle(#[from] LifecycleError),

  /// Expected and user-recoverable; drives a prompt rather than a failure.
  #[error("location permission denied")]
  CapabilityDenied,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
