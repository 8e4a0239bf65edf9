//! Cache tier storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{StoreError, StoreResult};
use crate::net::Response;

/// A response captured in a tier.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  /// Request identity (method + URL)
  pub identity: String,
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

impl CachedResponse {
  /// Turn the entry back into a response tagged with the tier it came from.
  pub fn into_response(self, tier: &str) -> Response {
    Response::new(self.status, self.content_type.as_deref(), self.body).from_tier(tier)
  }
}

/// Trait for cache storage backends.
///
/// Tiers are addressed by their generation tag. Writing to a tier that does not
/// exist yet creates it.
pub trait CacheStorage: Send + Sync {
  /// Create the tier if it does not exist.
  fn open_tier(&self, tag: &str) -> StoreResult<()>;

  /// All tier tags, oldest first.
  fn tier_names(&self) -> StoreResult<Vec<String>>;

  /// Delete a tier and every entry in it. Returns whether it existed.
  fn delete_tier(&self, tag: &str) -> StoreResult<bool>;

  /// Look up the entry for `identity` in one tier.
  fn lookup(&self, tag: &str, identity: &str) -> StoreResult<Option<CachedResponse>>;

  /// Write one entry, replacing any previous entry for the same identity.
  fn store(&self, tag: &str, identity: &str, response: &Response) -> StoreResult<()>;

  /// Write a batch of entries atomically: either all land or none.
  fn store_all(&self, tag: &str, entries: &[(String, Response)]) -> StoreResult<()>;

  /// Number of entries in a tier.
  fn entry_count(&self, tag: &str) -> StoreResult<usize>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteCacheStorage {
  conn: Mutex<Connection>,
}

impl SqliteCacheStorage {
  /// Open cache storage in the database file at `path`.
  pub fn open(path: &Path) -> StoreResult<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        StoreError::StorageUnavailable(format!("failed to create cache directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      StoreError::StorageUnavailable(format!(
        "failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;
    conn.busy_timeout(Duration::from_secs(5))?;

    Self::with_connection(conn)
  }

  /// Cache storage that lives only as long as this value.
  #[cfg(test)]
  pub fn in_memory() -> StoreResult<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> StoreResult<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| StoreError::StorageUnavailable(format!("failed to run cache migrations: {}", e)))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::StorageUnavailable(format!("lock poisoned: {}", e)))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Tier registry (a tier can exist with no entries)
CREATE TABLE IF NOT EXISTS cache_tiers (
    tag TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Captured responses, one per request identity per tier
CREATE TABLE IF NOT EXISTS cache_entries (
    tag TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    identity TEXT NOT NULL,
    status INTEGER NOT NULL,
    content_type TEXT,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (tag, request_hash)
);
"#;

/// SHA256 of the request identity, for stable fixed-length keys.
fn request_hash(identity: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(identity.as_bytes());
  hex::encode(hasher.finalize())
}

fn insert_entry(
  conn: &Connection,
  tag: &str,
  identity: &str,
  response: &Response,
) -> rusqlite::Result<()> {
  conn.execute(
    "INSERT OR IGNORE INTO cache_tiers (tag) VALUES (?)",
    params![tag],
  )?;
  conn.execute(
    "INSERT OR REPLACE INTO cache_entries (tag, request_hash, identity, status, content_type, body, cached_at)
     VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
    params![
      tag,
      request_hash(identity),
      identity,
      response.status,
      response.content_type,
      response.body
    ],
  )?;
  Ok(())
}

impl CacheStorage for SqliteCacheStorage {
  fn open_tier(&self, tag: &str) -> StoreResult<()> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR IGNORE INTO cache_tiers (tag) VALUES (?)",
      params![tag],
    )?;
    Ok(())
  }

  fn tier_names(&self) -> StoreResult<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT tag FROM cache_tiers ORDER BY rowid")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
  }

  fn delete_tier(&self, tag: &str) -> StoreResult<bool> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM cache_entries WHERE tag = ?", params![tag])?;
    let removed = tx.execute("DELETE FROM cache_tiers WHERE tag = ?", params![tag])?;
    tx.commit()?;
    Ok(removed > 0)
  }

  fn lookup(&self, tag: &str, identity: &str) -> StoreResult<Option<CachedResponse>> {
    let conn = self.lock()?;
    let row = conn
      .query_row(
        "SELECT status, content_type, body, cached_at FROM cache_entries
         WHERE tag = ? AND request_hash = ?",
        params![tag, request_hash(identity)],
        |row| {
          Ok((
            row.get::<_, u16>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, Vec<u8>>(2)?,
            row.get::<_, String>(3)?,
          ))
        },
      )
      .optional()?;

    match row {
      Some((status, content_type, body, cached_at)) => Ok(Some(CachedResponse {
        identity: identity.to_string(),
        status,
        content_type,
        body,
        cached_at: parse_datetime(&cached_at)?,
      })),
      None => Ok(None),
    }
  }

  fn store(&self, tag: &str, identity: &str, response: &Response) -> StoreResult<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    insert_entry(&tx, tag, identity, response)?;
    tx.commit()?;
    Ok(())
  }

  fn store_all(&self, tag: &str, entries: &[(String, Response)]) -> StoreResult<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    for (identity, response) in entries {
      insert_entry(&tx, tag, identity, response)?;
    }
    tx.commit()?;
    Ok(())
  }

  fn entry_count(&self, tag: &str) -> StoreResult<usize> {
    let conn = self.lock()?;
    let n: i64 = conn.query_row(
      "SELECT COUNT(*) FROM cache_entries WHERE tag = ?",
      params![tag],
      |row| row.get(0),
    )?;
    Ok(n as usize)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> StoreResult<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| StoreError::StorageUnavailable(format!("bad timestamp '{}': {}", s, e)))
}
