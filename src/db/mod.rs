//! Durable, versioned local store for reference datasets, the pending-output
//! queue and string-keyed metadata.

pub mod collections;
pub mod schema;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

pub use collections::{Collection, DatasetRow, Record, Stored};
pub use schema::Migration;

/// Where the store keeps its data.
#[derive(Debug, Clone)]
pub enum StoreLocation {
  File(PathBuf),
  /// Process-private database.
  #[cfg(test)]
  Memory,
}

/// Local persistent store.
///
/// Every connection-level operation goes through one mutex, so structural
/// work (migration) and record access never interleave on this handle. Other
/// handles on the same file are serialized by SQLite transactions.
pub struct Store {
  location: StoreLocation,
  conn: Mutex<Option<Connection>>,
}

impl Store {
  /// Create an unopened store handle.
  pub fn new(location: StoreLocation) -> Self {
    Self {
      location,
      conn: Mutex::new(None),
    }
  }

  /// Get the default database path
  pub fn default_path() -> StoreResult<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| {
        StoreError::StorageUnavailable("could not determine data directory".to_string())
      })?;

    Ok(data_dir.join("aqua-offline").join("offline.db"))
  }

  /// Open the underlying database. Calling this again on an open store is a no-op.
  pub fn open(&self) -> StoreResult<()> {
    let mut guard = self.lock()?;
    if guard.is_some() {
      return Ok(());
    }

    let conn = match &self.location {
      StoreLocation::File(path) => {
        if let Some(parent) = path.parent() {
          std::fs::create_dir_all(parent).map_err(|e| {
            StoreError::StorageUnavailable(format!(
              "failed to create {}: {}",
              parent.display(),
              e
            ))
          })?;
        }
        let conn = Connection::open(path).map_err(|e| {
          StoreError::StorageUnavailable(format!("failed to open {}: {}", path.display(), e))
        })?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn
      }
      #[cfg(test)]
      StoreLocation::Memory => Connection::open_in_memory()?,
    };

    conn
      .execute_batch(schema::BASE_SCHEMA)
      .map_err(|e| StoreError::StorageUnavailable(format!("failed to create base tables: {}", e)))?;

    debug!(location = ?self.location, "store opened");
    *guard = Some(conn);
    Ok(())
  }

  /// Create any collection missing from `required` if `version` is newer than
  /// the stored schema version. Existing collections are never dropped or renamed.
  pub fn ensure_schema(&self, version: u32, required: &[Collection]) -> StoreResult<Migration> {
    self.with_conn(|conn| {
      let migration = schema::migrate(conn, version, required)?;
      if let Migration::Migrated { from, to, created } = &migration {
        info!(from, to, created = created.len(), "store schema migrated");
      }
      Ok(migration)
    })
  }

  /// Replace the whole content of `collection` in one transaction.
  ///
  /// Readers see either the previous content or the new one. Any failure
  /// rolls the batch back.
  pub fn replace_all<T: Record>(&self, collection: Collection, records: &[T]) -> StoreResult<()> {
    let encoded = records
      .iter()
      .map(|r| encode(collection, r))
      .collect::<StoreResult<Vec<_>>>()?;

    self.with_conn(|conn| {
      require_collection(conn, collection)?;
      let tx = conn.transaction()?;

      tx.execute(
        "DELETE FROM records WHERE collection = ?",
        params![collection.name()],
      )?;

      let mut next_id: i64 = tx.query_row(
        "SELECT next_id FROM collections WHERE name = ?",
        params![collection.name()],
        |row| row.get(0),
      )?;
      for data in &encoded {
        tx.execute(
          "INSERT INTO records (collection, id, data) VALUES (?, ?, ?)",
          params![collection.name(), next_id, data],
        )?;
        next_id += 1;
      }
      tx.execute(
        "UPDATE collections SET next_id = ? WHERE name = ?",
        params![next_id, collection.name()],
      )?;

      tx.commit()?;
      Ok(())
    })
  }

  /// Append a record, assigning the next identifier of `collection`.
  pub fn append<T: Record + Clone>(
    &self,
    collection: Collection,
    record: &T,
  ) -> StoreResult<Stored<T>> {
    let data = encode(collection, record)?;

    let id = self.with_conn(|conn| {
      require_collection(conn, collection)?;
      let tx = conn.transaction()?;
      let id: i64 = tx.query_row(
        "SELECT next_id FROM collections WHERE name = ?",
        params![collection.name()],
        |row| row.get(0),
      )?;
      tx.execute(
        "INSERT INTO records (collection, id, data) VALUES (?, ?, ?)",
        params![collection.name(), id, data],
      )?;
      tx.execute(
        "UPDATE collections SET next_id = ? WHERE name = ?",
        params![id + 1, collection.name()],
      )?;
      tx.commit()?;
      Ok(id)
    })?;

    Ok(Stored {
      id: id as u64,
      record: record.clone(),
    })
  }

  /// All records of `collection` in identifier order. Empty collections yield
  /// an empty vector.
  pub fn get_all<T: Record>(&self, collection: Collection) -> StoreResult<Vec<Stored<T>>> {
    check_accepts::<T>(collection)?;

    self.with_conn(|conn| {
      require_collection(conn, collection)?;
      let mut stmt =
        conn.prepare("SELECT id, data FROM records WHERE collection = ? ORDER BY id")?;
      let rows = stmt
        .query_map(params![collection.name()], |row| {
          Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

      rows
        .into_iter()
        .map(|(id, data)| {
          Ok(Stored {
            id: id as u64,
            record: serde_json::from_str(&data)?,
          })
        })
        .collect()
    })
  }

  /// Upsert a record by identifier.
  pub fn put<T: Record>(&self, collection: Collection, stored: &Stored<T>) -> StoreResult<()> {
    let data = encode(collection, &stored.record)?;

    self.with_conn(|conn| {
      require_collection(conn, collection)?;
      let tx = conn.transaction()?;
      tx.execute(
        "INSERT OR REPLACE INTO records (collection, id, data) VALUES (?, ?, ?)",
        params![collection.name(), stored.id as i64, data],
      )?;
      // Keep the generator ahead of any id written explicitly.
      tx.execute(
        "UPDATE collections SET next_id = MAX(next_id, ? + 1) WHERE name = ?",
        params![stored.id as i64, collection.name()],
      )?;
      tx.commit()?;
      Ok(())
    })
  }

  /// Number of records in `collection`.
  pub fn count(&self, collection: Collection) -> StoreResult<usize> {
    self.with_conn(|conn| {
      require_collection(conn, collection)?;
      let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM records WHERE collection = ?",
        params![collection.name()],
        |row| row.get(0),
      )?;
      Ok(n as usize)
    })
  }

  /// Read a metadata value.
  pub fn get_meta<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
    self.with_conn(|conn| {
      require_collection(conn, Collection::Meta)?;
      let value: Option<String> = conn
        .query_row("SELECT value FROM meta WHERE key = ?", params![key], |row| {
          row.get(0)
        })
        .optional()?;
      match value {
        Some(v) => Ok(Some(serde_json::from_str(&v)?)),
        None => Ok(None),
      }
    })
  }

  /// Write a metadata value, replacing any previous one under `key`.
  pub fn set_meta<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()> {
    let data = serde_json::to_string(value)?;
    self.with_conn(|conn| {
      require_collection(conn, Collection::Meta)?;
      conn.execute(
        "INSERT OR REPLACE INTO meta (key, value, updated_at) VALUES (?, ?, datetime('now'))",
        params![key, data],
      )?;
      Ok(())
    })
  }

  fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Option<Connection>>> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::StorageUnavailable(format!("lock poisoned: {}", e)))
  }

  fn with_conn<R>(&self, f: impl FnOnce(&mut Connection) -> StoreResult<R>) -> StoreResult<R> {
    let mut guard = self.lock()?;
    let conn = guard.as_mut().ok_or(StoreError::NotInitialized)?;
    f(conn)
  }
}

fn check_accepts<T: Record>(collection: Collection) -> StoreResult<()> {
  if collection.is_keyed() {
    return Err(StoreError::InvalidRecord {
      collection: collection.name().to_string(),
      reason: "keyed by caller-supplied strings; use get_meta/set_meta".to_string(),
    });
  }
  if !T::accepts(collection) {
    return Err(StoreError::InvalidRecord {
      collection: collection.name().to_string(),
      reason: format!("{} records do not belong here", std::any::type_name::<T>()),
    });
  }
  Ok(())
}

fn encode<T: Record>(collection: Collection, record: &T) -> StoreResult<String> {
  check_accepts::<T>(collection)?;
  record
    .validate()
    .map_err(|reason| StoreError::InvalidRecord {
      collection: collection.name().to_string(),
      reason,
    })?;
  Ok(serde_json::to_string(record)?)
}

fn require_collection(conn: &Connection, collection: Collection) -> StoreResult<()> {
  if schema::collection_exists(conn, collection)? {
    Ok(())
  } else {
    Err(StoreError::UnknownCollection(collection.name().to_string()))
  }
}
