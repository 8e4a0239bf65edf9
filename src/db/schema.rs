//! Structural tables and forward-only collection migration.

use rusqlite::{params, Connection, TransactionBehavior};

use super::collections::Collection;
use crate::error::{StoreError, StoreResult};

/// Tables every store needs regardless of schema version.
pub const BASE_SCHEMA: &str = r#"
-- Registered collections and their identifier generators
CREATE TABLE IF NOT EXISTS collections (
    name TEXT PRIMARY KEY,
    keyed INTEGER NOT NULL DEFAULT 0,
    next_id INTEGER NOT NULL DEFAULT 1,
    created_in_version INTEGER NOT NULL
);

-- Records of auto-identifier collections (serialized JSON)
CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    id INTEGER NOT NULL,
    data TEXT NOT NULL,
    PRIMARY KEY (collection, id)
);

-- String-keyed metadata
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Outcome of a schema check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Migration {
  /// Stored version already matches; nothing was touched.
  UpToDate,
  /// Version was bumped from `from` to `to`, creating `created` collections.
  Migrated {
    from: u32,
    to: u32,
    created: Vec<Collection>,
  },
}

/// Bring the database to `version`, creating missing collections.
///
/// Runs inside an IMMEDIATE transaction so a second connection opening the
/// same file waits for this one to finish before it reads the version.
pub fn migrate(
  conn: &mut Connection,
  version: u32,
  required: &[Collection],
) -> StoreResult<Migration> {
  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

  let stored: u32 = tx.query_row("PRAGMA user_version", [], |row| row.get(0))?;
  if stored > version {
    return Err(StoreError::SchemaDowngrade {
      stored,
      requested: version,
    });
  }
  if stored == version {
    return Ok(Migration::UpToDate);
  }

  let mut created = Vec::new();
  for collection in required {
    let inserted = tx.execute(
      "INSERT OR IGNORE INTO collections (name, keyed, next_id, created_in_version)
       VALUES (?, ?, 1, ?)",
      params![collection.name(), collection.is_keyed(), version],
    )?;
    if inserted > 0 {
      created.push(*collection);
    }
  }

  tx.pragma_update(None, "user_version", version)?;
  tx.commit()?;

  Ok(Migration::Migrated {
    from: stored,
    to: version,
    created,
  })
}

/// Whether `collection` has been created by a migration.
pub fn collection_exists(conn: &Connection, collection: Collection) -> StoreResult<bool> {
  let count: i64 = conn.query_row(
    "SELECT COUNT(*) FROM collections WHERE name = ?",
    params![collection.name()],
    |row| row.get(0),
  )?;
  Ok(count > 0)
}
