//! Partition storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::RequestKey;
use crate::http::{Headers, Response};

/// A single cached response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  /// The stored snapshot
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Trait for partition storage backends.
///
/// Each operation is atomic on its own; nothing spans more than one call.
pub trait PartitionStore: Send + Sync {
  /// Create the partition if it does not exist.
  fn open(&self, partition: &str) -> Result<()>;

  /// Store a response, replacing any entry with the same key. Opens the
  /// partition if needed.
  fn put(&self, partition: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Look up a key in one partition, or in every partition (oldest first)
  /// when `partition` is `None`.
  fn match_request(&self, key: &RequestKey, partition: Option<&str>)
    -> Result<Option<CachedResponse>>;

  /// Delete a partition and all of its entries. Returns whether it existed.
  fn delete(&self, partition: &str) -> Result<bool>;

  /// Names of all partitions in creation order.
  fn list_names(&self) -> Result<Vec<String>>;

  /// Keys stored in one partition.
  fn keys(&self, partition: &str) -> Result<Vec<RequestKey>>;

  /// The version that last completed activation.
  fn active_version(&self) -> Result<Option<String>>;

  /// Record the version that completed activation.
  fn set_active_version(&self, version: &str) -> Result<()>;
}

/// SQLite-based partition storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the storage at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a private in-memory storage.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::from_connection(conn)
  }

  /// Make every entry write fail from now on.
  #[cfg(test)]
  pub fn reject_entry_writes(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(
        "CREATE TRIGGER reject_entries BEFORE INSERT ON entries
         BEGIN SELECT RAISE(ABORT, 'entries are read-only'); END;",
      )
      .map_err(|e| eyre!("Failed to install trigger: {}", e))
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("signage-relay").join("partitions.db"))
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for partition tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(PARTITION_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for partition tables.
const PARTITION_SCHEMA: &str = r#"
-- Named partitions; rowid gives creation order
CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Response snapshots, one per (partition, request key)
CREATE TABLE IF NOT EXISTS entries (
    partition TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (partition, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_entries_key ON entries(key_hash);

-- Last activated worker version
CREATE TABLE IF NOT EXISTS registration (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    active_version TEXT NOT NULL,
    activated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl PartitionStore for SqliteStorage {
  fn open(&self, partition: &str) -> Result<()> {
    self
      .lock()?
      .execute(
        "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
        params![partition],
      )
      .map_err(|e| eyre!("Failed to open partition {}: {}", partition, e))?;

    Ok(())
  }

  fn put(&self, partition: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let conn = self.lock()?;
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
      params![partition],
    )
    .map_err(|e| eyre!("Failed to open partition {}: {}", partition, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO entries
         (partition, key_hash, method, url, status, status_text, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        partition,
        key.hash(),
        key.method(),
        key.url(),
        response.status,
        response.status_text,
        headers,
        response.body.as_ref(),
      ],
    )
    .map_err(|e| eyre!("Failed to store entry {}: {}", key, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn match_request(
    &self,
    key: &RequestKey,
    partition: Option<&str>,
  ) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;

    let row = match partition {
      Some(name) => conn.query_row(
        "SELECT status, status_text, headers, body, cached_at FROM entries
         WHERE partition = ? AND key_hash = ?",
        params![name, key.hash()],
        read_entry,
      ),
      None => conn.query_row(
        "SELECT e.status, e.status_text, e.headers, e.body, e.cached_at FROM entries e
         INNER JOIN partitions p ON p.name = e.partition
         WHERE e.key_hash = ?
         ORDER BY p.rowid
         LIMIT 1",
        params![key.hash()],
        read_entry,
      ),
    }
    .optional()
    .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    let Some((status, status_text, headers, body, cached_at)) = row else {
      return Ok(None);
    };

    let headers: Headers = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", key, e))?;

    Ok(Some(CachedResponse {
      response: Response {
        status,
        status_text,
        headers,
        body: body.into(),
      },
      cached_at: parse_datetime(&cached_at)?,
    }))
  }

  fn delete(&self, partition: &str) -> Result<bool> {
    let conn = self.lock()?;

    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE partition = ?", params![partition])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", partition, e))?;

    let removed = tx
      .execute("DELETE FROM partitions WHERE name = ?", params![partition])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", partition, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn list_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM partitions ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partition name: {}", e))?;

    Ok(names)
  }

  fn keys(&self, partition: &str) -> Result<Vec<RequestKey>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT method, url FROM entries WHERE partition = ? ORDER BY url")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![partition], |row| {
        Ok(RequestKey::from_parts(row.get(0)?, row.get(1)?))
      })
      .map_err(|e| eyre!("Failed to list entries of {}: {}", partition, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry key: {}", e))?;

    Ok(keys)
  }

  fn active_version(&self) -> Result<Option<String>> {
    self
      .lock()?
      .query_row(
        "SELECT active_version FROM registration WHERE id = 1",
        [],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read active version: {}", e))
  }

  fn set_active_version(&self, version: &str) -> Result<()> {
    self
      .lock()?
      .execute(
        "INSERT OR REPLACE INTO registration (id, active_version, activated_at)
         VALUES (1, ?, datetime('now'))",
        params![version],
      )
      .map_err(|e| eyre!("Failed to record active version: {}", e))?;

    Ok(())
  }
}

type EntryRow = (u16, String, String, Vec<u8>, String);

fn read_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
  ))
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
