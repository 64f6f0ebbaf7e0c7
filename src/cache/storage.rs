//! Cache storage backends: SQLite for durability, memory as the fallback.

use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use super::error::CacheError;
use super::traits::Table;

/// A row as stored in any table. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
  pub data: Value,
  pub fetched_at: i64,
  /// `None` for meta records.
  pub expires_at: Option<i64>,
}

impl StoredRow {
  pub fn is_fresh(&self, now_ms: i64) -> bool {
    self.expires_at.map_or(true, |expires_at| now_ms < expires_at)
  }
}

/// Whether an operation only reads or may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
  Read,
  Write,
}

/// Access to a single table for the duration of one operation.
///
/// Either a live SQLite transaction or the in-memory map for that table;
/// callers use the same read/write calls for both.
pub enum TableHandle<'a> {
  Durable {
    tx: &'a Transaction<'a>,
    table: Table,
  },
  Memory(&'a mut HashMap<String, StoredRow>),
}

impl TableHandle<'_> {
  pub fn is_durable(&self) -> bool {
    matches!(self, TableHandle::Durable { .. })
  }

  pub fn read(&self, key: &str) -> Result<Option<StoredRow>, CacheError> {
    match self {
      TableHandle::Durable { tx, table } => {
        let sql = format!(
          "SELECT data, fetched_at, expires_at FROM {} WHERE key = ?1",
          table.name()
        );
        let row: Option<(Vec<u8>, i64, Option<i64>)> = tx
          .query_row(&sql, params![key], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
          })
          .optional()?;

        match row {
          Some((data, fetched_at, expires_at)) => Ok(Some(StoredRow {
            data: serde_json::from_slice(&data)?,
            fetched_at,
            expires_at,
          })),
          None => Ok(None),
        }
      }
      TableHandle::Memory(rows) => Ok(rows.get(key).cloned()),
    }
  }

  pub fn write(&mut self, key: &str, row: StoredRow) -> Result<(), CacheError> {
    match self {
      TableHandle::Durable { tx, table } => {
        let data = serde_json::to_vec(&row.data)?;
        let sql = format!(
          "INSERT OR REPLACE INTO {} (key, data, fetched_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
          table.name()
        );
        tx.execute(&sql, params![key, data, row.fetched_at, row.expires_at])?;
        Ok(())
      }
      TableHandle::Memory(rows) => {
        rows.insert(key.to_string(), row);
        Ok(())
      }
    }
  }

  pub fn clear(&mut self) -> Result<(), CacheError> {
    match self {
      TableHandle::Durable { tx, table } => {
        tx.execute(&format!("DELETE FROM {}", table.name()), [])?;
        Ok(())
      }
      TableHandle::Memory(rows) => {
        rows.clear();
        Ok(())
      }
    }
  }
}

/// In-process tables used when the durable store is unavailable.
#[derive(Default)]
pub struct MemoryStorage {
  tables: Mutex<HashMap<Table, HashMap<String, StoredRow>>>,
}

impl MemoryStorage {
  pub fn with_table<R>(
    &self,
    table: Table,
    f: impl FnOnce(TableHandle<'_>) -> Result<R, CacheError>,
  ) -> Result<R, CacheError> {
    let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
    f(TableHandle::Memory(tables.entry(table).or_default()))
  }
}

/// SQLite-based durable storage.
pub struct SqliteStorage {
  conn: Mutex<Option<Connection>>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`, creating parent directories.
  pub fn open(path: &Path) -> Result<Self, CacheError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent).map_err(|source| CacheError::Directory {
        path: parent.to_path_buf(),
        source,
      })?;
    }

    let conn = Connection::open(path)?;
    Self::from_connection(conn)
  }

  /// Open a private in-memory database. Useful for tests.
  pub fn open_in_memory() -> Result<Self, CacheError> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  fn from_connection(conn: Connection) -> Result<Self, CacheError> {
    conn.execute_batch(CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(Some(conn)),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Option<PathBuf> {
    let data_dir = dirs::data_dir().or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))?;
    Some(data_dir.join("mediacache").join("cache.db"))
  }

  /// Run `f` inside one transaction on `table`. The transaction commits only
  /// if `f` succeeds.
  pub fn with_table<R>(
    &self,
    table: Table,
    mode: Mode,
    f: impl FnOnce(TableHandle<'_>) -> Result<R, CacheError>,
  ) -> Result<R, CacheError> {
    let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
    let conn = guard.as_mut().ok_or(CacheError::Closed)?;

    let behavior = match mode {
      Mode::Read => TransactionBehavior::Deferred,
      Mode::Write => TransactionBehavior::Immediate,
    };
    let tx = conn.transaction_with_behavior(behavior)?;
    let result = f(TableHandle::Durable { tx: &tx, table })?;
    tx.commit()?;

    Ok(result)
  }

  /// Close the connection. Later operations fail with [`CacheError::Closed`].
  pub fn close(&self) -> Result<(), CacheError> {
    let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(conn) = guard.take() {
      conn.close().map_err(|(_, e)| CacheError::Sqlite(e))?;
    }
    Ok(())
  }
}

/// Schema for cache tables. Meta rows leave `expires_at` NULL.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS item (
    key TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    fetched_at INTEGER NOT NULL,
    expires_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_item_expires ON item(expires_at);
CREATE INDEX IF NOT EXISTS idx_item_fetched ON item(fetched_at);

CREATE TABLE IF NOT EXISTS query (
    key TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    fetched_at INTEGER NOT NULL,
    expires_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_query_expires ON query(expires_at);
CREATE INDEX IF NOT EXISTS idx_query_fetched ON query(fetched_at);

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    fetched_at INTEGER NOT NULL,
    expires_at INTEGER
);
"#;

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn row(data: Value, expires_at: Option<i64>) -> StoredRow {
    StoredRow {
      data,
      fetched_at: 1_000,
      expires_at,
    }
  }

  #[test]
  fn test_sqlite_roundtrip_per_table() {
    let storage = SqliteStorage::open_in_memory().unwrap();

    storage
      .with_table(Table::Item, Mode::Write, |mut h| {
        h.write("42", row(json!({ "Id": "42" }), Some(2_000)))
      })
      .unwrap();

    let item = storage
      .with_table(Table::Item, Mode::Read, |h| h.read("42"))
      .unwrap();
    assert_eq!(item, Some(row(json!({ "Id": "42" }), Some(2_000))));

    // Tables are independent.
    let query = storage
      .with_table(Table::Query, Mode::Read, |h| h.read("42"))
      .unwrap();
    assert_eq!(query, None);
  }

  #[test]
  fn test_sqlite_failed_operation_rolls_back() {
    let storage = SqliteStorage::open_in_memory().unwrap();

    let result: Result<(), CacheError> = storage.with_table(Table::Meta, Mode::Write, |mut h| {
      h.write("cursor", row(json!(1), None))?;
      Err(CacheError::Closed)
    });
    assert!(result.is_err());

    let stored = storage
      .with_table(Table::Meta, Mode::Read, |h| h.read("cursor"))
      .unwrap();
    assert_eq!(stored, None);
  }

  #[test]
  fn test_sqlite_clear_and_close() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .with_table(Table::Query, Mode::Write, |mut h| {
        h.write("a", row(json!("x"), Some(5)))?;
        h.clear()
      })
      .unwrap();
    assert_eq!(
      storage
        .with_table(Table::Query, Mode::Read, |h| h.read("a"))
        .unwrap(),
      None
    );

    storage.close().unwrap();
    let after_close = storage.with_table(Table::Query, Mode::Read, |h| h.read("a"));
    assert!(matches!(after_close, Err(CacheError::Closed)));
  }

  #[test]
  fn test_sqlite_open_creates_parent_dirs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    let storage = SqliteStorage::open(&path).unwrap();
    storage
      .with_table(Table::Item, Mode::Write, |mut h| h.write("k", row(json!(1), Some(9))))
      .unwrap();
    assert!(path.exists());
  }

  #[test]
  fn test_memory_handle() {
    let memory = MemoryStorage::default();
    memory
      .with_table(Table::Item, |mut h| {
        assert!(!h.is_durable());
        h.write("k", row(json!(1), Some(9)))
      })
      .unwrap();
    let stored = memory.with_table(Table::Item, |h| h.read("k")).unwrap();
    assert_eq!(stored.map(|r| r.data), Some(json!(1)));
    assert_eq!(memory.with_table(Table::Meta, |h| h.read("k")).unwrap(), None);
  }

  #[test]
  fn test_row_freshness() {
    assert!(row(json!(1), Some(2_000)).is_fresh(1_999));
    assert!(!row(json!(1), Some(2_000)).is_fresh(2_000));
    assert!(row(json!(1), None).is_fresh(i64::MAX));
  }
}
