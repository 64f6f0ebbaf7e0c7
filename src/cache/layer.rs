//! Cache facade that unifies the durable and memory backends.

use chrono::{DateTime, TimeZone, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::error::CacheError;
use super::storage::{MemoryStorage, Mode, SqliteStorage, StoredRow, TableHandle};
use super::traits::{EntryInfo, QueryPayload, Table};

/// Minimum TTL applied to item entries unless configured otherwise.
pub const DEFAULT_ITEM_TTL_FLOOR: Duration = Duration::from_secs(5);
/// Minimum TTL applied to query entries unless configured otherwise.
pub const DEFAULT_QUERY_TTL_FLOOR: Duration = Duration::from_secs(2);

/// How a [`CacheStore`] should be backed.
///
/// Two stores pointing at the same `path` should use the same floors.
#[derive(Debug, Clone)]
pub struct StoreOptions {
  /// SQLite database location. `None` keeps everything in memory.
  pub path: Option<PathBuf>,
  pub item_ttl_floor: Duration,
  pub query_ttl_floor: Duration,
}

impl Default for StoreOptions {
  fn default() -> Self {
    Self {
      path: None,
      item_ttl_floor: DEFAULT_ITEM_TTL_FLOOR,
      query_ttl_floor: DEFAULT_QUERY_TTL_FLOOR,
    }
  }
}

impl StoreOptions {
  /// Memory-only store with default floors.
  pub fn memory() -> Self {
    Self::default()
  }

  /// Durable store at `path` with default floors.
  pub fn at(path: impl Into<PathBuf>) -> Self {
    Self {
      path: Some(path.into()),
      ..Self::default()
    }
  }

  pub fn with_ttl_floors(mut self, item: Duration, query: Duration) -> Self {
    self.item_ttl_floor = item;
    self.query_ttl_floor = query;
    self
  }
}

struct StoreInner {
  options: StoreOptions,
  /// Resolved once; `None` means memory for the rest of this store's life.
  durable: OnceCell<Option<Arc<SqliteStorage>>>,
  memory: MemoryStorage,
}

/// Best-effort key-value cache over the `item`, `query` and `meta` tables.
///
/// Cloning is cheap and clones share the same backends. No method returns an
/// error: backend failures are logged and reported as a miss (`get`) or as
/// `false` (`put`).
#[derive(Clone)]
pub struct CacheStore {
  inner: Arc<StoreInner>,
}

impl CacheStore {
  /// Create a store. The durable backend is opened lazily on first use.
  pub fn new(options: StoreOptions) -> Self {
    Self {
      inner: Arc::new(StoreInner {
        options,
        durable: OnceCell::new(),
        memory: MemoryStorage::default(),
      }),
    }
  }

  /// Open the durable backend now instead of on first use.
  /// Returns whether the store is durable.
  pub async fn open(&self) -> bool {
    self.durable().await.is_some()
  }

  /// Close the durable backend. Subsequent operations on a closed durable
  /// store behave as failures (misses and `false`).
  pub async fn close(&self) {
    if let Some(Some(db)) = self.inner.durable.get() {
      let db = Arc::clone(db);
      match tokio::task::spawn_blocking(move || db.close()).await {
        Ok(Ok(())) => debug!("closed durable cache store"),
        Ok(Err(e)) => warn!(error = %e, "failed to close durable cache store"),
        Err(e) => warn!(error = %e, "failed to close durable cache store"),
      }
    }
  }

  async fn durable(&self) -> Option<Arc<SqliteStorage>> {
    self
      .inner
      .durable
      .get_or_init(|| open_durable(self.inner.options.path.clone()))
      .await
      .clone()
  }

  /// Run one table operation against whichever backend is active.
  ///
  /// `f` receives a durable transaction handle or the memory table; durable
  /// operations run on the blocking pool inside a single transaction.
  async fn with_table<R, F>(&self, table: Table, mode: Mode, f: F) -> Result<R, CacheError>
  where
    F: FnOnce(TableHandle<'_>) -> Result<R, CacheError> + Send + 'static,
    R: Send + 'static,
  {
    match self.durable().await {
      Some(db) => tokio::task::spawn_blocking(move || db.with_table(table, mode, f)).await?,
      None => self.inner.memory.with_table(table, f),
    }
  }

  fn ttl_floor(&self, table: Table) -> Duration {
    match table {
      Table::Item => self.inner.options.item_ttl_floor,
      Table::Query => self.inner.options.query_ttl_floor,
      Table::Meta => Duration::ZERO,
    }
  }

  /// Effective TTL for `table`: never below the table floor nor below 1ms.
  pub fn effective_ttl(&self, table: Table, ttl: Duration) -> Duration {
    ttl.max(self.ttl_floor(table)).max(Duration::from_millis(1))
  }

  async fn read(&self, table: Table, key: &str, allow_stale: bool) -> Option<Value> {
    let now = now_ms();
    let lookup = key.to_string();

    match self
      .with_table(table, Mode::Read, move |h| h.read(&lookup))
      .await
    {
      Ok(Some(row)) if allow_stale || row.is_fresh(now) => Some(row.data),
      Ok(Some(_)) => {
        debug!(table = table.name(), key, "cache entry expired");
        None
      }
      Ok(None) => None,
      Err(e) => {
        warn!(table = table.name(), key, error = %e, "cache read failed; treating as miss");
        None
      }
    }
  }

  async fn write(&self, table: Table, key: &str, data: Value, ttl: Option<Duration>) -> bool {
    let fetched_at = now_ms();
    let expires_at = ttl.map(|ttl| {
      let ttl_ms = i64::try_from(self.effective_ttl(table, ttl).as_millis()).unwrap_or(i64::MAX);
      fetched_at.saturating_add(ttl_ms)
    });
    let row = StoredRow {
      data,
      fetched_at,
      expires_at,
    };
    let target = key.to_string();

    match self
      .with_table(table, Mode::Write, move |mut h| h.write(&target, row))
      .await
    {
      Ok(()) => true,
      Err(e) => {
        warn!(table = table.name(), key, error = %e, "cache write failed");
        false
      }
    }
  }

  fn decode<T: DeserializeOwned>(table: Table, key: &str, data: Value) -> Option<T> {
    match serde_json::from_value(data) {
      Ok(value) => Some(value),
      Err(e) => {
        warn!(table = table.name(), key, error = %e, "cached entry has unexpected shape");
        None
      }
    }
  }

  fn encode<T: Serialize>(table: Table, key: &str, data: &T) -> Option<Value> {
    match serde_json::to_value(data) {
      Ok(value) => Some(value),
      Err(e) => {
        warn!(table = table.name(), key, error = %e, "failed to encode cache entry");
        None
      }
    }
  }

  /// Read an item. Expired entries are returned only with `allow_stale`.
  pub async fn get_item<T: DeserializeOwned>(&self, key: &str, allow_stale: bool) -> Option<T> {
    let data = self.read(Table::Item, key, allow_stale).await?;
    Self::decode(Table::Item, key, data)
  }

  /// Store an item for `ttl` (clamped to the item floor).
  pub async fn put_item<T: Serialize>(&self, key: &str, data: &T, ttl: Duration) -> bool {
    match Self::encode(Table::Item, key, data) {
      Some(value) => self.write(Table::Item, key, value, Some(ttl)).await,
      None => false,
    }
  }

  /// Read a query entry. Expired entries are returned only with `allow_stale`.
  pub async fn get_query(&self, key: &str, allow_stale: bool) -> Option<QueryPayload> {
    let data = self.read(Table::Query, key, allow_stale).await?;
    Self::decode(Table::Query, key, data)
  }

  /// Store a query entry for `ttl` (clamped to the query floor).
  pub async fn put_query(&self, key: &str, payload: &QueryPayload, ttl: Duration) -> bool {
    match Self::encode(Table::Query, key, payload) {
      Some(value) => self.write(Table::Query, key, value, Some(ttl)).await,
      None => false,
    }
  }

  pub async fn meta_get<V: DeserializeOwned>(&self, key: &str) -> Option<V> {
    let data = self.read(Table::Meta, key, true).await?;
    Self::decode(Table::Meta, key, data)
  }

  /// Like [`meta_get`](Self::meta_get), but reports backend and decode
  /// failures instead of folding them into a miss.
  pub(crate) async fn meta_lookup<V: DeserializeOwned>(
    &self,
    key: &str,
  ) -> Result<Option<V>, CacheError> {
    let lookup = key.to_string();
    let row = self
      .with_table(Table::Meta, Mode::Read, move |h| h.read(&lookup))
      .await?;
    match row {
      Some(row) => Ok(Some(serde_json::from_value(row.data)?)),
      None => Ok(None),
    }
  }

  pub async fn meta_put<V: Serialize>(&self, key: &str, value: &V) -> bool {
    match Self::encode(Table::Meta, key, value) {
      Some(value) => self.write(Table::Meta, key, value, None).await,
      None => false,
    }
  }

  /// Remove every entry from `table`.
  pub async fn clear(&self, table: Table) -> bool {
    match self
      .with_table(table, Mode::Write, |mut h| h.clear())
      .await
    {
      Ok(()) => {
        info!(table = table.name(), "cleared cache table");
        true
      }
      Err(e) => {
        warn!(table = table.name(), error = %e, "failed to clear cache table");
        false
      }
    }
  }

  /// Timestamps of an entry, regardless of freshness.
  pub async fn entry_info(&self, table: Table, key: &str) -> Option<EntryInfo> {
    let lookup = key.to_string();
    let row = match self
      .with_table(table, Mode::Read, move |h| h.read(&lookup))
      .await
    {
      Ok(row) => row?,
      Err(e) => {
        warn!(table = table.name(), key, error = %e, "cache read failed");
        return None;
      }
    };

    Some(EntryInfo {
      fetched_at: from_ms(row.fetched_at)?,
      expires_at: match row.expires_at {
        Some(ms) => Some(from_ms(ms)?),
        None => None,
      },
    })
  }
}

async fn open_durable(path: Option<PathBuf>) -> Option<Arc<SqliteStorage>> {
  let Some(path) = path else {
    info!("no cache path configured; using in-memory cache");
    return None;
  };

  let location = path.clone();
  match tokio::task::spawn_blocking(move || SqliteStorage::open(&path)).await {
    Ok(Ok(storage)) => {
      info!(path = %location.display(), "opened durable cache store");
      Some(Arc::new(storage))
    }
    Ok(Err(e)) => {
      warn!(path = %location.display(), error = %e, "durable cache unavailable; falling back to memory");
      None
    }
    Err(e) => {
      warn!(error = %e, "durable cache open task failed; falling back to memory");
      None
    }
  }
}

fn now_ms() -> i64 {
  Utc::now().timestamp_millis()
}

fn from_ms(ms: i64) -> Option<DateTime<Utc>> {
  Utc.timestamp_millis_opt(ms).single()
}
