//! Generic client-side caching layer for fetched remote records.
//!
//! This module is independent of any particular remote API and provides:
//! - A best-effort key-value store with `item`, `query` and `meta` tables,
//!   backed by SQLite or, when that cannot be opened, by memory
//! - TTL expiry with per-table floors and explicit stale reads
//! - Request coalescing so concurrent callers share one fetch per key
//! - Bulk-then-individual batch resolution under a bounded worker pool
//! - A delta watcher that prefetches newly created records using a
//!   persisted cursor

mod batch;
mod error;
mod flight;
mod key;
mod layer;
mod query;
mod storage;
mod traits;
mod watcher;

pub use batch::{create_cached_item_fetcher, FetcherOptions, ItemFetcher};
pub use error::{CacheError, FetchError};
pub use flight::{FlightResult, SingleFlight};
pub use key::compute_key;
pub use layer::{CacheStore, StoreOptions, DEFAULT_ITEM_TTL_FLOOR, DEFAULT_QUERY_TTL_FLOOR};
pub use query::{cached_json, cached_text, json_query_key, text_query_key, QueryOptions};
pub use storage::SqliteStorage;
pub use traits::{Cacheable, EntryInfo, FeedSource, ItemSource, QueryKind, QueryPayload, Table};
pub use watcher::{
  start_library_delta_watcher, DeltaWatcher, TickReport, WatchCursor, WatchHandle, WatchState,
  WatcherOptions, MIN_POLL_INTERVAL,
};
