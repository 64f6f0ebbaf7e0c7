//! Error types for the cache and the fetchers built on it.

use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::Report;
use thiserror::Error;

/// Failure inside a cache backend.
///
/// These never cross the [`CacheStore`](super::CacheStore) boundary: the store
/// logs them and reports a miss or a failed write instead.
#[derive(Debug, Error)]
pub enum CacheError {
  #[error("cache database error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("failed to encode or decode cache entry: {0}")]
  Serde(#[from] serde_json::Error),

  #[error("failed to create cache directory {}: {source}", .path.display())]
  Directory {
    path: PathBuf,
    source: std::io::Error,
  },

  #[error("durable cache store is closed")]
  Closed,

  #[error("cache worker task failed: {0}")]
  Task(#[from] tokio::task::JoinError),
}

/// Failure surfaced by the item fetchers.
///
/// Cloneable so every caller coalesced onto one in-flight request receives
/// the same error.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
  #[error("remote fetch failed: {0}")]
  Remote(Arc<Report>),

  #[error("fetch for '{0}' was cancelled")]
  Cancelled(String),

  #[error("invalid key at position {0}: keys must be non-empty")]
  InvalidKey(usize),
}

impl FetchError {
  pub fn remote(report: Report) -> Self {
    Self::Remote(Arc::new(report))
  }
}
