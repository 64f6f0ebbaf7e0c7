//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// Trait for records that can be cached in the item table.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Identity of the record on the remote side (e.g. an item id).
  fn cache_key(&self) -> String;

  /// When the record was created remotely, if known.
  /// Records without a creation time are ignored by the delta watcher.
  fn created_at(&self) -> Option<DateTime<Utc>>;
}

/// Remote source of individual records.
pub trait ItemSource: Send + Sync + 'static {
  type Item: Cacheable;

  /// Fetch one record. `Ok(None)` means "not found", not an error.
  fn fetch_one<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Self::Item>>>;

  /// Whether [`fetch_many`](Self::fetch_many) is backed by a real bulk endpoint.
  fn supports_bulk(&self) -> bool {
    false
  }

  /// Fetch several records at once. Missing ids are simply absent from the
  /// result; every returned record carries its own [`Cacheable::cache_key`].
  fn fetch_many<'a>(&'a self, ids: &'a [String]) -> BoxFuture<'a, Result<Vec<Self::Item>>> {
    let _ = ids;
    Box::pin(async { Ok(Vec::new()) })
  }
}

/// Remote source polled by the delta watcher.
pub trait FeedSource: Send + Sync + 'static {
  type Item: Cacheable;

  /// Most recently created records, newest first.
  fn latest(&self, limit: usize) -> BoxFuture<'_, Result<Vec<Self::Item>>>;

  /// Broader listing sorted by creation time, used when `latest` fails.
  fn recently_created(&self, limit: usize) -> BoxFuture<'_, Result<Vec<Self::Item>>>;
}

/// Logical tables of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
  Item,
  Query,
  Meta,
}

impl Table {
  pub const ALL: [Table; 3] = [Table::Item, Table::Query, Table::Meta];

  pub fn name(self) -> &'static str {
    match self {
      Table::Item => "item",
      Table::Query => "query",
      Table::Meta => "meta",
    }
  }
}

/// Payload of a query-table entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum QueryPayload {
  Text(String),
  Json(Value),
}

/// Discriminator of a [`QueryPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
  Text,
  Json,
}

impl QueryPayload {
  pub fn kind(&self) -> QueryKind {
    match self {
      QueryPayload::Text(_) => QueryKind::Text,
      QueryPayload::Json(_) => QueryKind::Json,
    }
  }
}

/// Timestamps of a stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
  pub fetched_at: DateTime<Utc>,
  /// `None` for meta records, which never expire.
  pub expires_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_query_payload_carries_kind() {
    let text = serde_json::to_value(QueryPayload::Text("hello".into())).unwrap();
    assert_eq!(text, json!({ "kind": "text", "data": "hello" }));

    let payload: QueryPayload =
      serde_json::from_value(json!({ "kind": "json", "data": { "a": 1 } })).unwrap();
    assert_eq!(payload.kind(), QueryKind::Json);
  }

  #[test]
  fn test_table_names() {
    let names: Vec<_> = Table::ALL.iter().map(|t| t.name()).collect();
    assert_eq!(names, vec!["item", "query", "meta"]);
  }
}
