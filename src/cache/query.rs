//! Cached generic remote content (JSON documents and text).
//!
//! Unlike the item fetchers these helpers never fail: on total failure they
//! return `None`.

use color_eyre::Result;
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::key::compute_key;
use super::layer::CacheStore;
use super::traits::{QueryKind, QueryPayload};

#[derive(Debug, Clone)]
pub struct QueryOptions {
  pub ttl: Duration,
  pub allow_stale_on_error: bool,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      ttl: Duration::from_secs(5 * 60),
      allow_stale_on_error: true,
    }
  }
}

pub fn json_query_key(url: &str, params: &Value) -> String {
  compute_key(&[json!("json"), json!(url), params.clone()])
}

pub fn text_query_key(url: &str) -> String {
  compute_key(&[json!("text"), json!(url)])
}

/// Fetch a JSON document through the query cache.
pub async fn cached_json<F, Fut>(
  cache: &CacheStore,
  url: &str,
  params: &Value,
  options: &QueryOptions,
  fetch: F,
) -> Option<Value>
where
  F: FnOnce() -> Fut,
  Fut: Future<Output = Result<Value>>,
{
  let key = json_query_key(url, params);
  let fetch = async move { fetch().await.map(QueryPayload::Json) };

  match cached_query(cache, &key, QueryKind::Json, options, fetch).await? {
    QueryPayload::Json(value) => Some(value),
    QueryPayload::Text(_) => None,
  }
}

/// Fetch a text document through the query cache.
pub async fn cached_text<F, Fut>(
  cache: &CacheStore,
  url: &str,
  options: &QueryOptions,
  fetch: F,
) -> Option<String>
where
  F: FnOnce() -> Fut,
  Fut: Future<Output = Result<String>>,
{
  let key = text_query_key(url);
  let fetch = async move { fetch().await.map(QueryPayload::Text) };

  match cached_query(cache, &key, QueryKind::Text, options, fetch).await? {
    QueryPayload::Text(text) => Some(text),
    QueryPayload::Json(_) => None,
  }
}

async fn cached_query<Fut>(
  cache: &CacheStore,
  key: &str,
  kind: QueryKind,
  options: &QueryOptions,
  fetch: Fut,
) -> Option<QueryPayload>
where
  Fut: Future<Output = Result<QueryPayload>>,
{
  // An entry of the other kind under this key is a hash collision: ignore it.
  if let Some(hit) = cache.get_query(key, false).await.filter(|p| p.kind() == kind) {
    debug!(key, "query cache hit");
    return Some(hit);
  }

  let stale = if options.allow_stale_on_error {
    cache.get_query(key, true).await.filter(|p| p.kind() == kind)
  } else {
    None
  };

  match fetch.await {
    Ok(payload) => {
      cache.put_query(key, &payload, options.ttl).await;
      Some(payload)
    }
    Err(e) => {
      if stale.is_some() {
        warn!(key, error = %e, "query fetch failed; serving stale entry");
      } else {
        warn!(key, error = %e, "query fetch failed");
      }
      stale
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::layer::StoreOptions;
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn store() -> CacheStore {
    CacheStore::new(
      StoreOptions::memory().with_ttl_floors(Duration::from_millis(1), Duration::from_millis(1)),
    )
  }

  fn short() -> QueryOptions {
    QueryOptions {
      ttl: Duration::from_millis(10),
      allow_stale_on_error: true,
    }
  }

  #[tokio::test]
  async fn test_json_is_cached() {
    let cache = store();
    let calls = AtomicUsize::new(0);
    let calls = &calls;
    let params = json!({ "UserId": "u1" });
    let fetch = move || async move {
      calls.fetch_add(1, Ordering::SeqCst);
      Ok(json!({ "Items": [] }))
    };

    let options = QueryOptions::default();
    let first = cached_json(&cache, "/Items", &params, &options, fetch).await;
    let second = cached_json(&cache, "/Items", &params, &options, fetch).await;

    assert_eq!(first, Some(json!({ "Items": [] })));
    assert_eq!(second, first);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_params_are_part_of_the_key() {
    assert_ne!(
      json_query_key("/Items", &json!({ "UserId": "u1" })),
      json_query_key("/Items", &json!({ "UserId": "u2" }))
    );
    assert_ne!(json_query_key("/a", &Value::Null), text_query_key("/a"));
  }

  #[tokio::test]
  async fn test_stale_text_on_error() {
    let cache = store();
    let fetched = cached_text(&cache, "/motd", &short(), || async { Ok("hello".to_string()) }).await;
    assert_eq!(fetched.as_deref(), Some("hello"));

    tokio::time::sleep(Duration::from_millis(20)).await;
    let stale = cached_text(&cache, "/motd", &short(), || async { Err(eyre!("offline")) }).await;
    assert_eq!(stale.as_deref(), Some("hello"));
  }

  #[tokio::test]
  async fn test_total_failure_is_none() {
    let cache = store();
    let options = QueryOptions {
      allow_stale_on_error: false,
      ..short()
    };
    cached_text(&cache, "/motd", &options, || async { Ok("hello".to_string()) }).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let result = cached_text(&cache, "/motd", &options, || async { Err(eyre!("offline")) }).await;
    assert_eq!(result, None);

    let never = cached_json(&cache, "/x", &Value::Null, &options, || async { Err(eyre!("offline")) }).await;
    assert_eq!(never, None);
  }
}
