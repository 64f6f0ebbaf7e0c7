//! Cached media client that wraps MediaServerClient with transparent caching.

use color_eyre::Result;
use serde_json::Value;
use std::sync::Arc;

use crate::cache::{
  cached_json, cached_text, create_cached_item_fetcher, start_library_delta_watcher, CacheStore,
  ItemFetcher, QueryOptions, WatchHandle,
};
use crate::config::Config;

use super::cache::library_watch_key;
use super::client::MediaServerClient;
use super::types::LibraryItem;

/// Media client with transparent caching support.
///
/// Item lookups go through the single-flight and batch fetchers; generic
/// documents go through the query cache and degrade to `None`.
#[derive(Clone)]
pub struct CachedMediaClient {
  inner: Arc<MediaServerClient>,
  cache: CacheStore,
  items: Arc<ItemFetcher<MediaServerClient>>,
  query_options: QueryOptions,
  config: Config,
}

impl CachedMediaClient {
  /// Create a new cached client from configuration.
  pub fn new(config: &Config) -> Result<Self> {
    let inner = MediaServerClient::new(config)?;
    let cache = CacheStore::new(config.cache.store_options());
    Ok(Self::with_parts(inner, cache, config))
  }

  pub fn with_parts(inner: MediaServerClient, cache: CacheStore, config: &Config) -> Self {
    let inner = Arc::new(inner);
    let items = Arc::new(create_cached_item_fetcher(
      cache.clone(),
      Arc::clone(&inner),
      config.cache.fetcher_options(),
    ));

    Self {
      inner,
      cache,
      items,
      query_options: config.cache.query_options(),
      config: config.clone(),
    }
  }

  pub fn cache(&self) -> &CacheStore {
    &self.cache
  }

  /// Get a single item. Errors are surfaced unless a stale copy is available.
  pub async fn get_item(&self, id: &str) -> Result<Option<LibraryItem>> {
    Ok(self.items.get(id).await?)
  }

  /// Get several items, aligned with `ids`.
  pub async fn get_items(&self, ids: &[String]) -> Result<Vec<Option<LibraryItem>>> {
    Ok(self.items.many(ids).await?)
  }

  /// Fetch a JSON document through the query cache.
  pub async fn query_json(&self, path: &str, params: &Value) -> Option<Value> {
    let inner = Arc::clone(&self.inner);
    cached_json(&self.cache, path, params, &self.query_options, || async move {
      inner.fetch_json(path, params).await
    })
    .await
  }

  /// Fetch a text document through the query cache.
  pub async fn query_text(&self, path: &str) -> Option<String> {
    let inner = Arc::clone(&self.inner);
    cached_text(&self.cache, path, &self.query_options, || async move {
      inner.fetch_text(path).await
    })
    .await
  }

  /// Start watching the user's libraries for newly added items.
  pub fn watch_library(&self) -> WatchHandle {
    let options = self
      .config
      .watcher
      .watcher_options(library_watch_key(self.inner.user_id()));

    start_library_delta_watcher(
      self.cache.clone(),
      Arc::clone(&self.inner),
      Arc::clone(&self.items),
      options,
    )
  }
}
