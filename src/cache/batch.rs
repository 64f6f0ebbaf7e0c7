//! Batch resolution: cache pass, chunked bulk fetch, then bounded per-item
//! fetches for whatever is still missing.

use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::FetchError;
use super::flight::{FlightResult, SingleFlight};
use super::layer::CacheStore;
use super::traits::{Cacheable, ItemSource};

pub const MIN_CHUNK_SIZE: usize = 10;
pub const MAX_CHUNK_SIZE: usize = 200;

/// Tuning for an [`ItemFetcher`].
#[derive(Debug, Clone)]
pub struct FetcherOptions {
  /// How long fetched items stay fresh.
  pub ttl: Duration,
  /// Serve an expired entry when the source fails.
  pub allow_stale_on_error: bool,
  /// Ids per bulk request, clamped to `MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE`.
  pub chunk_size: usize,
  /// Maximum concurrent single-item fetches.
  pub concurrency: usize,
}

impl Default for FetcherOptions {
  fn default() -> Self {
    Self {
      ttl: Duration::from_secs(10 * 60),
      allow_stale_on_error: true,
      chunk_size: 100,
      concurrency: 4,
    }
  }
}

/// Cached access to items of one [`ItemSource`], one at a time or in bulk.
pub struct ItemFetcher<S: ItemSource> {
  cache: CacheStore,
  source: Arc<S>,
  single: SingleFlight<S>,
  ttl: Duration,
  chunk_size: usize,
  concurrency: usize,
}

/// Build a cached fetcher for `source`.
pub fn create_cached_item_fetcher<S: ItemSource>(
  cache: CacheStore,
  source: Arc<S>,
  options: FetcherOptions,
) -> ItemFetcher<S> {
  ItemFetcher::new(cache, source, options)
}

impl<S: ItemSource> ItemFetcher<S> {
  pub fn new(cache: CacheStore, source: Arc<S>, options: FetcherOptions) -> Self {
    let single = SingleFlight::new(
      cache.clone(),
      Arc::clone(&source),
      options.ttl,
      options.allow_stale_on_error,
    );

    Self {
      cache,
      source,
      single,
      ttl: options.ttl,
      chunk_size: options.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE),
      concurrency: options.concurrency.max(1),
    }
  }

  /// Resolve one item.
  pub async fn get(&self, id: &str) -> FlightResult<S::Item> {
    self.single.resolve(id).await
  }

  /// Resolve one item, giving up when `token` is cancelled.
  pub async fn get_with_cancel(&self, id: &str, token: CancellationToken) -> FlightResult<S::Item> {
    self.single.resolve_with_cancel(id, token).await
  }

  /// Resolve many items. The output lines up with `ids`, duplicates included.
  ///
  /// Items that could not be fetched (and had no stale copy) come back as
  /// `None`; only an empty id is an error.
  pub async fn many(&self, ids: &[String]) -> Result<Vec<Option<S::Item>>, FetchError> {
    if let Some(index) = ids.iter().position(|id| id.is_empty()) {
      return Err(FetchError::InvalidKey(index));
    }

    let mut resolved: Vec<Option<S::Item>> = vec![None; ids.len()];
    let mut missing: Vec<&str> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();

    for (slot, id) in resolved.iter_mut().zip(ids) {
      match self.cache.get_item(id, false).await {
        Some(hit) => *slot = Some(hit),
        None => {
          if seen.insert(id.as_str()) {
            missing.push(id.as_str());
          }
        }
      }
    }

    if missing.is_empty() {
      return Ok(resolved);
    }
    debug!(
      requested = ids.len(),
      missing = missing.len(),
      "resolving items not in cache"
    );

    let bulk = if self.source.supports_bulk() {
      self.bulk_fetch(&missing).await
    } else {
      HashMap::new()
    };

    let mut pending = Vec::new();
    for (index, (slot, id)) in resolved.iter_mut().zip(ids).enumerate() {
      if slot.is_some() {
        continue;
      }
      if let Some(item) = bulk.get(id.as_str()) {
        *slot = Some(item.clone());
      } else if let Some(hit) = self.cache.get_item(id, false).await {
        *slot = Some(hit);
      } else {
        pending.push(index);
      }
    }

    for (index, item) in self.resolve_pending(ids, &pending).await {
      resolved[index] = item;
    }

    Ok(resolved)
  }

  /// Fetch `missing` in chunks. Stops at the first failed chunk; whatever is
  /// not returned is left for the per-item pass.
  async fn bulk_fetch(&self, missing: &[&str]) -> HashMap<String, S::Item> {
    let mut fetched = HashMap::new();

    for chunk in missing.chunks(self.chunk_size) {
      let ids: Vec<String> = chunk.iter().map(|id| id.to_string()).collect();
      match self.source.fetch_many(&ids).await {
        Ok(items) => {
          debug!(requested = ids.len(), returned = items.len(), "bulk fetch");
          for item in items {
            let key = item.cache_key();
            self.cache.put_item(&key, &item, self.ttl).await;
            fetched.insert(key, item);
          }
        }
        Err(e) => {
          warn!(
            chunk = ids.len(),
            error = %e,
            "bulk fetch failed; falling back to per-item fetches"
          );
          break;
        }
      }
    }

    fetched
  }

  /// Resolve the positions in `pending` with at most `concurrency` workers.
  /// Each worker takes the next unclaimed position until none remain.
  async fn resolve_pending(
    &self,
    ids: &[String],
    pending: &[usize],
  ) -> Vec<(usize, Option<S::Item>)> {
    let next = AtomicUsize::new(0);
    let next = &next;
    let workers = self.concurrency.min(pending.len());

    let results = join_all((0..workers).map(|_| async move {
      let mut done = Vec::new();
      loop {
        let claimed = next.fetch_add(1, Ordering::Relaxed);
        let Some(&index) = pending.get(claimed) else {
          break;
        };
        let id = &ids[index];
        match self.single.resolve(id).await {
          Ok(item) => done.push((index, item)),
          Err(e) => warn!(id = %id, error = %e, "item fetch failed"),
        }
      }
      done
    }))
    .await;

    results.into_iter().flatten().collect()
  }
}
