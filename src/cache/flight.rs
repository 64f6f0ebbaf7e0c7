//! Request coalescing for single-record fetches.

use color_eyre::eyre::eyre;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::FetchError;
use super::layer::CacheStore;
use super::traits::ItemSource;

pub type FlightResult<T> = Result<Option<T>, FetchError>;

type Flight<T> = Shared<BoxFuture<'static, FlightResult<T>>>;

struct InFlight<T> {
  id: u64,
  flight: Flight<T>,
}

type InFlightMap<T> = Arc<Mutex<HashMap<String, InFlight<T>>>>;

/// Removes its flight from the in-flight map when the flight task settles,
/// so the next caller starts a fresh fetch.
struct FlightGuard<T> {
  inflight: InFlightMap<T>,
  key: String,
  id: u64,
}

impl<T> Drop for FlightGuard<T> {
  fn drop(&mut self) {
    let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
    if inflight.get(&self.key).is_some_and(|f| f.id == self.id) {
      inflight.remove(&self.key);
    }
  }
}

/// Wraps an [`ItemSource`] so that concurrent callers asking for the same key
/// share one remote fetch, with optional stale-on-error fallback.
pub struct SingleFlight<S: ItemSource> {
  cache: CacheStore,
  source: Arc<S>,
  ttl: Duration,
  allow_stale_on_error: bool,
  inflight: InFlightMap<S::Item>,
  next_id: AtomicU64,
}

impl<S: ItemSource> SingleFlight<S> {
  pub fn new(cache: CacheStore, source: Arc<S>, ttl: Duration, allow_stale_on_error: bool) -> Self {
    Self {
      cache,
      source,
      ttl,
      allow_stale_on_error,
      inflight: Arc::new(Mutex::new(HashMap::new())),
      next_id: AtomicU64::new(0),
    }
  }

  /// Resolve `key` from cache or, failing that, from the source.
  ///
  /// 1. Fresh cache hit - returned without a remote call
  /// 2. A fetch for `key` already running - its result is shared
  /// 3. Otherwise a new fetch is started and its result cached
  pub async fn resolve(&self, key: &str) -> FlightResult<S::Item> {
    if let Some(hit) = self.cache.get_item(key, false).await {
      debug!(key, "item cache hit");
      return Ok(Some(hit));
    }

    let (flight, _) = self.join_or_start(key, None);
    flight.await
  }

  /// Like [`resolve`](Self::resolve), but gives up when `token` is cancelled.
  ///
  /// If this call started the fetch, cancellation aborts it: nothing is
  /// written to the cache and the key is free for the next caller. If it
  /// joined someone else's fetch, only this caller stops waiting.
  pub async fn resolve_with_cancel(
    &self,
    key: &str,
    token: CancellationToken,
  ) -> FlightResult<S::Item> {
    if token.is_cancelled() {
      return Err(FetchError::Cancelled(key.to_string()));
    }

    if let Some(hit) = self.cache.get_item(key, false).await {
      debug!(key, "item cache hit");
      return Ok(Some(hit));
    }

    let (flight, started) = self.join_or_start(key, Some(token.clone()));
    if started {
      return flight.await;
    }

    tokio::select! {
      biased;
      _ = token.cancelled() => Err(FetchError::Cancelled(key.to_string())),
      result = flight => result,
    }
  }

  /// Number of fetches currently running.
  pub fn in_flight(&self) -> usize {
    self.inflight.lock().unwrap_or_else(PoisonError::into_inner).len()
  }

  /// Returns the flight for `key` and whether this call started it.
  ///
  /// The fetch runs as its own task, so it settles (and leaves the map) even
  /// when every waiter gives up.
  fn join_or_start(
    &self,
    key: &str,
    token: Option<CancellationToken>,
  ) -> (Flight<S::Item>, bool) {
    let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);

    if let Some(existing) = inflight.get(key) {
      debug!(key, "joining in-flight fetch");
      return (existing.flight.clone(), false);
    }

    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let task = tokio::spawn(self.start(key.to_string(), id, token));
    let owner = key.to_string();
    let flight = async move {
      match task.await {
        Ok(result) => result,
        Err(e) => Err(FetchError::remote(eyre!("fetch task for '{}' failed: {}", owner, e))),
      }
    }
    .boxed()
    .shared();
    inflight.insert(
      key.to_string(),
      InFlight {
        id,
        flight: flight.clone(),
      },
    );

    (flight, true)
  }

  fn start(
    &self,
    key: String,
    id: u64,
    token: Option<CancellationToken>,
  ) -> impl Future<Output = FlightResult<S::Item>> + Send + 'static {
    let cache = self.cache.clone();
    let source = Arc::clone(&self.source);
    let ttl = self.ttl;
    let allow_stale_on_error = self.allow_stale_on_error;
    let guard = FlightGuard {
      inflight: Arc::clone(&self.inflight),
      key: key.clone(),
      id,
    };

    async move {
      let _guard = guard;
      let fetch = fetch_and_store(&cache, &*source, &key, ttl, allow_stale_on_error);

      match token {
        Some(token) => tokio::select! {
          biased;
          _ = token.cancelled() => {
            debug!(key = %key, "fetch cancelled");
            Err(FetchError::Cancelled(key.clone()))
          }
          result = fetch => result,
        },
        None => fetch.await,
      }
    }
  }
}

async fn fetch_and_store<S: ItemSource>(
  cache: &CacheStore,
  source: &S,
  key: &str,
  ttl: Duration,
  allow_stale_on_error: bool,
) -> FlightResult<S::Item> {
  let stale = if allow_stale_on_error {
    cache.get_item::<S::Item>(key, true).await
  } else {
    None
  };

  debug!(key, "fetching item from source");
  match source.fetch_one(key).await {
    Ok(Some(item)) => {
      if !cache.put_item(key, &item, ttl).await {
        debug!(key, "fetched item was not cached");
      }
      Ok(Some(item))
    }
    Ok(None) => {
      debug!(key, "source has no such item");
      Ok(stale)
    }
    Err(e) => match stale {
      Some(stale) => {
        warn!(key, error = %e, "fetch failed; serving stale entry");
        Ok(Some(stale))
      }
      None => Err(FetchError::remote(e)),
    },
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::layer::StoreOptions;
  use crate::cache::traits::Cacheable;
  use chrono::{DateTime, Utc};
  use color_eyre::eyre::eyre;
  use serde::{Deserialize, Serialize};
  use std::sync::atomic::{AtomicBool, AtomicUsize};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Item {
    id: String,
    name: String,
  }

  impl Cacheable for Item {
    fn cache_key(&self) -> String {
      self.id.clone()
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
      None
    }
  }

  #[derive(Default)]
  struct CountingSource {
    calls: AtomicUsize,
    fail: AtomicBool,
    delay: Duration,
  }

  impl ItemSource for CountingSource {
    type Item = Item;

    fn fetch_one<'a>(
      &'a self,
      id: &'a str,
    ) -> BoxFuture<'a, color_eyre::Result<Option<Item>>> {
      Box::pin(async move {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail.load(Ordering::SeqCst) {
          return Err(eyre!("source unavailable"));
        }
        if id == "missing" {
          return Ok(None);
        }
        Ok(Some(Item {
          id: id.to_string(),
          name: format!("item {}", id),
        }))
      })
    }
  }

  fn fast_store() -> CacheStore {
    CacheStore::new(
      StoreOptions::memory().with_ttl_floors(Duration::from_millis(1), Duration::from_millis(1)),
    )
  }

  fn source(delay_ms: u64) -> Arc<CountingSource> {
    Arc::new(CountingSource {
      delay: Duration::from_millis(delay_ms),
      ..Default::default()
    })
  }

  #[tokio::test]
  async fn test_concurrent_resolves_share_one_fetch() {
    let source = source(20);
    let flight = SingleFlight::new(fast_store(), source.clone(), Duration::from_secs(60), true);

    let results =
      futures::future::join_all((0..50).map(|_| flight.resolve("X"))).await;

    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    let first = results[0].clone().unwrap();
    assert!(first.is_some());
    for result in results {
      assert_eq!(result.unwrap(), first);
    }
    assert_eq!(flight.in_flight(), 0);
  }

  #[tokio::test]
  async fn test_cold_then_warm() {
    let source = source(50);
    let flight = SingleFlight::new(fast_store(), source.clone(), Duration::from_secs(60), true);

    let started = std::time::Instant::now();
    let item = flight.resolve("42").await.unwrap().unwrap();
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(item.name, "item 42");

    let started = std::time::Instant::now();
    let again = flight.resolve("42").await.unwrap().unwrap();
    assert!(started.elapsed() < Duration::from_millis(50));
    assert_eq!(again, item);
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_stale_on_error_allowed() {
    let store = fast_store();
    let source = source(0);
    let flight = SingleFlight::new(store.clone(), source.clone(), Duration::from_millis(10), true);

    let original = flight.resolve("a").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    source.fail.store(true, Ordering::SeqCst);
    let stale = flight.resolve("a").await.unwrap();
    assert_eq!(stale, Some(original));
    assert_eq!(source.calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_stale_on_error_disallowed() {
    let store = fast_store();
    let source = source(0);
    let flight = SingleFlight::new(store, source.clone(), Duration::from_millis(10), false);

    flight.resolve("a").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    source.fail.store(true, Ordering::SeqCst);
    let result = flight.resolve("a").await;
    assert!(matches!(result, Err(FetchError::Remote(_))));
  }

  #[tokio::test]
  async fn test_failure_clears_in_flight_entry() {
    let source = source(0);
    source.fail.store(true, Ordering::SeqCst);
    let flight = SingleFlight::new(fast_store(), source.clone(), Duration::from_secs(60), true);

    assert!(flight.resolve("a").await.is_err());
    assert_eq!(flight.in_flight(), 0);

    source.fail.store(false, Ordering::SeqCst);
    assert!(flight.resolve("a").await.unwrap().is_some());
    assert_eq!(source.calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_not_found_is_none() {
    let flight = SingleFlight::new(fast_store(), source(0), Duration::from_secs(60), true);
    assert_eq!(flight.resolve("missing").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_cancelled_fetch_writes_nothing() {
    let store = fast_store();
    let source = source(100);
    let flight = SingleFlight::new(store.clone(), source.clone(), Duration::from_secs(60), true);

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(10)).await;
      canceller.cancel();
    });

    let result = flight.resolve_with_cancel("a", token).await;
    assert!(matches!(result, Err(FetchError::Cancelled(_))));
    assert_eq!(flight.in_flight(), 0);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(store.get_item::<Item>("a", true).await, None);
  }

  #[tokio::test]
  async fn test_joined_caller_cancel_leaves_flight_running() {
    let store = fast_store();
    let source = source(50);
    let flight = SingleFlight::new(store.clone(), source.clone(), Duration::from_secs(60), true);

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(20)).await;
      canceller.cancel();
    });

    let (leader, follower) = tokio::join!(flight.resolve("a"), async {
      tokio::time::sleep(Duration::from_millis(5)).await;
      flight.resolve_with_cancel("a", token).await
    });
    assert!(matches!(follower, Err(FetchError::Cancelled(_))));
    assert!(leader.unwrap().is_some());
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    assert!(store.get_item::<Item>("a", false).await.is_some());
  }

  #[tokio::test]
  async fn test_abandoned_resolve_still_settles() {
    let store = fast_store();
    let source = source(100);
    let flight = SingleFlight::new(store.clone(), source.clone(), Duration::from_secs(60), true);

    for key in ["k", "l", "m"] {
      let waited = tokio::time::timeout(Duration::from_millis(10), flight.resolve(key)).await;
      assert!(waited.is_err());
    }
    assert_eq!(flight.in_flight(), 3);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(flight.in_flight(), 0);
    assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    assert!(store.get_item::<Item>("k", false).await.is_some());

    let again = flight.resolve("k").await.unwrap();
    assert!(again.is_some());
    assert_eq!(source.calls.load(Ordering::SeqCst), 3);
  }
}
