//! Polling watcher that discovers newly created remote records.
//!
//! Each tick asks the feed for its newest records, compares their creation
//! times against a cursor persisted in the `meta` table, prefetches the new
//! ones into the item cache and moves the cursor forward. The cursor never
//! moves backwards, and a failed poll leaves it untouched so the next tick
//! retries from the same point.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::batch::ItemFetcher;
use super::error::CacheError;
use super::layer::CacheStore;
use super::traits::{Cacheable, FeedSource, ItemSource};

/// Shortest allowed delay between ticks.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WatcherOptions {
  /// Identity of the watched collection (e.g. a user id). Each key has its
  /// own cursor.
  pub watch_key: String,
  pub interval: Duration,
  /// Records requested per poll.
  pub latest_limit: usize,
  /// Maximum new records prefetched per tick.
  pub prefetch_limit: usize,
}

impl WatcherOptions {
  pub fn new(watch_key: impl Into<String>) -> Self {
    Self {
      watch_key: watch_key.into(),
      interval: Duration::from_secs(5 * 60),
      latest_limit: 30,
      prefetch_limit: 20,
    }
  }
}

/// Persisted high-water mark of a watch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchCursor {
  /// Creation time (epoch ms) of the newest record seen so far.
  pub last_seen_created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
  Idle,
  Polling,
  /// Terminal: a stopped watcher never polls again.
  Stopped,
}

/// What one tick observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
  pub polled: usize,
  pub new_records: usize,
  pub prefetched: usize,
  pub cursor: i64,
}

pub struct DeltaWatcher<F, S>
where
  F: FeedSource,
  S: ItemSource<Item = F::Item>,
{
  cache: CacheStore,
  feed: Arc<F>,
  items: Arc<ItemFetcher<S>>,
  options: WatcherOptions,
}

impl<F, S> DeltaWatcher<F, S>
where
  F: FeedSource,
  S: ItemSource<Item = F::Item>,
{
  pub fn new(
    cache: CacheStore,
    feed: Arc<F>,
    items: Arc<ItemFetcher<S>>,
    options: WatcherOptions,
  ) -> Self {
    Self {
      cache,
      feed,
      items,
      options,
    }
  }

  fn cursor_key(&self) -> String {
    format!("delta-cursor:{}", self.options.watch_key)
  }

  /// Delay between ticks after applying [`MIN_POLL_INTERVAL`].
  pub fn interval(&self) -> Duration {
    self.options.interval.max(MIN_POLL_INTERVAL)
  }

  /// Current persisted cursor (0 if none yet or unreadable).
  pub async fn cursor(&self) -> i64 {
    self.load_cursor().await.unwrap_or_default()
  }

  async fn load_cursor(&self) -> Result<i64, CacheError> {
    let stored = self
      .cache
      .meta_lookup::<WatchCursor>(&self.cursor_key())
      .await?;
    Ok(stored.unwrap_or_default().last_seen_created_at)
  }

  /// Run a single poll. Returns `None` when the cursor could not be read or
  /// both feed queries failed, in which case nothing was changed.
  pub async fn tick(&self) -> Option<TickReport> {
    let cursor = match self.load_cursor().await {
      Ok(cursor) => cursor,
      Err(e) => {
        warn!(
          watch = %self.options.watch_key,
          error = %e,
          "failed to read delta cursor; skipping tick"
        );
        return None;
      }
    };
    let records = self.poll().await?;

    let mut newest = cursor;
    let mut fresh = Vec::new();
    for record in &records {
      let Some(created_at) = record.created_at().map(|t| t.timestamp_millis()) else {
        continue;
      };
      newest = newest.max(created_at);
      if created_at > cursor {
        fresh.push(record.cache_key());
      }
    }
    fresh.retain(|id| !id.is_empty());
    let new_records = fresh.len();
    fresh.truncate(self.options.prefetch_limit);

    let prefetched = if fresh.is_empty() {
      0
    } else {
      match self.items.many(&fresh).await {
        Ok(found) => found.iter().filter(|item| item.is_some()).count(),
        Err(e) => {
          debug!(error = %e, "prefetch of new records failed");
          0
        }
      }
    };

    if newest > cursor {
      let next = WatchCursor {
        last_seen_created_at: newest,
      };
      if self.cache.meta_put(&self.cursor_key(), &next).await {
        info!(
          watch = %self.options.watch_key,
          cursor = newest,
          new_records,
          "advanced delta cursor"
        );
      } else {
        warn!(watch = %self.options.watch_key, "failed to persist delta cursor");
      }
    }

    Some(TickReport {
      polled: records.len(),
      new_records,
      prefetched,
      cursor: newest,
    })
  }

  /// Newest records from the primary query, or the fallback query when the
  /// primary fails or comes back empty.
  async fn poll(&self) -> Option<Vec<F::Item>> {
    let limit = self.options.latest_limit;

    match self.feed.latest(limit).await {
      Ok(records) if !records.is_empty() => return Some(records),
      Ok(_) => debug!("latest query returned nothing; trying fallback"),
      Err(e) => warn!(error = %e, "latest query failed; trying fallback"),
    }

    match self.feed.recently_created(limit).await {
      Ok(records) => Some(records),
      Err(e) => {
        warn!(error = %e, "fallback query failed; skipping tick");
        None
      }
    }
  }

  /// Start polling in the background. The first tick runs immediately.
  pub fn start(self) -> WatchHandle {
    let stop = CancellationToken::new();
    let state = Arc::new(Mutex::new(WatchState::Idle));
    let interval = self.interval();

    let task_stop = stop.clone();
    let task_state = Arc::clone(&state);
    let task = tokio::spawn(async move {
      loop {
        if !transition(&task_state, WatchState::Idle, WatchState::Polling) {
          break;
        }
        match self.tick().await {
          Some(report) => debug!(?report, "delta tick"),
          None => debug!("delta tick skipped"),
        }
        transition(&task_state, WatchState::Polling, WatchState::Idle);

        tokio::select! {
          biased;
          _ = task_stop.cancelled() => break,
          _ = tokio::time::sleep(interval) => {}
        }
      }
      debug!(watch = %self.options.watch_key, "delta watcher stopped");
    });

    WatchHandle { stop, state, task }
  }
}

/// Move `state` from `from` to `to`. Fails once the watcher is stopped.
fn transition(state: &Mutex<WatchState>, from: WatchState, to: WatchState) -> bool {
  let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
  if *state != from {
    return false;
  }
  *state = to;
  true
}

/// Start a watcher over `feed`, prefetching through `items`.
pub fn start_library_delta_watcher<F, S>(
  cache: CacheStore,
  feed: Arc<F>,
  items: Arc<ItemFetcher<S>>,
  options: WatcherOptions,
) -> WatchHandle
where
  F: FeedSource,
  S: ItemSource<Item = F::Item>,
{
  DeltaWatcher::new(cache, feed, items, options).start()
}

/// Handle to a running watcher.
pub struct WatchHandle {
  stop: CancellationToken,
  state: Arc<Mutex<WatchState>>,
  task: JoinHandle<()>,
}

impl WatchHandle {
  /// Stop polling. A tick already in progress finishes but nothing further
  /// is scheduled.
  pub fn stop(&self) {
    *self.state.lock().unwrap_or_else(PoisonError::into_inner) = WatchState::Stopped;
    self.stop.cancel();
  }

  pub fn state(&self) -> WatchState {
    *self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Stop and wait for the background task to exit.
  pub async fn shutdown(self) {
    self.stop();
    if let Err(e) = self.task.await {
      warn!(error = %e, "delta watcher task failed");
    }
  }
}
