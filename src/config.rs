use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{FetcherOptions, QueryOptions, SqliteStorage, StoreOptions, WatcherOptions};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub server: ServerConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub watcher: WatcherConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  pub url: String,
  /// User whose libraries are cached and watched
  pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Database location (defaults to $XDG_DATA_HOME/mediacache/cache.db)
  pub path: Option<PathBuf>,
  /// Keep everything in memory, even if a database could be opened
  pub memory_only: bool,
  pub item_ttl_secs: u64,
  pub query_ttl_secs: u64,
  pub item_ttl_floor_ms: u64,
  pub query_ttl_floor_ms: u64,
  pub allow_stale_on_error: bool,
  pub bulk_chunk_size: usize,
  pub concurrency: usize,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      path: None,
      memory_only: false,
      item_ttl_secs: 10 * 60,
      query_ttl_secs: 5 * 60,
      item_ttl_floor_ms: 5_000,
      query_ttl_floor_ms: 2_000,
      allow_stale_on_error: true,
      bulk_chunk_size: 100,
      concurrency: 4,
    }
  }
}

impl CacheConfig {
  pub fn store_options(&self) -> StoreOptions {
    let path = if self.memory_only {
      None
    } else {
      self.path.clone().or_else(SqliteStorage::default_path)
    };

    StoreOptions {
      path,
      item_ttl_floor: Duration::from_millis(self.item_ttl_floor_ms),
      query_ttl_floor: Duration::from_millis(self.query_ttl_floor_ms),
    }
  }

  pub fn fetcher_options(&self) -> FetcherOptions {
    FetcherOptions {
      ttl: Duration::from_secs(self.item_ttl_secs),
      allow_stale_on_error: self.allow_stale_on_error,
      chunk_size: self.bulk_chunk_size,
      concurrency: self.concurrency,
    }
  }

  pub fn query_options(&self) -> QueryOptions {
    QueryOptions {
      ttl: Duration::from_secs(self.query_ttl_secs),
      allow_stale_on_error: self.allow_stale_on_error,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
  pub interval_secs: u64,
  pub latest_limit: usize,
  pub prefetch_limit: usize,
}

impl Default for WatcherConfig {
  fn default() -> Self {
    Self {
      interval_secs: 5 * 60,
      latest_limit: 30,
      prefetch_limit: 20,
    }
  }
}

impl WatcherConfig {
  pub fn watcher_options(&self, watch_key: String) -> WatcherOptions {
    WatcherOptions {
      interval: Duration::from_secs(self.interval_secs),
      latest_limit: self.latest_limit,
      prefetch_limit: self.prefetch_limit,
      ..WatcherOptions::new(watch_key)
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./mediacache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/mediacache/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/mediacache/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("mediacache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("mediacache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Get the media server API token from environment variables.
  ///
  /// Checks MEDIACACHE_TOKEN first, then MEDIA_SERVER_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("MEDIACACHE_TOKEN")
      .or_else(|_| std::env::var("MEDIA_SERVER_TOKEN"))
      .map_err(|_| {
        eyre!("API token not found. Set MEDIACACHE_TOKEN or MEDIA_SERVER_TOKEN environment variable.")
      })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse(
      r#"
server:
  url: https://media.example.com
  user_id: u1
"#,
    )
    .unwrap();

    assert_eq!(config.server.user_id, "u1");
    assert_eq!(config.cache.item_ttl_floor_ms, 5_000);
    assert_eq!(config.watcher.prefetch_limit, 20);
    assert_eq!(config.cache.fetcher_options().chunk_size, 100);
  }

  #[test]
  fn test_overrides() {
    let config = Config::parse(
      r#"
server:
  url: https://media.example.com
  user_id: u1
cache:
  memory_only: true
  item_ttl_floor_ms: 100
watcher:
  interval_secs: 60
"#,
    )
    .unwrap();

    let store = config.cache.store_options();
    assert_eq!(store.path, None);
    assert_eq!(store.item_ttl_floor, Duration::from_millis(100));
    assert_eq!(store.query_ttl_floor, Duration::from_millis(2_000));

    let watcher = config.watcher.watcher_options("library:u1".to_string());
    assert_eq!(watcher.interval, Duration::from_secs(60));
    assert_eq!(watcher.watch_key, "library:u1");
  }

  #[test]
  fn test_missing_server_is_an_error() {
    assert!(Config::parse("cache:\n  concurrency: 2\n").is_err());
  }

  #[test]
  fn test_explicit_path_must_exist() {
    let missing = Path::new("/definitely/not/here/mediacache.yaml");
    assert!(Config::load(Some(missing)).is_err());
  }
}
