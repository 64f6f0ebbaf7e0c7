use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use mediacache::cache::{CacheStore, Table};
use mediacache::config::Config;
use mediacache::media::CachedMediaClient;

#[derive(Parser, Debug)]
#[command(name = "mediacache")]
#[command(about = "Cached access to a media library server")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/mediacache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Write logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Resolve items by id and print them as JSON
  Get {
    #[arg(required = true)]
    ids: Vec<String>,
  },
  /// Fetch a JSON document through the query cache
  Query {
    /// Server path, e.g. /Users/<id>/Views
    path: String,
    /// Query parameter as key=value (repeatable)
    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,
  },
  /// Poll for newly added items until interrupted
  Watch,
  /// Clear cached data
  Clear {
    #[arg(value_enum, default_value_t = ClearTarget::All)]
    table: ClearTarget,
  },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ClearTarget {
  Item,
  Query,
  Meta,
  All,
}

impl ClearTarget {
  fn tables(self) -> Vec<Table> {
    match self {
      ClearTarget::Item => vec![Table::Item],
      ClearTarget::Query => vec![Table::Query],
      ClearTarget::Meta => vec![Table::Meta],
      ClearTarget::All => Table::ALL.to_vec(),
    }
  }
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
  raw
    .split_once('=')
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  let Some(path) = log_file else {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .init();
    return Ok(None);
  };

  let file_name = path
    .file_name()
    .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
  let dir = path
    .parent()
    .filter(|p| !p.as_os_str().is_empty())
    .unwrap_or_else(|| Path::new("."));

  let appender = tracing_appender::rolling::never(dir, file_name);
  let (writer, guard) = tracing_appender::non_blocking(appender);
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(Some(guard))
}

async fn clear_tables(cache: &CacheStore, target: ClearTarget) -> Result<()> {
  for table in target.tables() {
    if !cache.clear(table).await {
      return Err(eyre!("Failed to clear {} table", table.name()));
    }
  }
  Ok(())
}

async fn run_remote(client: &CachedMediaClient, command: Command) -> Result<()> {
  match command {
    Command::Get { ids } => {
      let items = client.get_items(&ids).await?;
      println!("{}", serde_json::to_string_pretty(&items)?);
    }
    Command::Query { path, params } => {
      let params: Map<String, Value> = params
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();
      match client.query_json(&path, &Value::Object(params)).await {
        Some(document) => println!("{}", serde_json::to_string_pretty(&document)?),
        None => return Err(eyre!("No data available for {}", path)),
      }
    }
    Command::Watch => {
      let handle = client.watch_library();
      info!("watching for new items; press Ctrl-C to stop");
      tokio::signal::ctrl_c().await?;
      handle.shutdown().await;
    }
    Command::Clear { table } => clear_tables(client.cache(), table).await?,
  }
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_tracing(args.log_file.as_deref())?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Clearing only touches the local store, so no server token is needed
  if let Command::Clear { table } = args.command {
    let cache = CacheStore::new(config.cache.store_options());
    let result = clear_tables(&cache, table).await;
    cache.close().await;
    return result;
  }

  let client = CachedMediaClient::new(&config)?;
  let result = run_remote(&client, args.command).await;
  client.cache().close().await;
  result
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_clear_uses_configured_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let config = Config::parse(&format!(
      "server:\n  url: https://media.example.com\n  user_id: u1\ncache:\n  path: {}\n",
      path.display()
    ))
    .unwrap();

    let cache = CacheStore::new(config.cache.store_options());
    assert!(cache.meta_put("delta-cursor:u1", &42).await);
    assert!(cache.put_item("a", &"item", std::time::Duration::from_secs(60)).await);

    clear_tables(&cache, ClearTarget::Meta).await.unwrap();
    assert_eq!(cache.meta_get::<i64>("delta-cursor:u1").await, None);
    assert_eq!(cache.get_item::<String>("a", false).await.as_deref(), Some("item"));

    clear_tables(&cache, ClearTarget::All).await.unwrap();
    assert_eq!(cache.get_item::<String>("a", true).await, None);
    assert!(path.exists());
    cache.close().await;
  }
}
