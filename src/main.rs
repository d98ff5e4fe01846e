mod bench;
mod cache;
mod config;
mod items;
mod logging;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use cache::{CacheLayer, CacheManager};
use config::{CacheConfig, Config, StoreBackend, StoreConfig};
use items::{ItemStore, ItemsHandler, ListQuery, MemoryItemStore, NewItem, SqliteItemStore};

#[derive(Parser, Debug)]
#[command(name = "items-cache")]
#[command(about = "An items API with a tag-invalidated server-side response cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/items-cache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Write logs to this file instead of stderr
  #[arg(long, global = true)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Add generated items to the store
  Seed {
    #[arg(short = 'n', long, default_value_t = 100)]
    count: usize,
  },
  /// Print one `GET /items` response body
  List {
    /// Query string, e.g. "name=foo&limit=10"
    #[arg(default_value = "")]
    query: String,
  },
  /// Hammer the handlers with virtual users and report latency
  Bench {
    /// Concurrent virtual users
    #[arg(long, default_value_t = 10)]
    vus: usize,
    #[arg(long, default_value_t = 10)]
    duration_secs: u64,
    /// Share of requests that are writes, 0-100
    #[arg(long, default_value_t = 5)]
    write_percent: u32,
    /// Items to create first if the store is empty
    #[arg(long, default_value_t = 100)]
    items: usize,
    /// Run with the cache disabled for comparison
    #[arg(long)]
    no_cache: bool,
    #[arg(long, default_value_t = 42)]
    seed: u64,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.log_file.as_deref())?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let store = open_store(&config.store)?;

  match args.command {
    Command::Seed { count } => {
      seed(store.as_ref(), count)?;
      println!("Created {} items", count);
    }
    Command::List { query } => {
      let handler = ItemsHandler::new(store, CacheLayer::disabled());
      let response = handler.list_items(&query).await;
      println!("{}", String::from_utf8_lossy(&response.body));
      if response.status != 200 {
        return Err(eyre!("Listing failed with status {}", response.status));
      }
    }
    Command::Bench {
      vus,
      duration_secs,
      write_percent,
      items,
      no_cache,
      seed: rng_seed,
    } => {
      if store.list(&ListQuery::default())?.is_empty() {
        seed(store.as_ref(), items)?;
      }

      let cache = if no_cache {
        CacheLayer::disabled()
      } else {
        cache_layer(&config.cache)
      };
      let sweeper = cache
        .manager()
        .map(|manager| manager.spawn_sweeper(config.cache.sweep_interval()));

      let options = bench::BenchOptions {
        vus,
        duration: Duration::from_secs(duration_secs),
        write_percent,
        seed: rng_seed,
      };
      let report = bench::run(ItemsHandler::new(store, cache), &options).await?;
      println!("{}", report);

      if let Some(sweeper) = sweeper {
        sweeper.abort();
      }
    }
  }

  Ok(())
}

fn open_store(config: &StoreConfig) -> Result<Arc<dyn ItemStore>> {
  let store: Arc<dyn ItemStore> = match config.backend {
    StoreBackend::Sqlite => {
      let store = SqliteItemStore::open(config.path.as_deref())?;
      info!(path = ?config.path, "Opened SQLite item store");
      Arc::new(store)
    }
    StoreBackend::Memory => Arc::new(MemoryItemStore::new().with_latency(config.latency())),
  };
  Ok(store)
}

/// Build the cache layer, falling back to no cache on a bad configuration.
fn cache_layer(config: &CacheConfig) -> CacheLayer {
  if !config.enabled {
    return CacheLayer::disabled();
  }
  if config.max_entries == 0 {
    warn!("cache.max_entries is 0, running without a cache");
    return CacheLayer::disabled();
  }

  let manager = Arc::new(CacheManager::new(config.max_entries));
  info!(
    max_entries = manager.capacity(),
    ttl = ?config.default_ttl(),
    "Response cache enabled"
  );
  CacheLayer::new(manager)
    .with_default_ttl(config.default_ttl())
    .with_strict_keys(config.strict_keys)
}

fn seed(store: &dyn ItemStore, count: usize) -> Result<()> {
  for i in 1..=count {
    store.create(&NewItem::new(format!("item {}", i)))?;
  }
  info!(count, "Seeded item store");
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_zero_capacity_disables_cache() {
    let config = CacheConfig {
      max_entries: 0,
      ..CacheConfig::default()
    };
    assert!(cache_layer(&config).manager().is_none());
  }

  #[test]
  fn test_cache_layer_uses_configured_capacity() {
    let config = CacheConfig {
      max_entries: 3,
      ..CacheConfig::default()
    };
    let layer = cache_layer(&config);
    assert_eq!(layer.manager().map(|m| m.capacity()), Some(3));
  }

  #[test]
  fn test_seed_creates_items() {
    let store = MemoryItemStore::new();
    seed(&store, 5).unwrap();
    assert_eq!(store.list(&ListQuery::default()).unwrap().len(), 5);
  }

  #[test]
  fn test_args_parse_bench() {
    let args = Args::try_parse_from(["items-cache", "bench", "--vus", "3", "--no-cache"]).unwrap();
    match args.command {
      Command::Bench { vus, no_cache, .. } => {
        assert_eq!(vus, 3);
        assert!(no_cache);
      }
      other => panic!("unexpected command {:?}", other),
    }
  }
}
