use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub enabled: bool,
  /// Maximum number of cached responses before LRU eviction
  pub max_entries: usize,
  /// TTL for every cached response; omit for invalidation-only expiry
  pub default_ttl_ms: Option<u64>,
  /// How often expired entries are swept
  pub sweep_interval_ms: u64,
  /// Fail on malformed cache keys instead of bypassing the cache
  pub strict_keys: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      max_entries: 1024,
      default_ttl_ms: Some(30_000),
      sweep_interval_ms: 1_000,
      strict_keys: cfg!(debug_assertions),
    }
  }
}

impl CacheConfig {
  pub fn default_ttl(&self) -> Option<Duration> {
    self.default_ttl_ms.map(Duration::from_millis)
  }

  pub fn sweep_interval(&self) -> Duration {
    Duration::from_millis(self.sweep_interval_ms.max(1))
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
  /// SQLite database file
  #[default]
  Sqlite,
  /// Process-local map, lost on exit
  Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  pub backend: StoreBackend,
  /// SQLite database path (defaults to the user data directory)
  pub path: Option<PathBuf>,
  /// Artificial latency added to every memory store call
  pub latency_ms: u64,
}

impl StoreConfig {
  pub fn latency(&self) -> Duration {
    Duration::from_millis(self.latency_ms)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./items-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/items-cache/config.yaml
  ///
  /// Without a config file the defaults are used.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Some(db) = Self::db_path_override() {
      config.store.path = Some(db);
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("items-cache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("items-cache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn from_yaml(contents: &str) -> Result<Self> {
    // An empty file deserializes to null
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    Ok(serde_yaml::from_str(contents)?)
  }

  /// Get the SQLite path override from the environment.
  ///
  /// Checks ITEMS_CACHE_DB.
  fn db_path_override() -> Option<PathBuf> {
    std::env::var_os("ITEMS_CACHE_DB")
      .filter(|v| !v.is_empty())
      .map(PathBuf::from)
  }
}
