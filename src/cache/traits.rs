//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use super::error::CacheError;

/// Cached response body. Shared so hits hand out clones without copying.
pub type Payload = Arc<[u8]>;

/// Deterministic fingerprint of a cacheable read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
  /// Validate and wrap a fingerprint.
  ///
  /// Keys must be non-empty and free of whitespace or control characters, so
  /// that two renderings of the same read cannot differ only in padding.
  pub fn new(key: impl Into<String>) -> Result<Self, CacheError> {
    let key = key.into();
    if key.is_empty() {
      return Err(CacheError::InvalidKey("key is empty".to_string()));
    }
    if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
      return Err(CacheError::InvalidKey(format!(
        "key {:?} contains whitespace or control characters",
        key
      )));
    }
    Ok(Self(key))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Identity of a resource that cached reads depend on (e.g. `item:7`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceTag(String);

impl ResourceTag {
  pub fn new(tag: impl Into<String>) -> Self {
    Self(tag.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for ResourceTag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for ResourceTag {
  fn from(tag: &str) -> Self {
    Self::new(tag)
  }
}

pub type TagSet = BTreeSet<ResourceTag>;

/// Trait for logical read operations that can be fingerprinted.
pub trait QueryKey {
  /// Stable key; equal for equivalent reads, distinct otherwise.
  fn cache_key(&self) -> Result<CacheKey, CacheError>;

  /// Human readable description for logging.
  fn description(&self) -> String;

  /// Resources whose writes must invalidate this read.
  fn tags(&self) -> TagSet;
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Data read from the store on a miss.
  pub fn from_store(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Store,
      cached_at: None,
    }
  }

  /// Data served from a cache hit.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Data read from the store with the cache skipped entirely.
  pub fn bypassed(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Bypass,
      cached_at: None,
    }
  }
}

/// Indicates where response data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Miss, read from the store and offered to the cache
  Store,
  /// Hit
  Cache,
  /// Cache disabled or key rejected
  Bypass,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_key_rejects_empty() {
    assert!(matches!(CacheKey::new(""), Err(CacheError::InvalidKey(_))));
  }

  #[test]
  fn test_key_rejects_whitespace() {
    assert!(CacheKey::new("items: all").is_err());
    assert!(CacheKey::new("items:all\n").is_err());
  }

  #[test]
  fn test_key_accepts_fingerprint() {
    let key = CacheKey::new("items:all").unwrap();
    assert_eq!(key.as_str(), "items:all");
    assert_eq!(key.to_string(), "items:all");
  }

  #[test]
  fn test_tag_set_is_ordered() {
    let tags: TagSet = ["item:2", "items:all", "item:1"]
      .into_iter()
      .map(ResourceTag::from)
      .collect();
    let rendered: Vec<_> = tags.iter().map(|t| t.as_str()).collect();
    assert_eq!(rendered, vec!["item:1", "item:2", "items:all"]);
  }
}
