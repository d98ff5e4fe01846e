//! Cache layer that route handlers call around their store reads and writes.

use color_eyre::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::manager::{CacheManager, Lookup};
use super::traits::{CacheResult, Payload, QueryKey, TagSet};

/// Read-through, write-invalidate wrapper around a [`CacheManager`].
///
/// This layer sits between the handlers and the item store. A disabled
/// layer passes every read straight to the store, which is also how any
/// cache failure behaves.
pub struct CacheLayer {
  manager: Option<Arc<CacheManager>>,
  /// TTL applied to every entry stored through this layer
  default_ttl: Option<Duration>,
  /// Surface invalid keys as errors instead of bypassing the cache
  strict_keys: bool,
}

impl CacheLayer {
  pub fn new(manager: Arc<CacheManager>) -> Self {
    Self {
      manager: Some(manager),
      default_ttl: None,
      strict_keys: cfg!(debug_assertions),
    }
  }

  /// A layer that never caches.
  pub fn disabled() -> Self {
    Self {
      manager: None,
      default_ttl: None,
      strict_keys: false,
    }
  }

  pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
    self.default_ttl = ttl;
    self
  }

  pub fn with_strict_keys(mut self, strict: bool) -> Self {
    self.strict_keys = strict;
    self
  }

  pub fn manager(&self) -> Option<&Arc<CacheManager>> {
    self.manager.as_ref()
  }

  /// Serve a read from the cache, or from `fetcher` on a miss.
  ///
  /// The fetcher returns `None` when the resource does not exist; absent
  /// results are passed through without being cached. Fetcher errors are
  /// returned unchanged and nothing is cached.
  pub async fn fetch<K, F, Fut>(
    &self,
    query: &K,
    fetcher: F,
  ) -> Result<CacheResult<Option<Payload>>>
  where
    K: QueryKey,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Option<Payload>>>,
  {
    let Some(manager) = &self.manager else {
      return Ok(CacheResult::bypassed(fetcher().await?));
    };

    let key = match query.cache_key() {
      Ok(key) => key,
      Err(e) if self.strict_keys => return Err(e.into()),
      Err(e) => {
        warn!(query = %query.description(), error = %e, "Bypassing cache");
        return Ok(CacheResult::bypassed(fetcher().await?));
      }
    };

    if let Lookup::Hit(entry) = manager.get(&key) {
      return Ok(CacheResult::from_cache(Some(entry.payload), entry.cached_at));
    }

    // Observe before reading so a write that lands mid-read voids the put
    let observation = manager.observe(&query.tags());
    let data = fetcher().await?;

    match &data {
      Some(payload) => {
        manager.put_observed(key, Arc::clone(payload), observation, self.default_ttl);
      }
      None => debug!(query = %query.description(), "Not caching absent resource"),
    }

    Ok(CacheResult::from_store(data))
  }

  /// Forget every cached read depending on `tags`. Call after the store
  /// write has committed.
  pub fn invalidate(&self, tags: &TagSet) {
    if let Some(manager) = &self.manager {
      manager.invalidate_all(tags);
    }
  }
}

impl Clone for CacheLayer {
  fn clone(&self) -> Self {
    Self {
      manager: self.manager.clone(),
      default_ttl: self.default_ttl,
      strict_keys: self.strict_keys,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheError, CacheKey, CacheSource, ResourceTag};
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct TestQuery(&'static str);

  impl QueryKey for TestQuery {
    fn cache_key(&self) -> std::result::Result<CacheKey, CacheError> {
      CacheKey::new(self.0)
    }

    fn description(&self) -> String {
      format!("test {}", self.0)
    }

    fn tags(&self) -> TagSet {
      TagSet::from([ResourceTag::new("items:all")])
    }
  }

  fn layer() -> CacheLayer {
    CacheLayer::new(Arc::new(CacheManager::new(8)))
  }

  async fn body(calls: &AtomicUsize, text: &'static str) -> Result<Option<Payload>> {
    calls.fetch_add(1, Ordering::SeqCst);
    Ok(Some(Payload::from(text.as_bytes())))
  }

  #[tokio::test]
  async fn test_miss_then_hit() {
    let layer = layer();
    let calls = &AtomicUsize::new(0);

    let first = layer.fetch(&TestQuery("k"), move || body(calls, "v")).await.unwrap();
    let second = layer.fetch(&TestQuery("k"), move || body(calls, "v")).await.unwrap();

    assert_eq!(first.source, CacheSource::Store);
    assert_eq!(second.source, CacheSource::Cache);
    assert!(second.cached_at.is_some());
    assert_eq!(first.data, second.data);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_invalidate_forces_refetch() {
    let layer = layer();
    let calls = &AtomicUsize::new(0);

    layer.fetch(&TestQuery("k"), move || body(calls, "v1")).await.unwrap();
    layer.invalidate(&TagSet::from([ResourceTag::new("items:all")]));
    let after = layer.fetch(&TestQuery("k"), move || body(calls, "v2")).await.unwrap();

    assert_eq!(after.source, CacheSource::Store);
    assert_eq!(after.data.as_deref(), Some(&b"v2"[..]));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_absent_is_not_cached() {
    let layer = layer();
    let calls = &AtomicUsize::new(0);
    let fetch_none = move || async move {
      calls.fetch_add(1, Ordering::SeqCst);
      Ok(None)
    };

    layer.fetch(&TestQuery("k"), fetch_none).await.unwrap();
    let again = layer.fetch(&TestQuery("k"), fetch_none).await.unwrap();

    assert_eq!(again.source, CacheSource::Store);
    assert!(again.data.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_fetch_error_propagates_and_is_not_cached() {
    let layer = layer();
    let failed = layer
      .fetch(&TestQuery("k"), || async { Err(eyre!("store down")) })
      .await;
    assert!(failed.is_err());
    assert_eq!(layer.manager().unwrap().len(), 0);
  }

  #[tokio::test]
  async fn test_cancelled_fetch_stores_nothing() {
    let layer = layer();
    let query = TestQuery("k");
    let stalled = layer.fetch(&query, || {
      std::future::pending::<Result<Option<Payload>>>()
    });
    let timed_out = tokio::time::timeout(Duration::from_millis(10), stalled).await;
    assert!(timed_out.is_err());
    assert_eq!(layer.manager().unwrap().len(), 0);

    let calls = &AtomicUsize::new(0);
    let retried = layer.fetch(&query, move || body(calls, "v")).await.unwrap();
    assert_eq!(retried.source, CacheSource::Store);
    assert_eq!(layer.manager().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_invalid_key_strict_is_an_error() {
    let layer = layer().with_strict_keys(true);
    let calls = &AtomicUsize::new(0);
    let result = layer.fetch(&TestQuery(""), move || body(calls, "v")).await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_invalid_key_lenient_bypasses() {
    let layer = layer().with_strict_keys(false);
    let calls = &AtomicUsize::new(0);
    let result = layer
      .fetch(&TestQuery(""), move || body(calls, "v"))
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Bypass);
    assert_eq!(result.data.as_deref(), Some(&b"v"[..]));
    assert_eq!(layer.manager().unwrap().len(), 0);
  }

  #[tokio::test]
  async fn test_disabled_layer_always_fetches() {
    let layer = CacheLayer::disabled();
    let calls = &AtomicUsize::new(0);
    for _ in 0..3 {
      let result = layer.fetch(&TestQuery("k"), move || body(calls, "v")).await.unwrap();
      assert_eq!(result.source, CacheSource::Bypass);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_default_ttl_applies() {
    let layer = layer().with_default_ttl(Some(Duration::from_millis(1)));
    let calls = &AtomicUsize::new(0);

    layer.fetch(&TestQuery("k"), move || body(calls, "v")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let later = layer.fetch(&TestQuery("k"), move || body(calls, "v")).await.unwrap();

    assert_eq!(later.source, CacheSource::Store);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }
}
