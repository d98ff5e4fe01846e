//! Load generator measuring handler latency with and without the cache.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::cache::CacheStatsSnapshot;
use crate::items::{Item, ItemStore, ItemsHandler, NewItem};

#[derive(Debug, Clone)]
pub struct BenchOptions {
  /// Concurrent virtual users
  pub vus: usize,
  pub duration: Duration,
  /// Share of requests that are writes, 0-100
  pub write_percent: u32,
  pub seed: u64,
}

/// Summary of a bench run.
#[derive(Debug, Clone)]
pub struct BenchReport {
  pub requests: usize,
  pub errors: usize,
  pub elapsed: Duration,
  /// Sorted ascending
  latencies: Vec<Duration>,
  pub cache: Option<CacheStatsSnapshot>,
}

impl BenchReport {
  /// Latency at percentile `p` (0-100), nearest rank.
  pub fn percentile(&self, p: f64) -> Duration {
    if self.latencies.is_empty() {
      return Duration::ZERO;
    }
    let rank = ((p / 100.0) * self.latencies.len() as f64).ceil() as usize;
    self.latencies[rank.clamp(1, self.latencies.len()) - 1]
  }

  pub fn throughput(&self) -> f64 {
    let secs = self.elapsed.as_secs_f64();
    if secs == 0.0 {
      0.0
    } else {
      self.requests as f64 / secs
    }
  }
}

impl fmt::Display for BenchReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "requests........: {}", self.requests)?;
    writeln!(f, "errors..........: {}", self.errors)?;
    writeln!(f, "throughput......: {:.1}/s", self.throughput())?;
    writeln!(
      f,
      "latency.........: p50={:?} p95={:?} p99={:?}",
      self.percentile(50.0),
      self.percentile(95.0),
      self.percentile(99.0)
    )?;
    match &self.cache {
      Some(stats) => write!(
        f,
        "cache...........: hit_ratio={:.2} hits={} misses={} stores={} rejected={} evictions={} expirations={} invalidations={} entries={}",
        stats.hit_ratio(),
        stats.hits,
        stats.misses,
        stats.stores,
        stats.rejected,
        stats.evictions,
        stats.expirations,
        stats.invalidations,
        stats.entries
      ),
      None => write!(f, "cache...........: disabled"),
    }
  }
}

#[derive(Default)]
struct VuResult {
  latencies: Vec<Duration>,
  errors: usize,
}

/// Drive `handler` with `options.vus` concurrent users for the configured
/// duration. The store must already contain items.
pub async fn run<S>(handler: ItemsHandler<S>, options: &BenchOptions) -> Result<BenchReport>
where
  S: ItemStore + ?Sized + 'static,
{
  let listed = handler.list_items("").await;
  if listed.status != 200 {
    return Err(eyre!("Listing items failed with status {}", listed.status));
  }
  let items: Vec<Item> = listed.json_body()?;
  if items.is_empty() {
    return Err(eyre!("The store is empty, run `items-cache seed` first"));
  }
  let ids: Arc<[i64]> = items.iter().map(|item| item.id).collect();

  info!(
    vus = options.vus,
    duration = ?options.duration,
    write_percent = options.write_percent,
    "Starting bench"
  );

  let started = Instant::now();
  let deadline = started + options.duration;

  let users = (0..options.vus).map(|vu| {
    let handler = handler.clone();
    let ids = Arc::clone(&ids);
    let write_percent = options.write_percent.min(100);
    let mut rng = StdRng::seed_from_u64(options.seed.wrapping_add(vu as u64));

    tokio::spawn(async move {
      let mut result = VuResult::default();
      while Instant::now() < deadline {
        let id = ids[rng.random_range(0..ids.len())];
        let roll = rng.random_range(0..100);

        let begin = Instant::now();
        let response = if roll < write_percent {
          let body = serde_json::to_vec(&NewItem::new(format!("item-{}-{}", id, roll)))
            .unwrap_or_default();
          handler.update_item(id, &body).await
        } else if roll % 3 == 0 {
          handler.get_item(id).await
        } else {
          handler.list_items("").await
        };
        result.latencies.push(begin.elapsed());
        if response.status >= 500 {
          result.errors += 1;
        }
      }
      result
    })
  });

  let results = try_join_all(users)
    .await
    .map_err(|e| eyre!("Virtual user failed: {}", e))?;
  let elapsed = started.elapsed();

  let errors = results.iter().map(|r| r.errors).sum();
  let mut latencies: Vec<Duration> = results.into_iter().flat_map(|r| r.latencies).collect();
  latencies.sort_unstable();

  Ok(BenchReport {
    requests: latencies.len(),
    errors,
    elapsed,
    latencies,
    cache: handler.cache().manager().map(|m| m.stats()),
  })
}
