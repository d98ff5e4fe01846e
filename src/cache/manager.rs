//! Cache manager: the single gate over the entry table and tag versions.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::table::{CacheEntry, EntryTable};
use super::traits::{CacheKey, Payload, ResourceTag, TagSet};

/// Tag versions kept before the first prune of unused tags.
const MIN_PRUNE_AT: usize = 1024;

/// Outcome of [`CacheManager::get`].
#[derive(Debug, Clone)]
pub enum Lookup {
  Hit(CacheEntry),
  Miss,
}

#[allow(dead_code)]
impl Lookup {
  pub fn is_hit(&self) -> bool {
    matches!(self, Self::Hit(_))
  }

  pub fn into_entry(self) -> Option<CacheEntry> {
    match self {
      Self::Hit(entry) => Some(entry),
      Self::Miss => None,
    }
  }
}

/// Outcome of a put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
  /// Entry inserted; `evicted` entries were dropped to make room
  Stored { evicted: usize },
  /// An identical live entry already existed
  Unchanged,
  /// A tag was invalidated after the read began; nothing stored
  Rejected,
  /// The table refused the entry; nothing stored
  Failed,
}

/// Tag versions snapshotted when a read began.
///
/// Taken before the store read and handed back to
/// [`CacheManager::put_observed`], so a write that lands between the read
/// and the put is detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
  generation: u64,
  stamps: BTreeMap<ResourceTag, u64>,
}

#[derive(Debug, Default)]
struct CacheStats {
  hits: AtomicU64,
  misses: AtomicU64,
  stores: AtomicU64,
  unchanged: AtomicU64,
  rejected: AtomicU64,
  evictions: AtomicU64,
  expirations: AtomicU64,
  invalidations: AtomicU64,
}

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
  pub hits: u64,
  pub misses: u64,
  pub stores: u64,
  pub unchanged: u64,
  pub rejected: u64,
  pub evictions: u64,
  pub expirations: u64,
  pub invalidations: u64,
  pub entries: usize,
}

impl CacheStatsSnapshot {
  pub fn hit_ratio(&self) -> f64 {
    let lookups = self.hits + self.misses;
    if lookups == 0 {
      0.0
    } else {
      self.hits as f64 / lookups as f64
    }
  }
}

#[derive(Debug)]
struct State {
  table: EntryTable,
  /// Missing tags are at `tag_floor`
  tag_versions: HashMap<ResourceTag, u64>,
  /// At least the last version of every pruned tag
  tag_floor: u64,
  /// Prune unused tags once `tag_versions` grows past this
  prune_at: usize,
  /// Bumped whenever the whole state is dropped; observations from an older
  /// generation are rejected.
  generation: u64,
  next_version: u64,
}

impl State {
  fn tag_version(&self, tag: &ResourceTag) -> u64 {
    self.tag_versions.get(tag).copied().unwrap_or(self.tag_floor)
  }

  fn bump_tag(&mut self, tag: &ResourceTag) {
    let next = self.tag_version(tag) + 1;
    self.tag_versions.insert(tag.clone(), next);
  }

  /// Forget versions of tags no entry depends on.
  ///
  /// The floor is raised to the highest pruned version, so a pruned tag never
  /// reads lower than before and observations of it stay valid only if it was
  /// not invalidated since. Tags of live entries that were still implicit are
  /// pinned at the old floor first so those entries stay current.
  fn prune_tag_versions(&mut self) {
    let old_floor = self.tag_floor;
    let mut new_floor = old_floor;
    let table = &self.table;
    self.tag_versions.retain(|tag, version| {
      if table.tagged(tag) > 0 {
        return true;
      }
      new_floor = new_floor.max(*version);
      false
    });

    if new_floor > old_floor {
      for tag in self.table.tag_names() {
        self.tag_versions.entry(tag.clone()).or_insert(old_floor);
      }
      self.tag_floor = new_floor;
    }
    self.prune_at = (self.tag_versions.len() * 2).max(MIN_PRUNE_AT);
    trace!(kept = self.tag_versions.len(), floor = self.tag_floor, "Pruned tag versions");
  }

  fn stamps_current(&self, stamps: &BTreeMap<ResourceTag, u64>) -> bool {
    stamps
      .iter()
      .all(|(tag, version)| self.tag_version(tag) == *version)
  }

  fn reset(&mut self) {
    self.table.clear();
    self.tag_versions.clear();
    self.generation += 1;
  }
}

/// Authoritative gate for every read and write against the cache.
///
/// All state sits behind one mutex and no operation blocks on I/O while
/// holding it. Writes never update entries: `invalidate` only forgets them.
#[derive(Debug)]
pub struct CacheManager {
  state: Mutex<State>,
  stats: CacheStats,
}

enum Found {
  Absent,
  Expired,
  Stale,
}

impl CacheManager {
  /// Create a manager holding at most `max_entries` entries.
  pub fn new(max_entries: usize) -> Self {
    Self {
      state: Mutex::new(State {
        table: EntryTable::new(max_entries),
        tag_versions: HashMap::new(),
        tag_floor: 0,
        prune_at: MIN_PRUNE_AT,
        generation: 0,
        next_version: 0,
      }),
      stats: CacheStats::default(),
    }
  }

  /// Lock the state, resetting it if a panic left it poisoned.
  fn state(&self) -> MutexGuard<'_, State> {
    match self.state.lock() {
      Ok(guard) => guard,
      Err(poisoned) => {
        error!("Cache state lock poisoned, dropping all entries");
        let mut guard = poisoned.into_inner();
        guard.reset();
        self.state.clear_poison();
        guard
      }
    }
  }

  /// Snapshot the current versions of `tags`.
  pub fn observe(&self, tags: &TagSet) -> Observation {
    let state = self.state();
    Observation {
      generation: state.generation,
      stamps: tags
        .iter()
        .map(|tag| (tag.clone(), state.tag_version(tag)))
        .collect(),
    }
  }

  /// Return the entry for `key` if present, unexpired and not invalidated.
  pub fn get(&self, key: &CacheKey) -> Lookup {
    let mut state = self.state();
    let now = Instant::now();

    let looked_up = state.table.lookup(key).map(|found| found.cloned());
    let found = match looked_up {
      Ok(Some(entry)) if entry.is_expired(now) => Found::Expired,
      Ok(Some(entry)) => {
        if state.stamps_current(&entry.stamps) {
          self.stats.hits.fetch_add(1, Ordering::Relaxed);
          trace!(key = %key, version = entry.version, "Cache hit");
          return Lookup::Hit(entry);
        }
        Found::Stale
      }
      Ok(None) => Found::Absent,
      Err(e) => {
        warn!(key = %key, error = %e, "Cache lookup failed, treating as miss");
        Found::Absent
      }
    };

    match found {
      Found::Expired => {
        state.table.remove_by_key(key);
        self.stats.expirations.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "Cache entry expired");
      }
      Found::Stale => {
        state.table.remove_by_key(key);
        debug!(key = %key, "Cache entry has stale tag versions");
      }
      Found::Absent => {}
    }

    self.stats.misses.fetch_add(1, Ordering::Relaxed);
    trace!(key = %key, "Cache miss");
    Lookup::Miss
  }

  /// Insert `payload` under `key`, registered against `tags` as of now.
  #[allow(dead_code)]
  pub fn put(
    &self,
    key: CacheKey,
    payload: Payload,
    tags: &TagSet,
    ttl: Option<Duration>,
  ) -> PutOutcome {
    let observation = self.observe(tags);
    self.put_observed(key, payload, observation, ttl)
  }

  /// Insert `payload` under `key` unless one of the observed tags has been
  /// invalidated since the observation was taken.
  pub fn put_observed(
    &self,
    key: CacheKey,
    payload: Payload,
    observation: Observation,
    ttl: Option<Duration>,
  ) -> PutOutcome {
    let mut state = self.state();

    if observation.generation != state.generation || !state.stamps_current(&observation.stamps) {
      self.stats.rejected.fetch_add(1, Ordering::Relaxed);
      debug!(key = %key, "Discarding put, a tag was invalidated during the read");
      return PutOutcome::Rejected;
    }

    let now = Instant::now();
    let identical = state.table.peek(&key).is_some_and(|existing| {
      !existing.is_expired(now)
        && existing.payload == payload
        && existing.ttl == ttl
        && existing.stamps == observation.stamps
    });
    if identical {
      // Recency only; the entry itself stays as it was
      let _ = state.table.lookup(&key);
      self.stats.unchanged.fetch_add(1, Ordering::Relaxed);
      return PutOutcome::Unchanged;
    }

    let version = state.next_version;
    state.next_version += 1;
    let entry = CacheEntry::new(key.clone(), payload, observation.stamps, ttl, version);

    match state.table.insert(entry) {
      Ok(evicted) => {
        self.stats.stores.fetch_add(1, Ordering::Relaxed);
        self
          .stats
          .evictions
          .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        for victim in &evicted {
          trace!(key = %victim.key, "Evicted least recently used entry");
        }
        debug!(key = %key, version, "Cached response");
        PutOutcome::Stored {
          evicted: evicted.len(),
        }
      }
      Err(e) => {
        warn!(key = %key, error = %e, "Cache put failed, response not cached");
        PutOutcome::Failed
      }
    }
  }

  /// Forget every entry that depends on `tag`.
  pub fn invalidate(&self, tag: &ResourceTag) {
    self.invalidate_all(std::iter::once(tag));
  }

  /// Invalidate several tags as one atomic step.
  pub fn invalidate_all<'a>(&self, tags: impl IntoIterator<Item = &'a ResourceTag>) {
    let mut state = self.state();
    for tag in tags {
      state.bump_tag(tag);
      let removed = state.table.remove_by_tag(tag);
      self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
      debug!(tag = %tag, removed = removed.len(), "Invalidated tag");
    }
    if state.tag_versions.len() > state.prune_at {
      state.prune_tag_versions();
    }
  }

  /// Drop every entry. Reads already in flight will not be cached.
  #[allow(dead_code)]
  pub fn clear(&self) {
    self.state().reset();
    info!("Cache cleared");
  }

  /// Remove all expired entries, returning how many were dropped.
  pub fn sweep_expired(&self) -> usize {
    let swept = self.state().table.sweep_expired(Instant::now());
    if swept > 0 {
      self
        .stats
        .expirations
        .fetch_add(swept as u64, Ordering::Relaxed);
      debug!(swept, "Swept expired cache entries");
    }
    swept
  }

  pub fn len(&self) -> usize {
    self.state().table.len()
  }

  pub fn capacity(&self) -> usize {
    self.state().table.capacity()
  }

  pub fn stats(&self) -> CacheStatsSnapshot {
    let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
    CacheStatsSnapshot {
      hits: load(&self.stats.hits),
      misses: load(&self.stats.misses),
      stores: load(&self.stats.stores),
      unchanged: load(&self.stats.unchanged),
      rejected: load(&self.stats.rejected),
      evictions: load(&self.stats.evictions),
      expirations: load(&self.stats.expirations),
      invalidations: load(&self.stats.invalidations),
      entries: self.len(),
    }
  }

  /// Periodically sweep expired entries until the manager is dropped.
  pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
    let manager: Weak<Self> = Arc::downgrade(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      // The first tick completes immediately
      ticker.tick().await;
      loop {
        ticker.tick().await;
        let Some(manager) = manager.upgrade() else {
          break;
        };
        manager.sweep_expired();
      }
    })
  }
}
