//! Bounded entry table with LRU eviction and a tag -> keys index.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use super::error::CacheError;
use super::traits::{CacheKey, Payload, ResourceTag};

/// A cached response and the metadata needed to decide whether it is still valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub key: CacheKey,
  pub payload: Payload,
  /// Monotonic insertion time, used for expiry
  pub created_at: Instant,
  /// Wall clock insertion time, reported to callers
  pub cached_at: DateTime<Utc>,
  /// None means the entry only leaves through invalidation or eviction
  pub expires_at: Option<Instant>,
  /// TTL the entry was stored with
  pub ttl: Option<Duration>,
  /// Insertion sequence number assigned by the manager
  pub version: u64,
  /// Tag versions observed when the read that produced this payload began
  pub stamps: BTreeMap<ResourceTag, u64>,
}

impl CacheEntry {
  pub fn new(
    key: CacheKey,
    payload: Payload,
    stamps: BTreeMap<ResourceTag, u64>,
    ttl: Option<Duration>,
    version: u64,
  ) -> Self {
    let created_at = Instant::now();
    Self {
      key,
      payload,
      created_at,
      cached_at: Utc::now(),
      // An unrepresentable deadline is as good as never expiring.
      expires_at: ttl.and_then(|ttl| created_at.checked_add(ttl)),
      ttl,
      version,
      stamps,
    }
  }

  pub fn is_expired(&self, now: Instant) -> bool {
    self.expires_at.is_some_and(|deadline| deadline <= now)
  }
}

#[derive(Debug)]
struct Node {
  entry: CacheEntry,
  prev: Option<usize>,
  next: Option<usize>,
}

/// Storage backend for cache entries.
///
/// Entries live in a slab threaded by a doubly linked recency list (head is
/// the most recently used, tail the least), with a hash index from key to
/// slot. Insert, lookup, removal and eviction are all O(1); removal by tag is
/// O(entries under the tag).
#[derive(Debug)]
pub struct EntryTable {
  capacity: usize,
  slots: Vec<Option<Node>>,
  free: Vec<usize>,
  index: HashMap<CacheKey, usize>,
  tags: HashMap<ResourceTag, HashSet<CacheKey>>,
  head: Option<usize>,
  tail: Option<usize>,
}

impl EntryTable {
  pub fn new(capacity: usize) -> Self {
    Self {
      capacity,
      slots: Vec::new(),
      free: Vec::new(),
      index: HashMap::new(),
      tags: HashMap::new(),
      head: None,
      tail: None,
    }
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn len(&self) -> usize {
    self.index.len()
  }

  #[allow(dead_code)]
  pub fn is_empty(&self) -> bool {
    self.index.is_empty()
  }

  /// Insert or overwrite an entry, then evict least recently used entries
  /// until the table fits its capacity. Returns the evicted entries.
  pub fn insert(&mut self, entry: CacheEntry) -> Result<Vec<CacheEntry>, CacheError> {
    if self.capacity == 0 {
      return Err(CacheError::Internal(
        "entry table capacity is zero".to_string(),
      ));
    }

    // Overwrite drops the previous registrations along with the old entry
    self.remove_by_key(&entry.key);

    let key = entry.key.clone();
    for tag in entry.stamps.keys() {
      self
        .tags
        .entry(tag.clone())
        .or_default()
        .insert(key.clone());
    }

    let node = Node {
      entry,
      prev: None,
      next: None,
    };
    let idx = match self.free.pop() {
      Some(idx) => {
        self.slots[idx] = Some(node);
        idx
      }
      None => {
        self.slots.push(Some(node));
        self.slots.len() - 1
      }
    };
    self.index.insert(key, idx);
    self.push_front(idx);

    let mut evicted = Vec::new();
    while self.index.len() > self.capacity {
      let Some(tail) = self.tail else { break };
      let Some(victim) = self.slots[tail].as_ref().map(|n| n.entry.key.clone()) else {
        break;
      };
      match self.remove_by_key(&victim) {
        Some(entry) => evicted.push(entry),
        None => break,
      }
    }

    Ok(evicted)
  }

  /// Look up an entry and mark it most recently used.
  pub fn lookup(&mut self, key: &CacheKey) -> Result<Option<&CacheEntry>, CacheError> {
    let Some(&idx) = self.index.get(key) else {
      return Ok(None);
    };

    if self.slots.get(idx).and_then(Option::as_ref).is_none() {
      self.index.remove(key);
      return Err(CacheError::Internal(format!(
        "index for {} points at vacant slot {}",
        key, idx
      )));
    }

    self.unlink(idx);
    self.push_front(idx);
    Ok(self.slots[idx].as_ref().map(|n| &n.entry))
  }

  /// Look up an entry without touching recency.
  pub fn peek(&self, key: &CacheKey) -> Option<&CacheEntry> {
    let idx = *self.index.get(key)?;
    self.slots.get(idx)?.as_ref().map(|n| &n.entry)
  }

  pub fn remove_by_key(&mut self, key: &CacheKey) -> Option<CacheEntry> {
    let idx = self.index.remove(key)?;
    self.unlink(idx);
    let node = self.slots.get_mut(idx)?.take()?;
    self.free.push(idx);
    self.unregister(&node.entry);
    Some(node.entry)
  }

  /// Remove every entry registered under `tag`.
  pub fn remove_by_tag(&mut self, tag: &ResourceTag) -> Vec<CacheEntry> {
    let Some(keys) = self.tags.remove(tag) else {
      return Vec::new();
    };
    keys
      .iter()
      .filter_map(|key| self.remove_by_key(key))
      .collect()
  }

  /// Remove every entry whose deadline is at or before `now`.
  pub fn sweep_expired(&mut self, now: Instant) -> usize {
    let expired: Vec<CacheKey> = self
      .slots
      .iter()
      .flatten()
      .filter(|node| node.entry.is_expired(now))
      .map(|node| node.entry.key.clone())
      .collect();

    expired
      .iter()
      .filter(|key| self.remove_by_key(key).is_some())
      .count()
  }

  pub fn clear(&mut self) {
    self.slots.clear();
    self.free.clear();
    self.index.clear();
    self.tags.clear();
    self.head = None;
    self.tail = None;
  }

  /// Number of keys registered under a tag.
  pub fn tagged(&self, tag: &ResourceTag) -> usize {
    self.tags.get(tag).map_or(0, HashSet::len)
  }

  /// Tags that at least one entry is registered under.
  pub fn tag_names(&self) -> impl Iterator<Item = &ResourceTag> {
    self.tags.keys()
  }

  /// Keys from most to least recently used.
  #[allow(dead_code)]
  pub fn keys_by_recency(&self) -> Vec<&CacheKey> {
    let mut keys = Vec::with_capacity(self.len());
    let mut cursor = self.head;
    while let Some(idx) = cursor {
      let Some(node) = self.slots[idx].as_ref() else { break };
      keys.push(&node.entry.key);
      cursor = node.next;
    }
    keys
  }

  fn unregister(&mut self, entry: &CacheEntry) {
    for tag in entry.stamps.keys() {
      if let Some(keys) = self.tags.get_mut(tag) {
        keys.remove(&entry.key);
        if keys.is_empty() {
          self.tags.remove(tag);
        }
      }
    }
  }

  fn unlink(&mut self, idx: usize) {
    let Some((prev, next)) = self.slots[idx].as_ref().map(|n| (n.prev, n.next)) else {
      return;
    };

    match prev {
      Some(p) => {
        if let Some(node) = self.slots[p].as_mut() {
          node.next = next;
        }
      }
      None => self.head = next,
    }
    match next {
      Some(n) => {
        if let Some(node) = self.slots[n].as_mut() {
          node.prev = prev;
        }
      }
      None => self.tail = prev,
    }

    if let Some(node) = self.slots[idx].as_mut() {
      node.prev = None;
      node.next = None;
    }
  }

  fn push_front(&mut self, idx: usize) {
    let old_head = self.head;
    if let Some(node) = self.slots[idx].as_mut() {
      node.prev = None;
      node.next = old_head;
    }
    if let Some(h) = old_head {
      if let Some(node) = self.slots[h].as_mut() {
        node.prev = Some(idx);
      }
    }
    self.head = Some(idx);
    if self.tail.is_none() {
      self.tail = Some(idx);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn key(k: &str) -> CacheKey {
    CacheKey::new(k).unwrap()
  }

  fn entry(k: &str, tags: &[&str], ttl: Option<Duration>) -> CacheEntry {
    let stamps = tags.iter().map(|t| (ResourceTag::new(*t), 0)).collect();
    CacheEntry::new(key(k), Payload::from(k.as_bytes()), stamps, ttl, 0)
  }

  #[test]
  fn test_lru_evicts_least_recently_used() {
    let mut table = EntryTable::new(3);
    table.insert(entry("k1", &[], None)).unwrap();
    table.insert(entry("k2", &[], None)).unwrap();
    table.insert(entry("k3", &[], None)).unwrap();

    // Touch k1 so k2 becomes the true LRU key
    assert!(table.lookup(&key("k1")).unwrap().is_some());

    let evicted = table.insert(entry("k4", &[], None)).unwrap();
    assert_eq!(evicted.len(), 1);
    assert_eq!(evicted[0].key, key("k2"));

    assert!(table.peek(&key("k1")).is_some());
    assert!(table.peek(&key("k2")).is_none());
    assert!(table.peek(&key("k3")).is_some());
    assert!(table.peek(&key("k4")).is_some());
    assert_eq!(table.len(), 3);
  }

  #[test]
  fn test_recency_order() {
    let mut table = EntryTable::new(4);
    for k in ["a", "b", "c"] {
      table.insert(entry(k, &[], None)).unwrap();
    }
    table.lookup(&key("a")).unwrap();

    let order: Vec<_> = table.keys_by_recency().iter().map(|k| k.as_str()).collect();
    assert_eq!(order, vec!["a", "c", "b"]);
  }

  #[test]
  fn test_peek_does_not_touch_recency() {
    let mut table = EntryTable::new(2);
    table.insert(entry("a", &[], None)).unwrap();
    table.insert(entry("b", &[], None)).unwrap();
    table.peek(&key("a"));

    let evicted = table.insert(entry("c", &[], None)).unwrap();
    assert_eq!(evicted[0].key, key("a"));
  }

  #[test]
  fn test_overwrite_keeps_single_entry() {
    let mut table = EntryTable::new(2);
    table.insert(entry("a", &["t1"], None)).unwrap();
    let mut replacement = entry("a", &["t2"], None);
    replacement.payload = Payload::from(&b"new"[..]);
    let evicted = table.insert(replacement).unwrap();

    assert!(evicted.is_empty());
    assert_eq!(table.len(), 1);
    assert_eq!(&*table.peek(&key("a")).unwrap().payload, b"new");
    assert_eq!(table.tagged(&ResourceTag::new("t1")), 0);
    assert_eq!(table.tagged(&ResourceTag::new("t2")), 1);
  }

  #[test]
  fn test_remove_by_tag_only_removes_tagged() {
    let mut table = EntryTable::new(8);
    table.insert(entry("list", &["items:all"], None)).unwrap();
    table.insert(entry("one", &["item:1", "items:all"], None)).unwrap();
    table.insert(entry("two", &["item:2"], None)).unwrap();

    let removed = table.remove_by_tag(&ResourceTag::new("items:all"));
    assert_eq!(removed.len(), 2);
    assert!(table.peek(&key("two")).is_some());
    assert_eq!(table.len(), 1);
    // Co-registered tags are cleaned up with the entry
    assert_eq!(table.tagged(&ResourceTag::new("item:1")), 0);
  }

  #[test]
  fn test_eviction_cleans_tag_index() {
    let mut table = EntryTable::new(1);
    table.insert(entry("a", &["t"], None)).unwrap();
    table.insert(entry("b", &[], None)).unwrap();
    assert_eq!(table.tagged(&ResourceTag::new("t")), 0);
    assert!(table.remove_by_tag(&ResourceTag::new("t")).is_empty());
  }

  #[test]
  fn test_sweep_expired() {
    let mut table = EntryTable::new(4);
    table
      .insert(entry("short", &[], Some(Duration::from_millis(1))))
      .unwrap();
    table.insert(entry("forever", &[], None)).unwrap();

    let later = Instant::now() + Duration::from_millis(5);
    assert_eq!(table.sweep_expired(later), 1);
    assert!(table.peek(&key("short")).is_none());
    assert!(table.peek(&key("forever")).is_some());
  }

  #[test]
  fn test_expires_at_not_before_created_at() {
    let e = entry("a", &[], Some(Duration::ZERO));
    assert!(e.expires_at.unwrap() >= e.created_at);
    assert!(e.is_expired(e.created_at));
    let forever = entry("b", &[], Some(Duration::MAX));
    assert!(forever.expires_at.is_none());
  }

  #[test]
  fn test_zero_capacity_is_an_error() {
    let mut table = EntryTable::new(0);
    let result = table.insert(entry("a", &[], None));
    assert!(matches!(result, Err(CacheError::Internal(_))));
    assert_eq!(table.len(), 0);
  }

  #[test]
  fn test_slots_are_reused() {
    let mut table = EntryTable::new(2);
    for round in 0..10 {
      table.insert(entry(&format!("k{}", round), &[], None)).unwrap();
    }
    assert_eq!(table.len(), 2);
    assert!(table.slots.len() <= 3);
    let order: Vec<_> = table.keys_by_recency().iter().map(|k| k.as_str()).collect();
    assert_eq!(order, vec!["k9", "k8"]);
  }

  #[test]
  fn test_clear() {
    let mut table = EntryTable::new(2);
    table.insert(entry("a", &["t"], None)).unwrap();
    table.clear();
    assert!(table.is_empty());
    assert_eq!(table.tagged(&ResourceTag::new("t")), 0);
    assert!(table.lookup(&key("a")).unwrap().is_none());
  }
}
