//! Item store trait and in-memory implementation.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::cache::TagSet;

use super::keys::write_tags;
use super::types::{Item, ListQuery, NewItem};

/// Trait for item persistence backends.
///
/// Writes return the tags they affect so callers know what to invalidate.
/// Calls may block; async callers run them on the blocking pool.
pub trait ItemStore: Send + Sync {
  /// List items in id order.
  fn list(&self, query: &ListQuery) -> Result<Vec<Item>>;

  /// Get a single item.
  fn get(&self, id: i64) -> Result<Option<Item>>;

  /// Create an item.
  fn create(&self, item: &NewItem) -> Result<(Item, TagSet)>;

  /// Rename an item. Returns None if it does not exist.
  fn update(&self, id: i64, item: &NewItem) -> Result<Option<(Item, TagSet)>>;

  /// Delete an item. Returns None if it does not exist.
  fn delete(&self, id: i64) -> Result<Option<TagSet>>;
}

#[derive(Debug, Default)]
struct Items {
  next_id: i64,
  items: BTreeMap<i64, Item>,
}

/// Store keeping items in a map, with optional simulated latency per call.
#[derive(Debug, Default)]
pub struct MemoryItemStore {
  items: Mutex<Items>,
  latency: Duration,
}

impl MemoryItemStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Sleep for `latency` on every call, to stand in for a remote database.
  pub fn with_latency(mut self, latency: Duration) -> Self {
    self.latency = latency;
    self
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Items>> {
    if !self.latency.is_zero() {
      std::thread::sleep(self.latency);
    }
    self
      .items
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl ItemStore for MemoryItemStore {
  fn list(&self, query: &ListQuery) -> Result<Vec<Item>> {
    let items = self.lock()?;
    let limit = query.limit.map_or(usize::MAX, |l| l as usize);
    Ok(
      items
        .items
        .values()
        .filter(|item| query.matches(item))
        .skip(query.offset as usize)
        .take(limit)
        .cloned()
        .collect(),
    )
  }

  fn get(&self, id: i64) -> Result<Option<Item>> {
    Ok(self.lock()?.items.get(&id).cloned())
  }

  fn create(&self, item: &NewItem) -> Result<(Item, TagSet)> {
    let mut items = self.lock()?;
    items.next_id += 1;
    let now = Utc::now();
    let created = Item {
      id: items.next_id,
      name: item.name.clone(),
      created_at: now,
      updated_at: now,
    };
    items.items.insert(created.id, created.clone());
    let tags = write_tags(created.id);
    Ok((created, tags))
  }

  fn update(&self, id: i64, item: &NewItem) -> Result<Option<(Item, TagSet)>> {
    let mut items = self.lock()?;
    Ok(items.items.get_mut(&id).map(|existing| {
      existing.name = item.name.clone();
      existing.updated_at = Utc::now();
      (existing.clone(), write_tags(id))
    }))
  }

  fn delete(&self, id: i64) -> Result<Option<TagSet>> {
    let mut items = self.lock()?;
    Ok(items.items.remove(&id).map(|_| write_tags(id)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::ResourceTag;
  use crate::items::keys::{item_tag, ALL_ITEMS};

  fn seeded(names: &[&str]) -> MemoryItemStore {
    let store = MemoryItemStore::new();
    for name in names {
      store.create(&NewItem::new(*name)).unwrap();
    }
    store
  }

  #[test]
  fn test_create_assigns_ids_and_tags() {
    let store = MemoryItemStore::new();
    let (first, _) = store.create(&NewItem::new("a")).unwrap();
    let (second, tags) = store.create(&NewItem::new("b")).unwrap();

    assert_eq!(first.id, 1);
    assert_eq!(second.id, 2);
    assert!(tags.contains(&ResourceTag::new(ALL_ITEMS)));
    assert!(tags.contains(&item_tag(2)));
  }

  #[test]
  fn test_list_filters_and_paginates() {
    let store = seeded(&["apple", "banana", "apricot", "cherry"]);

    let all = store.list(&ListQuery::default()).unwrap();
    assert_eq!(all.len(), 4);

    let ap = store.list(&ListQuery::parse("name=AP").unwrap()).unwrap();
    let names: Vec<_> = ap.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["apple", "apricot"]);

    let page = store.list(&ListQuery::parse("limit=2&offset=1").unwrap()).unwrap();
    let ids: Vec<_> = page.iter().map(|i| i.id).collect();
    assert_eq!(ids, vec![2, 3]);
  }

  #[test]
  fn test_update_and_delete_missing() {
    let store = seeded(&["a"]);
    assert!(store.update(9, &NewItem::new("x")).unwrap().is_none());
    assert!(store.delete(9).unwrap().is_none());

    let (updated, _) = store.update(1, &NewItem::new("z")).unwrap().unwrap();
    assert_eq!(updated.name, "z");
    assert!(updated.updated_at >= updated.created_at);

    assert!(store.delete(1).unwrap().is_some());
    assert!(store.get(1).unwrap().is_none());
  }
}
