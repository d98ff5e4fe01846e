//! Cache keys and invalidation tags for item reads.

use sha2::{Digest, Sha256};

use crate::cache::{CacheError, CacheKey, QueryKey, ResourceTag, TagSet};

use super::types::ListQuery;

/// Key of the unfiltered collection read, also the tag every write bumps
pub const ALL_ITEMS: &str = "items:all";

pub fn item_tag(id: i64) -> ResourceTag {
  ResourceTag::new(format!("item:{}", id))
}

/// Tags a write to item `id` affects.
pub fn write_tags(id: i64) -> TagSet {
  TagSet::from([ResourceTag::new(ALL_ITEMS), item_tag(id)])
}

/// Cacheable item reads.
#[derive(Clone, Debug)]
pub enum ItemsQueryKey {
  /// List the collection, optionally filtered and paginated
  List(ListQuery),
  /// Get a single item by id
  Item(i64),
}

impl QueryKey for ItemsQueryKey {
  fn cache_key(&self) -> Result<CacheKey, CacheError> {
    let key = match self {
      Self::List(query) if query.is_all() => ALL_ITEMS.to_string(),
      Self::List(query) => {
        // SHA256 hash for stable, fixed-length keys
        let mut hasher = Sha256::new();
        hasher.update(query.canonical().as_bytes());
        format!("items:list:{}", hex::encode(hasher.finalize()))
      }
      Self::Item(id) => format!("items:{}", id),
    };
    CacheKey::new(key)
  }

  fn description(&self) -> String {
    match self {
      Self::List(query) if query.is_all() => "all items".to_string(),
      Self::List(query) => format!("items matching {}", query.canonical()),
      Self::Item(id) => format!("item {}", id),
    }
  }

  fn tags(&self) -> TagSet {
    match self {
      // Any write can change a list, filtered or not
      Self::List(_) => TagSet::from([ResourceTag::new(ALL_ITEMS)]),
      Self::Item(id) => TagSet::from([item_tag(*id)]),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn list_key(query: &str) -> CacheKey {
    ItemsQueryKey::List(ListQuery::parse(query).unwrap())
      .cache_key()
      .unwrap()
  }

  #[test]
  fn test_all_items_key_is_readable() {
    assert_eq!(list_key("").as_str(), ALL_ITEMS);
  }

  #[test]
  fn test_equivalent_queries_share_a_key() {
    assert_eq!(list_key("limit=5&name=Foo"), list_key("name=foo&limit=5"));
    assert_eq!(list_key("limit=5&offset=0"), list_key("limit=5"));
  }

  #[test]
  fn test_distinct_queries_differ() {
    assert_ne!(list_key("limit=5"), list_key("limit=6"));
    assert_ne!(list_key("limit=5"), list_key("limit=5&offset=5"));
    assert_ne!(list_key("name=a"), list_key("name=b"));
    assert_ne!(list_key("name=a"), list_key(""));
  }

  #[test]
  fn test_list_key_is_fixed_length() {
    let key = list_key("name=something-rather-long&limit=10");
    assert!(key.as_str().starts_with("items:list:"));
    assert_eq!(key.as_str().len(), "items:list:".len() + 64);
  }

  #[test]
  fn test_item_key_and_tags() {
    let query = ItemsQueryKey::Item(7);
    assert_eq!(query.cache_key().unwrap().as_str(), "items:7");
    assert_eq!(query.tags(), TagSet::from([ResourceTag::new("item:7")]));
  }

  #[test]
  fn test_write_tags_cover_list_and_item() {
    let tags = write_tags(3);
    assert!(tags.contains(&ResourceTag::new(ALL_ITEMS)));
    assert!(tags.contains(&item_tag(3)));
    assert_eq!(tags.len(), 2);
  }
}
