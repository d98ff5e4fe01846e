//! In-process response cache for the items API.
//!
//! This module provides a storage-agnostic caching mechanism that:
//! - Memoizes read responses under deterministic fingerprints
//! - Registers each entry against the resource tags it depends on
//! - Invalidates by tag after writes instead of updating entries
//! - Bounds memory with LRU eviction and optional per-entry TTLs
//! - Fails open: any internal error is treated as a miss

mod error;
mod layer;
mod manager;
mod table;
mod traits;

pub use error::CacheError;
pub use layer::CacheLayer;
pub use manager::{CacheManager, CacheStatsSnapshot};
#[allow(unused_imports)]
pub use manager::{Lookup, Observation, PutOutcome};
#[allow(unused_imports)]
pub use table::{CacheEntry, EntryTable};
#[allow(unused_imports)]
pub use traits::CacheResult;
pub use traits::{CacheKey, CacheSource, Payload, QueryKey, ResourceTag, TagSet};
