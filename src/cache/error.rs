//! Error taxonomy for the cache core.
//!
//! A miss is not an error; see [`Lookup::Miss`](super::Lookup).

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
  /// Storage corruption or capacity misconfiguration. Always recovered
  /// locally by treating the operation as a miss.
  #[error("cache internal error: {0}")]
  Internal(String),

  /// The fingerprint for a read was empty or malformed.
  #[error("invalid cache key: {0}")]
  InvalidKey(String),
}
