//! Core traits and types for the caching system.

use serde::{de::DeserializeOwned, Serialize};

/// Trait for entities that can be cached.
///
/// Implementors provide a unique key within their entity class and a
/// validity check; invalid records are dropped when an entry is read back.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Unique identifier for this entity (e.g., issue id, repository name)
  fn cache_key(&self) -> String;

  /// Entity type name for storage organization (e.g., "issue", "repository")
  fn entity_type() -> &'static str;

  /// Whether the record may enter the unified collection.
  fn is_valid(&self) -> bool {
    true
  }
}

/// Indicates where a repository's data came from during a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still within its TTL
  CacheFresh,
  /// Server confirmed the cached data is unchanged
  Revalidated,
  /// Walk was cut short; only some pages arrived
  Partial,
}
