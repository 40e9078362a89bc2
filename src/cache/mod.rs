//! Generic caching layer for data persistence across restarts.
//!
//! This module provides an API-agnostic caching mechanism that:
//! - Keys entity collections by a typed, order-independent `CacheKey`
//! - Expires entries after a TTL while keeping them for revalidation
//! - Keeps the revalidation token of the response that produced an entry
//! - Never persists an empty collection

mod key;
mod layer;
mod storage;
mod traits;

pub use key::{CacheKey, EntityClass};
pub use layer::{CacheEntry, CachedRead, ConditionalCache, EntryMetadata};
pub use storage::{KvStore, MemoryStore, NoopStore, SqliteStore};
pub use traits::{CacheSource, Cacheable};
