//! Conditional cache store: TTL expiry plus revalidation tokens on top of a
//! key-value store.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::key::CacheKey;
use super::storage::KvStore;
use super::traits::Cacheable;
use crate::sync::rate_limit::RateLimitState;

/// Storage key listing every entry written, so `clear` can find them.
const INDEX_KEY: &str = "issue-sync:index";

/// Extra information stored beside the entities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
  /// Rate-limit snapshot at write time
  pub rate_limit: Option<RateLimitState>,
  /// Resolved issue count for the scope of the entry
  pub issue_count: Option<u32>,
}

/// One persisted entity collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
  pub entities: Vec<T>,
  pub written_at: DateTime<Utc>,
  /// Revalidation token from the response that produced `entities`
  pub etag: Option<String>,
  #[serde(default)]
  pub metadata: EntryMetadata,
}

/// A read entry and whether it is still within its TTL.
#[derive(Debug, Clone)]
pub struct CachedRead<T> {
  pub entry: CacheEntry<T>,
  pub fresh: bool,
}

/// Cache layer that manages TTL and write policy over a [`KvStore`].
#[derive(Clone)]
pub struct ConditionalCache {
  store: Arc<dyn KvStore>,
  /// How long before cached data is considered stale
  ttl: Duration,
  index_lock: Arc<Mutex<()>>,
}

impl ConditionalCache {
  pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
    Self {
      store,
      ttl,
      index_lock: Arc::new(Mutex::new(())),
    }
  }

  fn is_fresh(&self, written_at: DateTime<Utc>) -> bool {
    Utc::now() - written_at < self.ttl
  }

  /// Read an entry. Undecodable entries are treated as a miss.
  pub fn read<T: Cacheable>(&self, key: &CacheKey) -> Result<Option<CachedRead<T>>> {
    let Some(bytes) = self.store.get(&key.storage_key())? else {
      return Ok(None);
    };

    let mut entry: CacheEntry<T> = match serde_json::from_slice(&bytes) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key = %key, error = %e, "Discarding undecodable cache entry");
        return Ok(None);
      }
    };

    // Invalid records and repeated keys never leave the cache
    let before = entry.entities.len();
    let mut seen = HashSet::new();
    entry
      .entities
      .retain(|e| e.is_valid() && seen.insert(e.cache_key()));
    if entry.entities.len() != before {
      debug!(
        key = %key,
        entity = T::entity_type(),
        dropped = before - entry.entities.len(),
        "Dropped invalid or duplicate cached records"
      );
    }
    if entry.entities.is_empty() {
      return Ok(None);
    }

    let fresh = self.is_fresh(entry.written_at);
    Ok(Some(CachedRead { entry, fresh }))
  }

  /// Persist a non-empty entity list. Returns false (and writes nothing)
  /// when `entities` is empty.
  pub fn write<T: Cacheable>(
    &self,
    key: &CacheKey,
    entities: &[T],
    etag: Option<String>,
    metadata: EntryMetadata,
  ) -> Result<bool> {
    if entities.is_empty() {
      debug!(key = %key, "Not caching empty result");
      return Ok(false);
    }

    let entry = CacheEntry {
      entities: entities.to_vec(),
      written_at: Utc::now(),
      etag,
      metadata,
    };
    let bytes =
      serde_json::to_vec(&entry).map_err(|e| eyre!("Failed to serialize cache entry: {}", e))?;

    let storage_key = key.storage_key();
    self.store.set(&storage_key, &bytes)?;
    self.add_to_index(&storage_key)?;
    debug!(key = %key, entity = T::entity_type(), count = entities.len(), "Cache entry written");
    Ok(true)
  }

  /// Mark an entry as freshly validated without changing its entities.
  pub fn touch<T: Cacheable>(&self, key: &CacheKey) -> Result<Option<CacheEntry<T>>> {
    let Some(CachedRead { mut entry, .. }) = self.read::<T>(key)? else {
      return Ok(None);
    };
    entry.written_at = Utc::now();
    let bytes =
      serde_json::to_vec(&entry).map_err(|e| eyre!("Failed to serialize cache entry: {}", e))?;
    self.store.set(&key.storage_key(), &bytes)?;
    Ok(Some(entry))
  }

  pub fn remove(&self, key: &CacheKey) -> Result<()> {
    self.store.delete(&key.storage_key())
  }

  /// Delete every entry written through this cache. Returns how many keys
  /// were removed.
  pub fn clear(&self) -> Result<usize> {
    let _guard = self
      .index_lock
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let index = self.load_index()?;
    for storage_key in &index {
      self.store.delete(storage_key)?;
    }
    self.store.delete(INDEX_KEY)?;
    Ok(index.len())
  }

  fn load_index(&self) -> Result<BTreeSet<String>> {
    let Some(bytes) = self.store.get(INDEX_KEY)? else {
      return Ok(BTreeSet::new());
    };
    Ok(serde_json::from_slice(&bytes).unwrap_or_default())
  }

  fn add_to_index(&self, storage_key: &str) -> Result<()> {
    let _guard = self
      .index_lock
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let mut index = self.load_index()?;
    if index.insert(storage_key.to_string()) {
      let bytes =
        serde_json::to_vec(&index).map_err(|e| eyre!("Failed to serialize cache index: {}", e))?;
      self.store.set(INDEX_KEY, &bytes)?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::MemoryStore;
  use serde::{Deserialize, Serialize};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Item {
    id: u64,
    title: String,
  }

  impl Cacheable for Item {
    fn cache_key(&self) -> String {
      self.id.to_string()
    }

    fn entity_type() -> &'static str {
      "item"
    }

    fn is_valid(&self) -> bool {
      !self.title.is_empty()
    }
  }

  fn item(id: u64) -> Item {
    Item {
      id,
      title: format!("item {}", id),
    }
  }

  fn cache(store: Arc<MemoryStore>, ttl: Duration) -> ConditionalCache {
    ConditionalCache::new(store, ttl)
  }

  #[test]
  fn test_empty_results_are_never_written() {
    let store = Arc::new(MemoryStore::new());
    let cache = cache(store.clone(), Duration::minutes(10));
    let key = CacheKey::issues("empty", "open");

    assert!(!cache.write::<Item>(&key, &[], None, EntryMetadata::default()).unwrap());
    assert!(store.is_empty());
    assert!(cache.read::<Item>(&key).unwrap().is_none());
  }

  #[test]
  fn test_round_trip_within_ttl() {
    let cache = cache(Arc::new(MemoryStore::new()), Duration::minutes(10));
    let key = CacheKey::issues("projects", "open");
    let items = vec![item(1), item(2)];

    cache
      .write(&key, &items, Some("\"tag\"".to_string()), EntryMetadata::default())
      .unwrap();
    let read = cache.read::<Item>(&key).unwrap().unwrap();
    assert!(read.fresh);
    assert_eq!(read.entry.entities, items);
    assert_eq!(read.entry.etag.as_deref(), Some("\"tag\""));
  }

  #[test]
  fn test_expired_entry_is_stale_but_kept() {
    let cache = cache(Arc::new(MemoryStore::new()), Duration::zero());
    let key = CacheKey::issues("projects", "open");
    cache
      .write(&key, &[item(1)], None, EntryMetadata::default())
      .unwrap();

    let read = cache.read::<Item>(&key).unwrap().unwrap();
    assert!(!read.fresh);
    assert_eq!(read.entry.entities.len(), 1);
  }

  #[test]
  fn test_corrupt_entry_is_a_miss() {
    let store = Arc::new(MemoryStore::new());
    let cache = cache(store.clone(), Duration::minutes(10));
    let key = CacheKey::issues("projects", "open");
    store.set(&key.storage_key(), b"not json").unwrap();
    assert!(cache.read::<Item>(&key).unwrap().is_none());
  }

  #[test]
  fn test_invalid_records_are_dropped_on_read() {
    let store = Arc::new(MemoryStore::new());
    let cache = cache(store.clone(), Duration::minutes(10));
    let key = CacheKey::issues("projects", "open");
    let items = vec![
      item(1),
      Item {
        id: 2,
        title: String::new(),
      },
    ];
    cache.write(&key, &items, None, EntryMetadata::default()).unwrap();
    assert_eq!(cache.read::<Item>(&key).unwrap().unwrap().entry.entities, vec![item(1)]);
  }

  #[test]
  fn test_duplicate_keys_keep_first_record() {
    let cache = cache(Arc::new(MemoryStore::new()), Duration::minutes(10));
    let key = CacheKey::issues("projects", "open");
    let renamed = Item {
      id: 1,
      title: "renamed".to_string(),
    };
    cache
      .write(&key, &[item(1), item(2), renamed], None, EntryMetadata::default())
      .unwrap();
    assert_eq!(
      cache.read::<Item>(&key).unwrap().unwrap().entry.entities,
      vec![item(1), item(2)]
    );
  }

  #[test]
  fn test_touch_refreshes_written_at() {
    let cache = cache(Arc::new(MemoryStore::new()), Duration::minutes(10));
    let key = CacheKey::issues("projects", "open");
    cache
      .write(&key, &[item(1)], Some("e1".to_string()), EntryMetadata::default())
      .unwrap();
    let before = cache.read::<Item>(&key).unwrap().unwrap().entry.written_at;

    let touched = cache.touch::<Item>(&key).unwrap().unwrap();
    assert!(touched.written_at >= before);
    assert_eq!(touched.etag.as_deref(), Some("e1"));
  }

  #[test]
  fn test_clear_removes_every_written_entry() {
    let store = Arc::new(MemoryStore::new());
    let cache = cache(store.clone(), Duration::minutes(10));
    store.set("unrelated", b"x").unwrap();
    for repo in ["projects", "localsite", "feed"] {
      cache
        .write(&CacheKey::issues(repo, "open"), &[item(1)], None, EntryMetadata::default())
        .unwrap();
    }

    assert_eq!(cache.clear().unwrap(), 3);
    assert!(cache.read::<Item>(&CacheKey::issues("feed", "open")).unwrap().is_none());
    assert!(store.contains("unrelated"));
    assert_eq!(store.len(), 1);
  }
}
