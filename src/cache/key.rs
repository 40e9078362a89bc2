//! Typed cache keys.
//!
//! A key is `(entity class, repository, filter signature)`. The filter is a
//! sorted map, so equivalent filter states serialize identically regardless
//! of insertion order.

use std::collections::BTreeMap;
use std::fmt;

use sha2::{Digest, Sha256};

/// Prefix of every storage key this crate writes.
pub const KEY_PREFIX: &str = "issue-sync:";

/// Entity collection a cache entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityClass {
  Issues,
  Repositories,
}

impl EntityClass {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Issues => "issues",
      Self::Repositories => "repositories",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  pub class: EntityClass,
  /// Repository name, or the owner for catalog-level entries
  pub repository: String,
  pub filter: BTreeMap<String, String>,
}

impl CacheKey {
  pub fn new(class: EntityClass, repository: impl Into<String>) -> Self {
    Self {
      class,
      repository: repository.into(),
      filter: BTreeMap::new(),
    }
  }

  /// Issue list for one repository and state.
  pub fn issues(repository: &str, state: &str) -> Self {
    Self::new(EntityClass::Issues, repository).with("state", state)
  }

  /// Repository catalog for an owner.
  pub fn repositories(owner: &str) -> Self {
    Self::new(EntityClass::Repositories, owner)
  }

  pub fn with(mut self, name: &str, value: impl ToString) -> Self {
    self.filter.insert(name.to_string(), value.to_string());
    self
  }

  /// Canonical, order-independent serialization.
  pub fn signature(&self) -> String {
    let filter = self
      .filter
      .iter()
      .map(|(k, v)| format!("{}={}", k.trim().to_lowercase(), v.trim()))
      .collect::<Vec<_>>()
      .join("&");
    format!("{}|{}|{}", self.class.as_str(), self.repository, filter)
  }

  /// Fixed-length key handed to the key-value store.
  pub fn storage_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.signature().as_bytes());
    format!("{}{}", KEY_PREFIX, hex::encode(hasher.finalize()))
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.signature())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_filter_order_does_not_matter() {
    let a = CacheKey::issues("projects", "open").with("sort", "updated");
    let b = CacheKey::new(EntityClass::Issues, "projects")
      .with("sort", "updated")
      .with("state", "open");
    assert_eq!(a.signature(), b.signature());
    assert_eq!(a.storage_key(), b.storage_key());
  }

  #[test]
  fn test_distinct_scopes_hash_differently() {
    let open = CacheKey::issues("projects", "open");
    let closed = CacheKey::issues("projects", "closed");
    let other = CacheKey::issues("localsite", "open");
    let catalog = CacheKey::repositories("projects");
    assert_ne!(open.storage_key(), closed.storage_key());
    assert_ne!(open.storage_key(), other.storage_key());
    assert_ne!(CacheKey::new(EntityClass::Issues, "projects").storage_key(), catalog.storage_key());
  }

  #[test]
  fn test_storage_key_shape() {
    let key = CacheKey::repositories("modelearth").storage_key();
    assert!(key.starts_with(KEY_PREFIX));
    assert_eq!(key.len(), KEY_PREFIX.len() + 64);
  }

  #[test]
  fn test_signature_normalizes_whitespace() {
    let a = CacheKey::issues("projects", " open ");
    let b = CacheKey::issues("projects", "open");
    assert_eq!(a.signature(), b.signature());
    assert_eq!(b.to_string(), "issues|projects|state=open");
  }
}
