//! Cache storage.
//!
//! The coordinator talks to a [`CacheStore`]; [`MemoryStore`] is the in-process
//! LRU implementation used by default.

use std::collections::BTreeSet;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;
use thiserror::Error;

use super::config::CacheConfig;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheStoreError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),
    #[error("cache store does not support tag invalidation")]
    Unsupported,
}

/// A serialized result ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Bytes,
    pub ttl: Duration,
    pub tags: BTreeSet<String>,
}

/// Key/value storage for serialized query results.
///
/// Stores that index tags themselves report it via [`CacheStore::supports_tags`];
/// otherwise the coordinator keeps its own tag index and removes keys one by one.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Bytes>, CacheStoreError>;

    fn set(&self, entry: CacheEntry) -> Result<(), CacheStoreError>;

    /// Removing an absent key is not an error; returns whether a live entry
    /// was removed.
    fn remove(&self, key: &str) -> Result<bool, CacheStoreError>;

    /// Whether `key` still holds a live entry. Should not count as a read for
    /// eviction purposes.
    fn contains_key(&self, key: &str) -> Result<bool, CacheStoreError> {
        self.get(key).map(|payload| payload.is_some())
    }

    fn supports_tags(&self) -> bool {
        false
    }

    /// Remove every entry carrying any of `tags`; returns how many were removed.
    fn invalidate_by_tags(&self, _tags: &BTreeSet<String>) -> Result<usize, CacheStoreError> {
        Err(CacheStoreError::Unsupported)
    }
}

struct StoredValue {
    payload: Bytes,
    tags: BTreeSet<String>,
    /// `None` when the TTL runs past what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

/// Bounded in-memory store with per-entry TTL.
pub struct MemoryStore {
    entries: RwLock<LruCache<String, StoredValue>>,
    native_tags: bool,
}

impl MemoryStore {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(config.capacity_non_zero())),
            native_tags: false,
        }
    }

    /// Answer tag invalidations directly instead of relying on the coordinator's index.
    pub fn with_native_tags(mut self) -> Self {
        self.native_tags = true;
        self
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        rw_read(&self.entries, SOURCE, "contains")
            .peek(key)
            .is_some_and(|value| value.is_live(Instant::now()))
    }

    pub fn clear(&self) {
        rw_write(&self.entries, SOURCE, "clear").clear();
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Bytes>, CacheStoreError> {
        // LRU promotion mutates, so reads take the write lock.
        let mut entries = rw_write(&self.entries, SOURCE, "get");
        let expired = match entries.get(key) {
            Some(value) if value.is_live(Instant::now()) => {
                return Ok(Some(value.payload.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    fn set(&self, entry: CacheEntry) -> Result<(), CacheStoreError> {
        let value = StoredValue {
            payload: entry.payload,
            tags: entry.tags,
            expires_at: Instant::now().checked_add(entry.ttl),
        };
        rw_write(&self.entries, SOURCE, "set").put(entry.key, value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, CacheStoreError> {
        let removed = rw_write(&self.entries, SOURCE, "remove").pop(key);
        Ok(removed.is_some_and(|value| value.is_live(Instant::now())))
    }

    fn contains_key(&self, key: &str) -> Result<bool, CacheStoreError> {
        Ok(self.contains(key))
    }

    fn supports_tags(&self) -> bool {
        self.native_tags
    }

    fn invalidate_by_tags(&self, tags: &BTreeSet<String>) -> Result<usize, CacheStoreError> {
        if !self.native_tags {
            return Err(CacheStoreError::Unsupported);
        }
        let mut entries = rw_write(&self.entries, SOURCE, "invalidate_by_tags");
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(_, value)| !value.tags.is_disjoint(tags))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, ttl: Duration, tags: &[&str]) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            payload: Bytes::from_static(b"[]"),
            ttl,
            tags: tags.iter().map(|tag| tag.to_string()).collect(),
        }
    }

    #[test]
    fn set_then_get() {
        let store = MemoryStore::new(&CacheConfig::default());
        store
            .set(entry("k", Duration::from_secs(60), &["users"]))
            .expect("set");
        assert_eq!(store.get("k").expect("get"), Some(Bytes::from_static(b"[]")));
        assert!(store.remove("k").expect("remove"));
        assert_eq!(store.get("k").expect("get"), None);
        assert!(!store.remove("k").expect("idempotent remove"));
    }

    #[test]
    fn expired_entries_are_misses() {
        let store = MemoryStore::new(&CacheConfig::default());
        store.set(entry("k", Duration::ZERO, &[])).expect("set");
        assert_eq!(store.get("k").expect("get"), None);
        assert!(store.is_empty());
    }

    #[test]
    fn unrepresentable_ttls_never_expire() {
        let store = MemoryStore::new(&CacheConfig::default());
        store.set(entry("k", Duration::MAX, &[])).expect("set");
        assert_eq!(store.get("k").expect("get"), Some(Bytes::from_static(b"[]")));
        assert!(store.contains("k"));
    }

    #[test]
    fn lru_evicts_oldest_entry() {
        let config = CacheConfig {
            capacity: 2,
            ..Default::default()
        };
        let store = MemoryStore::new(&config);
        for key in ["a", "b", "c"] {
            store.set(entry(key, Duration::from_secs(60), &[])).expect("set");
        }
        assert!(!store.contains("a"));
        assert!(store.contains("b"));
        assert!(store.contains("c"));
        assert!(!store.remove("a").expect("remove evicted"));
    }

    #[test]
    fn tag_invalidation_requires_native_support() {
        let store = MemoryStore::new(&CacheConfig::default());
        let tags: BTreeSet<String> = ["users".to_string()].into();
        assert_eq!(
            store.invalidate_by_tags(&tags),
            Err(CacheStoreError::Unsupported)
        );
    }

    #[test]
    fn native_tag_invalidation_removes_tagged_entries() {
        let store = MemoryStore::new(&CacheConfig::default()).with_native_tags();
        store
            .set(entry("list", Duration::from_secs(60), &["users"]))
            .expect("set");
        store
            .set(entry("record", Duration::from_secs(60), &["users", "users:42"]))
            .expect("set");
        store
            .set(entry("other", Duration::from_secs(60), &["posts"]))
            .expect("set");

        let tags: BTreeSet<String> = ["users:42".to_string()].into();
        assert_eq!(store.invalidate_by_tags(&tags), Ok(1));
        assert!(store.contains("list"));
        assert!(!store.contains("record"));
        assert!(store.contains("other"));
    }
}
