//! Cache configuration.
//!
//! Read from the `[cache]` table of `sifter.toml`.

use std::collections::BTreeSet;
use std::fmt;
use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

use super::events::WriteOperation;
use super::keys::OperationKind;

const DEFAULT_PREFIX: &str = "sifter";
const DEFAULT_TTL_SECONDS: u64 = 300;
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5000;
const DEFAULT_CAPACITY: usize = 1024;

#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Master switch; when off every operation goes straight to the engine.
    pub enabled: bool,
    /// First segment of every computed key.
    pub prefix: String,
    /// TTL for entries stored without an explicit one.
    pub default_ttl_seconds: u64,
    /// How long a caller waits on another caller computing the same key.
    pub lock_timeout_ms: u64,
    /// Entry bound of the in-memory store.
    pub capacity: usize,
    /// Switches key hashing to a keyed digest; use when the store is shared.
    pub key_secret: Option<String>,
    /// Write operations that purge cached entries.
    pub invalidate_on: BTreeSet<WriteOperation>,
    /// Terminal operations that read and populate the cache.
    pub operations: BTreeSet<OperationKind>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: DEFAULT_PREFIX.to_string(),
            default_ttl_seconds: DEFAULT_TTL_SECONDS,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            capacity: DEFAULT_CAPACITY,
            key_secret: None,
            invalidate_on: [
                WriteOperation::Create,
                WriteOperation::Update,
                WriteOperation::Delete,
            ]
            .into_iter()
            .collect(),
            operations: [OperationKind::All, OperationKind::Find, OperationKind::Paginate]
                .into_iter()
                .collect(),
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Returns the capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.capacity).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn caches(&self, operation: OperationKind) -> bool {
        self.enabled && self.operations.contains(&operation)
    }

    pub fn invalidates_on(&self, operation: WriteOperation) -> bool {
        self.invalidate_on.contains(&operation)
    }
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("enabled", &self.enabled)
            .field("prefix", &self.prefix)
            .field("default_ttl_seconds", &self.default_ttl_seconds)
            .field("lock_timeout_ms", &self.lock_timeout_ms)
            .field("capacity", &self.capacity)
            .field("key_secret", &self.key_secret.as_ref().map(|_| "<redacted>"))
            .field("invalidate_on", &self.invalidate_on)
            .field("operations", &self.operations)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.prefix, "sifter");
        assert_eq!(config.default_ttl(), Duration::from_secs(300));
        assert_eq!(config.lock_timeout(), Duration::from_millis(5000));
        assert_eq!(config.capacity, 1024);
        assert!(config.key_secret.is_none());
        assert_eq!(config.invalidate_on.len(), 3);
        assert_eq!(config.operations.len(), 3);
    }

    #[test]
    fn disabled_cache_caches_nothing() {
        let config = CacheConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(!config.caches(OperationKind::All));
    }

    #[test]
    fn unlisted_operations_bypass_the_cache() {
        let config = CacheConfig {
            operations: [OperationKind::Find].into_iter().collect(),
            ..Default::default()
        };
        assert!(config.caches(OperationKind::Find));
        assert!(!config.caches(OperationKind::Paginate));
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            capacity: 0,
            ..Default::default()
        };
        assert_eq!(config.capacity_non_zero().get(), 1);
    }

    #[test]
    fn debug_output_hides_the_key_secret() {
        let config = CacheConfig {
            key_secret: Some("s3cret".to_string()),
            ..Default::default()
        };
        assert!(!format!("{config:?}").contains("s3cret"));
    }
}
