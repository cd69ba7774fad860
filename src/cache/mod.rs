//! Result caching for repository queries.
//!
//! - Keys are derived from the canonical form of a query, so equivalent
//!   requests share one entry.
//! - Entries are tagged with their entity (and record, for `find`); write
//!   events purge by tag.
//! - Concurrent misses on one key run a single computation.
//! - The store is fail-open: its errors cost performance, never correctness.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! enabled = true
//! prefix = "sifter"
//! default_ttl_seconds = 300
//! lock_timeout_ms = 5000
//! # ... see config.rs for all options
//! ```

mod config;
mod coordinator;
mod events;
mod flight;
mod keys;
mod lock;
mod store;
mod tags;

pub use config::CacheConfig;
pub use coordinator::{
    CacheCoordinator, CacheRequest, METRIC_CACHE_COMPUTE_MS, METRIC_CACHE_DOGPILE_WAIT,
    METRIC_CACHE_HIT, METRIC_CACHE_INVALIDATED, METRIC_CACHE_LOCK_TIMEOUT, METRIC_CACHE_MISS,
    METRIC_CACHE_STALE_POPULATE, METRIC_CACHE_STORE_ERROR,
};
pub use events::{InvalidationEvent, WriteOperation};
pub use flight::{FlightOutcome, FlightRole, InFlight};
pub use keys::{CacheKeyComputer, CacheOperation, OperationKind};
pub use store::{CacheEntry, CacheStore, CacheStoreError, MemoryStore};
pub use tags::{CacheTagIndex, TagSnapshot, entity_tag, record_tag};
