//! Read-through caching for terminal repository operations.
//!
//! Every cached operation goes lookup -> (hit | miss -> compute -> populate).
//! Store failures never reach the caller: a failed lookup is a miss and a
//! failed populate still returns the computed value.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use metrics::{counter, histogram};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

use crate::application::criteria::CriteriaContext;
use crate::application::repos::QuerySpec;

use super::config::CacheConfig;
use super::events::InvalidationEvent;
use super::flight::{FlightOutcome, FlightRole, InFlight};
use super::keys::{CacheKeyComputer, CacheOperation, OperationKind};
use super::store::{CacheEntry, CacheStore, MemoryStore};
use super::tags::{CacheTagIndex, TagSnapshot, entity_tag, record_tag};

pub const METRIC_CACHE_HIT: &str = "sifter_cache_hit_total";
pub const METRIC_CACHE_MISS: &str = "sifter_cache_miss_total";
pub const METRIC_CACHE_STORE_ERROR: &str = "sifter_cache_store_error_total";
pub const METRIC_CACHE_DOGPILE_WAIT: &str = "sifter_cache_dogpile_wait_total";
pub const METRIC_CACHE_LOCK_TIMEOUT: &str = "sifter_cache_lock_timeout_total";
pub const METRIC_CACHE_STALE_POPULATE: &str = "sifter_cache_stale_populate_skipped_total";
pub const METRIC_CACHE_INVALIDATED: &str = "sifter_cache_invalidated_total";
pub const METRIC_CACHE_COMPUTE_MS: &str = "sifter_cache_compute_ms";

/// Where one cached operation reads from and writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRequest {
    pub key: String,
    pub tags: BTreeSet<String>,
    pub ttl: Duration,
}

pub struct CacheCoordinator {
    config: CacheConfig,
    keys: CacheKeyComputer,
    index: CacheTagIndex,
    flights: Arc<InFlight>,
    store: Arc<dyn CacheStore>,
}

impl CacheCoordinator {
    pub fn new(config: CacheConfig, store: Arc<dyn CacheStore>) -> Self {
        let keys = CacheKeyComputer::new(config.prefix.clone(), config.key_secret.as_deref());
        Self {
            config,
            keys,
            index: CacheTagIndex::new(),
            flights: Arc::new(InFlight::new()),
            store,
        }
    }

    /// Coordinator over a fresh [`MemoryStore`] sized from `config`.
    pub fn in_memory(config: CacheConfig) -> Self {
        let store = Arc::new(MemoryStore::new(&config));
        Self::new(config, store)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn caches(&self, operation: OperationKind) -> bool {
        self.config.caches(operation)
    }

    /// Key, tags and TTL for one terminal operation.
    ///
    /// Collection queries carry only the entity tag; `find` adds the record tag.
    pub fn plan(
        &self,
        query: &QuerySpec,
        context: &CriteriaContext,
        operation: &CacheOperation,
    ) -> CacheRequest {
        let mut tags = BTreeSet::from([entity_tag(&query.entity)]);
        if let CacheOperation::Find(id) = operation {
            tags.insert(record_tag(&query.entity, *id));
        }
        CacheRequest {
            key: self.keys.compute_key(query, context, operation),
            tags,
            ttl: context.cache_ttl.unwrap_or_else(|| self.config.default_ttl()),
        }
    }

    /// Return the cached value for `request`, computing and storing it on a miss.
    ///
    /// Concurrent callers for one key share a single computation; a caller that
    /// waits longer than the lock timeout computes on its own.
    #[instrument(skip_all, fields(key = %request.key))]
    pub fn remember<T, E, F>(&self, request: &CacheRequest, compute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, E>,
    {
        if let Some((_, value)) = self.lookup::<T>(&request.key) {
            counter!(METRIC_CACHE_HIT).increment(1);
            debug!("Cache hit");
            return Ok(value);
        }
        counter!(METRIC_CACHE_MISS).increment(1);

        let guard = match self.flights.join(&request.key) {
            FlightRole::Leader(guard) => guard,
            FlightRole::Follower(waiter) => {
                counter!(METRIC_CACHE_DOGPILE_WAIT).increment(1);
                debug!("Waiting on in-flight computation");
                return match waiter.wait(self.config.lock_timeout()) {
                    FlightOutcome::Ready(payload) => match decode::<T>(&payload) {
                        Some(value) => Ok(value),
                        None => compute(),
                    },
                    FlightOutcome::Abandoned => compute(),
                    FlightOutcome::TimedOut => {
                        counter!(METRIC_CACHE_LOCK_TIMEOUT).increment(1);
                        warn!(
                            timeout_ms = self.config.lock_timeout_ms,
                            "Cache lock wait timed out; computing directly"
                        );
                        compute()
                    }
                };
            }
        };

        // A previous leader may have populated between our lookup and join.
        if let Some((payload, value)) = self.lookup::<T>(&request.key) {
            guard.complete(payload);
            return Ok(value);
        }

        let snapshot = self.index.snapshot(&request.tags);
        let started_at = Instant::now();
        let value = compute()?;
        histogram!(METRIC_CACHE_COMPUTE_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);

        let payload = match serde_json::to_vec(&value) {
            Ok(bytes) => Bytes::from(bytes),
            Err(err) => {
                counter!(METRIC_CACHE_STORE_ERROR, "phase" => "encode").increment(1);
                warn!(error = %err, "Failed to serialize result; not caching");
                return Ok(value);
            }
        };

        if self.populate(request, &snapshot, payload.clone()) {
            guard.complete(payload);
        }
        Ok(value)
    }

    /// Tags purged for `event`, after purging them.
    ///
    /// Write operations outside `invalidate_on` purge nothing.
    #[instrument(skip_all, fields(entity = %event.entity, operation = %event.operation, event_id = %event.id))]
    pub fn on_invalidation(&self, event: &InvalidationEvent) -> BTreeSet<String> {
        if !self.config.invalidates_on(event.operation) {
            debug!("Write operation not configured to invalidate");
            return BTreeSet::new();
        }
        let tags = event.tags();
        self.invalidate_tags(&tags);
        tags
    }

    /// Purge every entry carrying any of `tags`. Returns the number removed.
    ///
    /// Idempotent; purging absent entries is a no-op.
    pub fn invalidate_tags(&self, tags: &BTreeSet<String>) -> usize {
        // Stamp the invalidation before removing anything so in-flight populates see it.
        let indexed = self.index.invalidate(tags);

        let removed = if self.store.supports_tags() {
            match self.store.invalidate_by_tags(tags) {
                Ok(removed) => removed,
                Err(err) => {
                    counter!(METRIC_CACHE_STORE_ERROR, "phase" => "invalidate").increment(1);
                    warn!(error = %err, "Tag invalidation failed");
                    0
                }
            }
        } else {
            let mut removed = 0;
            for key in &indexed {
                match self.store.remove(key) {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(err) => {
                        counter!(METRIC_CACHE_STORE_ERROR, "phase" => "invalidate").increment(1);
                        warn!(key = %key, error = %err, "Failed to remove invalidated entry");
                    }
                }
            }
            removed
        };

        counter!(METRIC_CACHE_INVALIDATED).increment(removed as u64);
        info!(tags = tags.len(), removed, "Cache entries invalidated");
        removed
    }

    fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<(Bytes, T)> {
        let payload = match self.store.get(key) {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                if !self.store.supports_tags() {
                    self.index.forget_if_gone(key, |key| self.store_holds(key));
                }
                return None;
            }
            Err(err) => {
                counter!(METRIC_CACHE_STORE_ERROR, "phase" => "lookup").increment(1);
                warn!(error = %err, "Cache lookup failed; treating as miss");
                return None;
            }
        };
        let value = decode(&payload)?;
        Some((payload, value))
    }

    /// Store `payload` unless one of its tags was invalidated since `snapshot`.
    ///
    /// Returns `false` when the result was found stale.
    fn populate(&self, request: &CacheRequest, snapshot: &TagSnapshot<'_>, payload: Bytes) -> bool {
        if !self.index.is_current(snapshot) {
            self.skip_stale();
            return false;
        }

        let entry = CacheEntry {
            key: request.key.clone(),
            payload,
            ttl: request.ttl,
            tags: request.tags.clone(),
        };
        if let Err(err) = self.store.set(entry) {
            counter!(METRIC_CACHE_STORE_ERROR, "phase" => "populate").increment(1);
            warn!(error = %err, "Cache populate failed; returning uncached result");
            return true;
        }

        // Linking after the write means an index sweep never sees a linked key
        // whose entry is not written yet. An invalidation landing in between
        // fails the link and the entry is removed here.
        let current = if self.store.supports_tags() {
            self.index.is_current(snapshot)
        } else {
            self.index.register(&request.key, snapshot)
        };
        if !current {
            if let Err(err) = self.store.remove(&request.key) {
                counter!(METRIC_CACHE_STORE_ERROR, "phase" => "populate").increment(1);
                warn!(error = %err, "Failed to remove stale entry");
            }
            self.skip_stale();
            return false;
        }

        if !self.store.supports_tags() && self.index.key_count() > self.sweep_threshold() {
            let pruned = self.index.prune_keys(|key| self.store_holds(key));
            debug!(pruned, "Swept tag index of evicted entries");
        }
        true
    }

    /// Keys the index may hold before it is swept against the store.
    fn sweep_threshold(&self) -> usize {
        self.config.capacity.max(1).saturating_mul(2)
    }

    /// Unknown counts as held so a store outage never unlinks a live entry.
    fn store_holds(&self, key: &str) -> bool {
        self.store.contains_key(key).unwrap_or(true)
    }

    fn skip_stale(&self) {
        counter!(METRIC_CACHE_STALE_POPULATE).increment(1);
        debug!("Tags invalidated during computation; result not cached");
    }
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Option<T> {
    match serde_json::from_slice(payload) {
        Ok(value) => Some(value),
        Err(err) => {
            counter!(METRIC_CACHE_STORE_ERROR, "phase" => "decode").increment(1);
            warn!(error = %err, "Cached payload could not be decoded; treating as miss");
            None
        }
    }
}
