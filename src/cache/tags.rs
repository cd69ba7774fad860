//! Tag index for stores without native tag support.
//!
//! Tracks tag -> keys and key -> tags so an invalidation can find every entry
//! it affects. Invalidations are stamped with a generation so a populate that
//! started before one can detect that its result is already stale. A stamp is
//! kept only while some live snapshot predates it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::RwLock;

use super::lock::{rw_read, rw_write};

const TARGET: &str = "cache::tags";

/// Tag covering every cached result of an entity.
pub fn entity_tag(entity: &str) -> String {
    entity.to_string()
}

/// Tag covering cached results that contain one record.
pub fn record_tag(entity: &str, id: u64) -> String {
    format!("{entity}:{id}")
}

/// Index state observed before a computation started.
///
/// Holds its place in the index until dropped so the invalidations it may
/// still need to see are kept.
pub struct TagSnapshot<'a> {
    index: &'a CacheTagIndex,
    tags: BTreeSet<String>,
    generation: u64,
}

impl TagSnapshot<'_> {
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }
}

impl fmt::Debug for TagSnapshot<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagSnapshot")
            .field("tags", &self.tags)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for TagSnapshot<'_> {
    fn drop(&mut self) {
        self.index.release(self.generation);
    }
}

#[derive(Default)]
struct IndexState {
    tag_to_keys: HashMap<String, HashSet<String>>,
    key_to_tags: HashMap<String, BTreeSet<String>>,
    /// Bumped once per invalidation.
    generation: u64,
    /// Generation of each tag's latest invalidation, kept only while a live
    /// snapshot predates it.
    invalidated_at: HashMap<String, u64>,
    /// Live snapshots counted by the generation they were taken at.
    live: BTreeMap<u64, usize>,
}

impl IndexState {
    fn is_current(&self, tags: &BTreeSet<String>, generation: u64) -> bool {
        tags.iter().all(|tag| {
            self.invalidated_at
                .get(tag)
                .is_none_or(|invalidated| *invalidated <= generation)
        })
    }

    fn unlink(&mut self, key: &str) {
        let Some(tags) = self.key_to_tags.remove(key) else {
            return;
        };
        for tag in tags {
            if let Some(keys) = self.tag_to_keys.get_mut(&tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_to_keys.remove(&tag);
                }
            }
        }
    }

    /// Forget invalidations that no live or future snapshot can predate.
    fn prune(&mut self) {
        let oldest = self
            .live
            .keys()
            .next()
            .copied()
            .unwrap_or(self.generation);
        self.invalidated_at.retain(|_, invalidated| *invalidated > oldest);
    }
}

#[derive(Default)]
pub struct CacheTagIndex {
    state: RwLock<IndexState>,
}

impl CacheTagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot<'a>(&self, tags: impl IntoIterator<Item = &'a String>) -> TagSnapshot<'_> {
        let mut state = rw_write(&self.state, TARGET, "snapshot");
        let generation = state.generation;
        *state.live.entry(generation).or_insert(0) += 1;
        TagSnapshot {
            index: self,
            tags: tags.into_iter().cloned().collect(),
            generation,
        }
    }

    fn release(&self, generation: u64) {
        let mut state = rw_write(&self.state, TARGET, "release");
        if let Some(count) = state.live.get_mut(&generation) {
            *count -= 1;
            if *count == 0 {
                state.live.remove(&generation);
                state.prune();
            }
        }
    }

    /// Link `key` to the snapshot's tags.
    ///
    /// Returns `false` without linking when any tag was invalidated after the
    /// snapshot was taken.
    pub fn register(&self, key: &str, snapshot: &TagSnapshot<'_>) -> bool {
        let mut state = rw_write(&self.state, TARGET, "register");
        if !state.is_current(&snapshot.tags, snapshot.generation) {
            return false;
        }
        state.unlink(key);
        for tag in &snapshot.tags {
            state
                .tag_to_keys
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        state.key_to_tags.insert(key.to_string(), snapshot.tags.clone());
        true
    }

    pub fn is_current(&self, snapshot: &TagSnapshot<'_>) -> bool {
        rw_read(&self.state, TARGET, "is_current").is_current(&snapshot.tags, snapshot.generation)
    }

    /// Unlink `key` if it is indexed and `is_live` says its entry is gone.
    ///
    /// `is_live` runs with the index locked so no registration interleaves;
    /// it must not call back into the index.
    pub fn forget_if_gone(&self, key: &str, is_live: impl FnOnce(&str) -> bool) -> bool {
        let mut state = rw_write(&self.state, TARGET, "forget_if_gone");
        if !state.key_to_tags.contains_key(key) || is_live(key) {
            return false;
        }
        state.unlink(key);
        true
    }

    /// Unlink every indexed key whose entry `is_live` reports gone.
    ///
    /// Same locking contract as [`CacheTagIndex::forget_if_gone`].
    pub fn prune_keys(&self, mut is_live: impl FnMut(&str) -> bool) -> usize {
        let mut state = rw_write(&self.state, TARGET, "prune_keys");
        let dead: Vec<String> = state
            .key_to_tags
            .keys()
            .filter(|key| !is_live(key))
            .cloned()
            .collect();
        for key in &dead {
            state.unlink(key);
        }
        dead.len()
    }

    /// Mark each tag invalidated and detach every key linked to any of them.
    ///
    /// Returns the detached keys; the caller removes them from the store.
    pub fn invalidate<'a>(&self, tags: impl IntoIterator<Item = &'a String>) -> BTreeSet<String> {
        let mut state = rw_write(&self.state, TARGET, "invalidate");
        state.generation += 1;
        let generation = state.generation;
        let mut affected = BTreeSet::new();
        for tag in tags {
            state.invalidated_at.insert(tag.clone(), generation);
            if let Some(keys) = state.tag_to_keys.get(tag) {
                affected.extend(keys.iter().cloned());
            }
        }
        for key in &affected {
            state.unlink(key);
        }
        state.prune();
        affected
    }

    pub fn key_count(&self) -> usize {
        rw_read(&self.state, TARGET, "key_count").key_to_tags.len()
    }

    pub fn tag_count(&self) -> usize {
        rw_read(&self.state, TARGET, "tag_count").tag_to_keys.len()
    }

    /// Tags whose invalidation is still remembered for a live snapshot.
    pub fn tracked_invalidations(&self) -> usize {
        rw_read(&self.state, TARGET, "tracked_invalidations")
            .invalidated_at
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn tag_names() {
        assert_eq!(entity_tag("users"), "users");
        assert_eq!(record_tag("users", 42), "users:42");
    }

    #[test]
    fn invalidate_returns_linked_keys() {
        let index = CacheTagIndex::new();
        let list = tags(&["users"]);
        let record = tags(&["users", "users:1"]);
        assert!(index.register("k1", &index.snapshot(&list)));
        assert!(index.register("k2", &index.snapshot(&record)));

        let affected = index.invalidate(&tags(&["users:1"]));
        assert_eq!(affected.into_iter().collect::<Vec<_>>(), ["k2"]);
        assert_eq!(index.key_count(), 1);

        let affected = index.invalidate(&tags(&["users"]));
        assert_eq!(affected.into_iter().collect::<Vec<_>>(), ["k1"]);
        assert_eq!(index.key_count(), 0);
        assert_eq!(index.tag_count(), 0);
    }

    #[test]
    fn invalidation_stamps_last_only_as_long_as_older_snapshots() {
        let index = CacheTagIndex::new();
        for id in 0..100 {
            index.invalidate(&tags(&[format!("users:{id}").as_str()]));
        }
        assert_eq!(index.tracked_invalidations(), 0);

        let list = tags(&["users"]);
        let snapshot = index.snapshot(&list);
        index.invalidate(&tags(&["users"]));
        index.invalidate(&tags(&["users:7"]));
        assert_eq!(index.tracked_invalidations(), 2);
        assert!(!index.is_current(&snapshot));

        drop(snapshot);
        assert_eq!(index.tracked_invalidations(), 0);
        assert!(index.register("k1", &index.snapshot(&list)));
    }

    #[test]
    fn prune_keys_unlinks_rejected_keys() {
        let index = CacheTagIndex::new();
        let users = tags(&["users"]);
        for key in ["a", "b", "c"] {
            assert!(index.register(key, &index.snapshot(&users)));
        }
        assert_eq!(index.prune_keys(|key| key == "b"), 2);
        assert_eq!(index.key_count(), 1);
        assert_eq!(
            index.invalidate(&users).into_iter().collect::<Vec<_>>(),
            ["b"]
        );
    }

    #[test]
    fn register_after_invalidation_is_rejected() {
        let index = CacheTagIndex::new();
        let list = tags(&["users"]);
        let snapshot = index.snapshot(&list);

        index.invalidate(&list);

        assert!(!index.is_current(&snapshot));
        assert!(!index.register("k1", &snapshot));
        assert_eq!(index.key_count(), 0);
        assert!(index.register("k1", &index.snapshot(&list)));
    }

    #[test]
    fn unrelated_invalidations_do_not_stale_a_snapshot() {
        let index = CacheTagIndex::new();
        let users = tags(&["users"]);
        let snapshot = index.snapshot(&users);
        index.invalidate(&tags(&["posts"]));
        assert!(index.register("k1", &snapshot));
    }

    #[test]
    fn forget_if_gone_keeps_live_keys() {
        let index = CacheTagIndex::new();
        let users = tags(&["users"]);
        index.register("k1", &index.snapshot(&users));
        assert!(!index.forget_if_gone("k1", |_| true));
        assert!(!index.forget_if_gone("unknown", |_| false));
        assert!(index.forget_if_gone("k1", |_| false));
        assert!(index.invalidate(&users).is_empty());
    }
}
