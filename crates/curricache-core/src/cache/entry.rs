//! Tier 1 entry store: last-known value, freshness timestamp and the
//! in-flight fetch for each key.
//!
//! Pure data. The coordinator decides when to fetch; this module only
//! records what happened.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};

use crate::error::CacheError;

/// A fetch that any number of callers can await; all see the same result.
pub type SharedFetch<T> = Shared<BoxFuture<'static, Result<T, CacheError>>>;

/// Handle to a registered fetch, tagged with the generation it was started in.
#[derive(Clone)]
pub struct InFlight<T: Clone> {
    pub generation: u64,
    pub fetch: SharedFetch<T>,
}

impl<T: Clone> std::fmt::Debug for InFlight<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlight")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct CacheEntry<T: Clone> {
    value: Option<T>,
    fetched_at: Option<DateTime<Utc>>,
    in_flight: Option<InFlight<T>>,
    last_error: Option<CacheError>,
}

impl<T: Clone> Default for CacheEntry<T> {
    fn default() -> Self {
        Self {
            value: None,
            fetched_at: None,
            in_flight: None,
            last_error: None,
        }
    }
}

impl<T: Clone> CacheEntry<T> {
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
        self.fetched_at
    }

    pub fn in_flight(&self) -> Option<&InFlight<T>> {
        self.in_flight.as_ref()
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.is_some()
    }

    /// The error from the most recent refresh, if it failed.
    pub fn last_error(&self) -> Option<&CacheError> {
        self.last_error.as_ref()
    }
}

/// One [`CacheEntry`] per key.
#[derive(Debug)]
pub struct EntryCache<K, T: Clone> {
    entries: HashMap<K, CacheEntry<T>>,
    next_generation: u64,
}

impl<K, T: Clone> Default for EntryCache<K, T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            next_generation: 0,
        }
    }
}

impl<K, T> EntryCache<K, T>
where
    K: Hash + Eq + Clone,
    T: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&CacheEntry<T>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key)
    }

    /// Store a value. Any in-flight fetch stays registered.
    pub fn set(&mut self, key: K, value: T, fetched_at: DateTime<Utc>) {
        let entry = self.entries.entry(key).or_default();
        entry.value = Some(value);
        entry.fetched_at = Some(fetched_at);
        entry.last_error = None;
    }

    /// Reserve a generation number for a fetch about to be registered.
    pub fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    pub fn mark_in_flight(&mut self, key: K, in_flight: InFlight<T>) {
        self.entries.entry(key).or_default().in_flight = Some(in_flight);
    }

    /// Deregister the fetch started in `generation`. Returns false when the
    /// key was cleared or a newer fetch took its place, in which case the
    /// caller must not write the result back.
    pub fn settle<Q>(&mut self, key: &Q, generation: u64) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.entries.get_mut(key) {
            Some(entry) if entry.in_flight.as_ref().map(|f| f.generation) == Some(generation) => {
                entry.in_flight = None;
                true
            }
            _ => false,
        }
    }

    pub fn record_error<Q>(&mut self, key: &Q, error: CacheError)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_error = Some(error);
        }
    }

    /// Drop the entry, including any registered fetch.
    pub fn clear<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn ready_fetch(value: u32) -> SharedFetch<u32> {
        async move { Ok(value) }.boxed().shared()
    }

    #[test]
    fn test_set_then_get() {
        let mut cache: EntryCache<String, u32> = EntryCache::new();
        let now = Utc::now();
        cache.set("a".to_string(), 7, now);
        let entry = cache.get("a").unwrap();
        assert_eq!(entry.value(), Some(&7));
        assert_eq!(entry.fetched_at(), Some(now));
        assert!(!entry.is_loading());
    }

    #[test]
    fn test_settle_matches_generation() {
        let mut cache: EntryCache<String, u32> = EntryCache::new();
        let generation = cache.next_generation();
        cache.mark_in_flight(
            "a".to_string(),
            InFlight {
                generation,
                fetch: ready_fetch(1),
            },
        );
        assert!(cache.get("a").unwrap().is_loading());
        assert!(!cache.settle("a", generation + 1));
        assert!(cache.settle("a", generation));
        assert!(!cache.get("a").unwrap().is_loading());
    }

    #[test]
    fn test_clear_fences_in_flight() {
        let mut cache: EntryCache<String, u32> = EntryCache::new();
        let generation = cache.next_generation();
        cache.mark_in_flight(
            "a".to_string(),
            InFlight {
                generation,
                fetch: ready_fetch(1),
            },
        );
        assert!(cache.clear("a"));
        assert!(!cache.settle("a", generation));
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn test_set_clears_last_error() {
        let mut cache: EntryCache<String, u32> = EntryCache::new();
        cache.set("a".to_string(), 1, Utc::now());
        cache.record_error("a", CacheError::Transport("offline".into()));
        assert!(cache.get("a").unwrap().last_error().is_some());
        cache.set("a".to_string(), 2, Utc::now());
        assert!(cache.get("a").unwrap().last_error().is_none());
    }
}
