//! The façade the dashboard reads through.
//!
//! The coordinator owns every Tier 1 structure, coalesces concurrent
//! fetches for the same key into one backend call, and decides per data
//! class whether a cached value is still usable.
//!
//! Each fetch runs as a spawned task, so it finishes and updates the cache
//! even if every caller that asked for it has gone away. A fetch is tagged
//! with a generation when it is registered; an invalidation drops the
//! registration, and a fetch that is no longer registered when it settles
//! hands its result to its own waiters but never writes it back.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::future::{join_all, FutureExt};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::collection::CollectionIndex;
use super::digest::IdentityDigest;
use super::entry::{EntryCache, InFlight, SharedFetch};
use super::policy::{Policies, StalenessPolicy};
use crate::backend::{Backend, Fetched};
use crate::error::CacheError;
use crate::models::{Curriculum, DashboardAggregate, EntityKey, OwnerKey};
use crate::time::{Clock, SystemClock};

/// Buffer size for the change notification channel.
/// Slow subscribers lag and skip ahead rather than block the cache.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Notifications for code that renders cached data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A refresh returned a collection that differs from the last one seen.
    CollectionChanged { owner: OwnerKey },
}

/// Everything Tier 1 holds. Only the coordinator can reach it.
#[derive(Default)]
struct Tier1 {
    entities: EntryCache<EntityKey, Curriculum>,
    aggregates: EntryCache<OwnerKey, DashboardAggregate>,
    collections: CollectionIndex,
    collection_flights: HashMap<OwnerKey, InFlight<Vec<Curriculum>>>,
    collection_errors: HashMap<OwnerKey, CacheError>,
    collection_generation: u64,
    /// Bumped by every entity invalidation made while a collection fetch
    /// is in flight.
    entity_epoch: u64,
    /// Epoch of each such invalidation. Members cleared after a collection
    /// fetch started are not seeded from its result.
    entity_clears: HashMap<String, u64>,
    digests: HashMap<OwnerKey, IdentityDigest>,
}

impl Tier1 {
    fn cleared_since(&self, key: &str, epoch: u64) -> bool {
        self.entity_clears.get(key).is_some_and(|&at| at > epoch)
    }

    fn prune_clears(&mut self) {
        if self.collection_flights.is_empty() {
            self.entity_clears.clear();
        }
    }
}

fn entities(state: &mut Tier1) -> &mut EntryCache<EntityKey, Curriculum> {
    &mut state.entities
}

fn aggregates(state: &mut Tier1) -> &mut EntryCache<OwnerKey, DashboardAggregate> {
    &mut state.aggregates
}

fn lock(state: &Mutex<Tier1>) -> MutexGuard<'_, Tier1> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What a read should do, decided under the lock.
enum Plan<T: Clone> {
    Hit(T),
    Join(SharedFetch<T>),
    Fetch,
    /// Hand back the stale value; start a refresh unless one is running.
    Stale { value: T, refresh: bool },
}

fn plan<K, T>(
    cache: &EntryCache<K, T>,
    key: &K,
    policy: &StalenessPolicy,
    force_refresh: bool,
    now: DateTime<Utc>,
) -> Plan<T>
where
    K: Hash + Eq + Clone,
    T: Clone,
{
    let Some(entry) = cache.get(key) else {
        return Plan::Fetch;
    };

    let value = entry.value().cloned();
    let fresh = entry
        .fetched_at()
        .is_some_and(|at| policy.is_fresh(at, now));

    match value {
        Some(value) if !force_refresh && fresh => Plan::Hit(value),
        Some(value) if !force_refresh && !policy.force_refresh_on_miss => Plan::Stale {
            value,
            refresh: !entry.is_loading(),
        },
        _ => match entry.in_flight() {
            Some(in_flight) => Plan::Join(in_flight.fetch.clone()),
            None => Plan::Fetch,
        },
    }
}

enum CollectionPlan {
    /// Membership is usable; resolve each member through the entity cache.
    Members(Vec<EntityKey>),
    Join(SharedFetch<Vec<Curriculum>>),
}

pub struct CacheCoordinator<B: Backend> {
    backend: Arc<B>,
    state: Arc<Mutex<Tier1>>,
    policies: Policies,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<CacheEvent>,
}

impl<B: Backend> CacheCoordinator<B> {
    pub fn new(backend: Arc<B>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            backend,
            state: Arc::default(),
            policies: Policies::default(),
            clock: Arc::new(SystemClock),
            events,
        }
    }

    pub fn with_policies(mut self, policies: Policies) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn policies(&self) -> &Policies {
        &self.policies
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    // =========================================================================
    // Entities
    // =========================================================================

    /// Return the entity for `key`, fetching it only when Tier 1 can't serve it.
    ///
    /// A fresh hit completes without suspending. Concurrent callers for the
    /// same key share one backend call. If a refresh fails with a transport
    /// error while a stale value is cached, the stale value is returned and
    /// the error is kept for [`last_error`](Self::last_error).
    pub async fn get_cached_entity(
        &self,
        key: &EntityKey,
        force_refresh: bool,
    ) -> Result<Curriculum, CacheError> {
        let fetch = {
            let mut state = lock(&self.state);
            let now = self.clock.now();
            match plan(&state.entities, key, &self.policies.entity, force_refresh, now) {
                Plan::Hit(value) => {
                    debug!(key = %key, "Entity cache hit");
                    return Ok(value);
                }
                Plan::Join(fetch) => {
                    debug!(key = %key, "Joining in-flight entity fetch");
                    fetch
                }
                Plan::Stale { value, refresh } => {
                    if refresh {
                        let _refresh = self.start_entity_fetch(&mut state, key);
                    }
                    debug!(key = %key, refresh, "Serving stale entity");
                    return Ok(value);
                }
                Plan::Fetch => self.start_entity_fetch(&mut state, key),
            }
        };
        fetch.await
    }

    fn start_entity_fetch(&self, state: &mut Tier1, key: &EntityKey) -> SharedFetch<Curriculum> {
        let backend = Arc::clone(&self.backend);
        let fetch_key = key.clone();
        start_fetch(
            &self.state,
            state,
            entities,
            key.clone(),
            Arc::clone(&self.clock),
            async move { backend.fetch_entity(&fetch_key).await },
        )
    }

    /// Fresh value only, without fetching.
    pub fn cached_entity(&self, key: &str) -> Option<Curriculum> {
        let state = lock(&self.state);
        let entry = state.entities.get(key)?;
        let fetched_at = entry.fetched_at()?;
        if self.policies.entity.is_fresh(fetched_at, self.clock.now()) {
            entry.value().cloned()
        } else {
            None
        }
    }

    /// Drop the Tier 1 entry for `key`. The next read goes to the backend.
    pub fn invalidate_entity(&self, key: &str) {
        let mut state = lock(&self.state);
        if !state.collection_flights.is_empty() {
            state.entity_epoch += 1;
            let epoch = state.entity_epoch;
            state.entity_clears.insert(key.to_string(), epoch);
        }
        if state.entities.clear(key) {
            debug!(key = key, "Invalidated entity");
        }
    }

    /// True while a fetch for `key` is registered.
    pub fn is_loading(&self, key: &str) -> bool {
        lock(&self.state)
            .entities
            .get(key)
            .is_some_and(|entry| entry.is_loading())
    }

    /// The error from the last failed refresh of `key`, if the stale value
    /// is still being served.
    pub fn last_error(&self, key: &str) -> Option<CacheError> {
        lock(&self.state)
            .entities
            .get(key)
            .and_then(|entry| entry.last_error().cloned())
    }

    pub fn fetched_at(&self, key: &str) -> Option<DateTime<Utc>> {
        lock(&self.state)
            .entities
            .get(key)
            .and_then(|entry| entry.fetched_at())
    }

    /// True when a value is cached but past its TTL or its last refresh failed.
    pub fn is_stale(&self, key: &str) -> bool {
        let state = lock(&self.state);
        let Some(entry) = state.entities.get(key) else {
            return false;
        };
        match entry.fetched_at() {
            Some(at) => {
                entry.last_error().is_some() || !self.policies.entity.is_fresh(at, self.clock.now())
            }
            None => false,
        }
    }

    // =========================================================================
    // Collections
    // =========================================================================

    /// Return the owner's entities in collection order.
    ///
    /// A usable membership list is resolved member by member through
    /// [`get_cached_entity`](Self::get_cached_entity), so members already
    /// fresh in Tier 1 are not fetched again. Otherwise one coalesced
    /// collection fetch refreshes the list and seeds every member.
    pub async fn get_cached_collection(
        &self,
        owner: &OwnerKey,
        force_refresh: bool,
    ) -> Result<Vec<Curriculum>, CacheError> {
        let policy = self.policies.collection;
        let plan = {
            let mut state = lock(&self.state);
            let now = self.clock.now();
            let members = state.collections.get_collection(owner.as_str()).map(|entry| {
                (entry.member_keys.clone(), policy.is_fresh(entry.fetched_at, now))
            });
            let in_flight = state
                .collection_flights
                .get(owner)
                .map(|f| f.fetch.clone());

            match (members, in_flight) {
                (Some((keys, true)), _) if !force_refresh => {
                    debug!(owner = %owner, members = keys.len(), "Collection cache hit");
                    CollectionPlan::Members(keys)
                }
                (Some((keys, false)), in_flight)
                    if !force_refresh && !policy.force_refresh_on_miss =>
                {
                    if in_flight.is_none() {
                        let _refresh = self.start_collection_fetch(&mut state, owner);
                    }
                    debug!(owner = %owner, "Serving stale collection");
                    CollectionPlan::Members(keys)
                }
                (_, Some(fetch)) => {
                    debug!(owner = %owner, "Joining in-flight collection fetch");
                    CollectionPlan::Join(fetch)
                }
                (_, None) => CollectionPlan::Join(self.start_collection_fetch(&mut state, owner)),
            }
        };

        match plan {
            CollectionPlan::Members(keys) => self.resolve_members(&keys).await,
            CollectionPlan::Join(fetch) => fetch.await,
        }
    }

    async fn resolve_members(&self, keys: &[EntityKey]) -> Result<Vec<Curriculum>, CacheError> {
        let results = join_all(keys.iter().map(|key| self.get_cached_entity(key, false))).await;
        let mut members = Vec::with_capacity(results.len());
        for (key, result) in keys.iter().zip(results) {
            match result {
                Ok(member) => members.push(member),
                Err(CacheError::NotFound(_)) => {
                    debug!(key = %key, "Collection member no longer exists, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(members)
    }

    fn start_collection_fetch(
        &self,
        state: &mut Tier1,
        owner: &OwnerKey,
    ) -> SharedFetch<Vec<Curriculum>> {
        state.collection_generation += 1;
        let generation = state.collection_generation;
        let epoch = state.entity_epoch;

        let backend = Arc::clone(&self.backend);
        let shared_state = Arc::clone(&self.state);
        let clock = Arc::clone(&self.clock);
        let events = self.events.clone();
        let owner_key = owner.clone();

        let task = async move {
            let result = backend.fetch_collection(&owner_key).await;
            let settled = Settled {
                generation,
                epoch,
                now: clock.now(),
            };
            settle_collection(&shared_state, &owner_key, settled, result, &events)
        };

        let fetch = spawn_shared(task);
        state.collection_flights.insert(
            owner.clone(),
            InFlight {
                generation,
                fetch: fetch.clone(),
            },
        );
        fetch
    }

    /// Drop the owner's membership list only. Member entities stay cached;
    /// callers that changed an entity invalidate it separately.
    pub fn invalidate_owner_collection(&self, owner: &str) {
        let mut state = lock(&self.state);
        let removed = state.collections.invalidate_collection(owner);
        state.collection_flights.remove(owner);
        state.collection_errors.remove(owner);
        state.prune_clears();
        if removed {
            debug!(owner = owner, "Invalidated owner collection");
        }
    }

    pub fn is_loading_collection(&self, owner: &str) -> bool {
        lock(&self.state).collection_flights.contains_key(owner)
    }

    pub fn collection_error(&self, owner: &str) -> Option<CacheError> {
        lock(&self.state).collection_errors.get(owner).cloned()
    }

    pub fn collection_fetched_at(&self, owner: &str) -> Option<DateTime<Utc>> {
        lock(&self.state)
            .collections
            .get_collection(owner)
            .map(|entry| entry.fetched_at)
    }

    // =========================================================================
    // Aggregates
    // =========================================================================

    pub async fn get_cached_aggregate(
        &self,
        owner: &OwnerKey,
        force_refresh: bool,
    ) -> Result<DashboardAggregate, CacheError> {
        let fetch = {
            let mut state = lock(&self.state);
            let now = self.clock.now();
            match plan(&state.aggregates, owner, &self.policies.aggregate, force_refresh, now) {
                Plan::Hit(value) => return Ok(value),
                Plan::Join(fetch) => fetch,
                Plan::Stale { value, refresh } => {
                    if refresh {
                        let _refresh = self.start_aggregate_fetch(&mut state, owner);
                    }
                    return Ok(value);
                }
                Plan::Fetch => self.start_aggregate_fetch(&mut state, owner),
            }
        };
        fetch.await
    }

    fn start_aggregate_fetch(
        &self,
        state: &mut Tier1,
        owner: &OwnerKey,
    ) -> SharedFetch<DashboardAggregate> {
        let backend = Arc::clone(&self.backend);
        let fetch_owner = owner.clone();
        start_fetch(
            &self.state,
            state,
            aggregates,
            owner.clone(),
            Arc::clone(&self.clock),
            async move { backend.fetch_aggregate(&fetch_owner).await },
        )
    }

    pub fn invalidate_aggregate(&self, owner: &str) {
        if lock(&self.state).aggregates.clear(owner) {
            debug!(owner = owner, "Invalidated aggregate");
        }
    }

    pub fn aggregate_error(&self, owner: &str) -> Option<CacheError> {
        lock(&self.state)
            .aggregates
            .get(owner)
            .and_then(|entry| entry.last_error().cloned())
    }
}

/// Spawn `task` and return a handle every waiter can clone and await.
fn spawn_shared<T, F>(task: F) -> SharedFetch<T>
where
    T: Clone + Send + Sync + 'static,
    F: Future<Output = Result<T, CacheError>> + Send + 'static,
{
    let handle = tokio::spawn(task);
    async move {
        handle
            .await
            .unwrap_or_else(|e| Err(CacheError::Transport(format!("Fetch task failed: {}", e))))
    }
    .boxed()
    .shared()
}

/// Register a fetch for `key` in the store chosen by `select`.
///
/// The caller holds the Tier 1 lock, so the spawned task cannot settle
/// before its registration is in place.
fn start_fetch<K, T, F>(
    shared_state: &Arc<Mutex<Tier1>>,
    state: &mut Tier1,
    select: fn(&mut Tier1) -> &mut EntryCache<K, T>,
    key: K,
    clock: Arc<dyn Clock>,
    fetch: F,
) -> SharedFetch<T>
where
    K: Hash + Eq + Clone + std::fmt::Display + Send + 'static,
    T: Clone + Send + Sync + 'static,
    F: Future<Output = Result<Fetched<T>, CacheError>> + Send + 'static,
{
    let generation = select(state).next_generation();
    let task_state = Arc::clone(shared_state);
    let task_key = key.clone();

    let task = async move {
        let result = fetch.await;
        let mut guard = lock(&task_state);
        let cache = select(&mut guard);

        if !cache.settle(&task_key, generation) {
            debug!(key = %task_key, generation, "Fetch superseded by invalidation, not caching result");
            return result.map(|fetched| fetched.value);
        }

        match result {
            Ok(fetched) => {
                // A copy the proxy stored earlier is as old as its store time.
                let fetched_at = fetched.cached_at.unwrap_or_else(|| clock.now());
                cache.set(task_key.clone(), fetched.value.clone(), fetched_at);
                if let Some(advisory) = fetched.advisory() {
                    debug!(key = %task_key, "Backend answered from the proxy cache");
                    cache.record_error(&task_key, advisory);
                }
                Ok(fetched.value)
            }
            Err(err) => {
                let stale = cache.get(&task_key).and_then(|entry| entry.value().cloned());
                match stale {
                    Some(stale) if err.is_transport() => {
                        warn!(key = %task_key, error = %err, "Refresh failed, serving cached value");
                        cache.record_error(&task_key, err);
                        Ok(stale)
                    }
                    _ => {
                        if matches!(err, CacheError::NotFound(_)) {
                            cache.clear(&task_key);
                        } else {
                            cache.record_error(&task_key, err.clone());
                        }
                        Err(err)
                    }
                }
            }
        }
    };

    let fetch = spawn_shared(task);
    select(state).mark_in_flight(
        key,
        InFlight {
            generation,
            fetch: fetch.clone(),
        },
    );
    fetch
}

/// How a finished collection fetch was started.
struct Settled {
    generation: u64,
    /// Entity epoch when the fetch was registered.
    epoch: u64,
    now: DateTime<Utc>,
}

fn settle_collection(
    shared_state: &Mutex<Tier1>,
    owner: &OwnerKey,
    settled: Settled,
    result: Result<Fetched<Vec<Curriculum>>, CacheError>,
    events: &broadcast::Sender<CacheEvent>,
) -> Result<Vec<Curriculum>, CacheError> {
    let Settled {
        generation,
        epoch,
        now,
    } = settled;
    let mut state = lock(shared_state);

    let registered = state
        .collection_flights
        .get(owner)
        .is_some_and(|f| f.generation == generation);
    if !registered {
        debug!(owner = %owner, generation, "Collection fetch superseded, not caching result");
        return result.map(|fetched| fetched.value);
    }
    state.collection_flights.remove(owner);

    match result {
        Ok(fetched) => {
            let advisory = fetched.advisory();
            let fetched_at = fetched.cached_at.unwrap_or(now);
            let members = fetched.value;

            for member in &members {
                if state.cleared_since(member.id.as_str(), epoch) {
                    debug!(key = %member.id, "Member invalidated during collection fetch, not seeding");
                    continue;
                }
                state.entities.set(member.id.clone(), member.clone(), fetched_at);
                if let Some(advisory) = &advisory {
                    state.entities.record_error(member.id.as_str(), advisory.clone());
                }
            }
            state.prune_clears();
            state
                .collections
                .set_collection(owner.clone(), members.iter().map(|m| m.id.clone()), fetched_at);
            match advisory {
                Some(advisory) => {
                    debug!(owner = %owner, "Collection answered from the proxy cache");
                    state.collection_errors.insert(owner.clone(), advisory);
                }
                None => {
                    state.collection_errors.remove(owner);
                }
            }

            let digest = IdentityDigest::of(&members);
            let changed = state.digests.insert(owner.clone(), digest) != Some(digest);
            drop(state);

            if changed {
                // No subscribers is fine.
                let _ = events.send(CacheEvent::CollectionChanged {
                    owner: owner.clone(),
                });
            } else {
                debug!(owner = %owner, digest = %digest.to_hex(), "Collection unchanged, suppressing notification");
            }
            Ok(members)
        }
        Err(err) if err.is_transport() => {
            state.prune_clears();
            let Some(keys) = state
                .collections
                .get_collection(owner.as_str())
                .map(|entry| entry.member_keys.clone())
            else {
                return Err(err);
            };
            let stale: Vec<Curriculum> = keys
                .iter()
                .filter_map(|key| state.entities.get(key).and_then(|e| e.value().cloned()))
                .collect();
            warn!(owner = %owner, error = %err, members = stale.len(), "Collection refresh failed, serving cached members");
            state.collection_errors.insert(owner.clone(), err);
            Ok(stale)
        }
        Err(err) => {
            state.prune_clears();
            state.collection_errors.insert(owner.clone(), err.clone());
            Err(err)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
