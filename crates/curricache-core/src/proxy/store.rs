//! Tier 2 storage: named caches of stored responses, one generation per
//! proxy version.
//!
//! Limits are enforced lazily. A read drops a record older than the cache's
//! max age; a write first drops expired records, then evicts the least
//! recently used ones until the new record fits.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::network::{ProxyResponse, ResponseSource};
use super::route::{Expiration, RouteTags};
use crate::channel::InvalidationScope;

/// One stored response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyCacheRecord {
    pub request_key: String,
    pub cache_name: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub stored_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: RouteTags,
}

impl ProxyCacheRecord {
    pub fn from_response(
        cache_name: &str,
        request_key: &str,
        tags: RouteTags,
        response: &ProxyResponse,
        stored_at: DateTime<Utc>,
    ) -> Self {
        Self {
            request_key: request_key.to_string(),
            cache_name: cache_name.to_string(),
            status: response.status,
            content_type: response.content_type.clone(),
            body: response.body.clone(),
            stored_at,
            tags,
        }
    }

    pub fn to_response(&self) -> ProxyResponse {
        ProxyResponse {
            status: self.status,
            content_type: self.content_type.clone(),
            body: self.body.clone(),
            source: ResponseSource::Cache,
            stored_at: Some(self.stored_at),
        }
    }

    pub fn is_expired(&self, expiration: &Expiration, now: DateTime<Utc>) -> bool {
        expiration
            .max_age
            .is_some_and(|max_age| now - self.stored_at > max_age)
    }

    fn in_scope(&self, scope: &InvalidationScope) -> bool {
        match scope {
            InvalidationScope::All => true,
            InvalidationScope::Owner(owner) => self.tags.owner_key.as_deref() == Some(owner.as_str()),
            InvalidationScope::Entity(entity) => {
                self.tags.entity_key.as_deref() == Some(entity.as_str())
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Slot {
    record: ProxyCacheRecord,
    last_used: u64,
}

/// A single cache name's records, with recency bookkeeping for LRU eviction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamedCache {
    slots: HashMap<String, Slot>,
    tick: u64,
}

impl NamedCache {
    fn touch(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Returns the record for `key` unless it is absent or expired.
    /// An expired record is removed; the flag reports whether that happened.
    pub fn get(
        &mut self,
        key: &str,
        expiration: &Expiration,
        now: DateTime<Utc>,
    ) -> (Option<ProxyCacheRecord>, bool) {
        let expired = match self.slots.get(key) {
            None => return (None, false),
            Some(slot) => slot.record.is_expired(expiration, now),
        };
        if expired {
            self.slots.remove(key);
            return (None, true);
        }

        let tick = self.touch();
        let slot = self.slots.get_mut(key);
        match slot {
            Some(slot) => {
                slot.last_used = tick;
                (Some(slot.record.clone()), false)
            }
            None => (None, false),
        }
    }

    /// Stores `record`, returning the keys removed to make room for it.
    pub fn put(
        &mut self,
        record: ProxyCacheRecord,
        expiration: &Expiration,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        let mut removed: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.record.is_expired(expiration, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &removed {
            self.slots.remove(key);
        }

        if let Some(max_entries) = expiration.max_entries {
            if !self.slots.contains_key(&record.request_key) {
                while self.slots.len() >= max_entries {
                    let Some(oldest) = self
                        .slots
                        .iter()
                        .min_by_key(|(_, slot)| slot.last_used)
                        .map(|(key, _)| key.clone())
                    else {
                        break;
                    };
                    self.slots.remove(&oldest);
                    removed.push(oldest);
                }
            }
        }

        let last_used = self.touch();
        self.slots
            .insert(record.request_key.clone(), Slot { record, last_used });
        removed
    }

    /// Removes every record in `scope`. Removing nothing is not an error.
    pub fn invalidate(&mut self, scope: &InvalidationScope) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.record.in_scope(scope));
        before - self.slots.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Every named cache belonging to one proxy version.
///
/// With a storage directory, each cache is mirrored to
/// `<dir>/<version>/<cache_name>.json` after every change.
pub struct CacheStorage {
    version: String,
    dir: Option<PathBuf>,
    caches: HashMap<String, NamedCache>,
}

impl CacheStorage {
    pub fn in_memory(version: &str) -> Self {
        Self {
            version: version.to_string(),
            dir: None,
            caches: HashMap::new(),
        }
    }

    /// Opens the generation for `version` under `dir`, loading whatever was
    /// persisted for it. Unreadable cache files are discarded.
    pub fn open(dir: impl Into<PathBuf>, version: &str) -> Self {
        let dir = dir.into();
        let mut caches = HashMap::new();
        let generation_dir = dir.join(version);

        if let Ok(entries) = std::fs::read_dir(&generation_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                    continue;
                };
                match load_cache(&path) {
                    Ok(cache) => {
                        debug!(cache = %name, records = cache.len(), "Loaded proxy cache");
                        caches.insert(name, cache);
                    }
                    Err(e) => {
                        warn!(cache = %name, error = %e, "Discarding unreadable proxy cache");
                        let _ = std::fs::remove_file(&path);
                    }
                }
            }
        }

        Self {
            version: version.to_string(),
            dir: Some(dir),
            caches,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Deletes every other version's caches, returning the versions removed.
    pub fn activate(&mut self) -> Vec<String> {
        let Some(dir) = &self.dir else {
            return Vec::new();
        };
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };

        let mut removed = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if name == self.version {
                continue;
            }
            match std::fs::remove_dir_all(&path) {
                Ok(()) => removed.push(name),
                Err(e) => warn!(version = %name, error = %e, "Failed to remove old proxy caches"),
            }
        }

        if !removed.is_empty() {
            info!(version = %self.version, removed = ?removed, "Removed previous cache generations");
        }
        removed
    }

    pub fn get(
        &mut self,
        cache_name: &str,
        key: &str,
        expiration: &Expiration,
        now: DateTime<Utc>,
    ) -> Option<ProxyCacheRecord> {
        let cache = self.caches.get_mut(cache_name)?;
        let (record, expired) = cache.get(key, expiration, now);
        if expired {
            debug!(cache = %cache_name, key = %key, "Expired proxy record dropped");
            self.persist(cache_name);
        }
        record
    }

    pub fn put(&mut self, record: ProxyCacheRecord, expiration: &Expiration, now: DateTime<Utc>) {
        let cache_name = record.cache_name.clone();
        let evicted = self
            .caches
            .entry(cache_name.clone())
            .or_default()
            .put(record, expiration, now);
        if !evicted.is_empty() {
            debug!(cache = %cache_name, evicted = ?evicted, "Evicted proxy records");
        }
        self.persist(&cache_name);
    }

    pub fn invalidate(&mut self, cache_name: &str, scope: &InvalidationScope) -> usize {
        let removed = self
            .caches
            .get_mut(cache_name)
            .map(|cache| cache.invalidate(scope))
            .unwrap_or(0);
        if removed > 0 {
            self.persist(cache_name);
        }
        removed
    }

    pub fn cache(&self, cache_name: &str) -> Option<&NamedCache> {
        self.caches.get(cache_name)
    }

    pub fn cache_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.caches.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn persist(&self, cache_name: &str) {
        let (Some(dir), Some(cache)) = (&self.dir, self.caches.get(cache_name)) else {
            return;
        };
        let path = dir.join(&self.version).join(format!("{}.json", cache_name));
        if let Err(e) = save_cache(&path, cache) {
            warn!(cache = %cache_name, error = %e, "Failed to persist proxy cache");
        }
    }
}

fn load_cache(path: &Path) -> Result<NamedCache> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read cache file: {}", path.display()))?;
    let cache = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse cache file: {}", path.display()))?;
    Ok(cache)
}

fn save_cache(path: &Path, cache: &NamedCache) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_string(cache)?;
    std::fs::write(path, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn record(cache_name: &str, key: &str, stored_at: DateTime<Utc>) -> ProxyCacheRecord {
        ProxyCacheRecord {
            request_key: key.to_string(),
            cache_name: cache_name.to_string(),
            status: 200,
            content_type: Some("application/json".to_string()),
            body: key.as_bytes().to_vec(),
            stored_at,
            tags: RouteTags::default(),
        }
    }

    fn tagged(key: &str, owner: Option<&str>, entity: Option<&str>) -> ProxyCacheRecord {
        ProxyCacheRecord {
            tags: RouteTags {
                owner_key: owner.map(str::to_string),
                entity_key: entity.map(str::to_string),
            },
            ..record("curricula", key, t0())
        }
    }

    #[test]
    fn test_lru_eviction_keeps_max_entries() {
        let expiration = Expiration::new(3, Duration::hours(1));
        let mut cache = NamedCache::default();
        for key in ["/a", "/b", "/c"] {
            cache.put(record("apis", key, t0()), &expiration, t0());
        }
        // Reading /a makes /b the least recently used.
        assert!(cache.get("/a", &expiration, t0()).0.is_some());

        let evicted = cache.put(record("apis", "/d", t0()), &expiration, t0());
        assert_eq!(evicted, vec!["/b".to_string()]);
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains("/b"));
        assert!(cache.contains("/a"));
        assert!(cache.contains("/d"));
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let expiration = Expiration::new(2, Duration::hours(1));
        let mut cache = NamedCache::default();
        cache.put(record("apis", "/a", t0()), &expiration, t0());
        cache.put(record("apis", "/b", t0()), &expiration, t0());
        let evicted = cache.put(record("apis", "/a", t0()), &expiration, t0());
        assert!(evicted.is_empty());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_expired_record_is_absent_on_read() {
        let expiration = Expiration::new(10, Duration::hours(1));
        let mut cache = NamedCache::default();
        cache.put(record("apis", "/a", t0()), &expiration, t0());

        let (hit, expired) = cache.get("/a", &expiration, t0() + Duration::minutes(59));
        assert!(hit.is_some());
        assert!(!expired);

        let (hit, expired) = cache.get("/a", &expiration, t0() + Duration::minutes(61));
        assert!(hit.is_none());
        assert!(expired);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_put_purges_expired_records() {
        let expiration = Expiration::new(10, Duration::hours(1));
        let mut cache = NamedCache::default();
        cache.put(record("apis", "/old", t0()), &expiration, t0());

        let later = t0() + Duration::hours(2);
        let removed = cache.put(record("apis", "/new", later), &expiration, later);
        assert_eq!(removed, vec!["/old".to_string()]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_unbounded_cache_never_expires() {
        let expiration = Expiration::unbounded();
        let mut cache = NamedCache::default();
        cache.put(record("precache", "/offline", t0()), &expiration, t0());
        let (hit, _) = cache.get("/offline", &expiration, t0() + Duration::days(3650));
        assert!(hit.is_some());
    }

    #[test]
    fn test_scoped_invalidation_is_idempotent() {
        let expiration = Expiration::new(10, Duration::hours(1));
        let mut cache = NamedCache::default();
        cache.put(tagged("/api/curricula/C123", None, Some("C123")), &expiration, t0());
        cache.put(tagged("/api/curricula/C456", None, Some("C456")), &expiration, t0());

        let scope = InvalidationScope::Entity("C123".to_string());
        assert_eq!(cache.invalidate(&scope), 1);
        assert_eq!(cache.invalidate(&scope), 0);
        assert!(cache.contains("/api/curricula/C456"));

        assert_eq!(cache.invalidate(&InvalidationScope::Owner("u1".to_string())), 0);
        assert_eq!(cache.invalidate(&InvalidationScope::All), 1);
    }

    #[test]
    fn test_record_serves_as_cached_response() {
        let response = record("apis", "/a", t0()).to_response();
        assert_eq!(response.source, ResponseSource::Cache);
        assert_eq!(response.body, b"/a".to_vec());
    }

    #[test]
    fn test_persist_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let expiration = Expiration::new(10, Duration::hours(1));

        let mut storage = CacheStorage::open(dir.path(), "v1");
        storage.put(record("apis", "/a", t0()), &expiration, t0());
        assert!(dir.path().join("v1").join("apis.json").exists());

        let mut reopened = CacheStorage::open(dir.path(), "v1");
        assert_eq!(reopened.cache_names(), vec!["apis"]);
        assert!(reopened.get("apis", "/a", &expiration, t0()).is_some());
    }

    #[test]
    fn test_corrupt_cache_file_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("v1")).unwrap();
        std::fs::write(dir.path().join("v1").join("apis.json"), "{ nope").unwrap();

        let storage = CacheStorage::open(dir.path(), "v1");
        assert!(storage.cache("apis").is_none());
        assert!(!dir.path().join("v1").join("apis.json").exists());
    }

    #[test]
    fn test_activate_removes_other_generations() {
        let dir = tempfile::tempdir().unwrap();
        let expiration = Expiration::new(10, Duration::hours(1));

        let mut old = CacheStorage::open(dir.path(), "v1");
        old.put(record("apis", "/a", t0()), &expiration, t0());

        let mut current = CacheStorage::open(dir.path(), "v2");
        current.put(record("apis", "/b", t0()), &expiration, t0());
        let removed = current.activate();

        assert_eq!(removed, vec!["v1".to_string()]);
        assert!(!dir.path().join("v1").exists());
        assert!(dir.path().join("v2").join("apis.json").exists());
    }

    #[test]
    fn test_in_memory_storage() {
        let expiration = Expiration::new(10, Duration::hours(1));
        let mut storage = CacheStorage::in_memory("v1");
        assert!(storage.activate().is_empty());
        storage.put(record("apis", "/a", t0()), &expiration, t0());
        assert_eq!(storage.invalidate("apis", &InvalidationScope::All), 1);
        assert_eq!(storage.invalidate("missing", &InvalidationScope::All), 0);
        assert!(storage.get("apis", "/a", &expiration, t0()).is_none());
    }
}
