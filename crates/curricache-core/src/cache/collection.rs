//! Owner → ordered member keys.
//!
//! A refresh replaces the whole member list at once; there is no way to
//! add or remove a single member.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::models::{EntityKey, OwnerKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionEntry {
    pub owner_key: OwnerKey,
    pub member_keys: Vec<EntityKey>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct CollectionIndex {
    entries: HashMap<OwnerKey, CollectionEntry>,
}

impl CollectionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_collection(&self, owner: &str) -> Option<&CollectionEntry> {
        self.entries.get(owner)
    }

    /// Replace the membership for `owner`. Duplicate keys keep their first
    /// position.
    pub fn set_collection(
        &mut self,
        owner: OwnerKey,
        member_keys: impl IntoIterator<Item = EntityKey>,
        fetched_at: DateTime<Utc>,
    ) {
        let mut seen = HashSet::new();
        let member_keys: Vec<EntityKey> = member_keys
            .into_iter()
            .filter(|key| seen.insert(key.clone()))
            .collect();

        self.entries.insert(
            owner.clone(),
            CollectionEntry {
                owner_key: owner,
                member_keys,
                fetched_at,
            },
        );
    }

    pub fn invalidate_collection(&mut self, owner: &str) -> bool {
        self.entries.remove(owner).is_some()
    }
}
