use chrono::{DateTime, Duration, Utc};

/// Decides whether a present entry is usable or must be refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    pub ttl: Duration,
    /// When a present entry fails the freshness check: `true` makes the
    /// caller wait for the refresh, `false` hands back the stale value and
    /// refreshes in the background.
    pub force_refresh_on_miss: bool,
}

impl StalenessPolicy {
    pub fn new(ttl: Duration, force_refresh_on_miss: bool) -> Self {
        Self {
            ttl,
            force_refresh_on_miss,
        }
    }

    pub fn is_fresh(&self, fetched_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - fetched_at < self.ttl
    }
}

/// Entity detail pages wait for fresh data after 10 minutes.
const ENTITY_TTL_MINUTES: i64 = 10;

/// Curriculum lists render from cache and refresh behind the scenes.
const COLLECTION_TTL_MINUTES: i64 = 5;

/// Dashboard numbers drift slowly.
const AGGREGATE_TTL_MINUTES: i64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policies {
    pub entity: StalenessPolicy,
    pub collection: StalenessPolicy,
    pub aggregate: StalenessPolicy,
}

impl Default for Policies {
    fn default() -> Self {
        Self {
            entity: StalenessPolicy::new(Duration::minutes(ENTITY_TTL_MINUTES), true),
            collection: StalenessPolicy::new(Duration::minutes(COLLECTION_TTL_MINUTES), false),
            aggregate: StalenessPolicy::new(Duration::minutes(AGGREGATE_TTL_MINUTES), false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_fresh_boundary() {
        let policy = StalenessPolicy::new(Duration::minutes(10), true);
        let now = Utc::now();
        assert!(policy.is_fresh(now - Duration::minutes(9), now));
        assert!(!policy.is_fresh(now - Duration::minutes(10), now));
    }

    #[test]
    fn test_default_policies() {
        let policies = Policies::default();
        assert!(policies.entity.force_refresh_on_miss);
        assert!(!policies.collection.force_refresh_on_miss);
        assert!(!policies.aggregate.force_refresh_on_miss);
    }
}
