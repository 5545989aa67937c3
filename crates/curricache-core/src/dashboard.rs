//! The dashboard session: what the UI calls to read and edit curricula.
//!
//! Reads go through the coordinator. Writes go to the backend directly,
//! then invalidate exactly the Tier 1 entries they affect and tell the
//! proxy to drop its copies.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::cache::CacheCoordinator;
use crate::channel::{InvalidationChannel, InvalidationScope};
use crate::error::CacheError;
use crate::models::{Curriculum, CurriculumPatch, DashboardAggregate, EntityKey, OwnerKey};
use crate::prefs::{Preferences, ONBOARDING_BANNER_DISMISSED};
use crate::time::{Clock, SystemClock};
use crate::utils::format_age;

/// Proxy cache holding each owner's curriculum list.
pub const USER_CURRICULA_CACHE: &str = "user-curricula";

/// Proxy cache holding each owner's dashboard summary.
pub const USER_DASHBOARD_CACHE: &str = "user-dashboard";

/// Proxy cache holding individual curricula.
pub const CURRICULA_CACHE: &str = "curricula";

/// Shown instead of an error when cached data is on screen because a
/// refresh failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleNotice {
    pub fetched_at: Option<DateTime<Utc>>,
    /// e.g. "2h ago"
    pub age: Option<String>,
    pub reason: CacheError,
}

impl StaleNotice {
    pub fn message(&self) -> String {
        match &self.age {
            Some(age) => format!("Offline - showing data from {}", age),
            None => "Offline - showing saved data".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DashboardView {
    pub owner: OwnerKey,
    pub curricula: Vec<Curriculum>,
    pub aggregate: DashboardAggregate,
    pub notice: Option<StaleNotice>,
    pub show_onboarding_banner: bool,
}

#[derive(Debug, Clone)]
pub struct CurriculumView {
    pub curriculum: Curriculum,
    pub notice: Option<StaleNotice>,
}

pub struct Dashboard<B: Backend> {
    coordinator: Arc<CacheCoordinator<B>>,
    backend: Arc<B>,
    channel: InvalidationChannel,
    prefs: Preferences,
    clock: Arc<dyn Clock>,
}

impl<B: Backend> Dashboard<B> {
    pub fn new(
        coordinator: Arc<CacheCoordinator<B>>,
        backend: Arc<B>,
        channel: InvalidationChannel,
        prefs: Preferences,
    ) -> Self {
        Self {
            coordinator,
            backend,
            channel,
            prefs,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn coordinator(&self) -> &Arc<CacheCoordinator<B>> {
        &self.coordinator
    }

    /// Load everything the dashboard shows for `owner`.
    ///
    /// Fails only when there is nothing cached to show. Cached data kept on
    /// screen after a failed refresh comes back with a [`StaleNotice`].
    pub async fn load(&self, owner: &OwnerKey) -> Result<DashboardView, CacheError> {
        let (curricula, aggregate) = futures::join!(
            self.coordinator.get_cached_collection(owner, false),
            self.coordinator.get_cached_aggregate(owner, false),
        );
        let curricula = curricula?;

        let mut reasons: Vec<(CacheError, Option<DateTime<Utc>>)> = Vec::new();
        if let Some(err) = self.coordinator.collection_error(owner.as_str()) {
            reasons.push((err, self.coordinator.collection_fetched_at(owner.as_str())));
        }
        for curriculum in &curricula {
            if let Some(err) = self.coordinator.last_error(curriculum.id.as_str()) {
                reasons.push((err, self.coordinator.fetched_at(curriculum.id.as_str())));
            }
        }

        let aggregate = match aggregate {
            Ok(aggregate) => {
                if let Some(err) = self.coordinator.aggregate_error(owner.as_str()) {
                    reasons.push((err, None));
                }
                aggregate
            }
            Err(err) if err.is_transport() => {
                warn!(owner = %owner, error = %err, "Aggregate unavailable, summarising cached curricula");
                reasons.push((err, None));
                DashboardAggregate::from_curricula(owner.clone(), &curricula)
            }
            Err(err) => return Err(err),
        };

        let notice = self.notice(reasons);
        if let Some(ref notice) = notice {
            debug!(owner = %owner, message = %notice.message(), "Showing stale dashboard");
        }

        Ok(DashboardView {
            owner: owner.clone(),
            curricula,
            aggregate,
            notice,
            show_onboarding_banner: !self.prefs.flag(ONBOARDING_BANNER_DISMISSED),
        })
    }

    /// Load a single curriculum for its detail page.
    pub async fn open(&self, key: &EntityKey) -> Result<CurriculumView, CacheError> {
        let curriculum = self.coordinator.get_cached_entity(key, false).await?;
        let notice = self
            .coordinator
            .last_error(key.as_str())
            .and_then(|err| self.notice(vec![(err, self.coordinator.fetched_at(key.as_str()))]));
        Ok(CurriculumView { curriculum, notice })
    }

    /// Save `patch` and invalidate what it affects, in both tiers.
    ///
    /// Sibling curricula stay cached; only the edited entity, the owner's
    /// membership list and the owner's summary are dropped.
    pub async fn update_curriculum(
        &self,
        owner: &OwnerKey,
        key: &EntityKey,
        patch: &CurriculumPatch,
    ) -> Result<Curriculum, CacheError> {
        let updated = self.backend.write(key, patch).await?;

        self.coordinator.invalidate_entity(key.as_str());
        self.coordinator.invalidate_owner_collection(owner.as_str());
        self.coordinator.invalidate_aggregate(owner.as_str());

        self.channel.notify_invalidate(
            USER_CURRICULA_CACHE,
            InvalidationScope::Owner(owner.to_string()),
        );
        self.channel.notify_invalidate(
            USER_DASHBOARD_CACHE,
            InvalidationScope::Owner(owner.to_string()),
        );
        self.channel
            .notify_invalidate(CURRICULA_CACHE, InvalidationScope::Entity(key.to_string()));

        info!(owner = %owner, key = %key, "Curriculum updated");
        Ok(updated)
    }

    pub fn show_onboarding_banner(&self) -> bool {
        !self.prefs.flag(ONBOARDING_BANNER_DISMISSED)
    }

    pub fn dismiss_onboarding_banner(&mut self) -> Result<()> {
        self.prefs.set_flag(ONBOARDING_BANNER_DISMISSED, true)
    }

    /// The oldest data on screen decides the age shown.
    fn notice(&self, reasons: Vec<(CacheError, Option<DateTime<Utc>>)>) -> Option<StaleNotice> {
        let fetched_at = reasons.iter().filter_map(|(_, at)| *at).min();
        let (reason, _) = reasons.into_iter().next()?;
        Some(StaleNotice {
            fetched_at,
            age: fetched_at.map(|at| format_age(at, self.clock.now())),
            reason,
        })
    }
}
