//! Backend collaborator consumed by the cache coordinator.
//!
//! The coordinator only ever sees the [`Backend`] trait. [`HttpBackend`]
//! talks to the REST API through any [`Network`](crate::proxy::Network),
//! which in the running app is the background proxy.

pub mod http;

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::CacheError;
use crate::models::{Curriculum, CurriculumPatch, DashboardAggregate, EntityKey, OwnerKey};

pub use http::HttpBackend;

/// A value read from the backend, and whether the network supplied it.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub value: T,
    /// Set when the proxy answered from its own store; holds when that copy
    /// was stored.
    pub cached_at: Option<DateTime<Utc>>,
}

impl<T> Fetched<T> {
    pub fn cached(value: T, stored_at: DateTime<Utc>) -> Self {
        Self {
            value,
            cached_at: Some(stored_at),
        }
    }

    /// The advisory to show next to a value the network did not supply.
    pub fn advisory(&self) -> Option<CacheError> {
        self.cached_at.map(|at| {
            CacheError::Transport(format!(
                "Network unavailable, using copy stored at {}",
                at.format("%Y-%m-%d %H:%M UTC")
            ))
        })
    }
}

impl<T> From<T> for Fetched<T> {
    fn from(value: T) -> Self {
        Self {
            value,
            cached_at: None,
        }
    }
}

pub trait Backend: Send + Sync + 'static {
    fn fetch_entity(
        &self,
        key: &EntityKey,
    ) -> impl Future<Output = Result<Fetched<Curriculum>, CacheError>> + Send;

    fn fetch_collection(
        &self,
        owner: &OwnerKey,
    ) -> impl Future<Output = Result<Fetched<Vec<Curriculum>>, CacheError>> + Send;

    fn fetch_aggregate(
        &self,
        owner: &OwnerKey,
    ) -> impl Future<Output = Result<Fetched<DashboardAggregate>, CacheError>> + Send;

    fn write(
        &self,
        key: &EntityKey,
        patch: &CurriculumPatch,
    ) -> impl Future<Output = Result<Curriculum, CacheError>> + Send;
}
