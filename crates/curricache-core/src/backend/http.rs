//! REST backend for the curriculum API.
//!
//! Requests go through a [`Network`], normally an
//! [`InterceptedNetwork`](crate::proxy::InterceptedNetwork) so that page
//! reads pass through the Tier 2 proxy when it is running.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::{Backend, Fetched};
use crate::error::CacheError;
use crate::models::{Curriculum, CurriculumPatch, DashboardAggregate, EntityKey, OwnerKey};
use crate::proxy::{Method, Network, ProxyRequest, ProxyResponse};

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

pub struct HttpBackend<N: Network> {
    network: Arc<N>,
    initial_backoff: Duration,
}

impl<N: Network> HttpBackend<N> {
    pub fn new(network: Arc<N>) -> Self {
        Self {
            network,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        }
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Sends `request`, retrying while rate limited, and maps failures.
    async fn send(&self, request: ProxyRequest) -> Result<ProxyResponse, CacheError> {
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let response = self.network.fetch(request.clone()).await?;
            if response.is_success() {
                return Ok(response);
            }
            if response.status == 429 && retries < MAX_RATE_LIMIT_RETRIES {
                retries += 1;
                warn!(
                    url = %request.url,
                    retry = retries,
                    backoff_ms = backoff.as_millis() as u64,
                    "Rate limited, backing off"
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                continue;
            }
            return Err(CacheError::from_status(response.status, &response.text()));
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<Fetched<T>, CacheError> {
        debug!(url = %url, "GET");
        let response = self.send(ProxyRequest::get(url.clone())).await?;
        if let Some(stored_at) = response.cached_at() {
            debug!(url = %url, stored_at = %stored_at, "Served from proxy cache");
        }
        Ok(Fetched {
            value: response.json()?,
            cached_at: response.cached_at(),
        })
    }
}

fn curriculum_url(key: &EntityKey) -> String {
    format!("/api/curricula/{}", urlencoding::encode(key.as_str()))
}

fn owner_url(owner: &OwnerKey, resource: &str) -> String {
    format!("/api/users/{}/{}", urlencoding::encode(owner.as_str()), resource)
}

impl<N: Network> Backend for HttpBackend<N> {
    fn fetch_entity(
        &self,
        key: &EntityKey,
    ) -> impl Future<Output = Result<Fetched<Curriculum>, CacheError>> + Send {
        self.get_json(curriculum_url(key))
    }

    fn fetch_collection(
        &self,
        owner: &OwnerKey,
    ) -> impl Future<Output = Result<Fetched<Vec<Curriculum>>, CacheError>> + Send {
        self.get_json(owner_url(owner, "curricula"))
    }

    fn fetch_aggregate(
        &self,
        owner: &OwnerKey,
    ) -> impl Future<Output = Result<Fetched<DashboardAggregate>, CacheError>> + Send {
        self.get_json(owner_url(owner, "dashboard"))
    }

    fn write(
        &self,
        key: &EntityKey,
        patch: &CurriculumPatch,
    ) -> impl Future<Output = Result<Curriculum, CacheError>> + Send {
        let request = ProxyRequest::json(Method::Patch, curriculum_url(key), patch);
        async move {
            debug!(url = %curriculum_url(key), "PATCH");
            let response = self.send(request?).await?;
            response.json()
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::proxy::testing::{settle, wait_active, StubNetwork};
    use crate::proxy::{install, InterceptedNetwork, ProxyConfig};
    use crate::time::ManualClock;

    fn backend(network: StubNetwork) -> (HttpBackend<StubNetwork>, Arc<StubNetwork>) {
        let network = Arc::new(network);
        let backend = HttpBackend::new(network.clone()).with_initial_backoff(Duration::from_millis(1));
        (backend, network)
    }

    const C1: &str = r#"{"id":"C1","ownerId":"u1","title":"Rust","description":"","resources":[],"updatedAt":"2025-03-01T12:00:00Z"}"#;

    #[tokio::test]
    async fn test_fetch_entity() {
        let (backend, network) = backend(StubNetwork::new().with("/api/curricula/C1", 200, C1));
        let curriculum = backend.fetch_entity(&EntityKey::new("C1")).await.unwrap();
        assert_eq!(curriculum.value.title, "Rust");
        assert!(curriculum.cached_at.is_none());
        assert_eq!(network.calls("/api/curricula/C1"), 1);
    }

    #[tokio::test]
    async fn test_keys_are_percent_encoded_in_paths() {
        let (backend, network) = backend(StubNetwork::new().with("/api/curricula/a%2Fb%20c", 200, C1));
        backend.fetch_entity(&EntityKey::new("a/b c")).await.unwrap();
        assert_eq!(network.calls("/api/curricula/a%2Fb%20c"), 1);
        assert_eq!(owner_url(&OwnerKey::new("ada l"), "dashboard"), "/api/users/ada%20l/dashboard");
    }

    #[tokio::test]
    async fn test_stored_copy_reports_when_it_was_stored() {
        let stored_at = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let network = Arc::new(StubNetwork::new().with("/api/curricula/C1", 200, C1));
        let (proxy, _task) = install(
            ProxyConfig::new("v1"),
            network.clone(),
            Arc::new(ManualClock::new(stored_at)),
        );
        wait_active(&proxy).await;
        let backend = HttpBackend::new(Arc::new(InterceptedNetwork::new(
            Some(proxy.clone()),
            network.clone(),
        )));

        let online = backend.fetch_entity(&EntityKey::new("C1")).await.unwrap();
        assert!(online.cached_at.is_none());
        settle(&proxy).await;

        network.set_offline(true);
        let offline = backend.fetch_entity(&EntityKey::new("C1")).await.unwrap();
        assert_eq!(offline.value.title, "Rust");
        assert_eq!(offline.cached_at, Some(stored_at));
        assert!(offline.advisory().is_some_and(|e| e.is_transport()));
    }

    #[tokio::test]
    async fn test_not_found() {
        let (backend, _) = backend(StubNetwork::new());
        let result = backend.fetch_entity(&EntityKey::new("missing")).await;
        assert!(matches!(result, Err(CacheError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_malformed_body_is_decode_error() {
        let (backend, _) = backend(StubNetwork::new().with("/api/users/u1/curricula", 200, "[{"));
        let result = backend.fetch_collection(&OwnerKey::new("u1")).await;
        assert!(matches!(result, Err(CacheError::Decode(_))));
    }

    #[tokio::test]
    async fn test_rate_limit_gives_up_after_retries() {
        let (backend, network) = backend(StubNetwork::new().with("/api/users/u1/dashboard", 429, "slow down"));
        let result = backend.fetch_aggregate(&OwnerKey::new("u1")).await;
        assert!(matches!(result, Err(CacheError::Transport(_))));
        assert_eq!(
            network.calls("/api/users/u1/dashboard"),
            1 + MAX_RATE_LIMIT_RETRIES as usize
        );
    }

    #[tokio::test]
    async fn test_unreachable_network_is_transport_error() {
        let (backend, network) = backend(StubNetwork::new());
        network.set_offline(true);
        let result = backend.fetch_entity(&EntityKey::new("C1")).await;
        assert!(matches!(result, Err(CacheError::Transport(_))));
    }
}
