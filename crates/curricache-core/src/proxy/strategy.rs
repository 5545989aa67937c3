//! The single executor behind every caching strategy.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use super::network::{Method, Network, ProxyRequest, ProxyResponse, ResponseSource};
use super::route::{RouteRule, RouteTags, Strategy};
use super::store::ProxyCacheRecord;
use crate::error::CacheError;
use crate::time::Clock;

/// Records to be written back into storage by the proxy worker.
pub type StoreSink = mpsc::UnboundedSender<ProxyCacheRecord>;

/// A routed request together with what storage already had for it.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub request: ProxyRequest,
    pub rule: RouteRule,
    pub tags: RouteTags,
    /// Unexpired record for this request, if any.
    pub cached: Option<ProxyCacheRecord>,
    /// Precached offline document for failed navigations.
    pub fallback: Option<ProxyCacheRecord>,
}

/// Answers `exchange` according to its rule's strategy.
pub async fn execute<N: Network>(
    exchange: Exchange,
    network: Arc<N>,
    sink: StoreSink,
    clock: Arc<dyn Clock>,
) -> Result<ProxyResponse, CacheError> {
    let Exchange {
        request,
        rule,
        tags,
        cached,
        fallback,
    } = exchange;

    match rule.strategy {
        Strategy::CacheFirst => {
            if let Some(record) = cached {
                debug!(cache = %rule.cache_name, url = %request.url, "Cache-first hit");
                return Ok(record.to_response());
            }
            fetch_and_store(&*network, request, &rule.cache_name, tags, &sink, &*clock).await
        }

        Strategy::NetworkFirst { timeout } => {
            let url = request.url.clone();
            let attempt = tokio::time::timeout(
                timeout,
                fetch_and_store(&*network, request, &rule.cache_name, tags, &sink, &*clock),
            )
            .await;

            let error = match attempt {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) => e,
                Err(_) => CacheError::Transport(format!(
                    "No response within {}s",
                    timeout.as_secs_f32()
                )),
            };

            if let Some(record) = cached {
                debug!(cache = %rule.cache_name, url = %url, error = %error, "Network failed, serving cache");
                return Ok(record.to_response());
            }
            if let Some(record) = fallback {
                debug!(url = %url, error = %error, "Network failed, serving offline document");
                return Ok(ProxyResponse {
                    source: ResponseSource::OfflineFallback,
                    ..record.to_response()
                });
            }
            Err(error)
        }

        Strategy::StaleWhileRevalidate => {
            let Some(record) = cached else {
                return fetch_and_store(&*network, request, &rule.cache_name, tags, &sink, &*clock)
                    .await;
            };

            debug!(cache = %rule.cache_name, url = %request.url, "Serving cached, revalidating");
            let cache_name = rule.cache_name.clone();
            tokio::spawn(async move {
                let url = request.url.clone();
                if let Err(e) =
                    fetch_and_store(&*network, request, &cache_name, tags, &sink, &*clock).await
                {
                    debug!(cache = %cache_name, url = %url, error = %e, "Revalidation failed");
                }
            });
            Ok(record.to_response())
        }
    }
}

/// Fetches from the network and queues successful GET responses for storage.
async fn fetch_and_store<N: Network>(
    network: &N,
    request: ProxyRequest,
    cache_name: &str,
    tags: RouteTags,
    sink: &StoreSink,
    clock: &dyn Clock,
) -> Result<ProxyResponse, CacheError> {
    let key = request.cache_key().to_string();
    let cacheable = request.method == Method::Get;
    let response = network.fetch(request).await?;

    if cacheable && response.is_success() {
        let record =
            ProxyCacheRecord::from_response(cache_name, &key, tags, &response, clock.now());
        // The worker is gone if this fails; the response is still good.
        let _ = sink.send(record);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::proxy::route::{Expiration, RoutePattern, RouteTable, OFFLINE_DOCUMENT, PRECACHE};
    use crate::proxy::testing::StubNetwork;
    use crate::time::ManualClock;

    fn clock() -> Arc<dyn Clock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()))
    }

    fn exchange(request: ProxyRequest, cached: Option<&str>) -> Exchange {
        let table = RouteTable::standard_with_timeout(Duration::from_millis(50));
        let (rule, tags) = table.route(&request).unwrap();
        let cached = cached.map(|body| cached_record(&rule.cache_name, &request.url, body));
        Exchange {
            rule: rule.clone(),
            tags,
            request,
            cached,
            fallback: None,
        }
    }

    fn cached_record(cache_name: &str, url: &str, body: &str) -> ProxyCacheRecord {
        ProxyCacheRecord {
            request_key: url.to_string(),
            cache_name: cache_name.to_string(),
            status: 200,
            content_type: None,
            body: body.as_bytes().to_vec(),
            stored_at: Utc.with_ymd_and_hms(2025, 3, 1, 11, 0, 0).unwrap(),
            tags: RouteTags::default(),
        }
    }

    #[tokio::test]
    async fn test_cache_first_hit_skips_network() {
        let network = Arc::new(StubNetwork::new().with("/logo.png", 200, "fresh"));
        let (sink, mut stored) = mpsc::unbounded_channel();

        let exchange = exchange(ProxyRequest::get("/logo.png"), Some("cached"));
        let response = execute(exchange, network.clone(), sink, clock()).await.unwrap();

        assert_eq!(response.text(), "cached");
        assert_eq!(response.source, ResponseSource::Cache);
        assert_eq!(network.calls("/logo.png"), 0);
        assert!(stored.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cache_first_miss_fetches_and_stores() {
        let network = Arc::new(StubNetwork::new().with("/logo.png", 200, "fresh"));
        let (sink, mut stored) = mpsc::unbounded_channel();

        let exchange = exchange(ProxyRequest::get("/logo.png"), None);
        let response = execute(exchange, network.clone(), sink, clock()).await.unwrap();

        assert_eq!(response.text(), "fresh");
        assert_eq!(response.source, ResponseSource::Network);
        let record = stored.try_recv().unwrap();
        assert_eq!(record.cache_name, "static-images");
        assert_eq!(record.request_key, "/logo.png");
    }

    #[tokio::test]
    async fn test_error_responses_are_not_stored() {
        let network = Arc::new(StubNetwork::new().with("/api/curricula/C1", 500, "boom"));
        let (sink, mut stored) = mpsc::unbounded_channel();

        let exchange = exchange(ProxyRequest::get("/api/curricula/C1"), None);
        let response = execute(exchange, network, sink, clock()).await.unwrap();

        assert_eq!(response.status, 500);
        assert!(stored.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_network_first_prefers_network() {
        let network = Arc::new(StubNetwork::new().with("/api/curricula/C1", 200, "fresh"));
        let (sink, mut stored) = mpsc::unbounded_channel();

        let exchange = exchange(ProxyRequest::get("/api/curricula/C1"), Some("cached"));
        let response = execute(exchange, network, sink, clock()).await.unwrap();

        assert_eq!(response.text(), "fresh");
        let record = stored.try_recv().unwrap();
        assert_eq!(record.tags.entity_key.as_deref(), Some("C1"));
    }

    #[tokio::test]
    async fn test_network_first_falls_back_to_cache_when_offline() {
        let network = Arc::new(StubNetwork::new());
        network.set_offline(true);
        let (sink, _stored) = mpsc::unbounded_channel();

        let exchange = exchange(ProxyRequest::get("/api/curricula/C1"), Some("cached"));
        let response = execute(exchange, network, sink, clock()).await.unwrap();

        assert_eq!(response.text(), "cached");
        assert_eq!(response.source, ResponseSource::Cache);
    }

    #[tokio::test]
    async fn test_network_first_falls_back_on_timeout() {
        let network = Arc::new(
            StubNetwork::new()
                .with("/api/curricula/C1", 200, "slow")
                .with_delay(Duration::from_millis(500)),
        );
        let (sink, _stored) = mpsc::unbounded_channel();

        let exchange = exchange(ProxyRequest::get("/api/curricula/C1"), Some("cached"));
        let response = execute(exchange, network, sink, clock()).await.unwrap();
        assert_eq!(response.text(), "cached");
    }

    #[tokio::test]
    async fn test_network_first_propagates_without_cache() {
        let network = Arc::new(StubNetwork::new());
        network.set_offline(true);
        let (sink, _stored) = mpsc::unbounded_channel();

        let exchange = exchange(ProxyRequest::get("/api/curricula/C1"), None);
        let result = execute(exchange, network, sink, clock()).await;
        assert!(matches!(result, Err(CacheError::Transport(_))));
    }

    #[tokio::test]
    async fn test_failed_navigation_serves_offline_document() {
        let network = Arc::new(StubNetwork::new());
        network.set_offline(true);
        let (sink, _stored) = mpsc::unbounded_channel();

        let mut exchange = exchange(ProxyRequest::navigate("/dashboard"), None);
        exchange.fallback = Some(cached_record(PRECACHE, OFFLINE_DOCUMENT, "offline"));
        let response = execute(exchange, network, sink, clock()).await.unwrap();

        assert_eq!(response.text(), "offline");
        assert_eq!(response.source, ResponseSource::OfflineFallback);
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_serves_cache_then_refreshes() {
        let network = Arc::new(StubNetwork::new().with("/app.js", 200, "v2"));
        let (sink, mut stored) = mpsc::unbounded_channel();

        let exchange = exchange(ProxyRequest::get("/app.js"), Some("v1"));
        let response = execute(exchange, network.clone(), sink, clock()).await.unwrap();
        assert_eq!(response.text(), "v1");

        let record = stored.recv().await.unwrap();
        assert_eq!(record.body, b"v2".to_vec());
        assert_eq!(network.calls("/app.js"), 1);
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_miss_waits_for_network() {
        let network = Arc::new(StubNetwork::new().with("/app.css", 200, "body{}"));
        let (sink, _stored) = mpsc::unbounded_channel();

        let exchange = exchange(ProxyRequest::get("/app.css"), None);
        let response = execute(exchange, network, sink, clock()).await.unwrap();
        assert_eq!(response.text(), "body{}");
        assert_eq!(response.source, ResponseSource::Network);
    }

    #[tokio::test]
    async fn test_custom_rule() {
        let rule = RouteRule::new(
            "reports",
            RoutePattern::Prefix("/reports/".to_string()),
            Strategy::CacheFirst,
            Expiration::unbounded(),
        );
        let table = RouteTable::new(vec![rule]);
        let request = ProxyRequest::get("/reports/weekly");
        let (rule, tags) = table.route(&request).unwrap();

        let network = Arc::new(StubNetwork::new().with("/reports/weekly", 200, "r"));
        let (sink, mut stored) = mpsc::unbounded_channel();
        let exchange = Exchange {
            request,
            rule: rule.clone(),
            tags,
            cached: None,
            fallback: None,
        };
        execute(exchange, network, sink, clock()).await.unwrap();
        assert_eq!(stored.try_recv().unwrap().cache_name, "reports");
    }
}
