//! Requests, responses and the network the proxy forwards to.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{header, Client, Url};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::error::CacheError;

/// HTTP request timeout in seconds.
/// Network-first routes race their own, shorter timeout on top of this.
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Whether the request loads a page or fetches data for one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    Fetch,
    Navigate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub method: Method,
    /// Path and query, relative to the API origin.
    pub url: String,
    pub mode: RequestMode,
    pub body: Option<Vec<u8>>,
    pub content_type: Option<String>,
}

impl ProxyRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            mode: RequestMode::Fetch,
            body: None,
            content_type: None,
        }
    }

    pub fn navigate(url: impl Into<String>) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    pub fn json<B: Serialize>(method: Method, url: impl Into<String>, body: &B) -> Result<Self, CacheError> {
        Ok(Self {
            method,
            url: url.into(),
            mode: RequestMode::Fetch,
            body: Some(serde_json::to_vec(body)?),
            content_type: Some("application/json".to_string()),
        })
    }

    /// The path without query string or fragment.
    pub fn path(&self) -> &str {
        let end = self.url.find(['?', '#']).unwrap_or(self.url.len());
        &self.url[..end]
    }

    /// Key under which a response to this request is stored.
    pub fn cache_key(&self) -> &str {
        &self.url
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    /// The designated offline document, served in place of a failed navigation.
    OfflineFallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub source: ResponseSource,
    /// When the stored record this was served from was written.
    pub stored_at: Option<DateTime<Utc>>,
}

impl ProxyResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, CacheError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Set when the proxy answered from its own store instead of the network.
    pub fn cached_at(&self) -> Option<DateTime<Utc>> {
        match self.source {
            ResponseSource::Network => None,
            ResponseSource::Cache | ResponseSource::OfflineFallback => self.stored_at,
        }
    }
}

/// Where requests go when nothing answers them from cache.
pub trait Network: Send + Sync + 'static {
    fn fetch(
        &self,
        request: ProxyRequest,
    ) -> impl Future<Output = Result<ProxyResponse, CacheError>> + Send;
}

/// The real network, via reqwest.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpNetwork {
    client: Client,
    base_url: Url,
}

impl HttpNetwork {
    pub fn new(base_url: &str) -> Result<Self, CacheError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| CacheError::Transport(format!("Invalid base URL {}: {}", base_url, e)))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

impl Network for HttpNetwork {
    fn fetch(
        &self,
        request: ProxyRequest,
    ) -> impl Future<Output = Result<ProxyResponse, CacheError>> + Send {
        let client = self.client.clone();
        let url = self.base_url.join(&request.url);

        async move {
            let url = url.map_err(|e| {
                CacheError::Transport(format!("Invalid request URL {}: {}", request.url, e))
            })?;
            debug!(method = ?request.method, url = %url, "Network fetch");

            let mut builder = client.request(request.method.as_reqwest(), url);
            if let Some(content_type) = request.content_type {
                builder = builder.header(header::CONTENT_TYPE, content_type);
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = builder.send().await?;
            let status = response.status().as_u16();
            let content_type = response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response.bytes().await?.to_vec();

            Ok(ProxyResponse {
                status,
                content_type,
                body,
                source: ResponseSource::Network,
                stored_at: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_strips_query() {
        assert_eq!(ProxyRequest::get("/api/curricula/C1?x=1").path(), "/api/curricula/C1");
        assert_eq!(ProxyRequest::get("/app.js#v2").path(), "/app.js");
        assert_eq!(ProxyRequest::get("/plain").path(), "/plain");
    }

    #[test]
    fn test_json_request_sets_content_type() {
        let request = ProxyRequest::json(Method::Patch, "/api/curricula/C1", &serde_json::json!({"title": "T"})).unwrap();
        assert_eq!(request.content_type.as_deref(), Some("application/json"));
        assert_eq!(request.body.unwrap(), br#"{"title":"T"}"#.to_vec());
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(HttpNetwork::new("not a url"), Err(CacheError::Transport(_))));
    }

    #[test]
    fn test_response_json_decode_error() {
        let response = ProxyResponse {
            status: 200,
            content_type: None,
            body: b"{not json".to_vec(),
            source: ResponseSource::Network,
            stored_at: None,
        };
        assert!(matches!(response.json::<serde_json::Value>(), Err(CacheError::Decode(_))));
    }
}
