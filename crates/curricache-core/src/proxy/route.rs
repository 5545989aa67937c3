//! URL pattern → caching strategy table.
//!
//! This table is the whole externally visible contract of the proxy: which
//! requests are cached, under which cache name, for how long, and how the
//! network and the cache are consulted. The first matching rule wins.

use std::time::Duration;

use chrono::Duration as Age;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::network::{ProxyRequest, RequestMode};

/// Timeout for network-first routes.
/// A slow backend degrades to cached data instead of hanging the page.
pub const NETWORK_TIMEOUT_SECS: u64 = 10;

/// Cache that holds documents fetched at activation.
pub const PRECACHE: &str = "precache";

/// Served in place of a navigation that fails with nothing cached.
pub const OFFLINE_DOCUMENT: &str = "/offline";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    CacheFirst,
    NetworkFirst { timeout: Duration },
    StaleWhileRevalidate,
}

/// Per-cache limits, enforced lazily when the cache is read or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiration {
    pub max_entries: Option<usize>,
    pub max_age: Option<Age>,
}

impl Expiration {
    pub fn new(max_entries: usize, max_age: Age) -> Self {
        Self {
            max_entries: Some(max_entries),
            max_age: Some(max_age),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            max_entries: None,
            max_age: None,
        }
    }
}

/// Keys pulled out of a matched URL, used to scope invalidations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteTags {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_key: Option<String>,
}

#[derive(Debug, Clone)]
pub enum RoutePattern {
    /// File extensions, without the dot. Case-insensitive.
    Suffix(Vec<String>),
    Prefix(String),
    /// Matched against the path. Named groups `owner` and `entity` become
    /// tags, percent-decoded.
    Regex(Regex),
    /// Any page navigation.
    Navigation,
}

impl RoutePattern {
    pub fn suffix(extensions: &[&str]) -> Self {
        RoutePattern::Suffix(extensions.iter().map(|e| e.to_ascii_lowercase()).collect())
    }

    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Ok(RoutePattern::Regex(Regex::new(pattern)?))
    }

    fn matches(&self, request: &ProxyRequest) -> Option<RouteTags> {
        let path = request.path();
        match self {
            RoutePattern::Suffix(extensions) => {
                let file = path.rsplit('/').next().unwrap_or(path);
                let (_, extension) = file.rsplit_once('.')?;
                let extension = extension.to_ascii_lowercase();
                extensions
                    .iter()
                    .any(|e| *e == extension)
                    .then(RouteTags::default)
            }
            RoutePattern::Prefix(prefix) => path.starts_with(prefix.as_str()).then(RouteTags::default),
            RoutePattern::Regex(regex) => {
                let captures = regex.captures(path)?;
                Some(RouteTags {
                    owner_key: captures.name("owner").map(|m| decode_segment(m.as_str())),
                    entity_key: captures.name("entity").map(|m| decode_segment(m.as_str())),
                })
            }
            RoutePattern::Navigation => {
                (request.mode == RequestMode::Navigate).then(RouteTags::default)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouteRule {
    pub cache_name: String,
    pub pattern: RoutePattern,
    pub strategy: Strategy,
    pub expiration: Expiration,
    /// Precached URL to serve when a network-first navigation fails.
    pub offline_fallback: Option<String>,
}

impl RouteRule {
    pub fn new(cache_name: &str, pattern: RoutePattern, strategy: Strategy, expiration: Expiration) -> Self {
        Self {
            cache_name: cache_name.to_string(),
            pattern,
            strategy,
            expiration,
            offline_fallback: None,
        }
    }

    pub fn with_offline_fallback(mut self, url: &str) -> Self {
        self.offline_fallback = Some(url.to_string());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl RouteTable {
    pub fn new(rules: Vec<RouteRule>) -> Self {
        Self { rules }
    }

    /// The dashboard's routes.
    pub fn standard() -> Self {
        Self::standard_with_timeout(Duration::from_secs(NETWORK_TIMEOUT_SECS))
    }

    pub fn standard_with_timeout(timeout: Duration) -> Self {
        let network_first = Strategy::NetworkFirst { timeout };
        Self::new(vec![
            RouteRule::new(
                "static-fonts",
                RoutePattern::suffix(&["woff", "woff2", "ttf", "otf", "eot"]),
                Strategy::CacheFirst,
                Expiration::new(16, Age::days(365)),
            ),
            RouteRule::new(
                "static-images",
                RoutePattern::suffix(&["png", "jpg", "jpeg", "gif", "svg", "webp", "ico"]),
                Strategy::CacheFirst,
                Expiration::new(64, Age::days(30)),
            ),
            RouteRule::new(
                "user-curricula",
                builtin_regex(r"^/api/users/(?P<owner>[^/]+)/curricula/?$"),
                network_first,
                Expiration::new(32, Age::hours(1)),
            ),
            RouteRule::new(
                "user-dashboard",
                builtin_regex(r"^/api/users/(?P<owner>[^/]+)/dashboard/?$"),
                network_first,
                Expiration::new(32, Age::hours(1)),
            ),
            RouteRule::new(
                "curricula",
                builtin_regex(r"^/api/curricula/(?P<entity>[^/]+)/?$"),
                network_first,
                Expiration::new(64, Age::hours(1)),
            ),
            RouteRule::new(
                "apis",
                RoutePattern::Prefix("/api/".to_string()),
                network_first,
                Expiration::new(16, Age::hours(1)),
            ),
            RouteRule::new(
                "static-js",
                RoutePattern::suffix(&["js"]),
                Strategy::StaleWhileRevalidate,
                Expiration::new(32, Age::days(1)),
            ),
            RouteRule::new(
                "static-styles",
                RoutePattern::suffix(&["css"]),
                Strategy::StaleWhileRevalidate,
                Expiration::new(32, Age::days(1)),
            ),
            RouteRule::new(
                "static-data",
                RoutePattern::suffix(&["json", "xml", "csv"]),
                Strategy::StaleWhileRevalidate,
                Expiration::new(32, Age::days(1)),
            ),
            RouteRule::new(
                "pages",
                RoutePattern::Navigation,
                network_first,
                Expiration::new(32, Age::days(1)),
            )
            .with_offline_fallback(OFFLINE_DOCUMENT),
        ])
    }

    /// First rule matching `request`, with any keys captured from its URL.
    pub fn route(&self, request: &ProxyRequest) -> Option<(&RouteRule, RouteTags)> {
        self.rules
            .iter()
            .find_map(|rule| rule.pattern.matches(request).map(|tags| (rule, tags)))
    }

    pub fn rule(&self, cache_name: &str) -> Option<&RouteRule> {
        self.rules.iter().find(|rule| rule.cache_name == cache_name)
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }
}

/// Tags must compare equal to the raw keys pages invalidate with.
fn decode_segment(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

fn builtin_regex(pattern: &str) -> RoutePattern {
    RoutePattern::regex(pattern).expect("built-in route patterns are valid")
}
