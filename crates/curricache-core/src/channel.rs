//! Page → proxy invalidation messages.
//!
//! Fire-and-forget: the page never waits on the proxy and nothing is queued
//! while the proxy is inactive. Tier 1 invalidation alone keeps the page
//! correct; these messages only keep Tier 2 from serving what Tier 1 has
//! already thrown away.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CacheError;
use crate::proxy::ProxyHandle;

/// Which records of a named cache an invalidation removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationScope {
    Owner(String),
    Entity(String),
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationMessage {
    pub cache_name: String,
    pub scope: InvalidationScope,
}

/// Messages the page posts to the proxy, in their wire form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(tag = "type")]
pub enum PageMessage {
    #[serde(rename = "CACHE_INVALIDATE", rename_all = "camelCase")]
    CacheInvalidate {
        cache_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity_key: Option<String>,
    },
}

impl PageMessage {
    pub fn from_json(raw: &str) -> Result<Self, CacheError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> Result<String, CacheError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<InvalidationMessage> for PageMessage {
    fn from(message: InvalidationMessage) -> Self {
        let (owner_key, entity_key) = match message.scope {
            InvalidationScope::Owner(owner) => (Some(owner), None),
            InvalidationScope::Entity(entity) => (None, Some(entity)),
            InvalidationScope::All => (None, None),
        };
        PageMessage::CacheInvalidate {
            cache_name: message.cache_name,
            owner_key,
            entity_key,
        }
    }
}

impl From<PageMessage> for InvalidationMessage {
    /// An entity key is the narrower scope, so it wins when both are set.
    fn from(message: PageMessage) -> Self {
        match message {
            PageMessage::CacheInvalidate {
                cache_name,
                owner_key,
                entity_key,
            } => {
                let scope = match (entity_key, owner_key) {
                    (Some(entity), _) => InvalidationScope::Entity(entity),
                    (None, Some(owner)) => InvalidationScope::Owner(owner),
                    (None, None) => InvalidationScope::All,
                };
                InvalidationMessage { cache_name, scope }
            }
        }
    }
}

/// The page's end of the channel.
#[derive(Clone, Default)]
pub struct InvalidationChannel {
    proxy: Option<ProxyHandle>,
}

impl InvalidationChannel {
    pub fn new(proxy: ProxyHandle) -> Self {
        Self { proxy: Some(proxy) }
    }

    /// A channel with no proxy behind it. Every message is dropped.
    pub fn disconnected() -> Self {
        Self { proxy: None }
    }

    /// Posts an invalidation without waiting for, or reporting, delivery.
    pub fn notify_invalidate(&self, cache_name: &str, scope: InvalidationScope) {
        let message = InvalidationMessage {
            cache_name: cache_name.to_string(),
            scope,
        };
        let result = match &self.proxy {
            Some(proxy) => proxy.post_message(message.clone().into()),
            None => Err(CacheError::ProxyUnavailable),
        };
        match result {
            Ok(()) => debug!(cache = %message.cache_name, scope = ?message.scope, "Invalidation posted"),
            Err(e) => debug!(cache = %message.cache_name, scope = ?message.scope, error = %e, "Invalidation dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let message: PageMessage = InvalidationMessage {
            cache_name: "user-curricula".to_string(),
            scope: InvalidationScope::Owner("u1".to_string()),
        }
        .into();
        let json: serde_json::Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "CACHE_INVALIDATE", "cacheName": "user-curricula", "ownerKey": "u1"})
        );
    }

    #[test]
    fn test_from_json() {
        let message =
            PageMessage::from_json(r#"{"type":"CACHE_INVALIDATE","cacheName":"curricula","entityKey":"C123"}"#)
                .unwrap();
        let message = InvalidationMessage::from(message);
        assert_eq!(message.cache_name, "curricula");
        assert_eq!(message.scope, InvalidationScope::Entity("C123".to_string()));
    }

    #[test]
    fn test_missing_keys_mean_whole_cache() {
        let message = PageMessage::from_json(r#"{"type":"CACHE_INVALIDATE","cacheName":"apis"}"#).unwrap();
        assert_eq!(InvalidationMessage::from(message).scope, InvalidationScope::All);
    }

    #[test]
    fn test_entity_wins_over_owner() {
        let message = PageMessage::CacheInvalidate {
            cache_name: "curricula".to_string(),
            owner_key: Some("u1".to_string()),
            entity_key: Some("C1".to_string()),
        };
        assert_eq!(
            InvalidationMessage::from(message).scope,
            InvalidationScope::Entity("C1".to_string())
        );
    }

    #[test]
    fn test_malformed_message_is_decode_error() {
        assert!(matches!(
            PageMessage::from_json(r#"{"type":"SKIP_WAITING"}"#),
            Err(CacheError::Decode(_))
        ));
        assert!(matches!(PageMessage::from_json("nope"), Err(CacheError::Decode(_))));
    }

    #[test]
    fn test_disconnected_channel_drops_silently() {
        let channel = InvalidationChannel::disconnected();
        channel.notify_invalidate("curricula", InvalidationScope::All);
    }
}
