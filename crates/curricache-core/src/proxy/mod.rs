//! Tier 2: a background network proxy with its own lifecycle.
//!
//! Page code never touches proxy storage. It reaches the proxy only through
//! a [`ProxyHandle`], either by sending requests that the proxy answers from
//! cache or network according to the [`RouteTable`], or by posting
//! invalidation messages.

pub mod network;
pub mod route;
pub mod store;
pub mod strategy;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use network::{
    HttpNetwork, Method, Network, ProxyRequest, ProxyResponse, RequestMode, ResponseSource,
};
pub use route::{Expiration, RoutePattern, RouteRule, RouteTable, RouteTags, Strategy};
pub use store::{CacheStorage, ProxyCacheRecord};
pub use worker::{install, InterceptedNetwork, ProxyConfig, ProxyHandle};
