//! Two-tier client cache for the curriculum dashboard.
//!
//! - [`cache`]: Tier 1, the in-page entry cache, collection index and the
//!   coordinator that coalesces fetches and decides freshness
//! - [`proxy`]: Tier 2, a background proxy that answers requests from its
//!   own stored responses according to a route table
//! - [`channel`]: invalidation messages from the page to the proxy
//! - [`dashboard`]: the session the UI talks to
//!
//! Supporting modules hold the backend client, configuration and durable
//! preferences.

pub mod backend;
pub mod cache;
pub mod channel;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod models;
pub mod prefs;
pub mod proxy;
pub mod time;
pub mod utils;

pub use backend::{Backend, Fetched, HttpBackend};
pub use cache::{CacheCoordinator, CacheEvent, Policies, StalenessPolicy};
pub use channel::{InvalidationChannel, InvalidationMessage, InvalidationScope, PageMessage};
pub use config::Config;
pub use dashboard::{CurriculumView, Dashboard, DashboardView, StaleNotice};
pub use error::CacheError;
pub use models::{Curriculum, CurriculumPatch, DashboardAggregate, EntityKey, OwnerKey};
pub use prefs::Preferences;
pub use proxy::{HttpNetwork, InterceptedNetwork, ProxyConfig, ProxyHandle};
pub use time::{Clock, ManualClock, SystemClock};
