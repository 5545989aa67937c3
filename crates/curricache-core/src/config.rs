//! Application configuration management.
//!
//! Holds the API location, the last dashboard owner, the proxy's cache
//! version and the freshness windows for each data class.
//!
//! Configuration is stored at `~/.config/curricache/config.json`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache::{Policies, StalenessPolicy};
use crate::proxy::{ProxyConfig, RouteTable};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "curricache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding `api_base_url`
pub const ENV_API_URL: &str = "CURRICACHE_API_URL";

/// Environment variable overriding `last_owner`
pub const ENV_OWNER: &str = "CURRICACHE_OWNER";

const DEFAULT_API_BASE_URL: &str = "http://localhost:8080";

/// Bumping this drops every cache the proxy stored under the old value.
const DEFAULT_CACHE_VERSION: &str = "v1";

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_cache_version() -> String {
    DEFAULT_CACHE_VERSION.to_string()
}

fn default_entity_ttl() -> i64 {
    10
}

fn default_collection_ttl() -> i64 {
    5
}

fn default_aggregate_ttl() -> i64 {
    15
}

fn default_network_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default)]
    pub last_owner: Option<String>,
    /// Skip the proxy and talk to the network directly.
    #[serde(default)]
    pub offline_mode: bool,
    #[serde(default = "default_cache_version")]
    pub cache_version: String,
    #[serde(default = "default_entity_ttl")]
    pub entity_ttl_minutes: i64,
    #[serde(default = "default_collection_ttl")]
    pub collection_ttl_minutes: i64,
    #[serde(default = "default_aggregate_ttl")]
    pub aggregate_ttl_minutes: i64,
    #[serde(default = "default_network_timeout")]
    pub network_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            last_owner: None,
            offline_mode: false,
            cache_version: default_cache_version(),
            entity_ttl_minutes: default_entity_ttl(),
            collection_ttl_minutes: default_collection_ttl(),
            aggregate_ttl_minutes: default_aggregate_ttl(),
            network_timeout_secs: default_network_timeout(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply `CURRICACHE_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(
            std::env::var(ENV_API_URL).ok(),
            std::env::var(ENV_OWNER).ok(),
        );
    }

    fn apply_overrides(&mut self, api_url: Option<String>, owner: Option<String>) {
        if let Some(url) = api_url.filter(|u| !u.trim().is_empty()) {
            self.api_base_url = url;
        }
        if let Some(owner) = owner.filter(|o| !o.trim().is_empty()) {
            self.last_owner = Some(owner);
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Staleness policies with this config's TTLs.
    pub fn policies(&self) -> Policies {
        let defaults = Policies::default();
        let minutes = chrono::Duration::minutes;
        Policies {
            entity: StalenessPolicy::new(
                minutes(self.entity_ttl_minutes),
                defaults.entity.force_refresh_on_miss,
            ),
            collection: StalenessPolicy::new(
                minutes(self.collection_ttl_minutes),
                defaults.collection.force_refresh_on_miss,
            ),
            aggregate: StalenessPolicy::new(
                minutes(self.aggregate_ttl_minutes),
                defaults.aggregate.force_refresh_on_miss,
            ),
        }
    }

    /// Proxy settings, persisting under `<cache_dir>/proxy`.
    pub fn proxy_config(&self, cache_dir: &Path) -> ProxyConfig {
        let timeout = Duration::from_secs(self.network_timeout_secs);
        ProxyConfig::new(&self.cache_version)
            .with_routes(RouteTable::standard_with_timeout(timeout))
            .with_storage_dir(cache_dir.join("proxy"))
    }
}
