//! Durable client-side flags.
//!
//! Keys follow `curricache.<domain>.<flag>`. The file is read once at
//! startup and rewritten whenever a flag changes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::debug;

/// Preferences file name in cache directory
const PREFS_FILE: &str = "preferences.json";

/// Set once the user closes the first-run banner on the dashboard.
pub const ONBOARDING_BANNER_DISMISSED: &str = "curricache.dashboard.onboarding_banner_dismissed";

pub struct Preferences {
    cache_dir: PathBuf,
    flags: BTreeMap<String, bool>,
}

impl Preferences {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            flags: BTreeMap::new(),
        }
    }

    /// Load flags from disk. A missing file means nothing has been set yet.
    pub fn load(cache_dir: PathBuf) -> Result<Self> {
        let mut prefs = Self::new(cache_dir);
        let path = prefs.prefs_path();
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .context("Failed to read preferences file")?;
            prefs.flags = serde_json::from_str(&contents)
                .context("Failed to parse preferences file")?;
            debug!(flags = prefs.flags.len(), "Loaded preferences");
        }
        Ok(prefs)
    }

    /// Save flags to disk
    pub fn save(&self) -> Result<()> {
        let path = self.prefs_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&self.flags)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn flag(&self, key: &str) -> bool {
        self.flags.get(key).copied().unwrap_or(false)
    }

    /// Set a flag and write it through.
    pub fn set_flag(&mut self, key: &str, value: bool) -> Result<()> {
        if self.flags.get(key) == Some(&value) {
            return Ok(());
        }
        self.flags.insert(key.to_string(), value);
        self.save()
    }

    fn prefs_path(&self) -> PathBuf {
        self.cache_dir.join(PREFS_FILE)
    }
}
