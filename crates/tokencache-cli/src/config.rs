//! CLI configuration management.
//!
//! Configuration is stored at `~/.config/tokencache/config.json` and holds the
//! persistence settings plus an optional log directory. Environment variables
//! (also read from a `.env` file) override the file.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokencache_core::config::APP_NAME;
use tokencache_core::PersistenceConfig;

/// Config file name
const CONFIG_FILE: &str = "config.json";

const ENV_BACKEND: &str = "TOKENCACHE_BACKEND";
const ENV_CACHE_PATH: &str = "TOKENCACHE_CACHE_PATH";
const ENV_SERVICE: &str = "TOKENCACHE_SERVICE";
const ENV_ACCOUNT: &str = "TOKENCACHE_ACCOUNT";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Also write logs to `tokencache.log` in this directory
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Ok(serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Apply `TOKENCACHE_*` variables from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(backend) = lookup(ENV_BACKEND) {
            self.persistence.backend = backend
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .with_context(|| format!("Invalid {}", ENV_BACKEND))?;
        }
        if let Some(path) = lookup(ENV_CACHE_PATH) {
            self.persistence.cache_path = PathBuf::from(path);
        }
        if let Some(service) = lookup(ENV_SERVICE) {
            self.persistence.service_name = Some(service);
        }
        if let Some(account) = lookup(ENV_ACCOUNT) {
            self.persistence.account_name = Some(account);
        }
        Ok(())
    }
}
