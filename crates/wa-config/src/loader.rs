//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "orchestrator.toml",
    "./config/config.toml",
    "/etc/wa-orchestrator/config.toml",
];

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "WA_ORCHESTRATOR_CONFIG";

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides.
    ///
    /// The merged result is validated before it is returned.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        config.validate()?;

        info!(
            tenants = config.tenants.len(),
            profiles = config.antiban.profiles.len(),
            maturation_enabled = config.maturation.enabled,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var(CONFIG_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        apply_overrides(config, |key| env::var(key).ok());
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_overrides<F>(config: &mut AppConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    // Gateway
    if let Some(val) = lookup("WA_GATEWAY_URL") {
        config.gateway.base_url = val;
    }
    if let Some(val) = lookup("WA_GATEWAY_API_KEY") {
        config.gateway.api_key = val;
    }
    if let Some(val) = lookup("WA_GATEWAY_TIMEOUT_MS") {
        if let Ok(timeout) = val.parse() {
            config.gateway.timeout_ms = timeout;
        }
    }

    // Registry
    if let Some(val) = lookup("WA_REGISTRY_SCORE_DECAY") {
        if let Ok(decay) = val.parse() {
            config.registry.score_decay = decay;
        }
    }
    if let Some(val) = lookup("WA_REGISTRY_HIGH_WATERMARK") {
        if let Ok(high) = val.parse() {
            config.registry.high_watermark = high;
        }
    }
    if let Some(val) = lookup("WA_REGISTRY_LOW_WATERMARK") {
        if let Ok(low) = val.parse() {
            config.registry.low_watermark = low;
        }
    }
    if let Some(val) = lookup("WA_HEALTH_CHECK_INTERVAL_SECS") {
        if let Ok(interval) = val.parse() {
            config.registry.health_check_interval_secs = interval;
        }
    }

    // Dispatch
    if let Some(val) = lookup("WA_SELECTION_WAIT_MS") {
        if let Ok(wait) = val.parse() {
            config.dispatch.selection_wait_ms = wait;
        }
    }

    // Maturation
    if let Some(val) = lookup("WA_MATURATION_ENABLED") {
        config.maturation.enabled = val.parse().unwrap_or(true);
    }
    if let Some(val) = lookup("WA_MATURATION_TICK_INTERVAL_SECS") {
        if let Ok(interval) = val.parse() {
            config.maturation.tick_interval_secs = interval;
        }
    }
    if let Some(val) = lookup("WA_MATURATION_FAILURE_THRESHOLD") {
        if let Ok(threshold) = val.parse() {
            config.maturation.failure_threshold = threshold;
        }
    }
    if let Some(val) = lookup("WA_MATURATION_AUTO_PROMOTE") {
        config.maturation.auto_promote = val.parse().unwrap_or(false);
    }

    // General
    if let Some(val) = lookup("WA_DEV_MODE") {
        config.dev_mode = val.parse().unwrap_or(false);
    }
}
