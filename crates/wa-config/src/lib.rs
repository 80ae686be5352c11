//! Orchestrator Configuration
//!
//! TOML-based configuration with environment variable overrides. Everything the
//! dispatch scheduler and the maturation engine need at startup lives here:
//! gateway connection, pool health tuning, anti-ban profiles, maturation timing,
//! and per-tenant pools and templates.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use thiserror::Error;
use wa_common::InstanceRole;

mod loader;

pub use loader::ConfigLoader;

/// Minimum distance between the health watermarks, as a fraction of the score range.
pub const MIN_WATERMARK_GAP: f64 = 0.2;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub registry: RegistryConfig,
    pub dispatch: DispatchConfig,
    pub antiban: AntibanConfig,
    pub maturation: MaturationConfig,
    pub tenants: Vec<TenantConfig>,

    /// Enable development mode
    pub dev_mode: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            registry: RegistryConfig::default(),
            dispatch: DispatchConfig::default(),
            antiban: AntibanConfig::default(),
            maturation: MaturationConfig::default(),
            tenants: Vec::new(),
            dev_mode: false,
        }
    }
}

/// Automation gateway connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: String,
    /// Timeout for every gateway call, sends included
    pub timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            api_key: String::new(),
            timeout_ms: 10_000,
        }
    }
}

/// Device pool health tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Weight kept from the previous score on each observation (0 < decay < 1)
    pub score_decay: f64,
    /// Score at or above which an instance becomes healthy
    pub high_watermark: f64,
    /// Score at or below which an instance becomes unhealthy
    pub low_watermark: f64,
    /// Daily send ceiling applied to newly registered instances
    pub default_daily_limit: u32,
    /// Cooldown after a rate-limit signal without a Retry-After hint
    pub rate_limit_cooldown_secs: u64,
    /// Cooldown after a ban signal
    pub ban_cooldown_secs: u64,
    /// Interval between connection-state probes
    pub health_check_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            score_decay: 0.8,
            high_watermark: 0.7,
            low_watermark: 0.4,
            default_daily_limit: 1000,
            rate_limit_cooldown_secs: 15 * 60,
            ban_cooldown_secs: 24 * 60 * 60,
            health_check_interval_secs: 30,
        }
    }
}

/// Dispatch path timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// How long a dispatch may wait for a compliant instance
    pub selection_wait_ms: u64,
    /// Re-check interval while waiting for an instance
    pub selection_poll_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            selection_wait_ms: 30_000,
            selection_poll_ms: 1_000,
        }
    }
}

/// One named anti-ban pacing profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AntibanProfileConfig {
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
    pub hourly_limit: u32,
    pub daily_limit: u32,
    pub batch_size: u32,
    pub pause_between_batches_ms: u64,
    /// Cap the daily limit by instance age
    pub respect_warmup: bool,
    /// Fixed "typing" wait before each real send
    pub typing_ms: u64,
    /// Chance that a send is followed by an extra long pause
    pub long_pause_probability: f64,
    pub long_pause_min_ms: u64,
    pub long_pause_max_ms: u64,
}

impl Default for AntibanProfileConfig {
    fn default() -> Self {
        Self {
            delay_min_ms: 15_000,
            delay_max_ms: 45_000,
            hourly_limit: 100,
            daily_limit: 1000,
            batch_size: 10,
            pause_between_batches_ms: 5 * 60 * 1000,
            respect_warmup: true,
            typing_ms: 3_000,
            long_pause_probability: 0.15,
            long_pause_min_ms: 5 * 60 * 1000,
            long_pause_max_ms: 15 * 60 * 1000,
        }
    }
}

/// Anti-ban profile catalogue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AntibanConfig {
    /// Profile used by tenants that do not name one
    pub default_profile: String,
    pub profiles: BTreeMap<String, AntibanProfileConfig>,
}

impl Default for AntibanConfig {
    fn default() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert("standard".to_string(), AntibanProfileConfig::default());
        profiles.insert(
            "conservative".to_string(),
            AntibanProfileConfig {
                delay_min_ms: 90_000,
                delay_max_ms: 150_000,
                hourly_limit: 30,
                daily_limit: 300,
                batch_size: 5,
                pause_between_batches_ms: 5 * 60 * 1000,
                respect_warmup: true,
                typing_ms: 3_000,
                ..Default::default()
            },
        );
        profiles.insert(
            "broadcast".to_string(),
            AntibanProfileConfig {
                delay_min_ms: 30_000,
                delay_max_ms: 60_000,
                hourly_limit: 120,
                daily_limit: 800,
                batch_size: 10,
                pause_between_batches_ms: 3 * 60 * 1000,
                respect_warmup: false,
                typing_ms: 2_000,
                long_pause_probability: 0.1,
                ..Default::default()
            },
        );
        Self {
            default_profile: "standard".to_string(),
            profiles,
        }
    }
}

/// Maturation engine timing and probabilities
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaturationConfig {
    pub enabled: bool,
    /// Wall-clock interval between ticks (one tick = one maturation day)
    pub tick_interval_secs: u64,
    /// Consecutive failed days before a chip is marked failed
    pub failure_threshold: u32,
    pub message_delay_min_ms: u64,
    pub message_delay_max_ms: u64,
    pub conversation_min_messages: u32,
    pub conversation_max_messages: u32,
    /// Probability that a chip schedules a group join on a given day
    pub group_join_probability: f64,
    /// Extra attempts for a failed conversation message within the same day
    pub send_retries: u32,
    /// Group identifiers chips may be scheduled to join
    pub groups: Vec<String>,
    /// Maximum chips per owner pool
    pub owner_capacity: usize,
    /// Owner whose pool holds operator-owned contingency chips
    pub operator_owner: String,
    pub operator_capacity: usize,
    /// A chip pair that talked within this window is not paired again
    pub partner_cooldown_secs: u64,
    /// Partner candidates considered per conversation
    pub max_partner_candidates: usize,
    /// Promote chips into the device pool as soon as they are ready
    pub auto_promote: bool,
    /// Additional strategies beyond the built-in catalogue
    pub strategies: Vec<StrategyConfig>,
}

impl Default for MaturationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_secs: 24 * 60 * 60,
            failure_threshold: 3,
            message_delay_min_ms: 3_000,
            message_delay_max_ms: 15_000,
            conversation_min_messages: 5,
            conversation_max_messages: 20,
            group_join_probability: 0.3,
            send_retries: 2,
            groups: Vec::new(),
            owner_capacity: 20,
            operator_owner: "operator".to_string(),
            operator_capacity: 100,
            partner_cooldown_secs: 24 * 60 * 60,
            max_partner_candidates: 5,
            auto_promote: false,
            strategies: Vec::new(),
        }
    }
}

/// A custom maturation strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub key: String,
    pub name: String,
    pub duration_days: u32,
    /// Daily quota for baby, child, teen, adult, mature
    pub quotas: Vec<u32>,
}

/// One instance in a tenant pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: String,
    pub role: InstanceRole,
}

/// Message content for a template type.
///
/// Placeholders use `{{field}}` and are filled from the dispatch payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TemplateSpec {
    Static { text: String },
    Variations { base: String, variants: Vec<String> },
}

/// One tenant's pool, profile and templates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    pub id: String,
    #[serde(default)]
    pub antiban_profile: Option<String>,
    /// Chance of using a content variation instead of the base text
    #[serde(default = "default_variation_probability")]
    pub variation_probability: f64,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
    #[serde(default)]
    pub templates: BTreeMap<String, TemplateSpec>,
}

fn default_variation_probability() -> f64 {
    0.7
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(msg.into())
}

fn check_probability(name: &str, p: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&p) {
        return Err(invalid(format!("{} must be within [0, 1], got {}", name, p)));
    }
    Ok(())
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Name of the anti-ban profile governing a tenant
    pub fn profile_name_for<'a>(&'a self, tenant: &'a TenantConfig) -> &'a str {
        tenant
            .antiban_profile
            .as_deref()
            .unwrap_or(&self.antiban.default_profile)
    }

    /// Reject inconsistent settings before anything is built from them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_registry()?;
        self.validate_profiles()?;
        self.validate_maturation()?;
        self.validate_tenants()?;
        Ok(())
    }

    fn validate_registry(&self) -> Result<(), ConfigError> {
        let r = &self.registry;
        if !(r.score_decay > 0.0 && r.score_decay < 1.0) {
            return Err(invalid(format!("registry.score_decay must be in (0, 1), got {}", r.score_decay)));
        }
        check_probability("registry.low_watermark", r.low_watermark)?;
        check_probability("registry.high_watermark", r.high_watermark)?;
        if r.high_watermark - r.low_watermark < MIN_WATERMARK_GAP {
            return Err(invalid(format!(
                "registry watermarks need a gap of at least {} (low={}, high={})",
                MIN_WATERMARK_GAP, r.low_watermark, r.high_watermark
            )));
        }
        if r.default_daily_limit == 0 {
            return Err(invalid("registry.default_daily_limit must be positive"));
        }
        Ok(())
    }

    fn validate_profiles(&self) -> Result<(), ConfigError> {
        if !self.antiban.profiles.contains_key(&self.antiban.default_profile) {
            return Err(invalid(format!(
                "antiban.default_profile '{}' is not defined",
                self.antiban.default_profile
            )));
        }
        for (name, p) in &self.antiban.profiles {
            if p.delay_min_ms > p.delay_max_ms {
                return Err(invalid(format!("profile '{}': delay_min_ms exceeds delay_max_ms", name)));
            }
            if p.long_pause_min_ms > p.long_pause_max_ms {
                return Err(invalid(format!("profile '{}': long_pause_min_ms exceeds long_pause_max_ms", name)));
            }
            check_probability(&format!("profile '{}' long_pause_probability", name), p.long_pause_probability)?;
            if p.batch_size == 0 || p.hourly_limit == 0 || p.daily_limit == 0 {
                return Err(invalid(format!(
                    "profile '{}': batch_size, hourly_limit and daily_limit must be positive",
                    name
                )));
            }
        }
        Ok(())
    }

    fn validate_maturation(&self) -> Result<(), ConfigError> {
        let m = &self.maturation;
        if m.failure_threshold == 0 {
            return Err(invalid("maturation.failure_threshold must be positive"));
        }
        if m.message_delay_min_ms > m.message_delay_max_ms {
            return Err(invalid("maturation.message_delay_min_ms exceeds message_delay_max_ms"));
        }
        if m.conversation_min_messages == 0 || m.conversation_min_messages > m.conversation_max_messages {
            return Err(invalid("maturation conversation length bounds are inconsistent"));
        }
        check_probability("maturation.group_join_probability", m.group_join_probability)?;
        if m.max_partner_candidates == 0 {
            return Err(invalid("maturation.max_partner_candidates must be positive"));
        }
        for s in &m.strategies {
            if s.duration_days == 0 {
                return Err(invalid(format!("strategy '{}': duration_days must be positive", s.key)));
            }
            if s.quotas.len() != 5 {
                return Err(invalid(format!("strategy '{}': expected 5 phase quotas, got {}", s.key, s.quotas.len())));
            }
            if s.quotas.windows(2).any(|w| w[0] > w[1]) {
                return Err(invalid(format!("strategy '{}': phase quotas must not decrease", s.key)));
            }
        }
        Ok(())
    }

    fn validate_tenants(&self) -> Result<(), ConfigError> {
        let mut tenant_ids = HashSet::new();
        let mut instance_ids = HashSet::new();

        for tenant in &self.tenants {
            if !tenant_ids.insert(tenant.id.as_str()) {
                return Err(invalid(format!("duplicate tenant '{}'", tenant.id)));
            }
            let profile = self.profile_name_for(tenant);
            if !self.antiban.profiles.contains_key(profile) {
                return Err(invalid(format!("tenant '{}' references unknown profile '{}'", tenant.id, profile)));
            }
            check_probability(&format!("tenant '{}' variation_probability", tenant.id), tenant.variation_probability)?;

            for instance in &tenant.instances {
                if !instance_ids.insert(instance.id.as_str()) {
                    return Err(invalid(format!("instance '{}' is assigned more than once", instance.id)));
                }
            }

            for (template_type, spec) in &tenant.templates {
                match spec {
                    TemplateSpec::Static { text } if text.trim().is_empty() => {
                        return Err(invalid(format!("tenant '{}' template '{}' is empty", tenant.id, template_type)));
                    }
                    TemplateSpec::Variations { base, variants } => {
                        if base.trim().is_empty() || variants.iter().any(|v| v.trim().is_empty()) {
                            return Err(invalid(format!(
                                "tenant '{}' template '{}' has empty text",
                                tenant.id, template_type
                            )));
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# WA Orchestrator Configuration
# Environment variables (WA_*) override these settings

dev_mode = false

[gateway]
base_url = "http://localhost:8080"
api_key = ""
timeout_ms = 10000

[registry]
score_decay = 0.8
high_watermark = 0.7
low_watermark = 0.4
default_daily_limit = 1000
rate_limit_cooldown_secs = 900
ban_cooldown_secs = 86400
health_check_interval_secs = 30

[dispatch]
selection_wait_ms = 30000
selection_poll_ms = 1000

[antiban]
default_profile = "standard"

[antiban.profiles.standard]
delay_min_ms = 15000
delay_max_ms = 45000
hourly_limit = 100
daily_limit = 1000
batch_size = 10
pause_between_batches_ms = 300000
respect_warmup = true
typing_ms = 3000
long_pause_probability = 0.15
long_pause_min_ms = 300000
long_pause_max_ms = 900000

[maturation]
enabled = true
tick_interval_secs = 86400
failure_threshold = 3
message_delay_min_ms = 3000
message_delay_max_ms = 15000
conversation_min_messages = 5
conversation_max_messages = 20
group_join_probability = 0.3
send_retries = 2
groups = ["community-a", "community-b"]
owner_capacity = 20
operator_owner = "operator"
operator_capacity = 100
partner_cooldown_secs = 86400
max_partner_candidates = 5
auto_promote = false

[[maturation.strategies]]
key = "express"
name = "Express warm-up"
duration_days = 7
quotas = [10, 20, 35, 50, 70]

[[tenants]]
id = "acme"
antiban_profile = "standard"
variation_probability = 0.7

[[tenants.instances]]
id = "acme-webhook-01"
role = "webhook"

[[tenants.instances]]
id = "acme-webhook-02"
role = "webhook"

[tenants.templates.order_paid]
kind = "variations"
base = "Hi {{name}}, your order {{order_id}} is confirmed."
variants = [
    "Hello {{name}}! Order {{order_id}} is paid and confirmed.",
    "{{name}}, payment received for order {{order_id}}. Thank you!",
]

[tenants.templates.order_expired]
kind = "static"
text = "Hi {{name}}, order {{order_id}} expired. Reply if you still want it."
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn test_example_toml_parses_and_validates() {
        let config: AppConfig = toml::from_str(&AppConfig::example_toml()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.tenants.len(), 1);
        let tenant = &config.tenants[0];
        assert_eq!(tenant.instances[1].role, InstanceRole::Webhook);
        assert!(matches!(
            tenant.templates.get("order_paid"),
            Some(TemplateSpec::Variations { variants, .. }) if variants.len() == 2
        ));
        assert_eq!(config.maturation.strategies[0].duration_days, 7);
    }

    #[test]
    fn test_watermark_gap_enforced() {
        let mut config = AppConfig::default();
        config.registry.high_watermark = 0.55;
        config.registry.low_watermark = 0.45;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_long_pause_bounds_checked() {
        let mut config = AppConfig::default();
        if let Some(p) = config.antiban.profiles.get_mut("standard") {
            p.long_pause_min_ms = 20 * 60 * 1000;
        }
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));

        let mut config = AppConfig::default();
        if let Some(p) = config.antiban.profiles.get_mut("standard") {
            p.long_pause_probability = 1.5;
        }
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_unknown_tenant_profile_rejected() {
        let mut config = AppConfig::default();
        config.tenants.push(TenantConfig {
            id: "acme".into(),
            antiban_profile: Some("reckless".into()),
            variation_probability: 0.7,
            instances: vec![],
            templates: BTreeMap::new(),
        });
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("reckless"));
    }

    #[test]
    fn test_duplicate_instance_rejected() {
        let mut config = AppConfig::default();
        for tenant_id in ["a", "b"] {
            config.tenants.push(TenantConfig {
                id: tenant_id.into(),
                antiban_profile: None,
                variation_probability: 0.7,
                instances: vec![InstanceConfig { id: "shared-01".into(), role: InstanceRole::Broadcast }],
                templates: BTreeMap::new(),
            });
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_decreasing_strategy_quotas_rejected() {
        let mut config = AppConfig::default();
        config.maturation.strategies.push(StrategyConfig {
            key: "odd".into(),
            name: "Odd".into(),
            duration_days: 10,
            quotas: vec![10, 30, 20, 40, 50],
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_template_rejected() {
        let mut config = AppConfig::default();
        let mut templates = BTreeMap::new();
        templates.insert("order_paid".to_string(), TemplateSpec::Static { text: "  ".into() });
        config.tenants.push(TenantConfig {
            id: "acme".into(),
            antiban_profile: None,
            variation_probability: 0.7,
            instances: vec![],
            templates,
        });
        assert!(config.validate().is_err());
    }
}
