use std::time::Duration;

use wa_config::AntibanProfileConfig;

use crate::registry::TenantLimits;

/// Pacing rules governing every dispatch of a tenant.
///
/// Profiles are immutable once built. A config change produces a new profile
/// that replaces the old one wholesale, so a dispatch in flight always sees a
/// single consistent set of rules.
#[derive(Debug, Clone, PartialEq)]
pub struct AntibanProfile {
    pub strategy_name: String,
    pub delay_min: Duration,
    pub delay_max: Duration,
    pub hourly_limit: u32,
    pub daily_limit: u32,
    pub batch_size: u32,
    pub pause_between_batches: Duration,
    pub respect_warmup: bool,
    pub typing_delay: Duration,
    /// Chance of an extra long pause after a send
    pub long_pause_probability: f64,
    pub long_pause_min: Duration,
    pub long_pause_max: Duration,
}

impl AntibanProfile {
    pub fn from_config(name: &str, config: &AntibanProfileConfig) -> Self {
        Self {
            strategy_name: name.to_string(),
            delay_min: Duration::from_millis(config.delay_min_ms),
            delay_max: Duration::from_millis(config.delay_max_ms.max(config.delay_min_ms)),
            hourly_limit: config.hourly_limit.max(1),
            daily_limit: config.daily_limit.max(1),
            batch_size: config.batch_size.max(1),
            pause_between_batches: Duration::from_millis(config.pause_between_batches_ms),
            respect_warmup: config.respect_warmup,
            typing_delay: Duration::from_millis(config.typing_ms),
            long_pause_probability: config.long_pause_probability.clamp(0.0, 1.0),
            long_pause_min: Duration::from_millis(config.long_pause_min_ms),
            long_pause_max: Duration::from_millis(config.long_pause_max_ms.max(config.long_pause_min_ms)),
        }
    }

    /// Limits the registry should enforce during selection.
    pub fn tenant_limits(&self) -> TenantLimits {
        TenantLimits {
            hourly_limit: Some(self.hourly_limit),
            daily_limit: self.daily_limit,
            respect_warmup: self.respect_warmup,
        }
    }
}

impl Default for AntibanProfile {
    fn default() -> Self {
        Self::from_config("standard", &AntibanProfileConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_converts_units() {
        let profile = AntibanProfile::default();
        assert_eq!(profile.delay_min, Duration::from_secs(15));
        assert_eq!(profile.delay_max, Duration::from_secs(45));
        assert_eq!(profile.pause_between_batches, Duration::from_secs(300));
        assert_eq!(profile.batch_size, 10);
        assert_eq!(profile.long_pause_min, Duration::from_secs(300));
        assert_eq!(profile.long_pause_max, Duration::from_secs(900));
    }

    #[test]
    fn test_zero_batch_size_is_clamped() {
        let config = AntibanProfileConfig { batch_size: 0, ..Default::default() };
        assert_eq!(AntibanProfile::from_config("x", &config).batch_size, 1);
    }
}
