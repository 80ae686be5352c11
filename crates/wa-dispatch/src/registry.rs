//! Device Pool Registry - per-tenant instance health and selection
//!
//! Each instance carries a health score in [0, 1] maintained as an exponential
//! moving average of its observations (health probes and send outcomes):
//!
//! ```text
//! score' = score * decay + outcome * (1 - decay)
//! ```
//!
//! Health flips with hysteresis: `Healthy` once the score reaches the high
//! watermark, `Unhealthy` once it drops to the low watermark, unchanged in
//! between. An instance that has never been observed is `Unknown` and its first
//! observation seeds the score directly.
//!
//! Selection prefers the highest-scored healthy instance that is neither cooling
//! down nor over its hourly/daily limits, breaking ties by least-recently-used.
//! When nothing qualifies the least-unhealthy instance is returned flagged as
//! degraded, and the caller decides whether to use it.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use wa_common::{
    GatewayOutcome, HealthCheckResult, InstanceCounters, InstanceHealth, InstanceRole, InstanceStatus,
};
use wa_config::RegistryConfig;

use crate::dispatch_metrics;
use crate::{DispatchError, Result};

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Score given to an instance before its first observation
const UNOBSERVED_SCORE: f64 = 0.5;

/// Daily ceiling for a young instance, by age in whole days.
pub fn warmup_ceiling(age_days: u32) -> u32 {
    match age_days {
        0..=1 => 10,
        2 => 30,
        3 => 50,
        4..=7 => 70,
        _ => 100,
    }
}

/// Registry tuning, derived from [`RegistryConfig`]
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub score_decay: f64,
    pub high_watermark: f64,
    pub low_watermark: f64,
    pub default_daily_limit: u32,
    pub rate_limit_cooldown: Duration,
    pub ban_cooldown: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::from(&RegistryConfig::default())
    }
}

impl From<&RegistryConfig> for RegistrySettings {
    fn from(config: &RegistryConfig) -> Self {
        Self {
            score_decay: config.score_decay,
            high_watermark: config.high_watermark,
            low_watermark: config.low_watermark,
            default_daily_limit: config.default_daily_limit,
            rate_limit_cooldown: Duration::from_secs(config.rate_limit_cooldown_secs),
            ban_cooldown: Duration::from_secs(config.ban_cooldown_secs),
        }
    }
}

/// Sending limits a tenant's anti-ban profile imposes on its instances
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantLimits {
    pub hourly_limit: Option<u32>,
    pub daily_limit: u32,
    pub respect_warmup: bool,
}

/// Daily counter of one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyUsage {
    pub sent: u32,
    pub limit: u32,
    pub resets_in: Duration,
}

impl DailyUsage {
    pub fn exhausted(&self) -> bool {
        self.sent >= self.limit
    }
}

/// Result of a selection
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub instance_id: String,
    /// No compliant instance existed; this is the least-bad fallback
    pub degraded: bool,
    pub health: InstanceHealth,
    pub cooling: bool,
    pub over_limit: bool,
}

/// Fixed window counter that restarts once its span has elapsed
#[derive(Debug, Clone)]
struct Window {
    started: Instant,
    count: u32,
    span: Duration,
}

impl Window {
    fn new(span: Duration, now: Instant) -> Self {
        Self { started: now, count: 0, span }
    }

    fn roll(&mut self, now: Instant) {
        if now.duration_since(self.started) >= self.span {
            self.started = now;
            self.count = 0;
        }
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.span.saturating_sub(now.duration_since(self.started))
    }

    fn current(&self, now: Instant) -> u32 {
        if now.duration_since(self.started) >= self.span {
            0
        } else {
            self.count
        }
    }
}

struct InstanceEntry {
    instance_id: String,
    tenant_id: String,
    role: InstanceRole,
    health: InstanceHealth,
    score: f64,
    observed: bool,
    counters: InstanceCounters,
    hour: Window,
    day: Window,
    cooldown_until: Option<Instant>,
    last_used_at: Option<Instant>,
    last_checked_at: Option<DateTime<Utc>>,
    registered_at: DateTime<Utc>,
    registered_instant: Instant,
    /// Days of warm-up already completed elsewhere (e.g. a matured chip)
    prior_age_days: u32,
}

impl InstanceEntry {
    fn age_days(&self, now: Instant) -> u32 {
        let elapsed = now.duration_since(self.registered_instant).as_secs() / DAY.as_secs();
        self.prior_age_days.saturating_add(elapsed as u32)
    }

    fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        self.cooldown_until
            .filter(|until| *until > now)
            .map(|until| until.duration_since(now))
    }

    fn effective_daily_limit(&self, limits: &TenantLimits, now: Instant) -> u32 {
        if limits.respect_warmup {
            limits.daily_limit.min(warmup_ceiling(self.age_days(now)))
        } else {
            limits.daily_limit
        }
    }

    fn over_limit(&self, limits: &TenantLimits, now: Instant) -> bool {
        let hourly_exhausted = limits
            .hourly_limit
            .map(|h| self.hour.current(now) >= h)
            .unwrap_or(false);
        hourly_exhausted || self.day.current(now) >= self.effective_daily_limit(limits, now)
    }

    fn compliant(&self, limits: &TenantLimits, now: Instant) -> bool {
        self.health == InstanceHealth::Healthy && self.cooldown_remaining(now).is_none() && !self.over_limit(limits, now)
    }

    /// Apply one observation to the score and re-derive health.
    fn observe(&mut self, value: f64, settings: &RegistrySettings) -> Option<(InstanceHealth, InstanceHealth)> {
        let value = value.clamp(0.0, 1.0);
        self.score = if self.observed {
            self.score * settings.score_decay + value * (1.0 - settings.score_decay)
        } else {
            value
        };
        self.score = self.score.clamp(0.0, 1.0);
        self.observed = true;

        let previous = self.health;
        let next = if self.score >= settings.high_watermark {
            InstanceHealth::Healthy
        } else if self.score <= settings.low_watermark {
            InstanceHealth::Unhealthy
        } else {
            previous
        };
        self.health = next;
        (previous != next).then_some((previous, next))
    }
}

fn health_rank(health: InstanceHealth) -> u8 {
    match health {
        InstanceHealth::Healthy => 2,
        InstanceHealth::Unknown => 1,
        InstanceHealth::Unhealthy => 0,
    }
}

/// Least-recently-used first; never-used beats any use.
fn lru_order(a: Option<Instant>, b: Option<Instant>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.cmp(&y),
    }
}

#[derive(Default)]
struct PoolState {
    instances: HashMap<String, InstanceEntry>,
    tenant_limits: HashMap<String, TenantLimits>,
}

impl PoolState {
    fn limits_for(&self, tenant_id: &str, settings: &RegistrySettings) -> TenantLimits {
        self.tenant_limits.get(tenant_id).copied().unwrap_or(TenantLimits {
            hourly_limit: None,
            daily_limit: settings.default_daily_limit,
            respect_warmup: false,
        })
    }
}

/// Instances available to each tenant, with their health and counters.
///
/// This is the only mutable state shared between concurrent dispatches.
pub struct DevicePoolRegistry {
    settings: RegistrySettings,
    state: RwLock<PoolState>,
}

impl DevicePoolRegistry {
    pub fn new(settings: RegistrySettings) -> Self {
        info!(
            decay = settings.score_decay,
            high = settings.high_watermark,
            low = settings.low_watermark,
            "Device pool registry created"
        );
        Self {
            settings,
            state: RwLock::new(PoolState::default()),
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Register an instance. Re-registering an existing id is a no-op.
    pub fn register_instance(&self, tenant_id: &str, instance_id: &str, role: InstanceRole) -> bool {
        self.register_instance_aged(tenant_id, instance_id, role, 0)
    }

    /// Register an instance that has already spent `prior_age_days` warming up.
    pub fn register_instance_aged(
        &self,
        tenant_id: &str,
        instance_id: &str,
        role: InstanceRole,
        prior_age_days: u32,
    ) -> bool {
        let mut state = self.state.write();
        if state.instances.contains_key(instance_id) {
            debug!(instance_id = %instance_id, "Instance already registered");
            return false;
        }

        let now = Instant::now();
        state.instances.insert(
            instance_id.to_string(),
            InstanceEntry {
                instance_id: instance_id.to_string(),
                tenant_id: tenant_id.to_string(),
                role,
                health: InstanceHealth::Unknown,
                score: UNOBSERVED_SCORE,
                observed: false,
                counters: InstanceCounters::default(),
                hour: Window::new(HOUR, now),
                day: Window::new(DAY, now),
                cooldown_until: None,
                last_used_at: None,
                last_checked_at: None,
                registered_at: Utc::now(),
                registered_instant: now,
                prior_age_days,
            },
        );

        info!(
            tenant_id = %tenant_id,
            instance_id = %instance_id,
            role = %role,
            prior_age_days,
            "Instance registered"
        );
        true
    }

    /// Drop an instance and its counters.
    pub fn remove_instance(&self, instance_id: &str) -> Result<()> {
        match self.state.write().instances.remove(instance_id) {
            Some(entry) => {
                info!(tenant_id = %entry.tenant_id, instance_id = %instance_id, "Instance removed");
                Ok(())
            }
            None => Err(DispatchError::InstanceNotFound(instance_id.to_string())),
        }
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.state.read().instances.contains_key(instance_id)
    }

    pub fn len(&self) -> usize {
        self.state.read().instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All registered instance ids, for the health monitor.
    pub fn instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.read().instances.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Install the limits a tenant's profile imposes on its instances.
    pub fn set_tenant_limits(&self, tenant_id: &str, limits: TenantLimits) {
        self.state.write().tenant_limits.insert(tenant_id.to_string(), limits);
        debug!(tenant_id = %tenant_id, ?limits, "Tenant limits updated");
    }

    /// Daily limit currently in force for an instance, after any warm-up cap.
    pub fn effective_daily_limit(&self, instance_id: &str) -> Result<u32> {
        let state = self.state.read();
        let entry = state
            .instances
            .get(instance_id)
            .ok_or_else(|| DispatchError::InstanceNotFound(instance_id.to_string()))?;
        let limits = state.limits_for(&entry.tenant_id, &self.settings);
        Ok(entry.effective_daily_limit(&limits, Instant::now()))
    }

    /// Sends recorded in the current day window against the effective limit.
    pub fn daily_usage(&self, instance_id: &str) -> Result<DailyUsage> {
        let now = Instant::now();
        let state = self.state.read();
        let entry = state
            .instances
            .get(instance_id)
            .ok_or_else(|| DispatchError::InstanceNotFound(instance_id.to_string()))?;
        let limits = state.limits_for(&entry.tenant_id, &self.settings);
        Ok(DailyUsage {
            sent: entry.day.current(now),
            limit: entry.effective_daily_limit(&limits, now),
            resets_in: entry.day.remaining(now),
        })
    }

    /// Feed a connection probe into the health score.
    pub fn record_health_check(&self, instance_id: &str, result: HealthCheckResult) -> Result<InstanceHealth> {
        let mut state = self.state.write();
        let entry = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| DispatchError::InstanceNotFound(instance_id.to_string()))?;

        let transition = entry.observe(result.outcome_value(), &self.settings);
        entry.last_checked_at = Some(Utc::now());

        if result == HealthCheckResult::Banned {
            entry.health = InstanceHealth::Unhealthy;
            entry.cooldown_until = Some(Instant::now() + self.settings.ban_cooldown);
            warn!(instance_id = %instance_id, "Instance reported banned by gateway");
        }

        if let Some((from, to)) = transition {
            info!(instance_id = %instance_id, %from, %to, score = entry.score, "Instance health changed");
        }
        dispatch_metrics::set_instance_score(instance_id, entry.score);
        Ok(entry.health)
    }

    /// Feed the outcome of a real send back into counters, score and cooldown.
    pub fn record_send_outcome(&self, instance_id: &str, outcome: &GatewayOutcome) -> Result<InstanceHealth> {
        let now = Instant::now();
        let mut state = self.state.write();
        let entry = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| DispatchError::InstanceNotFound(instance_id.to_string()))?;

        entry.hour.roll(now);
        entry.day.roll(now);
        entry.last_used_at = Some(now);

        match outcome {
            GatewayOutcome::Delivered { .. } => {
                entry.counters.sent_total += 1;
                entry.counters.consecutive_failures = 0;
                entry.hour.count += 1;
                entry.day.count += 1;
            }
            GatewayOutcome::RateLimited { retry_after } => {
                entry.counters.rate_limited_total += 1;
                let cooldown = retry_after.unwrap_or(self.settings.rate_limit_cooldown);
                entry.cooldown_until = Some(now + cooldown);
                warn!(
                    instance_id = %instance_id,
                    cooldown_secs = cooldown.as_secs(),
                    "Instance rate limited by gateway, cooling down"
                );
            }
            GatewayOutcome::Banned { reason } => {
                entry.counters.failed_total += 1;
                entry.counters.consecutive_failures += 1;
                entry.cooldown_until = Some(now + self.settings.ban_cooldown);
                warn!(instance_id = %instance_id, reason = %reason, "Instance banned, cooling down");
            }
            GatewayOutcome::TransportError { .. } => {
                entry.counters.failed_total += 1;
                entry.counters.consecutive_failures += 1;
            }
        }

        let transition = entry.observe(outcome.outcome_value(), &self.settings);
        if matches!(outcome, GatewayOutcome::Banned { .. }) {
            entry.health = InstanceHealth::Unhealthy;
        }

        if let Some((from, to)) = transition {
            info!(instance_id = %instance_id, %from, %to, score = entry.score, "Instance health changed");
        }
        dispatch_metrics::set_instance_score(instance_id, entry.score);
        Ok(entry.health)
    }

    /// Pick an instance for a tenant and role.
    ///
    /// The chosen instance is marked as used so concurrent selections rotate
    /// through equally-scored instances.
    pub fn select_instance(&self, tenant_id: &str, role: InstanceRole) -> Result<Selection> {
        let now = Instant::now();
        let mut state = self.state.write();
        let limits = state.limits_for(tenant_id, &self.settings);

        let mut candidates: Vec<&mut InstanceEntry> = state
            .instances
            .values_mut()
            .filter(|e| e.tenant_id == tenant_id && e.role == role)
            .collect();

        if candidates.is_empty() {
            return Err(DispatchError::NoInstanceAvailable {
                tenant_id: tenant_id.to_string(),
                role,
            });
        }

        let compliant = |e: &InstanceEntry| e.compliant(&limits, now);

        let has_compliant = candidates.iter().any(|e| compliant(e));
        if has_compliant {
            candidates.retain(|e| compliant(e));
            candidates.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| lru_order(a.last_used_at, b.last_used_at))
                    .then_with(|| a.instance_id.cmp(&b.instance_id))
            });
        } else {
            candidates.sort_by(|a, b| {
                health_rank(b.health)
                    .cmp(&health_rank(a.health))
                    .then_with(|| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal))
                    .then_with(|| lru_order(a.last_used_at, b.last_used_at))
                    .then_with(|| a.instance_id.cmp(&b.instance_id))
            });
        }

        let chosen = &mut candidates[0];
        chosen.last_used_at = Some(now);
        let selection = Selection {
            instance_id: chosen.instance_id.clone(),
            degraded: !has_compliant,
            health: chosen.health,
            cooling: chosen.cooldown_remaining(now).is_some(),
            over_limit: chosen.over_limit(&limits, now),
        };

        if selection.degraded {
            dispatch_metrics::record_degraded_selection(tenant_id);
            warn!(
                tenant_id = %tenant_id,
                role = %role,
                instance_id = %selection.instance_id,
                health = %selection.health,
                cooling = selection.cooling,
                over_limit = selection.over_limit,
                "No compliant instance, degraded selection"
            );
        } else {
            debug!(tenant_id = %tenant_id, instance_id = %selection.instance_id, "Instance selected");
        }

        Ok(selection)
    }

    /// Whether an earlier selection may still be used.
    ///
    /// A compliant pick must still be compliant. A degraded pick stays usable
    /// only while the pool has no compliant instance and it is not unhealthy.
    pub fn confirm_selection(&self, tenant_id: &str, role: InstanceRole, selection: &Selection) -> bool {
        let now = Instant::now();
        let state = self.state.read();
        let Some(entry) = state.instances.get(&selection.instance_id) else {
            return false;
        };
        let limits = state.limits_for(tenant_id, &self.settings);
        if entry.compliant(&limits, now) {
            return true;
        }
        if !selection.degraded || entry.health == InstanceHealth::Unhealthy {
            return false;
        }
        !state
            .instances
            .values()
            .any(|e| e.tenant_id == tenant_id && e.role == role && e.compliant(&limits, now))
    }

    /// Snapshot of one instance.
    pub fn instance_status(&self, instance_id: &str) -> Option<InstanceStatus> {
        let state = self.state.read();
        let entry = state.instances.get(instance_id)?;
        let limits = state.limits_for(&entry.tenant_id, &self.settings);
        Some(Self::snapshot(entry, &limits, Instant::now()))
    }

    /// Snapshot of a tenant's pool, sorted by instance id.
    pub fn pool_status(&self, tenant_id: &str) -> Vec<InstanceStatus> {
        let now = Instant::now();
        let state = self.state.read();
        let limits = state.limits_for(tenant_id, &self.settings);
        let mut statuses: Vec<InstanceStatus> = state
            .instances
            .values()
            .filter(|e| e.tenant_id == tenant_id)
            .map(|e| Self::snapshot(e, &limits, now))
            .collect();
        statuses.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        statuses
    }

    fn snapshot(entry: &InstanceEntry, limits: &TenantLimits, now: Instant) -> InstanceStatus {
        let mut counters = entry.counters.clone();
        counters.sent_this_hour = entry.hour.current(now);
        counters.sent_today = entry.day.current(now);

        InstanceStatus {
            instance_id: entry.instance_id.clone(),
            tenant_id: entry.tenant_id.clone(),
            role: entry.role,
            health: entry.health,
            score: entry.score,
            counters,
            daily_limit: entry.effective_daily_limit(limits, now),
            cooldown_remaining_ms: entry.cooldown_remaining(now).map(|d| d.as_millis() as u64),
            last_checked_at: entry.last_checked_at,
            registered_at: entry.registered_at,
        }
    }
}

impl Default for DevicePoolRegistry {
    fn default() -> Self {
        Self::new(RegistrySettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport_error() -> GatewayOutcome {
        GatewayOutcome::TransportError { reason: "connection reset".into() }
    }

    #[test]
    fn test_warmup_ceiling_table() {
        assert_eq!(warmup_ceiling(0), 10);
        assert_eq!(warmup_ceiling(1), 10);
        assert_eq!(warmup_ceiling(2), 30);
        assert_eq!(warmup_ceiling(3), 50);
        assert_eq!(warmup_ceiling(7), 70);
        assert_eq!(warmup_ceiling(8), 100);
    }

    #[tokio::test]
    async fn test_first_observation_seeds_score() {
        let registry = DevicePoolRegistry::default();
        registry.register_instance("acme", "i-1", InstanceRole::Webhook);

        let health = registry.record_health_check("i-1", HealthCheckResult::Connected).unwrap();
        assert_eq!(health, InstanceHealth::Healthy);
        assert_eq!(registry.instance_status("i-1").unwrap().score, 1.0);
    }

    #[tokio::test]
    async fn test_score_stays_bounded() {
        let registry = DevicePoolRegistry::default();
        registry.register_instance("acme", "i-1", InstanceRole::Webhook);

        let outcomes = [
            GatewayOutcome::Delivered { message_id: None },
            transport_error(),
            GatewayOutcome::RateLimited { retry_after: None },
            GatewayOutcome::Banned { reason: "blocked".into() },
        ];
        for i in 0..200 {
            registry.record_send_outcome("i-1", &outcomes[i % outcomes.len()]).unwrap();
            let score = registry.instance_status("i-1").unwrap().score;
            assert!((0.0..=1.0).contains(&score), "score {} out of range", score);
        }
    }

    #[tokio::test]
    async fn test_hysteresis_holds_between_watermarks() {
        let registry = DevicePoolRegistry::default();
        registry.register_instance("acme", "i-1", InstanceRole::Webhook);
        registry.record_health_check("i-1", HealthCheckResult::Connected).unwrap();

        // 1.0 -> 0.8 -> 0.64 -> 0.512 -> 0.4096: still above the low watermark
        for _ in 0..4 {
            assert_eq!(registry.record_send_outcome("i-1", &transport_error()).unwrap(), InstanceHealth::Healthy);
        }
        // 0.32768 crosses the low watermark
        assert_eq!(registry.record_send_outcome("i-1", &transport_error()).unwrap(), InstanceHealth::Unhealthy);

        // Climbing back above 0.4 is not enough, it must reach 0.7
        registry.record_health_check("i-1", HealthCheckResult::Connected).unwrap();
        assert_eq!(registry.instance_status("i-1").unwrap().health, InstanceHealth::Unhealthy);
    }

    #[tokio::test]
    async fn test_ban_forces_unhealthy_and_cooldown() {
        let registry = DevicePoolRegistry::default();
        registry.register_instance("acme", "i-1", InstanceRole::Webhook);
        registry.record_health_check("i-1", HealthCheckResult::Connected).unwrap();

        let health = registry
            .record_send_outcome("i-1", &GatewayOutcome::Banned { reason: "blocked".into() })
            .unwrap();
        assert_eq!(health, InstanceHealth::Unhealthy);
        assert!(registry.instance_status("i-1").unwrap().cooldown_remaining_ms.is_some());
    }

    #[tokio::test]
    async fn test_remove_unknown_instance() {
        let registry = DevicePoolRegistry::default();
        assert!(matches!(
            registry.remove_instance("ghost"),
            Err(DispatchError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let registry = DevicePoolRegistry::default();
        assert!(registry.register_instance("acme", "i-1", InstanceRole::Webhook));
        assert!(!registry.register_instance("acme", "i-1", InstanceRole::Broadcast));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.instance_status("i-1").unwrap().role, InstanceRole::Webhook);
    }

    #[tokio::test]
    async fn test_warmup_caps_daily_limit() {
        let registry = DevicePoolRegistry::default();
        registry.register_instance("acme", "young", InstanceRole::Webhook);
        registry.register_instance_aged("acme", "matured", InstanceRole::Webhook, 30);
        registry.set_tenant_limits(
            "acme",
            TenantLimits { hourly_limit: Some(100), daily_limit: 1000, respect_warmup: true },
        );

        assert_eq!(registry.effective_daily_limit("young").unwrap(), 10);
        assert_eq!(registry.effective_daily_limit("matured").unwrap(), 100);
    }
}
