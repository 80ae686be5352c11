//! AntibanScheduler - paced, human-looking dispatch over a tenant's device pool
//!
//! A dispatch goes through:
//! 1. Profile and content resolution for the tenant
//! 2. Instance acquisition: registry selection (bounded wait) and the
//!    instance's FIFO pacing lock, held until the send is fully recorded
//! 3. `before_send`: hourly/daily quota, delay gate and batch pause, then
//!    best-effort presence and typing simulation
//! 4. The real gateway send, under a fixed timeout
//! 5. `after_send`: registry outcome and batch pacing
//!
//! Transport failures are reported, never retried here.

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

use chrono::Utc;
use wa_common::{
    GatewayOutcome, InstanceHealth, InstanceRole, InstanceStatus, PresenceState, SendOutcome, SendRequest,
    SendStatus, StepResult,
};
use wa_config::AppConfig;

use crate::content::ContentStore;
use crate::dispatch_metrics;
use crate::gateway::Gateway;
use crate::pacing::{sample_delay, sample_long_pause, InstancePacer, PacingState};
use crate::profile::AntibanProfile;
use crate::registry::{DevicePoolRegistry, Selection, TenantLimits};
use crate::{DispatchError, Result};

/// Scheduler timing
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// How long a dispatch may wait for a usable instance
    pub selection_wait: Duration,
    /// Re-selection interval while waiting
    pub selection_poll: Duration,
    /// Timeout applied to the real gateway send
    pub send_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for SchedulerSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            selection_wait: Duration::from_millis(config.dispatch.selection_wait_ms),
            selection_poll: Duration::from_millis(config.dispatch.selection_poll_ms.max(1)),
            send_timeout: Duration::from_millis(config.gateway.timeout_ms),
        }
    }
}

/// Exclusive right to send on one instance.
///
/// Holding a lease holds the instance's pacing lock; dropping it lets the next
/// queued dispatch for that instance proceed.
pub struct InstanceLease {
    pub tenant_id: String,
    pub instance_id: String,
    pub degraded: bool,
    profile: Arc<AntibanProfile>,
    pacer: OwnedMutexGuard<InstancePacer>,
}

impl InstanceLease {
    pub fn profile(&self) -> &AntibanProfile {
        &self.profile
    }

    pub fn pacing_state(&self) -> PacingState {
        self.pacer.state()
    }
}

/// Dispatch scheduler enforcing anti-ban pacing per instance
pub struct AntibanScheduler {
    registry: Arc<DevicePoolRegistry>,
    gateway: Arc<dyn Gateway>,
    content: Arc<dyn ContentStore>,
    settings: SchedulerSettings,
    pacers: DashMap<String, Arc<AsyncMutex<InstancePacer>>>,
    applied_limits: DashMap<String, TenantLimits>,
    rng: Mutex<StdRng>,
}

impl AntibanScheduler {
    pub fn new(
        registry: Arc<DevicePoolRegistry>,
        gateway: Arc<dyn Gateway>,
        content: Arc<dyn ContentStore>,
        settings: SchedulerSettings,
    ) -> Self {
        Self::with_rng(registry, gateway, content, settings, StdRng::from_os_rng())
    }

    /// Same as [`AntibanScheduler::new`] with deterministic delays.
    pub fn with_seed(
        registry: Arc<DevicePoolRegistry>,
        gateway: Arc<dyn Gateway>,
        content: Arc<dyn ContentStore>,
        settings: SchedulerSettings,
        seed: u64,
    ) -> Self {
        Self::with_rng(registry, gateway, content, settings, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        registry: Arc<DevicePoolRegistry>,
        gateway: Arc<dyn Gateway>,
        content: Arc<dyn ContentStore>,
        settings: SchedulerSettings,
        rng: StdRng,
    ) -> Self {
        info!(
            selection_wait_ms = settings.selection_wait.as_millis() as u64,
            send_timeout_ms = settings.send_timeout.as_millis() as u64,
            "Anti-ban scheduler created"
        );
        Self {
            registry,
            gateway,
            content,
            settings,
            pacers: DashMap::new(),
            applied_limits: DashMap::new(),
            rng: Mutex::new(rng),
        }
    }

    pub fn registry(&self) -> &Arc<DevicePoolRegistry> {
        &self.registry
    }

    /// Snapshot of a tenant's pool
    pub fn pool_status(&self, tenant_id: &str) -> Vec<InstanceStatus> {
        self.registry.pool_status(tenant_id)
    }

    /// Pacing state of an instance, if it has ever been dispatched on.
    ///
    /// Returns `Sending` while a dispatch holds the instance.
    pub fn pacing_state(&self, instance_id: &str) -> Option<PacingState> {
        let pacer = self.pacers.get(instance_id)?.value().clone();
        let state = match pacer.try_lock() {
            Ok(guard) => guard.state(),
            Err(_) => PacingState::Sending,
        };
        Some(state)
    }

    /// Send one templated message for a tenant.
    pub async fn dispatch(&self, request: SendRequest) -> Result<SendOutcome> {
        let span = tracing::info_span!(
            "dispatch",
            tenant_id = %request.tenant_id,
            role = %request.role,
            template_type = %request.template_type
        );
        self.dispatch_inner(request).instrument(span).await
    }

    async fn dispatch_inner(&self, request: SendRequest) -> Result<SendOutcome> {
        let profile = self.content.profile(&request.tenant_id).await?;
        let text = self
            .content
            .resolve(&request.tenant_id, &request.template_type, &request.payload)
            .await?;

        let mut lease = self.acquire(&request.tenant_id, request.role, profile).await?;

        if let Err(e) = self.before_send(&mut lease, &request.phone).await {
            lease.pacer.abandon();
            return Err(e);
        }

        let outcome = match tokio::time::timeout(
            self.settings.send_timeout,
            self.gateway.send(&lease.instance_id, &request.phone, &text),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => GatewayOutcome::TransportError {
                reason: format!("send timed out after {}ms", self.settings.send_timeout.as_millis()),
            },
        };

        self.after_send(&mut lease, &request.phone, &outcome)?;

        let status = match outcome {
            GatewayOutcome::Delivered { message_id } => {
                return Ok(SendOutcome {
                    tenant_id: request.tenant_id,
                    instance_id: lease.instance_id.clone(),
                    phone: request.phone,
                    status: SendStatus::Delivered,
                    message_id,
                    degraded: lease.degraded,
                    sent_at: Utc::now(),
                });
            }
            GatewayOutcome::RateLimited { retry_after } => {
                return Err(DispatchError::RateLimitExceeded {
                    instance_id: lease.instance_id.clone(),
                    retry_after,
                });
            }
            GatewayOutcome::Banned { reason } => SendStatus::Banned { reason },
            GatewayOutcome::TransportError { reason } => SendStatus::TransportFailed { reason },
        };

        Ok(SendOutcome {
            tenant_id: request.tenant_id,
            instance_id: lease.instance_id.clone(),
            phone: request.phone,
            status,
            message_id: None,
            degraded: lease.degraded,
            sent_at: Utc::now(),
        })
    }

    fn sync_tenant_limits(&self, tenant_id: &str, profile: &AntibanProfile) {
        let limits = profile.tenant_limits();
        let changed = self
            .applied_limits
            .get(tenant_id)
            .map(|applied| *applied != limits)
            .unwrap_or(true);
        if changed {
            self.registry.set_tenant_limits(tenant_id, limits);
            self.applied_limits.insert(tenant_id.to_string(), limits);
        }
    }

    fn pacer_for(&self, instance_id: &str, profile: &AntibanProfile) -> Arc<AsyncMutex<InstancePacer>> {
        self.pacers
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(InstancePacer::new(instance_id, profile))))
            .value()
            .clone()
    }

    /// Select an instance and take its pacing lock.
    ///
    /// Waits up to `selection_wait` while the only candidates are unhealthy.
    /// A selection is confirmed again once its lock is held, since sends queued
    /// ahead of it may have banned or cooled the instance.
    pub async fn acquire(
        &self,
        tenant_id: &str,
        role: InstanceRole,
        profile: Arc<AntibanProfile>,
    ) -> Result<InstanceLease> {
        self.sync_tenant_limits(tenant_id, &profile);
        let deadline = Instant::now() + self.settings.selection_wait;

        loop {
            let selection = self.select_usable(tenant_id, role, deadline).await?;

            if selection.degraded {
                warn!(
                    instance_id = %selection.instance_id,
                    health = %selection.health,
                    cooling = selection.cooling,
                    over_limit = selection.over_limit,
                    "Dispatching on a degraded instance"
                );
            }

            let pacer = self.pacer_for(&selection.instance_id, &profile).lock_owned().await;
            if self.registry.confirm_selection(tenant_id, role, &selection) {
                return Ok(InstanceLease {
                    tenant_id: tenant_id.to_string(),
                    instance_id: selection.instance_id,
                    degraded: selection.degraded,
                    profile,
                    pacer,
                });
            }

            drop(pacer);
            debug!(
                tenant_id = %tenant_id,
                instance_id = %selection.instance_id,
                "Instance changed while queued, selecting again"
            );
        }
    }

    async fn select_usable(&self, tenant_id: &str, role: InstanceRole, deadline: Instant) -> Result<Selection> {
        loop {
            let selection = match self.registry.select_instance(tenant_id, role) {
                Ok(s) => s,
                Err(e) => {
                    dispatch_metrics::record_no_instance(tenant_id, &role.to_string());
                    warn!(tenant_id = %tenant_id, role = %role, "No instance registered for role");
                    return Err(e);
                }
            };

            if !(selection.degraded && selection.health == InstanceHealth::Unhealthy) {
                return Ok(selection);
            }

            let now = Instant::now();
            if now >= deadline {
                dispatch_metrics::record_no_instance(tenant_id, &role.to_string());
                warn!(
                    tenant_id = %tenant_id,
                    role = %role,
                    waited_ms = self.settings.selection_wait.as_millis() as u64,
                    "Every instance is unhealthy, giving up"
                );
                return Err(DispatchError::NoInstanceAvailable {
                    tenant_id: tenant_id.to_string(),
                    role,
                });
            }
            tokio::time::sleep(self.settings.selection_poll.min(deadline - now)).await;
        }
    }

    /// Enforce quotas, wait out pacing, and simulate a human about to type.
    pub async fn before_send(&self, lease: &mut InstanceLease, phone: &str) -> Result<()> {
        let usage = self.registry.daily_usage(&lease.instance_id)?;
        if usage.exhausted() {
            dispatch_metrics::record_rate_limited(&lease.tenant_id, &lease.instance_id);
            warn!(
                instance_id = %lease.instance_id,
                sent = usage.sent,
                limit = usage.limit,
                "Daily limit reached"
            );
            return Err(DispatchError::RateLimitExceeded {
                instance_id: lease.instance_id.clone(),
                retry_after: Some(usage.resets_in),
            });
        }

        let profile = lease.profile.clone();
        if let Err(e) = lease.pacer.acquire_hourly_permit(&profile) {
            dispatch_metrics::record_rate_limited(&lease.tenant_id, &lease.instance_id);
            warn!(instance_id = %lease.instance_id, limit = profile.hourly_limit, "Hourly limit reached");
            return Err(e);
        }

        lease.pacer.wait_turn().await;

        self.soft_step(
            &lease.instance_id,
            "presence_composing",
            self.gateway.set_presence(&lease.instance_id, phone, PresenceState::Composing).await,
        );
        self.soft_step(
            &lease.instance_id,
            "typing",
            self.gateway.set_typing(&lease.instance_id, phone, profile.typing_delay).await,
        );
        tokio::time::sleep(profile.typing_delay).await;
        self.soft_step(
            &lease.instance_id,
            "presence_paused",
            self.gateway.set_presence(&lease.instance_id, phone, PresenceState::Paused).await,
        );

        Ok(())
    }

    fn soft_step(&self, instance_id: &str, step: &str, result: StepResult) {
        if let StepResult::SoftFail(reason) = result {
            dispatch_metrics::record_behavioral_soft_fail(instance_id, step);
            warn!(instance_id = %instance_id, step, reason = %reason, "Behavioral step failed, continuing");
        }
    }

    /// Record the gateway outcome and arm the next pacing gate.
    pub fn after_send(&self, lease: &mut InstanceLease, phone: &str, outcome: &GatewayOutcome) -> Result<()> {
        let health = self.registry.record_send_outcome(&lease.instance_id, outcome)?;

        let (mut delay, long_pause) = {
            let mut rng = self.rng.lock();
            (sample_delay(&lease.profile, &mut *rng), sample_long_pause(&lease.profile, &mut *rng))
        };
        if let Some(pause) = long_pause {
            info!(instance_id = %lease.instance_id, pause_secs = pause.as_secs(), "Taking a long pause after send");
            delay += pause;
        }
        let profile = lease.profile.clone();
        lease.pacer.complete_send(&profile, delay);

        match outcome {
            GatewayOutcome::Delivered { message_id } => {
                dispatch_metrics::record_sent(&lease.tenant_id, &lease.instance_id);
                info!(
                    instance_id = %lease.instance_id,
                    phone = %phone,
                    message_id = ?message_id,
                    next_delay_ms = delay.as_millis() as u64,
                    "Message delivered"
                );
            }
            GatewayOutcome::RateLimited { retry_after } => {
                dispatch_metrics::record_rate_limited(&lease.tenant_id, &lease.instance_id);
                warn!(instance_id = %lease.instance_id, retry_after = ?retry_after, "Gateway rate limited the send");
            }
            GatewayOutcome::Banned { reason } => {
                dispatch_metrics::record_failed(&lease.tenant_id, &lease.instance_id, "banned");
                error!(instance_id = %lease.instance_id, reason = %reason, %health, "Instance banned during send");
            }
            GatewayOutcome::TransportError { reason } => {
                dispatch_metrics::record_failed(&lease.tenant_id, &lease.instance_id, "transport");
                warn!(instance_id = %lease.instance_id, reason = %reason, %health, "Send failed");
            }
        }

        debug!(
            instance_id = %lease.instance_id,
            pacing = ?lease.pacer.state(),
            batch_position = lease.pacer.sends_in_batch(),
            "Pacing updated"
        );
        Ok(())
    }
}
