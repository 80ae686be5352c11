//! MaturationEngine - advances chips through their warm-up program
//!
//! One tick is one maturation day. Each tick:
//! 1. Probes every active chip's instance; disconnected or banned chips fail
//! 2. Advances the day, resets the daily count, recomputes phase and quota
//! 3. Runs scripted conversations between pairs of active chips, within both
//!    chips' quotas; send failures are retried within the tick only. Partners
//!    come from the chip's own owner pool first, then the operator pool, and a
//!    pair that talked within `partner_cooldown` is not paired again
//! 4. Schedules simulated group joins for chips old enough to be in groups
//! 5. Settles the day: failure streaks, failure threshold, readiness
//! 6. With `auto_promote`, hands chips that became ready to the device pool
//!
//! Per-chip problems never abort a tick. The chip set is only touched under
//! short synchronous locks; gateway calls happen with no lock held and are
//! bounded by `gateway_timeout`.

use chrono::Utc;
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::seq::{IndexedRandom, SliceRandom};
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use wa_common::{ConnectionState, GatewayOutcome};
use wa_config::{AppConfig, GatewayConfig, MaturationConfig};
use wa_dispatch::{DevicePoolRegistry, Gateway};

use crate::chip::{Chip, ChipAdmission, ChipStatus, GroupMembership};
use crate::phase::MaturationPhase;
use crate::scripts::{ScriptLibrary, ScriptLine, Speaker};
use crate::store::ChipStore;
use crate::strategy::StrategyCatalog;
use crate::{MaturationError, Result};

/// Engine tuning, derived from [`MaturationConfig`]
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub failure_threshold: u32,
    pub message_delay_min: Duration,
    pub message_delay_max: Duration,
    pub conversation_min_messages: u32,
    pub conversation_max_messages: u32,
    pub group_join_probability: f64,
    pub send_retries: u32,
    pub groups: Vec<String>,
    pub owner_capacity: usize,
    pub operator_owner: String,
    pub operator_capacity: usize,
    /// Bound on every gateway call made during a tick
    pub gateway_timeout: Duration,
    pub partner_cooldown: Duration,
    pub max_partner_candidates: usize,
    pub auto_promote: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&MaturationConfig::default())
    }
}

impl From<&MaturationConfig> for EngineSettings {
    fn from(config: &MaturationConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            message_delay_min: Duration::from_millis(config.message_delay_min_ms),
            message_delay_max: Duration::from_millis(config.message_delay_max_ms.max(config.message_delay_min_ms)),
            conversation_min_messages: config.conversation_min_messages.max(1),
            conversation_max_messages: config.conversation_max_messages.max(config.conversation_min_messages.max(1)),
            group_join_probability: config.group_join_probability.clamp(0.0, 1.0),
            send_retries: config.send_retries,
            groups: config.groups.clone(),
            owner_capacity: config.owner_capacity,
            operator_owner: config.operator_owner.clone(),
            operator_capacity: config.operator_capacity,
            gateway_timeout: Duration::from_millis(GatewayConfig::default().timeout_ms),
            partner_cooldown: Duration::from_secs(config.partner_cooldown_secs),
            max_partner_candidates: config.max_partner_candidates.max(1),
            auto_promote: config.auto_promote,
        }
    }
}

impl From<&AppConfig> for EngineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            gateway_timeout: Duration::from_millis(config.gateway.timeout_ms.max(1)),
            ..Self::from(&config.maturation)
        }
    }
}

/// What happened during one tick
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub tick: u64,
    pub advanced: usize,
    pub conversations: usize,
    pub messages_sent: u32,
    pub skipped_no_partner: usize,
    pub groups_scheduled: usize,
    pub group_interactions: usize,
    pub became_ready: Vec<String>,
    pub promoted: Vec<String>,
    pub failed: Vec<String>,
}

/// Chip counts by status and phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaturationStats {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_phase: BTreeMap<String, usize>,
    pub group_memberships: usize,
}

#[derive(Debug, Clone)]
struct Participant {
    chip_id: String,
    instance_ref: String,
    phone: String,
}

impl Participant {
    fn of(chip: &Chip) -> Self {
        Self {
            chip_id: chip.id.clone(),
            instance_ref: chip.instance_ref.clone(),
            phone: chip.phone.clone(),
        }
    }
}

#[derive(Debug)]
struct ConversationPlan {
    script: String,
    initiator: Participant,
    responder: Participant,
    lines: Vec<ScriptLine>,
}

enum SendAttempt {
    Delivered,
    Banned(String),
    Failed(String),
}

#[derive(Default)]
struct ChipSet {
    chips: BTreeMap<String, Chip>,
    memberships: Vec<GroupMembership>,
    /// Tick start of the last conversation per chip pair
    last_conversations: HashMap<(String, String), Instant>,
}

impl ChipSet {
    fn talked_recently(&self, a: &str, b: &str, now: Instant, cooldown: Duration) -> bool {
        self.last_conversations
            .get(&pair_key(a, b))
            .map(|at| now.saturating_duration_since(*at) < cooldown)
            .unwrap_or(false)
    }

    fn forget(&mut self, chip_id: &str) {
        self.memberships.retain(|m| m.chip_id != chip_id);
        self.last_conversations.retain(|(a, b), _| a != chip_id && b != chip_id);
    }
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

pub struct MaturationEngine {
    settings: EngineSettings,
    catalog: StrategyCatalog,
    scripts: ScriptLibrary,
    gateway: Arc<dyn Gateway>,
    registry: Arc<DevicePoolRegistry>,
    store: Arc<dyn ChipStore>,
    state: RwLock<ChipSet>,
    rng: Mutex<StdRng>,
    tick_lock: tokio::sync::Mutex<()>,
    ticks: AtomicU64,
}

impl MaturationEngine {
    /// Build the engine and restore previously stored chips.
    pub async fn new(
        settings: EngineSettings,
        catalog: StrategyCatalog,
        gateway: Arc<dyn Gateway>,
        registry: Arc<DevicePoolRegistry>,
        store: Arc<dyn ChipStore>,
    ) -> Result<Self> {
        let restored = store.load_all().await?;
        let chips: BTreeMap<String, Chip> = restored.into_iter().map(|c| (c.id.clone(), c)).collect();
        info!(restored = chips.len(), "Maturation engine created");

        Ok(Self {
            settings,
            catalog,
            scripts: ScriptLibrary::builtin(),
            gateway,
            registry,
            store,
            state: RwLock::new(ChipSet { chips, ..Default::default() }),
            rng: Mutex::new(StdRng::from_os_rng()),
            tick_lock: tokio::sync::Mutex::new(()),
            ticks: AtomicU64::new(0),
        })
    }

    pub fn with_scripts(mut self, scripts: ScriptLibrary) -> Self {
        self.scripts = scripts;
        self
    }

    /// Deterministic pairing, scripts and delays.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn catalog(&self) -> &StrategyCatalog {
        &self.catalog
    }

    // ========================================================================
    // Admission & Queries
    // ========================================================================

    fn capacity_for(&self, owner: &str) -> usize {
        if owner == self.settings.operator_owner {
            self.settings.operator_capacity
        } else {
            self.settings.owner_capacity
        }
    }

    fn check_admission(&self, set: &ChipSet, admission: &ChipAdmission) -> Result<()> {
        if set.chips.values().any(|c| c.instance_ref == admission.instance_ref) {
            return Err(MaturationError::DuplicateInstance(admission.instance_ref.clone()));
        }
        let capacity = self.capacity_for(&admission.owner);
        let held = set.chips.values().filter(|c| c.owner == admission.owner).count();
        if held >= capacity {
            return Err(MaturationError::PoolFull {
                owner: admission.owner.clone(),
                capacity,
            });
        }
        Ok(())
    }

    /// Start warming up a new chip at day 0 of its strategy.
    pub async fn add_chip(&self, admission: ChipAdmission) -> Result<Chip> {
        let strategy = self
            .catalog
            .get(&admission.strategy_key)
            .ok_or_else(|| MaturationError::UnknownStrategy(admission.strategy_key.clone()))?;
        if self.registry.contains(&admission.instance_ref) {
            return Err(MaturationError::DuplicateInstance(admission.instance_ref.clone()));
        }
        self.check_admission(&self.state.read(), &admission)?;

        let now = Utc::now();
        let chip = Chip {
            id: format!("chip_{}", uuid::Uuid::new_v4().simple()),
            instance_ref: admission.instance_ref,
            phone: admission.phone,
            owner: admission.owner,
            strategy_key: admission.strategy_key,
            priority: admission.priority,
            role: admission.role,
            phase: MaturationPhase::Baby,
            current_day: 0,
            start_date: now,
            target_date: now + chrono::Duration::days(strategy.duration_days as i64),
            target_day: strategy.duration_days,
            daily_quota: strategy.quota(MaturationPhase::Baby),
            sent_today: 0,
            consecutive_failures: 0,
            status: ChipStatus::Active,
            failure_reason: None,
            failed_today: false,
            last_tick_at: None,
        };

        {
            let mut state = self.state.write();
            // a concurrent admission may have claimed the instance meanwhile
            self.check_admission(&state, &chip_admission_of(&chip))?;
            state.chips.insert(chip.id.clone(), chip.clone());
        }

        if let Err(e) = self.store.save(&chip).await {
            self.state.write().chips.remove(&chip.id);
            return Err(e);
        }

        info!(
            chip_id = %chip.id,
            instance_ref = %chip.instance_ref,
            owner = %chip.owner,
            strategy = %chip.strategy_key,
            target_day = chip.target_day,
            "Chip admitted to maturation"
        );
        Ok(chip)
    }

    pub fn chip(&self, chip_id: &str) -> Option<Chip> {
        self.state.read().chips.get(chip_id).cloned()
    }

    /// Chips, optionally restricted to one owner, in id order.
    pub fn list_chips(&self, owner: Option<&str>) -> Vec<Chip> {
        self.state
            .read()
            .chips
            .values()
            .filter(|c| owner.map(|o| c.owner == o).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Chips ready for production, highest priority first.
    ///
    /// Each call takes a fresh snapshot.
    pub fn get_production_ready(&self, owner: Option<&str>) -> impl Iterator<Item = Chip> {
        let mut ready: Vec<Chip> = self
            .list_chips(owner)
            .into_iter()
            .filter(|c| c.status == ChipStatus::Ready)
            .collect();
        ready.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        ready.into_iter()
    }

    pub fn group_memberships(&self, chip_id: &str) -> Vec<GroupMembership> {
        self.state
            .read()
            .memberships
            .iter()
            .filter(|m| m.chip_id == chip_id)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> MaturationStats {
        let state = self.state.read();
        let mut stats = MaturationStats {
            total: state.chips.len(),
            group_memberships: state.memberships.len(),
            ..Default::default()
        };
        for chip in state.chips.values() {
            *stats.by_status.entry(chip.status.to_string()).or_default() += 1;
            *stats.by_phase.entry(chip.phase.to_string()).or_default() += 1;
        }
        stats
    }

    // ========================================================================
    // Manual Intervention
    // ========================================================================

    async fn transition<F>(&self, chip_id: &str, action: &'static str, allowed: &[ChipStatus], apply: F) -> Result<Chip>
    where
        F: FnOnce(&mut Chip),
    {
        let chip = {
            let mut state = self.state.write();
            let chip = state
                .chips
                .get_mut(chip_id)
                .ok_or_else(|| MaturationError::ChipNotFound(chip_id.to_string()))?;
            if !allowed.contains(&chip.status) {
                return Err(MaturationError::InvalidState {
                    chip_id: chip_id.to_string(),
                    status: chip.status,
                    action,
                });
            }
            apply(chip);
            chip.clone()
        };
        self.store.save(&chip).await?;
        info!(chip_id = %chip_id, action, status = %chip.status, "Chip updated");
        Ok(chip)
    }

    /// Stop advancing a chip until resumed.
    pub async fn pause_chip(&self, chip_id: &str) -> Result<Chip> {
        self.transition(chip_id, "pause", &[ChipStatus::Active], |c| c.status = ChipStatus::Paused)
            .await
    }

    pub async fn resume_chip(&self, chip_id: &str) -> Result<Chip> {
        self.transition(chip_id, "resume", &[ChipStatus::Paused], |c| c.status = ChipStatus::Active)
            .await
    }

    /// Put a failed chip back into the program, keeping its day and phase.
    pub async fn reactivate_chip(&self, chip_id: &str) -> Result<Chip> {
        self.transition(chip_id, "reactivate", &[ChipStatus::Failed], |c| {
            c.status = ChipStatus::Active;
            c.consecutive_failures = 0;
            c.failed_today = false;
            c.failure_reason = None;
        })
        .await
    }

    /// Drop a chip without promoting it.
    pub async fn remove_chip(&self, chip_id: &str) -> Result<Chip> {
        let chip = {
            let mut state = self.state.write();
            let chip = state
                .chips
                .remove(chip_id)
                .ok_or_else(|| MaturationError::ChipNotFound(chip_id.to_string()))?;
            state.forget(chip_id);
            chip
        };
        self.store.remove(chip_id).await?;
        info!(chip_id = %chip_id, status = %chip.status, "Chip removed");
        Ok(chip)
    }

    /// Hand a ready chip over to the device pool.
    ///
    /// The chip leaves the maturation set before its instance is registered, so
    /// it is never present in both.
    pub async fn promote(&self, chip_id: &str) -> Result<String> {
        let chip = {
            let mut state = self.state.write();
            let chip = state
                .chips
                .get(chip_id)
                .ok_or_else(|| MaturationError::ChipNotFound(chip_id.to_string()))?;
            if chip.status != ChipStatus::Ready {
                return Err(MaturationError::InvalidState {
                    chip_id: chip_id.to_string(),
                    status: chip.status,
                    action: "promote",
                });
            }
            if self.registry.contains(&chip.instance_ref) {
                return Err(MaturationError::DuplicateInstance(chip.instance_ref.clone()));
            }
            let chip = state
                .chips
                .remove(chip_id)
                .ok_or_else(|| MaturationError::ChipNotFound(chip_id.to_string()))?;
            state.forget(chip_id);
            chip
        };

        self.registry
            .register_instance_aged(&chip.owner, &chip.instance_ref, chip.role, chip.current_day);

        if let Err(e) = self.store.remove(chip_id).await {
            warn!(chip_id = %chip_id, error = %e, "Promoted chip could not be removed from store");
        }

        info!(
            chip_id = %chip_id,
            instance_ref = %chip.instance_ref,
            owner = %chip.owner,
            role = %chip.role,
            days = chip.current_day,
            "Chip promoted to production"
        );
        Ok(chip.instance_ref)
    }

    // ========================================================================
    // Tick
    // ========================================================================

    /// Run one maturation day.
    pub async fn tick(&self) -> TickReport {
        let _running = self.tick_lock.lock().await;
        let started = Instant::now();
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        let mut report = TickReport { tick, ..Default::default() };
        counter!("wa_maturation_tick_total").increment(1);

        self.check_connections(&mut report).await;
        self.advance_day(&mut report);
        self.run_interactions(started, &mut report).await;
        self.schedule_groups(&mut report);
        self.settle_day(&mut report);
        if self.settings.auto_promote {
            self.promote_ready(&mut report).await;
        }
        self.persist().await;

        let stats = self.stats();
        gauge!("wa_maturation_chips_ready").set(stats.by_status.get("ready").copied().unwrap_or(0) as f64);
        gauge!("wa_maturation_chips_failed").set(stats.by_status.get("failed").copied().unwrap_or(0) as f64);

        info!(
            tick,
            advanced = report.advanced,
            conversations = report.conversations,
            messages_sent = report.messages_sent,
            skipped_no_partner = report.skipped_no_partner,
            groups_scheduled = report.groups_scheduled,
            ready = report.became_ready.len(),
            promoted = report.promoted.len(),
            failed = report.failed.len(),
            "Maturation tick complete"
        );
        report
    }

    fn active_chips(&self) -> Vec<Chip> {
        self.state.read().chips.values().filter(|c| c.is_active()).cloned().collect()
    }

    fn fail_chip(&self, chip_id: &str, reason: &str, report: &mut TickReport) {
        let mut state = self.state.write();
        if let Some(chip) = state.chips.get_mut(chip_id) {
            if chip.status == ChipStatus::Failed {
                return;
            }
            chip.fail(reason);
            error!(chip_id = %chip_id, instance_ref = %chip.instance_ref, reason, "Chip failed");
            report.failed.push(chip_id.to_string());
        }
    }

    async fn check_connections(&self, report: &mut TickReport) {
        let timeout = self.settings.gateway_timeout;
        for chip in self.active_chips() {
            match tokio::time::timeout(timeout, self.gateway.connection_state(&chip.instance_ref)).await {
                Ok(Ok(ConnectionState::Open)) | Ok(Ok(ConnectionState::Connecting)) => {}
                Ok(Ok(ConnectionState::Close)) => self.fail_chip(&chip.id, "instance disconnected", report),
                Ok(Ok(ConnectionState::Banned)) => self.fail_chip(&chip.id, "instance banned", report),
                Ok(Err(e)) => {
                    warn!(chip_id = %chip.id, error = %e, "Connection probe failed, keeping chip active");
                }
                Err(_) => {
                    warn!(
                        chip_id = %chip.id,
                        timeout_ms = timeout.as_millis() as u64,
                        "Connection probe timed out, keeping chip active"
                    );
                }
            }
        }
    }

    fn advance_day(&self, report: &mut TickReport) {
        let now = Utc::now();
        let mut state = self.state.write();

        for chip in state.chips.values_mut().filter(|c| c.is_active()) {
            let Some(strategy) = self.catalog.get(&chip.strategy_key) else {
                chip.fail(format!("strategy {} no longer exists", chip.strategy_key));
                error!(chip_id = %chip.id, strategy = %chip.strategy_key, "Chip failed");
                report.failed.push(chip.id.clone());
                continue;
            };

            chip.current_day += 1;
            chip.sent_today = 0;
            chip.failed_today = false;
            chip.last_tick_at = Some(now);

            let phase = strategy.phase_for_day(chip.current_day).max(chip.phase);
            if phase != chip.phase {
                info!(chip_id = %chip.id, day = chip.current_day, from = %chip.phase, to = %phase, "Chip changed phase");
            }
            chip.phase = phase;
            chip.daily_quota = strategy.quota(phase);
            report.advanced += 1;
        }
    }

    fn voice_notes_allowed(&self, chip: &Chip) -> bool {
        self.catalog
            .get(&chip.strategy_key)
            .map(|s| s.allow_voice_notes)
            .unwrap_or(false)
    }

    /// Partners for `initiator`: its own owner pool first, topped up from the
    /// operator pool, at most `max_partner_candidates` in total.
    fn partner_candidates<'a, R: Rng + ?Sized>(
        &self,
        set: &'a ChipSet,
        initiator: &Chip,
        now: Instant,
        rng: &mut R,
    ) -> Vec<&'a Chip> {
        let cap = self.settings.max_partner_candidates.max(1);
        let available = |c: &Chip| {
            c.id != initiator.id
                && c.is_active()
                && !c.failed_today
                && c.quota_remaining() > 0
                && !set.talked_recently(&initiator.id, &c.id, now, self.settings.partner_cooldown)
        };

        let mut candidates: Vec<&Chip> = set
            .chips
            .values()
            .filter(|c| c.owner == initiator.owner && available(*c))
            .collect();
        candidates.shuffle(rng);
        candidates.truncate(cap);

        if candidates.len() < cap && initiator.owner != self.settings.operator_owner {
            let mut operator: Vec<&Chip> = set
                .chips
                .values()
                .filter(|c| c.owner == self.settings.operator_owner && available(*c))
                .collect();
            operator.shuffle(rng);
            operator.truncate(cap - candidates.len());
            candidates.extend(operator);
        }
        candidates
    }

    fn plan_conversation(&self, chip_id: &str, started: Instant, report: &mut TickReport) -> Option<ConversationPlan> {
        let mut state = self.state.write();
        let set = &*state;
        let initiator = set.chips.get(chip_id)?;
        if !initiator.is_active() || initiator.failed_today || initiator.quota_remaining() == 0 {
            return None;
        }

        let mut rng = self.rng.lock();
        let candidates = self.partner_candidates(set, initiator, started, &mut *rng);
        let own_pool = candidates.iter().take_while(|c| c.owner == initiator.owner).count();
        let pool = if own_pool > 0 { &candidates[..own_pool] } else { &candidates[..] };
        let Some(responder) = pool.choose(&mut *rng).copied() else {
            debug!(chip_id = %chip_id, "No partner available, skipping interaction");
            report.skipped_no_partner += 1;
            return None;
        };

        let voice_ok = self.voice_notes_allowed(initiator) && self.voice_notes_allowed(responder);
        let script = self.scripts.pick(&mut *rng, voice_ok)?;
        let length = rng.random_range(self.settings.conversation_min_messages..=self.settings.conversation_max_messages);
        let length = (length as usize).min(script.lines.len());

        let plan = ConversationPlan {
            script: script.name.clone(),
            initiator: Participant::of(initiator),
            responder: Participant::of(responder),
            lines: script.lines[..length].to_vec(),
        };
        drop(rng);
        state
            .last_conversations
            .insert(pair_key(&plan.initiator.chip_id, &plan.responder.chip_id), started);
        Some(plan)
    }

    async fn run_interactions(&self, started: Instant, report: &mut TickReport) {
        let cooldown = self.settings.partner_cooldown;
        self.state
            .write()
            .last_conversations
            .retain(|_, at| started.saturating_duration_since(*at) < cooldown);

        let mut order: Vec<(String, u8)> = self
            .active_chips()
            .into_iter()
            .map(|c| (c.id, c.priority))
            .collect();
        order.shuffle(&mut *self.rng.lock());
        order.sort_by(|a, b| b.1.cmp(&a.1));

        for (chip_id, _) in order {
            let Some(plan) = self.plan_conversation(&chip_id, started, report) else {
                continue;
            };
            report.conversations += 1;
            self.run_conversation(plan, report).await;
        }
    }

    fn has_quota(&self, chip_id: &str) -> bool {
        self.state
            .read()
            .chips
            .get(chip_id)
            .map(|c| c.is_active() && !c.failed_today && c.quota_remaining() > 0)
            .unwrap_or(false)
    }

    fn count_sent(&self, chip_id: &str) -> bool {
        let mut state = self.state.write();
        match state.chips.get_mut(chip_id) {
            Some(chip) if chip.sent_today < chip.daily_quota => {
                chip.sent_today += 1;
                true
            }
            _ => false,
        }
    }

    fn mark_failed_today(&self, chip_id: &str, reason: &str) {
        if let Some(chip) = self.state.write().chips.get_mut(chip_id) {
            chip.failed_today = true;
            warn!(chip_id = %chip_id, reason, "Maturation message failed after retries");
        }
    }

    fn message_delay(&self) -> Duration {
        let min = self.settings.message_delay_min.as_millis() as u64;
        let max = self.settings.message_delay_max.as_millis() as u64;
        if max <= min {
            return self.settings.message_delay_min;
        }
        Duration::from_millis(self.rng.lock().random_range(min..=max))
    }

    async fn run_conversation(&self, plan: ConversationPlan, report: &mut TickReport) {
        debug!(
            script = %plan.script,
            initiator = %plan.initiator.chip_id,
            responder = %plan.responder.chip_id,
            lines = plan.lines.len(),
            "Starting conversation"
        );

        for (i, line) in plan.lines.iter().enumerate() {
            let (sender, receiver) = match line.speaker {
                Speaker::Initiator => (&plan.initiator, &plan.responder),
                Speaker::Responder => (&plan.responder, &plan.initiator),
            };
            if !self.has_quota(&sender.chip_id) {
                debug!(chip_id = %sender.chip_id, "Daily quota reached, ending conversation");
                break;
            }
            if i > 0 {
                tokio::time::sleep(self.message_delay()).await;
            }

            match self.send_with_retries(sender, receiver, &line.text).await {
                SendAttempt::Delivered => {
                    if self.count_sent(&sender.chip_id) {
                        report.messages_sent += 1;
                        counter!("wa_maturation_messages_sent_total").increment(1);
                    }
                }
                SendAttempt::Banned(reason) => {
                    self.fail_chip(&sender.chip_id, &format!("banned during conversation: {}", reason), report);
                    break;
                }
                SendAttempt::Failed(reason) => {
                    self.mark_failed_today(&sender.chip_id, &reason);
                    break;
                }
            }
        }
    }

    async fn send_with_retries(&self, sender: &Participant, receiver: &Participant, text: &str) -> SendAttempt {
        let attempts = self.settings.send_retries + 1;
        let mut last_reason = String::new();

        let timeout = self.settings.gateway_timeout;

        for attempt in 1..=attempts {
            let outcome = tokio::time::timeout(timeout, self.gateway.send(&sender.instance_ref, &receiver.phone, text))
                .await
                .unwrap_or_else(|_| GatewayOutcome::TransportError {
                    reason: format!("gateway did not answer within {}ms", timeout.as_millis()),
                });
            match outcome {
                GatewayOutcome::Delivered { .. } => return SendAttempt::Delivered,
                GatewayOutcome::Banned { reason } => return SendAttempt::Banned(reason),
                GatewayOutcome::RateLimited { .. } => last_reason = "rate limited".to_string(),
                GatewayOutcome::TransportError { reason } => last_reason = reason,
            }
            debug!(chip_id = %sender.chip_id, attempt, reason = %last_reason, "Maturation send failed");
            if attempt < attempts {
                tokio::time::sleep(self.settings.message_delay_min).await;
            }
        }
        SendAttempt::Failed(last_reason)
    }

    fn schedule_groups(&self, report: &mut TickReport) {
        if self.settings.groups.is_empty() {
            return;
        }
        let now = Utc::now();
        let mut state = self.state.write();
        let ChipSet { chips, memberships, .. } = &mut *state;

        for membership in memberships.iter_mut().filter(|m| m.interaction_pending) {
            if chips.get(&membership.chip_id).map(|c| c.is_active()).unwrap_or(false) {
                membership.interaction_pending = false;
                report.group_interactions += 1;
            }
        }

        let mut rng = self.rng.lock();
        for chip in chips.values().filter(|c| c.is_active() && c.phase.allows_groups()) {
            let max_groups = self.catalog.get(&chip.strategy_key).map(|s| s.max_groups).unwrap_or(0) as usize;
            let joined: Vec<&str> = memberships
                .iter()
                .filter(|m| m.chip_id == chip.id)
                .map(|m| m.group_id.as_str())
                .collect();
            if joined.len() >= max_groups || !rng.random_bool(self.settings.group_join_probability) {
                continue;
            }

            let open: Vec<&String> = self.settings.groups.iter().filter(|g| !joined.contains(&g.as_str())).collect();
            let Some(group) = open.choose(&mut *rng) else {
                continue;
            };
            debug!(chip_id = %chip.id, group = %group, "Group join scheduled");
            let membership = GroupMembership {
                chip_id: chip.id.clone(),
                group_id: (*group).clone(),
                join_scheduled_at: now,
                interaction_pending: true,
            };
            memberships.push(membership);
            report.groups_scheduled += 1;
        }
    }

    fn settle_day(&self, report: &mut TickReport) {
        let threshold = self.settings.failure_threshold;
        let mut state = self.state.write();

        for chip in state.chips.values_mut().filter(|c| c.is_active()) {
            if chip.failed_today {
                chip.consecutive_failures += 1;
            } else {
                chip.consecutive_failures = 0;
            }
            chip.failed_today = false;

            if chip.consecutive_failures >= threshold {
                let reason = format!("{} consecutive failed days", chip.consecutive_failures);
                error!(chip_id = %chip.id, reason = %reason, "Chip failed");
                chip.fail(reason);
                report.failed.push(chip.id.clone());
            } else if chip.current_day >= chip.target_day && !chip.has_outstanding_failures() {
                chip.status = ChipStatus::Ready;
                info!(chip_id = %chip.id, day = chip.current_day, owner = %chip.owner, "Chip ready for production");
                report.became_ready.push(chip.id.clone());
            }
        }
    }

    async fn promote_ready(&self, report: &mut TickReport) {
        for chip_id in report.became_ready.clone() {
            match self.promote(&chip_id).await {
                Ok(_) => report.promoted.push(chip_id),
                Err(e) => warn!(chip_id = %chip_id, error = %e, "Automatic promotion failed, chip stays ready"),
            }
        }
    }

    async fn persist(&self) {
        let chips: Vec<Chip> = self.state.read().chips.values().cloned().collect();
        for chip in &chips {
            if let Err(e) = self.store.save(chip).await {
                warn!(chip_id = %chip.id, error = %e, "Failed to persist chip");
            }
        }
    }
}

fn chip_admission_of(chip: &Chip) -> ChipAdmission {
    ChipAdmission {
        instance_ref: chip.instance_ref.clone(),
        phone: chip.phone.clone(),
        owner: chip.owner.clone(),
        strategy_key: chip.strategy_key.clone(),
        priority: chip.priority,
        role: chip.role,
    }
}
