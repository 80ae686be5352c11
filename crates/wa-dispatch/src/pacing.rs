//! Per-instance pacing state machine
//!
//! ```text
//! Idle -> Cooling -> Sending -> Idle
//!                           \-> BatchPaused -> Idle
//! ```
//!
//! After every real send the instance is gated for a uniformly random delay in
//! `[delay_min, delay_max]`. Every `batch_size` sends it additionally pauses for
//! `pause_between_batches`. With `long_pause_probability` a send is followed by
//! an extra pause in `[long_pause_min, long_pause_max]`. Hourly limits are
//! enforced with a governor rate limiter sized from the profile.

use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use rand::Rng;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::profile::AntibanProfile;
use crate::{DispatchError, Result};

type HourlyLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Pacing state of one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingState {
    Idle,
    /// Waiting out the inter-message delay
    Cooling { until: Instant },
    Sending,
    /// Waiting out the pause between batches
    BatchPaused { until: Instant },
}

/// Uniform random delay between two sends on the same instance.
pub fn sample_delay<R: Rng + ?Sized>(profile: &AntibanProfile, rng: &mut R) -> Duration {
    if profile.delay_max <= profile.delay_min {
        return profile.delay_min;
    }
    let min = profile.delay_min.as_millis() as u64;
    let max = profile.delay_max.as_millis() as u64;
    Duration::from_millis(rng.random_range(min..=max))
}

/// Extra pause drawn after a send, if the profile's coin flip lands.
pub fn sample_long_pause<R: Rng + ?Sized>(profile: &AntibanProfile, rng: &mut R) -> Option<Duration> {
    if profile.long_pause_probability <= 0.0 || !rng.random_bool(profile.long_pause_probability.min(1.0)) {
        return None;
    }
    if profile.long_pause_max <= profile.long_pause_min {
        return Some(profile.long_pause_min);
    }
    let min = profile.long_pause_min.as_millis() as u64;
    let max = profile.long_pause_max.as_millis() as u64;
    Some(Duration::from_millis(rng.random_range(min..=max)))
}

fn hourly_limiter(hourly_limit: u32) -> Arc<HourlyLimiter> {
    let quota = NonZeroU32::new(hourly_limit).unwrap_or(NonZeroU32::MIN);
    Arc::new(RateLimiter::direct(Quota::per_hour(quota)))
}

/// Pacing bookkeeping for a single instance.
///
/// Callers hold the instance's pacing lock for the whole
/// before-send/send/after-send sequence, so this type needs no interior locking.
pub struct InstancePacer {
    instance_id: String,
    state: PacingState,
    next_allowed_at: Option<Instant>,
    batch_paused_until: Option<Instant>,
    sends_in_batch: u32,
    last_send_at: Option<Instant>,
    hourly_limit: u32,
    limiter: Arc<HourlyLimiter>,
}

impl InstancePacer {
    pub fn new(instance_id: &str, profile: &AntibanProfile) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            state: PacingState::Idle,
            next_allowed_at: None,
            batch_paused_until: None,
            sends_in_batch: 0,
            last_send_at: None,
            hourly_limit: profile.hourly_limit,
            limiter: hourly_limiter(profile.hourly_limit),
        }
    }

    /// Current state, with elapsed waits collapsed to `Idle`.
    pub fn state(&self) -> PacingState {
        let now = Instant::now();
        match self.state {
            PacingState::Cooling { until } | PacingState::BatchPaused { until } if until <= now => PacingState::Idle,
            other => other,
        }
    }

    pub fn sends_in_batch(&self) -> u32 {
        self.sends_in_batch
    }

    pub fn last_send_at(&self) -> Option<Instant> {
        self.last_send_at
    }

    /// Take one hourly permit, or report when one will be available.
    pub fn acquire_hourly_permit(&mut self, profile: &AntibanProfile) -> Result<()> {
        if profile.hourly_limit != self.hourly_limit {
            debug!(
                instance_id = %self.instance_id,
                from = self.hourly_limit,
                to = profile.hourly_limit,
                "Hourly limit changed, rebuilding limiter"
            );
            self.hourly_limit = profile.hourly_limit;
            self.limiter = hourly_limiter(profile.hourly_limit);
        }

        self.limiter.check().map_err(|not_until| DispatchError::RateLimitExceeded {
            instance_id: self.instance_id.clone(),
            retry_after: Some(not_until.wait_time_from(DefaultClock::default().now())),
        })
    }

    /// Earliest instant the next send may start.
    pub fn next_send_at(&self) -> Option<Instant> {
        match (self.next_allowed_at, self.batch_paused_until) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Sleep through any delay gate or batch pause, then enter `Sending`.
    pub async fn wait_turn(&mut self) {
        if let Some(gate) = self.next_send_at() {
            let now = Instant::now();
            if gate > now {
                let paused = self.batch_paused_until.map(|b| b >= gate).unwrap_or(false);
                self.state = if paused {
                    PacingState::BatchPaused { until: gate }
                } else {
                    PacingState::Cooling { until: gate }
                };
                debug!(
                    instance_id = %self.instance_id,
                    wait_ms = gate.duration_since(now).as_millis() as u64,
                    batch_paused = paused,
                    "Waiting for pacing gate"
                );
                tokio::time::sleep_until(gate).await;
            }
        }
        self.batch_paused_until = None;
        self.state = PacingState::Sending;
    }

    /// Record a send that reached the gateway and arm the next gate.
    pub fn complete_send(&mut self, profile: &AntibanProfile, delay: Duration) {
        let now = Instant::now();
        self.last_send_at = Some(now);
        self.sends_in_batch += 1;
        self.next_allowed_at = Some(now + delay);

        if self.sends_in_batch >= profile.batch_size {
            let until = now + profile.pause_between_batches;
            self.sends_in_batch = 0;
            self.batch_paused_until = Some(until);
            self.state = PacingState::BatchPaused { until };
            debug!(
                instance_id = %self.instance_id,
                pause_ms = profile.pause_between_batches.as_millis() as u64,
                "Batch complete, pausing instance"
            );
        } else {
            self.state = PacingState::Cooling { until: now + delay };
        }
    }

    /// Return to `Idle` after an attempt that never reached the gateway.
    pub fn abandon(&mut self) {
        if self.state == PacingState::Sending {
            self.state = PacingState::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn profile(batch_size: u32) -> AntibanProfile {
        AntibanProfile {
            batch_size,
            ..AntibanProfile::default()
        }
    }

    #[test]
    fn test_sample_delay_within_bounds() {
        let p = AntibanProfile::default();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..500 {
            let d = sample_delay(&p, &mut rng);
            assert!(d >= p.delay_min && d <= p.delay_max);
        }
    }

    #[test]
    fn test_sample_delay_degenerate_range() {
        let p = AntibanProfile {
            delay_min: Duration::from_secs(5),
            delay_max: Duration::from_secs(5),
            ..AntibanProfile::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(sample_delay(&p, &mut rng), Duration::from_secs(5));
    }

    #[test]
    fn test_long_pause_disabled_at_zero_probability() {
        let p = AntibanProfile { long_pause_probability: 0.0, ..AntibanProfile::default() };
        let mut rng = StdRng::seed_from_u64(9);
        assert!((0..200).all(|_| sample_long_pause(&p, &mut rng).is_none()));
    }

    #[test]
    fn test_long_pause_frequency_and_bounds() {
        let p = AntibanProfile {
            long_pause_probability: 0.15,
            long_pause_min: Duration::from_secs(300),
            long_pause_max: Duration::from_secs(900),
            ..AntibanProfile::default()
        };
        let mut rng = StdRng::seed_from_u64(17);
        let pauses: Vec<Duration> = (0..2000).filter_map(|_| sample_long_pause(&p, &mut rng)).collect();

        assert!(pauses.len() > 200 && pauses.len() < 400, "got {} pauses", pauses.len());
        assert!(pauses.iter().all(|d| *d >= p.long_pause_min && *d <= p.long_pause_max));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_completion_pauses() {
        let p = profile(2);
        let mut pacer = InstancePacer::new("i-1", &p);

        pacer.wait_turn().await;
        pacer.complete_send(&p, Duration::from_secs(1));
        assert!(matches!(pacer.state(), PacingState::Cooling { .. }));

        pacer.wait_turn().await;
        pacer.complete_send(&p, Duration::from_secs(1));
        assert!(matches!(pacer.state(), PacingState::BatchPaused { .. }));
        assert_eq!(pacer.sends_in_batch(), 0);

        let before = Instant::now();
        pacer.wait_turn().await;
        assert!(Instant::now() - before >= p.pause_between_batches);
        assert_eq!(pacer.state(), PacingState::Sending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_gate_reads_idle() {
        let p = profile(10);
        let mut pacer = InstancePacer::new("i-1", &p);
        pacer.wait_turn().await;
        pacer.complete_send(&p, Duration::from_secs(2));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(pacer.state(), PacingState::Idle);
    }

    #[test]
    fn test_hourly_permits_exhaust() {
        let p = AntibanProfile { hourly_limit: 2, ..AntibanProfile::default() };
        let mut pacer = InstancePacer::new("i-1", &p);
        assert!(pacer.acquire_hourly_permit(&p).is_ok());
        assert!(pacer.acquire_hourly_permit(&p).is_ok());
        match pacer.acquire_hourly_permit(&p) {
            Err(DispatchError::RateLimitExceeded { retry_after, .. }) => {
                assert!(retry_after.unwrap() > Duration::from_secs(60));
            }
            other => panic!("expected rate limit, got {:?}", other),
        }
    }
}
