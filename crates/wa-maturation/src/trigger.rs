//! Periodic trigger for the maturation tick

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use wa_config::MaturationConfig;

use crate::engine::{MaturationEngine, TickReport};
use crate::Result;

/// Work run on every trigger
#[async_trait]
pub trait TickHandler: Send + Sync {
    async fn on_tick(&self) -> Result<TickReport>;
}

#[async_trait]
impl TickHandler for MaturationEngine {
    async fn on_tick(&self) -> Result<TickReport> {
        Ok(self.tick().await)
    }
}

/// Fires the handler once per interval until stopped.
///
/// The first tick fires one full interval after start. A tick still running
/// when the next one is due delays it rather than overlapping. Each start
/// opens a new generation; a loop from an earlier generation exits at its next
/// wake-up, so stop followed by start never leaves two loops ticking.
pub struct MaturationScheduler {
    interval: Duration,
    enabled: bool,
    handler: Arc<dyn TickHandler>,
    running: Arc<RwLock<bool>>,
    generation: Arc<AtomicU64>,
}

impl MaturationScheduler {
    pub fn new(interval: Duration, enabled: bool, handler: Arc<dyn TickHandler>) -> Self {
        Self {
            interval,
            enabled,
            handler,
            running: Arc::new(RwLock::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn from_config(config: &MaturationConfig, handler: Arc<dyn TickHandler>) -> Self {
        Self::new(Duration::from_secs(config.tick_interval_secs.max(1)), config.enabled, handler)
    }

    pub async fn start(&self) {
        if !self.enabled {
            info!("Maturation scheduler is disabled");
            return;
        }

        let mut running = self.running.write().await;
        if *running {
            warn!("Maturation scheduler already running");
            return;
        }
        *running = true;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        drop(running);

        info!(interval_secs = self.interval.as_secs(), "Starting maturation scheduler");

        let handler = self.handler.clone();
        let period = self.interval;
        let running = self.running.clone();
        let current = self.generation.clone();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if current.load(Ordering::SeqCst) != generation || !*running.read().await {
                    debug!(generation, "Maturation scheduler loop exiting");
                    break;
                }
                if let Err(e) = handler.on_tick().await {
                    error!(error = %e, "Maturation tick failed");
                }
            }
        });
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        self.generation.fetch_add(1, Ordering::SeqCst);
        info!("Maturation scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Run one tick immediately, outside the schedule.
    pub async fn trigger_now(&self) -> Result<TickReport> {
        self.handler.on_tick().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingHandler {
        ticks: AtomicU32,
    }

    #[async_trait]
    impl TickHandler for CountingHandler {
        async fn on_tick(&self) -> Result<TickReport> {
            let tick = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TickReport { tick: tick as u64, ..Default::default() })
        }
    }

    fn handler() -> Arc<CountingHandler> {
        Arc::new(CountingHandler { ticks: AtomicU32::new(0) })
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_tick_at_startup() {
        let counting = handler();
        let scheduler = MaturationScheduler::new(Duration::from_secs(60), true, counting.clone());
        scheduler.start().await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(counting.ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(counting.ticks.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(counting.ticks.load(Ordering::SeqCst), 3);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_ticks() {
        let counting = handler();
        let scheduler = MaturationScheduler::new(Duration::from_secs(10), true, counting.clone());
        scheduler.start().await;
        assert!(scheduler.is_running().await);

        tokio::time::sleep(Duration::from_secs(25)).await;
        scheduler.stop().await;
        assert!(!scheduler.is_running().await);
        let seen = counting.ticks.load(Ordering::SeqCst);
        assert_eq!(seen, 2);

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(counting.ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_retires_previous_loop() {
        let counting = handler();
        let scheduler = MaturationScheduler::new(Duration::from_secs(10), true, counting.clone());
        scheduler.start().await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        scheduler.stop().await;
        scheduler.start().await;

        // the first loop would have fired at 10s
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(counting.ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counting.ticks.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(counting.ticks.load(Ordering::SeqCst), 2);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_scheduler_never_runs() {
        let counting = handler();
        let scheduler = MaturationScheduler::new(Duration::from_secs(1), false, counting.clone());
        scheduler.start().await;
        assert!(!scheduler.is_running().await);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(counting.ticks.load(Ordering::SeqCst), 0);

        let report = scheduler.trigger_now().await.unwrap();
        assert_eq!(report.tick, 1);
    }
}
