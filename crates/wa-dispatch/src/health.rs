//! Health Monitor - periodic connection probes feeding the registry
//!
//! Every interval all registered instances are probed concurrently through
//! [`Gateway::connection_state`]. A probe that fails outright or does not
//! answer within the probe timeout counts as `Unreachable`.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use wa_common::{HealthCheckResult, InstanceHealth};

use crate::gateway::Gateway;
use crate::registry::DevicePoolRegistry;

/// Summary of one probe round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthSweep {
    pub probed: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unreachable: usize,
}

/// Probe every registered instance once and record the results.
pub async fn probe_all(registry: &DevicePoolRegistry, gateway: &dyn Gateway, timeout: Duration) -> HealthSweep {
    let ids = registry.instance_ids();

    let probes = ids.iter().map(|id| async move {
        let result = match tokio::time::timeout(timeout, gateway.connection_state(id)).await {
            Ok(Ok(state)) => HealthCheckResult::from(state),
            Ok(Err(e)) => {
                warn!(instance_id = %id, error = %e, "Connection probe failed");
                HealthCheckResult::Unreachable
            }
            Err(_) => {
                warn!(instance_id = %id, timeout_ms = timeout.as_millis() as u64, "Connection probe timed out");
                HealthCheckResult::Unreachable
            }
        };
        (id, result)
    });
    let results = join_all(probes).await;

    let mut sweep = HealthSweep { probed: results.len(), ..Default::default() };
    for (id, result) in results {
        if result == HealthCheckResult::Unreachable {
            sweep.unreachable += 1;
        }
        // Instances removed while the probe was in flight are skipped
        match registry.record_health_check(id, result) {
            Ok(InstanceHealth::Healthy) => sweep.healthy += 1,
            Ok(InstanceHealth::Unhealthy) => sweep.unhealthy += 1,
            Ok(InstanceHealth::Unknown) => {}
            Err(e) => debug!(instance_id = %id, error = %e, "Skipping probe result"),
        }
    }

    debug!(
        probed = sweep.probed,
        healthy = sweep.healthy,
        unhealthy = sweep.unhealthy,
        unreachable = sweep.unreachable,
        "Health sweep complete"
    );
    sweep
}

/// Spawn the periodic probe loop; it stops when `shutdown_tx` fires.
pub fn spawn_health_monitor(
    registry: Arc<DevicePoolRegistry>,
    gateway: Arc<dyn Gateway>,
    interval: Duration,
    probe_timeout: Duration,
    shutdown_tx: broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Health monitor started");
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    probe_all(&registry, gateway.as_ref(), probe_timeout).await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Health monitor shutting down");
                    break;
                }
            }
        }
    })
}
