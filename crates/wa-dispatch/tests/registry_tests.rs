//! Device Pool Registry Tests
//!
//! Selection must never hand out a cooling or over-limit instance while a
//! compliant one exists, and must fall back to a degraded pick otherwise.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use wa_common::{ConnectionState, GatewayOutcome, HealthCheckResult, InstanceHealth, InstanceRole, PresenceState, StepResult};
use wa_dispatch::{
    probe_all, spawn_health_monitor, DevicePoolRegistry, DispatchError, Gateway, RegistrySettings, TenantLimits,
};

fn delivered() -> GatewayOutcome {
    GatewayOutcome::Delivered { message_id: None }
}

fn healthy_pool(ids: &[&str]) -> DevicePoolRegistry {
    let registry = DevicePoolRegistry::new(RegistrySettings::default());
    for id in ids {
        registry.register_instance("acme", id, InstanceRole::Broadcast);
        registry.record_health_check(id, HealthCheckResult::Connected).unwrap();
    }
    registry
}

#[tokio::test]
async fn test_selection_rotates_between_equal_instances() {
    let registry = healthy_pool(&["b-01", "b-02"]);

    let first = registry.select_instance("acme", InstanceRole::Broadcast).unwrap();
    let second = registry.select_instance("acme", InstanceRole::Broadcast).unwrap();
    let third = registry.select_instance("acme", InstanceRole::Broadcast).unwrap();

    assert_ne!(first.instance_id, second.instance_id);
    assert_eq!(first.instance_id, third.instance_id);
    assert!(!first.degraded);
}

#[tokio::test]
async fn test_selection_prefers_higher_score() {
    let registry = healthy_pool(&["b-01", "b-02"]);
    registry
        .record_send_outcome("b-01", &GatewayOutcome::TransportError { reason: "reset".into() })
        .unwrap();

    for _ in 0..3 {
        let selection = registry.select_instance("acme", InstanceRole::Broadcast).unwrap();
        assert_eq!(selection.instance_id, "b-02");
    }
}

#[tokio::test]
async fn test_selection_filters_by_tenant_and_role() {
    let registry = healthy_pool(&["b-01"]);
    registry.register_instance("other", "o-01", InstanceRole::Broadcast);

    assert!(matches!(
        registry.select_instance("acme", InstanceRole::Webhook),
        Err(DispatchError::NoInstanceAvailable { .. })
    ));
    assert_eq!(registry.select_instance("acme", InstanceRole::Broadcast).unwrap().instance_id, "b-01");
}

#[tokio::test]
async fn test_cooling_instance_skipped_while_compliant_exists() {
    let registry = healthy_pool(&["b-01", "b-02"]);
    registry
        .record_send_outcome("b-01", &GatewayOutcome::RateLimited { retry_after: Some(Duration::from_secs(300)) })
        .unwrap();

    for _ in 0..5 {
        let selection = registry.select_instance("acme", InstanceRole::Broadcast).unwrap();
        assert_eq!(selection.instance_id, "b-02");
        assert!(!selection.degraded);
    }
}

#[tokio::test]
async fn test_over_limit_instance_skipped_while_compliant_exists() {
    let registry = healthy_pool(&["b-01", "b-02"]);
    registry.set_tenant_limits("acme", TenantLimits { hourly_limit: None, daily_limit: 2, respect_warmup: false });
    registry.record_send_outcome("b-01", &delivered()).unwrap();
    registry.record_send_outcome("b-01", &delivered()).unwrap();

    for _ in 0..5 {
        let selection = registry.select_instance("acme", InstanceRole::Broadcast).unwrap();
        assert_eq!(selection.instance_id, "b-02");
    }
}

#[tokio::test]
async fn test_degraded_selection_when_nothing_compliant() {
    let registry = healthy_pool(&["b-01"]);
    registry.register_instance("acme", "b-02", InstanceRole::Broadcast);
    registry.record_health_check("b-02", HealthCheckResult::Disconnected).unwrap();
    registry
        .record_send_outcome("b-01", &GatewayOutcome::RateLimited { retry_after: None })
        .unwrap();

    let selection = registry.select_instance("acme", InstanceRole::Broadcast).unwrap();
    assert!(selection.degraded);
    // a cooling healthy instance beats an unhealthy one
    assert_eq!(selection.instance_id, "b-01");
    assert_eq!(selection.health, InstanceHealth::Healthy);
    assert!(selection.cooling);
}

#[tokio::test(start_paused = true)]
async fn test_cooldown_expires() {
    let registry = healthy_pool(&["b-01"]);
    registry
        .record_send_outcome("b-01", &GatewayOutcome::RateLimited { retry_after: Some(Duration::from_secs(60)) })
        .unwrap();
    assert!(registry.select_instance("acme", InstanceRole::Broadcast).unwrap().degraded);

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(!registry.select_instance("acme", InstanceRole::Broadcast).unwrap().degraded);
}

#[tokio::test(start_paused = true)]
async fn test_daily_window_resets() {
    let registry = healthy_pool(&["b-01"]);
    registry.set_tenant_limits("acme", TenantLimits { hourly_limit: None, daily_limit: 1, respect_warmup: false });
    registry.record_send_outcome("b-01", &delivered()).unwrap();
    assert!(registry.daily_usage("b-01").unwrap().exhausted());

    tokio::time::advance(Duration::from_secs(24 * 60 * 60)).await;
    let usage = registry.daily_usage("b-01").unwrap();
    assert_eq!(usage.sent, 0);
    assert!(!usage.exhausted());
}

#[tokio::test(start_paused = true)]
async fn test_warmup_ceiling_grows_with_age() {
    let registry = healthy_pool(&["b-01"]);
    registry.set_tenant_limits("acme", TenantLimits { hourly_limit: None, daily_limit: 1000, respect_warmup: true });
    assert_eq!(registry.effective_daily_limit("b-01").unwrap(), 10);

    tokio::time::advance(Duration::from_secs(3 * 24 * 60 * 60)).await;
    assert_eq!(registry.effective_daily_limit("b-01").unwrap(), 50);
}

#[tokio::test]
async fn test_pool_status_sorted_with_counters() {
    let registry = healthy_pool(&["b-02", "b-01"]);
    registry.record_send_outcome("b-02", &delivered()).unwrap();
    registry
        .record_send_outcome("b-02", &GatewayOutcome::TransportError { reason: "reset".into() })
        .unwrap();

    let status = registry.pool_status("acme");
    let ids: Vec<_> = status.iter().map(|s| s.instance_id.as_str()).collect();
    assert_eq!(ids, vec!["b-01", "b-02"]);
    assert_eq!(status[1].counters.sent_total, 1);
    assert_eq!(status[1].counters.failed_total, 1);
    assert_eq!(status[1].counters.consecutive_failures, 1);
}

#[tokio::test]
async fn test_remove_instance_drops_it_from_selection() {
    let registry = healthy_pool(&["b-01"]);
    registry.remove_instance("b-01").unwrap();
    assert!(registry.pool_status("acme").is_empty());
    assert!(matches!(
        registry.select_instance("acme", InstanceRole::Broadcast),
        Err(DispatchError::NoInstanceAvailable { .. })
    ));
}

/// Gateway reporting a fixed connection state per instance
struct StateGateway;

#[async_trait]
impl Gateway for StateGateway {
    async fn send(&self, _instance_id: &str, _phone: &str, _content: &str) -> GatewayOutcome {
        delivered()
    }

    async fn set_presence(&self, _instance_id: &str, _phone: &str, _state: PresenceState) -> StepResult {
        StepResult::Ok
    }

    async fn set_typing(&self, _instance_id: &str, _phone: &str, _duration: Duration) -> StepResult {
        StepResult::Ok
    }

    async fn connection_state(&self, instance_id: &str) -> wa_dispatch::Result<ConnectionState> {
        match instance_id {
            "b-01" => Ok(ConnectionState::Open),
            "b-02" => Ok(ConnectionState::Banned),
            "b-04" => std::future::pending().await,
            _ => Err(DispatchError::Transport("probe refused".into())),
        }
    }
}

#[tokio::test]
async fn test_probe_all_records_results() {
    let registry = DevicePoolRegistry::default();
    for id in ["b-01", "b-02", "b-03"] {
        registry.register_instance("acme", id, InstanceRole::Broadcast);
    }

    let sweep = probe_all(&registry, &StateGateway, Duration::from_secs(5)).await;

    assert_eq!(sweep.probed, 3);
    assert_eq!(sweep.healthy, 1);
    assert_eq!(sweep.unhealthy, 2);
    assert_eq!(sweep.unreachable, 1);
    let banned = registry.instance_status("b-02").unwrap();
    assert_eq!(banned.health, InstanceHealth::Unhealthy);
    assert!(banned.cooldown_remaining_ms.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_probe_counts_as_unreachable() {
    let registry = DevicePoolRegistry::default();
    for id in ["b-01", "b-04"] {
        registry.register_instance("acme", id, InstanceRole::Broadcast);
    }

    let sweep = tokio::time::timeout(
        Duration::from_secs(60),
        probe_all(&registry, &StateGateway, Duration::from_secs(5)),
    )
    .await
    .expect("sweep must not wait on a stalled probe");

    assert_eq!(sweep.probed, 2);
    assert_eq!(sweep.healthy, 1);
    assert_eq!(sweep.unreachable, 1);
    assert_eq!(registry.instance_status("b-04").unwrap().health, InstanceHealth::Unhealthy);
}

#[tokio::test(start_paused = true)]
async fn test_health_monitor_stops_on_shutdown() {
    let registry = Arc::new(DevicePoolRegistry::default());
    registry.register_instance("acme", "b-01", InstanceRole::Broadcast);
    let (shutdown_tx, _) = broadcast::channel(1);

    let handle = spawn_health_monitor(
        registry.clone(),
        Arc::new(StateGateway),
        Duration::from_secs(30),
        Duration::from_secs(5),
        shutdown_tx.clone(),
    );
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(registry.instance_status("b-01").unwrap().health, InstanceHealth::Healthy);

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();
}
