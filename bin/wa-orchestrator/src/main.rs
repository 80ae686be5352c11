//! WhatsApp Dispatch Orchestrator
//!
//! Hosts the device pool registry, the anti-ban dispatch scheduler and the
//! chip maturation engine in one process.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use wa_config::{AppConfig, ConfigLoader};
use wa_dispatch::{
    spawn_health_monitor, AntibanScheduler, ConfigContentStore, ContentStore, DevicePoolRegistry, Gateway,
    HttpGateway, HttpGatewayConfig, RegistrySettings, SchedulerSettings,
};
use wa_maturation::{
    EngineSettings, InMemoryChipStore, MaturationEngine, MaturationScheduler, StrategyCatalog, TickHandler,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    wa_common::logging::init_logging("wa-orchestrator");

    info!("Starting WhatsApp dispatch orchestrator");

    let config = ConfigLoader::new().load()?;
    if config.dev_mode {
        warn!("Running in dev mode");
    }

    let registry = Arc::new(DevicePoolRegistry::new(RegistrySettings::from(&config.registry)));
    let content = Arc::new(ConfigContentStore::from_config(&config)?);
    let gateway: Arc<dyn Gateway> = Arc::new(HttpGateway::new(HttpGatewayConfig::from(&config.gateway))?);

    register_tenants(&config, &registry, content.as_ref()).await?;

    let content_store: Arc<dyn ContentStore> = content.clone();
    let scheduler = Arc::new(AntibanScheduler::new(
        registry.clone(),
        gateway.clone(),
        content_store,
        SchedulerSettings::from(&config),
    ));
    info!(
        selection_wait_ms = config.dispatch.selection_wait_ms,
        tenants = content.profiles().len(),
        "Dispatch scheduler ready"
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let health_handle = spawn_health_monitor(
        registry.clone(),
        gateway.clone(),
        Duration::from_secs(config.registry.health_check_interval_secs.max(1)),
        Duration::from_millis(config.gateway.timeout_ms.max(1)),
        shutdown_tx.clone(),
    );

    let engine = MaturationEngine::new(
        EngineSettings::from(&config),
        StrategyCatalog::with_configured(&config.maturation.strategies),
        gateway.clone(),
        registry.clone(),
        Arc::new(InMemoryChipStore::new()),
    )
    .await?;
    let engine = Arc::new(engine);
    let handler: Arc<dyn TickHandler> = engine.clone();
    let maturation = MaturationScheduler::from_config(&config.maturation, handler);
    maturation.start().await;

    print_startup_info(&config, &registry);
    info!("Orchestrator started. Press Ctrl+C to shutdown.");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    maturation.stop().await;
    let stats = engine.stats();
    info!(
        chips = stats.total,
        ready = stats.by_status.get("ready").copied().unwrap_or(0),
        "Maturation state at shutdown"
    );
    let _ = shutdown_tx.send(());
    if let Err(e) = health_handle.await {
        warn!(error = %e, "Health monitor task ended abnormally");
    }
    drop(scheduler);

    info!("Orchestrator shutdown complete");
    Ok(())
}

/// Register configured instances and apply each tenant's profile limits.
async fn register_tenants(
    config: &AppConfig,
    registry: &DevicePoolRegistry,
    content: &ConfigContentStore,
) -> anyhow::Result<()> {
    for tenant in &config.tenants {
        let profile = content.profile(&tenant.id).await?;
        registry.set_tenant_limits(&tenant.id, profile.tenant_limits());

        for instance in &tenant.instances {
            registry.register_instance(&tenant.id, &instance.id, instance.role);
        }
        info!(
            tenant_id = %tenant.id,
            profile = %profile.strategy_name,
            instances = tenant.instances.len(),
            templates = tenant.templates.len(),
            "Tenant registered"
        );
    }
    Ok(())
}

fn print_startup_info(config: &AppConfig, registry: &DevicePoolRegistry) {
    info!("==========================================");
    info!("WhatsApp Dispatch Orchestrator");
    info!("==========================================");
    info!("  Gateway: {}", config.gateway.base_url);
    info!("  Tenants: {}", config.tenants.len());
    info!("  Instances: {}", registry.len());
    info!("  Health checks: every {}s", config.registry.health_check_interval_secs);
    if config.maturation.enabled {
        info!("  Maturation: every {}s", config.maturation.tick_interval_secs);
    } else {
        info!("  Maturation: Disabled");
    }
    info!("==========================================");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
