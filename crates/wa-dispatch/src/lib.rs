//! Dispatch orchestration over per-tenant WhatsApp device pools
//!
//! - DevicePoolRegistry: instance health scoring, counters and selection
//! - AntibanScheduler: paced dispatch with quotas, delay gates, batch pauses
//!   and typing simulation
//! - Gateway / HttpGateway: the automation service boundary
//! - ContentStore / ConfigContentStore: tenant profiles and message text
//! - Health monitor: periodic connection probes

pub mod content;
pub mod dispatch_metrics;
pub mod error;
pub mod gateway;
pub mod health;
pub mod pacing;
pub mod profile;
pub mod registry;
pub mod scheduler;

pub use content::{render, ConfigContentStore, ContentStore};
pub use error::DispatchError;
pub use gateway::{Gateway, HttpGateway, HttpGatewayConfig};
pub use health::{probe_all, spawn_health_monitor, HealthSweep};
pub use pacing::{InstancePacer, PacingState};
pub use profile::AntibanProfile;
pub use registry::{warmup_ceiling, DailyUsage, DevicePoolRegistry, RegistrySettings, Selection, TenantLimits};
pub use scheduler::{AntibanScheduler, InstanceLease, SchedulerSettings};

pub type Result<T> = std::result::Result<T, DispatchError>;
