use std::time::Duration;
use thiserror::Error;
use wa_common::InstanceRole;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("No instance available for tenant {tenant_id} ({role})")]
    NoInstanceAvailable { tenant_id: String, role: InstanceRole },

    #[error("Rate limit exceeded on instance {instance_id}")]
    RateLimitExceeded {
        instance_id: String,
        /// Earliest time a retry could be accepted, when known
        retry_after: Option<Duration>,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Unknown tenant: {0}")]
    UnknownTenant(String),

    #[error("Unknown template '{template_type}' for tenant {tenant_id}")]
    UnknownTemplate { tenant_id: String, template_type: String },

    #[error("Content error: {0}")]
    Content(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
