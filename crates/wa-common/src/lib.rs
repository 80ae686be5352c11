use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub mod logging;

// ============================================================================
// Instance Identity & Health
// ============================================================================

/// Health of a gateway-connected instance as seen by the device pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceHealth {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl fmt::Display for InstanceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Traffic class an instance serves within a tenant pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceRole {
    /// Transactional notifications triggered by webhook events
    Webhook,
    /// Campaign / mass messaging
    Broadcast,
    /// Spare capacity kept warm for failover
    Contingency,
}

#[derive(Debug, Error)]
#[error("Unknown instance role: {0}")]
pub struct ParseRoleError(pub String);

impl FromStr for InstanceRole {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "webhook" => Ok(Self::Webhook),
            "broadcast" => Ok(Self::Broadcast),
            "contingency" => Ok(Self::Contingency),
            other => Err(ParseRoleError(other.to_string())),
        }
    }
}

impl fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Webhook => write!(f, "webhook"),
            Self::Broadcast => write!(f, "broadcast"),
            Self::Contingency => write!(f, "contingency"),
        }
    }
}

/// Connection state reported by the gateway for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Open,
    Connecting,
    Close,
    /// The messaging network has blocked the identity
    Banned,
}

/// Result of a single health probe, fed into the registry's moving average.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthCheckResult {
    Connected,
    Connecting,
    Disconnected,
    Banned,
    /// Probe itself failed (gateway unreachable, timeout)
    Unreachable,
}

impl HealthCheckResult {
    /// Observation value in [0, 1] used by the score EMA.
    pub fn outcome_value(&self) -> f64 {
        match self {
            Self::Connected => 1.0,
            Self::Connecting => 0.5,
            Self::Disconnected | Self::Banned | Self::Unreachable => 0.0,
        }
    }
}

impl From<ConnectionState> for HealthCheckResult {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Open => Self::Connected,
            ConnectionState::Connecting => Self::Connecting,
            ConnectionState::Close => Self::Disconnected,
            ConnectionState::Banned => Self::Banned,
        }
    }
}

// ============================================================================
// Gateway Interaction Types
// ============================================================================

/// Chat presence shown to the recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    Available,
    Composing,
    Paused,
    Unavailable,
}

/// Raw outcome of a gateway send.
///
/// Rate-limit and ban signals are kept apart from generic transport failures so
/// the pool can cool an instance down instead of just lowering its score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayOutcome {
    Delivered { message_id: Option<String> },
    RateLimited { retry_after: Option<Duration> },
    Banned { reason: String },
    TransportError { reason: String },
}

impl GatewayOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    /// Observation value in [0, 1] used by the score EMA.
    pub fn outcome_value(&self) -> f64 {
        match self {
            Self::Delivered { .. } => 1.0,
            Self::RateLimited { .. } => 0.25,
            Self::Banned { .. } | Self::TransportError { .. } => 0.0,
        }
    }
}

/// Result of a best-effort behavioral call (presence, typing).
///
/// A soft failure is cosmetic: it is logged and the dispatch carries on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Ok,
    SoftFail(String),
}

impl StepResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

// ============================================================================
// Dispatch Request / Outcome
// ============================================================================

/// A request to send one templated message on behalf of a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub tenant_id: String,
    pub role: InstanceRole,
    pub phone: String,
    pub template_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SendStatus {
    Delivered,
    TransportFailed { reason: String },
    Banned { reason: String },
}

/// Outcome of a dispatch that reached the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOutcome {
    pub tenant_id: String,
    pub instance_id: String,
    pub phone: String,
    #[serde(flatten)]
    pub status: SendStatus,
    pub message_id: Option<String>,
    /// The instance was picked in degraded mode (no compliant instance existed)
    pub degraded: bool,
    pub sent_at: DateTime<Utc>,
}

impl SendOutcome {
    pub fn is_delivered(&self) -> bool {
        self.status == SendStatus::Delivered
    }
}

// ============================================================================
// Pool Introspection
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceCounters {
    pub sent_total: u64,
    pub failed_total: u64,
    pub rate_limited_total: u64,
    pub sent_this_hour: u32,
    pub sent_today: u32,
    pub consecutive_failures: u32,
}

/// Snapshot of one instance, as returned by pool status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub instance_id: String,
    pub tenant_id: String,
    pub role: InstanceRole,
    pub health: InstanceHealth,
    pub score: f64,
    pub counters: InstanceCounters,
    pub daily_limit: u32,
    pub cooldown_remaining_ms: Option<u64>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parsing() {
        assert_eq!("Broadcast".parse::<InstanceRole>().unwrap(), InstanceRole::Broadcast);
        assert_eq!(" webhook ".parse::<InstanceRole>().unwrap(), InstanceRole::Webhook);
        assert!("sms".parse::<InstanceRole>().is_err());
    }

    #[test]
    fn test_outcome_values_are_bounded() {
        let outcomes = [
            GatewayOutcome::Delivered { message_id: None },
            GatewayOutcome::RateLimited { retry_after: None },
            GatewayOutcome::Banned { reason: "blocked".into() },
            GatewayOutcome::TransportError { reason: "timeout".into() },
        ];
        for o in outcomes {
            let v = o.outcome_value();
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn test_send_outcome_serializes_status_inline() {
        let outcome = SendOutcome {
            tenant_id: "acme".into(),
            instance_id: "acme-01".into(),
            phone: "5511999990000".into(),
            status: SendStatus::TransportFailed { reason: "timeout".into() },
            message_id: None,
            degraded: false,
            sent_at: Utc::now(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "TRANSPORT_FAILED");
        assert_eq!(json["reason"], "timeout");
        assert_eq!(json["instanceId"], "acme-01");
    }
}
