use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use wa_common::InstanceRole;

use crate::phase::MaturationPhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChipStatus {
    Active,
    Paused,
    Ready,
    Failed,
}

impl fmt::Display for ChipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Request to start warming up a freshly connected identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChipAdmission {
    /// Gateway instance the chip sends through
    pub instance_ref: String,
    pub phone: String,
    /// Tenant (or operator) pool the chip belongs to
    pub owner: String,
    pub strategy_key: String,
    #[serde(default)]
    pub priority: u8,
    /// Role the instance will serve once promoted
    pub role: InstanceRole,
}

/// An identity going through the maturation program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chip {
    pub id: String,
    pub instance_ref: String,
    pub phone: String,
    pub owner: String,
    pub strategy_key: String,
    pub priority: u8,
    pub role: InstanceRole,
    pub phase: MaturationPhase,
    pub current_day: u32,
    pub start_date: DateTime<Utc>,
    pub target_date: DateTime<Utc>,
    pub target_day: u32,
    pub daily_quota: u32,
    pub sent_today: u32,
    /// Consecutive days that ended with an unrecovered send failure
    pub consecutive_failures: u32,
    pub status: ChipStatus,
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub failed_today: bool,
    #[serde(default)]
    pub last_tick_at: Option<DateTime<Utc>>,
}

impl Chip {
    pub fn is_active(&self) -> bool {
        self.status == ChipStatus::Active
    }

    pub fn quota_remaining(&self) -> u32 {
        self.daily_quota.saturating_sub(self.sent_today)
    }

    pub fn has_outstanding_failures(&self) -> bool {
        self.consecutive_failures > 0 || self.failed_today
    }

    /// Fraction of the program completed, in [0, 1]
    pub fn progress(&self) -> f64 {
        if self.target_day == 0 {
            return 1.0;
        }
        (self.current_day as f64 / self.target_day as f64).min(1.0)
    }

    pub(crate) fn fail(&mut self, reason: impl Into<String>) {
        self.status = ChipStatus::Failed;
        self.failure_reason = Some(reason.into());
    }
}

/// A chip's scheduled membership in a simulated group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMembership {
    pub chip_id: String,
    pub group_id: String,
    pub join_scheduled_at: DateTime<Utc>,
    /// The chip has not yet interacted in the group since joining
    pub interaction_pending: bool,
}
