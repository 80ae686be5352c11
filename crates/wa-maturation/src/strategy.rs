//! Maturation strategies - how long a chip warms up and how hard it is pushed
//!
//! A strategy splits its duration into four equal windows (baby, child, teen,
//! adult); a chip whose day reaches the duration is mature. Each phase has a
//! daily message quota that never decreases from one phase to the next.
//!
//! Built-in strategies:
//!
//! | key             | days | quotas (baby..mature) | notes                          |
//! |-----------------|------|-----------------------|--------------------------------|
//! | `gradual`       | 30   | 10 / 20 / 35 / 50 / 70  | default                      |
//! | `fast`          | 14   | 15 / 30 / 50 / 70 / 100 | urgent capacity              |
//! | `slow_safe`     | 45   | 5 / 10 / 20 / 35 / 50   | lowest risk                  |
//! | `social_hybrid` | 25   | 10 / 20 / 40 / 60 / 80  | heavier group participation  |
//! | `contingency`   | 35   | 10 / 20 / 30 / 40 / 60  | spare chips, no voice notes  |

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use wa_config::StrategyConfig;

use crate::phase::MaturationPhase;

pub const DEFAULT_STRATEGY: &str = "gradual";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaturationStrategy {
    pub key: String,
    pub name: String,
    pub duration_days: u32,
    /// Daily quota per phase, indexed by [`MaturationPhase::index`]
    pub quotas: [u32; 5],
    pub allow_voice_notes: bool,
    /// Upper bound on simulated group memberships
    pub max_groups: u32,
}

impl MaturationStrategy {
    fn builtin(key: &str, name: &str, duration_days: u32, quotas: [u32; 5], allow_voice_notes: bool, max_groups: u32) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            duration_days,
            quotas,
            allow_voice_notes,
            max_groups,
        }
    }

    /// Strategy defined in configuration. Quotas were validated at load time;
    /// missing entries repeat the last given quota.
    pub fn from_config(config: &StrategyConfig) -> Self {
        let mut quotas = [0u32; 5];
        let mut last = 0;
        for (i, slot) in quotas.iter_mut().enumerate() {
            last = config.quotas.get(i).copied().unwrap_or(last).max(last);
            *slot = last;
        }
        Self {
            key: config.key.clone(),
            name: config.name.clone(),
            duration_days: config.duration_days.max(1),
            quotas,
            allow_voice_notes: true,
            max_groups: 3,
        }
    }

    /// Phase of a chip on a given maturation day.
    pub fn phase_for_day(&self, day: u32) -> MaturationPhase {
        if day >= self.duration_days {
            return MaturationPhase::Mature;
        }
        let window = (day as u64 * 4) / self.duration_days.max(1) as u64;
        match window {
            0 => MaturationPhase::Baby,
            1 => MaturationPhase::Child,
            2 => MaturationPhase::Teen,
            _ => MaturationPhase::Adult,
        }
    }

    pub fn quota(&self, phase: MaturationPhase) -> u32 {
        self.quotas[phase.index()]
    }
}

/// How soon production capacity is needed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTolerance {
    Low,
    Medium,
    High,
}

/// What a chip will be used for once mature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChipPurpose {
    Production,
    Social,
    Contingency,
}

/// Suggest a strategy key for a new chip.
///
/// Contingency chips always get the contingency program; otherwise urgency
/// wins over caution, and caution over purpose.
pub fn recommend(urgency: Urgency, risk: RiskTolerance, purpose: ChipPurpose) -> &'static str {
    if purpose == ChipPurpose::Contingency {
        return "contingency";
    }
    if urgency == Urgency::High {
        return "fast";
    }
    if risk == RiskTolerance::Low {
        return "slow_safe";
    }
    if purpose == ChipPurpose::Social {
        return "social_hybrid";
    }
    DEFAULT_STRATEGY
}

/// Strategies a chip may be admitted under
#[derive(Debug, Clone)]
pub struct StrategyCatalog {
    strategies: BTreeMap<String, MaturationStrategy>,
}

impl StrategyCatalog {
    pub fn builtin() -> Self {
        let strategies = [
            MaturationStrategy::builtin("gradual", "Gradual warm-up", 30, [10, 20, 35, 50, 70], true, 3),
            MaturationStrategy::builtin("fast", "Fast track", 14, [15, 30, 50, 70, 100], true, 2),
            MaturationStrategy::builtin("slow_safe", "Slow and safe", 45, [5, 10, 20, 35, 50], true, 2),
            MaturationStrategy::builtin("social_hybrid", "Social hybrid", 25, [10, 20, 40, 60, 80], true, 5),
            MaturationStrategy::builtin("contingency", "Contingency reserve", 35, [10, 20, 30, 40, 60], false, 1),
        ];
        Self {
            strategies: strategies.into_iter().map(|s| (s.key.clone(), s)).collect(),
        }
    }

    /// Built-ins plus configured strategies; a configured key replaces a built-in.
    pub fn with_configured(configured: &[StrategyConfig]) -> Self {
        let mut catalog = Self::builtin();
        for config in configured {
            catalog.insert(MaturationStrategy::from_config(config));
        }
        catalog
    }

    pub fn insert(&mut self, strategy: MaturationStrategy) {
        self.strategies.insert(strategy.key.clone(), strategy);
    }

    pub fn get(&self, key: &str) -> Option<&MaturationStrategy> {
        self.strategies.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.strategies.keys().map(String::as_str)
    }
}

impl Default for StrategyCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thirty_day_windows() {
        let catalog = StrategyCatalog::builtin();
        let s = catalog.get("gradual").unwrap();
        assert_eq!(s.phase_for_day(0), MaturationPhase::Baby);
        assert_eq!(s.phase_for_day(7), MaturationPhase::Baby);
        assert_eq!(s.phase_for_day(8), MaturationPhase::Child);
        assert_eq!(s.phase_for_day(15), MaturationPhase::Teen);
        assert_eq!(s.phase_for_day(29), MaturationPhase::Adult);
        assert_eq!(s.phase_for_day(30), MaturationPhase::Mature);
    }

    #[test]
    fn test_phase_non_decreasing_for_every_strategy() {
        let catalog = StrategyCatalog::builtin();
        for key in catalog.keys() {
            let s = catalog.get(key).unwrap();
            let mut previous = MaturationPhase::Baby;
            for day in 0..=s.duration_days + 5 {
                let phase = s.phase_for_day(day);
                assert!(phase >= previous, "{} regressed on day {}", key, day);
                assert!(s.quota(phase) >= s.quota(previous));
                previous = phase;
            }
            assert!(s.quotas.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[test]
    fn test_short_strategy_reaches_mature() {
        let s = MaturationStrategy::from_config(&StrategyConfig {
            key: "week".into(),
            name: "One week".into(),
            duration_days: 7,
            quotas: vec![2, 4, 6, 8, 10],
        });
        assert_eq!(s.phase_for_day(1), MaturationPhase::Baby);
        assert_eq!(s.phase_for_day(2), MaturationPhase::Child);
        assert_eq!(s.phase_for_day(6), MaturationPhase::Adult);
        assert_eq!(s.phase_for_day(7), MaturationPhase::Mature);
    }

    #[test]
    fn test_recommend() {
        assert_eq!(recommend(Urgency::High, RiskTolerance::Low, ChipPurpose::Contingency), "contingency");
        assert_eq!(recommend(Urgency::High, RiskTolerance::Low, ChipPurpose::Production), "fast");
        assert_eq!(recommend(Urgency::Normal, RiskTolerance::Low, ChipPurpose::Social), "slow_safe");
        assert_eq!(recommend(Urgency::Normal, RiskTolerance::Medium, ChipPurpose::Social), "social_hybrid");
        assert_eq!(recommend(Urgency::Low, RiskTolerance::High, ChipPurpose::Production), "gradual");
    }

    #[test]
    fn test_configured_strategy_added() {
        let catalog = StrategyCatalog::with_configured(&[StrategyConfig {
            key: "express".into(),
            name: "Express".into(),
            duration_days: 7,
            quotas: vec![10, 20, 35, 50, 70],
        }]);
        assert_eq!(catalog.get("express").unwrap().duration_days, 7);
        assert!(catalog.get("gradual").is_some());
    }
}
