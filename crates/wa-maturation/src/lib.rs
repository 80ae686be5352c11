//! Chip maturation - phased warm-up of new WhatsApp identities
//!
//! A chip is a freshly connected identity that must build a history of
//! ordinary conversation before it can carry production traffic. The engine
//! advances every active chip one day per tick, pairs chips for scripted
//! exchanges within their phase quotas and promotes ready chips into the
//! dispatch registry.
//!
//! - [`MaturationEngine`]: chip set, daily tick, promotion
//! - [`StrategyCatalog`]: durations and per-phase quotas
//! - [`ScriptLibrary`]: conversation scripts
//! - [`ChipStore`]: persistence boundary
//! - [`MaturationScheduler`]: periodic trigger

pub mod chip;
pub mod engine;
pub mod error;
pub mod phase;
pub mod scripts;
pub mod store;
pub mod strategy;
pub mod trigger;

pub use chip::{Chip, ChipAdmission, ChipStatus, GroupMembership};
pub use engine::{EngineSettings, MaturationEngine, MaturationStats, TickReport};
pub use error::MaturationError;
pub use phase::MaturationPhase;
pub use scripts::{ConversationScript, ScriptLibrary, ScriptLine, Speaker};
pub use store::{ChipStore, InMemoryChipStore};
pub use strategy::{recommend, ChipPurpose, MaturationStrategy, RiskTolerance, StrategyCatalog, Urgency, DEFAULT_STRATEGY};
pub use trigger::{MaturationScheduler, TickHandler};

pub type Result<T> = std::result::Result<T, MaturationError>;
