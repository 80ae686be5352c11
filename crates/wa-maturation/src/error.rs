use thiserror::Error;

use crate::chip::ChipStatus;

#[derive(Error, Debug)]
pub enum MaturationError {
    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("Instance {0} is already maturing or in production")]
    DuplicateInstance(String),

    #[error("Pool for {owner} is full ({capacity} chips)")]
    PoolFull { owner: String, capacity: usize },

    #[error("Chip not found: {0}")]
    ChipNotFound(String),

    #[error("Cannot {action} chip {chip_id} while {status}")]
    InvalidState {
        chip_id: String,
        status: ChipStatus,
        action: &'static str,
    },

    #[error("Store error: {0}")]
    Store(String),
}
