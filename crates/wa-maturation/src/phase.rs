use serde::{Deserialize, Serialize};
use std::fmt;

/// Warm-up stage of a chip. Phases are ordered; a chip only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaturationPhase {
    Baby,
    Child,
    Teen,
    Adult,
    Mature,
}

impl MaturationPhase {
    pub const ALL: [MaturationPhase; 5] = [Self::Baby, Self::Child, Self::Teen, Self::Adult, Self::Mature];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Phases in which a chip may be scheduled into groups
    pub fn allows_groups(self) -> bool {
        self >= Self::Teen
    }
}

impl fmt::Display for MaturationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Baby => write!(f, "baby"),
            Self::Child => write!(f, "child"),
            Self::Teen => write!(f, "teen"),
            Self::Adult => write!(f, "adult"),
            Self::Mature => write!(f, "mature"),
        }
    }
}
