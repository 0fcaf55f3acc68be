use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::BridgeError;

/// Priority of a coordinated unit of work, on the ticketing store's 0-3 scale.
/// Lower values are more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    /// P0 - drop everything
    Critical = 0,
    /// P1
    High = 1,
    /// P2 - the default for new work
    Medium = 2,
    /// P3
    Low = 3,
}

impl Priority {
    /// Get the numeric priority value
    pub fn value(self) -> u8 {
        self as u8
    }

    /// Label understood by the `bd` CLI (`-p 0` .. `-p 3`)
    pub fn as_cli_arg(self) -> String {
        self.value().to_string()
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl TryFrom<u8> for Priority {
    type Error = BridgeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Priority::Critical),
            1 => Ok(Priority::High),
            2 => Ok(Priority::Medium),
            3 => Ok(Priority::Low),
            other => Err(BridgeError::InvalidPriority(other)),
        }
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.value()
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.value())
    }
}
