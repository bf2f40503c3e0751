use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::ModelError;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
}

impl AlertSeverity {
    /// Severity for the n-th occurrence of the same alert key.
    pub fn for_occurrences(occurrences: u32) -> Self {
        match occurrences {
            0 | 1 => AlertSeverity::Low,
            2 => AlertSeverity::Medium,
            _ => AlertSeverity::High,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
        }
    }
}

impl FromStr for AlertSeverity {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(AlertSeverity::Low),
            "medium" => Ok(AlertSeverity::Medium),
            "high" => Ok(AlertSeverity::High),
            other => Err(ModelError::UnknownState(other.to_string())),
        }
    }
}

/// Deduplicated operational alert. Re-recording the same key bumps
/// `occurrences` and escalates `severity` instead of adding a row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemAlert {
    pub key: String,
    pub message: String,
    pub severity: AlertSeverity,
    pub occurrences: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}
