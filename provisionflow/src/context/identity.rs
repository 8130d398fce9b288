//! Run identity for correlating one provisioning or reset run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Whether a run creates or destroys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Forward, creative run.
    Provision,
    /// Reverse, destructive run.
    Reset,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provision => write!(f, "provision"),
            Self::Reset => write!(f, "reset"),
        }
    }
}

/// Identifies one run of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdentity {
    /// Unique id of this run.
    pub run_id: Uuid,
    /// Environment the run targets.
    pub environment: String,
    /// Pipeline name.
    pub pipeline: String,
    /// Provision or reset.
    pub mode: RunMode,
    /// When the run started.
    pub started_at: DateTime<Utc>,
}

impl RunIdentity {
    /// Creates an identity with a fresh run id.
    #[must_use]
    pub fn new(environment: impl Into<String>, pipeline: impl Into<String>, mode: RunMode) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            environment: environment.into(),
            pipeline: pipeline.into(),
            mode,
            started_at: Utc::now(),
        }
    }

    /// Sets a specific run id.
    #[must_use]
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_unique_run_ids() {
        let a = RunIdentity::new("demo", "dataspace", RunMode::Provision);
        let b = RunIdentity::new("demo", "dataspace", RunMode::Provision);
        assert_ne!(a.run_id, b.run_id);
        assert_eq!(a.mode.to_string(), "provision");
    }

    #[test]
    fn test_with_run_id() {
        let id = Uuid::new_v4();
        let identity = RunIdentity::new("demo", "dataspace", RunMode::Reset).with_run_id(id);
        assert_eq!(identity.run_id, id);
        let json = serde_json::to_value(&identity).unwrap();
        assert_eq!(json["mode"], "reset");
    }
}
