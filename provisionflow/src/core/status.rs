//! Stage kinds, lifecycle states and outcomes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of resource a stage manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// A cluster namespace.
    Namespace,
    /// A generated credentials secret.
    Secret,
    /// Database server reachability.
    Readiness,
    /// A database and its owning role.
    Database,
    /// A package-deployed release.
    Release,
    /// Runtime configuration objects consumed by a workload.
    Config,
    /// A workload rollout.
    Rollout,
    /// A participant registration row.
    Registration,
    /// Post-deployment verification checks.
    Verification,
    /// Secrets-engine server unseal and mounts.
    SecretsEngine,
    /// A file rendered onto the operator's machine.
    Artifact,
    /// Anything else.
    Custom,
}

impl Default for StageKind {
    fn default() -> Self {
        Self::Custom
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Namespace => write!(f, "namespace"),
            Self::Secret => write!(f, "secret"),
            Self::Readiness => write!(f, "readiness"),
            Self::Database => write!(f, "database"),
            Self::Release => write!(f, "release"),
            Self::Config => write!(f, "config"),
            Self::Rollout => write!(f, "rollout"),
            Self::Registration => write!(f, "registration"),
            Self::Verification => write!(f, "verification"),
            Self::SecretsEngine => write!(f, "secrets_engine"),
            Self::Artifact => write!(f, "artifact"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

/// Per-stage lifecycle state during a provisioning run.
///
/// `NotStarted -> (PreconditionFailed | Skipped | Applying | Failed)`,
/// `Applying -> (Succeeded | Retrying)`,
/// `Retrying -> (Succeeded | FallbackApplying | Failed)`,
/// `FallbackApplying -> (Succeeded | Failed)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Not evaluated yet.
    NotStarted,
    /// The precondition did not hold.
    PreconditionFailed,
    /// The effect already held.
    Skipped,
    /// First apply attempt in flight.
    Applying,
    /// Primary strategy is being retried.
    Retrying,
    /// The degraded fallback strategy is in flight.
    FallbackApplying,
    /// The effect now holds.
    Succeeded,
    /// Both tiers were exhausted, or a structural error occurred.
    Failed,
}

impl StageState {
    /// Returns true if no further transition is possible.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::PreconditionFailed | Self::Skipped | Self::Succeeded | Self::Failed
        )
    }

    /// Returns true if moving from `self` to `next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        use StageState::{
            Applying, FallbackApplying, Failed, NotStarted, PreconditionFailed, Retrying,
            Skipped, Succeeded,
        };
        match self {
            NotStarted => matches!(next, PreconditionFailed | Skipped | Applying | Failed),
            Applying => matches!(next, Succeeded | Retrying | Failed),
            Retrying => matches!(next, Succeeded | FallbackApplying | Failed),
            FallbackApplying => matches!(next, Succeeded | Failed),
            PreconditionFailed | Skipped | Succeeded | Failed => false,
        }
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::PreconditionFailed => "precondition_failed",
            Self::Skipped => "skipped",
            Self::Applying => "applying",
            Self::Retrying => "retrying",
            Self::FallbackApplying => "fallback_applying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Final outcome of a stage within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    /// The effect already held; nothing was done.
    Skipped,
    /// Applied on the first attempt.
    Succeeded,
    /// Applied after at least one retry or the fallback.
    Retried,
    /// The precondition did not hold.
    PreconditionFailed,
    /// The stage could not be brought to its desired state.
    Failed,
}

impl StageOutcome {
    /// Returns true if later stages may depend on this one.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Skipped | Self::Succeeded | Self::Retried)
    }

    /// Returns true if the stage performed side effects.
    #[must_use]
    pub fn did_work(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Retried)
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Skipped => "skipped",
            Self::Succeeded => "succeeded",
            Self::Retried => "retried",
            Self::PreconditionFailed => "precondition_failed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Records the state transitions a stage goes through during one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTracker {
    state: StageState,
    history: Vec<StageState>,
}

impl Default for StageTracker {
    fn default() -> Self {
        Self {
            state: StageState::NotStarted,
            history: vec![StageState::NotStarted],
        }
    }
}

impl StageTracker {
    /// Creates a tracker in `NotStarted`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> StageState {
        self.state
    }

    /// Returns every state visited, in order.
    #[must_use]
    pub fn history(&self) -> &[StageState] {
        &self.history
    }

    /// Moves to `next`. Illegal transitions are ignored and logged.
    ///
    /// Returns true if the transition was applied.
    pub fn transition(&mut self, next: StageState) -> bool {
        if self.state == next && next == StageState::Retrying {
            return true;
        }
        if !self.state.can_transition_to(next) {
            tracing::warn!(from = %self.state, to = %next, "Ignoring illegal stage transition");
            return false;
        }
        self.state = next;
        self.history.push(next);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_kind_display() {
        assert_eq!(StageKind::Release.to_string(), "release");
        assert_eq!(StageKind::Database.to_string(), "database");
        assert_eq!(StageKind::default(), StageKind::Custom);
    }

    #[test]
    fn test_terminal_states() {
        assert!(StageState::Skipped.is_terminal());
        assert!(StageState::PreconditionFailed.is_terminal());
        assert!(StageState::Failed.is_terminal());
        assert!(!StageState::Retrying.is_terminal());
        assert!(!StageState::NotStarted.is_terminal());
    }

    #[test]
    fn test_no_transition_out_of_terminal() {
        for terminal in [
            StageState::Skipped,
            StageState::Succeeded,
            StageState::Failed,
            StageState::PreconditionFailed,
        ] {
            assert!(!terminal.can_transition_to(StageState::Applying));
            assert!(!terminal.can_transition_to(StageState::Succeeded));
        }
    }

    #[test]
    fn test_tracker_fallback_path() {
        let mut tracker = StageTracker::new();
        assert!(tracker.transition(StageState::Applying));
        assert!(tracker.transition(StageState::Retrying));
        assert!(tracker.transition(StageState::Retrying));
        assert!(tracker.transition(StageState::FallbackApplying));
        assert!(tracker.transition(StageState::Succeeded));

        assert_eq!(
            tracker.history(),
            &[
                StageState::NotStarted,
                StageState::Applying,
                StageState::Retrying,
                StageState::FallbackApplying,
                StageState::Succeeded,
            ]
        );
    }

    #[test]
    fn test_tracker_rejects_illegal() {
        let mut tracker = StageTracker::new();
        assert!(!tracker.transition(StageState::FallbackApplying));
        assert_eq!(tracker.state(), StageState::NotStarted);
    }

    #[test]
    fn test_outcome_success() {
        assert!(StageOutcome::Skipped.is_success());
        assert!(StageOutcome::Retried.is_success());
        assert!(!StageOutcome::Failed.is_success());
        assert!(!StageOutcome::PreconditionFailed.is_success());
        assert!(!StageOutcome::Skipped.did_work());
    }

    #[test]
    fn test_outcome_serialize() {
        let json = serde_json::to_string(&StageOutcome::PreconditionFailed).unwrap();
        assert_eq!(json, r#""precondition_failed""#);
    }
}
