//! Error types for the provisionflow orchestrator.
//!
//! The taxonomy separates failures the pipeline may retry (the side-effecting
//! action failed, or its observable effect did not appear in time) from
//! structural failures that an operator has to fix before re-running.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Classification of a failure, used by reports and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A dependency's effect is not observably true.
    PreconditionFailed,
    /// The side-effecting action errored.
    ApplyFailed,
    /// The action returned success but the post-state does not hold.
    VerifyFailed,
    /// A credential could not be resolved from live state.
    SecretUnavailable,
    /// A bounded wait exceeded its budget.
    TimeoutExceeded,
    /// The run was cancelled between stages.
    Cancelled,
    /// The pipeline definition or configuration is invalid.
    Invalid,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PreconditionFailed => "precondition_failed",
            Self::ApplyFailed => "apply_failed",
            Self::VerifyFailed => "verify_failed",
            Self::SecretUnavailable => "secret_unavailable",
            Self::TimeoutExceeded => "timeout_exceeded",
            Self::Cancelled => "cancelled",
            Self::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

/// The main error type for provisioning operations.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// A stage's precondition does not hold against live state.
    #[error("Precondition failed for stage '{stage}': {condition}")]
    PreconditionFailed {
        /// The stage whose precondition failed.
        stage: String,
        /// The unmet condition, naming the missing resource.
        condition: String,
    },

    /// The stage's apply action failed.
    #[error("Apply failed for stage '{stage}': {message}")]
    ApplyFailed {
        /// The stage name.
        stage: String,
        /// What went wrong.
        message: String,
    },

    /// The apply action returned success but the post-condition does not hold.
    #[error("Verification failed for stage '{stage}': {message}")]
    VerifyFailed {
        /// The stage name.
        stage: String,
        /// The observed mismatch.
        message: String,
    },

    /// A credential could not be resolved.
    #[error("Secret unavailable: {secret}: {reason}")]
    SecretUnavailable {
        /// Display form of the secret reference.
        secret: String,
        /// Why resolution failed.
        reason: String,
    },

    /// A bounded wait or action exceeded its budget.
    #[error("Timeout exceeded after {:.1}s waiting for {what}", budget.as_secs_f64())]
    TimeoutExceeded {
        /// What was being waited for.
        what: String,
        /// The budget that was exceeded.
        budget: Duration,
    },

    /// The run was cancelled.
    #[error("Run cancelled: {0}")]
    Cancelled(String),

    /// An external collaborator returned an error.
    #[error("{0}")]
    Collaborator(#[from] CollaboratorError),

    /// The pipeline definition is invalid.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// The configuration is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),
}

impl ProvisionError {
    /// Creates an apply failure.
    #[must_use]
    pub fn apply_failed(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ApplyFailed {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Creates a verify failure.
    #[must_use]
    pub fn verify_failed(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::VerifyFailed {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Creates a precondition failure.
    #[must_use]
    pub fn precondition_failed(stage: impl Into<String>, condition: impl Into<String>) -> Self {
        Self::PreconditionFailed {
            stage: stage.into(),
            condition: condition.into(),
        }
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(what: impl Into<String>, budget: Duration) -> Self {
        Self::TimeoutExceeded {
            what: what.into(),
            budget,
        }
    }

    /// Returns the classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PreconditionFailed { .. } => ErrorKind::PreconditionFailed,
            Self::ApplyFailed { .. } => ErrorKind::ApplyFailed,
            Self::VerifyFailed { .. } => ErrorKind::VerifyFailed,
            Self::SecretUnavailable { .. } => ErrorKind::SecretUnavailable,
            Self::TimeoutExceeded { .. } => ErrorKind::TimeoutExceeded,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Collaborator(err) => match err {
                CollaboratorError::Timeout { .. } => ErrorKind::TimeoutExceeded,
                _ => ErrorKind::ApplyFailed,
            },
            Self::Validation(_) | Self::Config(_) => ErrorKind::Invalid,
        }
    }

    /// Returns true if the orchestrator may retry after this error.
    ///
    /// Precondition, credential, validation and cancellation errors are
    /// structural and surface immediately.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ApplyFailed { .. } | Self::VerifyFailed { .. } | Self::TimeoutExceeded { .. } => {
                true
            }
            Self::Collaborator(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Returns true if the primary strategy was refused outright, so
    /// repeating it is pointless but a different strategy may still work.
    #[must_use]
    pub fn needs_other_strategy(&self) -> bool {
        matches!(self, Self::Collaborator(CollaboratorError::Rejected { .. }))
    }
}

/// Errors returned by external collaborator capabilities.
#[derive(Debug, Clone, Error)]
pub enum CollaboratorError {
    /// The referenced object does not exist.
    #[error("{system}: not found: {target}")]
    NotFound {
        /// The collaborator.
        system: String,
        /// The missing object.
        target: String,
    },

    /// A transient failure, such as an object still terminating.
    #[error("{system}: transient failure: {message}")]
    Transient {
        /// The collaborator.
        system: String,
        /// The failure detail.
        message: String,
    },

    /// The collaborator gave up waiting.
    #[error("{system}: timed out: {message}")]
    Timeout {
        /// The collaborator.
        system: String,
        /// The failure detail.
        message: String,
    },

    /// The request was rejected outright.
    #[error("{system}: rejected: {message}")]
    Rejected {
        /// The collaborator.
        system: String,
        /// The failure detail.
        message: String,
    },

    /// The collaborator could not be reached.
    #[error("{system}: unavailable: {message}")]
    Unavailable {
        /// The collaborator.
        system: String,
        /// The failure detail.
        message: String,
    },
}

impl CollaboratorError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(system: impl Into<String>, target: impl Into<String>) -> Self {
        Self::NotFound {
            system: system.into(),
            target: target.into(),
        }
    }

    /// Creates a transient error.
    #[must_use]
    pub fn transient(system: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            system: system.into(),
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(system: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Timeout {
            system: system.into(),
            message: message.into(),
        }
    }

    /// Creates a rejection error.
    #[must_use]
    pub fn rejected(system: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            system: system.into(),
            message: message.into(),
        }
    }

    /// Creates an unavailable error.
    #[must_use]
    pub fn unavailable(system: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            system: system.into(),
            message: message.into(),
        }
    }

    /// Returns true if this is a not-found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

/// Metadata about a validation error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "PIPELINE-ORDER").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when pipeline validation fails.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional contract error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the contract error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the error code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read configuration {path}: {source}")]
    Read {
        /// The file path.
        path: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// A field holds an invalid value.
    #[error("Invalid configuration field '{field}': {reason}")]
    Invalid {
        /// Dotted path of the field.
        field: String,
        /// Why it is invalid.
        reason: String,
    },

    /// Two resources map to the same name.
    #[error("Resource name '{name}' is claimed by both {first} and {second}")]
    NameCollision {
        /// The colliding name.
        name: String,
        /// The first owner.
        first: String,
        /// The second owner.
        second: String,
    },
}

impl ConfigError {
    /// Creates an invalid-field error.
    #[must_use]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        let err = ProvisionError::precondition_failed("database", "namespace 'demo' missing");
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
        assert!(!err.is_retryable());

        let err = ProvisionError::apply_failed("release", "helm exited 1");
        assert_eq!(err.kind(), ErrorKind::ApplyFailed);
        assert!(err.is_retryable());

        let err = ProvisionError::timeout("postgres", Duration::from_secs(60));
        assert_eq!(err.kind(), ErrorKind::TimeoutExceeded);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_secret_unavailable_is_structural() {
        let err = ProvisionError::SecretUnavailable {
            secret: "common-srvs/common-srvs-postgresql#postgres-password".to_string(),
            reason: "not found".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::SecretUnavailable);
        assert!(!err.is_retryable());
        assert!(!err.needs_other_strategy());
    }

    #[test]
    fn test_collaborator_error_kinds() {
        let err: ProvisionError = CollaboratorError::timeout("helm", "post-install hook").into();
        assert_eq!(err.kind(), ErrorKind::TimeoutExceeded);
        assert!(err.is_retryable());

        let err: ProvisionError = CollaboratorError::rejected("postgres", "syntax error").into();
        assert_eq!(err.kind(), ErrorKind::ApplyFailed);
        assert!(!err.is_retryable());
        assert!(err.needs_other_strategy());
    }

    #[test]
    fn test_timeout_display() {
        let err = ProvisionError::timeout("workload demo/registration", Duration::from_millis(1500));
        assert_eq!(
            err.to_string(),
            "Timeout exceeded after 1.5s waiting for workload demo/registration"
        );
    }

    #[test]
    fn test_validation_error_code() {
        let err = PipelineValidationError::new("bad order").with_error_info(
            ContractErrorInfo::new("PIPELINE-ORDER", "bad order").with_fix_hint("reorder"),
        );
        assert_eq!(err.code(), Some("PIPELINE-ORDER"));
    }
}
