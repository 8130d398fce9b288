//! Stage trait and the canonical stage library.
//!
//! A stage is the atomic unit of provisioning work: read-only predicates
//! over live state (`precondition`, `is_satisfied`, `verify`, `is_absent`)
//! plus the side-effecting `apply` and its destructive counterpart
//! `teardown`. Stages are constructed once per pipeline definition and never
//! mutated; the orchestrator tracks their outcomes externally.

mod artifact;
mod base;
mod config;
mod database;
mod namespace;
mod registration;
mod release;
mod result;
mod rollout;
mod secret;
mod vault;
mod verification;

pub use artifact::ValuesFileStage;
pub use base::{StageBase, StageBaseExt};
pub use config::RuntimeConfigStage;
pub use database::{DatabaseReadyStage, DatabaseStage};
pub use namespace::NamespaceStage;
pub use registration::RegistrationStage;
pub use release::ReleaseStage;
pub use result::{StageError, StageResult};
pub use rollout::RolloutStage;
pub use secret::SecretStage;
pub use vault::{VaultKeys, VaultStage, DEFAULT_KV_MOUNT};
pub use verification::{ReadinessCheck, VerificationStage};

use async_trait::async_trait;
use std::fmt::{self, Debug};
use std::time::Duration;

use crate::context::{ProbeContext, StageContext};
use crate::core::{ReadinessRule, ResourceRef, StageKind};
use crate::credentials::SecretRef;
use crate::errors::ProvisionError;
use crate::pipeline::RetryPolicy;

/// Result of evaluating a condition over live state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// The condition holds.
    Met,
    /// The condition does not hold, with a diagnostic naming what is missing.
    Unmet(String),
}

impl Condition {
    /// Creates an unmet condition.
    #[must_use]
    pub fn unmet(reason: impl Into<String>) -> Self {
        Self::Unmet(reason.into())
    }

    /// Returns true if the condition holds.
    #[must_use]
    pub fn is_met(&self) -> bool {
        matches!(self, Self::Met)
    }

    /// Checks that `reference` satisfies `rule`.
    ///
    /// # Errors
    ///
    /// Propagates probe errors.
    pub async fn require(
        ctx: &ProbeContext,
        reference: &ResourceRef,
        rule: &ReadinessRule,
    ) -> Result<Self, ProvisionError> {
        if ctx.probe().is_ready(reference, rule).await? {
            Ok(Self::Met)
        } else {
            Ok(Self::Unmet(format!("{reference} is not {rule}")))
        }
    }

    /// Returns the first unmet condition, or `Met`.
    #[must_use]
    pub fn all(conditions: impl IntoIterator<Item = Self>) -> Self {
        conditions
            .into_iter()
            .find(|c| !c.is_met())
            .unwrap_or(Self::Met)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Met => write!(f, "met"),
            Self::Unmet(reason) => f.write_str(reason),
        }
    }
}

/// Which strategy an `apply` invocation uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// The normal strategy.
    Primary {
        /// Time budget for this attempt.
        timeout: Duration,
    },
    /// The degraded, more conservative strategy.
    Fallback {
        /// Time budget for this attempt.
        timeout: Duration,
    },
}

/// Upper bound on the slack the orchestrator grants past an attempt's budget.
pub const MAX_APPLY_GRACE: Duration = Duration::from_secs(30);

impl ApplyMode {
    /// Returns the time budget.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        match self {
            Self::Primary { timeout } | Self::Fallback { timeout } => *timeout,
        }
    }

    /// Returns when the orchestrator abandons the attempt: the budget plus a
    /// tenth of it, capped at [`MAX_APPLY_GRACE`]. A tool given the budget as
    /// its own timeout gets to report its failure first.
    #[must_use]
    pub fn deadline(&self) -> Duration {
        let budget = self.timeout();
        budget + (budget / 10).min(MAX_APPLY_GRACE)
    }

    /// Returns true for the fallback strategy.
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }
}

/// Trait for provisioning stages.
///
/// `apply` must be safe to re-run after a partial failure: create only
/// what is absent, patch what exists. `teardown` must treat an absent
/// object as success.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the stage name, unique within a pipeline.
    fn name(&self) -> &str;

    /// Returns the kind of resource this stage manages.
    fn kind(&self) -> StageKind {
        StageKind::Custom
    }

    /// Returns the names of stages that must succeed or be skipped first.
    fn depends_on(&self) -> &[String] {
        &[]
    }

    /// Returns the retry and fallback policy.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::once()
    }

    /// Secrets that must resolve before `apply` may run.
    fn required_secrets(&self) -> Vec<SecretRef> {
        Vec::new()
    }

    /// Secrets that must resolve before `teardown` may run.
    fn teardown_secrets(&self) -> Vec<SecretRef> {
        Vec::new()
    }

    /// Checks that the environment is ready for this stage.
    async fn precondition(&self, _ctx: &ProbeContext) -> Result<Condition, ProvisionError> {
        Ok(Condition::Met)
    }

    /// Returns true if the stage's effect already holds.
    async fn is_satisfied(&self, ctx: &ProbeContext) -> Result<bool, ProvisionError>;

    /// Performs the side effect.
    async fn apply(&self, ctx: &StageContext, mode: ApplyMode) -> Result<(), ProvisionError>;

    /// Confirms the effect after `apply`.
    async fn verify(&self, ctx: &ProbeContext) -> Result<Condition, ProvisionError> {
        if self.is_satisfied(ctx).await? {
            Ok(Condition::Met)
        } else {
            Ok(Condition::unmet("post-condition does not hold"))
        }
    }

    /// Returns true if nothing remains for `teardown` to remove.
    ///
    /// Stages without a destructive counterpart are always absent.
    async fn is_absent(&self, _ctx: &ProbeContext) -> Result<bool, ProvisionError> {
        Ok(true)
    }

    /// Removes the stage's effect.
    async fn teardown(&self, _ctx: &StageContext) -> Result<(), ProvisionError> {
        Ok(())
    }
}
