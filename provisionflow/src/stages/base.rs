//! Shared identity, ordering and policy for the canonical stages.

use crate::context::ProbeContext;
use crate::core::{ReadinessRule, ResourceRef};
use crate::errors::ProvisionError;
use crate::pipeline::RetryPolicy;

use super::Condition;

/// Name, dependencies, retry policy and live-state prerequisites of a stage.
#[derive(Debug, Clone)]
pub struct StageBase {
    name: String,
    depends_on: Vec<String>,
    retry: RetryPolicy,
    prerequisites: Vec<(ResourceRef, ReadinessRule)>,
}

impl StageBase {
    /// Creates a base with the default retry policy and no dependencies.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            retry: RetryPolicy::default(),
            prerequisites: Vec::new(),
        }
    }

    /// Returns the stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the dependency names.
    #[must_use]
    pub fn depends_on(&self) -> &[String] {
        &self.depends_on
    }

    /// Returns the retry policy.
    #[must_use]
    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Returns the live-state prerequisites.
    #[must_use]
    pub fn prerequisites(&self) -> &[(ResourceRef, ReadinessRule)] {
        &self.prerequisites
    }

    /// Adds dependencies.
    pub fn add_dependencies(&mut self, names: impl IntoIterator<Item = impl Into<String>>) {
        for name in names {
            let name = name.into();
            if !self.depends_on.contains(&name) {
                self.depends_on.push(name);
            }
        }
    }

    /// Replaces the retry policy.
    pub fn set_retry(&mut self, retry: RetryPolicy) {
        self.retry = retry;
    }

    /// Adds a prerequisite.
    pub fn add_prerequisite(&mut self, reference: ResourceRef, rule: ReadinessRule) {
        self.prerequisites.push((reference, rule));
    }

    /// Evaluates the prerequisites in order, stopping at the first unmet one.
    ///
    /// # Errors
    ///
    /// Propagates probe errors.
    pub async fn check_prerequisites(&self, ctx: &ProbeContext) -> Result<Condition, ProvisionError> {
        for (reference, rule) in &self.prerequisites {
            let condition = Condition::require(ctx, reference, rule).await?;
            if !condition.is_met() {
                return Ok(condition);
            }
        }
        Ok(Condition::Met)
    }
}

/// Builder methods shared by every stage that embeds a [`StageBase`].
pub trait StageBaseExt: Sized {
    /// Returns the embedded base.
    fn base_mut(&mut self) -> &mut StageBase;

    /// Declares dependencies on earlier stages.
    #[must_use]
    fn after(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.base_mut().add_dependencies(names);
        self
    }

    /// Sets the retry and fallback policy.
    #[must_use]
    fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.base_mut().set_retry(retry);
        self
    }

    /// Requires `reference` to satisfy `rule` before the stage may run.
    #[must_use]
    fn requires(mut self, reference: ResourceRef, rule: ReadinessRule) -> Self {
        self.base_mut().add_prerequisite(reference, rule);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Holder(StageBase);

    impl StageBaseExt for Holder {
        fn base_mut(&mut self) -> &mut StageBase {
            &mut self.0
        }
    }

    #[test]
    fn test_builder_methods() {
        let holder = Holder(StageBase::new("database"))
            .after(["namespace", "postgres-ready", "namespace"])
            .with_retry_policy(RetryPolicy::once())
            .requires(ResourceRef::namespace("demo"), ReadinessRule::NamespaceActive);

        assert_eq!(holder.0.name(), "database");
        assert_eq!(holder.0.depends_on(), &["namespace", "postgres-ready"]);
        assert_eq!(holder.0.retry().max_attempts, 1);
        assert_eq!(holder.0.prerequisites().len(), 1);
    }
}
