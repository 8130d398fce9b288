//! Read-only queries against live state.
//!
//! A [`StateProbe`] answers three questions about any [`ResourceRef`]: does
//! it exist, what does it look like, and is it ready under a
//! [`ReadinessRule`]. Probes never mutate external state. An object whose
//! parent does not exist (a workload in a missing namespace, a table in a
//! missing database) is simply absent, never an error.

mod live;

pub use live::{fatal_log_line, DatabaseAccess, LiveStateProbe};

use async_trait::async_trait;

use crate::core::{ReadinessRule, Resource, ResourceRef};
use crate::errors::ProvisionError;

/// Read-only access to live state.
#[async_trait]
pub trait StateProbe: Send + Sync {
    /// Returns the resource, or `None` if it is absent.
    async fn get(&self, reference: &ResourceRef) -> Result<Option<Resource>, ProvisionError>;

    /// Returns true if the resource exists.
    async fn exists(&self, reference: &ResourceRef) -> Result<bool, ProvisionError> {
        Ok(self.get(reference).await?.is_some())
    }

    /// Returns true if the resource satisfies the readiness rule.
    async fn is_ready(
        &self,
        reference: &ResourceRef,
        rule: &ReadinessRule,
    ) -> Result<bool, ProvisionError>;
}
