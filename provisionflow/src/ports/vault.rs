//! Secrets-engine server types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the secrets-engine server runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultEndpoint {
    /// Namespace of the server pod.
    pub namespace: String,
    /// Pod that administrative commands run in.
    pub pod: String,
}

impl VaultEndpoint {
    /// Creates an endpoint.
    #[must_use]
    pub fn new(namespace: impl Into<String>, pod: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
        }
    }
}

impl fmt::Display for VaultEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vault/{}/{}", self.namespace, self.pod)
    }
}

/// Seal state reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealStatus {
    /// Whether the server has been initialized.
    pub initialized: bool,
    /// Whether the server is sealed.
    pub sealed: bool,
}

impl SealStatus {
    /// Returns true if the server can serve requests.
    #[must_use]
    pub fn is_serving(&self) -> bool {
        self.initialized && !self.sealed
    }
}

/// Normalizes a mount path to the `path/` form the server lists.
#[must_use]
pub fn mount_path(path: &str) -> String {
    format!("{}/", path.trim_matches('/'))
}
