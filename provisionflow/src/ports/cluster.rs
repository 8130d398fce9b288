//! Typed cluster objects and delete outcomes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::{ResourceRef, SecretValue};

/// Pod-template annotation recording the configuration a workload was
/// restarted with.
pub const CONFIG_HASH_ANNOTATION: &str = "provisionflow.io/config-hash";

/// A cluster object to create or patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Manifest {
    /// A namespace.
    Namespace {
        /// Namespace name.
        name: String,
    },
    /// A config object with plain-text entries.
    ConfigMap {
        /// Namespace.
        namespace: String,
        /// Object name.
        name: String,
        /// Entries.
        data: BTreeMap<String, String>,
    },
    /// A secret. Values are encoded by the adapter.
    Secret {
        /// Namespace.
        namespace: String,
        /// Secret name.
        name: String,
        /// Entries.
        data: BTreeMap<String, SecretValue>,
    },
}

impl Manifest {
    /// Returns the reference this manifest creates or patches.
    #[must_use]
    pub fn reference(&self) -> ResourceRef {
        match self {
            Self::Namespace { name } => ResourceRef::namespace(name.clone()),
            Self::ConfigMap {
                namespace, name, ..
            } => ResourceRef::config_map(namespace.clone(), name.clone()),
            Self::Secret {
                namespace, name, ..
            } => ResourceRef::secret(namespace.clone(), name.clone()),
        }
    }

    /// Returns the entry keys without values.
    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        match self {
            Self::Namespace { .. } => Vec::new(),
            Self::ConfigMap { data, .. } => data.keys().map(String::as_str).collect(),
            Self::Secret { data, .. } => data.keys().map(String::as_str).collect(),
        }
    }
}

/// Result of a delete or uninstall request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    /// The object was removed.
    Deleted,
    /// Nothing to remove.
    AlreadyAbsent,
    /// Removal was accepted and is still converging.
    Terminating,
}

impl DeleteOutcome {
    /// Returns true if the call issued a destructive change.
    #[must_use]
    pub fn did_delete(&self) -> bool {
        !matches!(self, Self::AlreadyAbsent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_reference() {
        let manifest = Manifest::ConfigMap {
            namespace: "demo".to_string(),
            name: "demo-registration-service-config".to_string(),
            data: BTreeMap::from([("SPRING_DATASOURCE_URL".to_string(), "jdbc:x".to_string())]),
        };
        assert_eq!(
            manifest.reference(),
            ResourceRef::config_map("demo", "demo-registration-service-config")
        );
        assert_eq!(manifest.keys(), vec!["SPRING_DATASOURCE_URL"]);
    }

    #[test]
    fn test_secret_manifest_debug_is_redacted() {
        let manifest = Manifest::Secret {
            namespace: "demo".to_string(),
            name: "demo-registration-service-secret".to_string(),
            data: BTreeMap::from([(
                "SPRING_DATASOURCE_PASSWORD".to_string(),
                SecretValue::new("hunter2"),
            )]),
        };
        assert!(!format!("{manifest:?}").contains("hunter2"));
    }

    #[test]
    fn test_delete_outcome() {
        assert!(DeleteOutcome::Deleted.did_delete());
        assert!(DeleteOutcome::Terminating.did_delete());
        assert!(!DeleteOutcome::AlreadyAbsent.did_delete());
    }
}
