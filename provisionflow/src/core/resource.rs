//! References to externally managed resources and their observed state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::credentials::SecretRef;
use crate::ports::Identifier;

/// The external system owning a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalSystem {
    /// The cluster control plane.
    Cluster,
    /// The package-deployment tool.
    Releases,
    /// The relational database.
    Database,
}

impl fmt::Display for ExternalSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cluster => write!(f, "cluster"),
            Self::Releases => write!(f, "releases"),
            Self::Database => write!(f, "database"),
        }
    }
}

/// A typed reference to a resource in one of the external systems.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceRef {
    /// A cluster namespace.
    Namespace {
        /// Namespace name.
        name: String,
    },
    /// A replicated workload (deployment).
    Workload {
        /// Namespace.
        namespace: String,
        /// Workload name.
        name: String,
    },
    /// A single pod.
    Pod {
        /// Namespace.
        namespace: String,
        /// Pod name.
        name: String,
    },
    /// A config object.
    ConfigMap {
        /// Namespace.
        namespace: String,
        /// Object name.
        name: String,
    },
    /// A cluster secret.
    Secret {
        /// Namespace.
        namespace: String,
        /// Secret name.
        name: String,
    },
    /// A deployed release.
    Release {
        /// Namespace.
        namespace: String,
        /// Release name.
        name: String,
    },
    /// A database role.
    Role {
        /// Role name.
        name: Identifier,
    },
    /// A database.
    Database {
        /// Database name.
        name: Identifier,
    },
    /// A table inside a database.
    Table {
        /// The database holding the table.
        database: Identifier,
        /// Schema name.
        schema: Identifier,
        /// Table name.
        name: Identifier,
    },
    /// A participant registration row.
    Participant {
        /// The registration database.
        database: Identifier,
        /// Participant identifier.
        id: String,
    },
}

impl ResourceRef {
    /// Creates a namespace reference.
    #[must_use]
    pub fn namespace(name: impl Into<String>) -> Self {
        Self::Namespace { name: name.into() }
    }

    /// Creates a workload reference.
    #[must_use]
    pub fn workload(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Workload {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Creates a pod reference.
    #[must_use]
    pub fn pod(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Pod {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Creates a config map reference.
    #[must_use]
    pub fn config_map(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::ConfigMap {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Creates a secret reference.
    #[must_use]
    pub fn secret(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Secret {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Creates a release reference.
    #[must_use]
    pub fn release(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Release {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Returns the system that owns this resource.
    #[must_use]
    pub fn system(&self) -> ExternalSystem {
        match self {
            Self::Namespace { .. }
            | Self::Workload { .. }
            | Self::Pod { .. }
            | Self::ConfigMap { .. }
            | Self::Secret { .. } => ExternalSystem::Cluster,
            Self::Release { .. } => ExternalSystem::Releases,
            Self::Role { .. }
            | Self::Database { .. }
            | Self::Table { .. }
            | Self::Participant { .. } => ExternalSystem::Database,
        }
    }

    /// Returns the namespace for namespaced cluster resources.
    #[must_use]
    pub fn namespace_name(&self) -> Option<&str> {
        match self {
            Self::Namespace { name } => Some(name),
            Self::Workload { namespace, .. }
            | Self::Pod { namespace, .. }
            | Self::ConfigMap { namespace, .. }
            | Self::Secret { namespace, .. }
            | Self::Release { namespace, .. } => Some(namespace),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Namespace { name } => write!(f, "namespace/{name}"),
            Self::Workload { namespace, name } => write!(f, "deployment/{namespace}/{name}"),
            Self::Pod { namespace, name } => write!(f, "pod/{namespace}/{name}"),
            Self::ConfigMap { namespace, name } => write!(f, "configmap/{namespace}/{name}"),
            Self::Secret { namespace, name } => write!(f, "secret/{namespace}/{name}"),
            Self::Release { namespace, name } => write!(f, "release/{namespace}/{name}"),
            Self::Role { name } => write!(f, "role/{name}"),
            Self::Database { name } => write!(f, "database/{name}"),
            Self::Table {
                database,
                schema,
                name,
            } => write!(f, "table/{database}/{schema}.{name}"),
            Self::Participant { database, id } => write!(f, "participant/{database}/{id}"),
        }
    }
}

/// Waiting reasons that mark a container as structurally broken.
pub const CRASH_LOOP_SIGNATURES: &[&str] = &[
    "CrashLoopBackOff",
    "Error",
    "ImagePullBackOff",
    "ErrImagePull",
    "CreateContainerConfigError",
];

/// Observed status of a single container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    /// Container name.
    pub name: String,
    /// Whether the container reports ready.
    pub ready: bool,
    /// Reason the container is waiting or terminated, if any.
    pub reason: Option<String>,
    /// Number of restarts.
    pub restart_count: u32,
}

/// Observed status of a single pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodStatus {
    /// Pod name.
    pub name: String,
    /// Pod phase (`Pending`, `Running`, `Succeeded`, `Failed`).
    pub phase: String,
    /// Init container statuses.
    #[serde(default)]
    pub init_containers: Vec<ContainerStatus>,
    /// Main container statuses.
    #[serde(default)]
    pub containers: Vec<ContainerStatus>,
}

impl PodStatus {
    /// Returns the first crash-loop signature found in any container.
    #[must_use]
    pub fn crash_signature(&self) -> Option<&str> {
        self.init_containers
            .iter()
            .chain(self.containers.iter())
            .filter_map(|c| c.reason.as_deref())
            .find(|reason| CRASH_LOOP_SIGNATURES.contains(reason))
    }

    /// Returns true if the pod is running with every container ready.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.phase == "Running"
            && self.crash_signature().is_none()
            && self.containers.iter().all(|c| c.ready)
    }
}

/// Observed status of a workload and its pods.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    /// Desired replica count.
    pub desired_replicas: u32,
    /// Ready replica count.
    pub ready_replicas: u32,
    /// Pods owned by the workload.
    #[serde(default)]
    pub pods: Vec<PodStatus>,
}

impl WorkloadStatus {
    /// Returns the first crash-loop signature across all pods.
    #[must_use]
    pub fn crash_signature(&self) -> Option<&str> {
        self.pods.iter().find_map(PodStatus::crash_signature)
    }
}

/// A resource as observed in live state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// What was looked up.
    pub reference: ResourceRef,
    /// Lifecycle phase or status, when the system reports one.
    pub phase: Option<String>,
    /// Key/value payload (config data, encoded secret fields, owner).
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    /// Workload or pod status.
    pub workload: Option<WorkloadStatus>,
}

impl Resource {
    /// Creates a resource with no payload.
    #[must_use]
    pub fn new(reference: ResourceRef) -> Self {
        Self {
            reference,
            phase: None,
            data: BTreeMap::new(),
            workload: None,
        }
    }

    /// Sets the phase.
    #[must_use]
    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    /// Adds a data entry.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Sets the workload status.
    #[must_use]
    pub fn with_workload(mut self, workload: WorkloadStatus) -> Self {
        self.workload = Some(workload);
        self
    }
}

/// A system-defined rule for deciding whether a resource is ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessRule {
    /// The resource exists.
    Exists,
    /// The namespace exists and is not terminating.
    NamespaceActive,
    /// The pod is running with all containers ready and no crash-loop signature.
    PodRunning,
    /// The workload has at least `min_ready` ready replicas (and at least the
    /// desired count) and no pod shows a crash-loop signature.
    WorkloadAvailable {
        /// Minimum ready replicas.
        min_ready: u32,
    },
    /// The release reports deployed.
    ReleaseDeployed,
    /// The database server answers a trivial query.
    DatabaseReachable,
    /// The role can log into the database with the live secret.
    AcceptsLogin {
        /// The role logging in.
        role: Identifier,
        /// Where the role's password lives.
        password: SecretRef,
    },
    /// The workload's recent logs carry no fatal signature.
    NoFatalLogs {
        /// How many trailing lines to inspect.
        tail: usize,
    },
}

impl fmt::Display for ReadinessRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exists => write!(f, "present"),
            Self::NamespaceActive => write!(f, "active"),
            Self::PodRunning => write!(f, "running"),
            Self::WorkloadAvailable { min_ready } => {
                write!(f, "available with at least {min_ready} ready replica(s)")
            }
            Self::ReleaseDeployed => write!(f, "deployed"),
            Self::DatabaseReachable => write!(f, "reachable"),
            Self::AcceptsLogin { role, .. } => write!(f, "accepting logins for role {role}"),
            Self::NoFatalLogs { .. } => write!(f, "free of fatal log signatures"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(reason: Option<&str>, ready: bool) -> ContainerStatus {
        ContainerStatus {
            name: "main".to_string(),
            ready,
            reason: reason.map(str::to_string),
            restart_count: 0,
        }
    }

    #[test]
    fn test_ref_system() {
        assert_eq!(ResourceRef::namespace("demo").system(), ExternalSystem::Cluster);
        assert_eq!(
            ResourceRef::release("demo", "demo-dataspace-s1").system(),
            ExternalSystem::Releases
        );
        let db = ResourceRef::Database {
            name: Identifier::new("demo_rs").unwrap(),
        };
        assert_eq!(db.system(), ExternalSystem::Database);
        assert_eq!(db.namespace_name(), None);
    }

    #[test]
    fn test_ref_display() {
        assert_eq!(
            ResourceRef::workload("demo", "demo-registration-service").to_string(),
            "deployment/demo/demo-registration-service"
        );
    }

    #[test]
    fn test_pod_crash_signature_in_init_container() {
        let pod = PodStatus {
            name: "conn-0".to_string(),
            phase: "Pending".to_string(),
            init_containers: vec![container(Some("CrashLoopBackOff"), false)],
            containers: vec![container(None, false)],
        };
        assert_eq!(pod.crash_signature(), Some("CrashLoopBackOff"));
        assert!(!pod.is_running());
    }

    #[test]
    fn test_rule_display() {
        assert_eq!(
            ReadinessRule::WorkloadAvailable { min_ready: 1 }.to_string(),
            "available with at least 1 ready replica(s)"
        );
        assert_eq!(ReadinessRule::ReleaseDeployed.to_string(), "deployed");
    }

    #[test]
    fn test_pod_running() {
        let pod = PodStatus {
            name: "reg-0".to_string(),
            phase: "Running".to_string(),
            init_containers: vec![container(Some("Completed"), false)],
            containers: vec![container(None, true)],
        };
        assert!(pod.crash_signature().is_none());
        assert!(pod.is_running());
    }
}
