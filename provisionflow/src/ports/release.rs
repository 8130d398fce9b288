//! Typed requests for the package-deployment tool.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Label the deployment tool stamps on every object a release owns.
pub const RELEASE_INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

/// Status reported for a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseStatus {
    /// Installed and healthy as far as the tool knows.
    Deployed,
    /// The last operation failed.
    Failed,
    /// An install is in progress or was interrupted.
    PendingInstall,
    /// An upgrade is in progress or was interrupted.
    PendingUpgrade,
    /// A rollback is in progress or was interrupted.
    PendingRollback,
    /// An uninstall is in progress.
    Uninstalling,
    /// Replaced by a newer revision.
    Superseded,
    /// Anything the tool reports that we do not model.
    Unknown(String),
}

impl ReleaseStatus {
    /// Parses the tool's status string.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "deployed" => Self::Deployed,
            "failed" => Self::Failed,
            "pending-install" => Self::PendingInstall,
            "pending-upgrade" => Self::PendingUpgrade,
            "pending-rollback" => Self::PendingRollback,
            "uninstalling" => Self::Uninstalling,
            "superseded" => Self::Superseded,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Returns true for a deployed release.
    #[must_use]
    pub fn is_deployed(&self) -> bool {
        matches!(self, Self::Deployed)
    }
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deployed => write!(f, "deployed"),
            Self::Failed => write!(f, "failed"),
            Self::PendingInstall => write!(f, "pending-install"),
            Self::PendingUpgrade => write!(f, "pending-upgrade"),
            Self::PendingRollback => write!(f, "pending-rollback"),
            Self::Uninstalling => write!(f, "uninstalling"),
            Self::Superseded => write!(f, "superseded"),
            Self::Unknown(s) => write!(f, "{s}"),
        }
    }
}

/// An upgrade-or-install request for a named release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseInstall {
    /// Release name.
    pub release: String,
    /// Target namespace.
    pub namespace: String,
    /// Chart directory.
    pub chart_dir: PathBuf,
    /// Values files, relative to the chart directory unless absolute.
    pub values_files: Vec<PathBuf>,
    /// How long the tool may wait for resources and hooks.
    pub timeout: Duration,
    /// Whether lifecycle hooks run.
    pub hooks: bool,
    /// Whether the tool may create the namespace.
    pub create_namespace: bool,
}

impl ReleaseInstall {
    /// Creates a request with hooks enabled and a five minute timeout.
    #[must_use]
    pub fn new(
        release: impl Into<String>,
        namespace: impl Into<String>,
        chart_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            release: release.into(),
            namespace: namespace.into(),
            chart_dir: chart_dir.into(),
            values_files: Vec::new(),
            timeout: Duration::from_secs(300),
            hooks: true,
            create_namespace: true,
        }
    }

    /// Adds a values file.
    #[must_use]
    pub fn with_values_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.values_files.push(path.into());
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enables or disables hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: bool) -> Self {
        self.hooks = hooks;
        self
    }

    /// Renders the argument vector for `helm`.
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "upgrade".to_string(),
            "--install".to_string(),
            self.release.clone(),
            self.chart_dir.display().to_string(),
            "-n".to_string(),
            self.namespace.clone(),
        ];
        if self.create_namespace {
            args.push("--create-namespace".to_string());
        }
        for values in &self.values_files {
            let path = if values.is_absolute() {
                values.clone()
            } else {
                self.chart_dir.join(values)
            };
            args.push("-f".to_string());
            args.push(path.display().to_string());
        }
        args.push("--timeout".to_string());
        args.push(format!("{}s", self.timeout.as_secs()));
        if !self.hooks {
            args.push("--no-hooks".to_string());
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_status_parse() {
        assert_eq!(ReleaseStatus::parse("deployed"), ReleaseStatus::Deployed);
        assert_eq!(ReleaseStatus::parse("pending-install"), ReleaseStatus::PendingInstall);
        assert_eq!(
            ReleaseStatus::parse("weird"),
            ReleaseStatus::Unknown("weird".to_string())
        );
        assert_eq!(ReleaseStatus::PendingUpgrade.to_string(), "pending-upgrade");
    }

    #[test]
    fn test_install_args_with_hooks() {
        let request = ReleaseInstall::new("common-srvs", "common-srvs", "/work/common")
            .with_values_file("values.yaml");

        assert_eq!(
            request.to_args(),
            vec![
                "upgrade",
                "--install",
                "common-srvs",
                "/work/common",
                "-n",
                "common-srvs",
                "--create-namespace",
                "-f",
                "/work/common/values.yaml",
                "--timeout",
                "300s",
            ]
        );
    }

    #[test]
    fn test_install_args_fallback() {
        let request = ReleaseInstall::new("common-srvs", "common-srvs", "/work/common")
            .with_hooks(false)
            .with_timeout(Duration::from_secs(1200));
        let args = request.to_args();
        assert!(args.ends_with(&["--timeout".to_string(), "1200s".to_string(), "--no-hooks".to_string()]));
    }
}
