//! Release management over `helm`.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

use provisionflow::errors::CollaboratorError;
use provisionflow::ports::{CollaboratorResult, DeleteOutcome, ReleaseInstall, ReleaseManager, ReleaseStatus};

use super::ToolRunner;

const SYSTEM: &str = "helm";

/// Time allowed on top of the tool's own `--timeout` before the process is
/// killed. Under the orchestrator the attempt deadline usually ends the call
/// first; helm's own timeout fires before either.
const KILL_GRACE: Duration = Duration::from_secs(30);

/// [`ReleaseManager`] backed by the `helm` binary.
#[derive(Debug, Clone)]
pub struct HelmReleases {
    runner: ToolRunner,
}

impl HelmReleases {
    /// Creates the adapter.
    #[must_use]
    pub fn new(runner: ToolRunner) -> Self {
        Self { runner }
    }
}

#[derive(Debug, Deserialize)]
struct StatusDocument {
    info: StatusInfo,
}

#[derive(Debug, Deserialize)]
struct StatusInfo {
    status: String,
}

fn parse_status(text: &str) -> CollaboratorResult<ReleaseStatus> {
    serde_json::from_str::<StatusDocument>(text)
        .map(|doc| ReleaseStatus::parse(&doc.info.status))
        .map_err(|e| CollaboratorError::transient(SYSTEM, format!("unparseable status: {e}")))
}

#[async_trait]
impl ReleaseManager for HelmReleases {
    async fn install(&self, request: &ReleaseInstall) -> CollaboratorResult<()> {
        info!(
            release = %request.release,
            namespace = %request.namespace,
            hooks = request.hooks,
            timeout_secs = request.timeout.as_secs(),
            "Installing release"
        );
        self.runner
            .run_with(&request.to_args(), None, request.timeout + KILL_GRACE)
            .await
            .map_err(|e| e.into_collaborator(SYSTEM))?;
        Ok(())
    }

    async fn uninstall(&self, namespace: &str, release: &str) -> CollaboratorResult<DeleteOutcome> {
        let args = vec![
            "uninstall".to_string(),
            release.to_string(),
            "-n".to_string(),
            namespace.to_string(),
        ];
        match self.runner.run(&args).await {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(err) if err.is_not_found() => Ok(DeleteOutcome::AlreadyAbsent),
            Err(err) => Err(err.into_collaborator(SYSTEM)),
        }
    }

    async fn status(&self, namespace: &str, release: &str) -> CollaboratorResult<Option<ReleaseStatus>> {
        let args = vec![
            "status".to_string(),
            release.to_string(),
            "-n".to_string(),
            namespace.to_string(),
            "-o".to_string(),
            "json".to_string(),
        ];
        match self.runner.run(&args).await {
            Ok(output) => parse_status(&output.stdout).map(Some),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into_collaborator(SYSTEM)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        let text = r#"{"name":"common-srvs","info":{"status":"deployed","description":"Install complete"},"version":1}"#;
        assert_eq!(parse_status(text).unwrap(), ReleaseStatus::Deployed);

        let text = r#"{"info":{"status":"pending-install"}}"#;
        assert_eq!(parse_status(text).unwrap(), ReleaseStatus::PendingInstall);
    }

    #[test]
    fn test_unparseable_status_is_transient() {
        let err = parse_status("Error: not json").unwrap_err();
        assert!(matches!(err, CollaboratorError::Transient { .. }));
    }
}
