//! Process-backed collaborators.
//!
//! Every adapter shells out to a command-line tool with an explicit argument
//! vector. Secret material travels on stdin, never in argv, so it cannot
//! leak through process listings or the command line we log.

mod helm;
mod kubectl;
mod psql;
mod vault;

pub use helm::HelmReleases;
pub use kubectl::KubectlCluster;
pub use psql::PsqlDatabase;
pub use vault::VaultCli;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use provisionflow::errors::CollaboratorError;
use provisionflow::ports::Collaborators;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Failures launching or running an external tool.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The tool could not be started.
    #[error("failed to start {program}: {source}")]
    Spawn {
        /// Program name.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The tool did not finish in time and was killed.
    #[error("{program} did not finish within {after:?}")]
    TimedOut {
        /// Program name.
        program: String,
        /// Budget that elapsed.
        after: Duration,
    },

    /// The tool exited with a non-zero status.
    #[error("{program} exited with {code:?}: {stderr}")]
    Failed {
        /// Program name.
        program: String,
        /// Exit code, if the process was not killed by a signal.
        code: Option<i32>,
        /// Trimmed standard error.
        stderr: String,
    },
}

impl ProcessError {
    /// Returns the captured standard error, if the tool ran.
    #[must_use]
    pub fn stderr(&self) -> &str {
        match self {
            Self::Failed { stderr, .. } => stderr,
            _ => "",
        }
    }

    /// Returns true if the tool reported a missing object.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        let stderr = self.stderr();
        stderr.contains("NotFound") || stderr.contains("not found")
    }

    /// Maps the failure to a collaborator error for `system`.
    #[must_use]
    pub fn into_collaborator(self, system: &str) -> CollaboratorError {
        let message = self.to_string();
        match &self {
            Self::Spawn { .. } => CollaboratorError::unavailable(system, message),
            Self::TimedOut { .. } => CollaboratorError::timeout(system, message),
            Self::Failed { stderr, .. } => classify(system, stderr, message),
        }
    }
}

const TIMEOUT_MARKERS: &[&str] = &[
    "timed out waiting for the condition",
    "context deadline exceeded",
    "i/o timeout",
];

const UNAVAILABLE_MARKERS: &[&str] = &[
    "connection refused",
    "Kubernetes cluster unreachable",
    "Unable to connect to the server",
    "the database system is starting up",
    "could not connect to server",
    "container not found",
    "ServiceUnavailable",
];

const REJECTED_MARKERS: &[&str] = &[
    "Forbidden",
    "Invalid value",
    "unknown flag",
    "path \"",
    "syntax error",
    "permission denied",
    "password authentication failed",
];

fn classify(system: &str, stderr: &str, message: String) -> CollaboratorError {
    if TIMEOUT_MARKERS.iter().any(|m| stderr.contains(m)) {
        CollaboratorError::timeout(system, message)
    } else if UNAVAILABLE_MARKERS.iter().any(|m| stderr.contains(m)) {
        CollaboratorError::unavailable(system, message)
    } else if REJECTED_MARKERS.iter().any(|m| stderr.contains(m)) {
        CollaboratorError::rejected(system, message)
    } else {
        CollaboratorError::transient(system, message)
    }
}

/// Captured output of a successful invocation.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// Standard output as UTF-8 (lossy).
    pub stdout: String,
}

/// Runs one external tool with a fixed set of leading arguments.
#[derive(Debug, Clone)]
pub struct ToolRunner {
    program: PathBuf,
    leading: Vec<String>,
    timeout: Duration,
}

impl ToolRunner {
    /// Creates a runner for `program`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            leading: Vec::new(),
            timeout,
        }
    }

    /// Adds arguments passed before every invocation (for example a context flag).
    #[must_use]
    pub fn with_leading_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.leading.extend(args);
        self
    }

    /// Returns the default per-invocation timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn name(&self) -> String {
        self.program
            .file_name()
            .map_or_else(|| self.program.display().to_string(), |n| n.to_string_lossy().into_owned())
    }

    /// Runs the tool and returns its output, failing on a non-zero exit.
    pub async fn run(&self, args: &[String]) -> Result<ProcessOutput, ProcessError> {
        self.run_with(args, None, self.timeout).await
    }

    /// Runs the tool with `stdin` piped in and an explicit timeout.
    ///
    /// `stdin` may carry secrets; it is never logged.
    pub async fn run_with(
        &self,
        args: &[String],
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<ProcessOutput, ProcessError> {
        let program = self.name();
        debug!(program = %program, args = ?args, "Running external tool");

        let mut command = Command::new(&self.program);
        command
            .args(&self.leading)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input)
                .await
                .map_err(|source| ProcessError::Spawn {
                    program: program.clone(),
                    source,
                })?;
            drop(pipe);
        }

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| ProcessError::Spawn {
                program: program.clone(),
                source,
            })?,
            Err(_) => {
                return Err(ProcessError::TimedOut {
                    program,
                    after: timeout,
                })
            }
        };

        if output.status.success() {
            Ok(ProcessOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            })
        } else {
            Err(ProcessError::Failed {
                program,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Where to find the tools and how long to wait for them.
#[derive(Debug, Clone)]
pub struct ToolConfig {
    /// Path to the cluster CLI.
    pub kubectl: PathBuf,
    /// Path to the package-deployment CLI.
    pub helm: PathBuf,
    /// Cluster context to target, if not the current one.
    pub context: Option<String>,
    /// Timeout for short control-plane calls.
    pub command_timeout: Duration,
}

impl ToolConfig {
    /// Wires the process adapters into a collaborator bundle.
    #[must_use]
    pub fn collaborators(&self) -> Collaborators {
        let kubectl = ToolRunner::new(&self.kubectl, self.command_timeout).with_leading_args(
            self.context
                .iter()
                .flat_map(|c| ["--context".to_string(), c.clone()]),
        );
        let helm = ToolRunner::new(&self.helm, self.command_timeout).with_leading_args(
            self.context
                .iter()
                .flat_map(|c| ["--kube-context".to_string(), c.clone()]),
        );
        let cluster = Arc::new(KubectlCluster::new(kubectl.clone()));
        Collaborators::new(
            cluster.clone(),
            Arc::new(HelmReleases::new(helm)),
            Arc::new(PsqlDatabase::new(kubectl.clone())),
            cluster,
        )
        .with_vault(Arc::new(VaultCli::new(kubectl)))
    }
}
