//! Secrets-engine administration through the `vault` CLI inside its pod.
//!
//! Commands run via `kubectl exec`. Unseal shares and the root token are
//! written to stdin, so neither appears in any argument vector.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

use provisionflow::core::SecretValue;
use provisionflow::errors::CollaboratorError;
use provisionflow::ports::{
    CollaboratorResult, SealStatus, VaultEndpoint, VaultOperator, VaultStatus,
};

use super::{ProcessError, ToolRunner};

const SYSTEM: &str = "vault";

const ADDRESS: &str = "export VAULT_ADDR=\"${VAULT_ADDR:-http://127.0.0.1:8200}\"; ";

/// `vault status` exits 2 when sealed, which is an answer, not a failure.
const STATUS_SCRIPT: &str = "vault status -format=json; rc=$?; [ $rc -eq 2 ] && exit 0; exit $rc";

const UNSEAL_SCRIPT: &str = "exec vault operator unseal -format=json -";

/// Reads the token from stdin, then runs the command given as arguments.
const TOKEN_SCRIPT: &str = "IFS= read -r VAULT_TOKEN; export VAULT_TOKEN; exec \"$@\"";

#[derive(Debug, Deserialize)]
struct StatusDocument {
    #[serde(default)]
    initialized: bool,
    #[serde(default = "sealed_by_default")]
    sealed: bool,
}

const fn sealed_by_default() -> bool {
    true
}

impl From<StatusDocument> for SealStatus {
    fn from(doc: StatusDocument) -> Self {
        Self {
            initialized: doc.initialized,
            sealed: doc.sealed,
        }
    }
}

/// [`VaultStatus`] and [`VaultOperator`] backed by the `vault` CLI in the server pod.
#[derive(Debug, Clone)]
pub struct VaultCli {
    kubectl: ToolRunner,
}

impl VaultCli {
    /// Creates the adapter on top of a `kubectl` runner.
    #[must_use]
    pub fn new(kubectl: ToolRunner) -> Self {
        Self { kubectl }
    }

    async fn exec(
        &self,
        endpoint: &VaultEndpoint,
        script: &str,
        args: &[&str],
        stdin: Option<&SecretValue>,
    ) -> Result<String, ProcessError> {
        debug!(server = %endpoint, args = ?args, "Running vault command");
        let mut argv = vec![
            "exec".to_string(),
            "-i".to_string(),
            "-n".to_string(),
            endpoint.namespace.clone(),
            endpoint.pod.clone(),
            "--".to_string(),
            "sh".to_string(),
            "-c".to_string(),
            format!("{ADDRESS}{script}"),
            "sh".to_string(),
        ];
        argv.extend(args.iter().map(|a| (*a).to_string()));
        let input = stdin.map(|secret| format!("{}\n", secret.expose()));
        self.kubectl
            .run_with(&argv, input.as_deref().map(str::as_bytes), self.kubectl.timeout())
            .await
            .map(|output| output.stdout)
    }

    async fn with_token(
        &self,
        endpoint: &VaultEndpoint,
        token: &SecretValue,
        command: &[&str],
    ) -> CollaboratorResult<String> {
        self.exec(endpoint, TOKEN_SCRIPT, command, Some(token))
            .await
            .map_err(command_error)
    }
}

/// A missing pod means the server is down; a 4xx answer will not change on retry.
fn command_error(err: ProcessError) -> CollaboratorError {
    if err.is_not_found() {
        CollaboratorError::unavailable(SYSTEM, err.to_string())
    } else if err.stderr().contains("Code: 4") {
        CollaboratorError::rejected(SYSTEM, err.stderr().to_string())
    } else {
        err.into_collaborator(SYSTEM)
    }
}

fn parse_status(stdout: &str) -> CollaboratorResult<SealStatus> {
    serde_json::from_str::<StatusDocument>(stdout)
        .map(SealStatus::from)
        .map_err(|e| CollaboratorError::transient(SYSTEM, format!("unreadable status: {e}")))
}

fn parse_mounts(stdout: &str) -> CollaboratorResult<Vec<String>> {
    serde_json::from_str::<BTreeMap<String, serde_json::Value>>(stdout)
        .map(|mounts| mounts.into_keys().collect())
        .map_err(|e| CollaboratorError::transient(SYSTEM, format!("unreadable mount list: {e}")))
}

#[async_trait]
impl VaultStatus for VaultCli {
    async fn seal_status(&self, endpoint: &VaultEndpoint) -> CollaboratorResult<Option<SealStatus>> {
        match self.exec(endpoint, STATUS_SCRIPT, &[], None).await {
            Ok(stdout) => parse_status(&stdout).map(Some),
            Err(err) if err.is_not_found() || err.stderr().contains("connection refused") => Ok(None),
            Err(err) => Err(command_error(err)),
        }
    }

    async fn secret_engines(
        &self,
        endpoint: &VaultEndpoint,
        token: &SecretValue,
    ) -> CollaboratorResult<Vec<String>> {
        let stdout = self
            .with_token(endpoint, token, &["vault", "secrets", "list", "-format=json"])
            .await?;
        parse_mounts(&stdout)
    }
}

#[async_trait]
impl VaultOperator for VaultCli {
    async fn unseal(&self, endpoint: &VaultEndpoint, key: &SecretValue) -> CollaboratorResult<SealStatus> {
        let stdout = self
            .exec(endpoint, UNSEAL_SCRIPT, &[], Some(key))
            .await
            .map_err(command_error)?;
        parse_status(&stdout)
    }

    async fn enable_kv(
        &self,
        endpoint: &VaultEndpoint,
        token: &SecretValue,
        path: &str,
    ) -> CollaboratorResult<()> {
        let path_flag = format!("-path={}", path.trim_matches('/'));
        self.with_token(endpoint, token, &["vault", "secrets", "enable", path_flag.as_str(), "kv"])
            .await
            .map(|_| ())
    }

    async fn disable_engine(
        &self,
        endpoint: &VaultEndpoint,
        token: &SecretValue,
        path: &str,
    ) -> CollaboratorResult<()> {
        self.with_token(endpoint, token, &["vault", "secrets", "disable", path])
            .await
            .map(|_| ())
    }
}
