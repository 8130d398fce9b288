//! Secrets-engine server unseal and mount stage.

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{ApplyMode, Condition, Stage, StageBase, StageBaseExt};
use crate::context::{ProbeContext, StageContext};
use crate::core::{SecretValue, StageKind};
use crate::errors::ProvisionError;
use crate::pipeline::{wait_until, PollBudget, RetryPolicy};
use crate::ports::{mount_path, SealStatus, VaultEndpoint};

/// Mount the dataspace components store their secrets under.
pub const DEFAULT_KV_MOUNT: &str = "secret";

#[derive(Deserialize)]
struct KeysDocument {
    #[serde(default)]
    unseal_keys_hex: Vec<String>,
    #[serde(default)]
    unseal_keys_b64: Vec<String>,
    #[serde(default)]
    root_token: String,
}

/// Unseal key shares and root token written when the server was initialized.
pub struct VaultKeys {
    unseal: Vec<SecretValue>,
    root_token: SecretValue,
}

impl fmt::Debug for VaultKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultKeys")
            .field("shares", &self.unseal.len())
            .finish_non_exhaustive()
    }
}

impl VaultKeys {
    /// Parses an init document. Hex shares win over base64 ones.
    ///
    /// # Errors
    ///
    /// Returns `SecretUnavailable` if the document is malformed or lacks
    /// shares or a root token. The error never echoes the document.
    pub fn parse(text: &str, source: &str) -> Result<Self, ProvisionError> {
        let unavailable = |reason: &str| ProvisionError::SecretUnavailable {
            secret: source.to_string(),
            reason: reason.to_string(),
        };
        let doc: KeysDocument =
            serde_json::from_str(text).map_err(|_| unavailable("not a valid init document"))?;
        let shares = if doc.unseal_keys_hex.is_empty() {
            doc.unseal_keys_b64
        } else {
            doc.unseal_keys_hex
        };
        if shares.is_empty() || doc.root_token.is_empty() {
            return Err(unavailable("init document holds no unseal keys or root token"));
        }
        Ok(Self {
            unseal: shares.into_iter().map(SecretValue::new).collect(),
            root_token: SecretValue::new(doc.root_token),
        })
    }

    /// Reads and parses an init document.
    ///
    /// # Errors
    ///
    /// Returns `SecretUnavailable` if the file cannot be read or parsed.
    pub async fn load(path: &Path) -> Result<Self, ProvisionError> {
        let source = path.display().to_string();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ProvisionError::SecretUnavailable {
                secret: source.clone(),
                reason: e.to_string(),
            })?;
        Self::parse(&text, &source)
    }

    /// Returns the root token.
    #[must_use]
    pub fn root_token(&self) -> &SecretValue {
        &self.root_token
    }
}

/// Unseals the secrets-engine server and mounts the key/value engine the
/// dataspace components expect.
///
/// The server seals itself on every restart, so this stage is not satisfied
/// just because it succeeded in an earlier run. `apply` waits for the server
/// pod, since the release that creates it returns before the pod starts.
/// Reset unmounts the engine, which drops everything stored under it.
#[derive(Debug, Clone)]
pub struct VaultStage {
    base: StageBase,
    endpoint: VaultEndpoint,
    keys_file: PathBuf,
    mount: String,
    poll: PollBudget,
}

impl VaultStage {
    /// Creates a stage for the server at `endpoint`, unsealed with the
    /// shares in `keys_file`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        endpoint: VaultEndpoint,
        keys_file: impl Into<PathBuf>,
        poll: PollBudget,
    ) -> Self {
        Self {
            base: StageBase::new(name),
            endpoint,
            keys_file: keys_file.into(),
            mount: DEFAULT_KV_MOUNT.to_string(),
            poll,
        }
    }

    /// Mounts the engine at `path` instead of the default.
    #[must_use]
    pub fn with_mount(mut self, path: impl Into<String>) -> Self {
        self.mount = path.into();
        self
    }

    async fn status(&self, ctx: &ProbeContext) -> Result<Option<SealStatus>, ProvisionError> {
        Ok(ctx.vault()?.seal_status(&self.endpoint).await?)
    }

    async fn mounted(&self, ctx: &ProbeContext, keys: &VaultKeys) -> Result<bool, ProvisionError> {
        let engines = ctx
            .vault()?
            .secret_engines(&self.endpoint, keys.root_token())
            .await?;
        Ok(engines.contains(&mount_path(&self.mount)))
    }

    async fn check(&self, ctx: &ProbeContext) -> Result<Condition, ProvisionError> {
        match self.status(ctx).await? {
            None => Ok(Condition::unmet(format!("{} is not reachable", self.endpoint))),
            Some(status) if !status.is_serving() => {
                Ok(Condition::unmet(format!("{} is sealed", self.endpoint)))
            }
            Some(_) => {
                let keys = VaultKeys::load(&self.keys_file).await?;
                if self.mounted(ctx, &keys).await? {
                    Ok(Condition::Met)
                } else {
                    Ok(Condition::unmet(format!(
                        "{} is not mounted on {}",
                        mount_path(&self.mount),
                        self.endpoint
                    )))
                }
            }
        }
    }
}

impl StageBaseExt for VaultStage {
    fn base_mut(&mut self) -> &mut StageBase {
        &mut self.base
    }
}

#[async_trait]
impl Stage for VaultStage {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn kind(&self) -> StageKind {
        StageKind::SecretsEngine
    }

    fn depends_on(&self) -> &[String] {
        self.base.depends_on()
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.base.retry().clone()
    }

    async fn precondition(&self, ctx: &ProbeContext) -> Result<Condition, ProvisionError> {
        let prerequisites = self.base.check_prerequisites(ctx).await?;
        if !prerequisites.is_met() {
            return Ok(prerequisites);
        }
        if tokio::fs::metadata(&self.keys_file).await.is_err() {
            return Ok(Condition::unmet(format!(
                "init keys file {} does not exist",
                self.keys_file.display()
            )));
        }
        // A server that is up but uninitialized will never accept these keys.
        match self.status(ctx).await? {
            Some(status) if !status.initialized => {
                Ok(Condition::unmet(format!("{} is not initialized", self.endpoint)))
            }
            _ => Ok(Condition::Met),
        }
    }

    async fn is_satisfied(&self, ctx: &ProbeContext) -> Result<bool, ProvisionError> {
        Ok(self.check(ctx).await?.is_met())
    }

    async fn apply(&self, ctx: &StageContext, _mode: ApplyMode) -> Result<(), ProvisionError> {
        let keys = VaultKeys::load(&self.keys_file).await?;
        let vault = ctx.vault()?;
        let what = format!("{} reachable", self.endpoint);
        wait_until(&what, self.poll, || async {
            Ok(self.status(ctx.read_only()).await?.is_some())
        })
        .await?;
        let mut status = self
            .status(ctx.read_only())
            .await?
            .ok_or_else(|| ProvisionError::apply_failed(self.name(), format!("{} is not reachable", self.endpoint)))?;

        let mut shares = 0;
        for key in &keys.unseal {
            if !status.sealed {
                break;
            }
            status = vault.unseal(&self.endpoint, key).await?;
            shares += 1;
        }
        if status.sealed {
            return Err(ProvisionError::apply_failed(
                self.name(),
                format!("{} is still sealed after {shares} key shares", self.endpoint),
            ));
        }
        if shares > 0 {
            info!(server = %self.endpoint, shares, "Secrets engine unsealed");
        }

        if self.mounted(ctx.read_only(), &keys).await? {
            debug!(server = %self.endpoint, mount = %self.mount, "Engine already mounted");
        } else {
            vault
                .enable_kv(&self.endpoint, keys.root_token(), &self.mount)
                .await?;
            info!(server = %self.endpoint, mount = %mount_path(&self.mount), "Mounted key/value engine");
        }
        Ok(())
    }

    async fn verify(&self, ctx: &ProbeContext) -> Result<Condition, ProvisionError> {
        self.check(ctx).await
    }

    async fn is_absent(&self, ctx: &ProbeContext) -> Result<bool, ProvisionError> {
        // A sealed or missing server has no reachable mount to remove.
        match self.status(ctx).await? {
            Some(status) if status.is_serving() => {
                let keys = VaultKeys::load(&self.keys_file).await?;
                Ok(!self.mounted(ctx, &keys).await?)
            }
            _ => Ok(true),
        }
    }

    async fn teardown(&self, ctx: &StageContext) -> Result<(), ProvisionError> {
        let keys = VaultKeys::load(&self.keys_file).await?;
        ctx.vault()?
            .disable_engine(&self.endpoint, keys.root_token(), &self.mount)
            .await?;
        info!(server = %self.endpoint, mount = %mount_path(&self.mount), "Unmounted key/value engine");
        Ok(())
    }
}
