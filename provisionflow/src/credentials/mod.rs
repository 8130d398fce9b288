//! Credential resolution from live state.
//!
//! Every credential is read from the secrets store when a run first needs
//! it. Values defined when a pipeline was built are never used, because the
//! store may have been recreated with fresh generated values since then.
//! Resolved credentials are cached for the lifetime of one
//! [`CredentialResolver`], which the orchestrator creates per run.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::core::SecretValue;
use crate::errors::ProvisionError;
use crate::ports::SecretStore;

/// A reference to one field of a named secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    /// Namespace holding the secret.
    pub namespace: String,
    /// Secret name.
    pub name: String,
    /// Field within the secret.
    pub key: String,
}

impl SecretRef {
    /// Creates a secret reference.
    #[must_use]
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.namespace, self.name, self.key)
    }
}

/// A resolved credential.
#[derive(Debug, Clone)]
pub struct Credential {
    /// The field name.
    pub key: String,
    /// The decoded value.
    pub value: SecretValue,
    /// Where the value came from.
    pub source: SecretRef,
    /// When it was read.
    pub fetched_at: DateTime<Utc>,
}

/// Resolves [`SecretRef`]s against the live secrets store.
pub struct CredentialResolver {
    store: Arc<dyn SecretStore>,
    cache: RwLock<HashMap<SecretRef, Credential>>,
}

impl fmt::Debug for CredentialResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialResolver")
            .field("cached", &self.cache.read().len())
            .finish()
    }
}

impl CredentialResolver {
    /// Creates a resolver with an empty cache.
    #[must_use]
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolves a credential, reading the store on first use.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::SecretUnavailable`] if the secret or field
    /// does not exist, is empty, cannot be decoded, or the store cannot be read.
    pub async fn resolve(&self, secret: &SecretRef) -> Result<Credential, ProvisionError> {
        if let Some(cached) = self.cache.read().get(secret) {
            return Ok(cached.clone());
        }

        let unavailable = |reason: String| ProvisionError::SecretUnavailable {
            secret: secret.to_string(),
            reason,
        };

        let fields = self
            .store
            .fetch(&secret.namespace, &secret.name)
            .await
            .map_err(|err| unavailable(err.to_string()))?
            .ok_or_else(|| unavailable("secret does not exist".to_string()))?;

        let encoded = fields
            .get(&secret.key)
            .ok_or_else(|| unavailable(format!("field '{}' is missing", secret.key)))?;

        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|err| unavailable(format!("field is not valid base64: {err}")))?;
        let plain = String::from_utf8(bytes)
            .map_err(|_| unavailable("field is not valid UTF-8".to_string()))?;
        if plain.is_empty() {
            return Err(unavailable("field is empty".to_string()));
        }

        let credential = Credential {
            key: secret.key.clone(),
            value: SecretValue::new(plain),
            source: secret.clone(),
            fetched_at: Utc::now(),
        };
        debug!(
            secret = %secret,
            fingerprint = %credential.value.fingerprint(),
            "Resolved credential"
        );

        self.cache.write().insert(secret.clone(), credential.clone());
        Ok(credential)
    }

    /// Resolves and returns only the value.
    ///
    /// # Errors
    ///
    /// See [`CredentialResolver::resolve`].
    pub async fn value(&self, secret: &SecretRef) -> Result<SecretValue, ProvisionError> {
        Ok(self.resolve(secret).await?.value)
    }

    /// Drops every cached field of the named secret.
    ///
    /// Called after a stage creates or deletes the secret.
    pub fn invalidate(&self, namespace: &str, name: &str) {
        self.cache
            .write()
            .retain(|key, _| !(key.namespace == namespace && key.name == name));
    }

    /// Returns the number of cached credentials.
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.cache.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{CollaboratorError, ErrorKind};
    use crate::ports::MockSecretStore;
    use std::collections::BTreeMap;

    fn admin_ref() -> SecretRef {
        SecretRef::new("common-srvs", "common-srvs-postgresql", "postgres-password")
    }

    fn encoded(key: &str, value: &str) -> BTreeMap<String, String> {
        BTreeMap::from([(key.to_string(), STANDARD.encode(value))])
    }

    #[tokio::test]
    async fn test_resolve_decodes_and_caches() {
        let mut store = MockSecretStore::new();
        store
            .expect_fetch()
            .times(1)
            .returning(|_, _| Ok(Some(encoded("postgres-password", "s3cret"))));

        let resolver = CredentialResolver::new(Arc::new(store));
        let first = resolver.resolve(&admin_ref()).await.unwrap();
        let second = resolver.resolve(&admin_ref()).await.unwrap();

        assert_eq!(first.value.expose(), "s3cret");
        assert_eq!(first.key, "postgres-password");
        assert_eq!(second.fetched_at, first.fetched_at);
        assert_eq!(resolver.cached_len(), 1);
    }

    #[tokio::test]
    async fn test_missing_secret_is_unavailable() {
        let mut store = MockSecretStore::new();
        store.expect_fetch().returning(|_, _| Ok(None));

        let resolver = CredentialResolver::new(Arc::new(store));
        let err = resolver.resolve(&admin_ref()).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SecretUnavailable);
        assert!(err.to_string().contains("common-srvs/common-srvs-postgresql#postgres-password"));
        assert_eq!(resolver.cached_len(), 0);
    }

    #[tokio::test]
    async fn test_missing_field_and_bad_encoding() {
        let mut store = MockSecretStore::new();
        store.expect_fetch().returning(|_, name| {
            if name == "other" {
                Ok(Some(encoded("unrelated", "x")))
            } else {
                Ok(Some(BTreeMap::from([(
                    "postgres-password".to_string(),
                    "%%not-base64%%".to_string(),
                )])))
            }
        });
        let resolver = CredentialResolver::new(Arc::new(store));

        let err = resolver
            .resolve(&SecretRef::new("ns", "other", "postgres-password"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing"));

        let err = resolver.resolve(&admin_ref()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SecretUnavailable);
    }

    #[tokio::test]
    async fn test_store_error_maps_to_unavailable() {
        let mut store = MockSecretStore::new();
        store
            .expect_fetch()
            .returning(|_, _| Err(CollaboratorError::unavailable("kubectl", "connection refused")));

        let resolver = CredentialResolver::new(Arc::new(store));
        let err = resolver.resolve(&admin_ref()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SecretUnavailable);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_invalidate_forces_reread() {
        let mut store = MockSecretStore::new();
        store
            .expect_fetch()
            .times(2)
            .returning(|_, _| Ok(Some(encoded("postgres-password", "v"))));

        let resolver = CredentialResolver::new(Arc::new(store));
        resolver.resolve(&admin_ref()).await.unwrap();
        resolver.invalidate("common-srvs", "common-srvs-postgresql");
        assert_eq!(resolver.cached_len(), 0);
        resolver.resolve(&admin_ref()).await.unwrap();
    }

    #[test]
    fn test_credential_debug_redacted() {
        let credential = Credential {
            key: "password".to_string(),
            value: SecretValue::new("topsecret"),
            source: admin_ref(),
            fetched_at: Utc::now(),
        };
        assert!(!format!("{credential:?}").contains("topsecret"));
    }
}
