//! Credential resolution for probe paths
//!
//! Each probe path names a Secret that carries a kubeconfig. Resolving it
//! yields a client configuration plus a revision, so the controller can tell
//! when the credential content changed and the prober has to be recreated.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::reflector::{ObjectRef, Store};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::health::{CacheResource, Metrics};

/// Secret data key holding the kubeconfig
pub const KUBECONFIG_KEY: &str = "kubeconfig";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("secret {0} not found")]
    NotFound(String),

    #[error("secret {name} could not be decoded: {reason}")]
    Decode { name: String, reason: String },

    #[error("secret cache has not synced yet")]
    NotSynced,
}

/// Usable client configuration for one probe path
#[derive(Clone, Debug)]
pub struct ResolvedCredential {
    pub config: kube::Config,
    /// Digest of the kubeconfig bytes, so metadata-only edits keep it stable
    pub revision: String,
}

/// Turns a named secret into a client configuration
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(
        &self,
        namespace: &str,
        secret_name: &str,
    ) -> Result<ResolvedCredential, CredentialError>;
}

/// Resolves kubeconfig secrets from the local Secret watch cache
pub struct SecretStoreResolver {
    store: Store<Secret>,
    synced: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
}

impl SecretStoreResolver {
    pub fn new(store: Store<Secret>, synced: Arc<AtomicBool>, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            synced,
            metrics,
        }
    }
}

#[async_trait]
impl CredentialResolver for SecretStoreResolver {
    async fn resolve(
        &self,
        namespace: &str,
        secret_name: &str,
    ) -> Result<ResolvedCredential, CredentialError> {
        if !self.synced.load(Ordering::Acquire) {
            return Err(CredentialError::NotSynced);
        }

        self.metrics.record_cache_lookup(CacheResource::Secrets);
        let secret = self
            .store
            .get(&ObjectRef::new(secret_name).within(namespace))
            .ok_or_else(|| CredentialError::NotFound(format!("{}/{}", namespace, secret_name)))?;

        credential_from_secret(&secret).await
    }
}

/// Build a client configuration from a kubeconfig secret
pub async fn credential_from_secret(secret: &Secret) -> Result<ResolvedCredential, CredentialError> {
    let name = format!(
        "{}/{}",
        secret.metadata.namespace.as_deref().unwrap_or_default(),
        secret.metadata.name.as_deref().unwrap_or_default()
    );
    let decode_error = |reason: String| CredentialError::Decode {
        name: name.clone(),
        reason,
    };

    let raw = secret
        .data
        .as_ref()
        .and_then(|data| data.get(KUBECONFIG_KEY))
        .ok_or_else(|| decode_error(format!("missing data key {:?}", KUBECONFIG_KEY)))?;
    let text = std::str::from_utf8(&raw.0).map_err(|e| decode_error(e.to_string()))?;

    let kubeconfig = Kubeconfig::from_yaml(text).map_err(|e| decode_error(e.to_string()))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| decode_error(e.to_string()))?;

    Ok(ResolvedCredential {
        config,
        revision: hex::encode(Sha256::digest(&raw.0)),
    })
}
