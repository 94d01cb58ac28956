//! Scale actuation for dependant resources
//!
//! Dependants are addressed through their `/scale` subresource, so any kind
//! that exposes one (Deployments, StatefulSets, custom resources) works.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, ApiResource, DynamicObject, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::ResourceRef;
use crate::health::{Metrics, ScaleVerb};

/// Field manager used for scale patches
pub const FIELD_MANAGER: &str = "scale-watchdog";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScaleError {
    #[error("discovery of {resource} failed: {reason}")]
    Discovery { resource: String, reason: String },

    #[error("{verb} request for {resource} was throttled")]
    Throttled { resource: String, verb: &'static str },

    #[error("{verb} request for {resource} failed: {reason}")]
    Api {
        resource: String,
        verb: &'static str,
        reason: String,
    },

    #[error("{0} reports no replica count")]
    MissingReplicas(String),
}

/// Reads and updates replica counts of scalable resources
#[async_trait]
pub trait ScaleActuator: Send + Sync {
    async fn get_replicas(&self, resource: &ResourceRef) -> Result<i32, ScaleError>;

    async fn set_replicas(&self, resource: &ResourceRef, replicas: i32) -> Result<(), ScaleError>;
}

/// Answers whether a dependant resource currently exists
pub trait DependantLookup: Send + Sync {
    /// `None` while the backing cache has not synced
    fn is_present(&self, resource: &ResourceRef) -> Option<bool>;
}

/// Scale actuator backed by the Kubernetes `/scale` subresource
pub struct KubeScaleActuator {
    client: Client,
    metrics: Arc<Metrics>,
    resources: RwLock<HashMap<(String, String, String), ApiResource>>,
}

impl KubeScaleActuator {
    pub fn new(client: Client, metrics: Arc<Metrics>) -> Self {
        Self {
            client,
            metrics,
            resources: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve the API resource of a kind once and remember it
    async fn api_resource(&self, resource: &ResourceRef) -> Result<ApiResource, ScaleError> {
        let cache_key = (
            resource.group.clone(),
            resource.version.clone(),
            resource.kind.clone(),
        );
        if let Some(ar) = self.resources.read().await.get(&cache_key) {
            return Ok(ar.clone());
        }

        self.metrics.record_scale_request(ScaleVerb::Discovery);
        let (ar, _caps) = kube::discovery::pinned_kind(&self.client, &resource.gvk())
            .await
            .map_err(|e| {
                if is_throttled(&e) {
                    self.metrics.record_throttled(ScaleVerb::Discovery);
                }
                ScaleError::Discovery {
                    resource: resource.to_string(),
                    reason: e.to_string(),
                }
            })?;
        debug!(kind = %resource.kind, plural = %ar.plural, "discovered scalable kind");

        self.resources.write().await.insert(cache_key, ar.clone());
        Ok(ar)
    }

    async fn api(&self, resource: &ResourceRef) -> Result<Api<DynamicObject>, ScaleError> {
        let ar = self.api_resource(resource).await?;
        Ok(Api::namespaced_with(
            self.client.clone(),
            &resource.namespace,
            &ar,
        ))
    }

    fn api_error(&self, resource: &ResourceRef, verb: ScaleVerb, error: kube::Error) -> ScaleError {
        if is_throttled(&error) {
            self.metrics.record_throttled(verb);
            return ScaleError::Throttled {
                resource: resource.to_string(),
                verb: verb.as_str(),
            };
        }
        ScaleError::Api {
            resource: resource.to_string(),
            verb: verb.as_str(),
            reason: error.to_string(),
        }
    }
}

fn is_throttled(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(e) if e.code == 429)
}

#[async_trait]
impl ScaleActuator for KubeScaleActuator {
    async fn get_replicas(&self, resource: &ResourceRef) -> Result<i32, ScaleError> {
        let api = self.api(resource).await?;

        self.metrics.record_scale_request(ScaleVerb::Get);
        let scale = api
            .get_scale(&resource.name)
            .await
            .map_err(|e| self.api_error(resource, ScaleVerb::Get, e))?;

        // A zero count is omitted from the serialized spec
        scale
            .spec
            .map(|spec| spec.replicas.unwrap_or(0))
            .ok_or_else(|| ScaleError::MissingReplicas(resource.to_string()))
    }

    async fn set_replicas(&self, resource: &ResourceRef, replicas: i32) -> Result<(), ScaleError> {
        let api = self.api(resource).await?;
        let patch = json!({ "spec": { "replicas": replicas } });

        self.metrics.record_scale_request(ScaleVerb::Update);
        api.patch_scale(
            &resource.name,
            &PatchParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..Default::default()
            },
            &Patch::Merge(&patch),
        )
        .await
        .map_err(|e| self.api_error(resource, ScaleVerb::Update, e))?;

        Ok(())
    }
}
