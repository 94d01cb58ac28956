//! Watch-based caches of Secrets and Deployments
//!
//! Each watcher keeps a reflector store current and forwards every change as
//! a [`ChangeEvent`] carrying just enough identity for the controller to find
//! the affected probe targets.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ResourceRef;
use crate::controller::ChangeEvent;
use crate::health::{CacheResource, Metrics};
use crate::resources::credentials::SecretStoreResolver;
use crate::resources::scale::DependantLookup;

/// Kind name of the dependants tracked by the Deployment cache
pub const DEPLOYMENT_KIND: &str = "Deployment";

/// Which change stream an object belongs to
#[derive(Clone, Copy, Debug)]
enum Stream {
    Credentials,
    Dependants,
}

/// Running watch caches for one namespace
pub struct ClusterCaches {
    pub secrets: Store<Secret>,
    pub deployments: Store<Deployment>,
    secrets_synced: Arc<AtomicBool>,
    deployments_synced: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl ClusterCaches {
    /// Start watching Secrets and Deployments in `namespace`.
    ///
    /// Change events are sent to `events`; the returned caches back the
    /// credential resolver and dependant lookup.
    pub fn start(client: Client, namespace: &str, events: mpsc::Sender<ChangeEvent>) -> Self {
        let secrets_synced = Arc::new(AtomicBool::new(false));
        let deployments_synced = Arc::new(AtomicBool::new(false));

        let (secrets, secrets_handle) = spawn_watch::<Secret>(
            Api::namespaced(client.clone(), namespace),
            Stream::Credentials,
            secrets_synced.clone(),
            events.clone(),
        );
        let (deployments, deployments_handle) = spawn_watch::<Deployment>(
            Api::namespaced(client, namespace),
            Stream::Dependants,
            deployments_synced.clone(),
            events,
        );

        info!(namespace, "Started Secret and Deployment watchers");

        Self {
            secrets,
            deployments,
            secrets_synced,
            deployments_synced,
            handles: vec![secrets_handle, deployments_handle],
        }
    }

    /// Wait until both stores hold a complete initial listing
    pub async fn wait_until_ready(&self) -> Result<(), reflector::store::WriterDropped> {
        self.secrets.wait_until_ready().await?;
        self.deployments.wait_until_ready().await?;
        Ok(())
    }

    pub fn credential_resolver(&self, metrics: Arc<Metrics>) -> SecretStoreResolver {
        SecretStoreResolver::new(self.secrets.clone(), self.secrets_synced.clone(), metrics)
    }

    pub fn dependant_lookup(&self, metrics: Arc<Metrics>) -> DeploymentLookup {
        DeploymentLookup {
            store: self.deployments.clone(),
            synced: self.deployments_synced.clone(),
            metrics,
        }
    }

    /// Stop the watchers
    pub fn shutdown(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

fn spawn_watch<K>(
    api: Api<K>,
    stream: Stream,
    synced: Arc<AtomicBool>,
    events: mpsc::Sender<ChangeEvent>,
) -> (Store<K>, JoinHandle<()>)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone + Send + Sync,
{
    let (reader, writer) = reflector::store();
    let watch = watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect(writer);

    let handle = tokio::spawn(async move {
        let mut watch = std::pin::pin!(watch);
        while let Some(event) = watch.next().await {
            let change = match event {
                Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                    Some(applied(stream, &obj))
                }
                Ok(watcher::Event::Delete(obj)) => Some(deleted(stream, &obj)),
                Ok(watcher::Event::Init) => None,
                Ok(watcher::Event::InitDone) => {
                    // A relist may have missed deletions, so every target is rechecked
                    synced.store(true, Ordering::Release);
                    debug!(?stream, "watch cache synced");
                    Some(ChangeEvent::Resync)
                }
                Err(e) => {
                    warn!(?stream, "watch error: {}", e);
                    None
                }
            };

            if let Some(change) = change
                && events.send(change).await.is_err()
            {
                debug!(?stream, "event receiver dropped, stopping watcher");
                break;
            }
        }
    });

    (reader, handle)
}

fn applied<K: Resource>(stream: Stream, obj: &K) -> ChangeEvent {
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    match stream {
        Stream::Credentials => ChangeEvent::CredentialApplied { namespace, name },
        Stream::Dependants => ChangeEvent::DependantApplied {
            namespace,
            kind: DEPLOYMENT_KIND.to_string(),
            name,
        },
    }
}

fn deleted<K: Resource>(stream: Stream, obj: &K) -> ChangeEvent {
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    match stream {
        Stream::Credentials => ChangeEvent::CredentialDeleted { namespace, name },
        Stream::Dependants => ChangeEvent::DependantDeleted {
            namespace,
            kind: DEPLOYMENT_KIND.to_string(),
            name,
        },
    }
}

/// Dependant lookup backed by the Deployment watch cache.
///
/// Only Deployments are cached; other scalable kinds are assumed present and
/// left to the scale actuator to report if they are missing.
pub struct DeploymentLookup {
    store: Store<Deployment>,
    synced: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
}

impl DependantLookup for DeploymentLookup {
    fn is_present(&self, resource: &ResourceRef) -> Option<bool> {
        if resource.kind != DEPLOYMENT_KIND {
            return Some(true);
        }
        if !self.synced.load(Ordering::Acquire) {
            return None;
        }

        self.metrics.record_cache_lookup(CacheResource::Deployments);
        let key = ObjectRef::<Deployment>::new(&resource.name).within(&resource.namespace);
        Some(self.store.get(&key).is_some())
    }
}
