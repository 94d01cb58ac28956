pub mod config;
pub mod controller;
pub mod health;
pub mod resources;

pub use config::{ProbeGroup, ProbePath, ProbeTarget, ResourceRef, Settings};
pub use controller::{
    BackoffConfig, ChangeEvent, Context, Controller, Error, ReconcileOutcome, Result,
    validate_group,
};
pub use health::{HealthState, Metrics};

use std::sync::Arc;

use kube::Client;
use tokio::sync::mpsc;

use resources::{ClusterCaches, KubeScaleActuator, VersionProbe};

/// Capacity of the channel between the watch caches and the controller
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Build the controller context backed by live cluster clients.
///
/// Credentials and dependant presence are served from the watch caches; scale
/// reads and writes go straight to the API server.
pub fn cluster_context(client: Client, caches: &ClusterCaches, metrics: Arc<Metrics>) -> Context {
    Context::new(
        Arc::new(caches.credential_resolver(metrics.clone())),
        Arc::new(VersionProbe),
        Arc::new(KubeScaleActuator::new(client, metrics.clone())),
        Arc::new(caches.dependant_lookup(metrics.clone())),
        metrics,
    )
}

/// Feed change events to the controller until every sender is gone.
///
/// Runs for the lifetime of the process, leader or not; the controller drops
/// events itself while it is not leading.
pub async fn forward_events(controller: Arc<Controller>, mut events: mpsc::Receiver<ChangeEvent>) {
    tracing::info!(
        namespace = %controller.group().namespace,
        targets = controller.group().probes.len(),
        "Forwarding change events to the controller"
    );

    while let Some(event) = events.recv().await {
        controller.handle_event(event).await;
    }

    tracing::warn!("Change event stream ended");
}
