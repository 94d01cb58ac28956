//! Registry of running probers
//!
//! All membership changes go through one async mutex, and a replaced or
//! removed prober is fully stopped before the lock is released. That keeps at
//! most one live prober per key at any instant.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::health::Metrics;

/// Credential revisions a prober was started with
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CredentialRevision {
    pub internal: Option<String>,
    pub external: Option<String>,
}

/// What [`ProberRegistry::ensure`] did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Membership {
    /// A new prober was started
    Started,
    /// The old prober was stopped and a new one started with fresh credentials
    Restarted,
    /// A prober with the same credentials was already running
    Unchanged,
}

/// Handle to a running prober task
pub struct ProberHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    revision: CredentialRevision,
}

impl ProberHandle {
    /// Cancel the prober and wait for its loops to exit
    pub async fn stop(self, key: &str) {
        self.cancel.cancel();
        if let Err(e) = self.task.await
            && e.is_panic()
        {
            error!(key, "prober panicked: {}", e);
        }
    }
}

pub struct ProberRegistry {
    probers: Mutex<HashMap<String, ProberHandle>>,
    metrics: Arc<Metrics>,
}

impl ProberRegistry {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            probers: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Make sure a prober with the given credential revision runs for `key`.
    ///
    /// `start` receives the cancellation token of the new prober and must
    /// spawn it. It is only called when a prober has to be (re)started.
    pub async fn ensure<F>(&self, key: &str, revision: CredentialRevision, start: F) -> Membership
    where
        F: FnOnce(CancellationToken) -> JoinHandle<()>,
    {
        let mut probers = self.probers.lock().await;

        let membership = match probers.remove(key) {
            Some(existing) if existing.revision == revision => {
                probers.insert(key.to_string(), existing);
                return Membership::Unchanged;
            }
            Some(existing) => {
                info!(key, "credentials changed, restarting prober");
                existing.stop(key).await;
                Membership::Restarted
            }
            None => Membership::Started,
        };

        let cancel = CancellationToken::new();
        let task = start(cancel.clone());
        probers.insert(
            key.to_string(),
            ProberHandle {
                cancel,
                task,
                revision,
            },
        );

        self.metrics.record_prober_started();
        self.metrics.set_active_probers(probers.len());
        debug!(key, ?membership, "prober running");
        membership
    }

    /// Stop and remove the prober for `key`. Returns whether one was running.
    pub async fn remove(&self, key: &str) -> bool {
        let mut probers = self.probers.lock().await;
        let Some(handle) = probers.remove(key) else {
            return false;
        };
        handle.stop(key).await;
        self.metrics.set_active_probers(probers.len());
        true
    }

    /// Stop every prober and clear the registry. Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let mut probers = self.probers.lock().await;
        let drained: Vec<(String, ProberHandle)> = probers.drain().collect();
        let count = drained.len();

        // Cancel all first so they wind down in parallel
        for (_, handle) in &drained {
            handle.cancel.cancel();
        }
        futures::future::join_all(drained.into_iter().map(|(key, handle)| async move {
            handle.stop(&key).await;
        }))
        .await;

        self.metrics.set_active_probers(0);
        count
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.probers.lock().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.probers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Keys with a running prober, sorted
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.probers.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}
