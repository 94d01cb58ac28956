//! Reconciliation of prober membership
//!
//! Change events are mapped to target keys and queued. Workers pop keys and
//! bring the registry in line with what the caches say right now: a prober
//! runs for every eligible key and for no other. The whole loop only runs
//! while this process leads; [`Controller::activate`] and
//! [`Controller::deactivate`] are wired to the leader election.

use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ProbeGroup, ProbePath, ProbeTarget};
use crate::controller::captures::ReplicaCaptures;
use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::prober::Prober;
use crate::controller::registry::{CredentialRevision, Membership, ProberRegistry};
use crate::controller::work_queue::WorkQueue;
use crate::resources::credentials::CredentialError;

/// A change observed in one of the watched resource streams
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeEvent {
    CredentialApplied {
        namespace: String,
        name: String,
    },
    CredentialDeleted {
        namespace: String,
        name: String,
    },
    DependantApplied {
        namespace: String,
        kind: String,
        name: String,
    },
    DependantDeleted {
        namespace: String,
        kind: String,
        name: String,
    },
    /// Recheck every target
    Resync,
}

/// Outcome of reconciling one key
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A prober runs for the key
    Running(Membership),
    /// No prober runs for the key
    Stopped { reason: String },
}

/// Whether a target may have a prober right now
#[derive(Clone, Debug, PartialEq, Eq)]
enum Eligibility {
    Eligible(CredentialRevision),
    Ineligible(String),
}

/// Workers and queue of one leadership term
struct Term {
    queue: Arc<WorkQueue>,
    workers: Vec<JoinHandle<()>>,
}

pub struct Controller {
    group: Arc<ProbeGroup>,
    ctx: Arc<Context>,
    registry: Arc<ProberRegistry>,
    /// Survives prober restarts and leadership terms
    captures: Arc<ReplicaCaptures>,
    workers: usize,
    backoff: BackoffConfig,
    /// Queue of the current term, `None` while not leading
    queue: RwLock<Option<Arc<WorkQueue>>>,
    /// Serializes activate and deactivate
    term: Mutex<Option<Term>>,
}

impl Controller {
    pub fn new(
        group: Arc<ProbeGroup>,
        ctx: Arc<Context>,
        workers: usize,
        backoff: BackoffConfig,
    ) -> Self {
        let registry = Arc::new(ProberRegistry::new(ctx.metrics.clone()));
        Self {
            group,
            ctx,
            registry,
            captures: Arc::new(ReplicaCaptures::new()),
            workers: workers.max(1),
            backoff,
            queue: RwLock::new(None),
            term: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<ProberRegistry> {
        &self.registry
    }

    pub fn captures(&self) -> &Arc<ReplicaCaptures> {
        &self.captures
    }

    pub fn group(&self) -> &ProbeGroup {
        &self.group
    }

    pub async fn is_active(&self) -> bool {
        self.term.lock().await.is_some()
    }

    /// Start reconciling after leadership was acquired.
    ///
    /// Always resyncs every configured key: nothing learned during an earlier
    /// term is trusted. Calling it while active does nothing.
    pub async fn activate(self: &Arc<Self>) {
        let mut term = self.term.lock().await;
        if term.is_some() {
            debug!("controller already active");
            return;
        }

        let queue = Arc::new(WorkQueue::new(self.backoff.clone()));
        let workers = (0..self.workers)
            .map(|id| {
                let controller = Arc::clone(self);
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { controller.run_worker(id, queue).await })
            })
            .collect();

        for key in self.group.keys() {
            queue.add(key);
        }
        *self.queue.write().await = Some(Arc::clone(&queue));
        *term = Some(Term { queue, workers });

        info!(
            workers = self.workers,
            targets = self.group.probes.len(),
            "controller activated"
        );
    }

    /// Stop reconciling and stop every prober after leadership was lost.
    ///
    /// Returns once no prober is left running. Calling it while inactive does
    /// nothing.
    pub async fn deactivate(&self) {
        let mut term = self.term.lock().await;
        let Some(current) = term.take() else {
            debug!("controller already inactive");
            return;
        };

        *self.queue.write().await = None;
        current.queue.shut_down();
        // A worker in the middle of a reconcile could still start a prober
        for worker in current.workers {
            if let Err(e) = worker.await
                && e.is_panic()
            {
                error!("reconcile worker panicked: {}", e);
            }
        }

        let stopped = self.registry.stop_all().await;
        info!(stopped, "controller deactivated");
    }

    /// Queue the keys affected by a change. Dropped while not leading.
    pub async fn handle_event(&self, event: ChangeEvent) {
        let keys = match &event {
            ChangeEvent::CredentialApplied { namespace, name }
            | ChangeEvent::CredentialDeleted { namespace, name } => {
                self.group.keys_for_secret(namespace, name)
            }
            ChangeEvent::DependantApplied {
                namespace,
                kind,
                name,
            }
            | ChangeEvent::DependantDeleted {
                namespace,
                kind,
                name,
            } => self.group.keys_for_dependant(namespace, kind, name),
            ChangeEvent::Resync => self.group.keys(),
        };
        if keys.is_empty() {
            return;
        }

        let queue = self.queue.read().await;
        let Some(queue) = queue.as_ref() else {
            debug!(?event, "not leading, ignoring change");
            return;
        };
        for key in keys {
            debug!(%key, ?event, "queueing key");
            queue.add(key);
        }
    }

    async fn run_worker(&self, id: usize, queue: Arc<WorkQueue>) {
        debug!(worker = id, "reconcile worker started");
        while let Some(key) = queue.get().await {
            match self.reconcile(&key).await {
                Ok(outcome) => {
                    queue.forget(&key);
                    debug!(%key, ?outcome, "reconciled");
                }
                Err(e) if e.is_retryable() => {
                    let delay = queue.add_rate_limited(key.clone());
                    warn!(%key, ?delay, "reconcile failed, requeuing: {}", e);
                }
                Err(e) => {
                    queue.add_after(key.clone(), self.backoff.max_delay);
                    error!(
                        %key,
                        delay = ?self.backoff.max_delay,
                        "reconcile failed with a non-retryable error, requeuing: {}",
                        e
                    );
                }
            }
            queue.done(&key);
        }
        debug!(worker = id, "reconcile worker stopped");
    }

    /// Bring the prober for one key in line with current cluster state
    #[instrument(skip(self))]
    pub async fn reconcile(&self, key: &str) -> Result<ReconcileOutcome> {
        let Some(target) = self.group.target_for_key(key) else {
            self.registry.remove(key).await;
            return Ok(ReconcileOutcome::Stopped {
                reason: "not configured".to_string(),
            });
        };

        match self.eligibility(target).await? {
            Eligibility::Eligible(revision) => {
                let prober = Prober::new(
                    key,
                    self.group.namespace.clone(),
                    target.clone(),
                    Arc::clone(&self.ctx),
                    Arc::clone(&self.captures),
                )?;
                let membership = self
                    .registry
                    .ensure(key, revision, move |cancel| prober.spawn(cancel))
                    .await;
                if membership != Membership::Unchanged {
                    info!(?membership, "prober running");
                }
                Ok(ReconcileOutcome::Running(membership))
            }
            Eligibility::Ineligible(reason) => {
                if self.registry.remove(key).await {
                    info!(%reason, "prober stopped");
                }
                Ok(ReconcileOutcome::Stopped { reason })
            }
        }
    }

    /// Check credentials and dependants of a target
    async fn eligibility(&self, target: &ProbeTarget) -> Result<Eligibility> {
        let namespace = &self.group.namespace;
        let mut revision = CredentialRevision::default();

        for path in [ProbePath::Internal, ProbePath::External] {
            let Some(secret) = target.probe.secret_for(path) else {
                continue;
            };
            let resolved = match self.ctx.resolver.resolve(namespace, secret).await {
                Ok(resolved) => resolved,
                Err(e @ CredentialError::NotSynced) => return Err(e.into()),
                Err(e) => {
                    return Ok(Eligibility::Ineligible(format!(
                        "{} credential unavailable: {}",
                        path, e
                    )));
                }
            };
            match path {
                ProbePath::Internal => revision.internal = Some(resolved.revision),
                ProbePath::External => revision.external = Some(resolved.revision),
            }
        }

        let mut any_present = false;
        for dependant in &target.dependant_scales {
            let resource = dependant.resource_ref(namespace)?;
            match self.ctx.dependants.is_present(&resource) {
                Some(true) => {
                    any_present = true;
                    break;
                }
                Some(false) => {}
                None => {
                    return Err(Error::TransientError(
                        "dependant cache not synced".to_string(),
                    ));
                }
            }
        }
        if !any_present {
            return Ok(Eligibility::Ineligible(
                "no dependant resource present".to_string(),
            ));
        }

        Ok(Eligibility::Eligible(revision))
    }
}
