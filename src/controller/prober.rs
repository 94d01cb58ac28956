//! Prober for one probe target
//!
//! A prober runs one probe loop per configured path. Each loop owns its
//! path's streak counters and reports the path state after every result to
//! the prober's evaluator, which owns the applied scale state. Captured
//! replica counts go to the controller's [`ReplicaCaptures`], which outlives
//! any single prober.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ProbePath, ProbeTarget, ResourceRef};
use crate::controller::captures::ReplicaCaptures;
use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::controller::state_machine::{PathState, PathTracker, ScaleState, Thresholds, decide};
use crate::resources::probe::{ProbeFailure, ProbeOutcome};
use crate::resources::scale::ScaleError;

/// A dependant resource and its configured restore count
#[derive(Clone, Debug)]
struct Dependant {
    resource: ResourceRef,
    restore_replicas: Option<i32>,
}

/// Path state after one probe result
#[derive(Clone, Copy, Debug)]
struct PathReport {
    path: ProbePath,
    state: PathState,
}

/// How a scale pass ended when no actuator call failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ScalePass {
    Applied,
    Cancelled,
}

pub struct Prober {
    key: String,
    namespace: String,
    target: ProbeTarget,
    dependants: Vec<Dependant>,
    ctx: Arc<Context>,
    cancel: CancellationToken,
    scale_state: ScaleState,
    /// Replica counts seen right before scaling down, for dependants
    /// without an explicit restore count
    captures: Arc<ReplicaCaptures>,
}

impl Prober {
    pub fn new(
        key: impl Into<String>,
        namespace: impl Into<String>,
        target: ProbeTarget,
        ctx: Arc<Context>,
        captures: Arc<ReplicaCaptures>,
    ) -> Result<Self> {
        let namespace = namespace.into();
        let dependants = target
            .dependant_scales
            .iter()
            .map(|d| {
                Ok(Dependant {
                    resource: d.resource_ref(&namespace)?,
                    restore_replicas: d.replicas,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            key: key.into(),
            namespace,
            target,
            dependants,
            ctx,
            cancel: CancellationToken::new(),
            scale_state: ScaleState::Unknown,
            captures,
        })
    }

    /// Start the prober; it runs until `cancel` fires
    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        self.cancel = cancel;
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(key = %self.key, "prober started");

        let (tx, mut rx) = mpsc::channel::<PathReport>(16);
        let mut loops = JoinSet::new();
        // A path without credentials never diverges
        let mut internal = PathState::Up;
        let mut external = PathState::Up;

        for path in [ProbePath::Internal, ProbePath::External] {
            let Some(secret) = self.target.probe.secret_for(path) else {
                debug!(key = %self.key, %path, "path not configured, treated as Up");
                continue;
            };
            match path {
                ProbePath::Internal => internal = PathState::Unknown,
                ProbePath::External => external = PathState::Unknown,
            }
            let probe_loop = ProbeLoop {
                key: self.key.clone(),
                path,
                namespace: self.namespace.clone(),
                secret: secret.to_string(),
                initial_delay: self.target.probe.initial_delay(),
                period: self.target.probe.period(),
                timeout: self.target.probe.timeout(),
                thresholds: Thresholds::new(
                    self.target.probe.success_threshold(),
                    self.target.probe.failure_threshold(),
                ),
                ctx: self.ctx.clone(),
                cancel: self.cancel.clone(),
                reports: tx.clone(),
            };
            loops.spawn(probe_loop.run());
        }
        drop(tx);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                report = rx.recv() => {
                    let Some(report) = report else { break };
                    match report.path {
                        ProbePath::Internal => internal = report.state,
                        ProbePath::External => external = report.state,
                    }
                    self.evaluate(internal, external).await;
                }
            }
        }

        // In-flight probes are abandoned
        loops.shutdown().await;
        info!(key = %self.key, "prober stopped");
    }

    /// Bring the dependants in line with the current path states
    async fn evaluate(&mut self, internal: PathState, external: PathState) {
        let Some(desired) = decide(internal, external) else {
            return;
        };
        if desired == self.scale_state {
            return;
        }

        info!(
            key = %self.key,
            %internal,
            %external,
            from = %self.scale_state,
            to = %desired,
            "scale state change required"
        );

        let result = match desired {
            ScaleState::Down => self.scale_down().await,
            ScaleState::Up => self.scale_up().await,
            ScaleState::Unknown => return,
        };

        match result {
            Ok(ScalePass::Applied) => {
                info!(key = %self.key, state = %desired, "dependants scaled");
                self.scale_state = desired;
            }
            Ok(ScalePass::Cancelled) => {
                debug!(key = %self.key, "scale pass abandoned after cancellation");
            }
            Err(e) => {
                // Some dependants may have moved; any later decision runs a full pass
                warn!(key = %self.key, state = %desired, "failed to scale dependants: {}", e);
                self.scale_state = ScaleState::Unknown;
            }
        }
    }

    /// Scale every dependant to zero, capturing its replica count first
    async fn scale_down(&mut self) -> Result<ScalePass, ScaleError> {
        let mut first_error = None;

        for dependant in self.dependants.clone() {
            if self.cancel.is_cancelled() {
                return Ok(ScalePass::Cancelled);
            }
            let current = match self.ctx.actuator.get_replicas(&dependant.resource).await {
                Ok(current) => current,
                Err(e) => {
                    warn!(key = %self.key, resource = %dependant.resource, "failed to read replicas: {}", e);
                    first_error.get_or_insert(e);
                    continue;
                }
            };

            if dependant.restore_replicas.is_none() {
                self.captures.record(&dependant.resource, current);
            }
            if current == 0 {
                debug!(key = %self.key, resource = %dependant.resource, "already scaled to zero");
                continue;
            }

            if self.cancel.is_cancelled() {
                return Ok(ScalePass::Cancelled);
            }
            match self.ctx.actuator.set_replicas(&dependant.resource, 0).await {
                Ok(()) => info!(
                    key = %self.key,
                    resource = %dependant.resource,
                    from = current,
                    "scaled dependant to zero"
                ),
                Err(e) => {
                    warn!(key = %self.key, resource = %dependant.resource, "failed to scale down: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(ScalePass::Applied),
        }
    }

    /// Restore every dependant that is at zero
    async fn scale_up(&mut self) -> Result<ScalePass, ScaleError> {
        let mut first_error = None;

        for dependant in self.dependants.clone() {
            if self.cancel.is_cancelled() {
                return Ok(ScalePass::Cancelled);
            }
            let current = match self.ctx.actuator.get_replicas(&dependant.resource).await {
                Ok(current) => current,
                Err(e) => {
                    warn!(key = %self.key, resource = %dependant.resource, "failed to read replicas: {}", e);
                    first_error.get_or_insert(e);
                    continue;
                }
            };
            if current > 0 {
                // Running already, possibly scaled by someone else
                continue;
            }

            let restore = dependant
                .restore_replicas
                .or_else(|| self.captures.get(&dependant.resource));
            let Some(replicas) = restore else {
                warn!(
                    key = %self.key,
                    resource = %dependant.resource,
                    "no restore count known for dependant at zero replicas, leaving it"
                );
                continue;
            };

            if self.cancel.is_cancelled() {
                return Ok(ScalePass::Cancelled);
            }
            match self
                .ctx
                .actuator
                .set_replicas(&dependant.resource, replicas)
                .await
            {
                Ok(()) => info!(
                    key = %self.key,
                    resource = %dependant.resource,
                    replicas,
                    "restored dependant"
                ),
                Err(e) => {
                    warn!(key = %self.key, resource = %dependant.resource, "failed to scale up: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(ScalePass::Applied),
        }
    }
}

/// Ticking probe loop for one path
struct ProbeLoop {
    key: String,
    path: ProbePath,
    namespace: String,
    secret: String,
    initial_delay: Duration,
    period: Duration,
    timeout: Duration,
    thresholds: Thresholds,
    ctx: Arc<Context>,
    cancel: CancellationToken,
    reports: mpsc::Sender<PathReport>,
}

impl ProbeLoop {
    async fn run(self) {
        let mut tracker = PathTracker::new(self.thresholds);
        let mut ticker = tokio::time::interval_at(Instant::now() + self.initial_delay, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                outcome = self.probe_once() => outcome,
            };

            let success = outcome.is_success();
            self.ctx.metrics.record_probe(self.path, success);
            if let ProbeOutcome::Failure(reason) = &outcome {
                debug!(key = %self.key, path = %self.path, "probe failed: {}", reason);
            }

            if let Some(previous) = tracker.record(success) {
                info!(
                    key = %self.key,
                    path = %self.path,
                    from = %previous,
                    to = %tracker.state(),
                    "probe path state changed"
                );
            }

            let report = PathReport {
                path: self.path,
                state: tracker.state(),
            };
            if self.reports.send(report).await.is_err() {
                return;
            }
        }
    }

    /// One bounded probe; any error counts as a failure
    async fn probe_once(&self) -> ProbeOutcome {
        let attempt = async {
            let credential = match self.ctx.resolver.resolve(&self.namespace, &self.secret).await {
                Ok(credential) => credential,
                Err(e) => return ProbeOutcome::Failure(ProbeFailure::Credential(e.to_string())),
            };
            self.ctx
                .executor
                .check(self.path, &credential.config, self.timeout)
                .await
        };

        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(outcome) => outcome,
            Err(_) => ProbeOutcome::Failure(ProbeFailure::Timeout(self.timeout)),
        }
    }
}
