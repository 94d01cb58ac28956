//! Health server and Prometheus metrics
//!
//! Provides HTTP endpoints for:
//! - `/healthz` - Liveness probe (is the process alive?)
//! - `/readyz` - Readiness probe (are the watch caches synced?)
//! - `/metrics` - Prometheus metrics
//!
//! Metrics are fire-and-forget: nothing in the watchdog reads them back to
//! make a decision.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue, LabelValueEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

use crate::config::ProbePath;

/// Outcome label for probe counters
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ProbeResultLabel {
    Success,
    Failure,
}

impl ProbeResultLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeResultLabel::Success => "success",
            ProbeResultLabel::Failure => "failure",
        }
    }
}

/// Cached resource label for cache lookup counters
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum CacheResource {
    Secrets,
    Deployments,
}

impl CacheResource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheResource::Secrets => "secrets",
            CacheResource::Deployments => "deployments",
        }
    }
}

/// Verb label for scale client requests
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ScaleVerb {
    Discovery,
    Get,
    Update,
}

impl ScaleVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleVerb::Discovery => "discovery",
            ScaleVerb::Get => "GET",
            ScaleVerb::Update => "UPDATE",
        }
    }
}

impl EncodeLabelValue for ProbeResultLabel {
    fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
        EncodeLabelValue::encode(&self.as_str(), encoder)
    }
}

impl EncodeLabelValue for CacheResource {
    fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
        EncodeLabelValue::encode(&self.as_str(), encoder)
    }
}

impl EncodeLabelValue for ScaleVerb {
    fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
        EncodeLabelValue::encode(&self.as_str(), encoder)
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResultLabels {
    pub result: ProbeResultLabel,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResourceLabels {
    pub resource: CacheResource,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct VerbLabels {
    pub verb: ScaleVerb,
}

/// Shared metrics state
pub struct Metrics {
    /// Probers started
    pub probers_total: Counter,
    /// Probers currently running
    pub active_probers: Gauge,
    /// Lookups against the local watch caches
    pub get_from_cache_total: Family<ResourceLabels, Counter>,
    /// Internal probe outcomes
    pub internal_probes_total: Family<ResultLabels, Counter>,
    /// External probe outcomes
    pub external_probes_total: Family<ResultLabels, Counter>,
    /// Scale client requests
    pub scale_requests_total: Family<VerbLabels, Counter>,
    /// Scale client requests rejected by rate limiting
    pub throttled_scale_requests_total: Family<VerbLabels, Counter>,

    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let probers_total = Counter::default();
        registry.register(
            "scale_watchdog_probers",
            "Total number of probers started",
            probers_total.clone(),
        );

        let active_probers = Gauge::default();
        registry.register(
            "scale_watchdog_active_probers",
            "Number of probers currently running",
            active_probers.clone(),
        );

        let get_from_cache_total = Family::<ResourceLabels, Counter>::default();
        registry.register(
            "scale_watchdog_get_from_cache",
            "Total number of lookups against the local watch caches",
            get_from_cache_total.clone(),
        );

        let internal_probes_total = Family::<ResultLabels, Counter>::default();
        registry.register(
            "scale_watchdog_internal_probes",
            "Total number of internal probes",
            internal_probes_total.clone(),
        );

        let external_probes_total = Family::<ResultLabels, Counter>::default();
        registry.register(
            "scale_watchdog_external_probes",
            "Total number of external probes",
            external_probes_total.clone(),
        );

        let scale_requests_total = Family::<VerbLabels, Counter>::default();
        registry.register(
            "scale_watchdog_scale_requests",
            "Total number of scale client requests",
            scale_requests_total.clone(),
        );

        let throttled_scale_requests_total = Family::<VerbLabels, Counter>::default();
        registry.register(
            "scale_watchdog_throttled_scale_requests",
            "Total number of throttled scale client requests",
            throttled_scale_requests_total.clone(),
        );

        // Export every label combination from the start, even at zero
        for result in [ProbeResultLabel::Success, ProbeResultLabel::Failure] {
            let labels = ResultLabels { result };
            internal_probes_total.get_or_create(&labels);
            external_probes_total.get_or_create(&labels);
        }
        for resource in [CacheResource::Secrets, CacheResource::Deployments] {
            get_from_cache_total.get_or_create(&ResourceLabels { resource });
        }
        for verb in [ScaleVerb::Discovery, ScaleVerb::Get, ScaleVerb::Update] {
            let labels = VerbLabels { verb };
            scale_requests_total.get_or_create(&labels);
            throttled_scale_requests_total.get_or_create(&labels);
        }

        Self {
            probers_total,
            active_probers,
            get_from_cache_total,
            internal_probes_total,
            external_probes_total,
            scale_requests_total,
            throttled_scale_requests_total,
            registry,
        }
    }

    pub fn record_prober_started(&self) {
        self.probers_total.inc();
    }

    pub fn set_active_probers(&self, count: usize) {
        self.active_probers
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn record_cache_lookup(&self, resource: CacheResource) {
        self.get_from_cache_total
            .get_or_create(&ResourceLabels { resource })
            .inc();
    }

    pub fn record_probe(&self, path: ProbePath, success: bool) {
        let result = if success {
            ProbeResultLabel::Success
        } else {
            ProbeResultLabel::Failure
        };
        let family = match path {
            ProbePath::Internal => &self.internal_probes_total,
            ProbePath::External => &self.external_probes_total,
        };
        family.get_or_create(&ResultLabels { result }).inc();
    }

    pub fn record_scale_request(&self, verb: ScaleVerb) {
        self.scale_requests_total
            .get_or_create(&VerbLabels { verb })
            .inc();
    }

    pub fn record_throttled(&self, verb: ScaleVerb) {
        self.throttled_scale_requests_total
            .get_or_create(&VerbLabels { verb })
            .inc();
    }

    /// Current count of probes for a path and outcome
    pub fn probe_count(&self, path: ProbePath, result: ProbeResultLabel) -> u64 {
        let family = match path {
            ProbePath::Internal => &self.internal_probes_total,
            ProbePath::External => &self.external_probes_total,
        };
        family.get_or_create(&ResultLabels { result }).get()
    }

    /// Current count of scale requests for a verb
    pub fn scale_request_count(&self, verb: ScaleVerb) -> u64 {
        self.scale_requests_total
            .get_or_create(&VerbLabels { verb })
            .get()
    }

    /// Encode metrics to Prometheus text format
    ///
    /// Returns an empty string if encoding fails (should never happen with valid metrics).
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the watch caches have synced
    pub ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Arc<Metrics>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Mark the watchdog as ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the watchdog is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

/// Liveness probe handler
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 503 Service Unavailable until the caches have synced.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Run the health server on the given address
pub async fn run_health_server(
    state: Arc<HealthState>,
    addr: SocketAddr,
) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Health server listening on {}", addr);

    axum::serve(listener, app).await
}
