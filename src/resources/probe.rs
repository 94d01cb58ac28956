//! Probe execution against the target API server

use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use thiserror::Error;
use tracing::debug;

use crate::config::ProbePath;

/// Why a probe did not succeed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("credential unavailable: {0}")]
    Credential(String),

    #[error("unexpected response: {0}")]
    Protocol(String),
}

/// Result of one health check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success,
    Failure(ProbeFailure),
}

impl ProbeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Success)
    }
}

/// Performs a single bounded health check
#[async_trait]
pub trait ProbeExecutor: Send + Sync {
    /// Must return within `timeout`
    async fn check(&self, path: ProbePath, config: &kube::Config, timeout: Duration)
    -> ProbeOutcome;
}

/// Checks an API server by requesting its `/version` endpoint
#[derive(Clone, Debug, Default)]
pub struct VersionProbe;

#[async_trait]
impl ProbeExecutor for VersionProbe {
    async fn check(
        &self,
        path: ProbePath,
        config: &kube::Config,
        timeout: Duration,
    ) -> ProbeOutcome {
        let mut config = config.clone();
        config.connect_timeout = Some(timeout);
        config.read_timeout = Some(timeout);

        let client = match Client::try_from(config) {
            Ok(client) => client,
            Err(e) => return ProbeOutcome::Failure(ProbeFailure::Connection(e.to_string())),
        };

        match tokio::time::timeout(timeout, client.apiserver_version()).await {
            Err(_) => ProbeOutcome::Failure(ProbeFailure::Timeout(timeout)),
            Ok(Ok(info)) => {
                debug!(%path, version = %info.git_version, "probe succeeded");
                ProbeOutcome::Success
            }
            Ok(Err(kube::Error::Api(e))) => ProbeOutcome::Failure(ProbeFailure::Protocol(format!(
                "{} ({})",
                e.message, e.code
            ))),
            Ok(Err(e)) => ProbeOutcome::Failure(ProbeFailure::Connection(e.to_string())),
        }
    }
}
