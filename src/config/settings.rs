//! Process settings read from the environment

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::controller::error::{BackoffConfig, Error, Result};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/scale-watchdog/config.yaml";
pub const DEFAULT_WORKERS: usize = 2;
pub const DEFAULT_HEALTH_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_LEASE_NAME: &str = "scale-watchdog-leader";

/// Lease timing
pub const LEASE_TTL_SECS: u64 = 15;
pub const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

/// Runtime settings of the watchdog process
#[derive(Clone, Debug)]
pub struct Settings {
    /// Probe group document
    pub config_path: PathBuf,
    /// Concurrent reconciliation workers
    pub workers: usize,
    /// Requeue backoff for failed reconciliations
    pub queue_backoff: BackoffConfig,
    /// Bind address of the health and metrics server
    pub health_addr: SocketAddr,
    /// Leader election lease name
    pub lease_name: String,
    pub lease_ttl: Duration,
    pub lease_renew_interval: Duration,
}

impl Settings {
    /// Read settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config_path = lookup("WATCHDOG_CONFIG")
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
            .into();

        let workers: usize = parse_var(&lookup, "WATCHDOG_WORKERS", DEFAULT_WORKERS)?;
        if workers == 0 {
            return Err(Error::InvalidConfig(
                "WATCHDOG_WORKERS must be at least 1".to_string(),
            ));
        }

        let base_delay_ms: u64 = parse_var(&lookup, "WATCHDOG_QUEUE_BASE_DELAY_MS", 5)?;
        let max_delay_secs: u64 = parse_var(&lookup, "WATCHDOG_QUEUE_MAX_DELAY_SECS", 300)?;
        let queue_backoff = BackoffConfig {
            initial_delay: Duration::from_millis(base_delay_ms),
            max_delay: Duration::from_secs(max_delay_secs),
            ..BackoffConfig::default()
        };

        let health_addr = parse_var(
            &lookup,
            "WATCHDOG_HEALTH_ADDR",
            SocketAddr::from(([0, 0, 0, 0], 8080)),
        )?;

        let lease_name =
            lookup("WATCHDOG_LEASE_NAME").unwrap_or_else(|| DEFAULT_LEASE_NAME.to_string());

        Ok(Self {
            config_path,
            workers,
            queue_backoff,
            health_addr,
            lease_name,
            lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
            lease_renew_interval: Duration::from_secs(LEASE_RENEW_INTERVAL_SECS),
        })
    }
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("{} has an invalid value: {:?}", name, raw))),
        None => Ok(default),
    }
}
