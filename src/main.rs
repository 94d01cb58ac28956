use std::sync::Arc;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use scale_watchdog::config::{ProbeGroup, Settings};
use scale_watchdog::controller::{Controller, validate_group};
use scale_watchdog::health::{HealthState, run_health_server};
use scale_watchdog::resources::ClusterCaches;
use scale_watchdog::{EVENT_CHANNEL_CAPACITY, cluster_context, forward_events};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install the TLS crypto provider before any TLS operations
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err("Failed to install rustls crypto provider and no provider is available".into());
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("scale_watchdog=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .init();

    info!("Starting scale-watchdog");

    // Any configuration problem is fatal before touching the cluster
    let settings = Settings::from_env()?;
    let group = ProbeGroup::load(&settings.config_path)?;
    validate_group(&group)?;
    info!(
        path = %settings.config_path.display(),
        namespace = %group.namespace,
        targets = group.probes.len(),
        "Loaded probe configuration"
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    // Get pod identity for leader election
    let pod_name = std::env::var("POD_NAME").unwrap_or_else(|_| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    });
    let lease_namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
        warn!("POD_NAMESPACE not set, using 'default'");
        "default".to_string()
    });

    let health_state = Arc::new(HealthState::new());

    // Health server runs regardless of leadership
    let health_handle = {
        let health_state = health_state.clone();
        let addr = settings.health_addr;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, addr).await {
                error!("Health server error: {}", e);
            }
        })
    };

    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let caches = ClusterCaches::start(client.clone(), &group.namespace, events_tx);
    let ctx = Arc::new(cluster_context(
        client.clone(),
        &caches,
        health_state.metrics.clone(),
    ));
    let controller = Arc::new(Controller::new(
        Arc::new(group),
        ctx,
        settings.workers,
        settings.queue_backoff.clone(),
    ));
    let forwarder_handle = tokio::spawn(forward_events(controller.clone(), events_rx));

    info!("Waiting for Secret and Deployment caches to sync...");
    caches.wait_until_ready().await?;
    health_state.set_ready(true).await;
    info!("Caches synced");

    info!(
        holder_id = %pod_name,
        namespace = %lease_namespace,
        lease_name = %settings.lease_name,
        "Initializing leader election"
    );
    let lease_lock = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id: pod_name,
            lease_name: settings.lease_name.clone(),
            lease_ttl: settings.lease_ttl,
        },
    );

    let election = campaign(&lease_lock, &controller, &settings);

    tokio::select! {
        _ = election => {}
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        result = forwarder_handle => {
            if let Err(e) = result {
                error!("Event forwarder task panicked: {}", e);
            }
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");
        }
    }

    health_state.set_ready(false).await;

    // Probers stop before the lease is released
    controller.deactivate().await;
    if let Err(e) = lease_lock.step_down().await {
        warn!("Failed to release lease: {}", e);
    }
    caches.shutdown();

    info!("Watchdog stopped");
    Ok(())
}

/// Keep campaigning for the lease.
///
/// The controller is activated whenever the lease is held and deactivated as
/// soon as a renewal fails or another holder shows up. Never returns.
async fn campaign(lease_lock: &LeaseLock, controller: &Arc<Controller>, settings: &Settings) {
    let mut ticker = tokio::time::interval(settings.lease_renew_interval);
    let mut leading = false;

    loop {
        ticker.tick().await;

        match lease_lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                if !leading {
                    info!("Acquired leadership");
                    leading = true;
                    controller.activate().await;
                }
            }
            Ok(_) => {
                if leading {
                    error!("Lost leadership, stopping all probers");
                    leading = false;
                    controller.deactivate().await;
                } else {
                    debug!("Another instance is leader, waiting...");
                }
            }
            Err(e) => {
                if leading {
                    error!("Failed to renew lease: {}. Stopping all probers", e);
                    leading = false;
                    controller.deactivate().await;
                } else {
                    warn!("Failed to acquire lease: {}, retrying...", e);
                }
            }
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
