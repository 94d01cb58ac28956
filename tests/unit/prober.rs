//! Prober scaling behaviour, driven by fake probes under paused time
//!
//! Probes fire at t=0, 10, 20, ... with period 10s. Tests sleep to instants
//! between ticks before asserting.

use std::sync::Arc;
use std::time::Duration;

use scale_watchdog::config::{ProbeGroup, ProbePath};
use scale_watchdog::controller::{Prober, ReplicaCaptures};
use scale_watchdog::health::ProbeResultLabel;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::common::*;

fn start(harness: &Harness, group: &ProbeGroup) -> (CancellationToken, JoinHandle<()>) {
    start_with(harness, group, Arc::new(ReplicaCaptures::new()))
}

fn start_with(
    harness: &Harness,
    group: &ProbeGroup,
    captures: Arc<ReplicaCaptures>,
) -> (CancellationToken, JoinHandle<()>) {
    let prober = Prober::new(
        KEY,
        NAMESPACE,
        group.probes[0].clone(),
        Arc::clone(&harness.ctx),
        captures,
    )
    .unwrap();
    let cancel = CancellationToken::new();
    let handle = prober.spawn(cancel.clone());
    (cancel, handle)
}

async fn stop(cancel: CancellationToken, handle: JoinHandle<()>) {
    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_external_outage_scales_down_then_restores() {
    let harness = Harness::with_sample_cluster();
    let (cancel, handle) = start(&harness, &sample_group());

    // Both paths Up at t=0, dependant already running
    sleep_secs(5).await;
    assert!(harness.actuator.sets().is_empty());

    harness.executor.set_healthy(ProbePath::External, false);
    harness.actuator.clear_calls();

    // Failures at t=10 and t=20 stay below the threshold
    sleep_secs(20).await;
    assert!(harness.actuator.calls().is_empty());

    // Third failure at t=30
    sleep_secs(10).await;
    assert_eq!(
        harness.actuator.calls(),
        vec![ScaleCall::Get(KCM.to_string()), ScaleCall::Set(KCM.to_string(), 0)]
    );
    assert_eq!(harness.actuator.replicas(KCM), Some(0));

    // First success at t=40 restores the captured count
    harness.executor.set_healthy(ProbePath::External, true);
    sleep_secs(10).await;
    assert_eq!(
        harness.actuator.sets(),
        vec![
            ScaleCall::Set(KCM.to_string(), 0),
            ScaleCall::Set(KCM.to_string(), 1)
        ]
    );
    assert_eq!(harness.actuator.replicas(KCM), Some(1));

    stop(cancel, handle).await;
}

#[tokio::test(start_paused = true)]
async fn test_scale_down_is_not_repeated() {
    let harness = Harness::with_sample_cluster();
    harness.executor.set_healthy(ProbePath::External, false);
    let (cancel, handle) = start(&harness, &sample_group());

    // Down at t=20, then four more failures
    sleep_secs(65).await;
    assert_eq!(
        harness.actuator.sets(),
        vec![ScaleCall::Set(KCM.to_string(), 0)]
    );
    assert!(
        harness
            .metrics
            .probe_count(ProbePath::External, ProbeResultLabel::Failure)
            >= 7
    );

    stop(cancel, handle).await;
}

#[tokio::test(start_paused = true)]
async fn test_internal_down_never_scales() {
    let harness = Harness::with_sample_cluster();
    harness.executor.set_healthy(ProbePath::Internal, false);
    harness.executor.set_healthy(ProbePath::External, false);
    let (cancel, handle) = start(&harness, &sample_group());

    sleep_secs(55).await;
    assert!(harness.actuator.calls().is_empty());
    assert_eq!(harness.actuator.replicas(KCM), Some(1));

    // Once internal recovers the Down external path is acted on
    harness.executor.set_healthy(ProbePath::Internal, true);
    sleep_secs(10).await;
    assert_eq!(
        harness.actuator.sets(),
        vec![ScaleCall::Set(KCM.to_string(), 0)]
    );

    stop(cancel, handle).await;
}

#[tokio::test(start_paused = true)]
async fn test_internal_outage_keeps_previous_decision() {
    let harness = Harness::with_sample_cluster();
    harness.executor.set_healthy(ProbePath::External, false);
    let (cancel, handle) = start(&harness, &sample_group());

    sleep_secs(25).await;
    assert_eq!(harness.actuator.replicas(KCM), Some(0));

    // Both paths recover, but internal goes away first: nothing is restored
    harness.executor.set_healthy(ProbePath::Internal, false);
    sleep_secs(30).await;
    harness.executor.set_healthy(ProbePath::External, true);
    sleep_secs(20).await;
    assert_eq!(harness.actuator.replicas(KCM), Some(0));

    harness.executor.set_healthy(ProbePath::Internal, true);
    sleep_secs(10).await;
    assert_eq!(harness.actuator.replicas(KCM), Some(1));

    stop(cancel, handle).await;
}

#[tokio::test(start_paused = true)]
async fn test_explicit_restore_count() {
    let harness = Harness::with_sample_cluster();
    harness.actuator.seed_replicas(MCM, 3);
    harness.executor.set_healthy(ProbePath::External, false);
    let (cancel, handle) = start(&harness, &group_with_explicit_restore(2));

    sleep_secs(25).await;
    assert_eq!(harness.actuator.replicas(KCM), Some(0));
    assert_eq!(harness.actuator.replicas(MCM), Some(0));

    harness.executor.set_healthy(ProbePath::External, true);
    sleep_secs(10).await;
    assert_eq!(harness.actuator.replicas(KCM), Some(1));
    assert_eq!(harness.actuator.replicas(MCM), Some(2));

    stop(cancel, handle).await;
}

#[tokio::test(start_paused = true)]
async fn test_unknown_restore_count_leaves_dependant() {
    let harness = Harness::with_sample_cluster();
    // Scaled to zero by someone else before the prober ever saw it running
    harness.actuator.seed_replicas(KCM, 0);
    harness.executor.set_healthy(ProbePath::External, false);
    let (cancel, handle) = start(&harness, &sample_group());

    sleep_secs(25).await;
    harness.executor.set_healthy(ProbePath::External, true);
    sleep_secs(10).await;

    assert!(harness.actuator.sets().is_empty());
    assert_eq!(harness.actuator.replicas(KCM), Some(0));

    stop(cancel, handle).await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_scale_is_retried_on_next_report() {
    let harness = Harness::with_sample_cluster();
    harness.actuator.fail_next_sets(1);
    harness.executor.set_healthy(ProbePath::External, false);
    let (cancel, handle) = start(&harness, &external_only_group());

    // Down at t=20, the update fails
    sleep_secs(25).await;
    assert_eq!(
        harness.actuator.sets(),
        vec![ScaleCall::Set(KCM.to_string(), 0)]
    );
    assert_eq!(harness.actuator.replicas(KCM), Some(1));

    // Next failure at t=30 retries the same decision
    sleep_secs(10).await;
    assert_eq!(harness.actuator.sets().len(), 2);
    assert_eq!(harness.actuator.replicas(KCM), Some(0));

    stop(cancel, handle).await;
}

#[tokio::test(start_paused = true)]
async fn test_partial_scale_down_still_restores_every_dependant() {
    let harness = Harness::with_sample_cluster();
    harness.actuator.seed_replicas(MCM, 3);
    let (cancel, handle) = start(&harness, &group_with_explicit_restore(2));

    // Scaled Up at t=0 with nothing to change
    sleep_secs(5).await;
    assert!(harness.actuator.sets().is_empty());

    // KCM refuses to scale; MCM goes to zero when Down is reached at t=30
    harness.actuator.reject_sets_for(KCM);
    harness.executor.set_healthy(ProbePath::External, false);
    sleep_secs(30).await;
    assert_eq!(harness.actuator.replicas(KCM), Some(1));
    assert_eq!(harness.actuator.replicas(MCM), Some(0));

    // Recovery at t=40 must bring MCM back even though the pass before failed
    harness.executor.set_healthy(ProbePath::External, true);
    sleep_secs(10).await;
    assert_eq!(harness.actuator.replicas(MCM), Some(2));
    assert_eq!(harness.actuator.replicas(KCM), Some(1));

    stop(cancel, handle).await;
}

#[tokio::test(start_paused = true)]
async fn test_captured_count_survives_restart() {
    let harness = Harness::with_sample_cluster();
    harness.actuator.seed_replicas(KCM, 2);
    harness.executor.set_healthy(ProbePath::External, false);
    let captures = Arc::new(ReplicaCaptures::new());
    let group = sample_group();

    let (cancel, handle) = start_with(&harness, &group, Arc::clone(&captures));
    sleep_secs(25).await;
    assert_eq!(harness.actuator.replicas(KCM), Some(0));
    stop(cancel, handle).await;

    // The replacement only ever sees the dependant at zero
    harness.executor.set_healthy(ProbePath::External, true);
    let (cancel, handle) = start_with(&harness, &group, captures);
    sleep_secs(5).await;
    assert_eq!(harness.actuator.replicas(KCM), Some(2));

    stop(cancel, handle).await;
}

#[tokio::test(start_paused = true)]
async fn test_missing_credential_counts_as_failure() {
    let harness = Harness::with_sample_cluster();
    harness.resolver.delete_secret(EXTERNAL_SECRET);
    let (cancel, handle) = start(&harness, &sample_group());

    sleep_secs(25).await;
    assert_eq!(harness.executor.calls(ProbePath::External), 0);
    assert_eq!(
        harness
            .metrics
            .probe_count(ProbePath::External, ProbeResultLabel::Failure),
        3
    );
    assert_eq!(harness.actuator.replicas(KCM), Some(0));

    stop(cancel, handle).await;
}

#[tokio::test(start_paused = true)]
async fn test_slow_probe_times_out() {
    let harness = Harness::with_sample_cluster();
    // Default timeout is one second
    harness
        .executor
        .set_delay(ProbePath::External, Duration::from_secs(5));
    let (cancel, handle) = start(&harness, &sample_group());

    sleep_secs(25).await;
    assert_eq!(harness.actuator.replicas(KCM), Some(0));

    stop(cancel, handle).await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_discards_in_flight_result() {
    let harness = Harness::with_sample_cluster();
    harness.executor.set_healthy(ProbePath::External, false);
    harness
        .executor
        .set_delay(ProbePath::External, Duration::from_millis(500));
    let (cancel, handle) = start(&harness, &sample_group());

    // Third external probe started at t=20 and would report at t=20.5
    sleep_secs(20).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    stop(cancel, handle).await;

    sleep_secs(30).await;
    assert!(harness.actuator.calls().is_empty());
    assert_eq!(harness.executor.calls(ProbePath::External), 3);
}
