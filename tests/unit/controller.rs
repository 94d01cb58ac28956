//! Controller membership, change events and leadership handover

use std::sync::Arc;
use std::time::Duration;

use scale_watchdog::config::{ProbeGroup, ProbePath};
use scale_watchdog::controller::{
    BackoffConfig, ChangeEvent, Controller, Error, Membership, ReconcileOutcome,
};

use crate::common::*;

fn controller(harness: &Harness, group: ProbeGroup) -> Arc<Controller> {
    Arc::new(Controller::new(
        Arc::new(group),
        harness.ctx.clone(),
        2,
        BackoffConfig::default(),
    ))
}

/// Wait until exactly `expected` keys have running probers
async fn wait_for_keys(controller: &Controller, expected: &[&str]) -> bool {
    for _ in 0..100 {
        if controller.registry().keys().await == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn secret_applied(name: &str) -> ChangeEvent {
    ChangeEvent::CredentialApplied {
        namespace: NAMESPACE.to_string(),
        name: name.to_string(),
    }
}

fn secret_deleted(name: &str) -> ChangeEvent {
    ChangeEvent::CredentialDeleted {
        namespace: NAMESPACE.to_string(),
        name: name.to_string(),
    }
}

mod reconcile_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_starts_then_keeps_prober() {
        let harness = Harness::with_sample_cluster();
        let controller = controller(&harness, sample_group());

        assert_eq!(
            controller.reconcile(KEY).await.unwrap(),
            ReconcileOutcome::Running(Membership::Started)
        );
        assert_eq!(
            controller.reconcile(KEY).await.unwrap(),
            ReconcileOutcome::Running(Membership::Unchanged)
        );
        assert_eq!(harness.metrics.probers_total.get(), 1);
        assert_eq!(harness.metrics.active_probers.get(), 1);

        controller.registry().stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfigured_key_is_stopped() {
        let harness = Harness::with_sample_cluster();
        let controller = controller(&harness, sample_group());

        let outcome = controller.reconcile("shoot-a/unknown").await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Stopped { .. }));
        assert!(controller.registry().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_secret_is_ineligible() {
        let harness = Harness::with_sample_cluster();
        harness.resolver.delete_secret(EXTERNAL_SECRET);
        let controller = controller(&harness, sample_group());

        match controller.reconcile(KEY).await.unwrap() {
            ReconcileOutcome::Stopped { reason } => assert!(reason.contains("external")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(controller.registry().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_dependants_are_ineligible() {
        let harness = Harness::with_sample_cluster();
        harness.lookup.remove(KCM);
        let controller = controller(&harness, sample_group());

        match controller.reconcile(KEY).await.unwrap() {
            ReconcileOutcome::Stopped { reason } => assert!(reason.contains("dependant")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsynced_caches_are_transient() {
        let harness = Harness::with_sample_cluster();
        let controller = controller(&harness, sample_group());

        harness.resolver.set_synced(false);
        let err = controller.reconcile(KEY).await.unwrap_err();
        assert!(matches!(err, Error::CredentialError(_)));
        assert!(err.is_retryable());

        harness.resolver.set_synced(true);
        harness.lookup.set_synced(false);
        let err = controller.reconcile(KEY).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(controller.registry().is_empty().await);
    }
}

mod event_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_activate_starts_eligible_targets_only() {
        let harness = Harness::with_sample_cluster();
        // etcd's dependant does not exist
        let controller = controller(&harness, two_target_group());

        controller.activate().await;
        assert!(controller.is_active().await);
        assert!(wait_for_keys(&controller, &[KEY]).await);

        harness.lookup.add(MCM);
        controller
            .handle_event(ChangeEvent::DependantApplied {
                namespace: NAMESPACE.to_string(),
                kind: "Deployment".to_string(),
                name: MCM.to_string(),
            })
            .await;
        assert!(wait_for_keys(&controller, &[KEY, "shoot-a/etcd"]).await);

        controller.deactivate().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_credential_deleted_stops_prober() {
        let harness = Harness::with_sample_cluster();
        let controller = controller(&harness, sample_group());
        controller.activate().await;
        assert!(wait_for_keys(&controller, &[KEY]).await);

        harness.resolver.delete_secret(EXTERNAL_SECRET);
        controller.handle_event(secret_deleted(EXTERNAL_SECRET)).await;
        assert!(wait_for_keys(&controller, &[]).await);

        harness.resolver.set_secret(EXTERNAL_SECRET, "2");
        controller.handle_event(secret_applied(EXTERNAL_SECRET)).await;
        assert!(wait_for_keys(&controller, &[KEY]).await);
        assert_eq!(harness.metrics.probers_total.get(), 2);

        controller.deactivate().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependant_deleted_stops_prober() {
        let harness = Harness::with_sample_cluster();
        let controller = controller(&harness, sample_group());
        controller.activate().await;
        assert!(wait_for_keys(&controller, &[KEY]).await);

        harness.lookup.remove(KCM);
        controller
            .handle_event(ChangeEvent::DependantDeleted {
                namespace: NAMESPACE.to_string(),
                kind: "Deployment".to_string(),
                name: KCM.to_string(),
            })
            .await;
        assert!(wait_for_keys(&controller, &[]).await);

        controller.deactivate().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_revision_change_restarts_prober() {
        let harness = Harness::with_sample_cluster();
        let controller = controller(&harness, sample_group());
        controller.activate().await;
        assert!(wait_for_keys(&controller, &[KEY]).await);
        assert_eq!(harness.metrics.probers_total.get(), 1);

        harness.resolver.set_secret(INTERNAL_SECRET, "2");
        controller.handle_event(secret_applied(INTERNAL_SECRET)).await;
        sleep_secs(1).await;

        assert_eq!(harness.metrics.probers_total.get(), 2);
        assert_eq!(controller.registry().keys().await, vec![KEY]);
        assert_eq!(harness.metrics.active_probers.get(), 1);

        // Same revision again changes nothing
        controller.handle_event(secret_applied(INTERNAL_SECRET)).await;
        sleep_secs(1).await;
        assert_eq!(harness.metrics.probers_total.get(), 2);

        controller.deactivate().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_changes_keep_one_prober_per_key() {
        let harness = Harness::with_sample_cluster();
        let controller = controller(&harness, sample_group());
        controller.activate().await;

        for i in 0..50 {
            if i % 3 == 0 {
                harness.resolver.delete_secret(INTERNAL_SECRET);
                controller.handle_event(secret_deleted(INTERNAL_SECRET)).await;
            } else {
                harness
                    .resolver
                    .set_secret(INTERNAL_SECRET, &format!("rv-{i}"));
                controller.handle_event(secret_applied(INTERNAL_SECRET)).await;
            }
            if i % 7 == 0 {
                settle().await;
            }
        }
        harness.resolver.set_secret(INTERNAL_SECRET, "final");
        controller.handle_event(secret_applied(INTERNAL_SECRET)).await;

        assert!(wait_for_keys(&controller, &[KEY]).await);
        sleep_secs(1).await;
        assert_eq!(controller.registry().len().await, 1);
        assert_eq!(harness.metrics.active_probers.get(), 1);

        controller.deactivate().await;
        assert_eq!(harness.metrics.active_probers.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsynced_cache_is_retried() {
        let harness = Harness::with_sample_cluster();
        harness.resolver.set_synced(false);
        let controller = controller(&harness, sample_group());
        controller.activate().await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(controller.registry().is_empty().await);

        harness.resolver.set_synced(true);
        assert!(wait_for_keys(&controller, &[KEY]).await);

        controller.deactivate().await;
    }
}

mod leadership_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_events_ignored_while_not_leading() {
        let harness = Harness::with_sample_cluster();
        let controller = controller(&harness, sample_group());

        controller.handle_event(secret_applied(INTERNAL_SECRET)).await;
        controller.handle_event(ChangeEvent::Resync).await;
        sleep_secs(5).await;

        assert!(!controller.is_active().await);
        assert!(controller.registry().is_empty().await);
        assert_eq!(harness.resolver.lookups.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivate_stops_all_probing_and_scaling() {
        let harness = Harness::with_sample_cluster();
        harness.executor.set_healthy(ProbePath::External, false);
        let controller = controller(&harness, sample_group());
        controller.activate().await;
        assert!(wait_for_keys(&controller, &[KEY]).await);

        // One external failure so far, two short of the threshold
        sleep_secs(5).await;
        controller.deactivate().await;
        assert!(!controller.is_active().await);
        assert!(controller.registry().is_empty().await);

        let internal = harness.executor.calls(ProbePath::Internal);
        let external = harness.executor.calls(ProbePath::External);
        sleep_secs(60).await;

        assert_eq!(harness.executor.calls(ProbePath::Internal), internal);
        assert_eq!(harness.executor.calls(ProbePath::External), external);
        assert!(harness.actuator.sets().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activate_and_deactivate_are_idempotent() {
        let harness = Harness::with_sample_cluster();
        let controller = controller(&harness, sample_group());

        controller.deactivate().await;
        controller.activate().await;
        controller.activate().await;
        assert!(wait_for_keys(&controller, &[KEY]).await);
        assert_eq!(harness.metrics.probers_total.get(), 1);

        controller.deactivate().await;
        controller.deactivate().await;
        assert!(controller.registry().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reactivation_resyncs_everything() {
        let harness = Harness::with_sample_cluster();
        let controller = controller(&harness, sample_group());
        controller.activate().await;
        assert!(wait_for_keys(&controller, &[KEY]).await);
        controller.deactivate().await;

        // Changes while not leading produce no events the controller acts on
        harness.resolver.set_secret(EXTERNAL_SECRET, "2");
        controller.handle_event(secret_applied(EXTERNAL_SECRET)).await;
        sleep_secs(1).await;
        assert!(controller.registry().is_empty().await);

        controller.activate().await;
        assert!(wait_for_keys(&controller, &[KEY]).await);
        assert_eq!(harness.metrics.probers_total.get(), 2);

        controller.deactivate().await;
    }
}

mod restore_tests {
    use super::*;

    /// Activate with the external path failing and wait until KCM is at zero
    async fn scaled_down(harness: &Harness) -> Arc<Controller> {
        harness.actuator.seed_replicas(KCM, 3);
        harness.executor.set_healthy(ProbePath::External, false);
        let controller = controller(harness, sample_group());
        controller.activate().await;
        assert!(wait_for_keys(&controller, &[KEY]).await);

        // Failures at t=0, 10 and 20
        sleep_secs(25).await;
        assert_eq!(harness.actuator.replicas(KCM), Some(0));
        assert_eq!(controller.captures().get(&deployment(KCM)), Some(3));
        controller
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_after_credential_rotation() {
        let harness = Harness::with_sample_cluster();
        let controller = scaled_down(&harness).await;

        harness.resolver.set_secret(EXTERNAL_SECRET, "rotated");
        controller.handle_event(secret_applied(EXTERNAL_SECRET)).await;
        sleep_secs(1).await;
        assert_eq!(harness.metrics.probers_total.get(), 2);

        harness.executor.set_healthy(ProbePath::External, true);
        sleep_secs(30).await;
        assert_eq!(harness.actuator.replicas(KCM), Some(3));

        controller.deactivate().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_after_leadership_reacquired() {
        let harness = Harness::with_sample_cluster();
        let controller = scaled_down(&harness).await;

        controller.deactivate().await;
        harness.executor.set_healthy(ProbePath::External, true);
        sleep_secs(10).await;
        assert_eq!(harness.actuator.replicas(KCM), Some(0));

        controller.activate().await;
        assert!(wait_for_keys(&controller, &[KEY]).await);
        sleep_secs(30).await;
        assert_eq!(harness.actuator.replicas(KCM), Some(3));

        controller.deactivate().await;
    }
}
