// Moniteur + orchestrateur réels, sur drivers et relais simulés

use std::sync::Arc;
use std::time::Duration;

use domewatch_agent::config::MonitoredSwitch;
use domewatch_agent::signals::RecoveryState;
use domewatch_agent::{RecoveryHandler, RecoveryOutcome};
use domewatch_devkit::{CountingRecoveryHandler, SimSwitch, SimulatedDevices, TestHarness};

#[tokio::test]
async fn test_five_failures_trigger_exactly_one_recovery() {
    let harness = TestHarness::new().await;
    let orchestrator: Arc<dyn RecoveryHandler> = Arc::new(harness.orchestrator());
    let monitor = harness.monitor(Some(orchestrator));
    harness.probe.set_healthy(false);

    for n in 1..=4 {
        let iteration = monitor.run_once().await;
        assert_eq!(iteration.consecutive_failures, n);
        assert!(iteration.recovery.is_none());
    }
    let fifth = monitor.run_once().await;
    assert_eq!(fifth.recovery, Some(RecoveryOutcome::Succeeded));
    assert_eq!(harness.power.set_calls(), vec![(0, false), (0, true)]);

    // encore en échec juste après : cooldown actif
    let sixth = monitor.run_once().await;
    assert!(sixth.recovery.is_none());
    assert_eq!(harness.ctx.history.total_count(), 1);
    assert_eq!(harness.power.set_calls().len(), 2);

    let status = monitor.status();
    assert!(status.last_recovery_at.is_some());
    assert!(status.cooldown_remaining_secs.is_some());
    assert!(!status.recovery_in_progress);
}

#[tokio::test]
async fn test_manual_trigger_runs_full_recovery() {
    let harness = TestHarness::new().await;
    let orchestrator: Arc<dyn RecoveryHandler> = Arc::new(harness.orchestrator());
    let monitor = harness.monitor(Some(orchestrator));
    harness.manual_trigger().set().unwrap();

    let iteration = monitor.run_once().await;
    assert!(iteration.probe_ok);
    assert!(iteration.manual);
    assert_eq!(iteration.recovery, Some(RecoveryOutcome::Succeeded));
    assert!(!harness.manual_trigger().is_set());
    assert_eq!(harness.consumer_state(), RecoveryState::Finished { failure: None });

    let entry = &harness.ctx.history.recent(1)[0];
    assert_eq!(entry.trigger_reason.as_deref(), Some("Manual trigger"));
}

#[tokio::test]
async fn test_manual_trigger_cleared_before_handler_runs() {
    let harness = TestHarness::new().await;
    let handler = Arc::new(CountingRecoveryHandler::new(RecoveryOutcome::Succeeded).watching(harness.manual_trigger()));
    let monitor = harness.monitor(Some(handler.clone()));
    harness.manual_trigger().set().unwrap();

    let iteration = monitor.run_once().await;
    assert_eq!(iteration.recovery, Some(RecoveryOutcome::Succeeded));
    assert_eq!(handler.count(), 1);
    assert_eq!(handler.trigger_seen(), vec![false]);
}

#[tokio::test]
async fn test_failed_manual_recovery_keeps_request() {
    let harness = TestHarness::new().await;
    harness.power.fail_set(true);
    let orchestrator: Arc<dyn RecoveryHandler> = Arc::new(harness.orchestrator());
    let monitor = harness.monitor(Some(orchestrator));
    harness.manual_trigger().set().unwrap();

    let iteration = monitor.run_once().await;
    assert!(matches!(iteration.recovery, Some(RecoveryOutcome::Failed(_))));
    assert!(harness.manual_trigger().is_set());
    assert!(matches!(
        harness.consumer_state(),
        RecoveryState::Finished { failure: Some(_) }
    ));
}

#[tokio::test]
async fn test_panicking_handler_does_not_stop_the_monitor() {
    let harness = TestHarness::new().await;
    let handler = Arc::new(CountingRecoveryHandler::panicking());
    let monitor = harness.monitor(Some(handler.clone()));
    harness.manual_trigger().set().unwrap();

    let iteration = monitor.run_once().await;
    assert!(matches!(iteration.recovery, Some(RecoveryOutcome::Failed(_))));
    assert!(!harness.ctx.is_recovering());

    // la boucle continue normalement
    let next = monitor.run_once().await;
    assert!(next.probe_ok);
    assert_eq!(handler.count(), 1);
}

#[tokio::test]
async fn test_switch_cache_loop_snapshots_configured_switches() {
    let devices = SimulatedDevices::new()
        .with_switch(18, SimSwitch::new("Fan", true))
        .with_switch(3, SimSwitch::new("Dew heater", false));
    let harness = TestHarness::with(devices, |c| {
        c.switches.monitored = vec![
            MonitoredSwitch { index: 18, name: "Fan".into() },
            MonitoredSwitch { index: 3, name: "Dew heater".into() },
        ];
    })
    .await;
    let monitor = harness.monitor(None);

    assert!(monitor.refresh_switch_cache().await);
    let snapshot = harness.ctx.switch_cache.current_snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot.iter().find(|s| s.index == 18).and_then(|s| s.state), Some(true));

    // intervalle pas encore écoulé
    assert!(!monitor.refresh_switch_cache().await);
    assert_eq!(harness.devices.switch_created(), 1);
}

#[tokio::test]
async fn test_running_monitor_recovers_and_stops_cleanly() {
    let harness = TestHarness::with(SimulatedDevices::new(), |c| {
        c.probe.failures_to_trigger = 2;
    })
    .await;
    let handler = Arc::new(CountingRecoveryHandler::new(RecoveryOutcome::Succeeded));
    let monitor = harness.monitor(Some(handler.clone()));
    let mut status = monitor.subscribe();
    harness.probe.push(&[false, false]);

    monitor.start();
    let recovered = harness
        .wait_until(Duration::from_secs(10), || handler.count() == 1)
        .await;
    assert!(recovered);

    status.changed().await.unwrap();
    assert!(monitor.stop(Duration::from_secs(5)).await);
    assert_eq!(handler.reasons()[0], "Watchdog triggered (2 consecutive probe failures)");
}
