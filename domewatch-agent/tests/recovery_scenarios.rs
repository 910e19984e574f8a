// Scénarios bout-en-bout de l'orchestrateur, sur drivers et relais simulés

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use domewatch_agent::config::{HomeAction, MonitoredSwitch};
use domewatch_agent::recovery::PowerAction;
use domewatch_agent::signals::{ConsumerSignals, NamedLock, RecoveryState};
use domewatch_agent::{RecoveryOutcome, WatchdogContext};
use domewatch_devkit::{SimSwitch, SimulatedDevices, TestHarness};

#[tokio::test]
async fn test_full_recovery_sequence() {
    let harness = TestHarness::new().await;
    let outcome = harness
        .orchestrator()
        .execute("Watchdog triggered", &CancellationToken::new())
        .await;

    assert_eq!(outcome, RecoveryOutcome::Succeeded);
    assert_eq!(harness.power.set_calls(), vec![(0, false), (0, true)]);
    assert_eq!(harness.power.output(0), Some(true));

    let processes = harness.processes.calls();
    assert_eq!(processes.len(), 2);
    assert!(processes[0].starts_with("stop:"));
    assert!(processes[1].starts_with("launch:"));

    assert_eq!(harness.devices.calls_matching("dome.FindHome").len(), 1);
    assert!(harness.devices.is_home());
    // every driver object let go
    assert_eq!(harness.devices.calls().last().map(String::as_str), Some("dome.Connected=false"));

    assert_eq!(harness.consumer_state(), RecoveryState::Finished { failure: None });

    let history = harness.ctx.history.recent(10);
    assert_eq!(history.len(), 1);
    assert!(history[0].success);
    assert!(!history[0].is_open());
    assert_eq!(history[0].trigger_reason.as_deref(), Some("Watchdog triggered"));

    let log_path = harness.ctx.restart_log.path().unwrap().to_path_buf();
    let log = std::fs::read_to_string(log_path).unwrap();
    assert!(log.contains("Recovery started"));
    assert!(log.contains("Recovery complete"));
}

#[tokio::test]
async fn test_power_already_off_is_only_switched_on() {
    let harness = TestHarness::new().await;
    harness.power.set_output(0, false);

    let action = harness
        .orchestrator()
        .power_cycle(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(action, PowerAction::TurnedOn);
    assert_eq!(harness.power.set_calls(), vec![(0, true)]);
}

#[tokio::test]
async fn test_power_on_is_cycled_off_then_on() {
    let harness = TestHarness::with(SimulatedDevices::new(), |c| c.power.off_secs = 1).await;

    let started = std::time::Instant::now();
    let action = harness
        .orchestrator()
        .power_cycle(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(action, PowerAction::Cycled);
    assert_eq!(harness.power.set_calls(), vec![(0, false), (0, true)]);
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn test_power_failure_still_completes_consumer_protocol() {
    let harness = TestHarness::new().await;
    harness.power.fail_set(true);

    let outcome = harness
        .orchestrator()
        .execute("Manual trigger", &CancellationToken::new())
        .await;

    let RecoveryOutcome::Failed(message) = outcome else {
        panic!("expected a failed recovery, got {outcome:?}");
    };
    assert!(message.contains("turning power off"), "{message}");

    match harness.consumer_state() {
        RecoveryState::Finished { failure: Some(reason) } => assert_eq!(reason, message),
        other => panic!("consumer should see a failed completion, saw {other:?}"),
    }

    let history = harness.ctx.history.recent(1);
    assert!(!history[0].is_open());
    assert!(!history[0].success);
    assert_eq!(history[0].error_message.as_deref(), Some(message.as_str()));

    // no reconnection after a failed power stage
    assert_eq!(harness.devices.dome_created(), 0);
}

#[tokio::test]
async fn test_lock_held_elsewhere_skips() {
    let harness = TestHarness::new().await;
    let config = &harness.ctx.config;
    let lock = NamedLock::open(&config.signals.dir, &config.recovery.lock_name).unwrap();
    let _held = lock.try_acquire().unwrap().expect("lock free at start");

    let outcome = harness
        .orchestrator()
        .execute("Watchdog triggered", &CancellationToken::new())
        .await;

    assert_eq!(outcome, RecoveryOutcome::Skipped);
    assert!(harness.power.calls().is_empty());
    assert_eq!(harness.ctx.history.total_count(), 0);
    assert_eq!(harness.consumer_state(), RecoveryState::Idle);
}

#[tokio::test]
async fn test_dome_connect_retries_then_succeeds() {
    let devices = SimulatedDevices::new().fail_dome_connects(2).at_home(true);
    let harness = TestHarness::with(devices, |_| {}).await;

    let outcome = harness
        .orchestrator()
        .execute("Watchdog triggered", &CancellationToken::new())
        .await;

    assert_eq!(outcome, RecoveryOutcome::Succeeded);
    assert_eq!(harness.devices.dome_created(), 3);
    // two failed attempts released, plus the final session
    assert_eq!(harness.devices.disconnects(), 3);
    assert!(harness.devices.calls_matching("dome.FindHome").is_empty());
}

#[tokio::test]
async fn test_dome_connect_budget_exhausted_fails() {
    let devices = SimulatedDevices::new().fail_dome_connects(u32::MAX);
    let harness = TestHarness::with(devices, |c| {
        c.dome.connect_timeout_secs = 2;
        c.dome.connect_retry_secs = 1;
    })
    .await;

    let outcome = harness
        .orchestrator()
        .execute("Watchdog triggered", &CancellationToken::new())
        .await;

    let RecoveryOutcome::Failed(message) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(message.contains("dome driver did not connect"), "{message}");
    // attempt at t=0 and t=1s; a third one could not start before 2s
    assert_eq!(harness.devices.dome_created(), 2);
    assert_eq!(harness.devices.disconnects(), 2);
}

#[tokio::test]
async fn test_homing_timeout_fails_recovery() {
    let devices = SimulatedDevices::new().never_homes();
    let harness = TestHarness::with(devices, |c| c.dome.find_home_timeout_secs = 1).await;

    let outcome = harness
        .orchestrator()
        .execute("Watchdog triggered", &CancellationToken::new())
        .await;

    let RecoveryOutcome::Failed(message) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(message.contains("FindHome did not complete"), "{message}");
    assert_eq!(harness.devices.calls().last().map(String::as_str), Some("dome.Connected=false"));
}

#[tokio::test]
async fn test_homing_detected_through_slewing() {
    let devices = SimulatedDevices::new().without_at_home();
    let harness = TestHarness::with(devices, |_| {}).await;

    let outcome = harness
        .orchestrator()
        .execute("Watchdog triggered", &CancellationToken::new())
        .await;
    assert_eq!(outcome, RecoveryOutcome::Succeeded);
}

#[tokio::test]
async fn test_cached_switches_restored_after_cycle() {
    let devices = SimulatedDevices::new()
        .at_home(true)
        .with_switch(18, SimSwitch::new("Fan", true))
        .with_switch(5, SimSwitch::new("Heater", false));
    let harness = TestHarness::with(devices, |c| {
        c.switches.monitored = vec![
            MonitoredSwitch { index: 18, name: "Fan".into() },
            MonitoredSwitch { index: 5, name: "Heater".into() },
        ];
    })
    .await;
    let cancel = CancellationToken::new();
    let config = harness.ctx.config.clone();

    let snapshot = harness
        .ctx
        .switch_cache
        .snapshot(&config.switches.driver_id, &config.switches.monitored, &cancel)
        .await
        .unwrap();
    assert_eq!(snapshot.len(), 2);

    // le cycle d'alimentation a tout éteint
    harness.devices.set_switch_state(18, false);
    harness.devices.clear_calls();

    let outcome = harness.orchestrator().execute("Watchdog triggered", &cancel).await;
    assert_eq!(outcome, RecoveryOutcome::Succeeded);

    assert_eq!(harness.devices.switch(18).map(|s| s.state), Some(true));
    assert_eq!(harness.devices.switch(5).map(|s| s.state), Some(false));
    assert!(harness.devices.calls().contains(&"switch.SetSwitch(18,true)".to_string()));
    assert!(harness.devices.calls_matching("switch.SetSwitchValue").is_empty());
}

#[tokio::test]
async fn test_legacy_switch_without_snapshot() {
    let devices = SimulatedDevices::new()
        .at_home(true)
        .with_switch(18, SimSwitch::new("Fan", false));
    let harness = TestHarness::with(devices, |c| c.switches.legacy_index = Some(18)).await;

    let outcome = harness
        .orchestrator()
        .execute("Watchdog triggered", &CancellationToken::new())
        .await;

    assert_eq!(outcome, RecoveryOutcome::Succeeded);
    assert_eq!(harness.devices.switch(18).map(|s| s.state), Some(true));
}

#[tokio::test]
async fn test_switch_connect_failure_is_a_hard_failure() {
    let devices = SimulatedDevices::new()
        .at_home(true)
        .with_switch(18, SimSwitch::new("Fan", false))
        .fail_switch_connects(u32::MAX);
    let harness = TestHarness::with(devices, |c| {
        c.switches.legacy_index = Some(18);
        c.switches.connect_timeout_secs = 0;
    })
    .await;

    let outcome = harness
        .orchestrator()
        .execute("Watchdog triggered", &CancellationToken::new())
        .await;
    assert!(matches!(outcome, RecoveryOutcome::Failed(ref m) if m.contains("switch driver")));
}

#[tokio::test]
async fn test_cached_encoder_written_instead_of_homing() {
    let device = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("setEncoderA", "5120"))
        .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
        .expect(1)
        .mount(&device)
        .await;
    Mock::given(method("GET"))
        .and(query_param("getStatus", ""))
        .respond_with(ResponseTemplate::new(200).set_body_string("0;1;5122;0"))
        .mount(&device)
        .await;

    let address = device.uri();
    let harness = TestHarness::with(SimulatedDevices::new(), move |c| {
        c.dome.home_action = HomeAction::WriteCachedEncoder;
        c.device_http.address = address;
    })
    .await;
    harness.ctx.encoder.update(5120);

    let outcome = harness
        .orchestrator()
        .execute("Watchdog triggered", &CancellationToken::new())
        .await;

    assert_eq!(outcome, RecoveryOutcome::Succeeded);
    assert_eq!(harness.devices.dome_created(), 0);
    device.verify().await;
}

#[tokio::test]
async fn test_interrupted_entry_closed_on_next_attempt() {
    let harness = TestHarness::new().await;
    // une tentative laissée ouverte par un crash
    harness.ctx.history.begin_attempt(Some("before crash"));

    let outcome = harness
        .orchestrator()
        .execute("Watchdog triggered", &CancellationToken::new())
        .await;
    assert!(outcome.is_success());

    let entries = harness.ctx.history.recent(10);
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| !e.is_open()));
    assert!(!entries[1].success);
}

#[tokio::test]
async fn test_reconnect_budget_stops_driver_work_before_returning() {
    let devices = SimulatedDevices::new().slow_at_home(Duration::from_millis(1500));
    let harness = TestHarness::with(devices, |c| {
        c.dome.connect_timeout_secs = 0;
        c.dome.find_home_timeout_secs = 1;
        c.switches.connect_timeout_secs = 0;
        c.switches.ensure_timeout_secs = 0;
        c.recovery.reconnect_margin_secs = 0;
    })
    .await;

    let outcome = harness
        .orchestrator()
        .execute("Watchdog triggered", &CancellationToken::new())
        .await;

    let RecoveryOutcome::Failed(message) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(message.contains("budget"), "{message}");

    let calls_at_return = harness.devices.calls();
    assert!(harness.devices.calls_matching("dome.FindHome").is_empty());
    assert_eq!(calls_at_return.last().map(String::as_str), Some("dome.Connected=false"));

    // plus rien ne touche le dôme une fois l'échec rapporté
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(harness.devices.calls(), calls_at_return);

    let history = harness.ctx.history.recent(1);
    assert!(!history[0].is_open());
    assert!(!history[0].success);
    assert!(matches!(harness.consumer_state(), RecoveryState::Finished { failure: Some(_) }));
}

#[tokio::test]
async fn test_cancel_during_stage_wait_closes_history_and_signals_failure() {
    let harness = TestHarness::with(SimulatedDevices::new(), |c| c.recovery.post_power_wait_secs = 30).await;
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let outcome = harness.orchestrator().execute("Watchdog triggered", &cancel).await;
    assert!(started.elapsed() < Duration::from_secs(10));

    let RecoveryOutcome::Failed(message) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(message.contains("cancelled"), "{message}");
    assert_eq!(harness.devices.dome_created(), 0);

    let history = harness.ctx.history.recent(1);
    assert!(!history[0].is_open());
    assert!(!history[0].success);
    assert_eq!(history[0].error_message.as_deref(), Some(message.as_str()));
    assert_eq!(
        harness.consumer_state(),
        RecoveryState::Finished { failure: Some(message) }
    );
}

#[tokio::test]
async fn test_other_context_does_not_reset_running_recovery() {
    let harness = TestHarness::new().await;
    harness.ctx.signals.signal_start().unwrap();
    ConsumerSignals::request_pause(&harness.ctx.config.signals).unwrap();

    // une sous-commande (list-switches, test-drivers…) ouvre son propre contexte
    let _other = WatchdogContext::new(harness.ctx.config.as_ref().clone()).unwrap();

    assert_eq!(harness.consumer_state(), RecoveryState::InProgress);
    assert!(harness.ctx.signals.wait_for_consumer_pause(Duration::ZERO));
}

#[tokio::test]
async fn test_resume_flag_error_does_not_fail_recovery() {
    let devices = SimulatedDevices::new().at_home(true);
    let harness = TestHarness::with(devices, |_| {}).await;
    let signals = &harness.ctx.config.signals;
    ConsumerSignals::request_pause(signals).unwrap();
    // le flag "resume" ne peut pas être écrit
    std::fs::create_dir_all(signals.dir.join(format!("{}.flag", signals.resume_requested))).unwrap();

    let outcome = harness
        .orchestrator()
        .execute("Watchdog triggered", &CancellationToken::new())
        .await;

    assert_eq!(outcome, RecoveryOutcome::Succeeded);
    assert!(harness.ctx.history.recent(1)[0].success);
}
