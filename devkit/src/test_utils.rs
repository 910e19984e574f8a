/*!
Test Harness pour le watchdog DomeWatch

Assemble un contexte complet sans matériel :
- répertoires temporaires (signaux, historique, logs)
- drivers simulés, relais simulé, sonde scriptée
- délais d'étapes à zéro
*/

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use domewatch_agent::config::WatchdogConfig;
use domewatch_agent::probe::{Probe, ProbeOutcome};
use domewatch_agent::process::ProcessControl;
use domewatch_agent::signals::{ConsumerSignals, NamedFlag, RecoveryState};
use domewatch_agent::{HealthMonitor, RecoveryHandler, RecoveryOrchestrator, RecoveryOutcome, WatchdogContext};

use crate::driver_stub::SimulatedDevices;
use crate::power_stub::PowerSwitchStub;

pub const SIM_DOME: &str = "sim://dome/0";
pub const SIM_SWITCH: &str = "sim://switch/0";

/// Probe answering from a script, then with a fixed fallback
pub struct ScriptedProbe {
    script: Mutex<VecDeque<ProbeOutcome>>,
    fallback: Mutex<ProbeOutcome>,
    calls: AtomicU32,
}

impl ScriptedProbe {
    pub fn healthy() -> Self {
        Self::with_fallback(ProbeOutcome::Reply { rtt: Duration::from_millis(3) })
    }

    pub fn failing() -> Self {
        Self::with_fallback(ProbeOutcome::NoReply)
    }

    fn with_fallback(fallback: ProbeOutcome) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            calls: AtomicU32::new(0),
        }
    }

    /// Queue outcomes: `true` = reply
    pub fn push(&self, replies: &[bool]) {
        let mut script = self.script.lock();
        for &ok in replies {
            script.push_back(if ok {
                ProbeOutcome::Reply { rtt: Duration::from_millis(3) }
            } else {
                ProbeOutcome::NoReply
            });
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        *self.fallback.lock() = if healthy {
            ProbeOutcome::Reply { rtt: Duration::from_millis(3) }
        } else {
            ProbeOutcome::NoReply
        };
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Probe for ScriptedProbe {
    fn probe<'a>(&'a self, _target: &'a str, _timeout: Duration) -> BoxFuture<'a, anyhow::Result<ProbeOutcome>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.script.lock().pop_front().unwrap_or(*self.fallback.lock());
        Box::pin(async move { Ok(outcome) })
    }
}

/// Records stop/launch requests instead of touching real processes
#[derive(Default)]
pub struct RecordingProcessControl {
    calls: Mutex<Vec<String>>,
}

impl RecordingProcessControl {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl ProcessControl for RecordingProcessControl {
    fn stop_by_name(&self, name: &str) -> anyhow::Result<usize> {
        self.calls.lock().push(format!("stop:{name}"));
        Ok(1)
    }

    fn launch(&self, path: &Path) -> anyhow::Result<u32> {
        self.calls.lock().push(format!("launch:{}", path.display()));
        Ok(4242)
    }
}

/// Recovery handler that only counts, and notes whether the manual trigger
/// was still set when it was called
pub struct CountingRecoveryHandler {
    outcome: Mutex<RecoveryOutcome>,
    reasons: Mutex<Vec<String>>,
    trigger: Option<NamedFlag>,
    trigger_seen: Mutex<Vec<bool>>,
    panic: bool,
}

impl CountingRecoveryHandler {
    pub fn new(outcome: RecoveryOutcome) -> Self {
        Self {
            outcome: Mutex::new(outcome),
            reasons: Mutex::new(Vec::new()),
            trigger: None,
            trigger_seen: Mutex::new(Vec::new()),
            panic: false,
        }
    }

    pub fn watching(mut self, trigger: NamedFlag) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Panics on every call
    pub fn panicking() -> Self {
        Self { panic: true, ..Self::new(RecoveryOutcome::Succeeded) }
    }

    pub fn set_outcome(&self, outcome: RecoveryOutcome) {
        *self.outcome.lock() = outcome;
    }

    pub fn count(&self) -> usize {
        self.reasons.lock().len()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.reasons.lock().clone()
    }

    /// Manual trigger state observed at each call
    pub fn trigger_seen(&self) -> Vec<bool> {
        self.trigger_seen.lock().clone()
    }
}

impl RecoveryHandler for CountingRecoveryHandler {
    fn recover<'a>(&'a self, reason: &'a str, _cancel: &'a CancellationToken) -> BoxFuture<'a, RecoveryOutcome> {
        self.reasons.lock().push(reason.to_string());
        if let Some(trigger) = &self.trigger {
            self.trigger_seen.lock().push(trigger.is_set());
        }
        let panic = self.panic;
        let outcome = self.outcome.lock().clone();
        Box::pin(async move {
            if panic {
                panic!("simulated recovery panic");
            }
            outcome
        })
    }
}

/// Fully wired watchdog on temporary directories
pub struct TestHarness {
    pub dir: TempDir,
    pub ctx: WatchdogContext,
    pub devices: SimulatedDevices,
    pub power: PowerSwitchStub,
    pub probe: Arc<ScriptedProbe>,
    pub processes: Arc<RecordingProcessControl>,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with(SimulatedDevices::new(), |_| {}).await
    }

    /// Harness with custom devices and a config tweak applied last
    pub async fn with(devices: SimulatedDevices, tweak: impl FnOnce(&mut WatchdogConfig)) -> Self {
        tracing_subscriber::fmt().with_test_writer().try_init().ok();

        let dir = tempfile::tempdir().expect("tempdir");
        let power = PowerSwitchStub::start().await;
        let mut config = Self::base_config(dir.path(), &power.address());
        tweak(&mut config);

        let probe = Arc::new(ScriptedProbe::healthy());
        let processes = Arc::new(RecordingProcessControl::default());
        let ctx = WatchdogContext::new(config)
            .expect("watchdog context")
            .with_drivers(Arc::new(devices.clone()))
            .with_processes(processes.clone())
            .with_probe(probe.clone());

        Self { dir, ctx, devices, power, probe, processes }
    }

    /// Zero stage delays, simulated driver ids, no legacy switch
    pub fn base_config(root: &Path, power_address: &str) -> WatchdogConfig {
        let mut config = WatchdogConfig::default();
        config.probe.target = "dome.test".into();
        config.power.address = power_address.to_string();
        config.power.off_secs = 0;
        config.recovery.post_cycle_grace_secs = 0;
        config.recovery.pre_power_wait_secs = 0;
        config.recovery.post_power_wait_secs = 0;
        config.recovery.post_launch_wait_secs = 0;
        config.recovery.http_timeout_secs = 2;
        config.recovery.lock_name = "DomeWatchTestLock".into();
        config.dome.driver_id = SIM_DOME.into();
        config.dome.connect_retry_secs = 0;
        config.dome.connect_timeout_secs = 5;
        config.dome.find_home_timeout_secs = 5;
        config.dome.find_home_poll_ms = 10;
        config.switches.driver_id = SIM_SWITCH.into();
        config.switches.connect_retry_secs = 0;
        config.switches.connect_timeout_secs = 5;
        config.switches.legacy_index = None;
        config.device_http.address = power_address.to_string();
        config.signals.dir = root.join("signals");
        config.storage.data_dir = root.join("data");
        config.api.enabled = false;
        config
    }

    pub fn orchestrator(&self) -> RecoveryOrchestrator {
        RecoveryOrchestrator::new(self.ctx.clone())
            .expect("orchestrator")
            .with_verify_delay(Duration::ZERO)
    }

    pub fn monitor(&self, handler: Option<Arc<dyn RecoveryHandler>>) -> Arc<HealthMonitor> {
        Arc::new(HealthMonitor::new(self.ctx.clone(), handler).expect("monitor"))
    }

    /// The manual trigger flag as `domewatch-trigger` would open it
    pub fn manual_trigger(&self) -> NamedFlag {
        let signals = &self.ctx.config.signals;
        NamedFlag::at(&signals.dir, &signals.manual_trigger)
    }

    pub fn consumer_state(&self) -> RecoveryState {
        ConsumerSignals::observe(&self.ctx.config.signals)
    }

    /// Poll `check` until true or `timeout`
    pub async fn wait_until(&self, timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_probe_falls_back() {
        let probe = ScriptedProbe::healthy();
        probe.push(&[false]);
        assert!(!probe.probe("x", Duration::from_millis(1)).await.unwrap().is_reply());
        assert!(probe.probe("x", Duration::from_millis(1)).await.unwrap().is_reply());
        assert_eq!(probe.calls(), 2);
    }

    #[tokio::test]
    async fn test_harness_uses_temp_dirs() {
        let harness = TestHarness::new().await;
        assert!(harness.ctx.config.signals.dir.starts_with(harness.dir.path()));
        assert_eq!(harness.consumer_state(), RecoveryState::Idle);
        assert_eq!(harness.power.output(0), Some(true));
    }
}
