//! Device reconnection sub-sequence
//!
//! Runs as one unit of work on the driver executor thread:
//! 1. auto-home mode only: connect the dome, home it unless already home
//! 2. connect the switch board, restore cached switches (or the legacy one)
//!
//! Only a connection that can't be established within its budget and a
//! homing that doesn't finish in time are hard failures. Every driver object
//! is disconnected whatever happens.

use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{HomeAction, WatchdogConfig};
use crate::driver::{
    connect_with_retry, sleep_or_cancelled, ConnectError, DomeDriver, DriverError, DriverFactory,
    RetryPolicy, Session, SwitchDriver,
};
use crate::switch_cache::{restore_states, CachedSwitchState};

const HOMING_LOG_EVERY: Duration = Duration::from_secs(10);
const LEGACY_RETRY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("FindHome did not complete within {timeout:?} (last azimuth {last_azimuth:?})")]
    HomingTimeout { timeout: Duration, last_azimuth: Option<f64> },
    #[error("FindHome failed: {0}")]
    FindHome(DriverError),
    #[error("reconnection cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HomingOutcome {
    AlreadyHome,
    Homed { after: Duration },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconnectReport {
    /// None when the dome part was skipped (write-cached-encoder mode)
    pub homing: Option<HomingOutcome>,
    pub switches_restored: usize,
    pub switches_attempted: usize,
}

/// Everything the sub-sequence needs, owned so it can move to the executor.
#[derive(Debug, Clone)]
pub struct ReconnectPlan {
    pub home_action: HomeAction,
    pub dome_id: String,
    pub dome_policy: RetryPolicy,
    pub homing_timeout: Duration,
    pub homing_poll: Duration,
    pub switch_id: String,
    pub switch_policy: RetryPolicy,
    pub snapshot: Vec<CachedSwitchState>,
    pub legacy_switch: Option<(u32, bool)>,
    pub ensure_timeout: Duration,
}

impl ReconnectPlan {
    pub fn from_config(config: &WatchdogConfig, snapshot: Vec<CachedSwitchState>) -> Self {
        Self {
            home_action: config.dome.home_action,
            dome_id: config.dome.driver_id.clone(),
            dome_policy: RetryPolicy::from_secs(config.dome.connect_timeout_secs, config.dome.connect_retry_secs),
            homing_timeout: Duration::from_secs(config.dome.find_home_timeout_secs),
            homing_poll: Duration::from_millis(config.dome.find_home_poll_ms.max(10)),
            switch_id: config.switches.driver_id.clone(),
            switch_policy: RetryPolicy::from_secs(
                config.switches.connect_timeout_secs,
                config.switches.connect_retry_secs,
            ),
            snapshot,
            legacy_switch: config.switches.legacy_index.map(|i| (i, config.switches.legacy_state)),
            ensure_timeout: Duration::from_secs(config.switches.ensure_timeout_secs),
        }
    }
}

pub fn run(
    drivers: &dyn DriverFactory,
    plan: &ReconnectPlan,
    cancel: &CancellationToken,
) -> Result<ReconnectReport, ReconnectError> {
    let mut report = ReconnectReport::default();

    if plan.home_action == HomeAction::AutoHome {
        let mut dome = Session::new(connect_with_retry("dome driver", &plan.dome_policy, cancel, || {
            drivers.create_dome(&plan.dome_id)
        })?);
        report.homing = Some(home_dome(&mut *dome, plan.homing_timeout, plan.homing_poll, cancel)?);
    } else {
        info!("home action is write-cached-encoder, dome homing skipped");
    }

    let wanted = if !plan.snapshot.is_empty() {
        plan.snapshot.len()
    } else {
        usize::from(plan.legacy_switch.is_some())
    };
    if wanted == 0 || plan.switch_id.is_empty() {
        info!("no auxiliary switch to restore");
        return Ok(report);
    }

    let mut switch = Session::new(connect_with_retry("switch driver", &plan.switch_policy, cancel, || {
        drivers.create_switch(&plan.switch_id)
    })?);
    report.switches_attempted = wanted;
    if cancel.is_cancelled() {
        return Err(ReconnectError::Cancelled);
    }

    if !plan.snapshot.is_empty() {
        report.switches_restored = restore_states(&mut *switch, &plan.snapshot);
    } else if let Some((index, state)) = plan.legacy_switch {
        if ensure_switch(&mut *switch, index, state, plan.ensure_timeout, cancel) {
            report.switches_restored = 1;
        }
    }
    Ok(report)
}

/// Home the dome and wait for it; falls back to "not slewing" when the
/// driver has no AtHome.
pub fn home_dome(
    dome: &mut dyn DomeDriver,
    timeout: Duration,
    poll: Duration,
    cancel: &CancellationToken,
) -> Result<HomingOutcome, ReconnectError> {
    match dome.can_find_home() {
        Ok(true) => {}
        Ok(false) => warn!("⚠️ CanFindHome is false, calling FindHome anyway"),
        Err(e) => warn!("⚠️ CanFindHome unavailable: {}", e),
    }

    if dome.at_home().unwrap_or(false) {
        info!("🏠 dome already at home");
        return Ok(HomingOutcome::AlreadyHome);
    }

    if cancel.is_cancelled() {
        return Err(ReconnectError::Cancelled);
    }
    info!("🏠 FindHome");
    dome.find_home().map_err(ReconnectError::FindHome)?;

    let started = Instant::now();
    let mut last_log = started;
    let mut last_azimuth = None;
    loop {
        if sleep_or_cancelled(cancel, poll) {
            return Err(ReconnectError::Cancelled);
        }

        let home = match dome.at_home() {
            Ok(home) => home,
            Err(e) if e.is_not_implemented() => !dome.slewing().unwrap_or(true),
            Err(_) => false,
        };
        if let Ok(azimuth) = dome.azimuth() {
            last_azimuth = Some(azimuth);
        }

        if home {
            info!("🏠 dome homed in {:?} (azimuth {:?})", started.elapsed(), last_azimuth);
            return Ok(HomingOutcome::Homed { after: started.elapsed() });
        }
        if last_log.elapsed() >= HOMING_LOG_EVERY {
            info!("homing… {:?} elapsed, azimuth {:?}", started.elapsed(), last_azimuth);
            last_log = Instant::now();
        }
        if started.elapsed() >= timeout {
            return Err(ReconnectError::HomingTimeout { timeout, last_azimuth });
        }
    }
}

/// Legacy single switch: retry until it takes or `timeout` runs out.
fn ensure_switch(
    driver: &mut dyn SwitchDriver,
    index: u32,
    state: bool,
    timeout: Duration,
    cancel: &CancellationToken,
) -> bool {
    let started = Instant::now();
    loop {
        let applied = driver.set_switch(index, state).or_else(|e| {
            if e.is_not_implemented() {
                driver.set_switch_value(index, if state { 1.0 } else { 0.0 })
            } else {
                Err(e)
            }
        });
        match applied {
            Ok(()) => {
                info!("✅ switch {} set to {}", index, state);
                return true;
            }
            Err(e) => warn!("switch {} not set yet: {}", index, e),
        }
        if started.elapsed() + LEGACY_RETRY >= timeout || sleep_or_cancelled(cancel, LEGACY_RETRY) {
            warn!("⚠️ failed to ensure switch {} = {}", index, state);
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Connectable, DriverResult};

    struct Dome {
        at_home: Option<bool>,
        polls_until_home: u32,
        slewing: bool,
        find_home_calls: u32,
    }

    impl Connectable for Dome {
        fn set_connected(&mut self, _c: bool) -> DriverResult<()> {
            Ok(())
        }
        fn is_connected(&mut self) -> DriverResult<bool> {
            Ok(true)
        }
    }

    impl DomeDriver for Dome {
        fn can_find_home(&mut self) -> DriverResult<bool> {
            Err(DriverError::NotImplemented("CanFindHome".into()))
        }
        fn at_home(&mut self) -> DriverResult<bool> {
            if self.find_home_calls > 0 {
                if self.polls_until_home == 0 {
                    self.at_home = self.at_home.map(|_| true);
                    self.slewing = false;
                } else {
                    self.polls_until_home -= 1;
                }
            }
            self.at_home.ok_or(DriverError::NotImplemented("AtHome".into()))
        }
        fn slewing(&mut self) -> DriverResult<bool> {
            Ok(self.slewing)
        }
        fn azimuth(&mut self) -> DriverResult<f64> {
            Ok(12.0)
        }
        fn find_home(&mut self) -> DriverResult<()> {
            self.find_home_calls += 1;
            self.slewing = true;
            Ok(())
        }
    }

    fn poll() -> Duration {
        Duration::from_millis(5)
    }

    #[test]
    fn test_already_home_skips_find_home() {
        let mut dome = Dome { at_home: Some(true), polls_until_home: 0, slewing: false, find_home_calls: 0 };
        let outcome = home_dome(&mut dome, Duration::from_secs(1), poll(), &CancellationToken::new()).unwrap();
        assert_eq!(outcome, HomingOutcome::AlreadyHome);
        assert_eq!(dome.find_home_calls, 0);
    }

    #[test]
    fn test_homing_completes_after_polls() {
        let mut dome = Dome { at_home: Some(false), polls_until_home: 3, slewing: false, find_home_calls: 0 };
        let outcome = home_dome(&mut dome, Duration::from_secs(2), poll(), &CancellationToken::new()).unwrap();
        assert!(matches!(outcome, HomingOutcome::Homed { .. }));
        assert_eq!(dome.find_home_calls, 1);
    }

    #[test]
    fn test_falls_back_to_slewing_without_at_home() {
        let mut dome = Dome { at_home: None, polls_until_home: 2, slewing: false, find_home_calls: 0 };
        let outcome = home_dome(&mut dome, Duration::from_secs(2), poll(), &CancellationToken::new()).unwrap();
        assert!(matches!(outcome, HomingOutcome::Homed { .. }));
    }

    #[test]
    fn test_homing_timeout() {
        let mut dome = Dome { at_home: Some(false), polls_until_home: u32::MAX, slewing: true, find_home_calls: 0 };
        let result = home_dome(&mut dome, Duration::from_millis(50), poll(), &CancellationToken::new());
        match result {
            Err(ReconnectError::HomingTimeout { last_azimuth, .. }) => assert_eq!(last_azimuth, Some(12.0)),
            other => panic!("expected homing timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_cancelled_before_find_home() {
        let mut dome = Dome { at_home: Some(false), polls_until_home: 0, slewing: false, find_home_calls: 0 };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = home_dome(&mut dome, Duration::from_secs(1), poll(), &cancel);
        assert!(matches!(result, Err(ReconnectError::Cancelled)));
        assert_eq!(dome.find_home_calls, 0);
    }

    #[test]
    fn test_plan_from_config() {
        let config = WatchdogConfig::default();
        let plan = ReconnectPlan::from_config(&config, Vec::new());
        assert_eq!(plan.dome_policy, RetryPolicy::from_secs(180, 5));
        assert_eq!(plan.switch_policy, RetryPolicy::from_secs(60, 3));
        assert_eq!(plan.legacy_switch, Some((18, true)));
        assert_eq!(plan.homing_poll, Duration::from_millis(500));
    }
}
