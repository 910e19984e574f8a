//! Auxiliary switch cache
//!
//! Keeps a recent snapshot of the monitored auxiliary switches (fan, heater…)
//! so their state can be put back after the dome has been power-cycled.
//! Every driver access goes through the driver executor. Not running while a
//! recovery owns the driver is the caller's job.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MonitoredSwitch;
use crate::driver::{connect_with_retry, DriverFactory, RetryPolicy, Session, SwitchDriver};
use crate::executor::DriverExecutor;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedSwitchState {
    pub index: u32,
    pub name: String,
    pub state: Option<bool>,
    pub value: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

/// One row of a full switch listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchInfo {
    pub index: u32,
    pub name: Option<String>,
    pub can_write: Option<bool>,
    pub state: Option<bool>,
    pub value: Option<f64>,
}

/// Read state and value of each switch; either may be unavailable.
pub fn read_states(driver: &mut dyn SwitchDriver, switches: &[MonitoredSwitch]) -> Vec<CachedSwitchState> {
    let mut states = Vec::with_capacity(switches.len());
    for switch in switches {
        let state = driver
            .get_switch(switch.index)
            .map_err(|e| debug!("GetSwitch({}) unavailable: {}", switch.index, e))
            .ok();
        let value = driver
            .get_switch_value(switch.index)
            .map_err(|e| debug!("GetSwitchValue({}) unavailable: {}", switch.index, e))
            .ok();

        if state.is_none() && value.is_none() {
            warn!("switch {} ({}) could not be read, skipped", switch.index, switch.name);
            continue;
        }
        states.push(CachedSwitchState {
            index: switch.index,
            name: switch.name.clone(),
            state,
            value,
            captured_at: Utc::now(),
        });
    }
    states
}

/// Put each cached switch back; returns how many were restored.
///
/// Boolean set first, numeric set when that failed or no boolean was cached.
/// A switch reporting `CanWrite == false` is skipped; if `CanWrite` itself
/// fails the switch is assumed writable.
pub fn restore_states(driver: &mut dyn SwitchDriver, states: &[CachedSwitchState]) -> usize {
    let mut restored = 0;
    for cached in states {
        match driver.can_write(cached.index) {
            Ok(false) => {
                info!("switch {} ({}) is read-only, skipped", cached.index, cached.name);
                continue;
            }
            Ok(true) => {}
            Err(e) => debug!("CanWrite({}) failed ({}), assuming writable", cached.index, e),
        }

        let mut done = false;
        if let Some(state) = cached.state {
            match driver.set_switch(cached.index, state) {
                Ok(()) => done = true,
                Err(e) => debug!("SetSwitch({}, {}) failed: {}", cached.index, state, e),
            }
        }
        if !done {
            if let Some(value) = cached.value {
                match driver.set_switch_value(cached.index, value) {
                    Ok(()) => done = true,
                    Err(e) => debug!("SetSwitchValue({}, {}) failed: {}", cached.index, value, e),
                }
            }
        }

        if done {
            info!("✅ restored switch {} ({})", cached.index, cached.name);
            restored += 1;
        } else {
            warn!("failed to restore switch {} ({})", cached.index, cached.name);
        }
    }
    restored
}

pub struct AuxiliarySwitchCache {
    executor: Arc<DriverExecutor>,
    drivers: Arc<dyn DriverFactory>,
    states: Mutex<BTreeMap<u32, CachedSwitchState>>,
}

impl AuxiliarySwitchCache {
    pub fn new(executor: Arc<DriverExecutor>, drivers: Arc<dyn DriverFactory>) -> Self {
        Self {
            executor,
            drivers,
            states: Mutex::new(BTreeMap::new()),
        }
    }

    /// Connect once, read every configured switch, update the map, disconnect.
    pub async fn snapshot(
        &self,
        driver_id: &str,
        switches: &[MonitoredSwitch],
        cancel: &CancellationToken,
    ) -> Result<Vec<CachedSwitchState>> {
        if switches.is_empty() {
            return Ok(Vec::new());
        }
        let drivers = self.drivers.clone();
        let id = driver_id.to_string();
        let wanted = switches.to_vec();
        let token = cancel.clone();

        let states = self
            .executor
            .submit(cancel, move || -> Result<Vec<CachedSwitchState>> {
                let mut driver = Session::new(connect_with_retry("switch driver", &RetryPolicy::once(), &token, || {
                    drivers.create_switch(&id)
                })?);
                Ok(read_states(&mut *driver, &wanted))
            })
            .await??;

        let mut map = self.states.lock();
        for state in &states {
            map.insert(state.index, state.clone());
        }
        debug!("cached {} auxiliary switch state(s)", states.len());
        Ok(states)
    }

    /// Connect once, restore each state, disconnect. `Ok(true)` once the
    /// batch ran, whatever the individual switches did.
    pub async fn restore(
        &self,
        driver_id: &str,
        states: Vec<CachedSwitchState>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if states.is_empty() {
            return Ok(true);
        }
        let drivers = self.drivers.clone();
        let id = driver_id.to_string();
        let token = cancel.clone();

        self.executor
            .submit(cancel, move || -> Result<bool> {
                let mut driver = Session::new(connect_with_retry("switch driver", &RetryPolicy::once(), &token, || {
                    drivers.create_switch(&id)
                })?);
                let restored = restore_states(&mut *driver, &states);
                info!("restored {}/{} auxiliary switch(es)", restored, states.len());
                Ok(true)
            })
            .await?
    }

    /// Current cached values, by index
    pub fn current_snapshot(&self) -> Vec<CachedSwitchState> {
        self.states.lock().values().cloned().collect()
    }

    pub fn has_snapshot(&self) -> bool {
        !self.states.lock().is_empty()
    }

    /// Every switch `0..MaxSwitch` with whatever could be read.
    pub async fn enumerate(&self, driver_id: &str, cancel: &CancellationToken) -> Result<Vec<SwitchInfo>> {
        let drivers = self.drivers.clone();
        let id = driver_id.to_string();
        let token = cancel.clone();

        self.executor
            .submit(cancel, move || -> Result<Vec<SwitchInfo>> {
                let mut driver = Session::new(connect_with_retry("switch driver", &RetryPolicy::once(), &token, || {
                    drivers.create_switch(&id)
                })?);
                match driver.max_switch() {
                    Ok(max) => Ok((0..max)
                        .map(|index| SwitchInfo {
                            index,
                            name: driver.switch_name(index).ok(),
                            can_write: driver.can_write(index).ok(),
                            state: driver.get_switch(index).ok(),
                            value: driver.get_switch_value(index).ok(),
                        })
                        .collect()),
                    Err(e) => Err(anyhow!("MaxSwitch unavailable: {e}")),
                }
            })
            .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Connectable, DriverError, DriverResult};
    use std::collections::HashMap;

    #[derive(Default)]
    struct Board {
        states: HashMap<u32, bool>,
        values: HashMap<u32, f64>,
        read_only: Vec<u32>,
        no_bool: Vec<u32>,
        calls: Vec<String>,
    }

    impl Connectable for Board {
        fn set_connected(&mut self, _connected: bool) -> DriverResult<()> {
            Ok(())
        }
        fn is_connected(&mut self) -> DriverResult<bool> {
            Ok(true)
        }
    }

    impl SwitchDriver for Board {
        fn max_switch(&mut self) -> DriverResult<u32> {
            Ok(20)
        }
        fn switch_name(&mut self, index: u32) -> DriverResult<String> {
            Ok(format!("switch {index}"))
        }
        fn can_write(&mut self, index: u32) -> DriverResult<bool> {
            Ok(!self.read_only.contains(&index))
        }
        fn get_switch(&mut self, index: u32) -> DriverResult<bool> {
            self.states.get(&index).copied().ok_or(DriverError::NotImplemented("GetSwitch".into()))
        }
        fn set_switch(&mut self, index: u32, state: bool) -> DriverResult<()> {
            self.calls.push(format!("SetSwitch({index},{state})"));
            if self.no_bool.contains(&index) {
                return Err(DriverError::NotImplemented("SetSwitch".into()));
            }
            self.states.insert(index, state);
            Ok(())
        }
        fn get_switch_value(&mut self, index: u32) -> DriverResult<f64> {
            self.values.get(&index).copied().ok_or(DriverError::NotImplemented("GetSwitchValue".into()))
        }
        fn set_switch_value(&mut self, index: u32, value: f64) -> DriverResult<()> {
            self.calls.push(format!("SetSwitchValue({index},{value})"));
            self.values.insert(index, value);
            Ok(())
        }
    }

    fn cached(index: u32, state: Option<bool>, value: Option<f64>) -> CachedSwitchState {
        CachedSwitchState { index, name: format!("aux {index}"), state, value, captured_at: Utc::now() }
    }

    #[test]
    fn test_boolean_restore_issues_no_numeric_call() {
        let mut board = Board::default();
        let restored = restore_states(&mut board, &[cached(18, Some(true), None)]);
        assert_eq!(restored, 1);
        assert_eq!(board.calls, vec!["SetSwitch(18,true)"]);
    }

    #[test]
    fn test_numeric_fallback_when_boolean_unsupported() {
        let mut board = Board { no_bool: vec![4], ..Default::default() };
        let restored = restore_states(&mut board, &[cached(4, Some(true), Some(0.75))]);
        assert_eq!(restored, 1);
        assert_eq!(board.calls, vec!["SetSwitch(4,true)", "SetSwitchValue(4,0.75)"]);
    }

    #[test]
    fn test_read_only_and_failing_switches_do_not_stop_the_batch() {
        let mut board = Board { read_only: vec![1], no_bool: vec![2], ..Default::default() };
        let states = [
            cached(1, Some(true), None),
            cached(2, Some(false), None), // no value to fall back on
            cached(3, None, Some(12.0)),
        ];
        let restored = restore_states(&mut board, &states);
        assert_eq!(restored, 1);
        assert_eq!(board.calls, vec!["SetSwitch(2,false)", "SetSwitchValue(3,12)"]);
    }

    #[test]
    fn test_read_states_keeps_partial_reads() {
        let mut board = Board::default();
        board.states.insert(18, true);
        board.values.insert(18, 1.0);
        board.values.insert(5, 40.0);
        let wanted = vec![
            MonitoredSwitch { index: 18, name: "Fan".into() },
            MonitoredSwitch { index: 5, name: "Heater".into() },
            MonitoredSwitch { index: 9, name: "Ghost".into() },
        ];
        let states = read_states(&mut board, &wanted);
        assert_eq!(states.len(), 2);
        assert_eq!((states[0].state, states[0].value), (Some(true), Some(1.0)));
        assert_eq!((states[1].state, states[1].value), (None, Some(40.0)));
    }
}
