/*!
Drivers simulés pour tester sans dôme ni carte de relais

`SimulatedDevices` implémente `DriverFactory` : chaque objet créé partage le
même état, et chaque appel est enregistré (`"dome.FindHome"`,
`"switch.SetSwitch(18,true)"`…) pour les assertions.
*/

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use domewatch_agent::driver::{
    Connectable, DomeDriver, DriverError, DriverFactory, DriverResult, SwitchDriver,
};

/// One simulated auxiliary switch
#[derive(Debug, Clone, PartialEq)]
pub struct SimSwitch {
    pub name: String,
    pub state: bool,
    pub value: f64,
    pub writable: bool,
    /// SetSwitch unsupported: only the numeric path works
    pub numeric_only: bool,
}

impl SimSwitch {
    pub fn new(name: &str, state: bool) -> Self {
        Self {
            name: name.to_string(),
            state,
            value: if state { 1.0 } else { 0.0 },
            writable: true,
            numeric_only: false,
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    calls: Vec<String>,
    dome_connect_failures: u32,
    switch_connect_failures: u32,
    dome_created: u32,
    switch_created: u32,
    disconnects: u32,
    at_home: bool,
    at_home_supported: bool,
    /// AtHome polls after FindHome before the dome reports home; None = never
    homing_polls: Option<u32>,
    homing: bool,
    /// AtHome blocks this long, like a driver stuck on a slow bus
    at_home_delay: Option<Duration>,
    azimuth: f64,
    switches: BTreeMap<u32, SimSwitch>,
}

/// Simulated dome + switch drivers behind one shared state
#[derive(Clone)]
pub struct SimulatedDevices {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDevices {
    /// Dome away from home, homing after 2 polls; no switches
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                at_home_supported: true,
                homing_polls: Some(2),
                azimuth: 90.0,
                ..Default::default()
            })),
        }
    }

    /// First `n` dome connection attempts fail
    pub fn fail_dome_connects(self, n: u32) -> Self {
        self.state.lock().dome_connect_failures = n;
        self
    }

    /// First `n` switch connection attempts fail
    pub fn fail_switch_connects(self, n: u32) -> Self {
        self.state.lock().switch_connect_failures = n;
        self
    }

    pub fn at_home(self, home: bool) -> Self {
        self.state.lock().at_home = home;
        self
    }

    /// AtHome not implemented: homing is detected through Slewing
    pub fn without_at_home(self) -> Self {
        self.state.lock().at_home_supported = false;
        self
    }

    /// Dome never reaches home after FindHome
    pub fn never_homes(self) -> Self {
        self.state.lock().homing_polls = None;
        self
    }

    /// Every AtHome read blocks the calling thread for `delay`
    pub fn slow_at_home(self, delay: Duration) -> Self {
        self.state.lock().at_home_delay = Some(delay);
        self
    }

    pub fn with_switch(self, index: u32, switch: SimSwitch) -> Self {
        self.state.lock().switches.insert(index, switch);
        self
    }

    /// Change a switch behind the watchdog's back (e.g. the power cycle reset it)
    pub fn set_switch_state(&self, index: u32, on: bool) {
        if let Some(switch) = self.state.lock().switches.get_mut(&index) {
            switch.state = on;
            switch.value = if on { 1.0 } else { 0.0 };
        }
    }

    pub fn switch(&self, index: u32) -> Option<SimSwitch> {
        self.state.lock().switches.get(&index).cloned()
    }

    /// Every recorded call, in order
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn dome_created(&self) -> u32 {
        self.state.lock().dome_created
    }

    pub fn switch_created(&self) -> u32 {
        self.state.lock().switch_created
    }

    /// `Connected = false` calls across all objects
    pub fn disconnects(&self) -> u32 {
        self.state.lock().disconnects
    }

    pub fn is_home(&self) -> bool {
        self.state.lock().at_home
    }
}

impl DriverFactory for SimulatedDevices {
    fn create_dome(&self, driver_id: &str) -> DriverResult<Box<dyn DomeDriver>> {
        let mut state = self.state.lock();
        state.dome_created += 1;
        state.calls.push(format!("dome.create({driver_id})"));
        Ok(Box::new(SimDome { state: self.state.clone(), connected: false }))
    }

    fn create_switch(&self, driver_id: &str) -> DriverResult<Box<dyn SwitchDriver>> {
        let mut state = self.state.lock();
        state.switch_created += 1;
        state.calls.push(format!("switch.create({driver_id})"));
        Ok(Box::new(SimBoard { state: self.state.clone(), connected: false }))
    }
}

struct SimDome {
    state: Arc<Mutex<SimState>>,
    connected: bool,
}

impl Connectable for SimDome {
    fn set_connected(&mut self, connected: bool) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("dome.Connected={connected}"));
        if !connected {
            state.disconnects += 1;
            self.connected = false;
            return Ok(());
        }
        if state.dome_connect_failures > 0 {
            state.dome_connect_failures -= 1;
            return Err(DriverError::Transport("simulated dome connect failure".into()));
        }
        self.connected = true;
        Ok(())
    }

    fn is_connected(&mut self) -> DriverResult<bool> {
        Ok(self.connected)
    }
}

impl DomeDriver for SimDome {
    fn can_find_home(&mut self) -> DriverResult<bool> {
        Ok(true)
    }

    fn at_home(&mut self) -> DriverResult<bool> {
        let delay = self.state.lock().at_home_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let mut state = self.state.lock();
        if !state.at_home_supported {
            return Err(DriverError::NotImplemented("AtHome".into()));
        }
        advance_homing(&mut state);
        Ok(state.at_home)
    }

    fn slewing(&mut self) -> DriverResult<bool> {
        let mut state = self.state.lock();
        advance_homing(&mut state);
        Ok(state.homing)
    }

    fn azimuth(&mut self) -> DriverResult<f64> {
        Ok(self.state.lock().azimuth)
    }

    fn find_home(&mut self) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.calls.push("dome.FindHome".into());
        state.homing = true;
        Ok(())
    }
}

fn advance_homing(state: &mut SimState) {
    if !state.homing {
        return;
    }
    match state.homing_polls {
        Some(0) => {
            state.homing = false;
            state.at_home = true;
            state.azimuth = 0.0;
            debug!("[SIM] dome reached home");
        }
        Some(n) => {
            state.homing_polls = Some(n - 1);
            state.azimuth = (state.azimuth + 15.0) % 360.0;
        }
        None => state.azimuth = (state.azimuth + 15.0) % 360.0,
    }
}

struct SimBoard {
    state: Arc<Mutex<SimState>>,
    connected: bool,
}

impl SimBoard {
    fn with_switch<T>(&self, index: u32, f: impl FnOnce(&mut SimSwitch) -> DriverResult<T>) -> DriverResult<T> {
        let mut state = self.state.lock();
        match state.switches.get_mut(&index) {
            Some(switch) => f(switch),
            None => Err(DriverError::Device { code: 0x401, message: format!("no switch {index}") }),
        }
    }
}

impl Connectable for SimBoard {
    fn set_connected(&mut self, connected: bool) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("switch.Connected={connected}"));
        if !connected {
            state.disconnects += 1;
            self.connected = false;
            return Ok(());
        }
        if state.switch_connect_failures > 0 {
            state.switch_connect_failures -= 1;
            return Err(DriverError::Transport("simulated switch connect failure".into()));
        }
        self.connected = true;
        Ok(())
    }

    fn is_connected(&mut self) -> DriverResult<bool> {
        Ok(self.connected)
    }
}

impl SwitchDriver for SimBoard {
    fn max_switch(&mut self) -> DriverResult<u32> {
        Ok(self.state.lock().switches.keys().max().map_or(0, |m| m + 1))
    }

    fn switch_name(&mut self, index: u32) -> DriverResult<String> {
        self.with_switch(index, |s| Ok(s.name.clone()))
    }

    fn can_write(&mut self, index: u32) -> DriverResult<bool> {
        self.with_switch(index, |s| Ok(s.writable))
    }

    fn get_switch(&mut self, index: u32) -> DriverResult<bool> {
        self.with_switch(index, |s| Ok(s.state))
    }

    fn set_switch(&mut self, index: u32, on: bool) -> DriverResult<()> {
        self.state.lock().calls.push(format!("switch.SetSwitch({index},{on})"));
        self.with_switch(index, |s| {
            if s.numeric_only {
                return Err(DriverError::NotImplemented("SetSwitch".into()));
            }
            s.state = on;
            s.value = if on { 1.0 } else { 0.0 };
            Ok(())
        })
    }

    fn get_switch_value(&mut self, index: u32) -> DriverResult<f64> {
        self.with_switch(index, |s| Ok(s.value))
    }

    fn set_switch_value(&mut self, index: u32, value: f64) -> DriverResult<()> {
        self.state.lock().calls.push(format!("switch.SetSwitchValue({index},{value})"));
        self.with_switch(index, |s| {
            s.value = value;
            s.state = value != 0.0;
            Ok(())
        })
    }
}
