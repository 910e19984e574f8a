//! Driver connection test, run from `domewatch-agent test-drivers`.
//!
//! Connects to each configured driver once with its own retry policy,
//! reads a few properties and disconnects. Nothing is moved.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::WatchdogConfig;
use crate::driver::{connect_with_retry, DriverFactory, RetryPolicy, Session};
use crate::executor::DriverExecutor;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DomeReport {
    pub connected: bool,
    pub error: Option<String>,
    pub can_find_home: Option<bool>,
    pub at_home: Option<bool>,
    pub azimuth: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SwitchReport {
    pub connected: bool,
    pub error: Option<String>,
    pub max_switch: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionReport {
    /// None when no dome driver id is configured
    pub dome: Option<DomeReport>,
    pub switches: Option<SwitchReport>,
}

fn test_dome(drivers: &dyn DriverFactory, id: &str, policy: &RetryPolicy, cancel: &CancellationToken) -> DomeReport {
    match connect_with_retry("dome driver", policy, cancel, || drivers.create_dome(id)) {
        Ok(dome) => {
            let mut dome = Session::new(dome);
            DomeReport {
                connected: true,
                error: None,
                can_find_home: dome.can_find_home().ok(),
                at_home: dome.at_home().ok(),
                azimuth: dome.azimuth().ok(),
            }
        }
        Err(e) => DomeReport { error: Some(e.to_string()), ..Default::default() },
    }
}

fn test_switch(drivers: &dyn DriverFactory, id: &str, policy: &RetryPolicy, cancel: &CancellationToken) -> SwitchReport {
    match connect_with_retry("switch driver", policy, cancel, || drivers.create_switch(id)) {
        Ok(switch) => {
            let mut switch = Session::new(switch);
            SwitchReport {
                connected: true,
                error: None,
                max_switch: switch.max_switch().ok(),
            }
        }
        Err(e) => SwitchReport { error: Some(e.to_string()), ..Default::default() },
    }
}

/// Both drivers, one after the other, on the driver executor.
pub async fn test_connections(
    config: &WatchdogConfig,
    executor: &DriverExecutor,
    drivers: Arc<dyn DriverFactory>,
    cancel: &CancellationToken,
) -> Result<ConnectionReport> {
    let dome_id = Some(config.dome.driver_id.clone()).filter(|id| !id.is_empty());
    let switch_id = Some(config.switches.driver_id.clone()).filter(|id| !id.is_empty());
    let dome_policy = RetryPolicy::from_secs(config.dome.connect_timeout_secs, config.dome.connect_retry_secs);
    let switch_policy =
        RetryPolicy::from_secs(config.switches.connect_timeout_secs, config.switches.connect_retry_secs);
    let token = cancel.clone();

    let report = executor
        .submit(cancel, move || ConnectionReport {
            dome: dome_id.map(|id| test_dome(drivers.as_ref(), &id, &dome_policy, &token)),
            switches: switch_id.map(|id| test_switch(drivers.as_ref(), &id, &switch_policy, &token)),
        })
        .await?;

    info!("driver test: dome {:?}, switches {:?}", report.dome, report.switches);
    Ok(report)
}
