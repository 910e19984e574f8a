//! ASCOM Alpaca adapter
//!
//! Binds the driver traits to the Alpaca REST protocol:
//! - GET  `{device}/{member}?ClientID=..&ClientTransactionID=..`
//! - PUT  `{device}/{member}` with a form body
//! - every reply is `{"Value": .., "ErrorNumber": n, "ErrorMessage": ".."}`
//!
//! A driver id is the device base URL, e.g. `http://host:11111/api/v1/dome/0`.
//! Calls are blocking; they only ever run on the driver executor thread.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use super::{Connectable, DomeDriver, DriverError, DriverFactory, DriverResult, SwitchDriver};

/// Alpaca "not implemented" error number
const NOT_IMPLEMENTED: i32 = 0x400;
const CLIENT_ID: u32 = 4242;

static TRANSACTION: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AlpacaReply<T> {
    value: Option<T>,
    #[serde(default)]
    error_number: i32,
    #[serde(default)]
    error_message: String,
}

pub struct AlpacaDriverFactory {
    timeout: Duration,
}

impl AlpacaDriverFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn device(&self, driver_id: &str, kind: &str) -> DriverResult<AlpacaDevice> {
        let base = driver_id.trim_end_matches('/');
        let valid_scheme = base.starts_with("http://") || base.starts_with("https://");
        if !valid_scheme || !base.contains(&format!("/{kind}/")) {
            return Err(DriverError::UnknownDriver(driver_id.to_string()));
        }
        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| DriverError::Transport(e.to_string()))?;
        Ok(AlpacaDevice { client, base: base.to_string() })
    }
}

impl DriverFactory for AlpacaDriverFactory {
    fn create_dome(&self, driver_id: &str) -> DriverResult<Box<dyn DomeDriver>> {
        Ok(Box::new(self.device(driver_id, "dome")?))
    }

    fn create_switch(&self, driver_id: &str) -> DriverResult<Box<dyn SwitchDriver>> {
        Ok(Box::new(self.device(driver_id, "switch")?))
    }
}

struct AlpacaDevice {
    client: Client,
    base: String,
}

fn next_transaction() -> String {
    TRANSACTION.fetch_add(1, Ordering::Relaxed).to_string()
}

fn check<T>(member: &str, reply: AlpacaReply<T>) -> DriverResult<Option<T>> {
    match reply.error_number {
        0 => Ok(reply.value),
        NOT_IMPLEMENTED => Err(DriverError::NotImplemented(member.to_string())),
        code => Err(DriverError::Device { code, message: reply.error_message }),
    }
}

impl AlpacaDevice {
    fn get<T: DeserializeOwned>(&self, member: &str, params: &[(&str, String)]) -> DriverResult<T> {
        let mut query = vec![
            ("ClientID", CLIENT_ID.to_string()),
            ("ClientTransactionID", next_transaction()),
        ];
        query.extend(params.iter().map(|(k, v)| (*k, v.clone())));

        let reply: AlpacaReply<T> = self
            .client
            .get(format!("{}/{}", self.base, member))
            .query(&query)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| DriverError::Transport(e.to_string()))?
            .json()
            .map_err(|e| DriverError::InvalidResponse(e.to_string()))?;

        check(member, reply)?
            .ok_or_else(|| DriverError::InvalidResponse(format!("{member}: missing Value")))
    }

    fn put(&self, member: &str, params: &[(&str, String)]) -> DriverResult<()> {
        let mut form = vec![
            ("ClientID", CLIENT_ID.to_string()),
            ("ClientTransactionID", next_transaction()),
        ];
        form.extend(params.iter().map(|(k, v)| (*k, v.clone())));
        debug!("alpaca PUT {}/{}", self.base, member);

        let reply: AlpacaReply<serde_json::Value> = self
            .client
            .put(format!("{}/{}", self.base, member))
            .form(&form)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| DriverError::Transport(e.to_string()))?
            .json()
            .map_err(|e| DriverError::InvalidResponse(e.to_string()))?;

        check(member, reply).map(|_| ())
    }
}

fn id(index: u32) -> (&'static str, String) {
    ("Id", index.to_string())
}

impl Connectable for AlpacaDevice {
    fn set_connected(&mut self, connected: bool) -> DriverResult<()> {
        self.put("connected", &[("Connected", connected.to_string())])
    }

    fn is_connected(&mut self) -> DriverResult<bool> {
        self.get("connected", &[])
    }
}

impl DomeDriver for AlpacaDevice {
    fn can_find_home(&mut self) -> DriverResult<bool> {
        self.get("canfindhome", &[])
    }

    fn at_home(&mut self) -> DriverResult<bool> {
        self.get("athome", &[])
    }

    fn slewing(&mut self) -> DriverResult<bool> {
        self.get("slewing", &[])
    }

    fn azimuth(&mut self) -> DriverResult<f64> {
        self.get("azimuth", &[])
    }

    fn find_home(&mut self) -> DriverResult<()> {
        self.put("findhome", &[])
    }
}

impl SwitchDriver for AlpacaDevice {
    fn max_switch(&mut self) -> DriverResult<u32> {
        self.get("maxswitch", &[])
    }

    fn switch_name(&mut self, index: u32) -> DriverResult<String> {
        self.get("getswitchname", &[id(index)])
    }

    fn can_write(&mut self, index: u32) -> DriverResult<bool> {
        self.get("canwrite", &[id(index)])
    }

    fn get_switch(&mut self, index: u32) -> DriverResult<bool> {
        self.get("getswitch", &[id(index)])
    }

    fn set_switch(&mut self, index: u32, state: bool) -> DriverResult<()> {
        self.put("setswitch", &[id(index), ("State", state.to_string())])
    }

    fn get_switch_value(&mut self, index: u32) -> DriverResult<f64> {
        self.get("getswitchvalue", &[id(index)])
    }

    fn set_switch_value(&mut self, index: u32, value: f64) -> DriverResult<()> {
        self.put("setswitchvalue", &[id(index), ("Value", value.to_string())])
    }
}
