//! Driver capability interfaces
//!
//! The dome and its switch board are reached through vendor drivers whose
//! member lookup is done once, inside an adapter. The rest of the agent only
//! sees these narrow traits. Implementations are created and used on the
//! driver executor thread, which is why none of them needs to be `Send`.

pub mod alpaca;

use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use alpaca::AlpacaDriverFactory;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DriverError {
    #[error("{0} is not implemented by this driver")]
    NotImplemented(String),
    #[error("driver error 0x{code:X}: {message}")]
    Device { code: i32, message: String },
    #[error("driver transport failure: {0}")]
    Transport(String),
    #[error("invalid driver response: {0}")]
    InvalidResponse(String),
    #[error("unknown driver id '{0}'")]
    UnknownDriver(String),
}

impl DriverError {
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, DriverError::NotImplemented(_))
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Connection handling shared by every driver object.
pub trait Connectable {
    fn set_connected(&mut self, connected: bool) -> DriverResult<()>;
    fn is_connected(&mut self) -> DriverResult<bool>;
}

pub trait DomeDriver: Connectable {
    fn can_find_home(&mut self) -> DriverResult<bool>;
    fn at_home(&mut self) -> DriverResult<bool>;
    fn slewing(&mut self) -> DriverResult<bool>;
    fn azimuth(&mut self) -> DriverResult<f64>;
    fn find_home(&mut self) -> DriverResult<()>;
}

pub trait SwitchDriver: Connectable {
    fn max_switch(&mut self) -> DriverResult<u32>;
    fn switch_name(&mut self, index: u32) -> DriverResult<String>;
    fn can_write(&mut self, index: u32) -> DriverResult<bool>;
    fn get_switch(&mut self, index: u32) -> DriverResult<bool>;
    fn set_switch(&mut self, index: u32, state: bool) -> DriverResult<()>;
    fn get_switch_value(&mut self, index: u32) -> DriverResult<f64>;
    fn set_switch_value(&mut self, index: u32, value: f64) -> DriverResult<()>;
}

/// Builds driver objects from their configured identifier.
pub trait DriverFactory: Send + Sync {
    fn create_dome(&self, driver_id: &str) -> DriverResult<Box<dyn DomeDriver>>;
    fn create_switch(&self, driver_id: &str) -> DriverResult<Box<dyn SwitchDriver>>;
}

/// Connection budget for one driver object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub retry_interval: Duration,
}

impl RetryPolicy {
    pub fn from_secs(timeout_secs: u64, retry_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
            retry_interval: Duration::from_secs(retry_secs),
        }
    }

    /// A single attempt, no retry.
    pub fn once() -> Self {
        Self { timeout: Duration::ZERO, retry_interval: Duration::ZERO }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConnectError {
    #[error("{label} did not connect within {timeout:?} ({attempts} attempts): {last_error}")]
    TimedOut {
        label: String,
        timeout: Duration,
        attempts: u32,
        last_error: String,
    },
    #[error("{label} connection cancelled")]
    Cancelled { label: String },
}

/// Best-effort disconnect; the object itself is released when dropped.
pub fn release<D: Connectable + ?Sized>(driver: &mut D) {
    let _ = driver.set_connected(false);
}

/// A connected driver object, disconnected when dropped (also on panic).
pub struct Session<D: Connectable + ?Sized> {
    driver: Box<D>,
}

impl<D: Connectable + ?Sized> Session<D> {
    pub fn new(driver: Box<D>) -> Self {
        Self { driver }
    }
}

impl<D: Connectable + ?Sized> Deref for Session<D> {
    type Target = D;

    fn deref(&self) -> &D {
        &self.driver
    }
}

impl<D: Connectable + ?Sized> DerefMut for Session<D> {
    fn deref_mut(&mut self) -> &mut D {
        &mut self.driver
    }
}

impl<D: Connectable + ?Sized> Drop for Session<D> {
    fn drop(&mut self) {
        release(self.driver.as_mut());
    }
}

/// Sleep `duration` in slices; `true` if `cancel` fired meanwhile.
pub fn sleep_or_cancelled(cancel: &CancellationToken, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(100)));
    }
}

/// Create + connect + verify, retrying until the policy's budget is spent.
///
/// Blocking: meant for the driver executor thread. Every failed attempt that
/// produced an object is disconnected before the next one. Another attempt is
/// made only if it can start before the timeout.
pub fn connect_with_retry<D, F>(
    label: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut create: F,
) -> Result<Box<D>, ConnectError>
where
    D: Connectable + ?Sized,
    F: FnMut() -> DriverResult<Box<D>>,
{
    let started = Instant::now();
    let mut attempts = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(ConnectError::Cancelled { label: label.to_string() });
        }
        attempts += 1;
        let error = match create() {
            Ok(mut driver) => match driver.set_connected(true).and_then(|()| driver.is_connected()) {
                Ok(true) => {
                    info!("🔌 {} connected (attempt {})", label, attempts);
                    return Ok(driver);
                }
                Ok(false) => {
                    release(driver.as_mut());
                    "Connected still false after connect".to_string()
                }
                Err(e) => {
                    release(driver.as_mut());
                    e.to_string()
                }
            },
            Err(e) => e.to_string(),
        };
        warn!("{} connect attempt {} failed: {}", label, attempts, error);

        if started.elapsed() + policy.retry_interval >= policy.timeout {
            return Err(ConnectError::TimedOut {
                label: label.to_string(),
                timeout: policy.timeout,
                attempts,
                last_error: error,
            });
        }
        if sleep_or_cancelled(cancel, policy.retry_interval) {
            return Err(ConnectError::Cancelled { label: label.to_string() });
        }
    }
}
