//! Recovery orchestrator
//!
//! Runs the whole power-cycle sequence once per call:
//! - system-wide lock first (taken elsewhere → `Skipped`)
//! - history entry opened at start, closed on every exit path
//! - consumer told "started", then "complete" or "failed: <reason>"
//! - stop driver → power cycle → (encoder write) → relaunch → reconnect
//!
//! Never returns an error: every stage failure becomes `Failed`.

pub mod reconnect;

use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::HomeAction;
use crate::context::WatchdogContext;
use crate::device_http::DeviceHttpClient;
use crate::power::PowerSwitchClient;
use crate::signals::NamedLock;

pub use reconnect::{ReconnectError, ReconnectPlan, ReconnectReport};

/// Delay between writing the cached encoder and reading it back
pub const ENCODER_VERIFY_DELAY: Duration = Duration::from_secs(5);
/// Accepted difference between written and read-back encoder values
pub const ENCODER_TOLERANCE: i64 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Succeeded,
    Failed(String),
    /// Another recovery holds the system-wide lock
    Skipped,
}

impl RecoveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RecoveryOutcome::Succeeded)
    }
}

/// What the health monitor calls when it decides to recover.
pub trait RecoveryHandler: Send + Sync {
    fn recover<'a>(&'a self, reason: &'a str, cancel: &'a CancellationToken) -> BoxFuture<'a, RecoveryOutcome>;
}

/// What stage 4 did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    /// Output was off: switched on only
    TurnedOn,
    /// Output was on: off, wait, on
    Cycled,
}

pub struct RecoveryOrchestrator {
    ctx: WatchdogContext,
    power: PowerSwitchClient,
    device: DeviceHttpClient,
    lock: NamedLock,
    verify_delay: Duration,
}

impl RecoveryOrchestrator {
    pub fn new(ctx: WatchdogContext) -> Result<Self> {
        let config = ctx.config.clone();
        let timeout = config.recovery.http_timeout();
        Ok(Self {
            power: PowerSwitchClient::new(timeout)?,
            device: DeviceHttpClient::new(&config.device_http, timeout)?,
            lock: NamedLock::open(&config.signals.dir, &config.recovery.lock_name)
                .context("opening recovery lock")?,
            verify_delay: ENCODER_VERIFY_DELAY,
            ctx,
        })
    }

    /// Override the encoder read-back delay
    pub fn with_verify_delay(mut self, delay: Duration) -> Self {
        self.verify_delay = delay;
        self
    }

    fn log(&self, message: &str) {
        self.ctx.restart_log.line(message);
    }

    pub async fn execute(&self, reason: &str, cancel: &CancellationToken) -> RecoveryOutcome {
        let _guard = match self.lock.try_acquire() {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                info!("⏭️ another recovery holds the lock, skipping");
                return RecoveryOutcome::Skipped;
            }
            Err(e) => {
                error!("❌ cannot take recovery lock: {}", e);
                return RecoveryOutcome::Failed(format!("recovery lock: {e}"));
            }
        };

        self.ctx.history.begin_attempt(Some(reason));
        self.log(&format!("=== Recovery started ({reason}) ==="));

        let result = self.run_stages(cancel).await;

        let outcome = match result {
            Ok(()) => {
                if let Err(e) = self.ctx.signals.signal_complete() {
                    warn!("could not signal completion: {}", e);
                }
                self.ctx.history.end_attempt(true, None);
                self.log("=== Recovery complete ===");
                RecoveryOutcome::Succeeded
            }
            Err(e) => {
                let message = format!("{e:#}");
                if let Err(e) = self.ctx.signals.signal_failed(&message) {
                    warn!("could not signal failure: {}", e);
                }
                self.ctx.history.end_attempt(false, Some(&message));
                self.log(&format!("=== Recovery FAILED: {message} ==="));
                RecoveryOutcome::Failed(message)
            }
        };

        let grace = Duration::from_secs(self.ctx.config.recovery.post_cycle_grace_secs);
        if !grace.is_zero() {
            info!("post-cycle grace {:?}", grace);
            let _ = self.delay(grace, cancel).await;
        }
        outcome
    }

    async fn run_stages(&self, cancel: &CancellationToken) -> Result<()> {
        let config = self.ctx.config.clone();

        // 1. consumer
        self.ctx.signals.signal_start().context("signalling recovery start")?;
        let pause_wait = Duration::from_secs(config.recovery.consumer_pause_wait_secs);
        if !pause_wait.is_zero() {
            let signals = self.ctx.signals.clone();
            let paused = tokio::task::spawn_blocking(move || signals.wait_for_consumer_pause(pause_wait))
                .await
                .unwrap_or(false);
            if paused {
                self.log("Consumer acknowledged pause");
            } else {
                warn!("consumer did not request a pause within {:?}, continuing", pause_wait);
            }
        }

        // 2. stop driver process
        self.stop_driver_process().await;

        // 3.
        self.delay(Duration::from_secs(config.recovery.pre_power_wait_secs), cancel).await?;

        // 4.
        let action = self.power_cycle(cancel).await?;
        self.log(&format!("Power action: {action:?}"));

        // 5.
        self.delay(Duration::from_secs(config.recovery.post_power_wait_secs), cancel).await?;

        // 6.
        if config.dome.home_action == HomeAction::WriteCachedEncoder {
            self.restore_encoder().await;
        }

        // 7.
        self.launch_driver_process().await;

        // 8.
        self.delay(Duration::from_secs(config.recovery.post_launch_wait_secs), cancel).await?;

        // 9.
        let report = self.reconnect(cancel).await?;
        self.log(&format!(
            "Reconnected: homing {:?}, switches {}/{}",
            report.homing, report.switches_restored, report.switches_attempted
        ));

        if self.ctx.signals.wait_for_consumer_pause(Duration::ZERO) {
            if let Err(e) = self.ctx.signals.signal_consumer_resume() {
                warn!("⚠️ could not signal consumer resume: {}", e);
            }
        }
        Ok(())
    }

    async fn delay(&self, duration: Duration, cancel: &CancellationToken) -> Result<()> {
        if duration.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(anyhow!("recovery cancelled")),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    async fn stop_driver_process(&self) {
        let name = self.ctx.config.driver_process.name.clone();
        let processes = self.ctx.processes.clone();
        let result = tokio::task::spawn_blocking(move || processes.stop_by_name(&name)).await;
        match result {
            Ok(Ok(0)) => self.log("Driver process not running"),
            Ok(Ok(n)) => self.log(&format!("Stopped {n} driver process(es)")),
            Ok(Err(e)) => warn!("⚠️ stopping driver process: {:#}", e),
            Err(e) => warn!("⚠️ stop task failed: {}", e),
        }
    }

    async fn launch_driver_process(&self) {
        let path = self.ctx.config.driver_process.exe_path.clone();
        let processes = self.ctx.processes.clone();
        let result = tokio::task::spawn_blocking(move || processes.launch(&path)).await;
        match result {
            Ok(Ok(pid)) => self.log(&format!("Driver relaunched (PID {pid})")),
            Ok(Err(e)) => warn!("⚠️ relaunching driver: {:#}", e),
            Err(e) => warn!("⚠️ launch task failed: {}", e),
        }
    }

    /// Stage 4. Already off → on only; on → off, wait, on.
    pub async fn power_cycle(&self, cancel: &CancellationToken) -> Result<PowerAction> {
        let power = &self.ctx.config.power;
        let is_on = self
            .power
            .get_output(&power.address, power.switch_id)
            .await
            .context("reading power switch state")?;

        if !is_on {
            self.log("Power switch already OFF, turning ON");
            self.power
                .set_output(&power.address, power.switch_id, true)
                .await
                .context("turning power on")?;
            return Ok(PowerAction::TurnedOn);
        }

        self.log("Power cycle: OFF");
        self.power
            .set_output(&power.address, power.switch_id, false)
            .await
            .context("turning power off")?;
        self.delay(Duration::from_secs(power.off_secs), cancel).await?;
        self.log("Power cycle: ON");
        self.power
            .set_output(&power.address, power.switch_id, true)
            .await
            .context("turning power on")?;
        Ok(PowerAction::Cycled)
    }

    /// Stage 6, best-effort: write, wait, read back, compare.
    async fn restore_encoder(&self) {
        let Some(cached) = self.ctx.encoder.get() else {
            warn!("⚠️ no cached encoder value, skipping encoder write");
            return;
        };
        if let Err(e) = self.device.write_encoder(cached.value).await {
            warn!("⚠️ encoder write failed: {:#}", e);
            return;
        }
        self.log(&format!("Encoder written: {} (cached {})", cached.value, cached.captured_at));

        tokio::time::sleep(self.verify_delay).await;
        match self.device.read_encoder().await {
            Ok(read) if (read - cached.value).abs() <= ENCODER_TOLERANCE => {
                self.log(&format!("Encoder verify OK: {read}"));
            }
            Ok(read) => warn!("⚠️ encoder verify mismatch: wrote {}, read {}", cached.value, read),
            Err(e) => warn!("⚠️ encoder verify read failed: {:#}", e),
        }
    }

    /// Stage 9 on the driver executor, bounded by the umbrella timeout.
    async fn reconnect(&self, cancel: &CancellationToken) -> Result<ReconnectReport> {
        let config = &self.ctx.config;
        let plan = ReconnectPlan::from_config(config, self.ctx.switch_cache.current_snapshot());
        let drivers = self.ctx.drivers.clone();
        let token = cancel.child_token();
        let job_token = token.clone();
        let budget = config.reconnect_timeout();

        let job = self
            .ctx
            .executor
            .submit(&token, move || reconnect::run(drivers.as_ref(), &plan, &job_token));
        tokio::pin!(job);

        match tokio::time::timeout(budget, &mut job).await {
            Ok(result) => Ok(result??),
            Err(_) => {
                // le job s'arrête au prochain appel driver; ses sessions se déconnectent avant de rendre le verrou
                token.cancel();
                let wait = config.recovery.http_timeout() * 2;
                if tokio::time::timeout(wait, job).await.is_err() {
                    error!("❌ reconnection still running {:?} after cancel, driver thread is stuck", wait);
                }
                Err(anyhow!("reconnection exceeded its {:?} budget", budget))
            }
        }
    }
}

impl RecoveryHandler for RecoveryOrchestrator {
    fn recover<'a>(&'a self, reason: &'a str, cancel: &'a CancellationToken) -> BoxFuture<'a, RecoveryOutcome> {
        Box::pin(self.execute(reason, cancel))
    }
}

impl<T: RecoveryHandler + ?Sized> RecoveryHandler for Arc<T> {
    fn recover<'a>(&'a self, reason: &'a str, cancel: &'a CancellationToken) -> BoxFuture<'a, RecoveryOutcome> {
        (**self).recover(reason, cancel)
    }
}
