//! Health monitor
//!
//! Two loops sharing one cancellation token:
//! - probe loop, once per probe interval: probe, count failures, decide
//!   whether to recover, publish a status snapshot
//! - switch-cache loop, every 5s: refresh the auxiliary switch snapshot when
//!   its interval has elapsed and no recovery owns the driver
//!
//! A pending manual trigger pushes the failure count to the threshold, so it
//! still goes through the cooldown check.

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::WatchdogContext;
use crate::probe::ProbeOutcome;
use crate::recovery::{RecoveryHandler, RecoveryOutcome};
use crate::signals::NamedFlag;

pub const SWITCH_CACHE_TICK: Duration = Duration::from_secs(5);
const SWITCH_CACHE_ERROR_BACKOFF: Duration = Duration::from_secs(10);

/// Published snapshot, cloned on every publish
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub started_at: DateTime<Utc>,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub last_probe_ok: bool,
    pub last_latency_ms: Option<u32>,
    pub average_latency_ms: Option<f64>,
    pub consecutive_failures: u32,
    pub total_probes: u64,
    pub ok_probes: u64,
    /// Last successful recovery
    pub last_recovery_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub manual_trigger_pending: bool,
    pub cooldown_remaining_secs: Option<u64>,
    pub recovery_in_progress: bool,
}

impl HealthStatus {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            last_probe_at: None,
            last_probe_ok: false,
            last_latency_ms: None,
            average_latency_ms: None,
            consecutive_failures: 0,
            total_probes: 0,
            ok_probes: 0,
            last_recovery_at: None,
            last_attempt_at: None,
            manual_trigger_pending: false,
            cooldown_remaining_secs: None,
            recovery_in_progress: false,
        }
    }
}

/// What one probe-loop iteration did
#[derive(Debug, Clone, PartialEq)]
pub struct Iteration {
    pub probe_ok: bool,
    pub consecutive_failures: u32,
    pub manual: bool,
    pub recovery: Option<RecoveryOutcome>,
}

struct LoopState {
    status: HealthStatus,
    latencies: VecDeque<u32>,
    /// Cooldown anchor: end of the last attempt
    last_attempt: Option<Instant>,
    last_switch_cache: Option<Instant>,
}

pub struct HealthMonitor {
    ctx: WatchdogContext,
    manual_trigger: NamedFlag,
    handler: Option<Arc<dyn RecoveryHandler>>,
    state: Mutex<LoopState>,
    status_tx: watch::Sender<HealthStatus>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(ctx: WatchdogContext, handler: Option<Arc<dyn RecoveryHandler>>) -> Result<Self> {
        let manual_trigger = NamedFlag::open(&ctx.config.signals.dir, &ctx.config.signals.manual_trigger)?;
        let status = HealthStatus::new();
        let (status_tx, _) = watch::channel(status.clone());
        let window = ctx.config.probe.latency_window.max(1);

        Ok(Self {
            ctx,
            manual_trigger,
            handler,
            state: Mutex::new(LoopState {
                status,
                latencies: VecDeque::with_capacity(window),
                last_attempt: None,
                last_switch_cache: None,
            }),
            status_tx,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> HealthStatus {
        self.state.lock().status.clone()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn publish(&self) {
        let snapshot = self.state.lock().status.clone();
        self.status_tx.send_replace(snapshot);
    }

    /// One probe-loop iteration.
    pub async fn run_once(&self) -> Iteration {
        let config = self.ctx.config.clone();
        let threshold = config.probe.failures_to_trigger.max(1);
        let cooldown = config.recovery.cooldown();

        let manual = self.manual_trigger.is_set();

        let outcome = match self.ctx.probe.probe(&config.probe.target, config.probe.timeout()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!("probe error: {:#}", e);
                ProbeOutcome::NoReply
            }
        };
        self.ctx.metrics.record(outcome.latency_ms(), outcome.is_reply());

        let (failures, should_recover) = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let window = config.probe.latency_window.max(1);
            let state = &mut *state;
            let status = &mut state.status;

            status.total_probes += 1;
            status.last_probe_at = Some(Utc::now());
            status.last_probe_ok = outcome.is_reply();
            status.last_latency_ms = outcome.latency_ms();
            match outcome.latency_ms() {
                Some(latency) => {
                    status.ok_probes += 1;
                    status.consecutive_failures = 0;
                    if state.latencies.len() == window {
                        state.latencies.pop_front();
                    }
                    state.latencies.push_back(latency);
                }
                None => status.consecutive_failures += 1,
            }
            status.average_latency_ms = if state.latencies.is_empty() {
                None
            } else {
                let sum: u64 = state.latencies.iter().map(|&l| u64::from(l)).sum();
                Some(sum as f64 / state.latencies.len() as f64)
            };

            if manual && status.consecutive_failures < threshold {
                status.consecutive_failures = threshold;
            }
            status.manual_trigger_pending = manual;

            let remaining = state
                .last_attempt
                .map(|at| cooldown.saturating_sub(now.duration_since(at)))
                .filter(|d| !d.is_zero());
            status.cooldown_remaining_secs = remaining.map(|d| d.as_secs_f64().ceil() as u64);

            let should = status.consecutive_failures >= threshold && remaining.is_none() && self.handler.is_some();
            if status.consecutive_failures >= threshold && remaining.is_some() {
                debug!("threshold reached but cooldown active ({:?} left)", remaining);
            }
            (status.consecutive_failures, should)
        };

        let recovery = match (should_recover, &self.handler) {
            (true, Some(handler)) => Some(self.recover(handler.as_ref(), manual, failures).await),
            _ => None,
        };

        self.publish();
        Iteration {
            probe_ok: outcome.is_reply(),
            consecutive_failures: self.state.lock().status.consecutive_failures,
            manual,
            recovery,
        }
    }

    async fn recover(&self, handler: &dyn RecoveryHandler, manual: bool, failures: u32) -> RecoveryOutcome {
        if manual {
            if let Err(e) = self.manual_trigger.clear() {
                warn!("could not clear manual trigger: {}", e);
            }
        }
        let reason = if manual {
            "Manual trigger".to_string()
        } else {
            format!("Watchdog triggered ({failures} consecutive probe failures)")
        };
        warn!("🚨 starting recovery: {}", reason);

        self.ctx.recovering.store(true, Ordering::SeqCst);
        {
            let mut state = self.state.lock();
            state.status.recovery_in_progress = true;
            state.status.manual_trigger_pending = false;
        }
        self.publish();

        let outcome = AssertUnwindSafe(handler.recover(&reason, &self.cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!("❌ recovery handler panicked");
                RecoveryOutcome::Failed("recovery handler panicked".to_string())
            });

        self.ctx.recovering.store(false, Ordering::SeqCst);

        let reraise = manual && !outcome.is_success();
        if reraise {
            if let Err(e) = self.manual_trigger.set() {
                warn!("could not re-raise manual trigger: {}", e);
            }
        }

        let mut state = self.state.lock();
        state.last_attempt = Some(Instant::now());
        state.status.recovery_in_progress = false;
        state.status.consecutive_failures = 0;
        state.status.last_attempt_at = Some(Utc::now());
        state.status.cooldown_remaining_secs = Some(self.ctx.config.recovery.cooldown_secs).filter(|s| *s > 0);
        state.status.manual_trigger_pending = reraise;
        match &outcome {
            RecoveryOutcome::Succeeded => {
                state.status.last_recovery_at = Some(Utc::now());
                info!("✅ recovery succeeded");
            }
            RecoveryOutcome::Failed(e) => error!("❌ recovery failed: {}", e),
            RecoveryOutcome::Skipped => info!("recovery skipped, already running elsewhere"),
        }
        outcome
    }

    /// One switch-cache iteration; `true` if a snapshot was taken.
    pub async fn refresh_switch_cache(&self) -> bool {
        let config = self.ctx.config.clone();
        if self.ctx.is_recovering()
            || config.switches.monitored.is_empty()
            || config.switches.driver_id.is_empty()
        {
            return false;
        }

        let interval = Duration::from_secs(config.switches.cache_interval_secs);
        let due = self
            .state
            .lock()
            .last_switch_cache
            .map_or(true, |at| at.elapsed() >= interval);
        if !due {
            return false;
        }

        match self
            .ctx
            .switch_cache
            .snapshot(&config.switches.driver_id, &config.switches.monitored, &self.cancel)
            .await
        {
            Ok(states) => {
                debug!("switch cache refreshed ({} switches)", states.len());
                self.state.lock().last_switch_cache = Some(Instant::now());
                true
            }
            Err(e) => {
                warn!("switch cache refresh failed: {:#}", e);
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(SWITCH_CACHE_ERROR_BACKOFF) => {}
                }
                false
            }
        }
    }

    /// Spawn both loops.
    pub fn start(self: &Arc<Self>) {
        let interval = self.ctx.config.probe.interval();
        info!(
            "👀 monitoring {} every {:?} (threshold {}, cooldown {}s)",
            self.ctx.config.probe.target,
            interval,
            self.ctx.config.probe.failures_to_trigger,
            self.ctx.config.recovery.cooldown_secs
        );

        let monitor = self.clone();
        let probe_loop = tokio::spawn(async move {
            loop {
                monitor.run_once().await;
                tokio::select! {
                    _ = monitor.cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!("probe loop stopped");
        });

        let monitor = self.clone();
        let cache_loop = tokio::spawn(async move {
            loop {
                monitor.refresh_switch_cache().await;
                tokio::select! {
                    _ = monitor.cancel.cancelled() => break,
                    _ = tokio::time::sleep(SWITCH_CACHE_TICK) => {}
                }
            }
            debug!("switch cache loop stopped");
        });

        self.tasks.lock().extend([probe_loop, cache_loop]);
    }

    /// Cancel both loops and wait for them, at most `wait`.
    pub async fn stop(&self, wait: Duration) -> bool {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();

        match tokio::time::timeout(wait, futures::future::join_all(tasks)).await {
            Ok(_) => {
                info!("monitor stopped");
                true
            }
            Err(_) => {
                warn!("monitor loops did not stop within {:?}, aborting", wait);
                aborts.iter().for_each(|a| a.abort());
                false
            }
        }
    }
}
