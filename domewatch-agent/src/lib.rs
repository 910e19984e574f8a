//! DomeWatch agent - observatory dome watchdog
//!
//! Probes the dome controller, and when it stops answering power-cycles it
//! through a network relay and brings the drivers back:
//! - health monitor with failure threshold, cooldown and manual trigger
//! - recovery orchestrator (stop driver, power cycle, relaunch, reconnect, re-home)
//! - auxiliary switch cache restored after the cycle
//! - file-backed named signals for an external imaging consumer

pub mod api;
pub mod config;
pub mod context;
pub mod device_http;
pub mod diagnostics;
pub mod driver;
pub mod encoder_cache;
pub mod executor;
pub mod history;
pub mod metrics;
pub mod monitor;
pub mod power;
pub mod probe;
pub mod process;
pub mod recovery;
pub mod restart_log;
pub mod signals;
pub mod switch_cache;

pub use config::WatchdogConfig;
pub use context::WatchdogContext;
pub use monitor::{HealthMonitor, HealthStatus};
pub use recovery::{RecoveryHandler, RecoveryOrchestrator, RecoveryOutcome};
