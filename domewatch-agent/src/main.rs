//! DomeWatch agent binary
//!
//! `run` is the long-running watchdog service; the other subcommands are
//! one-shot diagnostics against the configured devices.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use domewatch_agent::api::{self, AppState};
use domewatch_agent::device_http::DeviceHttpClient;
use domewatch_agent::diagnostics;
use domewatch_agent::encoder_cache::run_encoder_poller;
use domewatch_agent::power::PowerSwitchClient;
use domewatch_agent::{HealthMonitor, RecoveryHandler, RecoveryOrchestrator, WatchdogConfig, WatchdogContext};

const STOP_WAIT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "domewatch-agent", version, about = "Observatory dome watchdog")]
struct Cli {
    /// Config file (default: OS config dir, domewatch/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the watchdog (default)
    Run,
    /// Run one recovery now, in this process
    RestartNow {
        #[arg(long, default_value = "Manual restart from command line")]
        reason: String,
    },
    /// List the relays of the power switch
    ListRelays,
    /// List every switch of the switch driver
    ListSwitches,
    /// Connect to each driver once and report
    TestDrivers,
    /// Show the restart history
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Delete the history instead
        #[arg(long)]
        clear: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("domewatch_agent=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = WatchdogConfig::load(cli.config.as_deref())
        .await
        .context("Failed to load configuration")?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let path = match cli.config.clone() {
                Some(p) => p,
                None => WatchdogConfig::config_file_path()?,
            };
            if !path.exists() {
                if let Err(e) = config.save(Some(&path)).await {
                    warn!("could not write default configuration: {:#}", e);
                }
            }
            run(config).await
        }
        Command::RestartNow { reason } => restart_now(config, &reason).await,
        Command::ListRelays => list_relays(&config).await,
        Command::ListSwitches => list_switches(config).await,
        Command::TestDrivers => test_drivers(config).await,
        Command::History { limit, clear } => history(config, limit, clear),
    }
}

async fn run(config: WatchdogConfig) -> Result<()> {
    info!("🔭 DomeWatch agent v{} starting", env!("CARGO_PKG_VERSION"));

    let ctx = WatchdogContext::new(config).context("Failed to build watchdog context")?;
    // drapeaux laissés par un arrêt brutal du service précédent
    ctx.signals.reset_stale().context("Failed to reset consumer flags")?;
    let orchestrator: Arc<dyn RecoveryHandler> = Arc::new(RecoveryOrchestrator::new(ctx.clone())?);
    let monitor = Arc::new(HealthMonitor::new(ctx.clone(), Some(orchestrator))?);
    let cancel = monitor.cancellation();

    let device = DeviceHttpClient::new(&ctx.config.device_http, ctx.config.recovery.http_timeout())?;
    let poller = tokio::spawn(run_encoder_poller(
        ctx.encoder.clone(),
        device,
        Duration::from_secs(ctx.config.device_http.encoder_poll_secs),
        ctx.recovering.clone(),
        cancel.clone(),
    ));

    let api_task = ctx.config.api.enabled.then(|| {
        let state = AppState::new(ctx.clone(), monitor.subscribe());
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = api::serve(state, cancel).await {
                error!("status API stopped: {:#}", e);
            }
        })
    });

    monitor.start();

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("🛑 shutdown requested");

    monitor.stop(STOP_WAIT).await;
    let _ = tokio::time::timeout(STOP_WAIT, poller).await;
    if let Some(task) = api_task {
        let _ = tokio::time::timeout(STOP_WAIT, task).await;
    }
    if !ctx.executor.shutdown(STOP_WAIT) {
        warn!("driver executor did not stop within {:?}", STOP_WAIT);
    }
    info!("bye");
    Ok(())
}

async fn restart_now(config: WatchdogConfig, reason: &str) -> Result<()> {
    let ctx = WatchdogContext::new(config)?;
    let orchestrator = RecoveryOrchestrator::new(ctx.clone())?;
    let cancel = CancellationToken::new();

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    ctx.recovering.store(true, std::sync::atomic::Ordering::SeqCst);
    let outcome = orchestrator.execute(reason, &cancel).await;
    ctx.recovering.store(false, std::sync::atomic::Ordering::SeqCst);
    ctx.executor.shutdown(STOP_WAIT);

    println!("{outcome:?}");
    if outcome.is_success() {
        Ok(())
    } else {
        anyhow::bail!("recovery did not succeed: {outcome:?}")
    }
}

async fn list_relays(config: &WatchdogConfig) -> Result<()> {
    let client = PowerSwitchClient::new(config.recovery.http_timeout())?;
    let relays = client.enumerate_relays(&config.power.address).await;
    if relays.is_empty() {
        println!("no relay answered at {}", config.power.address);
    }
    for relay in relays {
        let state = if relay.output { "ON" } else { "OFF" };
        println!("{:>3}  {:<24} {}", relay.id, relay.name.unwrap_or_default(), state);
    }
    Ok(())
}

async fn list_switches(config: WatchdogConfig) -> Result<()> {
    let driver_id = config.switches.driver_id.clone();
    anyhow::ensure!(!driver_id.is_empty(), "no switch driver configured");

    let ctx = WatchdogContext::new(config)?;
    let switches = ctx
        .switch_cache
        .enumerate(&driver_id, &CancellationToken::new())
        .await;
    ctx.executor.shutdown(STOP_WAIT);

    for switch in switches? {
        println!(
            "{:>3}  {:<24} writable={:<5} state={:<5} value={}",
            switch.index,
            switch.name.unwrap_or_default(),
            switch.can_write.map_or("?".to_string(), |b| b.to_string()),
            switch.state.map_or("?".to_string(), |b| b.to_string()),
            switch.value.map_or("?".to_string(), |v| v.to_string()),
        );
    }
    Ok(())
}

async fn test_drivers(config: WatchdogConfig) -> Result<()> {
    let ctx = WatchdogContext::new(config)?;
    let report =
        diagnostics::test_connections(&ctx.config, &ctx.executor, ctx.drivers.clone(), &CancellationToken::new())
            .await;
    ctx.executor.shutdown(STOP_WAIT);
    println!("{}", serde_json::to_string_pretty(&report?)?);
    Ok(())
}

fn history(config: WatchdogConfig, limit: usize, clear: bool) -> Result<()> {
    let store = domewatch_agent::history::RestartHistoryStore::new(&config.storage.data_dir);
    if clear {
        store.clear();
        println!("restart history cleared");
        return Ok(());
    }

    println!(
        "{} restart(s), {} succeeded ({:.0}%)",
        store.total_count(),
        store.success_count(),
        store.success_rate() * 100.0
    );
    for entry in store.recent(limit) {
        let status = match (entry.is_open(), entry.success) {
            (true, _) => "OPEN",
            (false, true) => "OK",
            (false, false) => "FAILED",
        };
        println!(
            "{}  {:<6} {:>6}  {}{}",
            entry.start_time.format("%Y-%m-%d %H:%M:%S"),
            status,
            entry.duration().map_or("-".to_string(), |d| format!("{}s", d.num_seconds())),
            entry.trigger_reason.unwrap_or_default(),
            entry.error_message.map(|m| format!(" ({m})")).unwrap_or_default(),
        );
    }
    Ok(())
}
