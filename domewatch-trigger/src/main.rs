//! Manual restart trigger
//!
//! Sets the watchdog's "manual trigger" named flag and exits. With `--wait`,
//! also waits for the recovery to finish and reports how it went.
//!
//! Exit codes: 0 flag set (and, with `--wait`, recovery succeeded),
//! 1 configuration or signal directory unusable, 2 the flag could not be set
//! or the awaited recovery failed or did not finish in time.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};

use domewatch_agent::signals::{ConsumerSignals, NamedFlag, RecoveryState};
use domewatch_agent::WatchdogConfig;

const POLL: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "domewatch-trigger", version, about = "Ask the DomeWatch agent for an immediate recovery")]
struct Args {
    /// Flag name (default: `[signals] manual_trigger` from the config)
    #[arg(long)]
    event_name: Option<String>,

    /// Config file (default: OS config dir, domewatch/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Wait this long for the recovery to finish (e.g. "20m")
    #[arg(long, value_parser = humantime::parse_duration)]
    wait: Option<Duration>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_target(false).init();
    let args = Args::parse();

    let config = match WatchdogConfig::load(args.config.as_deref()).await {
        Ok(config) => config,
        Err(e) => {
            error!("❌ cannot load configuration: {:#}", e);
            return ExitCode::from(1);
        }
    };
    let name = args
        .event_name
        .clone()
        .unwrap_or_else(|| config.signals.manual_trigger.clone());

    let flag = match NamedFlag::open(&config.signals.dir, &name) {
        Ok(flag) => flag,
        Err(e) => {
            error!("❌ signal directory {} unusable: {}", config.signals.dir.display(), e);
            return ExitCode::from(1);
        }
    };
    if let Err(e) = flag.set() {
        error!("❌ failed to set {}: {}", name, e);
        return ExitCode::from(2);
    }
    info!("🔘 manual trigger '{}' set", name);

    let Some(wait) = args.wait else {
        return ExitCode::SUCCESS;
    };
    match wait_for_outcome(&config, wait).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            warn!("{:#}", e);
            ExitCode::from(2)
        }
    }
}

/// Wait for the agent to pick the trigger up, then for "complete".
async fn wait_for_outcome(config: &WatchdogConfig, wait: Duration) -> Result<()> {
    let outcome = tokio::time::timeout(wait, async {
        let mut seen_start = false;
        loop {
            match ConsumerSignals::observe(&config.signals) {
                RecoveryState::InProgress => {
                    if !seen_start {
                        info!("⏳ recovery in progress");
                        seen_start = true;
                    }
                }
                // un "complete" d'une récupération précédente ne compte pas
                RecoveryState::Finished { failure } if seen_start => return failure,
                _ => {}
            }
            tokio::time::sleep(POLL).await;
        }
    })
    .await;

    match outcome {
        Ok(None) => {
            info!("✅ recovery complete");
            Ok(())
        }
        Ok(Some(reason)) => anyhow::bail!("❌ recovery failed: {reason}"),
        Err(_) => anyhow::bail!("recovery did not finish within {}", humantime::format_duration(wait)),
    }
}
