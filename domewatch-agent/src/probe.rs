//! Reachability probe
//!
//! One ICMP echo through the system `ping` binary, bounded by the probe
//! timeout.

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command as AsyncCommand;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reply { rtt: Duration },
    NoReply,
}

impl ProbeOutcome {
    pub fn is_reply(&self) -> bool {
        matches!(self, ProbeOutcome::Reply { .. })
    }

    pub fn latency_ms(&self) -> Option<u32> {
        match self {
            ProbeOutcome::Reply { rtt } => Some(u32::try_from(rtt.as_millis()).unwrap_or(u32::MAX)),
            ProbeOutcome::NoReply => None,
        }
    }
}

pub trait Probe: Send + Sync {
    /// An `Err` is treated exactly like `NoReply` by the monitor.
    fn probe<'a>(&'a self, target: &'a str, timeout: Duration) -> BoxFuture<'a, Result<ProbeOutcome>>;
}

pub struct PingProbe;

fn ping_args(target: &str, timeout: Duration) -> Vec<String> {
    let millis = timeout.as_millis().max(1);
    if cfg!(target_os = "windows") {
        vec!["-n".into(), "1".into(), "-w".into(), millis.to_string(), target.into()]
    } else if cfg!(target_os = "macos") {
        vec!["-c".into(), "1".into(), "-W".into(), millis.to_string(), target.into()]
    } else {
        // iputils: -W en secondes
        let secs = timeout.as_secs_f64().ceil().max(1.0) as u64;
        vec!["-c".into(), "1".into(), "-W".into(), secs.to_string(), target.into()]
    }
}

/// Extract the round-trip time from `time=12.3 ms` or `time<1ms`.
pub fn parse_rtt(output: &str) -> Option<Duration> {
    for line in output.lines() {
        let lower = line.to_ascii_lowercase();
        let Some(pos) = lower.find("time=").map(|p| p + 5).or_else(|| lower.find("time<").map(|p| p + 5)) else {
            continue;
        };
        let number: String = lower[pos..]
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        if let Ok(ms) = number.parse::<f64>() {
            return Some(Duration::from_secs_f64(ms / 1000.0));
        }
    }
    None
}

impl Probe for PingProbe {
    fn probe<'a>(&'a self, target: &'a str, timeout: Duration) -> BoxFuture<'a, Result<ProbeOutcome>> {
        Box::pin(async move {
            let started = Instant::now();
            let run = AsyncCommand::new("ping")
                .args(ping_args(target, timeout))
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .output();

            let output = match tokio::time::timeout(timeout, run).await {
                Ok(output) => output.context("Failed to execute ping")?,
                Err(_) => {
                    debug!("ping {} timed out after {:?}", target, timeout);
                    return Ok(ProbeOutcome::NoReply);
                }
            };

            if !output.status.success() {
                return Ok(ProbeOutcome::NoReply);
            }
            let stdout = String::from_utf8_lossy(&output.stdout);
            // Windows ping exits 0 on "Destination host unreachable"
            if cfg!(target_os = "windows") && !stdout.to_ascii_lowercase().contains("ttl=") {
                return Ok(ProbeOutcome::NoReply);
            }
            let rtt = parse_rtt(&stdout).unwrap_or_else(|| started.elapsed());
            Ok(ProbeOutcome::Reply { rtt })
        })
    }
}
