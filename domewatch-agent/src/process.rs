//! Local driver process control
//!
//! Best-effort only:
//! - stop every process matching a name (with or without `.exe`)
//! - launch an executable detached from the agent

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use sysinfo::System;
use tracing::{debug, info};

const EXIT_WAIT: Duration = Duration::from_secs(10);

pub trait ProcessControl: Send + Sync {
    /// Kill every process called `name`; returns how many were found.
    fn stop_by_name(&self, name: &str) -> Result<usize>;
    /// Start `path` detached; returns its pid.
    fn launch(&self, path: &Path) -> Result<u32>;
}

/// sysinfo + std::process implementation
pub struct SystemProcessControl;

fn name_matches(process_name: &str, wanted: &str) -> bool {
    let bare = process_name
        .strip_suffix(".exe")
        .or_else(|| process_name.strip_suffix(".EXE"))
        .unwrap_or(process_name);
    bare.eq_ignore_ascii_case(wanted) || process_name.eq_ignore_ascii_case(wanted)
}

impl ProcessControl for SystemProcessControl {
    fn stop_by_name(&self, name: &str) -> Result<usize> {
        let mut sys = System::new();
        sys.refresh_processes();

        let mut found = 0;
        for process in sys.processes().values().filter(|p| name_matches(p.name(), name)) {
            found += 1;
            info!("Killing {} (PID {})", process.name(), process.pid());
            if !process.kill() {
                debug!("kill signal refused for PID {}", process.pid());
            }
        }

        if found == 0 {
            return Ok(0);
        }

        let deadline = Instant::now() + EXIT_WAIT;
        loop {
            sys.refresh_processes();
            let remaining = sys.processes().values().filter(|p| name_matches(p.name(), name)).count();
            if remaining == 0 {
                return Ok(found);
            }
            if Instant::now() >= deadline {
                return Err(anyhow!("{remaining} '{name}' process(es) still running after kill"));
            }
            std::thread::sleep(Duration::from_millis(250));
        }
    }

    fn launch(&self, path: &Path) -> Result<u32> {
        if !path.exists() {
            return Err(anyhow!("executable not found: {}", path.display()));
        }

        let mut command = Command::new(path);
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            command.current_dir(dir);
        }
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to launch {}", path.display()))?;

        let pid = child.id();
        // reap it whenever it exits
        std::thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(pid)
    }
}
