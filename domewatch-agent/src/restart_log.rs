//! Restart log sink
//!
//! Every recovery step is emitted as a tracing event and, when a directory is
//! configured, appended as `[YYYY-MM-DD HH:MM:SS] message` to `domewatch.log`.

use chrono::Local;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

pub const LOG_FILE: &str = "domewatch.log";

pub struct RestartLog {
    path: Option<PathBuf>,
    write: Mutex<()>,
}

impl RestartLog {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            path: Some(dir.as_ref().join(LOG_FILE)),
            write: Mutex::new(()),
        }
    }

    /// tracing only
    pub fn disabled() -> Self {
        Self { path: None, write: Mutex::new(()) }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn line(&self, message: &str) {
        info!(target: "domewatch::restart", "{}", message);

        let Some(path) = &self.path else { return };
        let _guard = self.write.lock();
        let stamped = format!("[{}] {}\n", Local::now().format("%Y-%m-%d %H:%M:%S"), message);
        let result = path
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|_| OpenOptions::new().create(true).append(true).open(path))
            .and_then(|mut file| file.write_all(stamped.as_bytes()));
        if let Err(e) = result {
            // le log ne doit jamais casser une récupération
            tracing::debug!("restart log write failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appends_timestamped_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = RestartLog::new(dir.path().join("logs"));
        log.line("Power cycle: OFF");
        log.line("Power cycle: ON");

        let content = std::fs::read_to_string(log.path().unwrap()).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("] Power cycle: OFF"));
        // "[YYYY-MM-DD HH:MM:SS] " prefix
        assert_eq!(lines[1].find(']'), Some(20));
    }

    #[test]
    fn test_disabled_sink_writes_nothing() {
        let log = RestartLog::disabled();
        log.line("nothing on disk");
        assert!(log.path().is_none());
    }
}
