//! Last known encoder position
//!
//! Polled from the device web interface while the dome is healthy, and written
//! back by the recovery sequence in `write_cached_encoder` mode.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device_http::DeviceHttpClient;

pub const ENCODER_FILE: &str = "encoder_cache.json";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CachedEncoder {
    pub value: i64,
    pub captured_at: DateTime<Utc>,
}

pub struct EncoderCache {
    path: PathBuf,
    current: Mutex<Option<CachedEncoder>>,
}

impl EncoderCache {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        let path = data_dir.as_ref().join(ENCODER_FILE);
        let current = fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<CachedEncoder>(&raw).ok());
        if let Some(cached) = &current {
            debug!("cached encoder {} from {}", cached.value, cached.captured_at);
        }
        Self {
            path,
            current: Mutex::new(current),
        }
    }

    pub fn get(&self) -> Option<CachedEncoder> {
        *self.current.lock()
    }

    pub fn update(&self, value: i64) {
        let cached = CachedEncoder { value, captured_at: Utc::now() };
        *self.current.lock() = Some(cached);

        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let tmp = self.path.with_extension("json.tmp");
            fs::write(&tmp, serde_json::to_vec_pretty(&cached)?)?;
            fs::rename(&tmp, &self.path)
        })();
        if let Err(e) = result {
            warn!("failed to persist encoder cache: {}", e);
        }
    }
}

/// Poll the encoder every `interval` (at least 1s) until cancelled; skips
/// rounds while a recovery is running.
pub async fn run_encoder_poller(
    cache: Arc<EncoderCache>,
    client: DeviceHttpClient,
    interval: Duration,
    recovering: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let interval = interval.max(Duration::from_secs(1));
    info!("🧭 encoder poller started (every {:?})", interval);

    loop {
        if !recovering.load(Ordering::SeqCst) {
            match client.read_encoder().await {
                Ok(value) => {
                    debug!("encoder position {}", value);
                    cache.update(value);
                }
                Err(e) => debug!("encoder poll failed: {:#}", e),
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("encoder poller stopped");
}
