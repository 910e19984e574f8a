//! Configuration management
//!
//! Handles:
//! - Probe, power switch and recovery stage timings
//! - Driver identifiers and retry budgets
//! - Device web interface credentials (optionally kept in the OS keyring)
//! - Cross-platform storage of the TOML file

use anyhow::{Context, Result};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const KEYRING_SERVICE: &str = "domewatch";
const KEYRING_USER: &str = "device-http-password";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub probe: ProbeConfig,
    pub power: PowerConfig,
    pub recovery: RecoveryConfig,
    pub driver_process: DriverProcessConfig,
    pub dome: DomeConfig,
    pub switches: SwitchesConfig,
    pub device_http: DeviceHttpConfig,
    pub signals: SignalsConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub target: String,
    pub interval_secs: u64,
    pub timeout_ms: u64,
    pub failures_to_trigger: u32,
    /// Nombre de latences gardées pour la moyenne glissante
    pub latency_window: usize,
    pub metrics_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    pub address: String,
    pub switch_id: u32,
    pub off_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub cooldown_secs: u64,
    pub post_cycle_grace_secs: u64,
    pub pre_power_wait_secs: u64,
    pub post_power_wait_secs: u64,
    pub post_launch_wait_secs: u64,
    pub lock_name: String,
    pub http_timeout_secs: u64,
    pub reconnect_margin_secs: u64,
    /// 0 = don't wait for the consumer to acknowledge the pause
    pub consumer_pause_wait_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverProcessConfig {
    pub name: String,
    pub exe_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HomeAction {
    AutoHome,
    WriteCachedEncoder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DomeConfig {
    /// Alpaca device URL, e.g. `http://127.0.0.1:11111/api/v1/dome/0`
    pub driver_id: String,
    pub connect_timeout_secs: u64,
    pub connect_retry_secs: u64,
    pub find_home_timeout_secs: u64,
    pub find_home_poll_ms: u64,
    pub home_action: HomeAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredSwitch {
    pub index: u32,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchesConfig {
    pub driver_id: String,
    pub connect_timeout_secs: u64,
    pub connect_retry_secs: u64,
    pub cache_interval_secs: u64,
    pub ensure_timeout_secs: u64,
    /// Ancien réglage "fan" unique, utilisé quand aucun snapshot n'existe
    pub legacy_index: Option<u32>,
    pub legacy_state: bool,
    pub monitored: Vec<MonitoredSwitch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceHttpConfig {
    pub address: String,
    pub username: String,
    pub password: String,
    pub store_password_in_keyring: bool,
    pub encoder_poll_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalsConfig {
    pub dir: PathBuf,
    pub manual_trigger: String,
    pub started: String,
    pub complete: String,
    pub pause_requested: String,
    pub resume_requested: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub listen: String,
    pub api_key: Option<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            target: "192.168.6.100".to_string(),
            interval_secs: 1,
            timeout_ms: 900,
            failures_to_trigger: 5,
            latency_window: 60,
            metrics_capacity: 1440,
        }
    }
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            address: "192.168.61.45".to_string(),
            switch_id: 0,
            off_secs: 15,
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 120,
            post_cycle_grace_secs: 30,
            pre_power_wait_secs: 30,
            post_power_wait_secs: 30,
            post_launch_wait_secs: 30,
            lock_name: "ScopeDomePowerCycleLock".to_string(),
            http_timeout_secs: 5,
            reconnect_margin_secs: 30,
            consumer_pause_wait_secs: 0,
        }
    }
}

impl Default for DriverProcessConfig {
    fn default() -> Self {
        Self {
            name: "ASCOM.ScopeDomeUSBDome".to_string(),
            exe_path: PathBuf::from(r"C:\ScopeDome\Driver_LS\ASCOM.ScopeDomeUSBDome.exe"),
        }
    }
}

impl Default for DomeConfig {
    fn default() -> Self {
        Self {
            driver_id: "http://127.0.0.1:11111/api/v1/dome/0".to_string(),
            connect_timeout_secs: 180,
            connect_retry_secs: 5,
            find_home_timeout_secs: 900,
            find_home_poll_ms: 500,
            home_action: HomeAction::AutoHome,
        }
    }
}

impl Default for SwitchesConfig {
    fn default() -> Self {
        Self {
            driver_id: "http://127.0.0.1:11111/api/v1/switch/0".to_string(),
            connect_timeout_secs: 60,
            connect_retry_secs: 3,
            cache_interval_secs: 300,
            ensure_timeout_secs: 30,
            legacy_index: Some(18),
            legacy_state: true,
            monitored: Vec::new(),
        }
    }
}

impl Default for DeviceHttpConfig {
    fn default() -> Self {
        Self {
            address: "192.168.6.100".to_string(),
            username: "scopedome".to_string(),
            password: "default".to_string(),
            store_password_in_keyring: false,
            encoder_poll_secs: 300,
        }
    }
}

impl Default for SignalsConfig {
    fn default() -> Self {
        let dir = dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("domewatch-signals");
        Self {
            dir,
            manual_trigger: "ScopeDomeWatchdog.TriggerRestart".to_string(),
            started: "ScopeDome_ReconnectionStarted".to_string(),
            complete: "ScopeDome_ReconnectionComplete".to_string(),
            pause_requested: "Nina_PauseRequested".to_string(),
            resume_requested: "Nina_ResumeRequested".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("domewatch");
        Self { data_dir, log_dir: None }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: "127.0.0.1:8085".to_string(),
            api_key: None,
        }
    }
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl RecoveryConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }
}

impl StorageConfig {
    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| self.data_dir.clone())
    }
}

impl WatchdogConfig {
    /// Budget global de la sous-séquence de reconnexion
    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_secs(
            self.dome.connect_timeout_secs
                + self.dome.find_home_timeout_secs
                + self.switches.connect_timeout_secs
                + self.switches.ensure_timeout_secs
                + self.recovery.reconnect_margin_secs,
        )
    }

    /// Load config from `path`, or from the OS-specific location
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_file_path()?,
        };

        if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| format!("reading {}", config_path.display()))?;
            let mut config: WatchdogConfig = toml::from_str(&content)
                .with_context(|| format!("parsing {}", config_path.display()))?;

            if config.device_http.store_password_in_keyring {
                if let Ok(password) = Self::load_password() {
                    config.device_http.password = password;
                }
            }

            Ok(config)
        } else {
            // First start - defaults
            Ok(Self::default())
        }
    }

    /// Save config to `path`, or to the OS-specific location
    pub async fn save(&self, path: Option<&Path>) -> Result<()> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_file_path()?,
        };

        if let Some(parent) = config_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut on_disk = self.clone();
        if self.device_http.store_password_in_keyring {
            Self::save_password(&self.device_http.password)?;
            on_disk.device_http.password.clear();
        }

        let content = toml::to_string_pretty(&on_disk)?;
        tokio::fs::write(&config_path, content).await?;
        Ok(())
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;

        path.push("domewatch");
        path.push("config.toml");
        Ok(path)
    }

    fn load_password() -> Result<String> {
        let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER)?;
        entry.get_password().map_err(Into::into)
    }

    fn save_password(password: &str) -> Result<()> {
        let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER)?;
        entry.set_password(password).map_err(Into::into)
    }

    /// Delete the device password from the keyring
    pub fn delete_password() -> Result<()> {
        let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER)?;
        entry.delete_credential().map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WatchdogConfig::default();
        assert_eq!(config.probe.failures_to_trigger, 5);
        assert_eq!(config.probe.timeout(), Duration::from_millis(900));
        assert_eq!(config.recovery.cooldown(), Duration::from_secs(120));
        assert_eq!(config.dome.home_action, HomeAction::AutoHome);
        assert_eq!(config.switches.legacy_index, Some(18));
    }

    #[test]
    fn test_reconnect_timeout_sums_stage_budgets() {
        let config = WatchdogConfig::default();
        // 180 + 900 + 60 + 30 + 30
        assert_eq!(config.reconnect_timeout(), Duration::from_secs(1200));
    }

    #[test]
    fn test_config_file_path() {
        let path = WatchdogConfig::config_file_path().unwrap();
        assert!(path.to_string_lossy().contains("domewatch"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let raw = r#"
            [probe]
            target = "10.0.0.5"

            [dome]
            home_action = "write_cached_encoder"

            [[switches.monitored]]
            index = 18
            name = "Fan"
        "#;
        let config: WatchdogConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.probe.target, "10.0.0.5");
        assert_eq!(config.probe.interval_secs, 1);
        assert_eq!(config.dome.home_action, HomeAction::WriteCachedEncoder);
        assert_eq!(config.dome.connect_retry_secs, 5);
        assert_eq!(
            config.switches.monitored,
            vec![MonitoredSwitch { index: 18, name: "Fan".to_string() }]
        );
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = WatchdogConfig::default();
        config.power.switch_id = 2;
        config.save(Some(&path)).await.unwrap();

        let loaded = WatchdogConfig::load(Some(&path)).await.unwrap();
        assert_eq!(loaded.power.switch_id, 2);
        assert_eq!(loaded.device_http.password, "default");
    }

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = WatchdogConfig::load(Some(&dir.path().join("absent.toml")))
            .await
            .unwrap();
        assert_eq!(loaded.power.off_secs, 15);
    }
}
