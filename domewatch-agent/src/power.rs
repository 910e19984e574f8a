//! Network power switch client (Shelly Gen2 RPC over HTTP)
//!
//! Stateless: every call takes the switch address. Used for the power-cycle
//! stage and for relay discovery from the CLI.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Blind probing range when `Shelly.GetInfo` is unavailable
const FALLBACK_RELAYS: std::ops::Range<u32> = 0..10;

#[derive(Debug, Deserialize)]
struct SwitchStatus {
    output: bool,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceInfo {
    #[serde(default)]
    components: Vec<Component>,
}

#[derive(Debug, Deserialize)]
struct Component {
    key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayInfo {
    pub id: u32,
    pub name: Option<String>,
    pub output: bool,
}

#[derive(Clone)]
pub struct PowerSwitchClient {
    http: reqwest::Client,
}

impl PowerSwitchClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building power switch HTTP client")?;
        Ok(Self { http })
    }

    fn url(address: &str, rpc: &str) -> String {
        if address.starts_with("http://") || address.starts_with("https://") {
            format!("{}/rpc/{}", address.trim_end_matches('/'), rpc)
        } else {
            format!("http://{}/rpc/{}", address, rpc)
        }
    }

    async fn status(&self, address: &str, id: u32) -> Result<SwitchStatus> {
        let url = Self::url(address, "Switch.GetStatus");
        let status = self
            .http
            .get(&url)
            .query(&[("id", id)])
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()?
            .json::<SwitchStatus>()
            .await
            .context("decoding Switch.GetStatus")?;
        Ok(status)
    }

    /// Current state of output `id`
    pub async fn get_output(&self, address: &str, id: u32) -> Result<bool> {
        Ok(self.status(address, id).await?.output)
    }

    /// Switch output `id` on or off; the reply body is ignored
    pub async fn set_output(&self, address: &str, id: u32, on: bool) -> Result<()> {
        let url = Self::url(address, "Switch.Set");
        debug!("power switch {} id={} on={}", address, id, on);
        self.http
            .get(&url)
            .query(&[("id", id.to_string()), ("on", on.to_string())])
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()?;
        Ok(())
    }

    async fn relay_ids(&self, address: &str) -> Result<Vec<u32>> {
        let url = Self::url(address, "Shelly.GetInfo");
        let info = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<DeviceInfo>()
            .await?;

        let max = info
            .components
            .iter()
            .filter_map(|c| c.key.strip_prefix("switch:"))
            .filter_map(|n| n.parse::<u32>().ok())
            .max()
            .ok_or_else(|| anyhow!("no switch component reported"))?;
        Ok((0..=max).collect())
    }

    /// List relays with their name and state; unreachable ids are skipped
    pub async fn enumerate_relays(&self, address: &str) -> Vec<RelayInfo> {
        let ids = match self.relay_ids(address).await {
            Ok(ids) => ids,
            Err(e) => {
                debug!("Shelly.GetInfo failed ({e:#}), probing ids {:?}", FALLBACK_RELAYS);
                FALLBACK_RELAYS.collect()
            }
        };

        let mut relays = Vec::new();
        for id in ids {
            if let Ok(status) = self.status(address, id).await {
                relays.push(RelayInfo { id, name: status.name, output: status.output });
            }
        }
        relays
    }
}
