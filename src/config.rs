use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use ipnet::IpNet;
use serde::Deserialize;

const SUPPORTED_VERSION: i64 = 1;

#[derive(Debug, Deserialize)]
struct VersionProbe {
    version: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Flow aggregators flush and reclaim on this period. Flow logs append a
    /// new row each flush, so this runs long to save disk.
    #[serde(with = "humantime_serde")]
    pub flow_log_interval: Duration,
    /// Subscriber aggregators flush and reclaim on this period. Usage rows
    /// update an account, so this can run short.
    #[serde(with = "humantime_serde")]
    pub user_log_interval: Duration,
    pub interface: String,
    pub user_subnet: IpNet,
    #[serde(default)]
    pub ignored_user_addresses: HashSet<IpAddr>,
    #[serde(default)]
    pub metrics_port: Option<u16>,
    pub custom: CustomConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomConfig {
    pub db_location: String,
    pub db_user: String,
    pub db_pass: String,
    #[serde(with = "humantime_serde")]
    pub reenable_poll_interval: Duration,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file: {:?}", path.as_ref()))?;
        Self::parse(&content)
    }

    fn parse(content: &str) -> Result<Self> {
        let probe: VersionProbe =
            serde_yaml::from_str(content).context("failed to read config file version")?;
        let version = probe.version.unwrap_or(1);
        if version != SUPPORTED_VERSION {
            anyhow::bail!("unsupported configuration version '{}'", version);
        }

        let config: Config =
            serde_yaml::from_str(content).context("failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.interface.is_empty() {
            anyhow::bail!("an interface to capture on must be configured");
        }
        if self.flow_log_interval.is_zero() || self.user_log_interval.is_zero() {
            anyhow::bail!("log intervals must be nonzero");
        }
        if self.custom.reenable_poll_interval.is_zero() {
            anyhow::bail!("reenablePollInterval must be nonzero");
        }
        Ok(())
    }
}
