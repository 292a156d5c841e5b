//! fleetd.toml configuration parser.
//!
//! Every section is optional. Missing keys take the defaults below, so an
//! empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub server: ServerConfig,
    pub dispatcher: DispatcherConfig,
    pub queue: QueueConfig,
    pub alerts: AlertConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    /// Base URL under which stored objects are served to sites.
    pub public_base_url: String,
    /// Seconds a new connection has to send `authenticate`.
    pub auth_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8443,
            data_dir: PathBuf::from("/var/lib/fleetgrid"),
            public_base_url: "http://localhost:8443/objects".to_string(),
            auth_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub sweep_interval_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Pause between replayed commands on reconnect.
    pub replay_delay_ms: u64,
    pub default_priority: u8,
    pub default_max_attempts: u32,
    pub cleanup_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            replay_delay_ms: 500,
            default_priority: 5,
            default_max_attempts: 3,
            cleanup_interval_secs: 300,
        }
    }
}

impl QueueConfig {
    pub fn replay_delay(&self) -> Duration {
        Duration::from_millis(self.replay_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub max_temperature_c: f64,
    pub max_disk_percent: f64,
    pub max_memory_percent: f64,
    /// Window during which a repeat alert of the same type is suppressed.
    pub suppression_secs: u64,
    /// Heartbeat samples kept per site; older ones are pruned on insert.
    pub heartbeat_retention: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            max_temperature_c: 80.0,
            max_disk_percent: 90.0,
            max_memory_percent: 90.0,
            suppression_secs: 60 * 60,
            heartbeat_retention: 1440,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Automatic re-deliveries after a transient deployment failure.
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FleetConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the control plane cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(1..=10).contains(&self.queue.default_priority) {
            anyhow::bail!(
                "queue.default_priority must be between 1 and 10, got {}",
                self.queue.default_priority
            );
        }
        if self.queue.default_max_attempts == 0 {
            anyhow::bail!("queue.default_max_attempts must be at least 1");
        }
        if self.dispatcher.sweep_interval_secs == 0 {
            anyhow::bail!("dispatcher.sweep_interval_secs must be at least 1");
        }
        if self.alerts.heartbeat_retention == 0 {
            anyhow::bail!("alerts.heartbeat_retention must be at least 1");
        }
        if self.server.auth_timeout_secs == 0 {
            anyhow::bail!("server.auth_timeout_secs must be at least 1");
        }
        Ok(())
    }
}
