//! Driver configuration

use crate::control::ControlTiming;
use crate::device::DeviceSettings;
use crate::error::{AvpError, Result};
use crate::info::MAX_QUEUES;
use crate::pool::PollPolicy;
use crate::rx::MAX_RX_BURST;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Name of the configuration file inside the config directory
pub const CONFIG_FILE: &str = "avp.toml";

/// AVP driver configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvpConfig {
    /// RX worker placement
    pub cpus: CpuConfig,

    /// Polling behavior
    pub poll: PollConfig,

    /// Control channel timing
    pub control: ControlConfig,

    /// Queue limits
    pub queues: QueueConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    /// CPUs eligible for RX workers (empty = all)
    pub eligible: Vec<usize>,

    /// Pin each worker to its CPU
    pub pin_workers: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Busy passes before a worker services control responses and yields
    pub max_passes: usize,

    /// Sleep after an idle pass (microseconds)
    pub idle_backoff_us: u64,

    /// Packets per queue poll
    pub rx_burst: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_passes: 16,
            idle_backoff_us: 50,
            rx_burst: MAX_RX_BURST,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Wait per attempt (milliseconds)
    pub timeout_ms: u64,

    /// Attempts before a request fails
    pub attempts: u32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 500,
            attempts: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_rx_queues: u16,
    pub max_tx_queues: u16,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_rx_queues: MAX_QUEUES as u16,
            max_tx_queues: MAX_QUEUES as u16,
        }
    }
}

impl AvpConfig {
    pub fn load(config_dir: impl AsRef<Path>) -> Result<Self> {
        let config_dir = config_dir.as_ref();
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            // Create default config
            let config = Self::default();

            std::fs::create_dir_all(config_dir)?;
            let content = toml::to_string_pretty(&config)?;
            std::fs::write(&config_path, &content)?;
            tracing::info!(path = %config_path.display(), "Wrote default configuration");

            Ok(config)
        }
    }

    pub fn save(&self, config_dir: impl AsRef<Path>) -> Result<()> {
        let config_path = config_dir.as_ref().join(CONFIG_FILE);
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, &content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(AvpError::Config(msg.to_string()));
        if self.poll.rx_burst == 0 || self.poll.rx_burst > MAX_RX_BURST {
            return invalid("poll.rx_burst must be between 1 and 64");
        }
        if self.poll.max_passes == 0 {
            return invalid("poll.max_passes must be at least 1");
        }
        if self.control.attempts == 0 {
            return invalid("control.attempts must be at least 1");
        }
        if self.control.timeout_ms == 0 {
            return invalid("control.timeout_ms must be non-zero");
        }
        if self.queues.max_rx_queues == 0 || self.queues.max_tx_queues == 0 {
            return invalid("queue limits must be at least 1");
        }
        if let Some(cpu) = self.cpus.eligible.iter().find(|&&c| c >= crate::cpu::MAX_CPUS) {
            return Err(AvpError::Config(format!("cpus.eligible: CPU {cpu} out of range")));
        }
        Ok(())
    }

    /// Worker policy
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            max_passes: self.poll.max_passes,
            idle_backoff: Duration::from_micros(self.poll.idle_backoff_us),
            rx_burst: self.poll.rx_burst,
            pin_workers: self.cpus.pin_workers,
        }
    }

    /// Per-device limits
    pub fn device_settings(&self) -> DeviceSettings {
        DeviceSettings {
            max_rx_queues: self.queues.max_rx_queues,
            max_tx_queues: self.queues.max_tx_queues,
            control: ControlTiming {
                timeout: Duration::from_millis(self.control.timeout_ms),
                attempts: self.control.attempts,
            },
        }
    }
}
