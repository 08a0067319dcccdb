//! Host configuration management

use crate::usb::{AcquirePolicy, LoopPolicy, OpenPolicy};
use anyhow::{Context, Result, anyhow};
use protocol::APPLE_VENDOR_ID;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub usb: UsbSettings,
    /// Session opening
    #[serde(default)]
    pub open: OpenSettings,
    /// Acquisition loop pacing
    #[serde(default)]
    pub acquire: AcquireSettings,
    /// Bound on waiting for aborted transfers
    #[serde(default)]
    pub event_loop: EventLoopSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbSettings {
    #[serde(default = "UsbSettings::default_vendor_id")]
    pub vendor_id: u16,
    /// Timeout for CLI transfers that need one
    #[serde(default = "UsbSettings::default_timeout_ms")]
    pub default_timeout_ms: u64,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            vendor_id: Self::default_vendor_id(),
            default_timeout_ms: Self::default_timeout_ms(),
        }
    }
}

impl UsbSettings {
    fn default_vendor_id() -> u16 {
        APPLE_VENDOR_ID
    }

    fn default_timeout_ms() -> u64 {
        5000
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenSettings {
    /// Attempts at claiming the device right after it enumerates
    #[serde(default = "OpenSettings::default_claim_attempts")]
    pub claim_attempts: u32,
    #[serde(default = "OpenSettings::default_claim_retry_delay_us")]
    pub claim_retry_delay_us: u64,
    /// Configuration value selected after open
    #[serde(default = "OpenSettings::default_configuration")]
    pub configuration: u8,
}

impl Default for OpenSettings {
    fn default() -> Self {
        Self {
            claim_attempts: Self::default_claim_attempts(),
            claim_retry_delay_us: Self::default_claim_retry_delay_us(),
            configuration: Self::default_configuration(),
        }
    }
}

impl OpenSettings {
    fn default_claim_attempts() -> u32 {
        5
    }

    fn default_claim_retry_delay_us() -> u64 {
        1
    }

    fn default_configuration() -> u8 {
        1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireSettings {
    #[serde(default = "AcquireSettings::default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// Scales a wait in seconds into an attempt budget
    #[serde(default = "AcquireSettings::default_attempts_per_second")]
    pub attempts_per_second: u32,
}

impl Default for AcquireSettings {
    fn default() -> Self {
        Self {
            retry_interval_ms: Self::default_retry_interval_ms(),
            attempts_per_second: Self::default_attempts_per_second(),
        }
    }
}

impl AcquireSettings {
    fn default_retry_interval_ms() -> u64 {
        250
    }

    fn default_attempts_per_second() -> u32 {
        4
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLoopSettings {
    /// Longest single event loop iteration
    #[serde(default = "EventLoopSettings::default_slice_ms")]
    pub slice_ms: u64,
    #[serde(default = "EventLoopSettings::default_max_iterations")]
    pub max_iterations: u32,
}

impl Default for EventLoopSettings {
    fn default() -> Self {
        Self {
            slice_ms: Self::default_slice_ms(),
            max_iterations: Self::default_max_iterations(),
        }
    }
}

impl EventLoopSettings {
    fn default_slice_ms() -> u64 {
        10
    }

    fn default_max_iterations() -> u32 {
        500
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "LoggingSettings::default_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

impl LoggingSettings {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl HostConfig {
    /// Load configuration from the specified path
    ///
    /// Without a path the standard locations are tried in order.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            Self::search_paths()
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HostConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("recovery-usb").join("host.toml")
        } else {
            PathBuf::from(".config/recovery-usb/host.toml")
        }
    }

    fn search_paths() -> Vec<PathBuf> {
        vec![
            Self::default_path(),
            PathBuf::from("/etc/recovery-usb/host.toml"),
        ]
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        if self.open.claim_attempts == 0 {
            return Err(anyhow!("open.claim_attempts must be at least 1"));
        }

        if self.acquire.attempts_per_second == 0 {
            return Err(anyhow!("acquire.attempts_per_second must be at least 1"));
        }

        if self.event_loop.max_iterations == 0 || self.event_loop.slice_ms == 0 {
            return Err(anyhow!(
                "event_loop.slice_ms and event_loop.max_iterations must be non-zero"
            ));
        }

        Ok(())
    }

    pub fn loop_policy(&self) -> LoopPolicy {
        LoopPolicy {
            slice: Duration::from_millis(self.event_loop.slice_ms),
            max_iterations: self.event_loop.max_iterations,
        }
    }

    pub fn open_policy(&self) -> OpenPolicy {
        OpenPolicy {
            vendor_id: self.usb.vendor_id,
            claim_attempts: self.open.claim_attempts,
            claim_retry_delay: Duration::from_micros(self.open.claim_retry_delay_us),
            configuration: self.open.configuration,
            event_loop: self.loop_policy(),
        }
    }

    pub fn acquire_policy(&self) -> AcquirePolicy {
        AcquirePolicy {
            retry_interval: Duration::from_millis(self.acquire.retry_interval_ms),
            attempts_per_second: self.acquire.attempts_per_second,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.usb.default_timeout_ms)
    }
}
