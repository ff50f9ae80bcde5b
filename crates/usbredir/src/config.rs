//! Channel configuration management

use anyhow::{Context, Result, anyhow};
use common::FilterRule;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedirConfig {
    #[serde(default)]
    pub channel: ChannelSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Guest-side redirection filter
    #[serde(default)]
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Install the LZ4 codec and advertise the capability
    #[serde(default = "ChannelSettings::default_compression")]
    pub compression: bool,
    /// Threads in the blocking attach/detach pool (1-64)
    #[serde(default = "ChannelSettings::default_worker_threads")]
    pub worker_threads: usize,
    /// How long a device error report waits for the session; unset waits forever
    #[serde(default)]
    pub error_ack_timeout_ms: Option<u64>,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            compression: Self::default_compression(),
            worker_threads: Self::default_worker_threads(),
            error_ack_timeout_ms: None,
        }
    }
}

impl ChannelSettings {
    fn default_compression() -> bool {
        true
    }

    fn default_worker_threads() -> usize {
        2
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Devices the guest may auto-redirect, as "VID:PID" ("0x1234:*")
    ///
    /// Empty allows everything; otherwise anything unlisted is denied.
    #[serde(default)]
    pub filters: Vec<String>,
}

impl UsbSettings {
    /// Filter rules for the guest, in evaluation order
    pub fn filter_rules(&self) -> Result<Vec<FilterRule>> {
        if self.filters.is_empty() {
            return Ok(Vec::new());
        }

        let mut rules = Vec::with_capacity(self.filters.len() + 1);
        for filter in &self.filters {
            let (vendor_id, product_id) = RedirConfig::parse_filter(filter)?;
            rules.push(FilterRule {
                device_class: None,
                vendor_id,
                product_id,
                device_version_bcd: None,
                allow: true,
            });
        }
        rules.push(FilterRule {
            device_class: None,
            vendor_id: None,
            product_id: None,
            device_version_bcd: None,
            allow: false,
        });
        Ok(rules)
    }
}

impl RedirConfig {
    /// Load configuration from file
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbredir/config.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: RedirConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load from the standard locations, falling back to defaults
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

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

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbredir").join("config.toml")
        } else {
            PathBuf::from(".config/usbredir/config.toml")
        }
    }

    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        if !(1..=64).contains(&self.channel.worker_threads) {
            return Err(anyhow!(
                "Invalid worker_threads {}, must be between 1 and 64",
                self.channel.worker_threads
            ));
        }

        if self.channel.error_ack_timeout_ms == Some(0) {
            return Err(anyhow!("error_ack_timeout_ms must be greater than 0"));
        }

        for filter in &self.usb.filters {
            Self::parse_filter(filter)?;
        }

        Ok(())
    }

    /// Parse "VID:PID" where either side may be "*"
    fn parse_filter(filter: &str) -> Result<(Option<u16>, Option<u16>)> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                filter
            ));
        }

        Ok((
            Self::parse_hex_id(parts[0], "VID")?,
            Self::parse_hex_id(parts[1], "PID")?,
        ))
    }

    fn parse_hex_id(id: &str, name: &str) -> Result<Option<u16>> {
        if id == "*" {
            return Ok(None);
        }

        let hex_part = id
            .strip_prefix("0x")
            .or_else(|| id.strip_prefix("0X"))
            .ok_or_else(|| {
                anyhow!("Invalid {} '{}', must start with '0x' (e.g., '0x1234')", name, id)
            })?;

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map(Some)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
    }
}
