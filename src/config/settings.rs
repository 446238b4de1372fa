//! Application settings

use super::ConfigError;
use crate::core::transport::{SerialConfig, SerialParity, TransportSettings};
use crate::core::workflow::{EngineSettings, RegistrySettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Serial defaults
    pub serial: SerialDefaults,
    /// Transport tuning
    pub transport: TransportSettings,
    /// Workflow engine tuning
    pub engine: EngineSettings,
    /// Execution retention
    pub registry: RegistrySettings,
    /// Logging settings
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load from the platform config directory; defaults if the file is missing
    pub fn load() -> Result<Self, ConfigError> {
        let path = super::config_file().ok_or(ConfigError::NoConfigDir)?;
        Self::load_from(&path)
    }

    /// Load from an explicit file; defaults if it is missing
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Save to the platform config directory
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = super::config_file().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save to an explicit file, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Serial settings used when a command names only a port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialDefaults {
    /// Port used when none is given (auto-detect otherwise)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits
    pub data_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Stop bits
    pub stop_bits: u8,
    /// Read timeout in milliseconds
    pub timeout_ms: u64,
    /// Rates tried, in order, by baud auto-detection
    pub baud_candidates: Vec<u32>,
}

impl Default for SerialDefaults {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 115_200,
            data_bits: 8,
            parity: SerialParity::None,
            stop_bits: 1,
            timeout_ms: 500,
            baud_candidates: vec![115_200, 57_600, 38_400, 19_200, 9600, 4800, 2400, 1200],
        }
    }
}

impl SerialDefaults {
    /// Full configuration for `port`
    pub fn to_config(&self, port: &str) -> SerialConfig {
        SerialConfig {
            port: port.to_string(),
            baud_rate: self.baud_rate,
            data_bits: self.data_bits,
            stop_bits: self.stop_bits,
            parity: self.parity,
            timeout_ms: self.timeout_ms,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` overrides it
    pub level: String,
    /// Emit JSON lines instead of text
    pub json: bool,
    /// Also write a daily-rolling log file here
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
        }
    }
}
