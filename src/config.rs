//! Configuration module
//!
//! Reads configuration from ~/.config/sensorlog/config.toml

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub output: OutputConfig,
    pub permissions: PermissionsConfig,
    pub location: LocationConfig,
    pub signal: SignalConfig,
    pub battery: BatteryConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory holding data.csv (defaults to the Downloads directory)
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    pub location: bool,
    pub storage: bool,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            location: true,
            storage: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// gpsd host:port
    pub gpsd_addr: String,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            gpsd_addr: "127.0.0.1:2947".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalBackend {
    /// ModemManager over the system D-Bus (discrete levels)
    ModemManager,
    /// AT+CSQ on a modem serial port (GSM signal strength)
    Serial,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub backend: SignalBackend,
    pub serial_device: String,
    pub serial_baud: u32,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            backend: SignalBackend::ModemManager,
            serial_device: "/dev/ttyUSB2".to_string(),
            serial_baud: 115_200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    pub enabled: bool,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Get the config file path
    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("sensorlog").join("config.toml"))
    }

    /// Load config from file, or return default if not found
    pub fn load() -> Self {
        let Some(path) = Self::path() else {
            tracing::warn!("Could not determine config directory, using defaults");
            return Self::default();
        };

        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", path);
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::error!("Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::error!("Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Directory that receives data.csv
    pub fn output_dir(&self) -> PathBuf {
        self.output
            .dir
            .clone()
            .or_else(dirs::download_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}
