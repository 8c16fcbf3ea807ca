//! Configuration file support for t7flash.
//!
//! Configuration is loaded from multiple sources with the following
//! priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (T7FLASH_*)
//! 3. Local config file (./t7flash.toml)
//! 4. Global config file (~/.config/t7flash/config.toml)

use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default-device settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Preferred device serial number.
    pub serial: Option<u32>,
    /// Explicit host address, bypassing discovery.
    pub host: Option<String>,
    /// Default connection type (usb, ethernet, any).
    pub connection: Option<String>,
}

/// Upgrade behaviour settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpgradeConfig {
    /// Verify the written image byte-for-byte by default.
    #[serde(default)]
    pub verify_image: bool,
    /// Skip the post-erase verification pass.
    #[serde(default)]
    pub skip_erase_check: bool,
    /// Re-enumeration timeout in seconds.
    pub timeout_secs: Option<u64>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Device selection settings.
    #[serde(default)]
    pub device: DeviceConfig,
    /// Upgrade settings.
    #[serde(default)]
    pub upgrade: UpgradeConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                if let Some(global_config) = Self::load_from_file(&global_path) {
                    debug!("Loaded global config from {}", global_path.display());
                    config.merge(global_config);
                }
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new("t7flash.toml")) {
            debug!("Loaded local config from t7flash.toml");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse TOML config {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "t7flash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.device.serial.is_some() {
            self.device.serial = other.device.serial;
        }
        if other.device.host.is_some() {
            self.device.host = other.device.host;
        }
        if other.device.connection.is_some() {
            self.device.connection = other.device.connection;
        }

        if other.upgrade.verify_image {
            self.upgrade.verify_image = true;
        }
        if other.upgrade.skip_erase_check {
            self.upgrade.skip_erase_check = true;
        }
        if other.upgrade.timeout_secs.is_some() {
            self.upgrade.timeout_secs = other.upgrade.timeout_secs;
        }
    }

    /// Remember a device serial for future runs.
    pub fn remember_device(&mut self, serial: u32) -> anyhow::Result<()> {
        if self.device.serial == Some(serial) {
            return Ok(());
        }

        let path = if Path::new("t7flash.toml").exists() {
            PathBuf::from("t7flash.toml")
        } else if let Some(global_dir) = Self::global_config_dir() {
            fs::create_dir_all(&global_dir)?;
            global_dir.join("config.toml")
        } else {
            PathBuf::from("t7flash.toml")
        };

        self.device.serial = Some(serial);

        let content = toml::to_string_pretty(&self)?;
        fs::write(&path, content)?;
        info!("Saved default device to {}", path.display());

        Ok(())
    }
}
