//! Configuration file support for stkflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (STKFLASH_*)
//! 3. Local config file (./stkflash.toml)
//! 4. Global config file (~/.config/stkflash/config.toml)

use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use stkflash::{ProgrammerConfig, ResetSignal};

const LOCAL_CONFIG: &str = "stkflash.toml";

/// USB device identification for port matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Check if this device matches the given USB info.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub serial: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
}

/// Port-specific configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Extra USB devices treated as programmers during auto-detection.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// Programming session defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Flash page size in bytes.
    pub page_size: Option<u8>,
    /// Control line wired to the target reset pin.
    pub reset_signal: Option<ResetSignal>,
    /// Sync probes before giving up.
    pub sync_attempts: Option<u32>,
    /// Reply timeout in milliseconds.
    pub ack_timeout_ms: Option<u64>,
}

impl FlashConfig {
    /// Apply the configured values on top of `base`.
    pub fn apply(&self, mut base: ProgrammerConfig) -> ProgrammerConfig {
        if let Some(page_size) = self.page_size {
            base.page_size = page_size;
        }
        if let Some(signal) = self.reset_signal {
            base.reset_signal = signal;
        }
        if let Some(attempts) = self.sync_attempts {
            base.max_sync_attempts = attempts;
        }
        if let Some(ms) = self.ack_timeout_ms {
            base.ack_timeout = Duration::from_millis(ms);
        }
        base
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
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
                    warn!("Failed to parse config file {}: {}", path.display(), e);
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
        ProjectDirs::from("", "", "stkflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.port.connection.serial.is_some() {
            self.port.connection.serial = other.port.connection.serial;
        }
        if other.port.connection.baud.is_some() {
            self.port.connection.baud = other.port.connection.baud;
        }
        for device in other.port.usb_device {
            if !self.port.usb_device.contains(&device) {
                self.port.usb_device.push(device);
            }
        }

        if other.flash.page_size.is_some() {
            self.flash.page_size = other.flash.page_size;
        }
        if other.flash.reset_signal.is_some() {
            self.flash.reset_signal = other.flash.reset_signal;
        }
        if other.flash.sync_attempts.is_some() {
            self.flash.sync_attempts = other.flash.sync_attempts;
        }
        if other.flash.ack_timeout_ms.is_some() {
            self.flash.ack_timeout_ms = other.flash.ack_timeout_ms;
        }
    }

    /// Remember a USB device for future auto-detection.
    ///
    /// Written to the local config when one exists, otherwise to the global one.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        let device = UsbDevice { vid, pid };
        if self.port.usb_device.contains(&device) {
            return Ok(());
        }

        let path = if Path::new(LOCAL_CONFIG).exists() {
            PathBuf::from(LOCAL_CONFIG)
        } else if let Some(global_path) = Self::global_config_path() {
            if let Some(dir) = global_path.parent() {
                fs::create_dir_all(dir)?;
            }
            global_path
        } else {
            PathBuf::from(LOCAL_CONFIG)
        };

        let mut on_disk = Self::load_from_file(&path).unwrap_or_default();
        on_disk.port.usb_device.push(device.clone());
        self.port.usb_device.push(device);

        fs::write(&path, toml::to_string_pretty(&on_disk)?)?;
        info!("Saved USB device {vid:04X}:{pid:04X} to {}", path.display());

        Ok(())
    }
}
