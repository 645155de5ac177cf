//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::Deserialize;
use serde::de::Error;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{FalconError, Result};
use crate::packet::protocol::{LED_BLUE, LED_GREEN, LED_RED};
use crate::transport::DeviceMatcher;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub firmware: FirmwareConfig,

    #[serde(default)]
    pub io_loop: IoLoopConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Transport backend selection
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Blocking serial port through the FTDI kernel driver
    #[default]
    Serial,

    /// Raw USB with cooperative polling
    Usb,
}

/// Device selection configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DeviceConfig {
    #[serde(default)]
    pub backend: Backend,

    #[serde(default)]
    pub index: usize,

    /// Match on the USB product description instead of VID/PID
    #[serde(default)]
    pub match_description: bool,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

/// Firmware loading configuration
#[derive(Debug, Deserialize, Clone)]
pub struct FirmwareConfig {
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default = "default_firmware_retries")]
    pub retries: u32,

    #[serde(default)]
    pub skip_checksum: bool,
}

/// Steady-state loop configuration
#[derive(Debug, Deserialize, Clone)]
pub struct IoLoopConfig {
    #[serde(default = "default_rate_hz")]
    pub rate_hz: u32,

    /// Keep the homing-mode bit set in every command
    #[serde(default = "default_homing")]
    pub homing: bool,

    /// Any of `"red"`, `"green"`, `"blue"`
    #[serde(default)]
    pub leds: Vec<String>,

    #[serde(default = "default_log_interval_loops")]
    pub log_interval_loops: u64,
}

/// Telemetry configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default = "default_telemetry_enabled")]
    pub enabled: bool,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_max_records_per_file")]
    pub max_records_per_file: usize,

    #[serde(default = "default_max_files_to_keep")]
    pub max_files_to_keep: usize,

    #[serde(default = "default_sample_every")]
    pub sample_every: usize,
}

/// Diagnostic log configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    /// Also write daily-rotated logs here
    #[serde(default)]
    pub log_dir: Option<String>,
}

// Default value functions
fn default_read_timeout_ms() -> u64 { 10 }

fn default_firmware_retries() -> u32 { 10 }

fn default_rate_hz() -> u32 { 1000 }
fn default_homing() -> bool { true }
fn default_log_interval_loops() -> u64 { 1000 }

fn default_telemetry_enabled() -> bool { false }
fn default_log_dir() -> String { "./logs".to_string() }
fn default_max_records_per_file() -> usize { 10000 }
fn default_max_files_to_keep() -> usize { 10 }
fn default_sample_every() -> usize { 10 }

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            index: 0,
            match_description: false,
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            path: None,
            retries: default_firmware_retries(),
            skip_checksum: false,
        }
    }
}

impl Default for IoLoopConfig {
    fn default() -> Self {
        Self {
            rate_hz: default_rate_hz(),
            homing: default_homing(),
            leds: Vec::new(),
            log_interval_loops: default_log_interval_loops(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: default_telemetry_enabled(),
            log_dir: default_log_dir(),
            max_records_per_file: default_max_records_per_file(),
            max_files_to_keep: default_max_files_to_keep(),
            sample_every: default_sample_every(),
        }
    }
}

impl DeviceConfig {
    /// Enumeration filter for the configured matching mode
    pub fn matcher(&self) -> DeviceMatcher {
        if self.match_description {
            DeviceMatcher::falcon_description()
        } else {
            DeviceMatcher::default()
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl IoLoopConfig {
    /// Time between loop ticks
    pub fn period(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / self.rate_hz.max(1) as u64)
    }

    /// LED bitfield for the configured colour names (unknown names ignored)
    pub fn led_bits(&self) -> u8 {
        self.leds
            .iter()
            .filter_map(|name| led_bit(name))
            .fold(0, |bits, bit| bits | bit)
    }
}

fn led_bit(name: &str) -> Option<u8> {
    match name.to_ascii_lowercase().as_str() {
        "red" => Some(LED_RED),
        "green" => Some(LED_GREEN),
        "blue" => Some(LED_BLUE),
        _ => None,
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use falcon_driver::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults
    ///
    /// # Errors
    ///
    /// Same as [`Config::load`] for a file that exists.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate configuration values
    ///
    /// # Returns
    ///
    /// * `Result<()>` - Ok if valid, Err if invalid
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if self.device.read_timeout_ms == 0 || self.device.read_timeout_ms > 1000 {
            return Err(FalconError::Config(
                toml::de::Error::custom("read_timeout_ms must be between 1 and 1000")
            ));
        }

        if self.firmware.path.as_deref().is_some_and(str::is_empty) {
            return Err(FalconError::Config(
                toml::de::Error::custom("firmware path cannot be empty when set")
            ));
        }

        if self.firmware.retries == 0 || self.firmware.retries > 100 {
            return Err(FalconError::Config(
                toml::de::Error::custom("retries must be between 1 and 100")
            ));
        }

        if self.io_loop.rate_hz == 0 || self.io_loop.rate_hz > 10000 {
            return Err(FalconError::Config(
                toml::de::Error::custom("rate_hz must be between 1 and 10000")
            ));
        }

        if self.io_loop.log_interval_loops == 0 {
            return Err(FalconError::Config(
                toml::de::Error::custom("log_interval_loops must be greater than 0")
            ));
        }

        for name in &self.io_loop.leds {
            if led_bit(name).is_none() {
                return Err(FalconError::Config(
                    toml::de::Error::custom(format!("unknown LED '{}' (expected red, green or blue)", name))
                ));
            }
        }

        // Validate telemetry configuration
        if self.telemetry.enabled && self.telemetry.log_dir.is_empty() {
            return Err(FalconError::Config(
                toml::de::Error::custom("telemetry log_dir cannot be empty when enabled")
            ));
        }

        if self.telemetry.max_records_per_file == 0 {
            return Err(FalconError::Config(
                toml::de::Error::custom("max_records_per_file must be greater than 0")
            ));
        }

        if self.telemetry.max_files_to_keep == 0 {
            return Err(FalconError::Config(
                toml::de::Error::custom("max_files_to_keep must be greater than 0")
            ));
        }

        if self.telemetry.sample_every == 0 {
            return Err(FalconError::Config(
                toml::de::Error::custom("sample_every must be greater than 0")
            ));
        }

        if self.logging.log_dir.as_deref().is_some_and(str::is_empty) {
            return Err(FalconError::Config(
                toml::de::Error::custom("logging log_dir cannot be empty when set")
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_valid_config() -> Config {
        Config::default()
    }

    fn load_str(toml_content: &str) -> Result<Config> {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();
        Config::load(temp_file.path())
    }

    #[test]
    fn test_default_config() {
        let config = create_valid_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.device.backend, Backend::Serial);
        assert_eq!(config.device.read_timeout(), Duration::from_millis(10));
        assert_eq!(config.firmware.retries, 10);
        assert!(config.io_loop.homing);
        assert!(!config.telemetry.enabled);
    }

    #[test]
    fn test_load_config_from_file() {
        let config = load_str(
            r#"
[device]
backend = "usb"
index = 1
match_description = true

[firmware]
path = "firmware/test_over_usb_firmware.bin"
retries = 3
skip_checksum = true

[io_loop]
rate_hz = 500
leds = ["red", "blue"]

[telemetry]
enabled = true
log_dir = "/tmp/falcon"
sample_every = 5

[logging]
log_dir = "/tmp/falcon-logs"
"#,
        )
        .unwrap();

        assert_eq!(config.device.backend, Backend::Usb);
        assert_eq!(config.device.index, 1);
        assert_eq!(config.device.matcher(), DeviceMatcher::falcon_description());
        assert_eq!(config.firmware.path.as_deref(), Some("firmware/test_over_usb_firmware.bin"));
        assert_eq!(config.firmware.retries, 3);
        assert!(config.firmware.skip_checksum);
        assert_eq!(config.io_loop.led_bits(), LED_RED | LED_BLUE);
        assert_eq!(config.io_loop.period(), Duration::from_millis(2));
        assert_eq!(config.telemetry.sample_every, 5);
        assert_eq!(config.telemetry.max_records_per_file, 10000);
        assert_eq!(config.logging.log_dir.as_deref(), Some("/tmp/falcon-logs"));
    }

    #[test]
    fn test_load_empty_file_uses_defaults() {
        let config = load_str("").unwrap();
        assert_eq!(config.device.matcher(), DeviceMatcher::default());
        assert_eq!(config.io_loop.rate_hz, 1000);
        assert!(config.firmware.path.is_none());
    }

    #[test]
    fn test_load_unknown_backend() {
        let result = load_str("[device]\nbackend = \"bluetooth\"\n");
        assert!(matches!(result, Err(FalconError::Config(_))));
    }

    #[test]
    fn test_load_invalid_values_fail_validation() {
        let result = load_str("[io_loop]\nrate_hz = 0\n");
        assert!(matches!(result, Err(FalconError::Config(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load("/nonexistent/falcon.toml");
        assert!(matches!(result, Err(FalconError::Io(_))));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = Config::load_or_default("/nonexistent/falcon.toml").unwrap();
        assert_eq!(config.firmware.retries, 10);
    }

    #[test]
    fn test_read_timeout_zero() {
        let mut config = create_valid_config();
        config.device.read_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_read_timeout_too_high() {
        let mut config = create_valid_config();
        config.device.read_timeout_ms = 1001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_firmware_path() {
        let mut config = create_valid_config();
        config.firmware.path = Some(String::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retries_zero() {
        let mut config = create_valid_config();
        config.firmware.retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retries_too_high() {
        let mut config = create_valid_config();
        config.firmware.retries = 101;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rate_hz_too_high() {
        let mut config = create_valid_config();
        config.io_loop.rate_hz = 10001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_interval_loops_zero() {
        let mut config = create_valid_config();
        config.io_loop.log_interval_loops = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_led() {
        let mut config = create_valid_config();
        config.io_loop.leds = vec!["green".into(), "purple".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_led_names_case_insensitive() {
        let mut config = create_valid_config();
        config.io_loop.leds = vec!["Green".into(), "RED".into()];
        assert!(config.validate().is_ok());
        assert_eq!(config.io_loop.led_bits(), LED_GREEN | LED_RED);
    }

    #[test]
    fn test_empty_log_dir_when_enabled() {
        let mut config = create_valid_config();
        config.telemetry.enabled = true;
        config.telemetry.log_dir = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_log_dir_when_disabled() {
        let mut config = create_valid_config();
        config.telemetry.enabled = false;
        config.telemetry.log_dir = String::new();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_max_records_per_file_zero() {
        let mut config = create_valid_config();
        config.telemetry.max_records_per_file = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_files_to_keep_zero() {
        let mut config = create_valid_config();
        config.telemetry.max_files_to_keep = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sample_every_zero() {
        let mut config = create_valid_config();
        config.telemetry.sample_every = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_logging_dir() {
        let mut config = create_valid_config();
        config.logging.log_dir = Some(String::new());
        assert!(config.validate().is_err());
    }
}
