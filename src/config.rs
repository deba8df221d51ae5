//! # Configuration Module
//!
//! Handles loading, validating and first-boot creation of the TOML
//! configuration.
//!
//! Every field has a default, so a partial file (or none at all) yields a
//! working logger. When the configuration file does not exist yet, the
//! defaults are written to it so the operator has something to edit.

use chrono::format::{Item, StrftimeItems};
use chrono::NaiveDate;
use serde::de::Error;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{LoggerError, Result};
use crate::frame::{BlockSize, FramePreferences};
use crate::storage::{paths, ContextMode};

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub gnss: GnssConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub button: ButtonConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Device identity
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DeviceConfig {
    /// Prefix of every log file name
    #[serde(default = "default_device_id")]
    pub id: String,
}

/// Log file storage
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,

    #[serde(default = "default_extension")]
    pub extension: String,

    /// strftime pattern for the timestamp part of file names
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: String,

    /// Keep one compression context for all files
    #[serde(default = "default_reuse_context")]
    pub reuse_context: bool,

    /// Append an xxHash32 of the content to every frame
    #[serde(default)]
    pub content_checksum: bool,

    /// Delete `.tmp` files left by a previous run instead of only reporting them
    #[serde(default)]
    pub discard_stale_temp: bool,

    /// JSON status report path; empty disables it
    #[serde(default)]
    pub status_file: String,
}

/// Record queue
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

/// GNSS receiver
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GnssConfig {
    #[serde(default = "default_gnss_port")]
    pub port: String,

    #[serde(default = "default_gnss_baud_rate")]
    pub baud_rate: u32,

    /// Sentence types to log; empty logs everything
    #[serde(default = "default_sentences")]
    pub sentences: Vec<String>,

    /// Discard records while the receiver reports no fix
    #[serde(default = "default_require_fix")]
    pub require_fix: bool,

    /// Wait between attempts to reopen a lost receiver
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

/// Where file timestamps come from
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClockSource {
    /// GNSS time, system clock until the receiver reports one
    Gnss,
    /// Host clock (UTC)
    System,
}

/// Rotation checks
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RotationConfig {
    /// Seconds between periodic rotation checks
    #[serde(default = "default_check_interval_s")]
    pub check_interval_s: u64,

    #[serde(default = "default_clock")]
    pub clock: ClockSource,
}

/// User button
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ButtonConfig {
    /// evdev device, e.g. `/dev/input/event0`; empty disables the button
    #[serde(default)]
    pub device_path: String,

    #[serde(default = "default_key_code")]
    pub key_code: u16,
}

/// Upload of finished files
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct UploadConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_outbox_dir")]
    pub outbox_dir: PathBuf,
}

/// Diagnostic logging
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Directory for daily log files; empty logs to stderr only
    #[serde(default)]
    pub dir: String,

    /// Default filter when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_device_id() -> String { "icarus_gnssr0".to_string() }

fn default_data_dir() -> PathBuf { PathBuf::from("./data") }
fn default_archive_dir() -> PathBuf { PathBuf::from("./archive") }
fn default_extension() -> String { "lz4".to_string() }
fn default_timestamp_format() -> String { "%Y-%m-%dT%H%M%S".to_string() }
fn default_reuse_context() -> bool { true }

fn default_queue_capacity() -> usize { 10 }

fn default_gnss_port() -> String { "/dev/ttyUSB0".to_string() }
fn default_gnss_baud_rate() -> u32 { 9600 }
fn default_sentences() -> Vec<String> { vec!["RMC".to_string(), "GSV".to_string()] }
fn default_require_fix() -> bool { true }
fn default_reconnect_interval_ms() -> u64 { 1000 }

fn default_check_interval_s() -> u64 { 60 }
fn default_clock() -> ClockSource { ClockSource::Gnss }

fn default_key_code() -> u16 { 256 }

fn default_outbox_dir() -> PathBuf { PathBuf::from("./outbox") }

fn default_log_level() -> String { "info".to_string() }

impl Default for DeviceConfig {
    fn default() -> Self {
        Self { id: default_device_id() }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            archive_dir: default_archive_dir(),
            extension: default_extension(),
            timestamp_format: default_timestamp_format(),
            reuse_context: default_reuse_context(),
            content_checksum: false,
            discard_stale_temp: false,
            status_file: String::new(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: default_queue_capacity() }
    }
}

impl Default for GnssConfig {
    fn default() -> Self {
        Self {
            port: default_gnss_port(),
            baud_rate: default_gnss_baud_rate(),
            sentences: default_sentences(),
            require_fix: default_require_fix(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
        }
    }
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            check_interval_s: default_check_interval_s(),
            clock: default_clock(),
        }
    }
}

impl Default for ButtonConfig {
    fn default() -> Self {
        Self {
            device_path: String::new(),
            key_code: default_key_code(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            outbox_dir: default_outbox_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: String::new(),
            level: default_log_level(),
        }
    }
}

impl StorageConfig {
    pub fn context_mode(&self) -> ContextMode {
        if self.reuse_context {
            ContextMode::Reused
        } else {
            ContextMode::PerStream
        }
    }

    pub fn frame_preferences(&self) -> FramePreferences {
        FramePreferences {
            block_size: BlockSize::Max64KB,
            content_checksum: self.content_checksum,
        }
    }

    pub fn status_file(&self) -> Option<PathBuf> {
        (!self.status_file.is_empty()).then(|| PathBuf::from(&self.status_file))
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
    /// use gnssr_logger::config::Config;
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

    /// Load `path`, or write the defaults to it when it does not exist
    ///
    /// # Errors
    ///
    /// Returns error if an existing file is invalid or the default file
    /// cannot be written.
    pub fn load_or_create_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }

        let config = Config::default();
        config.validate()?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            paths::ensure_dir(dir)?;
        }
        fs::write(path, toml::to_string_pretty(&config)?)?;
        info!("Wrote default configuration to {}", path.display());
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    fn validate(&self) -> Result<()> {
        // Device id ends up in file names
        let id = &self.device.id;
        if id.is_empty() || id.contains(['/', '\\']) || id.chars().any(char::is_whitespace) {
            return Err(invalid("device id must be non-empty without slashes or whitespace"));
        }

        // Validate storage
        if self.storage.data_dir.as_os_str().is_empty() {
            return Err(invalid("storage data_dir cannot be empty"));
        }
        if self.storage.archive_dir.as_os_str().is_empty() {
            return Err(invalid("storage archive_dir cannot be empty"));
        }
        if self.storage.data_dir == self.storage.archive_dir {
            return Err(invalid("storage archive_dir must differ from data_dir"));
        }

        let ext = &self.storage.extension;
        if ext.is_empty() || ext.starts_with('.') || ext.contains(['/', '\\']) || ext == "tmp" {
            return Err(invalid("storage extension must be a plain suffix like \"lz4\""));
        }

        validate_timestamp_format(&self.storage.timestamp_format)?;

        // Validate queue
        if self.queue.capacity == 0 || self.queue.capacity > 10_000 {
            return Err(invalid("queue capacity must be between 1 and 10000"));
        }

        // Validate GNSS receiver
        if self.gnss.port.is_empty() {
            return Err(invalid("gnss port cannot be empty"));
        }
        if ![4800, 9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600]
            .contains(&self.gnss.baud_rate)
        {
            return Err(invalid(
                "gnss baud_rate must be one of: 4800, 9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600",
            ));
        }
        for sentence in &self.gnss.sentences {
            let ok = (3..=5).contains(&sentence.len())
                && sentence.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
            if !ok {
                return Err(invalid(format!(
                    "gnss sentence type {:?} must be 3-5 uppercase characters",
                    sentence
                )));
            }
        }

        if self.gnss.reconnect_interval_ms == 0 || self.gnss.reconnect_interval_ms > 60_000 {
            return Err(invalid("gnss reconnect_interval_ms must be between 1 and 60000"));
        }

        // Validate rotation
        if self.rotation.check_interval_s == 0 || self.rotation.check_interval_s > 3600 {
            return Err(invalid("rotation check_interval_s must be between 1 and 3600"));
        }

        // Validate upload
        if self.upload.enabled && self.upload.outbox_dir.as_os_str().is_empty() {
            return Err(invalid("upload outbox_dir cannot be empty when enabled"));
        }

        if self.logging.level.is_empty() {
            return Err(invalid("logging level cannot be empty"));
        }

        Ok(())
    }
}

/// The pattern must parse and must not produce path separators
fn validate_timestamp_format(format: &str) -> Result<()> {
    if format.is_empty() || StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(invalid(format!("invalid timestamp_format {:?}", format)));
    }

    let sample = NaiveDate::from_ymd_opt(2024, 3, 1)
        .and_then(|d| d.and_hms_opt(9, 30, 0))
        .ok_or_else(|| invalid("invalid sample date"))?;
    // Items needing an offset (%z, %Z) cannot render a naive timestamp
    let mut rendered = String::new();
    write!(rendered, "{}", sample.format(format)).map_err(|_| {
        invalid(format!(
            "timestamp_format {:?} cannot format a local timestamp",
            format
        ))
    })?;
    if rendered.contains(['/', '\\']) {
        return Err(invalid(format!(
            "timestamp_format {:?} produces path separators",
            format
        )));
    }
    Ok(())
}

fn invalid(msg: impl std::fmt::Display) -> LoggerError {
    LoggerError::Config(toml::de::Error::custom(msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.device.id, "icarus_gnssr0");
        assert_eq!(config.queue.capacity, 10);
        assert_eq!(config.storage.context_mode(), ContextMode::Reused);
        assert!(!config.storage.frame_preferences().content_checksum);
        assert_eq!(config.storage.status_file(), None);
    }

    #[test]
    fn test_load_config_from_file() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let toml_content = r#"
[device]
id = "gnssr0"

[storage]
data_dir = "/sd/data"
reuse_context = false
content_checksum = true

[gnss]
sentences = ["RMC"]

[rotation]
clock = "system"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.device.id, "gnssr0");
        assert_eq!(config.storage.data_dir, PathBuf::from("/sd/data"));
        assert_eq!(config.storage.archive_dir, default_archive_dir());
        assert_eq!(config.storage.context_mode(), ContextMode::PerStream);
        assert!(config.storage.frame_preferences().content_checksum);
        assert_eq!(config.gnss.sentences, vec!["RMC".to_string()]);
        assert_eq!(config.gnss.baud_rate, 9600);
        assert_eq!(config.rotation.clock, ClockSource::System);
    }

    #[test]
    fn test_load_empty_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "").unwrap();
        assert_eq!(Config::load(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_load_rejects_unknown_clock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[rotation]\nclock = \"sundial\"\n").unwrap();
        assert!(matches!(Config::load(&path), Err(LoggerError::Config(_))));
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config").join("gnssr.toml");

        let created = Config::load_or_create_default(&path).unwrap();
        assert!(path.exists());
        assert_eq!(created, Config::default());

        // Second start reads the file back
        let loaded = Config::load_or_create_default(&path).unwrap();
        assert_eq!(loaded, created);
    }

    #[test]
    fn test_load_or_create_keeps_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gnssr.toml");
        fs::write(&path, "[device]\nid = \"station7\"\n").unwrap();

        let config = Config::load_or_create_default(&path).unwrap();
        assert_eq!(config.device.id, "station7");
        assert_eq!(fs::read_to_string(&path).unwrap(), "[device]\nid = \"station7\"\n");
    }

    #[test]
    fn test_invalid_device_id() {
        for id in ["", "a/b", "two words"] {
            let mut config = Config::default();
            config.device.id = id.to_string();
            assert!(config.validate().is_err(), "id {:?} accepted", id);
        }
    }

    #[test]
    fn test_archive_same_as_data() {
        let mut config = Config::default();
        config.storage.archive_dir = config.storage.data_dir.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_extension() {
        for ext in ["", ".lz4", "tmp", "a/b"] {
            let mut config = Config::default();
            config.storage.extension = ext.to_string();
            assert!(config.validate().is_err(), "extension {:?} accepted", ext);
        }
    }

    #[test]
    fn test_timestamp_format() {
        assert!(validate_timestamp_format("%Y-%m-%dT%H%M").is_ok());
        assert!(validate_timestamp_format("%Y%m%d_%H%M%S").is_ok());
        assert!(validate_timestamp_format("").is_err());
        assert!(validate_timestamp_format("%Y/%m/%d").is_err());
        assert!(validate_timestamp_format("%Q").is_err());
        assert!(validate_timestamp_format("%Y%m%d%z").is_err());
        assert!(validate_timestamp_format("%Y%m%d%:z").is_err());
    }

    #[test]
    fn test_offset_timestamp_format_is_config_error() {
        let mut config = Config::default();
        config.storage.timestamp_format = "%Y%m%d%z".to_string();
        assert!(matches!(config.validate(), Err(LoggerError::Config(_))));
    }

    #[test]
    fn test_queue_capacity_bounds() {
        let mut config = Config::default();
        config.queue.capacity = 0;
        assert!(config.validate().is_err());
        config.queue.capacity = 10_001;
        assert!(config.validate().is_err());
        config.queue.capacity = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_baud_rate() {
        let mut config = Config::default();
        config.gnss.baud_rate = 1234;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reconnect_interval_bounds() {
        let mut config = Config::default();
        config.gnss.reconnect_interval_ms = 0;
        assert!(config.validate().is_err());
        config.gnss.reconnect_interval_ms = 60_001;
        assert!(config.validate().is_err());
        config.gnss.reconnect_interval_ms = 250;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_gnss_port() {
        let mut config = Config::default();
        config.gnss.port = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_sentence_type() {
        let mut config = Config::default();
        config.gnss.sentences = vec!["rmc".to_string()];
        assert!(config.validate().is_err());
        config.gnss.sentences = vec!["PUBX".to_string(), "GGA".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_check_interval_bounds() {
        let mut config = Config::default();
        config.rotation.check_interval_s = 0;
        assert!(config.validate().is_err());
        config.rotation.check_interval_s = 3601;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_upload_outbox_required_when_enabled() {
        let mut config = Config::default();
        config.upload.outbox_dir = PathBuf::new();
        assert!(config.validate().is_ok());
        config.upload.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_shipped_default_file_matches_defaults() {
        let shipped: Config = toml::from_str(include_str!("../config/default.toml")).unwrap();
        assert_eq!(shipped, Config::default());
    }

    #[test]
    fn test_status_file() {
        let mut config = Config::default();
        config.storage.status_file = "status.json".to_string();
        assert_eq!(config.storage.status_file(), Some(PathBuf::from("status.json")));
    }
}
