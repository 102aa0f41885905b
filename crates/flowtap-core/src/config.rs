//! Configuration system for flowtap
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Validation of windows, caps and policies

use crate::publisher::OverflowPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete sensor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Sensor settings
    pub sensor: SensorSettings,

    /// Frame source settings
    pub capture: CaptureSettings,

    /// Reassembly engine settings
    pub reassembly: ReassemblySettings,

    /// HTTP decoder settings
    pub decoder: DecoderSettings,

    /// Event channel settings
    pub publisher: PublisherSettings,

    /// Sink settings
    pub export: ExportSettings,
}

/// Sensor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
        }
    }
}

/// Capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Interface to capture on (live mode)
    pub interface: Option<String>,

    /// Trace file to replay (offline mode)
    pub file: Option<String>,

    /// BPF capture expression, applied once at session start
    pub filter: String,

    /// Put the interface in promiscuous mode
    pub promiscuous: bool,

    /// Maximum bytes captured per frame
    pub snaplen: i32,

    /// Read timeout for live capture in milliseconds
    pub read_timeout_ms: i32,

    /// Frames buffered between the reader thread and the capture loop
    pub frame_buffer: usize,

    /// How often idle flows are flushed, in seconds
    pub flush_interval_secs: u64,

    /// Force-flush every flow when a trace file ends
    pub flush_on_end_of_trace: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            interface: None,
            file: None,
            filter: "tcp".to_string(),
            promiscuous: true,
            snaplen: 262_144,
            read_timeout_ms: 500,
            frame_buffer: 4096,
            flush_interval_secs: 60,
            flush_on_end_of_trace: true,
        }
    }
}

/// Reassembly settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblySettings {
    /// Flows idle (in capture time) longer than this are flushed and evicted
    pub idle_window_secs: u64,

    /// Cap on out-of-order bytes buffered per flow direction
    pub max_buffered_bytes_per_direction: usize,

    /// Cap on concurrently tracked flows
    pub max_flows: usize,
}

impl Default for ReassemblySettings {
    fn default() -> Self {
        Self {
            idle_window_secs: 120,
            max_buffered_bytes_per_direction: 1024 * 1024,
            max_flows: 65_536,
        }
    }
}

/// HTTP decoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderSettings {
    /// Byte budget for a start line before the stream is abandoned
    pub max_start_line_bytes: usize,

    /// Byte budget for a header block
    pub max_header_bytes: usize,

    /// Maximum header fields per message
    pub max_headers: usize,
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self {
            max_start_line_bytes: 8 * 1024,
            max_header_bytes: 64 * 1024,
            max_headers: 100,
        }
    }
}

/// Event channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherSettings {
    /// Undelivered events held by the channel
    pub capacity: usize,

    /// Behaviour when the channel is full
    pub overflow: OverflowPolicy,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            capacity: 4096,
            overflow: OverflowPolicy::Block,
        }
    }
}

/// Export settings container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    /// JSONL file output
    pub jsonl: JsonlExportConfig,

    /// Console output
    pub stdout: StdoutExportConfig,
}

/// JSONL export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonlExportConfig {
    /// Enable JSONL export
    pub enabled: bool,

    /// Output file path
    pub path: String,

    /// Append to existing file
    pub append: bool,

    /// Flush after each event
    pub flush_each: bool,

    /// Pretty print JSON
    pub pretty: bool,
}

impl Default for JsonlExportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "flowtap-events.jsonl".to_string(),
            append: true,
            flush_each: true,
            pretty: false,
        }
    }
}

/// Console export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StdoutExportConfig {
    /// Enable console output
    pub enabled: bool,

    /// Format: text, json
    pub format: String,
}

impl Default for StdoutExportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            format: "text".to_string(),
        }
    }
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. FLOWTAP_CONFIG environment variable
    /// 3. ~/.config/flowtap/config.toml
    /// 4. /etc/flowtap/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<SensorConfig> {
        let config_path = self.find_config_file();

        let mut config = if let Some(path) = config_path {
            info!("Loading configuration from: {}", path.display());
            Self::load_from_file(&path)?
        } else {
            debug!("No config file found, using defaults");
            SensorConfig::default()
        };

        Self::apply_env_overrides(&mut config);

        Self::validate(&config)?;

        Ok(config)
    }

    /// Find the config file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        if let Ok(env_path) = std::env::var("FLOWTAP_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("FLOWTAP_CONFIG path does not exist: {}", env_path);
        }

        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                return Some(path);
            }
        }

        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/flowtap/config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> ConfigResult<SensorConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: SensorConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(config: &mut SensorConfig) {
        if let Ok(val) = std::env::var("FLOWTAP_LOG_LEVEL") {
            config.sensor.log_level = val;
        }

        if let Ok(val) = std::env::var("FLOWTAP_INTERFACE") {
            config.capture.interface = Some(val);
        }
        if let Ok(val) = std::env::var("FLOWTAP_FILTER") {
            config.capture.filter = val;
        }
        if let Ok(val) = std::env::var("FLOWTAP_PROMISCUOUS") {
            config.capture.promiscuous = val.parse().unwrap_or(config.capture.promiscuous);
        }

        if let Ok(val) = std::env::var("FLOWTAP_IDLE_WINDOW_SECS") {
            if let Ok(secs) = val.parse() {
                config.reassembly.idle_window_secs = secs;
            }
        }

        if let Ok(val) = std::env::var("FLOWTAP_OVERFLOW") {
            match val.parse() {
                Ok(policy) => config.publisher.overflow = policy,
                Err(e) => warn!("Ignoring FLOWTAP_OVERFLOW: {}", e),
            }
        }

        if let Ok(val) = std::env::var("FLOWTAP_JSONL_PATH") {
            config.export.jsonl.path = val;
            config.export.jsonl.enabled = true;
        }
        if let Ok(val) = std::env::var("FLOWTAP_JSONL_ENABLED") {
            config.export.jsonl.enabled = val.parse().unwrap_or(config.export.jsonl.enabled);
        }
    }

    /// Validate configuration
    pub fn validate(config: &SensorConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.sensor.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.sensor.log_level, valid_levels
            )));
        }

        if config.capture.interface.is_some() && config.capture.file.is_some() {
            return Err(ConfigError::ValidationError(
                "capture.interface and capture.file are mutually exclusive".to_string(),
            ));
        }

        if config.capture.snaplen <= 0 {
            return Err(ConfigError::ValidationError(
                "capture.snaplen must be positive".to_string(),
            ));
        }

        if config.capture.flush_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "capture.flush_interval_secs cannot be 0".to_string(),
            ));
        }

        if config.reassembly.idle_window_secs == 0 {
            return Err(ConfigError::ValidationError(
                "reassembly.idle_window_secs cannot be 0".to_string(),
            ));
        }

        if config.reassembly.max_buffered_bytes_per_direction == 0 {
            return Err(ConfigError::ValidationError(
                "reassembly.max_buffered_bytes_per_direction cannot be 0".to_string(),
            ));
        }

        if config.reassembly.max_flows == 0 {
            return Err(ConfigError::ValidationError(
                "reassembly.max_flows cannot be 0".to_string(),
            ));
        }

        if config.decoder.max_start_line_bytes == 0 || config.decoder.max_header_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "decoder byte budgets cannot be 0".to_string(),
            ));
        }

        if config.decoder.max_headers == 0 {
            return Err(ConfigError::ValidationError(
                "decoder.max_headers cannot be 0".to_string(),
            ));
        }

        if config.publisher.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "publisher.capacity cannot be 0".to_string(),
            ));
        }

        let valid_formats = ["text", "json"];
        if !valid_formats.contains(&config.export.stdout.format.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid stdout format: {}. Must be one of: {:?}",
                config.export.stdout.format, valid_formats
            )));
        }

        Ok(())
    }

    /// Save configuration to a file
    pub fn save(&self, config: &SensorConfig, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(config).map_err(|e| {
            ConfigError::ValidationError(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Get the default config file path for the current user
    pub fn default_config_path() -> Option<PathBuf> {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
            .map(|d| d.join("flowtap").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
