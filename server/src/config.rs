//! Engine configuration.
//!
//! Loaded from a TOML file. Every section is optional and falls back to the
//! protocol defaults; unknown keys are rejected.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use http2::{ConnectionOptions, Settings};
use protocol_http1::ParserConfig;
use serde::{Deserialize, Serialize};

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration loaded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub http1: Http1Config,

    #[serde(default)]
    pub http2: Http2Config,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP/1.1 parser limits.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Http1Config {
    /// Longest request-target before the request is answered with 414
    #[serde(default = "default_max_url_length", deserialize_with = "deserialize_size")]
    pub max_url_length: usize,

    /// Total header bytes before the request is answered with 431
    #[serde(
        default = "default_max_headers_length",
        deserialize_with = "deserialize_size"
    )]
    pub max_headers_length: usize,

    /// Size of each socket read (e.g., "16KB")
    #[serde(
        default = "default_read_buffer_size",
        deserialize_with = "deserialize_size"
    )]
    pub read_buffer_size: usize,

    /// Largest request body buffered before answering 413 and closing
    #[serde(
        default = "default_max_request_body_size",
        deserialize_with = "deserialize_size"
    )]
    pub max_request_body_size: usize,
}

impl Default for Http1Config {
    fn default() -> Self {
        Self {
            max_url_length: default_max_url_length(),
            max_headers_length: default_max_headers_length(),
            read_buffer_size: default_read_buffer_size(),
            max_request_body_size: default_max_request_body_size(),
        }
    }
}

/// Settings advertised to HTTP/2 clients.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Http2Config {
    #[serde(default = "default_header_table_size")]
    pub header_table_size: u32,

    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: u32,

    #[serde(default = "default_initial_window_size")]
    pub initial_window_size: u32,

    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: u32,

    #[serde(default = "default_max_header_list_size")]
    pub max_header_list_size: u32,

    /// Largest header block accepted across HEADERS and CONTINUATION frames
    #[serde(
        default = "default_max_header_block_size",
        deserialize_with = "deserialize_size"
    )]
    pub max_header_block_size: usize,

    /// Largest request body buffered per stream before answering 413
    #[serde(
        default = "default_max_request_body_size",
        deserialize_with = "deserialize_size"
    )]
    pub max_request_body_size: usize,
}

impl Default for Http2Config {
    fn default() -> Self {
        Self {
            header_table_size: default_header_table_size(),
            max_concurrent_streams: default_max_concurrent_streams(),
            initial_window_size: default_initial_window_size(),
            max_frame_size: default_max_frame_size(),
            max_header_list_size: default_max_header_list_size(),
            max_header_block_size: default_max_header_block_size(),
            max_request_body_size: default_max_request_body_size(),
        }
    }
}

/// Bounds on every blocking wait, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutsConfig {
    /// Idle read time before a connection is closed
    #[serde(default = "default_read_ms")]
    pub read_ms: u64,

    #[serde(default = "default_write_ms")]
    pub write_ms: u64,

    /// How long an HTTP/2 stream waits for send credit
    #[serde(default = "default_flow_control_ms")]
    pub flow_control_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            read_ms: default_read_ms(),
            write_ms: default_write_ms(),
            flow_control_ms: default_flow_control_ms(),
        }
    }
}

impl TimeoutsConfig {
    pub fn read(&self) -> Duration {
        Duration::from_millis(self.read_ms)
    }

    pub fn write(&self) -> Duration {
        Duration::from_millis(self.write_ms)
    }

    pub fn flow_control(&self) -> Duration {
        Duration::from_millis(self.flow_control_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level filter, overridden by RUST_LOG
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include the module path of each event
    #[serde(default = "default_true")]
    pub target: bool,

    #[serde(default)]
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
            target: true,
            thread_names: false,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

// Default value functions

fn default_max_url_length() -> usize {
    8192
}

fn default_max_headers_length() -> usize {
    8192
}

fn default_read_buffer_size() -> usize {
    16 * 1024
}

fn default_max_request_body_size() -> usize {
    1024 * 1024
}

fn default_header_table_size() -> u32 {
    http2::DEFAULT_HEADER_TABLE_SIZE
}

fn default_max_concurrent_streams() -> u32 {
    http2::DEFAULT_MAX_CONCURRENT_STREAMS
}

fn default_initial_window_size() -> u32 {
    http2::DEFAULT_INITIAL_WINDOW_SIZE
}

fn default_max_frame_size() -> u32 {
    http2::DEFAULT_MAX_FRAME_SIZE
}

fn default_max_header_list_size() -> u32 {
    8192
}

fn default_max_header_block_size() -> usize {
    http2::frame::DEFAULT_MAX_HEADER_BLOCK_SIZE
}

fn default_read_ms() -> u64 {
    30_000
}

fn default_write_ms() -> u64 {
    30_000
}

fn default_flow_control_ms() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Deserialize a size string like "8KB" or a plain number into bytes.
fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Number(usize),
        String(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Number(n) => Ok(n),
        SizeValue::String(s) => parse_size(&s).map_err(D::Error::custom),
    }
}

/// Parse a size string like "8KB", "1MB" into bytes.
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_alphabetic()) {
        Some(idx) => (&s[..idx], s[idx..].to_uppercase()),
        None => (s, String::new()),
    };

    let num: usize = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid number: {}", num_str))?;

    let multiplier: usize = match suffix.as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1024,
        "M" | "MB" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GIB" => 1024 * 1024 * 1024,
        _ => return Err(format!("unknown size suffix: {}", suffix)),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| "size overflow".to_string())
}

impl FromStr for Config {
    type Err = ConfigError;

    /// Parse and validate TOML text.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        contents.parse()
    }

    /// The default configuration rendered as TOML.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http1.max_url_length == 0 {
            return Err(ConfigError::Invalid("http1.max_url_length must be > 0".into()));
        }
        if self.http1.max_headers_length == 0 {
            return Err(ConfigError::Invalid(
                "http1.max_headers_length must be > 0".into(),
            ));
        }
        if self.http1.read_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "http1.read_buffer_size must be > 0".into(),
            ));
        }
        if self.http1.max_request_body_size == 0 || self.http2.max_request_body_size == 0 {
            return Err(ConfigError::Invalid(
                "max_request_body_size must be > 0".into(),
            ));
        }

        self.http2_settings().validate().map_err(|e| {
            ConfigError::Invalid(format!("http2: {}", e))
        })?;
        if self.http2.max_header_block_size < self.http2.max_frame_size as usize {
            return Err(ConfigError::Invalid(format!(
                "http2.max_header_block_size ({}) must be at least max_frame_size ({})",
                self.http2.max_header_block_size, self.http2.max_frame_size
            )));
        }

        if self.timeouts.read_ms == 0
            || self.timeouts.write_ms == 0
            || self.timeouts.flow_control_ms == 0
        {
            return Err(ConfigError::Invalid("timeouts must be > 0".into()));
        }

        Ok(())
    }

    /// Limits for the HTTP/1.1 parser.
    pub fn parser_config(&self) -> ParserConfig {
        ParserConfig {
            max_headers_length: self.http1.max_headers_length,
            max_url_length: self.http1.max_url_length,
        }
    }

    /// Settings advertised to HTTP/2 clients.
    pub fn http2_settings(&self) -> Settings {
        Settings::server()
            .header_table_size(self.http2.header_table_size)
            .max_concurrent_streams(self.http2.max_concurrent_streams)
            .initial_window_size(self.http2.initial_window_size)
            .max_frame_size(self.http2.max_frame_size)
            .max_header_list_size(self.http2.max_header_list_size)
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            flow_control_timeout: self.timeouts.flow_control(),
            write_timeout: self.timeouts.write(),
            max_header_block_size: self.http2.max_header_block_size,
        }
    }
}
