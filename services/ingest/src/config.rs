//! Configuration management for the telemetry ingest service.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the ingest service.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct IngestConfig {
    /// Serial stream configuration
    #[serde(default)]
    pub serial: SerialConfig,

    /// Document store configuration
    #[serde(default)]
    pub sink: SinkConfig,

    /// Batch accumulation configuration
    #[serde(default)]
    pub batching: BatchingConfig,

    /// Line parsing configuration
    #[serde(default)]
    pub parser: ParserConfig,

    /// Flush retry configuration
    #[serde(default)]
    pub retry: RetryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Service-level configuration
    #[serde(default)]
    pub service: ServiceConfig,
}

/// Serial stream connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    /// Device path (e.g., "/dev/serial0", "/dev/ttyACM0")
    #[serde(default = "default_serial_path")]
    pub path: String,

    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Poll timeout for a single read in milliseconds (at most 1000)
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Longest line accepted before the partial frame is dropped
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

/// MongoDB sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    /// Connection string, may embed credentials
    #[serde(default = "default_sink_uri")]
    pub uri: String,

    /// Database name
    #[serde(default = "default_database")]
    pub database: String,

    /// Collection name
    #[serde(default = "default_collection")]
    pub collection: String,

    /// Server selection / connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Timeout for one bulk insert in seconds
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    /// Directory for batches that could not be written to the sink
    #[serde(default)]
    pub fallback_dir: Option<PathBuf>,
}

/// Batch accumulation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchingConfig {
    /// Records per batch before a size-triggered flush
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Maximum age of the oldest buffered record before a time-triggered flush
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Batches queued for the flush worker before ingest waits
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// How long shutdown waits for pending flushes in seconds
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

/// Line parsing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ParserConfig {
    /// Number of integer fields per line
    #[serde(default = "default_expected_arity")]
    pub expected_arity: usize,

    /// Regular expression with one capture group per field.
    /// Optional for arity 1 and 3, which have built-in templates.
    #[serde(default)]
    pub line_pattern: Option<String>,
}

/// Flush retry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Write attempts per batch, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial backoff delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum backoff delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Batches in a row that may exhaust their retries before the service gives up
    /// (0 = never give up)
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failed_batches: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Interval between statistics log lines in seconds (0 = only at shutdown)
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

/// Service-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServiceConfig {
    /// Port for the Prometheus exporter (disabled when unset)
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

// Default value functions
fn default_serial_path() -> String {
    "/dev/serial0".to_string()
}
fn default_baud_rate() -> u32 {
    115_200
}
fn default_read_timeout_ms() -> u64 {
    1000
}
fn default_max_line_bytes() -> usize {
    4096
}
fn default_sink_uri() -> String {
    "mongodb://localhost:27017".to_string()
}
fn default_database() -> String {
    "stm32_data".to_string()
}
fn default_collection() -> String {
    "random_numbers".to_string()
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_write_timeout() -> u64 {
    15
}
fn default_max_batch_size() -> usize {
    1000
}
fn default_flush_interval() -> u64 {
    30
}
fn default_channel_capacity() -> usize {
    4
}
fn default_drain_timeout() -> u64 {
    30
}
fn default_expected_arity() -> usize {
    3
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    10_000
}
fn default_max_consecutive_failures() -> u32 {
    3
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_stats_interval() -> u64 {
    60
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: default_serial_path(),
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout_ms(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            uri: default_sink_uri(),
            database: default_database(),
            collection: default_collection(),
            connect_timeout_secs: default_connect_timeout(),
            write_timeout_secs: default_write_timeout(),
            fallback_dir: None,
        }
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            flush_interval_secs: default_flush_interval(),
            channel_capacity: default_channel_capacity(),
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            expected_arity: default_expected_arity(),
            line_pattern: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_consecutive_failed_batches: default_max_consecutive_failures(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

impl IngestConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with INGEST_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Override with environment variables (e.g., INGEST_SERIAL__PATH)
            .add_source(environment())
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder().add_source(environment()).build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.serial.path.is_empty() {
            return Err(ConfigValidationError::MissingField("serial.path".to_string()));
        }
        if self.serial.baud_rate == 0 {
            return Err(invalid("serial.baud_rate", "Baud rate must be greater than 0"));
        }
        if !(1..=1000).contains(&self.serial.read_timeout_ms) {
            return Err(invalid(
                "serial.read_timeout_ms",
                "Read timeout must be between 1 and 1000 ms",
            ));
        }
        if self.serial.max_line_bytes == 0 {
            return Err(invalid("serial.max_line_bytes", "Must be greater than 0"));
        }

        if self.sink.uri.is_empty() {
            return Err(ConfigValidationError::MissingField("sink.uri".to_string()));
        }
        if !self.sink.uri.starts_with("mongodb://") && !self.sink.uri.starts_with("mongodb+srv://")
        {
            return Err(invalid(
                "sink.uri",
                "URI must start with mongodb:// or mongodb+srv://",
            ));
        }
        if self.sink.database.is_empty() {
            return Err(ConfigValidationError::MissingField("sink.database".to_string()));
        }
        if self.sink.collection.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "sink.collection".to_string(),
            ));
        }
        if self.sink.write_timeout_secs == 0 {
            return Err(invalid("sink.write_timeout_secs", "Must be greater than 0"));
        }

        if self.batching.max_batch_size == 0 {
            return Err(invalid("batching.max_batch_size", "Must be greater than 0"));
        }
        if self.batching.flush_interval_secs == 0 {
            return Err(invalid("batching.flush_interval_secs", "Must be greater than 0"));
        }
        if self.batching.channel_capacity == 0 {
            return Err(invalid("batching.channel_capacity", "Must be greater than 0"));
        }

        if self.parser.expected_arity == 0 {
            return Err(invalid("parser.expected_arity", "Arity must be at least 1"));
        }

        if self.retry.max_attempts == 0 {
            return Err(invalid(
                "retry.max_attempts",
                "At least one write attempt is required",
            ));
        }

        match self.logging.format.as_str() {
            "json" | "pretty" => {}
            other => {
                return Err(invalid(
                    "logging.format",
                    &format!("Unknown format '{}', expected json or pretty", other),
                ))
            }
        }

        Ok(())
    }
}

/// `INGEST_<SECTION>__<KEY>`: one underscore after the prefix, two between
/// nested keys.
fn environment() -> Environment {
    Environment::with_prefix("INGEST")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

fn invalid(field: &str, message: &str) -> ConfigValidationError {
    ConfigValidationError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

impl SerialConfig {
    /// Get the read poll timeout as Duration.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl SinkConfig {
    /// Get connect timeout as Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get write timeout as Duration.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

impl BatchingConfig {
    /// Get flush interval as Duration.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    /// Get drain timeout as Duration.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl RetryConfig {
    /// Get base retry delay as Duration.
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Get maximum retry delay as Duration.
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = IngestConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.serial.path, "/dev/serial0");
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.batching.max_batch_size, 1000);
        assert_eq!(config.parser.expected_arity, 3);
    }

    #[test]
    fn test_missing_serial_path() {
        let mut config = IngestConfig::default();
        config.serial.path = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_read_timeout_capped_at_one_second() {
        let mut config = IngestConfig::default();
        config.serial.read_timeout_ms = 1500;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));

        config.serial.read_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_sink_uri() {
        let mut config = IngestConfig::default();
        config.sink.uri = "postgres://localhost/db".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));

        config.sink.uri = "mongodb+srv://cluster.example.net".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_batch_size() {
        let mut config = IngestConfig::default();
        config.batching.max_batch_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_zero_arity() {
        let mut config = IngestConfig::default();
        config.parser.expected_arity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_log_format() {
        let mut config = IngestConfig::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    fn from_vars(vars: &[(&str, &str)]) -> IngestConfig {
        let vars: config::Map<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Config::builder()
            .add_source(environment().source(Some(vars)))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_env_overrides_use_single_underscore_after_prefix() {
        let config = from_vars(&[
            ("INGEST_SINK__URI", "mongodb://db.internal:27017"),
            ("INGEST_SERIAL__PATH", "/dev/ttyACM0"),
            ("INGEST_SERIAL__BAUD_RATE", "9600"),
            ("INGEST_BATCHING__MAX_BATCH_SIZE", "250"),
        ]);

        assert_eq!(config.sink.uri, "mongodb://db.internal:27017");
        assert_eq!(config.serial.path, "/dev/ttyACM0");
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.batching.max_batch_size, 250);
        assert_eq!(config.sink.database, "stm32_data");
    }

    #[test]
    fn test_env_ignores_unrelated_variables() {
        let config = from_vars(&[("OTHER_SINK__URI", "mongodb://elsewhere:27017")]);
        assert_eq!(config.sink.uri, "mongodb://localhost:27017");
    }

    #[test]
    fn test_deserialize_partial_toml() {
        let raw = r#"
            [serial]
            path = "/dev/ttyACM0"

            [parser]
            expected_arity = 1

            [sink]
            fallback_dir = "/var/lib/telemetry-ingest/fallback"
        "#;

        let config: IngestConfig = Config::builder()
            .add_source(File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.serial.path, "/dev/ttyACM0");
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.parser.expected_arity, 1);
        assert_eq!(
            config.sink.fallback_dir,
            Some(PathBuf::from("/var/lib/telemetry-ingest/fallback"))
        );
        assert_eq!(config.batching.flush_interval(), Duration::from_secs(30));
    }
}
