//! Configuration management for the TCP ingest service.
//!
//! Settings are layered from optional config files and `INGEST__*`
//! environment variables, every field falling back to a default.

use config::{Config, ConfigError, Environment, File};
use osp_storage::codec::RecordZone;
use osp_storage::config::{OpLogConfig, RedisConfig};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the ingest service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestConfig {
    /// Logging and metrics configuration
    #[serde(default)]
    pub service: ServiceConfig,

    /// Redis connection configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Startup connection retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// TCP listener configuration
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Sensor to controller association configuration
    #[serde(default)]
    pub association: AssociationConfig,

    /// Record decoding configuration
    #[serde(default)]
    pub decode: DecodeConfig,

    /// Operational log configuration
    #[serde(default)]
    pub oplog: OpLogConfig,
}

/// Service-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Port for the Prometheus exporter
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Redis connection retry policy applied at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of connection attempts (0 = infinite)
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,

    /// Base delay between attempts in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum delay between attempts in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// TCP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Listen address
    #[serde(default = "default_listener_host")]
    pub host: String,

    /// Listen port
    #[serde(default = "default_listener_port")]
    pub port: u16,

    /// Size of each socket read
    #[serde(default = "default_read_buffer_bytes")]
    pub read_buffer_bytes: usize,

    /// Largest payload accepted from one connection
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

/// Sensor to controller association configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AssociationConfig {
    /// Controller assumed for a sensor with no hint and no stored association
    #[serde(default = "default_controller_id")]
    pub default_controller_id: String,
}

/// Record decoding configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DecodeConfig {
    /// Fixed UTC offset for record timestamps. Local time when unset.
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_max_connect_attempts() -> u32 {
    10
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    10000
}
fn default_listener_host() -> String {
    "0.0.0.0".to_string()
}
fn default_listener_port() -> u16 {
    8090
}
fn default_read_buffer_bytes() -> usize {
    256
}
fn default_max_payload_bytes() -> usize {
    1024 * 1024
}
fn default_controller_id() -> String {
    "1".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_connect_attempts: default_max_connect_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: default_listener_host(),
            port: default_listener_port(),
            read_buffer_bytes: default_read_buffer_bytes(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

impl Default for AssociationConfig {
    fn default() -> Self {
        Self {
            default_controller_id: default_controller_id(),
        }
    }
}

impl IngestConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Later sources override earlier ones:
    /// 1. `config/ingest`
    /// 2. `/etc/osp/ingest`
    /// 3. Environment variables (e.g. `INGEST__LISTENER__PORT`)
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/ingest").required(false))
            .add_source(File::with_name("/etc/osp/ingest").required(false))
            .add_source(
                Environment::with_prefix("INGEST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.redis.url.is_empty() {
            return Err(ConfigValidationError::MissingField("redis.url".to_string()));
        }

        if self.listener.read_buffer_bytes == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "listener.read_buffer_bytes".to_string(),
                message: "Read buffer must be greater than 0".to_string(),
            });
        }

        if self.listener.max_payload_bytes < self.listener.read_buffer_bytes {
            return Err(ConfigValidationError::InvalidValue {
                field: "listener.max_payload_bytes".to_string(),
                message: "Payload limit must be at least one read buffer".to_string(),
            });
        }

        if self.association.default_controller_id.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "association.default_controller_id".to_string(),
            ));
        }

        self.decode.record_zone()?;

        Ok(())
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

impl DecodeConfig {
    /// Time zone record timestamps are interpreted in.
    pub fn record_zone(&self) -> Result<RecordZone, ConfigValidationError> {
        match self.utc_offset_minutes {
            None => Ok(RecordZone::Local),
            Some(minutes) => RecordZone::from_offset_minutes(minutes).ok_or_else(|| {
                ConfigValidationError::InvalidValue {
                    field: "decode.utc_offset_minutes".to_string(),
                    message: format!("{minutes} is not a valid UTC offset"),
                }
            }),
        }
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
