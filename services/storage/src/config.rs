use serde::Deserialize;

/// Main configuration for the storage service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Redis configuration
    #[serde(default)]
    pub redis: RedisConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Controller directory configuration
    #[serde(default)]
    pub directory: DirectoryConfig,
    /// Operational log configuration
    #[serde(default)]
    pub oplog: OpLogConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Redis connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,
}

/// API configuration for the query endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Controller directory configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    /// Base of the dashboard URL handed out per controller
    #[serde(default = "default_view_url_base")]
    pub view_url_base: String,
}

/// Operational log configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OpLogConfig {
    /// Number of most recent payloads kept
    #[serde(default = "default_oplog_capacity")]
    pub capacity: usize,
}

// Default value functions
fn default_service_name() -> String {
    "osp-storage".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8084
}

fn default_true() -> bool {
    true
}

fn default_view_url_base() -> String {
    "http://ardusensor.com/index.html".to_string()
}

pub fn default_oplog_capacity() -> usize {
    1001
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/storage").required(false))
            .add_source(config::File::with_name("/etc/osp/storage").required(false))
            // Override with environment variables
            // STORAGE__REDIS__URL -> redis.url
            .add_source(
                config::Environment::with_prefix("STORAGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            view_url_base: default_view_url_base(),
        }
    }
}

impl Default for OpLogConfig {
    fn default() -> Self {
        Self {
            capacity: default_oplog_capacity(),
        }
    }
}
