//! Cluster configuration module
//!
//! Handles loading configuration from environment variables.

use crate::cluster::ClusterOptions;
use crate::collab::rest::DEFAULT_API_BASE;
use crate::error::ClusterError;
use crate::protocol::ConnectionProperties;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Process configuration
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Discord bot token
    pub discord_token: String,

    /// Overrides the recommended shard count from the bootstrap endpoint
    pub total_shards: Option<u32>,

    /// First shard this cluster runs (inclusive)
    pub shard_start: u32,

    /// End of this cluster's shard range (exclusive); defaults to total_shards
    pub shard_end: Option<u32>,

    pub shards_per_worker: u32,

    /// Defaults to the number of shard groups
    pub worker_count: Option<u32>,

    /// Command line launched once per worker
    pub worker_command: String,

    pub compress: bool,

    pub properties: ConnectionProperties,

    pub admission_interval_ms: u64,

    pub request_timeout_ms: u64,

    /// Respawn workers whose process exits
    pub respawn_workers: bool,

    pub respawn_backoff_ms: u64,

    /// Consecutive quick exits before a worker is given up on
    pub respawn_limit: u32,

    /// REST base URL for relayed API calls
    pub api_base_url: String,

    /// NATS server URL(s) - comma-separated for multiple servers
    pub nats_url: Option<String>,

    /// Health/metrics HTTP port
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Log every worker message
    pub debug: bool,
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ClusterError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ClusterError::Config(format!("{name} must be valid: {e}"))),
        Err(_) => Ok(default),
    }
}

fn parse_optional<T>(name: &str) -> Result<Option<T>, ClusterError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env::var(name)
        .ok()
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| ClusterError::Config(format!("{name} must be valid: {e}")))
        })
        .transpose()
}

fn parse_flag(name: &str, default: bool) -> Result<bool, ClusterError> {
    match env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ClusterError::Config(format!("{name} must be a boolean, got {other:?}"))),
        },
        Err(_) => Ok(default),
    }
}

impl ClusterConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ClusterError> {
        dotenvy::dotenv().ok();

        let discord_token = env::var("DISCORD_TOKEN")
            .or_else(|_| env::var("DISCORD_BOT_TOKEN"))
            .map_err(|_| ClusterError::Config("DISCORD_TOKEN or DISCORD_BOT_TOKEN must be set".to_string()))?;

        let worker_command = env::var("WORKER_COMMAND")
            .map_err(|_| ClusterError::Config("WORKER_COMMAND must be set".to_string()))?;

        let defaults = ConnectionProperties::default();
        let properties = ConnectionProperties {
            os: env::var("CONNECTION_OS").unwrap_or(defaults.os),
            browser: env::var("CONNECTION_BROWSER").unwrap_or(defaults.browser),
            device: env::var("CONNECTION_DEVICE").unwrap_or(defaults.device),
        };

        Ok(Self {
            discord_token,
            total_shards: parse_optional("TOTAL_SHARDS")?,
            shard_start: parse_var("SHARD_START", 0)?,
            shard_end: parse_optional("SHARD_END")?,
            shards_per_worker: parse_var("SHARDS_PER_WORKER", 25)?,
            worker_count: parse_optional("WORKER_COUNT")?,
            worker_command,
            compress: parse_flag("COMPRESS", false)?,
            properties,
            admission_interval_ms: parse_var("ADMISSION_INTERVAL_MS", 5500)?,
            request_timeout_ms: parse_var("REQUEST_TIMEOUT_MS", 60_000)?,
            respawn_workers: parse_flag("RESPAWN_WORKERS", true)?,
            respawn_backoff_ms: parse_var("RESPAWN_BACKOFF_MS", 1000)?,
            respawn_limit: parse_var("RESPAWN_LIMIT", 5)?,
            api_base_url: env::var("API_BASE_URL").unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
            nats_url: env::var("NATS_URL").ok(),
            http_port: parse_var("HTTP_PORT", 9090)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            debug: parse_flag("CLUSTER_DEBUG", false)?,
        })
    }

    /// Orchestrator options derived from this configuration
    pub fn to_options(&self) -> ClusterOptions {
        ClusterOptions {
            total_shards: self.total_shards,
            shard_start: self.shard_start,
            shard_end: self.shard_end,
            shards_per_worker: self.shards_per_worker,
            worker_count: self.worker_count,
            compress: self.compress,
            properties: self.properties.clone(),
            admission_interval: Duration::from_millis(self.admission_interval_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            respawn: self.respawn_workers,
            respawn_backoff: Duration::from_millis(self.respawn_backoff_ms),
            respawn_limit: self.respawn_limit,
            debug: self.debug,
        }
    }
}
