//! # Environment Configuration
//!
//! Env-driven configuration with typed defaults. All three binaries share one
//! config type; each reads only the fields it needs.

use crate::error::{Result, ValuationError};
use std::path::PathBuf;

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;
pub const DEFAULT_SYNC_WAIT_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_REQUEST_TTL_SECONDS: u64 = 86_400;
pub const DEFAULT_LIFECYCLE_BLOCK_MS: u64 = 1_000;
pub const DEFAULT_REQUEST_STREAM_BLOCK_MS: u64 = 5_000;
pub const DEFAULT_MAX_TASK_RETRIES: u32 = 3;
pub const DEFAULT_TASK_WAIT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct Config {
    /// Redis connection URL shared by all services
    pub redis_url: String,
    /// Gateway HTTP listen port
    pub http_port: u16,
    /// Whether the gateway serves HTTP at all (consumers still run when off)
    pub enable_http: bool,
    /// Maximum accepted submission payload in bytes
    pub max_payload_bytes: usize,
    /// How long a synchronous submission blocks before returning `pending`
    pub sync_wait_timeout_ms: u64,
    /// TTL applied to a request's cache and state keys on terminal transition
    pub request_ttl_seconds: u64,
    /// Block interval for lifecycle tail reads
    pub lifecycle_block_ms: u64,
    /// Block interval for ingress and dispatch consumer-group reads
    pub request_stream_block_ms: u64,
    /// Total attempts allowed per task, the first included
    pub max_task_retries: u32,
    /// Wall-clock deadline for one group's completion loop
    pub task_wait_timeout_ms: u64,
    /// External pricing command invoked by the default valuation engine
    pub pricing_command: Option<PathBuf>,
    /// Root directory file-based hydration references resolve under
    pub hydration_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            http_port: 8080,
            enable_http: true,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            sync_wait_timeout_ms: DEFAULT_SYNC_WAIT_TIMEOUT_MS,
            request_ttl_seconds: DEFAULT_REQUEST_TTL_SECONDS,
            lifecycle_block_ms: DEFAULT_LIFECYCLE_BLOCK_MS,
            request_stream_block_ms: DEFAULT_REQUEST_STREAM_BLOCK_MS,
            max_task_retries: DEFAULT_MAX_TASK_RETRIES,
            task_wait_timeout_ms: DEFAULT_TASK_WAIT_TIMEOUT_MS,
            pricing_command: None,
            hydration_root: PathBuf::from("."),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis_url = url;
        }
        if let Ok(port) = std::env::var("VALUATION_HTTP_PORT") {
            config.http_port = parse_var("VALUATION_HTTP_PORT", &port)?;
        }
        if let Ok(enabled) = std::env::var("VALUATION_ENABLE_HTTP") {
            config.enable_http = parse_bool("VALUATION_ENABLE_HTTP", &enabled)?;
        }
        if let Ok(max) = std::env::var("VALUATION_MAX_PAYLOAD_BYTES") {
            config.max_payload_bytes = parse_var("VALUATION_MAX_PAYLOAD_BYTES", &max)?;
        }
        if let Ok(ms) = std::env::var("VALUATION_SYNC_WAIT_TIMEOUT_MS") {
            config.sync_wait_timeout_ms = parse_var("VALUATION_SYNC_WAIT_TIMEOUT_MS", &ms)?;
        }
        if let Ok(secs) = std::env::var("VALUATION_REQUEST_TTL_SECONDS") {
            config.request_ttl_seconds = parse_var("VALUATION_REQUEST_TTL_SECONDS", &secs)?;
        }
        if let Ok(ms) = std::env::var("VALUATION_LIFECYCLE_BLOCK_MS") {
            config.lifecycle_block_ms = parse_var("VALUATION_LIFECYCLE_BLOCK_MS", &ms)?;
        }
        if let Ok(ms) = std::env::var("VALUATION_REQUEST_STREAM_BLOCK_MS") {
            config.request_stream_block_ms = parse_var("VALUATION_REQUEST_STREAM_BLOCK_MS", &ms)?;
        }
        if let Ok(retries) = std::env::var("VALUATION_MAX_TASK_RETRIES") {
            config.max_task_retries = parse_var("VALUATION_MAX_TASK_RETRIES", &retries)?;
        }
        if let Ok(ms) = std::env::var("VALUATION_TASK_WAIT_TIMEOUT_MS") {
            config.task_wait_timeout_ms = parse_var("VALUATION_TASK_WAIT_TIMEOUT_MS", &ms)?;
        }
        if let Ok(cmd) = std::env::var("VALUATION_PRICING_COMMAND") {
            config.pricing_command = Some(PathBuf::from(cmd));
        }
        if let Ok(root) = std::env::var("VALUATION_HYDRATION_ROOT") {
            config.hydration_root = PathBuf::from(root);
        }

        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| ValuationError::Configuration(format!("invalid {name} value {raw:?}: {e}")))
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(ValuationError::Configuration(format!(
            "invalid {name} value {other:?}: expected a boolean"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.max_payload_bytes, 1024 * 1024);
        assert_eq!(config.sync_wait_timeout_ms, 120_000);
        assert_eq!(config.request_ttl_seconds, 86_400);
        assert_eq!(config.lifecycle_block_ms, 1_000);
        assert_eq!(config.request_stream_block_ms, 5_000);
        assert_eq!(config.task_wait_timeout_ms, 10_000);
        assert!(config.enable_http);
    }

    #[test]
    fn boolean_parsing_accepts_common_forms() {
        assert!(parse_bool("X", "TRUE").unwrap());
        assert!(parse_bool("X", "1").unwrap());
        assert!(!parse_bool("X", "no").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }

    #[test]
    fn numeric_parse_errors_name_the_variable() {
        let err = parse_var::<u16>("VALUATION_HTTP_PORT", "eighty").unwrap_err();
        assert!(err.to_string().contains("VALUATION_HTTP_PORT"));
    }
}
