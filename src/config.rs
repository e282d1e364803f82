//! Configuration management for the gateway.
//!
//! All settings come from environment variables:
//! - `HOST` - Optional. Bind address. Defaults to `0.0.0.0`.
//! - `PORT` - Optional. Bind port. Defaults to `8080`.
//! - `DATA_DIR` - Optional. Persistence root. Defaults to `~/.qwen`.
//! - `DEFAULT_MODEL` - Optional. Model used when a request omits one. Defaults to `qwen3-coder-plus`.
//! - `STREAM` - Optional. Set to `0` or `false` to force buffered responses globally.
//! - `DEBUG_LOG` - Optional. Raises the default log level to debug.
//! - `LOG_FILE_LIMIT` - Optional. Audit log size cap in bytes. Defaults to 10 MiB.
//! - `API_KEY` - Optional. Comma-separated bootstrap keys imported with full access.
//! - `REQUEST_LOG` - Optional. Enables the per-request JSONL stats file.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address
    pub host: String,

    /// Server bind port
    pub port: u16,

    /// Root directory for all persisted state (credentials, keys, counters, stats)
    pub data_dir: PathBuf,

    /// Model substituted when an inbound request carries none
    pub default_model: String,

    /// Whether streaming responses are allowed at all
    pub streaming_enabled: bool,

    /// Whether debug logging was requested
    pub debug_log: bool,

    /// Audit log size cap in bytes
    pub log_file_limit: u64,

    /// Raw bootstrap API keys (imported at startup, hashed like any other key)
    pub bootstrap_keys: Vec<String>,

    /// Whether the per-request JSONL stats file is written
    pub request_log: bool,

    /// Upstream deadline for buffered chat completions
    pub chat_timeout: Duration,

    /// Upstream deadline for web search
    pub search_timeout: Duration,

    /// How long in-flight requests get to finish on SIGINT/SIGTERM
    pub shutdown_grace: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|e| ConfigError::InvalidValue("PORT".to_string(), format!("{}", e)))?;

        let data_dir = std::env::var("DATA_DIR").map(PathBuf::from).unwrap_or_else(|_| {
            std::env::var("HOME")
                .map(|home| PathBuf::from(home).join(".qwen"))
                .unwrap_or_else(|_| PathBuf::from(".qwen"))
        });

        let default_model =
            std::env::var("DEFAULT_MODEL").unwrap_or_else(|_| "qwen3-coder-plus".to_string());

        let streaming_enabled = match std::env::var("STREAM") {
            Ok(v) => !matches!(v.trim(), "0" | "false" | "off"),
            Err(_) => true,
        };

        let debug_log = env_flag("DEBUG_LOG");

        let log_file_limit = std::env::var("LOG_FILE_LIMIT")
            .unwrap_or_else(|_| (10 * 1024 * 1024).to_string())
            .parse()
            .map_err(|e| {
                ConfigError::InvalidValue("LOG_FILE_LIMIT".to_string(), format!("{}", e))
            })?;

        let bootstrap_keys = std::env::var("API_KEY")
            .map(|v| {
                v.split(',')
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let request_log = env_flag("REQUEST_LOG");

        Ok(Self {
            host,
            port,
            data_dir,
            default_model,
            streaming_enabled,
            debug_log,
            log_file_limit,
            bootstrap_keys,
            request_log,
            chat_timeout: Duration::from_secs(60),
            search_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
        })
    }

    /// Create a config rooted at a specific data directory (useful for testing).
    pub fn for_data_dir(data_dir: PathBuf) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            data_dir,
            default_model: "qwen3-coder-plus".to_string(),
            streaming_enabled: true,
            debug_log: false,
            log_file_limit: 10 * 1024 * 1024,
            bootstrap_keys: Vec::new(),
            request_log: false,
            chat_timeout: Duration::from_secs(60),
            search_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim(), "1" | "true" | "on"))
        .unwrap_or(false)
}
