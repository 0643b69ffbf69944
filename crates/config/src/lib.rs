//! Process configuration, loaded from the environment once at startup.
//!
//! Every knob has a default except the store credentials; `--mode=` on the
//! command line overrides the `MODE` variable.

use std::time::Duration;

use roomscribe_db::WorkerMode;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Postgres URL of the coordination store.
    pub store_url: String,
    /// Privileged credential for the store's realtime change-stream service.
    pub store_service_key: String,
    /// Dedicated connection string for LISTEN/NOTIFY. Absent disables the
    /// notify discovery path.
    pub store_direct_url: Option<String>,
    /// Websocket URL of the store's realtime change-stream endpoint.
    /// Absent disables the realtime discovery path.
    pub store_realtime_url: Option<String>,
    pub mode: WorkerMode,
    pub worker_id: Uuid,
    pub polling_interval: Duration,
    pub heartbeat_interval: Duration,
    pub realtime_timeout: Duration,
    pub realtime_retry_interval: Duration,
    pub claim_cache_duration: Duration,
    pub enable_polling_fallback: bool,
    pub enable_database_notify: bool,
    pub log_level: String,
    /// Bind `0.0.0.0:port` and serve `GET /health` when set.
    pub health_port: Option<u16>,
}

impl WorkerConfig {
    /// Reads the full configuration from the process environment, applying
    /// `--mode=<mode>` from `args` over the `MODE` variable.
    pub fn from_env(args: &[String]) -> Result<Self, ConfigError> {
        let store_url = require("STORE_URL")?;
        let store_service_key = require("STORE_SERVICE_KEY")?;

        let mode_arg = args
            .iter()
            .find_map(|a| a.strip_prefix("--mode=").map(str::to_string));
        let mode_raw = mode_arg
            .or_else(|| optional("MODE"))
            .unwrap_or_else(|| "transcription".to_string());
        let mode = mode_raw.parse().map_err(|message| ConfigError::Invalid {
            key: "MODE",
            message,
        })?;

        let worker_id = match optional("WORKER_ID") {
            Some(raw) => Uuid::parse_str(&raw).map_err(|e| ConfigError::Invalid {
                key: "WORKER_ID",
                message: e.to_string(),
            })?,
            None => Uuid::new_v4(),
        };

        let health_port = match optional("PORT") {
            Some(raw) => Some(raw.parse::<u16>().map_err(|e| ConfigError::Invalid {
                key: "PORT",
                message: e.to_string(),
            })?),
            None => None,
        };

        Ok(Self {
            store_url,
            store_service_key,
            store_direct_url: optional("STORE_DIRECT_URL"),
            store_realtime_url: optional("STORE_REALTIME_URL"),
            mode,
            worker_id,
            polling_interval: millis("POLLING_INTERVAL_MS", 5_000)?,
            heartbeat_interval: millis("HEARTBEAT_INTERVAL_MS", 15_000)?,
            realtime_timeout: millis("REALTIME_TIMEOUT_MS", 30_000)?,
            realtime_retry_interval: millis("REALTIME_RETRY_INTERVAL_MS", 120_000)?,
            claim_cache_duration: millis("ROOM_CLAIM_CACHE_DURATION_MS", 30_000)?,
            enable_polling_fallback: flag("ENABLE_POLLING_FALLBACK", true)?,
            enable_database_notify: flag("ENABLE_DATABASE_NOTIFY", true)?,
            log_level: optional("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            health_port,
        })
    }
}

fn require(key: &'static str) -> Result<String, ConfigError> {
    optional(key).ok_or(ConfigError::Missing(key))
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn millis(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    match optional(key) {
        Some(raw) => raw
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| ConfigError::Invalid {
                key,
                message: e.to_string(),
            }),
        None => Ok(Duration::from_millis(default)),
    }
}

fn flag(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match optional(key).as_deref() {
        None => Ok(default),
        Some("true") | Some("1") => Ok(true),
        Some("false") | Some("0") => Ok(false),
        Some(other) => Err(ConfigError::Invalid {
            key,
            message: format!("expected true/false, got '{other}'"),
        }),
    }
}
