//! Configuration loading from environment variables.
//!
//! All values are read from `BRQ_*` environment variables with sensible
//! defaults. Invalid values fall back to defaults without crashing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `BRQ_WORKER_POOL_SIZE` | 100 | Fetch workers / availability queue capacity |
//! | `BRQ_ON_DEMAND_PRIORITY` | 100 | Priority for blocks a caller waits on |
//! | `BRQ_SHUTDOWN_TIMEOUT` | 30 | Worker pool stop timeout (secs) |
//! | `BRQ_LOG_LEVEL` | info | Log filter directive |
//! | `BRQ_LOG_FORMAT` | json | `json` or `pretty` |
//! | `BRQ_LOG_FILE` | (stderr) | Log file path |

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scheduler::Priority;
use crate::telemetry::{LogConfig, LogFormat};

pub const DEFAULT_WORKER_POOL_SIZE: usize = 100;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Queue configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    /// Number of fetch workers, and capacity of the availability queue.
    pub worker_pool_size: NonZeroUsize,
    /// Priority used for on-demand block requests.
    pub on_demand_priority: Priority,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: NonZeroUsize::new(DEFAULT_WORKER_POOL_SIZE)
                .unwrap_or(NonZeroUsize::MIN),
            on_demand_priority: Priority::ON_DEMAND,
        }
    }
}

/// Flat summary of the effective configuration.
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub worker_pool_size: usize,
    pub on_demand_priority: i32,
    pub shutdown_timeout_secs: u64,
    pub log_level: String,
    pub log_format: String,
}

/// All configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub queue: QueueConfig,
    pub shutdown_timeout: Duration,
    pub log: LogConfig,
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse an `i32` env var, returning `default` on missing or invalid.
fn parse_i32(key: &str, default: i32) -> i32 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<i32>().unwrap_or(default),
        Err(_) => default,
    }
}

fn load_queue_config() -> QueueConfig {
    let size = parse_usize("BRQ_WORKER_POOL_SIZE", DEFAULT_WORKER_POOL_SIZE);
    let priority = parse_i32("BRQ_ON_DEMAND_PRIORITY", Priority::ON_DEMAND.get());
    QueueConfig {
        // floor: one worker
        worker_pool_size: NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN),
        on_demand_priority: Priority::new(priority),
    }
}

fn load_log_config() -> LogConfig {
    let defaults = LogConfig::default();
    let level = std::env::var("BRQ_LOG_LEVEL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(defaults.level);
    let format = std::env::var("BRQ_LOG_FORMAT")
        .ok()
        .and_then(|v| v.parse::<LogFormat>().ok())
        .unwrap_or(defaults.format);
    let output_path = std::env::var_os("BRQ_LOG_FILE")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from);
    LogConfig {
        format,
        level,
        output_path,
    }
}

/// Load all configuration from environment variables.
///
/// Missing or invalid values fall back to safe defaults without panicking.
pub fn load() -> EnvConfig {
    let shutdown_secs = parse_u64("BRQ_SHUTDOWN_TIMEOUT", DEFAULT_SHUTDOWN_TIMEOUT_SECS).max(1);
    EnvConfig {
        queue: load_queue_config(),
        shutdown_timeout: Duration::from_secs(shutdown_secs),
        log: load_log_config(),
    }
}

impl EnvConfig {
    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            worker_pool_size: self.queue.worker_pool_size.get(),
            on_demand_priority: self.queue.on_demand_priority.get(),
            shutdown_timeout_secs: self.shutdown_timeout.as_secs(),
            log_level: self.log.level.clone(),
            log_format: match self.log.format {
                LogFormat::Json => "json".to_string(),
                LogFormat::Pretty => "pretty".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serialize env-mutating tests to avoid cross-test pollution.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "BRQ_WORKER_POOL_SIZE",
        "BRQ_ON_DEMAND_PRIORITY",
        "BRQ_SHUTDOWN_TIMEOUT",
        "BRQ_LOG_LEVEL",
        "BRQ_LOG_FORMAT",
        "BRQ_LOG_FILE",
    ];

    fn clear_env_vars() {
        for k in ENV_KEYS {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn test_defaults_are_sensible() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let cfg = load();
        assert_eq!(cfg.queue.worker_pool_size.get(), 100);
        assert_eq!(cfg.queue.on_demand_priority, Priority::ON_DEMAND);
        assert_eq!(cfg.shutdown_timeout.as_secs(), 30);
        assert_eq!(cfg.log.level, "info");
        assert_eq!(cfg.log.format, LogFormat::Json);
        assert!(cfg.log.output_path.is_none());
    }

    #[test]
    fn test_env_vars_override_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("BRQ_WORKER_POOL_SIZE", "8");
        std::env::set_var("BRQ_ON_DEMAND_PRIORITY", "250");
        std::env::set_var("BRQ_SHUTDOWN_TIMEOUT", "5");
        std::env::set_var("BRQ_LOG_LEVEL", "block_retrieval=debug");
        std::env::set_var("BRQ_LOG_FORMAT", "pretty");
        std::env::set_var("BRQ_LOG_FILE", "/tmp/brq.log");
        let cfg = load();
        assert_eq!(cfg.queue.worker_pool_size.get(), 8);
        assert_eq!(cfg.queue.on_demand_priority, Priority::new(250));
        assert_eq!(cfg.shutdown_timeout.as_secs(), 5);
        assert_eq!(cfg.log.level, "block_retrieval=debug");
        assert_eq!(cfg.log.format, LogFormat::Pretty);
        assert_eq!(cfg.log.output_path, Some(PathBuf::from("/tmp/brq.log")));
        clear_env_vars();
    }

    #[test]
    fn test_invalid_env_falls_back_to_default() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("BRQ_WORKER_POOL_SIZE", "lots");
        std::env::set_var("BRQ_ON_DEMAND_PRIORITY", "high");
        std::env::set_var("BRQ_LOG_FORMAT", "xml");
        let cfg = load();
        assert_eq!(cfg.queue.worker_pool_size.get(), 100);
        assert_eq!(cfg.queue.on_demand_priority, Priority::ON_DEMAND);
        assert_eq!(cfg.log.format, LogFormat::Json);
        clear_env_vars();
    }

    #[test]
    fn test_floors_apply() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("BRQ_WORKER_POOL_SIZE", "0");
        std::env::set_var("BRQ_SHUTDOWN_TIMEOUT", "0");
        let cfg = load();
        assert_eq!(cfg.queue.worker_pool_size.get(), 1, "pool size must have floor");
        assert_eq!(cfg.shutdown_timeout.as_secs(), 1, "timeout must have floor");
        clear_env_vars();
    }

    #[test]
    fn test_effective_config_contains_all_fields() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let eff = load().effective_config();
        assert_eq!(eff.worker_pool_size, 100);
        assert_eq!(eff.on_demand_priority, 100);
        assert!(eff.shutdown_timeout_secs > 0);
        assert_eq!(eff.log_level, "info");
        assert_eq!(eff.log_format, "json");
    }

    #[test]
    fn test_queue_config_deserializes_with_defaults() {
        let cfg: QueueConfig = serde_json::from_str(r#"{"workerPoolSize": 4}"#).unwrap();
        assert_eq!(cfg.worker_pool_size.get(), 4);
        assert_eq!(cfg.on_demand_priority, Priority::ON_DEMAND);

        let zero = serde_json::from_str::<QueueConfig>(r#"{"workerPoolSize": 0}"#);
        assert!(zero.is_err(), "zero workers must be rejected");
    }
}
