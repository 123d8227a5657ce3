//! Runtime configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::retry::BackoffPolicy;

/// Embedded store engine. Only SQLite ships today; the enum keeps the
/// backend a configuration axis rather than a hardcoded assumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    #[default]
    Sqlite,
}

impl StoreBackend {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "sqlite" => Ok(StoreBackend::Sqlite),
            other => Err(ConfigError(format!(
                "unsupported store backend '{other}' (expected 'sqlite')"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Sqlite => "sqlite",
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Embedded store engine.
    pub store_backend: StoreBackend,

    /// Path of the store database file.
    pub store_path: PathBuf,

    /// Number of concurrent worker loops per pool.
    pub worker_count: usize,

    /// Sleep between polls when the task queue is empty.
    pub poll_interval: Duration,

    /// Retry count for activities that do not declare their own.
    pub activity_retry_count: u32,

    /// Wall-clock timeout for activities that do not declare their own.
    pub activity_timeout: Duration,

    /// Base delay of the exponential retry backoff.
    pub activity_backoff_base: Duration,

    /// Upper bound on the retry backoff delay.
    pub activity_backoff_cap: Duration,

    /// How long a task may sit in RUNNING before an idle worker assumes
    /// its claimer died and releases it.
    pub stale_task_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_backend: StoreBackend::Sqlite,
            store_path: PathBuf::from(".loom/loom.db"),
            worker_count: 4,
            poll_interval: Duration::from_millis(500),
            activity_retry_count: 3,
            activity_timeout: Duration::from_secs(30),
            activity_backoff_base: Duration::from_millis(1000),
            activity_backoff_cap: Duration::from_millis(300_000),
            stale_task_timeout: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// defaults above for anything unset or unparsable. Only the store
    /// backend is validated strictly.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Config::default();

        let store_backend = match std::env::var("LOOM_STORE_BACKEND") {
            Ok(value) => StoreBackend::parse(&value)?,
            Err(_) => defaults.store_backend,
        };

        let store_path = std::env::var("LOOM_STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.store_path);

        let worker_count = env_parse("LOOM_WORKER_COUNT").unwrap_or(defaults.worker_count);

        let poll_interval = env_parse("LOOM_POLL_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);

        let activity_retry_count =
            env_parse("LOOM_ACTIVITY_RETRY_COUNT").unwrap_or(defaults.activity_retry_count);

        let activity_timeout = env_parse("LOOM_ACTIVITY_TIMEOUT_SECONDS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.activity_timeout);

        let activity_backoff_base = env_parse("LOOM_ACTIVITY_BACKOFF_BASE_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.activity_backoff_base);

        let activity_backoff_cap = env_parse("LOOM_ACTIVITY_BACKOFF_CAP_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.activity_backoff_cap);

        let stale_task_timeout = env_parse("LOOM_STALE_TASK_TIMEOUT_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.stale_task_timeout);

        // An activity attempt must finish (or time out) before its task
        // can be mistaken for stale; otherwise a second worker could claim
        // work that is still running.
        if activity_timeout >= stale_task_timeout {
            return Err(ConfigError(format!(
                "activity timeout ({}ms) must be less than the stale task timeout ({}ms)",
                activity_timeout.as_millis(),
                stale_task_timeout.as_millis()
            )));
        }

        Ok(Config {
            store_backend,
            store_path,
            worker_count,
            poll_interval,
            activity_retry_count,
            activity_timeout,
            activity_backoff_base,
            activity_backoff_cap,
            stale_task_timeout,
        })
    }

    /// Backoff policy for activity and task retries.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.activity_backoff_base, self.activity_backoff_cap)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_surface() {
        let config = Config::default();
        assert_eq!(config.store_backend, StoreBackend::Sqlite);
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.activity_retry_count, 3);
        assert_eq!(config.activity_timeout, Duration::from_secs(30));
        assert_eq!(config.activity_backoff_base, Duration::from_millis(1000));
        assert_eq!(config.activity_backoff_cap, Duration::from_millis(300_000));
        assert_eq!(config.stale_task_timeout, Duration::from_secs(300));
    }

    #[test]
    fn backend_parse_rejects_unknown_engines() {
        assert!(StoreBackend::parse("sqlite").is_ok());
        assert!(StoreBackend::parse("duckdb").is_err());
        assert!(StoreBackend::parse("").is_err());
    }

    #[test]
    #[serial_test::serial]
    fn from_env_overrides_defaults() {
        unsafe {
            std::env::set_var("LOOM_WORKER_COUNT", "2");
            std::env::set_var("LOOM_POLL_INTERVAL_MS", "50");
            std::env::set_var("LOOM_ACTIVITY_RETRY_COUNT", "7");
        }
        let config = Config::from_env().unwrap();
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.activity_retry_count, 7);
        unsafe {
            std::env::remove_var("LOOM_WORKER_COUNT");
            std::env::remove_var("LOOM_POLL_INTERVAL_MS");
            std::env::remove_var("LOOM_ACTIVITY_RETRY_COUNT");
        }
    }

    #[test]
    #[serial_test::serial]
    fn from_env_rejects_activity_timeout_at_or_above_stale_timeout() {
        unsafe {
            std::env::set_var("LOOM_ACTIVITY_TIMEOUT_SECONDS", "400");
        }
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("stale task timeout"));

        unsafe {
            std::env::set_var("LOOM_STALE_TASK_TIMEOUT_MS", "500000");
        }
        assert!(Config::from_env().is_ok());
        unsafe {
            std::env::remove_var("LOOM_ACTIVITY_TIMEOUT_SECONDS");
            std::env::remove_var("LOOM_STALE_TASK_TIMEOUT_MS");
        }
    }

    #[test]
    #[serial_test::serial]
    fn from_env_rejects_unknown_backend() {
        unsafe {
            std::env::set_var("LOOM_STORE_BACKEND", "duckdb");
        }
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("duckdb"));
        unsafe {
            std::env::remove_var("LOOM_STORE_BACKEND");
        }
    }
}
