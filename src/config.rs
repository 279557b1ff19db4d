//! Configuration module for the plant telemetry node.
//!
//! This module provides environment-based configuration for the acquisition
//! and delivery loop: endpoint, polling cadence, reconnect bound and cache
//! limits.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

use crate::storage::{get_string, KeyValueStore, KEY_POLLING_INTERVAL};

/// Default API URL of the telemetry ingestion backend
const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Path prefix under which each device publishes, followed by its UUID
pub const PUBLISH_TOPIC_PREFIX: &str = "/devices/plants/";

/// Default polling interval in milliseconds
const DEFAULT_POLLING_INTERVAL_MS: u64 = 60_000;

/// Shortest polling interval accepted, to protect the battery
const MIN_POLLING_INTERVAL_MS: u64 = 1_000;

/// Longest polling interval accepted, to keep telemetry reasonably fresh
const MAX_POLLING_INTERVAL_MS: u64 = 3_600_000;

/// Default number of reconnect attempts before yielding to the next tick
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Default maximum number of cached snapshots
const DEFAULT_CACHE_MAX_ENTRIES: usize = 500;

/// Upper limit for the cached snapshot count
const MAX_CACHE_ENTRIES: usize = 100_000;

/// Default byte budget of the local cache
const DEFAULT_CACHE_MAX_BYTES: usize = 256 * 1024;

/// Smallest accepted cache byte budget
const MIN_CACHE_MAX_BYTES: usize = 1024;

/// Default deadline for a single connect or publish call, in seconds
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Default directory for persisted settings and the cache file
const DEFAULT_DATA_DIR: &str = "./plant_telemetry_data";

/// How snapshot timestamps are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampMode {
    /// Milliseconds since process start
    Uptime,

    /// Milliseconds since the Unix epoch
    Epoch,
}

/// Configuration for the plant telemetry node.
///
/// All settings can be configured via environment variables:
/// - `PLANT_TELEMETRY_API_URL`: backend URL (default: http://localhost:8000)
/// - `PLANT_TELEMETRY_POLLING_INTERVAL_MS`: milliseconds between ticks (default: 60000)
/// - `PLANT_TELEMETRY_MAX_RECONNECT_ATTEMPTS`: reconnect bound (default: 3)
/// - `PLANT_TELEMETRY_CACHE_MAX_ENTRIES`: cached snapshot limit (default: 500)
/// - `PLANT_TELEMETRY_CACHE_MAX_BYTES`: cache byte budget (default: 262144)
/// - `PLANT_TELEMETRY_REQUEST_TIMEOUT_SECS`: per-call deadline (default: 10)
/// - `PLANT_TELEMETRY_DATA_DIR`: settings and cache directory
/// - `PLANT_TELEMETRY_TIMESTAMP`: `uptime` or `epoch` (default: uptime)
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the ingestion backend
    pub api_url: String,

    /// Health endpoint probed by `connect()`
    pub health_url: String,

    /// Interval between ticks, measured from tick start
    pub polling_interval: Duration,

    /// Reconnect attempts allowed before waiting for the next natural tick
    pub max_reconnect_attempts: u32,

    /// Maximum number of cached snapshots
    pub cache_max_entries: usize,

    /// Maximum total payload bytes held by the cache
    pub cache_max_bytes: usize,

    /// Deadline applied to each connect/publish call
    pub request_timeout: Duration,

    /// Directory for persisted settings and the cache file
    pub data_dir: PathBuf,

    /// Timestamp source for snapshots
    pub timestamp_mode: TimestampMode,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any numeric variable is not a valid number or
    /// is outside its accepted range, or if the timestamp mode is unknown.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use plant_telemetry::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("API URL: {}", config.api_url);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_url = env::var("PLANT_TELEMETRY_API_URL")
            .unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let api_url = api_url.trim_end_matches('/').to_string();
        let health_url = format!("{}/health", api_url);

        let polling_interval_ms = parse_bounded(
            "PLANT_TELEMETRY_POLLING_INTERVAL_MS",
            DEFAULT_POLLING_INTERVAL_MS,
            MIN_POLLING_INTERVAL_MS,
            MAX_POLLING_INTERVAL_MS,
        )?;

        let max_reconnect_attempts = parse_bounded(
            "PLANT_TELEMETRY_MAX_RECONNECT_ATTEMPTS",
            DEFAULT_MAX_RECONNECT_ATTEMPTS,
            1,
            u32::MAX,
        )?;

        let cache_max_entries = parse_bounded(
            "PLANT_TELEMETRY_CACHE_MAX_ENTRIES",
            DEFAULT_CACHE_MAX_ENTRIES,
            1,
            MAX_CACHE_ENTRIES,
        )?;

        let cache_max_bytes = parse_bounded(
            "PLANT_TELEMETRY_CACHE_MAX_BYTES",
            DEFAULT_CACHE_MAX_BYTES,
            MIN_CACHE_MAX_BYTES,
            usize::MAX,
        )?;

        let request_timeout_secs = parse_bounded(
            "PLANT_TELEMETRY_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
            1,
            u64::MAX,
        )?;

        let data_dir = env::var("PLANT_TELEMETRY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR));

        let timestamp_mode = Self::parse_timestamp_mode()?;

        Ok(Self {
            api_url,
            health_url,
            polling_interval: Duration::from_millis(polling_interval_ms),
            max_reconnect_attempts,
            cache_max_entries,
            cache_max_bytes,
            request_timeout: Duration::from_secs(request_timeout_secs),
            data_dir,
            timestamp_mode,
        })
    }

    fn parse_timestamp_mode() -> Result<TimestampMode, ConfigError> {
        let env_var = "PLANT_TELEMETRY_TIMESTAMP";

        match env::var(env_var) {
            Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
                "uptime" => Ok(TimestampMode::Uptime),
                "epoch" => Ok(TimestampMode::Epoch),
                other => Err(ConfigError {
                    message: format!("'{}' is not one of 'uptime' or 'epoch'", other),
                    env_var: Some(env_var.to_string()),
                }),
            },
            Err(_) => Ok(TimestampMode::Uptime),
        }
    }

    /// Apply settings persisted on the device over the environment values.
    ///
    /// Currently only the polling interval (milliseconds) can be overridden.
    /// Out-of-range or unparsable stored values are ignored.
    pub fn apply_stored_overrides(&mut self, store: &impl KeyValueStore) {
        let Some(stored) = get_string(store, KEY_POLLING_INTERVAL) else {
            return;
        };

        match stored.parse::<u64>() {
            Ok(ms) if (MIN_POLLING_INTERVAL_MS..=MAX_POLLING_INTERVAL_MS).contains(&ms) => {
                info!(polling_interval_ms = ms, "Using stored polling interval");
                self.polling_interval = Duration::from_millis(ms);
            }
            _ => {
                warn!(stored = %stored, "Ignoring invalid stored polling interval");
            }
        }
    }

    /// URL a device with the given id publishes snapshots to.
    pub fn publish_url(&self, device_id: &str) -> String {
        format!("{}{}{}", self.api_url, PUBLISH_TOPIC_PREFIX, device_id)
    }

    /// Path of the durable cache file.
    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join("cache.ndjson")
    }
}

impl Default for Config {
    /// Create a default configuration using default values.
    ///
    /// This is useful for testing or when environment variables are not set.
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            health_url: format!("{}/health", DEFAULT_API_URL),
            polling_interval: Duration::from_millis(DEFAULT_POLLING_INTERVAL_MS),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            cache_max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            cache_max_bytes: DEFAULT_CACHE_MAX_BYTES,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            timestamp_mode: TimestampMode::Uptime,
        }
    }
}

/// Parse a numeric environment variable, enforcing an inclusive range.
fn parse_bounded<T>(env_var: &str, default: T, min: T, max: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + std::fmt::Display + Copy,
{
    match env::var(env_var) {
        Ok(value) => {
            let parsed: T = value.trim().parse().map_err(|_| ConfigError {
                message: format!("'{}' is not a valid number", value),
                env_var: Some(env_var.to_string()),
            })?;

            if parsed < min {
                return Err(ConfigError {
                    message: format!("{} is below minimum ({})", parsed, min),
                    env_var: Some(env_var.to_string()),
                });
            }

            if parsed > max {
                return Err(ConfigError {
                    message: format!("{} exceeds maximum ({})", parsed, max),
                    env_var: Some(env_var.to_string()),
                });
            }

            Ok(parsed)
        }
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::env;
    use std::sync::Mutex;

    // Environment is process-global; serialize the tests that touch it
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // Helper to temporarily set environment variables for testing
    struct EnvGuard {
        key: String,
        original: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let original = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key: key.to_string(),
                original,
            }
        }

        fn remove(key: &str) -> Self {
            let original = env::var(key).ok();
            env::remove_var(key);
            Self {
                key: key.to_string(),
                original,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.original {
                Some(val) => env::set_var(&self.key, val),
                None => env::remove_var(&self.key),
            }
        }
    }

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.api_url, "http://localhost:8000");
        assert_eq!(config.polling_interval, Duration::from_secs(60));
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.cache_max_entries, 500);
        assert_eq!(config.timestamp_mode, TimestampMode::Uptime);
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = lock_env();
        let _guard1 = EnvGuard::remove("PLANT_TELEMETRY_API_URL");
        let _guard2 = EnvGuard::remove("PLANT_TELEMETRY_POLLING_INTERVAL_MS");
        let _guard3 = EnvGuard::remove("PLANT_TELEMETRY_MAX_RECONNECT_ATTEMPTS");
        let _guard4 = EnvGuard::remove("PLANT_TELEMETRY_TIMESTAMP");

        let config = Config::from_env().expect("Should load with defaults");
        assert_eq!(config.api_url, "http://localhost:8000");
        assert_eq!(config.health_url, "http://localhost:8000/health");
        assert_eq!(config.polling_interval, Duration::from_millis(60_000));
        assert_eq!(config.max_reconnect_attempts, 3);
    }

    #[test]
    fn test_config_from_env_custom_values() {
        let _lock = lock_env();
        let _guard1 = EnvGuard::set("PLANT_TELEMETRY_API_URL", "http://custom:9000/");
        let _guard2 = EnvGuard::set("PLANT_TELEMETRY_POLLING_INTERVAL_MS", "300000");
        let _guard3 = EnvGuard::set("PLANT_TELEMETRY_MAX_RECONNECT_ATTEMPTS", "5");
        let _guard4 = EnvGuard::set("PLANT_TELEMETRY_CACHE_MAX_ENTRIES", "20");
        let _guard5 = EnvGuard::set("PLANT_TELEMETRY_TIMESTAMP", "Epoch");
        let _guard6 = EnvGuard::set("PLANT_TELEMETRY_DATA_DIR", "/tmp/plant");

        let config = Config::from_env().expect("Should load custom values");
        assert_eq!(config.api_url, "http://custom:9000"); // Trailing slash removed
        assert_eq!(config.health_url, "http://custom:9000/health");
        assert_eq!(config.polling_interval, Duration::from_secs(300));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.cache_max_entries, 20);
        assert_eq!(config.timestamp_mode, TimestampMode::Epoch);
        assert_eq!(config.cache_path(), PathBuf::from("/tmp/plant/cache.ndjson"));
        assert_eq!(
            config.publish_url("abc"),
            "http://custom:9000/devices/plants/abc"
        );
    }

    #[test]
    fn test_invalid_polling_interval() {
        let _lock = lock_env();
        let _guard = EnvGuard::set("PLANT_TELEMETRY_POLLING_INTERVAL_MS", "soon");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("not a valid number"));
        assert_eq!(err.env_var.as_deref(), Some("PLANT_TELEMETRY_POLLING_INTERVAL_MS"));
    }

    #[test]
    fn test_polling_interval_below_min() {
        let _lock = lock_env();
        let _guard = EnvGuard::set("PLANT_TELEMETRY_POLLING_INTERVAL_MS", "10");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("below minimum"));
    }

    #[test]
    fn test_cache_entries_exceeds_max() {
        let _lock = lock_env();
        let _guard = EnvGuard::set("PLANT_TELEMETRY_CACHE_MAX_ENTRIES", "999999");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("exceeds maximum"));
    }

    #[test]
    fn test_zero_reconnect_attempts_rejected() {
        let _lock = lock_env();
        let _guard = EnvGuard::set("PLANT_TELEMETRY_MAX_RECONNECT_ATTEMPTS", "0");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("below minimum"));
    }

    #[test]
    fn test_unknown_timestamp_mode() {
        let _lock = lock_env();
        let _guard = EnvGuard::set("PLANT_TELEMETRY_TIMESTAMP", "gps");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("gps"));
    }

    #[test]
    fn test_stored_polling_interval_override() {
        let store = MemoryStore::new();
        let mut config = Config::default();

        config.apply_stored_overrides(&store);
        assert_eq!(config.polling_interval, Duration::from_secs(60));

        store.set(KEY_POLLING_INTERVAL, b"300000".to_vec()).unwrap();
        config.apply_stored_overrides(&store);
        assert_eq!(config.polling_interval, Duration::from_secs(300));

        store.set(KEY_POLLING_INTERVAL, b"5".to_vec()).unwrap();
        config.apply_stored_overrides(&store);
        assert_eq!(config.polling_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError {
            message: "test error".to_string(),
            env_var: Some("TEST_VAR".to_string()),
        };
        assert_eq!(
            format!("{}", error),
            "Configuration error for TEST_VAR: test error"
        );

        let error_no_var = ConfigError {
            message: "general error".to_string(),
            env_var: None,
        };
        assert_eq!(
            format!("{}", error_no_var),
            "Configuration error: general error"
        );
    }
}
