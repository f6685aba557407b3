//! Global application configuration manager.
//!
//! `AppConfig` is a lazily initialized, globally accessible singleton containing
//! runtime configuration values loaded from environment variables. It is the only
//! ambient global in the workspace; every stateful component (session store,
//! credential cache, reconciler) is constructed explicitly and takes the values it
//! needs from here at construction time.

use std::env;
use std::str::FromStr;
use std::sync::{OnceLock, RwLock, RwLockReadGuard};

/// Represents the complete application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub env: String,
    pub project_name: String,
    pub log_level: String,
    pub log_file: String,
    pub log_to_stdout: bool,
    /// Relational + document store (server side).
    pub database_path: String,
    /// Local persistent cache (device side).
    pub device_cache_path: String,
    pub host: String,
    pub port: u16,
    /// Base URL of the remote validation function, e.g. `http://127.0.0.1:3000`.
    pub validation_url: String,
    pub network_timeout_secs: u64,
    pub sync_interval_secs: u64,
    pub connectivity_probe_secs: u64,
    pub session_cleanup_interval_secs: u64,
    /// How long after a session's end an offline-captured scan may still be accepted,
    /// provided it was captured inside the window.
    pub offline_grace_minutes: i64,
    /// How far a device clock may run ahead of or behind the server before an
    /// offline capture time is no longer trusted.
    pub clock_skew_secs: i64,
    pub archive_after_hours: i64,
    pub credential_ttl_hours: i64,
}

/// Lazily-initialized, thread-safe singleton instance of `AppConfig`.
static CONFIG_INSTANCE: OnceLock<RwLock<AppConfig>> = OnceLock::new();

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.into())
}

fn parsed_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    /// Loads the configuration from `.env` and environment variables.
    ///
    /// Missing or malformed values fall back to defaults suitable for local
    /// development.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            env: var_or("APP_ENV", "development"),
            project_name: var_or("PROJECT_NAME", "temporal-attendance"),
            log_level: var_or("LOG_LEVEL", "api=info,services=info"),
            log_file: var_or("LOG_FILE", "api.log"),
            log_to_stdout: var_or("LOG_TO_STDOUT", "false") == "true",
            database_path: var_or("DATABASE_PATH", "data/attendance.db"),
            device_cache_path: var_or("DEVICE_CACHE_PATH", "data/device_cache.db"),
            host: var_or("HOST", "127.0.0.1"),
            port: parsed_or("PORT", 3000),
            validation_url: var_or("VALIDATION_URL", "http://127.0.0.1:3000"),
            network_timeout_secs: parsed_or("NETWORK_TIMEOUT_SECS", 10),
            sync_interval_secs: parsed_or("SYNC_INTERVAL_SECS", 120),
            connectivity_probe_secs: parsed_or("CONNECTIVITY_PROBE_SECS", 15),
            session_cleanup_interval_secs: parsed_or("SESSION_CLEANUP_INTERVAL_SECS", 60),
            offline_grace_minutes: parsed_or("OFFLINE_GRACE_MINUTES", 0),
            clock_skew_secs: parsed_or("CLOCK_SKEW_SECS", 120),
            archive_after_hours: parsed_or("ARCHIVE_AFTER_HOURS", 24),
            credential_ttl_hours: parsed_or("CREDENTIAL_TTL_HOURS", 12),
        }
    }

    fn instance() -> &'static RwLock<AppConfig> {
        CONFIG_INSTANCE.get_or_init(|| RwLock::new(AppConfig::from_env()))
    }

    /// Returns a shared reference to the global configuration.
    pub fn global() -> RwLockReadGuard<'static, AppConfig> {
        Self::instance()
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Resets the configuration by reloading from environment variables.
    ///
    /// Useful in tests to clear overrides.
    pub fn reset() {
        Self::set_field(|cfg| *cfg = AppConfig::from_env());
    }

    /// Generic internal setter for any field in the config.
    fn set_field<F>(setter: F)
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut guard = Self::instance()
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        setter(&mut guard);
    }

    // --- Per-field setters below ---

    pub fn set_env(value: impl Into<String>) {
        AppConfig::set_field(|cfg| cfg.env = value.into());
    }

    pub fn set_log_level(value: impl Into<String>) {
        AppConfig::set_field(|cfg| cfg.log_level = value.into());
    }

    pub fn set_log_to_stdout(value: bool) {
        AppConfig::set_field(|cfg| cfg.log_to_stdout = value);
    }

    pub fn set_database_path(value: impl Into<String>) {
        AppConfig::set_field(|cfg| cfg.database_path = value.into());
    }

    pub fn set_device_cache_path(value: impl Into<String>) {
        AppConfig::set_field(|cfg| cfg.device_cache_path = value.into());
    }

    pub fn set_validation_url(value: impl Into<String>) {
        AppConfig::set_field(|cfg| cfg.validation_url = value.into());
    }

    pub fn set_network_timeout_secs(value: u64) {
        AppConfig::set_field(|cfg| cfg.network_timeout_secs = value);
    }

    pub fn set_sync_interval_secs(value: u64) {
        AppConfig::set_field(|cfg| cfg.sync_interval_secs = value);
    }

    pub fn set_connectivity_probe_secs(value: u64) {
        AppConfig::set_field(|cfg| cfg.connectivity_probe_secs = value);
    }

    pub fn set_offline_grace_minutes(value: i64) {
        AppConfig::set_field(|cfg| cfg.offline_grace_minutes = value);
    }

    pub fn set_clock_skew_secs(value: i64) {
        AppConfig::set_field(|cfg| cfg.clock_skew_secs = value);
    }

    pub fn set_archive_after_hours(value: i64) {
        AppConfig::set_field(|cfg| cfg.archive_after_hours = value);
    }

    pub fn set_credential_ttl_hours(value: i64) {
        AppConfig::set_field(|cfg| cfg.credential_ttl_hours = value);
    }
}
