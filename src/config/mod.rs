//! Configuration module for build-sentinel.
//!
//! Process configuration is loaded from environment variables with sensible defaults.
//! Checker configuration is validated as a whole and replaced wholesale, never
//! patched field by field.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::CheckError;

/// Polling faster than this would hammer the descriptor endpoint.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(5);

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8080/version.json";

/// When previously cached responses are discarded after a new build is detected.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
    /// Clear caches and activate the waiting worker right away
    Immediate,
    /// Clear caches after a short delay, let the worker activate on its own
    #[default]
    Background,
    /// Do nothing until the application asks
    UserConsent,
}

impl CacheStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStrategy::Immediate => "immediate",
            CacheStrategy::Background => "background",
            CacheStrategy::UserConsent => "user-consent",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "immediate" => Some(CacheStrategy::Immediate),
            "background" => Some(CacheStrategy::Background),
            "user-consent" => Some(CacheStrategy::UserConsent),
            _ => None,
        }
    }
}

/// Configuration of the polling checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckConfig {
    /// URL of the version descriptor resource
    pub endpoint: String,
    pub check_interval: Duration,
    pub enabled: bool,
    /// Total fetch attempts per check; at least one attempt is always made
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            check_interval: Duration::from_secs(5 * 60),
            enabled: true,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl CheckConfig {
    pub fn validate(&self) -> Result<(), CheckError> {
        if self.endpoint.trim().is_empty() {
            return Err(CheckError::Config("endpoint must not be empty".to_string()));
        }
        if self.check_interval < MIN_CHECK_INTERVAL {
            return Err(CheckError::Config(format!(
                "check interval {:?} is below the minimum of {:?}",
                self.check_interval, MIN_CHECK_INTERVAL
            )));
        }
        Ok(())
    }

    /// Build a new configuration with the patch applied on top of this one.
    pub fn merged(&self, patch: &ConfigPatch) -> Self {
        Self {
            endpoint: patch.endpoint.clone().unwrap_or_else(|| self.endpoint.clone()),
            check_interval: patch.check_interval.unwrap_or(self.check_interval),
            enabled: patch.enabled.unwrap_or(self.enabled),
            max_retries: patch.max_retries.unwrap_or(self.max_retries),
            retry_delay: patch.retry_delay.unwrap_or(self.retry_delay),
        }
    }
}

/// Background worker settings layered on top of [`CheckConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOptions {
    pub enabled: bool,
    pub script_url: String,
    pub scope: String,
    /// Send SKIP_WAITING as soon as a new worker is waiting
    pub force_activate: bool,
    pub strategy: CacheStrategy,
    pub background_delay: Duration,
    pub message_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            script_url: "/sw.js".to_string(),
            scope: "/".to_string(),
            force_activate: false,
            strategy: CacheStrategy::default(),
            background_delay: Duration::from_secs(2),
            message_timeout: Duration::from_secs(5),
        }
    }
}

impl WorkerOptions {
    pub fn merged(&self, patch: &ConfigPatch) -> Self {
        Self {
            enabled: patch.worker_enabled.unwrap_or(self.enabled),
            script_url: self.script_url.clone(),
            scope: patch.scope.clone().unwrap_or_else(|| self.scope.clone()),
            force_activate: patch.force_activate.unwrap_or(self.force_activate),
            strategy: patch.strategy.unwrap_or(self.strategy),
            background_delay: self.background_delay,
            message_timeout: self.message_timeout,
        }
    }
}

/// Partial configuration update; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigPatch {
    pub endpoint: Option<String>,
    pub check_interval: Option<Duration>,
    pub enabled: Option<bool>,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub worker_enabled: Option<bool>,
    pub scope: Option<String>,
    pub force_activate: Option<bool>,
    pub strategy: Option<CacheStrategy>,
}

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// URL of the version descriptor resource
    pub version_url: String,
    /// Path to the SQLite state file
    pub db_path: PathBuf,
    pub check_interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Log every descriptor request through the debug observer
    pub debug: bool,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, CheckError> {
        dotenvy::dotenv().ok();

        let version_url =
            env::var("SENTINEL_VERSION_URL").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());

        let db_path = env::var("SENTINEL_DB_PATH")
            .unwrap_or_else(|_| "./data/sentinel.sqlite".to_string())
            .into();

        let check_interval = Duration::from_secs(parse_var("SENTINEL_CHECK_INTERVAL_SECS", 300)?);
        let max_retries = parse_var("SENTINEL_MAX_RETRIES", 3)?;
        let retry_delay = Duration::from_millis(parse_var("SENTINEL_RETRY_DELAY_MS", 5_000)?);

        let debug = matches!(
            env::var("SENTINEL_DEBUG").as_deref(),
            Ok("1") | Ok("true") | Ok("yes")
        );

        let log_level = env::var("SENTINEL_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            version_url,
            db_path,
            check_interval,
            max_retries,
            retry_delay,
            debug,
            log_level,
        })
    }

    pub fn check_config(&self) -> CheckConfig {
        CheckConfig {
            endpoint: self.version_url.clone(),
            check_interval: self.check_interval,
            enabled: true,
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, CheckError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| CheckError::Config(format!("Invalid {} value '{}'", name, raw))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        // Clear any existing env vars
        env::remove_var("SENTINEL_VERSION_URL");
        env::remove_var("SENTINEL_DB_PATH");
        env::remove_var("SENTINEL_CHECK_INTERVAL_SECS");
        env::remove_var("SENTINEL_MAX_RETRIES");
        env::remove_var("SENTINEL_RETRY_DELAY_MS");
        env::remove_var("SENTINEL_DEBUG");
        env::remove_var("SENTINEL_LOG_LEVEL");

        let config = Config::from_env().unwrap();

        assert_eq!(config.version_url, DEFAULT_ENDPOINT);
        assert_eq!(config.db_path, PathBuf::from("./data/sentinel.sqlite"));
        assert_eq!(config.check_interval, Duration::from_secs(300));
        assert_eq!(config.max_retries, 3);
        assert!(!config.debug);
        assert_eq!(config.log_level, "info");
        assert!(config.check_config().validate().is_ok());
    }

    #[test]
    fn test_interval_below_minimum_is_rejected() {
        let config = CheckConfig {
            check_interval: Duration::from_secs(4),
            ..CheckConfig::default()
        };
        assert!(matches!(config.validate(), Err(CheckError::Config(_))));

        let config = CheckConfig {
            check_interval: MIN_CHECK_INTERVAL,
            ..CheckConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_merged_keeps_unpatched_fields() {
        let base = CheckConfig::default();
        let patch = ConfigPatch {
            check_interval: Some(Duration::from_secs(30)),
            ..ConfigPatch::default()
        };
        let merged = base.merged(&patch);
        assert_eq!(merged.check_interval, Duration::from_secs(30));
        assert_eq!(merged.endpoint, base.endpoint);
        assert_eq!(merged.max_retries, base.max_retries);
    }

    #[test]
    fn test_strategy_names() {
        for strategy in [
            CacheStrategy::Immediate,
            CacheStrategy::Background,
            CacheStrategy::UserConsent,
        ] {
            assert_eq!(CacheStrategy::from_str(strategy.as_str()), Some(strategy));
        }
        assert_eq!(
            serde_json::to_string(&CacheStrategy::UserConsent).unwrap(),
            "\"user-consent\""
        );
    }
}
