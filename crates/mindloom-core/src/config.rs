//! Environment-driven configuration.
//!
//! Every knob the core consumes from the environment is parsed here, once,
//! at startup. Missing optional values fall back to the defaults the rest of
//! the crate documents; missing required values (DSN, bus address) surface
//! as errors so a misconfigured service fails fast instead of half-starting.

use std::env;
use std::time::Duration;

/// Error raised when a required environment variable is absent or unparsable.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required variable was not set.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    /// A variable was present but could not be parsed.
    #[error("invalid value for {name}: {value}")]
    Invalid {
        /// Variable name.
        name: &'static str,
        /// The offending value.
        value: String,
    },
}

fn parse_env<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        Err(_) => Ok(default),
    }
}

/// Connection endpoints and pool sizing for the core's two backbones.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Postgres DSN.
    pub database_url: String,
    /// Redis address for the event bus transport.
    pub bus_url: String,
    /// Max connections in the shared pool per service.
    pub db_pool_size: u32,
}

impl CoreConfig {
    /// Read `DATABASE_URL` and `BUS_URL` from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            bus_url: env::var("BUS_URL").map_err(|_| ConfigError::Missing("BUS_URL"))?,
            db_pool_size: parse_env("DB_POOL_SIZE", 10)?,
        })
    }
}

/// Thresholds for the pipeline monitor's detectors.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Background work slower than this raises `slow_processing`.
    pub slow_threshold: Duration,
    /// Unfinished background work older than this raises `stuck_task`.
    pub stuck_threshold: Duration,
    /// A lane success rate under `1 - failure_threshold` raises
    /// `high_failure_rate`.
    pub failure_threshold: f64,
    /// Whether the auto-retry manager runs at all.
    pub auto_retry_enabled: bool,
    /// Sampling window for the metric collector.
    pub metrics_window: Duration,
    /// Pause between collector iterations.
    pub poll_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            slow_threshold: Duration::from_millis(15_000),
            stuck_threshold: Duration::from_secs(300),
            failure_threshold: 0.2,
            auto_retry_enabled: true,
            metrics_window: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(30),
        }
    }
}

impl MonitorConfig {
    /// Read monitor thresholds from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            slow_threshold: Duration::from_millis(parse_env(
                "SLOW_THRESHOLD_MS",
                defaults.slow_threshold.as_millis() as u64,
            )?),
            stuck_threshold: Duration::from_secs(parse_env(
                "STUCK_THRESHOLD_SEC",
                defaults.stuck_threshold.as_secs(),
            )?),
            failure_threshold: parse_env("FAILURE_THRESHOLD", defaults.failure_threshold)?,
            auto_retry_enabled: parse_env("AUTO_RETRY_ENABLED", defaults.auto_retry_enabled)?,
            metrics_window: defaults.metrics_window,
            poll_interval: defaults.poll_interval,
        })
    }
}

/// Rate-limiting and grouping knobs for the alert notifier.
#[derive(Debug, Clone)]
pub struct AlertConfig {
    /// Master switch.
    pub enabled: bool,
    /// Max notifications per alert type per window.
    pub max_per_type: u32,
    /// The rate-limit window.
    pub window: Duration,
    /// Alerts of the same type inside this window are coalesced.
    pub group_window: Duration,
    /// Chat ids to notify.
    pub admin_ids: Vec<i64>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_per_type: 5,
            window: Duration::from_secs(3600),
            group_window: Duration::from_secs(60),
            admin_ids: Vec::new(),
        }
    }
}

impl AlertConfig {
    /// Read alerting knobs from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let admin_ids = env::var("MONITORING_ADMIN_IDS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .filter_map(|part| part.trim().parse().ok())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            enabled: parse_env("ALERTS_ENABLED", defaults.enabled)?,
            max_per_type: parse_env("ALERT_MAX_PER_TYPE", defaults.max_per_type)?,
            window: Duration::from_secs(
                parse_env("ALERT_WINDOW_MINUTES", defaults.window.as_secs() / 60)? * 60,
            ),
            group_window: Duration::from_secs(parse_env(
                "ALERT_GROUP_WINDOW",
                defaults.group_window.as_secs(),
            )?),
            admin_ids,
        })
    }
}
