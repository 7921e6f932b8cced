//! Database configuration.
//!
//! Configuration is an explicit value handed to [`Database::new`](crate::Database::new)
//! and threaded through to the work queue and the observation engine.

use std::env;
use std::time::Duration;

/// Default coalescing window for re-count observation.
pub const DEFAULT_COUNT_THROTTLE: Duration = Duration::from_millis(250);

/// Runtime configuration of a database instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Window during which bursts of writes are merged into one re-count.
    /// `None` re-counts on every change.
    pub count_throttle: Option<Duration>,
    /// Emit a warning when work is enqueued while the queue is busy.
    pub warn_on_queue_contention: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            count_throttle: Some(DEFAULT_COUNT_THROTTLE),
            warn_on_queue_contention: true,
        }
    }
}

impl DatabaseConfig {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// - `LARDER_COUNT_THROTTLE_MS`: throttle window in milliseconds, `0` disables
    /// - `LARDER_QUEUE_WARNINGS`: `true`/`false`/`1`/`0`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(raw) = env::var("LARDER_COUNT_THROTTLE_MS") {
            let millis: u64 = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidCountThrottle(raw.clone()))?;
            config.count_throttle = (millis > 0).then(|| Duration::from_millis(millis));
        }

        if let Ok(raw) = env::var("LARDER_QUEUE_WARNINGS") {
            config.warn_on_queue_contention = parse_flag(&raw)
                .ok_or_else(|| ConfigError::InvalidQueueWarnings(raw.clone()))?;
        }

        Ok(config)
    }

    /// Builder-style setter for the count throttle.
    pub fn with_count_throttle(mut self, throttle: Option<Duration>) -> Self {
        self.count_throttle = throttle;
        self
    }

    /// Builder-style setter for queue contention warnings.
    pub fn with_queue_warnings(mut self, enabled: bool) -> Self {
        self.warn_on_queue_contention = enabled;
        self
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid LARDER_COUNT_THROTTLE_MS value: {0}")]
    InvalidCountThrottle(String),

    #[error("Invalid LARDER_QUEUE_WARNINGS value: {0}")]
    InvalidQueueWarnings(String),
}
