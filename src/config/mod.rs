//! Publisher configuration
//!
//! Configuration for a partition publisher: flush cadence, ask timeouts,
//! init-retry backoff, lag polling cadence and the per-flush batch cap.

use crate::error::{Result, StatelineError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default cadence of flush ticks
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 250;

/// Default timeout applied to facade ask operations
pub const DEFAULT_ASK_TIMEOUT_MS: u64 = 5_000;

/// Default cadence of KTable lag polling
pub const DEFAULT_LAG_POLL_INTERVAL_MS: u64 = 3_000;

/// Configuration for a partition publisher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Cadence of flush ticks in milliseconds
    pub flush_interval_ms: u64,

    /// Default timeout for facade operations in milliseconds
    pub ask_timeout_ms: u64,

    /// Initial delay before retrying a failed `init_transactions`
    pub init_backoff_initial_ms: u64,

    /// Upper bound on the init-retry delay
    pub init_backoff_max_ms: u64,

    /// Backoff multiplier for exponential init retry
    pub init_backoff_multiplier: f64,

    /// Cadence of KTable lag polling in milliseconds
    pub lag_poll_interval_ms: u64,

    /// Soft cap on physical records drained into a single transaction.
    /// A flush always drains at least one pending request.
    pub transaction_max_records: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            ask_timeout_ms: DEFAULT_ASK_TIMEOUT_MS,
            init_backoff_initial_ms: 100,
            init_backoff_max_ms: 10_000,
            init_backoff_multiplier: 2.0,
            lag_poll_interval_ms: DEFAULT_LAG_POLL_INTERVAL_MS,
            transaction_max_records: 1024,
        }
    }
}

impl PublisherConfig {
    /// Parse a configuration from a JSON document.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate interval and backoff settings.
    pub fn validate(&self) -> Result<()> {
        if self.flush_interval_ms == 0 {
            return Err(StatelineError::Config(
                "flush_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.ask_timeout_ms == 0 {
            return Err(StatelineError::Config(
                "ask_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.init_backoff_initial_ms == 0 {
            return Err(StatelineError::Config(
                "init_backoff_initial_ms must be greater than zero".to_string(),
            ));
        }
        if self.init_backoff_max_ms < self.init_backoff_initial_ms {
            return Err(StatelineError::Config(
                "init_backoff_max_ms must be at least init_backoff_initial_ms".to_string(),
            ));
        }
        if self.init_backoff_multiplier < 1.0 {
            return Err(StatelineError::Config(
                "init_backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.lag_poll_interval_ms == 0 {
            return Err(StatelineError::Config(
                "lag_poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.transaction_max_records == 0 {
            return Err(StatelineError::Config(
                "transaction_max_records must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn ask_timeout(&self) -> Duration {
        Duration::from_millis(self.ask_timeout_ms)
    }

    pub fn lag_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lag_poll_interval_ms)
    }

    /// Calculate the init-retry delay for the given 1-based attempt number.
    ///
    /// Exponential in the attempt number, capped at the configured ceiling,
    /// with up to 10% downward jitter so that restarting publishers do not
    /// retry in lockstep.
    pub fn init_backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let delay = self.init_backoff_initial_ms as f64
            * self.init_backoff_multiplier.powi(exponent);
        let capped = delay.min(self.init_backoff_max_ms as f64);
        let jittered = capped * (1.0 - rand::random::<f64>() * 0.1);
        Duration::from_millis(jittered as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(PublisherConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_intervals() {
        let config = PublisherConfig {
            flush_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PublisherConfig {
            lag_poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PublisherConfig {
            transaction_max_records: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_backoff_bounds() {
        let config = PublisherConfig {
            init_backoff_initial_ms: 5_000,
            init_backoff_max_ms: 1_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = PublisherConfig {
            init_backoff_initial_ms: 100,
            init_backoff_max_ms: 1_000,
            init_backoff_multiplier: 2.0,
            ..Default::default()
        };

        // Jitter only shaves, never grows, so the cap holds for any attempt.
        for attempt in 1..=20 {
            let delay = config.init_backoff_delay(attempt);
            assert!(delay <= Duration::from_millis(1_000));
        }

        // First attempt stays near the initial delay.
        let first = config.init_backoff_delay(1);
        assert!(first <= Duration::from_millis(100));
        assert!(first >= Duration::from_millis(89));
    }

    #[test]
    fn test_from_json_str() {
        let config = PublisherConfig::from_json_str(
            r#"{
                "flush_interval_ms": 100,
                "ask_timeout_ms": 2000,
                "init_backoff_initial_ms": 50,
                "init_backoff_max_ms": 5000,
                "init_backoff_multiplier": 2.0,
                "lag_poll_interval_ms": 1000,
                "transaction_max_records": 64
            }"#,
        )
        .unwrap();
        assert_eq!(config.flush_interval(), Duration::from_millis(100));
        assert_eq!(config.transaction_max_records, 64);

        assert!(PublisherConfig::from_json_str("{\"flush_interval_ms\": 0}").is_err());
    }
}
