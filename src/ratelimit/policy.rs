//! Rate policy: how many requests an identifier may make per window.

use std::time::Duration;

use crate::config::LimitsConfig;
use crate::error::{Result, TollgateError};

/// Shortest window the counter store can express (Redis TTLs are in ms).
const MIN_WINDOW: Duration = Duration::from_millis(1);

/// Immutable rate limit policy.
///
/// `quota` is the nominal number of requests per window. `burst` is the
/// total ceiling admitted within one window; when unset or zero it equals
/// `quota`, so a plain `quota = 10` policy admits exactly ten requests per
/// window. A burst below the quota is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicy {
    quota: u64,
    window: Duration,
    burst: u64,
}

impl RatePolicy {
    /// Build and validate a policy.
    pub fn new(quota: u64, window: Duration, burst: Option<u64>) -> Result<Self> {
        if window < MIN_WINDOW {
            return Err(TollgateError::Config(format!(
                "window must be at least {:?}, got {:?}",
                MIN_WINDOW, window
            )));
        }

        let burst = match burst {
            None | Some(0) => quota,
            Some(burst) if burst < quota => {
                return Err(TollgateError::Config(format!(
                    "burst ({}) cannot be lower than quota ({})",
                    burst, quota
                )));
            }
            Some(burst) => burst,
        };

        Ok(Self {
            quota,
            window,
            burst,
        })
    }

    /// Build a policy from the `limits` configuration section.
    pub fn from_config(config: &LimitsConfig) -> Result<Self> {
        Self::new(
            config.quota,
            Duration::from_millis(config.window_ms),
            config.burst,
        )
    }

    pub fn quota(&self) -> u64 {
        self.quota
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn burst(&self) -> u64 {
        self.burst
    }

    /// Requests admitted per window for one identifier.
    pub fn capacity(&self) -> u64 {
        self.burst
    }
}
