//! Request-weight rate limiter for upstream API calls.
//!
//! The upstream indexer budgets clients by request weight per minute. The
//! limiter tracks weight spent in the current minute window and refuses calls
//! that would exceed the budget, reporting how long to wait.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

/// Limiter configuration.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Maximum request weight spendable per minute.
    pub max_weight_per_minute: u32,
    /// Weight charged for a single page fetch.
    pub request_weight: u32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_weight_per_minute: 1200,
            request_weight: 20,
        }
    }
}

struct Window {
    used: u32,
    window_start: Instant,
}

/// Token-bucket style weight limiter over a fixed one-minute window.
pub struct RequestWeightLimiter {
    config: LimiterConfig,
    state: Mutex<Window>,
}

impl RequestWeightLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            state: Mutex::new(Window {
                used: 0,
                window_start: Instant::now(),
            }),
        }
    }

    /// Reserve the default per-request weight.
    pub fn try_acquire(&self) -> std::result::Result<(), Duration> {
        self.try_acquire_weight(self.config.request_weight)
    }

    /// Reserve `weight` from the current window, or report the time until the
    /// window resets.
    pub fn try_acquire_weight(&self, weight: u32) -> std::result::Result<(), Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();

        if now.duration_since(state.window_start) >= WINDOW {
            state.used = 0;
            state.window_start = now;
        }

        if state.used + weight > self.config.max_weight_per_minute {
            let reset_at = state.window_start + WINDOW;
            return Err(reset_at.saturating_duration_since(now));
        }

        state.used += weight;
        Ok(())
    }
}

impl Default for RequestWeightLimiter {
    fn default() -> Self {
        Self::new(LimiterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_within_budget() {
        let limiter = RequestWeightLimiter::new(LimiterConfig {
            max_weight_per_minute: 100,
            request_weight: 40,
        });

        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_ok());
        // 80 used, 40 more would exceed 100.
        let retry_after = limiter.try_acquire().unwrap_err();
        assert!(retry_after <= WINDOW);
    }

    #[test]
    fn test_oversized_weight_rejected() {
        let limiter = RequestWeightLimiter::new(LimiterConfig {
            max_weight_per_minute: 10,
            request_weight: 1,
        });

        assert!(limiter.try_acquire_weight(11).is_err());
        assert!(limiter.try_acquire_weight(10).is_ok());
    }
}
