//! # Backoff policy for reconnect attempts.
//!
//! [`ReconnectPolicy`] controls how reconnect delays grow across one
//! failure episode:
//!
//! ```text
//! delay(n) = min(max, base * 2^n)  ±  jitter
//! ```
//!
//! The base delay is derived purely from the consecutive-failure count, so
//! jitter output never feeds back into subsequent calculations. The
//! failure count is owned by the worker and reset to zero only after the
//! connection has stayed `Connected` for the stability window
//! ([`ReconnectPolicy::stability_window`]).

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Reconnect backoff policy.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    pub base: Duration,
    /// Cap for the computed delay.
    pub max: Duration,
    /// Jitter ratio applied as `delay * (1 ± ratio)`; `0.0` disables it.
    pub jitter: f64,
    /// How long a connection must stay connected before the failure count
    /// resets to zero.
    pub stability_window: Duration,
}

impl Default for ReconnectPolicy {
    /// `base = 1s`, `max = 60s`, `jitter = 0.2` (±20%),
    /// `stability_window = 10s`.
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.2,
            stability_window: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// Computes the delay for the given consecutive-failure count
    /// (0-indexed: the first failure of an episode uses `base`).
    pub fn next(&self, failure_count: u32) -> Duration {
        self.apply_jitter(self.base_delay(failure_count))
    }

    /// The un-jittered delay: `min(max, base * 2^failure_count)`.
    pub fn base_delay(&self, failure_count: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let exp = failure_count.min(i32::MAX as u32) as i32;
        let raw = self.base.as_secs_f64() * 2.0_f64.powi(exp);

        if !raw.is_finite() || raw < 0.0 || raw > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(raw)
        }
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let ratio = self.jitter.min(1.0);
        let secs = delay.as_secs_f64();
        let spread = secs * ratio;
        let jittered = rand::rng().random_range((secs - spread)..=(secs + spread));
        Duration::from_secs_f64(jittered.max(0.0))
    }
}
