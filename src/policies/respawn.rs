//! # Respawn policy for crashed workers.
//!
//! A worker panic is isolated by the registry: the connection's worker is
//! respawned with a delay, at most [`RespawnPolicy::max_respawns`] times.
//! Exceeding the bound escalates the connection to `Failed` instead of
//! retrying indefinitely.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounded respawn policy applied by the registry to crashed workers.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RespawnPolicy {
    /// Maximum respawns before the connection escalates to `Failed`.
    pub max_respawns: u32,
    /// Delay before the first respawn.
    pub base: Duration,
    /// Cap for the respawn delay.
    pub max_delay: Duration,
}

impl Default for RespawnPolicy {
    /// `max_respawns = 3`, `base = 1s`, `max_delay = 30s`.
    fn default() -> Self {
        Self {
            max_respawns: 3,
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RespawnPolicy {
    /// Whether another respawn is allowed after `respawns` so far.
    pub fn allows(&self, respawns: u32) -> bool {
        respawns < self.max_respawns
    }

    /// Delay before respawn number `respawns + 1` (simple doubling).
    pub fn delay(&self, respawns: u32) -> Duration {
        let exp = respawns.min(16);
        let raw = self.base.saturating_mul(1u32 << exp);
        raw.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bound_is_enforced() {
        let policy = RespawnPolicy {
            max_respawns: 2,
            ..RespawnPolicy::default()
        };
        assert!(policy.allows(0));
        assert!(policy.allows(1));
        assert!(!policy.allows(2));
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RespawnPolicy {
            max_respawns: 10,
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        };
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(5), Duration::from_secs(8));
    }
}
