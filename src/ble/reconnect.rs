//! Automatic reconnection policy.
//!
//! After the link drops, or the adapter comes back on, the policy decides
//! whether to rescan for the remembered peripheral and how long to wait
//! first. Delays grow linearly: `step × attempt`. Once the cap is reached
//! nothing happens until the user connects explicitly or the adapter is
//! power-cycled.

use std::time::Duration;

use tracing::{debug, error, info};

/// Default number of automatic attempts.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 6;

/// Default backoff step; the n-th attempt waits `n × step`.
pub const DEFAULT_BACKOFF_STEP: Duration = Duration::from_secs(2);

/// What to do after a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Rescan after `delay`. `attempt` starts at 1.
    Retry {
        /// Attempt number after incrementing.
        attempt: u32,
        /// Wait before rescanning.
        delay: Duration,
    },
    /// The user disconnected; automatic reconnection is off.
    Suppressed,
    /// No peripheral has ever been connected.
    NoPeripheral,
    /// The attempt cap is reached.
    Exhausted {
        /// The cap that was hit.
        max: u32,
    },
}

/// Attempt counter plus suppression flag.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    attempts: u32,
    max_attempts: u32,
    backoff_step: Duration,
    suppressed: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_BACKOFF_STEP)
    }
}

impl ReconnectPolicy {
    /// Create a policy with the given cap and backoff step.
    pub fn new(max_attempts: u32, backoff_step: Duration) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            backoff_step,
            suppressed: false,
        }
    }

    /// Attempts made since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The attempt cap.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether a user disconnect turned automatic reconnection off.
    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    /// Whether a scan result for the remembered peripheral may auto-connect.
    pub fn allows_auto_connect(&self) -> bool {
        !self.suppressed
    }

    /// Delay before the given attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt
    }

    /// The link dropped without being asked to.
    pub fn on_link_lost(&mut self, has_remembered: bool) -> ReconnectDecision {
        self.decide(has_remembered)
    }

    /// The adapter was switched back on.
    ///
    /// Clears the counter and any suppression before deciding.
    pub fn on_power_restored(&mut self, has_remembered: bool) -> ReconnectDecision {
        self.attempts = 0;
        self.suppressed = false;
        self.decide(has_remembered)
    }

    /// The handshake completed.
    pub fn on_connected(&mut self) {
        if self.attempts > 0 {
            debug!("Reconnected after {} attempt(s)", self.attempts);
        }
        self.attempts = 0;
    }

    /// The user disconnected.
    pub fn on_user_disconnect(&mut self) {
        self.attempts = 0;
        self.suppressed = true;
    }

    /// The user asked to connect.
    pub fn on_explicit_connect(&mut self) {
        self.attempts = 0;
        self.suppressed = false;
    }

    fn decide(&mut self, has_remembered: bool) -> ReconnectDecision {
        if self.suppressed {
            debug!("Auto-reconnect suppressed by user disconnect");
            return ReconnectDecision::Suppressed;
        }
        if !has_remembered {
            debug!("No remembered peripheral to reconnect to");
            return ReconnectDecision::NoPeripheral;
        }
        if self.attempts >= self.max_attempts {
            error!(
                "Giving up after {} reconnect attempts",
                self.max_attempts
            );
            return ReconnectDecision::Exhausted {
                max: self.max_attempts,
            };
        }

        self.attempts += 1;
        let delay = self.delay_for(self.attempts);
        info!(
            "Reconnect attempt {}/{} in {:?}",
            self.attempts, self.max_attempts, delay
        );
        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_linear_backoff_until_cap() {
        let mut policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (0..6)
            .map(|_| match policy.on_link_lost(true) {
                ReconnectDecision::Retry { delay, .. } => delay.as_secs(),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(delays, vec![2, 4, 6, 8, 10, 12]);

        assert_eq!(
            policy.on_link_lost(true),
            ReconnectDecision::Exhausted { max: 6 }
        );
        assert_eq!(policy.attempts(), 6);
    }

    #[test]
    fn test_no_remembered_peripheral() {
        let mut policy = ReconnectPolicy::default();
        assert_eq!(policy.on_link_lost(false), ReconnectDecision::NoPeripheral);
        assert_eq!(policy.attempts(), 0);
    }

    #[test]
    fn test_connected_resets_counter() {
        let mut policy = ReconnectPolicy::default();
        for _ in 0..5 {
            policy.on_link_lost(true);
        }
        assert_eq!(policy.attempts(), 5);
        policy.on_connected();
        assert_eq!(policy.attempts(), 0);
        assert_eq!(
            policy.on_link_lost(true),
            ReconnectDecision::Retry {
                attempt: 1,
                delay: Duration::from_secs(2)
            }
        );
    }

    #[test]
    fn test_user_disconnect_suppresses_until_explicit_connect() {
        let mut policy = ReconnectPolicy::default();
        policy.on_link_lost(true);
        policy.on_user_disconnect();

        assert_eq!(policy.attempts(), 0);
        assert!(!policy.allows_auto_connect());
        assert_eq!(policy.on_link_lost(true), ReconnectDecision::Suppressed);

        policy.on_explicit_connect();
        assert!(policy.allows_auto_connect());
        assert!(matches!(
            policy.on_link_lost(true),
            ReconnectDecision::Retry { attempt: 1, .. }
        ));
    }

    #[test]
    fn test_power_restored_clears_suppression_and_exhaustion() {
        let mut policy = ReconnectPolicy::new(2, Duration::from_secs(2));
        policy.on_link_lost(true);
        policy.on_link_lost(true);
        assert!(matches!(
            policy.on_link_lost(true),
            ReconnectDecision::Exhausted { max: 2 }
        ));
        policy.on_user_disconnect();

        assert_eq!(
            policy.on_power_restored(true),
            ReconnectDecision::Retry {
                attempt: 1,
                delay: Duration::from_secs(2)
            }
        );
        assert!(!policy.is_suppressed());
    }
}
