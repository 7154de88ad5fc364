//! Reconnection backoff
//!
//! The delay grows geometrically from `base` and is clamped at `ceiling`.
//! Attempts never run out: a worker keeps dialing until it is shut down.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    base: Duration,
    multiplier: f64,
    ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 2.0, Duration::from_secs(60))
    }
}

impl RetryPolicy {
    /// A multiplier below 1 is treated as 1, and a ceiling below `base` as `base`
    pub fn new(base: Duration, multiplier: f64, ceiling: Duration) -> Self {
        Self {
            base,
            multiplier: if multiplier.is_finite() && multiplier >= 1.0 {
                multiplier
            } else {
                1.0
            },
            ceiling: ceiling.max(base),
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Delay before reconnect attempt `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let millis = self.base.as_millis() as f64 * factor;
        let ceiling = self.ceiling.as_millis() as f64;
        if !millis.is_finite() || millis >= ceiling {
            return self.ceiling;
        }
        Duration::from_millis(millis as u64)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempt: 0,
        }
    }
}

/// Endless sequence of delays; reset after a connection is established
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(5), 2.0, Duration::from_secs(60))
    }

    #[test]
    fn test_delay_grows_to_ceiling() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::from_secs(5));
        assert_eq!(p.delay_for(1), Duration::from_secs(10));
        assert_eq!(p.delay_for(2), Duration::from_secs(20));
        assert_eq!(p.delay_for(3), Duration::from_secs(40));
        assert_eq!(p.delay_for(4), Duration::from_secs(60));
        assert_eq!(p.delay_for(1_000), Duration::from_secs(60));
        assert_eq!(p.delay_for(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_never_ends() {
        let mut backoff = policy().backoff();
        let delays: Vec<_> = backoff.by_ref().take(50).collect();
        assert_eq!(delays.len(), 50);
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(60)));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(backoff.attempt(), 50);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_fixed_delay() {
        let p = RetryPolicy::new(Duration::from_secs(3), 1.0, Duration::from_secs(3));
        assert!((0..10).all(|n| p.delay_for(n) == Duration::from_secs(3)));
    }

    #[test]
    fn test_degenerate_inputs_are_clamped() {
        let p = RetryPolicy::new(Duration::from_secs(10), 0.5, Duration::from_secs(1));
        assert_eq!(p.ceiling(), Duration::from_secs(10));
        assert_eq!(p.delay_for(5), Duration::from_secs(10));
    }
}
