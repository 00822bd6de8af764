//! Requeue policy: how long a failed key waits before its next pass.

use std::time::Duration;

use crate::config::RequeueConfig;

/// Exponential backoff with a ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct RequeuePolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,

    /// Growth factor per consecutive failure.
    pub multiplier: f64,

    pub max_delay: Duration,
}

impl RequeuePolicy {
    /// Delay before the next pass after `failures` consecutive failures.
    ///
    /// `base_delay * multiplier^(failures - 1)`, clamped to `max_delay`.
    /// With base 1s, multiplier 2 and max 60s: 1s, 2s, 4s, ... 32s, 60s, 60s.
    pub fn next_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

impl Default for RequeuePolicy {
    fn default() -> Self {
        Self::from(&RequeueConfig::default())
    }
}

impl From<&RequeueConfig> for RequeuePolicy {
    fn from(config: &RequeueConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_secs(config.max_delay_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 1)]
    #[case(1, 1)]
    #[case(2, 2)]
    #[case(3, 4)]
    #[case(6, 32)]
    #[case(7, 60)]
    #[case(50, 60)]
    #[case(u32::MAX, 60)]
    fn backoff_doubles_until_the_ceiling(#[case] failures: u32, #[case] secs: u64) {
        let policy = RequeuePolicy::default();
        assert_eq!(policy.next_delay(failures), Duration::from_secs(secs));
    }

    #[test]
    fn built_from_config() {
        let policy = RequeuePolicy::from(&RequeueConfig {
            base_delay_ms: 250,
            multiplier: 3.0,
            max_delay_secs: 5,
        });
        assert_eq!(policy.next_delay(1), Duration::from_millis(250));
        assert_eq!(policy.next_delay(2), Duration::from_millis(750));
        assert_eq!(policy.next_delay(4), Duration::from_secs(5));
    }
}
