//! Reconnect delay policy.

use std::time::Duration;

use crate::config::MonitorSection;

/// Exponential backoff: `base * multiplier^(n-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn from_config(section: &MonitorSection) -> Self {
        Self {
            base: Duration::from_millis(section.base_delay_ms),
            multiplier: section.multiplier,
            max: Duration::from_millis(section.max_delay_ms),
        }
    }

    /// Delay before reconnect attempt `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let multiplier = if self.multiplier.is_finite() && self.multiplier >= 1.0 {
            self.multiplier
        } else {
            1.0
        };
        let exponent = retry.saturating_sub(1).min(63) as i32;
        let millis = self.base.as_millis() as f64 * multiplier.powi(exponent);
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64).min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&MonitorSection::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sequence() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u64> = (1..=6).map(|n| policy.delay(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn test_monotonic_and_capped() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(300),
            multiplier: 3.0,
            max: Duration::from_secs(5),
        };
        let mut previous = Duration::ZERO;
        for n in 1..100 {
            let delay = policy.delay(n);
            assert!(delay >= previous);
            assert!(delay <= policy.max);
            previous = delay;
        }
    }

    #[test]
    fn test_shrinking_multiplier_is_flat() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(500),
            multiplier: 0.5,
            max: Duration::from_secs(5),
        };
        assert_eq!(policy.delay(4), Duration::from_millis(500));
    }
}
