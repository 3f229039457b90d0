//! Exponential retry delays, shared by the scheduler and informer relists.

use std::time::Duration;

/// Exponential backoff: attempt `n` (0-indexed) waits `first × factor^n`, capped at `max`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { first: Duration::from_millis(100), max: Duration::from_secs(60), factor: 2.0 }
    }
}

impl BackoffPolicy {
    pub fn next(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay after the `failures`-th consecutive failure (1-based).
    pub fn after_failures(&self, failures: u32) -> Duration { self.next(failures.saturating_sub(1)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_then_caps() {
        let p = BackoffPolicy { first: Duration::from_millis(10), max: Duration::from_millis(50), factor: 2.0 };
        assert_eq!(p.next(0), Duration::from_millis(10));
        assert_eq!(p.next(1), Duration::from_millis(20));
        assert_eq!(p.next(2), Duration::from_millis(40));
        assert_eq!(p.next(3), Duration::from_millis(50));
        assert_eq!(p.next(u32::MAX), Duration::from_millis(50));
        assert_eq!(p.after_failures(1), Duration::from_millis(10));
        assert_eq!(p.after_failures(0), Duration::from_millis(10));
    }

    #[test]
    fn unit_factor_is_constant() {
        let p = BackoffPolicy { factor: 1.0, ..Default::default() };
        assert_eq!(p.next(7), p.first);
    }
}
