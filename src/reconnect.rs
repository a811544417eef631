//! Reconnect backoff policy.
//!
//! Delay for attempt `n` (1-based) is `base × 1.5^(n−1)`. The exponent is not
//! capped; the number of attempts is.

use std::time::Duration;

const GROWTH: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub base_interval: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base_interval: Duration, max_attempts: u32) -> Self {
        Self {
            base_interval,
            max_attempts,
        }
    }

    /// Delay before attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        self.base_interval.mul_f64(GROWTH.powi(exponent))
    }

    /// Next attempt number and its delay, or `None` once `attempts_so_far`
    /// has reached the cap.
    pub fn next(&self, attempts_so_far: u32) -> Option<(u32, Duration)> {
        if attempts_so_far >= self.max_attempts {
            return None;
        }
        let attempt = attempts_so_far + 1;
        Some((attempt, self.delay(attempt)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_by_half() {
        let p = ReconnectPolicy::new(Duration::from_millis(1000), 10);
        let delays: Vec<u128> = (1..=4).map(|n| p.delay(n).as_millis()).collect();
        assert_eq!(delays, vec![1000, 1500, 2250, 3375]);
    }

    #[test]
    fn stops_at_cap() {
        let p = ReconnectPolicy::new(Duration::from_millis(1000), 3);
        assert_eq!(p.next(0), Some((1, Duration::from_millis(1000))));
        assert_eq!(p.next(2), Some((3, Duration::from_millis(2250))));
        assert_eq!(p.next(3), None);
        assert_eq!(p.next(7), None);
    }

    #[test]
    fn zero_attempts_never_retries() {
        let p = ReconnectPolicy::new(Duration::from_secs(5), 0);
        assert_eq!(p.next(0), None);
    }
}
