//! Token-bucket rate limiter.
//!
//! Quota accrues continuously at `rate` units per second up to `max_quota`
//! (twice the rate by default, one second of burst headroom on top of the
//! steady state).

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Throttle {
    rate: f64,
    max_quota: f64,
    quota: f64,
    last_fill: Instant,
}

impl Throttle {
    /// Bucket refilling at `rate` units/second with `max_quota = 2·rate`.
    #[must_use]
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            max_quota: 2.0 * rate,
            quota: 0.0,
            last_fill: Instant::now(),
        }
    }

    pub fn set_rate(&mut self, rate: f64) {
        self.refill();
        self.rate = rate;
    }

    pub fn set_max_quota(&mut self, max_quota: f64) {
        self.max_quota = max_quota;
        self.quota = self.quota.min(max_quota);
    }

    #[must_use]
    pub fn rate(&self) -> f64 {
        self.rate
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_fill);
        self.last_fill = now;
        self.quota = (self.quota + elapsed.as_secs_f64() * self.rate).min(self.max_quota);
    }

    /// Whether `amount` units are available right now.
    pub fn has_quota(&mut self, amount: usize) -> bool {
        self.refill();
        self.quota >= amount as f64
    }

    /// Consume `amount` units; the balance may go negative, which simply
    /// pushes the next availability further out.
    pub fn use_quota(&mut self, amount: usize) {
        self.refill();
        self.quota -= amount as f64;
    }

    /// Currently available whole units.
    pub fn quota(&mut self) -> u64 {
        self.refill();
        self.quota.max(0.0) as u64
    }

    /// How long until `amount` units will be available.
    pub fn estimate_wait(&mut self, amount: usize) -> Duration {
        self.refill();
        let missing = amount as f64 - self.quota;
        if missing <= 0.0 || self.rate <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(missing / self.rate)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_accrues_over_time() {
        let mut t = Throttle::new(1000.0);
        assert!(!t.has_quota(100));
        std::thread::sleep(Duration::from_millis(150));
        assert!(t.has_quota(100));
    }

    #[test]
    fn use_quota_consumes() {
        let mut t = Throttle::new(1000.0);
        std::thread::sleep(Duration::from_millis(120));
        assert!(t.has_quota(100));
        t.use_quota(100);
        assert!(!t.has_quota(100));
    }

    #[test]
    fn quota_caps_at_max() {
        let mut t = Throttle::new(100.0);
        std::thread::sleep(Duration::from_millis(50));
        // Far longer than needed to reach 2·rate.
        t.quota();
        std::thread::sleep(Duration::from_millis(50));
        assert!(t.quota() <= 200);
    }

    #[test]
    fn estimate_wait_scales_with_deficit() {
        let mut t = Throttle::new(1000.0);
        let wait = t.estimate_wait(500);
        // ~500 ms at 1000 units/s from an empty bucket.
        assert!(wait > Duration::from_millis(300));
        assert!(wait < Duration::from_millis(700));
        assert_eq!(t.estimate_wait(0), Duration::ZERO);
    }
}
