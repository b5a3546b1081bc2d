//! Sliding-window rate limiter.
//!
//! Each connection owns one limiter. A call is admitted when fewer than
//! `capacity` calls were admitted during the trailing `window`.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Rate limit configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Admissions allowed per window.
    pub capacity: usize,
    /// Length of the sliding window.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            window: Duration::from_secs(60),
        }
    }
}

/// Sliding-window rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    admitted: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            admitted: Mutex::new(VecDeque::with_capacity(config.capacity)),
        }
    }

    /// Try to admit one call now.
    pub fn check(&self) -> bool {
        self.check_at(Instant::now())
    }

    /// Try to admit one call at the given instant.
    pub fn check_at(&self, now: Instant) -> bool {
        let mut admitted = self.admitted.lock();
        Self::prune(&mut admitted, now, self.config.window);

        if admitted.len() < self.config.capacity {
            admitted.push_back(now);
            true
        } else {
            false
        }
    }

    /// Admissions still available in the current window.
    #[must_use]
    pub fn remaining(&self) -> usize {
        let mut admitted = self.admitted.lock();
        Self::prune(&mut admitted, Instant::now(), self.config.window);
        self.config.capacity.saturating_sub(admitted.len())
    }

    #[must_use]
    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    fn prune(admitted: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(&oldest) = admitted.front() {
            if now.saturating_duration_since(oldest) >= window {
                admitted.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: usize, window_secs: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            capacity,
            window: Duration::from_secs(window_secs),
        })
    }

    #[test]
    fn test_admits_up_to_capacity() {
        let limiter = limiter(10, 60);
        let start = Instant::now();

        for i in 0..10 {
            assert!(limiter.check_at(start + Duration::from_secs(i)));
        }
        assert!(!limiter.check_at(start + Duration::from_secs(10)));
    }

    #[test]
    fn test_resumes_after_window() {
        let limiter = limiter(3, 60);
        let start = Instant::now();

        for _ in 0..3 {
            assert!(limiter.check_at(start));
        }
        assert!(!limiter.check_at(start + Duration::from_secs(59)));
        assert!(limiter.check_at(start + Duration::from_secs(60)));
    }

    #[test]
    fn test_window_slides() {
        let limiter = limiter(2, 10);
        let start = Instant::now();

        assert!(limiter.check_at(start));
        assert!(limiter.check_at(start + Duration::from_secs(5)));
        assert!(!limiter.check_at(start + Duration::from_secs(9)));
        // Only the first admission has left the window
        assert!(limiter.check_at(start + Duration::from_secs(10)));
        assert!(!limiter.check_at(start + Duration::from_secs(11)));
        assert!(limiter.check_at(start + Duration::from_secs(15)));
    }

    #[test]
    fn test_rejections_are_not_recorded() {
        let limiter = limiter(1, 10);
        let start = Instant::now();

        assert!(limiter.check_at(start));
        for i in 1..10 {
            assert!(!limiter.check_at(start + Duration::from_secs(i)));
        }
        assert!(limiter.check_at(start + Duration::from_secs(10)));
    }

    #[test]
    fn test_zero_capacity_rejects_everything() {
        let limiter = limiter(0, 10);
        assert!(!limiter.check());
        assert_eq!(limiter.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining() {
        let limiter = limiter(3, 60);
        assert_eq!(limiter.remaining(), 3);
        assert!(limiter.check());
        assert_eq!(limiter.remaining(), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(limiter.remaining(), 3);
    }
}
