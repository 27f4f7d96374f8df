use chrono::{DateTime, Duration, Utc};

pub const SEND_INTERVAL_MS: i64 = 2000;

/// Fixed-window send throttle for one viewer session. Advisory only, the
/// server keeps its own limit.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    interval: Duration,
    last_accepted: Option<DateTime<Utc>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Duration::milliseconds(SEND_INTERVAL_MS))
    }
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_accepted: None,
        }
    }

    /// Records `now` and returns true when the attempt is outside the window.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> bool {
        if !self.would_accept(now) {
            return false;
        }
        self.last_accepted = Some(now);
        true
    }

    fn would_accept(&self, now: DateTime<Utc>) -> bool {
        match self.last_accepted {
            Some(last) => now.signed_duration_since(last) >= self.interval,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_within_window() {
        let mut limiter = RateLimiter::default();
        let start = Utc::now();

        assert!(limiter.try_acquire(start));
        assert!(!limiter.try_acquire(start + Duration::milliseconds(500)));
        assert!(!limiter.try_acquire(start + Duration::milliseconds(1999)));
        assert!(limiter.try_acquire(start + Duration::milliseconds(2000)));
    }

    #[test]
    fn test_rejected_attempt_does_not_extend_window() {
        let mut limiter = RateLimiter::default();
        let start = Utc::now();

        assert!(limiter.try_acquire(start));
        assert!(!limiter.try_acquire(start + Duration::milliseconds(1500)));
        assert!(!limiter.try_acquire(start + Duration::milliseconds(1999)));
        assert!(limiter.try_acquire(start + Duration::milliseconds(2100)));
    }
}
