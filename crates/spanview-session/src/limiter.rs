use std::time::Instant;

/// Simple token-bucket rate limiter.
pub struct RateLimiter {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self { tokens: max_tokens, max_tokens, refill_rate, last_refill: Instant::now() }
    }

    /// Limiter for outbound key-frame requests: at most one per 500 ms.
    pub fn key_frame_requests() -> Self {
        Self::new(1.0, 2.0)
    }

    /// Try to consume one token. Returns true if allowed, false if
    /// rate-limited.
    pub fn try_consume(&mut self) -> bool {
        self.try_consume_at(Instant::now())
    }

    fn try_consume_at(&mut self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn burst_then_refill() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(2.0, 1.0);
        assert!(limiter.try_consume_at(start));
        assert!(limiter.try_consume_at(start));
        assert!(!limiter.try_consume_at(start));

        // One token back after a second.
        assert!(limiter.try_consume_at(start + Duration::from_secs(1)));
        assert!(!limiter.try_consume_at(start + Duration::from_secs(1)));
    }

    #[test]
    fn key_frame_requests_spacing() {
        let start = Instant::now();
        let mut limiter = RateLimiter::key_frame_requests();
        assert!(limiter.try_consume_at(start));
        assert!(!limiter.try_consume_at(start + Duration::from_millis(100)));
        assert!(!limiter.try_consume_at(start + Duration::from_millis(400)));
        // 500 ms after the first request a new one is allowed.
        assert!(limiter.try_consume_at(start + Duration::from_millis(600)));
    }

    #[test]
    fn tokens_do_not_accumulate_past_max() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(1.0, 2.0);
        assert!(limiter.try_consume_at(start));
        // Long idle period still yields a single token.
        let later = start + Duration::from_secs(60);
        assert!(limiter.try_consume_at(later));
        assert!(!limiter.try_consume_at(later));
    }
}
