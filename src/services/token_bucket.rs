use std::time::Instant;

/// Token bucket rate limiter for per-connection rate limiting.
pub struct TokenBucket {
    tokens: u32,
    capacity: u32,
    refill_per_sec: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    pub fn allow(&mut self) -> bool {
        let elapsed = self.last_refill.elapsed().as_secs();
        if elapsed > 0 {
            let add = (elapsed as u32) * self.refill_per_sec;
            self.tokens = self.tokens.saturating_add(add).min(self.capacity);
            self.last_refill = Instant::now();
        }
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_capacity_then_blocks() {
        let mut bucket = TokenBucket::new(3, 1);
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(!bucket.allow());
    }

    #[test]
    fn refills_over_time() {
        let mut bucket = TokenBucket::new(1, 100);
        assert!(bucket.allow());
        assert!(!bucket.allow());
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(bucket.allow());
    }
}
