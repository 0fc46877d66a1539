// src/limiter.rs

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Token-bucket rate limiter shared by every fetcher of a transfer.
///
/// A rate of 0 disables limiting entirely.
#[derive(Clone)]
pub struct SpeedLimiter {
    state: Arc<Mutex<TokenBucket>>,
}

struct TokenBucket {
    /// Maximum tokens the bucket holds; bounds burstiness.
    capacity: u64,
    tokens: u64,
    /// Refill rate in bytes per second.
    rate: u64,
    last_refill: Instant,
}

impl SpeedLimiter {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        let capacity = if rate_bytes_per_sec == 0 {
            u64::MAX
        } else {
            rate_bytes_per_sec
        };
        Self {
            state: Arc::new(Mutex::new(TokenBucket {
                capacity,
                tokens: capacity,
                rate: rate_bytes_per_sec,
                last_refill: Instant::now(),
            })),
        }
    }

    /// Takes `amount` tokens, sleeping until enough have accumulated.
    ///
    /// Requests larger than the bucket capacity are clamped to it, so a
    /// single oversized network read cannot stall forever.
    pub async fn take(&self, amount: u64) {
        if amount == 0 {
            return;
        }
        loop {
            let wait = {
                let mut bucket = self.state.lock().await;
                if bucket.rate == 0 {
                    return;
                }
                let amount = amount.min(bucket.capacity);
                bucket.refill();
                if bucket.tokens >= amount {
                    bucket.tokens -= amount;
                    return;
                }
                let needed = amount - bucket.tokens;
                Duration::from_secs_f64(needed as f64 / bucket.rate as f64)
            };
            // The lock must be released while sleeping.
            tokio::time::sleep(wait).await;
        }
    }
}

impl TokenBucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        let new_tokens = (elapsed.as_secs_f64() * self.rate as f64) as u64;
        if new_tokens > 0 {
            self.tokens = (self.tokens + new_tokens).min(self.capacity);
            self.last_refill = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn unlimited_rate_never_waits() {
        let limiter = SpeedLimiter::new(0);
        let before = Instant::now();
        limiter.take(10_000_000).await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn drains_then_waits_for_refill() {
        let limiter = SpeedLimiter::new(1000);
        let before = Instant::now();
        limiter.take(1000).await;
        assert_eq!(before.elapsed(), Duration::ZERO);

        // Bucket is empty now; the next take must wait for the refill.
        limiter.take(500).await;
        assert!(before.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_take_is_clamped_to_capacity() {
        let limiter = SpeedLimiter::new(100);
        // Larger than capacity; must not hang.
        limiter.take(1_000_000).await;
    }
}
