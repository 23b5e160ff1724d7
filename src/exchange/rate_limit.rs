// =============================================================================
// Rate limiting — token bucket protecting the exchange's request budget
// =============================================================================
//
// Every outbound request acquires from the bucket before hitting the wire.
// A 429 with a server-specified Retry-After pushes a penalty window during
// which no tokens are handed out, regardless of refill.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    /// No tokens are granted before this instant (server Retry-After).
    penalty_until: Option<Instant>,
}

/// Async token bucket.  `capacity` tokens, refilled continuously at
/// `refill_per_sec`.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
                penalty_until: None,
            }),
        }
    }

    /// Wait until `cost` tokens are available, then spend them.
    pub async fn acquire(&self, cost: u32) {
        let cost = (cost as f64).min(self.capacity);
        loop {
            let wait = {
                let mut s = self.state.lock();
                let now = Instant::now();

                // A server-imposed penalty window overrides refill entirely.
                if let Some(until) = s.penalty_until {
                    if now < until {
                        until - now
                    } else {
                        s.penalty_until = None;
                        Duration::ZERO
                    }
                } else {
                    Duration::ZERO
                }
            };

            if wait > Duration::ZERO {
                debug!(wait_ms = wait.as_millis() as u64, "rate limit: penalty window");
                tokio::time::sleep(wait).await;
                continue;
            }

            let wait = {
                let mut s = self.state.lock();
                let now = Instant::now();

                // Continuous refill since the last acquire.
                let elapsed = now.duration_since(s.last_refill).as_secs_f64();
                s.tokens = (s.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                s.last_refill = now;

                if s.tokens >= cost {
                    s.tokens -= cost;
                    return;
                }
                let deficit = cost - s.tokens;
                Duration::from_secs_f64(deficit / self.refill_per_sec)
            };

            debug!(wait_ms = wait.as_millis() as u64, "rate limit: waiting for tokens");
            tokio::time::sleep(wait).await;
        }
    }

    /// Honour a server-specified Retry-After window.
    pub fn apply_retry_after(&self, retry_after: Duration) {
        let mut s = self.state.lock();
        let until = Instant::now() + retry_after;
        let extended = match s.penalty_until {
            Some(existing) => existing.max(until),
            None => until,
        };
        s.penalty_until = Some(extended);
        warn!(
            retry_after_ms = retry_after.as_millis() as u64,
            "rate limit: server requested backoff"
        );
    }

    /// Tokens currently available (diagnostic).
    pub fn available(&self) -> f64 {
        let mut s = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(s.last_refill).as_secs_f64();
        s.tokens = (s.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        s.last_refill = now;
        s.tokens
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("refill_per_sec", &self.refill_per_sec)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_up_to_capacity_is_immediate() {
        let bucket = TokenBucket::new(5, 100.0);
        let start = Instant::now();
        for _ in 0..5 {
            bucket.acquire(1).await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn exhausted_bucket_waits_for_refill() {
        let bucket = TokenBucket::new(2, 20.0);
        bucket.acquire(2).await;
        let start = Instant::now();
        bucket.acquire(1).await;
        // One token at 20/sec takes ~50ms.
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn retry_after_blocks_even_with_tokens() {
        let bucket = TokenBucket::new(10, 10.0);
        bucket.apply_retry_after(Duration::from_millis(80));
        let start = Instant::now();
        bucket.acquire(1).await;
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn available_reports_refill() {
        let bucket = TokenBucket::new(10, 1000.0);
        assert!(bucket.available() >= 9.9);
    }
}
