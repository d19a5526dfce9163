//! Token-bucket rate limiter for outbound agent traffic.
//!
//! Tokens refill continuously at `rate` per second up to a `burst` cap; each
//! send consumes one or more tokens. The non-blocking path answers
//! immediately, the blocking path retries with short sleeps until a deadline
//! and then reports failure so callers can drop and count the message
//! instead of queueing forever.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// Pause between retries while waiting for tokens.
const RETRY_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Thread-safe token bucket.
#[derive(Clone)]
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    state: Arc<Mutex<BucketState>>,
}

impl RateLimiter {
    /// Creates a bucket refilling at `rate` tokens/second with capacity
    /// `burst`. The bucket starts full. Non-positive parameters are clamped
    /// to usable minimums.
    pub fn new(rate: f64, burst: u32) -> Self {
        let rate = if rate > 0.0 { rate } else { 0.1 };
        let burst = f64::from(burst.max(1));
        Self {
            rate,
            burst,
            state: Arc::new(Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            })),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        if !elapsed.is_zero() {
            state.tokens = (state.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
            state.last_refill = now;
        }
    }

    /// Attempts to take `tokens` tokens without waiting. Refill and deduction
    /// happen atomically under the bucket lock.
    pub fn try_acquire(&self, tokens: u32) -> bool {
        let needed = f64::from(tokens);
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= needed {
            state.tokens -= needed;
            true
        } else {
            false
        }
    }

    /// Takes `tokens` tokens, sleeping in short intervals until they are
    /// available or `timeout` elapses. Returns `false` on timeout.
    pub async fn acquire(&self, tokens: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_acquire(tokens) {
                return true;
            }
            if Instant::now() >= deadline {
                trace!(tokens, "rate limiter acquire timed out");
                return false;
            }
            tokio::time::sleep(RETRY_INTERVAL.min(deadline - Instant::now())).await;
        }
    }

    /// Current token count after refill; for stats reporting.
    pub fn tokens(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> f64 {
        self.burst
    }
}
