//! Request pacing for the remote catalog API
//!
//! Combines a concurrency semaphore with a token bucket so a run never
//! exceeds the profile's worker count or its requests-per-second budget,
//! whichever binds first. One limiter is shared by all workers of a run.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

/// Token bucket refilled continuously at the configured rate.
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(tokens_per_second: u32) -> Self {
        let rate = f64::from(tokens_per_second.max(1));
        Self {
            tokens: rate,
            max_tokens: rate,
            refill_rate: rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    /// Take one token, or report how long until one is available.
    fn try_acquire(&mut self) -> Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let wait_secs = (1.0 - self.tokens) / self.refill_rate;
            Err(Duration::from_secs_f64(wait_secs))
        }
    }
}

/// Shared pacing gate for one sync run.
pub struct RateLimiter {
    semaphore: Arc<Semaphore>,
    tokens: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub fn new(max_concurrent: usize, requests_per_second: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tokens: Mutex::new(TokenBucket::new(requests_per_second)),
        }
    }

    /// Wait for a concurrency slot and a rate token. The returned guard
    /// frees the slot when dropped; the token is consumed.
    pub async fn acquire(&self) -> RateLimitGuard {
        // The semaphore is never closed while the limiter is alive
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .unwrap_or_else(|_| unreachable!("limiter semaphore closed"));

        loop {
            let wait = { self.tokens.lock().await.try_acquire().err() };
            match wait {
                None => return RateLimitGuard { _permit: permit },
                Some(delay) => {
                    log::debug!("Rate limited, waiting {}ms", delay.as_millis());
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Releases the concurrency slot on drop.
pub struct RateLimitGuard {
    _permit: OwnedSemaphorePermit,
}
