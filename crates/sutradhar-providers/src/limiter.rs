use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Per-provider throughput limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimits {
    pub requests_per_minute: u32,
    pub tokens_per_minute: u32,
    pub max_concurrent: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            tokens_per_minute: 120_000,
            max_concurrent: 4,
        }
    }
}

struct Buckets {
    requests: f64,
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter gating concurrent stream starts.
///
/// Two buckets (requests and tokens) refill continuously; a semaphore
/// bounds in-flight streams. `acquire` suspends until all three gates open.
pub struct RateLimiter {
    limits: RateLimits,
    buckets: Mutex<Buckets>,
    concurrency: Arc<Semaphore>,
}

/// Held for the lifetime of one stream; dropping it frees a concurrency slot.
pub struct RatePermit {
    _permit: OwnedSemaphorePermit,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            buckets: Mutex::new(Buckets {
                requests: limits.requests_per_minute as f64,
                tokens: limits.tokens_per_minute as f64,
                last_refill: Instant::now(),
            }),
            concurrency: Arc::new(Semaphore::new(limits.max_concurrent.max(1) as usize)),
        }
    }

    /// Wait until a request slot and `estimated_tokens` of token budget are
    /// available, then reserve them.
    pub async fn acquire(&self, estimated_tokens: u64) -> RatePermit {
        let permit = self
            .concurrency
            .clone()
            .acquire_owned()
            .await
            .expect("limiter semaphore never closes");

        loop {
            let wait = {
                let mut buckets = self.buckets.lock().unwrap();
                self.refill(&mut buckets);

                let needed_tokens = (estimated_tokens as f64).min(self.limits.tokens_per_minute as f64);
                if buckets.requests >= 1.0 && buckets.tokens >= needed_tokens {
                    buckets.requests -= 1.0;
                    buckets.tokens -= needed_tokens;
                    None
                } else {
                    let request_wait = if buckets.requests >= 1.0 {
                        0.0
                    } else {
                        (1.0 - buckets.requests) * 60.0 / self.limits.requests_per_minute as f64
                    };
                    let token_wait = if buckets.tokens >= needed_tokens {
                        0.0
                    } else {
                        (needed_tokens - buckets.tokens) * 60.0
                            / self.limits.tokens_per_minute as f64
                    };
                    Some(Duration::from_secs_f64(request_wait.max(token_wait).max(0.01)))
                }
            };

            match wait {
                None => return RatePermit { _permit: permit },
                Some(duration) => tokio::time::sleep(duration).await,
            }
        }
    }

    fn refill(&self, buckets: &mut Buckets) {
        let elapsed = buckets.last_refill.elapsed().as_secs_f64();
        buckets.last_refill = Instant::now();
        buckets.requests = (buckets.requests
            + elapsed * self.limits.requests_per_minute as f64 / 60.0)
            .min(self.limits.requests_per_minute as f64);
        buckets.tokens = (buckets.tokens + elapsed * self.limits.tokens_per_minute as f64 / 60.0)
            .min(self.limits.tokens_per_minute as f64);
    }

    pub fn available_concurrency(&self) -> usize {
        self.concurrency.available_permits()
    }
}
