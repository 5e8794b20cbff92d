use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{trace, warn};

use crate::config::{BucketSection, DiscoveryConfig, RateSection};

/// Continuous-refill token bucket. Tokens accrue fractionally with elapsed
/// time, capped at capacity, so bursts up to `capacity` are allowed while the
/// long-run average never exceeds `fill_rate` per second.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    fill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, fill_rate: f64, now: Instant) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            tokens: capacity,
            fill_rate: fill_rate.max(1e-9),
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.fill_rate).min(self.capacity);
    }

    /// Ok on success; Err carries the wait until one token will be available.
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - self.tokens) / self.fill_rate))
        }
    }
}

/// Per-provider request cadence control. One instance is shared by every
/// worker in a discovery run; buckets serialize internally, callers never
/// hold their own lock. `acquire` never fails, it only delays.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Arc<Mutex<TokenBucket>>>>,
    default_capacity: u32,
    default_fill_rate: f64,
    overrides: HashMap<String, BucketSection>,
    warn_after: Duration,
}

impl RateLimiter {
    pub fn new(rate: &RateSection, overrides: HashMap<String, BucketSection>) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            default_capacity: rate.default_capacity,
            default_fill_rate: rate.default_per_second,
            overrides,
            warn_after: Duration::from_millis(rate.slow_acquire_warn_ms),
        }
    }

    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self::new(&config.rate, config.providers.limits.clone())
    }

    async fn bucket(&self, key: &str) -> Arc<Mutex<TokenBucket>> {
        let mut buckets = self.buckets.lock().await;
        if let Some(bucket) = buckets.get(key) {
            return Arc::clone(bucket);
        }
        let (capacity, fill_rate) = match self.overrides.get(key) {
            Some(section) => (section.capacity, section.per_second),
            None => (self.default_capacity, self.default_fill_rate),
        };
        let bucket = Arc::new(Mutex::new(TokenBucket::new(
            capacity,
            fill_rate,
            Instant::now(),
        )));
        buckets.insert(key.to_string(), Arc::clone(&bucket));
        bucket
    }

    /// Blocks the calling worker until the provider's bucket yields a token.
    /// Returns the total time spent waiting.
    pub async fn acquire(&self, key: &str) -> Duration {
        let bucket = self.bucket(key).await;
        let start = Instant::now();
        let mut warned = false;
        loop {
            let outcome = {
                let mut guard = bucket.lock().await;
                guard.try_take(Instant::now())
            };
            match outcome {
                Ok(()) => {
                    let waited = start.elapsed();
                    trace!(provider = key, waited_ms = waited.as_millis() as u64, "token acquired");
                    return waited;
                }
                Err(wait) => {
                    if !warned && start.elapsed() + wait >= self.warn_after {
                        warn!(
                            provider = key,
                            expected_wait_ms = (start.elapsed() + wait).as_millis() as u64,
                            "sustained throttling on provider"
                        );
                        warned = true;
                    }
                    sleep(wait).await;
                }
            }
        }
    }

    /// Non-blocking variant; true when a token was consumed.
    pub async fn try_acquire(&self, key: &str) -> bool {
        let bucket = self.bucket(key).await;
        let mut guard = bucket.lock().await;
        guard.try_take(Instant::now()).is_ok()
    }
}
