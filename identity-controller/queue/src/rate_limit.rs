use ahash::AHashMap as HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Decides how long a failed key waits before it is retried.
///
/// The delay is the larger of a per-key exponential backoff and the delay
/// imposed by a token bucket shared by all keys, so that a burst of failures
/// cannot turn into a burst of retries.
#[derive(Debug)]
pub struct RateLimiter {
    backoff: ItemBackoff,
    bucket: Option<Bucket>,
}

#[derive(Debug)]
struct ItemBackoff {
    base: Duration,
    max: Duration,
    failures: HashMap<String, u32>,
}

#[derive(Debug)]
struct Bucket {
    qps: f64,
    burst: f64,
    tokens: f64,
    last: Option<Instant>,
}

// === impl RateLimiter ===

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000)).with_bucket(10.0, 100)
    }
}

impl RateLimiter {
    /// A per-key exponential backoff without an overall bucket.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            backoff: ItemBackoff {
                base,
                max,
                failures: HashMap::new(),
            },
            bucket: None,
        }
    }

    pub fn with_bucket(mut self, qps: f64, burst: u32) -> Self {
        self.bucket = Some(Bucket {
            qps,
            burst: burst as f64,
            tokens: burst as f64,
            last: None,
        });
        self
    }

    /// Records a failure for `key` and returns how long it should wait.
    pub fn when(&mut self, key: &str) -> Duration {
        let backoff = self.backoff.when(key);
        match self.bucket.as_mut() {
            Some(bucket) => backoff.max(bucket.reserve(Instant::now())),
            None => backoff,
        }
    }

    /// Clears the failure history of `key`.
    pub fn forget(&mut self, key: &str) {
        self.backoff.failures.remove(key);
    }

    /// The number of consecutive failures recorded for `key`.
    pub fn failures(&self, key: &str) -> u32 {
        self.backoff.failures.get(key).copied().unwrap_or(0)
    }
}

impl ItemBackoff {
    fn when(&mut self, key: &str) -> Duration {
        let failures = self.failures.entry(key.to_string()).or_default();
        let exp = *failures;
        *failures = failures.saturating_add(1);

        let secs = self.base.as_secs_f64() * 2f64.powi(exp.min(i32::MAX as u32) as i32);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }
}

impl Bucket {
    fn reserve(&mut self, now: Instant) -> Duration {
        if let Some(last) = self.last {
            let elapsed = now.saturating_duration_since(last).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.qps).min(self.burst);
        }
        self.last = Some(now);

        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(-self.tokens / self.qps)
    }
}
