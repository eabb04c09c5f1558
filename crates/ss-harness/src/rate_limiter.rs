use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors from the rate-limit governor.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// The bucket for this endpoint has insufficient tokens right now.
    #[error("rate limit exceeded for endpoint `{endpoint}` – retry after {retry_after:?}")]
    Exceeded {
        endpoint: String,
        retry_after: Duration,
    },

    /// The requested cost can never fit in the bucket.
    #[error("cost {cost} exceeds bucket capacity {capacity} for endpoint `{endpoint}`")]
    CostExceedsCapacity {
        endpoint: String,
        cost: f64,
        capacity: f64,
    },
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Tokens added per second.
    pub tokens_per_second: f64,
    /// Maximum burst size (bucket capacity).
    pub max_burst: f64,
}

impl RateLimitConfig {
    /// Allow `count` requests per second.
    pub fn per_second(count: u64) -> Self {
        Self {
            tokens_per_second: count as f64,
            max_burst: count as f64,
        }
    }

    /// Allow `count` requests per minute.
    pub fn per_minute(count: u64) -> Self {
        Self {
            tokens_per_second: count as f64 / 60.0,
            max_burst: count as f64,
        }
    }

    /// Allow `count` requests per hour.
    pub fn per_hour(count: u64) -> Self {
        Self {
            tokens_per_second: count as f64 / 3600.0,
            max_burst: count as f64,
        }
    }

    /// Override the max burst capacity.
    pub fn with_burst(mut self, burst: u64) -> Self {
        self.max_burst = burst as f64;
        self
    }
}

// ---------------------------------------------------------------------------
// Bucket (per-endpoint state)
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct TokenBucket {
    config: RateLimitConfig,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            tokens: config.max_burst,
            config,
            last_refill: Instant::now(),
        }
    }

    /// Refill tokens based on elapsed time, capped at capacity.
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens =
            (self.tokens + elapsed * self.config.tokens_per_second).min(self.config.max_burst);
        self.last_refill = now;
    }

    /// Try to consume `cost` tokens. Returns `Ok(())` or the wait duration.
    fn try_consume(&mut self, cost: f64) -> Result<(), Duration> {
        self.refill();
        if self.tokens >= cost {
            self.tokens -= cost;
            Ok(())
        } else {
            let deficit = cost - self.tokens;
            Err(Duration::from_secs_f64(
                deficit / self.config.tokens_per_second,
            ))
        }
    }
}

// ---------------------------------------------------------------------------
// RateGovernor
// ---------------------------------------------------------------------------

/// Observability view of one endpoint's bucket.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BucketSnapshot {
    pub endpoint: String,
    pub remaining: f64,
    pub capacity: f64,
}

/// Per-endpoint token-bucket governor gating all outbound calls.
///
/// Buckets are cooperative, not authoritative: they reset on restart and
/// exist to stay comfortably inside the provider-enforced limits.
#[derive(Debug)]
pub struct RateGovernor {
    buckets: DashMap<String, TokenBucket>,
    default_config: RateLimitConfig,
}

impl RateGovernor {
    pub fn new(default_config: RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            default_config,
        }
    }

    /// Register an endpoint with its own budget. Unregistered endpoints
    /// fall back to the default config on first use.
    pub fn register(&self, endpoint: &str, config: RateLimitConfig) {
        self.buckets
            .insert(endpoint.to_string(), TokenBucket::new(config));
    }

    /// Consume `cost` tokens or fail immediately.
    pub fn try_acquire(&self, endpoint: &str, cost: f64) -> Result<(), RateLimitError> {
        let mut bucket = self
            .buckets
            .entry(endpoint.to_string())
            .or_insert_with(|| TokenBucket::new(self.default_config.clone()));

        if cost > bucket.config.max_burst {
            return Err(RateLimitError::CostExceedsCapacity {
                endpoint: endpoint.to_string(),
                cost,
                capacity: bucket.config.max_burst,
            });
        }

        match bucket.try_consume(cost) {
            Ok(()) => Ok(()),
            Err(retry_after) => {
                warn!(endpoint, ?retry_after, "rate limit exceeded");
                Err(RateLimitError::Exceeded {
                    endpoint: endpoint.to_string(),
                    retry_after,
                })
            }
        }
    }

    /// Consume `cost` tokens, cooperatively waiting for refill when the
    /// bucket is empty. Only fails when the cost can never fit.
    pub async fn acquire(&self, endpoint: &str, cost: f64) -> Result<(), RateLimitError> {
        loop {
            match self.try_acquire(endpoint, cost) {
                Ok(()) => return Ok(()),
                Err(RateLimitError::Exceeded { retry_after, .. }) => {
                    tokio::time::sleep(retry_after.max(Duration::from_millis(10))).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Approximate remaining tokens per endpoint.
    pub fn snapshot(&self) -> Vec<BucketSnapshot> {
        let mut out: Vec<BucketSnapshot> = self
            .buckets
            .iter()
            .map(|entry| {
                let bucket = entry.value();
                let elapsed = bucket.last_refill.elapsed().as_secs_f64();
                let remaining = (bucket.tokens + elapsed * bucket.config.tokens_per_second)
                    .min(bucket.config.max_burst);
                BucketSnapshot {
                    endpoint: entry.key().clone(),
                    remaining,
                    capacity: bucket.config.max_burst,
                }
            })
            .collect();
        out.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_then_exhaustion() {
        let governor = RateGovernor::new(RateLimitConfig::per_second(3));
        assert!(governor.try_acquire("search", 1.0).is_ok());
        assert!(governor.try_acquire("search", 1.0).is_ok());
        assert!(governor.try_acquire("search", 1.0).is_ok());
        let err = governor.try_acquire("search", 1.0).unwrap_err();
        assert!(matches!(err, RateLimitError::Exceeded { .. }));
    }

    #[tokio::test]
    async fn endpoints_have_independent_buckets() {
        let governor = RateGovernor::new(RateLimitConfig::per_second(1));
        assert!(governor.try_acquire("search", 1.0).is_ok());
        assert!(governor.try_acquire("search", 1.0).is_err());
        assert!(governor.try_acquire("repos", 1.0).is_ok());
    }

    #[tokio::test]
    async fn registered_config_overrides_default() {
        let governor = RateGovernor::new(RateLimitConfig::per_second(1));
        governor.register("llm", RateLimitConfig::per_minute(60).with_burst(5));
        for _ in 0..5 {
            assert!(governor.try_acquire("llm", 1.0).is_ok());
        }
        assert!(governor.try_acquire("llm", 1.0).is_err());
    }

    #[tokio::test]
    async fn impossible_cost_fails_fast() {
        let governor = RateGovernor::new(RateLimitConfig::per_second(2));
        let err = governor.acquire("search", 10.0).await.unwrap_err();
        assert!(matches!(err, RateLimitError::CostExceedsCapacity { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_refill() {
        let governor = RateGovernor::new(RateLimitConfig::per_second(1));
        governor.try_acquire("search", 1.0).unwrap();

        let start = Instant::now();
        governor.acquire("search", 1.0).await.unwrap();
        // One token per second: the wait must be roughly a second.
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_refill_up_to_capacity() {
        let governor = RateGovernor::new(RateLimitConfig::per_second(2));
        governor.try_acquire("x", 2.0).unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        let snap = governor.snapshot();
        assert_eq!(snap.len(), 1);
        assert!((snap[0].remaining - 2.0).abs() < 1e-6, "capped at capacity");
    }

    #[tokio::test]
    async fn snapshot_lists_all_endpoints() {
        let governor = RateGovernor::new(RateLimitConfig::per_second(5));
        governor.try_acquire("b", 1.0).unwrap();
        governor.try_acquire("a", 1.0).unwrap();
        let snap = governor.snapshot();
        let names: Vec<_> = snap.iter().map(|s| s.endpoint.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
