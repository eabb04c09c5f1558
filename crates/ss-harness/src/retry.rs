use std::time::Duration;
use tracing::{debug, warn};

/// Classifies errors for retry purposes. Implemented by the host and LLM
/// adapter error types.
pub trait Transient {
    /// `true` for failures worth retrying (network, 5xx, 429, timeout).
    fn is_transient(&self) -> bool;

    /// Provider-suggested wait, when one was given (e.g. a 429 retry-after).
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Configuration for retry behavior: `base × multiplier^attempt`, capped.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (0-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let ms = self.base.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis(ms as u64).min(self.max_backoff)
    }
}

/// Execute an async operation, retrying transient failures with
/// exponential backoff. Permanent failures return immediately.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    operation: &str,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: Transient + std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation, attempt = attempt + 1, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if !err.is_transient() || attempt + 1 >= config.max_attempts {
                    return Err(err);
                }
                let backoff = err
                    .retry_after()
                    .unwrap_or_else(|| config.backoff_for(attempt));
                warn!(
                    operation,
                    attempt = attempt + 1,
                    error = %err,
                    ?backoff,
                    "transient failure, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
