//! Credit accounting for LLM spend.
//!
//! A credit is the abstract unit charged per analysis call. The ledger
//! enforces two independent caps: per-batch and per-hour. The hourly
//! window resets one hour after it opens. Counters are process-scoped
//! and reset on restart; the provider enforces the authoritative limit.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Result of a credit affordability check.
#[derive(Debug, Clone, PartialEq)]
pub enum CreditCheck {
    Allowed,
    /// Above 80% of either cap.
    Warning { batch_pct: f64, hour_pct: f64 },
    Denied { reason: String },
}

impl CreditCheck {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, CreditCheck::Denied { .. })
    }
}

#[derive(Debug)]
struct LedgerState {
    batch_used: HashMap<String, f64>,
    hour_used: f64,
    hour_resets_at: Instant,
}

/// Tracks credit consumption per batch and per rolling hour.
#[derive(Debug)]
pub struct CreditLedger {
    max_per_batch: f64,
    max_per_hour: f64,
    state: Mutex<LedgerState>,
}

impl CreditLedger {
    pub fn new(max_per_batch: f64, max_per_hour: f64) -> Self {
        Self {
            max_per_batch,
            max_per_hour,
            state: Mutex::new(LedgerState {
                batch_used: HashMap::new(),
                hour_used: 0.0,
                hour_resets_at: Instant::now() + Duration::from_secs(3600),
            }),
        }
    }

    pub fn max_per_batch(&self) -> f64 {
        self.max_per_batch
    }

    /// Check whether `estimated` more credits fit under both caps.
    pub async fn check(&self, batch_id: &str, estimated: f64) -> CreditCheck {
        let mut state = self.state.lock().await;
        Self::roll_window(&mut state);

        let batch_used = state.batch_used.get(batch_id).copied().unwrap_or(0.0);
        if batch_used + estimated > self.max_per_batch {
            return CreditCheck::Denied {
                reason: format!(
                    "batch credit limit reached ({batch_used:.1} + {estimated:.1} > {:.1})",
                    self.max_per_batch
                ),
            };
        }
        if state.hour_used + estimated > self.max_per_hour {
            return CreditCheck::Denied {
                reason: format!(
                    "hourly credit limit reached ({:.1} + {estimated:.1} > {:.1})",
                    state.hour_used, self.max_per_hour
                ),
            };
        }

        let batch_pct = (batch_used + estimated) / self.max_per_batch;
        let hour_pct = (state.hour_used + estimated) / self.max_per_hour;
        if batch_pct > 0.8 || hour_pct > 0.8 {
            CreditCheck::Warning { batch_pct, hour_pct }
        } else {
            CreditCheck::Allowed
        }
    }

    /// Record credits actually spent.
    pub async fn consume(&self, batch_id: &str, amount: f64) {
        let mut state = self.state.lock().await;
        Self::roll_window(&mut state);
        *state.batch_used.entry(batch_id.to_string()).or_insert(0.0) += amount;
        state.hour_used += amount;
    }

    pub async fn batch_used(&self, batch_id: &str) -> f64 {
        let state = self.state.lock().await;
        state.batch_used.get(batch_id).copied().unwrap_or(0.0)
    }

    pub async fn hourly_used(&self) -> f64 {
        let mut state = self.state.lock().await;
        Self::roll_window(&mut state);
        state.hour_used
    }

    /// Drop a finished batch's counter.
    pub async fn clear_batch(&self, batch_id: &str) {
        let mut state = self.state.lock().await;
        state.batch_used.remove(batch_id);
    }

    fn roll_window(state: &mut LedgerState) {
        let now = Instant::now();
        if now >= state.hour_resets_at {
            state.hour_used = 0.0;
            state.hour_resets_at = now + Duration::from_secs(3600);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
