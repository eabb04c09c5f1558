//! Cycle and batch progress: the in-memory view the status endpoints
//! read, plus durable batch status queries against the store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use ss_core::store::{RepoStore, StoreError};
use ss_core::types::{active_batch, BatchState, CycleKind, CyclePhase, CycleProgress, Tier};

/// Cap on retained per-cycle error messages.
const MAX_ERRORS: usize = 50;

/// A batch state together with its staleness verdict.
#[derive(Debug, Clone)]
pub struct BatchStatusView {
    pub state: BatchState,
    pub stale: bool,
}

pub struct ProgressTracker {
    progress: Arc<RwLock<CycleProgress>>,
    store: Arc<RepoStore>,
}

impl ProgressTracker {
    pub fn new(store: Arc<RepoStore>) -> Self {
        Self {
            progress: Arc::new(RwLock::new(CycleProgress::default())),
            store,
        }
    }

    /// Shared handle for the HTTP facade.
    pub fn handle(&self) -> Arc<RwLock<CycleProgress>> {
        self.progress.clone()
    }

    // -----------------------------------------------------------------------
    // Cycle bookkeeping (written by the controller)
    // -----------------------------------------------------------------------

    pub async fn begin_cycle(&self, kind: CycleKind) {
        let mut p = self.progress.write().await;
        let last = p.last_completed_cycle;
        let next = p.next_tick;
        *p = CycleProgress {
            phase: CyclePhase::Discovery,
            cycle_kind: Some(kind),
            started_at: Some(Utc::now()),
            last_completed_cycle: last,
            next_tick: next,
            ..CycleProgress::default()
        };
    }

    pub async fn set_phase(&self, phase: CyclePhase) {
        self.progress.write().await.phase = phase;
    }

    pub async fn add_discovered(&self, count: u32) {
        self.progress.write().await.discovered += count;
    }

    pub async fn add_scanned(&self, tier: Tier, count: u32) {
        self.progress.write().await.scanned_per_tier[(tier.as_u8() - 1) as usize] += count;
    }

    pub async fn add_analyzed(&self, count: u32) {
        self.progress.write().await.analyzed += count;
    }

    pub async fn record_error(&self, message: impl Into<String>) {
        let mut p = self.progress.write().await;
        if p.errors.len() < MAX_ERRORS {
            p.errors.push(message.into());
        }
    }

    pub async fn finish_cycle(&self) {
        let mut p = self.progress.write().await;
        p.phase = CyclePhase::Idle;
        p.last_completed_cycle = Some(Utc::now());
    }

    pub async fn set_next_tick(&self, next: DateTime<Utc>) {
        self.progress.write().await.next_tick = Some(next);
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn cycle_status(&self) -> CycleProgress {
        self.progress.read().await.clone()
    }

    pub async fn batch_status(&self, batch_id: &str) -> Result<Option<BatchStatusView>, StoreError> {
        Ok(self.store.get_batch(batch_id).await?.map(|state| {
            let stale = state.is_stale(Utc::now());
            BatchStatusView { state, stale }
        }))
    }

    /// The running batch, or the latest non-terminal one.
    pub async fn active_batch(&self) -> Result<Option<BatchStatusView>, StoreError> {
        let batches = self.store.list_batches("", 20).await?;
        Ok(active_batch(&batches).map(|state| BatchStatusView {
            stale: state.is_stale(Utc::now()),
            state: state.clone(),
        }))
    }

    pub async fn history(&self, limit: u32) -> Result<Vec<BatchState>, StoreError> {
        self.store.list_batches("", limit).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
