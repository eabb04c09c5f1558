//! The cycle controller: one tick per hour, dispatched as an `hourly` or
//! `sweep` cycle, under a hard wall-clock ceiling.
//!
//! The next tick is persisted through the store, so scheduling state
//! survives restarts; the in-process timer is just the vehicle. A cycle
//! failure is recorded and never stops the loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use tracing::{error, info, warn};

use ss_core::config::Config;
use ss_core::store::RepoStore;
use ss_core::types::{CycleKind, CyclePhase};
use ss_harness::shutdown::ShutdownSignal;

use crate::batch::{BatchError, BatchRunner};
use crate::discovery::DiscoveryEngine;
use crate::fetcher::Fetcher;
use crate::planner::TierScanPlanner;
use crate::progress::ProgressTracker;

/// Store meta key holding the next scheduled tick (RFC 3339).
pub const META_NEXT_TICK: &str = "next_tick";

/// Minimum leftover budget worth starting phase 2 for.
const MIN_PHASE2_BUDGET: Duration = Duration::from_secs(30);

/// Host-reported requests that must remain before a cycle spends quota
/// on discovery.
const MIN_HOST_QUOTA_FOR_DISCOVERY: u64 = 100;

pub struct CycleController {
    config: Arc<Config>,
    store: Arc<RepoStore>,
    fetcher: Arc<Fetcher>,
    discovery: Arc<DiscoveryEngine>,
    planner: Arc<TierScanPlanner>,
    batch_runner: Arc<BatchRunner>,
    progress: Arc<ProgressTracker>,
    shutdown: ShutdownSignal,
}

impl CycleController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        store: Arc<RepoStore>,
        fetcher: Arc<Fetcher>,
        discovery: Arc<DiscoveryEngine>,
        planner: Arc<TierScanPlanner>,
        batch_runner: Arc<BatchRunner>,
        progress: Arc<ProgressTracker>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            config,
            store,
            fetcher,
            discovery,
            planner,
            batch_runner,
            progress,
            shutdown,
        }
    }

    /// Whether the host-reported quota leaves room for a discovery sweep.
    /// An unreachable quota endpoint does not block the cycle.
    async fn host_quota_allows_discovery(&self) -> bool {
        match self.fetcher.host_rate_limit().await {
            Ok(quota) => {
                info!(
                    remaining = quota.remaining,
                    limit = quota.limit,
                    reset_at = %quota.reset_at,
                    "host API quota"
                );
                quota.remaining >= MIN_HOST_QUOTA_FOR_DISCOVERY
            }
            Err(err) => {
                warn!(error = %err, "host quota check failed, proceeding");
                true
            }
        }
    }

    /// Sweep at the configured wall-clock hours, hourly otherwise.
    pub fn classify(&self, hour: u32) -> CycleKind {
        if self.config.scan.sweep_hours.contains(&hour) {
            CycleKind::Sweep
        } else {
            CycleKind::Hourly
        }
    }

    /// The periodic tick loop. Runs until shutdown; a failing cycle only
    /// costs that cycle.
    pub async fn run_loop(&self) {
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            let next_tick = match self.load_next_tick().await {
                Some(t) if t > Utc::now() => t,
                _ => Utc::now(),
            };
            self.persist_next_tick(next_tick).await;
            self.progress.set_next_tick(next_tick).await;

            let wait = (next_tick - Utc::now()).to_std().unwrap_or_default();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown_rx.recv() => break,
            }

            let hour = Utc::now().hour();
            let kind = self.classify(hour);
            info!(hour, ?kind, "cycle tick");
            self.run_cycle(kind, false).await;

            let next =
                Utc::now() + chrono::Duration::hours(self.config.scan.interval_hours.max(1) as i64);
            self.persist_next_tick(next).await;
            self.progress.set_next_tick(next).await;
        }
        info!("cycle loop stopped");
    }

    /// Run one cycle to completion. Never returns an error: failures are
    /// logged and recorded in the cycle progress.
    pub async fn run_cycle(&self, kind: CycleKind, force: bool) {
        let started = tokio::time::Instant::now();
        let budget = Duration::from_millis(self.config.scan.cycle_budget_ms);
        self.progress.begin_cycle(kind).await;

        match kind {
            CycleKind::Hourly => self.hourly_cycle(started, budget, force).await,
            CycleKind::Sweep => self.sweep_cycle(started, budget).await,
        }

        self.progress.finish_cycle().await;
        info!(?kind, elapsed_ms = started.elapsed().as_millis() as u64, "cycle finished");
    }

    /// Phase 1 (discovery + per-tier refresh) then, budget permitting,
    /// phase 2 (automated batch analysis of the overdue pool).
    async fn hourly_cycle(&self, started: tokio::time::Instant, budget: Duration, force: bool) {
        let phase1_deadline =
            started + Duration::from_millis(self.config.scan.phase1_budget_ms).min(budget);

        if self.host_quota_allows_discovery().await {
            match self.discovery.run(self.config.discovery.limit).await {
                Ok(outcome) => self.progress.add_discovered(outcome.stored).await,
                Err(err) => {
                    error!(error = %err, "discovery failed");
                    self.progress.record_error(format!("discovery: {err}")).await;
                }
            }
        } else {
            warn!("host quota low, skipping discovery this cycle");
            self.progress
                .record_error("discovery skipped: host quota low".to_string())
                .await;
        }

        self.progress.set_phase(CyclePhase::Planning).await;
        let plan = match self.planner.plan_cycle(force).await {
            Ok(plan) => plan,
            Err(err) => {
                error!(error = %err, "planning failed");
                self.progress.record_error(format!("planning: {err}")).await;
                return;
            }
        };

        for planned in &plan.scans {
            if self.shutdown.is_shutting_down() {
                return;
            }
            if tokio::time::Instant::now() >= phase1_deadline {
                warn!(
                    remaining = plan.scans.len(),
                    "phase 1 budget exhausted, truncating scan list"
                );
                break;
            }
            let policy = self.config.tier_policy(planned.tier);
            match self
                .discovery
                .refresh_repository(&planned.repo, planned.kind, policy)
                .await
            {
                Ok(true) => self.progress.add_scanned(planned.tier, 1).await,
                Ok(false) => {}
                Err(err) => {
                    error!(repo = %planned.repo.full_name, error = %err, "refresh failed");
                    self.progress.record_error(format!("refresh: {err}")).await;
                    return;
                }
            }
        }

        // Phase 2 only when phase 1 left enough budget.
        let remaining = budget.saturating_sub(started.elapsed());
        if remaining < MIN_PHASE2_BUDGET || plan.batch_pool.is_empty() {
            return;
        }
        let phase2 = remaining
            .min(Duration::from_millis(self.config.scan.phase2_budget_ms))
            .min(Duration::from_millis(self.config.batch.max_batch_runtime_ms));
        let batch_id = format!("auto-{}", Utc::now().format("%Y%m%d%H"));
        let names: Vec<String> = plan
            .batch_pool
            .iter()
            .map(|r| r.full_name.clone())
            .collect();
        self.run_batch_phase(&batch_id, names, phase2).await;
    }

    /// Full coverage: forced discovery at the sweep cap, then a
    /// comprehensive analysis pass over the stale pool.
    async fn sweep_cycle(&self, started: tokio::time::Instant, budget: Duration) {
        if self.host_quota_allows_discovery().await {
            match self
                .discovery
                .run(self.config.scan.sweep_discovery_limit)
                .await
            {
                Ok(outcome) => self.progress.add_discovered(outcome.stored).await,
                Err(err) => {
                    error!(error = %err, "sweep discovery failed");
                    self.progress.record_error(format!("discovery: {err}")).await;
                }
            }
        } else {
            warn!("host quota low, skipping sweep discovery");
            self.progress
                .record_error("discovery skipped: host quota low".to_string())
                .await;
        }

        self.progress.set_phase(CyclePhase::Planning).await;
        let pool = match self
            .planner
            .batch_pool(self.config.scan.sweep_analysis_limit, false)
            .await
        {
            Ok(pool) => pool,
            Err(err) => {
                error!(error = %err, "sweep planning failed");
                self.progress.record_error(format!("planning: {err}")).await;
                return;
            }
        };
        if pool.is_empty() {
            return;
        }

        let remaining = budget.saturating_sub(started.elapsed());
        if remaining < MIN_PHASE2_BUDGET {
            return;
        }
        let phase2 =
            remaining.min(Duration::from_millis(self.config.batch.max_batch_runtime_ms));
        let batch_id = format!("sweep-{}", Utc::now().format("%Y%m%d%H"));
        let names: Vec<String> = pool.iter().map(|r| r.full_name.clone()).collect();
        self.run_batch_phase(&batch_id, names, phase2).await;
    }

    async fn run_batch_phase(&self, batch_id: &str, names: Vec<String>, budget: Duration) {
        self.progress.set_phase(CyclePhase::Analysis).await;
        match self
            .batch_runner
            .run_with_budget(batch_id, names, budget, false)
            .await
        {
            Ok(state) => self.progress.add_analyzed(state.completed).await,
            Err(BatchError::AlreadyFinished(_)) => {
                info!(batch_id, "automated batch already ran this hour");
            }
            Err(err) => {
                error!(batch_id, error = %err, "batch phase failed");
                self.progress.record_error(format!("batch: {err}")).await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Store-backed next tick
    // -----------------------------------------------------------------------

    async fn load_next_tick(&self) -> Option<DateTime<Utc>> {
        match self.store.get_meta(META_NEXT_TICK).await {
            Ok(Some(raw)) => match DateTime::parse_from_rfc3339(&raw) {
                Ok(t) => Some(t.with_timezone(&Utc)),
                Err(err) => {
                    warn!(raw, error = %err, "unparseable next_tick, rescheduling now");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                error!(error = %err, "failed to load next_tick");
                None
            }
        }
    }

    async fn persist_next_tick(&self, next: DateTime<Utc>) {
        if let Err(err) = self.store.put_meta(META_NEXT_TICK, &next.to_rfc3339()).await {
            error!(error = %err, "failed to persist next_tick");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
