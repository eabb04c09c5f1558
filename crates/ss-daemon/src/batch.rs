//! Self-healing batch analysis orchestrator.
//!
//! Processes a batch of repositories in chunks, persisting `BatchState`
//! to the store between chunks so a crashed process resumes from where it
//! stopped. A background monitor recomputes health on a fixed interval
//! and aborts the batch on critical conditions; workers observe stop
//! decisions between repositories and mid-analysis.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use ss_core::config::Config;
use ss_core::score::{compute_score, estimated_monthly_growth_pct, recommend_model, RepoSignals};
use ss_core::store::{RepoStore, StoreError};
use ss_core::types::{
    Alert, AlertLevel, Analysis, BatchHealth, BatchState, BatchStatus, Checkpoint, HealthStatus,
    RepoResult, RepoResultStatus, Repository, ScanKind, Tier,
};
use ss_harness::credits::{CreditCheck, CreditLedger};
use ss_harness::shutdown::ShutdownSignal;
use ss_intelligence::{LlmError, RepoAnalyzer};

use crate::fetcher::{FetchError, Fetcher};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("batch `{0}` already finished; choose a new batch id")]
    AlreadyFinished(String),
}

pub type Result<T> = std::result::Result<T, BatchError>;

// ---------------------------------------------------------------------------
// Health monitor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
struct MonitorCounters {
    completed: u32,
    failed: u32,
    skipped: u32,
    consecutive_failures: u32,
    /// Snapshot taken at the last recovery. The critical check only
    /// considers work after it, so a failure streak that recovery is
    /// already handling does not also trip the monitor.
    base_completed: u32,
    base_processed: u32,
}

fn compute_health(
    counters: MonitorCounters,
    min_success_rate: f64,
    elapsed: Duration,
    budget: Duration,
) -> BatchHealth {
    let processed = counters.completed + counters.failed + counters.skipped;
    let success_rate = if processed > 0 {
        counters.completed as f64 / processed as f64
    } else {
        1.0
    };
    let elapsed_ms = elapsed.as_millis() as u64;
    let remaining_ms = budget.as_millis().saturating_sub(elapsed.as_millis()) as u64;

    let window_processed = processed.saturating_sub(counters.base_processed);
    let window_completed = counters.completed.saturating_sub(counters.base_completed);
    let window_rate = if window_processed > 0 {
        window_completed as f64 / window_processed as f64
    } else {
        1.0
    };

    let status = if window_processed >= 5 && window_rate < min_success_rate {
        HealthStatus::Critical
    } else if remaining_ms < 60_000 || counters.failed > counters.completed {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };

    BatchHealth {
        status,
        success_rate,
        runtime_elapsed_ms: elapsed_ms,
        time_remaining_ms: remaining_ms,
        consecutive_failures: counters.consecutive_failures,
        message: None,
        checked_at: Utc::now(),
    }
}

struct Monitor {
    abort: ShutdownSignal,
    reason: Arc<StdMutex<Option<String>>>,
    task: JoinHandle<()>,
}

impl Monitor {
    fn reason(&self) -> Option<String> {
        self.reason.lock().unwrap().clone()
    }
}

// ---------------------------------------------------------------------------
// Per-repo outcome
// ---------------------------------------------------------------------------

enum RepoOutcome {
    Finished(Box<RepoResult>),
    Stopped,
    StoreFailure { error: String },
}

/// How one repo's outcome affected the chunk loop.
enum Applied {
    Continue,
    ChunkAborted,
    Stopped,
}

enum RecoveryVerdict {
    Resumed,
    Stopped,
    Failed,
}

// ---------------------------------------------------------------------------
// BatchRunner
// ---------------------------------------------------------------------------

pub struct BatchRunner {
    store: Arc<RepoStore>,
    fetcher: Arc<Fetcher>,
    analyzer: Arc<RepoAnalyzer>,
    ledger: Arc<CreditLedger>,
    config: Arc<Config>,
    global_stop: ShutdownSignal,
    current_stop: StdMutex<Option<ShutdownSignal>>,
    /// One batch runs at a time.
    gate: tokio::sync::Mutex<()>,
}

impl BatchRunner {
    pub fn new(
        store: Arc<RepoStore>,
        fetcher: Arc<Fetcher>,
        analyzer: Arc<RepoAnalyzer>,
        ledger: Arc<CreditLedger>,
        config: Arc<Config>,
        global_stop: ShutdownSignal,
    ) -> Self {
        Self {
            store,
            fetcher,
            analyzer,
            ledger,
            config,
            global_stop,
            current_stop: StdMutex::new(None),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Stop the currently running batch, if any. Idempotent.
    pub fn stop_current(&self) {
        if let Some(signal) = self.current_stop.lock().unwrap().as_ref() {
            signal.trigger();
        }
    }

    /// Run (or resume) a batch with the configured runtime budget.
    pub async fn run(&self, batch_id: &str, repositories: Vec<String>) -> Result<BatchState> {
        let budget = Duration::from_millis(self.config.batch.max_batch_runtime_ms);
        self.run_with_budget(batch_id, repositories, budget, false)
            .await
    }

    /// Run (or resume) a batch under an explicit runtime budget. `force`
    /// analyzes repositories even when a fresh analysis exists.
    pub async fn run_with_budget(
        &self,
        batch_id: &str,
        repositories: Vec<String>,
        budget: Duration,
        force: bool,
    ) -> Result<BatchState> {
        let _slot = self.gate.lock().await;

        let mut state = self.load_or_create(batch_id, repositories).await?;
        if matches!(state.status, BatchStatus::Pending | BatchStatus::Recovering) {
            state.transition(BatchStatus::Running);
        }
        self.store.put_batch(&state).await?;
        info!(
            batch_id,
            total = state.total,
            already_processed = state.processed(),
            "batch running"
        );

        let current = ShutdownSignal::new();
        *self.current_stop.lock().unwrap() = Some(current.clone());

        let result = self.drive(&mut state, budget, force, &current).await;

        *self.current_stop.lock().unwrap() = None;
        result?;

        self.store.put_batch(&state).await?;
        if state.status == BatchStatus::Completed {
            self.ledger.clear_batch(&state.batch_id).await;
        }
        info!(
            batch_id,
            status = ?state.status,
            completed = state.completed,
            failed = state.failed,
            skipped = state.skipped,
            credits = state.credits.actual,
            "batch finished"
        );
        Ok(state)
    }

    async fn load_or_create(&self, batch_id: &str, repositories: Vec<String>) -> Result<BatchState> {
        match self.store.get_batch(batch_id).await? {
            Some(existing) if !existing.status.is_terminal() => {
                info!(
                    batch_id,
                    processed = existing.processed(),
                    total = existing.total,
                    "resuming batch from durable state"
                );
                Ok(existing)
            }
            Some(_) => Err(BatchError::AlreadyFinished(batch_id.to_string())),
            None => Ok(BatchState::new(
                batch_id,
                repositories,
                self.config.credits.estimated_per_repo,
                self.ledger.max_per_batch(),
            )),
        }
    }

    /// The worker loop. Mutates `state` in place; the caller persists the
    /// final state.
    async fn drive(
        &self,
        state: &mut BatchState,
        budget: Duration,
        force: bool,
        current: &ShutdownSignal,
    ) -> Result<()> {
        let cfg = &self.config.batch;
        let started = tokio::time::Instant::now();
        let chunk_size = cfg.chunk_size.clamp(1, cfg.max_chunk_size.max(1));

        let counters = Arc::new(RwLock::new(MonitorCounters {
            completed: state.completed,
            failed: state.failed,
            skipped: state.skipped,
            ..MonitorCounters::default()
        }));
        let latest_health = Arc::new(RwLock::new(compute_health(
            *counters.read().await,
            cfg.min_success_rate,
            Duration::ZERO,
            budget,
        )));
        let monitor = self.spawn_monitor(counters.clone(), latest_health.clone(), started, budget);

        let workers = cfg.concurrent_workers.max(1);
        let mut consecutive_failures: u32 = 0;
        let mut stop_reason: Option<String> = None;

        'outer: loop {
            let remaining = state.remaining();
            if remaining.is_empty() {
                break;
            }
            let chunk: Vec<String> = remaining.into_iter().take(chunk_size).collect();

            if workers == 1 {
                for full_name in chunk {
                    if let Some(reason) = self.stop_reason_now(&monitor, current, started, budget)
                    {
                        stop_reason = Some(reason);
                        break 'outer;
                    }
                    if let Some(reason) = self
                        .credit_stop_reason(state, self.config.credits.estimated_per_repo)
                        .await
                    {
                        stop_reason = Some(reason);
                        break 'outer;
                    }

                    state.current_repo = Some(full_name.clone());
                    let outcome = self.process_repo(&full_name, force, current).await;
                    let applied = self
                        .apply_outcome(state, full_name, outcome, &mut consecutive_failures)
                        .await;
                    let will_recover = self
                        .sync_counters(&counters, state, consecutive_failures)
                        .await;

                    if matches!(applied, Applied::Stopped) {
                        stop_reason = Some("external stop".into());
                        break 'outer;
                    }

                    // Self-healing: checkpoint and pause after a failure streak.
                    if consecutive_failures >= cfg.max_consecutive_failures {
                        match self
                            .recover_or_fail(state, &counters, &latest_health, current, will_recover)
                            .await?
                        {
                            RecoveryVerdict::Resumed => {
                                consecutive_failures = 0;
                                continue;
                            }
                            RecoveryVerdict::Stopped => {
                                stop_reason = Some("external stop".into());
                                break 'outer;
                            }
                            RecoveryVerdict::Failed => break 'outer,
                        }
                    }

                    if matches!(applied, Applied::ChunkAborted) {
                        break;
                    }

                    // Pause between analyses, stretched while failures are recent.
                    if !self
                        .pause(self.inter_analysis_delay(consecutive_failures), current)
                        .await
                    {
                        stop_reason = Some("external stop".into());
                        break 'outer;
                    }
                }
            } else {
                // Paid-plan mode: several LLM workers share the chunk.
                // Outcomes apply in observed completion order; budget and
                // credit checks move to chunk granularity.
                if let Some(reason) = self.stop_reason_now(&monitor, current, started, budget) {
                    stop_reason = Some(reason);
                    break 'outer;
                }
                let chunk_estimate =
                    self.config.credits.estimated_per_repo * chunk.len() as f64;
                if let Some(reason) = self.credit_stop_reason(state, chunk_estimate).await {
                    stop_reason = Some(reason);
                    break 'outer;
                }

                state.current_repo = chunk.first().cloned();
                let outcomes: Vec<(String, RepoOutcome)> = stream::iter(chunk)
                    .map(|full_name| async move {
                        let outcome = self.process_repo(&full_name, force, current).await;
                        (full_name, outcome)
                    })
                    .buffer_unordered(workers)
                    .collect()
                    .await;

                let mut stopped = false;
                for (full_name, outcome) in outcomes {
                    let applied = self
                        .apply_outcome(state, full_name, outcome, &mut consecutive_failures)
                        .await;
                    if matches!(applied, Applied::Stopped) {
                        stopped = true;
                    }
                }
                let will_recover = self
                    .sync_counters(&counters, state, consecutive_failures)
                    .await;
                if stopped {
                    stop_reason = Some("external stop".into());
                    break 'outer;
                }
                if consecutive_failures >= cfg.max_consecutive_failures {
                    match self
                        .recover_or_fail(state, &counters, &latest_health, current, will_recover)
                        .await?
                    {
                        RecoveryVerdict::Resumed => consecutive_failures = 0,
                        RecoveryVerdict::Stopped => {
                            stop_reason = Some("external stop".into());
                            break 'outer;
                        }
                        RecoveryVerdict::Failed => break 'outer,
                    }
                }
                if !self
                    .pause(self.inter_analysis_delay(consecutive_failures), current)
                    .await
                {
                    stop_reason = Some("external stop".into());
                    break 'outer;
                }
            }

            // Persist durable state between chunks.
            state.health = latest_health.read().await.clone();
            state.estimated_completion = estimate_completion(state, started);
            state.updated_at = Utc::now();
            self.store.put_batch(state).await?;
        }

        monitor.task.abort();

        let prior_message = state.health.message.clone();
        state.health = compute_health(
            *counters.read().await,
            cfg.min_success_rate,
            started.elapsed(),
            budget,
        );
        state.health.message = prior_message;
        if let Some(reason) = stop_reason {
            if !state.status.is_terminal() {
                state.health.message = Some(reason);
                state.transition(BatchStatus::Stopped);
            }
        } else if state.status == BatchStatus::Running {
            state.transition(BatchStatus::Completed);
        }
        Ok(())
    }

    fn stop_reason_now(
        &self,
        monitor: &Monitor,
        current: &ShutdownSignal,
        started: tokio::time::Instant,
        budget: Duration,
    ) -> Option<String> {
        if self.global_stop.is_shutting_down() || current.is_shutting_down() {
            return Some("external stop".into());
        }
        if monitor.abort.is_shutting_down() {
            return monitor.reason().or(Some("health monitor abort".into()));
        }
        if started.elapsed() >= budget {
            return Some("runtime budget exhausted".into());
        }
        None
    }

    async fn credit_stop_reason(&self, state: &BatchState, estimated: f64) -> Option<String> {
        match self.ledger.check(&state.batch_id, estimated).await {
            CreditCheck::Denied { reason } => Some(reason),
            CreditCheck::Warning { batch_pct, hour_pct } => {
                warn!(
                    batch_id = %state.batch_id,
                    batch_pct, hour_pct, "credit budget nearly exhausted"
                );
                None
            }
            CreditCheck::Allowed => None,
        }
    }

    /// Fold one repo's outcome into the batch state and the ledger.
    async fn apply_outcome(
        &self,
        state: &mut BatchState,
        full_name: String,
        outcome: RepoOutcome,
        consecutive_failures: &mut u32,
    ) -> Applied {
        match outcome {
            RepoOutcome::Finished(result) => {
                match result.status {
                    RepoResultStatus::Success => {
                        state.completed += 1;
                        state.credits.actual += result.credits_used;
                        self.ledger
                            .consume(&state.batch_id, result.credits_used)
                            .await;
                        *consecutive_failures = 0;
                    }
                    RepoResultStatus::Skipped => {
                        state.skipped += 1;
                    }
                    RepoResultStatus::Failed | RepoResultStatus::Timeout => {
                        state.failed += 1;
                        *consecutive_failures += 1;
                    }
                }
                state.results.push(*result);
                Applied::Continue
            }
            RepoOutcome::Stopped => Applied::Stopped,
            RepoOutcome::StoreFailure { error } => {
                error!(batch_id = %state.batch_id, repo = %full_name, error, "storage failure, aborting chunk");
                state.failed += 1;
                *consecutive_failures += 1;
                state.results.push(RepoResult {
                    repo_id: String::new(),
                    full_name,
                    status: RepoResultStatus::Failed,
                    duration_ms: 0,
                    credits_used: 0.0,
                    error: Some(error),
                    completed_at: Utc::now(),
                });
                Applied::ChunkAborted
            }
        }
    }

    /// Publish the latest counters to the monitor. Returns whether a
    /// failure streak at the threshold would be handled by recovery; when
    /// it would, the monitor's rate window resets in the same write so the
    /// streak cannot also trip the critical check.
    async fn sync_counters(
        &self,
        counters: &Arc<RwLock<MonitorCounters>>,
        state: &BatchState,
        consecutive_failures: u32,
    ) -> bool {
        let cfg = &self.config.batch;
        let will_recover = consecutive_failures >= cfg.max_consecutive_failures
            && state.recovery_attempts < cfg.max_recovery_attempts;
        let mut c = counters.write().await;
        c.completed = state.completed;
        c.failed = state.failed;
        c.skipped = state.skipped;
        c.consecutive_failures = consecutive_failures;
        if will_recover {
            c.base_completed = state.completed;
            c.base_processed = state.processed();
        }
        will_recover
    }

    async fn recover_or_fail(
        &self,
        state: &mut BatchState,
        counters: &Arc<RwLock<MonitorCounters>>,
        latest_health: &Arc<RwLock<BatchHealth>>,
        current: &ShutdownSignal,
        will_recover: bool,
    ) -> Result<RecoveryVerdict> {
        if !will_recover {
            state.health.message = Some("recovery attempts exhausted".into());
            state.transition(BatchStatus::Failed);
            return Ok(RecoveryVerdict::Failed);
        }
        self.enter_recovery(state, latest_health).await?;
        let resumed = self
            .pause(
                Duration::from_millis(self.config.batch.recovery_delay_ms),
                current,
            )
            .await;
        state.transition(BatchStatus::Running);
        self.store.put_batch(state).await?;
        self.sync_counters(counters, state, 0).await;
        if resumed {
            Ok(RecoveryVerdict::Resumed)
        } else {
            Ok(RecoveryVerdict::Stopped)
        }
    }

    /// Cancellable sleep. Returns `false` when a stop signal fired.
    async fn pause(&self, delay: Duration, current: &ShutdownSignal) -> bool {
        if self.global_stop.is_shutting_down() || current.is_shutting_down() {
            return false;
        }
        let mut global_rx = self.global_stop.subscribe();
        let mut current_rx = current.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = global_rx.recv() => false,
            _ = current_rx.recv() => false,
        }
    }

    /// Delay between analyses, stretched while failures are recent.
    fn inter_analysis_delay(&self, consecutive_failures: u32) -> Duration {
        let cfg = &self.config.batch;
        let mut delay = Duration::from_millis(cfg.delay_between_analyses_ms);
        if consecutive_failures > 0 {
            delay = delay.mul_f64(
                cfg.retry_backoff_multiplier
                    .powi(consecutive_failures as i32),
            );
        }
        delay
    }

    async fn enter_recovery(
        &self,
        state: &mut BatchState,
        latest_health: &Arc<RwLock<BatchHealth>>,
    ) -> Result<()> {
        state.transition(BatchStatus::Recovering);
        state.recovery_attempts += 1;
        let health = latest_health.read().await.clone();
        let completed_repos: Vec<String> = state
            .results
            .iter()
            .filter(|r| r.status == RepoResultStatus::Success)
            .map(|r| r.full_name.clone())
            .collect();
        let failed_repos: Vec<String> = state
            .results
            .iter()
            .filter(|r| {
                matches!(r.status, RepoResultStatus::Failed | RepoResultStatus::Timeout)
            })
            .map(|r| r.full_name.clone())
            .collect();
        state.checkpoint = Some(Checkpoint {
            completed_repos,
            failed_repos,
            remaining_repos: state.remaining(),
            health: health.clone(),
            created_at: Utc::now(),
        });
        state.health = health;
        warn!(
            batch_id = %state.batch_id,
            attempt = state.recovery_attempts,
            "entering recovery"
        );
        self.store.put_batch(state).await?;
        Ok(())
    }

    fn spawn_monitor(
        &self,
        counters: Arc<RwLock<MonitorCounters>>,
        latest_health: Arc<RwLock<BatchHealth>>,
        started: tokio::time::Instant,
        budget: Duration,
    ) -> Monitor {
        let abort = ShutdownSignal::new();
        let reason: Arc<StdMutex<Option<String>>> = Arc::new(StdMutex::new(None));
        let interval_ms = self.config.batch.health_check_interval_ms.max(100);
        let min_success_rate = self.config.batch.min_success_rate;

        let abort_clone = abort.clone();
        let reason_clone = reason.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let snapshot = *counters.read().await;
                let health =
                    compute_health(snapshot, min_success_rate, started.elapsed(), budget);
                *latest_health.write().await = health.clone();

                if health.status == HealthStatus::Critical {
                    *reason_clone.lock().unwrap() = Some(format!(
                        "success rate {:.2} below minimum {min_success_rate:.2}",
                        health.success_rate
                    ));
                    abort_clone.trigger();
                    break;
                }
                if started.elapsed() >= budget {
                    *reason_clone.lock().unwrap() = Some("runtime budget exhausted".into());
                    abort_clone.trigger();
                    break;
                }
            }
        });

        Monitor {
            abort,
            reason,
            task,
        }
    }

    // -----------------------------------------------------------------------
    // Per-repo processing
    // -----------------------------------------------------------------------

    async fn process_repo(&self, full_name: &str, force: bool, current: &ShutdownSignal) -> RepoOutcome {
        let cfg = &self.config.batch;
        let started = tokio::time::Instant::now();
        let mut global_rx = self.global_stop.subscribe();
        let mut current_rx = current.subscribe();
        let finish = |repo_id: &str, status: RepoResultStatus, credits: f64, error: Option<String>| {
            RepoOutcome::Finished(Box::new(RepoResult {
                repo_id: repo_id.to_string(),
                full_name: full_name.to_string(),
                status,
                duration_ms: started.elapsed().as_millis() as u64,
                credits_used: credits,
                error,
                completed_at: Utc::now(),
            }))
        };

        // Resolve the repository, fetching from the host on first sight.
        let repo = match self.resolve_repo(full_name).await {
            Ok(Some(repo)) => repo,
            Ok(None) => {
                return finish(
                    "",
                    RepoResultStatus::Failed,
                    0.0,
                    Some("repository not found on host".into()),
                )
            }
            Err(ResolveError::Permanent(msg)) => {
                return finish("", RepoResultStatus::Failed, 0.0, Some(msg))
            }
            Err(ResolveError::Store(e)) => {
                return RepoOutcome::StoreFailure { error: e.to_string() }
            }
        };

        let tier = match self.tier_for(&repo).await {
            Ok(tier) => tier,
            Err(e) => return RepoOutcome::StoreFailure { error: e.to_string() },
        };
        let policy = self.config.tier_policy(tier);

        if !force {
            match self
                .store
                .has_recent_analysis(&repo.id, policy.freshness_hours)
                .await
            {
                Ok(true) => {
                    return finish(
                        &repo.id,
                        RepoResultStatus::Skipped,
                        0.0,
                        Some("recent analysis exists".into()),
                    )
                }
                Ok(false) => {}
                Err(e) => return RepoOutcome::StoreFailure { error: e.to_string() },
            }
        }

        let readme = self
            .fetcher
            .get_readme(&repo.owner, &repo.name)
            .await
            .unwrap_or_default();
        let mut signals = self.fetcher.gather_signals(&repo).await;
        signals.has_readme = !readme.trim().is_empty();

        let monthly_growth = signals.monthly_growth_pct.unwrap_or_else(|| {
            estimated_monthly_growth_pct(repo.stars, repo.star_velocity(Utc::now()))
        });
        let model_tier = recommend_model(tier, monthly_growth);

        // Bounded attempts, each raced against the analysis timeout.
        let timeout = Duration::from_millis(cfg.analysis_timeout_ms);
        let attempts = cfg.max_retries.max(1);
        let mut last: (RepoResultStatus, String) =
            (RepoResultStatus::Failed, "no attempt made".into());
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(cfg.retry_delay_ms)) => {}
                    _ = global_rx.recv() => return RepoOutcome::Stopped,
                    _ = current_rx.recv() => return RepoOutcome::Stopped,
                }
            }
            tokio::select! {
                res = self.fetcher.analyze(&self.analyzer, &repo, &readme, &signals, model_tier, timeout) => {
                    match res {
                        Ok(analysis) => {
                            if let Err(e) = self.record_success(&repo, &analysis, &signals, policy.deep_scan_days).await {
                                return RepoOutcome::StoreFailure { error: e.to_string() };
                            }
                            return finish(&repo.id, RepoResultStatus::Success, analysis.cost, None);
                        }
                        Err(FetchError::Llm(LlmError::Timeout)) => {
                            last = (RepoResultStatus::Timeout, "analysis timed out".into());
                        }
                        Err(err) => {
                            let transient = err.is_transient();
                            last = (RepoResultStatus::Failed, err.to_string());
                            if !transient {
                                break;
                            }
                        }
                    }
                }
                _ = global_rx.recv() => return RepoOutcome::Stopped,
                _ = current_rx.recv() => return RepoOutcome::Stopped,
            }
        }

        finish(&repo.id, last.0, 0.0, Some(last.1))
    }

    async fn resolve_repo(
        &self,
        full_name: &str,
    ) -> std::result::Result<Option<Repository>, ResolveError> {
        if let Some(repo) = self
            .store
            .get_repository_by_full_name(full_name)
            .await
            .map_err(ResolveError::Store)?
        {
            return Ok(Some(repo));
        }

        let Some((owner, name)) = full_name.split_once('/') else {
            return Err(ResolveError::Permanent(format!(
                "malformed full name `{full_name}`"
            )));
        };
        match self.fetcher.get_repository(owner, name).await {
            Ok(repo) => {
                self.store
                    .upsert_repository(&repo)
                    .await
                    .map_err(ResolveError::Store)?;
                self.store
                    .upsert_metrics_batch(&[ss_core::types::RepoMetricSnapshot::from_repository(
                        &repo,
                        Utc::now(),
                    )])
                    .await
                    .map_err(ResolveError::Store)?;
                Ok(Some(repo))
            }
            Err(FetchError::Host(ss_github::HostError::NotFound)) => Ok(None),
            Err(err) => Err(ResolveError::Permanent(err.to_string())),
        }
    }

    /// Tier lookup; a missing assignment row is repaired on the spot.
    async fn tier_for(&self, repo: &Repository) -> std::result::Result<Tier, StoreError> {
        if let Some(assignment) = self.store.get_tier_assignment(&repo.id).await? {
            return Ok(assignment.tier);
        }
        error!(repo = %repo.full_name, "tier assignment missing, recomputing");
        let velocity = repo.star_velocity(Utc::now());
        let engagement = ss_core::score::engagement_score(repo, None);
        self.store
            .upsert_tier(&repo.id, repo.stars, velocity, engagement)
            .await
    }

    async fn record_success(
        &self,
        repo: &Repository,
        analysis: &Analysis,
        signals: &RepoSignals,
        deep_scan_days: i64,
    ) -> std::result::Result<(), StoreError> {
        self.store.save_analysis(analysis).await?;
        self.store
            .mark_scanned(&repo.id, ScanKind::Deep, deep_scan_days * 24)
            .await?;
        self.maybe_alert(repo, analysis, signals).await?;
        Ok(())
    }

    /// Emit an investment alert when the analysis crosses the thresholds,
    /// at most once per freshness window.
    async fn maybe_alert(
        &self,
        repo: &Repository,
        analysis: &Analysis,
        signals: &RepoSignals,
    ) -> std::result::Result<(), StoreError> {
        let cfg = &self.config.batch;
        let growth = compute_score(repo, signals, Utc::now()).growth;

        if analysis.scores.investment < cfg.alert_threshold && growth < 90.0 {
            return Ok(());
        }

        let tier = self.tier_for(repo).await?;
        let freshness = self.config.tier_policy(tier).freshness_hours;
        if self
            .store
            .recent_alert_exists(&repo.id, "investment_opportunity", freshness)
            .await?
        {
            return Ok(());
        }

        let level = if analysis.scores.investment >= 90.0 {
            AlertLevel::Urgent
        } else {
            AlertLevel::High
        };
        let mut alert = Alert::new(
            repo.id.clone(),
            "investment_opportunity",
            level,
            format!(
                "{} scored {:.0} investment ({:?})",
                repo.full_name, analysis.scores.investment, analysis.recommendation
            ),
        );
        alert.metadata = Some(serde_json::json!({
            "investment_score": analysis.scores.investment,
            "growth_score": growth,
            "model_used": analysis.model_used,
            "recommendation": analysis.recommendation,
        }));
        self.store.save_alert(&alert).await?;
        info!(repo = %repo.full_name, level = ?alert.level, "investment alert emitted");
        Ok(())
    }
}

enum ResolveError {
    Permanent(String),
    Store(StoreError),
}

fn estimate_completion(
    state: &BatchState,
    started: tokio::time::Instant,
) -> Option<DateTime<Utc>> {
    let processed = state.processed();
    if processed == 0 || processed >= state.total {
        return None;
    }
    let per_repo_ms = started.elapsed().as_millis() as f64 / processed as f64;
    let remaining = (state.total - processed) as f64;
    Some(Utc::now() + chrono::Duration::milliseconds((per_repo_ms * remaining) as i64))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use ss_github::MockHost;
    use ss_harness::rate_limiter::{RateGovernor, RateLimitConfig};
    use ss_intelligence::{MockProvider, ModelCatalog};

    fn repo(full_name: &str, stars: u32, age_days: i64) -> Repository {
        let (owner, name) = full_name.split_once('/').unwrap();
        let now = Utc::now();
        Repository {
            id: full_name.replace('/', "-"),
            owner: owner.into(),
            name: name.into(),
            full_name: full_name.into(),
            description: None,
            stars,
            forks: stars / 10,
            open_issues: 1,
            language: None,
            topics: vec!["ai".into()],
            created_at: now - ChronoDuration::days(age_days),
            updated_at: now,
            pushed_at: Some(now - ChronoDuration::days(1)),
            is_archived: false,
            is_fork: false,
            html_url: String::new(),
            default_branch: "main".into(),
            discovered_at: now,
        }
    }

    struct Fixture {
        runner: BatchRunner,
        store: Arc<RepoStore>,
        provider: Arc<MockProvider>,
    }

    async fn fixture_with(config: Config, provider: MockProvider, host: MockHost) -> Fixture {
        let config = Arc::new(config);
        let store = Arc::new(RepoStore::new_in_memory().await.unwrap());
        let provider = Arc::new(provider);
        let fetcher = Arc::new(Fetcher::new(
            Arc::new(host),
            Arc::new(RateGovernor::new(RateLimitConfig::per_second(10_000))),
            Duration::from_secs(30),
        ));
        let analyzer = Arc::new(RepoAnalyzer::new(provider.clone(), ModelCatalog::default()));
        let ledger = Arc::new(CreditLedger::new(
            config.credits.max_per_batch,
            config.credits.max_per_hour,
        ));
        let runner = BatchRunner::new(
            store.clone(),
            fetcher,
            analyzer,
            ledger,
            config,
            ShutdownSignal::new(),
        );
        Fixture {
            runner,
            store,
            provider,
        }
    }

    async fn seed(store: &RepoStore, r: &Repository) {
        store.upsert_repository(r).await.unwrap();
        store
            .upsert_tier(
                &r.id,
                r.stars,
                r.star_velocity(Utc::now()),
                ss_core::score::engagement_score(r, None),
            )
            .await
            .unwrap();
    }

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.batch.delay_between_analyses_ms = 10;
        config.batch.retry_delay_ms = 10;
        config.batch.recovery_delay_ms = 50;
        config.batch.health_check_interval_ms = 100;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn empty_batch_completes_immediately() {
        let f = fixture_with(fast_config(), MockProvider::new(), MockHost::new()).await;
        let state = f.runner.run("empty", vec![]).await.unwrap();
        assert_eq!(state.status, BatchStatus::Completed);
        assert_eq!(state.total, 0);
        assert!(state.ended_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_analyzes_every_repo() {
        let f = fixture_with(fast_config(), MockProvider::new(), MockHost::new()).await;
        let repos = ["acme/a", "acme/b", "acme/c"];
        for name in repos {
            seed(&f.store, &repo(name, 200, 400)).await;
        }
        let state = f
            .runner
            .run("happy", repos.iter().map(|s| s.to_string()).collect())
            .await
            .unwrap();

        assert_eq!(state.status, BatchStatus::Completed);
        assert_eq!(state.completed, 3);
        assert_eq!(state.failed, 0);
        assert!(state.completed + state.failed + state.skipped <= state.total);
        assert_eq!(state.results.len(), 3);
        assert!(state.credits.actual > 0.0);

        for name in repos {
            let r = f
                .store
                .get_repository_by_full_name(name)
                .await
                .unwrap()
                .unwrap();
            assert!(f.store.get_latest_analysis(&r.id).await.unwrap().is_some());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn repos_with_fresh_analyses_are_skipped() {
        let f = fixture_with(fast_config(), MockProvider::new(), MockHost::new()).await;
        let r = repo("acme/fresh", 200, 400);
        seed(&f.store, &r).await;

        let first = f.runner.run("b1", vec![r.full_name.clone()]).await.unwrap();
        assert_eq!(first.completed, 1);

        let second = f.runner.run("b2", vec![r.full_name.clone()]).await.unwrap();
        assert_eq!(second.completed, 0);
        assert_eq!(second.skipped, 1);
        assert_eq!(second.status, BatchStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_within_the_attempt_budget() {
        let provider = MockProvider::new().with_error(LlmError::Unavailable("blip".into()));
        let f = fixture_with(fast_config(), provider, MockHost::new()).await;
        seed(&f.store, &repo("acme/flaky", 200, 400)).await;

        let state = f.runner.run("retry", vec!["acme/flaky".into()]).await.unwrap();
        // First attempt failed, second (max_retries = 2) succeeded.
        assert_eq!(state.completed, 1);
        assert_eq!(state.failed, 0);
        assert_eq!(f.provider.captured_requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_llm_errors_do_not_retry() {
        let provider = MockProvider::new().with_error(LlmError::Api {
            status: 400,
            message: "bad request".into(),
        });
        let f = fixture_with(fast_config(), provider, MockHost::new()).await;
        seed(&f.store, &repo("acme/bad", 200, 400)).await;

        let state = f.runner.run("perm", vec!["acme/bad".into()]).await.unwrap();
        assert_eq!(state.failed, 1);
        assert_eq!(f.provider.captured_requests().len(), 1);
        let result = &state.results[0];
        assert_eq!(result.status, RepoResultStatus::Failed);
        assert!(result.error.as_deref().unwrap().contains("400"));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_repo_is_fetched_from_host_first() {
        let host = MockHost::new().with_repository(repo("acme/new", 300, 100));
        let f = fixture_with(fast_config(), MockProvider::new(), host).await;

        let state = f.runner.run("fetch", vec!["acme/new".into()]).await.unwrap();
        assert_eq!(state.completed, 1);
        assert!(f
            .store
            .get_repository_by_full_name("acme/new")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_repo_on_host_fails_the_unit_only() {
        let f = fixture_with(fast_config(), MockProvider::new(), MockHost::new()).await;
        seed(&f.store, &repo("acme/ok", 200, 400)).await;

        let state = f
            .runner
            .run("mixed", vec!["acme/ghost".into(), "acme/ok".into()])
            .await
            .unwrap();
        assert_eq!(state.status, BatchStatus::Completed);
        assert_eq!(state.failed, 1);
        assert_eq!(state.completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_marks_stopped() {
        let provider = MockProvider::new().with_latency(Duration::from_secs(5));
        let f = Arc::new(fixture_with(fast_config(), provider, MockHost::new()).await);
        for i in 0..5 {
            seed(&f.store, &repo(&format!("acme/r{i}"), 200, 400)).await;
        }

        let repos: Vec<String> = (0..5).map(|i| format!("acme/r{i}")).collect();
        let f2 = f.clone();
        let run = tokio::spawn(async move { f2.runner.run("stoppable", repos).await });

        // Give the batch time to start, then stop it twice.
        tokio::time::sleep(Duration::from_secs(7)).await;
        f.runner.stop_current();
        f.runner.stop_current();

        let state = run.await.unwrap().unwrap();
        assert_eq!(state.status, BatchStatus::Stopped);
        assert!(state.processed() < state.total);
        assert_eq!(state.health.message.as_deref(), Some("external stop"));

        // Stopping when nothing runs is a no-op.
        f.runner.stop_current();
    }

    #[tokio::test(start_paused = true)]
    async fn state_is_persisted_between_chunks() {
        let mut config = fast_config();
        config.batch.chunk_size = 2;
        let f = fixture_with(config, MockProvider::new(), MockHost::new()).await;
        for i in 0..4 {
            seed(&f.store, &repo(&format!("acme/r{i}"), 200, 400)).await;
        }
        let repos: Vec<String> = (0..4).map(|i| format!("acme/r{i}")).collect();
        let state = f.runner.run("chunky", repos).await.unwrap();
        assert_eq!(state.completed, 4);

        let stored = f.store.get_batch("chunky").await.unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Completed);
        assert_eq!(stored.results.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_workers_process_the_whole_chunk() {
        let mut config = fast_config();
        config.batch.concurrent_workers = 3;
        config.batch.chunk_size = 3;
        let provider = MockProvider::new().with_latency(Duration::from_secs(1));
        let f = fixture_with(config, provider, MockHost::new()).await;

        let names: Vec<String> = (0..6).map(|i| format!("acme/par{i}")).collect();
        for name in &names {
            seed(&f.store, &repo(name, 200, 400)).await;
        }

        let started = tokio::time::Instant::now();
        let state = f.runner.run("parallel", names).await.unwrap();

        assert_eq!(state.status, BatchStatus::Completed);
        assert_eq!(state.completed, 6);
        assert_eq!(state.results.len(), 6);
        // Three workers over two chunks of three: well under the six
        // seconds a sequential run would need for the analyses alone.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn reusing_a_finished_batch_id_is_an_error() {
        let f = fixture_with(fast_config(), MockProvider::new(), MockHost::new()).await;
        f.runner.run("done", vec![]).await.unwrap();
        let err = f.runner.run("done", vec![]).await.unwrap_err();
        assert!(matches!(err, BatchError::AlreadyFinished(_)));
    }

    #[test]
    fn health_statuses_follow_the_thresholds() {
        let healthy = compute_health(
            MonitorCounters {
                completed: 8,
                failed: 1,
                ..MonitorCounters::default()
            },
            0.5,
            Duration::from_secs(10),
            Duration::from_secs(300),
        );
        assert_eq!(healthy.status, HealthStatus::Healthy);

        let degraded_time = compute_health(
            MonitorCounters::default(),
            0.5,
            Duration::from_secs(250),
            Duration::from_secs(300),
        );
        assert_eq!(degraded_time.status, HealthStatus::Degraded);

        let degraded_failures = compute_health(
            MonitorCounters {
                completed: 1,
                failed: 2,
                consecutive_failures: 2,
                ..MonitorCounters::default()
            },
            0.5,
            Duration::from_secs(10),
            Duration::from_secs(300),
        );
        assert_eq!(degraded_failures.status, HealthStatus::Degraded);

        let critical = compute_health(
            MonitorCounters {
                completed: 1,
                failed: 5,
                consecutive_failures: 5,
                ..MonitorCounters::default()
            },
            0.5,
            Duration::from_secs(10),
            Duration::from_secs(300),
        );
        assert_eq!(critical.status, HealthStatus::Critical);

        // Fewer than five processed repos never trips critical.
        let early = compute_health(
            MonitorCounters {
                failed: 3,
                consecutive_failures: 3,
                ..MonitorCounters::default()
            },
            0.5,
            Duration::from_secs(10),
            Duration::from_secs(300),
        );
        assert_ne!(early.status, HealthStatus::Critical);
    }
}
