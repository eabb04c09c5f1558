use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use ss_bridge::http_api::{api_router, ApiState};
use ss_bridge::{AnalyzeTarget, EngineCommand};
use ss_core::config::Config;
use ss_core::store::RepoStore;
use ss_core::types::CycleKind;
use ss_github::{GitHubClient, RepoHost};
use ss_harness::credits::CreditLedger;
use ss_harness::rate_limiter::{RateGovernor, RateLimitConfig};
use ss_harness::shutdown::ShutdownSignal;
use ss_intelligence::llm::AnthropicProvider;
use ss_intelligence::{LlmProvider, ModelCatalog, RepoAnalyzer};

use crate::batch::BatchRunner;
use crate::discovery::DiscoveryEngine;
use crate::fetcher::{Fetcher, EP_CORE, EP_LLM, EP_SEARCH};
use crate::planner::TierScanPlanner;
use crate::progress::ProgressTracker;
use crate::scheduler::{CycleController, META_NEXT_TICK};

/// The starscout supervisor: owns the store, the engines, the scheduler
/// loop, and the HTTP facade. Scheduling state lives in the store, so a
/// restarted daemon picks up where the last one stopped.
pub struct Daemon {
    config: Arc<Config>,
    store: Arc<RepoStore>,
    shutdown: ShutdownSignal,
    api_state: Arc<ApiState>,
    command_rx: StdMutex<Option<mpsc::Receiver<EngineCommand>>>,
    controller: Arc<CycleController>,
    discovery: Arc<DiscoveryEngine>,
    batch_runner: Arc<BatchRunner>,
    progress: Arc<ProgressTracker>,
}

impl Daemon {
    /// Build a daemon with the production adapters (GitHub + Anthropic).
    pub async fn new(config: Config) -> Result<Self> {
        let host = GitHubClient::new_from_env(&config.github.token_env)
            .context("building GitHub client")?;
        let api_key = std::env::var(&config.llm.api_key_env).with_context(|| {
            format!("LLM API key env var `{}` is not set", config.llm.api_key_env)
        })?;
        let provider =
            AnthropicProvider::new(api_key, Duration::from_millis(config.llm.timeout_ms));
        Self::with_adapters(config, Arc::new(host), Arc::new(provider)).await
    }

    /// Build a daemon with injected adapters (used by tests).
    pub async fn with_adapters(
        config: Config,
        host: Arc<dyn RepoHost>,
        provider: Arc<dyn LlmProvider>,
    ) -> Result<Self> {
        let db_path = expand_home(&config.general.db_path);
        if let Some(parent) = std::path::Path::new(&db_path).parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let store = Arc::new(RepoStore::new(&db_path).await.context("opening store")?);
        Self::assemble(Arc::new(config), store, host, provider)
    }

    fn assemble(
        config: Arc<Config>,
        store: Arc<RepoStore>,
        host: Arc<dyn RepoHost>,
        provider: Arc<dyn LlmProvider>,
    ) -> Result<Self> {
        let governor = Arc::new(RateGovernor::new(RateLimitConfig::per_second(5)));
        governor.register(
            EP_SEARCH,
            RateLimitConfig::per_minute(config.github.search_per_minute),
        );
        governor.register(
            EP_CORE,
            RateLimitConfig::per_hour(config.github.core_per_hour),
        );
        governor.register(EP_LLM, RateLimitConfig::per_minute(30));

        let shutdown = ShutdownSignal::new();
        let fetcher = Arc::new(Fetcher::new(
            host,
            governor.clone(),
            Duration::from_millis(config.github.timeout_ms),
        ));
        let analyzer = Arc::new(RepoAnalyzer::new(provider, ModelCatalog::default()));
        let ledger = Arc::new(CreditLedger::new(
            config.credits.max_per_batch,
            config.credits.max_per_hour,
        ));

        let discovery = Arc::new(DiscoveryEngine::new(
            fetcher.clone(),
            store.clone(),
            config.discovery.clone(),
        ));
        let planner = Arc::new(TierScanPlanner::new(store.clone(), config.clone()));
        let batch_runner = Arc::new(BatchRunner::new(
            store.clone(),
            fetcher.clone(),
            analyzer,
            ledger,
            config.clone(),
            shutdown.clone(),
        ));
        let progress = Arc::new(ProgressTracker::new(store.clone()));
        let controller = Arc::new(CycleController::new(
            config.clone(),
            store.clone(),
            fetcher,
            discovery.clone(),
            planner,
            batch_runner.clone(),
            progress.clone(),
            shutdown.clone(),
        ));

        let (command_tx, command_rx) = mpsc::channel(64);
        let api_state = Arc::new(ApiState::new(
            store.clone(),
            progress.handle(),
            governor,
            command_tx,
        ));

        Ok(Self {
            config,
            store,
            shutdown,
            api_state,
            command_rx: StdMutex::new(Some(command_rx)),
            controller,
            discovery,
            batch_runner,
            progress,
        })
    }

    /// Handle used by signal handlers to request shutdown.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn api_state(&self) -> &Arc<ApiState> {
        &self.api_state
    }

    /// Run until shutdown: serve the facade, run the scheduler loop, and
    /// process engine commands.
    pub async fn run(&self) -> Result<()> {
        let addr = format!("{}:{}", self.config.daemon.host, self.config.daemon.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding facade to {addr}"))?;
        info!(%addr, "facade listening");

        let router = api_router(self.api_state.clone());
        let api_handle = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router).await {
                error!(error = %err, "facade server error");
            }
        });

        let controller = self.controller.clone();
        let scheduler_handle = tokio::spawn(async move { controller.run_loop().await });

        self.command_loop().await;

        scheduler_handle.await.ok();
        api_handle.abort();
        info!("daemon stopped");
        Ok(())
    }

    async fn command_loop(&self) {
        let mut rx = self
            .command_rx
            .lock()
            .unwrap()
            .take()
            .expect("command loop started twice");
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                _ = shutdown_rx.recv() => break,
            }
        }
    }

    /// Dispatch one facade command. Long work is spawned so the command
    /// loop stays responsive; batches serialize on the runner's own gate.
    pub async fn handle_command(&self, command: EngineCommand) {
        match command {
            EngineCommand::Init => {
                let now = Utc::now();
                if let Err(err) = self.store.put_meta(META_NEXT_TICK, &now.to_rfc3339()).await {
                    error!(error = %err, "init: failed to seed next_tick");
                }
                self.progress.set_next_tick(now).await;
                info!("scheduler initialized");
            }
            EngineCommand::Scan { force: _ } => {
                let discovery = self.discovery.clone();
                let limit = self.config.discovery.manual_limit;
                tokio::spawn(async move {
                    match discovery.run(limit).await {
                        Ok(outcome) => info!(stored = outcome.stored, "manual scan finished"),
                        Err(err) => error!(error = %err, "manual scan failed"),
                    }
                });
            }
            EngineCommand::ComprehensiveScan { force, min_repos } => {
                let controller = self.controller.clone();
                let discovery = self.discovery.clone();
                tokio::spawn(async move {
                    if let Some(min) = min_repos {
                        if let Err(err) = discovery.run(min).await {
                            error!(error = %err, "pre-cycle discovery failed");
                        }
                    }
                    controller.run_cycle(CycleKind::Hourly, force).await;
                });
            }
            EngineCommand::Analyze { target, force } => {
                let full_name = match &target {
                    AnalyzeTarget::ById { repo_id } => {
                        match self.store.get_repository(repo_id).await {
                            Ok(Some(repo)) => repo.full_name,
                            Ok(None) => {
                                warn!(repo_id, "analyze: unknown repo id");
                                return;
                            }
                            Err(err) => {
                                error!(error = %err, "analyze: store lookup failed");
                                return;
                            }
                        }
                    }
                    AnalyzeTarget::ByName { owner, name } => format!("{owner}/{name}"),
                };
                let runner = self.batch_runner.clone();
                let budget = Duration::from_millis(self.config.batch.max_batch_runtime_ms);
                let batch_id = format!(
                    "adhoc-{}-{}",
                    full_name.replace('/', "-"),
                    Utc::now().timestamp()
                );
                tokio::spawn(async move {
                    match runner
                        .run_with_budget(&batch_id, vec![full_name], budget, force)
                        .await
                    {
                        Ok(state) => info!(batch_id, completed = state.completed, "ad-hoc analysis finished"),
                        Err(err) => error!(batch_id, error = %err, "ad-hoc analysis failed"),
                    }
                });
            }
            EngineCommand::StartBatch {
                batch_id,
                repositories,
            } => {
                let runner = self.batch_runner.clone();
                tokio::spawn(async move {
                    match runner.run(&batch_id, repositories).await {
                        Ok(state) => info!(
                            batch_id,
                            status = ?state.status,
                            completed = state.completed,
                            "batch finished"
                        ),
                        Err(err) => error!(batch_id, error = %err, "batch failed"),
                    }
                });
            }
            EngineCommand::StopBatch => {
                self.batch_runner.stop_current();
            }
        }
    }
}

fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return format!("{home}/{rest}");
        }
    }
    path.to_string()
}

fn dirs_home() -> Option<String> {
    std::env::var("HOME").ok().filter(|h| !h.is_empty())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use ss_core::types::Repository;
    use ss_github::MockHost;
    use ss_intelligence::MockProvider;

    fn repo(full_name: &str, stars: u32) -> Repository {
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
            created_at: now - ChronoDuration::days(90),
            updated_at: now,
            pushed_at: Some(now - ChronoDuration::days(1)),
            is_archived: false,
            is_fork: false,
            html_url: String::new(),
            default_branch: "main".into(),
            discovered_at: now,
        }
    }

    async fn make_daemon(host: MockHost) -> Daemon {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.general.db_path = dir
            .path()
            .join("test.db")
            .to_string_lossy()
            .into_owned();
        config.batch.delay_between_analyses_ms = 10;
        config.batch.health_check_interval_ms = 100;
        // Leak the tempdir so the database outlives this constructor.
        std::mem::forget(dir);
        Daemon::with_adapters(config, Arc::new(host), Arc::new(MockProvider::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn init_seeds_the_next_tick() {
        let daemon = make_daemon(MockHost::new()).await;
        assert!(daemon.store.get_meta(META_NEXT_TICK).await.unwrap().is_none());
        daemon.handle_command(EngineCommand::Init).await;
        assert!(daemon.store.get_meta(META_NEXT_TICK).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn manual_scan_discovers_repositories() {
        let host = MockHost::new().with_search_results(vec![repo("acme/found", 300)]);
        let daemon = make_daemon(host).await;
        daemon
            .handle_command(EngineCommand::Scan { force: false })
            .await;

        // The scan runs on a spawned task; poll briefly for its effect.
        for _ in 0..50 {
            if daemon.store.repository_count().await.unwrap() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(daemon.store.repository_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stop_batch_without_a_running_batch_is_a_no_op() {
        let daemon = make_daemon(MockHost::new()).await;
        daemon.handle_command(EngineCommand::StopBatch).await;
    }

    #[tokio::test]
    async fn analyze_unknown_id_is_ignored_gracefully() {
        let daemon = make_daemon(MockHost::new()).await;
        daemon
            .handle_command(EngineCommand::Analyze {
                target: AnalyzeTarget::ById {
                    repo_id: "ghost".into(),
                },
                force: false,
            })
            .await;
    }

    #[test]
    fn home_expansion_only_touches_tilde_paths() {
        std::env::set_var("HOME", "/home/scout");
        assert_eq!(expand_home("~/x/y.db"), "/home/scout/x/y.db");
        assert_eq!(expand_home("/abs/path.db"), "/abs/path.db");
        assert_eq!(expand_home("relative.db"), "relative.db");
    }
}
