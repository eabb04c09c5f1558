//! End-to-end pipeline scenarios driven by the mock host and mock LLM
//! provider against an in-memory store: discovery and tiering, runtime
//! budgets, self-healing, credit caps, crash resume, and alerting.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};

use ss_core::config::Config;
use ss_core::score;
use ss_core::store::RepoStore;
use ss_core::types::{
    AlertLevel, BatchState, BatchStatus, RepoResult, RepoResultStatus, Repository, Tier,
};
use ss_daemon::batch::BatchRunner;
use ss_daemon::discovery::DiscoveryEngine;
use ss_daemon::fetcher::Fetcher;
use ss_github::MockHost;
use ss_harness::credits::CreditLedger;
use ss_harness::rate_limiter::{RateGovernor, RateLimitConfig};
use ss_harness::shutdown::ShutdownSignal;
use ss_intelligence::{LlmError, MockProvider, ModelCatalog, RepoAnalyzer};

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

fn make_repo(
    full_name: &str,
    stars: u32,
    forks: u32,
    topics: &[&str],
    age_days: i64,
    pushed_days: i64,
) -> Repository {
    let (owner, name) = full_name.split_once('/').unwrap();
    let now = Utc::now();
    Repository {
        id: full_name.replace('/', "-"),
        owner: owner.into(),
        name: name.into(),
        full_name: full_name.into(),
        description: Some("scenario repo".into()),
        stars,
        forks,
        open_issues: 2,
        language: Some("Python".into()),
        topics: topics.iter().map(|s| s.to_string()).collect(),
        created_at: now - ChronoDuration::days(age_days),
        updated_at: now,
        pushed_at: Some(now - ChronoDuration::days(pushed_days)),
        is_archived: false,
        is_fork: false,
        html_url: format!("https://github.com/{full_name}"),
        default_branch: "main".into(),
        discovered_at: now,
    }
}

struct Pipeline {
    store: Arc<RepoStore>,
    runner: BatchRunner,
    provider: Arc<MockProvider>,
    catalog: ModelCatalog,
}

async fn pipeline(config: Config, provider: MockProvider, host: MockHost) -> Pipeline {
    let config = Arc::new(config);
    let store = Arc::new(RepoStore::new_in_memory().await.unwrap());
    let provider = Arc::new(provider);
    let catalog = ModelCatalog::default();
    let fetcher = Arc::new(Fetcher::new(
        Arc::new(host),
        Arc::new(RateGovernor::new(RateLimitConfig::per_second(100_000))),
        Duration::from_secs(30),
    ));
    let analyzer = Arc::new(RepoAnalyzer::new(provider.clone(), catalog.clone()));
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
    Pipeline {
        store,
        runner,
        provider,
        catalog,
    }
}

async fn seed(store: &RepoStore, repo: &Repository) {
    store.upsert_repository(repo).await.unwrap();
    store
        .upsert_tier(
            &repo.id,
            repo.stars,
            repo.star_velocity(Utc::now()),
            score::engagement_score(repo, None),
        )
        .await
        .unwrap();
}

fn fast_batch_config() -> Config {
    let mut config = Config::default();
    config.batch.delay_between_analyses_ms = 10;
    config.batch.retry_delay_ms = 10;
    config.batch.recovery_delay_ms = 50;
    config.batch.health_check_interval_ms = 100;
    config
}

// ---------------------------------------------------------------------------
// S1 — discovery + tiering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn discovery_assigns_tiers_on_first_sighting() {
    let a = make_repo("hot/agent-framework", 15_000, 900, &["ai", "llm"], 30, 1);
    let b = make_repo("steady/ml-utils", 120, 30, &["ml"], 1095, 14);
    let c = make_repo("quiet/old-script", 5, 0, &[], 400, 400);

    let host = MockHost::new().with_search_results(vec![a.clone(), b.clone(), c.clone()]);
    let store = Arc::new(RepoStore::new_in_memory().await.unwrap());
    let fetcher = Arc::new(Fetcher::new(
        Arc::new(host),
        Arc::new(RateGovernor::new(RateLimitConfig::per_second(100_000))),
        Duration::from_secs(30),
    ));
    let mut discovery_config = Config::default().discovery;
    discovery_config.min_stars = 0;
    let engine = DiscoveryEngine::new(fetcher, store.clone(), discovery_config);

    let outcome = engine.run(1000).await.unwrap();
    assert_eq!(outcome.stored, 3);
    assert_eq!(store.repository_count().await.unwrap(), 3);

    for (repo, expected_tier) in [(&a, Tier::One), (&b, Tier::Two), (&c, Tier::Three)] {
        let assignment = store
            .get_tier_assignment(&repo.id)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("missing tier for {}", repo.full_name));
        assert_eq!(
            assignment.tier, expected_tier,
            "wrong tier for {}",
            repo.full_name
        );

        let metrics = store.comprehensive_metrics(&repo.id).await.unwrap().unwrap();
        assert_eq!(metrics.snapshots.len(), 1);
        assert!(metrics.latest_analysis.is_none(), "no analyses yet");
    }
}

// ---------------------------------------------------------------------------
// S2 — runtime budget
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn batch_respects_the_runtime_budget() {
    let mut config = Config::default();
    config.batch.max_batch_runtime_ms = 60_000;
    config.batch.delay_between_analyses_ms = 2_000;

    let provider = MockProvider::new().with_latency(Duration::from_secs(3));
    let p = pipeline(config, provider, MockHost::new()).await;

    let names: Vec<String> = (0..40).map(|i| format!("acme/overdue{i:02}")).collect();
    for name in &names {
        seed(&p.store, &make_repo(name, 200, 20, &["ai"], 400, 2)).await;
    }

    let started = tokio::time::Instant::now();
    let state = p
        .runner
        .run_with_budget("budgeted", names.clone(), Duration::from_secs(60), false)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(
        elapsed >= Duration::from_secs(58) && elapsed <= Duration::from_secs(62),
        "cycle took {elapsed:?}"
    );
    assert_eq!(state.status, BatchStatus::Stopped);
    assert!(state.completed <= 15, "completed {}", state.completed);
    assert!(state.completed > 0);

    // Analyzed repos were pushed out; the truncated remainder is still due
    // sooner than anything scanned this cycle.
    let analyzed = state.results[0].repo_id.clone();
    let analyzed_due = p
        .store
        .get_tier_assignment(&analyzed)
        .await
        .unwrap()
        .unwrap()
        .next_scan_due;
    let unprocessed = names.last().unwrap();
    let unprocessed_repo = p
        .store
        .get_repository_by_full_name(unprocessed)
        .await
        .unwrap()
        .unwrap();
    let unprocessed_due = p
        .store
        .get_tier_assignment(&unprocessed_repo.id)
        .await
        .unwrap()
        .unwrap()
        .next_scan_due;
    assert!(unprocessed_due < analyzed_due);
}

// ---------------------------------------------------------------------------
// S3 — self-healing
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn batch_recovers_from_a_failure_streak() {
    let mut config = fast_batch_config();
    config.batch.max_retries = 1;
    config.batch.max_consecutive_failures = 5;
    config.batch.max_recovery_attempts = 3;
    config.batch.recovery_delay_ms = 1_000;
    // Five failures out of ten would trip the 0.5 success-rate monitor;
    // the scenario is about recovery, not the health monitor.
    config.batch.min_success_rate = 0.3;

    let provider = MockProvider::new();
    for _ in 0..5 {
        provider.push_error(LlmError::Unavailable("llm down".into()));
    }
    let p = pipeline(config, provider, MockHost::new()).await;

    let names: Vec<String> = (0..10).map(|i| format!("acme/flaky{i}")).collect();
    for name in &names {
        seed(&p.store, &make_repo(name, 200, 20, &["ai"], 400, 2)).await;
    }

    let state = p.runner.run("healing", names).await.unwrap();

    assert_eq!(state.status, BatchStatus::Completed);
    assert_eq!(state.recovery_attempts, 1);
    assert!(state.checkpoint.is_some(), "recovery wrote a checkpoint");
    assert_eq!(state.failed, 5);
    assert!(state.completed >= state.total - 5);
    assert_eq!(state.processed(), state.total);

    let checkpoint = state.checkpoint.unwrap();
    assert_eq!(checkpoint.failed_repos.len(), 5);
    assert_eq!(checkpoint.remaining_repos.len(), 5);
}

// ---------------------------------------------------------------------------
// S4 — credit cap
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn batch_stops_cleanly_at_the_credit_cap() {
    let mut config = fast_batch_config();
    config.credits.max_per_batch = 10.0;
    config.credits.estimated_per_repo = 2.0;

    let p = pipeline(config, MockProvider::new(), MockHost::new()).await;

    let names: Vec<String> = (0..20).map(|i| format!("acme/costly{i:02}")).collect();
    for name in &names {
        // Steady tier-2 repos route to the medium model at 2 credits each.
        seed(&p.store, &make_repo(name, 120, 30, &["ml"], 1095, 14)).await;
    }

    let state = p.runner.run("capped", names).await.unwrap();

    assert_eq!(state.status, BatchStatus::Stopped);
    assert_eq!(state.completed + state.failed, 5);
    assert!((state.credits.actual - 10.0).abs() < 1e-9);
    assert!(state
        .health
        .message
        .as_deref()
        .unwrap()
        .contains("credit limit"));
}

// ---------------------------------------------------------------------------
// S5 — crash resume
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn batch_resumes_from_durable_state_after_a_crash() {
    let config = fast_batch_config();
    let p = pipeline(config.clone(), MockProvider::new(), MockHost::new()).await;

    let names: Vec<String> = (0..30).map(|i| format!("acme/resume{i:02}")).collect();
    for name in &names {
        seed(&p.store, &make_repo(name, 200, 20, &["ai"], 400, 2)).await;
    }

    // A previous process analyzed ten repos, persisted state, and died
    // without finalizing: status is still `running` in the store.
    let mut crashed = BatchState::new(
        "crashy",
        names.clone(),
        config.credits.estimated_per_repo,
        config.credits.max_per_batch,
    );
    crashed.transition(BatchStatus::Running);
    for name in names.iter().take(10) {
        crashed.completed += 1;
        crashed.results.push(RepoResult {
            repo_id: name.replace('/', "-"),
            full_name: name.clone(),
            status: RepoResultStatus::Success,
            duration_ms: 1_000,
            credits_used: 2.0,
            error: None,
            completed_at: Utc::now(),
        });
    }
    crashed.credits.actual = 20.0;
    p.store.put_batch(&crashed).await.unwrap();

    let state = p.runner.run("crashy", names.clone()).await.unwrap();

    assert_eq!(state.status, BatchStatus::Completed);
    assert_eq!(state.completed + state.failed + state.skipped, 30);
    assert_eq!(state.results.len(), 30);

    // No repo analyzed twice.
    let mut seen: Vec<&str> = state.results.iter().map(|r| r.full_name.as_str()).collect();
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 30);

    // The resumed run only called the provider for the remaining twenty.
    assert_eq!(p.provider.captured_requests().len(), 20);
}

// ---------------------------------------------------------------------------
// S6 — alerting
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn high_investment_analysis_emits_one_urgent_alert() {
    let config = fast_batch_config();
    let provider = MockProvider::new()
        .with_response(MockProvider::analysis_response("ignored", 92.0, 80.0));
    let p = pipeline(config, provider, MockHost::new()).await;

    // Tier-1 repo: very high growth routes to the high model.
    let repo = make_repo("hot/rocket", 15_000, 900, &["ai", "llm"], 30, 1);
    seed(&p.store, &repo).await;

    let state = p
        .runner
        .run("alerting", vec![repo.full_name.clone()])
        .await
        .unwrap();
    assert_eq!(state.completed, 1);

    let alerts = p.store.list_alerts(10).await.unwrap();
    assert_eq!(alerts.len(), 1, "exactly one alert");
    let alert = &alerts[0];
    assert_eq!(alert.level, AlertLevel::Urgent);
    assert_eq!(alert.alert_type, "investment_opportunity");

    let metadata = alert.metadata.as_ref().unwrap();
    assert_eq!(metadata["investment_score"], serde_json::json!(92.0));
    assert_eq!(
        metadata["model_used"],
        serde_json::json!(p.catalog.high.id.clone())
    );

    // A forced re-analysis inside the freshness window does not re-alert.
    p.provider
        .push_response(MockProvider::analysis_response("ignored", 92.0, 80.0));
    p.runner
        .run_with_budget(
            "alerting-again",
            vec![repo.full_name.clone()],
            Duration::from_secs(300),
            true,
        )
        .await
        .unwrap();
    assert_eq!(p.store.list_alerts(10).await.unwrap().len(), 1);
}
