//! The external fetcher: every outbound call to the code host or the LLM
//! goes through here. The fetcher acquires from the rate-limit governor,
//! caps process-wide concurrency at six connections, applies per-call
//! timeouts, and retries transient host failures with exponential backoff.
//!
//! LLM analysis calls are deliberately NOT retried here; the batch
//! orchestrator owns analysis retries so its consecutive-failure
//! accounting sees every attempt.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::warn;

use ss_core::score::{ModelTier, RepoSignals};
use ss_core::types::{Analysis, CommitMetric, Contributor, Repository};
use ss_github::types::{ForkAnalysis, Issue, PullRequest, RateLimitInfo, Release, StarPoint};
use ss_github::{HostError, RepoHost};
use ss_harness::rate_limiter::{RateGovernor, RateLimitError};
use ss_harness::retry::{with_retry, RetryConfig};
use ss_intelligence::{LlmError, RepoAnalyzer};

/// Platform limit on simultaneous outbound connections.
pub const MAX_OUTBOUND_CONNECTIONS: usize = 6;

/// Governor endpoint keys.
pub const EP_SEARCH: &str = "host.search";
pub const EP_CORE: &str = "host.core";
pub const EP_LLM: &str = "llm.analyze";

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("host: {0}")]
    Host(#[from] HostError),
    #[error("llm: {0}")]
    Llm(#[from] LlmError),
    #[error("governor: {0}")]
    Governor(#[from] RateLimitError),
}

impl FetchError {
    /// Whether the underlying failure is worth retrying later.
    pub fn is_transient(&self) -> bool {
        use ss_harness::retry::Transient;
        match self {
            FetchError::Host(e) => e.is_transient(),
            FetchError::Llm(e) => e.is_transient(),
            FetchError::Governor(_) => false,
        }
    }
}

pub struct Fetcher {
    host: Arc<dyn RepoHost>,
    governor: Arc<RateGovernor>,
    connections: Arc<Semaphore>,
    retry: RetryConfig,
    host_timeout: Duration,
}

impl Fetcher {
    pub fn new(host: Arc<dyn RepoHost>, governor: Arc<RateGovernor>, host_timeout: Duration) -> Self {
        Self {
            host,
            governor,
            connections: Arc::new(Semaphore::new(MAX_OUTBOUND_CONNECTIONS)),
            retry: RetryConfig::default(),
            host_timeout,
        }
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn governor(&self) -> &Arc<RateGovernor> {
        &self.governor
    }

    /// Governor-gated, retried, timed-out host call.
    async fn call_host<T, F, Fut>(&self, endpoint: &str, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HostError>>,
    {
        self.governor.acquire(endpoint, 1.0).await?;
        let result = with_retry(&self.retry, endpoint, || {
            let fut = op();
            let connections = self.connections.clone();
            let timeout = self.host_timeout;
            async move {
                let _permit = connections
                    .acquire_owned()
                    .await
                    .map_err(|_| HostError::Unavailable("connection gate closed".into()))?;
                match tokio::time::timeout(timeout, fut).await {
                    Ok(res) => res,
                    Err(_) => Err(HostError::Unavailable("request timed out".into())),
                }
            }
        })
        .await?;
        Ok(result)
    }

    pub async fn search(
        &self,
        query: &str,
        sort: &str,
        order: &str,
        per_page: u8,
    ) -> Result<Vec<Repository>, FetchError> {
        self.call_host(EP_SEARCH, || {
            self.host.search(query, sort, order, per_page)
        })
        .await
    }

    pub async fn get_repository(&self, owner: &str, name: &str) -> Result<Repository, FetchError> {
        self.call_host(EP_CORE, || self.host.get_repository(owner, name))
            .await
    }

    pub async fn get_readme(&self, owner: &str, name: &str) -> Result<String, FetchError> {
        self.call_host(EP_CORE, || self.host.get_readme(owner, name))
            .await
    }

    pub async fn get_contributors(
        &self,
        owner: &str,
        name: &str,
        repo_id: &str,
        limit: u8,
    ) -> Result<Vec<Contributor>, FetchError> {
        self.call_host(EP_CORE, || {
            self.host.get_contributors(owner, name, repo_id, limit)
        })
        .await
    }

    pub async fn get_commit_activity(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<Vec<CommitMetric>, FetchError> {
        self.call_host(EP_CORE, || self.host.get_commit_activity(owner, name))
            .await
    }

    pub async fn get_releases(
        &self,
        owner: &str,
        name: &str,
        limit: u8,
    ) -> Result<Vec<Release>, FetchError> {
        self.call_host(EP_CORE, || self.host.get_releases(owner, name, limit))
            .await
    }

    pub async fn get_pull_requests(
        &self,
        owner: &str,
        name: &str,
        limit: u8,
    ) -> Result<Vec<PullRequest>, FetchError> {
        self.call_host(EP_CORE, || self.host.get_pull_requests(owner, name, limit))
            .await
    }

    pub async fn get_issues(
        &self,
        owner: &str,
        name: &str,
        limit: u8,
    ) -> Result<Vec<Issue>, FetchError> {
        self.call_host(EP_CORE, || self.host.get_issues(owner, name, limit))
            .await
    }

    pub async fn get_star_history(
        &self,
        owner: &str,
        name: &str,
        days: i64,
    ) -> Result<Vec<StarPoint>, FetchError> {
        self.call_host(EP_CORE, || self.host.get_star_history(owner, name, days))
            .await
    }

    pub async fn get_fork_analysis(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<ForkAnalysis, FetchError> {
        self.call_host(EP_CORE, || self.host.get_fork_analysis(owner, name))
            .await
    }

    /// The host's own quota for the core REST API.
    pub async fn host_rate_limit(&self) -> Result<RateLimitInfo, FetchError> {
        self.call_host(EP_CORE, || self.host.rate_limit()).await
    }

    /// Best-effort enhanced metrics for a deep scan: releases, pull
    /// requests, issue activity, fork recency, commit volume, and observed
    /// star growth. Each failure is logged and leaves its field unknown.
    ///
    /// Contributor counts and README presence are left to the caller,
    /// which fetches those for its own purposes.
    pub async fn gather_signals(&self, repo: &Repository) -> RepoSignals {
        let mut signals = RepoSignals::default();
        let (owner, name) = (repo.owner.as_str(), repo.name.as_str());
        let month_ago = Utc::now() - chrono::Duration::days(30);

        match self.get_commit_activity(owner, name).await {
            Ok(weeks) => {
                signals.commits_last_month = Some(
                    weeks
                        .iter()
                        .filter(|w| w.week_start >= month_ago)
                        .map(|w| w.commits)
                        .sum(),
                );
            }
            Err(err) => warn!(repo = %repo.full_name, error = %err, "commit activity fetch failed"),
        }
        match self.get_releases(owner, name, 10).await {
            Ok(releases) => signals.recent_releases = Some(releases.len() as u32),
            Err(err) => warn!(repo = %repo.full_name, error = %err, "release fetch failed"),
        }
        match self.get_pull_requests(owner, name, 50).await {
            Ok(prs) => signals.open_prs = Some(prs.len() as u32),
            Err(err) => warn!(repo = %repo.full_name, error = %err, "pull request fetch failed"),
        }
        match self.get_issues(owner, name, 50).await {
            Ok(issues) => {
                signals.active_issues_30d = Some(
                    issues
                        .iter()
                        .filter(|i| i.updated_at.is_some_and(|d| d >= month_ago))
                        .count() as u32,
                );
            }
            Err(err) => warn!(repo = %repo.full_name, error = %err, "issue fetch failed"),
        }
        match self.get_fork_analysis(owner, name).await {
            Ok(forks) => signals.recent_forks_30d = Some(forks.recent_30d),
            Err(err) => warn!(repo = %repo.full_name, error = %err, "fork analysis fetch failed"),
        }
        match self.get_star_history(owner, name, 30).await {
            Ok(points) => {
                if let (Some(first), Some(last)) = (points.first(), points.last()) {
                    if first.stars > 0 && last.stars > first.stars {
                        signals.monthly_growth_pct = Some(
                            (last.stars - first.stars) as f64 / first.stars as f64 * 100.0,
                        );
                    }
                }
            }
            Err(err) => warn!(repo = %repo.full_name, error = %err, "star history fetch failed"),
        }

        signals
    }

    /// One LLM analysis attempt, raced against `timeout`. No retry here —
    /// the batch orchestrator owns the attempt budget.
    pub async fn analyze(
        &self,
        analyzer: &RepoAnalyzer,
        repo: &Repository,
        readme: &str,
        signals: &RepoSignals,
        model_tier: ModelTier,
        timeout: Duration,
    ) -> Result<Analysis, FetchError> {
        self.governor.acquire(EP_LLM, 1.0).await?;
        let _permit = self
            .connections
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Llm(LlmError::Unavailable("connection gate closed".into())))?;
        match tokio::time::timeout(timeout, analyzer.analyze(repo, readme, signals, model_tier)).await {
            Ok(result) => result.map_err(FetchError::Llm),
            Err(_) => Err(FetchError::Llm(LlmError::Timeout)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use ss_github::MockHost;
    use ss_harness::rate_limiter::RateLimitConfig;
    use ss_intelligence::{MockProvider, ModelCatalog};

    fn repo(full_name: &str) -> Repository {
        let (owner, name) = full_name.split_once('/').unwrap();
        let now = Utc::now();
        Repository {
            id: full_name.replace('/', "-"),
            owner: owner.into(),
            name: name.into(),
            full_name: full_name.into(),
            description: None,
            stars: 100,
            forks: 10,
            open_issues: 2,
            language: Some("Rust".into()),
            topics: vec!["ai".into()],
            created_at: now - ChronoDuration::days(60),
            updated_at: now,
            pushed_at: Some(now),
            is_archived: false,
            is_fork: false,
            html_url: String::new(),
            default_branch: "main".into(),
            discovered_at: now,
        }
    }

    fn make_fetcher(host: MockHost) -> Fetcher {
        Fetcher::new(
            Arc::new(host),
            Arc::new(RateGovernor::new(RateLimitConfig::per_second(100))),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn fetches_repository_through_the_gate() {
        let fetcher = make_fetcher(MockHost::new().with_repository(repo("acme/one")));
        let found = fetcher.get_repository("acme", "one").await.unwrap();
        assert_eq!(found.full_name, "acme/one");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_host_errors_are_retried() {
        let host = MockHost::new().with_repository(repo("acme/one"));
        host.queue_error(HostError::Unavailable("502".into()));
        host.queue_error(HostError::Unavailable("503".into()));
        let fetcher = make_fetcher(host);
        // Two transient failures, then success, within the 3-attempt budget.
        let found = fetcher.get_repository("acme", "one").await.unwrap();
        assert_eq!(found.full_name, "acme/one");
    }

    #[tokio::test]
    async fn permanent_host_errors_surface_immediately() {
        let host = MockHost::new();
        let fetcher = make_fetcher(host);
        let err = fetcher.get_repository("acme", "ghost").await.unwrap_err();
        assert!(matches!(err, FetchError::Host(HostError::NotFound)));
        assert!(!err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn analysis_timeout_maps_to_llm_timeout() {
        let fetcher = make_fetcher(MockHost::new());
        let provider = Arc::new(MockProvider::new().with_latency(Duration::from_secs(10)));
        let analyzer = RepoAnalyzer::new(provider, ModelCatalog::default());

        let err = fetcher
            .analyze(
                &analyzer,
                &repo("acme/slow"),
                "",
                &RepoSignals::default(),
                ModelTier::Small,
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Llm(LlmError::Timeout)));
    }

    #[tokio::test]
    async fn host_rate_limit_reports_quota() {
        let fetcher = make_fetcher(MockHost::new());
        let quota = fetcher.host_rate_limit().await.unwrap();
        assert_eq!(quota.limit, 5000);
        assert_eq!(quota.remaining, 5000);
    }

    #[tokio::test]
    async fn gather_signals_leaves_unobserved_fields_unknown() {
        // The bare mock host answers every enhanced endpoint with empty
        // data: counts come back as observed zeros, while star history
        // (empty series) and contributors (never fetched here) stay None.
        let fetcher = make_fetcher(MockHost::new());
        let signals = fetcher.gather_signals(&repo("acme/one")).await;
        assert_eq!(signals.commits_last_month, Some(0));
        assert_eq!(signals.open_prs, Some(0));
        assert_eq!(signals.recent_releases, Some(0));
        assert_eq!(signals.active_issues_30d, Some(0));
        assert_eq!(signals.recent_forks_30d, Some(0));
        assert_eq!(signals.monthly_growth_pct, None);
        assert_eq!(signals.contributors, None);
        assert!(!signals.has_readme);
    }

    #[tokio::test]
    async fn analyze_is_not_retried_by_the_fetcher() {
        let fetcher = make_fetcher(MockHost::new());
        let provider = Arc::new(MockProvider::new().with_error(LlmError::Unavailable("down".into())));
        let analyzer = RepoAnalyzer::new(provider.clone(), ModelCatalog::default());

        let err = fetcher
            .analyze(
                &analyzer,
                &repo("acme/one"),
                "",
                &RepoSignals::default(),
                ModelTier::Small,
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Llm(LlmError::Unavailable(_))));
        // Exactly one provider call: the orchestrator owns retries.
        assert_eq!(provider.captured_requests().len(), 1);
    }
}
