use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use ss_core::types::{CommitMetric, Contributor, Repository};

use crate::client::{GitHubClient, HostError, Result};
use crate::metrics;
use crate::search;
use crate::types::{ForkAnalysis, Issue, PullRequest, RateLimitInfo, Release, StarPoint};

// ---------------------------------------------------------------------------
// RepoHost trait
// ---------------------------------------------------------------------------

/// Capabilities the pipeline consumes from a code host. The GitHub client
/// is the production implementation; [`MockHost`] drives tests.
#[async_trait]
pub trait RepoHost: Send + Sync {
    async fn search(
        &self,
        query: &str,
        sort: &str,
        order: &str,
        per_page: u8,
    ) -> Result<Vec<Repository>>;

    async fn get_repository(&self, owner: &str, name: &str) -> Result<Repository>;

    async fn get_readme(&self, owner: &str, name: &str) -> Result<String>;

    async fn get_contributors(
        &self,
        owner: &str,
        name: &str,
        repo_id: &str,
        limit: u8,
    ) -> Result<Vec<Contributor>>;

    async fn get_commit_activity(&self, owner: &str, name: &str) -> Result<Vec<CommitMetric>>;

    async fn get_releases(&self, owner: &str, name: &str, limit: u8) -> Result<Vec<Release>>;

    async fn get_pull_requests(&self, owner: &str, name: &str, limit: u8)
        -> Result<Vec<PullRequest>>;

    async fn get_issues(&self, owner: &str, name: &str, limit: u8) -> Result<Vec<Issue>>;

    async fn get_star_history(&self, owner: &str, name: &str, days: i64)
        -> Result<Vec<StarPoint>>;

    async fn get_fork_analysis(&self, owner: &str, name: &str) -> Result<ForkAnalysis>;

    async fn rate_limit(&self) -> Result<RateLimitInfo>;
}

#[async_trait]
impl RepoHost for GitHubClient {
    async fn search(
        &self,
        query: &str,
        sort: &str,
        order: &str,
        per_page: u8,
    ) -> Result<Vec<Repository>> {
        search::search(self, query, sort, order, per_page).await
    }

    async fn get_repository(&self, owner: &str, name: &str) -> Result<Repository> {
        metrics::get_repository(self, owner, name).await
    }

    async fn get_readme(&self, owner: &str, name: &str) -> Result<String> {
        metrics::get_readme(self, owner, name).await
    }

    async fn get_contributors(
        &self,
        owner: &str,
        name: &str,
        repo_id: &str,
        limit: u8,
    ) -> Result<Vec<Contributor>> {
        metrics::get_contributors(self, owner, name, repo_id, limit).await
    }

    async fn get_commit_activity(&self, owner: &str, name: &str) -> Result<Vec<CommitMetric>> {
        metrics::get_commit_activity(self, owner, name).await
    }

    async fn get_releases(&self, owner: &str, name: &str, limit: u8) -> Result<Vec<Release>> {
        metrics::get_releases(self, owner, name, limit).await
    }

    async fn get_pull_requests(
        &self,
        owner: &str,
        name: &str,
        limit: u8,
    ) -> Result<Vec<PullRequest>> {
        metrics::get_pull_requests(self, owner, name, limit).await
    }

    async fn get_issues(&self, owner: &str, name: &str, limit: u8) -> Result<Vec<Issue>> {
        metrics::get_issues(self, owner, name, limit).await
    }

    async fn get_star_history(
        &self,
        owner: &str,
        name: &str,
        days: i64,
    ) -> Result<Vec<StarPoint>> {
        metrics::get_star_history(self, owner, name, days).await
    }

    async fn get_fork_analysis(&self, owner: &str, name: &str) -> Result<ForkAnalysis> {
        metrics::get_fork_analysis(self, owner, name).await
    }

    async fn rate_limit(&self) -> Result<RateLimitInfo> {
        metrics::rate_limit(self).await
    }
}

// ---------------------------------------------------------------------------
// MockHost
// ---------------------------------------------------------------------------

/// A scriptable host for tests.
///
/// Seed it with repositories and readmes; `search` returns the seeded set
/// for every query. Errors can be queued to fail the next N repository
/// lookups.
#[derive(Default)]
pub struct MockHost {
    repos: Mutex<HashMap<String, Repository>>,
    readmes: Mutex<HashMap<String, String>>,
    search_results: Mutex<Vec<Repository>>,
    queued_errors: Mutex<VecDeque<HostError>>,
    search_calls: AtomicU32,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_repository(self, repo: Repository) -> Self {
        self.add_repository(repo);
        self
    }

    pub fn add_repository(&self, repo: Repository) {
        self.repos
            .lock()
            .unwrap()
            .insert(repo.full_name.clone(), repo);
    }

    pub fn with_search_results(self, repos: Vec<Repository>) -> Self {
        *self.search_results.lock().unwrap() = repos;
        self
    }

    pub fn with_readme(self, full_name: &str, text: &str) -> Self {
        self.readmes
            .lock()
            .unwrap()
            .insert(full_name.to_string(), text.to_string());
        self
    }

    /// Queue an error to be returned by the next repository lookup.
    pub fn queue_error(&self, err: HostError) {
        self.queued_errors.lock().unwrap().push_back(err);
    }

    pub fn search_calls(&self) -> u32 {
        self.search_calls.load(Ordering::SeqCst)
    }

    fn pop_error(&self) -> Option<HostError> {
        self.queued_errors.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl RepoHost for MockHost {
    async fn search(
        &self,
        _query: &str,
        _sort: &str,
        _order: &str,
        per_page: u8,
    ) -> Result<Vec<Repository>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        let results = self.search_results.lock().unwrap().clone();
        Ok(results.into_iter().take(per_page as usize).collect())
    }

    async fn get_repository(&self, owner: &str, name: &str) -> Result<Repository> {
        if let Some(err) = self.pop_error() {
            return Err(err);
        }
        let full_name = format!("{owner}/{name}");
        self.repos
            .lock()
            .unwrap()
            .get(&full_name)
            .cloned()
            .ok_or(HostError::NotFound)
    }

    async fn get_readme(&self, owner: &str, name: &str) -> Result<String> {
        let full_name = format!("{owner}/{name}");
        Ok(self
            .readmes
            .lock()
            .unwrap()
            .get(&full_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_contributors(
        &self,
        _owner: &str,
        _name: &str,
        _repo_id: &str,
        _limit: u8,
    ) -> Result<Vec<Contributor>> {
        Ok(Vec::new())
    }

    async fn get_commit_activity(&self, _owner: &str, _name: &str) -> Result<Vec<CommitMetric>> {
        Ok(Vec::new())
    }

    async fn get_releases(&self, _owner: &str, _name: &str, _limit: u8) -> Result<Vec<Release>> {
        Ok(Vec::new())
    }

    async fn get_pull_requests(
        &self,
        _owner: &str,
        _name: &str,
        _limit: u8,
    ) -> Result<Vec<PullRequest>> {
        Ok(Vec::new())
    }

    async fn get_issues(&self, _owner: &str, _name: &str, _limit: u8) -> Result<Vec<Issue>> {
        Ok(Vec::new())
    }

    async fn get_star_history(
        &self,
        _owner: &str,
        _name: &str,
        _days: i64,
    ) -> Result<Vec<StarPoint>> {
        Ok(Vec::new())
    }

    async fn get_fork_analysis(&self, _owner: &str, _name: &str) -> Result<ForkAnalysis> {
        Ok(ForkAnalysis {
            total: 0,
            recent_30d: 0,
        })
    }

    async fn rate_limit(&self) -> Result<RateLimitInfo> {
        Ok(RateLimitInfo {
            limit: 5000,
            remaining: 5000,
            reset_at: Utc::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
