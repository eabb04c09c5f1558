//! Multi-strategy repository discovery.
//!
//! Runs topic/language search strategies in parallel, deduplicates by
//! `full_name`, bounds the result set, and persists every survivor:
//! repository row, initial metric snapshot, and tier assignment.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures_util::{stream, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use ss_core::config::{DiscoveryConfig, TierPolicy};
use ss_core::score::{self, RepoSignals};
use ss_core::store::{RepoStore, StoreError};
use ss_core::types::{RepoMetricSnapshot, Repository, ScanKind};
use ss_github::search::build_strategies;

use crate::fetcher::Fetcher;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Counters for one discovery run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryOutcome {
    pub strategies: u32,
    pub fetched: u32,
    pub unique: u32,
    pub stored: u32,
}

pub struct DiscoveryEngine {
    fetcher: Arc<Fetcher>,
    store: Arc<RepoStore>,
    config: DiscoveryConfig,
}

impl DiscoveryEngine {
    pub fn new(fetcher: Arc<Fetcher>, store: Arc<RepoStore>, config: DiscoveryConfig) -> Self {
        Self {
            fetcher,
            store,
            config,
        }
    }

    /// Run discovery with the given total-result cap. A failed strategy is
    /// logged and skipped; it never aborts the run. Store failures do.
    pub async fn run(&self, limit: u32) -> Result<DiscoveryOutcome, DiscoveryError> {
        let strategies = build_strategies(
            &self.config.topics,
            &self.config.languages,
            self.config.min_stars,
            self.config.max_strategies,
        );
        let per_page = limit.min(100) as u8;

        let mut outcome = DiscoveryOutcome {
            strategies: strategies.len() as u32,
            ..DiscoveryOutcome::default()
        };

        let results: Vec<_> = stream::iter(strategies)
            .map(|strategy| {
                let fetcher = self.fetcher.clone();
                async move {
                    let query = strategy.to_query();
                    let result = fetcher.search(&query, "stars", "desc", per_page).await;
                    (query, result)
                }
            })
            .buffer_unordered(self.config.concurrent_searches.max(1))
            .collect()
            .await;

        let mut seen: HashSet<String> = HashSet::new();
        let mut unique: Vec<Repository> = Vec::new();
        for (query, result) in results {
            match result {
                Ok(repos) => {
                    outcome.fetched += repos.len() as u32;
                    for repo in repos {
                        if unique.len() >= limit as usize {
                            break;
                        }
                        if repo.is_archived || repo.is_fork || repo.stars < self.config.min_stars {
                            continue;
                        }
                        if seen.insert(repo.full_name.clone()) {
                            unique.push(repo);
                        }
                    }
                }
                Err(err) => {
                    warn!(query, error = %err, "search strategy failed, skipping");
                }
            }
        }
        outcome.unique = unique.len() as u32;

        let now = Utc::now();
        for repo in &unique {
            self.store.upsert_repository(repo).await?;
            self.store
                .upsert_metrics_batch(&[RepoMetricSnapshot::from_repository(repo, now)])
                .await?;

            let velocity = repo.star_velocity(now);
            let engagement = score::engagement_score(repo, None);
            self.store
                .upsert_tier(&repo.id, repo.stars, velocity, engagement)
                .await?;
            outcome.stored += 1;
        }

        info!(
            strategies = outcome.strategies,
            fetched = outcome.fetched,
            unique = outcome.unique,
            stored = outcome.stored,
            "discovery run completed"
        );
        Ok(outcome)
    }

    /// Refresh one repository's metrics during a planned tier scan.
    ///
    /// Basic scans re-fetch the repository and append a snapshot; deep
    /// scans additionally gather the enhanced signal set (contributors,
    /// commit volume, releases, PR/issue activity, fork recency, star
    /// history, README presence) and feed it into the tier recompute.
    /// Host failures are isolated to this repo (logged, `Ok(false)`); the
    /// scan stamp is only advanced on success.
    pub async fn refresh_repository(
        &self,
        repo: &Repository,
        kind: ScanKind,
        policy: &TierPolicy,
    ) -> Result<bool, DiscoveryError> {
        let fresh = match self.fetcher.get_repository(&repo.owner, &repo.name).await {
            Ok(r) => r,
            Err(err) => {
                warn!(repo = %repo.full_name, error = %err, "refresh fetch failed");
                return Ok(false);
            }
        };

        let now = Utc::now();
        self.store.upsert_repository(&fresh).await?;

        let mut snapshot = RepoMetricSnapshot::from_repository(&fresh, now);
        let mut signals = RepoSignals::default();
        if kind == ScanKind::Deep {
            signals = self.fetcher.gather_signals(&fresh).await;

            match self
                .fetcher
                .get_contributors(&fresh.owner, &fresh.name, &fresh.id, 30)
                .await
            {
                Ok(contributors) => {
                    signals.contributors = Some(contributors.len() as u32);
                    self.store.save_contributors(&fresh.id, &contributors).await?;
                }
                Err(err) => {
                    warn!(repo = %fresh.full_name, error = %err, "contributor fetch failed");
                }
            }
            match self.fetcher.get_readme(&fresh.owner, &fresh.name).await {
                Ok(text) => signals.has_readme = !text.trim().is_empty(),
                Err(err) => {
                    warn!(repo = %fresh.full_name, error = %err, "readme fetch failed");
                }
            }

            snapshot.contributors = signals.contributors;
            snapshot.commits_count = signals.commits_last_month;
        }
        self.store.upsert_metrics_batch(&[snapshot]).await?;

        let velocity = fresh.star_velocity(now);
        let engagement = score::engagement_score(&fresh, signals.contributors);
        self.store
            .upsert_tier_with_signals(&fresh.id, fresh.stars, velocity, engagement, &signals)
            .await?;

        let next_due_hours = match kind {
            ScanKind::Deep => policy.deep_scan_days * 24,
            ScanKind::Basic => policy.basic_scan_days * 24,
        };
        self.store
            .mark_scanned(&fresh.id, kind, next_due_hours)
            .await?;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
