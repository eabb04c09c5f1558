//! Tier scan planning: which repositories each tier processes this cycle.
//!
//! Ordering within a tier comes from the store query: most overdue
//! `next_scan_due` first, then stars, then push recency. Tier 1 repos get
//! deep scans; the top ten due tier-2 repos are promoted to deep; tier 3
//! only ever gets basic scans here.

use std::sync::Arc;

use ss_core::config::Config;
use ss_core::store::{RepoStore, StoreError};
use ss_core::types::{Repository, ScanKind, Tier};

/// Tier-2 repos promoted to a deep scan per cycle.
const TIER2_DEEP_PROMOTIONS: usize = 10;

#[derive(Debug, Clone)]
pub struct PlannedScan {
    pub repo: Repository,
    pub tier: Tier,
    pub kind: ScanKind,
}

/// The work a single cycle should do.
#[derive(Debug, Default, Clone)]
pub struct ScanPlan {
    pub scans: Vec<PlannedScan>,
    /// Repositories due for an LLM analysis this cycle, tier order.
    pub batch_pool: Vec<Repository>,
}

impl ScanPlan {
    pub fn scans_for_tier(&self, tier: Tier) -> usize {
        self.scans.iter().filter(|s| s.tier == tier).count()
    }
}

pub struct TierScanPlanner {
    store: Arc<RepoStore>,
    config: Arc<Config>,
}

impl TierScanPlanner {
    pub fn new(store: Arc<RepoStore>, config: Arc<Config>) -> Self {
        Self { store, config }
    }

    /// Plan one cycle: per-tier scan lists plus the analysis pool.
    pub async fn plan_cycle(&self, force: bool) -> Result<ScanPlan, StoreError> {
        let mut plan = ScanPlan::default();

        for tier in Tier::ALL {
            let policy = self.config.tier_policy(tier);
            let (kind, interval_hours) = match tier {
                Tier::One => (ScanKind::Deep, policy.deep_scan_days * 24),
                _ => (ScanKind::Basic, policy.basic_scan_days * 24),
            };
            let due = self
                .store
                .get_repos_needing_scan(tier, kind, interval_hours, force, policy.hourly_batch_limit)
                .await?;

            for (rank, repo) in due.into_iter().enumerate() {
                let kind = match tier {
                    Tier::One => ScanKind::Deep,
                    Tier::Two if rank < TIER2_DEEP_PROMOTIONS => ScanKind::Deep,
                    _ => ScanKind::Basic,
                };
                plan.scans.push(PlannedScan { repo, tier, kind });
            }
        }

        plan.batch_pool = self.batch_pool(self.config.batch.pool_max, force).await?;
        Ok(plan)
    }

    /// Repositories whose latest analysis is stale, drawn across tiers in
    /// priority order up to `cap`. The per-tier freshness window decides
    /// staleness.
    pub async fn batch_pool(&self, cap: u32, force: bool) -> Result<Vec<Repository>, StoreError> {
        let mut pool: Vec<Repository> = Vec::new();
        for tier in Tier::ALL {
            if pool.len() >= cap as usize {
                break;
            }
            let policy = self.config.tier_policy(tier);
            let candidates = self
                .store
                .get_repos_needing_scan(tier, ScanKind::Deep, policy.freshness_hours, force, cap)
                .await?;
            for repo in candidates {
                if pool.len() >= cap as usize {
                    break;
                }
                if !force
                    && self
                        .store
                        .has_recent_analysis(&repo.id, policy.freshness_hours)
                        .await?
                {
                    continue;
                }
                pool.push(repo);
            }
        }
        Ok(pool)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
