//! Scoring and tier classification.
//!
//! Turns raw repository metrics into a composite score, assigns each
//! repository a priority tier, and recommends which LLM model tier an
//! analysis should use. All functions are pure; callers supply `now`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Repository, Tier};

/// Topics that mark a repository as AI/ML-relevant.
const AI_TOPICS: &[&str] = &[
    "ai",
    "artificial-intelligence",
    "machine-learning",
    "ml",
    "deep-learning",
    "llm",
    "llms",
    "nlp",
    "agents",
    "genai",
    "generative-ai",
    "rag",
    "transformers",
    "neural-network",
    "computer-vision",
    "mlops",
];

// ---------------------------------------------------------------------------
// Score
// ---------------------------------------------------------------------------

/// Individual normalized factors feeding the sub-scores, kept for
/// explainability in reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreFactors {
    pub ai_topic_boost: f64,
    pub push_recency: f64,
    pub star_velocity: f64,
    pub readme_presence: f64,
    pub fork_ratio: f64,
}

/// Composite score with sub-scores, all in [0, 100].
///
/// `total = 0.4·growth + 0.3·engagement + 0.3·quality`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub total: f64,
    pub growth: f64,
    pub engagement: f64,
    pub quality: f64,
    pub factors: ScoreFactors,
}

/// Optional enhanced metrics gathered by a deep scan. Missing fields are
/// represented, not zeroed.
#[derive(Debug, Clone, Default)]
pub struct RepoSignals {
    pub has_readme: bool,
    pub contributors: Option<u32>,
    pub commits_last_month: Option<u32>,
    /// Observed month-over-month star growth in percent, when history exists.
    pub monthly_growth_pct: Option<f64>,
    pub open_prs: Option<u32>,
    pub recent_releases: Option<u32>,
    /// Issues with activity in the last 30 days.
    pub active_issues_30d: Option<u32>,
    pub recent_forks_30d: Option<u32>,
}

// ---------------------------------------------------------------------------
// Normalizers
// ---------------------------------------------------------------------------

fn clamp100(v: f64) -> f64 {
    v.clamp(0.0, 100.0)
}

/// 20 stars/day and above saturate the velocity scale.
fn norm_velocity(stars_per_day: f64) -> f64 {
    clamp100(stars_per_day / 20.0 * 100.0)
}

/// 20% monthly growth and above saturate the growth scale.
fn norm_monthly_growth(pct: f64) -> f64 {
    clamp100(pct * 5.0)
}

/// Log-scale popularity: 100k stars saturates.
fn norm_popularity(stars: u32) -> f64 {
    clamp100((stars as f64 + 1.0).log10() / 5.0 * 100.0)
}

/// Pushed within a day scores 100, decaying linearly to 0 at 30 days.
fn norm_push_recency(days_since_push: Option<f64>) -> f64 {
    match days_since_push {
        Some(days) if days <= 1.0 => 100.0,
        Some(days) if days >= 30.0 => 0.0,
        Some(days) => 100.0 * (30.0 - days) / 29.0,
        None => 0.0,
    }
}

/// Fork-to-star ratio, saturating at 0.3.
fn norm_fork_ratio(forks: u32, stars: u32) -> f64 {
    if stars == 0 {
        return 0.0;
    }
    clamp100(forks as f64 / stars as f64 / 0.3 * 100.0)
}

fn ai_topic_boost(topics: &[String]) -> f64 {
    let hits = topics
        .iter()
        .filter(|t| AI_TOPICS.contains(&t.to_lowercase().as_str()))
        .count();
    match hits {
        0 => 0.0,
        1 => 60.0,
        _ => 100.0,
    }
}

/// Estimate monthly growth from lifetime velocity when no metric history
/// exists yet.
pub fn estimated_monthly_growth_pct(stars: u32, velocity: f64) -> f64 {
    if stars == 0 {
        return 0.0;
    }
    velocity * 30.0 / stars as f64 * 100.0
}

// ---------------------------------------------------------------------------
// Composite scoring
// ---------------------------------------------------------------------------

/// Engagement sub-score from repository-level signals alone.
pub fn engagement_score(repo: &Repository, contributors: Option<u32>) -> f64 {
    let fork = norm_fork_ratio(repo.forks, repo.stars);
    let contrib = contributors
        .map(|c| clamp100(c as f64 / 50.0 * 100.0))
        .unwrap_or(0.0);
    let issues = clamp100(repo.open_issues as f64);
    clamp100(0.5 * fork + 0.3 * contrib + 0.2 * issues)
}

/// Compute the full composite score for a repository.
pub fn compute_score(repo: &Repository, signals: &RepoSignals, now: DateTime<Utc>) -> Score {
    let velocity = repo.star_velocity(now);
    let velocity_norm = norm_velocity(velocity);
    let monthly_pct = signals
        .monthly_growth_pct
        .unwrap_or_else(|| estimated_monthly_growth_pct(repo.stars, velocity));

    let growth = clamp100(0.6 * velocity_norm + 0.4 * norm_monthly_growth(monthly_pct));
    let engagement = engagement_score(repo, signals.contributors);

    let recency = norm_push_recency(repo.days_since_push(now));
    let readme = if signals.has_readme { 100.0 } else { 0.0 };
    let boost = ai_topic_boost(&repo.topics);
    let quality = clamp100(0.3 * boost + 0.5 * recency + 0.2 * readme);

    let total = clamp100(0.4 * growth + 0.3 * engagement + 0.3 * quality);

    Score {
        total,
        growth,
        engagement,
        quality,
        factors: ScoreFactors {
            ai_topic_boost: boost,
            push_recency: recency,
            star_velocity: velocity_norm,
            readme_presence: readme,
            fork_ratio: norm_fork_ratio(repo.forks, repo.stars),
        },
    }
}

// ---------------------------------------------------------------------------
// Tier assignment
// ---------------------------------------------------------------------------

/// Tier thresholds. Boundaries are inclusive to the higher tier.
pub fn assign_tier(total: f64, stars: u32, monthly_growth_pct: f64) -> Tier {
    if total >= 70.0 || (stars >= 100 && monthly_growth_pct >= 10.0) {
        Tier::One
    } else if total >= 50.0 || stars >= 50 {
        Tier::Two
    } else {
        Tier::Three
    }
}

/// Tier and scan priority for a repository, from its stored metrics plus
/// whatever signals the caller has observed.
///
/// The store's `upsert_tier` funnels every live tiering path through
/// here, so topics, push recency, and README presence all weigh into the
/// quality term exactly as in [`compute_score`]. Recomputation may demote
/// as well as promote.
pub fn tier_for_assignment(
    repo: &Repository,
    signals: &RepoSignals,
    growth_velocity: f64,
    engagement: f64,
    now: DateTime<Utc>,
) -> (Tier, f64) {
    let monthly_pct = signals
        .monthly_growth_pct
        .unwrap_or_else(|| estimated_monthly_growth_pct(repo.stars, growth_velocity));
    let growth = clamp100(
        0.6 * norm_velocity(growth_velocity) + 0.4 * norm_monthly_growth(monthly_pct),
    );

    let recency = norm_push_recency(repo.days_since_push(now));
    let readme = if signals.has_readme { 100.0 } else { 0.0 };
    let boost = ai_topic_boost(&repo.topics);
    let quality = clamp100(0.3 * boost + 0.5 * recency + 0.2 * readme);

    let total = clamp100(0.4 * growth + 0.3 * engagement.clamp(0.0, 100.0) + 0.3 * quality);
    (assign_tier(total, repo.stars, monthly_pct), total)
}

// ---------------------------------------------------------------------------
// Model recommendation
// ---------------------------------------------------------------------------

/// LLM model class for an analysis, from most to least capable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    High,
    Medium,
    Small,
}

/// Monthly growth at or above this promotes a repo to the High model
/// regardless of its tier.
pub const VERY_HIGH_GROWTH_PCT: f64 = 50.0;

pub fn recommend_model(tier: Tier, monthly_growth_pct: f64) -> ModelTier {
    if monthly_growth_pct >= VERY_HIGH_GROWTH_PCT {
        return ModelTier::High;
    }
    match tier {
        Tier::One => ModelTier::High,
        Tier::Two => ModelTier::Medium,
        Tier::Three => ModelTier::Small,
    }
}

// ---------------------------------------------------------------------------
// Hybrid trending score
// ---------------------------------------------------------------------------

/// Trending score used when historical metrics are missing:
/// `0.35·star_velocity + 0.25·recent_activity + 0.20·momentum +
/// 0.10·popularity + 0.10·fork_activity`, with a momentum multiplier of
/// 1.5 for repos younger than 90 days and 1.2 under 180 days.
pub fn trending_score(repo: &Repository, now: DateTime<Utc>) -> f64 {
    let velocity_norm = norm_velocity(repo.star_velocity(now));
    let recent = norm_push_recency(repo.days_since_push(now));

    let age = repo.age_days(now);
    let multiplier = if age < 90.0 {
        1.5
    } else if age < 180.0 {
        1.2
    } else {
        1.0
    };
    let momentum = clamp100(velocity_norm * multiplier);

    let popularity = norm_popularity(repo.stars);
    let fork_activity = norm_fork_ratio(repo.forks, repo.stars);

    clamp100(
        0.35 * velocity_norm
            + 0.25 * recent
            + 0.20 * momentum
            + 0.10 * popularity
            + 0.10 * fork_activity,
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
