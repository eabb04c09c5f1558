use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Tier
// ---------------------------------------------------------------------------

/// Priority class controlling scan cadence and LLM model choice.
/// Tier 1 is the highest priority, tier 3 the lowest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Tier {
    One = 1,
    Two = 2,
    Three = 3,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::One, Tier::Two, Tier::Three];

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl From<Tier> for u8 {
    fn from(tier: Tier) -> u8 {
        tier as u8
    }
}

impl TryFrom<u8> for Tier {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Tier::One),
            2 => Ok(Tier::Two),
            3 => Ok(Tier::Three),
            other => Err(format!("invalid tier {other}, expected 1..=3")),
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// Canonical record of a discovered project. Created on first sighting,
/// mutated on rescans, never destroyed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    /// Stable id assigned by the code host.
    pub id: String,
    pub owner: String,
    pub name: String,
    /// `owner/name`, unique across the store.
    pub full_name: String,
    pub description: Option<String>,
    pub stars: u32,
    pub forks: u32,
    pub open_issues: u32,
    pub language: Option<String>,
    pub topics: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub pushed_at: Option<DateTime<Utc>>,
    pub is_archived: bool,
    pub is_fork: bool,
    pub html_url: String,
    pub default_branch: String,
    pub discovered_at: DateTime<Utc>,
}

impl Repository {
    /// Age of the repository in days (at least 1 to keep velocity math sane).
    pub fn age_days(&self, now: DateTime<Utc>) -> f64 {
        let days = now.signed_duration_since(self.created_at).num_days();
        (days.max(1)) as f64
    }

    /// Average stars gained per day since creation.
    pub fn star_velocity(&self, now: DateTime<Utc>) -> f64 {
        self.stars as f64 / self.age_days(now)
    }

    /// Days since the last push, or `None` for repos that never pushed.
    pub fn days_since_push(&self, now: DateTime<Utc>) -> Option<f64> {
        self.pushed_at
            .map(|p| now.signed_duration_since(p).num_seconds() as f64 / 86_400.0)
    }
}

// ---------------------------------------------------------------------------
// RepoMetricSnapshot
// ---------------------------------------------------------------------------

/// Point-in-time metrics for a repository. Append-only, keyed by
/// `(repo_id, recorded_at)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoMetricSnapshot {
    pub repo_id: String,
    pub stars: u32,
    pub forks: u32,
    pub open_issues: u32,
    pub watchers: u32,
    pub contributors: Option<u32>,
    pub commits_count: Option<u32>,
    pub recorded_at: DateTime<Utc>,
}

impl RepoMetricSnapshot {
    /// Build a basic snapshot from a repository record.
    pub fn from_repository(repo: &Repository, recorded_at: DateTime<Utc>) -> Self {
        Self {
            repo_id: repo.id.clone(),
            stars: repo.stars,
            forks: repo.forks,
            open_issues: repo.open_issues,
            watchers: repo.stars,
            contributors: None,
            commits_count: None,
            recorded_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Scan kinds & tier assignment
// ---------------------------------------------------------------------------

/// Comprehensive (enhanced metrics + LLM) vs. lightweight metric refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanKind {
    Deep,
    Basic,
}

/// One row per repository: its tier and scan bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierAssignment {
    pub repo_id: String,
    pub tier: Tier,
    pub stars: u32,
    /// Stars gained per day since creation.
    pub growth_velocity: f64,
    pub engagement_score: f64,
    pub scan_priority: f64,
    pub last_deep_scan: Option<DateTime<Utc>>,
    pub last_basic_scan: Option<DateTime<Utc>>,
    pub next_scan_due: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// Investment recommendation. Unknown strings from the LLM are rejected
/// at parse time, never coerced into a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    StrongBuy,
    Buy,
    Hold,
    Pass,
}

/// Numeric scores in [0, 100]. The enhanced dimensions are optional and
/// stay `None` when the model omits them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisScores {
    pub investment: f64,
    pub innovation: f64,
    pub team: f64,
    pub market: f64,
    #[serde(default)]
    pub technical_moat: Option<f64>,
    #[serde(default)]
    pub scalability: Option<f64>,
    #[serde(default)]
    pub developer_adoption: Option<f64>,
}

/// LLM artifact for one repository. Append-only; the "latest" analysis
/// is the one with the greatest `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub id: Uuid,
    pub repo_id: String,
    pub scores: AnalysisScores,
    pub recommendation: Recommendation,
    pub summary: String,
    pub strengths: Vec<String>,
    pub risks: Vec<String>,
    pub questions: Vec<String>,
    pub model_used: String,
    /// Credits charged for this analysis.
    pub cost: f64,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Alert
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Urgent,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub repo_id: String,
    pub alert_type: String,
    pub level: AlertLevel,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
    pub sent_at: DateTime<Utc>,
    pub acknowledged: bool,
}

impl Alert {
    pub fn new(
        repo_id: impl Into<String>,
        alert_type: impl Into<String>,
        level: AlertLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            repo_id: repo_id.into(),
            alert_type: alert_type.into(),
            level,
            message: message.into(),
            metadata: None,
            sent_at: Utc::now(),
            acknowledged: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Contributors & commit metrics (child rows keyed by repo_id)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contributor {
    pub repo_id: String,
    pub login: String,
    pub contributions: u32,
    pub html_url: Option<String>,
}

/// Weekly commit count bucket from the host's activity endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitMetric {
    pub week_start: DateTime<Utc>,
    pub commits: u32,
}

// ---------------------------------------------------------------------------
// Batch state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Recovering,
    Stopped,
    Completed,
    Failed,
}

impl BatchStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: &BatchStatus) -> bool {
        matches!(
            (self, target),
            (BatchStatus::Pending, BatchStatus::Running)
                | (BatchStatus::Running, BatchStatus::Recovering)
                | (BatchStatus::Running, BatchStatus::Completed)
                | (BatchStatus::Running, BatchStatus::Stopped)
                | (BatchStatus::Running, BatchStatus::Failed)
                | (BatchStatus::Recovering, BatchStatus::Running)
                | (BatchStatus::Recovering, BatchStatus::Failed)
        )
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Stopped | BatchStatus::Completed | BatchStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoResultStatus {
    Success,
    Failed,
    Timeout,
    Skipped,
}

/// Outcome of one repository inside a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoResult {
    pub repo_id: String,
    pub full_name: String,
    pub status: RepoResultStatus,
    pub duration_ms: u64,
    pub credits_used: f64,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

/// Rolling health verdict for a running batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchHealth {
    pub status: HealthStatus,
    pub success_rate: f64,
    pub runtime_elapsed_ms: u64,
    pub time_remaining_ms: u64,
    pub consecutive_failures: u32,
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl BatchHealth {
    pub fn initial() -> Self {
        Self {
            status: HealthStatus::Healthy,
            success_rate: 1.0,
            runtime_elapsed_ms: 0,
            time_remaining_ms: 0,
            consecutive_failures: 0,
            message: None,
            checked_at: Utc::now(),
        }
    }
}

/// Durable snapshot enabling batch resumption after a crash or recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub completed_repos: Vec<String>,
    pub failed_repos: Vec<String>,
    pub remaining_repos: Vec<String>,
    pub health: BatchHealth,
    pub created_at: DateTime<Utc>,
}

/// Credit accounting carried inside the batch record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCredits {
    pub estimated: f64,
    pub actual: f64,
    pub limit: f64,
}

/// Durable state of a batch analysis run.
///
/// Invariant: `completed + failed + skipped <= total`, and `status`
/// only moves along [`BatchStatus::can_transition_to`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchState {
    pub batch_id: String,
    pub status: BatchStatus,
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub current_repo: Option<String>,
    pub estimated_completion: Option<DateTime<Utc>>,
    /// Full names of every repository in this batch, in submission order.
    pub repositories: Vec<String>,
    /// Per-repo outcomes in observed completion order.
    pub results: Vec<RepoResult>,
    pub health: BatchHealth,
    pub recovery_attempts: u32,
    pub credits: BatchCredits,
    pub checkpoint: Option<Checkpoint>,
    pub updated_at: DateTime<Utc>,
}

impl BatchState {
    pub fn new(
        batch_id: impl Into<String>,
        repositories: Vec<String>,
        estimated_credits_per_repo: f64,
        credit_limit: f64,
    ) -> Self {
        let now = Utc::now();
        let total = repositories.len() as u32;
        Self {
            batch_id: batch_id.into(),
            status: BatchStatus::Pending,
            total,
            completed: 0,
            failed: 0,
            skipped: 0,
            started_at: now,
            ended_at: None,
            current_repo: None,
            estimated_completion: None,
            repositories,
            results: Vec::new(),
            health: BatchHealth::initial(),
            recovery_attempts: 0,
            credits: BatchCredits {
                estimated: total as f64 * estimated_credits_per_repo,
                actual: 0.0,
                limit: credit_limit,
            },
            checkpoint: None,
            updated_at: now,
        }
    }

    /// Total repositories with a recorded outcome.
    pub fn processed(&self) -> u32 {
        self.completed + self.failed + self.skipped
    }

    /// Repositories not yet attempted, in submission order.
    pub fn remaining(&self) -> Vec<String> {
        let done: std::collections::HashSet<&str> =
            self.results.iter().map(|r| r.full_name.as_str()).collect();
        self.repositories
            .iter()
            .filter(|name| !done.contains(name.as_str()))
            .cloned()
            .collect()
    }

    /// Attempt a status transition. Returns `false` (and leaves the state
    /// untouched) when the transition is not on the graph.
    pub fn transition(&mut self, target: BatchStatus) -> bool {
        if self.status.can_transition_to(&target) {
            self.status = target;
            self.updated_at = Utc::now();
            if target.is_terminal() {
                self.ended_at = Some(self.updated_at);
                self.current_repo = None;
            }
            true
        } else {
            false
        }
    }
}

impl BatchState {
    /// A non-terminal batch with no update for this long is reported stale.
    pub const STALE_AFTER_SECS: i64 = 300;

    /// Whether this batch looks abandoned: still non-terminal but not
    /// updated within the staleness threshold.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal()
            && now.signed_duration_since(self.updated_at).num_seconds() >= Self::STALE_AFTER_SECS
    }
}

/// Pick the active batch from a recency-ordered list: the running batch if
/// any, otherwise the most recent non-terminal one.
pub fn active_batch(batches: &[BatchState]) -> Option<&BatchState> {
    batches
        .iter()
        .find(|b| b.status == BatchStatus::Running || b.status == BatchStatus::Recovering)
        .or_else(|| batches.iter().find(|b| !b.status.is_terminal()))
}

// ---------------------------------------------------------------------------
// Cycle progress (in-memory)
// ---------------------------------------------------------------------------

/// The two cycle shapes the scheduler dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleKind {
    Hourly,
    Sweep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    Discovery,
    Planning,
    Analysis,
}

/// In-memory progress of the current (or last) cycle, published for the
/// status endpoint. Not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleProgress {
    pub phase: CyclePhase,
    pub cycle_kind: Option<CycleKind>,
    pub started_at: Option<DateTime<Utc>>,
    pub discovered: u32,
    /// Repos refreshed this cycle, indexed by tier (tier 1 at index 0).
    pub scanned_per_tier: [u32; 3],
    pub analyzed: u32,
    pub errors: Vec<String>,
    pub last_completed_cycle: Option<DateTime<Utc>>,
    pub next_tick: Option<DateTime<Utc>>,
}

impl Default for CycleProgress {
    fn default() -> Self {
        Self {
            phase: CyclePhase::Idle,
            cycle_kind: None,
            started_at: None,
            discovered: 0,
            scanned_per_tier: [0; 3],
            analyzed: 0,
            errors: Vec::new(),
            last_completed_cycle: None,
            next_tick: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Analytics views
// ---------------------------------------------------------------------------

/// Aggregate counters for the daily report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyStats {
    pub total_repositories: u64,
    pub analyses_today: u64,
    pub alerts_today: u64,
    pub avg_investment_score: Option<f64>,
    pub tier1_count: u64,
    pub tier2_count: u64,
    pub tier3_count: u64,
}

/// Everything the store knows about one repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComprehensiveMetrics {
    pub repository: Repository,
    pub tier: Option<TierAssignment>,
    pub latest_analysis: Option<Analysis>,
    pub snapshots: Vec<RepoMetricSnapshot>,
    pub alerts: Vec<Alert>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_repo(stars: u32, age_days: i64) -> Repository {
        let now = Utc::now();
        Repository {
            id: "r1".into(),
            owner: "acme".into(),
            name: "proj".into(),
            full_name: "acme/proj".into(),
            description: None,
            stars,
            forks: 0,
            open_issues: 0,
            language: None,
            topics: vec![],
            created_at: now - chrono::Duration::days(age_days),
            updated_at: now,
            pushed_at: Some(now),
            is_archived: false,
            is_fork: false,
            html_url: "https://example.com/acme/proj".into(),
            default_branch: "main".into(),
            discovered_at: now,
        }
    }

    #[test]
    fn star_velocity_uses_age() {
        let repo = make_repo(100, 10);
        let v = repo.star_velocity(Utc::now());
        assert!((v - 10.0).abs() < 0.5, "velocity was {v}");
    }

    #[test]
    fn star_velocity_clamps_age_to_one_day() {
        let repo = make_repo(50, 0);
        assert!(repo.star_velocity(Utc::now()) <= 50.0);
    }

    #[test]
    fn tier_round_trips_through_serde() {
        let json = serde_json::to_string(&Tier::Two).unwrap();
        assert_eq!(json, "2");
        let tier: Tier = serde_json::from_str("1").unwrap();
        assert_eq!(tier, Tier::One);
        assert!(serde_json::from_str::<Tier>("4").is_err());
    }

    #[test]
    fn batch_status_transitions_follow_graph() {
        use BatchStatus::*;
        assert!(Pending.can_transition_to(&Running));
        assert!(Running.can_transition_to(&Recovering));
        assert!(Recovering.can_transition_to(&Running));
        assert!(Running.can_transition_to(&Completed));
        assert!(Running.can_transition_to(&Stopped));
        assert!(Recovering.can_transition_to(&Failed));

        assert!(!Pending.can_transition_to(&Completed));
        assert!(!Completed.can_transition_to(&Running));
        assert!(!Stopped.can_transition_to(&Running));
        assert!(!Pending.can_transition_to(&Recovering));
    }

    #[test]
    fn batch_transition_is_rejected_off_graph() {
        let mut state = BatchState::new("b1", vec!["a/b".into()], 2.0, 100.0);
        assert!(!state.transition(BatchStatus::Completed));
        assert_eq!(state.status, BatchStatus::Pending);
        assert!(state.transition(BatchStatus::Running));
        assert!(state.transition(BatchStatus::Completed));
        assert!(state.ended_at.is_some());
    }

    #[test]
    fn batch_remaining_skips_recorded_results() {
        let mut state = BatchState::new(
            "b2",
            vec!["a/one".into(), "a/two".into(), "a/three".into()],
            2.0,
            100.0,
        );
        state.results.push(RepoResult {
            repo_id: "1".into(),
            full_name: "a/one".into(),
            status: RepoResultStatus::Success,
            duration_ms: 10,
            credits_used: 2.0,
            error: None,
            completed_at: Utc::now(),
        });
        assert_eq!(state.remaining(), vec!["a/two", "a/three"]);
    }

    #[test]
    fn stale_batches_are_non_terminal_and_quiet() {
        let mut state = BatchState::new("b3", vec!["a/b".into()], 2.0, 100.0);
        state.transition(BatchStatus::Running);
        state.updated_at = Utc::now() - chrono::Duration::minutes(10);
        assert!(state.is_stale(Utc::now()));

        // A terminal batch is never stale, however old.
        state.transition(BatchStatus::Completed);
        state.updated_at = Utc::now() - chrono::Duration::minutes(10);
        assert!(!state.is_stale(Utc::now()));
    }

    #[test]
    fn active_batch_prefers_running_over_pending() {
        let pending = BatchState::new("p", vec![], 2.0, 100.0);
        let mut running = BatchState::new("r", vec![], 2.0, 100.0);
        running.transition(BatchStatus::Running);
        let mut done = BatchState::new("d", vec![], 2.0, 100.0);
        done.transition(BatchStatus::Running);
        done.transition(BatchStatus::Completed);

        let batches = vec![done.clone(), pending.clone(), running.clone()];
        assert_eq!(active_batch(&batches).unwrap().batch_id, "r");

        let batches = vec![done.clone(), pending.clone()];
        assert_eq!(active_batch(&batches).unwrap().batch_id, "p");

        let batches = vec![done];
        assert!(active_batch(&batches).is_none());
    }

    #[test]
    fn recommendation_rejects_unknown_strings() {
        assert!(serde_json::from_str::<Recommendation>("\"strong_buy\"").is_ok());
        assert!(serde_json::from_str::<Recommendation>("\"maybe\"").is_err());
    }

    #[test]
    fn analysis_scores_enhanced_fields_default_to_none() {
        let scores: AnalysisScores = serde_json::from_str(
            r#"{"investment": 80, "innovation": 70, "team": 60, "market": 75}"#,
        )
        .unwrap();
        assert_eq!(scores.technical_moat, None);
        assert_eq!(scores.scalability, None);
        assert_eq!(scores.developer_adoption, None);
    }
}
