use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use tokio_rusqlite::Connection;

use crate::score::{self, RepoSignals};
use crate::types::{
    Alert, AlertLevel, Analysis, AnalysisScores, BatchState, ComprehensiveMetrics, Contributor,
    DailyStats, Recommendation, RepoMetricSnapshot, Repository, ScanKind, Tier, TierAssignment,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Storage failures. Callers surface these; nothing here is swallowed.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    /// A caller asked to tier a repository the store has never seen.
    #[error("repository `{0}` has no row; upsert the repository first")]
    MissingRepository(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// helpers – enum <-> SQLite string
// ---------------------------------------------------------------------------

fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).expect("deserialize enum")
}

fn parse_date(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("valid date")
        .with_timezone(&Utc)
}

fn json_err(err: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}

// ---------------------------------------------------------------------------
// RepoStore
// ---------------------------------------------------------------------------

/// Async SQLite-backed store for repositories, metrics, tiers, analyses,
/// alerts, contributors, and batch state. The single durable authority:
/// every component reads and writes through here.
pub struct RepoStore {
    conn: Connection,
}

impl RepoStore {
    /// Open (or create) a database at the given file path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS repositories (
                        id             TEXT PRIMARY KEY,
                        owner          TEXT NOT NULL,
                        name           TEXT NOT NULL,
                        full_name      TEXT NOT NULL UNIQUE,
                        description    TEXT,
                        stars          INTEGER NOT NULL DEFAULT 0,
                        forks          INTEGER NOT NULL DEFAULT 0,
                        open_issues    INTEGER NOT NULL DEFAULT 0,
                        language       TEXT,
                        topics         TEXT NOT NULL,
                        created_at     TEXT NOT NULL,
                        updated_at     TEXT NOT NULL,
                        pushed_at      TEXT,
                        is_archived    INTEGER NOT NULL DEFAULT 0,
                        is_fork        INTEGER NOT NULL DEFAULT 0,
                        html_url       TEXT NOT NULL,
                        default_branch TEXT NOT NULL,
                        discovered_at  TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_repos_full_name ON repositories(full_name);
                    CREATE INDEX IF NOT EXISTS idx_repos_stars     ON repositories(stars);

                    CREATE TABLE IF NOT EXISTS repo_metrics (
                        repo_id       TEXT NOT NULL,
                        stars         INTEGER NOT NULL,
                        forks         INTEGER NOT NULL,
                        open_issues   INTEGER NOT NULL,
                        watchers      INTEGER NOT NULL,
                        contributors  INTEGER,
                        commits_count INTEGER,
                        recorded_at   TEXT NOT NULL,
                        PRIMARY KEY (repo_id, recorded_at)
                    );

                    CREATE TABLE IF NOT EXISTS tiers (
                        repo_id          TEXT PRIMARY KEY,
                        tier             INTEGER NOT NULL,
                        stars            INTEGER NOT NULL,
                        growth_velocity  REAL NOT NULL,
                        engagement_score REAL NOT NULL,
                        scan_priority    REAL NOT NULL,
                        last_deep_scan   TEXT,
                        last_basic_scan  TEXT,
                        next_scan_due    TEXT NOT NULL,
                        updated_at       TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_tiers_tier ON tiers(tier);
                    CREATE INDEX IF NOT EXISTS idx_tiers_due  ON tiers(next_scan_due);

                    CREATE TABLE IF NOT EXISTS analyses (
                        id                  TEXT PRIMARY KEY,
                        repo_id             TEXT NOT NULL,
                        investment          REAL NOT NULL,
                        innovation          REAL NOT NULL,
                        team                REAL NOT NULL,
                        market              REAL NOT NULL,
                        technical_moat      REAL,
                        scalability         REAL,
                        developer_adoption  REAL,
                        recommendation      TEXT NOT NULL,
                        summary             TEXT NOT NULL,
                        strengths           TEXT NOT NULL,
                        risks               TEXT NOT NULL,
                        questions           TEXT NOT NULL,
                        model_used          TEXT NOT NULL,
                        cost                REAL NOT NULL,
                        created_at          TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_analyses_repo ON analyses(repo_id, created_at);

                    CREATE TABLE IF NOT EXISTS alerts (
                        id           TEXT PRIMARY KEY,
                        repo_id      TEXT NOT NULL,
                        alert_type   TEXT NOT NULL,
                        level        TEXT NOT NULL,
                        message      TEXT NOT NULL,
                        metadata     TEXT,
                        sent_at      TEXT NOT NULL,
                        acknowledged INTEGER NOT NULL DEFAULT 0
                    );

                    CREATE INDEX IF NOT EXISTS idx_alerts_repo ON alerts(repo_id, sent_at);

                    CREATE TABLE IF NOT EXISTS contributors (
                        repo_id       TEXT NOT NULL,
                        login         TEXT NOT NULL,
                        contributions INTEGER NOT NULL,
                        html_url      TEXT,
                        PRIMARY KEY (repo_id, login)
                    );

                    CREATE TABLE IF NOT EXISTS batches (
                        batch_id   TEXT PRIMARY KEY,
                        status     TEXT NOT NULL,
                        state      TEXT NOT NULL,
                        updated_at TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS meta (
                        key   TEXT PRIMARY KEY,
                        value TEXT NOT NULL
                    );
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Repositories
    // -----------------------------------------------------------------------

    /// Insert or update a repository. `discovered_at` is preserved from the
    /// first sighting; everything else follows the incoming record.
    pub async fn upsert_repository(&self, repo: &Repository) -> Result<()> {
        let r = repo.clone();
        self.conn
            .call(move |conn| {
                let topics = serde_json::to_string(&r.topics).map_err(json_err)?;
                conn.execute(
                    "INSERT INTO repositories (id, owner, name, full_name, description,
                        stars, forks, open_issues, language, topics, created_at, updated_at,
                        pushed_at, is_archived, is_fork, html_url, default_branch, discovered_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)
                     ON CONFLICT(id) DO UPDATE SET
                        owner=excluded.owner, name=excluded.name, full_name=excluded.full_name,
                        description=excluded.description, stars=excluded.stars,
                        forks=excluded.forks, open_issues=excluded.open_issues,
                        language=excluded.language, topics=excluded.topics,
                        updated_at=excluded.updated_at, pushed_at=excluded.pushed_at,
                        is_archived=excluded.is_archived, is_fork=excluded.is_fork,
                        html_url=excluded.html_url, default_branch=excluded.default_branch",
                    rusqlite::params![
                        r.id,
                        r.owner,
                        r.name,
                        r.full_name,
                        r.description,
                        r.stars,
                        r.forks,
                        r.open_issues,
                        r.language,
                        topics,
                        r.created_at.to_rfc3339(),
                        r.updated_at.to_rfc3339(),
                        r.pushed_at.map(|d| d.to_rfc3339()),
                        r.is_archived,
                        r.is_fork,
                        r.html_url,
                        r.default_branch,
                        r.discovered_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_repository(&self, id: &str) -> Result<Option<Repository>> {
        let id = id.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("{REPO_SELECT} WHERE id = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_repository(row)?)),
                    None => Ok(None),
                }
            })
            .await?)
    }

    pub async fn get_repository_by_full_name(&self, full_name: &str) -> Result<Option<Repository>> {
        let full_name = full_name.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("{REPO_SELECT} WHERE full_name = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![full_name])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_repository(row)?)),
                    None => Ok(None),
                }
            })
            .await?)
    }

    pub async fn repository_count(&self) -> Result<u64> {
        Ok(self
            .conn
            .call(|conn| {
                let count: u64 = conn
                    .prepare("SELECT COUNT(*) FROM repositories")?
                    .query_row([], |r| r.get(0))?;
                Ok(count)
            })
            .await?)
    }

    // -----------------------------------------------------------------------
    // Metric snapshots
    // -----------------------------------------------------------------------

    /// Append a batch of metric snapshots in one transaction. Snapshots are
    /// append-only; an existing `(repo_id, recorded_at)` pair is left alone.
    pub async fn upsert_metrics_batch(&self, snapshots: &[RepoMetricSnapshot]) -> Result<()> {
        let snapshots = snapshots.to_vec();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT OR IGNORE INTO repo_metrics
                            (repo_id, stars, forks, open_issues, watchers,
                             contributors, commits_count, recorded_at)
                         VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                    )?;
                    for s in &snapshots {
                        stmt.execute(rusqlite::params![
                            s.repo_id,
                            s.stars,
                            s.forks,
                            s.open_issues,
                            s.watchers,
                            s.contributors,
                            s.commits_count,
                            s.recorded_at.to_rfc3339(),
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Analyses
    // -----------------------------------------------------------------------

    pub async fn save_analysis(&self, analysis: &Analysis) -> Result<()> {
        let a = analysis.clone();
        self.conn
            .call(move |conn| {
                let strengths = serde_json::to_string(&a.strengths).map_err(json_err)?;
                let risks = serde_json::to_string(&a.risks).map_err(json_err)?;
                let questions = serde_json::to_string(&a.questions).map_err(json_err)?;
                conn.execute(
                    "INSERT INTO analyses (id, repo_id, investment, innovation, team, market,
                        technical_moat, scalability, developer_adoption, recommendation,
                        summary, strengths, risks, questions, model_used, cost, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
                    rusqlite::params![
                        a.id.to_string(),
                        a.repo_id,
                        a.scores.investment,
                        a.scores.innovation,
                        a.scores.team,
                        a.scores.market,
                        a.scores.technical_moat,
                        a.scores.scalability,
                        a.scores.developer_adoption,
                        enum_to_sql(&a.recommendation),
                        a.summary,
                        strengths,
                        risks,
                        questions,
                        a.model_used,
                        a.cost,
                        a.created_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_latest_analysis(&self, repo_id: &str) -> Result<Option<Analysis>> {
        let repo_id = repo_id.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{ANALYSIS_SELECT} WHERE repo_id = ?1 ORDER BY created_at DESC LIMIT 1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![repo_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_analysis(row)?)),
                    None => Ok(None),
                }
            })
            .await?)
    }

    /// Whether an analysis newer than `hours` exists for this repo.
    pub async fn has_recent_analysis(&self, repo_id: &str, hours: i64) -> Result<bool> {
        let repo_id = repo_id.to_string();
        let cutoff = (Utc::now() - Duration::hours(hours)).to_rfc3339();
        Ok(self
            .conn
            .call(move |conn| {
                let count: u64 = conn
                    .prepare(
                        "SELECT COUNT(*) FROM analyses
                         WHERE repo_id = ?1 AND created_at >= ?2",
                    )?
                    .query_row(rusqlite::params![repo_id, cutoff], |r| r.get(0))?;
                Ok(count > 0)
            })
            .await?)
    }

    // -----------------------------------------------------------------------
    // Alerts
    // -----------------------------------------------------------------------

    pub async fn save_alert(&self, alert: &Alert) -> Result<()> {
        let a = alert.clone();
        self.conn
            .call(move |conn| {
                let metadata = match &a.metadata {
                    Some(v) => Some(serde_json::to_string(v).map_err(json_err)?),
                    None => None,
                };
                conn.execute(
                    "INSERT INTO alerts (id, repo_id, alert_type, level, message, metadata,
                        sent_at, acknowledged)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                    rusqlite::params![
                        a.id.to_string(),
                        a.repo_id,
                        a.alert_type,
                        enum_to_sql(&a.level),
                        a.message,
                        metadata,
                        a.sent_at.to_rfc3339(),
                        a.acknowledged,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn list_alerts(&self, limit: u32) -> Result<Vec<Alert>> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{ALERT_SELECT} ORDER BY sent_at DESC LIMIT ?1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_alert(row)?);
                }
                Ok(out)
            })
            .await?)
    }

    /// Whether an alert of the given type fired for this repo within the
    /// last `hours`. Used to emit at most one alert per freshness window.
    pub async fn recent_alert_exists(
        &self,
        repo_id: &str,
        alert_type: &str,
        hours: i64,
    ) -> Result<bool> {
        let repo_id = repo_id.to_string();
        let alert_type = alert_type.to_string();
        let cutoff = (Utc::now() - Duration::hours(hours)).to_rfc3339();
        Ok(self
            .conn
            .call(move |conn| {
                let count: u64 = conn
                    .prepare(
                        "SELECT COUNT(*) FROM alerts
                         WHERE repo_id = ?1 AND alert_type = ?2 AND sent_at >= ?3",
                    )?
                    .query_row(rusqlite::params![repo_id, alert_type, cutoff], |r| r.get(0))?;
                Ok(count > 0)
            })
            .await?)
    }

    // -----------------------------------------------------------------------
    // Contributors
    // -----------------------------------------------------------------------

    /// Replace the stored contributor set for a repository.
    pub async fn save_contributors(&self, repo_id: &str, contributors: &[Contributor]) -> Result<()> {
        let repo_id = repo_id.to_string();
        let contributors = contributors.to_vec();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM contributors WHERE repo_id = ?1",
                    rusqlite::params![repo_id],
                )?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO contributors (repo_id, login, contributions, html_url)
                         VALUES (?1,?2,?3,?4)",
                    )?;
                    for c in &contributors {
                        stmt.execute(rusqlite::params![
                            repo_id,
                            c.login,
                            c.contributions,
                            c.html_url,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tiers
    // -----------------------------------------------------------------------

    /// Insert or recompute the tier assignment for a repository, with no
    /// observed deep-scan signals (README presence stays unknown).
    pub async fn upsert_tier(
        &self,
        repo_id: &str,
        stars: u32,
        growth_velocity: f64,
        engagement_score: f64,
    ) -> Result<Tier> {
        self.upsert_tier_with_signals(
            repo_id,
            stars,
            growth_velocity,
            engagement_score,
            &RepoSignals::default(),
        )
        .await
    }

    /// Insert or recompute the tier assignment for a repository.
    ///
    /// The tier formula lives in [`score::tier_for_assignment`] and reads
    /// the stored repository row, so topics and push recency always weigh
    /// in; deep scans pass observed signals (README, star history) here.
    /// Recomputation may promote or demote. Scan timestamps and
    /// `next_scan_due` survive updates; new rows are due immediately.
    /// Tiering a repository with no stored row fails loudly.
    pub async fn upsert_tier_with_signals(
        &self,
        repo_id: &str,
        stars: u32,
        growth_velocity: f64,
        engagement_score: f64,
        signals: &RepoSignals,
    ) -> Result<Tier> {
        let repo = self
            .get_repository(repo_id)
            .await?
            .ok_or_else(|| StoreError::MissingRepository(repo_id.to_string()))?;
        let (tier, scan_priority) = score::tier_for_assignment(
            &repo,
            signals,
            growth_velocity,
            engagement_score,
            Utc::now(),
        );
        let repo_id = repo_id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO tiers (repo_id, tier, stars, growth_velocity,
                        engagement_score, scan_priority, next_scan_due, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?7)
                     ON CONFLICT(repo_id) DO UPDATE SET
                        tier=excluded.tier, stars=excluded.stars,
                        growth_velocity=excluded.growth_velocity,
                        engagement_score=excluded.engagement_score,
                        scan_priority=excluded.scan_priority,
                        updated_at=excluded.updated_at",
                    rusqlite::params![
                        repo_id,
                        tier.as_u8(),
                        stars,
                        growth_velocity,
                        engagement_score,
                        scan_priority,
                        now,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(tier)
    }

    pub async fn get_tier_assignment(&self, repo_id: &str) -> Result<Option<TierAssignment>> {
        let repo_id = repo_id.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("{TIER_SELECT} WHERE repo_id = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![repo_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_tier(row)?)),
                    None => Ok(None),
                }
            })
            .await?)
    }

    /// Repositories in a tier, highest scan priority first.
    pub async fn get_repos_by_tier(&self, tier: Tier, limit: u32) -> Result<Vec<Repository>> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT r.id, r.owner, r.name, r.full_name, r.description, r.stars,
                            r.forks, r.open_issues, r.language, r.topics, r.created_at,
                            r.updated_at, r.pushed_at, r.is_archived, r.is_fork, r.html_url,
                            r.default_branch, r.discovered_at
                     FROM repositories r
                     JOIN tiers t ON t.repo_id = r.id
                     WHERE t.tier = ?1
                     ORDER BY t.scan_priority DESC
                     LIMIT ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![tier.as_u8(), limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_repository(row)?);
                }
                Ok(out)
            })
            .await?)
    }

    /// Repositories in `tier` that are due for a scan of the given kind.
    ///
    /// A repo is due when `next_scan_due` has passed, or it has never had
    /// this kind of scan, or the last one is older than `interval_hours`.
    /// Ordering: most overdue first, then stars, then push recency.
    pub async fn get_repos_needing_scan(
        &self,
        tier: Tier,
        kind: ScanKind,
        interval_hours: i64,
        force: bool,
        limit: u32,
    ) -> Result<Vec<Repository>> {
        let column = match kind {
            ScanKind::Deep => "last_deep_scan",
            ScanKind::Basic => "last_basic_scan",
        };
        let now = Utc::now().to_rfc3339();
        let cutoff = (Utc::now() - Duration::hours(interval_hours)).to_rfc3339();
        Ok(self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT r.id, r.owner, r.name, r.full_name, r.description, r.stars,
                            r.forks, r.open_issues, r.language, r.topics, r.created_at,
                            r.updated_at, r.pushed_at, r.is_archived, r.is_fork, r.html_url,
                            r.default_branch, r.discovered_at
                     FROM repositories r
                     JOIN tiers t ON t.repo_id = r.id
                     WHERE t.tier = ?1
                       AND (?2 OR t.next_scan_due <= ?3
                            OR t.{column} IS NULL OR t.{column} <= ?4)
                     ORDER BY t.next_scan_due ASC, r.stars DESC, r.pushed_at DESC
                     LIMIT ?5"
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows =
                    stmt.query(rusqlite::params![tier.as_u8(), force, now, cutoff, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_repository(row)?);
                }
                Ok(out)
            })
            .await?)
    }

    /// Record a completed scan and push `next_scan_due` out by
    /// `next_due_hours`. Idempotent: repeating it only moves the due time.
    pub async fn mark_scanned(
        &self,
        repo_id: &str,
        kind: ScanKind,
        next_due_hours: i64,
    ) -> Result<()> {
        let column = match kind {
            ScanKind::Deep => "last_deep_scan",
            ScanKind::Basic => "last_basic_scan",
        };
        let repo_id = repo_id.to_string();
        let now = Utc::now().to_rfc3339();
        let next_due = (Utc::now() + Duration::hours(next_due_hours)).to_rfc3339();
        self.conn
            .call(move |conn| {
                let sql = format!(
                    "UPDATE tiers SET {column} = ?2, next_scan_due = ?3, updated_at = ?2
                     WHERE repo_id = ?1"
                );
                conn.execute(&sql, rusqlite::params![repo_id, now, next_due])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Analytics
    // -----------------------------------------------------------------------

    /// Repositories whose stars grew within the window, with growth percent,
    /// fastest growth first. Requires at least two snapshots per repo.
    pub async fn high_growth_repos(
        &self,
        days: i64,
        min_stars: u32,
    ) -> Result<Vec<(Repository, f64)>> {
        let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT m.repo_id, m.stars, m.recorded_at
                     FROM repo_metrics m
                     JOIN repositories r ON r.id = m.repo_id
                     WHERE m.recorded_at >= ?1 AND r.stars >= ?2
                     ORDER BY m.repo_id, m.recorded_at",
                )?;
                let mut rows = stmt.query(rusqlite::params![cutoff, min_stars])?;

                // Fold snapshots into (first, last) stars per repo.
                let mut per_repo: Vec<(String, u32, u32)> = Vec::new();
                while let Some(row) = rows.next()? {
                    let repo_id: String = row.get(0)?;
                    let stars: u32 = row.get(1)?;
                    match per_repo.last_mut() {
                        Some((id, _, last)) if *id == repo_id => *last = stars,
                        _ => per_repo.push((repo_id, stars, stars)),
                    }
                }

                let mut out = Vec::new();
                let mut repo_stmt = conn.prepare(&format!("{REPO_SELECT} WHERE id = ?1"))?;
                for (repo_id, first, last) in per_repo {
                    if last <= first || first == 0 {
                        continue;
                    }
                    let growth_pct = (last - first) as f64 / first as f64 * 100.0;
                    let mut rows = repo_stmt.query(rusqlite::params![repo_id])?;
                    if let Some(row) = rows.next()? {
                        out.push((row_to_repository(row)?, growth_pct));
                    }
                }
                out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                Ok(out)
            })
            .await?)
    }

    pub async fn daily_stats(&self) -> Result<DailyStats> {
        let day_ago = (Utc::now() - Duration::hours(24)).to_rfc3339();
        Ok(self
            .conn
            .call(move |conn| {
                let total_repositories: u64 = conn
                    .prepare("SELECT COUNT(*) FROM repositories")?
                    .query_row([], |r| r.get(0))?;
                let analyses_today: u64 = conn
                    .prepare("SELECT COUNT(*) FROM analyses WHERE created_at >= ?1")?
                    .query_row(rusqlite::params![day_ago], |r| r.get(0))?;
                let alerts_today: u64 = conn
                    .prepare("SELECT COUNT(*) FROM alerts WHERE sent_at >= ?1")?
                    .query_row(rusqlite::params![day_ago], |r| r.get(0))?;
                let avg_investment_score: Option<f64> = conn
                    .prepare("SELECT AVG(investment) FROM analyses WHERE created_at >= ?1")?
                    .query_row(rusqlite::params![day_ago], |r| r.get(0))?;

                let tier_count = |tier: u8| -> rusqlite::Result<u64> {
                    conn.prepare("SELECT COUNT(*) FROM tiers WHERE tier = ?1")?
                        .query_row(rusqlite::params![tier], |r| r.get(0))
                };

                Ok(DailyStats {
                    total_repositories,
                    analyses_today,
                    alerts_today,
                    avg_investment_score,
                    tier1_count: tier_count(1)?,
                    tier2_count: tier_count(2)?,
                    tier3_count: tier_count(3)?,
                })
            })
            .await?)
    }

    /// Everything known about one repository, or `None` when it does not
    /// exist at all.
    pub async fn comprehensive_metrics(&self, repo_id: &str) -> Result<Option<ComprehensiveMetrics>> {
        let repo_id = repo_id.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let repository = {
                    let mut stmt = conn.prepare(&format!("{REPO_SELECT} WHERE id = ?1"))?;
                    let mut rows = stmt.query(rusqlite::params![repo_id])?;
                    match rows.next()? {
                        Some(row) => row_to_repository(row)?,
                        None => return Ok(None),
                    }
                };

                let tier = {
                    let mut stmt = conn.prepare(&format!("{TIER_SELECT} WHERE repo_id = ?1"))?;
                    let mut rows = stmt.query(rusqlite::params![repo_id])?;
                    match rows.next()? {
                        Some(row) => Some(row_to_tier(row)?),
                        None => None,
                    }
                };

                let latest_analysis = {
                    let mut stmt = conn.prepare(&format!(
                        "{ANALYSIS_SELECT} WHERE repo_id = ?1 ORDER BY created_at DESC LIMIT 1"
                    ))?;
                    let mut rows = stmt.query(rusqlite::params![repo_id])?;
                    match rows.next()? {
                        Some(row) => Some(row_to_analysis(row)?),
                        None => None,
                    }
                };

                let snapshots = {
                    let mut stmt = conn.prepare(
                        "SELECT repo_id, stars, forks, open_issues, watchers, contributors,
                                commits_count, recorded_at
                         FROM repo_metrics WHERE repo_id = ?1
                         ORDER BY recorded_at DESC LIMIT 30",
                    )?;
                    let mut rows = stmt.query(rusqlite::params![repo_id])?;
                    let mut out = Vec::new();
                    while let Some(row) = rows.next()? {
                        out.push(row_to_snapshot(row)?);
                    }
                    out
                };

                let alerts = {
                    let mut stmt = conn.prepare(&format!(
                        "{ALERT_SELECT} WHERE repo_id = ?1 ORDER BY sent_at DESC LIMIT 10"
                    ))?;
                    let mut rows = stmt.query(rusqlite::params![repo_id])?;
                    let mut out = Vec::new();
                    while let Some(row) = rows.next()? {
                        out.push(row_to_alert(row)?);
                    }
                    out
                };

                Ok(Some(ComprehensiveMetrics {
                    repository,
                    tier,
                    latest_analysis,
                    snapshots,
                    alerts,
                }))
            })
            .await?)
    }

    // -----------------------------------------------------------------------
    // Batch persistence
    // -----------------------------------------------------------------------

    pub async fn put_batch(&self, state: &BatchState) -> Result<()> {
        let batch_id = state.batch_id.clone();
        let status = enum_to_sql(&state.status);
        let state = state.clone();
        self.conn
            .call(move |conn| {
                let doc = serde_json::to_string(&state).map_err(json_err)?;
                conn.execute(
                    "INSERT INTO batches (batch_id, status, state, updated_at)
                     VALUES (?1,?2,?3,?4)
                     ON CONFLICT(batch_id) DO UPDATE SET
                        status=excluded.status, state=excluded.state,
                        updated_at=excluded.updated_at",
                    rusqlite::params![batch_id, status, doc, state.updated_at.to_rfc3339()],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_batch(&self, batch_id: &str) -> Result<Option<BatchState>> {
        let batch_id = batch_id.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT state FROM batches WHERE batch_id = ?1")?;
                let mut rows = stmt.query(rusqlite::params![batch_id])?;
                match rows.next()? {
                    Some(row) => {
                        let doc: String = row.get(0)?;
                        let state: BatchState =
                            serde_json::from_str(&doc).map_err(json_err)?;
                        Ok(Some(state))
                    }
                    None => Ok(None),
                }
            })
            .await?)
    }

    /// Batches whose id starts with `prefix` (empty matches all), most
    /// recently updated first.
    pub async fn list_batches(&self, prefix: &str, limit: u32) -> Result<Vec<BatchState>> {
        let pattern = format!("{prefix}%");
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT state FROM batches WHERE batch_id LIKE ?1
                     ORDER BY updated_at DESC LIMIT ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![pattern, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let doc: String = row.get(0)?;
                    out.push(serde_json::from_str(&doc).map_err(json_err)?);
                }
                Ok(out)
            })
            .await?)
    }

    pub async fn delete_batch(&self, batch_id: &str) -> Result<bool> {
        let batch_id = batch_id.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM batches WHERE batch_id = ?1",
                    rusqlite::params![batch_id],
                )?;
                Ok(n > 0)
            })
            .await?)
    }

    // -----------------------------------------------------------------------
    // Meta KV
    // -----------------------------------------------------------------------

    pub async fn put_meta(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES (?1,?2)
                     ON CONFLICT(key) DO UPDATE SET value=excluded.value",
                    rusqlite::params![key, value],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT value FROM meta WHERE key = ?1")?;
                let mut rows = stmt.query(rusqlite::params![key])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get(0)?)),
                    None => Ok(None),
                }
            })
            .await?)
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

const REPO_SELECT: &str = "SELECT id, owner, name, full_name, description, stars, forks,
    open_issues, language, topics, created_at, updated_at, pushed_at, is_archived,
    is_fork, html_url, default_branch, discovered_at FROM repositories";

const TIER_SELECT: &str = "SELECT repo_id, tier, stars, growth_velocity, engagement_score,
    scan_priority, last_deep_scan, last_basic_scan, next_scan_due, updated_at FROM tiers";

const ANALYSIS_SELECT: &str = "SELECT id, repo_id, investment, innovation, team, market,
    technical_moat, scalability, developer_adoption, recommendation, summary, strengths,
    risks, questions, model_used, cost, created_at FROM analyses";

const ALERT_SELECT: &str = "SELECT id, repo_id, alert_type, level, message, metadata,
    sent_at, acknowledged FROM alerts";

fn row_to_repository(row: &rusqlite::Row<'_>) -> rusqlite::Result<Repository> {
    let topics_str: String = row.get(9)?;
    let created_at: String = row.get(10)?;
    let updated_at: String = row.get(11)?;
    let pushed_at: Option<String> = row.get(12)?;
    let discovered_at: String = row.get(17)?;

    Ok(Repository {
        id: row.get(0)?,
        owner: row.get(1)?,
        name: row.get(2)?,
        full_name: row.get(3)?,
        description: row.get(4)?,
        stars: row.get(5)?,
        forks: row.get(6)?,
        open_issues: row.get(7)?,
        language: row.get(8)?,
        topics: serde_json::from_str(&topics_str).map_err(json_err)?,
        created_at: parse_date(&created_at),
        updated_at: parse_date(&updated_at),
        pushed_at: pushed_at.map(|s| parse_date(&s)),
        is_archived: row.get(13)?,
        is_fork: row.get(14)?,
        html_url: row.get(15)?,
        default_branch: row.get(16)?,
        discovered_at: parse_date(&discovered_at),
    })
}

fn row_to_tier(row: &rusqlite::Row<'_>) -> rusqlite::Result<TierAssignment> {
    let tier_raw: u8 = row.get(1)?;
    let last_deep: Option<String> = row.get(6)?;
    let last_basic: Option<String> = row.get(7)?;
    let next_due: String = row.get(8)?;
    let updated_at: String = row.get(9)?;

    Ok(TierAssignment {
        repo_id: row.get(0)?,
        tier: Tier::try_from(tier_raw).expect("valid tier"),
        stars: row.get(2)?,
        growth_velocity: row.get(3)?,
        engagement_score: row.get(4)?,
        scan_priority: row.get(5)?,
        last_deep_scan: last_deep.map(|s| parse_date(&s)),
        last_basic_scan: last_basic.map(|s| parse_date(&s)),
        next_scan_due: parse_date(&next_due),
        updated_at: parse_date(&updated_at),
    })
}

fn row_to_analysis(row: &rusqlite::Row<'_>) -> rusqlite::Result<Analysis> {
    let id_str: String = row.get(0)?;
    let rec_str: String = row.get(9)?;
    let strengths: String = row.get(11)?;
    let risks: String = row.get(12)?;
    let questions: String = row.get(13)?;
    let created_at: String = row.get(16)?;

    let recommendation: Recommendation = enum_from_sql(&rec_str);

    Ok(Analysis {
        id: uuid::Uuid::parse_str(&id_str).expect("valid uuid"),
        repo_id: row.get(1)?,
        scores: AnalysisScores {
            investment: row.get(2)?,
            innovation: row.get(3)?,
            team: row.get(4)?,
            market: row.get(5)?,
            technical_moat: row.get(6)?,
            scalability: row.get(7)?,
            developer_adoption: row.get(8)?,
        },
        recommendation,
        summary: row.get(10)?,
        strengths: serde_json::from_str(&strengths).map_err(json_err)?,
        risks: serde_json::from_str(&risks).map_err(json_err)?,
        questions: serde_json::from_str(&questions).map_err(json_err)?,
        model_used: row.get(14)?,
        cost: row.get(15)?,
        created_at: parse_date(&created_at),
    })
}

fn row_to_alert(row: &rusqlite::Row<'_>) -> rusqlite::Result<Alert> {
    let id_str: String = row.get(0)?;
    let level_str: String = row.get(3)?;
    let metadata: Option<String> = row.get(5)?;
    let sent_at: String = row.get(6)?;

    let level: AlertLevel = enum_from_sql(&level_str);

    Ok(Alert {
        id: uuid::Uuid::parse_str(&id_str).expect("valid uuid"),
        repo_id: row.get(1)?,
        alert_type: row.get(2)?,
        level,
        message: row.get(4)?,
        metadata: match metadata {
            Some(s) => Some(serde_json::from_str(&s).map_err(json_err)?),
            None => None,
        },
        sent_at: parse_date(&sent_at),
        acknowledged: row.get(7)?,
    })
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<RepoMetricSnapshot> {
    let recorded_at: String = row.get(7)?;
    Ok(RepoMetricSnapshot {
        repo_id: row.get(0)?,
        stars: row.get(1)?,
        forks: row.get(2)?,
        open_issues: row.get(3)?,
        watchers: row.get(4)?,
        contributors: row.get(5)?,
        commits_count: row.get(6)?,
        recorded_at: parse_date(&recorded_at),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BatchStatus;
    use chrono::Duration;

    fn make_repo(id: &str, full_name: &str, stars: u32) -> Repository {
        let now = Utc::now();
        let (owner, name) = full_name.split_once('/').unwrap();
        Repository {
            id: id.into(),
            owner: owner.into(),
            name: name.into(),
            full_name: full_name.into(),
            description: Some("a test repo".into()),
            stars,
            forks: stars / 10,
            open_issues: 3,
            language: Some("Rust".into()),
            topics: vec!["ai".into()],
            created_at: now - Duration::days(200),
            updated_at: now,
            pushed_at: Some(now - Duration::days(1)),
            is_archived: false,
            is_fork: false,
            html_url: format!("https://example.com/{full_name}"),
            default_branch: "main".into(),
            discovered_at: now,
        }
    }

    #[tokio::test]
    async fn upsert_repository_is_idempotent_with_monotonic_update() {
        let store = RepoStore::new_in_memory().await.unwrap();
        let mut repo = make_repo("1", "acme/alpha", 100);
        store.upsert_repository(&repo).await.unwrap();

        let first = store.get_repository("1").await.unwrap().unwrap();

        repo.stars = 150;
        repo.updated_at = Utc::now() + Duration::seconds(5);
        store.upsert_repository(&repo).await.unwrap();

        assert_eq!(store.repository_count().await.unwrap(), 1);
        let second = store.get_repository("1").await.unwrap().unwrap();
        assert_eq!(second.stars, 150);
        assert!(second.updated_at >= first.updated_at);
        // First sighting is preserved.
        assert_eq!(
            second.discovered_at.timestamp(),
            first.discovered_at.timestamp()
        );
    }

    #[tokio::test]
    async fn get_repository_by_full_name_round_trips() {
        let store = RepoStore::new_in_memory().await.unwrap();
        let repo = make_repo("7", "acme/beta", 42);
        store.upsert_repository(&repo).await.unwrap();
        let found = store
            .get_repository_by_full_name("acme/beta")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "7");
        assert_eq!(found.topics, vec!["ai".to_string()]);
        assert!(store
            .get_repository_by_full_name("acme/missing")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn upsert_tier_keeps_one_row_and_preserves_scan_stamps() {
        let store = RepoStore::new_in_memory().await.unwrap();
        let repo = make_repo("1", "acme/alpha", 500);
        store.upsert_repository(&repo).await.unwrap();

        store.upsert_tier("1", 500, 1.0, 40.0).await.unwrap();
        store.mark_scanned("1", ScanKind::Deep, 168).await.unwrap();
        let before = store.get_tier_assignment("1").await.unwrap().unwrap();
        assert!(before.last_deep_scan.is_some());

        // Recompute: still one row, stamps intact.
        store.upsert_tier("1", 600, 2.0, 45.0).await.unwrap();
        let after = store.get_tier_assignment("1").await.unwrap().unwrap();
        assert_eq!(after.stars, 600);
        assert_eq!(
            after.last_deep_scan.map(|d| d.timestamp()),
            before.last_deep_scan.map(|d| d.timestamp())
        );
        assert_eq!(
            after.next_scan_due.timestamp(),
            before.next_scan_due.timestamp()
        );
    }

    #[tokio::test]
    async fn tiering_an_unknown_repo_fails_loudly() {
        let store = RepoStore::new_in_memory().await.unwrap();
        let err = store.upsert_tier("ghost", 10, 1.0, 5.0).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingRepository(_)));
    }

    #[tokio::test]
    async fn observed_readme_signal_can_raise_the_tier() {
        let store = RepoStore::new_in_memory().await.unwrap();
        // 40 stars: below the star shortcut, so the tier rides on the total.
        let repo = make_repo("1", "acme/border", 40);
        store.upsert_repository(&repo).await.unwrap();

        let without = store.upsert_tier("1", 40, 0.0, 90.0).await.unwrap();
        assert_eq!(without, Tier::Three);

        let signals = RepoSignals {
            has_readme: true,
            ..RepoSignals::default()
        };
        let with = store
            .upsert_tier_with_signals("1", 40, 0.0, 90.0, &signals)
            .await
            .unwrap();
        assert_eq!(with, Tier::Two);
    }

    #[tokio::test]
    async fn new_tier_rows_are_due_immediately() {
        let store = RepoStore::new_in_memory().await.unwrap();
        let repo = make_repo("1", "acme/alpha", 500);
        store.upsert_repository(&repo).await.unwrap();
        store.upsert_tier("1", 500, 1.0, 40.0).await.unwrap();

        let tier = store.get_tier_assignment("1").await.unwrap().unwrap().tier;
        let due = store
            .get_repos_needing_scan(tier, ScanKind::Deep, 168, false, 10)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn mark_scanned_removes_repo_from_due_list_until_interval() {
        let store = RepoStore::new_in_memory().await.unwrap();
        let repo = make_repo("1", "acme/alpha", 500);
        store.upsert_repository(&repo).await.unwrap();
        let tier = store.upsert_tier("1", 500, 1.0, 40.0).await.unwrap();

        store.mark_scanned("1", ScanKind::Deep, 168).await.unwrap();
        let due = store
            .get_repos_needing_scan(tier, ScanKind::Deep, 168, false, 10)
            .await
            .unwrap();
        assert!(due.is_empty(), "freshly scanned repo must not be re-selected");

        // Idempotent: a second mark changes nothing observable.
        store.mark_scanned("1", ScanKind::Deep, 168).await.unwrap();
        let due = store
            .get_repos_needing_scan(tier, ScanKind::Deep, 168, false, 10)
            .await
            .unwrap();
        assert!(due.is_empty());

        // Force overrides the cadence.
        let forced = store
            .get_repos_needing_scan(tier, ScanKind::Deep, 168, true, 10)
            .await
            .unwrap();
        assert_eq!(forced.len(), 1);
    }

    #[tokio::test]
    async fn metrics_batch_is_append_only() {
        let store = RepoStore::new_in_memory().await.unwrap();
        let repo = make_repo("1", "acme/alpha", 100);
        store.upsert_repository(&repo).await.unwrap();

        let snap = RepoMetricSnapshot::from_repository(&repo, Utc::now());
        store.upsert_metrics_batch(&[snap.clone()]).await.unwrap();
        // Same key again: ignored, not an error.
        store.upsert_metrics_batch(&[snap]).await.unwrap();

        let metrics = store.comprehensive_metrics("1").await.unwrap().unwrap();
        assert_eq!(metrics.snapshots.len(), 1);
    }

    #[tokio::test]
    async fn latest_analysis_and_recency_queries() {
        let store = RepoStore::new_in_memory().await.unwrap();
        let repo = make_repo("1", "acme/alpha", 100);
        store.upsert_repository(&repo).await.unwrap();

        assert!(store.get_latest_analysis("1").await.unwrap().is_none());
        assert!(!store.has_recent_analysis("1", 24).await.unwrap());

        let old = Analysis {
            id: uuid::Uuid::new_v4(),
            repo_id: "1".into(),
            scores: AnalysisScores {
                investment: 60.0,
                innovation: 50.0,
                team: 50.0,
                market: 50.0,
                technical_moat: None,
                scalability: None,
                developer_adoption: None,
            },
            recommendation: Recommendation::Hold,
            summary: "older".into(),
            strengths: vec![],
            risks: vec![],
            questions: vec![],
            model_used: "small".into(),
            cost: 1.0,
            created_at: Utc::now() - Duration::hours(48),
        };
        let new = Analysis {
            id: uuid::Uuid::new_v4(),
            summary: "newer".into(),
            scores: AnalysisScores {
                investment: 85.0,
                ..old.scores.clone()
            },
            recommendation: Recommendation::Buy,
            created_at: Utc::now(),
            ..old.clone()
        };
        store.save_analysis(&old).await.unwrap();
        store.save_analysis(&new).await.unwrap();

        let latest = store.get_latest_analysis("1").await.unwrap().unwrap();
        assert_eq!(latest.summary, "newer");
        assert_eq!(latest.recommendation, Recommendation::Buy);
        assert!(store.has_recent_analysis("1", 24).await.unwrap());
        assert!(store.has_recent_analysis("1", 72).await.unwrap());
    }

    #[tokio::test]
    async fn alerts_round_trip_and_dedup_window() {
        let store = RepoStore::new_in_memory().await.unwrap();
        let mut alert = Alert::new("1", "investment_opportunity", AlertLevel::Urgent, "hot repo");
        alert.metadata = Some(serde_json::json!({"investment_score": 92.0}));
        store.save_alert(&alert).await.unwrap();

        assert!(store
            .recent_alert_exists("1", "investment_opportunity", 168)
            .await
            .unwrap());
        assert!(!store
            .recent_alert_exists("1", "growth_spike", 168)
            .await
            .unwrap());

        let listed = store.list_alerts(10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].level, AlertLevel::Urgent);
        assert_eq!(
            listed[0].metadata.as_ref().unwrap()["investment_score"],
            serde_json::json!(92.0)
        );
    }

    #[tokio::test]
    async fn contributors_are_replaced_per_repo() {
        let store = RepoStore::new_in_memory().await.unwrap();
        let make = |login: &str, n: u32| Contributor {
            repo_id: "1".into(),
            login: login.into(),
            contributions: n,
            html_url: None,
        };
        store
            .save_contributors("1", &[make("alice", 10), make("bob", 5)])
            .await
            .unwrap();
        store.save_contributors("1", &[make("alice", 12)]).await.unwrap();
        // No direct list API; replacement is observable through the second
        // write not erroring on the duplicate primary key.
    }

    #[tokio::test]
    async fn batch_state_persistence_round_trips() {
        let store = RepoStore::new_in_memory().await.unwrap();
        let mut state = BatchState::new("batch-1", vec!["a/b".into(), "c/d".into()], 2.0, 100.0);
        state.transition(BatchStatus::Running);
        store.put_batch(&state).await.unwrap();

        let loaded = store.get_batch("batch-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, BatchStatus::Running);
        assert_eq!(loaded.total, 2);
        assert_eq!(loaded.repositories, vec!["a/b", "c/d"]);

        assert!(store.get_batch("missing").await.unwrap().is_none());

        let listed = store.list_batches("batch", 10).await.unwrap();
        assert_eq!(listed.len(), 1);

        assert!(store.delete_batch("batch-1").await.unwrap());
        assert!(!store.delete_batch("batch-1").await.unwrap());
    }

    #[tokio::test]
    async fn high_growth_requires_two_snapshots_and_growth() {
        let store = RepoStore::new_in_memory().await.unwrap();
        let repo = make_repo("1", "acme/alpha", 200);
        store.upsert_repository(&repo).await.unwrap();

        let t0 = Utc::now() - Duration::days(5);
        let mut s0 = RepoMetricSnapshot::from_repository(&repo, t0);
        s0.stars = 100;
        let mut s1 = RepoMetricSnapshot::from_repository(&repo, Utc::now());
        s1.stars = 200;
        store.upsert_metrics_batch(&[s0, s1]).await.unwrap();

        let growth = store.high_growth_repos(7, 10).await.unwrap();
        assert_eq!(growth.len(), 1);
        assert!((growth[0].1 - 100.0).abs() < 1e-9);

        // A repo with a single snapshot never qualifies.
        let quiet = make_repo("2", "acme/quiet", 50);
        store.upsert_repository(&quiet).await.unwrap();
        store
            .upsert_metrics_batch(&[RepoMetricSnapshot::from_repository(&quiet, Utc::now())])
            .await
            .unwrap();
        let growth = store.high_growth_repos(7, 10).await.unwrap();
        assert_eq!(growth.len(), 1);
    }

    #[tokio::test]
    async fn daily_stats_counts_by_tier() {
        let store = RepoStore::new_in_memory().await.unwrap();
        for (id, name, stars) in [("1", "a/hot", 15_000u32), ("2", "a/warm", 120), ("3", "a/cold", 5)]
        {
            let repo = make_repo(id, name, stars);
            store.upsert_repository(&repo).await.unwrap();
            let velocity = repo.star_velocity(Utc::now());
            store
                .upsert_tier(id, stars, velocity, score::engagement_score(&repo, None))
                .await
                .unwrap();
        }
        let stats = store.daily_stats().await.unwrap();
        assert_eq!(stats.total_repositories, 3);
        assert_eq!(
            stats.tier1_count + stats.tier2_count + stats.tier3_count,
            3
        );
    }

    #[tokio::test]
    async fn meta_kv_round_trips() {
        let store = RepoStore::new_in_memory().await.unwrap();
        assert!(store.get_meta("next_tick").await.unwrap().is_none());
        store.put_meta("next_tick", "2026-01-01T00:00:00Z").await.unwrap();
        store.put_meta("next_tick", "2026-01-01T01:00:00Z").await.unwrap();
        assert_eq!(
            store.get_meta("next_tick").await.unwrap().unwrap(),
            "2026-01-01T01:00:00Z"
        );
    }
}
