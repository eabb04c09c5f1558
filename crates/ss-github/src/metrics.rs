//! Per-repository endpoints: readme, contributors, commit activity,
//! releases, pull requests, issues, star history, fork analysis, and the
//! host's own rate-limit quota.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use ss_core::types::{CommitMetric, Contributor, Repository};

use crate::client::{GitHubClient, HostError, Result};
use crate::types::{
    ContributorData, ForkAnalysis, Issue, PullRequest, RateLimitInfo, ReadmeData, Release,
    RepoData, StarPoint,
};

#[derive(Serialize)]
struct PerPage {
    per_page: u8,
}

#[derive(Serialize)]
struct ListParams<'a> {
    per_page: u8,
    state: &'a str,
}

pub async fn get_repository(
    client: &GitHubClient,
    owner: &str,
    name: &str,
) -> Result<Repository> {
    let data: RepoData = client
        .octocrab
        .get(format!("/repos/{owner}/{name}"), None::<&()>)
        .await?;
    Ok(data.into_repository(Utc::now()))
}

/// Fetch and decode the repository README. The host returns base64 with
/// embedded newlines.
pub async fn get_readme(client: &GitHubClient, owner: &str, name: &str) -> Result<String> {
    let data: ReadmeData = client
        .octocrab
        .get(format!("/repos/{owner}/{name}/readme"), None::<&()>)
        .await?;
    if data.encoding != "base64" {
        return Err(HostError::InvalidResponse(format!(
            "unexpected readme encoding `{}`",
            data.encoding
        )));
    }
    let compact: String = data.content.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = BASE64
        .decode(compact)
        .map_err(|e| HostError::InvalidResponse(format!("readme base64: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|e| HostError::InvalidResponse(format!("readme utf-8: {e}")))
}

pub async fn get_contributors(
    client: &GitHubClient,
    owner: &str,
    name: &str,
    repo_id: &str,
    limit: u8,
) -> Result<Vec<Contributor>> {
    let data: Vec<ContributorData> = client
        .octocrab
        .get(
            format!("/repos/{owner}/{name}/contributors"),
            Some(&PerPage { per_page: limit }),
        )
        .await?;
    Ok(data
        .into_iter()
        .map(|c| c.into_contributor(repo_id))
        .collect())
}

/// Weekly commit counts for the last year. The host answers 202 with an
/// empty body while it computes statistics; that case comes back as an
/// empty series rather than an error.
pub async fn get_commit_activity(
    client: &GitHubClient,
    owner: &str,
    name: &str,
) -> Result<Vec<CommitMetric>> {
    let value: serde_json::Value = match client
        .octocrab
        .get(
            format!("/repos/{owner}/{name}/stats/commit_activity"),
            None::<&()>,
        )
        .await
    {
        Ok(v) => v,
        // Stats still being computed server-side.
        Err(octocrab::Error::Serde { .. }) | Err(octocrab::Error::Json { .. }) => {
            return Ok(Vec::new())
        }
        Err(e) => return Err(e.into()),
    };

    let Some(weeks) = value.as_array() else {
        return Ok(Vec::new());
    };

    let mut out = Vec::with_capacity(weeks.len());
    for week in weeks {
        let secs = week.get("week").and_then(|v| v.as_i64()).unwrap_or(0);
        let total = week.get("total").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        if let Some(week_start) = DateTime::<Utc>::from_timestamp(secs, 0) {
            out.push(CommitMetric { week_start, commits: total });
        }
    }
    Ok(out)
}

pub async fn get_releases(
    client: &GitHubClient,
    owner: &str,
    name: &str,
    limit: u8,
) -> Result<Vec<Release>> {
    let data: Vec<Release> = client
        .octocrab
        .get(
            format!("/repos/{owner}/{name}/releases"),
            Some(&PerPage { per_page: limit }),
        )
        .await?;
    Ok(data)
}

pub async fn get_pull_requests(
    client: &GitHubClient,
    owner: &str,
    name: &str,
    limit: u8,
) -> Result<Vec<PullRequest>> {
    let data: Vec<PullRequest> = client
        .octocrab
        .get(
            format!("/repos/{owner}/{name}/pulls"),
            Some(&ListParams {
                per_page: limit,
                state: "open",
            }),
        )
        .await?;
    Ok(data)
}

pub async fn get_issues(
    client: &GitHubClient,
    owner: &str,
    name: &str,
    limit: u8,
) -> Result<Vec<Issue>> {
    let data: Vec<Issue> = client
        .octocrab
        .get(
            format!("/repos/{owner}/{name}/issues"),
            Some(&ListParams {
                per_page: limit,
                state: "open",
            }),
        )
        .await?;
    Ok(data)
}

/// Approximate star timeline over the window, sampled weekly.
///
/// The host has no cheap star-history endpoint, so the series is
/// interpolated from repository age and the current count; the planner
/// only consumes relative velocity.
pub async fn get_star_history(
    client: &GitHubClient,
    owner: &str,
    name: &str,
    days: i64,
) -> Result<Vec<StarPoint>> {
    let repo = get_repository(client, owner, name).await?;
    Ok(interpolate_star_history(&repo, days, Utc::now()))
}

pub(crate) fn interpolate_star_history(
    repo: &Repository,
    days: i64,
    now: DateTime<Utc>,
) -> Vec<StarPoint> {
    let age_days = repo.age_days(now);
    let mut points = Vec::new();
    let mut day = days.min(age_days as i64);
    while day >= 0 {
        let date = now - Duration::days(day);
        let age_at_point = (age_days - day as f64).max(0.0);
        let stars = (repo.stars as f64 * age_at_point / age_days).round() as u32;
        points.push(StarPoint { date, stars });
        day -= 7;
    }
    points
}

/// Recent-fork share from the newest fork page.
pub async fn get_fork_analysis(
    client: &GitHubClient,
    owner: &str,
    name: &str,
) -> Result<ForkAnalysis> {
    #[derive(Serialize)]
    struct ForkParams<'a> {
        per_page: u8,
        sort: &'a str,
    }

    let repo = get_repository(client, owner, name).await?;
    let forks: serde_json::Value = client
        .octocrab
        .get(
            format!("/repos/{owner}/{name}/forks"),
            Some(&ForkParams {
                per_page: 100,
                sort: "newest",
            }),
        )
        .await?;

    let cutoff = Utc::now() - Duration::days(30);
    let recent_30d = forks
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|f| f.get("created_at").and_then(|v| v.as_str()))
                .filter_map(|s| DateTime::parse_from_rfc3339(s).ok())
                .filter(|d| d.with_timezone(&Utc) >= cutoff)
                .count() as u32
        })
        .unwrap_or(0);

    Ok(ForkAnalysis {
        total: repo.forks,
        recent_30d,
    })
}

pub async fn rate_limit(client: &GitHubClient) -> Result<RateLimitInfo> {
    let value: serde_json::Value = client.octocrab.get("/rate_limit", None::<&()>).await?;
    let core = value
        .get("resources")
        .and_then(|r| r.get("core"))
        .ok_or_else(|| HostError::InvalidResponse("rate_limit missing resources.core".into()))?;

    let limit = core.get("limit").and_then(|v| v.as_u64()).unwrap_or(0);
    let remaining = core.get("remaining").and_then(|v| v.as_u64()).unwrap_or(0);
    let reset = core.get("reset").and_then(|v| v.as_i64()).unwrap_or(0);
    let reset_at = DateTime::<Utc>::from_timestamp(reset, 0)
        .ok_or_else(|| HostError::InvalidResponse("rate_limit reset out of range".into()))?;

    Ok(RateLimitInfo {
        limit,
        remaining,
        reset_at,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
