use chrono::{DateTime, Utc};
use serde::Deserialize;

use ss_core::types::{Contributor, Repository};

// ---------------------------------------------------------------------------
// Wire DTOs
// ---------------------------------------------------------------------------

/// Repository payload as the GitHub REST API returns it. Counts default to
/// zero because search items occasionally omit them.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoData {
    pub id: u64,
    pub name: String,
    pub full_name: String,
    pub owner: OwnerData,
    pub description: Option<String>,
    #[serde(default)]
    pub stargazers_count: u32,
    #[serde(default)]
    pub forks_count: u32,
    #[serde(default)]
    pub open_issues_count: u32,
    pub language: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub pushed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub fork: bool,
    pub html_url: String,
    pub default_branch: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OwnerData {
    pub login: String,
}

impl RepoData {
    /// Convert the wire payload into the domain record.
    pub fn into_repository(self, discovered_at: DateTime<Utc>) -> Repository {
        Repository {
            id: self.id.to_string(),
            owner: self.owner.login,
            name: self.name,
            full_name: self.full_name,
            description: self.description,
            stars: self.stargazers_count,
            forks: self.forks_count,
            open_issues: self.open_issues_count,
            language: self.language,
            topics: self.topics,
            created_at: self.created_at,
            updated_at: self.updated_at,
            pushed_at: self.pushed_at,
            is_archived: self.archived,
            is_fork: self.fork,
            html_url: self.html_url,
            default_branch: self.default_branch.unwrap_or_else(|| "main".into()),
            discovered_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchData {
    pub total_count: u64,
    pub items: Vec<RepoData>,
}

#[derive(Debug, Deserialize)]
pub struct ContributorData {
    pub login: String,
    pub contributions: u32,
    pub html_url: Option<String>,
}

impl ContributorData {
    pub fn into_contributor(self, repo_id: &str) -> Contributor {
        Contributor {
            repo_id: repo_id.to_string(),
            login: self.login,
            contributions: self.contributions,
            html_url: self.html_url,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReadmeData {
    pub content: String,
    pub encoding: String,
}

// ---------------------------------------------------------------------------
// Enhanced-metric payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub state: String,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub state: String,
    pub updated_at: Option<DateTime<Utc>>,
}

/// One sampled point of the star timeline.
#[derive(Debug, Clone, serde::Serialize, Deserialize)]
pub struct StarPoint {
    pub date: DateTime<Utc>,
    pub stars: u32,
}

/// Fork totals used by the engagement heuristics.
#[derive(Debug, Clone, serde::Serialize, Deserialize)]
pub struct ForkAnalysis {
    pub total: u32,
    pub recent_30d: u32,
}

/// Host-reported quota for the core REST API.
#[derive(Debug, Clone, serde::Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_data_parses_a_search_item() {
        let json = serde_json::json!({
            "id": 123,
            "name": "proj",
            "full_name": "acme/proj",
            "owner": {"login": "acme"},
            "description": "an ai thing",
            "stargazers_count": 420,
            "forks_count": 42,
            "open_issues_count": 7,
            "language": "Rust",
            "topics": ["ai", "llm"],
            "created_at": "2025-01-01T00:00:00Z",
            "updated_at": "2026-07-01T00:00:00Z",
            "pushed_at": "2026-07-30T12:00:00Z",
            "archived": false,
            "fork": false,
            "html_url": "https://github.com/acme/proj",
            "default_branch": "main"
        });
        let data: RepoData = serde_json::from_value(json).unwrap();
        let repo = data.into_repository(Utc::now());
        assert_eq!(repo.id, "123");
        assert_eq!(repo.owner, "acme");
        assert_eq!(repo.full_name, "acme/proj");
        assert_eq!(repo.stars, 420);
        assert_eq!(repo.topics, vec!["ai", "llm"]);
    }

    #[test]
    fn repo_data_tolerates_missing_counts_and_branch() {
        let json = serde_json::json!({
            "id": 9,
            "name": "bare",
            "full_name": "acme/bare",
            "owner": {"login": "acme"},
            "description": null,
            "language": null,
            "created_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-01-01T00:00:00Z",
            "pushed_at": null,
            "html_url": "https://github.com/acme/bare",
            "default_branch": null
        });
        let data: RepoData = serde_json::from_value(json).unwrap();
        let repo = data.into_repository(Utc::now());
        assert_eq!(repo.stars, 0);
        assert_eq!(repo.default_branch, "main");
        assert!(repo.pushed_at.is_none());
        assert!(repo.topics.is_empty());
    }
}
