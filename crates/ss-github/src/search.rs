use serde::Serialize;
use tracing::debug;

use ss_core::types::Repository;

use crate::client::{GitHubClient, Result};
use crate::types::SearchData;

// ---------------------------------------------------------------------------
// Search strategies
// ---------------------------------------------------------------------------

/// One topic/language combination the discovery engine searches for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchStrategy {
    pub topic: String,
    pub language: Option<String>,
    pub min_stars: u32,
}

impl SearchStrategy {
    /// Render the strategy as a GitHub search qualifier string.
    pub fn to_query(&self) -> String {
        let mut q = format!("topic:{} stars:>={}", self.topic, self.min_stars);
        if let Some(lang) = &self.language {
            q.push_str(&format!(" language:{lang}"));
        }
        q.push_str(" archived:false");
        q
    }
}

/// Build the strategy list: every topic alone, then topic x language
/// combinations, capped at `max` to bound host-API spend per cycle.
pub fn build_strategies(
    topics: &[String],
    languages: &[String],
    min_stars: u32,
    max: usize,
) -> Vec<SearchStrategy> {
    let mut out = Vec::new();
    for topic in topics {
        out.push(SearchStrategy {
            topic: topic.clone(),
            language: None,
            min_stars,
        });
    }
    for topic in topics {
        for language in languages {
            out.push(SearchStrategy {
                topic: topic.clone(),
                language: Some(language.clone()),
                min_stars,
            });
        }
    }
    out.truncate(max);
    out
}

// ---------------------------------------------------------------------------
// Search call
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct SearchParams<'a> {
    q: &'a str,
    sort: &'a str,
    order: &'a str,
    per_page: u8,
}

/// Run one repository search against the host.
pub async fn search(
    client: &GitHubClient,
    query: &str,
    sort: &str,
    order: &str,
    per_page: u8,
) -> Result<Vec<Repository>> {
    let params = SearchParams {
        q: query,
        sort,
        order,
        per_page,
    };
    let data: SearchData = client
        .octocrab
        .get("/search/repositories", Some(&params))
        .await?;
    debug!(query, total = data.total_count, returned = data.items.len(), "search completed");

    let now = chrono::Utc::now();
    Ok(data
        .items
        .into_iter()
        .map(|item| item.into_repository(now))
        .collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
