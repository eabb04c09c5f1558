//! Builds analysis prompts and parses the LLM's loosely-typed JSON into
//! strict [`Analysis`] records.
//!
//! Parsing is deliberately unforgiving: out-of-range scores and unknown
//! recommendation strings are rejected, never coerced. Optional enhanced
//! dimensions stay `None` when the model omits them.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use ss_core::score::{ModelTier, RepoSignals};
use ss_core::types::{Analysis, AnalysisScores, Recommendation, Repository};

use crate::llm::{LlmError, LlmMessage, LlmProvider};
use crate::model_router::ModelCatalog;

const SYSTEM_PROMPT: &str = "You are an investment analyst for open-source AI/ML projects. \
Score the repository you are given and answer with a single JSON object, no prose, with \
fields: scores {investment, innovation, team, market, technical_moat?, scalability?, \
developer_adoption?} each 0-100, recommendation (strong_buy|buy|hold|pass), summary, \
strengths[], risks[], questions[].";

/// Readme excerpt cap, in characters, to bound prompt size.
const README_EXCERPT_CHARS: usize = 4000;

/// Analyzes repositories through an [`LlmProvider`] using the model tier
/// the scorer recommended.
pub struct RepoAnalyzer {
    provider: Arc<dyn LlmProvider>,
    catalog: ModelCatalog,
}

impl RepoAnalyzer {
    pub fn new(provider: Arc<dyn LlmProvider>, catalog: ModelCatalog) -> Self {
        Self { provider, catalog }
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Run one analysis. Observed enhanced metrics enrich the prompt; the
    /// returned record carries the concrete model id and its credit cost.
    pub async fn analyze(
        &self,
        repo: &Repository,
        readme: &str,
        signals: &RepoSignals,
        model_tier: ModelTier,
    ) -> Result<Analysis, LlmError> {
        let spec = self.catalog.spec_for(model_tier).clone();
        let mut config = self.catalog.llm_config_for(model_tier);
        config.system_prompt = Some(SYSTEM_PROMPT.to_string());

        let messages = vec![LlmMessage::user(build_prompt(repo, readme, signals))];
        let response = self.provider.complete(&messages, &config).await?;

        debug!(
            repo = %repo.full_name,
            model = %spec.id,
            output_tokens = response.output_tokens,
            "analysis response received"
        );

        parse_analysis(&response.content, &repo.id, &spec.id, spec.credit_cost)
    }
}

/// Render the user prompt: repository facts, any observed enhanced
/// metrics, and a bounded readme excerpt.
pub fn build_prompt(repo: &Repository, readme: &str, signals: &RepoSignals) -> String {
    let topics = if repo.topics.is_empty() {
        "(none)".to_string()
    } else {
        repo.topics.join(", ")
    };
    let excerpt: String = readme.chars().take(README_EXCERPT_CHARS).collect();
    let mut prompt = format!(
        "Repository: {}\nDescription: {}\nLanguage: {}\nStars: {}  Forks: {}  Open issues: {}\n\
         Topics: {}\nCreated: {}  Last push: {}",
        repo.full_name,
        repo.description.as_deref().unwrap_or("(none)"),
        repo.language.as_deref().unwrap_or("(unknown)"),
        repo.stars,
        repo.forks,
        repo.open_issues,
        topics,
        repo.created_at.date_naive(),
        repo.pushed_at
            .map(|d| d.date_naive().to_string())
            .unwrap_or_else(|| "(never)".into()),
    );

    let enhanced = enhanced_metrics_block(signals);
    if !enhanced.is_empty() {
        prompt.push_str("\n\nEnhanced metrics:\n");
        prompt.push_str(&enhanced);
    }

    prompt.push_str("\n\nREADME excerpt:\n");
    prompt.push_str(&excerpt);
    prompt
}

/// One line per observed signal; unknown fields are omitted rather than
/// rendered as zeros.
fn enhanced_metrics_block(signals: &RepoSignals) -> String {
    let mut lines: Vec<String> = Vec::new();
    if let Some(n) = signals.contributors {
        lines.push(format!("Contributors: {n}"));
    }
    if let Some(n) = signals.commits_last_month {
        lines.push(format!("Commits in the last month: {n}"));
    }
    if let Some(n) = signals.open_prs {
        lines.push(format!("Open pull requests: {n}"));
    }
    if let Some(n) = signals.recent_releases {
        lines.push(format!("Recent releases: {n}"));
    }
    if let Some(n) = signals.active_issues_30d {
        lines.push(format!("Issues active in the last 30 days: {n}"));
    }
    if let Some(n) = signals.recent_forks_30d {
        lines.push(format!("Forks in the last 30 days: {n}"));
    }
    if let Some(pct) = signals.monthly_growth_pct {
        lines.push(format!("Observed monthly star growth: {pct:.1}%"));
    }
    lines.join("\n")
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct AnalysisPayload {
    scores: ScoresPayload,
    recommendation: String,
    summary: String,
    #[serde(default)]
    strengths: Vec<String>,
    #[serde(default)]
    risks: Vec<String>,
    #[serde(default)]
    questions: Vec<String>,
}

#[derive(Deserialize)]
struct ScoresPayload {
    investment: f64,
    innovation: f64,
    team: f64,
    market: f64,
    #[serde(default)]
    technical_moat: Option<f64>,
    #[serde(default)]
    scalability: Option<f64>,
    #[serde(default)]
    developer_adoption: Option<f64>,
}

/// Parse the model's reply into an [`Analysis`].
pub fn parse_analysis(
    content: &str,
    repo_id: &str,
    model_used: &str,
    cost: f64,
) -> Result<Analysis, LlmError> {
    let json = extract_json(content)
        .ok_or_else(|| LlmError::InvalidResponse("no JSON object in reply".into()))?;

    let payload: AnalysisPayload = serde_json::from_str(json)
        .map_err(|e| LlmError::InvalidResponse(format!("analysis payload: {e}")))?;

    let recommendation: Recommendation =
        serde_json::from_value(serde_json::Value::String(payload.recommendation.clone()))
            .map_err(|_| {
                LlmError::InvalidResponse(format!(
                    "unknown recommendation `{}`",
                    payload.recommendation
                ))
            })?;

    let scores = AnalysisScores {
        investment: payload.scores.investment,
        innovation: payload.scores.innovation,
        team: payload.scores.team,
        market: payload.scores.market,
        technical_moat: payload.scores.technical_moat,
        scalability: payload.scores.scalability,
        developer_adoption: payload.scores.developer_adoption,
    };
    validate_scores(&scores)?;

    Ok(Analysis {
        id: Uuid::new_v4(),
        repo_id: repo_id.to_string(),
        scores,
        recommendation,
        summary: payload.summary,
        strengths: payload.strengths,
        risks: payload.risks,
        questions: payload.questions,
        model_used: model_used.to_string(),
        cost,
        created_at: Utc::now(),
    })
}

fn validate_scores(scores: &AnalysisScores) -> Result<(), LlmError> {
    let required = [
        ("investment", scores.investment),
        ("innovation", scores.innovation),
        ("team", scores.team),
        ("market", scores.market),
    ];
    let optional = [
        ("technical_moat", scores.technical_moat),
        ("scalability", scores.scalability),
        ("developer_adoption", scores.developer_adoption),
    ];
    for (name, value) in required
        .into_iter()
        .chain(optional.into_iter().filter_map(|(n, v)| v.map(|v| (n, v))))
    {
        if !(0.0..=100.0).contains(&value) || !value.is_finite() {
            return Err(LlmError::InvalidResponse(format!(
                "score `{name}` out of range: {value}"
            )));
        }
    }
    Ok(())
}

/// Pull the outermost JSON object out of the reply, tolerating markdown
/// fences around it.
fn extract_json(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    (end > start).then(|| &content[start..=end])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
