use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::types::Tier;

/// Top-level configuration loaded from `~/.starscout/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub credits: CreditsConfig,
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Config {
    /// Load config from `~/.starscout/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".starscout")
            .join("config.toml")
    }

    /// Per-tier scan policy lookup.
    pub fn tier_policy(&self, tier: Tier) -> &TierPolicy {
        match tier {
            Tier::One => &self.scan.tier1,
            Tier::Two => &self.scan.tier2,
            Tier::Three => &self.scan.tier3,
        }
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// "plain" for terminals, "json" for log shippers.
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// SQLite database location. `~` is expanded by the daemon.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            db_path: default_db_path(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "plain".into()
}
fn default_db_path() -> String {
    "~/.starscout/starscout.db".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_min_stars")]
    pub min_stars: u32,
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,
    /// Result cap for scheduled discovery runs.
    #[serde(default = "default_discovery_limit")]
    pub limit: u32,
    /// Result cap for manually triggered scans, to conserve credits.
    #[serde(default = "default_manual_limit")]
    pub manual_limit: u32,
    /// Upper bound on topic x language search combinations per cycle.
    #[serde(default = "default_max_strategies")]
    pub max_strategies: usize,
    #[serde(default = "default_concurrent_searches")]
    pub concurrent_searches: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            min_stars: default_min_stars(),
            topics: default_topics(),
            languages: default_languages(),
            limit: default_discovery_limit(),
            manual_limit: default_manual_limit(),
            max_strategies: default_max_strategies(),
            concurrent_searches: default_concurrent_searches(),
        }
    }
}

fn default_min_stars() -> u32 {
    10
}
fn default_topics() -> Vec<String> {
    ["ai", "llm", "machine-learning", "agents", "rag"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_languages() -> Vec<String> {
    ["python", "rust", "typescript"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_discovery_limit() -> u32 {
    1000
}
fn default_manual_limit() -> u32 {
    200
}
fn default_max_strategies() -> usize {
    12
}
fn default_concurrent_searches() -> usize {
    5
}

/// Scan cadence and freshness for one tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierPolicy {
    /// Maximum age of a deep scan before one is due again, in days.
    pub deep_scan_days: i64,
    /// Maximum age of a basic scan before one is due again, in days.
    pub basic_scan_days: i64,
    /// Repositories this tier may feed into a single hourly cycle.
    pub hourly_batch_limit: u32,
    /// Hours after which an analysis is stale and eligible for re-generation.
    pub freshness_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_interval_hours")]
    pub interval_hours: u32,
    /// Wall-clock hours (UTC) on which the full sweep cycle runs.
    #[serde(default = "default_sweep_hours")]
    pub sweep_hours: Vec<u32>,
    /// Hard per-cycle wall-clock ceiling in milliseconds.
    #[serde(default = "default_cycle_budget_ms")]
    pub cycle_budget_ms: u64,
    /// Phase 1 (discovery + planning) budget within an hourly cycle.
    #[serde(default = "default_phase1_budget_ms")]
    pub phase1_budget_ms: u64,
    /// Phase 2 (batch analysis) budget within an hourly cycle.
    #[serde(default = "default_phase2_budget_ms")]
    pub phase2_budget_ms: u64,
    /// Discovery cap during sweep cycles.
    #[serde(default = "default_sweep_discovery_limit")]
    pub sweep_discovery_limit: u32,
    /// Stale-repo cap for the sweep's comprehensive analysis pass.
    #[serde(default = "default_sweep_analysis_limit")]
    pub sweep_analysis_limit: u32,
    #[serde(default = "default_tier1_policy")]
    pub tier1: TierPolicy,
    #[serde(default = "default_tier2_policy")]
    pub tier2: TierPolicy,
    #[serde(default = "default_tier3_policy")]
    pub tier3: TierPolicy,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            interval_hours: default_interval_hours(),
            sweep_hours: default_sweep_hours(),
            cycle_budget_ms: default_cycle_budget_ms(),
            phase1_budget_ms: default_phase1_budget_ms(),
            phase2_budget_ms: default_phase2_budget_ms(),
            sweep_discovery_limit: default_sweep_discovery_limit(),
            sweep_analysis_limit: default_sweep_analysis_limit(),
            tier1: default_tier1_policy(),
            tier2: default_tier2_policy(),
            tier3: default_tier3_policy(),
        }
    }
}

fn default_interval_hours() -> u32 {
    1
}
fn default_sweep_hours() -> Vec<u32> {
    vec![2, 14]
}
fn default_cycle_budget_ms() -> u64 {
    300_000
}
fn default_phase1_budget_ms() -> u64 {
    180_000
}
fn default_phase2_budget_ms() -> u64 {
    120_000
}
fn default_sweep_discovery_limit() -> u32 {
    50
}
fn default_sweep_analysis_limit() -> u32 {
    100
}
fn default_tier1_policy() -> TierPolicy {
    TierPolicy {
        deep_scan_days: 7,
        basic_scan_days: 3,
        hourly_batch_limit: 25,
        freshness_hours: 168,
    }
}
fn default_tier2_policy() -> TierPolicy {
    TierPolicy {
        deep_scan_days: 14,
        basic_scan_days: 10,
        hourly_batch_limit: 50,
        freshness_hours: 240,
    }
}
fn default_tier3_policy() -> TierPolicy {
    TierPolicy {
        deep_scan_days: 30,
        basic_scan_days: 14,
        hourly_batch_limit: 100,
        freshness_hours: 336,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff between analysis attempts for the same repo.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_analysis_timeout_ms")]
    pub analysis_timeout_ms: u64,
    #[serde(default = "default_delay_between_analyses_ms")]
    pub delay_between_analyses_ms: u64,
    #[serde(default = "default_retry_backoff_multiplier")]
    pub retry_backoff_multiplier: f64,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
    #[serde(default = "default_recovery_delay_ms")]
    pub recovery_delay_ms: u64,
    #[serde(default = "default_max_batch_runtime_ms")]
    pub max_batch_runtime_ms: u64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,
    /// Concurrent LLM workers per batch (3 on paid plans).
    #[serde(default = "default_concurrent_workers")]
    pub concurrent_workers: usize,
    /// Hourly automated batch pool bounds.
    #[serde(default = "default_pool_min")]
    pub pool_min: u32,
    #[serde(default = "default_pool_max")]
    pub pool_max: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            analysis_timeout_ms: default_analysis_timeout_ms(),
            delay_between_analyses_ms: default_delay_between_analyses_ms(),
            retry_backoff_multiplier: default_retry_backoff_multiplier(),
            max_consecutive_failures: default_max_consecutive_failures(),
            max_recovery_attempts: default_max_recovery_attempts(),
            recovery_delay_ms: default_recovery_delay_ms(),
            max_batch_runtime_ms: default_max_batch_runtime_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            min_success_rate: default_min_success_rate(),
            alert_threshold: default_alert_threshold(),
            concurrent_workers: default_concurrent_workers(),
            pool_min: default_pool_min(),
            pool_max: default_pool_max(),
        }
    }
}

fn default_chunk_size() -> usize {
    5
}
fn default_max_chunk_size() -> usize {
    10
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_delay_ms() -> u64 {
    3_000
}
fn default_analysis_timeout_ms() -> u64 {
    120_000
}
fn default_delay_between_analyses_ms() -> u64 {
    2_000
}
fn default_retry_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_consecutive_failures() -> u32 {
    5
}
fn default_max_recovery_attempts() -> u32 {
    3
}
fn default_recovery_delay_ms() -> u64 {
    30_000
}
fn default_max_batch_runtime_ms() -> u64 {
    300_000
}
fn default_health_check_interval_ms() -> u64 {
    10_000
}
fn default_min_success_rate() -> f64 {
    0.5
}
fn default_alert_threshold() -> f64 {
    80.0
}
fn default_concurrent_workers() -> usize {
    1
}
fn default_pool_min() -> u32 {
    25
}
fn default_pool_max() -> u32 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditsConfig {
    #[serde(default = "default_max_per_batch")]
    pub max_per_batch: f64,
    #[serde(default = "default_max_per_hour")]
    pub max_per_hour: f64,
    /// Configured credit-to-repo ratio used for estimates.
    #[serde(default = "default_estimated_per_repo")]
    pub estimated_per_repo: f64,
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self {
            max_per_batch: default_max_per_batch(),
            max_per_hour: default_max_per_hour(),
            estimated_per_repo: default_estimated_per_repo(),
        }
    }
}

fn default_max_per_batch() -> f64 {
    100.0
}
fn default_max_per_hour() -> f64 {
    200.0
}
fn default_estimated_per_repo() -> f64 {
    2.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    /// Environment variable holding the personal access token.
    #[serde(default = "default_github_token_env")]
    pub token_env: String,
    /// Search endpoint budget (requests per minute).
    #[serde(default = "default_search_per_minute")]
    pub search_per_minute: u64,
    /// Core REST endpoint budget (requests per hour).
    #[serde(default = "default_core_per_hour")]
    pub core_per_hour: u64,
    #[serde(default = "default_host_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            token_env: default_github_token_env(),
            search_per_minute: default_search_per_minute(),
            core_per_hour: default_core_per_hour(),
            timeout_ms: default_host_timeout_ms(),
        }
    }
}

fn default_github_token_env() -> String {
    "GITHUB_TOKEN".into()
}
fn default_search_per_minute() -> u64 {
    30
}
fn default_core_per_hour() -> u64 {
    5_000
}
fn default_host_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "default_llm_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_llm_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            api_key_env: default_llm_key_env(),
            timeout_ms: default_llm_timeout_ms(),
            max_tokens: default_llm_max_tokens(),
        }
    }
}

fn default_llm_key_env() -> String {
    "ANTHROPIC_API_KEY".into()
}
fn default_llm_timeout_ms() -> u64 {
    120_000
}
fn default_llm_max_tokens() -> u32 {
    4_096
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_daemon_host")]
    pub host: String,
    #[serde(default = "default_daemon_port")]
    pub port: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_daemon_host(),
            port: default_daemon_port(),
        }
    }
}

fn default_daemon_host() -> String {
    "127.0.0.1".into()
}
fn default_daemon_port() -> u16 {
    8484
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
