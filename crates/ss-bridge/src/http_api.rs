use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tower_http::cors::CorsLayer;
use tracing::warn;

use ss_core::store::{RepoStore, StoreError};
use ss_core::types::{active_batch, BatchState, CycleProgress, Tier};
use ss_harness::rate_limiter::RateGovernor;

use crate::commands::{AnalyzeTarget, EngineCommand};

// ---------------------------------------------------------------------------
// State & errors
// ---------------------------------------------------------------------------

/// Shared state for all HTTP handlers. Queries read the store and the
/// cycle progress directly; mutations go to the daemon as commands.
pub struct ApiState {
    pub store: Arc<RepoStore>,
    pub progress: Arc<RwLock<CycleProgress>>,
    pub governor: Arc<RateGovernor>,
    pub command_tx: mpsc::Sender<EngineCommand>,
    pub start_time: std::time::Instant,
}

impl ApiState {
    pub fn new(
        store: Arc<RepoStore>,
        progress: Arc<RwLock<CycleProgress>>,
        governor: Arc<RateGovernor>,
        command_tx: mpsc::Sender<EngineCommand>,
    ) -> Self {
        Self {
            store,
            progress,
            governor,
            command_tx,
            start_time: std::time::Instant::now(),
        }
    }

    async fn send(&self, command: EngineCommand) -> Result<(), ApiError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ApiError::Internal("engine command channel closed".into()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        warn!(error = %err, "store error surfaced to API");
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the full facade router.
pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/init", post(post_init))
        .route("/scan", post(post_scan))
        .route("/scan/comprehensive", post(post_scan_comprehensive))
        .route("/analyze", post(post_analyze))
        .route("/status", get(get_status))
        .route("/report", get(get_report))
        .route("/metrics", get(get_metrics))
        .route("/tiers", get(get_tiers))
        .route("/batch/start", post(post_batch_start))
        .route("/batch/status", get(get_batch_status))
        .route("/batch/active", get(get_batch_active))
        .route("/batch/history", get(get_batch_history))
        .route("/batch/stop", post(post_batch_stop))
        .route("/batch/clear", post(post_batch_clear))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Control handlers
// ---------------------------------------------------------------------------

async fn post_init(State(state): State<Arc<ApiState>>) -> Result<Json<serde_json::Value>, ApiError> {
    state.send(EngineCommand::Init).await?;
    Ok(Json(serde_json::json!({ "initialized": true })))
}

#[derive(Deserialize)]
struct ScanParams {
    #[serde(default)]
    force: bool,
}

async fn post_scan(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<ScanParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.send(EngineCommand::Scan { force: params.force }).await?;
    Ok(Json(serde_json::json!({ "queued": true, "kind": "scan" })))
}

#[derive(Deserialize)]
struct ComprehensiveParams {
    #[serde(default)]
    force: bool,
    min_repos: Option<u32>,
}

async fn post_scan_comprehensive(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<ComprehensiveParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .send(EngineCommand::ComprehensiveScan {
            force: params.force,
            min_repos: params.min_repos,
        })
        .await?;
    Ok(Json(
        serde_json::json!({ "queued": true, "kind": "comprehensive" }),
    ))
}

#[derive(Deserialize)]
struct AnalyzeRequest {
    #[serde(flatten)]
    target: AnalyzeTarget,
    #[serde(default)]
    force: bool,
}

async fn post_analyze(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // An id the store has never seen is a client error, not a queued job.
    if let AnalyzeTarget::ById { repo_id } = &req.target {
        if state.store.get_repository(repo_id).await?.is_none() {
            return Err(ApiError::NotFound(format!("unknown repo_id `{repo_id}`")));
        }
    }
    state
        .send(EngineCommand::Analyze {
            target: req.target,
            force: req.force,
        })
        .await?;
    Ok(Json(serde_json::json!({ "queued": true })))
}

// ---------------------------------------------------------------------------
// Status handlers
// ---------------------------------------------------------------------------

async fn get_status(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let progress = state.progress.read().await.clone();
    let repositories = state.store.repository_count().await?;
    Ok(Json(serde_json::json!({
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "repositories": repositories,
        "cycle": progress,
        "rate_limits": state.governor.snapshot(),
    })))
}

async fn get_report(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let daily = state.store.daily_stats().await?;
    let high_growth: Vec<serde_json::Value> = state
        .store
        .high_growth_repos(7, 10)
        .await?
        .into_iter()
        .take(10)
        .map(|(repo, pct)| {
            serde_json::json!({
                "full_name": repo.full_name,
                "stars": repo.stars,
                "growth_pct": pct,
            })
        })
        .collect();
    let recent_alerts = state.store.list_alerts(10).await?;
    Ok(Json(serde_json::json!({
        "daily": daily,
        "high_growth": high_growth,
        "recent_alerts": recent_alerts,
    })))
}

#[derive(Deserialize)]
struct MetricsParams {
    repo_id: Option<String>,
}

async fn get_metrics(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<MetricsParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let repo_id = params
        .repo_id
        .ok_or_else(|| ApiError::BadRequest("repo_id query parameter is required".into()))?;
    let metrics = state
        .store
        .comprehensive_metrics(&repo_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("unknown repo_id `{repo_id}`")))?;
    Ok(Json(serde_json::to_value(metrics).unwrap_or_default()))
}

#[derive(Deserialize)]
struct TiersParams {
    tier: Option<u8>,
}

async fn get_tiers(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<TiersParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let raw = params
        .tier
        .ok_or_else(|| ApiError::BadRequest("tier query parameter is required".into()))?;
    let tier = Tier::try_from(raw).map_err(ApiError::BadRequest)?;
    let repos = state.store.get_repos_by_tier(tier, 100).await?;
    Ok(Json(serde_json::json!({
        "tier": tier,
        "count": repos.len(),
        "repositories": repos,
    })))
}

// ---------------------------------------------------------------------------
// Batch handlers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct BatchStartRequest {
    batch_id: String,
    #[serde(default)]
    repositories: Vec<String>,
}

async fn post_batch_start(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<BatchStartRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if req.batch_id.trim().is_empty() {
        return Err(ApiError::BadRequest("batch_id must not be empty".into()));
    }
    let total = req.repositories.len();
    state
        .send(EngineCommand::StartBatch {
            batch_id: req.batch_id.clone(),
            repositories: req.repositories,
        })
        .await?;
    Ok(Json(serde_json::json!({
        "batch_id": req.batch_id,
        "queued": true,
        "total": total,
    })))
}

#[derive(Serialize)]
struct BatchStatusView {
    #[serde(flatten)]
    state: BatchState,
    stale: bool,
}

#[derive(Deserialize)]
struct BatchStatusParams {
    batch_id: Option<String>,
}

async fn get_batch_status(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<BatchStatusParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let batch_id = params
        .batch_id
        .ok_or_else(|| ApiError::BadRequest("batch_id query parameter is required".into()))?;
    let batch = state
        .store
        .get_batch(&batch_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("unknown batch_id `{batch_id}`")))?;
    let stale = batch.is_stale(chrono::Utc::now());
    let view = BatchStatusView { state: batch, stale };
    Ok(Json(serde_json::to_value(view).unwrap_or_default()))
}

async fn get_batch_active(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let batches = state.store.list_batches("", 20).await?;
    match active_batch(&batches) {
        Some(batch) => {
            let stale = batch.is_stale(chrono::Utc::now());
            Ok(Json(serde_json::json!({
                "active": batch,
                "stale": stale,
            })))
        }
        None => Ok(Json(serde_json::json!({ "active": null }))),
    }
}

async fn get_batch_history(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let batches = state.store.list_batches("", 20).await?;
    Ok(Json(serde_json::json!({
        "count": batches.len(),
        "batches": batches,
    })))
}

async fn post_batch_stop(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.send(EngineCommand::StopBatch).await?;
    Ok(Json(serde_json::json!({ "stopped": true })))
}

async fn post_batch_clear(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let batches = state.store.list_batches("", 1000).await?;
    let mut deleted = 0u32;
    for batch in batches.iter().filter(|b| b.status.is_terminal()) {
        if state.store.delete_batch(&batch.batch_id).await? {
            deleted += 1;
        }
    }
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ss_core::types::BatchStatus;
    use ss_harness::rate_limiter::RateLimitConfig;

    async fn make_state() -> (Arc<ApiState>, mpsc::Receiver<EngineCommand>) {
        let store = Arc::new(RepoStore::new_in_memory().await.unwrap());
        let progress = Arc::new(RwLock::new(CycleProgress::default()));
        let governor = Arc::new(RateGovernor::new(RateLimitConfig::per_second(10)));
        let (tx, rx) = mpsc::channel(16);
        (
            Arc::new(ApiState::new(store, progress, governor, tx)),
            rx,
        )
    }

    #[tokio::test]
    async fn analyze_unknown_repo_id_is_404() {
        let (state, _rx) = make_state().await;
        let req = AnalyzeRequest {
            target: AnalyzeTarget::ById {
                repo_id: "missing".into(),
            },
            force: false,
        };
        let err = post_analyze(State(state), Json(req)).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn analyze_by_name_enqueues_command() {
        let (state, mut rx) = make_state().await;
        let req = AnalyzeRequest {
            target: AnalyzeTarget::ByName {
                owner: "acme".into(),
                name: "proj".into(),
            },
            force: true,
        };
        post_analyze(State(state), Json(req)).await.unwrap();
        match rx.recv().await.unwrap() {
            EngineCommand::Analyze { force, .. } => assert!(force),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test]
    async fn tiers_requires_a_valid_tier() {
        let (state, _rx) = make_state().await;
        let err = get_tiers(State(state.clone()), Query(TiersParams { tier: None }))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));

        let err = get_tiers(State(state), Query(TiersParams { tier: Some(7) }))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[tokio::test]
    async fn batch_status_unknown_id_is_404() {
        let (state, _rx) = make_state().await;
        let err = get_batch_status(
            State(state),
            Query(BatchStatusParams {
                batch_id: Some("nope".into()),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn batch_start_rejects_empty_id_and_enqueues_valid() {
        let (state, mut rx) = make_state().await;
        let err = post_batch_start(
            State(state.clone()),
            Json(BatchStartRequest {
                batch_id: "  ".into(),
                repositories: vec![],
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));

        post_batch_start(
            State(state),
            Json(BatchStartRequest {
                batch_id: "b1".into(),
                repositories: vec!["a/b".into()],
            }),
        )
        .await
        .unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineCommand::StartBatch { .. }
        ));
    }

    #[tokio::test]
    async fn batch_clear_deletes_only_terminal_batches() {
        let (state, _rx) = make_state().await;
        let mut done = BatchState::new("done", vec![], 2.0, 100.0);
        done.transition(BatchStatus::Running);
        done.transition(BatchStatus::Completed);
        let mut live = BatchState::new("live", vec!["a/b".into()], 2.0, 100.0);
        live.transition(BatchStatus::Running);
        state.store.put_batch(&done).await.unwrap();
        state.store.put_batch(&live).await.unwrap();

        let Json(value) = post_batch_clear(State(state.clone())).await.unwrap();
        assert_eq!(value["deleted"], 1);
        assert!(state.store.get_batch("live").await.unwrap().is_some());
        assert!(state.store.get_batch("done").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_reports_uptime_and_counts() {
        let (state, _rx) = make_state().await;
        let Json(value) = get_status(State(state)).await.unwrap();
        assert_eq!(value["repositories"], 0);
        assert!(value["cycle"]["phase"].is_string());
    }
}
