use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tally_core::sync::protocol::{
    DuplicateCheckRequest, DuplicateCheckResponse, PullResponse, PushRequest, PushResponse,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{authenticate, user_fingerprint, SyncUser};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::ledger::{StatusSummary, SyncLedger};
use crate::rate_limit::{EndpointRateLimiter, ProtectedEndpoint, RateLimitMetricsSnapshot};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    ledger: Arc<SyncLedger>,
    endpoint_rate_limiter: Arc<EndpointRateLimiter>,
}

impl AppState {
    pub fn from_config(config: Arc<AppConfig>) -> Result<Self, AppError> {
        let ledger = SyncLedger::open(&config.db_path, config.entity_types.clone())?;
        Ok(Self::with_ledger(config, ledger))
    }

    /// Build state over an already opened ledger (tests use in-memory ones)
    pub fn with_ledger(config: Arc<AppConfig>, ledger: SyncLedger) -> Self {
        Self {
            ledger: Arc::new(ledger),
            endpoint_rate_limiter: Arc::new(EndpointRateLimiter::from_config(config.as_ref())),
            config,
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/sync/push", post(push_batch))
        .route("/sync/duplicates", post(check_duplicates))
        .route("/sync/pull", get(pull_changes))
        .route("/sync/status", get(sync_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    rate_limit: RateLimitMetricsSnapshot,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        rate_limit: state.endpoint_rate_limiter.metrics_snapshot(),
    })
}

async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let user = authenticate(request.headers(), &state.config)?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

async fn push_batch(
    State(state): State<AppState>,
    Extension(user): Extension<SyncUser>,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>, AppError> {
    state
        .endpoint_rate_limiter
        .check(ProtectedEndpoint::SyncPush, &user.user_id)
        .await?;

    let received = request.entries.len();
    let results = state.ledger.apply_batch(&user.user_id, &request.entries)?;
    tracing::info!(
        endpoint = "sync_push",
        user = user_fingerprint(&user.user_id),
        received,
        answered = results.len(),
        "Applied push batch"
    );
    Ok(Json(PushResponse { results }))
}

async fn check_duplicates(
    State(state): State<AppState>,
    Extension(user): Extension<SyncUser>,
    Json(request): Json<DuplicateCheckRequest>,
) -> Result<Json<DuplicateCheckResponse>, AppError> {
    // Probes ride alongside pushes, so they share the push budget
    state
        .endpoint_rate_limiter
        .check(ProtectedEndpoint::SyncPush, &user.user_id)
        .await?;

    let results = state
        .ledger
        .check_duplicates(&user.user_id, &request.probes)?;
    tracing::debug!(
        endpoint = "sync_duplicates",
        user = user_fingerprint(&user.user_id),
        probes = request.probes.len(),
        "Answered duplicate probes"
    );
    Ok(Json(DuplicateCheckResponse { results }))
}

#[derive(Debug, Deserialize)]
struct PullQuery {
    #[serde(default)]
    cursor: i64,
    limit: Option<usize>,
}

async fn pull_changes(
    State(state): State<AppState>,
    Extension(user): Extension<SyncUser>,
    Query(query): Query<PullQuery>,
) -> Result<Json<PullResponse>, AppError> {
    state
        .endpoint_rate_limiter
        .check(ProtectedEndpoint::SyncPull, &user.user_id)
        .await?;

    if query.cursor < 0 {
        return Err(AppError::bad_request("cursor must not be negative"));
    }
    let limit = query.limit.unwrap_or(state.config.max_pull_limit);
    if limit == 0 {
        return Err(AppError::bad_request("limit must be positive"));
    }
    let limit = limit.min(state.config.max_pull_limit);

    let page = state
        .ledger
        .changes_since(&user.user_id, query.cursor, limit)?;
    tracing::debug!(
        endpoint = "sync_pull",
        user = user_fingerprint(&user.user_id),
        cursor = query.cursor,
        changes = page.changes.len(),
        has_more = page.has_more,
        "Served pull page"
    );
    Ok(Json(page))
}

#[derive(Debug, Serialize)]
struct SyncStatusResponse {
    counts: StatusSummary,
}

async fn sync_status(
    State(state): State<AppState>,
    Extension(user): Extension<SyncUser>,
) -> Result<Json<SyncStatusResponse>, AppError> {
    state
        .endpoint_rate_limiter
        .check(ProtectedEndpoint::SyncPull, &user.user_id)
        .await?;

    let counts = state.ledger.status_summary(&user.user_id)?;
    Ok(Json(SyncStatusResponse { counts }))
}
