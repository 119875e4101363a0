// Swim Results Reconciliation - API Server
// Thin REST layer over the mapping lifecycle and candidate matcher

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use swim_reconcile::matcher::{Candidate, Suggestion};
use swim_reconcile::store::Page;
use swim_reconcile::{
    AutoConfirmReport, CandidateMatcher, ClubUnmatched, ConfirmOutcome, EntityKind, Event,
    ExternalEntityMapping, GroupBy, MappingManager, MappingStats, MatchQuery, NewMapping,
    ReconcileConfig, ReconcileError, SqliteStore, TeamCodeReport, UnmatchedReport,
    UnmatchedSummary,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    store: Arc<Mutex<SqliteStore>>,
    config: Arc<ReconcileConfig>,
}

impl AppState {
    fn store(&self) -> Result<MutexGuard<'_, SqliteStore>, ApiError> {
        self.store
            .lock()
            .map_err(|_| ApiError::Internal("store lock poisoned".to_string()))
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::ok(data)))
}

// ============================================================================
// Error mapping
// ============================================================================

enum ApiError {
    Domain(ReconcileError),
    Internal(String),
}

impl From<ReconcileError> for ApiError {
    fn from(err: ReconcileError) -> Self {
        ApiError::Domain(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Domain(err) => {
                let status = match &err {
                    ReconcileError::NotFound { .. } => StatusCode::NOT_FOUND,
                    ReconcileError::InvalidTransition { .. } | ReconcileError::Conflict(_) => {
                        StatusCode::CONFLICT
                    }
                    ReconcileError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if err.is_client_error() {
                    (status, err.to_string())
                } else {
                    error!(error = %err, "request failed");
                    (status, format!("internal error: {err}"))
                }
            }
            ApiError::Internal(message) => {
                error!(error = %message, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("internal error: {message}"),
                )
            }
        };

        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(message),
        };
        (status, Json(body)).into_response()
    }
}

fn parse_kind(raw: &str) -> Result<EntityKind, ApiError> {
    raw.parse::<EntityKind>()
        .map_err(|e| ApiError::Domain(ReconcileError::InvalidInput(e.to_string())))
}

// ============================================================================
// Request bodies and query strings
// ============================================================================

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default = "default_page_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_page_limit() -> usize {
    50
}

#[derive(Deserialize)]
struct SearchQuery {
    name: String,
    scope: Option<String>,
    min_similarity: Option<f64>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct SuggestBody {
    names: Vec<String>,
    min_similarity: Option<f64>,
}

#[derive(Deserialize)]
struct ConfirmBody {
    internal_id: String,
    reviewed_by: Option<String>,
}

#[derive(Deserialize, Default)]
struct RejectBody {
    reviewed_by: Option<String>,
}

#[derive(Deserialize, Default)]
struct AutoMatchBody {
    min_confidence: Option<f64>,
    #[serde(default)]
    dry_run: bool,
}

#[derive(Deserialize)]
struct UnmatchedQuery {
    team: Option<String>,
    #[serde(default = "default_unmatched_limit")]
    limit: usize,
    #[serde(default)]
    group_by: GroupBy,
}

fn default_unmatched_limit() -> usize {
    100
}

#[derive(Deserialize)]
struct LimitQuery {
    #[serde(default = "default_unmatched_limit")]
    limit: usize,
}

#[derive(Deserialize)]
struct LinkTeamCodeBody {
    team_code: String,
    reviewed_by: Option<String>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/matching/:kind/stats
async fn get_stats(State(state): State<AppState>, Path(kind): Path<String>) -> ApiResult<MappingStats> {
    let kind = parse_kind(&kind)?;
    let store = state.store()?;
    ok(MappingManager::new(&*store, state.config.source_tag.as_str()).stats(kind)?)
}

/// GET /api/matching/:kind/pending?limit=&offset=
async fn get_pending(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Page<ExternalEntityMapping>> {
    let kind = parse_kind(&kind)?;
    let store = state.store()?;
    ok(MappingManager::new(&*store, state.config.source_tag.as_str())
        .pending(kind, page.limit, page.offset)?)
}

/// GET /api/matching/:kind/search?name=&scope=&min_similarity=&limit=
async fn search(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(q): Query<SearchQuery>,
) -> ApiResult<Vec<Candidate>> {
    let kind = parse_kind(&kind)?;
    let query = MatchQuery {
        external_name: &q.name,
        scope: q.scope.as_deref(),
        min_similarity: q.min_similarity.unwrap_or(state.config.search_min_similarity),
        limit: q.limit.unwrap_or(state.config.match_limit),
    };
    let store = state.store()?;
    ok(CandidateMatcher::new(&*store, state.config.candidate_fetch_factor).find_matches(kind, &query)?)
}

/// POST /api/matching/:kind/suggest-batch
async fn suggest_batch(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Json(body): Json<SuggestBody>,
) -> ApiResult<Vec<Suggestion>> {
    let kind = parse_kind(&kind)?;
    let min = body.min_similarity.unwrap_or(state.config.search_min_similarity);
    let store = state.store()?;
    ok(CandidateMatcher::new(&*store, state.config.candidate_fetch_factor)
        .suggest_batch(kind, &body.names, min)?)
}

/// POST /api/matching/:kind/create
async fn create_mapping(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Json(body): Json<NewMapping>,
) -> ApiResult<ExternalEntityMapping> {
    let kind = parse_kind(&kind)?;
    let store = state.store()?;
    ok(MappingManager::new(&*store, state.config.source_tag.as_str()).create(kind, body, None)?)
}

/// POST /api/matching/:kind/:mapping_id/confirm
async fn confirm_mapping(
    State(state): State<AppState>,
    Path((kind, mapping_id)): Path<(String, String)>,
    Json(body): Json<ConfirmBody>,
) -> ApiResult<ConfirmOutcome> {
    let kind = parse_kind(&kind)?;
    let store = state.store()?;
    ok(MappingManager::new(&*store, state.config.source_tag.as_str()).confirm(
        kind,
        &mapping_id,
        &body.internal_id,
        body.reviewed_by.as_deref(),
    )?)
}

/// POST /api/matching/:kind/:mapping_id/reject
async fn reject_mapping(
    State(state): State<AppState>,
    Path((kind, mapping_id)): Path<(String, String)>,
    body: Option<Json<RejectBody>>,
) -> ApiResult<ExternalEntityMapping> {
    let kind = parse_kind(&kind)?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let store = state.store()?;
    ok(MappingManager::new(&*store, state.config.source_tag.as_str()).reject(
        kind,
        &mapping_id,
        body.reviewed_by.as_deref(),
    )?)
}

/// GET /api/matching/:kind/:mapping_id/events
async fn mapping_events(
    State(state): State<AppState>,
    Path((kind, mapping_id)): Path<(String, String)>,
) -> ApiResult<Vec<Event>> {
    let kind = parse_kind(&kind)?;
    let store = state.store()?;
    ok(MappingManager::new(&*store, state.config.source_tag.as_str()).history(kind, &mapping_id)?)
}

/// POST /api/matching/:kind/auto-match
async fn auto_match(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    body: Option<Json<AutoMatchBody>>,
) -> ApiResult<AutoConfirmReport> {
    let kind = parse_kind(&kind)?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let floor = body
        .min_confidence
        .unwrap_or(state.config.auto_confirm_min_confidence);
    let store = state.store()?;
    ok(MappingManager::new(&*store, state.config.source_tag.as_str())
        .auto_confirm(kind, floor, body.dry_run)?)
}

/// GET /api/matching/unmatched?team=&limit=&group_by=
async fn unmatched(
    State(state): State<AppState>,
    Query(q): Query<UnmatchedQuery>,
) -> ApiResult<UnmatchedReport> {
    let store = state.store()?;
    ok(CandidateMatcher::new(&*store, state.config.candidate_fetch_factor)
        .unmatched_names(q.team.as_deref(), q.limit, q.group_by)?)
}

/// GET /api/matching/unmatched-summary
async fn unmatched_summary(State(state): State<AppState>) -> ApiResult<UnmatchedSummary> {
    let store = state.store()?;
    ok(CandidateMatcher::new(&*store, state.config.candidate_fetch_factor).unmatched_summary()?)
}

/// GET /api/matching/team-codes
async fn team_codes(State(state): State<AppState>) -> ApiResult<TeamCodeReport> {
    let store = state.store()?;
    ok(MappingManager::new(&*store, state.config.source_tag.as_str()).team_codes()?)
}

/// GET /api/matching/team-codes/clubs/:club_id
async fn club_team_codes(
    State(state): State<AppState>,
    Path(club_id): Path<String>,
) -> ApiResult<Vec<String>> {
    let store = state.store()?;
    ok(MappingManager::new(&*store, state.config.source_tag.as_str()).club_team_codes(&club_id)?)
}

/// POST /api/matching/team-codes/clubs/:club_id
async fn link_team_code(
    State(state): State<AppState>,
    Path(club_id): Path<String>,
    Json(body): Json<LinkTeamCodeBody>,
) -> ApiResult<ExternalEntityMapping> {
    let store = state.store()?;
    ok(MappingManager::new(&*store, state.config.source_tag.as_str()).link_team_code(
        &club_id,
        &body.team_code,
        body.reviewed_by.as_deref(),
    )?)
}

/// GET /api/matching/team-codes/clubs/:club_id/unmatched?limit=
async fn club_unmatched(
    State(state): State<AppState>,
    Path(club_id): Path<String>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<ClubUnmatched> {
    let store = state.store()?;
    ok(CandidateMatcher::new(&*store, state.config.candidate_fetch_factor)
        .club_unmatched(&club_id, q.limit)?)
}

fn router(state: AppState) -> Router {
    let matching = Router::new()
        .route("/unmatched", get(unmatched))
        .route("/unmatched-summary", get(unmatched_summary))
        .route("/team-codes", get(team_codes))
        .route(
            "/team-codes/clubs/:club_id",
            get(club_team_codes).post(link_team_code),
        )
        .route("/team-codes/clubs/:club_id/unmatched", get(club_unmatched))
        .route("/:kind/stats", get(get_stats))
        .route("/:kind/pending", get(get_pending))
        .route("/:kind/search", get(search))
        .route("/:kind/suggest-batch", post(suggest_batch))
        .route("/:kind/create", post(create_mapping))
        .route("/:kind/auto-match", post(auto_match))
        .route("/:kind/:mapping_id/confirm", post(confirm_mapping))
        .route("/:kind/:mapping_id/reject", post(reject_mapping))
        .route("/:kind/:mapping_id/events", get(mapping_events));

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .nest("/matching", matching)
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    )
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("swim_reconcile=info,tower_http=info")),
        )
        .init();

    let config = ReconcileConfig::load(None).context("failed to load configuration")?;
    let store = SqliteStore::open(&config.database_path)
        .with_context(|| format!("failed to open store {}", config.database_path.display()))?;
    info!(db = %config.database_path.display(), "store opened");

    let addr = config.server_addr.clone();
    let state = AppState {
        store: Arc::new(Mutex::new(store)),
        config: Arc::new(config),
    };

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "server listening");

    axum::serve(listener, router(state))
        .await
        .context("server stopped")?;
    Ok(())
}
