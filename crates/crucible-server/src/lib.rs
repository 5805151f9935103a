use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crucible_engine::{
    create_issue, issue_context, run_preflight, verify_data_integrity, verify_run_completeness,
    CreateSnapshotRequest, EngineContext,
};
use crucible_types::{
    ChatSessionMode, Constraint, CrucibleError, IssueSeverity, IssueType, RemediationRequest,
    ReplayOptions, ResolutionLevel, RunConfig, RunMode, SnapshotInvariant, SnapshotTestOptions,
};

/// Shared state for the HTTP adapter: one engine context per process.
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<EngineContext>,
}

struct ApiError(CrucibleError);

impl From<CrucibleError> for ApiError {
    fn from(err: CrucibleError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CrucibleError::NotFound { .. } => StatusCode::NOT_FOUND,
            CrucibleError::Validation(_) => StatusCode::BAD_REQUEST,
            CrucibleError::PreconditionFailed(_) => StatusCode::CONFLICT,
            CrucibleError::AgentFailure { .. } => StatusCode::BAD_GATEWAY,
            CrucibleError::Cancelled => StatusCode::CONFLICT,
            CrucibleError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({"detail": self.0.to_string()}))).into_response()
    }
}

type ApiResult = std::result::Result<Json<Value>, ApiError>;

fn ok<T: serde::Serialize>(value: T) -> ApiResult {
    Ok(Json(serde_json::to_value(value).unwrap_or(Value::Null)))
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/projects", post(create_project).get(list_projects))
        .route("/projects/{id}", get(get_project))
        .route(
            "/projects/{id}/problem-spec",
            put(put_problem_spec).get(get_problem_spec),
        )
        .route(
            "/projects/{id}/problem-spec/provenance",
            get(get_spec_provenance),
        )
        .route(
            "/projects/{id}/world-model",
            put(put_world_model).get(get_world_model),
        )
        .route("/projects/{id}/preflight", post(preflight))
        .route("/projects/{id}/runs", post(create_run).get(list_runs))
        .route("/projects/{id}/chat-sessions", post(create_chat_session))
        .route("/projects/{id}/issues", post(post_issue))
        .route("/projects/{id}/snapshots", post(post_snapshot))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/verification", get(run_verification))
        .route("/runs/{id}/phases/design", post(run_design))
        .route("/runs/{id}/phases/scenarios", post(run_scenarios))
        .route("/runs/{id}/phases/evaluate", post(run_evaluate))
        .route("/runs/{id}/phases/rank", post(run_rank))
        .route("/runs/{id}/phases/full", post(run_full))
        .route("/issues/{id}/context", get(get_issue_context))
        .route("/issues/{id}/resolve", post(resolve_issue))
        .route("/snapshots", get(list_snapshots))
        .route("/snapshots/{id}/replay", post(replay_snapshot))
        .route("/snapshots/tests", post(snapshot_tests))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let router = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "crucible api listening");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({"status": "healthy", "service": "crucible"}))
}

#[derive(Deserialize)]
struct CreateProjectBody {
    title: String,
    #[serde(default)]
    description: Option<String>,
}

async fn create_project(
    State(state): State<AppState>,
    Json(body): Json<CreateProjectBody>,
) -> ApiResult {
    ok(state
        .ctx
        .store
        .create_project(body.title, body.description)
        .await?)
}

async fn list_projects(State(state): State<AppState>) -> ApiResult {
    ok(state.ctx.store.list_projects().await)
}

async fn get_project(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    ok(state.ctx.store.require_project(&id).await?)
}

#[derive(Deserialize)]
struct ProblemSpecBody {
    #[serde(default)]
    constraints: Vec<Constraint>,
    #[serde(default)]
    goals: Vec<String>,
    #[serde(default)]
    resolution: ResolutionLevel,
    #[serde(default)]
    mode: RunMode,
}

async fn put_problem_spec(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ProblemSpecBody>,
) -> ApiResult {
    ok(state
        .ctx
        .store
        .upsert_problem_spec(
            &id,
            crucible_store::ProblemSpecUpdate {
                constraints: body.constraints,
                goals: body.goals,
                resolution: body.resolution,
                mode: body.mode,
                provenance_log: None,
            },
        )
        .await?)
}

async fn get_problem_spec(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    match state.ctx.store.get_problem_spec(&id).await {
        Some(spec) => ok(spec),
        None => Err(CrucibleError::not_found("ProblemSpec", id).into()),
    }
}

async fn get_spec_provenance(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    match state.ctx.store.get_problem_spec(&id).await {
        Some(spec) => ok(json!({
            "summary": crucible_types::summarize_provenance_log(&spec.provenance_log),
            "provenance_log": spec.provenance_log,
        })),
        None => Err(CrucibleError::not_found("ProblemSpec", id).into()),
    }
}

async fn put_world_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult {
    ok(state.ctx.store.upsert_world_model(&id, body).await?)
}

async fn get_world_model(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    match state.ctx.store.get_world_model(&id).await {
        Some(model) => ok(model),
        None => Err(CrucibleError::not_found("WorldModel", id).into()),
    }
}

#[derive(Deserialize)]
struct PreflightBody {
    #[serde(default)]
    mode: RunMode,
    #[serde(default)]
    parameters: RunConfig,
}

async fn preflight(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PreflightBody>,
) -> ApiResult {
    ok(run_preflight(&state.ctx.store, &id, body.mode, &body.parameters).await)
}

#[derive(Deserialize)]
struct CreateRunBody {
    #[serde(default)]
    mode: RunMode,
    #[serde(default)]
    config: RunConfig,
    #[serde(default)]
    chat_session_id: Option<String>,
}

async fn create_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CreateRunBody>,
) -> ApiResult {
    ok(state
        .ctx
        .store
        .create_run(&id, body.mode, body.config, body.chat_session_id)
        .await?)
}

#[derive(Deserialize)]
struct ListRunsQuery {
    #[serde(default)]
    chat_session_id: Option<String>,
}

async fn list_runs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ListRunsQuery>,
) -> ApiResult {
    ok(state
        .ctx
        .store
        .list_runs(Some(&id), query.chat_session_id.as_deref())
        .await)
}

#[derive(Deserialize)]
struct CreateChatSessionBody {
    #[serde(default)]
    title: Option<String>,
    #[serde(default = "default_chat_mode")]
    mode: ChatSessionMode,
}

fn default_chat_mode() -> ChatSessionMode {
    ChatSessionMode::Setup
}

async fn create_chat_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CreateChatSessionBody>,
) -> ApiResult {
    ok(state
        .ctx
        .store
        .create_chat_session(&id, body.title, body.mode)
        .await?)
}

async fn get_run(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    ok(state.ctx.store.require_run(&id).await?)
}

async fn run_verification(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let completeness = verify_run_completeness(&state.ctx.store, &id).await?;
    let integrity = verify_data_integrity(&state.ctx.store, &id).await?;
    ok(json!({"completeness": completeness, "integrity": integrity}))
}

#[derive(Deserialize)]
struct PhaseBody {
    #[serde(default)]
    num_candidates: Option<u32>,
    #[serde(default)]
    num_scenarios: Option<u32>,
}

async fn run_design(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PhaseBody>,
) -> ApiResult {
    let cancel = CancellationToken::new();
    ok(state
        .ctx
        .orchestrator()
        .execute_design_phase(&id, body.num_candidates.unwrap_or(5), &cancel)
        .await?)
}

async fn run_scenarios(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PhaseBody>,
) -> ApiResult {
    let cancel = CancellationToken::new();
    ok(state
        .ctx
        .orchestrator()
        .execute_scenario_phase(&id, body.num_scenarios.unwrap_or(8), &cancel)
        .await?)
}

async fn run_evaluate(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let cancel = CancellationToken::new();
    ok(state
        .ctx
        .orchestrator()
        .execute_evaluation_phase(&id, &cancel)
        .await?)
}

async fn run_rank(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let cancel = CancellationToken::new();
    ok(state
        .ctx
        .orchestrator()
        .execute_ranking_phase(&id, &cancel)
        .await?)
}

async fn run_full(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PhaseBody>,
) -> ApiResult {
    let cancel = CancellationToken::new();
    ok(state
        .ctx
        .orchestrator()
        .execute_full_pipeline(
            &id,
            body.num_candidates.unwrap_or(5),
            body.num_scenarios.unwrap_or(8),
            &cancel,
        )
        .await?)
}

#[derive(Deserialize)]
struct CreateIssueBody {
    #[serde(rename = "type")]
    issue_type: IssueType,
    severity: IssueSeverity,
    description: String,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    candidate_id: Option<String>,
}

async fn post_issue(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CreateIssueBody>,
) -> ApiResult {
    ok(create_issue(
        &state.ctx.store,
        &id,
        body.issue_type,
        body.severity,
        body.description,
        body.run_id,
        body.candidate_id,
    )
    .await?)
}

async fn get_issue_context(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    ok(issue_context(&state.ctx.store, &id).await?)
}

async fn resolve_issue(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RemediationRequest>,
) -> ApiResult {
    let cancel = CancellationToken::new();
    ok(state.ctx.remediation().resolve(&id, body, &cancel).await?)
}

#[derive(Deserialize)]
struct CreateSnapshotBody {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    invariants: Vec<SnapshotInvariant>,
    #[serde(default = "default_true")]
    include_chat_context: bool,
    #[serde(default = "default_max_chat_messages")]
    max_chat_messages: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_chat_messages() -> usize {
    10
}

async fn post_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CreateSnapshotBody>,
) -> ApiResult {
    ok(state
        .ctx
        .snapshots()
        .create_snapshot(CreateSnapshotRequest {
            project_id: id,
            run_id: body.run_id,
            name: body.name,
            description: body.description,
            tags: body.tags,
            invariants: body.invariants,
            include_chat_context: body.include_chat_context,
            max_chat_messages: body.max_chat_messages,
        })
        .await?)
}

async fn list_snapshots(State(state): State<AppState>) -> ApiResult {
    ok(state.ctx.store.list_snapshots().await)
}

async fn replay_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ReplayOptions>,
) -> ApiResult {
    let cancel = CancellationToken::new();
    ok(state
        .ctx
        .snapshots()
        .replay_snapshot(&id, body, &cancel)
        .await?)
}

#[derive(Deserialize)]
struct SnapshotTestsBody {
    #[serde(default)]
    snapshot_ids: Option<Vec<String>>,
    #[serde(default)]
    options: SnapshotTestOptions,
}

async fn snapshot_tests(
    State(state): State<AppState>,
    Json(body): Json<SnapshotTestsBody>,
) -> ApiResult {
    let cancel = CancellationToken::new();
    ok(state
        .ctx
        .snapshots()
        .run_snapshot_tests(body.snapshot_ids, body.options, &cancel)
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use crucible_agents::AgentRegistry;
    use crucible_engine::EngineConfig;
    use tower::ServiceExt;

    async fn test_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig {
            database_url: dir.path().display().to_string(),
            ..EngineConfig::default()
        };
        let ctx = EngineContext::init_with_registry(config, AgentRegistry::new())
            .await
            .expect("context");
        (dir, AppState { ctx: Arc::new(ctx) })
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn health_reports_the_service_name() {
        let (_dir, state) = test_state().await;
        let response = app_router(state)
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["service"], "crucible");
    }

    #[tokio::test]
    async fn missing_runs_map_to_not_found() {
        let (_dir, state) = test_state().await;
        let response = app_router(state)
            .oneshot(
                Request::builder()
                    .uri("/runs/does-not-exist")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert!(body["detail"]
            .as_str()
            .expect("detail")
            .contains("Run not found"));
    }

    #[tokio::test]
    async fn projects_round_trip_through_the_api() {
        let (_dir, state) = test_state().await;
        let router = app_router(state);

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/projects")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({"title": "Irrigation", "description": "demo"}).to_string(),
                    ))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let created = body_json(response).await;
        let project_id = created["id"].as_str().expect("id").to_string();

        let response = router
            .oneshot(
                Request::builder()
                    .uri(format!("/projects/{project_id}"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let fetched = body_json(response).await;
        assert_eq!(fetched["title"], "Irrigation");
    }

    #[tokio::test]
    async fn preflight_echoes_blockers_for_empty_projects() {
        let (_dir, state) = test_state().await;
        let router = app_router(state.clone());
        let project = state
            .ctx
            .store
            .create_project("empty", None)
            .await
            .expect("project");

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/projects/{}/preflight", project.id))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({"mode": "full_search", "parameters": {"num_candidates": 30}})
                            .to_string(),
                    ))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["ready"], false);
        assert!(body["blockers"]
            .as_array()
            .expect("blockers")
            .iter()
            .any(|b| b == "missing_problem_spec"));
        assert_eq!(body["normalized_config"]["num_candidates"], 30);
        assert_eq!(body["warnings"][0], "large_candidate_count");
    }
}
