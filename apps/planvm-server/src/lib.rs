//! HTTP API surface for the planvm engine.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use uuid::Uuid;

use planvm_config::{Config, ModelEndpoint, StoreBackend};
use planvm_core::error::ErrorKind;
use planvm_core::store::{CommitStore, StoreError};
use planvm_core::types::ResponseFormat;
use planvm_engine::{Engine, EngineConfig, EngineError, WorkerPool};
use planvm_llm::{ClientTextGenerator, HttpLlmClient, HttpLlmClientConfig, LlmClient, LlmPlanner};
use planvm_stores::{FsStore, PostgresStore};
use planvm_tools::{base_registry, RetrievalConfig};

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub pool: Arc<WorkerPool>,
}

/// API error envelope.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Conflict(_) | StoreError::Locked(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Store(store) => store.into(),
            EngineError::TaskNotFound(task_id) => {
                Self::new(StatusCode::NOT_FOUND, format!("task {} not found", task_id))
            }
            EngineError::CommitNotFound(hash) => {
                Self::new(StatusCode::NOT_FOUND, format!("commit {} not found", hash))
            }
            EngineError::Vm(vm) => {
                let status = match vm.kind {
                    ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                Self::new(status, vm.to_string())
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub goal: String,
    #[serde(default)]
    pub response_format: Option<ResponseFormat>,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateTaskResponse {
    pub task_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
pub struct SetBranchRequest {
    pub branch: String,
}

#[derive(Debug, Deserialize)]
pub struct DynamicUpdateRequest {
    pub commit_hash: String,
    pub suggestion: String,
}

#[derive(Debug, Deserialize)]
pub struct OptimizeStepRequest {
    pub commit_hash: String,
    pub seq_no: i64,
    pub suggestion: String,
}

async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<Json<CreateTaskResponse>, ApiError> {
    let task = state
        .engine
        .create_task(
            request.goal,
            request.namespace,
            request.response_format.unwrap_or_default(),
        )
        .await?;
    state.pool.submit(task.task_id)?;
    Ok(Json(CreateTaskResponse {
        task_id: task.task_id,
    }))
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let tasks = state
        .engine
        .store()
        .list_tasks(query.limit, query.offset)
        .await?;
    Ok(Json(json!({ "tasks": tasks })))
}

async fn list_branches(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let branches = state.engine.store().list_branches(task_id).await?;
    let active = state.engine.store().active_branch(task_id).await?;
    Ok(Json(json!({ "branches": branches, "active_branch": active })))
}

async fn branch_details(
    State(state): State<AppState>,
    Path((task_id, branch)): Path<(Uuid, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let commits = state.engine.store().list_commits(task_id, &branch).await?;
    Ok(Json(json!({ "commits": commits })))
}

async fn commit_detail(
    State(state): State<AppState>,
    Path((task_id, hash)): Path<(Uuid, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let commit = state
        .engine
        .store()
        .get_commit(task_id, &hash)
        .await?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("commit {} not found", hash)))?;
    Ok(Json(serde_json::to_value(commit).unwrap_or_default()))
}

async fn commit_diff(
    State(state): State<AppState>,
    Path((task_id, hash)): Path<(Uuid, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let commit = state
        .engine
        .store()
        .get_commit(task_id, &hash)
        .await?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("commit {} not found", hash)))?;
    Ok(Json(json!({ "diff": commit.details.diff })))
}

async fn set_branch(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Json(request): Json<SetBranchRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .engine
        .store()
        .set_active_branch(task_id, &request.branch)
        .await?;
    Ok(Json(json!({ "active_branch": request.branch })))
}

async fn dynamic_update(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Json(request): Json<DynamicUpdateRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = state
        .engine
        .dynamic_update(
            task_id,
            &request.commit_hash,
            &request.suggestion,
            CancellationToken::new(),
        )
        .await?;
    Ok(Json(json!({
        "status": outcome.status,
        "branch": outcome.branch,
        "head": outcome.head,
        "final_answer": outcome.final_answer,
        "error": outcome.error,
    })))
}

async fn optimize_step(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Json(request): Json<OptimizeStepRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = state
        .engine
        .optimize_step(
            task_id,
            &request.commit_hash,
            request.seq_no,
            &request.suggestion,
            CancellationToken::new(),
        )
        .await?;
    Ok(Json(json!({
        "status": outcome.status,
        "branch": outcome.branch,
        "head": outcome.head,
        "final_answer": outcome.final_answer,
        "error": outcome.error,
    })))
}

async fn delete_branch(
    State(state): State<AppState>,
    Path((task_id, branch)): Path<(Uuid, String)>,
) -> Result<StatusCode, ApiError> {
    state.engine.store().delete_branch(task_id, &branch).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Assemble the API router.
pub fn router(state: AppState, cors_origins: &[String]) -> Router {
    let cors = if cors_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<axum::http::HeaderValue> = cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    };

    Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/{id}/branches", get(list_branches))
        .route("/tasks/{id}/branches/{branch}/details", get(branch_details))
        .route("/tasks/{id}/commits/{hash}/detail", get(commit_detail))
        .route("/tasks/{id}/commits/{hash}/diff", get(commit_diff))
        .route("/tasks/{id}/set_branch", post(set_branch))
        .route("/tasks/{id}/dynamic_update", post(dynamic_update))
        .route("/tasks/{id}/optimize_step", post(optimize_step))
        .route("/tasks/{id}/branches/{branch}", delete(delete_branch))
        .layer(cors)
        .with_state(state)
}

fn llm_client(
    endpoint: &ModelEndpoint,
    timeout_secs: u64,
) -> anyhow::Result<Arc<dyn LlmClient>> {
    Ok(Arc::new(HttpLlmClient::new(HttpLlmClientConfig {
        endpoint: endpoint.chat_url(),
        api_key: endpoint.api_key.clone(),
        model: endpoint.model.clone(),
        temperature: endpoint.temperature,
        timeout_secs,
    })?))
}

/// Build the engine and worker pool from configuration.
pub async fn bootstrap(config: &Config, workers: usize) -> anyhow::Result<AppState> {
    let store: Arc<dyn CommitStore> = match &config.store {
        StoreBackend::Filesystem(root) => Arc::new(FsStore::new(root.clone())?),
        StoreBackend::Postgres(uri) => Arc::new(PostgresStore::connect(uri).await?),
    };

    let standard = llm_client(&config.standard, config.tool_call_timeout_secs)?;
    let reasoning = llm_client(&config.reasoning, config.tool_call_timeout_secs)?;

    let mut retrieval = RetrievalConfig::new(config.autoflow_base_url.clone());
    retrieval.api_key = config.autoflow_api_key.clone();
    retrieval.kb_id = config.kb_id.clone();

    let tools = base_registry(Arc::new(ClientTextGenerator::new(standard)), retrieval);

    let engine = Arc::new(Engine::new(
        store,
        Arc::new(tools),
        Arc::new(LlmPlanner::new(reasoning.clone())),
        Arc::new(ClientTextGenerator::new(reasoning)),
        EngineConfig {
            max_recovery_attempts: config.max_recovery_attempts,
            max_validation_retries: config.max_validation_retries,
            tool_call_timeout: std::time::Duration::from_secs(config.tool_call_timeout_secs),
        },
    ));
    let pool = Arc::new(WorkerPool::spawn(engine.clone(), workers));
    Ok(AppState { engine, pool })
}
