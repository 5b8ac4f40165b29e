use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use code_sandbox::{
    AnalysisReport, ExecutionFilter, ExecutionId, ExecutionStatus, IsolationPolicy, Language,
    LanguageProfile, SandboxConfig, SandboxExecution, SandboxManager, SandboxStatistics,
    SecurityLevel, SubmitRequest,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::BTreeMap, net::SocketAddr, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid language: {0}")]
    InvalidLanguage(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Execution not found: {0}")]
    NotFound(String),
    #[error("Execution is not running: {0}")]
    NotRunning(String),
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] code_sandbox::Error),
    #[error("Server error: {0}")]
    ServerError(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::InvalidLanguage(_) | ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::NotRunning(_) => StatusCode::CONFLICT,
            ServerError::Sandbox(
                code_sandbox::Error::UnsupportedLanguage(_) | code_sandbox::Error::Configuration(_),
            ) => StatusCode::BAD_REQUEST,
            ServerError::Sandbox(_) | ServerError::ServerError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self);
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SubmitBody {
    pub language: String,
    pub code: String,
    /// Highest security level allowed to run
    pub security_level: Option<String>,
    /// Run-step timeout in seconds
    pub timeout: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AnalyzeBody {
    pub language: String,
    pub code: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ListQuery {
    pub language: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
}

impl ListQuery {
    fn into_filter(self) -> Result<ExecutionFilter, ServerError> {
        let mut filter = ExecutionFilter::default();
        if let Some(language) = self.language {
            filter.language = Some(parse_language(&language)?);
        }
        if let Some(status) = self.status {
            filter.status = Some(
                status
                    .parse::<ExecutionStatus>()
                    .map_err(|e| ServerError::BadRequest(e.to_string()))?,
            );
        }
        if let Some(limit) = self.limit {
            filter.limit = limit;
        }
        Ok(filter)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub isolation: IsolationPolicy,
    pub container_available: bool,
    /// Languages the local backend cannot run, with the programs it lacks
    #[serde(default)]
    pub missing_toolchains: BTreeMap<Language, Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KillResponse {
    pub id: String,
    pub killed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub purged: usize,
}

#[derive(Clone)]
pub struct AppState {
    manager: Arc<SandboxManager>,
}

/// Router over an existing manager
pub fn create_app(manager: Arc<SandboxManager>) -> Router {
    let state = AppState { manager };
    let cors = CorsLayer::permissive();

    Router::new()
        .route("/health", get(health_check))
        .route("/languages", get(languages))
        .route(
            "/executions",
            post(submit).get(list_executions).delete(purge_executions),
        )
        .route("/executions/:id", get(get_execution))
        .route("/executions/:id/kill", post(kill_execution))
        .route("/analyze", post(analyze))
        .route("/stats", get(statistics))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Build a manager from `config` and wrap it in a router
pub async fn create_app_from_config(config: SandboxConfig) -> Result<Router, ServerError> {
    let manager = SandboxManager::new(config).await?;
    Ok(create_app(Arc::new(manager)))
}

pub async fn run_server(app: Router, addr: SocketAddr) -> Result<(), ServerError> {
    info!("Starting code sandbox server on {}", addr);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::ServerError(e.to_string()))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| ServerError::ServerError(e.to_string()))?;

    Ok(())
}

fn parse_language(raw: &str) -> Result<Language, ServerError> {
    raw.parse()
        .map_err(|_| ServerError::InvalidLanguage(raw.to_string()))
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        isolation: state.manager.isolation(),
        container_available: state.manager.container_available(),
        missing_toolchains: state.manager.missing_toolchains().clone(),
    })
}

async fn languages(State(state): State<AppState>) -> Json<Vec<LanguageProfile>> {
    Json(state.manager.language_profiles())
}

async fn submit(
    State(state): State<AppState>,
    Json(payload): Json<SubmitBody>,
) -> Result<Json<SandboxExecution>, ServerError> {
    let language = parse_language(&payload.language)?;
    let mut request = SubmitRequest::new(payload.code, language);
    if let Some(level) = payload.security_level {
        request = request.with_security_level(
            level
                .parse::<SecurityLevel>()
                .map_err(|e| ServerError::BadRequest(e.to_string()))?,
        );
    }
    if let Some(secs) = payload.timeout {
        request = request.with_timeout(Duration::from_secs(secs));
    }

    let execution = state.manager.submit(request).await?;
    Ok(Json(execution))
}

async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<SandboxExecution>>, ServerError> {
    let filter = query.into_filter()?;
    Ok(Json(state.manager.list(&filter).await))
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SandboxExecution>, ServerError> {
    state
        .manager
        .get(&ExecutionId::from(id.as_str()))
        .await
        .map(Json)
        .ok_or(ServerError::NotFound(id))
}

async fn kill_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<KillResponse>, ServerError> {
    let execution_id = ExecutionId::from(id.as_str());
    if state.manager.kill(&execution_id).await {
        return Ok(Json(KillResponse { id, killed: true }));
    }
    match state.manager.get(&execution_id).await {
        Some(_) => Err(ServerError::NotRunning(id)),
        None => Err(ServerError::NotFound(id)),
    }
}

async fn purge_executions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<PurgeResponse>, ServerError> {
    let filter = query.into_filter()?;
    let purged = state.manager.purge(&filter).await;
    Ok(Json(PurgeResponse { purged }))
}

async fn analyze(
    State(state): State<AppState>,
    Json(payload): Json<AnalyzeBody>,
) -> Result<Json<AnalysisReport>, ServerError> {
    let language = parse_language(&payload.language)?;
    Ok(Json(state.manager.analyze(&payload.code, language)?))
}

async fn statistics(State(state): State<AppState>) -> Json<SandboxStatistics> {
    Json(state.manager.statistics().await)
}
