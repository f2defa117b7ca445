//! HTTP server implementation using Axum.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ResourceSpec;
use crate::error::RunboxError;
use crate::executor::{ExecEvent, ExecOptions, ExecOutput};
use crate::files::FileMap;
use crate::lifecycle::{RuntimeView, StatsView};
use crate::service::Service;
use crate::state::AppState;

const DEFAULT_LOG_LIMIT: usize = 200;
const MAX_LOG_LIMIT: usize = 1000;

// Request/Response types
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRuntimeRequest {
    tenant_id: String,
    #[serde(default)]
    files: FileMap,
    #[serde(default)]
    resources: ResourceSpec,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ExecMode {
    #[default]
    Blocking,
    Streaming,
}

#[derive(Deserialize)]
struct ExecRequest {
    command: String,
    #[serde(default)]
    mode: ExecMode,
    #[serde(flatten)]
    options: ExecOptions,
}

#[derive(Deserialize)]
struct UpdateFilesRequest {
    files: FileMap,
}

#[derive(Serialize)]
struct UpdateFilesResponse {
    written: usize,
}

#[derive(Deserialize)]
struct ReadFilesRequest {
    paths: Vec<String>,
}

#[derive(Serialize)]
struct ReadFilesResponse {
    files: FileMap,
}

#[derive(Deserialize)]
struct LogsQuery {
    #[serde(default)]
    cursor: u64,
    limit: Option<usize>,
}

/// Error body: `{error, message, rolledBack}`.
#[derive(Debug)]
pub enum ApiError {
    Runbox(RunboxError),
    BadRequest(String),
}

impl From<RunboxError> for ApiError {
    fn from(err: RunboxError) -> Self {
        Self::Runbox(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

fn status_for(err: &RunboxError) -> StatusCode {
    match err {
        RunboxError::RuntimeNotFound(_) => StatusCode::NOT_FOUND,
        RunboxError::RuntimeNotRunning { .. } => StatusCode::CONFLICT,
        RunboxError::InvalidPath { .. } | RunboxError::InvalidConfig(_) => {
            StatusCode::BAD_REQUEST
        }
        RunboxError::PortPoolExhausted { .. } | RunboxError::DriverUnavailable { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        RunboxError::CommandTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        RunboxError::CommandFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        RunboxError::RuntimeCreateFailed { .. }
        | RunboxError::Driver { .. }
        | RunboxError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Runbox(err) => {
                let status = status_for(&err);
                if status.is_server_error() {
                    warn!(code = err.code(), error = %err, "request failed");
                }
                (
                    status,
                    json!({
                        "error": err.code(),
                        "message": err.to_string(),
                        "rolledBack": err.rolled_back(),
                    }),
                )
            }
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "bad_request", "message": message, "rolledBack": false }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn sse_event<T: Serialize>(data: &T) -> Event {
    Event::default()
        .json_data(data)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}

/// Build the router. Background tasks are not started here.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/runtimes", post(create_runtime).get(list_runtimes))
        .route("/runtimes/:tenant", get(get_runtime).delete(remove_runtime))
        .route("/runtimes/:tenant/exec", post(exec_in_runtime))
        .route("/runtimes/:tenant/stats", get(runtime_stats))
        .route("/runtimes/:tenant/events", get(runtime_events))
        .route("/runtimes/:tenant/files", axum::routing::put(update_files))
        .route("/runtimes/:tenant/files/read", post(read_files))
        .route("/runtimes/:tenant/logs", get(runtime_logs))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP server on the given port until Ctrl-C or SIGTERM, then stop
/// background tasks and remove every runtime.
pub async fn run_server(service: Arc<Service>, port: u16) -> std::io::Result<()> {
    service.start();
    let state = service.state();
    let stop = state.shutdown.clone();
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown requested");
            stop.cancel();
        })
        .await?;

    service.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let runtimes = state.lifecycle.list_all().await.len();
    let (start, end) = state.ports.range();
    Json(json!({
        "status": "ok",
        "driver": state.lifecycle.driver_name(),
        "ports": {
            "start": start,
            "end": end,
            "capacity": state.config.port_capacity(),
            "allocated": state.ports.allocated(),
            "available": state.ports.available(),
        },
        "runtimes": runtimes,
    }))
}

async fn create_runtime(
    State(state): State<AppState>,
    req: Result<Json<CreateRuntimeRequest>, JsonRejection>,
) -> ApiResult<Json<RuntimeView>> {
    let Json(req) = req?;
    if req.tenant_id.trim().is_empty() {
        return Err(ApiError::BadRequest("tenantId must not be empty".into()));
    }
    info!(tenant = %req.tenant_id, files = req.files.len(), "POST /runtimes");
    let view = state
        .lifecycle
        .create_or_get_runtime(&req.tenant_id, req.files, req.resources)
        .await?;
    Ok(Json(view))
}

async fn list_runtimes(State(state): State<AppState>) -> Json<Vec<RuntimeView>> {
    Json(state.lifecycle.list_all().await)
}

async fn get_runtime(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> ApiResult<Json<RuntimeView>> {
    let view = state
        .lifecycle
        .get(&tenant)
        .await
        .ok_or_else(|| RunboxError::RuntimeNotFound(tenant.clone()))?;
    state.lifecycle.touch(&tenant).await;
    Ok(Json(view))
}

async fn remove_runtime(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.lifecycle.remove_runtime(&tenant).await?;
    Ok(Json(json!({ "status": "removed" })))
}

async fn exec_in_runtime(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    req: Result<Json<ExecRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(req) = req?;
    if req.command.trim().is_empty() {
        return Err(ApiError::BadRequest("command must not be empty".into()));
    }
    info!(tenant = %tenant, command = %req.command, mode = ?req.mode, "POST /runtimes/:tenant/exec");

    match req.mode {
        ExecMode::Blocking => {
            let output: ExecOutput = state
                .executor
                .exec(&tenant, &req.command, req.options)
                .await?;
            Ok(Json(output).into_response())
        }
        ExecMode::Streaming => {
            let mut exec = state
                .executor
                .exec_stream(&tenant, &req.command, req.options)
                .await?;
            // Dropping `exec` when the client goes away kills the command.
            let stream = async_stream::stream! {
                while let Some(event) = exec.next().await {
                    let last = matches!(event, ExecEvent::Exit(_));
                    yield Ok::<_, Infallible>(sse_event(&event));
                    if last {
                        break;
                    }
                }
            };
            Ok(Sse::new(stream)
                .keep_alive(KeepAlive::new().interval(state.config.heartbeat_interval))
                .into_response())
        }
    }
}

async fn runtime_stats(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> ApiResult<Json<StatsView>> {
    Ok(Json(state.lifecycle.get_stats(&tenant).await?))
}

async fn runtime_events(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> impl IntoResponse {
    info!(tenant = %tenant, "GET /runtimes/:tenant/events");
    let mut subscription = state.broadcaster.subscribe(&tenant);
    let shutdown = state.shutdown.clone();
    let stream = async_stream::stream! {
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => None,
                event = subscription.next() => event,
            };
            let Some(event) = next else { break };
            yield Ok::<_, Infallible>(sse_event(&event));
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::new().interval(state.config.heartbeat_interval))
}

async fn update_files(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    req: Result<Json<UpdateFilesRequest>, JsonRejection>,
) -> ApiResult<Json<UpdateFilesResponse>> {
    let Json(req) = req?;
    let written = state.lifecycle.update_files(&tenant, req.files).await?;
    Ok(Json(UpdateFilesResponse { written }))
}

async fn read_files(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    req: Result<Json<ReadFilesRequest>, JsonRejection>,
) -> ApiResult<Json<ReadFilesResponse>> {
    let Json(req) = req?;
    let files = state.lifecycle.read_files(&tenant, &req.paths).await?;
    Ok(Json(ReadFilesResponse { files }))
}

async fn runtime_logs(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Json<crate::broadcast::LogTail> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).min(MAX_LOG_LIMIT);
    Json(state.broadcaster.tail(&tenant, query.cursor, limit))
}
