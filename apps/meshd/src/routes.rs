use std::path::PathBuf;
use std::sync::Arc;

use agentmesh::dispatcher::DispatchOutcome;
use agentmesh::queue::DEAD_LETTER_QUEUE;
use agentmesh::task::reasons;
use agentmesh::{
    AgentRegistration, Dispatcher, MeshError, Monitor, QueueFabric, RepairAgent, RoutingTable,
    StatusBoard, Task,
};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::default_routing_table;
use crate::metrics::MeshMetrics;
use crate::task_log::TaskLog;

#[derive(Clone)]
pub struct AppState {
    pub fabric: Arc<QueueFabric>,
    pub board: Arc<StatusBoard>,
    pub dispatcher: Arc<Dispatcher>,
    pub monitor: Arc<Monitor>,
    pub repair: Arc<RepairAgent>,
    pub metrics: Arc<MeshMetrics>,
    pub task_log: Option<TaskLog>,
    pub rules_path: Option<PathBuf>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }
}

impl From<MeshError> for ApiError {
    fn from(err: MeshError) -> Self {
        let (status, code) = match &err {
            MeshError::NoRoute { .. } => (StatusCode::NOT_FOUND, "no_route"),
            MeshError::QueueNotFound(_) => (StatusCode::NOT_FOUND, "queue_not_found"),
            MeshError::UnregisteredTarget(_) => (StatusCode::NOT_FOUND, "unregistered_target"),
            MeshError::TargetUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "target_unavailable")
            }
            MeshError::AmbiguousRules(_) => (StatusCode::BAD_REQUEST, "ambiguous_rules"),
            MeshError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
            MeshError::InvalidOperation(_) => (StatusCode::CONFLICT, "invalid_operation"),
            MeshError::ActionNotAllowed(_) => (StatusCode::FORBIDDEN, "action_not_allowed"),
            MeshError::Serialization(_) => (StatusCode::BAD_REQUEST, "invalid_payload"),
            MeshError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        Self::new(status, code, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(code = self.code, "request failed: {}", self.message);
        }
        (
            self.status,
            Json(json!({ "error": self.code, "message": self.message })),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/route", post(route_task))
        .route("/tasks", post(submit_task))
        .route("/tasks/:id", get(task_status))
        .route("/agents", get(list_agents))
        .route("/agents/register", post(register_agent))
        .route("/agents/:id/heartbeat", post(agent_heartbeat))
        .route("/rules", get(list_rules))
        .route("/rules/reload", post(reload_rules))
        .route("/incidents", get(list_incidents))
        .route("/incidents/:id/resolve", post(resolve_incident))
        .route("/diagnostics", get(diagnostics))
        .route("/dead-letters", get(list_dead_letters))
        .route("/dead-letters/drain", post(drain_dead_letters))
        .route("/repairs/pending", get(pending_repairs))
        .route("/repairs/:action_id/approval", post(decide_repair))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let agents = state.dispatcher.registry().report();
    (StatusCode::OK, Json(json!({ "status": "ok", "agents": agents })))
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    let mut queues: Vec<String> = state
        .dispatcher
        .registry()
        .list()
        .into_iter()
        .map(|record| record.registration.queue)
        .collect();
    queues.push(state.dispatcher.inbox().to_string());
    queues.push(DEAD_LETTER_QUEUE.to_string());
    for queue in queues {
        if let Ok(depth) = state.fabric.depth(&queue) {
            state.metrics.record_depth(&queue, depth.ready, depth.in_flight);
        }
    }
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => {
            error!(?err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to encode metrics",
            )
                .into_response()
        }
    }
}

/// Routes inline and reports where the task went. Used by callers that need
/// the decision inside their own request.
async fn route_task(State(state): State<AppState>, Json(task): Json<Task>) -> ApiResult<Response> {
    let task = task.admitted();
    state.board.track(&task)?;
    let report = state.dispatcher.dispatch(task).await?;
    let response = match &report.outcome {
        DispatchOutcome::Queued { target, .. } | DispatchOutcome::Forwarded { target, .. } => (
            StatusCode::OK,
            Json(json!({
                "task_id": report.task_id,
                "target": target,
                "status": "dispatched",
                "outcome": report.outcome,
            })),
        )
            .into_response(),
        DispatchOutcome::DeadLettered { reason } if reason == reasons::NO_MATCHING_RULE => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no_route", "task_id": report.task_id })),
        )
            .into_response(),
        DispatchOutcome::DeadLettered { reason } => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": reason, "task_id": report.task_id, "status": "dead_lettered" })),
        )
            .into_response(),
    };
    Ok(response)
}

/// Queues a task for the dispatcher loop.
async fn submit_task(State(state): State<AppState>, Json(task): Json<Task>) -> ApiResult<Response> {
    let task = task.admitted();
    state.board.track(&task)?;
    let task_id = state.dispatcher.submit(task)?;
    let body = json!({ "task_id": task_id, "status": "pending" });
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}

async fn task_status(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Response> {
    if let Some(record) = state.board.get(&id) {
        return Ok(Json(record).into_response());
    }
    if let Some(log) = &state.task_log {
        match log.fetch(id).await {
            Ok(Some(record)) => return Ok(Json(record).into_response()),
            Ok(None) => {}
            Err(err) => warn!(task_id = %id, "task log lookup failed: {err}"),
        }
    }
    Err(ApiError::not_found("task_not_found", format!("task '{id}' is unknown")))
}

async fn list_agents(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.dispatcher.registry();
    Json(json!({ "agents": registry.list(), "report": registry.report() }))
}

async fn register_agent(
    State(state): State<AppState>,
    Json(registration): Json<AgentRegistration>,
) -> ApiResult<Response> {
    let agent_id = registration.agent_id.clone();
    state.dispatcher.register_agent(registration)?;
    let record = state
        .dispatcher
        .registry()
        .get(&agent_id)
        .ok_or_else(|| ApiError::not_found("unregistered_target", agent_id.clone()))?;
    info!(agent = %agent_id, "agent registered over http");
    Ok((StatusCode::CREATED, Json(record)).into_response())
}

async fn agent_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let health = state.dispatcher.registry().heartbeat(&id)?;
    Ok(Json(json!({ "agent_id": id, "health": health })).into_response())
}

async fn list_rules(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "rules": state.dispatcher.table().rules() }))
}

/// A JSON body replaces the table; an empty body re-reads the rule file.
async fn reload_rules(State(state): State<AppState>, body: Bytes) -> ApiResult<Response> {
    let table = if body.iter().all(u8::is_ascii_whitespace) {
        match &state.rules_path {
            Some(path) => RoutingTable::load(path)?,
            None => default_routing_table()?,
        }
    } else {
        let raw = std::str::from_utf8(&body).map_err(|_| {
            ApiError::new(StatusCode::BAD_REQUEST, "invalid_payload", "body is not UTF-8")
        })?;
        RoutingTable::from_json(raw)?
    };
    let rules = state.dispatcher.reload(table);
    Ok(Json(json!({ "status": "reloaded", "rules": rules })).into_response())
}

async fn list_incidents(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "open": state.monitor.open_incidents(),
        "repairs": state.repair.history(50),
    }))
}

async fn resolve_incident(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let incident = state.monitor.resolve(id).ok_or_else(|| {
        ApiError::not_found("incident_not_found", format!("incident '{id}' is not open"))
    })?;
    Ok(Json(json!({ "status": "resolved", "incident": incident })).into_response())
}

#[derive(Debug, Deserialize)]
struct DiagnosticsQuery {
    limit: Option<usize>,
}

async fn diagnostics(
    State(state): State<AppState>,
    Query(query): Query<DiagnosticsQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(100).min(1000);
    Json(json!({ "events": state.dispatcher.diagnostics(limit) }))
}

async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DiagnosticsQuery>,
) -> ApiResult<Response> {
    let limit = query.limit.unwrap_or(100).min(1000);
    let dead_letter_queue = state.fabric.dead_letter_queue().to_string();
    let tasks = state.fabric.peek(&dead_letter_queue, limit)?;
    let depth = state.fabric.depth(&dead_letter_queue)?;
    Ok(Json(json!({ "total": depth.ready, "tasks": tasks })).into_response())
}

/// Removes dead letters an operator has dealt with, oldest first.
async fn drain_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DiagnosticsQuery>,
) -> ApiResult<Response> {
    let limit = query.limit.unwrap_or(100).min(1000);
    let drained = state.fabric.drain_dead_letters(limit)?;
    info!(drained = drained.len(), "dead letters drained by operator");
    let ids: Vec<Uuid> = drained.iter().map(|task| task.id).collect();
    Ok(Json(json!({ "drained": ids })).into_response())
}

async fn pending_repairs(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "pending": state.repair.approvals().pending() }))
}

#[derive(Debug, Deserialize)]
struct ApprovalBody {
    approved: bool,
}

async fn decide_repair(
    State(state): State<AppState>,
    Path(action_id): Path<Uuid>,
    Json(body): Json<ApprovalBody>,
) -> ApiResult<Response> {
    state
        .repair
        .approvals()
        .decide(action_id, body.approved)
        .map_err(|err| ApiError::not_found("approval_not_found", err.to_string()))?;
    Ok(Json(json!({ "action_id": action_id, "approved": body.approved })).into_response())
}
