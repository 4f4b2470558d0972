//! REST endpoints for delegates and task callers.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::{ApiError, not_found};
use crate::broker::DelegateBroker;
use crate::delegates::{DelegateRegistration, DelegateScope, DelegateStatus};
use crate::tasks::{ConnectionResult, DelegateTask, TaskResponse, TaskTarget, WaitRegistry};

type ApiResult = Result<Response, ApiError>;

const DEFAULT_WAIT: Duration = Duration::from_secs(30);
const MAX_WAIT: Duration = Duration::from_secs(300);

/// Build the REST routes.
pub fn api_routes(broker: Arc<DelegateBroker>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/delegates", post(register_delegate))
        .route("/api/accounts/{account}/delegates", get(list_delegates))
        .route(
            "/api/accounts/{account}/delegates/{delegate}",
            get(get_delegate).delete(delete_delegate),
        )
        .route(
            "/api/accounts/{account}/delegates/{delegate}/heartbeat",
            post(heartbeat),
        )
        .route(
            "/api/accounts/{account}/delegates/{delegate}/scopes",
            put(update_scopes),
        )
        .route(
            "/api/accounts/{account}/delegates/{delegate}/status",
            put(set_status),
        )
        .route(
            "/api/accounts/{account}/delegates/{delegate}/cache",
            delete(clear_cache),
        )
        .route(
            "/api/accounts/{account}/delegates/{delegate}/events",
            get(poll_events),
        )
        .route(
            "/api/accounts/{account}/delegates/{delegate}/tasks",
            get(delegate_tasks),
        )
        .route("/api/tasks", post(queue_task))
        .route("/api/tasks/execute", post(execute_task))
        .route("/api/accounts/{account}/tasks/{task}", get(task_status))
        .route("/api/accounts/{account}/tasks/{task}/acquire", post(acquire_task))
        .route("/api/accounts/{account}/tasks/{task}/report", post(report_validation))
        .route("/api/accounts/{account}/tasks/{task}/proceed", post(proceed_anyway))
        .route("/api/accounts/{account}/tasks/{task}/start", post(start_task))
        .route("/api/accounts/{account}/tasks/{task}/result", post(submit_result))
        .route("/api/accounts/{account}/tasks/{task}/abort", post(abort_task))
        .with_state(broker)
}

// ── Request bodies ──────────────────────────────────────────────────────

/// A task as submitted by a caller. Broker-owned fields are filled in on queueing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub account_id: String,
    pub task_type: String,
    #[serde(default)]
    pub task_group: Option<String>,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub env_id: Option<String>,
    #[serde(default)]
    pub infrastructure_mapping_id: Option<String>,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub target: TaskTarget,
    /// Execution timeout; the task default applies when absent.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub wait_id: Option<String>,
}

impl TaskSubmission {
    pub fn into_task(self) -> DelegateTask {
        let mut task = DelegateTask::new(self.account_id, self.task_type)
            .with_parameters(self.parameters)
            .with_target(self.target);
        if let Some(group) = self.task_group {
            task.task_group = group;
        }
        task.app_id = self.app_id;
        task.env_id = self.env_id;
        task.infrastructure_mapping_id = self.infrastructure_mapping_id;
        task.wait_id = self.wait_id;
        if let Some(timeout) = self.timeout_ms {
            task.timeout = timeout;
        }
        task
    }
}

/// One connectivity probe outcome reported by a delegate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub criteria: String,
    pub validated: bool,
}

#[derive(Debug, Deserialize)]
struct DelegateRequest {
    delegate_id: String,
}

#[derive(Debug, Deserialize)]
struct ReportRequest {
    delegate_id: String,
    #[serde(default)]
    results: Vec<ProbeResult>,
}

#[derive(Debug, Deserialize)]
struct ResultRequest {
    delegate_id: String,
    response: TaskResponse,
}

#[derive(Debug, Deserialize)]
struct ScopesRequest {
    #[serde(default)]
    include_scopes: Vec<DelegateScope>,
    #[serde(default)]
    exclude_scopes: Vec<DelegateScope>,
}

#[derive(Debug, Deserialize)]
struct StatusRequest {
    status: DelegateStatus,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    sync_only: bool,
}

#[derive(Debug, Deserialize)]
struct WaitQuery {
    timeout_ms: Option<u64>,
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Delegates ───────────────────────────────────────────────────────────

async fn register_delegate(
    State(broker): State<Arc<DelegateBroker>>,
    Json(body): Json<DelegateRegistration>,
) -> ApiResult {
    let delegate = broker.register_delegate(body).await?;
    Ok((StatusCode::CREATED, Json(delegate)).into_response())
}

async fn list_delegates(
    State(broker): State<Arc<DelegateBroker>>,
    Path(account_id): Path<String>,
) -> ApiResult {
    Ok(Json(broker.list_delegates(&account_id).await?).into_response())
}

async fn get_delegate(
    State(broker): State<Arc<DelegateBroker>>,
    Path((account_id, delegate_id)): Path<(String, String)>,
) -> ApiResult {
    Ok(match broker.get_delegate(&account_id, &delegate_id).await? {
        Some(delegate) => Json(delegate).into_response(),
        None => not_found("Delegate not found"),
    })
}

async fn heartbeat(
    State(broker): State<Arc<DelegateBroker>>,
    Path((account_id, delegate_id)): Path<(String, String)>,
) -> ApiResult {
    Ok(Json(broker.heartbeat(&account_id, &delegate_id).await?).into_response())
}

async fn update_scopes(
    State(broker): State<Arc<DelegateBroker>>,
    Path((account_id, delegate_id)): Path<(String, String)>,
    Json(body): Json<ScopesRequest>,
) -> ApiResult {
    let delegate = broker
        .update_scopes(
            &account_id,
            &delegate_id,
            body.include_scopes,
            body.exclude_scopes,
        )
        .await?;
    Ok(Json(delegate).into_response())
}

async fn set_status(
    State(broker): State<Arc<DelegateBroker>>,
    Path((account_id, delegate_id)): Path<(String, String)>,
    Json(body): Json<StatusRequest>,
) -> ApiResult {
    let delegate = broker
        .set_delegate_status(&account_id, &delegate_id, body.status)
        .await?;
    Ok(Json(delegate).into_response())
}

async fn delete_delegate(
    State(broker): State<Arc<DelegateBroker>>,
    Path((account_id, delegate_id)): Path<(String, String)>,
) -> ApiResult {
    Ok(Json(broker.delete_delegate(&account_id, &delegate_id).await?).into_response())
}

async fn clear_cache(
    State(broker): State<Arc<DelegateBroker>>,
    Path((_account_id, delegate_id)): Path<(String, String)>,
) -> impl IntoResponse {
    broker.clear_cache(&delegate_id).await;
    Json(serde_json::json!({"status": "cleared"}))
}

async fn poll_events(
    State(broker): State<Arc<DelegateBroker>>,
    Path((account_id, delegate_id)): Path<(String, String)>,
    Query(query): Query<EventsQuery>,
) -> ApiResult {
    let events = broker
        .poll_events(&account_id, &delegate_id, query.sync_only)
        .await?;
    Ok(Json(events).into_response())
}

async fn delegate_tasks(
    State(broker): State<Arc<DelegateBroker>>,
    Path((account_id, delegate_id)): Path<(String, String)>,
) -> ApiResult {
    Ok(Json(broker.delegate_tasks(&account_id, &delegate_id).await?).into_response())
}

// ── Tasks ───────────────────────────────────────────────────────────────

async fn queue_task(
    State(broker): State<Arc<DelegateBroker>>,
    Json(body): Json<TaskSubmission>,
) -> ApiResult {
    let task = broker.queue_task(body.into_task()).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"task_id": task.id, "wait_id": task.wait_id})),
    )
        .into_response())
}

async fn execute_task(
    State(broker): State<Arc<DelegateBroker>>,
    Json(body): Json<TaskSubmission>,
) -> ApiResult {
    Ok(Json(broker.execute_task(body.into_task()).await?).into_response())
}

async fn task_status(
    State(broker): State<Arc<DelegateBroker>>,
    Path((account_id, task_id)): Path<(String, Uuid)>,
) -> ApiResult {
    Ok(match broker.task_status(&account_id, task_id).await? {
        Some(task) => Json(task).into_response(),
        None => not_found("Task not found"),
    })
}

async fn acquire_task(
    State(broker): State<Arc<DelegateBroker>>,
    Path((account_id, task_id)): Path<(String, Uuid)>,
    Json(body): Json<DelegateRequest>,
) -> ApiResult {
    let task = broker
        .acquire_task(&account_id, &body.delegate_id, task_id)
        .await?;
    Ok(task_or_absent(task))
}

async fn report_validation(
    State(broker): State<Arc<DelegateBroker>>,
    Path((account_id, task_id)): Path<(String, Uuid)>,
    Json(body): Json<ReportRequest>,
) -> ApiResult {
    let results = body
        .results
        .into_iter()
        .map(|r| ConnectionResult {
            account_id: account_id.clone(),
            delegate_id: body.delegate_id.clone(),
            criteria: r.criteria,
            validated: r.validated,
        })
        .collect();
    let task = broker
        .report_validation_result(&account_id, &body.delegate_id, task_id, results)
        .await?;
    Ok(task_or_absent(task))
}

async fn proceed_anyway(
    State(broker): State<Arc<DelegateBroker>>,
    Path((account_id, task_id)): Path<(String, Uuid)>,
    Json(body): Json<DelegateRequest>,
) -> ApiResult {
    let task = broker
        .proceed_anyway(&account_id, &body.delegate_id, task_id)
        .await?;
    Ok(task_or_absent(task))
}

async fn start_task(
    State(broker): State<Arc<DelegateBroker>>,
    Path((account_id, task_id)): Path<(String, Uuid)>,
    Json(body): Json<DelegateRequest>,
) -> ApiResult {
    let task = broker
        .start_task(&account_id, &body.delegate_id, task_id)
        .await?;
    Ok(task_or_absent(task))
}

async fn submit_result(
    State(broker): State<Arc<DelegateBroker>>,
    Path((account_id, task_id)): Path<(String, Uuid)>,
    Json(body): Json<ResultRequest>,
) -> ApiResult {
    broker
        .submit_result(&account_id, &body.delegate_id, task_id, body.response)
        .await?;
    Ok(Json(serde_json::json!({"status": "accepted"})).into_response())
}

async fn abort_task(
    State(broker): State<Arc<DelegateBroker>>,
    Path((account_id, task_id)): Path<(String, Uuid)>,
) -> ApiResult {
    Ok(match broker.abort_task(&account_id, task_id).await? {
        Some(task) => {
            info!(task_id = %task_id, "Abort requested over HTTP");
            Json(task).into_response()
        }
        None => not_found("No abortable task"),
    })
}

/// Long-poll for async task responses by wait id.
pub fn wait_routes(waiters: Arc<WaitRegistry>) -> Router {
    Router::new()
        .route("/api/waits/{wait_id}", get(await_response))
        .with_state(waiters)
}

async fn await_response(
    State(waiters): State<Arc<WaitRegistry>>,
    Path(wait_id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> Response {
    let wait = query
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_WAIT)
        .min(MAX_WAIT);
    match waiters.wait_for(&wait_id, wait).await {
        Some(response) => Json(response).into_response(),
        None => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(serde_json::json!({"error": "No response yet", "wait_id": wait_id})),
        )
            .into_response(),
    }
}

fn task_or_absent(task: Option<DelegateTask>) -> Response {
    match task {
        Some(task) => Json(task).into_response(),
        None => not_found("Task not available"),
    }
}
