use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::rsync::manager::ManagerError;
use crate::rsync::{AuthMode, RemoteType, RsyncManager, RsyncTask, SyncDirection};
use crate::storage::StorageError;

pub fn routes() -> Router<RsyncManager> {
    Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/all", get(all_tasks))
        .route("/tasks/lookup", get(lookup_task))
        .route("/tasks/:id", get(get_task).delete(delete_task))
        .route("/tasks/:id/stop", post(stop_task))
        .route("/tasks/:id/retry", post(retry_task))
        .route("/tasks/:id/test", post(test_sync))
        .route("/tasks/:id/logs", get(task_logs))
}

pub struct ApiError(StatusCode, String);

impl From<ManagerError> for ApiError {
    fn from(e: ManagerError) -> Self {
        let status = match &e {
            ManagerError::Storage(StorageError::NotFound(_)) => StatusCode::NOT_FOUND,
            ManagerError::Storage(StorageError::IdExists(_) | StorageError::NameExists(_)) => StatusCode::CONFLICT,
            ManagerError::RetryRunning(_) | ManagerError::SupervisionLost(_) => StatusCode::CONFLICT,
            ManagerError::QueueFull | ManagerError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Deserialize)]
struct CreateTaskRequest {
    name: String,
    direction: SyncDirection,
    local_path: String,
    remote_type: RemoteType,
    remote_host: String,
    #[serde(default)]
    remote_port: u16,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    ssh_private_key: String,
    auth_mode: AuthMode,
    #[serde(default)]
    remote_path: String,
    #[serde(default)]
    module: String,
    #[serde(default)]
    enqueue: bool,
}

#[derive(Deserialize)]
struct NameQuery {
    name: String,
}

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default = "default_page")]
    page: usize,
    #[serde(default = "default_page_size")]
    page_size: usize,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    20
}

/// Task as returned to clients; the password never leaves the agent.
#[derive(Serialize)]
struct TaskView {
    id: String,
    name: String,
    direction: SyncDirection,
    local_path: String,
    remote_type: RemoteType,
    remote_host: String,
    remote_port: u16,
    username: String,
    auth_mode: AuthMode,
    ssh_private_key: String,
    remote_path: String,
    module: String,
    state: String,
    last_error: String,
    attempt: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RsyncTask> for TaskView {
    fn from(t: RsyncTask) -> Self {
        Self {
            id: t.id,
            name: t.name,
            direction: t.direction,
            local_path: t.local_path,
            remote_type: t.remote_type,
            remote_host: t.remote_host,
            remote_port: t.remote_port,
            username: t.username,
            auth_mode: t.auth_mode,
            ssh_private_key: t.ssh_private_key,
            remote_path: t.remote_path,
            module: t.module,
            state: t.state.to_string(),
            last_error: t.last_error,
            attempt: t.attempt,
            created_at: t.created_at,
            updated_at: t.updated_at,
        }
    }
}

#[derive(Serialize)]
struct TaskList {
    total: usize,
    tasks: Vec<TaskView>,
}

#[derive(Serialize)]
struct LogView {
    id: String,
    path: String,
}

#[derive(Serialize)]
struct LogList {
    total: usize,
    logs: Vec<LogView>,
}

async fn create_task(
    State(manager): State<RsyncManager>,
    payload: Result<Json<CreateTaskRequest>, JsonRejection>,
) -> ApiResult<serde_json::Value> {
    let Json(req) = payload.map_err(|e| ApiError(StatusCode::BAD_REQUEST, e.body_text()))?;
    if req.name.trim().is_empty() {
        return Err(ApiError(StatusCode::BAD_REQUEST, "name required".to_string()));
    }

    let mut task = RsyncTask::new(req.name, req.direction, req.remote_type, req.auth_mode);
    task.local_path = req.local_path;
    task.remote_host = req.remote_host;
    task.remote_port = req.remote_port;
    task.username = req.username;
    task.password = req.password;
    task.ssh_private_key = req.ssh_private_key;
    task.remote_path = req.remote_path;
    task.module = req.module;

    let id = manager.create_task(task, req.enqueue)?;
    Ok(Json(json!({ "id": id })))
}

async fn list_tasks(State(manager): State<RsyncManager>, Query(q): Query<PageQuery>) -> ApiResult<TaskList> {
    let total = manager.all_tasks()?.len();
    let tasks = manager.list_tasks(q.page, q.page_size)?;
    Ok(Json(TaskList {
        total,
        tasks: tasks.into_iter().map(TaskView::from).collect(),
    }))
}

async fn all_tasks(State(manager): State<RsyncManager>) -> ApiResult<TaskList> {
    let tasks = manager.all_tasks()?;
    Ok(Json(TaskList {
        total: tasks.len(),
        tasks: tasks.into_iter().map(TaskView::from).collect(),
    }))
}

async fn get_task(State(manager): State<RsyncManager>, Path(id): Path<String>) -> ApiResult<TaskView> {
    Ok(Json(manager.get_task(&id)?.into()))
}

async fn lookup_task(State(manager): State<RsyncManager>, Query(q): Query<NameQuery>) -> ApiResult<TaskView> {
    Ok(Json(manager.find_task_by_name(&q.name)?.into()))
}

async fn stop_task(State(manager): State<RsyncManager>, Path(id): Path<String>) -> ApiResult<serde_json::Value> {
    manager.stop_task(&id).await?;
    Ok(Json(json!({ "status": "stopped" })))
}

async fn retry_task(State(manager): State<RsyncManager>, Path(id): Path<String>) -> ApiResult<serde_json::Value> {
    manager.retry_task(&id)?;
    Ok(Json(json!({ "status": "pending" })))
}

async fn delete_task(State(manager): State<RsyncManager>, Path(id): Path<String>) -> ApiResult<serde_json::Value> {
    manager.delete_task(&id).await?;
    Ok(Json(json!({ "status": "deleted" })))
}

async fn test_sync(State(manager): State<RsyncManager>, Path(id): Path<String>) -> ApiResult<LogView> {
    let path = manager.test_sync(&id).await?;
    Ok(Json(LogView {
        id,
        path: path.to_string_lossy().to_string(),
    }))
}

async fn task_logs(
    State(manager): State<RsyncManager>,
    Path(id): Path<String>,
    Query(q): Query<PageQuery>,
) -> ApiResult<LogList> {
    manager.get_task(&id)?;
    let (total, paths) = manager.task_logs(&id, q.page, q.page_size)?;
    Ok(Json(LogList {
        total,
        logs: paths
            .into_iter()
            .map(|p| LogView {
                id: id.clone(),
                path: p.to_string_lossy().to_string(),
            })
            .collect(),
    }))
}
