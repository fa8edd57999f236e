use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::client::Client;
use crate::error::DashError;
use crate::presence::PresenceRecord;
use crate::tasks::{TaskId, TaskRecord, DEFAULT_LANGUAGE};

/// Number of tasks shown by the task list.
pub const RECENT_TASKS: usize = 5;

#[derive(Clone)]
pub struct DashboardState {
    pub client: Arc<Client>,
}

impl DashboardState {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeResponse {
    session_id: String,
    #[serde(flatten)]
    record: PresenceRecord,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PresenceResponse {
    online: bool,
    count: usize,
    nodes: Vec<NodeResponse>,
}

#[derive(Deserialize)]
struct SubmitTaskRequest {
    code: String,
    language: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitTaskResponse {
    success: bool,
    task_id: Option<String>,
    error: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl SubmitTaskResponse {
    fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            task_id: None,
            error: Some(error.into()),
        }
    }
}

fn error_status(error: &DashError) -> StatusCode {
    match error {
        DashError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        DashError::TaskNotFound(_) => StatusCode::NOT_FOUND,
        DashError::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: DashError) -> (StatusCode, Json<ErrorResponse>) {
    (
        error_status(&error),
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

/// Build the dashboard routes.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/presence", get(presence_handler))
        .route("/api/tasks", get(list_tasks_handler).post(submit_task_handler))
        .route("/api/tasks/:id", get(get_task_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, token: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await;
    if let Err(e) = served {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn presence_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let online = state.client.is_online();
    match state.client.registry().snapshot(None).await {
        Ok(snapshot) => Json(PresenceResponse {
            online,
            count: snapshot.count,
            nodes: snapshot
                .records
                .into_iter()
                .map(|(session_id, record)| NodeResponse {
                    session_id: session_id.to_string(),
                    record,
                })
                .collect(),
        })
        .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn list_tasks_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    match state.client.tasks().recent(RECENT_TASKS).await {
        Ok(tasks) => Json(tasks).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn get_task_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let task_id = match TaskId::parse(id) {
        Ok(task_id) => task_id,
        Err(e) => return error_response(e).into_response(),
    };
    let found: Result<TaskRecord, DashError> = state.client.tasks().fetch(&task_id).await;
    match found {
        Ok(task) => Json(task).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn submit_task_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<SubmitTaskRequest>,
) -> impl IntoResponse {
    let language = payload
        .language
        .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());

    match state
        .client
        .submit_with_language(&payload.code, &language)
        .await
    {
        Ok(task_id) => (
            StatusCode::OK,
            Json(SubmitTaskResponse {
                success: true,
                task_id: Some(task_id.to_string()),
                error: None,
            }),
        ),
        Err(DashError::StoreUnavailable) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(SubmitTaskResponse::rejected("Offline: cannot reach the network")),
        ),
        Err(e) => (error_status(&e), Json(SubmitTaskResponse::rejected(e.to_string()))),
    }
}
