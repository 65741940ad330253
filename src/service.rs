//! HTTP surface shared by the worker agent services, plus the planner's.
//!
//! Every service exposes `/health`; workers add manual triggers, per-project
//! status, and polling control under `/agents/<name>/…`.

use crate::models::ProjectStatus;
use crate::planner::{PlanOutcome, PlannerAgent, PlanRequest};
use crate::polling::PollingRuntime;
use crate::store::Store;
use crate::{ErrorKind, ForgeError};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub kind: String,
    pub detail: String,
}

pub fn status_code_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::InputInvalid | ErrorKind::PlanInvalid => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn error_response(err: &ForgeError) -> (StatusCode, Json<ErrorResponse>) {
    (
        status_code_for(err.kind()),
        Json(ErrorResponse {
            success: false,
            kind: err.code().to_string(),
            detail: err.to_string(),
        }),
    )
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

// --- Worker agent service ---------------------------------------------------

#[derive(Clone)]
pub struct AgentService {
    store: Arc<dyn Store>,
    runtime: Arc<PollingRuntime>,
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    project_id: Uuid,
}

#[derive(Debug, Serialize)]
struct StartResponse {
    success: bool,
    project_id: Uuid,
    status: ProjectStatus,
}

#[derive(Debug, Serialize)]
struct ProjectStatusResponse {
    status: ProjectStatus,
    logs: Vec<String>,
}

#[derive(Debug, Serialize)]
struct PollingToggleResponse {
    success: bool,
    is_running: bool,
}

impl AgentService {
    pub fn new(store: Arc<dyn Store>, runtime: Arc<PollingRuntime>) -> Self {
        Self { store, runtime }
    }

    /// Router mounted at the service root; paths follow
    /// `/agents/<name>/…` with the agent's own name baked in.
    pub fn router(&self) -> Router {
        let name = self.runtime.agent_name().to_string();
        let inner = Router::new()
            .route("/start", post(start_project))
            .route("/status/{project_id}", get(project_status))
            .route("/polling/start", post(polling_start))
            .route("/polling/stop", post(polling_stop))
            .route("/polling/status", get(polling_status))
            .with_state(self.clone());
        Router::new()
            .nest(&format!("/agents/{name}"), inner)
            .route("/health", get(health))
    }
}

/// Manual trigger for one project; 409 when the project is not in the
/// agent's owned status or is already in flight.
async fn start_project(
    State(service): State<AgentService>,
    Json(request): Json<StartRequest>,
) -> Result<Json<StartResponse>, (StatusCode, Json<ErrorResponse>)> {
    service
        .runtime
        .process_one(request.project_id)
        .await
        .map_err(|e| error_response(&e))?;

    let status = service
        .store
        .get_project(request.project_id)
        .await
        .map_err(|e| error_response(&e))?
        .map(|p| p.status)
        .ok_or_else(|| {
            error_response(&ForgeError::NotFound(format!(
                "project {}",
                request.project_id
            )))
        })?;

    Ok(Json(StartResponse {
        success: true,
        project_id: request.project_id,
        status,
    }))
}

async fn project_status(
    State(service): State<AgentService>,
    Path(project_id): Path<Uuid>,
) -> Result<Json<ProjectStatusResponse>, (StatusCode, Json<ErrorResponse>)> {
    let project = service
        .store
        .get_project(project_id)
        .await
        .map_err(|e| error_response(&e))?
        .ok_or_else(|| error_response(&ForgeError::NotFound(format!("project {project_id}"))))?;

    let logs = service
        .store
        .get_logs_by_project(project_id, 50)
        .await
        .map_err(|e| error_response(&e))?
        .into_iter()
        .map(|l| format!("[{}] {} {}: {}", l.created_at, l.log_level, l.agent_name, l.message))
        .collect();

    Ok(Json(ProjectStatusResponse {
        status: project.status,
        logs,
    }))
}

async fn polling_start(State(service): State<AgentService>) -> Json<PollingToggleResponse> {
    service.runtime.clone().start().await;
    Json(PollingToggleResponse {
        success: true,
        is_running: service.runtime.status().is_running,
    })
}

async fn polling_stop(State(service): State<AgentService>) -> Json<PollingToggleResponse> {
    service.runtime.stop().await;
    Json(PollingToggleResponse {
        success: true,
        is_running: service.runtime.status().is_running,
    })
}

async fn polling_status(
    State(service): State<AgentService>,
) -> Json<crate::polling::PollingStatus> {
    Json(service.runtime.status())
}

// --- Planner service --------------------------------------------------------

#[derive(Debug, Deserialize)]
struct HandleMessageRequest {
    user_id: String,
    session_id: Option<String>,
    message_text: String,
}

#[derive(Debug, Serialize)]
struct HandleMessageResponse {
    success: bool,
    project_id: Uuid,
    plan: crate::planner::Plan,
    message: String,
}

pub fn planner_router(planner: Arc<PlannerAgent>) -> Router {
    Router::new()
        .route("/agents/planner/handle_message", post(handle_message))
        .route("/health", get(health))
        .with_state(planner)
}

async fn handle_message(
    State(planner): State<Arc<PlannerAgent>>,
    Json(request): Json<HandleMessageRequest>,
) -> Result<Json<HandleMessageResponse>, (StatusCode, Json<ErrorResponse>)> {
    let PlanOutcome {
        project_id,
        plan,
        message,
    } = planner
        .handle_message(PlanRequest {
            user_external_id: request.user_id,
            utterance: request.message_text,
            session_id: request.session_id,
        })
        .await
        .map_err(|e| error_response(&e))?;

    Ok(Json(HandleMessageResponse {
        success: true,
        project_id,
        plan,
        message,
    }))
}
