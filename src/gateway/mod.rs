//! Public REST facade.
//!
//! The gateway maps the caller's external auth id onto the owning user on
//! every project-scoped call, forwards chat to the planner, streams bundle
//! downloads, and serves the admin aggregation views. It performs no status
//! transitions of its own.

use crate::models::{MessageRole, Project, User};
use crate::objects::{ObjectStoreClient, ObjectUri};
use crate::planner::{PlanOutcome, PlannerAgent, PlanRequest};
use crate::service::{error_response, health, ErrorResponse};
use crate::store::Store;
use crate::training::Predictor;
use crate::{ForgeError, Result};
use axum::body::Body;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

const CALLER_HEADER: &str = "x-user-id";
const DEFAULT_LIST_LIMIT: u32 = 50;

type HandlerError = (StatusCode, Json<ErrorResponse>);

#[derive(Clone)]
pub struct GatewayState {
    store: Arc<dyn Store>,
    objects: Arc<ObjectStoreClient>,
    planner: Arc<PlannerAgent>,
}

pub struct Gateway {
    state: GatewayState,
    host: String,
    port: u16,
    allowed_origins: Vec<String>,
}

impl Gateway {
    pub fn new(
        store: Arc<dyn Store>,
        objects: Arc<ObjectStoreClient>,
        planner: Arc<PlannerAgent>,
        host: String,
        port: u16,
        allowed_origins: Vec<String>,
    ) -> Self {
        Self {
            state: GatewayState {
                store,
                objects,
                planner,
            },
            host,
            port,
            allowed_origins,
        }
    }

    pub fn build_router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(
                self.allowed_origins
                    .iter()
                    .filter_map(|origin| origin.parse().ok())
                    .collect::<Vec<header::HeaderValue>>(),
            )
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers([
                header::CONTENT_TYPE,
                header::HeaderName::from_static(CALLER_HEADER),
            ]);

        Router::new()
            .route("/api/ml/chat", post(chat))
            .route("/api/ml/projects", get(list_projects))
            .route("/api/ml/projects/{id}", get(get_project))
            .route("/api/ml/projects/{id}/logs", get(get_project_logs))
            .route("/api/ml/projects/{id}/download", get(download_bundle))
            .route("/api/ml/projects/{id}/test", post(test_inference))
            .route("/api/admin/stats", get(admin_stats))
            .route("/api/admin/users", get(admin_users))
            .route("/api/admin/projects", get(admin_projects))
            .route("/api/admin/logs", get(admin_logs))
            .route("/health", get(health))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(cors),
            )
            .with_state(self.state.clone())
    }

    pub async fn run(&self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(format!("{}:{}", self.host, self.port))
            .await
            .map_err(|e| ForgeError::Internal(e.into()))?;
        info!("gateway listening on {}:{}", self.host, self.port);
        axum::serve(listener, self.build_router())
            .await
            .map_err(|e| ForgeError::Internal(e.into()))?;
        Ok(())
    }
}

/// The authenticated caller's external id, as forwarded by the auth layer in
/// front of us.
fn caller_external_id(headers: &HeaderMap) -> Result<String> {
    headers
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .ok_or_else(|| ForgeError::InputInvalid(format!("missing {CALLER_HEADER} header")))
}

/// Users are created on first observation of their external auth id.
async fn resolve_caller(state: &GatewayState, headers: &HeaderMap) -> Result<User> {
    let external_id = caller_external_id(headers)?;
    state.store.upsert_user(&external_id, None).await
}

fn forbidden() -> HandlerError {
    (
        StatusCode::FORBIDDEN,
        Json(ErrorResponse {
            success: false,
            kind: "forbidden".to_string(),
            detail: "caller does not own this resource".to_string(),
        }),
    )
}

/// Owner-scoped project load: 404 for unknown ids, 403 for non-owners
/// (admins bypass).
async fn load_owned_project(
    state: &GatewayState,
    caller: &User,
    project_id: Uuid,
) -> std::result::Result<Project, HandlerError> {
    let project = state
        .store
        .get_project(project_id)
        .await
        .map_err(|e| error_response(&e))?
        .ok_or_else(|| error_response(&ForgeError::NotFound(format!("project {project_id}"))))?;
    if project.user_id != caller.id && !caller.is_admin {
        return Err(forbidden());
    }
    Ok(project)
}

// --- Chat -------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChatRequest {
    user_id: String,
    session_id: Option<String>,
    message_text: String,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    success: bool,
    project_id: Uuid,
    plan: crate::planner::Plan,
    message: String,
}

/// Record the inbound message and relay the planner's response verbatim.
async fn chat(
    State(state): State<GatewayState>,
    Json(request): Json<ChatRequest>,
) -> std::result::Result<Json<ChatResponse>, HandlerError> {
    let text = request.message_text.trim();
    if !text.is_empty() {
        let user = state
            .store
            .upsert_user(&request.user_id, None)
            .await
            .map_err(|e| error_response(&e))?;
        state
            .store
            .write_message(user.id, MessageRole::User, text)
            .await
            .map_err(|e| error_response(&e))?;
    }

    let PlanOutcome {
        project_id,
        plan,
        message,
    } = state
        .planner
        .handle_message(PlanRequest {
            user_external_id: request.user_id,
            utterance: request.message_text,
            session_id: request.session_id,
        })
        .await
        .map_err(|e| error_response(&e))?;

    Ok(Json(ChatResponse {
        success: true,
        project_id,
        plan,
        message,
    }))
}

// --- Project reads ----------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ListQuery {
    user_id: Option<String>,
    limit: Option<u32>,
}

async fn list_projects(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> std::result::Result<Json<Vec<Project>>, HandlerError> {
    // The list endpoint also accepts the caller identity as ?user_id=…,
    // which is what the chat surface sends.
    let caller = match resolve_caller(&state, &headers).await {
        Ok(caller) => caller,
        Err(e) => match &query.user_id {
            Some(external_id) => state
                .store
                .upsert_user(external_id, None)
                .await
                .map_err(|e| error_response(&e))?,
            None => return Err(error_response(&e)),
        },
    };

    // Admins may list any user's projects; everyone else only their own.
    let target_id = match query.user_id {
        Some(external_id) if external_id != caller.external_auth_id => {
            if !caller.is_admin {
                return Err(forbidden());
            }
            match state
                .store
                .get_user_by_external_id(&external_id)
                .await
                .map_err(|e| error_response(&e))?
            {
                Some(user) => user.id,
                None => return Ok(Json(Vec::new())),
            }
        }
        _ => caller.id,
    };

    let projects = state
        .store
        .get_projects_by_user(target_id)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(projects))
}

async fn get_project(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(project_id): Path<Uuid>,
) -> std::result::Result<Json<Project>, HandlerError> {
    let caller = resolve_caller(&state, &headers)
        .await
        .map_err(|e| error_response(&e))?;
    let project = load_owned_project(&state, &caller, project_id).await?;
    Ok(Json(project))
}

async fn get_project_logs(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(project_id): Path<Uuid>,
    Query(query): Query<ListQuery>,
) -> std::result::Result<Json<Vec<crate::models::AgentLog>>, HandlerError> {
    let caller = resolve_caller(&state, &headers)
        .await
        .map_err(|e| error_response(&e))?;
    load_owned_project(&state, &caller, project_id).await?;

    let logs = state
        .store
        .get_logs_by_project(project_id, query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(logs))
}

// --- Bundle download --------------------------------------------------------

/// Stream the bundle zip; the file is never materialized in gateway memory.
async fn download_bundle(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(project_id): Path<Uuid>,
) -> std::result::Result<Response, HandlerError> {
    let caller = resolve_caller(&state, &headers)
        .await
        .map_err(|e| error_response(&e))?;
    let project = load_owned_project(&state, &caller, project_id).await?;

    let bundle_uri = project
        .bundle_uri()
        .ok_or_else(|| {
            error_response(&ForgeError::NotFound(format!(
                "project {project_id} has no bundle yet"
            )))
        })?
        .to_string();
    let uri = ObjectUri::parse(&bundle_uri).map_err(|e| error_response(&e))?;
    let stream = state
        .objects
        .open_read(&uri)
        .await
        .map_err(|e| error_response(&e))?;

    let filename = format!("{}.zip", project.slug());
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/zip")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename={filename}"),
        )
        .body(Body::from_stream(stream))
        .map_err(|e| error_response(&ForgeError::Internal(e.into())))?;
    Ok(response)
}

// --- Test inference ---------------------------------------------------------

#[derive(Debug, Serialize)]
struct TestInferenceResponse {
    label: String,
    confidence: f64,
}

/// Classify an uploaded image with the project's trained model; admin and
/// testing surface, not a production inference path.
async fn test_inference(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(project_id): Path<Uuid>,
    mut multipart: Multipart,
) -> std::result::Result<Json<TestInferenceResponse>, HandlerError> {
    let caller = resolve_caller(&state, &headers)
        .await
        .map_err(|e| error_response(&e))?;
    if !caller.is_admin {
        return Err(forbidden());
    }
    let project = state
        .store
        .get_project(project_id)
        .await
        .map_err(|e| error_response(&e))?
        .ok_or_else(|| error_response(&ForgeError::NotFound(format!("project {project_id}"))))?;

    let mut image_bytes: Option<Vec<u8>> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| error_response(&ForgeError::InputInvalid(e.to_string())))?
    {
        if field.name() == Some("file") {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| error_response(&ForgeError::InputInvalid(e.to_string())))?;
            image_bytes = Some(bytes.to_vec());
        }
    }
    let image_bytes = image_bytes.ok_or_else(|| {
        error_response(&ForgeError::InputInvalid(
            "multipart field \"file\" is required".to_string(),
        ))
    })?;

    let model = state
        .store
        .get_model_by_project(project_id)
        .await
        .map_err(|e| error_response(&e))?
        .ok_or_else(|| {
            error_response(&ForgeError::NotFound(format!(
                "no trained model for project {project_id}"
            )))
        })?;
    let class_names = project.class_names().ok_or_else(|| {
        error_response(&ForgeError::NotFound(format!(
            "project {project_id} has no recorded class names"
        )))
    })?;

    let weights_uri = ObjectUri::parse(&model.object_uri).map_err(|e| error_response(&e))?;
    let workdir = crate::workdir::Workdir::create("gateway-test", project_id)
        .map_err(|e| error_response(&e))?;
    let weights_path = workdir.join("model.safetensors");
    state
        .objects
        .download(&weights_uri, &weights_path)
        .await
        .map_err(|e| error_response(&e))?;

    let arch = project.preferred_model();
    let (label, confidence) = tokio::task::spawn_blocking(move || {
        let predictor = Predictor::load(arch, class_names, &weights_path)?;
        predictor.predict_bytes(&image_bytes)
    })
    .await
    .map_err(|e| error_response(&ForgeError::Internal(anyhow::anyhow!("inference task: {e}"))))?
    .map_err(|e| error_response(&e))?;

    Ok(Json(TestInferenceResponse { label, confidence }))
}

// --- Admin ------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AdminQuery {
    limit: Option<u32>,
}

async fn require_admin(
    state: &GatewayState,
    headers: &HeaderMap,
) -> std::result::Result<User, HandlerError> {
    let caller = resolve_caller(state, headers)
        .await
        .map_err(|e| error_response(&e))?;
    if !caller.is_admin {
        return Err(forbidden());
    }
    Ok(caller)
}

async fn admin_stats(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> std::result::Result<Json<serde_json::Value>, HandlerError> {
    require_admin(&state, &headers).await?;
    let counts = state
        .store
        .count_projects_by_status()
        .await
        .map_err(|e| error_response(&e))?;
    let total: u64 = counts.values().sum();
    let by_status: serde_json::Map<String, serde_json::Value> = counts
        .into_iter()
        .map(|(status, count)| (status.to_string(), serde_json::json!(count)))
        .collect();
    Ok(Json(serde_json::json!({
        "total_projects": total,
        "projects_by_status": by_status,
    })))
}

async fn admin_users(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Query(query): Query<AdminQuery>,
) -> std::result::Result<Json<Vec<User>>, HandlerError> {
    require_admin(&state, &headers).await?;
    let users = state
        .store
        .list_users(query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(users))
}

async fn admin_projects(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Query(query): Query<AdminQuery>,
) -> std::result::Result<Json<Vec<Project>>, HandlerError> {
    require_admin(&state, &headers).await?;
    let projects = state
        .store
        .list_projects(query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(projects))
}

async fn admin_logs(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Query(query): Query<AdminQuery>,
) -> std::result::Result<Json<Vec<crate::models::AgentLog>>, HandlerError> {
    require_admin(&state, &headers).await?;
    let logs = state
        .store
        .list_recent_logs(query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(logs))
}
