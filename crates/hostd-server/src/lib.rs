//! HTTP surface of the hostd coordinator.
//!
//! Handlers validate input, write desired state, and enqueue lifecycle
//! tasks; state-changing calls answer `202 Accepted` because the actual
//! container work happens asynchronously. No handler ever calls the
//! container runtime; driver failures reach callers as observed `failed`
//! plus `last_error` on the read path, never as a synchronous HTTP error.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use bollard::Docker;
use hostd_api::{
    AcceptedResponse, CreateInstanceRequest, ErrorResponse, HistoryQuery, InstanceResponse,
    SampleResponse, TaskResponse,
};
use hostd_common::{CoordinatorError, DesiredState, HostingInstance, InstanceSpec, TaskKind};
use hostd_core::{CoordinatorMetrics, StateStore, TaskQueue};
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

const DEFAULT_HISTORY_LIMIT: usize = 100;
const MAX_HISTORY_LIMIT: usize = 1000;
const RUNTIME_PING_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub queue: Arc<TaskQueue>,
    pub metrics: Arc<CoordinatorMetrics>,
    /// Shared Docker handle, used only by the health probe. `None` when the
    /// runtime is not configured (router tests).
    pub docker: Option<Arc<Docker>>,
    /// Host memory ceiling for admission checks on new specs.
    pub host_memory_bytes: u64,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/instances", post(create_instance_handler))
        .route("/api/v1/instances", get(list_instances_handler))
        .route("/api/v1/instances/:id", get(get_instance_handler))
        .route("/api/v1/instances/:id", delete(delete_instance_handler))
        .route("/api/v1/instances/:id/start", post(start_instance_handler))
        .route("/api/v1/instances/:id/stop", post(stop_instance_handler))
        .route("/api/v1/instances/:id/samples", get(list_samples_handler))
        .route("/api/v1/instances/:id/tasks", get(list_tasks_handler))
        .route("/api/v1/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Synchronous failure of a request: a status code plus an error body.
struct ApiFailure(StatusCode, String);

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorResponse { error: self.1 })).into_response()
    }
}

impl From<CoordinatorError> for ApiFailure {
    fn from(err: CoordinatorError) -> Self {
        let status = match &err {
            CoordinatorError::NotFound(_) => StatusCode::NOT_FOUND,
            CoordinatorError::Conflict(_) => StatusCode::CONFLICT,
            CoordinatorError::InvalidSpec(_) | CoordinatorError::QuotaExceeded(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiFailure(status, err.to_string())
    }
}

fn validate_spec(req: &CreateInstanceRequest, host_memory_bytes: u64) -> Result<(), ApiFailure> {
    if req.name.trim().is_empty() {
        return Err(CoordinatorError::InvalidSpec("name must not be empty".to_string()).into());
    }
    if req.owner.trim().is_empty() {
        return Err(CoordinatorError::InvalidSpec("owner must not be empty".to_string()).into());
    }
    if req.image.trim().is_empty() {
        return Err(CoordinatorError::InvalidSpec("image must not be empty".to_string()).into());
    }
    if let Some(limit) = req.memory_limit_bytes {
        if limit > host_memory_bytes {
            return Err(CoordinatorError::QuotaExceeded(format!(
                "memory limit {limit} exceeds host memory {host_memory_bytes}"
            ))
            .into());
        }
    }
    Ok(())
}

async fn create_instance_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateInstanceRequest>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiFailure> {
    validate_spec(&req, state.host_memory_bytes)?;

    let spec = InstanceSpec {
        image: req.image,
        command: req.command.unwrap_or_default(),
        env_vars: req.env_vars,
        memory_limit_bytes: req.memory_limit_bytes,
        cpu_limit_millis: req.cpu_limit_millis,
        port: req.port,
    };
    let mut instance = HostingInstance::new(req.owner, req.name, spec);
    instance.desired = if req.start.unwrap_or(true) {
        DesiredState::Running
    } else {
        DesiredState::Stopped
    };

    let stored = state.store.upsert_desired_state(&instance)?;
    let task = state.queue.enqueue_if_idle(TaskKind::Create, stored.id)?;
    info!(instance_id = %stored.id, desired = stored.desired.as_str(), "Instance requested");

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            id: stored.id,
            desired: stored.desired,
            task_id: task.map(|t| t.id),
        }),
    ))
}

async fn list_instances_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<InstanceResponse>>, ApiFailure> {
    let instances = state.store.list_instances()?;
    Ok(Json(
        instances.into_iter().map(InstanceResponse::from).collect(),
    ))
}

async fn get_instance_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<InstanceResponse>, ApiFailure> {
    let instance = state.store.get_instance(id)?;
    Ok(Json(instance.into()))
}

/// Record a new desired state and schedule the matching corrective task.
fn set_desired(
    state: &AppState,
    id: Uuid,
    desired: DesiredState,
    kind: TaskKind,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiFailure> {
    let mut instance = state.store.get_instance(id)?;
    instance.desired = desired;
    let stored = state.store.upsert_desired_state(&instance)?;
    let task = state.queue.enqueue_if_idle(kind, stored.id)?;
    info!(instance_id = %stored.id, desired = desired.as_str(), "Desired state recorded");
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            id: stored.id,
            desired: stored.desired,
            task_id: task.map(|t| t.id),
        }),
    ))
}

async fn start_instance_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiFailure> {
    set_desired(&state, id, DesiredState::Running, TaskKind::Start)
}

async fn stop_instance_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiFailure> {
    set_desired(&state, id, DesiredState::Stopped, TaskKind::Stop)
}

async fn delete_instance_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiFailure> {
    set_desired(&state, id, DesiredState::Deleted, TaskKind::Remove)
}

async fn list_samples_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<SampleResponse>>, ApiFailure> {
    state.store.get_instance(id)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    let samples = state.store.list_samples(id, limit)?;
    Ok(Json(samples.into_iter().map(SampleResponse::from).collect()))
}

async fn list_tasks_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<TaskResponse>>, ApiFailure> {
    state.store.get_instance(id)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    let tasks = state.store.list_tasks(id, limit)?;
    Ok(Json(tasks.into_iter().map(TaskResponse::from).collect()))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let store = match state.store.health_check() {
        Ok(()) => "healthy",
        Err(_) => "unreachable",
    };
    let runtime = match &state.docker {
        Some(docker) => {
            match tokio::time::timeout(RUNTIME_PING_TIMEOUT, docker.ping()).await {
                Ok(Ok(_)) => "healthy",
                Ok(Err(_)) | Err(_) => "unreachable",
            }
        }
        None => "unconfigured",
    };
    let status = if store == "healthy" && runtime != "unreachable" {
        "healthy"
    } else {
        "degraded"
    };

    Json(serde_json::json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "components": {
            "store": store,
            "runtime": runtime,
        }
    }))
}

#[cfg(test)]
mod tests;
