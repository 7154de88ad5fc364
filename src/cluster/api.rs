//! Control Plane API Server
//!
//! Provides REST endpoints over the controller's records:
//! - Nodes: list, get, health check, model download
//! - Deployments: create, list, get, stop, restart, delete, logs
//! - Commands: get, cancel (local)
//! - Status: cluster health
//!
//! Every `/v1` route requires an API key; reads are filtered by the
//! caller's scope. The worker socket is mounted on the same router.

use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::warn;

use super::auth::{bearer_token, AuthError, CallerIdentity};
use super::controller::{ClusterController, ControllerError, CreateDeploymentRequest};
use super::deployment::TransitionError;
use super::dispatcher::DispatchError;
use super::gateway::node_socket_routes;
use super::resources::{OperationStatus, ResourceList};
use crate::protocol::{DeploymentStopPayload, ModelDownloadPayload, SystemHealthCheckPayload};

/// Shared state for the control plane API
#[derive(Clone)]
pub struct ControlPlaneState {
    pub controller: Arc<ClusterController>,
}

impl ControlPlaneState {
    pub fn new(controller: Arc<ClusterController>) -> Self {
        Self { controller }
    }
}

/// Create the control plane router
pub fn create_control_plane_router(state: ControlPlaneState) -> Router {
    Router::new()
        // Cluster status
        .route("/v1/status", get(cluster_status))
        // Nodes
        .route("/v1/nodes", get(list_nodes))
        .route("/v1/nodes/{id}", get(get_node))
        .route("/v1/nodes/{id}/health-check", post(node_health_check))
        .route("/v1/nodes/{id}/models", post(download_model))
        // Deployments
        .route(
            "/v1/deployments",
            get(list_deployments).post(create_deployment),
        )
        .route(
            "/v1/deployments/{id}",
            get(get_deployment).delete(delete_deployment),
        )
        .route("/v1/deployments/{id}/stop", post(stop_deployment))
        .route("/v1/deployments/{id}/restart", post(restart_deployment))
        .route("/v1/deployments/{id}/logs", get(deployment_logs))
        // Commands
        .route(
            "/v1/commands/{message_id}",
            get(get_command).delete(cancel_command),
        )
        // Health check
        .route("/health", get(health_check))
        .merge(node_socket_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Authentication and errors
// ============================================================================

/// Verified REST caller
pub struct Caller(pub CallerIdentity);

impl FromRequestParts<ControlPlaneState> for Caller {
    type Rejection = ControllerError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ControlPlaneState,
    ) -> Result<Self, Self::Rejection> {
        let key = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_token);
        let identity = state.controller.authenticator().authenticate_caller(key)?;
        Ok(Caller(identity))
    }
}

impl ControllerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ControllerError::NodeNotFound(_)
            | ControllerError::DeploymentNotFound(_)
            | ControllerError::CommandNotFound(_)
            | ControllerError::Transition(TransitionError::NotFound(_))
            | ControllerError::Dispatch(DispatchError::NotFound(_)) => StatusCode::NOT_FOUND,
            ControllerError::NodeUnavailable(_)
            | ControllerError::Dispatch(DispatchError::NodeUnavailable(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ControllerError::DeploymentExists(_)
            | ControllerError::InvalidState { .. }
            | ControllerError::Busy(_)
            | ControllerError::Transition(_)
            | ControllerError::Dispatch(DispatchError::Duplicate(_))
            | ControllerError::Dispatch(DispatchError::AlreadyFinished(_)) => StatusCode::CONFLICT,
            ControllerError::ValidationError(_)
            | ControllerError::Dispatch(DispatchError::NotACommand(_)) => StatusCode::BAD_REQUEST,
            ControllerError::Forbidden(_) | ControllerError::Unauthorized(AuthError::NodeInactive(_)) => {
                StatusCode::FORBIDDEN
            }
            ControllerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ControllerError::Dispatch(DispatchError::Abandoned(_))
            | ControllerError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ControllerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!("Request failed: {}", self);
        }
        (status, Json(OperationStatus::failure(self.to_error_details()))).into_response()
    }
}

type ApiResult<T> = Result<T, ControllerError>;

// ============================================================================
// Handlers
// ============================================================================

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "healthy"}))
}

async fn cluster_status(
    State(state): State<ControlPlaneState>,
    _caller: Caller,
) -> impl IntoResponse {
    Json(state.controller.cluster_stats().await)
}

async fn list_nodes(
    State(state): State<ControlPlaneState>,
    Caller(caller): Caller,
) -> impl IntoResponse {
    Json(ResourceList::new(
        "NodeList",
        state.controller.list_nodes(&caller),
    ))
}

async fn get_node(
    State(state): State<ControlPlaneState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.controller.get_node(&caller, &id)?))
}

async fn node_health_check(
    State(state): State<ControlPlaneState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    Query(options): Query<SystemHealthCheckPayload>,
) -> ApiResult<impl IntoResponse> {
    let command = state.controller.health_check(&caller, &id, options).await?;
    Ok(Json(command))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandAccepted {
    message_id: String,
}

async fn download_model(
    State(state): State<ControlPlaneState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    Json(request): Json<ModelDownloadPayload>,
) -> ApiResult<impl IntoResponse> {
    let message_id = state.controller.download_model(&caller, &id, request)?;
    Ok((StatusCode::ACCEPTED, Json(CommandAccepted { message_id })))
}

async fn list_deployments(
    State(state): State<ControlPlaneState>,
    Caller(caller): Caller,
) -> impl IntoResponse {
    Json(ResourceList::new(
        "DeploymentList",
        state.controller.list_deployments(&caller).await,
    ))
}

async fn create_deployment(
    State(state): State<ControlPlaneState>,
    Caller(caller): Caller,
    Json(request): Json<CreateDeploymentRequest>,
) -> ApiResult<impl IntoResponse> {
    let deployment = state.controller.create_deployment(&caller, request).await?;
    Ok((StatusCode::CREATED, Json(deployment)))
}

async fn get_deployment(
    State(state): State<ControlPlaneState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.controller.get_deployment(&caller, &id).await?))
}

async fn delete_deployment(
    State(state): State<ControlPlaneState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.controller.delete_deployment(&caller, &id).await?))
}

async fn stop_deployment(
    State(state): State<ControlPlaneState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    Query(options): Query<DeploymentStopPayload>,
) -> ApiResult<impl IntoResponse> {
    let deployment = state
        .controller
        .stop_deployment(&caller, &id, options)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(deployment)))
}

async fn restart_deployment(
    State(state): State<ControlPlaneState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let deployment = state.controller.restart_deployment(&caller, &id).await?;
    Ok((StatusCode::ACCEPTED, Json(deployment)))
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    tail: Option<usize>,
}

async fn deployment_logs(
    State(state): State<ControlPlaneState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> ApiResult<impl IntoResponse> {
    let lines = state
        .controller
        .deployment_logs(&caller, &id, query.tail)
        .await?;
    Ok(Json(ResourceList::new("LogEntryList", lines)))
}

async fn get_command(
    State(state): State<ControlPlaneState>,
    Caller(caller): Caller,
    Path(message_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.controller.get_command(&caller, &message_id)?))
}

async fn cancel_command(
    State(state): State<ControlPlaneState>,
    Caller(caller): Caller,
    Path(message_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let command = state.controller.cancel_command(&caller, &message_id)?;
    Ok(Json(
        OperationStatus::success(format!("Command {} cancelled", message_id))
            .with_details(serde_json::to_value(&command).unwrap_or_default()),
    ))
}
