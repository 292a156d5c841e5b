//! REST API handlers for canary rollouts.
//!
//! Provides endpoints to create, start, advance, roll back, list, and
//! inspect canary rollouts.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};

use fleet_rollout::{CanaryConfig, NewCanary, RolloutError, RolloutMetrics};
use fleet_state::{CanaryDeployment, DeploymentKind, TargetType};

use crate::GatewayState;
use crate::handlers::{ApiResponse, deploy_error, error_response};

fn rollout_error(e: RolloutError) -> axum::response::Response {
    let status = match e {
        RolloutError::Deploy(inner) => return deploy_error(inner),
        RolloutError::NotFound(_) => StatusCode::NOT_FOUND,
        RolloutError::InvalidConfig(_) | RolloutError::NoTargets(_) => StatusCode::BAD_REQUEST,
        RolloutError::InvalidPhase { .. } => StatusCode::CONFLICT,
        RolloutError::State(_) | RolloutError::Command(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

/// A rollout together with its current metrics.
#[derive(Serialize)]
pub struct CanaryView {
    #[serde(flatten)]
    pub canary: CanaryDeployment,
    pub metrics: RolloutMetrics,
}

fn view(state: &GatewayState, canary: CanaryDeployment) -> axum::response::Response {
    match state.canaries.get_metrics(&canary.id) {
        Ok(metrics) => ApiResponse::ok(CanaryView { canary, metrics }).into_response(),
        Err(e) => rollout_error(e),
    }
}

/// Request body to create a canary rollout.
#[derive(Debug, Deserialize)]
pub struct CreateCanaryRequest {
    pub deployment_type: DeploymentKind,
    pub resource_id: String,
    pub target_type: TargetType,
    pub target_id: String,
    #[serde(default)]
    pub config: Option<CanaryConfig>,
    #[serde(default)]
    pub created_by: Option<String>,
}

/// POST /api/v1/canaries
pub async fn create_canary(
    State(state): State<GatewayState>,
    Json(req): Json<CreateCanaryRequest>,
) -> impl IntoResponse {
    let request = NewCanary {
        deployment_type: req.deployment_type,
        resource_id: req.resource_id,
        target_type: req.target_type,
        target_id: req.target_id,
        config: req.config,
        created_by: req.created_by.unwrap_or_else(|| "api".to_string()),
    };
    match state.canaries.create(request) {
        Ok(canary) => {
            let mut resp = view(&state, canary);
            if resp.status() == StatusCode::OK {
                *resp.status_mut() = StatusCode::CREATED;
            }
            resp
        }
        Err(e) => rollout_error(e),
    }
}

/// GET /api/v1/canaries
pub async fn list_canaries(State(state): State<GatewayState>) -> impl IntoResponse {
    match state.canaries.list() {
        Ok(canaries) => ApiResponse::ok(canaries).into_response(),
        Err(e) => rollout_error(e),
    }
}

/// GET /api/v1/canaries/:id
pub async fn get_canary(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.canaries.get(&id) {
        Ok(canary) => view(&state, canary),
        Err(e) => rollout_error(e),
    }
}

/// GET /api/v1/canaries/:id/sites
pub async fn list_canary_sites(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.canaries.list_sites(&id) {
        Ok(sites) => ApiResponse::ok(sites).into_response(),
        Err(e) => rollout_error(e),
    }
}

/// POST /api/v1/canaries/:id/start
pub async fn start_canary(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.canaries.start_canary(&id).await {
        Ok(canary) => view(&state, canary),
        Err(e) => rollout_error(e),
    }
}

/// POST /api/v1/canaries/:id/advance
pub async fn advance_canary(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.canaries.advance(&id).await {
        Ok(outcome) => ApiResponse::ok(outcome).into_response(),
        Err(e) => rollout_error(e),
    }
}

/// Request body to roll a rollout back.
#[derive(Debug, Default, Deserialize)]
pub struct RollbackRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /api/v1/canaries/:id/rollback
pub async fn rollback_canary(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
    body: Option<Json<RollbackRequest>>,
) -> impl IntoResponse {
    let reason = body
        .and_then(|Json(req)| req.reason)
        .unwrap_or_else(|| "manual rollback".to_string());
    match state.canaries.rollback(&id, &reason).await {
        Ok(canary) => view(&state, canary),
        Err(e) => rollout_error(e),
    }
}
