//! REST API handlers for sites, commands, artifacts and deployments.
//!
//! Every response uses the same `{success, data?, error?}` envelope.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use fleet_commands::{CommandError, QueueOptions, QueueOutcome};
use fleet_core::protocol::OutboundMessage;
use fleet_core::{CommandType, epoch_millis};
use fleet_deploy::{DeployError, NewDeployment};
use fleet_registry::auth::hash_credential;
use fleet_state::{Artifact, DeploymentKind, Site, TargetType};

use crate::GatewayState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
pub(crate) struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> axum::response::Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn internal(e: impl std::fmt::Display) -> axum::response::Response {
    error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
}

pub(crate) fn deploy_error(e: DeployError) -> axum::response::Response {
    let status = match &e {
        DeployError::NotFound(_) | DeployError::ArtifactNotFound(_) => StatusCode::NOT_FOUND,
        DeployError::ArtifactKindMismatch { .. } | DeployError::InvalidVersion(_) => {
            StatusCode::BAD_REQUEST
        }
        DeployError::InvalidTransition { .. } => StatusCode::CONFLICT,
        DeployError::State(_) | DeployError::Command(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

fn command_error(e: CommandError) -> axum::response::Response {
    let status = match &e {
        CommandError::UnknownSite(_) => StatusCode::NOT_FOUND,
        CommandError::NotQueueable(_) | CommandError::InvalidPriority(_) => StatusCode::BAD_REQUEST,
        CommandError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

/// Load a site or produce the 404/500 response.
fn require_site(state: &GatewayState, id: &str) -> Result<Site, axum::response::Response> {
    match state.store.get_site(id) {
        Ok(Some(site)) => Ok(site),
        Ok(None) => Err(error_response("site not found", StatusCode::NOT_FOUND)),
        Err(e) => Err(internal(e)),
    }
}

// ── Health ─────────────────────────────────────────────────────

/// GET /healthz
pub async fn healthz(State(state): State<GatewayState>) -> impl IntoResponse {
    let connected = state.registry.connected_sites().await.len();
    ApiResponse::ok(serde_json::json!({
        "status": "ok",
        "connected_sites": connected,
    }))
}

// ── Sites ──────────────────────────────────────────────────────

/// A site as exposed by the API. The credential hash is never returned.
#[derive(Debug, Serialize)]
pub struct SiteView {
    pub id: String,
    pub name: String,
    pub group_id: Option<String>,
    /// Live connection on this instance.
    pub connected: bool,
    pub last_seen: Option<u64>,
    pub last_address: Option<String>,
    pub software_version: Option<String>,
    pub pending_config_version: Option<u64>,
    pub desired_config_hash: Option<String>,
    pub reported_config_hash: Option<String>,
}

impl SiteView {
    fn new(site: Site, connected: bool) -> Self {
        Self {
            id: site.id,
            name: site.name,
            group_id: site.group_id,
            connected,
            last_seen: site.last_seen,
            last_address: site.last_address,
            software_version: site.software_version,
            pending_config_version: site.pending_config_version,
            desired_config_hash: site.desired_config_hash,
            reported_config_hash: site.reported_config_hash,
        }
    }
}

/// GET /api/v1/sites
pub async fn list_sites(State(state): State<GatewayState>) -> impl IntoResponse {
    let sites = match state.store.list_sites() {
        Ok(sites) => sites,
        Err(e) => return internal(e),
    };
    let mut views = Vec::with_capacity(sites.len());
    for site in sites {
        let connected = state.registry.is_connected(&site.id).await;
        views.push(SiteView::new(site, connected));
    }
    ApiResponse::ok(views).into_response()
}

/// GET /api/v1/sites/:id
pub async fn get_site(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match require_site(&state, &id) {
        Ok(site) => {
            let connected = state.registry.is_connected(&id).await;
            ApiResponse::ok(SiteView::new(site, connected)).into_response()
        }
        Err(resp) => resp,
    }
}

/// Site registration body.
#[derive(Debug, Deserialize)]
pub struct RegisterSiteRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub group_id: Option<String>,
    /// Plain credential; only its hash is stored.
    pub credential: String,
}

/// POST /api/v1/sites
pub async fn register_site(
    State(state): State<GatewayState>,
    Json(req): Json<RegisterSiteRequest>,
) -> impl IntoResponse {
    if req.id.is_empty() || req.credential.is_empty() {
        return error_response("id and credential are required", StatusCode::BAD_REQUEST);
    }
    // ':' separates the site id from the row suffix in store keys.
    if req.id.contains(':') {
        return error_response("site id must not contain ':'", StatusCode::BAD_REQUEST);
    }
    match state.store.get_site(&req.id) {
        Ok(Some(_)) => return error_response("site already exists", StatusCode::CONFLICT),
        Ok(None) => {}
        Err(e) => return internal(e),
    }

    let site = Site {
        id: req.id,
        name: req.name,
        group_id: req.group_id,
        secret_hash: hash_credential(&req.credential),
        online: false,
        last_seen: None,
        last_address: None,
        pending_config_version: None,
        desired_config: None,
        desired_config_hash: None,
        reported_config_hash: None,
        reported_config_at: None,
        software_version: None,
        created_at: epoch_millis(),
    };
    match state.store.put_site(&site) {
        Ok(()) => {
            info!(site_id = %site.id, group = ?site.group_id, "site registered");
            (StatusCode::CREATED, ApiResponse::ok(SiteView::new(site, false))).into_response()
        }
        Err(e) => internal(e),
    }
}

/// GET /api/v1/sites/:id/alerts
pub async fn list_alerts(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.list_alerts_for_site(&id) {
        Ok(alerts) => ApiResponse::ok(alerts).into_response(),
        Err(e) => internal(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatQuery {
    #[serde(default = "default_heartbeat_limit")]
    pub limit: usize,
}

fn default_heartbeat_limit() -> usize {
    60
}

/// GET /api/v1/sites/:id/heartbeats
pub async fn list_heartbeats(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
    Query(query): Query<HeartbeatQuery>,
) -> impl IntoResponse {
    match state.store.list_heartbeats_for_site(&id, query.limit) {
        Ok(samples) => ApiResponse::ok(samples).into_response(),
        Err(e) => internal(e),
    }
}

// ── Commands ───────────────────────────────────────────────────

/// Command request body.
#[derive(Debug, Deserialize)]
pub struct SendCommandRequest {
    #[serde(rename = "type")]
    pub command_type: CommandType,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub expires_in_secs: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub description: Option<String>,
}

/// POST /api/v1/sites/:id/commands
///
/// Sends right away when the site is connected, queues it otherwise.
pub async fn send_command(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
    Json(req): Json<SendCommandRequest>,
) -> impl IntoResponse {
    if let Err(resp) = require_site(&state, &id) {
        return resp;
    }
    let options = QueueOptions {
        priority: req.priority,
        expires_in: req.expires_in_secs.map(std::time::Duration::from_secs),
        max_attempts: req.max_attempts,
        description: req.description,
    };
    match state
        .queue
        .send_or_queue(&id, req.command_type, req.payload, options)
        .await
    {
        Ok(QueueOutcome::Sent { command_id }) => ApiResponse::ok(serde_json::json!({
            "status": "sent",
            "command_id": command_id,
        }))
        .into_response(),
        Ok(QueueOutcome::Queued { pending_id }) => (
            StatusCode::ACCEPTED,
            ApiResponse::ok(serde_json::json!({
                "status": "queued",
                "pending_id": pending_id,
            })),
        )
            .into_response(),
        Ok(QueueOutcome::Rejected { reason }) => error_response(&reason, StatusCode::CONFLICT),
        Err(e) => command_error(e),
    }
}

/// GET /api/v1/sites/:id/commands
pub async fn list_site_commands(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.list_commands_for_site(&id) {
        Ok(commands) => ApiResponse::ok(commands).into_response(),
        Err(e) => internal(e),
    }
}

/// GET /api/v1/sites/:id/pending
pub async fn list_pending(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.queue.list_pending_commands(&id) {
        Ok(pending) => ApiResponse::ok(pending).into_response(),
        Err(e) => command_error(e),
    }
}

/// DELETE /api/v1/sites/:id/pending
pub async fn clear_pending(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.queue.clear_pending_commands(&id) {
        Ok(cleared) => ApiResponse::ok(serde_json::json!({ "cleared": cleared })).into_response(),
        Err(e) => command_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct PushConfigRequest {
    pub config: serde_json::Value,
}

/// Hex SHA-256 of a configuration document's JSON encoding.
pub fn config_hash(config: &serde_json::Value) -> String {
    hex::encode(Sha256::digest(config.to_string().as_bytes()))
}

/// PUT /api/v1/sites/:id/config
///
/// Records the desired configuration and pushes it to the site.
pub async fn push_config(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
    Json(req): Json<PushConfigRequest>,
) -> impl IntoResponse {
    let hash = config_hash(&req.config);
    let desired = req.config.clone();
    let updated = state.store.update_site(&id, |s| {
        s.desired_config = Some(desired);
        s.desired_config_hash = Some(hash.clone());
    });
    match updated {
        Ok(Some(_)) => {}
        Ok(None) => return error_response("site not found", StatusCode::NOT_FOUND),
        Err(e) => return internal(e),
    }

    match state.queue.push_config(&id, req.config, &hash).await {
        Ok(outcome) => {
            let status = match outcome {
                QueueOutcome::Sent { .. } => "sent",
                QueueOutcome::Queued { .. } => "queued",
                QueueOutcome::Rejected { .. } => "rejected",
            };
            ApiResponse::ok(serde_json::json!({
                "status": status,
                "config_hash": hash,
            }))
            .into_response()
        }
        Err(e) => command_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    pub topic: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// POST /api/v1/groups/:id/broadcast
pub async fn broadcast_to_group(
    State(state): State<GatewayState>,
    Path(group_id): Path<String>,
    Json(req): Json<BroadcastRequest>,
) -> impl IntoResponse {
    let message = OutboundMessage::Broadcast {
        topic: req.topic,
        payload: req.payload,
    };
    match state.registry.broadcast_to_site_group(&group_id, &message).await {
        Ok(summary) => ApiResponse::ok(serde_json::json!({
            "success_count": summary.success_count,
            "failure_count": summary.failure_count,
        }))
        .into_response(),
        Err(e) => internal(e),
    }
}

// ── Artifacts ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RegisterArtifactRequest {
    pub id: String,
    pub kind: DeploymentKind,
    pub name: String,
    pub storage_path: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub checksum: Option<String>,
}

/// POST /api/v1/artifacts
pub async fn register_artifact(
    State(state): State<GatewayState>,
    Json(req): Json<RegisterArtifactRequest>,
) -> impl IntoResponse {
    let artifact = Artifact {
        id: req.id,
        kind: req.kind,
        name: req.name,
        storage_path: req.storage_path,
        version: req.version,
        checksum: req.checksum,
        deleted: false,
        created_at: epoch_millis(),
    };
    match state.store.put_artifact(&artifact) {
        Ok(()) => (StatusCode::CREATED, ApiResponse::ok(artifact)).into_response(),
        Err(e) => internal(e),
    }
}

/// GET /api/v1/artifacts/:id
pub async fn get_artifact(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_artifact(&id) {
        Ok(Some(artifact)) => ApiResponse::ok(artifact).into_response(),
        Ok(None) => error_response("artifact not found", StatusCode::NOT_FOUND),
        Err(e) => internal(e),
    }
}

// ── Deployments ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateDeploymentRequest {
    pub kind: DeploymentKind,
    pub resource_id: String,
    pub target_type: TargetType,
    pub target_id: String,
}

/// GET /api/v1/deployments
pub async fn list_deployments(State(state): State<GatewayState>) -> impl IntoResponse {
    match state.deployments.list_deployments() {
        Ok(deployments) => ApiResponse::ok(deployments).into_response(),
        Err(e) => deploy_error(e),
    }
}

/// GET /api/v1/deployments/:id
pub async fn get_deployment(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.deployments.get_deployment(&id) {
        Ok(deployment) => ApiResponse::ok(deployment).into_response(),
        Err(e) => deploy_error(e),
    }
}

/// POST /api/v1/deployments
///
/// Creates the deployment and starts it.
pub async fn create_deployment(
    State(state): State<GatewayState>,
    Json(req): Json<CreateDeploymentRequest>,
) -> impl IntoResponse {
    let created = state.deployments.create_deployment(NewDeployment {
        kind: req.kind,
        resource_id: req.resource_id,
        target_type: req.target_type,
        target_id: req.target_id,
        canary_id: None,
    });
    let deployment = match created {
        Ok(d) => d,
        Err(e) => return deploy_error(e),
    };
    match state.deployments.start_deployment(&deployment.id).await {
        Ok(d) => (StatusCode::CREATED, ApiResponse::ok(d)).into_response(),
        Err(e) => deploy_error(e),
    }
}

/// POST /api/v1/deployments/:id/cancel
pub async fn cancel_deployment(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.deployments.cancel_deployment(&id).await {
        Ok(d) => ApiResponse::ok(d).into_response(),
        Err(e) => deploy_error(e),
    }
}
