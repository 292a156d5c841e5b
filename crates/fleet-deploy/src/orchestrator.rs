//! Deployment orchestrator.
//!
//! Starting a deployment is best effort: connected sites get the delivery
//! command right away, offline sites keep a `Pending` delivery entry and
//! are caught up when they reconnect. A deployment settles once every
//! resolved site is terminal: `Completed` when all succeeded, `Failed` when
//! any failed after exhausting its retries.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use fleet_commands::{Command, CommandDispatcher, CommandObserver, CommandOutcome};
use fleet_core::{CommandType, EventBus, FailureKind, FleetEvent, epoch_millis};
use fleet_state::{
    Artifact, CanaryId, CommandStatus, DeliveryStatus, Deployment, DeploymentKind, DeploymentStatus,
    SiteDelivery, SiteId, StateStore, TargetType,
};

use crate::error::{DeployError, DeployResult};
use crate::retry::{retry_count, with_marker};
use crate::storage::ObjectStorage;

/// Request to create a deployment.
#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub kind: DeploymentKind,
    pub resource_id: String,
    pub target_type: TargetType,
    pub target_id: String,
    pub canary_id: Option<CanaryId>,
}

/// A progress report from a site.
#[derive(Debug, Clone, Default)]
pub struct ProgressReport {
    pub progress: u8,
    pub completed: bool,
    pub error: Option<String>,
    pub error_kind: Option<FailureKind>,
    /// Installed version, for software updates.
    pub version: Option<String>,
}

/// Notified when one site's delivery within a deployment becomes terminal.
#[async_trait]
pub trait DeploymentObserver: Send + Sync {
    async fn on_site_finished(&self, deployment: &Deployment, site_id: &str);
}

pub struct DeploymentOrchestrator {
    state: StateStore,
    dispatcher: Arc<CommandDispatcher>,
    storage: Arc<dyn ObjectStorage>,
    events: EventBus,
    max_retries: u32,
    observers: RwLock<Vec<Arc<dyn DeploymentObserver>>>,
}

impl DeploymentOrchestrator {
    pub fn new(
        state: StateStore,
        dispatcher: Arc<CommandDispatcher>,
        storage: Arc<dyn ObjectStorage>,
        events: EventBus,
    ) -> Self {
        Self {
            state,
            dispatcher,
            storage,
            events,
            max_retries: 3,
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Maximum automatic re-deliveries per site after a transient failure.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub async fn add_observer(&self, observer: Arc<dyn DeploymentObserver>) {
        self.observers.write().await.push(observer);
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Validate the artifact and persist a `Pending` deployment.
    pub fn create_deployment(&self, request: NewDeployment) -> DeployResult<Deployment> {
        self.validate_artifact(request.kind, &request.resource_id)?;

        let now = epoch_millis();
        let deployment = Deployment {
            id: uuid::Uuid::new_v4().to_string(),
            kind: request.kind,
            resource_id: request.resource_id,
            target_type: request.target_type,
            target_id: request.target_id,
            status: DeploymentStatus::Pending,
            progress: 0,
            error_message: None,
            canary_id: request.canary_id,
            sites: Default::default(),
            created_at: now,
            updated_at: now,
        };
        self.state.put_deployment(&deployment)?;
        info!(
            deployment_id = %deployment.id,
            kind = kind_name(deployment.kind),
            resource_id = %deployment.resource_id,
            target = %deployment.target_id,
            "deployment created"
        );
        Ok(deployment)
    }

    /// Resolve the target and deliver to every connected site.
    ///
    /// Offline sites are not an error; the deployment stays `Pending` until
    /// at least one site accepts delivery.
    pub async fn start_deployment(&self, deployment_id: &str) -> DeployResult<Deployment> {
        let deployment = self.get_deployment(deployment_id)?;
        if deployment.status.is_terminal() {
            return Err(DeployError::InvalidTransition {
                id: deployment.id,
                status: deployment.status.as_str(),
                action: "start",
            });
        }

        let targets = self.resolve_targets(deployment.target_type, &deployment.target_id)?;
        if targets.is_empty() {
            warn!(%deployment_id, target = %deployment.target_id, "no target site found");
            return self.fail_deployment(deployment_id, "no target site found");
        }

        let now = epoch_millis();
        let (deployment, _) = self
            .state
            .update_deployment(deployment_id, |d| {
                for site_id in &targets {
                    d.sites
                        .entry(site_id.clone())
                        .or_insert_with(|| SiteDelivery::pending(now));
                }
                d.updated_at = now;
            })?
            .ok_or_else(|| DeployError::NotFound(deployment_id.to_string()))?;

        let mut accepted = 0;
        for site_id in &targets {
            if !self.dispatcher.registry().is_connected(site_id).await {
                debug!(%deployment_id, %site_id, "site offline, delivery deferred");
                continue;
            }
            match self.deliver(&deployment, site_id).await {
                Ok(true) => accepted += 1,
                Ok(false) => {}
                Err(e) => warn!(%deployment_id, %site_id, error = %e, "delivery failed"),
            }
        }

        let current = self.get_deployment(deployment_id)?;
        info!(
            %deployment_id,
            accepted,
            targets = targets.len(),
            status = current.status.as_str(),
            "deployment started"
        );
        Ok(current)
    }

    /// Catch a reconnected site up on deployments of one kind.
    ///
    /// Returns the number of deliveries sent.
    pub async fn process_pending_deployments_for_site(
        &self,
        kind: DeploymentKind,
        site_id: &str,
    ) -> DeployResult<u32> {
        let Some(site) = self.state.get_site(site_id)? else {
            return Ok(0);
        };

        let candidates: Vec<Deployment> = self
            .state
            .list_deployments()?
            .into_iter()
            .filter(|d| d.kind == kind && !d.status.is_terminal())
            .collect();

        let mut delivered = 0;
        for deployment in candidates {
            let targeted = match deployment.target_type {
                TargetType::Site => deployment.target_id == site_id,
                TargetType::Group => {
                    site.group_id.as_deref() == Some(deployment.target_id.as_str())
                        || deployment.sites.contains_key(site_id)
                }
            };
            if !targeted || !self.needs_delivery(&deployment, site_id).await {
                continue;
            }
            match self.deliver(&deployment, site_id).await {
                Ok(true) => delivered += 1,
                Ok(false) => break,
                Err(e) => {
                    warn!(deployment_id = %deployment.id, %site_id, error = %e, "catch-up delivery failed")
                }
            }
        }

        if delivered > 0 {
            info!(%site_id, kind = kind_name(kind), delivered, "pending deployments resumed");
        }
        Ok(delivered)
    }

    /// Record a progress report from a site.
    ///
    /// An error in the report is handled as a delivery failure. Returns
    /// `None` when the report changed nothing (unknown deployment, or the
    /// deployment or site already terminal).
    pub async fn update_progress(
        &self,
        deployment_id: &str,
        site_id: &str,
        report: ProgressReport,
    ) -> DeployResult<Option<Deployment>> {
        if let Some(error) = report.error {
            let kind = report
                .error_kind
                .unwrap_or_else(|| FailureKind::classify(&error));
            return self
                .record_failure(deployment_id, site_id, None, &error, kind)
                .await;
        }

        let now = epoch_millis();
        let progress = report.progress.min(100);
        let finished = report.completed && progress >= 100;

        let updated = self.state.update_deployment(deployment_id, |d| {
            if d.status.is_terminal() {
                return None;
            }
            let entry = d
                .sites
                .entry(site_id.to_string())
                .or_insert_with(|| SiteDelivery::pending(now));
            if entry.status.is_terminal() {
                return None;
            }
            entry.progress = progress;
            entry.updated_at = now;
            if entry.status == DeliveryStatus::Pending {
                entry.status = DeliveryStatus::Sent;
            }
            if finished {
                entry.status = DeliveryStatus::Completed;
                entry.error = None;
            }
            if d.status == DeploymentStatus::Pending {
                d.status = DeploymentStatus::InProgress;
            }
            d.recompute_progress();
            d.updated_at = now;
            Some((finished, if finished { settle(d) } else { None }))
        })?;

        let Some((deployment, Some((site_done, settled)))) = updated else {
            debug!(%deployment_id, %site_id, "progress report ignored");
            return Ok(None);
        };
        debug!(%deployment_id, %site_id, progress, "progress recorded");

        if site_done {
            info!(%deployment_id, %site_id, "site delivery completed");
            if deployment.kind == DeploymentKind::Update {
                if let Some(version) = report.version {
                    if let Err(e) = self
                        .state
                        .update_site(site_id, |s| s.software_version = Some(version))
                    {
                        warn!(%site_id, error = %e, "failed to record software version");
                    }
                }
            }
            self.notify_site_finished(&deployment, site_id).await;
        }
        if settled.is_some() {
            self.on_settled(&deployment).await;
        }
        Ok(Some(deployment))
    }

    /// Handle a failed delivery to one site.
    ///
    /// Retryable failures are re-delivered up to `max_retries` times, the
    /// count being carried by a `[retry k/max]` marker in the stored error.
    /// When `command_id` is given it must match the site's current delivery
    /// command, otherwise the failure is stale and ignored.
    pub async fn record_failure(
        &self,
        deployment_id: &str,
        site_id: &str,
        command_id: Option<&str>,
        error: &str,
        kind: FailureKind,
    ) -> DeployResult<Option<Deployment>> {
        let deployment = self.get_deployment(deployment_id)?;
        if deployment.status.is_terminal() {
            return Ok(None);
        }
        let entry = deployment.sites.get(site_id);
        if entry.is_some_and(|e| e.status.is_terminal()) {
            return Ok(None);
        }
        if let Some(cid) = command_id {
            if entry.and_then(|e| e.command_id.as_deref()) != Some(cid) {
                debug!(%deployment_id, %site_id, command_id = cid, "stale delivery failure ignored");
                return Ok(None);
            }
        }

        let previous = entry
            .and_then(|e| e.error.as_deref())
            .map(retry_count)
            .unwrap_or(0);
        let now = epoch_millis();

        if kind.is_retryable() && previous < self.max_retries {
            let attempt = previous + 1;
            let marked = with_marker(error, attempt, self.max_retries);
            let (deployment, _) = self
                .state
                .update_deployment(deployment_id, |d| {
                    let entry = d
                        .sites
                        .entry(site_id.to_string())
                        .or_insert_with(|| SiteDelivery::pending(now));
                    entry.status = DeliveryStatus::Pending;
                    entry.progress = 0;
                    entry.command_id = None;
                    entry.error = Some(marked.clone());
                    entry.updated_at = now;
                    d.recompute_progress();
                    d.updated_at = now;
                })?
                .ok_or_else(|| DeployError::NotFound(deployment_id.to_string()))?;
            warn!(%deployment_id, %site_id, attempt, max = self.max_retries, %error, "retrying delivery");

            if self.dispatcher.registry().is_connected(site_id).await {
                self.deliver(&deployment, site_id).await?;
            }
            return Ok(Some(self.get_deployment(deployment_id)?));
        }

        let stored = if previous > 0 {
            with_marker(error, previous, self.max_retries)
        } else {
            error.to_string()
        };
        let updated = self.state.update_deployment(deployment_id, |d| {
            if d.status.is_terminal() {
                return None;
            }
            let entry = d
                .sites
                .entry(site_id.to_string())
                .or_insert_with(|| SiteDelivery::pending(now));
            entry.status = DeliveryStatus::Failed;
            entry.error = Some(stored.clone());
            entry.updated_at = now;
            d.recompute_progress();
            d.updated_at = now;
            Some(settle(d))
        })?;
        let Some((deployment, Some(settled))) = updated else {
            return Ok(None);
        };

        warn!(%deployment_id, %site_id, error = %stored, retryable = kind.is_retryable(), "site delivery failed");
        self.notify_site_finished(&deployment, site_id).await;
        if settled.is_some() {
            self.on_settled(&deployment).await;
        }
        Ok(Some(deployment))
    }

    /// Cancel a deployment that has not settled yet.
    pub async fn cancel_deployment(&self, deployment_id: &str) -> DeployResult<Deployment> {
        let now = epoch_millis();
        let (deployment, changed) = self
            .state
            .update_deployment(deployment_id, |d| {
                if d.status.is_terminal() {
                    return false;
                }
                d.status = DeploymentStatus::Cancelled;
                d.updated_at = now;
                true
            })?
            .ok_or_else(|| DeployError::NotFound(deployment_id.to_string()))?;

        if !changed {
            return Err(DeployError::InvalidTransition {
                id: deployment.id,
                status: deployment.status.as_str(),
                action: "cancel",
            });
        }
        info!(%deployment_id, "deployment cancelled");
        self.on_settled(&deployment).await;
        Ok(deployment)
    }

    /// Check that `resource_id` is a live artifact deliverable as `kind`.
    ///
    /// Update packages must carry a semver version.
    pub fn validate_artifact(&self, kind: DeploymentKind, resource_id: &str) -> DeployResult<Artifact> {
        let artifact = self
            .state
            .get_artifact(resource_id)?
            .filter(|a| !a.deleted)
            .ok_or_else(|| DeployError::ArtifactNotFound(resource_id.to_string()))?;
        if artifact.kind != kind {
            return Err(DeployError::ArtifactKindMismatch {
                id: artifact.id,
                expected: kind_name(kind),
            });
        }
        if kind == DeploymentKind::Update {
            let version = artifact.version.as_deref().unwrap_or_default();
            semver::Version::parse(version)
                .map_err(|_| DeployError::InvalidVersion(version.to_string()))?;
        }
        Ok(artifact)
    }

    /// Delete a content artifact unless a deployment or live rollout still
    /// references it.
    pub async fn release_artifact(&self, resource_id: &str) {
        self.cleanup_artifact(resource_id).await;
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn get_deployment(&self, deployment_id: &str) -> DeployResult<Deployment> {
        self.state
            .get_deployment(deployment_id)?
            .ok_or_else(|| DeployError::NotFound(deployment_id.to_string()))
    }

    pub fn list_deployments(&self) -> DeployResult<Vec<Deployment>> {
        Ok(self.state.list_deployments()?)
    }

    /// Unsettled deployment of `resource_id` that includes `site_id`.
    ///
    /// Older players report content progress by video id only.
    pub fn find_active_for_resource(
        &self,
        kind: DeploymentKind,
        site_id: &str,
        resource_id: &str,
    ) -> DeployResult<Option<Deployment>> {
        Ok(self
            .state
            .list_deployments_for_resource(resource_id)?
            .into_iter()
            .filter(|d| d.kind == kind && !d.status.is_terminal())
            .find(|d| d.sites.contains_key(site_id)))
    }

    /// Concrete sites a target resolves to.
    pub fn resolve_targets(
        &self,
        target_type: TargetType,
        target_id: &str,
    ) -> DeployResult<Vec<SiteId>> {
        Ok(match target_type {
            TargetType::Site => self
                .state
                .get_site(target_id)?
                .map(|s| vec![s.id])
                .unwrap_or_default(),
            TargetType::Group => self
                .state
                .list_sites_in_group(target_id)?
                .into_iter()
                .map(|s| s.id)
                .collect(),
        })
    }

    // ── Internals ──────────────────────────────────────────────────

    /// Send the delivery command for `deployment` to one site.
    async fn deliver(&self, deployment: &Deployment, site_id: &str) -> DeployResult<bool> {
        let artifact = self
            .state
            .get_artifact(&deployment.resource_id)?
            .ok_or_else(|| DeployError::ArtifactNotFound(deployment.resource_id.clone()))?;
        let url = self.storage.public_url(&artifact.storage_path);

        let command = match deployment.kind {
            DeploymentKind::Content => Command::new(
                CommandType::DeployVideo,
                serde_json::json!({
                    "deploymentId": deployment.id,
                    "videoId": artifact.id,
                    "name": artifact.name,
                    "url": url,
                    "checksum": artifact.checksum,
                }),
            ),
            DeploymentKind::Update => Command::new(
                CommandType::UpdateSoftware,
                serde_json::json!({
                    "deploymentId": deployment.id,
                    "version": artifact.version,
                    "url": url,
                    "checksum": artifact.checksum,
                }),
            ),
        };
        let command_id = command.id.clone();

        if !self.dispatcher.send(site_id, command).await? {
            return Ok(false);
        }

        let now = epoch_millis();
        self.state.update_deployment(&deployment.id, |d| {
            let entry = d
                .sites
                .entry(site_id.to_string())
                .or_insert_with(|| SiteDelivery::pending(now));
            if !entry.status.is_terminal() {
                entry.status = DeliveryStatus::Sent;
                entry.command_id = Some(command_id.clone());
                entry.updated_at = now;
            }
            if d.status == DeploymentStatus::Pending {
                d.status = DeploymentStatus::InProgress;
            }
            d.updated_at = now;
        })?;
        info!(deployment_id = %deployment.id, %site_id, %command_id, "delivery sent");
        Ok(true)
    }

    async fn needs_delivery(&self, deployment: &Deployment, site_id: &str) -> bool {
        match deployment.sites.get(site_id) {
            None => true,
            Some(entry) => match entry.status {
                DeliveryStatus::Pending => true,
                // The command was lost (e.g. across a restart).
                DeliveryStatus::Sent => match &entry.command_id {
                    Some(cid) => !self.dispatcher.is_pending(cid).await,
                    None => true,
                },
                DeliveryStatus::Completed | DeliveryStatus::Failed => false,
            },
        }
    }

    fn fail_deployment(&self, deployment_id: &str, message: &str) -> DeployResult<Deployment> {
        let now = epoch_millis();
        let (deployment, changed) = self
            .state
            .update_deployment(deployment_id, |d| {
                if d.status.is_terminal() {
                    return false;
                }
                d.status = DeploymentStatus::Failed;
                d.error_message = Some(message.to_string());
                d.updated_at = now;
                true
            })?
            .ok_or_else(|| DeployError::NotFound(deployment_id.to_string()))?;
        if changed {
            self.events.publish(FleetEvent::DeploymentFinished {
                deployment_id: deployment_id.to_string(),
                status: deployment.status.as_str().to_string(),
            });
        }
        Ok(deployment)
    }

    async fn on_settled(&self, deployment: &Deployment) {
        info!(
            deployment_id = %deployment.id,
            status = deployment.status.as_str(),
            error = deployment.error_message.as_deref().unwrap_or(""),
            "deployment settled"
        );
        self.events.publish(FleetEvent::DeploymentFinished {
            deployment_id: deployment.id.clone(),
            status: deployment.status.as_str().to_string(),
        });
        if deployment.kind == DeploymentKind::Content
            && deployment.status == DeploymentStatus::Completed
        {
            self.cleanup_artifact(&deployment.resource_id).await;
        }
    }

    /// Delete a content artifact once nothing can still need it.
    async fn cleanup_artifact(&self, resource_id: &str) {
        let in_use = match self.artifact_in_use(resource_id) {
            Ok(in_use) => in_use,
            Err(e) => {
                warn!(%resource_id, error = %e, "could not check artifact usage");
                return;
            }
        };
        if in_use {
            debug!(%resource_id, "artifact still referenced, kept");
            return;
        }

        let artifact = match self.state.get_artifact(resource_id) {
            Ok(Some(a)) if !a.deleted => a,
            Ok(_) => return,
            Err(e) => {
                warn!(%resource_id, error = %e, "could not load artifact");
                return;
            }
        };
        match self.storage.delete(&artifact.storage_path).await {
            Ok(_) => {
                if let Err(e) = self.state.update_artifact(resource_id, |a| a.deleted = true) {
                    warn!(%resource_id, error = %e, "failed to mark artifact deleted");
                }
                info!(%resource_id, path = %artifact.storage_path, "artifact deleted");
            }
            Err(e) => warn!(%resource_id, error = %e, "failed to delete stored artifact"),
        }
    }

    /// Any unsettled deployment or live canary rollout still references it.
    fn artifact_in_use(&self, resource_id: &str) -> DeployResult<bool> {
        let pending_deployment = self
            .state
            .list_deployments_for_resource(resource_id)?
            .iter()
            .any(|d| !d.status.is_terminal());
        let live_canary = self
            .state
            .list_canaries()?
            .iter()
            .any(|c| c.resource_id == resource_id && !c.current_phase.is_terminal());
        Ok(pending_deployment || live_canary)
    }

    async fn notify_site_finished(&self, deployment: &Deployment, site_id: &str) {
        let observers = self.observers.read().await.clone();
        for observer in observers {
            observer.on_site_finished(deployment, site_id).await;
        }
    }
}

/// Settle the deployment if every site is terminal.
fn settle(d: &mut Deployment) -> Option<DeploymentStatus> {
    if d.sites.is_empty() || !d.sites.values().all(|s| s.status.is_terminal()) {
        return None;
    }
    let failures: Vec<&SiteDelivery> = d
        .sites
        .values()
        .filter(|s| s.status == DeliveryStatus::Failed)
        .collect();

    if failures.is_empty() {
        d.status = DeploymentStatus::Completed;
        d.progress = 100;
        d.error_message = None;
    } else {
        let first = failures[0].error.clone().unwrap_or_default();
        d.error_message = Some(if d.sites.len() == 1 {
            first
        } else {
            format!("{} of {} sites failed: {first}", failures.len(), d.sites.len())
        });
        d.status = DeploymentStatus::Failed;
    }
    Some(d.status)
}

fn kind_name(kind: DeploymentKind) -> &'static str {
    match kind {
        DeploymentKind::Content => "content",
        DeploymentKind::Update => "update",
    }
}

/// Delivery commands settle the site they were sent to.
#[async_trait]
impl CommandObserver for DeploymentOrchestrator {
    async fn on_command_finished(&self, outcome: &CommandOutcome) {
        if !matches!(
            outcome.command_type,
            CommandType::DeployVideo | CommandType::UpdateSoftware
        ) {
            return;
        }
        let Some(deployment_id) = outcome.payload.get("deploymentId").and_then(|v| v.as_str())
        else {
            return;
        };

        let result = match outcome.status {
            CommandStatus::Completed => {
                let current = match self.state.get_deployment(deployment_id) {
                    Ok(Some(d)) => d,
                    Ok(None) => return,
                    Err(e) => {
                        warn!(%deployment_id, error = %e, "failed to load deployment");
                        return;
                    }
                };
                let matches = current
                    .sites
                    .get(&outcome.site_id)
                    .and_then(|e| e.command_id.as_deref())
                    == Some(outcome.command_id.as_str());
                if !matches {
                    return;
                }
                let report = ProgressReport {
                    progress: 100,
                    completed: true,
                    ..Default::default()
                };
                self.update_progress(deployment_id, &outcome.site_id, report)
                    .await
                    .map(|_| ())
            }
            CommandStatus::Failed => {
                let error = outcome.error.as_deref().unwrap_or("delivery failed");
                let kind = outcome
                    .failure_kind
                    .unwrap_or_else(|| FailureKind::classify(error));
                self.record_failure(
                    deployment_id,
                    &outcome.site_id,
                    Some(&outcome.command_id),
                    error,
                    kind,
                )
                .await
                .map(|_| ())
            }
            CommandStatus::Pending | CommandStatus::Executing => return,
        };

        if let Err(e) = result {
            warn!(%deployment_id, site_id = %outcome.site_id, error = %e, "failed to apply delivery outcome");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalObjectStorage;
    use fleet_core::protocol::{
        AuthenticateRequest, CommandResult as WireResult, OutboundMessage, ResultStatus,
    };
    use fleet_registry::auth::hash_credential;
    use fleet_registry::{ConnectionRegistry, StoreAlertSink};
    use fleet_state::{Artifact, Site};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        state: StateStore,
        registry: Arc<ConnectionRegistry>,
        dispatcher: Arc<CommandDispatcher>,
        orchestrator: Arc<DeploymentOrchestrator>,
        objects: tempfile::TempDir,
    }

    fn site(id: &str, group: Option<&str>) -> Site {
        Site {
            id: id.to_string(),
            name: id.to_string(),
            group_id: group.map(str::to_string),
            secret_hash: hash_credential("secret"),
            online: false,
            last_seen: None,
            last_address: None,
            pending_config_version: None,
            desired_config: None,
            desired_config_hash: None,
            reported_config_hash: None,
            reported_config_at: None,
            software_version: None,
            created_at: 1,
        }
    }

    async fn harness() -> Harness {
        let state = StateStore::open_in_memory().unwrap();
        let events = EventBus::new();
        let sink = Arc::new(StoreAlertSink::new(state.clone(), events.clone()));
        let registry = Arc::new(ConnectionRegistry::new(state.clone(), events.clone(), sink));
        let dispatcher = Arc::new(CommandDispatcher::new(
            registry.clone(),
            state.clone(),
            events.clone(),
        ));
        let objects = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalObjectStorage::new(objects.path(), "http://cdn.test"));
        let orchestrator = Arc::new(
            DeploymentOrchestrator::new(state.clone(), dispatcher.clone(), storage, events)
                .with_max_retries(2),
        );
        dispatcher.add_observer(orchestrator.clone()).await;

        for (id, group) in [("s1", Some("north")), ("s2", Some("north")), ("s3", None)] {
            state.put_site(&site(id, group)).unwrap();
        }
        std::fs::write(objects.path().join("intro.mp4"), b"video").unwrap();
        state
            .put_artifact(&Artifact {
                id: "video-1".to_string(),
                kind: DeploymentKind::Content,
                name: "Intro".to_string(),
                storage_path: "intro.mp4".to_string(),
                version: None,
                checksum: Some("abc".to_string()),
                deleted: false,
                created_at: 1,
            })
            .unwrap();
        state
            .put_artifact(&Artifact {
                id: "pkg-2".to_string(),
                kind: DeploymentKind::Update,
                name: "player".to_string(),
                storage_path: "player-2.0.0.tar.gz".to_string(),
                version: Some("2.0.0".to_string()),
                checksum: None,
                deleted: false,
                created_at: 1,
            })
            .unwrap();

        Harness {
            state,
            registry,
            dispatcher,
            orchestrator,
            objects,
        }
    }

    async fn connect(h: &Harness, site_id: &str) -> mpsc::UnboundedReceiver<OutboundMessage> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        h.registry
            .authenticate(
                &AuthenticateRequest {
                    site_id: site_id.to_string(),
                    credential: "secret".to_string(),
                },
                None,
                tx,
            )
            .await
            .unwrap();
        let _ = rx.recv().await;
        rx
    }

    fn content_to(target_type: TargetType, target_id: &str) -> NewDeployment {
        NewDeployment {
            kind: DeploymentKind::Content,
            resource_id: "video-1".to_string(),
            target_type,
            target_id: target_id.to_string(),
            canary_id: None,
        }
    }

    fn done() -> ProgressReport {
        ProgressReport {
            progress: 100,
            completed: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn empty_group_fails_immediately() {
        let h = harness().await;
        let d = h
            .orchestrator
            .create_deployment(content_to(TargetType::Group, "nowhere"))
            .unwrap();

        let d = h.orchestrator.start_deployment(&d.id).await.unwrap();
        assert_eq!(d.status, DeploymentStatus::Failed);
        assert_eq!(d.error_message.as_deref(), Some("no target site found"));
    }

    #[tokio::test]
    async fn offline_targets_leave_deployment_pending() {
        let h = harness().await;
        let d = h
            .orchestrator
            .create_deployment(content_to(TargetType::Group, "north"))
            .unwrap();

        let d = h.orchestrator.start_deployment(&d.id).await.unwrap();
        assert_eq!(d.status, DeploymentStatus::Pending);
        assert_eq!(d.sites.len(), 2);
    }

    #[tokio::test]
    async fn connected_site_receives_delivery_with_public_url() {
        let h = harness().await;
        let mut rx = connect(&h, "s1").await;
        let d = h
            .orchestrator
            .create_deployment(content_to(TargetType::Group, "north"))
            .unwrap();

        let d = h.orchestrator.start_deployment(&d.id).await.unwrap();
        assert_eq!(d.status, DeploymentStatus::InProgress);
        assert_eq!(d.sites["s1"].status, DeliveryStatus::Sent);
        assert_eq!(d.sites["s2"].status, DeliveryStatus::Pending);

        let OutboundMessage::Command(env) = rx.recv().await.unwrap() else {
            panic!("expected a command");
        };
        assert_eq!(env.command_type, CommandType::DeployVideo);
        assert_eq!(env.data["url"], "http://cdn.test/intro.mp4");
        assert_eq!(env.data["deploymentId"], d.id.as_str());
    }

    #[tokio::test]
    async fn reconnect_catches_up_pending_delivery() {
        let h = harness().await;
        let d = h
            .orchestrator
            .create_deployment(content_to(TargetType::Site, "s3"))
            .unwrap();
        h.orchestrator.start_deployment(&d.id).await.unwrap();

        let mut rx = connect(&h, "s3").await;
        let delivered = h
            .orchestrator
            .process_pending_deployments_for_site(DeploymentKind::Content, "s3")
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert!(matches!(rx.recv().await.unwrap(), OutboundMessage::Command(_)));
        assert_eq!(
            h.orchestrator.get_deployment(&d.id).unwrap().status,
            DeploymentStatus::InProgress
        );

        // Nothing left to deliver.
        let again = h
            .orchestrator
            .process_pending_deployments_for_site(DeploymentKind::Content, "s3")
            .await
            .unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn artifact_deleted_only_after_all_siblings_settle() {
        let h = harness().await;
        let _rx1 = connect(&h, "s1").await;
        let _rx3 = connect(&h, "s3").await;
        let a = h
            .orchestrator
            .create_deployment(content_to(TargetType::Site, "s1"))
            .unwrap();
        let b = h
            .orchestrator
            .create_deployment(content_to(TargetType::Site, "s3"))
            .unwrap();
        h.orchestrator.start_deployment(&a.id).await.unwrap();
        h.orchestrator.start_deployment(&b.id).await.unwrap();

        let a = h.orchestrator.update_progress(&a.id, "s1", done()).await.unwrap().unwrap();
        assert_eq!(a.status, DeploymentStatus::Completed);
        assert!(h.objects.path().join("intro.mp4").exists());

        h.orchestrator.update_progress(&b.id, "s3", done()).await.unwrap();
        assert!(!h.objects.path().join("intro.mp4").exists());
        assert!(h.state.get_artifact("video-1").unwrap().unwrap().deleted);
    }

    #[tokio::test]
    async fn partial_progress_is_aggregated() {
        let h = harness().await;
        let _rx1 = connect(&h, "s1").await;
        let _rx2 = connect(&h, "s2").await;
        let d = h
            .orchestrator
            .create_deployment(content_to(TargetType::Group, "north"))
            .unwrap();
        h.orchestrator.start_deployment(&d.id).await.unwrap();

        let report = ProgressReport {
            progress: 50,
            ..Default::default()
        };
        let d = h.orchestrator.update_progress(&d.id, "s1", report).await.unwrap().unwrap();
        assert_eq!(d.progress, 25);
        assert_eq!(d.status, DeploymentStatus::InProgress);

        let d = h.orchestrator.update_progress(&d.id, "s1", done()).await.unwrap().unwrap();
        assert_eq!(d.status, DeploymentStatus::InProgress);
        let d = h.orchestrator.update_progress(&d.id, "s2", done()).await.unwrap().unwrap();
        assert_eq!(d.status, DeploymentStatus::Completed);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_with_marker() {
        let h = harness().await;
        let mut rx = connect(&h, "s1").await;
        let d = h
            .orchestrator
            .create_deployment(content_to(TargetType::Site, "s1"))
            .unwrap();
        h.orchestrator.start_deployment(&d.id).await.unwrap();
        let _ = rx.recv().await;

        let failing = ProgressReport {
            error: Some("ECONNRESET".to_string()),
            ..Default::default()
        };
        let d = h
            .orchestrator
            .update_progress(&d.id, "s1", failing.clone())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(d.status, DeploymentStatus::InProgress);
        assert_eq!(d.sites["s1"].error.as_deref(), Some("[retry 1/2] ECONNRESET"));
        assert_eq!(d.sites["s1"].status, DeliveryStatus::Sent);
        assert!(matches!(rx.recv().await.unwrap(), OutboundMessage::Command(_)));

        h.orchestrator.update_progress(&d.id, "s1", failing.clone()).await.unwrap();
        let d = h
            .orchestrator
            .update_progress(&d.id, "s1", failing)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(d.status, DeploymentStatus::Failed);
        assert_eq!(d.error_message.as_deref(), Some("[retry 2/2] ECONNRESET"));
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let h = harness().await;
        let mut rx = connect(&h, "s1").await;
        let d = h
            .orchestrator
            .create_deployment(content_to(TargetType::Site, "s1"))
            .unwrap();
        h.orchestrator.start_deployment(&d.id).await.unwrap();
        let OutboundMessage::Command(env) = rx.recv().await.unwrap() else {
            panic!("expected a command");
        };

        h.dispatcher
            .on_result(
                "s1",
                WireResult {
                    command_id: env.id,
                    status: ResultStatus::Failed,
                    result: None,
                    error: Some("permission denied writing /media".to_string()),
                    error_kind: None,
                },
            )
            .await
            .unwrap();

        let d = h.orchestrator.get_deployment(&d.id).unwrap();
        assert_eq!(d.status, DeploymentStatus::Failed);
        assert_eq!(d.error_message.as_deref(), Some("permission denied writing /media"));
        assert!(tokio::time::timeout(Duration::from_millis(20), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn completed_command_settles_site() {
        let h = harness().await;
        let mut rx = connect(&h, "s1").await;
        let d = h
            .orchestrator
            .create_deployment(content_to(TargetType::Site, "s1"))
            .unwrap();
        h.orchestrator.start_deployment(&d.id).await.unwrap();
        let OutboundMessage::Command(env) = rx.recv().await.unwrap() else {
            panic!("expected a command");
        };

        h.dispatcher
            .on_result(
                "s1",
                WireResult {
                    command_id: env.id,
                    status: ResultStatus::Completed,
                    result: None,
                    error: None,
                    error_kind: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(
            h.orchestrator.get_deployment(&d.id).unwrap().status,
            DeploymentStatus::Completed
        );
    }

    #[tokio::test]
    async fn cancel_only_from_open_states() {
        let h = harness().await;
        let d = h
            .orchestrator
            .create_deployment(content_to(TargetType::Site, "s3"))
            .unwrap();

        let d = h.orchestrator.cancel_deployment(&d.id).await.unwrap();
        assert_eq!(d.status, DeploymentStatus::Cancelled);

        let err = h.orchestrator.cancel_deployment(&d.id).await.unwrap_err();
        assert!(matches!(err, DeployError::InvalidTransition { status: "cancelled", .. }));
        assert!(matches!(
            h.orchestrator.cancel_deployment("missing").await,
            Err(DeployError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn update_records_installed_version() {
        let h = harness().await;
        let _rx = connect(&h, "s1").await;
        let d = h
            .orchestrator
            .create_deployment(NewDeployment {
                kind: DeploymentKind::Update,
                resource_id: "pkg-2".to_string(),
                target_type: TargetType::Site,
                target_id: "s1".to_string(),
                canary_id: None,
            })
            .unwrap();
        h.orchestrator.start_deployment(&d.id).await.unwrap();

        let report = ProgressReport {
            version: Some("2.0.0".to_string()),
            ..done()
        };
        h.orchestrator.update_progress(&d.id, "s1", report).await.unwrap();
        assert_eq!(
            h.state.get_site("s1").unwrap().unwrap().software_version.as_deref(),
            Some("2.0.0")
        );
    }

    #[tokio::test]
    async fn create_validates_artifact() {
        let h = harness().await;

        let wrong_kind = NewDeployment {
            kind: DeploymentKind::Update,
            ..content_to(TargetType::Site, "s1")
        };
        assert!(matches!(
            h.orchestrator.create_deployment(wrong_kind),
            Err(DeployError::ArtifactKindMismatch { .. })
        ));

        let missing = NewDeployment {
            resource_id: "nope".to_string(),
            ..content_to(TargetType::Site, "s1")
        };
        assert!(matches!(
            h.orchestrator.create_deployment(missing),
            Err(DeployError::ArtifactNotFound(_))
        ));

        h.state
            .update_artifact("pkg-2", |a| a.version = Some("two".to_string()))
            .unwrap();
        let bad_version = NewDeployment {
            kind: DeploymentKind::Update,
            resource_id: "pkg-2".to_string(),
            ..content_to(TargetType::Site, "s1")
        };
        assert!(matches!(
            h.orchestrator.create_deployment(bad_version),
            Err(DeployError::InvalidVersion(_))
        ));
    }
}
