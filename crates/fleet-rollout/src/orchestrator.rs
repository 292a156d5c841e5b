//! Canary deployment orchestrator.
//!
//! A rollout moves `canary → gradual → full → completed`, or exits to
//! `rolled_back` when the success rate of the sites reached so far drops
//! below the threshold. Every targeted site gets its own single-site
//! deployment through [`DeploymentOrchestrator`]; the rollout learns about
//! outcomes as a [`DeploymentObserver`].
//!
//! Phase changes are compare-and-set writes on the stored row, so a manual
//! advance racing a stability check cannot apply the same step twice, and
//! a site is claimed (its `dispatched_at` set) before it is deployed to so
//! no site is ever targeted twice.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use fleet_commands::{CommandQueue, QueueOptions, QueueOutcome};
use fleet_core::{CommandType, EventBus, FleetEvent, epoch_millis};
use fleet_deploy::{DeployError, DeploymentObserver, DeploymentOrchestrator, NewDeployment};
use fleet_state::{
    CanaryDeployment, CanaryId, CanaryPhase, DeliveryStatus, Deployment, DeploymentKind,
    DeploymentStatus, SiteDeploymentStatus, SiteRolloutStatus, StateStore, TargetType,
};

use crate::controller::{RolloutMetrics, StepPlan, plan_next_step, select_canary};
use crate::error::{RolloutError, RolloutResult};
use crate::strategy::{self, CanaryConfig};
use crate::timers::StabilityTimers;

/// Request to create a canary rollout.
#[derive(Debug, Clone)]
pub struct NewCanary {
    pub deployment_type: DeploymentKind,
    pub resource_id: String,
    pub target_type: TargetType,
    pub target_id: String,
    /// Defaults apply when unset.
    pub config: Option<CanaryConfig>,
    pub created_by: String,
}

/// Result of an advance attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdvanceOutcome {
    pub advanced: bool,
    pub phase: CanaryPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

enum RollbackTransition {
    Applied,
    AlreadyRolledBack,
    Refused,
}

pub struct CanaryDeploymentOrchestrator {
    state: StateStore,
    deployments: Arc<DeploymentOrchestrator>,
    queue: Arc<CommandQueue>,
    events: EventBus,
    timers: StabilityTimers,
    /// Canary ids whose stability period elapsed, drained by
    /// [`run_stability_checks`](Self::run_stability_checks).
    due_tx: mpsc::UnboundedSender<CanaryId>,
    due_rx: Mutex<Option<mpsc::UnboundedReceiver<CanaryId>>>,
}

impl CanaryDeploymentOrchestrator {
    pub fn new(
        state: StateStore,
        deployments: Arc<DeploymentOrchestrator>,
        queue: Arc<CommandQueue>,
        events: EventBus,
    ) -> Self {
        let (due_tx, due_rx) = mpsc::unbounded_channel();
        Self {
            state,
            deployments,
            queue,
            events,
            timers: StabilityTimers::new(),
            due_tx,
            due_rx: Mutex::new(Some(due_rx)),
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Validate the request, pick the canary sites and persist the rollout.
    ///
    /// Nothing is deployed until [`start_canary`](Self::start_canary).
    pub fn create(&self, request: NewCanary) -> RolloutResult<CanaryDeployment> {
        let config = request.config.unwrap_or_default();
        strategy::validate(&config)?;
        self.deployments
            .validate_artifact(request.deployment_type, &request.resource_id)?;

        let targets = self
            .deployments
            .resolve_targets(request.target_type, &request.target_id)?;
        if targets.is_empty() {
            return Err(RolloutError::NoTargets(request.target_id));
        }
        let total = targets.len() as u32;
        let config = strategy::normalize(&config, total);

        let canary_sites: HashSet<String> =
            select_canary(&targets, config.canary_percentage, &mut rand::thread_rng())
                .into_iter()
                .collect();

        let now = epoch_millis();
        let canary = CanaryDeployment {
            id: uuid::Uuid::new_v4().to_string(),
            deployment_type: request.deployment_type,
            resource_id: request.resource_id,
            target_type: request.target_type,
            target_id: request.target_id,
            config,
            current_phase: CanaryPhase::Canary,
            current_step: 0,
            total_sites: total,
            rollback_reason: None,
            created_by: request.created_by,
            created_at: now,
            updated_at: now,
        };
        self.state.put_canary(&canary)?;

        for site_id in &targets {
            let site_name = self
                .state
                .get_site(site_id)?
                .map(|s| s.name)
                .unwrap_or_else(|| site_id.clone());
            self.state.put_canary_site(&SiteDeploymentStatus {
                canary_id: canary.id.clone(),
                site_id: site_id.clone(),
                site_name,
                phase: if canary_sites.contains(site_id) {
                    CanaryPhase::Canary
                } else {
                    CanaryPhase::Gradual
                },
                status: SiteRolloutStatus::Pending,
                dispatched_at: None,
                deployed_at: None,
                error_message: None,
                deployment_id: None,
                rollback_sent: false,
            })?;
        }

        info!(
            canary_id = %canary.id,
            resource_id = %canary.resource_id,
            total_sites = total,
            canary_sites = canary_sites.len(),
            "canary rollout created"
        );
        self.publish_phase(&canary.id, CanaryPhase::Canary);
        Ok(canary)
    }

    /// Deploy to the canary sites and arm the first stability check.
    pub async fn start_canary(&self, canary_id: &str) -> RolloutResult<CanaryDeployment> {
        let canary = self.get(canary_id)?;
        if canary.current_phase != CanaryPhase::Canary {
            return Err(RolloutError::InvalidPhase {
                id: canary.id,
                phase: canary.current_phase.as_str(),
                action: "start",
            });
        }

        let waiting: Vec<SiteDeploymentStatus> = self
            .state
            .list_canary_sites(canary_id)?
            .into_iter()
            .filter(|s| s.phase == CanaryPhase::Canary && s.dispatched_at.is_none())
            .collect();

        let mut dispatched = 0;
        for site in &waiting {
            if self.dispatch_site(&canary, &site.site_id, CanaryPhase::Canary).await? {
                dispatched += 1;
            }
            if self.get(canary_id)?.current_phase.is_terminal() {
                break;
            }
        }

        let canary = self.get(canary_id)?;
        if canary.config.auto_advance && !canary.current_phase.is_terminal() {
            self.schedule_check(&canary).await;
        }
        info!(%canary_id, dispatched, "canary wave started");
        Ok(canary)
    }

    /// Evaluate the current wave and widen the rollout by one step.
    ///
    /// A success rate below the threshold rolls the rollout back instead.
    pub async fn advance(&self, canary_id: &str) -> RolloutResult<AdvanceOutcome> {
        self.timers.cancel(canary_id).await;

        let canary = self.get(canary_id)?;
        if canary.current_phase.is_terminal() {
            return Err(RolloutError::InvalidPhase {
                id: canary.id,
                phase: canary.current_phase.as_str(),
                action: "advance",
            });
        }

        let sites = self.state.list_canary_sites(canary_id)?;
        let metrics = RolloutMetrics::from_sites(&sites);
        if metrics.success_rate < canary.config.success_threshold {
            let reason = below_threshold(metrics.success_rate, canary.config.success_threshold);
            let canary = self.rollback(canary_id, &reason).await?;
            return Ok(AdvanceOutcome {
                advanced: false,
                phase: canary.current_phase,
                reason: Some(reason),
            });
        }

        let (step, phase, target_percentage, additional) =
            match plan_next_step(&canary, metrics.targeted_sites) {
                StepPlan::Complete => {
                    let canary = self.complete(canary_id).await?;
                    return Ok(AdvanceOutcome {
                        advanced: true,
                        phase: canary.current_phase,
                        reason: None,
                    });
                }
                StepPlan::Deploy {
                    step,
                    phase,
                    target_percentage,
                    additional,
                } => (step, phase, target_percentage, additional),
            };

        let now = epoch_millis();
        let (canary, moved) = self
            .state
            .update_canary(canary_id, |c| {
                if c.current_phase != canary.current_phase
                    || c.current_step != canary.current_step
                    || !c.current_phase.can_transition_to(phase)
                {
                    return false;
                }
                c.current_phase = phase;
                c.current_step = step;
                c.updated_at = now;
                true
            })?
            .ok_or_else(|| RolloutError::NotFound(canary_id.to_string()))?;
        if !moved {
            debug!(%canary_id, "rollout changed while advancing, step skipped");
            return Ok(AdvanceOutcome {
                advanced: false,
                phase: canary.current_phase,
                reason: Some("rollout changed concurrently".to_string()),
            });
        }
        self.publish_phase(canary_id, phase);

        let mut dispatched = 0;
        for site in sites
            .iter()
            .filter(|s| s.dispatched_at.is_none())
            .take(additional as usize)
        {
            if self.dispatch_site(&canary, &site.site_id, phase).await? {
                dispatched += 1;
            }
            if self.get(canary_id)?.current_phase.is_terminal() {
                break;
            }
        }
        info!(
            %canary_id,
            phase = phase.as_str(),
            step,
            target_percentage,
            dispatched,
            "rollout advanced"
        );

        let canary = self.get(canary_id)?;
        if canary.current_phase == CanaryPhase::Full {
            self.settle_if_done(&canary).await?;
        } else if canary.config.auto_advance && !canary.current_phase.is_terminal() {
            self.schedule_check(&canary).await;
        }

        Ok(AdvanceOutcome {
            advanced: true,
            phase: self.get(canary_id)?.current_phase,
            reason: None,
        })
    }

    /// Stop the rollout and revert what can be reverted.
    ///
    /// Unsettled per-site deployments are cancelled, and for software
    /// updates every site that already installed the package is told to
    /// roll back, once. Rolling back an already rolled back rollout is a
    /// no-op apart from retrying rollback commands that could not be sent.
    pub async fn rollback(&self, canary_id: &str, reason: &str) -> RolloutResult<CanaryDeployment> {
        self.timers.cancel(canary_id).await;

        let now = epoch_millis();
        let (canary, transition) = self
            .state
            .update_canary(canary_id, |c| match c.current_phase {
                CanaryPhase::RolledBack => RollbackTransition::AlreadyRolledBack,
                CanaryPhase::Completed | CanaryPhase::Failed => RollbackTransition::Refused,
                _ => {
                    c.current_phase = CanaryPhase::RolledBack;
                    c.rollback_reason = Some(reason.to_string());
                    c.updated_at = now;
                    RollbackTransition::Applied
                }
            })?
            .ok_or_else(|| RolloutError::NotFound(canary_id.to_string()))?;

        match transition {
            RollbackTransition::Refused => {
                return Err(RolloutError::InvalidPhase {
                    id: canary.id,
                    phase: canary.current_phase.as_str(),
                    action: "roll back",
                });
            }
            RollbackTransition::AlreadyRolledBack => {
                debug!(%canary_id, "rollout already rolled back");
            }
            RollbackTransition::Applied => {
                warn!(%canary_id, %reason, "rollout rolled back");
                self.publish_phase(canary_id, CanaryPhase::RolledBack);
                self.cancel_unsettled(canary_id).await?;
            }
        }

        self.send_rollbacks(&canary).await?;
        Ok(canary)
    }

    /// Record a site's outcome.
    ///
    /// A site reports once; repeated or late reports are ignored. Returns
    /// the updated row when the report was applied.
    pub async fn update_site_status(
        &self,
        canary_id: &str,
        site_id: &str,
        success: bool,
        error: Option<String>,
    ) -> RolloutResult<Option<SiteDeploymentStatus>> {
        let now = epoch_millis();
        let updated = self.state.update_canary_site(canary_id, site_id, |s| {
            if s.status != SiteRolloutStatus::Pending {
                return false;
            }
            if success {
                s.status = SiteRolloutStatus::Deployed;
                s.deployed_at = Some(now);
                s.error_message = None;
            } else {
                s.status = SiteRolloutStatus::Failed;
                s.error_message = error.clone();
            }
            true
        })?;
        let Some((row, true)) = updated else {
            debug!(%canary_id, %site_id, "site status report ignored");
            return Ok(None);
        };

        let canary = self.get(canary_id)?;
        if success {
            info!(%canary_id, %site_id, phase = row.phase.as_str(), "site deployed");
        } else {
            warn!(
                %canary_id,
                %site_id,
                error = row.error_message.as_deref().unwrap_or(""),
                "site deployment failed"
            );
        }

        match canary.current_phase {
            CanaryPhase::Canary if !success && canary.config.auto_advance => {
                let metrics = self.get_metrics(canary_id)?;
                if metrics.success_rate < canary.config.success_threshold {
                    let reason =
                        below_threshold(metrics.success_rate, canary.config.success_threshold);
                    self.rollback(canary_id, &reason).await?;
                }
            }
            CanaryPhase::Full => self.settle_if_done(&canary).await?,
            // Installed after the rollout was stopped.
            CanaryPhase::RolledBack if success => {
                self.send_rollbacks(&canary).await?;
            }
            _ => {}
        }
        Ok(Some(row))
    }

    /// Cancel every stability check (for graceful shutdown).
    pub async fn shutdown(&self) {
        self.timers.cancel_all().await;
    }

    /// Advance rollouts whose stability period elapsed, until shutdown.
    ///
    /// Only one such loop can run per orchestrator.
    pub async fn run_stability_checks(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(mut due) = self.due_rx.lock().await.take() else {
            warn!("stability check loop already running");
            return;
        };
        loop {
            tokio::select! {
                Some(canary_id) = due.recv() => {
                    match self.advance(&canary_id).await {
                        Ok(outcome) => info!(
                            %canary_id,
                            advanced = outcome.advanced,
                            phase = outcome.phase.as_str(),
                            "stability check evaluated"
                        ),
                        Err(e) => warn!(%canary_id, error = %e, "stability check failed"),
                    }
                }
                _ = shutdown.changed() => {
                    debug!("stability check loop shutting down");
                    break;
                }
            }
        }
        self.shutdown().await;
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn get(&self, canary_id: &str) -> RolloutResult<CanaryDeployment> {
        self.state
            .get_canary(canary_id)?
            .ok_or_else(|| RolloutError::NotFound(canary_id.to_string()))
    }

    pub fn list(&self) -> RolloutResult<Vec<CanaryDeployment>> {
        Ok(self.state.list_canaries()?)
    }

    pub fn list_sites(&self, canary_id: &str) -> RolloutResult<Vec<SiteDeploymentStatus>> {
        self.get(canary_id)?;
        Ok(self.state.list_canary_sites(canary_id)?)
    }

    pub fn get_metrics(&self, canary_id: &str) -> RolloutResult<RolloutMetrics> {
        Ok(RolloutMetrics::from_sites(&self.list_sites(canary_id)?))
    }

    pub async fn has_pending_check(&self, canary_id: &str) -> bool {
        self.timers.is_scheduled(canary_id).await
    }

    // ── Internals ──────────────────────────────────────────────────

    /// Claim one site for the current wave and start its deployment.
    ///
    /// Returns `false` when the site was already claimed.
    async fn dispatch_site(
        &self,
        canary: &CanaryDeployment,
        site_id: &str,
        phase: CanaryPhase,
    ) -> RolloutResult<bool> {
        let now = epoch_millis();
        let claimed = self
            .state
            .update_canary_site(&canary.id, site_id, |s| {
                if s.dispatched_at.is_some() {
                    return false;
                }
                s.dispatched_at = Some(now);
                s.phase = phase;
                true
            })?
            .is_some_and(|(_, claimed)| claimed);
        if !claimed {
            return Ok(false);
        }

        let deployment = match self.deployments.create_deployment(NewDeployment {
            kind: canary.deployment_type,
            resource_id: canary.resource_id.clone(),
            target_type: TargetType::Site,
            target_id: site_id.to_string(),
            canary_id: Some(canary.id.clone()),
        }) {
            Ok(d) => d,
            Err(e) => {
                self.update_site_status(&canary.id, site_id, false, Some(e.to_string()))
                    .await?;
                return Ok(true);
            }
        };
        self.state.update_canary_site(&canary.id, site_id, |s| {
            s.deployment_id = Some(deployment.id.clone());
        })?;

        match self.deployments.start_deployment(&deployment.id).await {
            Ok(d) if d.status == DeploymentStatus::Failed => {
                let error = d.error_message.unwrap_or_else(|| "deployment failed".to_string());
                self.update_site_status(&canary.id, site_id, false, Some(error))
                    .await?;
            }
            Ok(_) => {}
            Err(e) => {
                self.update_site_status(&canary.id, site_id, false, Some(e.to_string()))
                    .await?;
            }
        }
        debug!(canary_id = %canary.id, %site_id, deployment_id = %deployment.id, "site targeted");
        Ok(true)
    }

    /// In the full phase, finish once every site has reported.
    async fn settle_if_done(&self, canary: &CanaryDeployment) -> RolloutResult<()> {
        let metrics = self.get_metrics(&canary.id)?;
        if !metrics.all_settled() {
            return Ok(());
        }
        if metrics.success_rate < canary.config.success_threshold {
            let reason = below_threshold(metrics.success_rate, canary.config.success_threshold);
            self.rollback(&canary.id, &reason).await?;
        } else {
            self.complete(&canary.id).await?;
        }
        Ok(())
    }

    async fn complete(&self, canary_id: &str) -> RolloutResult<CanaryDeployment> {
        self.timers.cancel(canary_id).await;

        let now = epoch_millis();
        let (canary, changed) = self
            .state
            .update_canary(canary_id, |c| {
                if c.current_phase.is_terminal() {
                    return false;
                }
                c.current_phase = CanaryPhase::Completed;
                c.updated_at = now;
                true
            })?
            .ok_or_else(|| RolloutError::NotFound(canary_id.to_string()))?;
        if changed {
            info!(%canary_id, "rollout completed");
            self.publish_phase(canary_id, CanaryPhase::Completed);
            if canary.deployment_type == DeploymentKind::Content {
                self.deployments.release_artifact(&canary.resource_id).await;
            }
        }
        Ok(canary)
    }

    async fn cancel_unsettled(&self, canary_id: &str) -> RolloutResult<()> {
        for site in self.state.list_canary_sites(canary_id)? {
            let Some(deployment_id) = site.deployment_id else {
                continue;
            };
            if site.status != SiteRolloutStatus::Pending {
                continue;
            }
            match self.deployments.cancel_deployment(&deployment_id).await {
                Ok(_) => debug!(%canary_id, %deployment_id, "site deployment cancelled"),
                Err(DeployError::InvalidTransition { .. }) => {}
                Err(e) => warn!(%canary_id, %deployment_id, error = %e, "could not cancel site deployment"),
            }
        }
        Ok(())
    }

    /// Send `rollback_update` to every deployed site not yet told to.
    ///
    /// Offline sites get it through the offline queue.
    async fn send_rollbacks(&self, canary: &CanaryDeployment) -> RolloutResult<u32> {
        if canary.deployment_type != DeploymentKind::Update {
            return Ok(0);
        }

        let mut sent = 0;
        for site in self.state.list_canary_sites(&canary.id)? {
            if site.status != SiteRolloutStatus::Deployed || site.rollback_sent {
                continue;
            }
            let claimed = self
                .state
                .update_canary_site(&canary.id, &site.site_id, |s| {
                    !std::mem::replace(&mut s.rollback_sent, true)
                })?
                .is_some_and(|(_, claimed)| claimed);
            if !claimed {
                continue;
            }

            let payload = serde_json::json!({
                "canaryId": canary.id,
                "resourceId": canary.resource_id,
                "reason": canary.rollback_reason,
            });
            let options = QueueOptions {
                priority: Some(1),
                description: Some(format!("rollback of canary {}", canary.id)),
                ..Default::default()
            };
            match self
                .queue
                .send_or_queue(&site.site_id, CommandType::RollbackUpdate, payload, options)
                .await
            {
                Ok(QueueOutcome::Rejected { reason }) => {
                    warn!(canary_id = %canary.id, site_id = %site.site_id, %reason, "rollback command rejected");
                    self.unmark_rollback(&canary.id, &site.site_id);
                }
                Ok(outcome) => {
                    debug!(canary_id = %canary.id, site_id = %site.site_id, ?outcome, "rollback command issued");
                    sent += 1;
                }
                Err(e) => {
                    warn!(canary_id = %canary.id, site_id = %site.site_id, error = %e, "rollback command failed");
                    self.unmark_rollback(&canary.id, &site.site_id);
                }
            }
        }
        if sent > 0 {
            info!(canary_id = %canary.id, sent, "rollback commands issued");
        }
        Ok(sent)
    }

    fn unmark_rollback(&self, canary_id: &str, site_id: &str) {
        if let Err(e) = self
            .state
            .update_canary_site(canary_id, site_id, |s| s.rollback_sent = false)
        {
            warn!(%canary_id, %site_id, error = %e, "could not reset rollback marker");
        }
    }

    async fn schedule_check(&self, canary: &CanaryDeployment) {
        let due = self.due_tx.clone();
        let id = canary.id.clone();
        self.timers
            .schedule(
                &canary.id,
                Duration::from_millis(canary.config.stability_period_ms),
                async move {
                    let _ = due.send(id);
                },
            )
            .await;
    }

    fn publish_phase(&self, canary_id: &str, phase: CanaryPhase) {
        self.events.publish(FleetEvent::CanaryPhaseChanged {
            canary_id: canary_id.to_string(),
            phase: phase.as_str().to_string(),
        });
    }
}

fn below_threshold(rate: f64, threshold: f64) -> String {
    format!("success rate below threshold: {rate:.1}% < {threshold}%")
}

/// Per-site deployments created by a rollout report back here.
#[async_trait]
impl DeploymentObserver for CanaryDeploymentOrchestrator {
    async fn on_site_finished(&self, deployment: &Deployment, site_id: &str) {
        let Some(canary_id) = deployment.canary_id.as_deref() else {
            return;
        };
        let Some(entry) = deployment.sites.get(site_id) else {
            return;
        };
        let (success, error) = match entry.status {
            DeliveryStatus::Completed => (true, None),
            DeliveryStatus::Failed => (false, entry.error.clone()),
            DeliveryStatus::Pending | DeliveryStatus::Sent => return,
        };
        if let Err(e) = self
            .update_site_status(canary_id, site_id, success, error)
            .await
        {
            warn!(%canary_id, %site_id, error = %e, "failed to record rollout outcome");
        }
    }
}
