//! Reconnect hooks that resume deliveries for a site that came back.

use std::sync::Arc;

use async_trait::async_trait;

use fleet_registry::ReconnectHook;
use fleet_state::DeploymentKind;

use crate::orchestrator::DeploymentOrchestrator;

/// Resumes unsettled deployments of one kind for a reconnected site.
pub struct PendingDeploymentsHook {
    orchestrator: Arc<DeploymentOrchestrator>,
    kind: DeploymentKind,
}

impl PendingDeploymentsHook {
    pub fn new(orchestrator: Arc<DeploymentOrchestrator>, kind: DeploymentKind) -> Self {
        Self { orchestrator, kind }
    }
}

#[async_trait]
impl ReconnectHook for PendingDeploymentsHook {
    fn name(&self) -> &'static str {
        match self.kind {
            DeploymentKind::Content => "content_deployments",
            DeploymentKind::Update => "update_deployments",
        }
    }

    async fn on_reconnect(&self, site_id: &str) -> anyhow::Result<()> {
        self.orchestrator
            .process_pending_deployments_for_site(self.kind, site_id)
            .await?;
        Ok(())
    }
}
