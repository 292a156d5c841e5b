//! Row types for the Fleetgrid state store.
//!
//! These types are the persisted shape of sites, commands, deployments,
//! and canary rollouts. All are serializable to/from JSON for storage in
//! redb tables. Fields added after the first release carry
//! `#[serde(default)]` so rows written by older builds still decode.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use fleet_core::{CommandType, FailureKind, protocol::HeartbeatMetrics};

pub type SiteId = String;
pub type CommandId = String;
pub type DeploymentId = String;
pub type CanaryId = String;

// ── Site ──────────────────────────────────────────────────────────

/// A remote edge device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Site {
    pub id: SiteId,
    pub name: String,
    /// Group the site belongs to, if any.
    #[serde(default)]
    pub group_id: Option<String>,
    /// Hex SHA-256 of the site credential.
    pub secret_hash: String,
    /// Last persisted liveness. The connection registry is authoritative.
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub last_seen: Option<u64>,
    #[serde(default)]
    pub last_address: Option<String>,
    /// Configuration version pushed but not yet acknowledged.
    #[serde(default)]
    pub pending_config_version: Option<u64>,
    /// Configuration the site should be running.
    #[serde(default)]
    pub desired_config: Option<serde_json::Value>,
    #[serde(default)]
    pub desired_config_hash: Option<String>,
    /// Configuration hash last reported by the site.
    #[serde(default)]
    pub reported_config_hash: Option<String>,
    #[serde(default)]
    pub reported_config_at: Option<u64>,
    /// Software version last reported by an update.
    #[serde(default)]
    pub software_version: Option<String>,
    pub created_at: u64,
}

/// One heartbeat metrics sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatSample {
    pub site_id: SiteId,
    pub recorded_at: u64,
    pub metrics: HeartbeatMetrics,
}

// ── Alerts ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Offline,
    HighTemperature,
    LowDisk,
    HighMemory,
}

impl AlertType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::HighTemperature => "high_temperature",
            Self::LowDisk => "low_disk",
            Self::HighMemory => "high_memory",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub id: String,
    pub site_id: SiteId,
    pub alert_type: AlertType,
    pub message: String,
    pub created_at: u64,
}

impl Alert {
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.site_id, self.id)
    }
}

// ── Command log ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Persisted record of a command sent to a site.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteCommand {
    pub id: CommandId,
    pub site_id: SiteId,
    pub command_type: CommandType,
    pub payload: serde_json::Value,
    pub status: CommandStatus,
    pub timeout_ms: u64,
    pub created_at: u64,
    #[serde(default)]
    pub sent_at: Option<u64>,
    #[serde(default)]
    pub completed_at: Option<u64>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub failure_kind: Option<FailureKind>,
}

// ── Offline queue ─────────────────────────────────────────────────

/// A command parked until its site reconnects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingCommand {
    pub id: String,
    pub site_id: SiteId,
    pub command_type: CommandType,
    pub payload: serde_json::Value,
    /// 1 = urgent, 10 = low.
    pub priority: u8,
    pub created_at: u64,
    /// Absolute expiry; `None` never expires.
    #[serde(default)]
    pub expires_at: Option<u64>,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub description: Option<String>,
}

impl PendingCommand {
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.site_id, self.id)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

// ── Deployments ───────────────────────────────────────────────────

/// What a deployment delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentKind {
    /// A video for the player.
    Content,
    /// A player software package.
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Site,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl DeploymentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Delivery state of one site within a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Not yet handed to the site.
    Pending,
    /// Delivery command sent, waiting for progress.
    Sent,
    Completed,
    Failed,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SiteDelivery {
    pub status: DeliveryStatus,
    pub progress: u8,
    #[serde(default)]
    pub command_id: Option<CommandId>,
    #[serde(default)]
    pub error: Option<String>,
    pub updated_at: u64,
}

impl SiteDelivery {
    pub fn pending(now: u64) -> Self {
        Self {
            status: DeliveryStatus::Pending,
            progress: 0,
            command_id: None,
            error: None,
            updated_at: now,
        }
    }
}

/// A request to deliver one artifact to a site or a group of sites.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: DeploymentId,
    pub kind: DeploymentKind,
    /// Artifact being delivered.
    pub resource_id: String,
    pub target_type: TargetType,
    pub target_id: String,
    pub status: DeploymentStatus,
    /// Aggregate progress (0-100).
    pub progress: u8,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Canary rollout this deployment belongs to.
    #[serde(default)]
    pub canary_id: Option<CanaryId>,
    /// Per-site delivery state, filled as targets resolve.
    #[serde(default)]
    pub sites: BTreeMap<SiteId, SiteDelivery>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Deployment {
    /// Recompute aggregate progress from per-site progress.
    pub fn recompute_progress(&mut self) {
        if self.sites.is_empty() {
            return;
        }
        let sum: u32 = self.sites.values().map(|s| s.progress as u32).sum();
        self.progress = (sum / self.sites.len() as u32).min(100) as u8;
    }
}

/// A stored object a deployment delivers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub id: String,
    pub kind: DeploymentKind,
    pub name: String,
    /// Path inside object storage.
    pub storage_path: String,
    /// Package version, for software updates.
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    pub created_at: u64,
}

// ── Canary rollouts ───────────────────────────────────────────────

/// Phase of a canary rollout.
///
/// Ordered: `Canary < Gradual < Full < Completed`. `Failed` and
/// `RolledBack` are terminal exits reachable from any non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanaryPhase {
    Canary,
    Gradual,
    Full,
    Completed,
    Failed,
    RolledBack,
}

impl CanaryPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }

    /// Position along the forward path.
    pub fn rank(self) -> u8 {
        match self {
            Self::Canary => 0,
            Self::Gradual => 1,
            Self::Full => 2,
            Self::Completed | Self::Failed | Self::RolledBack => 3,
        }
    }

    /// Whether moving to `next` respects the phase ordering.
    pub fn can_transition_to(self, next: CanaryPhase) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Canary => "canary",
            Self::Gradual => "gradual",
            Self::Full => "full",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }
}

/// Rollout parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CanaryConfig {
    /// Share of sites in the first wave (0-100).
    pub canary_percentage: u32,
    /// Cumulative target percentages after the canary wave.
    pub gradual_steps: Vec<u32>,
    /// Wait before evaluating a wave.
    pub stability_period_ms: u64,
    /// Minimum success rate (0-100) required to advance.
    pub success_threshold: f64,
    /// Advance automatically after each stability period.
    pub auto_advance: bool,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            canary_percentage: 10,
            gradual_steps: vec![25, 50, 75, 100],
            stability_period_ms: 30 * 60 * 1000,
            success_threshold: 95.0,
            auto_advance: true,
        }
    }
}

/// A staged rollout of one artifact across a set of sites.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanaryDeployment {
    pub id: CanaryId,
    pub deployment_type: DeploymentKind,
    pub resource_id: String,
    pub target_type: TargetType,
    pub target_id: String,
    pub config: CanaryConfig,
    pub current_phase: CanaryPhase,
    /// Index into `config.gradual_steps` of the last executed step.
    pub current_step: usize,
    /// Number of target sites resolved at creation.
    pub total_sites: u32,
    #[serde(default)]
    pub rollback_reason: Option<String>,
    pub created_by: String,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteRolloutStatus {
    Pending,
    Deployed,
    Failed,
}

/// Rollout state of one site within a canary deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SiteDeploymentStatus {
    pub canary_id: CanaryId,
    pub site_id: SiteId,
    pub site_name: String,
    pub phase: CanaryPhase,
    pub status: SiteRolloutStatus,
    /// When the site was targeted; `None` while waiting for its wave.
    #[serde(default)]
    pub dispatched_at: Option<u64>,
    #[serde(default)]
    pub deployed_at: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Per-site deployment created when the site was targeted.
    #[serde(default)]
    pub deployment_id: Option<DeploymentId>,
    /// A rollback command has already been issued to this site.
    #[serde(default)]
    pub rollback_sent: bool,
}

impl SiteDeploymentStatus {
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.canary_id, self.site_id)
    }
}
