//! Command type catalog.
//!
//! Every command sent to a site has a type. The type decides how long the
//! dispatcher waits for a result and whether the command may be parked in
//! the offline queue when the site is unreachable.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Budget applied to command types without a dedicated entry.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Kind of command a site can execute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CommandType {
    /// Download and install a video.
    DeployVideo,
    /// Remove a video from local storage.
    DeleteVideo,
    /// Download and install a software package.
    UpdateSoftware,
    /// Restore the previously installed software package.
    RollbackUpdate,
    /// Push a configuration document.
    UpdateConfig,
    Reboot,
    RestartService,
    ClearCache,
    GetLogs,
    GetSystemInfo,
    RunDiagnostics,
    Screenshot,
    /// A type this control plane has no catalog entry for.
    Other(String),
}

impl CommandType {
    /// Wire name of the command type.
    pub fn as_str(&self) -> &str {
        match self {
            Self::DeployVideo => "deploy_video",
            Self::DeleteVideo => "delete_video",
            Self::UpdateSoftware => "update_software",
            Self::RollbackUpdate => "rollback_update",
            Self::UpdateConfig => "update_config",
            Self::Reboot => "reboot",
            Self::RestartService => "restart_service",
            Self::ClearCache => "clear_cache",
            Self::GetLogs => "get_logs",
            Self::GetSystemInfo => "get_system_info",
            Self::RunDiagnostics => "run_diagnostics",
            Self::Screenshot => "screenshot",
            Self::Other(name) => name,
        }
    }

    /// How long the dispatcher waits for a result before timing out.
    pub fn timeout(&self) -> Duration {
        match self {
            Self::DeployVideo => Duration::from_secs(10 * 60),
            Self::UpdateSoftware => Duration::from_secs(15 * 60),
            Self::RollbackUpdate => Duration::from_secs(10 * 60),
            Self::DeleteVideo => Duration::from_secs(30),
            Self::UpdateConfig => Duration::from_secs(10),
            Self::Reboot => Duration::from_secs(60),
            Self::RestartService => Duration::from_secs(30),
            Self::ClearCache => Duration::from_secs(30),
            Self::GetLogs => Duration::from_secs(5),
            Self::GetSystemInfo => Duration::from_secs(5),
            Self::RunDiagnostics => Duration::from_secs(8),
            Self::Screenshot => Duration::from_secs(5),
            Self::Other(_) => DEFAULT_TIMEOUT,
        }
    }

    /// Whether delayed delivery of this command is meaningful.
    ///
    /// Read-only queries only make sense against a live session, and
    /// unknown types are never parked.
    pub fn is_queueable(&self) -> bool {
        matches!(
            self,
            Self::DeployVideo
                | Self::DeleteVideo
                | Self::UpdateSoftware
                | Self::RollbackUpdate
                | Self::UpdateConfig
                | Self::Reboot
                | Self::RestartService
                | Self::ClearCache
        )
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for CommandType {
    fn from(s: &str) -> Self {
        match s {
            "deploy_video" => Self::DeployVideo,
            "delete_video" => Self::DeleteVideo,
            "update_software" => Self::UpdateSoftware,
            "rollback_update" => Self::RollbackUpdate,
            "update_config" => Self::UpdateConfig,
            "reboot" => Self::Reboot,
            "restart_service" => Self::RestartService,
            "clear_cache" => Self::ClearCache,
            "get_logs" => Self::GetLogs,
            "get_system_info" => Self::GetSystemInfo,
            "run_diagnostics" => Self::RunDiagnostics,
            "screenshot" => Self::Screenshot,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for CommandType {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<CommandType> for String {
    fn from(t: CommandType) -> Self {
        t.as_str().to_string()
    }
}
