use fleet_commands::CommandError;
use fleet_state::StateError;

/// Errors from the deployment orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("command error: {0}")]
    Command(#[from] CommandError),

    #[error("deployment not found: {0}")]
    NotFound(String),

    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("artifact {id} is not a {expected} artifact")]
    ArtifactKindMismatch { id: String, expected: &'static str },

    #[error("invalid software version '{0}'")]
    InvalidVersion(String),

    #[error("deployment {id} is {status}; cannot {action}")]
    InvalidTransition {
        id: String,
        status: &'static str,
        action: &'static str,
    },
}

pub type DeployResult<T> = Result<T, DeployError>;
