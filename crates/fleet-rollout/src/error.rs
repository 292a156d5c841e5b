use fleet_commands::CommandError;
use fleet_deploy::DeployError;
use fleet_state::StateError;

/// Errors from the canary orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum RolloutError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("deployment error: {0}")]
    Deploy(#[from] DeployError),

    #[error("command error: {0}")]
    Command(#[from] CommandError),

    #[error("canary deployment not found: {0}")]
    NotFound(String),

    #[error("invalid canary config: {0}")]
    InvalidConfig(String),

    #[error("no target sites found for {0}")]
    NoTargets(String),

    #[error("canary {id} is {phase}; cannot {action}")]
    InvalidPhase {
        id: String,
        phase: &'static str,
        action: &'static str,
    },
}

pub type RolloutResult<T> = Result<T, RolloutError>;
