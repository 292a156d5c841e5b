use fleet_state::StateError;

/// Errors from command dispatch and queueing.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("command type '{0}' is realtime-only and cannot be queued")]
    NotQueueable(String),

    #[error("priority must be between 1 and 10, got {0}")]
    InvalidPriority(u8),

    #[error("site not found: {0}")]
    UnknownSite(String),
}

pub type CommandResult<T> = Result<T, CommandError>;
