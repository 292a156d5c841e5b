use fleet_state::StateError;

/// Errors from the connection registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("site not found: {0}")]
    UnknownSite(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;
