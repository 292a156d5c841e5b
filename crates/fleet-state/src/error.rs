//! State store errors.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

/// Failures of the embedded store.
///
/// Backend failures carry the redb message; a row that no longer decodes
/// names its table and key so it can be found and repaired.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot open state database: {0}")]
    Open(String),

    #[error("state transaction failed: {0}")]
    Transaction(String),

    #[error("cannot open state table: {0}")]
    Table(String),

    #[error("state read failed: {0}")]
    Read(String),

    #[error("state write failed: {0}")]
    Write(String),

    #[error("cannot encode row: {0}")]
    Encode(String),

    #[error("row {table}/{key} does not decode: {reason}")]
    Decode {
        table: String,
        key: String,
        reason: String,
    },
}
