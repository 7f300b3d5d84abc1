use thiserror::Error;
use uuid::Uuid;

use crate::job::JobStatus;

/// Errors from the job registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Transient connection loss, retried before escalating.
    #[error("registry connection error: {0}")]
    Connection(String),

    /// Attempted backward move in the job state machine.
    #[error("illegal job transition for {job}: {from:?} -> {to:?}")]
    IllegalTransition {
        job: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job not found: {0}")]
    NotFound(Uuid),

    /// A stored row did not decode into a known shape.
    #[error("corrupt registry row: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl RegistryError {
    /// Whether a retry with a fresh connection is worth attempting.
    pub fn is_transient(&self) -> bool {
        match self {
            RegistryError::Connection(_) => true,
            RegistryError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }
}
