use thiserror::Error;

/// Error raised by a single operator entry point.
///
/// Per-record entry points wrapped by [`crate::isolate::FaultGuard`]
/// never let these escape the stage; whole-dataset entry points
/// (Deduplicate.resolve, Select.select) escalate them to
/// [`EngineError::StageSetup`].
#[derive(Debug, Error)]
pub enum OpError {
    #[error("malformed record: {0}")]
    Malformed(String),

    #[error("{0}")]
    Other(String),
}

/// Errors that can abort a pipeline run.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Operator init failure or whole-dataset operator failure.
    /// Aborts the run; the caller marks the job Failed.
    #[error("stage {stage} ({operator}) failed: {message}")]
    StageSetup {
        stage: usize,
        operator: String,
        message: String,
    },

    /// Operation the active backend does not wire up.
    #[error("not implemented for this backend: {0}")]
    BackendUnsupported(String),

    /// Dataset handed to a backend in the wrong form.
    #[error("dataset form mismatch: {0}")]
    DatasetForm(String),

    /// Cluster dataset engine transport failure.
    #[error("cluster engine error: {0}")]
    Engine(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("checkpoint I/O error: {0}")]
    Checkpoint(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Pipeline spec names an operator no factory is registered for.
    #[error("unknown operator: {0}")]
    UnknownOperator(String),
}

impl EngineError {
    /// Build a stage-level error from an operator failure.
    pub fn stage(stage: usize, operator: &str, err: impl std::fmt::Display) -> Self {
        Self::StageSetup {
            stage,
            operator: operator.to_string(),
            message: err.to_string(),
        }
    }
}
