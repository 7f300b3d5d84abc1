use thiserror::Error;

/// Errors from the cluster workflow bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("scheduler request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error(transparent)]
    Registry(#[from] curator_registry::RegistryError),

    #[error("artifact io error: {0}")]
    Artifact(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
