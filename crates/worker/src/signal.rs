//! Stop-signal adapter: the engine polls the registry's stop flag.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use curator_engine::StopSignal;
use curator_registry::JobStore;

/// Reads the job's cooperative stop flag from the registry. A registry
/// read failure never stops the run, the flag is checked again at the
/// next stage boundary.
pub struct RegistryStopSignal {
    store: Arc<dyn JobStore>,
    job_id: Uuid,
}

impl RegistryStopSignal {
    pub fn new(store: Arc<dyn JobStore>, job_id: Uuid) -> Self {
        Self { store, job_id }
    }
}

#[async_trait]
impl StopSignal for RegistryStopSignal {
    async fn should_stop(&self) -> bool {
        match self.store.stop_requested(self.job_id).await {
            Ok(requested) => requested,
            Err(e) => {
                warn!(job = %self.job_id, error = %e, "stop flag read failed, continuing");
                false
            }
        }
    }
}
