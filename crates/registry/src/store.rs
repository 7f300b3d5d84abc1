//! Job registry storage contract.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use crate::error::RegistryError;
use crate::job::{ActiveProcessEntry, Job, JobStatus, WorkerHeartbeat};

/// Fields written alongside a status transition.
#[derive(Debug, Default, Clone)]
pub struct StatusUpdate {
    pub host: Option<String>,
    pub worker_id: Option<String>,
    pub record_count: Option<i64>,
}

/// External state store for jobs, heartbeats, and active-process entries.
///
/// A job's row is updated only by its owning process plus the orphan
/// sweep; every update is a single-row transaction, so no distributed
/// lock is needed; the job id is the natural partition key.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &Job) -> Result<(), RegistryError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, RegistryError>;

    async fn list_jobs(&self, status: JobStatus) -> Result<Vec<Job>, RegistryError>;

    /// Advance a job's status in one transaction, enforcing the
    /// forward-only state machine. Terminal transitions stamp
    /// `finished_at`.
    async fn update_status(
        &self,
        id: Uuid,
        to: JobStatus,
        update: StatusUpdate,
    ) -> Result<Job, RegistryError>;

    /// Flip the cooperative stop flag; observed at the next stage boundary.
    async fn request_stop(&self, id: Uuid) -> Result<(), RegistryError>;

    async fn stop_requested(&self, id: Uuid) -> Result<bool, RegistryError>;

    async fn set_external_handle(&self, id: Uuid, handle: &str) -> Result<(), RegistryError>;

    /// Append one line to the job's human-readable log stream.
    async fn append_log(&self, id: Uuid, line: &str) -> Result<(), RegistryError>;

    async fn job_log(&self, id: Uuid) -> Result<Vec<String>, RegistryError>;

    async fn upsert_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<(), RegistryError>;

    async fn list_heartbeats(&self) -> Result<Vec<WorkerHeartbeat>, RegistryError>;

    /// Explicit deregistration; the only way a heartbeat row disappears.
    async fn remove_heartbeat(&self, worker_id: &str) -> Result<(), RegistryError>;

    async fn insert_active_process(&self, entry: &ActiveProcessEntry) -> Result<(), RegistryError>;

    async fn remove_active_process(&self, job_id: Uuid) -> Result<(), RegistryError>;

    async fn get_active_process(
        &self,
        job_id: Uuid,
    ) -> Result<Option<ActiveProcessEntry>, RegistryError>;
}

/// Retry a registry call on transient connection loss, taking a fresh
/// connection from the pool each attempt.
pub async fn with_retry<T, F, Fut>(
    attempts: u32,
    op_name: &str,
    mut f: F,
) -> Result<T, RegistryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RegistryError>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                attempt += 1;
                warn!(
                    op = op_name,
                    attempt,
                    error = %e,
                    "transient registry error, retrying"
                );
                tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result = with_retry(3, "test", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(RegistryError::Connection("reset".into()))
            } else {
                Ok(42u32)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: Result<(), _> = with_retry(2, "test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RegistryError::Connection("down".into()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3); // initial + 2 retries
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: Result<(), _> = with_retry(5, "test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RegistryError::NotFound(Uuid::nil()))
        })
        .await;

        assert!(matches!(result, Err(RegistryError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
