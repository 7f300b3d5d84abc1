//! Job lifecycle management on top of a [`JobStore`].
//!
//! Owns the state machine side effects: claiming queued jobs, recording
//! completion, the startup orphan sweep, and worker heartbeats.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RegistryError;
use crate::job::{ActiveProcessEntry, Job, JobStatus, WorkerHeartbeat};
use crate::store::{JobStore, StatusUpdate};

/// Lookup into the external execution layer, used by the orphan sweep to
/// tell a live run from a leftover row.
#[async_trait]
pub trait TaskRegistry: Send + Sync {
    /// Whether the task behind this handle is still executing.
    async fn is_executing(&self, handle: &str) -> Result<bool, RegistryError>;
}

/// Worker liveness classification derived from heartbeat age.
#[derive(Debug, Clone)]
pub struct WorkerState {
    pub heartbeat: WorkerHeartbeat,
    pub online: bool,
}

/// Outcome of one orphan sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Jobs marked Failed because no live execution backs them.
    pub failed: Vec<Uuid>,
    /// Jobs left in Processing because their task is still executing.
    pub still_running: Vec<Uuid>,
    /// Jobs left untouched because the execution layer could not be queried.
    pub unverified: Vec<Uuid>,
}

const INTERRUPTED_REASON: &str = "interrupted by restart";

pub struct JobLifecycleManager {
    store: Arc<dyn JobStore>,
    staleness: Duration,
}

impl JobLifecycleManager {
    pub fn new(store: Arc<dyn JobStore>, staleness: Duration) -> Self {
        Self { store, staleness }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Register a new pipeline run in Queued state.
    pub async fn submit(&self, pipeline: serde_json::Value) -> Result<Job, RegistryError> {
        let job = Job::new(pipeline);
        self.store.insert_job(&job).await?;
        self.store.append_log(job.id, "job submitted").await?;
        info!(job = %job.id, "job submitted");
        Ok(job)
    }

    /// Take ownership of a queued job: Queued -> Processing, plus an
    /// active-process entry marking this specific execution.
    pub async fn claim(
        &self,
        id: Uuid,
        host: &str,
        worker_id: &str,
        process_id: i32,
    ) -> Result<Job, RegistryError> {
        let job = self
            .store
            .update_status(
                id,
                JobStatus::Processing,
                StatusUpdate {
                    host: Some(host.to_string()),
                    worker_id: Some(worker_id.to_string()),
                    record_count: None,
                },
            )
            .await?;

        let entry = ActiveProcessEntry {
            job_id: id,
            process_id,
            host: host.to_string(),
            worker_id: worker_id.to_string(),
        };
        self.store.insert_active_process(&entry).await?;
        self.store
            .append_log(id, &format!("claimed by {} ({})", worker_id, entry.key()))
            .await?;
        info!(job = %id, worker = %worker_id, "job claimed");
        Ok(job)
    }

    /// Record successful completion. A second completion report for an
    /// already Finished job is a no-op, duplicate terminal events from
    /// the execution layer are expected.
    pub async fn complete(&self, id: Uuid, record_count: i64) -> Result<(), RegistryError> {
        let job = self
            .store
            .get_job(id)
            .await?
            .ok_or(RegistryError::NotFound(id))?;
        if job.status == JobStatus::Finished {
            debug!(job = %id, "duplicate completion report ignored");
            return Ok(());
        }

        self.store
            .update_status(
                id,
                JobStatus::Finished,
                StatusUpdate {
                    record_count: Some(record_count),
                    ..Default::default()
                },
            )
            .await?;
        self.store.remove_active_process(id).await?;
        self.store
            .append_log(id, &format!("finished with {} records", record_count))
            .await?;
        info!(job = %id, record_count, "job finished");
        Ok(())
    }

    /// Record failure with a human-readable reason. No-op if the job is
    /// already terminal.
    pub async fn fail(&self, id: Uuid, reason: &str) -> Result<(), RegistryError> {
        let job = self
            .store
            .get_job(id)
            .await?
            .ok_or(RegistryError::NotFound(id))?;
        if job.status.is_terminal() {
            debug!(job = %id, status = %job.status, "failure report for terminal job ignored");
            return Ok(());
        }

        self.store
            .update_status(id, JobStatus::Failed, StatusUpdate::default())
            .await?;
        self.store.remove_active_process(id).await?;
        self.store
            .append_log(id, &format!("failed: {}", reason))
            .await?;
        warn!(job = %id, reason, "job failed");
        Ok(())
    }

    /// Record that a stop request was honored: Processing -> Stopped.
    pub async fn stop(&self, id: Uuid) -> Result<(), RegistryError> {
        self.store
            .update_status(id, JobStatus::Stopped, StatusUpdate::default())
            .await?;
        self.store.remove_active_process(id).await?;
        self.store.append_log(id, "stopped on request").await?;
        info!(job = %id, "job stopped");
        Ok(())
    }

    /// Flip the cooperative stop flag. The running pipeline observes it
    /// at its next stage boundary.
    pub async fn request_stop(&self, id: Uuid) -> Result<(), RegistryError> {
        self.store.request_stop(id).await?;
        self.store.append_log(id, "stop requested").await?;
        Ok(())
    }

    /// Startup orphan sweep.
    ///
    /// A Processing job with no live execution behind it will never be
    /// updated again; mark it Failed so it does not sit in Processing
    /// forever. Jobs whose external task is still executing are left
    /// alone. If the execution layer cannot be queried the job is also
    /// left alone, a later sweep will settle it.
    pub async fn sweep_orphans(&self, tasks: &dyn TaskRegistry) -> Result<SweepReport, RegistryError> {
        let mut report = SweepReport::default();

        for job in self.store.list_jobs(JobStatus::Processing).await? {
            let live = match &job.external_task_handle {
                Some(handle) => match tasks.is_executing(handle).await {
                    Ok(live) => live,
                    Err(e) => {
                        warn!(job = %job.id, error = %e, "orphan sweep could not verify task, leaving job");
                        report.unverified.push(job.id);
                        continue;
                    }
                },
                // No handle means the run lived in a process that is gone.
                None => false,
            };

            if live {
                report.still_running.push(job.id);
                continue;
            }

            self.fail(job.id, INTERRUPTED_REASON).await?;
            report.failed.push(job.id);
        }

        info!(
            failed = report.failed.len(),
            still_running = report.still_running.len(),
            unverified = report.unverified.len(),
            "orphan sweep complete"
        );
        Ok(report)
    }

    /// Classify every registered worker by heartbeat age.
    pub async fn list_workers(&self) -> Result<Vec<WorkerState>, RegistryError> {
        let now = Utc::now();
        Ok(self
            .store
            .list_heartbeats()
            .await?
            .into_iter()
            .map(|heartbeat| {
                let online = heartbeat.is_online(self.staleness, now);
                WorkerState { heartbeat, online }
            })
            .collect())
    }

    /// Periodically upsert this worker's heartbeat until shutdown is
    /// signalled, then remove it. Missing a beat never kills the worker.
    pub async fn heartbeat_loop(
        &self,
        worker_id: &str,
        host: &str,
        interval: Duration,
        shutdown: &Notify,
    ) {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.beat(worker_id, host).await {
                        warn!(worker = %worker_id, error = %e, "heartbeat upsert failed");
                    }
                }
                _ = shutdown.notified() => {
                    break;
                }
            }
        }

        // Explicit deregistration; restarts leave the row in place so
        // the worker shows up as offline, not vanished.
        if let Err(e) = self.store.remove_heartbeat(worker_id).await {
            warn!(worker = %worker_id, error = %e, "heartbeat deregistration failed");
        }
        info!(worker = %worker_id, "heartbeat loop stopped");
    }

    async fn beat(&self, worker_id: &str, host: &str) -> Result<(), RegistryError> {
        let active = self
            .store
            .list_jobs(JobStatus::Processing)
            .await?
            .into_iter()
            .filter(|job| job.worker_id.as_deref() == Some(worker_id))
            .count();

        self.store
            .upsert_heartbeat(&WorkerHeartbeat {
                worker_id: worker_id.to_string(),
                host: host.to_string(),
                last_seen_at: Utc::now(),
                active_job_count: active as i32,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryJobStore;
    use serde_json::json;

    struct StaticTasks {
        executing: bool,
        error: bool,
    }

    #[async_trait]
    impl TaskRegistry for StaticTasks {
        async fn is_executing(&self, _handle: &str) -> Result<bool, RegistryError> {
            if self.error {
                Err(RegistryError::Connection("scheduler unreachable".into()))
            } else {
                Ok(self.executing)
            }
        }
    }

    fn manager() -> JobLifecycleManager {
        JobLifecycleManager::new(Arc::new(MemoryJobStore::new()), Duration::from_secs(90))
    }

    #[tokio::test]
    async fn claim_then_complete() {
        let mgr = manager();
        let job = mgr.submit(json!({"stages": []})).await.unwrap();

        mgr.claim(job.id, "host-a", "w1", 100).await.unwrap();
        let claimed = mgr.store().get_job(job.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Processing);
        assert!(mgr.store().get_active_process(job.id).await.unwrap().is_some());

        mgr.complete(job.id, 950).await.unwrap();
        let done = mgr.store().get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Finished);
        assert_eq!(done.record_count, Some(950));
        assert!(mgr.store().get_active_process(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_completion_is_a_no_op() {
        let mgr = manager();
        let job = mgr.submit(json!(null)).await.unwrap();
        mgr.claim(job.id, "h", "w1", 1).await.unwrap();

        mgr.complete(job.id, 10).await.unwrap();
        mgr.complete(job.id, 10).await.unwrap();

        let done = mgr.store().get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Finished);
    }

    #[tokio::test]
    async fn crashed_job_is_swept_to_failed() {
        let mgr = manager();
        let job = mgr.submit(json!(null)).await.unwrap();
        mgr.claim(job.id, "h", "w1", 1).await.unwrap();
        // Process dies here without reporting back.

        let report = mgr
            .sweep_orphans(&StaticTasks { executing: false, error: false })
            .await
            .unwrap();
        assert_eq!(report.failed, vec![job.id]);

        let swept = mgr.store().get_job(job.id).await.unwrap().unwrap();
        assert_eq!(swept.status, JobStatus::Failed);
        let log = mgr.store().job_log(job.id).await.unwrap();
        assert!(log.iter().any(|l| l.contains("interrupted by restart")));
    }

    #[tokio::test]
    async fn sweep_leaves_jobs_with_live_tasks() {
        let mgr = manager();
        let job = mgr.submit(json!(null)).await.unwrap();
        mgr.claim(job.id, "h", "w1", 1).await.unwrap();
        mgr.store()
            .set_external_handle(job.id, "task-123")
            .await
            .unwrap();

        let report = mgr
            .sweep_orphans(&StaticTasks { executing: true, error: false })
            .await
            .unwrap();
        assert_eq!(report.still_running, vec![job.id]);
        assert!(report.failed.is_empty());

        let job = mgr.store().get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn sweep_leaves_unverifiable_jobs() {
        let mgr = manager();
        let job = mgr.submit(json!(null)).await.unwrap();
        mgr.claim(job.id, "h", "w1", 1).await.unwrap();
        mgr.store()
            .set_external_handle(job.id, "task-123")
            .await
            .unwrap();

        let report = mgr
            .sweep_orphans(&StaticTasks { executing: false, error: true })
            .await
            .unwrap();
        assert_eq!(report.unverified, vec![job.id]);

        let job = mgr.store().get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn sweep_is_idempotent() {
        let mgr = manager();
        let job = mgr.submit(json!(null)).await.unwrap();
        mgr.claim(job.id, "h", "w1", 1).await.unwrap();

        let tasks = StaticTasks { executing: false, error: false };
        let first = mgr.sweep_orphans(&tasks).await.unwrap();
        let second = mgr.sweep_orphans(&tasks).await.unwrap();
        assert_eq!(first.failed, vec![job.id]);
        assert!(second.failed.is_empty());
    }

    #[tokio::test]
    async fn stop_request_then_stop() {
        let mgr = manager();
        let job = mgr.submit(json!(null)).await.unwrap();
        mgr.claim(job.id, "h", "w1", 1).await.unwrap();

        mgr.request_stop(job.id).await.unwrap();
        assert!(mgr.store().stop_requested(job.id).await.unwrap());

        mgr.stop(job.id).await.unwrap();
        let job = mgr.store().get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Stopped);
        assert!(job.finished_at.is_some());
    }

    #[tokio::test]
    async fn worker_classification() {
        let mgr = manager();
        mgr.store()
            .upsert_heartbeat(&WorkerHeartbeat {
                worker_id: "fresh".into(),
                host: "h".into(),
                last_seen_at: Utc::now(),
                active_job_count: 0,
            })
            .await
            .unwrap();
        mgr.store()
            .upsert_heartbeat(&WorkerHeartbeat {
                worker_id: "stale".into(),
                host: "h".into(),
                last_seen_at: Utc::now() - chrono::Duration::seconds(600),
                active_job_count: 0,
            })
            .await
            .unwrap();

        let workers = mgr.list_workers().await.unwrap();
        let online = |id: &str| {
            workers
                .iter()
                .find(|w| w.heartbeat.worker_id == id)
                .map(|w| w.online)
        };
        assert_eq!(online("fresh"), Some(true));
        assert_eq!(online("stale"), Some(false));
    }
}
