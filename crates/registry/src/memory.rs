//! In-memory [`JobStore`] for tests and embedded single-process use.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::RegistryError;
use crate::job::{ActiveProcessEntry, Job, JobStatus, WorkerHeartbeat};
use crate::store::{JobStore, StatusUpdate};

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    logs: HashMap<Uuid, Vec<String>>,
    heartbeats: HashMap<String, WorkerHeartbeat>,
    active: HashMap<Uuid, ActiveProcessEntry>,
}

/// In-memory store with the same transition semantics as the Postgres
/// implementation.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: RwLock<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_job(&self, job: &Job) -> Result<(), RegistryError> {
        self.inner.write().await.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, RegistryError> {
        Ok(self.inner.read().await.jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, status: JobStatus) -> Result<Vec<Job>, RegistryError> {
        Ok(self
            .inner
            .read()
            .await
            .jobs
            .values()
            .filter(|job| job.status == status)
            .cloned()
            .collect())
    }

    async fn update_status(
        &self,
        id: Uuid,
        to: JobStatus,
        update: StatusUpdate,
    ) -> Result<Job, RegistryError> {
        let mut inner = self.inner.write().await;
        let job = inner.jobs.get_mut(&id).ok_or(RegistryError::NotFound(id))?;

        if !job.status.can_advance_to(to) {
            return Err(RegistryError::IllegalTransition {
                job: id,
                from: job.status,
                to,
            });
        }

        job.status = to;
        if let Some(host) = update.host {
            job.host = Some(host);
        }
        if let Some(worker_id) = update.worker_id {
            job.worker_id = Some(worker_id);
        }
        if let Some(record_count) = update.record_count {
            job.record_count = Some(record_count);
        }
        if to.is_terminal() {
            job.finished_at = Some(Utc::now());
        }
        Ok(job.clone())
    }

    async fn request_stop(&self, id: Uuid) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;
        let job = inner.jobs.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        job.stop_requested = true;
        Ok(())
    }

    async fn stop_requested(&self, id: Uuid) -> Result<bool, RegistryError> {
        let inner = self.inner.read().await;
        inner
            .jobs
            .get(&id)
            .map(|job| job.stop_requested)
            .ok_or(RegistryError::NotFound(id))
    }

    async fn set_external_handle(&self, id: Uuid, handle: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;
        let job = inner.jobs.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        job.external_task_handle = Some(handle.to_string());
        Ok(())
    }

    async fn append_log(&self, id: Uuid, line: &str) -> Result<(), RegistryError> {
        self.inner
            .write()
            .await
            .logs
            .entry(id)
            .or_default()
            .push(line.to_string());
        Ok(())
    }

    async fn job_log(&self, id: Uuid) -> Result<Vec<String>, RegistryError> {
        Ok(self
            .inner
            .read()
            .await
            .logs
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn upsert_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<(), RegistryError> {
        self.inner
            .write()
            .await
            .heartbeats
            .insert(heartbeat.worker_id.clone(), heartbeat.clone());
        Ok(())
    }

    async fn list_heartbeats(&self) -> Result<Vec<WorkerHeartbeat>, RegistryError> {
        Ok(self.inner.read().await.heartbeats.values().cloned().collect())
    }

    async fn remove_heartbeat(&self, worker_id: &str) -> Result<(), RegistryError> {
        self.inner.write().await.heartbeats.remove(worker_id);
        Ok(())
    }

    async fn insert_active_process(
        &self,
        entry: &ActiveProcessEntry,
    ) -> Result<(), RegistryError> {
        self.inner
            .write()
            .await
            .active
            .insert(entry.job_id, entry.clone());
        Ok(())
    }

    async fn remove_active_process(&self, job_id: Uuid) -> Result<(), RegistryError> {
        self.inner.write().await.active.remove(&job_id);
        Ok(())
    }

    async fn get_active_process(
        &self,
        job_id: Uuid,
    ) -> Result<Option<ActiveProcessEntry>, RegistryError> {
        Ok(self.inner.read().await.active.get(&job_id).cloned())
    }
}
