//! PostgreSQL-backed [`JobStore`].
//!
//! Status transitions run in a single transaction with `SELECT ... FOR
//! UPDATE`, so the forward-only state machine holds even when the sweep
//! and a worker race on the same row.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

use curator_core::config::RegistryConfig;

use crate::error::RegistryError;
use crate::job::{ActiveProcessEntry, Job, JobStatus, WorkerHeartbeat};
use crate::store::{with_retry, JobStore, StatusUpdate};

const JOB_COLUMNS: &str = "id, status, created_at, finished_at, host, worker_id, \
     external_task_handle, record_count, stop_requested, pipeline";

#[derive(FromRow)]
struct JobRow {
    id: Uuid,
    status: String,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    host: Option<String>,
    worker_id: Option<String>,
    external_task_handle: Option<String>,
    record_count: Option<i64>,
    stop_requested: bool,
    pipeline: serde_json::Value,
}

impl JobRow {
    fn into_job(self) -> Result<Job, RegistryError> {
        let status = JobStatus::from_str(&self.status)
            .map_err(|_| RegistryError::Corrupt(format!("unknown job status: {}", self.status)))?;
        Ok(Job {
            id: self.id,
            status,
            created_at: self.created_at,
            finished_at: self.finished_at,
            host: self.host,
            worker_id: self.worker_id,
            external_task_handle: self.external_task_handle,
            record_count: self.record_count,
            stop_requested: self.stop_requested,
            pipeline: self.pipeline,
        })
    }
}

/// Job registry on PostgreSQL.
pub struct PgJobStore {
    pool: PgPool,
    retries: u32,
}

impl PgJobStore {
    /// Connect, run migrations, and return a ready store.
    pub async fn connect(config: &RegistryConfig) -> Result<Self, RegistryError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.connection_string())
            .await?;
        info!(host = %config.host, db = %config.database, "registry connected");

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .map_err(|e| RegistryError::Connection(format!("migration failed: {e}")))?;
        info!("registry migrations applied");

        Ok(Self {
            pool,
            retries: config.connect_retries,
        })
    }

    pub fn from_pool(pool: PgPool, retries: u32) -> Self {
        Self { pool, retries }
    }

    async fn fetch_for_update(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Job, RegistryError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(RegistryError::NotFound(id))?;
        row.into_job()
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert_job(&self, job: &Job) -> Result<(), RegistryError> {
        with_retry(self.retries, "insert_job", || async move {
            sqlx::query(
                "INSERT INTO jobs (id, status, created_at, finished_at, host, worker_id,
                                   external_task_handle, record_count, stop_requested, pipeline)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(job.id)
            .bind(job.status.as_str())
            .bind(job.created_at)
            .bind(job.finished_at)
            .bind(&job.host)
            .bind(&job.worker_id)
            .bind(&job.external_task_handle)
            .bind(job.record_count)
            .bind(job.stop_requested)
            .bind(&job.pipeline)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, RegistryError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRow::into_job).transpose()
    }

    async fn list_jobs(&self, status: JobStatus) -> Result<Vec<Job>, RegistryError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = $1 ORDER BY created_at"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn update_status(
        &self,
        id: Uuid,
        to: JobStatus,
        update: StatusUpdate,
    ) -> Result<Job, RegistryError> {
        with_retry(self.retries, "update_status", || {
            let update = update.clone();
            async move {
                let mut tx = self.pool.begin().await?;
                let current = Self::fetch_for_update(&mut tx, id).await?;

                if !current.status.can_advance_to(to) {
                    return Err(RegistryError::IllegalTransition {
                        job: id,
                        from: current.status,
                        to,
                    });
                }

                let finished_at = if to.is_terminal() { Some(Utc::now()) } else { None };
                let row = sqlx::query_as::<_, JobRow>(&format!(
                    "UPDATE jobs SET
                        status = $2,
                        finished_at = COALESCE($3, finished_at),
                        host = COALESCE($4, host),
                        worker_id = COALESCE($5, worker_id),
                        record_count = COALESCE($6, record_count)
                     WHERE id = $1
                     RETURNING {JOB_COLUMNS}"
                ))
                .bind(id)
                .bind(to.as_str())
                .bind(finished_at)
                .bind(&update.host)
                .bind(&update.worker_id)
                .bind(update.record_count)
                .fetch_one(&mut *tx)
                .await?;

                tx.commit().await?;
                row.into_job()
            }
        })
        .await
    }

    async fn request_stop(&self, id: Uuid) -> Result<(), RegistryError> {
        let result = sqlx::query("UPDATE jobs SET stop_requested = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(id));
        }
        Ok(())
    }

    async fn stop_requested(&self, id: Uuid) -> Result<bool, RegistryError> {
        sqlx::query_scalar::<_, bool>("SELECT stop_requested FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RegistryError::NotFound(id))
    }

    async fn set_external_handle(&self, id: Uuid, handle: &str) -> Result<(), RegistryError> {
        let result = sqlx::query("UPDATE jobs SET external_task_handle = $2 WHERE id = $1")
            .bind(id)
            .bind(handle)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(id));
        }
        Ok(())
    }

    async fn append_log(&self, id: Uuid, line: &str) -> Result<(), RegistryError> {
        sqlx::query("INSERT INTO job_logs (job_id, line) VALUES ($1, $2)")
            .bind(id)
            .bind(line)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn job_log(&self, id: Uuid) -> Result<Vec<String>, RegistryError> {
        let lines = sqlx::query_scalar::<_, String>(
            "SELECT line FROM job_logs WHERE job_id = $1 ORDER BY id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(lines)
    }

    async fn upsert_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<(), RegistryError> {
        with_retry(self.retries, "upsert_heartbeat", || async move {
            sqlx::query(
                "INSERT INTO worker_heartbeats (worker_id, host, last_seen_at, active_job_count)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (worker_id) DO UPDATE SET
                    host = EXCLUDED.host,
                    last_seen_at = EXCLUDED.last_seen_at,
                    active_job_count = EXCLUDED.active_job_count",
            )
            .bind(&heartbeat.worker_id)
            .bind(&heartbeat.host)
            .bind(heartbeat.last_seen_at)
            .bind(heartbeat.active_job_count)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn list_heartbeats(&self) -> Result<Vec<WorkerHeartbeat>, RegistryError> {
        #[derive(FromRow)]
        struct Row {
            worker_id: String,
            host: String,
            last_seen_at: DateTime<Utc>,
            active_job_count: i32,
        }

        let rows = sqlx::query_as::<_, Row>(
            "SELECT worker_id, host, last_seen_at, active_job_count FROM worker_heartbeats",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| WorkerHeartbeat {
                worker_id: r.worker_id,
                host: r.host,
                last_seen_at: r.last_seen_at,
                active_job_count: r.active_job_count,
            })
            .collect())
    }

    async fn remove_heartbeat(&self, worker_id: &str) -> Result<(), RegistryError> {
        sqlx::query("DELETE FROM worker_heartbeats WHERE worker_id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_active_process(&self, entry: &ActiveProcessEntry) -> Result<(), RegistryError> {
        sqlx::query(
            "INSERT INTO active_processes (job_id, process_id, host, worker_id)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (job_id) DO UPDATE SET
                process_id = EXCLUDED.process_id,
                host = EXCLUDED.host,
                worker_id = EXCLUDED.worker_id",
        )
        .bind(entry.job_id)
        .bind(entry.process_id)
        .bind(&entry.host)
        .bind(&entry.worker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_active_process(&self, job_id: Uuid) -> Result<(), RegistryError> {
        sqlx::query("DELETE FROM active_processes WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_active_process(
        &self,
        job_id: Uuid,
    ) -> Result<Option<ActiveProcessEntry>, RegistryError> {
        #[derive(FromRow)]
        struct Row {
            job_id: Uuid,
            process_id: i32,
            host: String,
            worker_id: String,
        }

        let row = sqlx::query_as::<_, Row>(
            "SELECT job_id, process_id, host, worker_id FROM active_processes WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| ActiveProcessEntry {
            job_id: r.job_id,
            process_id: r.process_id,
            host: r.host,
            worker_id: r.worker_id,
        }))
    }
}
