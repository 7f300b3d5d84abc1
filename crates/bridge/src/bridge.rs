//! Bridge between the job registry and the cluster scheduler.
//!
//! Submits pipeline jobs as labeled scheduler tasks, then drives job
//! terminal states from the scheduler's watch stream. The scheduler may
//! deliver the same terminal event more than once (and again after a
//! watch reconnect), so every transition here is idempotent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use curator_core::config::ClusterConfig;
use curator_engine::PipelineSpec;
use curator_registry::{Job, JobLifecycleManager, RegistryError, TaskRegistry};

use crate::artifact;
use crate::error::BridgeError;
use crate::scheduler::{ClusterScheduler, TaskPhase, TaskResources, TaskSpec, TaskState};

/// Label marking tasks owned by this system.
pub const MANAGED_BY_LABEL: &str = "managed-by";
pub const MANAGED_BY_VALUE: &str = "curator";
/// Label carrying the registry job id.
pub const JOB_ID_LABEL: &str = "job-id";

pub struct WorkflowBridge {
    scheduler: Arc<dyn ClusterScheduler>,
    lifecycle: Arc<JobLifecycleManager>,
    config: ClusterConfig,
}

impl WorkflowBridge {
    pub fn new(
        scheduler: Arc<dyn ClusterScheduler>,
        lifecycle: Arc<JobLifecycleManager>,
        config: ClusterConfig,
    ) -> Self {
        Self {
            scheduler,
            lifecycle,
            config,
        }
    }

    /// Package a job as a scheduler task, submit it, and record the
    /// returned handle on the job row. The task environment carries the
    /// cluster addresses plus any configured feature flags; requests and
    /// limits come from the widest resource hint in the pipeline.
    pub async fn submit_job(&self, job: &Job) -> Result<String, BridgeError> {
        let mut env = self.config.task_env.clone();
        env.insert("CURATOR_JOB_ID".to_string(), job.id.to_string());
        env.insert(
            "CLUSTER_SCHEDULER_URL".to_string(),
            self.config.scheduler_url.clone(),
        );
        env.insert(
            "CLUSTER_ENGINE_URL".to_string(),
            self.config.engine_url.clone(),
        );
        env.insert(
            "ARTIFACTS_DIR".to_string(),
            self.config.artifacts_dir.display().to_string(),
        );

        let resources = task_resources(&job.pipeline);
        let spec = TaskSpec {
            name: format!("curation-{}", job.id),
            image: self.config.task_image.clone(),
            command: vec![
                "curation-pipeline".to_string(),
                "--job-id".to_string(),
                job.id.to_string(),
            ],
            env,
            requests: resources.clone(),
            limits: resources,
            labels: [
                (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
                (JOB_ID_LABEL.to_string(), job.id.to_string()),
            ]
            .into(),
        };

        let state = self.scheduler.submit(&spec).await?;
        self.lifecycle
            .store()
            .set_external_handle(job.id, &state.handle)
            .await?;
        self.lifecycle
            .store()
            .append_log(job.id, &format!("scheduler task submitted: {}", state.handle))
            .await?;
        info!(job = %job.id, handle = %state.handle, "job submitted to cluster");
        Ok(state.handle)
    }

    /// Watch scheduler events until shutdown, reconnecting with bounded
    /// exponential backoff. Every reconnect starts with a reconcile pass
    /// over the live task list, so events missed while disconnected are
    /// not lost.
    pub async fn run_watch(&self, shutdown: &Notify) {
        let mut cursor: Option<String> = None;
        let mut backoff = Duration::from_secs(1);
        let backoff_max = Duration::from_secs(self.config.watch_backoff_max_secs.max(1));
        let mut need_reconcile = true;

        loop {
            if need_reconcile {
                if let Err(e) = self.reconcile().await {
                    warn!(error = %e, "reconcile failed, will retry");
                } else {
                    need_reconcile = false;
                }
            }

            let watch = tokio::select! {
                result = self.scheduler.watch(
                    MANAGED_BY_LABEL,
                    MANAGED_BY_VALUE,
                    cursor.as_deref(),
                ) => result,
                _ = shutdown.notified() => break,
            };

            match watch {
                Ok(page) => {
                    backoff = Duration::from_secs(1);
                    cursor = Some(page.cursor);
                    // The cursor has already consumed these events, so a
                    // failed application must be re-driven from the live
                    // list or the terminal state is lost.
                    if !self.apply_events(&page.events).await {
                        need_reconcile = true;
                    }
                }
                Err(e) => {
                    warn!(error = %e, backoff_secs = backoff.as_secs(), "watch stream lost, reconnecting");
                    cursor = None;
                    need_reconcile = true;
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.notified() => break,
                    }
                    backoff = (backoff * 2).min(backoff_max);
                }
            }
        }
        info!("scheduler watch stopped");
    }

    /// Apply one page of watch events. Returns false when any event
    /// failed to apply and a reconcile pass is needed to replay it.
    async fn apply_events(&self, events: &[TaskState]) -> bool {
        let mut all_applied = true;
        for state in events {
            if let Err(e) = self.apply(state).await {
                warn!(handle = %state.handle, error = %e, "failed to apply task event");
                all_applied = false;
            }
        }
        all_applied
    }

    /// Settle terminal states from the live task list.
    async fn reconcile(&self) -> Result<(), BridgeError> {
        let tasks = self
            .scheduler
            .list(MANAGED_BY_LABEL, MANAGED_BY_VALUE)
            .await?;
        debug!(tasks = tasks.len(), "reconciling scheduler tasks");
        for state in &tasks {
            if state.phase.is_terminal() {
                if let Err(e) = self.apply(state).await {
                    warn!(handle = %state.handle, error = %e, "reconcile could not apply task state");
                }
            }
        }
        Ok(())
    }

    /// Map one task state onto the owning job. Non-terminal phases and
    /// unlabeled tasks are ignored.
    pub async fn apply(&self, state: &TaskState) -> Result<(), BridgeError> {
        let Some(job_id) = job_id_of(state) else {
            debug!(handle = %state.handle, "task without job-id label ignored");
            return Ok(());
        };

        match state.phase {
            TaskPhase::Pending | TaskPhase::Running => Ok(()),
            TaskPhase::Succeeded => {
                let count = artifact::read_record_count(&self.config.artifacts_dir, job_id)?;
                let count = match count {
                    Some(count) => count,
                    None => {
                        warn!(job = %job_id, "task succeeded without record-count artifact");
                        0
                    }
                };
                self.lifecycle.complete(job_id, count).await?;
                Ok(())
            }
            TaskPhase::Failed => {
                let reason = state
                    .message
                    .as_deref()
                    .unwrap_or("cluster task failed without detail");
                self.lifecycle.fail(job_id, reason).await?;
                Ok(())
            }
        }
    }
}

fn job_id_of(state: &TaskState) -> Option<Uuid> {
    state
        .labels
        .get(JOB_ID_LABEL)
        .and_then(|v| v.parse().ok())
}

/// Derive the task's resource shape from the pipeline's stage hints: the
/// widest per-stage requirement wins, since stages run one at a time.
fn task_resources(pipeline: &serde_json::Value) -> TaskResources {
    let mut resources = TaskResources {
        cpu: 1.0,
        ..TaskResources::default()
    };
    let Ok(spec) = serde_json::from_value::<PipelineSpec>(pipeline.clone()) else {
        return resources;
    };
    for stage in &spec.stages {
        let hint = stage.resources.clone().unwrap_or_default();
        resources.cpu = resources.cpu.max(hint.cpu_required);
        resources.mem_gib = resources.mem_gib.max(hint.mem_required_gib);
        if hint.uses_accelerator {
            resources.accelerators = resources.accelerators.max(1);
        }
    }
    resources
}

/// The orphan sweep asks the bridge whether a task handle is still live.
#[async_trait]
impl TaskRegistry for WorkflowBridge {
    async fn is_executing(&self, handle: &str) -> Result<bool, RegistryError> {
        let state = self
            .scheduler
            .get(handle)
            .await
            .map_err(|e| RegistryError::Connection(e.to_string()))?;
        Ok(state.map(|s| !s.phase.is_terminal()).unwrap_or(false))
    }
}
