use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Job lifecycle states. Forward-only: Queued → Processing → one of the
/// terminal states. Nothing ever moves back out of a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Finished,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed | JobStatus::Stopped)
    }

    /// Legal forward transitions only.
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Finished)
                | (JobStatus::Processing, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Stopped)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "finished" => Ok(JobStatus::Finished),
            "failed" => Ok(JobStatus::Failed),
            "stopped" => Ok(JobStatus::Stopped),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// One externally tracked, end-to-end pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub host: Option<String>,
    pub worker_id: Option<String>,
    /// Handle of the cluster task running this job, when distributed.
    pub external_task_handle: Option<String>,
    pub record_count: Option<i64>,
    /// Cooperative stop flag, polled at stage boundaries.
    pub stop_requested: bool,
    /// Submitted pipeline spec (ordered operator list + source/sink).
    pub pipeline: Value,
}

impl Job {
    pub fn new(pipeline: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Queued,
            created_at: Utc::now(),
            finished_at: None,
            host: None,
            worker_id: None,
            external_task_handle: None,
            record_count: None,
            stop_requested: false,
            pipeline,
        }
    }
}

/// Periodic liveness signal from a worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub host: String,
    pub last_seen_at: DateTime<Utc>,
    pub active_job_count: i32,
}

impl WorkerHeartbeat {
    /// Online iff the heartbeat is younger than the staleness threshold.
    pub fn is_online(&self, staleness: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_seen_at)
            .to_std()
            .map(|age| age < staleness)
            .unwrap_or(true) // future-dated heartbeat counts as fresh
    }
}

/// Marks a specific running execution of a job, used to detect stale or
/// dual ownership. Inserted at claim time, removed when the run ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveProcessEntry {
    pub job_id: Uuid,
    pub process_id: i32,
    pub host: String,
    pub worker_id: String,
}

impl ActiveProcessEntry {
    /// Registry key: `"{job_id}:{process_id}"`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.job_id, self.process_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_forward_only() {
        use JobStatus::*;

        assert!(Queued.can_advance_to(Processing));
        assert!(Processing.can_advance_to(Finished));
        assert!(Processing.can_advance_to(Failed));
        assert!(Processing.can_advance_to(Stopped));

        // No backward or skipping moves.
        assert!(!Queued.can_advance_to(Finished));
        assert!(!Finished.can_advance_to(Processing));
        assert!(!Failed.can_advance_to(Queued));
        assert!(!Stopped.can_advance_to(Processing));
        assert!(!Processing.can_advance_to(Queued));
    }

    #[test]
    fn terminal_states() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Finished.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Stopped.is_terminal());
    }

    #[test]
    fn status_string_roundtrip() {
        for status in [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Finished,
            JobStatus::Failed,
            JobStatus::Stopped,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn heartbeat_staleness_classification() {
        let now = Utc::now();
        let fresh = WorkerHeartbeat {
            worker_id: "w1".into(),
            host: "h1".into(),
            last_seen_at: now - chrono::Duration::seconds(30),
            active_job_count: 1,
        };
        let stale = WorkerHeartbeat {
            last_seen_at: now - chrono::Duration::seconds(120),
            ..fresh.clone()
        };

        let staleness = Duration::from_secs(90);
        assert!(fresh.is_online(staleness, now));
        assert!(!stale.is_online(staleness, now));
    }

    #[test]
    fn active_process_key_format() {
        let entry = ActiveProcessEntry {
            job_id: Uuid::nil(),
            process_id: 4242,
            host: "h".into(),
            worker_id: "w".into(),
        };
        assert_eq!(
            entry.key(),
            "00000000-0000-0000-0000-000000000000:4242"
        );
    }
}
