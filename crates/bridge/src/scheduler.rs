//! Client contract for the external cluster scheduler.
//!
//! The scheduler runs containerized tasks and exposes a small HTTP API:
//! submit, point lookup, label-filtered list, and a cursored event watch.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::BridgeError;

/// Container resource shape for one task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResources {
    /// CPU cores (fractional allowed).
    pub cpu: f64,
    /// Memory in GiB (0 = scheduler default).
    pub mem_gib: f64,
    /// Accelerator devices.
    pub accelerators: u32,
}

/// Task submission payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub requests: TaskResources,
    #[serde(default)]
    pub limits: TaskResources,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Scheduler-side task phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskPhase::Succeeded | TaskPhase::Failed)
    }
}

/// Observed state of one scheduler task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    /// Scheduler-assigned opaque handle.
    pub handle: String,
    pub phase: TaskPhase,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// One page of the cursored watch stream.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchPage {
    pub events: Vec<TaskState>,
    /// Resume cursor for the next watch call.
    pub cursor: String,
}

#[async_trait]
pub trait ClusterScheduler: Send + Sync {
    async fn submit(&self, spec: &TaskSpec) -> Result<TaskState, BridgeError>;

    async fn get(&self, handle: &str) -> Result<Option<TaskState>, BridgeError>;

    /// All tasks matching `label=value`.
    async fn list(&self, label: &str, value: &str) -> Result<Vec<TaskState>, BridgeError>;

    /// Long-poll for task state changes after `cursor`. A `None` cursor
    /// starts from the current stream position.
    async fn watch(
        &self,
        label: &str,
        value: &str,
        cursor: Option<&str>,
    ) -> Result<WatchPage, BridgeError>;
}

/// HTTP client for the scheduler API.
pub struct HttpClusterScheduler {
    http: reqwest::Client,
    base_url: String,
}

impl HttpClusterScheduler {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ClusterScheduler for HttpClusterScheduler {
    async fn submit(&self, spec: &TaskSpec) -> Result<TaskState, BridgeError> {
        let url = format!("{}/v1/tasks", self.base_url);
        debug!(task = %spec.name, "submitting scheduler task");
        let response = self.http.post(&url).json(spec).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::Scheduler(format!(
                "submit returned {}: {}",
                status, body
            )));
        }
        Ok(response.json().await?)
    }

    async fn get(&self, handle: &str) -> Result<Option<TaskState>, BridgeError> {
        let url = format!("{}/v1/tasks/{}", self.base_url, handle);
        let response = self.http.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json().await?))
    }

    async fn list(&self, label: &str, value: &str) -> Result<Vec<TaskState>, BridgeError> {
        let url = format!("{}/v1/tasks", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("label", format!("{}={}", label, value))])
            .send()
            .await?;
        Ok(response.error_for_status()?.json().await?)
    }

    async fn watch(
        &self,
        label: &str,
        value: &str,
        cursor: Option<&str>,
    ) -> Result<WatchPage, BridgeError> {
        let url = format!("{}/v1/tasks/watch", self.base_url);
        let mut request = self
            .http
            .get(&url)
            .query(&[("label", format!("{}={}", label, value))]);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }
        let response = request.send().await?;
        Ok(response.error_for_status()?.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_phases() {
        assert!(!TaskPhase::Pending.is_terminal());
        assert!(!TaskPhase::Running.is_terminal());
        assert!(TaskPhase::Succeeded.is_terminal());
        assert!(TaskPhase::Failed.is_terminal());
    }

    #[test]
    fn task_spec_encodes_resources() {
        let spec = TaskSpec {
            name: "t".into(),
            image: "img".into(),
            command: vec!["run".into()],
            env: BTreeMap::new(),
            requests: TaskResources {
                cpu: 2.0,
                mem_gib: 4.0,
                accelerators: 1,
            },
            limits: TaskResources {
                cpu: 2.0,
                mem_gib: 4.0,
                accelerators: 1,
            },
            labels: BTreeMap::new(),
        };
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["requests"]["cpu"], 2.0);
        assert_eq!(value["limits"]["mem_gib"], 4.0);
        assert_eq!(value["requests"]["accelerators"], 1);
    }

    #[test]
    fn task_state_decodes_without_optional_fields() {
        let state: TaskState =
            serde_json::from_str(r#"{"handle": "t-1", "phase": "running"}"#).unwrap();
        assert_eq!(state.phase, TaskPhase::Running);
        assert!(state.message.is_none());
        assert!(state.labels.is_empty());
    }
}
