//! Distributed backend: stages run as remote tasks on a cluster dataset
//! engine.
//!
//! The input must already be in the engine's native partitioned form.
//! Transform and Filter map over partitions remotely; Deduplicate and
//! Select have a restricted path that materializes the full dataset onto
//! this worker (`take_all`), resolves locally, and writes the result
//! back. That materialization is a known scalability ceiling and an
//! explicit part of this backend's contract; operators that cannot
//! afford it report `distributed_supported() == false` and get a
//! backend-specific "not implemented" error.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use curator_core::Record;

use crate::backend::{Backend, StageArtifacts, StageOutput};
use crate::dataset::{Dataset, RemoteDataset};
use crate::error::EngineError;
use crate::operator::{DuplicatePair, Operator, OperatorKind};

// ── Remote stage description ─────────────────────────────────────────

/// The remotely schedulable unit for one stage: the remote side holds its
/// own operator registry and rebuilds the operator from name + params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTask {
    pub kind: StageTaskKind,
    pub operator: String,
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageTaskKind {
    /// Per-record transform, fault-isolated remotely.
    Transform,
    /// Stats + predicate, fault-isolated remotely.
    Filter,
    /// Dedup key extraction only; resolve happens on this worker.
    DedupKey,
}

impl StageTask {
    fn for_operator(kind: StageTaskKind, op: &Operator) -> Self {
        Self {
            kind,
            operator: op.spec.name.clone(),
            params: op.spec.params.clone(),
        }
    }
}

// ── Cluster dataset engine client ────────────────────────────────────

/// Narrow client contract against the cluster dataset engine.
#[async_trait]
pub trait ClusterEngine: Send + Sync {
    /// Submit `width` parallel copies of the task over the dataset's
    /// partitions and block until all complete.
    async fn map_dataset(
        &self,
        dataset: &RemoteDataset,
        task: &StageTask,
        width: usize,
    ) -> Result<RemoteDataset, EngineError>;

    /// Materialize every record of the dataset onto this worker.
    async fn take_all(&self, dataset: &RemoteDataset) -> Result<Vec<Record>, EngineError>;

    /// Write records back into the engine as a new partitioned dataset.
    async fn put_records(
        &self,
        records: Vec<Record>,
        partitions: usize,
    ) -> Result<RemoteDataset, EngineError>;
}

/// HTTP implementation of [`ClusterEngine`].
pub struct HttpClusterEngine {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct MapRequest<'a> {
    task: &'a StageTask,
    width: usize,
}

#[derive(Serialize)]
struct PutRequest {
    records: Vec<Record>,
    partitions: usize,
}

#[derive(Deserialize)]
struct RecordsResponse {
    records: Vec<Record>,
}

impl HttpClusterEngine {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ClusterEngine for HttpClusterEngine {
    async fn map_dataset(
        &self,
        dataset: &RemoteDataset,
        task: &StageTask,
        width: usize,
    ) -> Result<RemoteDataset, EngineError> {
        let url = format!("{}/v1/datasets/{}/map", self.base_url, dataset.id);
        let response = self
            .client
            .post(&url)
            .json(&MapRequest { task, width })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(EngineError::Engine(format!(
                "map on '{}' returned {}",
                dataset.id,
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    async fn take_all(&self, dataset: &RemoteDataset) -> Result<Vec<Record>, EngineError> {
        let url = format!("{}/v1/datasets/{}/records", self.base_url, dataset.id);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(EngineError::Engine(format!(
                "take_all on '{}' returned {}",
                dataset.id,
                response.status()
            )));
        }
        let body: RecordsResponse = response.json().await?;
        Ok(body.records)
    }

    async fn put_records(
        &self,
        records: Vec<Record>,
        partitions: usize,
    ) -> Result<RemoteDataset, EngineError> {
        let url = format!("{}/v1/datasets", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&PutRequest {
                records,
                partitions,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(EngineError::Engine(format!(
                "put_records returned {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}

// ── Backend ──────────────────────────────────────────────────────────

pub struct DistributedBackend {
    engine: Arc<dyn ClusterEngine>,
}

impl DistributedBackend {
    pub fn new(engine: Arc<dyn ClusterEngine>) -> Self {
        Self { engine }
    }

    fn artifacts(op: &Operator, input: &RemoteDataset, output: &RemoteDataset) -> StageArtifacts {
        StageArtifacts {
            stage_index: op.spec.stage_index,
            operator: op.spec.name.clone(),
            records_in: input.record_count,
            records_out: output.record_count,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Backend for DistributedBackend {
    async fn dispatch(
        &self,
        op: Arc<Operator>,
        input: Dataset,
        width: usize,
    ) -> Result<StageOutput, EngineError> {
        let remote = match input {
            Dataset::Remote(remote) => remote,
            Dataset::Local(_) => {
                return Err(EngineError::DatasetForm(
                    "distributed backend requires the dataset in partitioned form".into(),
                ))
            }
        };

        debug!(
            stage = op.spec.stage_index,
            operator = %op.spec.name,
            kind = op.kind.label(),
            width,
            dataset = %remote.id,
            "dispatching distributed stage"
        );

        match &op.kind {
            OperatorKind::Transform(_) => {
                let task = StageTask::for_operator(StageTaskKind::Transform, &op);
                let out = self.engine.map_dataset(&remote, &task, width).await?;
                let artifacts = Self::artifacts(&op, &remote, &out);
                Ok(StageOutput {
                    dataset: Dataset::Remote(out),
                    artifacts,
                })
            }
            OperatorKind::Filter(_) => {
                let task = StageTask::for_operator(StageTaskKind::Filter, &op);
                let out = self.engine.map_dataset(&remote, &task, width).await?;
                let artifacts = Self::artifacts(&op, &remote, &out);
                Ok(StageOutput {
                    dataset: Dataset::Remote(out),
                    artifacts,
                })
            }
            OperatorKind::Deduplicate(dedup) => {
                if !dedup.distributed_supported() {
                    return Err(EngineError::BackendUnsupported(format!(
                        "deduplicate '{}'",
                        op.spec.name
                    )));
                }
                // Remote key extraction, then materialize for the global
                // resolve pass. Full materialization is this backend's
                // documented contract.
                let task = StageTask::for_operator(StageTaskKind::DedupKey, &op);
                let keyed = self.engine.map_dataset(&remote, &task, width).await?;
                let records = self.engine.take_all(&keyed).await?;

                let resolve_op = Arc::clone(&op);
                let (kept, pairs) = tokio::task::spawn_blocking(move || {
                    match &resolve_op.kind {
                        OperatorKind::Deduplicate(dedup) => dedup.resolve(records),
                        _ => unreachable!("dispatch matched Deduplicate"),
                    }
                })
                .await
                .map_err(|e| EngineError::stage(op.spec.stage_index, &op.spec.name, e))?
                .map_err(|e| EngineError::stage(op.spec.stage_index, &op.spec.name, e))?;

                // Adopted handles may carry an unknown partition count.
                let out = self
                    .engine
                    .put_records(kept, keyed.partitions.max(1))
                    .await?;
                let mut artifacts = Self::artifacts(&op, &remote, &out);
                artifacts.duplicate_pairs = pairs;
                Ok(StageOutput {
                    dataset: Dataset::Remote(out),
                    artifacts,
                })
            }
            OperatorKind::Select(select) => {
                if !select.distributed_supported() {
                    return Err(EngineError::BackendUnsupported(format!(
                        "select '{}'",
                        op.spec.name
                    )));
                }
                let records = self.engine.take_all(&remote).await?;

                let select_op = Arc::clone(&op);
                let subset = tokio::task::spawn_blocking(move || match &select_op.kind {
                    OperatorKind::Select(select) => select.select(records),
                    _ => unreachable!("dispatch matched Select"),
                })
                .await
                .map_err(|e| EngineError::stage(op.spec.stage_index, &op.spec.name, e))?
                .map_err(|e| EngineError::stage(op.spec.stage_index, &op.spec.name, e))?;

                let out = self
                    .engine
                    .put_records(subset, remote.partitions.max(1))
                    .await?;
                let artifacts = Self::artifacts(&op, &remote, &out);
                Ok(StageOutput {
                    dataset: Dataset::Remote(out),
                    artifacts,
                })
            }
        }
    }

    fn name(&self) -> &'static str {
        "distributed"
    }
}
