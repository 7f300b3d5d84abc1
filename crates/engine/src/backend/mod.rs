//! Execution backends.
//!
//! Both backends expose the same `dispatch` contract so the runner is
//! backend-agnostic: one operator, one input dataset, one width, one
//! fully-completed output. Which backend runs is a configuration choice
//! made once per job; call sites never type-switch.

pub mod distributed;
pub mod local;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::dataset::Dataset;
use crate::error::EngineError;
use crate::operator::{DuplicatePair, Operator};
use crate::trace::StageTrace;

pub use distributed::{ClusterEngine, DistributedBackend, HttpClusterEngine, StageTask, StageTaskKind};
pub use local::LocalBackend;

/// Side artifacts produced by one completed stage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageArtifacts {
    pub stage_index: usize,
    pub operator: String,
    pub records_in: Option<u64>,
    pub records_out: Option<u64>,
    /// Records dropped by fault isolation.
    pub dropped: u64,
    pub duplicate_pairs: Vec<DuplicatePair>,
    pub duration: Duration,
    pub trace: Option<StageTrace>,
}

/// Result of dispatching one stage.
#[derive(Debug)]
pub struct StageOutput {
    pub dataset: Dataset,
    pub artifacts: StageArtifacts,
}

/// Execution strategy for a single stage.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Run one operator over the dataset at the given width. Returns only
    /// after the stage fully completes.
    async fn dispatch(
        &self,
        op: Arc<Operator>,
        input: Dataset,
        width: usize,
    ) -> Result<StageOutput, EngineError>;

    /// Backend name for logging.
    fn name(&self) -> &'static str;
}
