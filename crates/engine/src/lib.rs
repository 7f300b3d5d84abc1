pub mod backend;
pub mod dataset;
pub mod error;
pub mod isolate;
pub mod operator;
pub mod resources;
pub mod runner;
pub mod trace;

pub use backend::{
    Backend, ClusterEngine, DistributedBackend, HttpClusterEngine, LocalBackend, StageArtifacts,
    StageOutput, StageTask, StageTaskKind,
};
pub use dataset::{Dataset, RemoteDataset};
pub use error::{EngineError, OpError};
pub use isolate::FaultGuard;
pub use operator::{
    DedupOp, DuplicatePair, FilterOp, Operator, OperatorKind, OperatorRegistry, OperatorSpec,
    PipelineSpec, ResourceSpec, SelectOp, StageSpec, TransformOp,
};
pub use resources::{width, Capacity};
pub use runner::{PipelineRunner, RunOutcome, RunReport, RunStatus, StopSignal};
pub use trace::{Checkpointer, StageTrace, Tracer};
