//! Cluster workflow bridge: submits registry jobs as scheduler tasks and
//! settles their terminal states from the scheduler's event stream.

pub mod artifact;
pub mod bridge;
pub mod error;
pub mod scheduler;

pub use bridge::{WorkflowBridge, JOB_ID_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
pub use error::BridgeError;
pub use scheduler::{
    ClusterScheduler, HttpClusterScheduler, TaskPhase, TaskSpec, TaskState, WatchPage,
};
