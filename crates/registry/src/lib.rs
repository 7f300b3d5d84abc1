//! Externalized job registry: job rows, worker heartbeats, and the
//! lifecycle manager that drives the forward-only job state machine.

pub mod error;
pub mod job;
pub mod lifecycle;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::RegistryError;
pub use job::{ActiveProcessEntry, Job, JobStatus, WorkerHeartbeat};
pub use lifecycle::{JobLifecycleManager, SweepReport, TaskRegistry, WorkerState};
pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;
pub use store::{with_retry, JobStore, StatusUpdate};
