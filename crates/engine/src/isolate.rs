//! Per-record fault isolation.
//!
//! A single malformed record among millions must not abort its stage.
//! [`FaultGuard`] is composed explicitly by the backends around the
//! per-record entry points (`TransformOp::process`,
//! `FilterOp::compute_stats`): a failing record is logged, counted, and
//! dropped. Whole-dataset entry points (`DedupOp::resolve`,
//! `SelectOp::select`) are deliberately not guarded; their failures are
//! stage-level errors.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;
use uuid::Uuid;

use curator_core::Record;

use crate::error::OpError;
use crate::operator::{FilterOp, OperatorSpec, TransformOp};

/// Fault-isolation wrapper for one stage's per-record entry points.
pub struct FaultGuard {
    stage: usize,
    operator: String,
    dropped: AtomicU64,
}

impl FaultGuard {
    pub fn new(spec: &OperatorSpec) -> Self {
        Self {
            stage: spec.stage_index,
            operator: spec.name.clone(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Records dropped by this guard so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Isolated `TransformOp::process`: a failing record yields no output.
    pub fn process(&self, op: &dyn TransformOp, record: Record) -> Vec<Record> {
        let id = record.id;
        self.guard(id, || op.process(record)).unwrap_or_default()
    }

    /// Isolated `FilterOp::compute_stats`: a failing record is dropped
    /// before the predicate ever sees it.
    pub fn compute_stats(&self, op: &dyn FilterOp, record: Record) -> Option<Record> {
        let id = record.id;
        self.guard(id, || op.compute_stats(record))
    }

    /// Run one per-record call, containing both `Err` returns and panics.
    fn guard<T>(&self, record_id: Uuid, f: impl FnOnce() -> Result<T, OpError>) -> Option<T> {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    stage = self.stage,
                    operator = %self.operator,
                    record = %record_id,
                    error = %e,
                    "record dropped"
                );
                None
            }
            Err(panic) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                let msg = panic_message(&panic);
                warn!(
                    stage = self.stage,
                    operator = %self.operator,
                    record = %record_id,
                    panic = %msg,
                    "record dropped after panic"
                );
                None
            }
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
