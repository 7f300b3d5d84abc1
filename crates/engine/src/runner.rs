//! Stage-at-a-time pipeline execution.
//!
//! The runner is single-threaded at the stage level: each stage fully
//! completes (a hard barrier) before the next starts, while the backend
//! fans each stage out across `width` workers internally. A cooperative
//! stop is observed only at stage boundaries; a dispatched stage always
//! runs to completion.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::backend::{Backend, StageArtifacts};
use crate::dataset::Dataset;
use crate::error::EngineError;
use crate::operator::Operator;
use crate::resources::{self, Capacity};
use crate::trace::{Checkpointer, StageTrace, Tracer};

/// Polled between stages; flipping it requests a cooperative stop.
#[async_trait]
pub trait StopSignal: Send + Sync {
    async fn should_stop(&self) -> bool;
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    Completed,
    /// Stop observed at a stage boundary; remaining stages were skipped.
    Stopped,
}

/// Per-run summary: status plus every stage's side artifacts.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub stages: Vec<StageArtifacts>,
    /// Final record count, when known without materializing.
    pub record_count: Option<u64>,
}

/// Result dataset plus the run report.
#[derive(Debug)]
pub struct RunOutcome {
    pub dataset: Dataset,
    pub report: RunReport,
}

/// Runs an ordered operator list against a dataset via one backend.
pub struct PipelineRunner {
    backend: Arc<dyn Backend>,
    capacity: Capacity,
    tracer: Option<Tracer>,
    checkpointer: Option<Checkpointer>,
    stop: Option<Arc<dyn StopSignal>>,
}

impl PipelineRunner {
    pub fn new(backend: Arc<dyn Backend>, capacity: Capacity) -> Self {
        Self {
            backend,
            capacity,
            tracer: None,
            checkpointer: None,
            stop: None,
        }
    }

    pub fn with_tracer(mut self, tracer: Tracer) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn with_checkpointer(mut self, checkpointer: Checkpointer) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn with_stop_signal(mut self, stop: Arc<dyn StopSignal>) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Execute the pipeline. Any stage-level error aborts the run; the
    /// caller marks the job Failed.
    pub async fn run(
        &self,
        job_id: Uuid,
        operators: &[Arc<Operator>],
        input: Dataset,
    ) -> Result<RunOutcome, EngineError> {
        let mut dataset = input;
        let mut stages = Vec::with_capacity(operators.len());

        // Resume after the last checkpointed stage, if one exists.
        let mut first_stage = 0;
        if let Some(cp) = &self.checkpointer {
            if let Some((stage_index, checkpointed)) = cp.load_latest(job_id)? {
                first_stage = stage_index + 1;
                dataset = checkpointed;
            }
        }

        info!(
            job = %job_id,
            backend = self.backend.name(),
            stages = operators.len(),
            first_stage,
            "pipeline run starting"
        );

        for (stage_index, op) in operators.iter().enumerate().skip(first_stage) {
            if let Some(stop) = &self.stop {
                if stop.should_stop().await {
                    info!(job = %job_id, stage = stage_index, "stop observed at stage boundary");
                    return Ok(RunOutcome {
                        report: RunReport {
                            status: RunStatus::Stopped,
                            stages,
                            record_count: dataset.len_hint(),
                        },
                        dataset,
                    });
                }
            }

            let width = resources::width(&op.spec, &self.capacity);
            let before = self.tracer.as_ref().map(|t| t.sample(&dataset));

            let started = Instant::now();
            let output = self
                .backend
                .dispatch(Arc::clone(op), dataset, width)
                .await
                .map_err(|e| {
                    error!(
                        job = %job_id,
                        stage = stage_index,
                        operator = %op.spec.name,
                        error = %e,
                        "stage failed"
                    );
                    e
                })?;

            dataset = output.dataset;
            let mut artifacts = output.artifacts;
            artifacts.duration = started.elapsed();

            if let (Some(tracer), Some(before)) = (&self.tracer, before) {
                artifacts.trace = Some(StageTrace {
                    stage_index,
                    operator: op.spec.name.clone(),
                    before,
                    after: tracer.sample(&dataset),
                });
            }

            if let Some(cp) = &self.checkpointer {
                cp.save(job_id, stage_index, &dataset)?;
            }

            info!(
                job = %job_id,
                stage = stage_index,
                operator = %op.spec.name,
                width,
                records_out = ?artifacts.records_out,
                dropped = artifacts.dropped,
                elapsed = ?artifacts.duration,
                "stage complete"
            );
            stages.push(artifacts);
        }

        let record_count = dataset.len_hint();
        info!(job = %job_id, record_count = ?record_count, "pipeline run complete");
        Ok(RunOutcome {
            report: RunReport {
                status: RunStatus::Completed,
                stages,
                record_count,
            },
            dataset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use crate::error::OpError;
    use crate::operator::{
        FilterOp, OperatorKind, OperatorSpec, ResourceSpec, TransformOp,
    };
    use curator_core::Record;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn capacity() -> Capacity {
        Capacity {
            cpu_cores: 4,
            mem_gib: 0.0,
            accelerator_count: 0,
            accelerator_mem_gib: 0.0,
        }
    }

    fn operator(name: &str, stage_index: usize, kind: OperatorKind) -> Arc<Operator> {
        Arc::new(Operator {
            spec: OperatorSpec {
                name: name.into(),
                resources: ResourceSpec::default(),
                configured_parallelism: None,
                stage_index,
                params: serde_json::Value::Null,
            },
            kind,
        })
    }

    /// Fails records whose "i" is in the reject list; passes others through.
    struct Rejecting(Vec<u64>);

    impl TransformOp for Rejecting {
        fn process(&self, record: Record) -> Result<Vec<Record>, OpError> {
            let i = record.field_f64("i").unwrap_or(-1.0) as u64;
            if self.0.contains(&i) {
                return Err(OpError::Malformed(format!("record {i}")));
            }
            Ok(vec![record])
        }
    }

    /// Keeps records with "i" below the threshold.
    struct Below(u64);

    impl FilterOp for Below {
        fn compute_stats(&self, record: Record) -> Result<Record, OpError> {
            Ok(record)
        }

        fn predicate(&self, record: &Record) -> bool {
            (record.field_f64("i").unwrap_or(f64::MAX) as u64) < self.0
        }
    }

    fn numbered(n: u64) -> Vec<Record> {
        (0..n).map(|i| Record::new(json!({"i": i}))).collect()
    }

    #[tokio::test]
    async fn transform_then_filter_scenario() {
        // 100 records, 5 fail the transform, filter keeps 40 of the rest.
        let runner = PipelineRunner::new(Arc::new(LocalBackend::new()), capacity());
        let operators = vec![
            operator(
                "t1",
                0,
                OperatorKind::Transform(Box::new(Rejecting(vec![0, 1, 2, 3, 4]))),
            ),
            operator("f1", 1, OperatorKind::Filter(Box::new(Below(45)))),
        ];

        let outcome = runner
            .run(Uuid::new_v4(), &operators, Dataset::local(numbered(100)))
            .await
            .unwrap();

        assert_eq!(outcome.report.status, RunStatus::Completed);
        assert_eq!(outcome.report.stages[0].records_out, Some(95));
        assert_eq!(outcome.report.stages[0].dropped, 5);
        assert_eq!(outcome.report.record_count, Some(40));
    }

    #[tokio::test]
    async fn stage_error_aborts_run() {
        struct Exploding;

        impl TransformOp for Exploding {
            fn process(&self, record: Record) -> Result<Vec<Record>, OpError> {
                Ok(vec![record])
            }
        }

        struct BrokenSelect;

        impl crate::operator::SelectOp for BrokenSelect {
            fn select(&self, _records: Vec<Record>) -> Result<Vec<Record>, OpError> {
                Err(OpError::Other("no ranking".into()))
            }
        }

        let runner = PipelineRunner::new(Arc::new(LocalBackend::new()), capacity());
        let operators = vec![
            operator("ok", 0, OperatorKind::Transform(Box::new(Exploding))),
            operator("broken", 1, OperatorKind::Select(Box::new(BrokenSelect))),
        ];

        let err = runner
            .run(Uuid::new_v4(), &operators, Dataset::local(numbered(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StageSetup { stage: 1, .. }));
    }

    struct FlagStop(AtomicBool);

    #[async_trait]
    impl StopSignal for FlagStop {
        async fn should_stop(&self) -> bool {
            self.0.load(Ordering::Relaxed)
        }
    }

    #[tokio::test]
    async fn stop_is_observed_between_stages_only() {
        // Stop is requested before the run begins: stage 0 never starts.
        let stop = Arc::new(FlagStop(AtomicBool::new(true)));
        let runner = PipelineRunner::new(Arc::new(LocalBackend::new()), capacity())
            .with_stop_signal(stop);

        let operators = vec![operator(
            "t",
            0,
            OperatorKind::Transform(Box::new(Rejecting(vec![]))),
        )];

        let outcome = runner
            .run(Uuid::new_v4(), &operators, Dataset::local(numbered(10)))
            .await
            .unwrap();
        assert_eq!(outcome.report.status, RunStatus::Stopped);
        assert!(outcome.report.stages.is_empty());
        assert_eq!(outcome.report.record_count, Some(10));
    }

    /// Counts dispatches so resume behavior is observable.
    struct CountingTransform(Arc<AtomicUsize>);

    impl TransformOp for CountingTransform {
        fn process(&self, record: Record) -> Result<Vec<Record>, OpError> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(vec![record])
        }
    }

    #[tokio::test]
    async fn resume_skips_checkpointed_stages() {
        let dir = tempfile::tempdir().unwrap();
        let job = Uuid::new_v4();
        let stage0_calls = Arc::new(AtomicUsize::new(0));
        let stage1_calls = Arc::new(AtomicUsize::new(0));

        let operators = vec![
            operator(
                "s0",
                0,
                OperatorKind::Transform(Box::new(CountingTransform(stage0_calls.clone()))),
            ),
            operator(
                "s1",
                1,
                OperatorKind::Transform(Box::new(CountingTransform(stage1_calls.clone()))),
            ),
        ];

        // Simulate a prior run that completed stage 0.
        let cp = Checkpointer::new(dir.path());
        cp.save(job, 0, &Dataset::local(numbered(7))).unwrap();

        let runner = PipelineRunner::new(Arc::new(LocalBackend::new()), capacity())
            .with_checkpointer(Checkpointer::new(dir.path()));
        let outcome = runner
            .run(job, &operators, Dataset::local(numbered(100)))
            .await
            .unwrap();

        assert_eq!(stage0_calls.load(Ordering::Relaxed), 0);
        assert_eq!(stage1_calls.load(Ordering::Relaxed), 7);
        assert_eq!(outcome.report.record_count, Some(7));
    }

    #[tokio::test]
    async fn tracer_attaches_before_after_samples() {
        let runner = PipelineRunner::new(Arc::new(LocalBackend::new()), capacity())
            .with_tracer(Tracer::new(2));
        let operators = vec![operator(
            "t",
            0,
            OperatorKind::Transform(Box::new(Rejecting(vec![]))),
        )];

        let outcome = runner
            .run(Uuid::new_v4(), &operators, Dataset::local(numbered(5)))
            .await
            .unwrap();

        let trace = outcome.report.stages[0].trace.as_ref().unwrap();
        assert_eq!(trace.before.len(), 2);
        assert_eq!(trace.after.len(), 2);
    }
}
