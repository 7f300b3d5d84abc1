//! In-process backend: a bounded rayon pool sized to the stage width.

use std::sync::Arc;

use async_trait::async_trait;
use rayon::prelude::*;
use tracing::debug;

use curator_core::Record;

use crate::backend::{Backend, StageArtifacts, StageOutput};
use crate::dataset::Dataset;
use crate::error::EngineError;
use crate::isolate::FaultGuard;
use crate::operator::{DuplicatePair, Operator, OperatorKind};

/// Bounded worker pool over a materialized dataset.
///
/// Accelerator operators get `width` slots like any other stage; the
/// width itself already reflects the per-device memory partition computed
/// by the resource estimator.
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn dispatch(
        &self,
        op: Arc<Operator>,
        input: Dataset,
        width: usize,
    ) -> Result<StageOutput, EngineError> {
        let records = match input {
            Dataset::Local(records) => records,
            Dataset::Remote(_) => {
                return Err(EngineError::DatasetForm(
                    "local backend requires a materialized dataset".into(),
                ))
            }
        };

        let records_in = records.len() as u64;
        debug!(
            stage = op.spec.stage_index,
            operator = %op.spec.name,
            kind = op.kind.label(),
            width,
            records = records_in,
            "dispatching local stage"
        );

        let stage_op = Arc::clone(&op);
        let (out, dropped, pairs) =
            tokio::task::spawn_blocking(move || run_stage(&stage_op, records, width))
                .await
                .map_err(|e| EngineError::stage(op.spec.stage_index, &op.spec.name, e))??;

        let artifacts = StageArtifacts {
            stage_index: op.spec.stage_index,
            operator: op.spec.name.clone(),
            records_in: Some(records_in),
            records_out: Some(out.len() as u64),
            dropped,
            duplicate_pairs: pairs,
            ..Default::default()
        };

        Ok(StageOutput {
            dataset: Dataset::Local(out),
            artifacts,
        })
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

type StageResult = Result<(Vec<Record>, u64, Vec<DuplicatePair>), EngineError>;

/// Run one stage on a dedicated pool of `width` threads. Blocking.
fn run_stage(op: &Operator, records: Vec<Record>, width: usize) -> StageResult {
    let stage = op.spec.stage_index;
    let name = op.spec.name.as_str();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(width)
        .build()
        .map_err(|e| EngineError::stage(stage, name, e))?;

    match &op.kind {
        OperatorKind::Transform(transform) => {
            let guard = FaultGuard::new(&op.spec);
            let out: Vec<Record> = pool.install(|| {
                records
                    .into_par_iter()
                    .flat_map(|record| guard.process(transform.as_ref(), record))
                    .collect()
            });
            Ok((out, guard.dropped(), Vec::new()))
        }
        OperatorKind::Filter(filter) => {
            let guard = FaultGuard::new(&op.spec);
            let out: Vec<Record> = pool.install(|| {
                records
                    .into_par_iter()
                    .filter_map(|record| guard.compute_stats(filter.as_ref(), record))
                    .filter(|record| filter.predicate(record))
                    .collect()
            });
            Ok((out, guard.dropped(), Vec::new()))
        }
        OperatorKind::Deduplicate(dedup) => {
            // Key extraction is not record-isolated; a failure here is a
            // stage-level error.
            let keyed: Result<Vec<Record>, _> = pool.install(|| {
                records
                    .into_par_iter()
                    .map(|record| dedup.compute_key(record))
                    .collect()
            });
            let keyed = keyed.map_err(|e| EngineError::stage(stage, name, e))?;
            let (kept, pairs) = dedup
                .resolve(keyed)
                .map_err(|e| EngineError::stage(stage, name, e))?;
            Ok((kept, 0, pairs))
        }
        OperatorKind::Select(select) => {
            let out = select
                .select(records)
                .map_err(|e| EngineError::stage(stage, name, e))?;
            Ok((out, 0, Vec::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OpError;
    use crate::operator::{
        DedupOp, FilterOp, OperatorSpec, ResourceSpec, SelectOp, TransformOp,
    };
    use serde_json::json;
    use std::collections::HashSet;

    fn operator(name: &str, kind: OperatorKind) -> Arc<Operator> {
        Arc::new(Operator {
            spec: OperatorSpec {
                name: name.into(),
                resources: ResourceSpec::default(),
                configured_parallelism: None,
                stage_index: 0,
                params: serde_json::Value::Null,
            },
            kind,
        })
    }

    fn records(texts: &[&str]) -> Vec<Record> {
        texts
            .iter()
            .map(|t| Record::new(json!({"text": t})))
            .collect()
    }

    struct Upper;

    impl TransformOp for Upper {
        fn process(&self, mut record: Record) -> Result<Vec<Record>, OpError> {
            let text = record
                .field_str("text")
                .ok_or_else(|| OpError::Malformed("no text".into()))?
                .to_uppercase();
            record.set_field("text", json!(text));
            Ok(vec![record])
        }
    }

    struct MinLen(usize);

    impl FilterOp for MinLen {
        fn compute_stats(&self, mut record: Record) -> Result<Record, OpError> {
            let len = record
                .field_str("text")
                .ok_or_else(|| OpError::Malformed("no text".into()))?
                .len();
            record.set_field("len", json!(len));
            Ok(record)
        }

        fn predicate(&self, record: &Record) -> bool {
            record.field_f64("len").unwrap_or(0.0) >= self.0 as f64
        }
    }

    struct ExactDedup;

    impl DedupOp for ExactDedup {
        fn compute_key(&self, mut record: Record) -> Result<Record, OpError> {
            let key = record
                .field_str("text")
                .ok_or_else(|| OpError::Malformed("no text".into()))?
                .to_string();
            record.set_field("dedup_key", json!(key));
            Ok(record)
        }

        fn resolve(
            &self,
            records: Vec<Record>,
        ) -> Result<(Vec<Record>, Vec<DuplicatePair>), OpError> {
            let mut seen: std::collections::HashMap<String, uuid::Uuid> = Default::default();
            let mut kept = Vec::new();
            let mut pairs = Vec::new();
            for record in records {
                let key = record.field_str("dedup_key").unwrap_or_default().to_string();
                match seen.get(&key) {
                    Some(kept_id) => pairs.push(DuplicatePair {
                        kept: *kept_id,
                        duplicate: record.id,
                    }),
                    None => {
                        seen.insert(key, record.id);
                        kept.push(record);
                    }
                }
            }
            Ok((kept, pairs))
        }
    }

    struct TakeFirst(usize);

    impl SelectOp for TakeFirst {
        fn select(&self, mut records: Vec<Record>) -> Result<Vec<Record>, OpError> {
            records.truncate(self.0);
            Ok(records)
        }
    }

    struct FailingSelect;

    impl SelectOp for FailingSelect {
        fn select(&self, _records: Vec<Record>) -> Result<Vec<Record>, OpError> {
            Err(OpError::Other("ranking model unavailable".into()))
        }
    }

    #[tokio::test]
    async fn transform_runs_in_parallel_and_isolates_failures() {
        let backend = LocalBackend::new();
        let op = operator("upper", OperatorKind::Transform(Box::new(Upper)));

        let mut input = records(&["a", "b", "c"]);
        input.push(Record::new(json!({"no_text": 1})));

        let out = backend
            .dispatch(op, Dataset::local(input), 4)
            .await
            .unwrap();

        let records = match out.dataset {
            Dataset::Local(r) => r,
            _ => panic!("expected local dataset"),
        };
        let texts: HashSet<&str> = records.iter().filter_map(|r| r.field_str("text")).collect();
        assert_eq!(texts, HashSet::from(["A", "B", "C"]));
        assert_eq!(out.artifacts.dropped, 1);
        assert_eq!(out.artifacts.records_in, Some(4));
        assert_eq!(out.artifacts.records_out, Some(3));
    }

    #[tokio::test]
    async fn filter_keeps_enriched_records_passing_predicate() {
        let backend = LocalBackend::new();
        let op = operator("min-len", OperatorKind::Filter(Box::new(MinLen(3))));

        let out = backend
            .dispatch(op, Dataset::local(records(&["aa", "bbbb", "ccccc"])), 2)
            .await
            .unwrap();

        let records = match out.dataset {
            Dataset::Local(r) => r,
            _ => panic!("expected local dataset"),
        };
        assert_eq!(records.len(), 2);
        // Stats computed by the filter stay on the surviving records.
        assert!(records.iter().all(|r| r.field_f64("len").is_some()));
    }

    #[tokio::test]
    async fn dedup_reports_duplicate_pairs() {
        let backend = LocalBackend::new();
        let op = operator("exact", OperatorKind::Deduplicate(Box::new(ExactDedup)));

        let out = backend
            .dispatch(op, Dataset::local(records(&["x", "y", "x", "x"])), 2)
            .await
            .unwrap();

        assert_eq!(out.dataset.len_hint(), Some(2));
        assert_eq!(out.artifacts.duplicate_pairs.len(), 2);
    }

    #[tokio::test]
    async fn select_failure_is_a_stage_error() {
        let backend = LocalBackend::new();
        let op = operator("broken", OperatorKind::Select(Box::new(FailingSelect)));

        let err = backend
            .dispatch(op, Dataset::local(records(&["a"])), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StageSetup { operator, .. } if operator == "broken"));
    }

    #[tokio::test]
    async fn select_truncates_dataset() {
        let backend = LocalBackend::new();
        let op = operator("take-2", OperatorKind::Select(Box::new(TakeFirst(2))));

        let out = backend
            .dispatch(op, Dataset::local(records(&["a", "b", "c", "d"])), 1)
            .await
            .unwrap();
        assert_eq!(out.dataset.len_hint(), Some(2));
    }

    #[tokio::test]
    async fn remote_dataset_is_rejected() {
        let backend = LocalBackend::new();
        let op = operator("upper", OperatorKind::Transform(Box::new(Upper)));
        let remote = Dataset::Remote(crate::dataset::RemoteDataset {
            id: "ds".into(),
            partitions: 2,
            record_count: None,
        });

        let err = backend.dispatch(op, remote, 2).await.unwrap_err();
        assert!(matches!(err, EngineError::DatasetForm(_)));
    }
}
