//! Operator contract: the four pipeline stage kinds and their entry points.
//!
//! An [`Operator`] pairs declarative metadata ([`OperatorSpec`]) with one of
//! exactly four behaviour variants ([`OperatorKind`]). Backends switch on the
//! kind once per stage, never per record.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use curator_core::Record;

use crate::error::{EngineError, OpError};

// ── Resource declaration ─────────────────────────────────────────────

/// Resources one worker slot of an operator needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// CPU cores per worker (0 = no CPU constraint).
    #[serde(default = "default_cpu")]
    pub cpu_required: f64,
    /// Memory per worker in GiB (0 = no hint).
    #[serde(default)]
    pub mem_required_gib: f64,
    /// Whether workers run on accelerator devices instead of CPU cores.
    #[serde(default)]
    pub uses_accelerator: bool,
}

fn default_cpu() -> f64 {
    1.0
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            cpu_required: default_cpu(),
            mem_required_gib: 0.0,
            uses_accelerator: false,
        }
    }
}

/// Declarative metadata for one pipeline stage. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorSpec {
    pub name: String,
    pub resources: ResourceSpec,
    /// User-requested parallelism; None = scheduler decides.
    pub configured_parallelism: Option<usize>,
    /// Position in the pipeline, assigned at build time.
    pub stage_index: usize,
    /// Operator parameters, forwarded verbatim to remote stage copies.
    pub params: Value,
}

// ── Entry-point traits ───────────────────────────────────────────────

/// Per-record transformation: one record in, zero or more records out.
pub trait TransformOp: Send + Sync {
    fn process(&self, record: Record) -> Result<Vec<Record>, OpError>;
}

/// Two-phase filter: enrich each record with stats, then keep or drop it.
pub trait FilterOp: Send + Sync {
    /// Attach computed statistics to the record.
    fn compute_stats(&self, record: Record) -> Result<Record, OpError>;

    /// Decide whether an enriched record is retained.
    fn predicate(&self, record: &Record) -> bool;
}

/// A pair of records the resolver judged to be duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicatePair {
    pub kept: Uuid,
    pub duplicate: Uuid,
}

/// Whole-dataset deduplication: per-record key extraction followed by a
/// global resolve pass. `resolve` is not fault-isolated; its failure
/// aborts the stage.
pub trait DedupOp: Send + Sync {
    /// Attach the dedup key to the record.
    fn compute_key(&self, record: Record) -> Result<Record, OpError>;

    /// Partition the keyed dataset into kept records and duplicate pairs.
    fn resolve(&self, records: Vec<Record>) -> Result<(Vec<Record>, Vec<DuplicatePair>), OpError>;

    /// Whether the distributed backend may run this operator by
    /// materializing the dataset. Defaults to local-only.
    fn distributed_supported(&self) -> bool {
        false
    }
}

/// Whole-dataset subset selection. Not fault-isolated.
pub trait SelectOp: Send + Sync {
    fn select(&self, records: Vec<Record>) -> Result<Vec<Record>, OpError>;

    /// See [`DedupOp::distributed_supported`].
    fn distributed_supported(&self) -> bool {
        false
    }
}

// ── Closed operator union ────────────────────────────────────────────

/// The four operator kinds. Closed on purpose: backends match on this
/// exactly once per stage.
pub enum OperatorKind {
    Transform(Box<dyn TransformOp>),
    Filter(Box<dyn FilterOp>),
    Deduplicate(Box<dyn DedupOp>),
    Select(Box<dyn SelectOp>),
}

impl OperatorKind {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            OperatorKind::Transform(_) => "transform",
            OperatorKind::Filter(_) => "filter",
            OperatorKind::Deduplicate(_) => "deduplicate",
            OperatorKind::Select(_) => "select",
        }
    }
}

/// One pipeline stage: metadata plus behaviour.
pub struct Operator {
    pub spec: OperatorSpec,
    pub kind: OperatorKind,
}

impl std::fmt::Debug for OperatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl std::fmt::Debug for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operator")
            .field("spec", &self.spec)
            .field("kind", &self.kind)
            .finish()
    }
}

// ── Pipeline spec (job submission input) ─────────────────────────────

/// Ordered operator list plus dataset references, as submitted with a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub stages: Vec<StageSpec>,
    /// Dataset source reference (opaque to the core).
    pub source: String,
    /// Result sink reference (opaque to the core).
    pub sink: String,
}

/// One entry of the submitted operator list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    /// Registered operator name.
    pub op: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub parallelism: Option<usize>,
    #[serde(default)]
    pub resources: Option<ResourceSpec>,
}

// ── Factory registry ─────────────────────────────────────────────────

/// Factory closure building an operator's behaviour from its stage spec.
pub type OperatorFactory =
    Box<dyn Fn(&StageSpec) -> Result<OperatorKind, EngineError> + Send + Sync>;

/// Maps operator names to factories so a submitted [`PipelineSpec`] can be
/// turned into an ordered [`Operator`] list without the core knowing any
/// concrete transformation logic.
#[derive(Default)]
pub struct OperatorRegistry {
    factories: HashMap<String, OperatorFactory>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under an operator name.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&StageSpec) -> Result<OperatorKind, EngineError> + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::debug!(operator = %name, "registered operator factory");
        self.factories.insert(name, Box::new(factory));
    }

    /// Build the ordered operator list for a pipeline spec.
    pub fn build(&self, pipeline: &PipelineSpec) -> Result<Vec<Arc<Operator>>, EngineError> {
        let mut operators = Vec::with_capacity(pipeline.stages.len());
        for (stage_index, stage) in pipeline.stages.iter().enumerate() {
            let factory = self
                .factories
                .get(&stage.op)
                .ok_or_else(|| EngineError::UnknownOperator(stage.op.clone()))?;
            let kind = factory(stage)?;
            operators.push(Arc::new(Operator {
                spec: OperatorSpec {
                    name: stage.op.clone(),
                    resources: stage.resources.clone().unwrap_or_default(),
                    configured_parallelism: stage.parallelism,
                    stage_index,
                    params: stage.params.clone(),
                },
                kind,
            }));
        }
        Ok(operators)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Upper;

    impl TransformOp for Upper {
        fn process(&self, mut record: Record) -> Result<Vec<Record>, OpError> {
            let text = record
                .field_str("text")
                .ok_or_else(|| OpError::Malformed("no text field".into()))?
                .to_uppercase();
            record.set_field("text", json!(text));
            Ok(vec![record])
        }
    }

    fn registry_with_upper() -> OperatorRegistry {
        let mut registry = OperatorRegistry::new();
        registry.register("upper", |_spec| Ok(OperatorKind::Transform(Box::new(Upper))));
        registry
    }

    #[test]
    fn build_assigns_stage_indices() {
        let registry = registry_with_upper();
        let pipeline = PipelineSpec {
            stages: vec![
                StageSpec {
                    op: "upper".into(),
                    params: Value::Null,
                    parallelism: Some(2),
                    resources: None,
                },
                StageSpec {
                    op: "upper".into(),
                    params: json!({"x": 1}),
                    parallelism: None,
                    resources: None,
                },
            ],
            source: "s3://in".into(),
            sink: "s3://out".into(),
        };

        let ops = registry.build(&pipeline).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].spec.stage_index, 0);
        assert_eq!(ops[1].spec.stage_index, 1);
        assert_eq!(ops[0].spec.configured_parallelism, Some(2));
        assert_eq!(ops[1].spec.params, json!({"x": 1}));
        assert_eq!(ops[0].kind.label(), "transform");
    }

    #[test]
    fn build_rejects_unknown_operator() {
        let registry = registry_with_upper();
        let pipeline = PipelineSpec {
            stages: vec![StageSpec {
                op: "nope".into(),
                params: Value::Null,
                parallelism: None,
                resources: None,
            }],
            source: String::new(),
            sink: String::new(),
        };

        let err = registry.build(&pipeline).unwrap_err();
        assert!(matches!(err, EngineError::UnknownOperator(name) if name == "nope"));
    }

    #[test]
    fn stage_spec_defaults_from_json() {
        let stage: StageSpec = serde_json::from_str(r#"{"op": "upper"}"#).unwrap();
        assert!(stage.parallelism.is_none());
        assert!(stage.resources.is_none());
        assert!(stage.params.is_null());

        let resources = stage.resources.unwrap_or_default();
        assert_eq!(resources.cpu_required, 1.0);
        assert!(!resources.uses_accelerator);
    }
}
