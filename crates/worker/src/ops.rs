//! Built-in curation operators registered by the worker.
//!
//! Covers the common text-curation stages: whitespace normalization,
//! length filtering, exact-hash deduplication, and head selection. Domain
//! teams extend the registry with their own factories.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde_json::json;

use curator_core::Record;
use curator_engine::{
    DedupOp, DuplicatePair, EngineError, FilterOp, OpError, OperatorKind, OperatorRegistry,
    SelectOp, StageSpec, TransformOp,
};

/// Registry with every built-in operator installed.
pub fn default_registry() -> OperatorRegistry {
    let mut registry = OperatorRegistry::new();
    registry.register("normalize_whitespace", |_spec| {
        Ok(OperatorKind::Transform(Box::new(NormalizeWhitespace)))
    });
    registry.register("length_filter", |spec: &StageSpec| {
        let min = spec.params.get("min_chars").and_then(|v| v.as_u64()).unwrap_or(1);
        let max = spec.params.get("max_chars").and_then(|v| v.as_u64());
        Ok(OperatorKind::Filter(Box::new(LengthFilter { min, max })))
    });
    registry.register("exact_dedup", |_spec| {
        Ok(OperatorKind::Deduplicate(Box::new(ExactDedup)))
    });
    registry.register("head_select", |spec: &StageSpec| {
        let n = spec
            .params
            .get("n")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| EngineError::Engine("head_select requires params.n".into()))?;
        Ok(OperatorKind::Select(Box::new(HeadSelect { n: n as usize })))
    });
    registry
}

fn text_of(record: &Record) -> Result<&str, OpError> {
    record
        .field_str("text")
        .ok_or_else(|| OpError::Malformed("missing text field".into()))
}

/// Collapses runs of whitespace to single spaces and trims the ends.
struct NormalizeWhitespace;

impl TransformOp for NormalizeWhitespace {
    fn process(&self, mut record: Record) -> Result<Vec<Record>, OpError> {
        let normalized = text_of(&record)?
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        record.set_field("text", json!(normalized));
        Ok(vec![record])
    }
}

/// Keeps records whose text length falls inside the configured bounds.
struct LengthFilter {
    min: u64,
    max: Option<u64>,
}

impl FilterOp for LengthFilter {
    fn compute_stats(&self, mut record: Record) -> Result<Record, OpError> {
        let chars = text_of(&record)?.chars().count() as u64;
        record.set_field("char_count", json!(chars));
        Ok(record)
    }

    fn predicate(&self, record: &Record) -> bool {
        let chars = record.field_f64("char_count").unwrap_or(0.0) as u64;
        chars >= self.min && self.max.map(|max| chars <= max).unwrap_or(true)
    }
}

/// Exact duplicate removal on a text hash; first occurrence wins.
struct ExactDedup;

impl DedupOp for ExactDedup {
    fn compute_key(&self, mut record: Record) -> Result<Record, OpError> {
        let mut hasher = DefaultHasher::new();
        text_of(&record)?.hash(&mut hasher);
        record.set_field("dedup_key", json!(hasher.finish().to_string()));
        Ok(record)
    }

    fn resolve(&self, records: Vec<Record>) -> Result<(Vec<Record>, Vec<DuplicatePair>), OpError> {
        let mut kept_by_key: HashMap<String, uuid::Uuid> = HashMap::new();
        let mut kept = Vec::with_capacity(records.len());
        let mut pairs = Vec::new();

        for record in records {
            let key = record
                .field_str("dedup_key")
                .ok_or_else(|| OpError::Other("record lost its dedup key".into()))?
                .to_string();
            match kept_by_key.get(&key) {
                Some(&winner) => pairs.push(DuplicatePair {
                    kept: winner,
                    duplicate: record.id,
                }),
                None => {
                    kept_by_key.insert(key, record.id);
                    kept.push(record);
                }
            }
        }
        Ok((kept, pairs))
    }

    fn distributed_supported(&self) -> bool {
        true
    }
}

/// Keeps the first `n` records in dataset order.
struct HeadSelect {
    n: usize,
}

impl SelectOp for HeadSelect {
    fn select(&self, mut records: Vec<Record>) -> Result<Vec<Record>, OpError> {
        records.truncate(self.n);
        Ok(records)
    }

    fn distributed_supported(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use curator_engine::{PipelineSpec};
    use serde_json::Value;

    fn record(text: &str) -> Record {
        Record::new(json!({"text": text}))
    }

    #[test]
    fn normalize_whitespace_collapses_runs() {
        let op = NormalizeWhitespace;
        let out = op.process(record("  hello \t world \n")).unwrap();
        assert_eq!(out[0].field_str("text"), Some("hello world"));
    }

    #[test]
    fn length_filter_bounds() {
        let op = LengthFilter { min: 3, max: Some(5) };
        let short = op.compute_stats(record("ab")).unwrap();
        let fits = op.compute_stats(record("abcd")).unwrap();
        let long = op.compute_stats(record("abcdef")).unwrap();

        assert!(!op.predicate(&short));
        assert!(op.predicate(&fits));
        assert!(!op.predicate(&long));
    }

    #[test]
    fn exact_dedup_keeps_first_occurrence() {
        let op = ExactDedup;
        let records: Vec<Record> = ["same", "same", "other"]
            .iter()
            .map(|t| op.compute_key(record(t)).unwrap())
            .collect();
        let first_id = records[0].id;
        let dup_id = records[1].id;

        let (kept, pairs) = op.resolve(records).unwrap();
        assert_eq!(kept.len(), 2);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].kept, first_id);
        assert_eq!(pairs[0].duplicate, dup_id);
    }

    #[test]
    fn registry_builds_full_pipeline() {
        let registry = default_registry();
        let pipeline: PipelineSpec = serde_json::from_value(json!({
            "stages": [
                {"op": "normalize_whitespace"},
                {"op": "length_filter", "params": {"min_chars": 2}},
                {"op": "exact_dedup"},
                {"op": "head_select", "params": {"n": 10}}
            ],
            "source": "data/in.jsonl",
            "sink": "data/out.jsonl"
        }))
        .unwrap();

        let ops = registry.build(&pipeline).unwrap();
        assert_eq!(ops.len(), 4);
        assert_eq!(ops[3].spec.stage_index, 3);
    }

    #[test]
    fn head_select_requires_n() {
        let registry = default_registry();
        let pipeline: PipelineSpec = serde_json::from_value(json!({
            "stages": [{"op": "head_select"}],
            "source": "", "sink": ""
        }))
        .unwrap();
        assert!(registry.build(&pipeline).is_err());
    }

    #[test]
    fn unused_param_shapes_are_tolerated() {
        let op = LengthFilter { min: 1, max: None };
        let rec = op.compute_stats(record("x")).unwrap();
        assert_eq!(rec.field("char_count"), Some(&Value::from(1)));
        assert!(op.predicate(&rec));
    }
}
