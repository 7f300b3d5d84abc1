use serde::{Deserialize, Serialize};

use curator_core::Record;

/// Opaque handle to the records flowing between stages.
#[derive(Debug, Clone)]
pub enum Dataset {
    /// Fully materialized on this worker.
    Local(Vec<Record>),
    /// Partitioned dataset owned by the cluster dataset engine.
    Remote(RemoteDataset),
}

/// Handle to a dataset in the cluster engine's native partitioned form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteDataset {
    pub id: String,
    pub partitions: usize,
    /// Record count when the engine reports one.
    pub record_count: Option<u64>,
}

impl Dataset {
    pub fn local(records: Vec<Record>) -> Self {
        Dataset::Local(records)
    }

    /// Record count, when known without materializing.
    pub fn len_hint(&self) -> Option<u64> {
        match self {
            Dataset::Local(records) => Some(records.len() as u64),
            Dataset::Remote(remote) => remote.record_count,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Dataset::Remote(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn len_hint_local_is_exact() {
        let ds = Dataset::local(vec![Record::new(json!(1)), Record::new(json!(2))]);
        assert_eq!(ds.len_hint(), Some(2));
        assert!(!ds.is_remote());
    }

    #[test]
    fn len_hint_remote_may_be_unknown() {
        let ds = Dataset::Remote(RemoteDataset {
            id: "ds-1".into(),
            partitions: 8,
            record_count: None,
        });
        assert_eq!(ds.len_hint(), None);
        assert!(ds.is_remote());
    }
}
