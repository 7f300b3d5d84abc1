//! JSONL dataset source/sink for locally executed jobs.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::Context;

use curator_core::Record;
use curator_engine::{Dataset, RemoteDataset};

/// Partition count adopted for `remote:<id>` sources whose true layout
/// is unknown; the dataset engine repartitions on its side.
const REMOTE_SOURCE_PARTITIONS: usize = 1;

/// Interpret a `remote:<dataset-id>` source reference as a handle into
/// the cluster dataset engine. Returns None for local paths.
pub fn remote_source(source: &str) -> Option<Dataset> {
    source.strip_prefix("remote:").map(|id| {
        Dataset::Remote(RemoteDataset {
            id: id.to_string(),
            partitions: REMOTE_SOURCE_PARTITIONS,
            record_count: None,
        })
    })
}

/// Read a JSONL source file into records. Lines that are valid JSON but
/// not full `Record`s are wrapped as fresh records.
pub fn read_jsonl(path: &Path) -> anyhow::Result<Vec<Record>> {
    let file = File::open(path).with_context(|| format!("open source {}", path.display()))?;
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = match serde_json::from_str::<Record>(&line) {
            Ok(record) => record,
            Err(_) => Record::new(serde_json::from_str(&line).with_context(|| {
                format!("invalid JSON line in {}", path.display())
            })?),
        };
        records.push(record);
    }
    Ok(records)
}

/// Write records to a JSONL sink, atomically via tmp + rename.
pub fn write_jsonl(path: &Path, records: &[Record]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        for record in records {
            serde_json::to_writer(&mut writer, record)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
    }
    fs::rename(&tmp, path).with_context(|| format!("finalize sink {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.jsonl");
        let records = vec![
            Record::new(json!({"text": "a"})),
            Record::new(json!({"text": "b"})),
        ];

        write_jsonl(&path, &records).unwrap();
        let back = read_jsonl(&path).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].id, records[0].id);
    }

    #[test]
    fn bare_json_lines_become_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.jsonl");
        std::fs::write(&path, "{\"text\": \"hello\"}\n\n{\"text\": \"world\"}\n").unwrap();

        let records = read_jsonl(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].field_str("text"), Some("hello"));
    }

    #[test]
    fn missing_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_jsonl(&dir.path().join("nope.jsonl")).is_err());
    }

    #[test]
    fn remote_source_yields_a_usable_handle() {
        let dataset = remote_source("remote:ds-7").unwrap();
        match dataset {
            Dataset::Remote(remote) => {
                assert_eq!(remote.id, "ds-7");
                assert!(remote.partitions >= 1);
            }
            Dataset::Local(_) => panic!("remote source parsed as local"),
        }

        assert!(remote_source("data/in.jsonl").is_none());
    }
}
