//! Optional before/after sampling and resumable stage snapshots.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use curator_core::Record;

use crate::dataset::{Dataset, RemoteDataset};
use crate::error::EngineError;

/// Small head samples of a stage's input and output.
#[derive(Debug, Clone, Serialize)]
pub struct StageTrace {
    pub stage_index: usize,
    pub operator: String,
    pub before: Vec<Record>,
    pub after: Vec<Record>,
}

/// Samples the head of a dataset before and after each stage.
pub struct Tracer {
    sample_size: usize,
}

impl Tracer {
    pub fn new(sample_size: usize) -> Self {
        Self { sample_size }
    }

    /// Take a head sample. Remote datasets are not materialized for
    /// tracing; they sample empty.
    pub fn sample(&self, dataset: &Dataset) -> Vec<Record> {
        match dataset {
            Dataset::Local(records) => records.iter().take(self.sample_size).cloned().collect(),
            Dataset::Remote(remote) => {
                debug!(dataset = %remote.id, "skipping trace sample on remote dataset");
                Vec::new()
            }
        }
    }
}

/// Persists intermediate datasets at stage boundaries so an interrupted
/// run can resume after the last completed stage.
///
/// Local datasets are written as JSON lines; remote datasets persist only
/// their handle.
pub struct Checkpointer {
    dir: PathBuf,
}

impl Checkpointer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn job_dir(&self, job_id: Uuid) -> PathBuf {
        self.dir.join(job_id.to_string())
    }

    /// Persist the dataset produced by `stage_index`.
    pub fn save(&self, job_id: Uuid, stage_index: usize, dataset: &Dataset) -> Result<(), EngineError> {
        let dir = self.job_dir(job_id);
        fs::create_dir_all(&dir)?;

        match dataset {
            Dataset::Local(records) => {
                let path = dir.join(format!("stage_{stage_index:04}.jsonl"));
                let tmp = path.with_extension("jsonl.tmp");
                let mut file = fs::File::create(&tmp)?;
                for record in records {
                    serde_json::to_writer(&mut file, record)?;
                    file.write_all(b"\n")?;
                }
                file.flush()?;
                fs::rename(&tmp, &path)?;
            }
            Dataset::Remote(remote) => {
                let path = dir.join(format!("stage_{stage_index:04}.remote.json"));
                fs::write(&path, serde_json::to_vec(remote)?)?;
            }
        }

        debug!(job = %job_id, stage = stage_index, "checkpoint written");
        Ok(())
    }

    /// Load the highest-indexed checkpoint for a job, if any.
    pub fn load_latest(&self, job_id: Uuid) -> Result<Option<(usize, Dataset)>, EngineError> {
        let dir = self.job_dir(job_id);
        if !dir.exists() {
            return Ok(None);
        }

        let mut latest: Option<(usize, PathBuf)> = None;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(stage_index) = parse_stage_index(&path) else {
                continue;
            };
            if latest.as_ref().map(|(i, _)| stage_index > *i).unwrap_or(true) {
                latest = Some((stage_index, path));
            }
        }

        let Some((stage_index, path)) = latest else {
            return Ok(None);
        };

        let dataset = if path.to_string_lossy().ends_with(".remote.json") {
            let remote: RemoteDataset = serde_json::from_slice(&fs::read(&path)?)?;
            Dataset::Remote(remote)
        } else {
            let mut records = Vec::new();
            for line in BufReader::new(fs::File::open(&path)?).lines() {
                let line = line?;
                if line.is_empty() {
                    continue;
                }
                records.push(serde_json::from_str(&line)?);
            }
            Dataset::Local(records)
        };

        info!(job = %job_id, stage = stage_index, "resuming from checkpoint");
        Ok(Some((stage_index, dataset)))
    }

    /// Remove all checkpoints for a finished job.
    pub fn clear(&self, job_id: Uuid) -> Result<(), EngineError> {
        let dir = self.job_dir(job_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

fn parse_stage_index(path: &std::path::Path) -> Option<usize> {
    let name = path.file_name()?.to_str()?;
    let rest = name.strip_prefix("stage_")?;
    let digits = rest.split('.').next()?;
    digits.parse().ok()
}
