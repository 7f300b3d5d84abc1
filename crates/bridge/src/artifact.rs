//! Completion artifacts shared between cluster tasks and the bridge.
//!
//! A finished pipeline task writes its output record count to a small
//! file in the shared artifacts directory; the bridge reads it back when
//! the scheduler reports the task Succeeded.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;

fn artifact_path(dir: &Path, job_id: Uuid) -> PathBuf {
    dir.join(format!("{}.count", job_id))
}

/// Write the final record count for a job. Atomic via tmp + rename.
pub fn write_record_count(dir: &Path, job_id: Uuid, count: i64) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    let path = artifact_path(dir, job_id);
    let tmp = path.with_extension("count.tmp");
    fs::write(&tmp, count.to_string())?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

/// Read a job's record count, `None` if the artifact was never written.
pub fn read_record_count(dir: &Path, job_id: Uuid) -> io::Result<Option<i64>> {
    let path = artifact_path(dir, job_id);
    match fs::read_to_string(&path) {
        Ok(text) => Ok(text.trim().parse().ok()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
