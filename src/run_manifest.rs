//! Run records and the workspace lock.
//!
//! A finished run leaves `tps-run.json` behind: in the install root when it
//! succeeded, in build-temp (next to the half-built trees) when it failed.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{BuildError, IoContext, Result};
use crate::manifest::Platform;
use crate::toolchain::InjectionAudit;

const RUN_RECORD_FILENAME: &str = "tps-run.json";
const LOCK_FILENAME: &str = ".tps-builder.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub status: RunStatus,
    pub platform: Platform,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    pub built: Vec<String>,
    pub installed: Vec<PathBuf>,
    pub environment: Option<InjectionAudit>,
    pub error: Option<String>,
}

impl RunRecord {
    pub fn started(platform: Platform) -> Self {
        let created_at_utc = now_utc_compact();
        Self {
            run_id: format!("run-{created_at_utc}"),
            status: RunStatus::Failed,
            platform,
            created_at_utc,
            finished_at_utc: None,
            built: Vec::new(),
            installed: Vec::new(),
            environment: None,
            error: None,
        }
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at_utc = Some(now_utc_compact());
    }
}

pub fn record_path(dir: &Path) -> PathBuf {
    dir.join(RUN_RECORD_FILENAME)
}

pub fn write_record(dir: &Path, record: &RunRecord) -> Result<PathBuf> {
    fs::create_dir_all(dir).io_context(|| format!("creating '{}'", dir.display()))?;
    let path = record_path(dir);
    let json = serde_json::to_vec_pretty(record)
        .map_err(|e| BuildError::io(format!("serializing '{}'", path.display()), e.into()))?;
    fs::write(&path, json).io_context(|| format!("writing run record '{}'", path.display()))?;
    Ok(path)
}

pub fn load_record(dir: &Path) -> Result<Option<RunRecord>> {
    let path = record_path(dir);
    if !path.is_file() {
        return Ok(None);
    }
    let bytes = fs::read(&path).io_context(|| format!("reading run record '{}'", path.display()))?;
    let record = serde_json::from_slice(&bytes)
        .map_err(|e| BuildError::io(format!("parsing run record '{}'", path.display()), e.into()))?;
    Ok(Some(record))
}

fn now_utc_compact() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

/// Exclusive lock on a workspace, released on drop.
#[derive(Debug)]
pub struct WorkspaceLock {
    _file: File,
    path: PathBuf,
}

impl WorkspaceLock {
    pub fn acquire(base: &Path) -> Result<Self> {
        let path = base.join(LOCK_FILENAME);
        // Never unlink the lock file: a second process could otherwise lock a
        // fresh inode at the same path while the first still holds the old one.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .io_context(|| format!("creating lock file '{}'", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            return Err(BuildError::WorkspaceLocked { path });
        }
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn record_round_trips_through_disk() {
        let temp = TempDir::new().unwrap();
        let mut record = RunRecord::started(Platform::Linux);
        record.built.push("lame-3.99.5".into());
        record.finish(RunStatus::Success);

        let path = write_record(temp.path(), &record).unwrap();
        assert!(path.ends_with("tps-run.json"));
        assert_eq!(load_record(temp.path()).unwrap(), Some(record));
    }

    #[test]
    fn missing_record_is_none() {
        let temp = TempDir::new().unwrap();
        assert_eq!(load_record(temp.path()).unwrap(), None);
    }

    #[test]
    fn run_id_uses_compact_timestamp() {
        let record = RunRecord::started(Platform::Windows);
        assert!(record.run_id.starts_with("run-"));
        assert!(record.created_at_utc.ends_with('Z'));
        assert_eq!(record.created_at_utc.len(), "20260101T000000Z".len());
    }

    #[test]
    fn second_lock_is_refused() {
        let temp = TempDir::new().unwrap();
        let first = WorkspaceLock::acquire(temp.path()).unwrap();
        let err = WorkspaceLock::acquire(temp.path()).unwrap_err();
        assert!(matches!(err, BuildError::WorkspaceLocked { .. }));
        drop(first);
        WorkspaceLock::acquire(temp.path()).unwrap();
    }
}
