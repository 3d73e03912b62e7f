//! Queue persistence.
//!
//! Two on-disk formats:
//!
//! - The recovery snapshot ([`QueueSnapshot`]), rewritten after every queue
//!   mutation to `queue_recovery_<pid>.json` in the state directory. Completed
//!   jobs are left out, and jobs that were in progress come back as waiting.
//! - The export file ([`QueueExport`]) for user-driven save/load, carrying
//!   every job's paths and full task payload.
//!
//! All writes go to a temporary sibling first and are renamed into place.

use crate::job::{Job, JobStatus, Task};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};
use thiserror::Error;
use tracing::{debug, warn};

/// Current on-disk format version for both files.
pub const FORMAT_VERSION: u32 = 1;

const RECOVERY_PREFIX: &str = "queue_recovery_";
const RECOVERY_SUFFIX: &str = ".json";

/// Error type for persistence operations
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid queue file {path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unsupported queue file version {found} in {path}")]
    UnsupportedVersion { path: PathBuf, found: u32 },
}

/// Persisted form of the unfinished part of a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub version: u32,
    pub saved_at: i64,
    pub jobs: Vec<Job>,
}

impl QueueSnapshot {
    /// Snapshot of `jobs` without the completed ones.
    pub fn from_jobs(jobs: &[Job]) -> Self {
        Self {
            version: FORMAT_VERSION,
            saved_at: crate::job::current_timestamp_ms(),
            jobs: jobs
                .iter()
                .filter(|job| job.status != JobStatus::Completed)
                .cloned()
                .collect(),
        }
    }

    /// Jobs to put back in a queue: completed ones skipped, in-progress ones
    /// demoted to waiting.
    pub fn into_recoverable_jobs(self) -> Vec<Job> {
        self.jobs
            .into_iter()
            .filter(|job| job.status != JobStatus::Completed)
            .map(|mut job| {
                job.demote_after_crash();
                job
            })
            .collect()
    }
}

/// One job in an export file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedJob {
    pub source: PathBuf,
    pub destination: PathBuf,
    #[serde(default)]
    pub scanned_source: Option<PathBuf>,
    pub task: Task,
}

impl ExportedJob {
    pub fn from_job(job: &Job) -> Self {
        Self {
            source: job.source.clone(),
            destination: job.destination.clone(),
            scanned_source: job.scanned_source.clone(),
            task: job.task.clone(),
        }
    }

    /// A fresh waiting job carrying this entry's payload.
    pub fn into_job(self) -> Job {
        let job = Job::new(self.source, self.destination, self.task);
        match self.scanned_source {
            Some(path) => job.with_scanned_source(path),
            None => job,
        }
    }
}

/// User-facing queue export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueExport {
    pub version: u32,
    pub jobs: Vec<ExportedJob>,
}

/// Write `bytes` to `path` through a temporary sibling and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let io_err = |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let result = (|| {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp_path);
        return Err(io_err(e));
    }
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, PersistenceError> {
    let content = fs::read_to_string(path).map_err(|source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| PersistenceError::Format {
        path: path.to_path_buf(),
        source,
    })
}

fn to_json<T: Serialize>(value: &T, path: &Path) -> Result<Vec<u8>, PersistenceError> {
    serde_json::to_vec_pretty(value).map_err(|source| PersistenceError::Format {
        path: path.to_path_buf(),
        source,
    })
}

fn check_version(found: u32, path: &Path) -> Result<(), PersistenceError> {
    if found > FORMAT_VERSION {
        return Err(PersistenceError::UnsupportedVersion {
            path: path.to_path_buf(),
            found,
        });
    }
    Ok(())
}

/// Write the recovery snapshot of `jobs` to `path`.
pub fn save_snapshot(path: &Path, jobs: &[Job]) -> Result<(), PersistenceError> {
    let snapshot = QueueSnapshot::from_jobs(jobs);
    write_atomic(path, &to_json(&snapshot, path)?)
}

/// Read a recovery snapshot.
pub fn load_snapshot(path: &Path) -> Result<QueueSnapshot, PersistenceError> {
    let snapshot: QueueSnapshot = read_json(path)?;
    check_version(snapshot.version, path)?;
    Ok(snapshot)
}

/// Write an export file for `jobs`.
pub fn save_export(path: &Path, jobs: &[Job]) -> Result<(), PersistenceError> {
    let export = QueueExport {
        version: FORMAT_VERSION,
        jobs: jobs.iter().map(ExportedJob::from_job).collect(),
    };
    write_atomic(path, &to_json(&export, path)?)
}

/// Read an export file.
pub fn load_export(path: &Path) -> Result<QueueExport, PersistenceError> {
    let export: QueueExport = read_json(path)?;
    check_version(export.version, path)?;
    Ok(export)
}

/// Recovery file name for the queue owned by process `pid`.
pub fn recovery_file_name(pid: u32) -> String {
    format!("{}{}{}", RECOVERY_PREFIX, pid, RECOVERY_SUFFIX)
}

/// Recovery file path for the current process.
pub fn recovery_path_for_current_process(state_dir: &Path) -> PathBuf {
    state_dir.join(recovery_file_name(std::process::id()))
}

fn pid_from_file_name(name: &str) -> Option<u32> {
    name.strip_prefix(RECOVERY_PREFIX)?
        .strip_suffix(RECOVERY_SUFFIX)?
        .parse()
        .ok()
}

/// A snapshot left behind by a queue instance that is no longer running.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoverableQueue {
    pub path: PathBuf,
    pub pid: u32,
    pub jobs: Vec<Job>,
}

/// Find snapshots in `state_dir` whose owning process is gone and which still
/// hold unfinished work.
///
/// Unreadable files are logged and skipped. Snapshots owned by `current_pid`
/// or by a live process are never returned.
pub fn find_recoverable_queues(state_dir: &Path, current_pid: u32) -> Vec<RecoverableQueue> {
    let entries = match fs::read_dir(state_dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %state_dir.display(), error = %e, "No state directory to recover from");
            return Vec::new();
        }
    };

    let system = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new()),
    );

    let mut found = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(pid) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(pid_from_file_name)
        else {
            continue;
        };
        if pid == current_pid || system.process(Pid::from_u32(pid)).is_some() {
            continue;
        }
        match load_snapshot(&path) {
            Ok(snapshot) => {
                let jobs = snapshot.into_recoverable_jobs();
                if !jobs.is_empty() {
                    found.push(RecoverableQueue { path, pid, jobs });
                }
            }
            Err(e) => warn!(error = %e, "Skipping unreadable recovery snapshot"),
        }
    }
    found.sort_by_key(|q| q.pid);
    found
}
