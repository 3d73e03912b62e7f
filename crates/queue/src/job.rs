//! Job record module for the encode queue.
//!
//! A [`Job`] is one queued unit of encode work: where to read from, where to
//! write to, the opaque [`Task`] payload handed to the engine, and the status
//! the queue tracks for it. Status changes go through the transition methods
//! on [`Job`] so the allowed edges live in one place.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Identity of a job, unique within one running queue instance.
pub type JobId = u64;

/// Status of a job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting to be picked up.
    Waiting,
    /// Job is owned by the engine supervisor.
    InProgress,
    /// Engine reported success.
    Completed,
    /// Engine failed, could not start, or the job was cancelled.
    Error,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Waiting
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Waiting => write!(f, "waiting"),
            JobStatus::InProgress => write!(f, "in_progress"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Error => write!(f, "error"),
        }
    }
}

/// Rejected status change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("job {id} cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Encode parameters for one job.
///
/// The queue never looks inside; it only stores the payload, persists it and
/// hands it to the engine invocation builder unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Task(serde_json::Value);

impl Task {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }

    /// Extra engine arguments carried in the payload's `args` array.
    ///
    /// Non-string entries are skipped.
    pub fn args(&self) -> Vec<String> {
        self.0
            .get("args")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl From<serde_json::Value> for Task {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// How an in-progress job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed(String),
    /// Stopped on request. Recorded as an error with the cancelled flag set.
    Cancelled,
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed => JobStatus::Completed,
            JobOutcome::Failed(_) | JobOutcome::Cancelled => JobStatus::Error,
        }
    }
}

/// One queued unit of encode work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Assigned by the queue on insertion.
    pub id: JobId,
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Opaque engine parameters.
    pub task: Task,
    pub status: JobStatus,
    /// Path of the scanned source when it differs from `source`
    /// (e.g. a disc folder scanned through a title path).
    #[serde(default)]
    pub scanned_source: Option<PathBuf>,
    /// Unix timestamp (milliseconds) when the job was created.
    pub created_at: i64,
    /// Unix timestamp (milliseconds) of the last dequeue.
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub finished_at: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    /// Set when the job ended because it was stopped.
    #[serde(default)]
    pub cancelled: bool,
    /// Encode log written for the last run, if logging was enabled.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

impl Job {
    /// Create a waiting job. The id is assigned when it is added to a queue.
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>, task: Task) -> Self {
        Self {
            id: 0,
            source: source.into(),
            destination: destination.into(),
            task,
            status: JobStatus::Waiting,
            scanned_source: None,
            created_at: current_timestamp_ms(),
            started_at: None,
            finished_at: None,
            error: None,
            cancelled: false,
            log_path: None,
        }
    }

    pub fn with_scanned_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.scanned_source = Some(path.into());
        self
    }

    /// Waiting -> InProgress. Stamps the start time and clears the last run's result.
    pub fn begin(&mut self) -> Result<(), InvalidTransition> {
        self.check_from(&[JobStatus::Waiting], JobStatus::InProgress)?;
        self.status = JobStatus::InProgress;
        self.started_at = Some(current_timestamp_ms());
        self.finished_at = None;
        self.error = None;
        self.cancelled = false;
        Ok(())
    }

    /// InProgress -> Completed | Error.
    pub fn finish(
        &mut self,
        outcome: &JobOutcome,
        log_path: Option<PathBuf>,
    ) -> Result<(), InvalidTransition> {
        let target = outcome.status();
        self.check_from(&[JobStatus::InProgress], target)?;
        self.status = target;
        self.finished_at = Some(current_timestamp_ms());
        self.log_path = log_path;
        match outcome {
            JobOutcome::Completed => {}
            JobOutcome::Failed(reason) => self.error = Some(reason.clone()),
            JobOutcome::Cancelled => {
                self.cancelled = true;
                self.error = Some("Encode cancelled".to_string());
            }
        }
        Ok(())
    }

    /// Error | Completed -> Waiting (manual retry).
    pub fn reset_to_waiting(&mut self) -> Result<(), InvalidTransition> {
        self.check_from(&[JobStatus::Error, JobStatus::Completed], JobStatus::Waiting)?;
        self.status = JobStatus::Waiting;
        self.started_at = None;
        self.finished_at = None;
        self.error = None;
        self.cancelled = false;
        Ok(())
    }

    /// Demote a job that was running when its owning process died.
    pub(crate) fn demote_after_crash(&mut self) {
        if self.status == JobStatus::InProgress {
            self.status = JobStatus::Waiting;
            self.started_at = None;
        }
    }

    /// Check if the job is in a terminal state (completed or error).
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Error)
    }

    /// True when `path` is this job's destination.
    pub fn writes_to(&self, path: &Path) -> bool {
        self.destination == path
    }

    fn check_from(&self, allowed: &[JobStatus], to: JobStatus) -> Result<(), InvalidTransition> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(InvalidTransition {
                id: self.id,
                from: self.status,
                to,
            })
        }
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub(crate) fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
