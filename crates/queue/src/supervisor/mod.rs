//! Engine supervision.
//!
//! An [`EncodeSupervisor`] owns the single active encode operation. Two
//! variants exist behind the same trait:
//!
//! - [`ProcessSupervisor`] spawns an external encoder executable and reads its
//!   stdout (progress) and stderr (log) concurrently.
//! - [`LibrarySupervisor`] drives an in-process engine through the
//!   [`EncodeEngine`] trait.
//!
//! `start` returns a per-operation event receiver. `Completed` is always the
//! last event on it, and it is only sent after the output consumers have been
//! torn down and the encode slot has been released.

pub mod library;
pub mod log;
pub mod process;

pub use library::{EncodeEngine, EngineEvent, LibrarySupervisor};
pub use log::{EncodeLog, LogAppend};
pub use process::{build_engine_command, CliInvocation, Invocation, InvocationBuilder, ProcessSupervisor};

use crate::job::{Job, JobId, Task};
use crate::progress::ProgressSample;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;

/// Error type for supervisor operations
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Another encode operation owns the slot
    #[error("An encode is already in progress (job {0})")]
    AlreadyEncoding(JobId),

    /// The engine could not be started
    #[error("Failed to start encode engine: {0}")]
    StartFailed(String),

    /// The engine has no pause primitive
    #[error("Operation not supported by this engine: {0}")]
    Unsupported(&'static str),

    /// Pause or resume requested with nothing running
    #[error("No encode is in progress")]
    NotEncoding,
}

/// Everything the supervisor needs to run one job.
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub job_id: JobId,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub task: Task,
    pub logging_enabled: bool,
}

impl EncodeRequest {
    pub fn from_job(job: &Job, logging_enabled: bool) -> Self {
        Self {
            job_id: job.id,
            source: job.scanned_source.clone().unwrap_or_else(|| job.source.clone()),
            destination: job.destination.clone(),
            task: job.task.clone(),
            logging_enabled,
        }
    }
}

/// Result of one encode operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// The engine's own success signal, not the OS exit status.
    pub success: bool,
    /// The operation ended because stop was requested.
    pub cancelled: bool,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub log_path: Option<PathBuf>,
}

impl Completion {
    pub fn succeeded(log_path: Option<PathBuf>) -> Self {
        Self {
            success: true,
            cancelled: false,
            error: None,
            exit_code: None,
            log_path,
        }
    }

    pub fn failed(error: impl Into<String>, log_path: Option<PathBuf>) -> Self {
        Self {
            success: false,
            cancelled: false,
            error: Some(error.into()),
            exit_code: None,
            log_path,
        }
    }

    pub fn cancelled(log_path: Option<PathBuf>) -> Self {
        Self {
            success: false,
            cancelled: true,
            error: Some("Encode cancelled".to_string()),
            exit_code: None,
            log_path,
        }
    }
}

/// Event raised by a running encode operation.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Started { job_id: JobId },
    Progress { job_id: JobId, sample: ProgressSample },
    Log { job_id: JobId, line: String },
    Completed { job_id: JobId, completion: Completion },
}

/// Receiver for one operation's events.
pub type SupervisorEvents = mpsc::UnboundedReceiver<SupervisorEvent>;

/// Lifecycle owner of the single active encode operation.
pub trait EncodeSupervisor: Send + Sync {
    /// Start an encode. Fails with [`SupervisorError::AlreadyEncoding`] if one
    /// is active; the active operation is left untouched.
    fn start(&self, request: EncodeRequest) -> Result<SupervisorEvents, SupervisorError>;

    /// Best-effort stop. Never fails, including when nothing is running.
    fn stop(&self);

    fn can_pause(&self) -> bool;

    fn pause(&self) -> Result<(), SupervisorError>;

    fn resume(&self) -> Result<(), SupervisorError>;

    fn is_encoding(&self) -> bool;
}

/// The at-most-one-active slot shared by both supervisor variants.
pub(crate) struct EncodeSlot<T> {
    inner: Mutex<Option<(JobId, T)>>,
}

impl<T> EncodeSlot<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<(JobId, T)>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `start` and occupy the slot with its handle, atomically with
    /// respect to other claims.
    pub(crate) fn claim_with<R>(
        &self,
        job_id: JobId,
        start: impl FnOnce() -> Result<(T, R), SupervisorError>,
    ) -> Result<R, SupervisorError> {
        let mut slot = self.lock();
        if let Some((active, _)) = slot.as_ref() {
            return Err(SupervisorError::AlreadyEncoding(*active));
        }
        let (handle, extra) = start()?;
        *slot = Some((job_id, handle));
        Ok(extra)
    }

    /// Free the slot if `job_id` still holds it.
    pub(crate) fn release(&self, job_id: JobId) {
        let mut slot = self.lock();
        if matches!(slot.as_ref(), Some((active, _)) if *active == job_id) {
            *slot = None;
        }
    }

    pub(crate) fn with_active<R>(&self, f: impl FnOnce(JobId, &T) -> R) -> Option<R> {
        self.lock().as_ref().map(|(id, handle)| f(*id, handle))
    }

    pub(crate) fn is_occupied(&self) -> bool {
        self.lock().is_some()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_rejects_second_claim() {
        let slot: EncodeSlot<&'static str> = EncodeSlot::new();
        slot.claim_with(1, || Ok(("first", ()))).unwrap();

        let err = slot.claim_with(2, || Ok(("second", ()))).unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyEncoding(1)));
        assert_eq!(slot.with_active(|id, h| (id, *h)), Some((1, "first")));
    }

    #[test]
    fn test_slot_failed_start_leaves_slot_free() {
        let slot: EncodeSlot<()> = EncodeSlot::new();
        let err = slot
            .claim_with::<()>(1, || Err(SupervisorError::StartFailed("missing".into())))
            .unwrap_err();
        assert!(matches!(err, SupervisorError::StartFailed(_)));
        assert!(!slot.is_occupied());
    }

    #[test]
    fn test_slot_release_ignores_other_jobs() {
        let slot: EncodeSlot<()> = EncodeSlot::new();
        slot.claim_with(5, || Ok(((), ()))).unwrap();
        slot.release(4);
        assert!(slot.is_occupied());
        slot.release(5);
        assert!(!slot.is_occupied());
    }

    #[test]
    fn test_request_prefers_scanned_source() {
        let job = Job::new("/in/disc", "/out/movie.mkv", Task::default())
            .with_scanned_source("/in/disc/VIDEO_TS");
        let request = EncodeRequest::from_job(&job, true);
        assert_eq!(request.source, PathBuf::from("/in/disc/VIDEO_TS"));
        assert!(request.logging_enabled);
    }
}
