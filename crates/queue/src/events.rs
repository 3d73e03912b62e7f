//! Lifecycle events published to front-ends.

use crate::job::{JobId, JobStatus};
use crate::progress::ProgressSample;

/// Capacity of the broadcast channel. Receivers that fall further behind
/// miss events; the queue never waits for them.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event raised by the queue manager or the queue driver.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// The job collection changed (add, remove, reorder, status change).
    QueueChanged,
    JobProcessingStarted {
        job_id: JobId,
    },
    JobProgress {
        job_id: JobId,
        sample: ProgressSample,
    },
    JobCompleted {
        job_id: JobId,
        status: JobStatus,
        error: Option<String>,
    },
    /// Dequeuing halted. `engine_paused` is false when the engine itself
    /// cannot pause and the current job keeps running.
    QueuePaused {
        engine_paused: bool,
    },
    QueueResumed,
    /// No waiting jobs are left.
    QueueCompleted,
    /// The run ended because stop was requested.
    QueueStopped,
    /// The run ended before a job could be started, e.g. low disk space.
    RunAborted {
        reason: String,
    },
}

impl QueueEvent {
    /// True for the events that end a run.
    pub fn ends_run(&self) -> bool {
        matches!(
            self,
            QueueEvent::QueueCompleted | QueueEvent::QueueStopped | QueueEvent::RunAborted { .. }
        )
    }
}
