//! Queue driver: runs waiting jobs one after another through a supervisor.
//!
//! Run states are `Idle -> Running -> {Paused, Idle}`. The loop never starts
//! the next job until the supervisor has reported the previous one complete.

use crate::disk_space::{DiskSpaceError, DiskSpaceGate};
use crate::events::QueueEvent;
use crate::job::{Job, JobOutcome};
use crate::progress::ProgressTracker;
use crate::queue::QueueManager;
use crate::supervisor::{
    Completion, EncodeRequest, EncodeSupervisor, SupervisorError, SupervisorEvent, SupervisorEvents,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

/// Error type for driver operations
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    InsufficientDiskSpace(#[from] DiskSpaceError),
}

/// Run state of the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Running,
    Paused,
}

/// How a run ended.
enum RunEnd {
    Exhausted,
    Stopped,
    Aborted(String),
}

/// What one turn of the run loop did.
enum Step {
    Paused,
    Stopped,
    Exhausted,
    Aborted(String),
    Skipped,
    Started(Job, SupervisorEvents),
}

struct DriverInner {
    queue: Arc<QueueManager>,
    supervisor: Arc<dyn EncodeSupervisor>,
    disk_gate: Option<DiskSpaceGate>,
    logging_enabled: bool,
    state: watch::Sender<DriverState>,
    stop_requested: AtomicBool,
    engine_paused: AtomicBool,
    wake: Notify,
    /// Serializes pause, resume and stop against the dequeue-and-start step.
    control: Mutex<()>,
}

/// Orchestrates a queue run. Cheap to clone; clones control the same run.
#[derive(Clone)]
pub struct QueueDriver {
    inner: Arc<DriverInner>,
}

impl QueueDriver {
    /// `disk_gate`, when set, is checked against each job's destination
    /// before the job starts.
    pub fn new(
        queue: Arc<QueueManager>,
        supervisor: Arc<dyn EncodeSupervisor>,
        disk_gate: Option<DiskSpaceGate>,
        logging_enabled: bool,
    ) -> Self {
        let (state, _) = watch::channel(DriverState::Idle);
        Self {
            inner: Arc::new(DriverInner {
                queue,
                supervisor,
                disk_gate,
                logging_enabled,
                state,
                stop_requested: AtomicBool::new(false),
                engine_paused: AtomicBool::new(false),
                wake: Notify::new(),
                control: Mutex::new(()),
            }),
        }
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.inner.queue
    }

    pub fn state(&self) -> DriverState {
        *self.inner.state.borrow()
    }

    pub fn is_encoding(&self) -> bool {
        self.inner.supervisor.is_encoding()
    }

    /// Start processing waiting jobs in the background.
    ///
    /// A no-op while a run is active or the supervisor is busy. The first
    /// waiting job's destination is checked against the disk gate before the
    /// run starts; on failure the run does not start and the job stays waiting.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), DriverError> {
        let inner = &self.inner;
        if inner.supervisor.is_encoding() {
            debug!("Start ignored: an encode is already running");
            return Ok(());
        }
        let claimed = inner.state.send_if_modified(|state| {
            if *state == DriverState::Idle {
                *state = DriverState::Running;
                true
            } else {
                false
            }
        });
        if !claimed {
            debug!("Start ignored: queue already running");
            return Ok(());
        }

        if let (Some(gate), Some(next)) = (inner.disk_gate.as_ref(), inner.queue.next_waiting()) {
            if let Err(e) = gate.check(&next.destination) {
                inner.state.send_replace(DriverState::Idle);
                warn!(job_id = next.id, error = %e, "Queue not started");
                return Err(e.into());
            }
        }

        inner.stop_requested.store(false, Ordering::SeqCst);
        inner.engine_paused.store(false, Ordering::SeqCst);
        info!("Queue started");
        tokio::spawn(run_queue(Arc::clone(inner)));
        Ok(())
    }

    /// Halt dequeuing. If the engine can pause, the current job is paused too.
    pub fn pause(&self) {
        let inner = &self.inner;
        let _control = inner.lock_control();
        let paused = inner.state.send_if_modified(|state| {
            if *state == DriverState::Running {
                *state = DriverState::Paused;
                true
            } else {
                false
            }
        });
        if !paused {
            return;
        }

        let engine_paused = inner.supervisor.is_encoding() && inner.pause_engine();
        info!(engine_paused, "Queue paused");
        inner.queue.publish(QueueEvent::QueuePaused { engine_paused });
    }

    pub fn resume(&self) {
        let inner = &self.inner;
        let _control = inner.lock_control();
        let resumed = inner.state.send_if_modified(|state| {
            if *state == DriverState::Paused {
                *state = DriverState::Running;
                true
            } else {
                false
            }
        });
        if !resumed {
            return;
        }

        if inner.engine_paused.swap(false, Ordering::SeqCst) {
            if let Err(e) = inner.supervisor.resume() {
                warn!(error = %e, "Engine did not resume");
            }
        }
        inner.wake.notify_one();
        info!("Queue resumed");
        inner.queue.publish(QueueEvent::QueueResumed);
    }

    /// Stop the current job and end the run. Returns immediately; the run is
    /// over once `QueueStopped` is published.
    pub fn stop(&self) {
        let inner = &self.inner;
        let _control = inner.lock_control();
        if *inner.state.borrow() == DriverState::Idle {
            return;
        }
        info!("Queue stop requested");
        inner.stop_requested.store(true, Ordering::SeqCst);
        inner.supervisor.stop();
        inner.wake.notify_one();
    }

    /// Wait until the current run, if any, has ended.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| *state == DriverState::Idle).await;
    }
}

impl DriverInner {
    fn lock_control(&self) -> MutexGuard<'_, ()> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stopping(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    fn is_paused(&self) -> bool {
        *self.state.borrow() == DriverState::Paused
    }

    async fn wait_while_paused(&self) {
        while self.is_paused() && !self.stopping() {
            self.wake.notified().await;
        }
    }

    /// Pause the running encode if the engine supports it. Returns whether
    /// the engine is now paused.
    fn pause_engine(&self) -> bool {
        if !self.supervisor.can_pause() {
            return false;
        }
        if self.engine_paused.swap(true, Ordering::SeqCst) {
            return true;
        }
        match self.supervisor.pause() {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Engine did not pause");
                self.engine_paused.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Dequeue and start the next job. Runs under the control lock, so a
    /// pause or stop lands either before the dequeue or after the start.
    fn next_step(&self) -> Step {
        let _control = self.lock_control();
        if self.stopping() {
            return Step::Stopped;
        }
        if self.is_paused() {
            return Step::Paused;
        }

        let gate = self.disk_gate.as_ref();
        let dequeued = self.queue.get_next_job_for_processing_if(|next| match gate {
            Some(gate) => gate.check(&next.destination),
            None => Ok(()),
        });
        let job = match dequeued {
            Ok(Some(job)) => job,
            Ok(None) => return Step::Exhausted,
            Err(e) => return Step::Aborted(e.to_string()),
        };

        let request = EncodeRequest::from_job(&job, self.logging_enabled);
        match self.supervisor.start(request) {
            Ok(events) => {
                self.queue.publish(QueueEvent::JobProcessingStarted { job_id: job.id });
                Step::Started(job, events)
            }
            Err(SupervisorError::AlreadyEncoding(active)) => {
                self.finish_job(&job, JobOutcome::Failed(format!("Engine busy with job {}", active)), None);
                Step::Aborted(format!("Encode slot held by job {}", active))
            }
            Err(e) => {
                warn!(job_id = job.id, error = %e, "Job could not start");
                self.finish_job(&job, JobOutcome::Failed(e.to_string()), None);
                Step::Skipped
            }
        }
    }

    /// Record a job's outcome and announce it.
    fn finish_job(&self, job: &Job, outcome: JobOutcome, completion: Option<&Completion>) {
        let log_path = completion.and_then(|c| c.log_path.clone());
        match self.queue.complete_job(job.id, &outcome, log_path) {
            Ok(done) => self.queue.publish(QueueEvent::JobCompleted {
                job_id: done.id,
                status: done.status,
                error: done.error,
            }),
            Err(e) => error!(job_id = job.id, error = %e, "Could not record job outcome"),
        }
    }
}

fn outcome_of(completion: &Completion) -> JobOutcome {
    if completion.success {
        JobOutcome::Completed
    } else if completion.cancelled {
        JobOutcome::Cancelled
    } else {
        JobOutcome::Failed(
            completion
                .error
                .clone()
                .unwrap_or_else(|| "Encode failed".to_string()),
        )
    }
}

async fn run_queue(inner: Arc<DriverInner>) {
    let end = process_jobs(&inner).await;

    inner.state.send_replace(DriverState::Idle);
    inner.engine_paused.store(false, Ordering::SeqCst);
    let event = match end {
        RunEnd::Exhausted => {
            info!("Queue completed");
            QueueEvent::QueueCompleted
        }
        RunEnd::Stopped => {
            info!("Queue stopped");
            QueueEvent::QueueStopped
        }
        RunEnd::Aborted(reason) => {
            error!(%reason, "Queue run aborted");
            QueueEvent::RunAborted { reason }
        }
    };
    inner.queue.publish(event);
}

async fn process_jobs(inner: &DriverInner) -> RunEnd {
    loop {
        inner.wait_while_paused().await;
        match inner.next_step() {
            Step::Paused | Step::Skipped => continue,
            Step::Stopped => return RunEnd::Stopped,
            Step::Exhausted => return RunEnd::Exhausted,
            Step::Aborted(reason) => return RunEnd::Aborted(reason),
            Step::Started(job, events) => {
                let completion = drive_job(inner, &job, events).await;
                inner.finish_job(&job, outcome_of(&completion), Some(&completion));
            }
        }
    }
}

/// Forward one operation's events until it reports completion.
async fn drive_job(inner: &DriverInner, job: &Job, mut events: SupervisorEvents) -> Completion {
    let mut tracker = ProgressTracker::new();
    while let Some(event) = events.recv().await {
        match event {
            SupervisorEvent::Started { job_id } => debug!(job_id, "Engine running"),
            SupervisorEvent::Progress { job_id, sample } => {
                if let Some(sample) = tracker.accept(sample) {
                    inner.queue.publish(QueueEvent::JobProgress { job_id, sample });
                }
            }
            SupervisorEvent::Log { job_id, line } => debug!(job_id, %line, "engine"),
            SupervisorEvent::Completed { completion, .. } => {
                tracker.mark_completed();
                return completion;
            }
        }
    }
    warn!(job_id = job.id, "Supervisor closed its event stream without completing");
    Completion::failed("Encode ended without a completion report", None)
}
