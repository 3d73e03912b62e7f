//! In-process engine supervision.
//!
//! The engine runs inside this process and reports through a stream of
//! [`EngineEvent`]s: JSON state documents (progress, pause, work done) and
//! free-form log lines. Unlike the CLI engine it can pause and resume.

use super::log::{EncodeLog, LogAppend, RUNAWAY_LOG_ENTRY};
use super::{
    Completion, EncodeRequest, EncodeSlot, EncodeSupervisor, SupervisorError, SupervisorEvent,
    SupervisorEvents,
};
use crate::job::JobId;
use crate::progress::{EngineStatus, ProgressDecoder, ProgressTracker};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Output of an in-process engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// JSON state document.
    State(String),
    Log(String),
}

/// Handle to an in-process encode engine.
///
/// `start` returns the event stream for the new encode; the engine closes it
/// after reporting `WORKDONE`, or after a stop.
pub trait EncodeEngine: Send + Sync {
    fn start(&self, request: &EncodeRequest) -> Result<mpsc::UnboundedReceiver<EngineEvent>, String>;
    fn stop(&self);
    fn pause(&self);
    fn resume(&self);
}

struct ActiveEngine {
    stop_requested: Arc<AtomicBool>,
}

/// Supervisor for an [`EncodeEngine`].
pub struct LibrarySupervisor {
    engine: Arc<dyn EncodeEngine>,
    log_dir: PathBuf,
    log_ceiling: u64,
    slot: Arc<EncodeSlot<ActiveEngine>>,
}

impl LibrarySupervisor {
    pub fn new(engine: Arc<dyn EncodeEngine>, log_dir: PathBuf, log_ceiling: u64) -> Self {
        Self {
            engine,
            log_dir,
            log_ceiling,
            slot: Arc::new(EncodeSlot::new()),
        }
    }
}

impl EncodeSupervisor for LibrarySupervisor {
    fn start(&self, request: EncodeRequest) -> Result<SupervisorEvents, SupervisorError> {
        let job_id = request.job_id;
        let (engine_events, stop_requested) = self.slot.claim_with(job_id, || {
            let events = self
                .engine
                .start(&request)
                .map_err(SupervisorError::StartFailed)?;
            let stop_requested = Arc::new(AtomicBool::new(false));
            let active = ActiveEngine {
                stop_requested: stop_requested.clone(),
            };
            Ok((active, (events, stop_requested)))
        })?;

        let log = if request.logging_enabled {
            EncodeLog::open(&self.log_dir, job_id, &request.destination, self.log_ceiling)
        } else {
            EncodeLog::detached(self.log_ceiling)
        };

        info!(job_id, source = %request.source.display(), "In-process encode started");
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(SupervisorEvent::Started { job_id });
        tokio::spawn(pump_engine(
            job_id,
            engine_events,
            self.engine.clone(),
            stop_requested,
            log,
            tx,
            self.slot.clone(),
        ));
        Ok(rx)
    }

    fn stop(&self) {
        let active = self.slot.with_active(|job_id, active| {
            active.stop_requested.store(true, Ordering::SeqCst);
            job_id
        });
        if let Some(job_id) = active {
            info!(job_id, "Stop requested for in-process encode");
            self.engine.stop();
        }
    }

    fn can_pause(&self) -> bool {
        true
    }

    fn pause(&self) -> Result<(), SupervisorError> {
        if !self.slot.is_occupied() {
            return Err(SupervisorError::NotEncoding);
        }
        self.engine.pause();
        Ok(())
    }

    fn resume(&self) -> Result<(), SupervisorError> {
        if !self.slot.is_occupied() {
            return Err(SupervisorError::NotEncoding);
        }
        self.engine.resume();
        Ok(())
    }

    fn is_encoding(&self) -> bool {
        self.slot.is_occupied()
    }
}

async fn pump_engine(
    job_id: JobId,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
    engine: Arc<dyn EncodeEngine>,
    stop_requested: Arc<AtomicBool>,
    mut log: EncodeLog,
    tx: mpsc::UnboundedSender<SupervisorEvent>,
    slot: Arc<EncodeSlot<ActiveEngine>>,
) {
    let mut decoder = ProgressDecoder::new();
    let mut tracker = ProgressTracker::new();
    let mut work_done: Option<i32> = None;

    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::State(document) => match decoder.decode_json(&document) {
                Some(EngineStatus::Progress(sample)) => {
                    if let Some(sample) = tracker.accept(sample) {
                        let _ = tx.send(SupervisorEvent::Progress { job_id, sample });
                    }
                }
                Some(EngineStatus::WorkDone { error_code }) => {
                    tracker.mark_completed();
                    work_done = Some(error_code);
                    break;
                }
                Some(EngineStatus::Paused) | Some(EngineStatus::Other) => {}
                None => debug!(job_id, "Ignoring undecodable engine state"),
            },
            EngineEvent::Log(line) => match log.append(&line) {
                LogAppend::Accepted => {
                    let _ = tx.send(SupervisorEvent::Log { job_id, line });
                }
                LogAppend::CeilingExceeded => {
                    error!(job_id, "Encode log exceeded its ceiling; stopping engine");
                    engine.stop();
                    let _ = tx.send(SupervisorEvent::Log {
                        job_id,
                        line: RUNAWAY_LOG_ENTRY.to_string(),
                    });
                }
                LogAppend::Dropped => {}
            },
        }
    }
    drop(events);

    let mut completion = if log.is_tripped() {
        Completion::failed(
            "Encode log exceeded its size ceiling; the engine was stopped automatically",
            None,
        )
    } else if stop_requested.load(Ordering::SeqCst) {
        Completion::cancelled(None)
    } else {
        match work_done {
            Some(0) => Completion::succeeded(None),
            Some(code) => {
                let mut failed = Completion::failed(format!("Engine reported error code {}", code), None);
                failed.exit_code = Some(code);
                failed
            }
            None => Completion::failed("Engine closed without reporting completion", None),
        }
    };

    log.note(&format!(
        "# encode finished: success={} cancelled={} work_done={:?}",
        completion.success, completion.cancelled, work_done
    ));
    completion.log_path = log.close();

    slot.release(job_id);
    if completion.success {
        info!(job_id, "In-process encode finished successfully");
    } else {
        warn!(job_id, error = ?completion.error, cancelled = completion.cancelled, "In-process encode finished without success");
    }
    let _ = tx.send(SupervisorEvent::Completed { job_id, completion });
}
