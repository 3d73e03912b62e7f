//! External encoder process supervision.
//!
//! Spawns the engine executable, decodes progress from its stdout, writes its
//! stderr to the encode log, and reports one [`Completion`] when it exits.

use super::log::{EncodeLog, LogAppend, LogLines, RUNAWAY_LOG_ENTRY};
use super::{
    Completion, EncodeRequest, EncodeSlot, EncodeSupervisor, SupervisorError, SupervisorEvent,
    SupervisorEvents,
};
use crate::job::JobId;
use crate::progress::{ProgressDecoder, ProgressTracker};
use encode_queue_config::{EngineConfig, ProcessPriority};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

/// How long output readers may keep running after the engine exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Program and arguments for one engine run.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<OsString>,
}

/// Turns a request into an engine command line.
pub trait InvocationBuilder: Send + Sync {
    fn build(&self, request: &EncodeRequest) -> Result<Invocation, String>;
}

/// Default command line: `-i <source> -o <destination>` then the task's `args`.
#[derive(Debug, Clone)]
pub struct CliInvocation {
    executable: String,
}

impl CliInvocation {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

impl InvocationBuilder for CliInvocation {
    fn build(&self, request: &EncodeRequest) -> Result<Invocation, String> {
        if self.executable.trim().is_empty() {
            return Err("no engine executable configured".to_string());
        }
        let mut args: Vec<OsString> = vec![
            "-i".into(),
            request.source.clone().into_os_string(),
            "-o".into(),
            request.destination.clone().into_os_string(),
        ];
        args.extend(request.task.args().into_iter().map(OsString::from));
        Ok(Invocation {
            program: self.executable.clone(),
            args,
        })
    }
}

/// Build the engine command, wrapped in `nice` when a non-default priority is
/// configured.
pub fn build_engine_command(invocation: &Invocation, priority: ProcessPriority) -> Command {
    let niceness = priority.niceness();
    if niceness != 0 && cfg!(unix) {
        let mut cmd = Command::new("nice");
        cmd.arg("-n").arg(niceness.to_string());
        cmd.arg(&invocation.program);
        cmd.args(&invocation.args);
        return cmd;
    }
    if niceness != 0 {
        warn!(?priority, "Process priority is not supported on this platform; using default");
    }
    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args);
    cmd
}

/// What the engine said about its own result.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EngineVerdict {
    Unknown,
    Success,
    Failed(String),
}

impl EngineVerdict {
    fn from_line(line: &str) -> Option<Self> {
        if line.contains("Encode done!") {
            Some(EngineVerdict::Success)
        } else if line.contains("Encode failed") {
            Some(EngineVerdict::Failed(line.trim().to_string()))
        } else {
            None
        }
    }
}

/// Control handles for the running process.
#[derive(Clone)]
struct ActiveProcess {
    kill: Arc<Notify>,
    stop_requested: Arc<AtomicBool>,
    runaway: Arc<AtomicBool>,
}

impl ActiveProcess {
    fn new() -> Self {
        Self {
            kill: Arc::new(Notify::new()),
            stop_requested: Arc::new(AtomicBool::new(false)),
            runaway: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Supervisor for an external encoder executable.
pub struct ProcessSupervisor {
    builder: Arc<dyn InvocationBuilder>,
    priority: ProcessPriority,
    log_dir: PathBuf,
    log_ceiling: u64,
    slot: Arc<EncodeSlot<ActiveProcess>>,
}

impl ProcessSupervisor {
    pub fn new(
        builder: Arc<dyn InvocationBuilder>,
        priority: ProcessPriority,
        log_dir: PathBuf,
        log_ceiling: u64,
    ) -> Self {
        Self {
            builder,
            priority,
            log_dir,
            log_ceiling,
            slot: Arc::new(EncodeSlot::new()),
        }
    }

    /// Supervisor running the configured executable with [`CliInvocation`].
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            Arc::new(CliInvocation::new(config.executable.clone())),
            config.process_priority,
            config.log_dir.clone(),
            config.log_ceiling_bytes(),
        )
    }
}

impl EncodeSupervisor for ProcessSupervisor {
    fn start(&self, request: EncodeRequest) -> Result<SupervisorEvents, SupervisorError> {
        let job_id = request.job_id;
        let (child, control) = self.slot.claim_with(job_id, || {
            let invocation = self
                .builder
                .build(&request)
                .map_err(SupervisorError::StartFailed)?;
            let mut command =
                tokio::process::Command::from(build_engine_command(&invocation, self.priority));
            command
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            let child = command.spawn().map_err(|e| {
                SupervisorError::StartFailed(format!("{}: {}", invocation.program, e))
            })?;
            let control = ActiveProcess::new();
            Ok((control.clone(), (child, control)))
        })?;

        let log = if request.logging_enabled {
            EncodeLog::open(&self.log_dir, job_id, &request.destination, self.log_ceiling)
        } else {
            EncodeLog::detached(self.log_ceiling)
        };

        info!(job_id, pid = ?child.id(), source = %request.source.display(), "Encode engine started");
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(SupervisorEvent::Started { job_id });
        tokio::spawn(supervise_process(job_id, child, control, log, tx, self.slot.clone()));
        Ok(rx)
    }

    fn stop(&self) {
        let stopped = self.slot.with_active(|job_id, control| {
            control.stop_requested.store(true, Ordering::SeqCst);
            control.kill.notify_one();
            job_id
        });
        match stopped {
            Some(job_id) => info!(job_id, "Stop requested for encode engine"),
            None => debug!("Stop requested with no active encode"),
        }
    }

    fn can_pause(&self) -> bool {
        false
    }

    fn pause(&self) -> Result<(), SupervisorError> {
        Err(SupervisorError::Unsupported("pause"))
    }

    fn resume(&self) -> Result<(), SupervisorError> {
        Err(SupervisorError::Unsupported("resume"))
    }

    fn is_encoding(&self) -> bool {
        self.slot.is_occupied()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn supervise_process(
    job_id: JobId,
    mut child: Child,
    control: ActiveProcess,
    log: EncodeLog,
    tx: mpsc::UnboundedSender<SupervisorEvent>,
    slot: Arc<EncodeSlot<ActiveProcess>>,
) {
    let log = Arc::new(Mutex::new(log));
    let verdict = Arc::new(Mutex::new(EngineVerdict::Unknown));

    let progress_task = child
        .stdout
        .take()
        .map(|stdout| tokio::spawn(consume_progress(job_id, stdout, tx.clone())));
    let log_task = child.stderr.take().map(|stderr| {
        tokio::spawn(consume_log(
            job_id,
            stderr,
            log.clone(),
            verdict.clone(),
            control.clone(),
            tx.clone(),
        ))
    });

    let status = tokio::select! {
        status = child.wait() => status,
        _ = control.kill.notified() => {
            if let Err(e) = child.start_kill() {
                debug!(job_id, error = %e, "Engine already exited before kill");
            }
            child.wait().await
        }
    };

    // Readers go before Completed so no event can follow it.
    for task in [progress_task, log_task].into_iter().flatten() {
        let abort = task.abort_handle();
        if tokio::time::timeout(DRAIN_TIMEOUT, task).await.is_err() {
            warn!(job_id, "Engine output still open after exit; detaching reader");
            abort.abort();
        }
    }

    let verdict = lock(&verdict).clone();
    let mut completion = if control.runaway.load(Ordering::SeqCst) {
        Completion::failed(
            "Encode log exceeded its size ceiling; the engine was stopped automatically",
            None,
        )
    } else if control.stop_requested.load(Ordering::SeqCst) {
        Completion::cancelled(None)
    } else {
        match (&status, verdict) {
            (Err(e), _) => Completion::failed(format!("Failed to wait for engine: {}", e), None),
            (Ok(_), EngineVerdict::Success) => Completion::succeeded(None),
            (Ok(_), EngineVerdict::Failed(line)) => Completion::failed(line, None),
            (Ok(status), EngineVerdict::Unknown) if status.success() => Completion::succeeded(None),
            (Ok(status), EngineVerdict::Unknown) => Completion::failed(describe_exit(status), None),
        }
    };
    completion.exit_code = status.as_ref().ok().and_then(|s| s.code());

    {
        let mut log = lock(&log);
        log.note(&format!(
            "# encode finished: success={} cancelled={} exit_code={:?}",
            completion.success, completion.cancelled, completion.exit_code
        ));
        completion.log_path = log.close();
    }

    slot.release(job_id);
    if completion.success {
        info!(job_id, "Encode engine finished successfully");
    } else {
        warn!(job_id, error = ?completion.error, cancelled = completion.cancelled, "Encode engine finished without success");
    }
    let _ = tx.send(SupervisorEvent::Completed { job_id, completion });
}

fn describe_exit(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("Engine exited with code {}", code),
        None => "Engine was terminated by a signal".to_string(),
    }
}

async fn consume_progress(
    job_id: JobId,
    mut stdout: ChildStdout,
    tx: mpsc::UnboundedSender<SupervisorEvent>,
) {
    let mut decoder = ProgressDecoder::new();
    let mut tracker = ProgressTracker::new();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(job_id, error = %e, "Engine stdout read failed");
                break;
            }
        };
        for sample in decoder.feed(&String::from_utf8_lossy(&buf[..n])) {
            if let Some(sample) = tracker.accept(sample) {
                let _ = tx.send(SupervisorEvent::Progress { job_id, sample });
            }
        }
    }
    if let Some(sample) = decoder.finish().and_then(|s| tracker.accept(s)) {
        let _ = tx.send(SupervisorEvent::Progress { job_id, sample });
    }
}

async fn consume_log(
    job_id: JobId,
    mut stderr: ChildStderr,
    log: Arc<Mutex<EncodeLog>>,
    verdict: Arc<Mutex<EngineVerdict>>,
    control: ActiveProcess,
    tx: mpsc::UnboundedSender<SupervisorEvent>,
) {
    let mut lines = LogLines::new();
    let mut buf = vec![0u8; 8192];
    loop {
        let n = match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(job_id, error = %e, "Engine stderr read failed");
                break;
            }
        };
        // Once tripped, keep draining so the engine never blocks on a full pipe.
        if lock(&log).is_tripped() {
            continue;
        }
        for line in lines.push(&buf[..n]) {
            record_log_line(job_id, line, &log, &verdict, &control, &tx);
        }
    }
    if let Some(line) = lines.finish() {
        record_log_line(job_id, line, &log, &verdict, &control, &tx);
    }
}

fn record_log_line(
    job_id: JobId,
    line: String,
    log: &Mutex<EncodeLog>,
    verdict: &Mutex<EngineVerdict>,
    control: &ActiveProcess,
    tx: &mpsc::UnboundedSender<SupervisorEvent>,
) {
    if let Some(found) = EngineVerdict::from_line(&line) {
        *lock(verdict) = found;
    }
    let appended = lock(log).append(&line);
    match appended {
        LogAppend::Accepted => {
            let _ = tx.send(SupervisorEvent::Log { job_id, line });
        }
        LogAppend::CeilingExceeded => {
            error!(job_id, "Encode log exceeded its ceiling; stopping engine");
            control.runaway.store(true, Ordering::SeqCst);
            control.kill.notify_one();
            let _ = tx.send(SupervisorEvent::Log {
                job_id,
                line: RUNAWAY_LOG_ENTRY.to_string(),
            });
        }
        LogAppend::Dropped => {}
    }
}
