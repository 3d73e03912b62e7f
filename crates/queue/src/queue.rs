//! Queue manager: the ordered, durable store of jobs.
//!
//! Every mutation runs under one lock and rewrites the recovery snapshot
//! before the lock is released, so the file on disk never runs ahead of the
//! in-memory queue. Snapshot failures are logged and swallowed.

use crate::config::QueueConfig;
use crate::events::{QueueEvent, EVENT_CHANNEL_CAPACITY};
use crate::job::{InvalidTransition, Job, JobId, JobOutcome, JobStatus};
use crate::persistence::{self, PersistenceError, QueueSnapshot};
use std::convert::Infallible;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Error type for queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    /// The requested status change is not allowed from the job's current status
    #[error("Invalid operation: {0}")]
    InvalidOperation(#[from] InvalidTransition),

    #[error("Job {0} not found")]
    JobNotFound(JobId),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Job counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub waiting: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub error: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.waiting + self.in_progress + self.completed + self.error
    }
}

struct QueueState {
    jobs: Vec<Job>,
    next_id: JobId,
    last_processed: Option<JobId>,
}

impl QueueState {
    fn push(&mut self, mut job: Job) -> JobId {
        job.id = self.next_id;
        self.next_id += 1;
        let id = job.id;
        self.jobs.push(job);
        id
    }

    fn position(&self, id: JobId) -> Option<usize> {
        self.jobs.iter().position(|job| job.id == id)
    }
}

/// Thread-safe ordered job store.
pub struct QueueManager {
    state: Mutex<QueueState>,
    recovery_path: Option<PathBuf>,
    remove_completed: bool,
    events: broadcast::Sender<QueueEvent>,
}

impl QueueManager {
    /// Create an empty queue. With a `recovery_path`, every mutation rewrites
    /// the snapshot there.
    pub fn new(recovery_path: Option<PathBuf>, remove_completed: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(QueueState {
                jobs: Vec::new(),
                next_id: 1,
                last_processed: None,
            }),
            recovery_path,
            remove_completed,
            events,
        }
    }

    /// Queue persisting to `queue_recovery_<pid>.json` in the configured state directory.
    pub fn from_config(config: &QueueConfig) -> Self {
        let path = persistence::recovery_path_for_current_process(&config.state_dir);
        Self::new(Some(path), config.remove_completed_jobs)
    }

    /// Queue without a recovery file.
    pub fn in_memory() -> Self {
        Self::new(None, false)
    }

    pub fn recovery_path(&self) -> Option<&Path> {
        self.recovery_path.as_deref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Broadcast an event. Having no subscribers is fine.
    pub(crate) fn publish(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rewrite the recovery snapshot. Called with the lock held.
    fn persist(&self, state: &QueueState) {
        let Some(path) = self.recovery_path.as_deref() else {
            return;
        };

        let unfinished = state.jobs.iter().any(|job| job.status != JobStatus::Completed);
        let result = if unfinished {
            persistence::save_snapshot(path, &state.jobs)
        } else {
            match fs::remove_file(path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(PersistenceError::Io {
                    path: path.to_path_buf(),
                    source: e,
                }),
                _ => Ok(()),
            }
        };

        if let Err(e) = result {
            warn!(error = %e, "Failed to persist queue snapshot");
        }
    }

    /// Persist, release the lock, then notify.
    fn commit(&self, state: MutexGuard<'_, QueueState>) {
        self.persist(&state);
        drop(state);
        self.publish(QueueEvent::QueueChanged);
    }

    /// Append a job. Its id is assigned here.
    pub fn add(&self, job: Job) -> JobId {
        let mut state = self.lock();
        let id = state.push(job);
        debug!(job_id = id, "Job added to queue");
        self.commit(state);
        id
    }

    /// Append several jobs with a single notification.
    pub fn add_all(&self, jobs: impl IntoIterator<Item = Job>) -> Vec<JobId> {
        let mut state = self.lock();
        let ids: Vec<JobId> = jobs.into_iter().map(|job| state.push(job)).collect();
        if ids.is_empty() {
            return ids;
        }
        self.commit(state);
        ids
    }

    /// Remove a job. Unknown ids and the job currently in progress are left
    /// alone; returns whether anything was removed.
    pub fn remove(&self, id: JobId) -> bool {
        let mut state = self.lock();
        let Some(index) = state.position(id) else {
            return false;
        };
        if state.jobs[index].status == JobStatus::InProgress {
            warn!(job_id = id, "Refusing to remove the job in progress");
            return false;
        }
        state.jobs.remove(index);
        self.commit(state);
        true
    }

    /// Swap the job at `index` with the one before it. No-op at 0 or out of range.
    pub fn move_up(&self, index: usize) {
        let mut state = self.lock();
        if index == 0 || index >= state.jobs.len() {
            return;
        }
        state.jobs.swap(index - 1, index);
        self.commit(state);
    }

    /// Swap the job at `index` with the one after it. No-op at the last index
    /// or out of range.
    pub fn move_down(&self, index: usize) {
        let mut state = self.lock();
        if index >= state.jobs.len().saturating_sub(1) {
            return;
        }
        state.jobs.swap(index, index + 1);
        self.commit(state);
    }

    /// Dequeue: move the first waiting job to in progress and return a copy.
    ///
    /// This is the only place a job becomes in progress; concurrent callers
    /// never receive the same job.
    pub fn get_next_job_for_processing(&self) -> Option<Job> {
        match self.get_next_job_for_processing_if(|_| Ok::<(), Infallible>(())) {
            Ok(job) => job,
            Err(never) => match never {},
        }
    }

    /// Dequeue gated by `check`, which sees the job that is about to be
    /// dequeued under the same lock. A rejected job stays waiting.
    pub fn get_next_job_for_processing_if<E>(
        &self,
        check: impl FnOnce(&Job) -> Result<(), E>,
    ) -> Result<Option<Job>, E> {
        let mut state = self.lock();
        let Some(index) = state
            .jobs
            .iter()
            .position(|job| job.status == JobStatus::Waiting)
        else {
            return Ok(None);
        };
        check(&state.jobs[index])?;

        let job = &mut state.jobs[index];
        if let Err(e) = job.begin() {
            warn!(error = %e, "Dequeue skipped job");
            return Ok(None);
        }
        let job = job.clone();
        state.last_processed = Some(job.id);
        info!(job_id = job.id, source = %job.source.display(), "Job dequeued");
        self.commit(state);
        Ok(Some(job))
    }

    /// First waiting job, without dequeuing it.
    pub fn next_waiting(&self) -> Option<Job> {
        self.lock()
            .jobs
            .iter()
            .find(|job| job.status == JobStatus::Waiting)
            .cloned()
    }

    /// Record how the job in progress ended.
    ///
    /// With auto-purge enabled, a completed job is removed from the queue.
    /// Returns the finished job either way.
    pub fn complete_job(
        &self,
        id: JobId,
        outcome: &JobOutcome,
        log_path: Option<PathBuf>,
    ) -> Result<Job, QueueError> {
        let mut state = self.lock();
        let index = state.position(id).ok_or(QueueError::JobNotFound(id))?;
        state.jobs[index].finish(outcome, log_path)?;

        let job = if self.remove_completed && outcome == &JobOutcome::Completed {
            state.jobs.remove(index)
        } else {
            state.jobs[index].clone()
        };
        info!(job_id = id, status = %job.status, "Job finished");
        self.commit(state);
        Ok(job)
    }

    /// Manual retry. Only failed or completed jobs can go back to waiting.
    pub fn reset_job_status_to_waiting(&self, id: JobId) -> Result<(), QueueError> {
        let mut state = self.lock();
        let index = state.position(id).ok_or(QueueError::JobNotFound(id))?;
        state.jobs[index].reset_to_waiting()?;
        self.commit(state);
        Ok(())
    }

    /// Drop every completed job.
    pub fn clear_completed(&self) {
        let mut state = self.lock();
        let before = state.jobs.len();
        state.jobs.retain(|job| job.status != JobStatus::Completed);
        if state.jobs.len() == before {
            return;
        }
        self.commit(state);
    }

    /// Drop every job except the one in progress.
    pub fn clear(&self) {
        let mut state = self.lock();
        let before = state.jobs.len();
        state.jobs.retain(|job| job.status == JobStatus::InProgress);
        if state.jobs.len() == before {
            return;
        }
        self.commit(state);
    }

    /// True when some queued job already writes to `path`.
    pub fn check_for_destination_path_duplicates(&self, path: &Path) -> bool {
        self.lock().jobs.iter().any(|job| job.writes_to(path))
    }

    /// Copy of the queue in order.
    pub fn jobs(&self) -> Vec<Job> {
        self.lock().jobs.clone()
    }

    pub fn find(&self, id: JobId) -> Option<Job> {
        let state = self.lock();
        state.position(id).map(|index| state.jobs[index].clone())
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().jobs.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        let mut stats = QueueStats::default();
        for job in &state.jobs {
            match job.status {
                JobStatus::Waiting => stats.waiting += 1,
                JobStatus::InProgress => stats.in_progress += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Error => stats.error += 1,
            }
        }
        stats
    }

    /// The job most recently handed out for processing.
    pub fn last_processed(&self) -> Option<Job> {
        let state = self.lock();
        let id = state.last_processed?;
        state.position(id).map(|index| state.jobs[index].clone())
    }

    /// Write the unfinished part of the queue to `path`.
    pub fn backup_queue(&self, path: &Path) -> Result<(), QueueError> {
        let state = self.lock();
        persistence::save_snapshot(path, &state.jobs)?;
        Ok(())
    }

    /// Append the jobs of a snapshot file. Completed entries are skipped,
    /// in-progress ones come back waiting, and all get fresh ids.
    pub fn restore_queue(&self, path: &Path) -> Result<usize, QueueError> {
        let snapshot = persistence::load_snapshot(path)?;
        Ok(self.append_recovered(snapshot))
    }

    fn append_recovered(&self, snapshot: QueueSnapshot) -> usize {
        let jobs = snapshot.into_recoverable_jobs();
        self.add_all(jobs).len()
    }

    /// Write every job, with its full task payload, to an export file.
    pub fn export_queue(&self, path: &Path) -> Result<(), QueueError> {
        let state = self.lock();
        persistence::save_export(path, &state.jobs)?;
        Ok(())
    }

    /// Append the jobs of an export file as new waiting jobs.
    pub fn import_queue(&self, path: &Path) -> Result<usize, QueueError> {
        let export = persistence::load_export(path)?;
        let jobs = export.jobs.into_iter().map(|entry| entry.into_job());
        Ok(self.add_all(jobs).len())
    }

    /// Merge snapshots left by dead queue instances in `state_dir` and delete
    /// their files. Returns the number of jobs recovered.
    pub fn recover_queues(&self, state_dir: &Path) -> usize {
        let mut recovered = 0;
        for queue in persistence::find_recoverable_queues(state_dir, std::process::id()) {
            let count = self.add_all(queue.jobs).len();
            info!(pid = queue.pid, jobs = count, "Recovered queue from previous instance");
            recovered += count;
            if let Err(e) = fs::remove_file(&queue.path) {
                warn!(path = %queue.path.display(), error = %e, "Failed to delete recovered snapshot");
            }
        }
        recovered
    }
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::in_memory()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Task;
    use crate::persistence::{recovery_file_name, save_snapshot, FORMAT_VERSION};
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::TempDir;

    fn job(name: &str) -> Job {
        Job::new(
            format!("/in/{}.mkv", name),
            format!("/out/{}.mp4", name),
            Task::new(json!({"args": ["--preset", "Fast 1080p30"], "name": name})),
        )
    }

    fn names(queue: &QueueManager) -> Vec<String> {
        queue
            .jobs()
            .iter()
            .map(|j| j.task.as_value()["name"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_add_assigns_increasing_ids() {
        let queue = QueueManager::in_memory();
        let a = queue.add(job("a"));
        let b = queue.add(job("b"));
        assert!(b > a);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.find(a).unwrap().status, JobStatus::Waiting);
    }

    #[test]
    fn test_dequeue_in_order_and_records_last_processed() {
        let queue = QueueManager::in_memory();
        let a = queue.add(job("a"));
        let b = queue.add(job("b"));

        let first = queue.get_next_job_for_processing().unwrap();
        assert_eq!(first.id, a);
        assert_eq!(first.status, JobStatus::InProgress);
        assert!(first.started_at.is_some());
        assert_eq!(queue.last_processed().unwrap().id, a);

        let second = queue.get_next_job_for_processing().unwrap();
        assert_eq!(second.id, b);
        assert!(queue.get_next_job_for_processing().is_none());
    }

    #[test]
    fn test_dequeue_exclusive_across_threads() {
        let queue = Arc::new(QueueManager::in_memory());
        queue.add(job("only"));

        let callers = 8;
        let barrier = Arc::new(Barrier::new(callers));
        let handles: Vec<_> = (0..callers)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    queue.get_next_job_for_processing()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();
        assert_eq!(winners, 1);
        assert_eq!(queue.stats().in_progress, 1);
    }

    #[test]
    fn test_gated_dequeue_checks_the_job_it_dequeues() {
        let queue = QueueManager::in_memory();
        queue.add(job("a"));
        let b = queue.add(job("b"));
        queue.move_up(1);

        let mut checked = None;
        let dequeued = queue
            .get_next_job_for_processing_if(|job| {
                checked = Some(job.destination.clone());
                Ok::<(), String>(())
            })
            .unwrap()
            .unwrap();
        assert_eq!(dequeued.id, b);
        assert_eq!(checked, Some(dequeued.destination));
    }

    #[test]
    fn test_gated_dequeue_rejection_leaves_job_waiting() {
        let queue = QueueManager::in_memory();
        let a = queue.add(job("a"));
        let mut rx = queue.subscribe();

        let result = queue.get_next_job_for_processing_if(|_| Err("low disk"));
        assert_eq!(result.unwrap_err(), "low disk");

        let job = queue.find(a).unwrap();
        assert_eq!(job.status, JobStatus::Waiting);
        assert!(job.started_at.is_none());
        assert!(queue.last_processed().is_none());
        assert!(rx.try_recv().is_err());

        let result = queue.get_next_job_for_processing_if(|_| Ok::<(), &str>(()));
        assert_eq!(result.unwrap().unwrap().id, a);
    }

    #[test]
    fn test_move_up_and_down() {
        let queue = QueueManager::in_memory();
        for name in ["a", "b", "c"] {
            queue.add(job(name));
        }

        queue.move_up(1);
        assert_eq!(names(&queue), vec!["b", "a", "c"]);

        queue.move_down(1);
        assert_eq!(names(&queue), vec!["b", "c", "a"]);
    }

    #[test]
    fn test_move_at_boundaries_is_noop() {
        let queue = QueueManager::in_memory();
        for name in ["a", "b", "c"] {
            queue.add(job(name));
        }
        queue.move_up(0);
        queue.move_down(2);
        queue.move_up(7);
        queue.move_down(7);
        queue.move_up(usize::MAX);
        queue.move_down(usize::MAX);
        assert_eq!(names(&queue), vec!["a", "b", "c"]);

        let empty = QueueManager::in_memory();
        empty.move_down(0);
        empty.move_up(0);
        assert!(empty.jobs().is_empty());
    }

    #[test]
    fn test_remove_unknown_and_in_progress() {
        let queue = QueueManager::in_memory();
        let a = queue.add(job("a"));
        let b = queue.add(job("b"));
        assert!(!queue.remove(999));

        queue.get_next_job_for_processing();
        assert!(!queue.remove(a));
        assert!(queue.remove(b));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_complete_job_and_retry() {
        let queue = QueueManager::in_memory();
        let a = queue.add(job("a"));
        queue.get_next_job_for_processing();

        let done = queue
            .complete_job(a, &JobOutcome::Failed("exit code 3".into()), None)
            .unwrap();
        assert_eq!(done.status, JobStatus::Error);

        queue.reset_job_status_to_waiting(a).unwrap();
        assert_eq!(queue.find(a).unwrap().status, JobStatus::Waiting);
    }

    #[test]
    fn test_complete_waiting_job_is_rejected() {
        let queue = QueueManager::in_memory();
        let a = queue.add(job("a"));
        let err = queue.complete_job(a, &JobOutcome::Completed, None).unwrap_err();
        assert!(matches!(err, QueueError::InvalidOperation(_)));
        assert!(matches!(
            queue.complete_job(42, &JobOutcome::Completed, None),
            Err(QueueError::JobNotFound(42))
        ));
    }

    #[test]
    fn test_retry_guard_on_waiting_job() {
        let queue = QueueManager::in_memory();
        let a = queue.add(job("a"));
        let err = queue.reset_job_status_to_waiting(a).unwrap_err();
        assert!(matches!(err, QueueError::InvalidOperation(_)));
        assert_eq!(queue.find(a).unwrap().status, JobStatus::Waiting);
    }

    #[test]
    fn test_auto_purge_completed() {
        let queue = QueueManager::new(None, true);
        let a = queue.add(job("a"));
        let b = queue.add(job("b"));

        queue.get_next_job_for_processing();
        let finished = queue.complete_job(a, &JobOutcome::Completed, None).unwrap();
        assert_eq!(finished.status, JobStatus::Completed);
        assert!(queue.find(a).is_none());

        queue.get_next_job_for_processing();
        queue.complete_job(b, &JobOutcome::Failed("x".into()), None).unwrap();
        assert!(queue.find(b).is_some());
    }

    #[test]
    fn test_clear_completed_and_clear() {
        let queue = QueueManager::in_memory();
        let a = queue.add(job("a"));
        queue.add(job("b"));
        queue.add(job("c"));
        queue.get_next_job_for_processing();
        queue.complete_job(a, &JobOutcome::Completed, None).unwrap();

        queue.clear_completed();
        assert_eq!(queue.stats(), QueueStats { waiting: 2, ..Default::default() });

        queue.get_next_job_for_processing();
        queue.clear();
        assert_eq!(queue.stats(), QueueStats { in_progress: 1, ..Default::default() });
    }

    #[test]
    fn test_destination_duplicates() {
        let queue = QueueManager::in_memory();
        queue.add(job("a"));
        assert!(queue.check_for_destination_path_duplicates(Path::new("/out/a.mp4")));
        assert!(!queue.check_for_destination_path_duplicates(Path::new("/out/b.mp4")));
    }

    #[test]
    fn test_mutations_publish_queue_changed() {
        let queue = QueueManager::in_memory();
        let mut events = queue.subscribe();
        queue.add(job("a"));
        queue.move_up(0);
        queue.add_all(vec![job("b"), job("c")]);

        assert_eq!(events.try_recv().unwrap(), QueueEvent::QueueChanged);
        assert_eq!(events.try_recv().unwrap(), QueueEvent::QueueChanged);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_every_mutation_rewrites_recovery_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("queue_recovery_test.json");
        let queue = QueueManager::new(Some(path.clone()), false);

        let a = queue.add(job("a"));
        assert_eq!(persistence::load_snapshot(&path).unwrap().jobs.len(), 1);

        queue.get_next_job_for_processing();
        let snapshot = persistence::load_snapshot(&path).unwrap();
        assert_eq!(snapshot.jobs[0].status, JobStatus::InProgress);

        queue.complete_job(a, &JobOutcome::Completed, None).unwrap();
        assert!(!path.exists(), "nothing unfinished left to recover");
    }

    #[test]
    fn test_persistence_failure_does_not_block_mutation() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let queue = QueueManager::new(Some(blocker.join("queue.json")), false);

        let id = queue.add(job("a"));
        assert!(queue.find(id).is_some());
    }

    #[test]
    fn test_backup_excludes_completed() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("backup.json");
        let queue = QueueManager::in_memory();
        let a = queue.add(job("a"));
        queue.add(job("b"));
        queue.get_next_job_for_processing();
        queue.complete_job(a, &JobOutcome::Completed, None).unwrap();

        queue.backup_queue(&path).unwrap();
        let snapshot = persistence::load_snapshot(&path).unwrap();
        assert_eq!(snapshot.jobs.len(), 1);
        assert!(snapshot.jobs.iter().all(|j| j.status != JobStatus::Completed));
    }

    #[test]
    fn test_restore_coerces_in_progress_to_waiting() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("backup.json");

        let source = QueueManager::in_memory();
        source.add(job("a"));
        source.add(job("b"));
        source.get_next_job_for_processing();
        source.backup_queue(&path).unwrap();

        let target = QueueManager::in_memory();
        assert_eq!(target.restore_queue(&path).unwrap(), 2);
        assert_eq!(target.stats().waiting, 2);
        assert_eq!(names(&target), vec!["a", "b"]);
    }

    #[test]
    fn test_export_import_keeps_payload() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("export.json");

        let source = QueueManager::in_memory();
        let a = source.add(job("a"));
        source.get_next_job_for_processing();
        source.complete_job(a, &JobOutcome::Completed, None).unwrap();
        source.export_queue(&path).unwrap();

        let target = QueueManager::in_memory();
        target.add(job("existing"));
        assert_eq!(target.import_queue(&path).unwrap(), 1);
        let imported = target.jobs().pop().unwrap();
        assert_eq!(imported.status, JobStatus::Waiting);
        assert_eq!(imported.task.as_value()["args"], json!(["--preset", "Fast 1080p30"]));
    }

    #[test]
    fn test_recover_queues_merges_and_deletes() {
        let temp_dir = TempDir::new().unwrap();
        let dead_path = temp_dir.path().join(recovery_file_name(u32::MAX - 1));
        let mut running = job("crashed");
        running.id = 4;
        running.begin().unwrap();
        save_snapshot(&dead_path, &[running, job("pending")]).unwrap();

        let queue = QueueManager::in_memory();
        assert_eq!(queue.recover_queues(temp_dir.path()), 2);
        assert_eq!(queue.stats().waiting, 2);
        assert!(!dead_path.exists());
    }

    #[test]
    fn test_restore_rejects_unknown_version() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("future.json");
        fs::write(
            &path,
            format!(r#"{{"version": {}, "saved_at": 0, "jobs": []}}"#, FORMAT_VERSION + 1),
        )
        .unwrap();
        let queue = QueueManager::in_memory();
        assert!(matches!(queue.restore_queue(&path), Err(QueueError::Persistence(_))));
    }

    proptest! {
        #[test]
        fn prop_reordering_keeps_every_job(
            moves in prop::collection::vec(
                (any::<bool>(), prop_oneof![0usize..8, Just(usize::MAX), any::<usize>()]),
                0..32,
            )
        ) {
            let queue = QueueManager::in_memory();
            let ids: Vec<JobId> = (0..5).map(|i| queue.add(job(&i.to_string()))).collect();

            for (up, index) in moves {
                if up { queue.move_up(index) } else { queue.move_down(index) }
            }

            let mut after: Vec<JobId> = queue.jobs().iter().map(|j| j.id).collect();
            after.sort_unstable();
            prop_assert_eq!(after, ids);
        }
    }
}
