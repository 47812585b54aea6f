//! Per-folder optimization tasks.
//!
//! [`TaskBoard`] is the state machine: one slot per folder holding the task
//! record, its generation and its queue of pending jobs. It does no I/O and
//! lives behind a single lock inside [`TaskEngine`], which owns the worker
//! pool and persistence.

pub mod engine;
pub mod job;

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use tokio::sync::oneshot;

use crate::domain::{OptimizationTask, TaskStatus};
use crate::error::{Error, Result};

pub use engine::TaskEngine;
pub use job::{Job, JobRunner, Optimizer};

pub(crate) type Reply = oneshot::Sender<Result<PathBuf>>;

/// A job waiting for a worker, tagged with the task generation it belongs to.
/// Untracked jobs run outside any task and never touch counters.
pub(crate) struct QueuedJob {
    pub job: Job,
    pub generation: Option<u64>,
    pub reply: Option<Reply>,
}

impl QueuedJob {
    pub fn cancel(self) {
        if let Some(reply) = self.reply {
            let _ = reply.send(Err(Error::JobCancelled(self.job.source)));
        }
    }
}

struct TaskSlot {
    task: OptimizationTask,
    generation: u64,
    queue: VecDeque<QueuedJob>,
    in_flight: usize,
}

/// Where a submitted job ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Counted against the folder's task.
    Tracked,
    /// The folder has no active task; the job runs on its own.
    Untracked,
}

/// Result of a job completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub task: OptimizationTask,
    pub finished: bool,
}

#[derive(Default)]
pub struct TaskBoard {
    slots: HashMap<PathBuf, TaskSlot>,
    loose: VecDeque<QueuedJob>,
    next_generation: u64,
}

impl TaskBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load persisted tasks. Queues do not survive a restart, so tasks that
    /// were running or paused come back stopped with their counters intact.
    pub fn restore(&mut self, tasks: Vec<OptimizationTask>) -> Vec<OptimizationTask> {
        let mut changed = Vec::new();
        for mut task in tasks {
            if task.is_active() {
                task.status = TaskStatus::Stopped;
                changed.push(task.clone());
            }
            let generation = self.bump();
            self.slots.insert(
                task.folder.clone(),
                TaskSlot {
                    task,
                    generation,
                    queue: VecDeque::new(),
                    in_flight: 0,
                },
            );
        }
        changed
    }

    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn slot(&self, folder: &Path) -> Result<&TaskSlot> {
        self.slots
            .get(folder)
            .ok_or_else(|| Error::TaskNotFound(folder.to_path_buf()))
    }

    fn slot_mut(&mut self, folder: &Path) -> Result<&mut TaskSlot> {
        self.slots
            .get_mut(folder)
            .ok_or_else(|| Error::TaskNotFound(folder.to_path_buf()))
    }

    pub fn get(&self, folder: &Path) -> Option<&OptimizationTask> {
        self.slots.get(folder).map(|s| &s.task)
    }

    pub fn tasks(&self) -> Vec<OptimizationTask> {
        let mut tasks: Vec<_> = self.slots.values().map(|s| s.task.clone()).collect();
        tasks.sort_by(|a, b| a.folder.cmp(&b.folder));
        tasks
    }

    /// Running or paused.
    pub fn is_active(&self, folder: &Path) -> bool {
        self.get(folder).is_some_and(|t| t.is_active())
    }

    // ── Transitions ──────────────────────────────────────────────────

    /// Create the folder's task, or start it over if it already exists.
    /// Pending jobs of the previous run are returned for cancellation.
    pub fn create(&mut self, folder: &Path, total: usize) -> (OptimizationTask, Vec<QueuedJob>) {
        let generation = self.bump();
        let task = OptimizationTask::new(folder.to_path_buf(), total);
        let previous = self.slots.insert(
            folder.to_path_buf(),
            TaskSlot {
                task: task.clone(),
                generation,
                queue: VecDeque::new(),
                in_flight: 0,
            },
        );
        let dropped = previous.map(|s| s.queue.into()).unwrap_or_default();
        (task, dropped)
    }

    /// Zero the counters of a stopped or completed task for a new run.
    pub fn reset(&mut self, folder: &Path, total: usize) -> Result<OptimizationTask> {
        let status = self.slot(folder)?.task.status;
        if !matches!(status, TaskStatus::Stopped | TaskStatus::Completed) {
            return Err(Error::InvalidTransition {
                folder: folder.to_path_buf(),
                status,
                action: "reset",
            });
        }
        let (task, _) = self.create(folder, total);
        Ok(task)
    }

    pub fn pause(&mut self, folder: &Path) -> Result<OptimizationTask> {
        let slot = self.slot_mut(folder)?;
        match slot.task.status {
            TaskStatus::Running | TaskStatus::Paused => {
                slot.task.status = TaskStatus::Paused;
                Ok(slot.task.clone())
            }
            status => Err(Error::InvalidTransition {
                folder: folder.to_path_buf(),
                status,
                action: "pause",
            }),
        }
    }

    pub fn resume(&mut self, folder: &Path) -> Result<OptimizationTask> {
        let slot = self.slot_mut(folder)?;
        match slot.task.status {
            TaskStatus::Running | TaskStatus::Paused => {
                slot.task.status = if slot.task.processed_files >= slot.task.total_files {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Running
                };
                Ok(slot.task.clone())
            }
            status => Err(Error::InvalidTransition {
                folder: folder.to_path_buf(),
                status,
                action: "resume",
            }),
        }
    }

    /// Stop dispatching. Queued jobs are handed back; in-flight jobs still count.
    pub fn stop(&mut self, folder: &Path) -> Result<(OptimizationTask, Vec<QueuedJob>)> {
        let slot = self.slot_mut(folder)?;
        match slot.task.status {
            TaskStatus::Running | TaskStatus::Paused | TaskStatus::Stopped => {
                slot.task.status = TaskStatus::Stopped;
                let dropped = slot.queue.drain(..).collect();
                Ok((slot.task.clone(), dropped))
            }
            status => Err(Error::InvalidTransition {
                folder: folder.to_path_buf(),
                status,
                action: "stop",
            }),
        }
    }

    /// Delete the task. A running task must be paused or stopped first.
    pub fn remove(&mut self, folder: &Path) -> Result<Vec<QueuedJob>> {
        if self.slot(folder)?.task.status == TaskStatus::Running {
            return Err(Error::TaskBusy(folder.to_path_buf()));
        }
        Ok(self.forget(folder))
    }

    /// Delete the task whatever its state.
    pub fn forget(&mut self, folder: &Path) -> Vec<QueuedJob> {
        self.slots
            .remove(folder)
            .map(|s| s.queue.into())
            .unwrap_or_default()
    }

    // ── Jobs ─────────────────────────────────────────────────────────

    /// Queue a job against the folder's task when one is running or paused.
    /// A stopped task refuses new work until it is reset.
    pub fn submit(&mut self, job: Job, reply: Option<Reply>) -> Result<Placement> {
        match self.slots.get_mut(&job.folder) {
            Some(slot) if slot.task.status == TaskStatus::Stopped => {
                Err(Error::TaskStopped(job.folder))
            }
            Some(slot) if slot.task.is_active() => {
                let outstanding =
                    slot.task.processed_files + slot.queue.len() + slot.in_flight;
                if outstanding >= slot.task.total_files {
                    slot.task.total_files += 1;
                }
                slot.queue.push_back(QueuedJob {
                    job,
                    generation: Some(slot.generation),
                    reply,
                });
                Ok(Placement::Tracked)
            }
            _ => {
                self.loose.push_back(QueuedJob {
                    job,
                    generation: None,
                    reply,
                });
                Ok(Placement::Untracked)
            }
        }
    }

    /// Add newly discovered files to the folder's task. A missing task is
    /// created, a completed one runs again, a stopped one is left alone.
    /// Returns the updated task and how many jobs were queued.
    pub fn extend(&mut self, folder: &Path, jobs: Vec<Job>) -> (Option<OptimizationTask>, usize) {
        if jobs.is_empty() {
            return (self.get(folder).cloned(), 0);
        }
        if !self.slots.contains_key(folder) {
            self.create(folder, 0);
        }
        let Some(slot) = self.slots.get_mut(folder) else {
            return (None, 0);
        };
        if slot.task.status == TaskStatus::Stopped {
            return (Some(slot.task.clone()), 0);
        }
        if slot.task.status == TaskStatus::Completed {
            slot.task.status = TaskStatus::Running;
        }

        let count = jobs.len();
        slot.task.total_files += count;
        for job in jobs {
            slot.queue.push_back(QueuedJob {
                job,
                generation: Some(slot.generation),
                reply: None,
            });
        }
        (Some(slot.task.clone()), count)
    }

    pub fn has_dispatchable(&self) -> bool {
        !self.loose.is_empty()
            || self
                .slots
                .values()
                .any(|s| s.task.status == TaskStatus::Running && !s.queue.is_empty())
    }

    /// Take the next job to run: loose jobs first, then the running task
    /// with the fewest jobs in flight.
    pub(crate) fn next_job(&mut self) -> Option<QueuedJob> {
        if let Some(job) = self.loose.pop_front() {
            return Some(job);
        }
        let slot = self
            .slots
            .values_mut()
            .filter(|s| s.task.status == TaskStatus::Running && !s.queue.is_empty())
            .min_by_key(|s| s.in_flight)?;
        slot.in_flight += 1;
        slot.queue.pop_front()
    }

    /// Account for a finished job. Jobs from an older generation (the task
    /// was reset or recreated meanwhile) and untracked jobs change nothing.
    pub fn complete(
        &mut self,
        folder: &Path,
        generation: Option<u64>,
        succeeded: bool,
    ) -> Option<Completion> {
        let generation = generation?;
        let slot = self.slots.get_mut(folder)?;
        if slot.generation != generation {
            return None;
        }
        slot.in_flight = slot.in_flight.saturating_sub(1);

        let task = &mut slot.task;
        task.processed_files += 1;
        if succeeded {
            task.optimized_files += 1;
        } else {
            task.failed_files += 1;
        }

        let finished =
            task.status == TaskStatus::Running && task.processed_files >= task.total_files;
        if finished {
            task.status = TaskStatus::Completed;
        }
        Some(Completion {
            task: task.clone(),
            finished,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MediaKind;

    fn folder() -> PathBuf {
        PathBuf::from("/photos")
    }

    fn job(name: &str) -> Job {
        Job {
            folder: folder(),
            source: folder().join(name),
            fingerprint: format!("fp-{name}"),
            kind: MediaKind::Image,
            original_size: 10,
            require_registered: false,
        }
    }

    fn assert_counters_consistent(task: &OptimizationTask) {
        assert_eq!(
            task.processed_files,
            task.optimized_files + task.failed_files,
            "{task:?}"
        );
    }

    fn run_all(board: &mut TaskBoard, succeed: bool) -> usize {
        let mut ran = 0;
        while let Some(q) = board.next_job() {
            board.complete(&q.job.folder, q.generation, succeed);
            ran += 1;
        }
        ran
    }

    #[test]
    fn test_create_then_complete() {
        let mut board = TaskBoard::new();
        let (task, dropped) = board.create(&folder(), 2);
        assert_eq!(task.status, TaskStatus::Running);
        assert!(dropped.is_empty());

        board.submit(job("a.jpg"), None).unwrap();
        board.submit(job("b.jpg"), None).unwrap();
        assert_eq!(run_all(&mut board, true), 2);

        let task = board.get(&folder()).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!((task.total_files, task.processed_files, task.optimized_files), (2, 2, 2));
    }

    #[test]
    fn test_create_with_zero_total_is_completed() {
        let mut board = TaskBoard::new();
        let (task, _) = board.create(&folder(), 0);
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn test_create_is_idempotent_and_resets() {
        let mut board = TaskBoard::new();
        board.create(&folder(), 3);
        board.submit(job("a.jpg"), None).unwrap();
        let q = board.next_job().unwrap();
        board.submit(job("b.jpg"), None).unwrap();

        let (task, dropped) = board.create(&folder(), 5);
        assert_eq!(task.processed_files, 0);
        assert_eq!(task.total_files, 5);
        assert_eq!(dropped.len(), 1);
        assert_eq!(board.tasks().len(), 1);

        // The in-flight job from the old generation no longer counts.
        assert!(board.complete(&folder(), q.generation, true).is_none());
        assert_eq!(board.get(&folder()).unwrap().processed_files, 0);
    }

    #[test]
    fn test_pause_blocks_dispatch_until_resume() {
        let mut board = TaskBoard::new();
        board.create(&folder(), 2);
        board.submit(job("a.jpg"), None).unwrap();
        board.submit(job("b.jpg"), None).unwrap();

        board.pause(&folder()).unwrap();
        assert!(!board.has_dispatchable());
        assert!(board.next_job().is_none());
        assert_eq!(board.get(&folder()).unwrap().processed_files, 0);

        board.resume(&folder()).unwrap();
        assert_eq!(run_all(&mut board, true), 2);
        assert_eq!(board.get(&folder()).unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn test_in_flight_job_counts_after_pause_but_does_not_complete() {
        let mut board = TaskBoard::new();
        board.create(&folder(), 1);
        board.submit(job("a.jpg"), None).unwrap();
        let q = board.next_job().unwrap();
        board.pause(&folder()).unwrap();

        let c = board.complete(&folder(), q.generation, true).unwrap();
        assert!(!c.finished);
        assert_eq!(c.task.status, TaskStatus::Paused);
        assert_eq!(c.task.processed_files, 1);

        let task = board.resume(&folder()).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn test_stop_drops_queue_and_refuses_new_jobs() {
        let mut board = TaskBoard::new();
        board.create(&folder(), 3);
        for name in ["a.jpg", "b.jpg", "c.jpg"] {
            board.submit(job(name), None).unwrap();
        }
        let in_flight = board.next_job().unwrap();

        let (task, dropped) = board.stop(&folder()).unwrap();
        assert_eq!(task.status, TaskStatus::Stopped);
        assert_eq!(dropped.len(), 2);
        assert!(board.next_job().is_none());

        // In-flight work still lands in the counters.
        let c = board.complete(&folder(), in_flight.generation, false).unwrap();
        assert_eq!(c.task.failed_files, 1);
        assert_eq!(c.task.status, TaskStatus::Stopped);

        assert!(matches!(
            board.submit(job("d.jpg"), None),
            Err(Error::TaskStopped(_))
        ));
    }

    #[test]
    fn test_reset_requires_stopped_or_completed() {
        let mut board = TaskBoard::new();
        board.create(&folder(), 1);
        assert!(matches!(
            board.reset(&folder(), 4),
            Err(Error::InvalidTransition { action: "reset", .. })
        ));

        board.stop(&folder()).unwrap();
        let task = board.reset(&folder(), 4).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.total_files, 4);
    }

    #[test]
    fn test_remove_running_is_busy() {
        let mut board = TaskBoard::new();
        board.create(&folder(), 1);
        assert!(matches!(board.remove(&folder()), Err(Error::TaskBusy(_))));

        board.pause(&folder()).unwrap();
        board.remove(&folder()).unwrap();
        assert!(board.get(&folder()).is_none());
    }

    #[test]
    fn test_unknown_folder() {
        let mut board = TaskBoard::new();
        assert!(matches!(board.pause(&folder()), Err(Error::TaskNotFound(_))));
        assert!(matches!(board.remove(&folder()), Err(Error::TaskNotFound(_))));
    }

    #[test]
    fn test_invalid_transitions() {
        let mut board = TaskBoard::new();
        board.create(&folder(), 0);
        assert!(matches!(
            board.pause(&folder()),
            Err(Error::InvalidTransition { status: TaskStatus::Completed, .. })
        ));
        assert!(board.stop(&folder()).is_err());

        board.create(&folder(), 1);
        board.stop(&folder()).unwrap();
        assert!(board.resume(&folder()).is_err());
        // Stopping twice is fine.
        assert!(board.stop(&folder()).is_ok());
    }

    #[test]
    fn test_submit_without_task_is_untracked() {
        let mut board = TaskBoard::new();
        assert_eq!(board.submit(job("a.jpg"), None).unwrap(), Placement::Untracked);
        let q = board.next_job().unwrap();
        assert!(q.generation.is_none());
        assert!(board.complete(&folder(), q.generation, true).is_none());
        assert!(board.tasks().is_empty());
    }

    #[test]
    fn test_submit_beyond_total_grows_total() {
        let mut board = TaskBoard::new();
        board.create(&folder(), 1);
        board.submit(job("a.jpg"), None).unwrap();
        board.submit(job("b.jpg"), None).unwrap();
        assert_eq!(board.get(&folder()).unwrap().total_files, 2);
        run_all(&mut board, true);
        assert_eq!(board.get(&folder()).unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn test_extend_creates_missing_task() {
        let mut board = TaskBoard::new();
        let (task, queued) = board.extend(&folder(), vec![job("a.jpg"), job("b.jpg")]);
        assert_eq!(queued, 2);
        let task = task.unwrap();
        assert_eq!(task.total_files, 2);
        assert_eq!(task.status, TaskStatus::Running);
    }

    #[test]
    fn test_extend_reopens_completed_task() {
        let mut board = TaskBoard::new();
        board.create(&folder(), 1);
        board.submit(job("a.jpg"), None).unwrap();
        run_all(&mut board, true);

        let (task, queued) = board.extend(&folder(), vec![job("b.jpg")]);
        assert_eq!(queued, 1);
        let task = task.unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!((task.total_files, task.processed_files), (2, 1));

        run_all(&mut board, true);
        assert_eq!(board.get(&folder()).unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn test_extend_leaves_stopped_task_alone() {
        let mut board = TaskBoard::new();
        board.create(&folder(), 1);
        board.stop(&folder()).unwrap();
        let (_, queued) = board.extend(&folder(), vec![job("b.jpg")]);
        assert_eq!(queued, 0);
        assert!(!board.has_dispatchable());
    }

    #[test]
    fn test_restore_stops_active_tasks() {
        let mut board = TaskBoard::new();
        let mut running = OptimizationTask::new(PathBuf::from("/a"), 10);
        running.processed_files = 4;
        running.optimized_files = 4;
        let done = OptimizationTask::new(PathBuf::from("/b"), 0);

        let changed = board.restore(vec![running, done]);
        assert_eq!(changed.len(), 1);
        let a = board.get(Path::new("/a")).unwrap();
        assert_eq!(a.status, TaskStatus::Stopped);
        assert_eq!(a.processed_files, 4);
        assert_eq!(board.get(Path::new("/b")).unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn test_counters_stay_consistent_through_mixed_outcomes() {
        let mut board = TaskBoard::new();
        board.create(&folder(), 6);
        for i in 0..6 {
            board.submit(job(&format!("{i}.jpg")), None).unwrap();
        }
        let mut i = 0;
        while let Some(q) = board.next_job() {
            if i == 2 {
                board.pause(&folder()).unwrap();
                assert_counters_consistent(board.get(&folder()).unwrap());
                board.resume(&folder()).unwrap();
            }
            let c = board.complete(&folder(), q.generation, i % 3 != 0).unwrap();
            assert_counters_consistent(&c.task);
            i += 1;
        }
        let task = board.get(&folder()).unwrap();
        assert_eq!((task.optimized_files, task.failed_files), (4, 2));
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn test_cancelled_job_reply() {
        let (tx, mut rx) = oneshot::channel();
        let mut board = TaskBoard::new();
        board.create(&folder(), 1);
        board.submit(job("a.jpg"), Some(tx)).unwrap();
        let (_, dropped) = board.stop(&folder()).unwrap();
        for q in dropped {
            q.cancel();
        }
        assert!(matches!(rx.try_recv().unwrap(), Err(Error::JobCancelled(_))));
    }
}
