use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::runtime::Handle;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};

use super::{Job, JobRunner, Placement, QueuedJob, TaskBoard};
use crate::catalog::Catalog;
use crate::domain::OptimizationTask;
use crate::error::{Error, Result};
use crate::events::{EventBus, LibraryEvent};

/// Runs optimization jobs on a bounded pool of blocking workers.
///
/// All task state sits in one [`TaskBoard`] behind a mutex; every job
/// completion updates counters under that lock. A worker that finishes
/// releases its permit and immediately pulls the next job, so dispatch is
/// driven by completions rather than polling.
pub struct TaskEngine {
    board: Mutex<TaskBoard>,
    permits: Arc<Semaphore>,
    runtime: Handle,
    runner: Arc<dyn JobRunner>,
    catalog: Arc<Catalog>,
    events: EventBus,
}

impl TaskEngine {
    /// Must be called from inside a tokio runtime.
    pub fn new(
        runner: Arc<dyn JobRunner>,
        catalog: Arc<Catalog>,
        events: EventBus,
        workers: usize,
    ) -> Result<Arc<Self>> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let mut board = TaskBoard::new();
        for task in board.restore(catalog.list_tasks()?) {
            tracing::info!(folder = %task.folder.display(), "interrupted task marked stopped");
            catalog.save_task(&task)?;
        }

        Ok(Arc::new(Self {
            board: Mutex::new(board),
            permits: Arc::new(Semaphore::new(workers.max(1))),
            runtime,
            runner,
            catalog,
            events,
        }))
    }

    fn lock_board(&self) -> MutexGuard<'_, TaskBoard> {
        self.board.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn tasks(&self) -> Vec<OptimizationTask> {
        self.lock_board().tasks()
    }

    pub fn task(&self, folder: &Path) -> Option<OptimizationTask> {
        self.lock_board().get(folder).cloned()
    }

    pub fn is_active(&self, folder: &Path) -> bool {
        self.lock_board().is_active(folder)
    }

    // ── Commands ─────────────────────────────────────────────────────

    pub fn create(&self, folder: &Path, total: usize) -> Result<OptimizationTask> {
        let (task, dropped) = {
            let mut board = self.lock_board();
            let created = board.create(folder, total);
            self.catalog.save_task(&created.0)?;
            created
        };
        cancel_all(dropped);
        tracing::info!(folder = %folder.display(), total, "task created");
        Ok(task)
    }

    pub fn reset(&self, folder: &Path, total: usize) -> Result<OptimizationTask> {
        let mut board = self.lock_board();
        let task = board.reset(folder, total)?;
        self.catalog.save_task(&task)?;
        tracing::info!(folder = %folder.display(), total, "task reset");
        Ok(task)
    }

    pub fn pause(&self, folder: &Path) -> Result<OptimizationTask> {
        let mut board = self.lock_board();
        let task = board.pause(folder)?;
        self.catalog.save_task(&task)?;
        Ok(task)
    }

    pub fn resume(self: &Arc<Self>, folder: &Path) -> Result<OptimizationTask> {
        let task = {
            let mut board = self.lock_board();
            let task = board.resume(folder)?;
            self.catalog.save_task(&task)?;
            task
        };
        self.pump();
        Ok(task)
    }

    pub fn stop(&self, folder: &Path) -> Result<OptimizationTask> {
        let (task, dropped) = {
            let mut board = self.lock_board();
            let stopped = board.stop(folder)?;
            self.catalog.save_task(&stopped.0)?;
            stopped
        };
        tracing::info!(folder = %folder.display(), dropped = dropped.len(), "task stopped");
        cancel_all(dropped);
        Ok(task)
    }

    /// Delete the task record. Rejected with [`Error::TaskBusy`] while running.
    pub fn remove(&self, folder: &Path) -> Result<()> {
        let dropped = {
            let mut board = self.lock_board();
            let dropped = board.remove(folder)?;
            self.catalog.delete_task(folder)?;
            dropped
        };
        cancel_all(dropped);
        Ok(())
    }

    /// Drop the task whatever its state (the folder is going away).
    pub fn forget(&self, folder: &Path) -> Result<()> {
        let dropped = {
            let mut board = self.lock_board();
            let dropped = board.forget(folder);
            self.catalog.delete_task(folder)?;
            dropped
        };
        cancel_all(dropped);
        Ok(())
    }

    /// Start a run over `jobs`. With `restart_only` the existing task must be
    /// stopped or completed (reset semantics); otherwise it is recreated.
    pub fn start(
        self: &Arc<Self>,
        folder: &Path,
        jobs: Vec<Job>,
        restart_only: bool,
    ) -> Result<OptimizationTask> {
        let (task, dropped) = {
            let mut board = self.lock_board();
            let (mut task, dropped) = if restart_only && board.get(folder).is_some() {
                (board.reset(folder, jobs.len())?, Vec::new())
            } else {
                board.create(folder, jobs.len())
            };
            for job in jobs {
                board.submit(job, None)?;
            }
            if let Some(current) = board.get(folder) {
                task = current.clone();
            }
            self.catalog.save_task(&task)?;
            (task, dropped)
        };
        cancel_all(dropped);
        tracing::info!(folder = %folder.display(), total = task.total_files, "task started");
        self.pump();
        Ok(task)
    }

    /// Queue one job. It counts against the folder's task when that task is
    /// running or paused, and runs on its own when there is no active task.
    pub fn submit(self: &Arc<Self>, job: Job) -> Result<oneshot::Receiver<Result<PathBuf>>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut board = self.lock_board();
            let folder = job.folder.clone();
            if board.submit(job, Some(tx))? == Placement::Tracked {
                if let Some(task) = board.get(&folder) {
                    self.catalog.save_task(task)?;
                }
            }
        }
        self.pump();
        Ok(rx)
    }

    /// Add newly discovered files to the folder's task; see [`TaskBoard::extend`].
    pub fn extend(self: &Arc<Self>, folder: &Path, jobs: Vec<Job>) -> Result<usize> {
        let queued = {
            let mut board = self.lock_board();
            let (task, queued) = board.extend(folder, jobs);
            if let (Some(task), true) = (task, queued > 0) {
                self.catalog.save_task(&task)?;
            }
            queued
        };
        if queued > 0 {
            self.pump();
        }
        Ok(queued)
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    /// Hand queued jobs to free workers.
    pub fn pump(self: &Arc<Self>) {
        let mut board = self.lock_board();
        while board.has_dispatchable() {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };
            let Some(queued) = board.next_job() else {
                break;
            };
            let engine = Arc::clone(self);
            self.runtime
                .spawn_blocking(move || engine.execute(queued, permit));
        }
    }

    fn execute(self: Arc<Self>, queued: QueuedJob, permit: OwnedSemaphorePermit) {
        let QueuedJob {
            job,
            generation,
            reply,
        } = queued;

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| self.runner.run(&job)))
            .unwrap_or_else(|_| {
                Err(Error::Encode {
                    path: job.source.clone(),
                    message: "encoder panicked".to_string(),
                })
            });

        match &result {
            Ok(path) => tracing::debug!(
                source = %job.source.display(),
                artifact = %path.display(),
                "job done"
            ),
            Err(e) => tracing::warn!(source = %job.source.display(), error = %e, "job failed"),
        }

        let completion = {
            let mut board = self.lock_board();
            let completion = board.complete(&job.folder, generation, result.is_ok());
            if let Some(c) = &completion {
                if let Err(e) = self.catalog.save_task(&c.task) {
                    tracing::warn!(folder = %job.folder.display(), error = %e, "failed to persist task");
                }
            }
            completion
        };

        if let Some(c) = completion.filter(|c| c.finished) {
            tracing::info!(
                folder = %c.task.folder.display(),
                optimized = c.task.optimized_files,
                failed = c.task.failed_files,
                "task completed"
            );
            self.events.emit(LibraryEvent::TaskCompleted {
                folder: c.task.folder,
            });
        }

        drop(permit);
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
        self.pump();
    }
}

fn cancel_all(jobs: Vec<QueuedJob>) {
    for job in jobs {
        job.cancel();
    }
}
