use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use indicatif::ProgressBar;
use photocache_core::domain::{OptimizationTask, TaskStatus};
use photocache_core::Library;

use super::{active_style, display_name, done_style};

pub enum Mode {
    All,
    RetryFailed,
    Regenerate,
}

pub async fn run(lib: &Library, folder: PathBuf, mode: Mode) -> Result<()> {
    let task = match mode {
        Mode::All => lib.optimize_folder(&folder).await?,
        Mode::RetryFailed => lib.retry_failed(&folder).await?,
        Mode::Regenerate => lib.regenerate_folder(&folder).await?,
    };
    follow(lib, &task.folder).await
}

/// Show a progress bar for the folder's task until it leaves the running
/// state. Ctrl-C stops the task.
pub(crate) async fn follow(lib: &Library, folder: &Path) -> Result<()> {
    let Some(task) = lib.get_task(folder) else {
        return Ok(());
    };

    println!();
    println!("  Optimizing {} ({} files)", display_name(folder), task.total_files);

    let pb = ProgressBar::new(task.total_files as u64);
    pb.set_style(active_style());
    pb.set_prefix("Encoding");
    pb.enable_steady_tick(Duration::from_millis(80));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(Duration::from_millis(100));

    let last = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                let stopped = lib.stop_task(folder)?;
                pb.abandon_with_message("stopped");
                println!(
                    "  Stopped after {}/{} files. Resume with 'photocache resume {}'.",
                    stopped.processed_files,
                    stopped.total_files,
                    folder.display()
                );
                return Ok(());
            }
            _ = ticker.tick() => {}
        }

        let Some(task) = lib.get_task(folder) else {
            pb.finish_and_clear();
            return Ok(());
        };
        pb.set_length(task.total_files as u64);
        pb.set_position(task.processed_files as u64);
        if task.failed_files > 0 {
            pb.set_message(format!("{} failed", task.failed_files));
        }
        if task.status != TaskStatus::Running {
            break task;
        }
    };

    pb.set_style(done_style());
    pb.set_prefix("done");
    pb.finish_with_message(summary(&last));
    println!();
    Ok(())
}

pub(crate) fn summary(task: &OptimizationTask) -> String {
    match task.failed_files {
        0 => format!("Optimized {} files", task.optimized_files),
        failed => format!(
            "Optimized {} files, {} failed (retry with --retry-failed)",
            task.optimized_files, failed
        ),
    }
}
