use std::path::PathBuf;

use anyhow::Result;
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use photocache_core::domain::TaskStatus;
use photocache_core::error::Error;
use photocache_core::Library;

use super::{display_name, optimize};

fn status_color(status: TaskStatus) -> Color {
    match status {
        TaskStatus::Running => Color::Cyan,
        TaskStatus::Paused => Color::Yellow,
        TaskStatus::Stopped => Color::Red,
        TaskStatus::Completed => Color::Green,
    }
}

pub fn ls(lib: &Library) -> Result<()> {
    let tasks = lib.get_all_tasks();
    if tasks.is_empty() {
        println!("No optimization tasks.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Folder"),
        Cell::new("Status"),
        Cell::new("Progress"),
        Cell::new("Optimized"),
        Cell::new("Failed"),
        Cell::new("Path"),
    ]);

    for task in &tasks {
        table.add_row(vec![
            Cell::new(display_name(&task.folder)),
            Cell::new(task.status).fg(status_color(task.status)),
            Cell::new(format!("{}/{}", task.processed_files, task.total_files)),
            Cell::new(task.optimized_files),
            Cell::new(task.failed_files),
            Cell::new(task.folder.display()),
        ]);
    }

    println!("{table}");
    Ok(())
}

pub fn pause(lib: &Library, folder: PathBuf) -> Result<()> {
    let task = lib.pause_task(&folder)?;
    println!("Paused {} at {}/{}", display_name(&task.folder), task.processed_files, task.total_files);
    Ok(())
}

/// A paused task picks up where it left off. A stopped one (including one
/// interrupted by a previous exit) restarts over the files still missing
/// an optimized artifact.
pub async fn resume(lib: &Library, folder: PathBuf) -> Result<()> {
    match lib.resume_task(&folder) {
        Ok(task) => optimize::follow(lib, &task.folder).await,
        Err(Error::InvalidTransition {
            status: TaskStatus::Stopped,
            ..
        }) => {
            println!("Task was stopped; restarting the remaining files.");
            optimize::run(lib, folder, optimize::Mode::RetryFailed).await
        }
        Err(e) => Err(e.into()),
    }
}

pub fn stop(lib: &Library, folder: PathBuf) -> Result<()> {
    let task = lib.stop_task(&folder)?;
    println!("Stopped {} at {}/{}", display_name(&task.folder), task.processed_files, task.total_files);
    Ok(())
}

pub fn remove(lib: &Library, folder: PathBuf) -> Result<()> {
    lib.remove_optimization_task(&folder)?;
    println!("Removed task for {}", folder.display());
    Ok(())
}
