use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use indicatif::ProgressBar;
use photocache_core::domain::{MediaDescriptor, MediaKind};
use photocache_core::Library;

use super::{display_name, format_size, format_timestamp, spinner_style};

pub fn add(lib: &Library, path: PathBuf) -> Result<()> {
    let folder = lib.register_library_folder(&path)?;
    println!("Added folder: {}", folder.path.display());
    Ok(())
}

pub async fn rm(lib: &Library, path: PathBuf) -> Result<()> {
    let folder = lib.unregister_library_folder(&path).await?;
    println!("Removed folder: {}", folder.path.display());
    Ok(())
}

/// Per-folder totals from the catalog's media rows.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct FolderStats {
    pub(crate) images: usize,
    pub(crate) videos: usize,
    pub(crate) total_size: u64,
}

pub(crate) fn folder_stats(
    folders: &[PathBuf],
    media: &[MediaDescriptor],
) -> HashMap<PathBuf, FolderStats> {
    let mut stats: HashMap<PathBuf, FolderStats> = HashMap::new();
    for m in media {
        // Deepest registered folder containing the file.
        let Some(owner) = folders
            .iter()
            .filter(|f| m.path.starts_with(f))
            .max_by_key(|f| f.components().count())
        else {
            continue;
        };
        let entry = stats.entry(owner.clone()).or_default();
        match m.kind {
            MediaKind::Image => entry.images += 1,
            MediaKind::Video => entry.videos += 1,
        }
        entry.total_size += m.size;
    }
    stats
}

pub fn ls(lib: &Library) -> Result<()> {
    let folders = lib.get_library_folders()?;
    if folders.is_empty() {
        println!("No folders registered. Add one with 'photocache folders add <path>'.");
        return Ok(());
    }

    let paths: Vec<PathBuf> = folders.iter().map(|f| f.path.clone()).collect();
    let stats = folder_stats(&paths, &lib.load_media_files_from_db()?);

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("ID"),
        Cell::new("Name"),
        Cell::new("Images"),
        Cell::new("Videos"),
        Cell::new("Size"),
        Cell::new("Last Scanned"),
        Cell::new("Path"),
    ]);

    for folder in &folders {
        let s = stats.get(&folder.path);
        table.add_row(vec![
            Cell::new(folder.id),
            Cell::new(display_name(&folder.path)),
            Cell::new(s.map_or(0, |s| s.images)),
            Cell::new(s.map_or(0, |s| s.videos)),
            Cell::new(format_size(s.map_or(0, |s| s.total_size))),
            Cell::new(format_timestamp(folder.last_scanned)),
            Cell::new(folder.path.display()),
        ]);
    }

    println!("{table}");
    Ok(())
}

pub async fn scan(lib: &Library, folder: PathBuf) -> Result<()> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(spinner_style());
    pb.set_prefix("Scanning");
    pb.set_message(display_name(&folder));
    pb.enable_steady_tick(Duration::from_millis(80));

    let media = lib.scan_folder(&folder).await?;
    pb.finish_and_clear();

    let videos = media.iter().filter(|m| m.kind == MediaKind::Video).count();
    let size: u64 = media.iter().map(|m| m.size).sum();
    println!(
        "  Scanned {}: {} images, {} videos, {}",
        display_name(&folder),
        media.len() - videos,
        videos,
        format_size(size)
    );
    Ok(())
}
