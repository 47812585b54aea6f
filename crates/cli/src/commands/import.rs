use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use indicatif::ProgressBar;
use photocache_core::domain::ImportCandidate;
use photocache_core::Library;

use super::{display_name, format_size, spinner_style};

async fn scan_with_spinner(lib: &Library, source: &Path) -> Result<Vec<ImportCandidate>> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(spinner_style());
    pb.set_prefix("Fingerprinting");
    pb.set_message(display_name(source));
    pb.enable_steady_tick(Duration::from_millis(80));
    let candidates = lib.scan_import_source(source).await?;
    pb.finish_and_clear();
    Ok(candidates)
}

/// Paths to copy: the new files, plus duplicates when asked.
pub(crate) fn to_copy(candidates: &[ImportCandidate], include_duplicates: bool) -> Vec<PathBuf> {
    candidates
        .iter()
        .filter(|c| c.selected || include_duplicates)
        .map(|c| c.path.clone())
        .collect()
}

pub async fn scan(lib: &Library, source: PathBuf) -> Result<()> {
    let candidates = scan_with_spinner(lib, &source).await?;
    if candidates.is_empty() {
        println!("No media files in {}", source.display());
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Name"),
        Cell::new("Kind"),
        Cell::new("Size"),
        Cell::new("Captured"),
        Cell::new("Status"),
    ]);

    for c in &candidates {
        let captured = c
            .captured_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        let status = if c.is_duplicate {
            Cell::new("duplicate").fg(Color::Yellow)
        } else {
            Cell::new("new").fg(Color::Green)
        };
        table.add_row(vec![
            Cell::new(&c.file_name),
            Cell::new(c.kind.as_str()),
            Cell::new(format_size(c.size)),
            Cell::new(captured),
            status,
        ]);
    }

    let duplicates = candidates.iter().filter(|c| c.is_duplicate).count();
    println!("{table}");
    println!(
        "  {} files, {} new, {} already in the library",
        candidates.len(),
        candidates.len() - duplicates,
        duplicates
    );
    Ok(())
}

pub async fn copy(
    lib: &Library,
    source: PathBuf,
    dest: PathBuf,
    include_duplicates: bool,
) -> Result<()> {
    let candidates = scan_with_spinner(lib, &source).await?;
    let paths = to_copy(&candidates, include_duplicates);
    if paths.is_empty() {
        println!("Nothing new to import from {}", source.display());
        return Ok(());
    }

    let pb = ProgressBar::new_spinner();
    pb.set_style(spinner_style());
    pb.set_prefix("Copying");
    pb.set_message(format!("{} files", paths.len()));
    pb.enable_steady_tick(Duration::from_millis(80));
    let copied = lib.import_files(&paths, &dest).await?;
    pb.finish_and_clear();

    println!("Imported {} of {} files into {}", copied.len(), paths.len(), dest.display());
    if copied.len() < paths.len() {
        println!("  {} files failed; see the log for details", paths.len() - copied.len());
    }
    Ok(())
}
