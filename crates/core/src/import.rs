use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDate};
use rayon::prelude::*;

use crate::cache::CacheStore;
use crate::catalog::Catalog;
use crate::domain::{ImportCandidate, MediaKind};
use crate::error::Result;
use crate::metadata;
use crate::scanner;

/// Progress callback events for an import.
pub enum ImportProgress {
    /// Targets planned, copying starts.
    Start { total: usize },
    /// A file landed at its target.
    Copied { source: PathBuf, target: PathBuf },
    /// A file could not be copied; the rest continue.
    Failed { source: PathBuf, message: String },
}

/// Fingerprint every media file under `source` and flag the ones the library
/// already has: cached under any artifact kind, or present on disk in a
/// registered folder. Symlinks are not followed.
pub fn scan_source(source: &Path, store: &CacheStore, catalog: &Catalog) -> Result<Vec<ImportCandidate>> {
    let files = scanner::discover(source, false)?;
    let descriptors = scanner::describe_all(&files, &HashMap::new());

    let mut candidates = Vec::with_capacity(descriptors.len());
    for d in descriptors {
        let is_duplicate = store.has_any(&d.fingerprint)?
            || catalog
                .media_paths_for_fingerprint(&d.fingerprint)?
                .iter()
                .any(|p| p.exists());
        candidates.push(ImportCandidate {
            file_name: d
                .path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            path: d.path,
            size: d.size,
            fingerprint: d.fingerprint,
            kind: d.kind,
            captured_at: d.captured_at,
            modified_at: d.modified_at,
            is_duplicate,
            selected: !is_duplicate,
        });
    }
    candidates.sort_by(|a, b| a.path.cmp(&b.path));

    let duplicates = candidates.iter().filter(|c| c.is_duplicate).count();
    tracing::info!(
        source = %source.display(),
        files = candidates.len(),
        duplicates,
        "import source scanned"
    );
    Ok(candidates)
}

/// Copy `sources` into `destination` laid out as `YYYY/YYYY-MM-DD/<name>`,
/// dated by capture time or else modification time. Name clashes become
/// `stem_1.ext`, `stem_2.ext`, ... decided before any copy starts so the
/// result does not depend on copy order. Returns the targets written;
/// files that fail are reported and skipped.
pub fn import(
    sources: &[PathBuf],
    destination: &Path,
    progress_cb: Option<&(dyn Fn(ImportProgress) + Sync)>,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(destination)?;
    let plan = plan_targets(sources, destination);

    if let Some(cb) = progress_cb {
        cb(ImportProgress::Start { total: plan.len() });
    }

    let copied: Vec<PathBuf> = plan
        .par_iter()
        .filter_map(|(source, target)| match copy_file(source, target) {
            Ok(()) => {
                if let Some(cb) = progress_cb {
                    cb(ImportProgress::Copied {
                        source: source.clone(),
                        target: target.clone(),
                    });
                }
                Some(target.clone())
            }
            Err(e) => {
                tracing::warn!(source = %source.display(), error = %e, "import copy failed");
                if let Some(cb) = progress_cb {
                    cb(ImportProgress::Failed {
                        source: source.clone(),
                        message: e.to_string(),
                    });
                }
                None
            }
        })
        .collect();

    tracing::info!(
        destination = %destination.display(),
        copied = copied.len(),
        requested = sources.len(),
        "import finished"
    );
    Ok(copied)
}

/// Pair each readable source with a unique target path.
fn plan_targets(sources: &[PathBuf], destination: &Path) -> Vec<(PathBuf, PathBuf)> {
    let mut reserved = HashSet::new();
    let mut plan = Vec::with_capacity(sources.len());

    for source in sources {
        let meta = match fs::metadata(source) {
            Ok(m) if m.is_file() => m,
            Ok(_) => {
                tracing::warn!(source = %source.display(), "not a file; skipping");
                continue;
            }
            Err(e) => {
                tracing::warn!(source = %source.display(), error = %e, "unreadable; skipping");
                continue;
            }
        };
        let date = date_for(source, &meta);
        let target = build_target_path(destination, date, source, &mut reserved);
        plan.push((source.clone(), target));
    }
    plan
}

/// Capture date for images that carry one, local modification date otherwise.
fn date_for(path: &Path, meta: &fs::Metadata) -> NaiveDate {
    if MediaKind::from_path(path) == Some(MediaKind::Image) {
        if let Some(captured) = metadata::capture_time(path) {
            return captured.date();
        }
    }
    local_date(metadata::modified_secs(meta))
}

fn local_date(secs: i64) -> NaiveDate {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.with_timezone(&chrono::Local).date_naive())
        .unwrap_or_default()
}

/// `destination/YYYY/YYYY-MM-DD/name`, suffixed `_1`, `_2`, ... past any
/// existing or already reserved path.
fn build_target_path(
    destination: &Path,
    date: NaiveDate,
    original_path: &Path,
    reserved: &mut HashSet<PathBuf>,
) -> PathBuf {
    let dir = destination
        .join(format!("{:04}", date.year()))
        .join(date.format("%Y-%m-%d").to_string());

    let file_stem = original_path
        .file_stem()
        .unwrap_or_default()
        .to_string_lossy();
    let ext = original_path
        .extension()
        .unwrap_or_default()
        .to_string_lossy();

    let named = |suffix: Option<u32>| {
        let stem = match suffix {
            Some(n) => format!("{file_stem}_{n}"),
            None => file_stem.to_string(),
        };
        if ext.is_empty() {
            dir.join(stem)
        } else {
            dir.join(format!("{stem}.{ext}"))
        }
    };

    let mut target = named(None);
    let mut counter = 1u32;
    while target.exists() || reserved.contains(&target) {
        target = named(Some(counter));
        counter += 1;
    }
    reserved.insert(target.clone());
    target
}

/// Copy through a temporary sibling; never replaces an existing file.
fn copy_file(source: &Path, target: &Path) -> Result<()> {
    let parent = target.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    std::io::copy(&mut fs::File::open(source)?, &mut tmp)?;
    tmp.persist_noclobber(target).map_err(|e| e.error)?;
    Ok(())
}
