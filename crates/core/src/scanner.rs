use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use walkdir::WalkDir;

use crate::domain::{MediaDescriptor, MediaKind};
use crate::error::{Error, Result};
use crate::metadata;

/// A media file found on disk, not yet hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    pub kind: MediaKind,
}

/// Walk `root` and collect every media file by extension.
/// Hidden entries (dot-prefixed) are skipped, which also hides in-progress
/// temporary files. Walk errors below the root are logged and skipped.
pub fn discover(root: &Path, follow_links: bool) -> Result<Vec<DiscoveredFile>> {
    check_root(root)?;

    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(follow_links)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()));

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(kind) = MediaKind::from_path(entry.path()) {
            files.push(DiscoveredFile {
                path: entry.into_path(),
                kind,
            });
        }
    }

    Ok(files)
}

/// Recursively scan `root` and describe every media file, in parallel.
/// The order of the result is unspecified.
pub fn scan(root: &Path) -> Result<Vec<MediaDescriptor>> {
    scan_incremental(root, &HashMap::new())
}

/// Like [`scan`], but reuses descriptors from `previous` whose size and
/// modification time are unchanged instead of re-hashing the file.
pub fn scan_incremental(
    root: &Path,
    previous: &HashMap<PathBuf, MediaDescriptor>,
) -> Result<Vec<MediaDescriptor>> {
    let files = discover(root, true)?;
    Ok(describe_all(&files, previous))
}

/// Describe `files` in parallel; files that cannot be read are logged and left out.
pub fn describe_all(
    files: &[DiscoveredFile],
    previous: &HashMap<PathBuf, MediaDescriptor>,
) -> Vec<MediaDescriptor> {
    files
        .par_iter()
        .filter_map(|file| {
            if let Some(known) = previous.get(&file.path) {
                if let Ok(meta) = std::fs::metadata(&file.path) {
                    if meta.len() == known.size
                        && metadata::modified_secs(&meta) == known.modified_at
                    {
                        return Some(known.clone());
                    }
                }
            }

            match metadata::describe(&file.path, file.kind) {
                Ok(d) => Some(d),
                Err(e) => {
                    tracing::warn!(path = %file.path.display(), error = %e, "skipping file");
                    None
                }
            }
        })
        .collect()
}

fn check_root(root: &Path) -> Result<()> {
    if !root.exists() {
        return Err(Error::FolderNotFound(root.to_path_buf()));
    }
    if !root.is_dir() {
        return Err(Error::NotADirectory(root.to_path_buf()));
    }
    Ok(())
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().map(|s| s.starts_with('.')).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(path: &Path, bytes: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_discover_filters_by_extension() {
        let tmp = tempfile::tempdir().unwrap();
        write(&tmp.path().join("a.jpg"), b"a");
        write(&tmp.path().join("b.MOV"), b"b");
        write(&tmp.path().join("notes.txt"), b"c");
        write(&tmp.path().join("deep/nested/c.png"), b"d");

        let mut found = discover(tmp.path(), true).unwrap();
        found.sort_by(|a, b| a.path.cmp(&b.path));

        let names: Vec<_> = found
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.jpg", "b.MOV", "c.png"]);
        assert_eq!(found[1].kind, MediaKind::Video);
    }

    #[test]
    fn test_discover_skips_hidden_entries() {
        let tmp = tempfile::tempdir().unwrap();
        write(&tmp.path().join(".tmpAbc.jpg"), b"partial");
        write(&tmp.path().join(".thumbs/x.jpg"), b"x");
        write(&tmp.path().join("visible.jpg"), b"v");

        let found = discover(tmp.path(), true).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].path.ends_with("visible.jpg"));
    }

    #[test]
    fn test_scan_missing_root() {
        let err = scan(Path::new("/nonexistent/photos")).unwrap_err();
        assert!(matches!(err, Error::FolderNotFound(_)));
    }

    #[test]
    fn test_scan_file_root() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("a.jpg");
        write(&file, b"a");
        let err = scan(&file).unwrap_err();
        assert!(matches!(err, Error::NotADirectory(_)));
    }

    #[test]
    fn test_scan_duplicate_content_shares_fingerprint() {
        let tmp = tempfile::tempdir().unwrap();
        write(&tmp.path().join("one.jpg"), b"same");
        write(&tmp.path().join("two.jpg"), b"same");
        write(&tmp.path().join("three.jpg"), b"other");

        let descriptors = scan(tmp.path()).unwrap();
        assert_eq!(descriptors.len(), 3);
        let unique: std::collections::HashSet<_> =
            descriptors.iter().map(|d| d.fingerprint.clone()).collect();
        assert_eq!(unique.len(), 2);
    }

    #[test]
    fn test_incremental_reuses_unchanged_descriptor() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.jpg");
        write(&path, b"content");

        let first = scan(tmp.path()).unwrap();
        let mut previous: HashMap<PathBuf, MediaDescriptor> =
            first.into_iter().map(|d| (d.path.clone(), d)).collect();
        // A stale fingerprint proves the file was not re-hashed.
        previous.get_mut(&path).unwrap().fingerprint = "cached".to_string();

        let second = scan_incremental(tmp.path(), &previous).unwrap();
        assert_eq!(second[0].fingerprint, "cached");
    }

    #[test]
    fn test_incremental_rehashes_changed_size() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.jpg");
        write(&path, b"content");

        let first = scan(tmp.path()).unwrap();
        let mut previous: HashMap<PathBuf, MediaDescriptor> =
            first.into_iter().map(|d| (d.path.clone(), d)).collect();
        previous.get_mut(&path).unwrap().fingerprint = "stale".to_string();

        write(&path, b"longer content");
        let second = scan_incremental(tmp.path(), &previous).unwrap();
        assert_ne!(second[0].fingerprint, "stale");
        assert_eq!(second[0].size, 14);
    }
}
