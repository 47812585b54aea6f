use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::catalog::Catalog;
use crate::domain::{ArtifactKind, CacheEntry, CacheStats, LibraryFolder};
use crate::encode::EncodedArtifact;
use crate::error::{Error, Result};

type Key = (String, ArtifactKind);

/// Content-addressed artifact cache.
///
/// Artifacts live at `<root>/<kind dir>/<fingerprint>.<ext>`; their metadata
/// lives in the catalog's `cache_entries` table. Writes to the same
/// (fingerprint, kind) are serialized so duplicate work collapses into one
/// write, and every row write plus the size-budget eviction that follows it
/// happens inside one store-wide critical section.
pub struct CacheStore {
    root: PathBuf,
    catalog: Arc<Catalog>,
    max_bytes: u64,
    seq: AtomicI64,
    write_lock: Mutex<()>,
    key_locks: Mutex<HashMap<Key, Arc<Mutex<()>>>>,
}

impl CacheStore {
    pub fn open(root: &Path, catalog: Arc<Catalog>, max_bytes: u64) -> Result<Self> {
        for kind in [ArtifactKind::Thumbnail, ArtifactKind::Optimized] {
            std::fs::create_dir_all(root.join(kind.dir_name()))?;
        }
        let seq = catalog.max_access_seq()?;
        Ok(Self {
            root: root.to_path_buf(),
            catalog,
            max_bytes,
            seq: AtomicI64::new(seq),
            write_lock: Mutex::new(()),
            key_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_path(&self, fingerprint: &str, kind: ArtifactKind, extension: &str) -> PathBuf {
        self.root
            .join(kind.dir_name())
            .join(format!("{fingerprint}.{extension}"))
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Store `artifact` under (fingerprint, kind). If a valid artifact is
    /// already cached this is a no-op returning the existing entry.
    pub fn put(
        &self,
        fingerprint: &str,
        kind: ArtifactKind,
        artifact: EncodedArtifact,
        original_size: u64,
    ) -> Result<CacheEntry> {
        self.with_key(fingerprint, kind, || {
            if let Some(existing) = self.valid_entry(fingerprint, kind)? {
                return Ok(existing);
            }
            self.write(fingerprint, kind, artifact, original_size)
        })
    }

    /// Return the cached entry, or run `produce` and store its output.
    /// Concurrent callers for the same key run `produce` at most once.
    /// The flag is true when this call created the entry.
    pub fn get_or_create<F>(
        &self,
        fingerprint: &str,
        kind: ArtifactKind,
        original_size: u64,
        produce: F,
    ) -> Result<(CacheEntry, bool)>
    where
        F: FnOnce() -> Result<EncodedArtifact>,
    {
        self.with_key(fingerprint, kind, || {
            if let Some(existing) = self.valid_entry(fingerprint, kind)? {
                self.catalog.touch_entry(fingerprint, kind, self.next_seq())?;
                return Ok((existing, false));
            }
            let artifact = produce()?;
            let entry = self.write(fingerprint, kind, artifact, original_size)?;
            Ok((entry, true))
        })
    }

    fn write(
        &self,
        fingerprint: &str,
        kind: ArtifactKind,
        artifact: EncodedArtifact,
        original_size: u64,
    ) -> Result<CacheEntry> {
        let path = self.artifact_path(fingerprint, kind, artifact.extension);
        let dir = self.root.join(kind.dir_name());
        std::fs::create_dir_all(&dir)?;

        // Temp sibling then rename, so readers never see a partial file.
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&artifact.bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;

        let entry = CacheEntry {
            fingerprint: fingerprint.to_string(),
            kind,
            artifact_path: path,
            original_size,
            cached_size: artifact.bytes.len() as u64,
            created_at: chrono::Utc::now().timestamp(),
        };

        let _guard = self.lock_writes();
        self.catalog.put_entry(&entry, self.next_seq())?;
        let evicted = self.evict_over_budget(fingerprint, kind)?;
        if evicted > 0 {
            tracing::info!(evicted, "cache over budget; evicted least recently used");
        }
        tracing::debug!(fingerprint, %kind, bytes = entry.cached_size, "cached artifact");
        Ok(entry)
    }

    /// Drop LRU entries until the budget holds. Caller holds the write lock.
    fn evict_over_budget(&self, keep_fingerprint: &str, keep_kind: ArtifactKind) -> Result<usize> {
        let (_, _, mut cached) = self.catalog.cache_totals()?;
        if cached <= self.max_bytes {
            return Ok(0);
        }

        let mut evicted = 0;
        for entry in self.catalog.entries_by_lru()? {
            if cached <= self.max_bytes {
                break;
            }
            if entry.fingerprint == keep_fingerprint && entry.kind == keep_kind {
                continue;
            }
            self.remove_entry(&entry)?;
            cached = cached.saturating_sub(entry.cached_size);
            evicted += 1;
        }
        Ok(evicted)
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Artifact path for a valid entry, marking it as recently used.
    /// An entry whose artifact vanished is dropped and reported absent.
    pub fn get(&self, fingerprint: &str, kind: ArtifactKind) -> Result<Option<PathBuf>> {
        let Some(entry) = self.catalog.get_entry(fingerprint, kind)? else {
            return Ok(None);
        };
        if !artifact_is_valid(&entry) {
            tracing::warn!(fingerprint, %kind, "artifact missing; dropping entry");
            let _guard = self.lock_writes();
            self.remove_entry(&entry)?;
            return Ok(None);
        }
        self.catalog.touch_entry(fingerprint, kind, self.next_seq())?;
        Ok(Some(entry.artifact_path))
    }

    /// Validity check that leaves the access order alone.
    pub fn has(&self, fingerprint: &str, kind: ArtifactKind) -> Result<bool> {
        Ok(self.valid_entry(fingerprint, kind)?.is_some())
    }

    /// Whether any artifact kind is cached for this fingerprint.
    pub fn has_any(&self, fingerprint: &str) -> Result<bool> {
        Ok(self
            .catalog
            .entries_for_fingerprint(fingerprint)?
            .iter()
            .any(artifact_is_valid))
    }

    fn valid_entry(&self, fingerprint: &str, kind: ArtifactKind) -> Result<Option<CacheEntry>> {
        Ok(self
            .catalog
            .get_entry(fingerprint, kind)?
            .filter(artifact_is_valid))
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let (entry_count, original_size, cached_size) = self.catalog.cache_totals()?;
        Ok(CacheStats {
            entry_count,
            original_size,
            cached_size,
            max_size: self.max_bytes,
        })
    }

    // ── Removal ──────────────────────────────────────────────────────

    /// Remove one entry and its artifact.
    pub fn evict(&self, fingerprint: &str, kind: ArtifactKind) -> Result<bool> {
        let _guard = self.lock_writes();
        match self.catalog.get_entry(fingerprint, kind)? {
            Some(entry) => {
                self.remove_entry(&entry)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Garbage-collect the cache:
    /// forget catalogued files that no longer exist, then drop entries no
    /// remaining file references and entries whose artifact is missing.
    /// Returns the number of entries removed.
    pub fn cleanup_orphaned(&self) -> Result<usize> {
        let gone: Vec<PathBuf> = self
            .catalog
            .list_media()?
            .into_iter()
            .map(|m| m.path)
            .filter(|p| !p.exists())
            .collect();
        if !gone.is_empty() {
            let forgotten = self.catalog.remove_media_batch(&gone)?;
            tracing::info!(forgotten, "forgot media files missing from disk");
        }

        let _guard = self.lock_writes();
        let mut removed = 0;
        for entry in self.catalog.unreferenced_entries()? {
            self.remove_entry(&entry)?;
            removed += 1;
        }
        for entry in self.catalog.entries_by_lru()? {
            if !artifact_is_valid(&entry) {
                self.remove_entry(&entry)?;
                removed += 1;
            }
        }
        tracing::info!(removed, "orphan cleanup finished");
        Ok(removed)
    }

    /// Remove every artifact that only `folder` references. Content shared
    /// with another registered folder stays cached.
    pub fn clear_folder(&self, folder: &LibraryFolder) -> Result<usize> {
        let _guard = self.lock_writes();
        let mut removed = 0;
        for fingerprint in self.catalog.exclusive_fingerprints(folder.id)? {
            for entry in self.catalog.entries_for_fingerprint(&fingerprint)? {
                self.remove_entry(&entry)?;
                removed += 1;
            }
        }
        tracing::info!(folder = %folder.path.display(), removed, "cleared folder cache");
        Ok(removed)
    }

    /// Clear the folder's artifacts, then forget the folder and its media rows.
    pub fn unregister(&self, folder: &Path) -> Result<LibraryFolder> {
        let row = self
            .catalog
            .get_folder(folder)?
            .ok_or_else(|| Error::FolderNotRegistered(folder.to_path_buf()))?;
        self.clear_folder(&row)?;
        self.catalog.remove_folder(&row.path)
    }

    fn remove_entry(&self, entry: &CacheEntry) -> Result<()> {
        self.catalog.remove_entry(&entry.fingerprint, entry.kind)?;
        match std::fs::remove_file(&entry.artifact_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %entry.artifact_path.display(),
                error = %e,
                "failed to delete artifact"
            ),
        }
        Ok(())
    }

    // ── Locking ──────────────────────────────────────────────────────

    fn next_seq(&self) -> i64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_key<T>(&self, fingerprint: &str, kind: ArtifactKind, f: impl FnOnce() -> T) -> T {
        let key = (fingerprint.to_string(), kind);
        let lock = {
            let mut locks = self.key_locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(key.clone()).or_default().clone()
        };

        let result = {
            let _held = lock.lock().unwrap_or_else(|e| e.into_inner());
            f()
        };

        let mut locks = self.key_locks.lock().unwrap_or_else(|e| e.into_inner());
        drop(lock);
        if locks.get(&key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&key);
        }
        result
    }
}

fn artifact_is_valid(entry: &CacheEntry) -> bool {
    std::fs::metadata(&entry.artifact_path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}
