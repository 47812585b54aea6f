pub mod cache;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod drives;
pub mod encode;
pub mod error;
pub mod events;
pub mod hasher;
pub mod import;
pub mod metadata;
pub mod scanner;
pub mod tasks;
pub mod watcher;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;

use cache::CacheStore;
use catalog::Catalog;
use config::Config;
use domain::*;
use drives::DriveMonitor;
use encode::{DefaultEncoder, Encoder};
use error::{Error, Result};
use events::{EventBus, LibraryEvent};
use tasks::{Job, Optimizer, TaskEngine};
use watcher::{FolderReconciler, FolderWatcher};

/// The command surface of the media library.
///
/// Owns the catalog, the artifact cache, the optimization engine and the
/// folder watcher. Commands that touch disk or wait on encoding are async
/// and run their work on blocking threads; the rest only read in-memory or
/// catalog state. Must be opened from inside a tokio runtime.
pub struct Library {
    config: Config,
    catalog: Arc<Catalog>,
    store: Arc<CacheStore>,
    optimizer: Arc<Optimizer>,
    engine: Arc<TaskEngine>,
    watcher: FolderWatcher,
    events: EventBus,
    drive_monitor: Mutex<Option<DriveMonitor>>,
}

impl Library {
    /// Open the library described by `config` with the default encoder.
    pub fn open(config: Config) -> Result<Self> {
        Self::open_with(config, Arc::new(DefaultEncoder::new()))
    }

    /// Open with a custom encoder.
    pub fn open_with(config: Config, encoder: Arc<dyn Encoder>) -> Result<Self> {
        std::fs::create_dir_all(&config.cache_root)?;
        let catalog = Arc::new(Catalog::open(&config.catalog_path())?);
        let store = Arc::new(CacheStore::open(
            &config.cache_root,
            catalog.clone(),
            config.max_cache_bytes,
        )?);
        let optimizer = Arc::new(Optimizer::new(
            catalog.clone(),
            store.clone(),
            encoder,
            config.max_resolution,
            config.thumbnail_size,
            config.quality,
        ));
        let events = EventBus::default();
        let engine = TaskEngine::new(
            optimizer.clone(),
            catalog.clone(),
            events.clone(),
            config.workers,
        )?;
        let reconciler = Arc::new(FolderReconciler::new(
            catalog.clone(),
            engine.clone(),
            events.clone(),
        ));
        let watcher = FolderWatcher::start(reconciler, Duration::from_millis(config.debounce_ms))?;

        tracing::info!(cache_root = %config.cache_root.display(), "library opened");
        Ok(Self {
            config,
            catalog,
            store,
            optimizer,
            engine,
            watcher,
            events,
            drive_monitor: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Receive [`LibraryEvent`]s from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<LibraryEvent> {
        self.events.subscribe()
    }

    // ── Folders ──────────────────────────────────────────────────────

    pub fn register_library_folder(&self, path: &Path) -> Result<LibraryFolder> {
        if !path.exists() {
            return Err(Error::FolderNotFound(path.to_path_buf()));
        }
        if !path.is_dir() {
            return Err(Error::NotADirectory(path.to_path_buf()));
        }
        let folder = self.catalog.add_folder(path)?;
        tracing::info!(folder = %folder.path.display(), "folder registered");
        Ok(folder)
    }

    /// Stop watching the folder, drop its task, delete the artifacts only it
    /// references and forget it.
    pub async fn unregister_library_folder(&self, path: &Path) -> Result<LibraryFolder> {
        let folder = folder_key(path);
        // Unwatch first: a pass still in flight then drops its result instead
        // of recreating the task forgotten below.
        self.watcher.unwatch(&folder);
        self.engine.forget(&folder)?;
        let store = self.store.clone();
        let removed = blocking(move || store.unregister(&folder)).await?;
        tracing::info!(folder = %removed.path.display(), "folder unregistered");
        Ok(removed)
    }

    pub fn get_library_folders(&self) -> Result<Vec<LibraryFolder>> {
        self.catalog.list_folders()
    }

    // ── Scanning & artifacts ─────────────────────────────────────────

    /// Describe every media file under `path`. For a registered folder the
    /// catalog's rows are replaced with the result and unchanged files are
    /// not re-hashed.
    pub async fn scan_folder(&self, path: &Path) -> Result<Vec<MediaDescriptor>> {
        let catalog = self.catalog.clone();
        let root = path.to_path_buf();
        blocking(move || scan_and_record(&catalog, &root)).await
    }

    /// Thumbnail for `source`, generated on first request.
    pub async fn generate_thumbnail(&self, source: &Path, fingerprint: &str) -> Result<PathBuf> {
        let optimizer = self.optimizer.clone();
        let source = source.to_path_buf();
        let fingerprint = fingerprint.to_string();
        blocking(move || {
            let media = media_kind(&source)?;
            let original_size = std::fs::metadata(&source)?.len();
            optimizer.artifact(
                &source,
                &fingerprint,
                media,
                ArtifactKind::Thumbnail,
                original_size,
            )
        })
        .await
    }

    /// Optimized artifact for one file, queued on the worker pool. Counts
    /// toward the folder's task when one is running or paused. A cached
    /// artifact is returned without encoding again.
    pub async fn optimize_media_file(
        &self,
        folder: &Path,
        source: &Path,
        fingerprint: &str,
        kind: MediaKind,
    ) -> Result<PathBuf> {
        let catalog = self.catalog.clone();
        let folder = folder.to_path_buf();
        let source = source.to_path_buf();
        let fingerprint = fingerprint.to_string();
        let job = blocking(move || {
            let folder = folder_key(&folder);
            Ok(Job {
                require_registered: catalog.get_folder(&folder)?.is_some(),
                folder,
                original_size: std::fs::metadata(&source)?.len(),
                source,
                fingerprint,
                kind,
            })
        })
        .await?;
        let source = job.source.clone();
        let reply = self.engine.submit(job)?;
        reply
            .await
            .map_err(|_| Error::JobCancelled(source))?
    }

    // ── Optimization tasks ───────────────────────────────────────────

    pub fn create_optimization_task(&self, folder: &Path, total: usize) -> Result<OptimizationTask> {
        self.engine.create(&folder_key(folder), total)
    }

    pub fn reset_optimization_task(&self, folder: &Path, total: usize) -> Result<OptimizationTask> {
        self.engine.reset(&folder_key(folder), total)
    }

    pub fn pause_task(&self, folder: &Path) -> Result<OptimizationTask> {
        self.engine.pause(&folder_key(folder))
    }

    pub fn resume_task(&self, folder: &Path) -> Result<OptimizationTask> {
        self.engine.resume(&folder_key(folder))
    }

    pub fn stop_task(&self, folder: &Path) -> Result<OptimizationTask> {
        self.engine.stop(&folder_key(folder))
    }

    pub fn remove_optimization_task(&self, folder: &Path) -> Result<()> {
        self.engine.remove(&folder_key(folder))
    }

    pub fn get_all_tasks(&self) -> Vec<OptimizationTask> {
        self.engine.tasks()
    }

    pub fn get_task(&self, folder: &Path) -> Option<OptimizationTask> {
        self.engine.task(&folder_key(folder))
    }

    /// True while the folder's task is running or paused.
    pub fn check_folder_has_running_task(&self, folder: &Path) -> bool {
        self.engine.is_active(&folder_key(folder))
    }

    /// Scan the folder and start a task with one job per media file,
    /// replacing any task the folder had.
    pub async fn optimize_folder(&self, folder: &Path) -> Result<OptimizationTask> {
        let folder = folder_key(folder);
        let media = self.scan_folder(&folder).await?;
        let jobs = self.jobs_for(&folder, media)?;
        self.engine.start(&folder, jobs, false)
    }

    /// Restart the task over the files that still have no optimized artifact.
    pub async fn retry_failed(&self, folder: &Path) -> Result<OptimizationTask> {
        let folder = folder_key(folder);
        let media = self.scan_folder(&folder).await?;
        let store = self.store.clone();
        let pending = blocking(move || {
            let mut pending = Vec::new();
            for d in media {
                if !store.has(&d.fingerprint, ArtifactKind::Optimized)? {
                    pending.push(d);
                }
            }
            Ok(pending)
        })
        .await?;
        tracing::info!(folder = %folder.display(), pending = pending.len(), "retrying");
        let jobs = self.jobs_for(&folder, pending)?;
        self.engine.start(&folder, jobs, true)
    }

    /// Throw away the folder's artifacts and optimize everything again.
    pub async fn regenerate_folder(&self, folder: &Path) -> Result<OptimizationTask> {
        let folder = folder_key(folder);
        if let Some(task) = self.engine.task(&folder).filter(|t| t.is_active()) {
            return Err(Error::InvalidTransition {
                folder,
                status: task.status,
                action: "regenerate",
            });
        }
        self.clear_folder_cache(&folder).await?;
        let media = self.scan_folder(&folder).await?;
        let jobs = self.jobs_for(&folder, media)?;
        self.engine.start(&folder, jobs, true)
    }

    fn jobs_for(&self, folder: &Path, media: Vec<MediaDescriptor>) -> Result<Vec<Job>> {
        let registered = self.catalog.get_folder(folder)?.is_some();
        Ok(media
            .into_iter()
            .map(|d| Job {
                folder: folder.to_path_buf(),
                source: d.path,
                fingerprint: d.fingerprint,
                kind: d.kind,
                original_size: d.size,
                require_registered: registered,
            })
            .collect())
    }

    // ── Cache ────────────────────────────────────────────────────────

    pub fn get_database_cache_stats(&self) -> Result<CacheStats> {
        self.store.stats()
    }

    /// Forget vanished files and delete artifacts nothing references.
    pub async fn cleanup_orphaned_cache(&self) -> Result<usize> {
        let store = self.store.clone();
        blocking(move || store.cleanup_orphaned()).await
    }

    /// Delete the artifacts only this folder references. The folder stays registered.
    pub async fn clear_folder_cache(&self, folder: &Path) -> Result<()> {
        let row = self
            .catalog
            .get_folder(folder)?
            .ok_or_else(|| Error::FolderNotRegistered(folder.to_path_buf()))?;
        let store = self.store.clone();
        blocking(move || store.clear_folder(&row)).await?;
        Ok(())
    }

    /// Optimized artifact for `fingerprint`, if cached.
    pub fn get_cached_file_path(&self, fingerprint: &str) -> Result<Option<PathBuf>> {
        self.store.get(fingerprint, ArtifactKind::Optimized)
    }

    pub fn artifact_path(&self, fingerprint: &str, kind: ArtifactKind) -> Result<PathBuf> {
        self.store
            .get(fingerprint, kind)?
            .ok_or_else(|| Error::ArtifactNotFound {
                fingerprint: fingerprint.to_string(),
                kind,
            })
    }

    // ── Watching ─────────────────────────────────────────────────────

    /// Watch each folder for changes. Every folder is attempted; the first
    /// failure is returned.
    pub fn start_watching_folders(&self, folders: &[PathBuf]) -> Result<()> {
        let mut first_error = None;
        for folder in folders {
            if let Err(e) = self.watcher.watch(folder) {
                tracing::warn!(folder = %folder.display(), error = %e, "cannot watch folder");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn stop_watching_folder(&self, folder: &Path) -> bool {
        self.watcher.unwatch(folder)
    }

    pub fn get_watched_folders(&self) -> Vec<PathBuf> {
        self.watcher.watched()
    }

    // ── Import ───────────────────────────────────────────────────────

    pub async fn scan_import_source(&self, source: &Path) -> Result<Vec<ImportCandidate>> {
        let store = self.store.clone();
        let catalog = self.catalog.clone();
        let source = source.to_path_buf();
        blocking(move || import::scan_source(&source, &store, &catalog)).await
    }

    pub async fn import_files(&self, paths: &[PathBuf], destination: &Path) -> Result<Vec<PathBuf>> {
        let paths = paths.to_vec();
        let destination = destination.to_path_buf();
        blocking(move || import::import(&paths, &destination, None)).await
    }

    // ── Removable media ──────────────────────────────────────────────

    /// Start polling for camera media. Calling it again is a no-op.
    pub fn start_drive_monitor(&self) -> Result<()> {
        let mut slot = self.drive_monitor.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(DriveMonitor::spawn(
                self.config.removable_roots.clone(),
                Duration::from_millis(self.config.drive_poll_ms),
                self.events.clone(),
            )?);
        }
        Ok(())
    }

    pub fn detect_removable_drives(&self) -> Vec<PathBuf> {
        drives::detect_removable_media(&self.config.removable_roots)
    }

    // ── Persistence ──────────────────────────────────────────────────

    /// Every catalogued media file, for a cold start without rescanning.
    pub fn load_media_files_from_db(&self) -> Result<Vec<MediaDescriptor>> {
        self.catalog.list_media()
    }
}

/// Task and watcher key for a folder.
fn folder_key(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

fn media_kind(path: &Path) -> Result<MediaKind> {
    MediaKind::from_path(path).ok_or_else(|| Error::Encode {
        path: path.to_path_buf(),
        message: "not a supported media file".to_string(),
    })
}

fn scan_and_record(catalog: &Catalog, root: &Path) -> Result<Vec<MediaDescriptor>> {
    let Some(folder) = catalog.get_folder(root)? else {
        return scanner::scan(root);
    };
    let previous: HashMap<PathBuf, MediaDescriptor> = catalog
        .list_folder_media(folder.id)?
        .into_iter()
        .map(|d| (d.path.clone(), d))
        .collect();
    let media = scanner::scan_incremental(&folder.path, &previous)?;
    catalog.replace_folder_media(folder.id, &media)?;
    catalog.update_folder_scanned(folder.id, chrono::Utc::now().timestamp())?;
    tracing::info!(folder = %folder.path.display(), files = media.len(), "folder scanned");
    Ok(media)
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}
