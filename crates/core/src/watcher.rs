//! Debounced filesystem watching.
//!
//! Each watched folder has a small state machine ([`Debounce`]): changes move
//! it from idle to pending, a quiet period without further changes fires one
//! reconciliation pass, and changes arriving during a pass are held until it
//! finishes. Timer expiry is delivered as a message to the driver task, which
//! owns every folder's state.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use notify::event::{EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::catalog::Catalog;
use crate::domain::{MediaDescriptor, MediaKind};
use crate::error::{Error, Result};
use crate::events::{EventBus, LibraryEvent};
use crate::scanner;
use crate::tasks::{Job, TaskEngine};

// ── Debounce state machine ───────────────────────────────────────────

#[derive(Debug, Default, PartialEq, Eq)]
pub enum Debounce {
    #[default]
    Idle,
    Pending {
        deadline: Instant,
        changes: HashSet<PathBuf>,
    },
    Processing {
        queued: HashSet<PathBuf>,
    },
}

#[derive(Debug, PartialEq, Eq)]
pub enum DeadlineAction {
    /// Quiet period over: run a pass for these changes.
    Fire(HashSet<PathBuf>),
    /// More changes arrived; wait until the new deadline.
    Rearm(Instant),
    Ignore,
}

impl Debounce {
    /// Record a change. Returns a deadline when a timer must be started.
    pub fn on_change(&mut self, path: PathBuf, now: Instant, quiet: Duration) -> Option<Instant> {
        match self {
            Debounce::Idle => {
                let deadline = now + quiet;
                *self = Debounce::Pending {
                    deadline,
                    changes: HashSet::from([path]),
                };
                Some(deadline)
            }
            Debounce::Pending { deadline, changes } => {
                *deadline = now + quiet;
                changes.insert(path);
                None
            }
            Debounce::Processing { queued } => {
                queued.insert(path);
                None
            }
        }
    }

    pub fn on_deadline(&mut self, now: Instant) -> DeadlineAction {
        match self {
            Debounce::Pending { deadline, .. } if now < *deadline => {
                DeadlineAction::Rearm(*deadline)
            }
            Debounce::Pending { changes, .. } => {
                let changes = std::mem::take(changes);
                *self = Debounce::Processing {
                    queued: HashSet::new(),
                };
                DeadlineAction::Fire(changes)
            }
            _ => DeadlineAction::Ignore,
        }
    }

    /// A pass ended. Changes held during it open a new window.
    pub fn on_pass_finished(&mut self, now: Instant, quiet: Duration) -> Option<Instant> {
        match self {
            Debounce::Processing { queued } if !queued.is_empty() => {
                let deadline = now + quiet;
                *self = Debounce::Pending {
                    deadline,
                    changes: std::mem::take(queued),
                };
                Some(deadline)
            }
            Debounce::Processing { .. } => {
                *self = Debounce::Idle;
                None
            }
            _ => None,
        }
    }
}

// ── Reconciliation ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub added: usize,
    pub removed: usize,
    pub dispatched: usize,
}

/// One reconciliation pass over a folder. Called on a blocking thread,
/// never twice at once for the same folder.
pub trait Reconcile: Send + Sync {
    /// Build the baseline the first pass diffs against.
    fn prime(&self, folder: &Path) -> Result<()>;
    fn reconcile(&self, folder: &Path) -> Result<ReconcileOutcome>;
    fn forget(&self, folder: &Path);
}

type WatchState = HashMap<PathBuf, MediaDescriptor>;

/// Re-scans a folder, diffs it against the last known state, records the
/// difference in the catalog and queues optimization for new content.
/// Removed files keep their cache entries until orphan cleanup.
pub struct FolderReconciler {
    catalog: Arc<Catalog>,
    engine: Arc<TaskEngine>,
    events: EventBus,
    states: Mutex<HashMap<PathBuf, WatchState>>,
}

impl FolderReconciler {
    pub fn new(catalog: Arc<Catalog>, engine: Arc<TaskEngine>, events: EventBus) -> Self {
        Self {
            catalog,
            engine,
            events,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn states(&self) -> MutexGuard<'_, HashMap<PathBuf, WatchState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Reconcile for FolderReconciler {
    fn prime(&self, folder: &Path) -> Result<()> {
        let registered = self.catalog.get_folder(folder)?;
        let known: WatchState = match &registered {
            Some(row) => self
                .catalog
                .list_folder_media(row.id)?
                .into_iter()
                .map(|d| (d.path.clone(), d))
                .collect(),
            None => WatchState::new(),
        };

        // The baseline is what is on disk now: files present before the
        // watch started never count as added.
        let media = scanner::scan_incremental(folder, &known)?;
        if let Some(row) = &registered {
            self.catalog.replace_folder_media(row.id, &media)?;
            self.catalog
                .update_folder_scanned(row.id, chrono::Utc::now().timestamp())?;
        }

        let state = media.into_iter().map(|d| (d.path.clone(), d)).collect();
        self.states().insert(folder.to_path_buf(), state);
        Ok(())
    }

    fn reconcile(&self, folder: &Path) -> Result<ReconcileOutcome> {
        let previous = self.states().get(folder).cloned().unwrap_or_default();
        let current: WatchState = scanner::scan_incremental(folder, &previous)?
            .into_iter()
            .map(|d| (d.path.clone(), d))
            .collect();

        let added: Vec<&MediaDescriptor> = current
            .values()
            .filter(|d| {
                previous
                    .get(&d.path)
                    .map_or(true, |p| p.fingerprint != d.fingerprint)
            })
            .collect();
        let removed: Vec<PathBuf> = previous
            .keys()
            .filter(|p| !current.contains_key(*p))
            .cloned()
            .collect();

        // Held until the new state is stored, so an unwatch racing this pass
        // cannot be undone by it.
        let mut states = self.states();
        if !states.contains_key(folder) {
            tracing::debug!(folder = %folder.display(), "folder no longer watched; pass dropped");
            return Ok(ReconcileOutcome::default());
        }

        let known: HashSet<&str> = previous.values().map(|d| d.fingerprint.as_str()).collect();
        let registered = self.catalog.get_folder(folder)?;
        let mut seen = HashSet::new();
        let jobs: Vec<Job> = added
            .iter()
            .filter(|d| !known.contains(d.fingerprint.as_str()) && seen.insert(&d.fingerprint))
            .map(|d| Job {
                folder: folder.to_path_buf(),
                source: d.path.clone(),
                fingerprint: d.fingerprint.clone(),
                kind: d.kind,
                original_size: d.size,
                require_registered: registered.is_some(),
            })
            .collect();

        if let Some(row) = &registered {
            for d in &added {
                self.catalog.upsert_media(row.id, d)?;
            }
            self.catalog.remove_media_batch(&removed)?;
            self.catalog
                .update_folder_scanned(row.id, chrono::Utc::now().timestamp())?;
        }

        let outcome = ReconcileOutcome {
            added: added.len(),
            removed: removed.len(),
            dispatched: self.engine.extend(folder, jobs)?,
        };
        let added: Vec<PathBuf> = added.iter().map(|d| d.path.clone()).collect();
        states.insert(folder.to_path_buf(), current);
        drop(states);

        for path in added {
            self.events.emit(LibraryEvent::FileAdded { path });
        }
        for path in removed {
            self.events.emit(LibraryEvent::FileRemoved { path });
        }
        self.events.emit(LibraryEvent::Reconciled {
            folder: folder.to_path_buf(),
            added: outcome.added,
            removed: outcome.removed,
            dispatched: outcome.dispatched,
        });
        tracing::info!(
            folder = %folder.display(),
            added = outcome.added,
            removed = outcome.removed,
            dispatched = outcome.dispatched,
            "reconciled"
        );
        Ok(outcome)
    }

    fn forget(&self, folder: &Path) {
        self.states().remove(folder);
    }
}

// ── Driver ───────────────────────────────────────────────────────────

enum WatchMessage {
    Changed { folder: PathBuf, path: PathBuf },
    DeadlineElapsed { folder: PathBuf },
    PassFinished { folder: PathBuf },
    Unwatched { folder: PathBuf },
    Shutdown,
}

/// Watches folders recursively and funnels their changes into debounced
/// reconciliation passes.
pub struct FolderWatcher {
    tx: mpsc::UnboundedSender<WatchMessage>,
    watchers: Mutex<HashMap<PathBuf, RecommendedWatcher>>,
    reconciler: Arc<dyn Reconcile>,
}

impl FolderWatcher {
    /// Spawn the driver task. Must be called from inside a tokio runtime.
    pub fn start(reconciler: Arc<dyn Reconcile>, quiet: Duration) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(drive(rx, tx.clone(), reconciler.clone(), quiet));
        Ok(Self {
            tx,
            watchers: Mutex::new(HashMap::new()),
            reconciler,
        })
    }

    fn watchers(&self) -> MutexGuard<'_, HashMap<PathBuf, RecommendedWatcher>> {
        self.watchers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start watching `folder`. Watching an already watched folder is a no-op.
    pub fn watch(&self, folder: &Path) -> Result<()> {
        if !folder.is_dir() {
            return Err(Error::NotADirectory(folder.to_path_buf()));
        }
        let folder = folder.canonicalize()?;
        if self.watchers().contains_key(&folder) {
            return Ok(());
        }

        self.reconciler.prime(&folder)?;

        let tx = self.tx.clone();
        let owner = folder.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    for path in media_changes(&event) {
                        let _ = tx.send(WatchMessage::Changed {
                            folder: owner.clone(),
                            path,
                        });
                    }
                }
                Err(e) => tracing::warn!(error = %e, "watch error"),
            }
        })?;
        watcher.watch(&folder, RecursiveMode::Recursive)?;

        tracing::info!(folder = %folder.display(), "watching");
        self.watchers().insert(folder, watcher);
        Ok(())
    }

    pub fn unwatch(&self, folder: &Path) -> bool {
        let folder = folder.canonicalize().unwrap_or_else(|_| folder.to_path_buf());
        let removed = self.watchers().remove(&folder).is_some();
        if removed {
            let _ = self.tx.send(WatchMessage::Unwatched {
                folder: folder.clone(),
            });
            self.reconciler.forget(&folder);
            tracing::info!(folder = %folder.display(), "stopped watching");
        }
        removed
    }

    pub fn watched(&self) -> Vec<PathBuf> {
        let mut folders: Vec<_> = self.watchers().keys().cloned().collect();
        folders.sort();
        folders
    }

    /// Feed a change for `folder` as if the filesystem had reported it.
    pub fn record_change(&self, folder: &Path, path: PathBuf) {
        let _ = self.tx.send(WatchMessage::Changed {
            folder: folder.to_path_buf(),
            path,
        });
    }
}

impl Drop for FolderWatcher {
    fn drop(&mut self) {
        let _ = self.tx.send(WatchMessage::Shutdown);
    }
}

/// Paths in a notify event that matter to the library.
///
/// Content edits only count for media files. Entries that appear, disappear
/// or are renamed count whatever they are, because a directory moved in or
/// out of a watched tree carries media the event itself never names.
fn media_changes(event: &notify::Event) -> Vec<PathBuf> {
    let structural = match event.kind {
        EventKind::Create(_) | EventKind::Remove(_) => true,
        EventKind::Modify(ModifyKind::Name(_)) => true,
        EventKind::Modify(ModifyKind::Metadata(_)) => return Vec::new(),
        EventKind::Modify(_) => false,
        _ => return Vec::new(),
    };
    event
        .paths
        .iter()
        .filter(|p| !is_hidden(p))
        .filter(|p| structural || MediaKind::from_path(p).is_some())
        .cloned()
        .collect()
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

async fn drive(
    mut rx: mpsc::UnboundedReceiver<WatchMessage>,
    tx: mpsc::UnboundedSender<WatchMessage>,
    reconciler: Arc<dyn Reconcile>,
    quiet: Duration,
) {
    let mut folders: HashMap<PathBuf, Debounce> = HashMap::new();

    while let Some(message) = rx.recv().await {
        match message {
            WatchMessage::Changed { folder, path } => {
                tracing::debug!(path = %path.display(), "change");
                let state = folders.entry(folder.clone()).or_default();
                if let Some(deadline) = state.on_change(path, Instant::now(), quiet) {
                    schedule(&tx, folder, deadline);
                }
            }
            WatchMessage::DeadlineElapsed { folder } => {
                let Some(state) = folders.get_mut(&folder) else {
                    continue;
                };
                match state.on_deadline(Instant::now()) {
                    DeadlineAction::Fire(changes) => {
                        tracing::debug!(folder = %folder.display(), changes = changes.len(), "debounce fired");
                        run_pass(&tx, reconciler.clone(), folder);
                    }
                    DeadlineAction::Rearm(deadline) => schedule(&tx, folder, deadline),
                    DeadlineAction::Ignore => {}
                }
            }
            WatchMessage::PassFinished { folder } => {
                if let Some(state) = folders.get_mut(&folder) {
                    if let Some(deadline) = state.on_pass_finished(Instant::now(), quiet) {
                        schedule(&tx, folder, deadline);
                    }
                }
            }
            WatchMessage::Unwatched { folder } => {
                folders.remove(&folder);
            }
            WatchMessage::Shutdown => break,
        }
    }
}

fn schedule(tx: &mpsc::UnboundedSender<WatchMessage>, folder: PathBuf, deadline: Instant) {
    let tx = tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep_until(deadline).await;
        let _ = tx.send(WatchMessage::DeadlineElapsed { folder });
    });
}

fn run_pass(tx: &mpsc::UnboundedSender<WatchMessage>, reconciler: Arc<dyn Reconcile>, folder: PathBuf) {
    let tx = tx.clone();
    tokio::spawn(async move {
        let target = folder.clone();
        match tokio::task::spawn_blocking(move || reconciler.reconcile(&target)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::warn!(folder = %folder.display(), error = %e, "reconciliation failed")
            }
            Err(e) => tracing::warn!(folder = %folder.display(), error = %e, "reconciliation panicked"),
        }
        let _ = tx.send(WatchMessage::PassFinished { folder });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const QUIET: Duration = Duration::from_millis(100);

    // ── State machine ────────────────────────────────────────────

    #[test]
    fn test_idle_change_starts_window() {
        let now = Instant::now();
        let mut state = Debounce::Idle;
        assert_eq!(state.on_change("a.jpg".into(), now, QUIET), Some(now + QUIET));
        assert!(matches!(state, Debounce::Pending { .. }));
    }

    #[test]
    fn test_changes_in_window_push_deadline_without_new_timer() {
        let t0 = Instant::now();
        let mut state = Debounce::Idle;
        state.on_change("a.jpg".into(), t0, QUIET);
        let t1 = t0 + Duration::from_millis(60);
        assert_eq!(state.on_change("b.jpg".into(), t1, QUIET), None);

        // The first timer fires early and re-arms for the pushed deadline.
        assert_eq!(state.on_deadline(t0 + QUIET), DeadlineAction::Rearm(t1 + QUIET));
        match state.on_deadline(t1 + QUIET) {
            DeadlineAction::Fire(changes) => assert_eq!(changes.len(), 2),
            other => panic!("expected fire, got {other:?}"),
        }
        assert_eq!(
            state,
            Debounce::Processing {
                queued: HashSet::new()
            }
        );
    }

    #[test]
    fn test_changes_during_pass_are_held_for_next_window() {
        let t0 = Instant::now();
        let mut state = Debounce::Idle;
        state.on_change("a.jpg".into(), t0, QUIET);
        state.on_deadline(t0 + QUIET);

        assert_eq!(state.on_change("b.jpg".into(), t0 + QUIET, QUIET), None);
        // A stray deadline during processing does nothing.
        assert_eq!(state.on_deadline(t0 + QUIET * 3), DeadlineAction::Ignore);

        let done = t0 + QUIET * 2;
        assert_eq!(state.on_pass_finished(done, QUIET), Some(done + QUIET));
        match state {
            Debounce::Pending { ref changes, .. } => {
                assert!(changes.contains(Path::new("b.jpg")))
            }
            ref other => panic!("expected pending, got {other:?}"),
        }
    }

    #[test]
    fn test_quiet_pass_returns_to_idle() {
        let t0 = Instant::now();
        let mut state = Debounce::Idle;
        state.on_change("a.jpg".into(), t0, QUIET);
        state.on_deadline(t0 + QUIET);
        assert_eq!(state.on_pass_finished(t0 + QUIET * 2, QUIET), None);
        assert_eq!(state, Debounce::Idle);
    }

    #[test]
    fn test_media_changes_filters_events() {
        use notify::event::{CreateKind, DataChange, RemoveKind};

        let create = notify::Event::new(EventKind::Create(CreateKind::File))
            .add_path("/p/a.jpg".into())
            .add_path("/p/.a.jpg.part".into());
        assert_eq!(media_changes(&create), vec![PathBuf::from("/p/a.jpg")]);

        let remove = notify::Event::new(EventKind::Remove(RemoveKind::File))
            .add_path("/p/b.mov".into());
        assert_eq!(media_changes(&remove), vec![PathBuf::from("/p/b.mov")]);

        let written = notify::Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path("/p/a.jpg".into())
            .add_path("/p/notes.txt".into());
        assert_eq!(media_changes(&written), vec![PathBuf::from("/p/a.jpg")]);
    }

    #[test]
    fn test_media_changes_keeps_directory_moves() {
        use notify::event::{CreateKind, MetadataKind, RemoveKind, RenameMode};

        let moved_in = notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To)))
            .add_path("/p/Trip 2024".into());
        assert_eq!(media_changes(&moved_in), vec![PathBuf::from("/p/Trip 2024")]);

        let renamed = notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path("/p/raw".into())
            .add_path("/p/2024.06".into());
        assert_eq!(media_changes(&renamed).len(), 2);

        let created = notify::Event::new(EventKind::Create(CreateKind::Folder))
            .add_path("/p/burst".into());
        assert_eq!(media_changes(&created), vec![PathBuf::from("/p/burst")]);

        let deleted = notify::Event::new(EventKind::Remove(RemoveKind::Folder))
            .add_path("/p/old".into());
        assert_eq!(media_changes(&deleted), vec![PathBuf::from("/p/old")]);

        let touch = notify::Event::new(EventKind::Modify(ModifyKind::Metadata(
            MetadataKind::AccessTime,
        )))
        .add_path("/p/a.jpg".into());
        assert!(media_changes(&touch).is_empty());

        let access = notify::Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path("/p/a.jpg".into());
        assert!(media_changes(&access).is_empty());
    }

    // ── Reconciler ───────────────────────────────────────────────

    struct EchoRunner;

    impl crate::tasks::JobRunner for EchoRunner {
        fn run(&self, job: &Job) -> Result<PathBuf> {
            Ok(job.source.clone())
        }
    }

    fn reconciler_with_photos(
        count: usize,
    ) -> (FolderReconciler, Arc<Catalog>, Arc<TaskEngine>, PathBuf, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let folder = tmp.path().join("photos");
        std::fs::create_dir_all(&folder).unwrap();
        for i in 0..count {
            std::fs::write(folder.join(format!("IMG_{i:04}.jpg")), format!("photo {i}")).unwrap();
        }
        let folder = folder.canonicalize().unwrap();

        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        catalog.add_folder(&folder).unwrap();
        let events = EventBus::new(64);
        let engine =
            TaskEngine::new(Arc::new(EchoRunner), catalog.clone(), events.clone(), 2).unwrap();
        let reconciler = FolderReconciler::new(catalog.clone(), engine.clone(), events);
        (reconciler, catalog, engine, folder, tmp)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_prime_takes_unscanned_files_as_baseline() {
        let (reconciler, catalog, engine, folder, _tmp) = reconciler_with_photos(10);

        reconciler.prime(&folder).unwrap();
        let row = catalog.get_folder(&folder).unwrap().unwrap();
        assert_eq!(catalog.list_folder_media(row.id).unwrap().len(), 10);
        assert!(row.last_scanned.is_some());

        std::fs::write(folder.join("IMG_0100.jpg"), b"new photo").unwrap();
        let outcome = reconciler.reconcile(&folder).unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome {
                added: 1,
                removed: 0,
                dispatched: 1
            }
        );
        assert_eq!(engine.task(&folder).unwrap().total_files, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pass_finishing_after_unwatch_is_dropped() {
        let (reconciler, catalog, engine, folder, _tmp) = reconciler_with_photos(2);
        reconciler.prime(&folder).unwrap();

        std::fs::write(folder.join("IMG_0100.jpg"), b"new photo").unwrap();
        reconciler.forget(&folder);
        let outcome = reconciler.reconcile(&folder).unwrap();

        assert_eq!(outcome, ReconcileOutcome::default());
        assert!(engine.task(&folder).is_none());
        assert!(!reconciler.states().contains_key(&folder));
        let row = catalog.get_folder(&folder).unwrap().unwrap();
        assert_eq!(catalog.list_folder_media(row.id).unwrap().len(), 2);
    }

    // ── Driver ───────────────────────────────────────────────────

    #[derive(Default)]
    struct CountingReconciler {
        passes: AtomicUsize,
        active: AtomicUsize,
        overlapped: AtomicUsize,
        delay: Duration,
    }

    impl Reconcile for CountingReconciler {
        fn prime(&self, _folder: &Path) -> Result<()> {
            Ok(())
        }

        fn reconcile(&self, _folder: &Path) -> Result<ReconcileOutcome> {
            if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(self.delay);
            self.passes.fetch_add(1, Ordering::SeqCst);
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(ReconcileOutcome::default())
        }

        fn forget(&self, _folder: &Path) {}
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_burst_coalesces_into_one_pass() {
        let reconciler = Arc::new(CountingReconciler::default());
        let watcher = FolderWatcher::start(reconciler.clone(), QUIET).unwrap();
        let folder = Path::new("/photos");

        for i in 0..50 {
            watcher.record_change(folder, folder.join(format!("{i}.jpg")));
        }
        tokio::time::sleep(QUIET * 4).await;
        assert_eq!(reconciler.passes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_steady_trickle_keeps_pushing_deadline() {
        let reconciler = Arc::new(CountingReconciler::default());
        let quiet = Duration::from_millis(150);
        let watcher = FolderWatcher::start(reconciler.clone(), quiet).unwrap();
        let folder = Path::new("/photos");

        for i in 0..8 {
            watcher.record_change(folder, folder.join(format!("{i}.jpg")));
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        assert_eq!(reconciler.passes.load(Ordering::SeqCst), 0);
        tokio::time::sleep(quiet * 3).await;
        assert_eq!(reconciler.passes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_changes_during_pass_never_overlap() {
        let reconciler = Arc::new(CountingReconciler {
            delay: Duration::from_millis(200),
            ..Default::default()
        });
        let watcher = FolderWatcher::start(reconciler.clone(), QUIET).unwrap();
        let folder = Path::new("/photos");

        watcher.record_change(folder, folder.join("a.jpg"));
        // Land inside the first pass.
        tokio::time::sleep(QUIET + Duration::from_millis(80)).await;
        watcher.record_change(folder, folder.join("b.jpg"));

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(reconciler.passes.load(Ordering::SeqCst), 2);
        assert_eq!(reconciler.overlapped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_folders_debounce_independently() {
        let reconciler = Arc::new(CountingReconciler::default());
        let watcher = FolderWatcher::start(reconciler.clone(), QUIET).unwrap();

        watcher.record_change(Path::new("/a"), PathBuf::from("/a/1.jpg"));
        watcher.record_change(Path::new("/b"), PathBuf::from("/b/1.jpg"));
        tokio::time::sleep(QUIET * 4).await;
        assert_eq!(reconciler.passes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_watch_rejects_missing_folder() {
        let watcher =
            FolderWatcher::start(Arc::new(CountingReconciler::default()), QUIET).unwrap();
        assert!(watcher.watch(Path::new("/nonexistent/photos")).is_err());
        assert!(watcher.watched().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_watch_and_unwatch() {
        let tmp = tempfile::tempdir().unwrap();
        let watcher =
            FolderWatcher::start(Arc::new(CountingReconciler::default()), QUIET).unwrap();

        watcher.watch(tmp.path()).unwrap();
        watcher.watch(tmp.path()).unwrap();
        assert_eq!(watcher.watched(), vec![tmp.path().canonicalize().unwrap()]);

        assert!(watcher.unwatch(tmp.path()));
        assert!(!watcher.unwatch(tmp.path()));
        assert!(watcher.watched().is_empty());
    }
}
