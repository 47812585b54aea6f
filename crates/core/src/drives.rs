use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::events::{EventBus, LibraryEvent};

/// Camera cards and phones expose their media under this directory.
const CAMERA_DIR: &str = "DCIM";

/// Volumes under `roots` that look like camera media: a root or a direct
/// child of a root that contains a `DCIM` directory.
pub fn detect_removable_media(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut found = BTreeSet::new();
    for root in roots {
        if has_camera_dir(root) {
            found.insert(root.clone());
            continue;
        }
        let Ok(entries) = std::fs::read_dir(root) else {
            continue;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_dir() && has_camera_dir(&path) {
                found.insert(path);
            }
        }
    }
    found.into_iter().collect()
}

fn has_camera_dir(path: &Path) -> bool {
    path.join(CAMERA_DIR).is_dir()
}

/// Volumes present now but not before, and volumes gone since.
fn diff(known: &BTreeSet<PathBuf>, current: &BTreeSet<PathBuf>) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let inserted = current.difference(known).cloned().collect();
    let removed = known.difference(current).cloned().collect();
    (inserted, removed)
}

/// Polls mount roots and reports camera media coming and going.
/// Volumes already mounted at start are not reported. Stops when dropped.
pub struct DriveMonitor {
    task: JoinHandle<()>,
}

impl DriveMonitor {
    pub fn spawn(roots: Vec<PathBuf>, interval: Duration, events: EventBus) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let task = runtime.spawn(async move {
            let mut known: BTreeSet<PathBuf> = detect_removable_media(&roots).into_iter().collect();
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let scan_roots = roots.clone();
                let current: BTreeSet<PathBuf> =
                    match tokio::task::spawn_blocking(move || detect_removable_media(&scan_roots))
                        .await
                    {
                        Ok(found) => found.into_iter().collect(),
                        Err(e) => {
                            tracing::warn!(error = %e, "drive detection failed");
                            continue;
                        }
                    };

                let (inserted, removed) = diff(&known, &current);
                for path in inserted {
                    tracing::info!(path = %path.display(), "removable media inserted");
                    events.emit(LibraryEvent::ExternalMediaInserted { path });
                }
                for path in removed {
                    tracing::info!(path = %path.display(), "removable media removed");
                    events.emit(LibraryEvent::ExternalMediaRemoved { path });
                }
                known = current;
            }
        });
        Ok(Self { task })
    }
}

impl Drop for DriveMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_finds_children_with_dcim() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("SDCARD/DCIM/100CANON")).unwrap();
        std::fs::create_dir_all(tmp.path().join("USBSTICK/docs")).unwrap();

        let found = detect_removable_media(&[tmp.path().to_path_buf()]);
        assert_eq!(found, vec![tmp.path().join("SDCARD")]);
    }

    #[test]
    fn test_detect_accepts_root_with_dcim() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("DCIM")).unwrap();

        let found = detect_removable_media(&[tmp.path().to_path_buf()]);
        assert_eq!(found, vec![tmp.path().to_path_buf()]);
    }

    #[test]
    fn test_detect_ignores_missing_roots() {
        assert!(detect_removable_media(&[PathBuf::from("/nonexistent/media")]).is_empty());
    }

    #[test]
    fn test_diff() {
        let known: BTreeSet<PathBuf> = ["/m/a", "/m/b"].iter().map(PathBuf::from).collect();
        let current: BTreeSet<PathBuf> = ["/m/b", "/m/c"].iter().map(PathBuf::from).collect();
        let (inserted, removed) = diff(&known, &current);
        assert_eq!(inserted, vec![PathBuf::from("/m/c")]);
        assert_eq!(removed, vec![PathBuf::from("/m/a")]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_monitor_reports_insert_and_removal() {
        let tmp = tempfile::tempdir().unwrap();
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let _monitor = DriveMonitor::spawn(
            vec![tmp.path().to_path_buf()],
            Duration::from_millis(20),
            events,
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let card = tmp.path().join("CARD");
        std::fs::create_dir_all(card.join("DCIM")).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, LibraryEvent::ExternalMediaInserted { path: card.clone() });

        std::fs::remove_dir_all(&card).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, LibraryEvent::ExternalMediaRemoved { path: card });
    }
}
