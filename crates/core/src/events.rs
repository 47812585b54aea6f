use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::broadcast;

/// Notifications pushed to whoever renders the library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum LibraryEvent {
    FileAdded { path: PathBuf },
    FileRemoved { path: PathBuf },
    ExternalMediaInserted { path: PathBuf },
    ExternalMediaRemoved { path: PathBuf },
    TaskCompleted { folder: PathBuf },
    Reconciled {
        folder: PathBuf,
        added: usize,
        removed: usize,
        dispatched: usize,
    },
}

/// Fan-out channel for [`LibraryEvent`]s. Cloning shares the channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LibraryEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LibraryEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: LibraryEvent) {
        tracing::debug!(?event, "event");
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
