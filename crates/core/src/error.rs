use std::path::PathBuf;

use crate::domain::{ArtifactKind, TaskStatus};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("walkdir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("file watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("invalid config file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("failed to encode {}: {message}", .path.display())]
    Encode { path: PathBuf, message: String },

    #[error("task for {} is running; pause or stop it first", .0.display())]
    TaskBusy(PathBuf),

    #[error("no optimization task for {}", .0.display())]
    TaskNotFound(PathBuf),

    #[error("optimization task for {} is stopped; reset it first", .0.display())]
    TaskStopped(PathBuf),

    #[error("cannot {action} task for {} while it is {status}", .folder.display())]
    InvalidTransition {
        folder: PathBuf,
        status: TaskStatus,
        action: &'static str,
    },

    #[error("job for {} was dropped before it ran", .0.display())]
    JobCancelled(PathBuf),

    #[error("no {kind} cached for {fingerprint}")]
    ArtifactNotFound {
        fingerprint: String,
        kind: ArtifactKind,
    },

    #[error("folder does not exist: {}", .0.display())]
    FolderNotFound(PathBuf),

    #[error("path is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("folder not registered: {}", .0.display())]
    FolderNotRegistered(PathBuf),

    #[error("catalog schema version {db} is newer than supported version {code}")]
    SchemaTooNew { db: u32, code: u32 },

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("no tokio runtime available; call from within a runtime")]
    NoRuntime,
}

pub type Result<T> = std::result::Result<T, Error>;
