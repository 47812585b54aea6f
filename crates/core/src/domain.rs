use std::fmt;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "heic", "heif", "tif", "tiff", "bmp",
];

pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm", "m4v"];

// ── Media ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Classify a path by its extension (case-insensitive).
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Image)
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Video)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "image" => Some(MediaKind::Image),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

/// Everything the library knows about one file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaDescriptor {
    pub fingerprint: String,
    pub path: PathBuf,
    pub size: u64,
    pub width: u32,
    pub height: u32,
    /// EXIF capture time, local to the camera.
    pub captured_at: Option<NaiveDateTime>,
    /// Modification time in seconds since the Unix epoch.
    pub modified_at: i64,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryFolder {
    pub id: i64,
    pub path: PathBuf,
    pub added_at: i64,
    pub last_scanned: Option<i64>,
}

// ── Cache ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Thumbnail,
    Optimized,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Thumbnail => "thumbnail",
            ArtifactKind::Optimized => "optimized",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "thumbnail" => Some(ArtifactKind::Thumbnail),
            "optimized" => Some(ArtifactKind::Optimized),
            _ => None,
        }
    }

    /// Subdirectory of the cache root holding artifacts of this kind.
    pub fn dir_name(&self) -> &'static str {
        match self {
            ArtifactKind::Thumbnail => "thumbnails",
            ArtifactKind::Optimized => "optimized",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub fingerprint: String,
    pub kind: ArtifactKind,
    pub artifact_path: PathBuf,
    pub original_size: u64,
    pub cached_size: u64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entry_count: usize,
    pub original_size: u64,
    pub cached_size: u64,
    pub max_size: u64,
}

// ── Tasks ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Paused,
    Stopped,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Stopped => "stopped",
            TaskStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(TaskStatus::Running),
            "paused" => Some(TaskStatus::Paused),
            "stopped" => Some(TaskStatus::Stopped),
            "completed" => Some(TaskStatus::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of the optimization run for one library folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationTask {
    pub folder: PathBuf,
    pub total_files: usize,
    pub processed_files: usize,
    pub optimized_files: usize,
    pub failed_files: usize,
    pub status: TaskStatus,
}

impl OptimizationTask {
    pub fn new(folder: PathBuf, total_files: usize) -> Self {
        Self {
            folder,
            total_files,
            processed_files: 0,
            optimized_files: 0,
            failed_files: 0,
            status: if total_files == 0 {
                TaskStatus::Completed
            } else {
                TaskStatus::Running
            },
        }
    }

    /// Running or paused: work is still owed to this task.
    pub fn is_active(&self) -> bool {
        matches!(self.status, TaskStatus::Running | TaskStatus::Paused)
    }
}

// ── Import ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportCandidate {
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
    pub fingerprint: String,
    pub kind: MediaKind,
    pub captured_at: Option<NaiveDateTime>,
    pub modified_at: i64,
    pub is_duplicate: bool,
    pub selected: bool,
}
