use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

const APP_DIR: &str = ".photocache";

/// Runtime settings, stored as TOML. Missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding artifacts and `catalog.db`.
    pub cache_root: PathBuf,
    /// Ceiling on the summed size of cached artifacts before LRU eviction.
    pub max_cache_bytes: u64,
    /// Longest edge of generated thumbnails, in pixels.
    pub thumbnail_size: u32,
    /// Longest edge of optimized images and videos, in pixels.
    pub max_resolution: u32,
    /// Encoder quality, 0-100.
    pub quality: u8,
    /// Number of concurrent optimization jobs.
    pub workers: usize,
    /// Quiet period before a burst of filesystem events is reconciled.
    pub debounce_ms: u64,
    pub drive_poll_ms: u64,
    /// Directories whose children are checked for removable media.
    pub removable_roots: Vec<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_root: app_dir().join("cache"),
            max_cache_bytes: 2 * 1024 * 1024 * 1024,
            thumbnail_size: 300,
            max_resolution: 1920,
            quality: 85,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            debounce_ms: 1000,
            drive_poll_ms: 2000,
            removable_roots: default_removable_roots(),
        }
    }
}

impl Config {
    /// `~/.photocache/config.toml`
    pub fn default_path() -> PathBuf {
        app_dir().join("config.toml")
    }

    /// Read the config at `path`, writing the defaults there first if it is missing.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Config::default();
            config.save(path)?;
            tracing::info!(path = %path.display(), "wrote default config");
            return Ok(config);
        }
        Self::load(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.cache_root.join("catalog.db")
    }
}

fn app_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

#[cfg(target_os = "macos")]
fn default_removable_roots() -> Vec<PathBuf> {
    vec![PathBuf::from("/Volumes")]
}

#[cfg(target_os = "windows")]
fn default_removable_roots() -> Vec<PathBuf> {
    (b'D'..=b'Z')
        .map(|letter| PathBuf::from(format!("{}:\\", letter as char)))
        .collect()
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn default_removable_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Ok(user) = std::env::var("USER") {
        roots.push(PathBuf::from("/media").join(&user));
        roots.push(PathBuf::from("/run/media").join(user));
    }
    roots.push(PathBuf::from("/mnt"));
    roots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_or_init_writes_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("config.toml");

        let config = Config::load_or_init(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config, Config::default());

        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults_for_missing_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "max_resolution = 1280\ndebounce_ms = 250\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.max_resolution, 1280);
        assert_eq!(config.debounce_ms, 250);
        assert_eq!(config.thumbnail_size, 300);
        assert_eq!(config.quality, 85);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "max_resolution = \"big\"").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, crate::error::Error::ConfigParse(_)));
    }

    #[test]
    fn test_catalog_lives_in_cache_root() {
        let config = Config {
            cache_root: PathBuf::from("/tmp/pc"),
            ..Config::default()
        };
        assert_eq!(config.catalog_path(), PathBuf::from("/tmp/pc/catalog.db"));
    }
}
