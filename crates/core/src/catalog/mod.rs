pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::domain::*;
use crate::error::{Error, Result};

const CAPTURE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// SQLite-backed store for library folders, media descriptors, cache entries
/// and optimization tasks. Safe to share between threads.
pub struct Catalog {
    conn: Mutex<Connection>,
}

impl Catalog {
    /// Open or create a catalog at the given path with WAL mode.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::initialize(&conn)?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory catalog (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::initialize(&conn)?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-statement leaves SQLite consistent; keep going.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Folders ──────────────────────────────────────────────────────

    /// Register a folder. Registering the same folder twice returns the existing row.
    pub fn add_folder(&self, path: &Path) -> Result<LibraryFolder> {
        let canonical = path.canonicalize()?;
        let path_str = canonical.to_string_lossy();
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO folders (path, added_at) VALUES (?1, ?2)",
            params![path_str.as_ref(), chrono::Utc::now().timestamp()],
        )?;
        let folder = conn.query_row(
            "SELECT id, path, added_at, last_scanned FROM folders WHERE path = ?1",
            params![path_str.as_ref()],
            row_to_folder,
        )?;
        Ok(folder)
    }

    pub fn list_folders(&self) -> Result<Vec<LibraryFolder>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT id, path, added_at, last_scanned FROM folders ORDER BY path")?;
        let folders = stmt
            .query_map([], row_to_folder)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(folders)
    }

    pub fn get_folder(&self, path: &Path) -> Result<Option<LibraryFolder>> {
        let lookup = lookup_path(path);
        let folder = self
            .conn()
            .query_row(
                "SELECT id, path, added_at, last_scanned FROM folders WHERE path = ?1",
                params![lookup.to_string_lossy().as_ref()],
                row_to_folder,
            )
            .optional()?;
        Ok(folder)
    }

    /// The registered folder containing `path`, preferring the deepest match.
    pub fn folder_for_path(&self, path: &Path) -> Result<Option<LibraryFolder>> {
        let lookup = lookup_path(path);
        let folder = self
            .list_folders()?
            .into_iter()
            .filter(|f| lookup.starts_with(&f.path))
            .max_by_key(|f| f.path.components().count());
        Ok(folder)
    }

    pub fn update_folder_scanned(&self, folder_id: i64, timestamp: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE folders SET last_scanned = ?1 WHERE id = ?2",
            params![timestamp, folder_id],
        )?;
        Ok(())
    }

    /// Remove a folder row; its media rows go with it.
    pub fn remove_folder(&self, path: &Path) -> Result<LibraryFolder> {
        let folder = self
            .get_folder(path)?
            .ok_or_else(|| Error::FolderNotRegistered(path.to_path_buf()))?;
        self.conn()
            .execute("DELETE FROM folders WHERE id = ?1", params![folder.id])?;
        Ok(folder)
    }

    // ── Media ────────────────────────────────────────────────────────

    pub fn upsert_media(&self, folder_id: i64, media: &MediaDescriptor) -> Result<()> {
        insert_media(&self.conn(), folder_id, media)
    }

    /// Replace every media row of a folder with `media` in one transaction.
    pub fn replace_folder_media(&self, folder_id: i64, media: &[MediaDescriptor]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM media_files WHERE folder_id = ?1",
            params![folder_id],
        )?;
        for m in media {
            insert_media(&tx, folder_id, m)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_media(&self, path: &Path) -> Result<Option<MediaDescriptor>> {
        let lookup = lookup_path(path);
        let media = self
            .conn()
            .query_row(
                "SELECT fingerprint, path, size, width, height, captured_at, modified_at, kind
                 FROM media_files WHERE path = ?1",
                params![lookup.to_string_lossy().as_ref()],
                row_to_media,
            )
            .optional()?;
        Ok(media)
    }

    pub fn remove_media_batch(&self, paths: &[PathBuf]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM media_files WHERE path = ?1")?;
            for path in paths {
                removed += stmt.execute(params![path.to_string_lossy().as_ref()])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    pub fn list_media(&self) -> Result<Vec<MediaDescriptor>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT fingerprint, path, size, width, height, captured_at, modified_at, kind
             FROM media_files ORDER BY path",
        )?;
        let media = stmt
            .query_map([], row_to_media)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(media)
    }

    pub fn list_folder_media(&self, folder_id: i64) -> Result<Vec<MediaDescriptor>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT fingerprint, path, size, width, height, captured_at, modified_at, kind
             FROM media_files WHERE folder_id = ?1 ORDER BY path",
        )?;
        let media = stmt
            .query_map(params![folder_id], row_to_media)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(media)
    }

    /// Paths of every catalogued file with this fingerprint.
    pub fn media_paths_for_fingerprint(&self, fingerprint: &str) -> Result<Vec<PathBuf>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT path FROM media_files WHERE fingerprint = ?1")?;
        let paths = stmt
            .query_map(params![fingerprint], |row| {
                Ok(PathBuf::from(row.get::<_, String>(0)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(paths)
    }

    /// Fingerprints present in this folder and in no other folder.
    pub fn exclusive_fingerprints(&self, folder_id: i64) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT fingerprint FROM media_files
             WHERE folder_id = ?1
               AND fingerprint NOT IN (
                   SELECT fingerprint FROM media_files WHERE folder_id != ?1
               )",
        )?;
        let fps = stmt
            .query_map(params![folder_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(fps)
    }

    // ── Cache entries ────────────────────────────────────────────────

    pub fn get_entry(&self, fingerprint: &str, kind: ArtifactKind) -> Result<Option<CacheEntry>> {
        let entry = self
            .conn()
            .query_row(
                "SELECT fingerprint, kind, artifact_path, original_size, cached_size, created_at
                 FROM cache_entries WHERE fingerprint = ?1 AND kind = ?2",
                params![fingerprint, kind.as_str()],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// Insert or overwrite an entry, stamping it with access sequence `seq`.
    pub fn put_entry(&self, entry: &CacheEntry, seq: i64) -> Result<()> {
        self.conn().execute(
            "INSERT INTO cache_entries
                (fingerprint, kind, artifact_path, original_size, cached_size, created_at, access_seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(fingerprint, kind) DO UPDATE SET
                artifact_path = excluded.artifact_path,
                original_size = excluded.original_size,
                cached_size = excluded.cached_size,
                created_at = excluded.created_at,
                access_seq = excluded.access_seq",
            params![
                entry.fingerprint,
                entry.kind.as_str(),
                entry.artifact_path.to_string_lossy().as_ref(),
                entry.original_size as i64,
                entry.cached_size as i64,
                entry.created_at,
                seq,
            ],
        )?;
        Ok(())
    }

    pub fn touch_entry(&self, fingerprint: &str, kind: ArtifactKind, seq: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE cache_entries SET access_seq = ?3 WHERE fingerprint = ?1 AND kind = ?2",
            params![fingerprint, kind.as_str(), seq],
        )?;
        Ok(())
    }

    pub fn remove_entry(&self, fingerprint: &str, kind: ArtifactKind) -> Result<bool> {
        let count = self.conn().execute(
            "DELETE FROM cache_entries WHERE fingerprint = ?1 AND kind = ?2",
            params![fingerprint, kind.as_str()],
        )?;
        Ok(count > 0)
    }

    pub fn entries_for_fingerprint(&self, fingerprint: &str) -> Result<Vec<CacheEntry>> {
        self.query_entries(
            "SELECT fingerprint, kind, artifact_path, original_size, cached_size, created_at
             FROM cache_entries WHERE fingerprint = ?1",
            params![fingerprint],
        )
    }

    /// All entries, least recently used first.
    pub fn entries_by_lru(&self) -> Result<Vec<CacheEntry>> {
        self.query_entries(
            "SELECT fingerprint, kind, artifact_path, original_size, cached_size, created_at
             FROM cache_entries ORDER BY access_seq ASC",
            [],
        )
    }

    /// Entries whose fingerprint no catalogued file carries anymore.
    pub fn unreferenced_entries(&self) -> Result<Vec<CacheEntry>> {
        self.query_entries(
            "SELECT fingerprint, kind, artifact_path, original_size, cached_size, created_at
             FROM cache_entries
             WHERE fingerprint NOT IN (SELECT fingerprint FROM media_files)",
            [],
        )
    }

    fn query_entries<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<CacheEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let entries = stmt
            .query_map(params, row_to_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn max_access_seq(&self) -> Result<i64> {
        let seq = self.conn().query_row(
            "SELECT COALESCE(MAX(access_seq), 0) FROM cache_entries",
            [],
            |row| row.get(0),
        )?;
        Ok(seq)
    }

    /// (entry count, summed original size, summed cached size)
    pub fn cache_totals(&self) -> Result<(usize, u64, u64)> {
        let totals = self.conn().query_row(
            "SELECT COUNT(*), COALESCE(SUM(original_size), 0), COALESCE(SUM(cached_size), 0)
             FROM cache_entries",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)? as usize,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, i64>(2)? as u64,
                ))
            },
        )?;
        Ok(totals)
    }

    // ── Tasks ────────────────────────────────────────────────────────

    pub fn save_task(&self, task: &OptimizationTask) -> Result<()> {
        self.conn().execute(
            "INSERT INTO tasks (folder, total, processed, optimized, failed, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(folder) DO UPDATE SET
                total = excluded.total,
                processed = excluded.processed,
                optimized = excluded.optimized,
                failed = excluded.failed,
                status = excluded.status",
            params![
                task.folder.to_string_lossy().as_ref(),
                task.total_files as i64,
                task.processed_files as i64,
                task.optimized_files as i64,
                task.failed_files as i64,
                task.status.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn delete_task(&self, folder: &Path) -> Result<bool> {
        let count = self.conn().execute(
            "DELETE FROM tasks WHERE folder = ?1",
            params![folder.to_string_lossy().as_ref()],
        )?;
        Ok(count > 0)
    }

    pub fn list_tasks(&self) -> Result<Vec<OptimizationTask>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT folder, total, processed, optimized, failed, status FROM tasks ORDER BY folder",
        )?;
        let tasks = stmt
            .query_map([], |row| {
                Ok(OptimizationTask {
                    folder: PathBuf::from(row.get::<_, String>(0)?),
                    total_files: row.get::<_, i64>(1)? as usize,
                    processed_files: row.get::<_, i64>(2)? as usize,
                    optimized_files: row.get::<_, i64>(3)? as usize,
                    failed_files: row.get::<_, i64>(4)? as usize,
                    status: TaskStatus::parse(&row.get::<_, String>(5)?)
                        .unwrap_or(TaskStatus::Stopped),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    // ── Config ───────────────────────────────────────────────────────

    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn()
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }
}

/// Canonical form when the path still exists, the raw path otherwise.
fn lookup_path(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

fn insert_media(conn: &Connection, folder_id: i64, m: &MediaDescriptor) -> Result<()> {
    conn.execute(
        "INSERT INTO media_files
            (folder_id, path, fingerprint, size, width, height, captured_at, modified_at, kind)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(path) DO UPDATE SET
            folder_id = excluded.folder_id,
            fingerprint = excluded.fingerprint,
            size = excluded.size,
            width = excluded.width,
            height = excluded.height,
            captured_at = excluded.captured_at,
            modified_at = excluded.modified_at,
            kind = excluded.kind",
        params![
            folder_id,
            m.path.to_string_lossy().as_ref(),
            m.fingerprint,
            m.size as i64,
            m.width,
            m.height,
            m.captured_at.map(|t| t.format(CAPTURE_FORMAT).to_string()),
            m.modified_at,
            m.kind.as_str(),
        ],
    )?;
    Ok(())
}

fn row_to_folder(row: &Row<'_>) -> rusqlite::Result<LibraryFolder> {
    Ok(LibraryFolder {
        id: row.get(0)?,
        path: PathBuf::from(row.get::<_, String>(1)?),
        added_at: row.get(2)?,
        last_scanned: row.get(3)?,
    })
}

fn row_to_media(row: &Row<'_>) -> rusqlite::Result<MediaDescriptor> {
    let captured_at: Option<String> = row.get(5)?;
    Ok(MediaDescriptor {
        fingerprint: row.get(0)?,
        path: PathBuf::from(row.get::<_, String>(1)?),
        size: row.get::<_, i64>(2)? as u64,
        width: row.get(3)?,
        height: row.get(4)?,
        captured_at: captured_at
            .and_then(|s| NaiveDateTime::parse_from_str(&s, CAPTURE_FORMAT).ok()),
        modified_at: row.get(6)?,
        kind: MediaKind::parse(&row.get::<_, String>(7)?).unwrap_or(MediaKind::Image),
    })
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<CacheEntry> {
    Ok(CacheEntry {
        fingerprint: row.get(0)?,
        kind: ArtifactKind::parse(&row.get::<_, String>(1)?).unwrap_or(ArtifactKind::Optimized),
        artifact_path: PathBuf::from(row.get::<_, String>(2)?),
        original_size: row.get::<_, i64>(3)? as u64,
        cached_size: row.get::<_, i64>(4)? as u64,
        created_at: row.get(5)?,
    })
}
