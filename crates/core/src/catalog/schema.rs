use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};

pub const SCHEMA_VERSION: u32 = 1;

pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS folders (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            path         TEXT NOT NULL UNIQUE,
            added_at     INTEGER NOT NULL,
            last_scanned INTEGER
        );

        CREATE TABLE IF NOT EXISTS media_files (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            folder_id   INTEGER NOT NULL REFERENCES folders(id) ON DELETE CASCADE,
            path        TEXT NOT NULL UNIQUE,
            fingerprint TEXT NOT NULL,
            size        INTEGER NOT NULL,
            width       INTEGER NOT NULL,
            height      INTEGER NOT NULL,
            captured_at TEXT,
            modified_at INTEGER NOT NULL,
            kind        TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_media_fingerprint ON media_files(fingerprint);
        CREATE INDEX IF NOT EXISTS idx_media_folder ON media_files(folder_id);

        CREATE TABLE IF NOT EXISTS cache_entries (
            fingerprint   TEXT NOT NULL,
            kind          TEXT NOT NULL,
            artifact_path TEXT NOT NULL,
            original_size INTEGER NOT NULL,
            cached_size   INTEGER NOT NULL,
            created_at    INTEGER NOT NULL,
            access_seq    INTEGER NOT NULL,
            PRIMARY KEY (fingerprint, kind)
        );

        CREATE INDEX IF NOT EXISTS idx_cache_access ON cache_entries(access_seq);

        CREATE TABLE IF NOT EXISTS tasks (
            folder    TEXT PRIMARY KEY,
            total     INTEGER NOT NULL,
            processed INTEGER NOT NULL,
            optimized INTEGER NOT NULL,
            failed    INTEGER NOT NULL,
            status    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS config (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

/// Stamp a fresh database with the current version, refuse newer ones.
pub fn migrate(conn: &Connection) -> Result<()> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM config WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    let db_version = stored.and_then(|v| v.parse::<u32>().ok()).unwrap_or(0);
    if db_version > SCHEMA_VERSION {
        return Err(Error::SchemaTooNew {
            db: db_version,
            code: SCHEMA_VERSION,
        });
    }

    if db_version < SCHEMA_VERSION {
        conn.execute(
            "INSERT INTO config (key, value) VALUES ('schema_version', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![SCHEMA_VERSION.to_string()],
        )?;
    }
    Ok(())
}
