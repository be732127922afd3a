//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run before any other operation.  Media content lives next
//! to the database as individually encrypted files; only the metadata rows
//! go through SQLite.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

/// Wrapper around a [`rusqlite::Connection`] plus the media directory.
pub struct Database {
    conn: Connection,
    media_dir: PathBuf,
}

impl Database {
    /// Open (or create) the default application database.
    ///
    /// The database file is placed in the platform-appropriate data directory:
    /// - Linux:   `~/.local/share/ombre/ombre.db`
    /// - macOS:   `~/Library/Application Support/com.ombre.ombre/ombre.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\ombre\ombre\data\ombre.db`
    pub fn new() -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("com", "ombre", "ombre").ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("ombre.db");

        tracing::info!(path = %db_path.display(), "opening database");

        Self::open_at(&db_path)
    }

    /// Open (or create) a database at an explicit path.
    ///
    /// This is useful for tests and for embedding the store inside custom
    /// directory layouts.  The media directory is created as a `media/`
    /// sibling of the database file.
    pub fn open_at(path: &Path) -> Result<Self> {
        let media_dir = path
            .parent()
            .map(|p| p.join("media"))
            .ok_or(StoreError::NoDataDir)?;
        std::fs::create_dir_all(&media_dir)?;

        let conn = Connection::open(path)?;

        // Recommended SQLite settings.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        // Run schema migrations.
        migrations::run_migrations(&conn)?;

        Ok(Self { conn, media_dir })
    }

    /// Return a reference to the underlying `rusqlite::Connection`.
    ///
    /// Callers should prefer the typed CRUD helpers, but direct access is
    /// occasionally needed for transactions or ad-hoc queries.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Directory holding encrypted media content files.
    pub fn media_dir(&self) -> &Path {
        &self.media_dir
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }
}
