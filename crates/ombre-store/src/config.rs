//! String key/value configuration table.
//!
//! Holds small pieces of client state that survive restarts: the active
//! identity and the realtime sync cursor.

use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;

/// Identifier of the active identity.
pub const CURRENT_IDENTITY: &str = "current_identity";

/// Timestamp (ms) of the last update applied from the change feed.
pub const SYNC_CURSOR: &str = "sync_cursor";

pub fn get_string(db: &Database, key: &str) -> Result<Option<String>> {
    let value = db
        .conn()
        .query_row(
            "SELECT value FROM config WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

pub fn set_string(db: &Database, key: &str, value: &str) -> Result<()> {
    db.conn().execute(
        "INSERT INTO config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

pub fn get_i64(db: &Database, key: &str) -> Result<Option<i64>> {
    Ok(get_string(db, key)?.and_then(|v| v.parse().ok()))
}

pub fn set_i64(db: &Database, key: &str, value: i64) -> Result<()> {
    set_string(db, key, &value.to_string())
}

pub fn delete(db: &Database, key: &str) -> Result<()> {
    db.conn()
        .execute("DELETE FROM config WHERE key = ?1", params![key])?;
    Ok(())
}
