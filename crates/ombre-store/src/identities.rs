//! Identity persistence.
//!
//! The identities table is the key store: it holds the raw Ed25519 seed for
//! every local identity.  Everything else in the database is encrypted under
//! keys derived from these seeds, so this table is the root of trust.

use chrono::{DateTime, Utc};
use ombre_shared::Identity;
use rusqlite::params;

use crate::config;
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::IdentityRecord;

impl Database {
    pub fn insert_identity(&self, identity: &Identity) -> Result<()> {
        self.conn().execute(
            "INSERT INTO identities (id, secret_key, keypic, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                identity.id(),
                identity.secret_bytes().as_slice(),
                identity.keypic(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_identity(&self, id: &str) -> Result<Identity> {
        let (secret, keypic): (Vec<u8>, Option<Vec<u8>>) = self
            .conn()
            .query_row(
                "SELECT secret_key, keypic FROM identities WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })?;

        Ok(Identity::from_secret_bytes(id, &secret)?.with_keypic(keypic))
    }

    pub fn list_identities(&self) -> Result<Vec<IdentityRecord>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id, created_at FROM identities ORDER BY created_at ASC")?;

        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let ts: String = row.get(1)?;
            Ok((id, ts))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, ts) = row?;
            let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| StoreError::Migration(e.to_string()))?;
            records.push(IdentityRecord { id, created_at });
        }
        Ok(records)
    }

    /// Swap the keypair of an existing identity in place.
    ///
    /// The old key's chats and messages become unreadable, so they are
    /// removed along with it.  The identity keeps its row and identifier.
    pub fn replace_identity_key(&self, identity: &Identity) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE identities SET secret_key = ?2, keypic = ?3 WHERE id = ?1",
            params![
                identity.id(),
                identity.secret_bytes().as_slice(),
                identity.keypic(),
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        self.conn().execute(
            "DELETE FROM chats WHERE identity_id = ?1",
            params![identity.id()],
        )?;
        Ok(())
    }

    pub fn delete_identity(&self, id: &str) -> Result<bool> {
        if self.current_identity_id()?.as_deref() == Some(id) {
            config::delete(self, config::CURRENT_IDENTITY)?;
        }
        let affected = self
            .conn()
            .execute("DELETE FROM identities WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    /// Mark an identity as the active one.  Fails if it does not exist.
    pub fn set_current_identity(&self, id: &str) -> Result<()> {
        self.get_identity(id)?;
        config::set_string(self, config::CURRENT_IDENTITY, id)
    }

    pub fn current_identity_id(&self) -> Result<Option<String>> {
        config::get_string(self, config::CURRENT_IDENTITY)
    }

    /// Load the active identity, if one has been selected.
    pub fn current_identity(&self) -> Result<Option<Identity>> {
        match self.current_identity_id()? {
            Some(id) => match self.get_identity(&id) {
                Ok(identity) => Ok(Some(identity)),
                Err(StoreError::NotFound) => Ok(None),
                Err(e) => Err(e),
            },
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn identity_round_trip() {
        let (_dir, db) = open_db();
        let identity = Identity::generate("alice").with_keypic(Some(vec![1, 2, 3]));
        db.insert_identity(&identity).unwrap();

        let loaded = db.get_identity("alice").unwrap();
        assert_eq!(loaded.secret_bytes(), identity.secret_bytes());
        assert_eq!(loaded.keypic(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn missing_identity_is_not_found() {
        let (_dir, db) = open_db();
        assert!(matches!(db.get_identity("ghost"), Err(StoreError::NotFound)));
    }

    #[test]
    fn current_identity_pointer() {
        let (_dir, db) = open_db();
        assert!(db.current_identity().unwrap().is_none());

        let identity = Identity::generate("alice");
        db.insert_identity(&identity).unwrap();
        db.set_current_identity("alice").unwrap();
        assert_eq!(db.current_identity().unwrap().unwrap().id(), "alice");

        db.delete_identity("alice").unwrap();
        assert!(db.current_identity().unwrap().is_none());
    }

    #[test]
    fn set_current_requires_existing() {
        let (_dir, db) = open_db();
        assert!(db.set_current_identity("nobody").is_err());
    }

    #[test]
    fn replace_key_keeps_id_and_drops_chats() {
        let (_dir, db) = open_db();
        let old = Identity::generate("alice");
        db.insert_identity(&old).unwrap();
        let chat = db
            .ensure_chat(&old, &Identity::generate("bob").public_key())
            .unwrap();
        assert_eq!(db.list_chats(&old).unwrap().len(), 1);

        let new = Identity::generate("alice");
        db.replace_identity_key(&new).unwrap();

        let loaded = db.get_identity("alice").unwrap();
        assert_eq!(loaded.secret_bytes(), new.secret_bytes());
        assert_ne!(loaded.secret_bytes(), old.secret_bytes());
        assert!(db.list_chats(&new).unwrap().is_empty());
        assert!(db.get_chat(&chat.id).is_err());
    }
}
