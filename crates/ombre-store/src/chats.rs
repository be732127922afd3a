//! Chat directory persistence.
//!
//! One chat per remote public key, scoped to a local identity.  Display
//! names are encrypted at rest; the fingerprint column stays in the clear so
//! chats can be looked up when an envelope arrives.

use chrono::{DateTime, Utc};
use ombre_shared::{crypto, Identity, PublicKey};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Chat;

impl Database {
    /// Find or create the chat for a remote public key.
    ///
    /// A newly created chat gets the key's chunked fingerprint as its
    /// display name.
    pub fn ensure_chat(&self, identity: &Identity, pubkey: &PublicKey) -> Result<Chat> {
        let fingerprint = pubkey.fingerprint();
        if let Some(existing) = self.get_chat_by_fingerprint(identity, &fingerprint)? {
            return Ok(existing);
        }

        let mut chat = Chat {
            id: Uuid::new_v4().to_string(),
            identity_id: identity.id().to_string(),
            seq: -1,
            name: pubkey.display_fingerprint(),
            pubkey: pubkey.clone(),
            fingerprint,
            keypic: None,
            created_at: Utc::now(),
        };

        let encrypted_name = crypto::encrypt_for_storage(identity, chat.name.as_bytes())?;
        chat.seq = self.conn().query_row(
            "INSERT INTO chats (id, identity_id, seq, name, pubkey, fingerprint, keypic, created_at)
             VALUES (
                 ?1, ?2,
                 (SELECT COALESCE(MAX(seq), 0) + 1 FROM chats WHERE identity_id = ?2),
                 ?3, ?4, ?5, ?6, ?7
             )
             RETURNING seq",
            params![
                chat.id,
                chat.identity_id,
                encrypted_name,
                chat.pubkey.as_bytes().as_slice(),
                chat.fingerprint,
                chat.keypic,
                chat.created_at.to_rfc3339(),
            ],
            |row| row.get(0),
        )?;

        tracing::debug!(chat_id = %chat.id, fingerprint = %chat.fingerprint, "created chat");
        Ok(chat)
    }

    /// Load a chat by id, decrypting its name with the owning identity's key.
    pub fn get_chat(&self, id: &str) -> Result<Chat> {
        let row = self
            .conn()
            .query_row(
                "SELECT id, identity_id, seq, name, pubkey, fingerprint, keypic, created_at
                 FROM chats WHERE id = ?1",
                params![id],
                raw_chat_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })?;

        let identity = self.get_identity(&row.identity_id)?;
        decode_chat(&identity, row)
    }

    pub fn get_chat_by_fingerprint(
        &self,
        identity: &Identity,
        fingerprint: &str,
    ) -> Result<Option<Chat>> {
        let row = self
            .conn()
            .query_row(
                "SELECT id, identity_id, seq, name, pubkey, fingerprint, keypic, created_at
                 FROM chats WHERE identity_id = ?1 AND fingerprint = ?2",
                params![identity.id(), fingerprint],
                raw_chat_row,
            )
            .optional()?;

        row.map(|r| decode_chat(identity, r)).transpose()
    }

    /// All chats for an identity, most recently active first.
    ///
    /// Activity is the highest `global_seq` among a chat's messages; ties
    /// fall back to the per-identity creation sequence, then the id.  Rows
    /// whose name cannot be decrypted are skipped rather than failing the
    /// whole listing.
    pub fn list_chats(&self, identity: &Identity) -> Result<Vec<Chat>> {
        let mut stmt = self.conn().prepare(
            "SELECT c.id, c.identity_id, c.seq, c.name, c.pubkey, c.fingerprint, c.keypic, c.created_at
             FROM chats c
             LEFT JOIN (
                 SELECT chat_id, MAX(global_seq) AS last_seq
                 FROM messages GROUP BY chat_id
             ) m ON m.chat_id = c.id
             WHERE c.identity_id = ?1
             ORDER BY COALESCE(m.last_seq, 0) DESC, c.seq DESC, c.id ASC",
        )?;

        let rows = stmt.query_map(params![identity.id()], raw_chat_row)?;

        let mut chats = Vec::new();
        for row in rows {
            let row = row?;
            match decode_chat(identity, row) {
                Ok(chat) => chats.push(chat),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping undecryptable chat row");
                }
            }
        }
        Ok(chats)
    }

    pub fn rename_chat(&self, identity: &Identity, chat_id: &str, name: &str) -> Result<()> {
        let encrypted = crypto::encrypt_for_storage(identity, name.as_bytes())?;
        let affected = self.conn().execute(
            "UPDATE chats SET name = ?2 WHERE id = ?1 AND identity_id = ?3",
            params![chat_id, encrypted, identity.id()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn set_chat_keypic(&self, chat_id: &str, keypic: Option<&[u8]>) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE chats SET keypic = ?2 WHERE id = ?1",
            params![chat_id, keypic],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Delete a chat and, via the FK cascade, all of its messages.
    pub fn delete_chat(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM chats WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }
}

struct RawChat {
    id: String,
    identity_id: String,
    seq: i64,
    name: Vec<u8>,
    pubkey: Vec<u8>,
    fingerprint: String,
    keypic: Option<Vec<u8>>,
    created_at: String,
}

fn raw_chat_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawChat> {
    Ok(RawChat {
        id: row.get(0)?,
        identity_id: row.get(1)?,
        seq: row.get(2)?,
        name: row.get(3)?,
        pubkey: row.get(4)?,
        fingerprint: row.get(5)?,
        keypic: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn decode_chat(identity: &Identity, raw: RawChat) -> Result<Chat> {
    let name_bytes = crypto::decrypt_from_storage(identity, &raw.name)?;
    let name = String::from_utf8(name_bytes)
        .map_err(|_| ombre_shared::CryptoError::DecryptionFailed)?;
    let pubkey = PublicKey::from_bytes(&raw.pubkey)?;
    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&raw.created_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Migration(e.to_string()))?;

    Ok(Chat {
        id: raw.id,
        identity_id: raw.identity_id,
        seq: raw.seq,
        name,
        pubkey,
        fingerprint: raw.fingerprint,
        keypic: raw.keypic,
        created_at,
    })
}
