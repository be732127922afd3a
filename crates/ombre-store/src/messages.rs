//! Sequenced message persistence.
//!
//! Sequence numbers are assigned inside the INSERT itself: a nested SELECT
//! takes the current maximum and adds a stride of 10, so both `chat_seq`
//! (per chat) and `global_seq` (whole database) are strictly increasing no
//! matter how rows are interleaved.  The gap between consecutive values
//! leaves room for future out-of-band inserts.
//!
//! The message body and its timestamp travel together inside one encrypted
//! envelope per row; only the status and sequence columns are queryable.

use ombre_shared::envelope::StorageEnvelope;
use ombre_shared::{DeliveryStatus, Identity, Message};
use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};

const SEQ_STRIDE: i64 = 10;

impl Database {
    /// Insert a message, assigning its per-chat sequence number.
    ///
    /// Returns the assigned `chat_seq`.  The caller's `seq` field is
    /// ignored; the stored value is authoritative.
    pub fn append_message(&self, identity: &Identity, message: &Message) -> Result<i64> {
        let envelope = StorageEnvelope::from_message(message);
        let encrypted = envelope.encrypt(identity)?;

        let chat_seq: i64 = self.conn().query_row(
            "INSERT INTO messages (id, chat_id, chat_seq, global_seq, content, delivery_status)
             VALUES (
                 ?1, ?2,
                 (SELECT COALESCE(MAX(chat_seq), 0) + ?5 FROM messages WHERE chat_id = ?2),
                 (SELECT COALESCE(MAX(global_seq), 0) + ?5 FROM messages),
                 ?3, ?4
             )
             RETURNING chat_seq",
            params![
                message.id,
                message.chat_id,
                encrypted,
                message.status.as_str(),
                SEQ_STRIDE,
            ],
            |row| row.get(0),
        )?;

        tracing::debug!(message_id = %message.id, chat_seq, "appended message");
        Ok(chat_seq)
    }

    /// Update a message's delivery status.  Missing ids are a no-op.
    pub fn update_message_status(&self, id: &str, status: DeliveryStatus) -> Result<()> {
        self.conn().execute(
            "UPDATE messages SET delivery_status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        Ok(())
    }

    /// A page of messages for a chat, newest first.
    pub fn get_messages_page(
        &self,
        identity: &Identity,
        chat_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, chat_id, chat_seq, content, delivery_status
             FROM messages
             WHERE chat_id = ?1
             ORDER BY chat_seq DESC
             LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(params![chat_id, limit, offset], raw_message_row)?;
        collect_messages(identity, rows)
    }

    /// All messages for a chat, oldest first.
    pub fn get_all_messages(&self, identity: &Identity, chat_id: &str) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, chat_id, chat_seq, content, delivery_status
             FROM messages
             WHERE chat_id = ?1
             ORDER BY chat_seq ASC",
        )?;
        let rows = stmt.query_map(params![chat_id], raw_message_row)?;
        collect_messages(identity, rows)
    }

    /// Messages for a chat whose timestamps appear in `timestamps`.
    ///
    /// Timestamps live inside the encrypted envelope, so the filter runs
    /// after decryption rather than in SQL.
    pub fn get_messages_by_timestamps(
        &self,
        identity: &Identity,
        chat_id: &str,
        timestamps: &[i64],
    ) -> Result<Vec<Message>> {
        let all = self.get_all_messages(identity, chat_id)?;
        Ok(all
            .into_iter()
            .filter(|m| timestamps.contains(&m.timestamp_ms))
            .collect())
    }

    /// The newest message of a chat, if any.
    pub fn latest_message(&self, identity: &Identity, chat_id: &str) -> Result<Option<Message>> {
        Ok(self
            .get_messages_page(identity, chat_id, 1, 0)?
            .into_iter()
            .next())
    }

    pub fn get_message(&self, identity: &Identity, id: &str) -> Result<Message> {
        let raw = self
            .conn()
            .query_row(
                "SELECT id, chat_id, chat_seq, content, delivery_status
                 FROM messages WHERE id = ?1",
                params![id],
                raw_message_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })?;
        decode_message(identity, raw)
    }
}

struct RawMessage {
    id: String,
    chat_id: String,
    chat_seq: i64,
    content: Vec<u8>,
    delivery_status: String,
}

fn raw_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMessage> {
    Ok(RawMessage {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        chat_seq: row.get(2)?,
        content: row.get(3)?,
        delivery_status: row.get(4)?,
    })
}

fn decode_message(identity: &Identity, raw: RawMessage) -> Result<Message> {
    let envelope = StorageEnvelope::decrypt(identity, &raw.content)?;
    let status = DeliveryStatus::parse(&raw.delivery_status)
        .ok_or_else(|| StoreError::Migration(format!("bad status {}", raw.delivery_status)))?;

    Ok(Message {
        id: raw.id,
        chat_id: raw.chat_id,
        seq: raw.chat_seq,
        status,
        content: envelope.content,
        timestamp_ms: envelope.timestamp,
        media: None,
        media_ref: envelope.media_ref,
    })
}

/// Decrypt rows one by one, skipping any that fail instead of dropping the
/// whole result set.
fn collect_messages(
    identity: &Identity,
    rows: impl Iterator<Item = rusqlite::Result<RawMessage>>,
) -> Result<Vec<Message>> {
    let mut messages = Vec::new();
    for row in rows {
        let raw = row?;
        match decode_message(identity, raw) {
            Ok(message) => messages.push(message),
            Err(e) => {
                tracing::warn!(error = %e, "skipping undecryptable message row");
            }
        }
    }
    Ok(messages)
}
