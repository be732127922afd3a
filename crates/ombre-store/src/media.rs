//! Media persistence.
//!
//! Each attachment is split in two: an encrypted metadata row (mime type and
//! size) in the `media` table, and the encrypted content in a file named
//! after the media id under the store's media directory.  Small images are
//! loaded eagerly; everything else is metadata-only until a caller asks for
//! the content.

use ombre_shared::envelope::MediaMetadataEnvelope;
use ombre_shared::{crypto, Identity, Media};
use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};

/// Content at or below this size is loaded together with the metadata when
/// the mime type is an image.
pub const MAX_EAGER_MEDIA_BYTES: i64 = 5 * 1024 * 1024;

impl Database {
    /// Store an attachment: metadata in the table, content in a file.
    pub fn insert_media(&self, identity: &Identity, media: &Media) -> Result<()> {
        let content = media.content.as_deref().ok_or(StoreError::NotFound)?;

        let metadata = MediaMetadataEnvelope {
            mime: media.mime_type.clone(),
            size: media.size_bytes,
        };
        let encrypted_meta = metadata.encrypt(identity)?;
        let encrypted_content = crypto::encrypt_for_storage(identity, content)?;

        std::fs::write(self.media_dir().join(&media.id), encrypted_content)?;
        self.conn().execute(
            "INSERT INTO media (id, identity_id, metadata) VALUES (?1, ?2, ?3)",
            params![media.id, identity.id(), encrypted_meta],
        )?;
        Ok(())
    }

    /// Load an attachment's metadata, and its content when it is an image no
    /// larger than [`MAX_EAGER_MEDIA_BYTES`] or when `force_content` is set.
    pub fn get_media(&self, identity: &Identity, id: &str, force_content: bool) -> Result<Media> {
        let encrypted_meta: Vec<u8> = self
            .conn()
            .query_row(
                "SELECT metadata FROM media WHERE id = ?1 AND identity_id = ?2",
                params![id, identity.id()],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })?;

        let metadata = MediaMetadataEnvelope::decrypt(identity, &encrypted_meta)?;

        let eager = metadata.mime.starts_with("image/") && metadata.size <= MAX_EAGER_MEDIA_BYTES;
        let content = if eager || force_content {
            Some(self.read_media_content(identity, id)?)
        } else {
            None
        };

        Ok(Media {
            id: id.to_string(),
            mime_type: metadata.mime,
            size_bytes: metadata.size,
            content,
        })
    }

    /// MIME type of an attachment without touching its content file.
    pub fn media_mime(&self, identity: &Identity, id: &str) -> Result<String> {
        let encrypted_meta: Vec<u8> = self
            .conn()
            .query_row(
                "SELECT metadata FROM media WHERE id = ?1 AND identity_id = ?2",
                params![id, identity.id()],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })?;
        Ok(MediaMetadataEnvelope::decrypt(identity, &encrypted_meta)?.mime)
    }

    /// Decrypt the content file of an attachment.
    pub fn read_media_content(&self, identity: &Identity, id: &str) -> Result<Vec<u8>> {
        let encrypted = std::fs::read(self.media_dir().join(id))?;
        Ok(crypto::decrypt_from_storage(identity, &encrypted)?)
    }

    pub fn delete_media(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM media WHERE id = ?1", params![id])?;
        match std::fs::remove_file(self.media_dir().join(id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(affected > 0)
    }
}
