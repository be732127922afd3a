//! Message envelopes.
//!
//! [`TransportEnvelope`] is what goes over the wire: serialized to JSON,
//! then hybrid-encrypted for the recipient.  [`StorageEnvelope`] is the
//! at-rest form of a message body, symmetrically encrypted per identity.
//! [`MediaMetadataEnvelope`] describes an attachment without its bytes.
//!
//! All JSON field names are camelCase and part of the wire format.

use serde::{Deserialize, Serialize};

use crate::constants::ENVELOPE_VERSION;
use crate::crypto;
use crate::error::CryptoError;
use crate::keys::{Identity, PublicKey};
use crate::types::{DeliveryStatus, Media, Message};

/// serde adapter for `Vec<u8>` fields carried as standard base64 strings.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        BASE64.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Optional variant of [`base64_bytes`].
pub mod base64_bytes_opt {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_some(&BASE64.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let s: Option<String> = Option::deserialize(deserializer)?;
        s.map(|s| BASE64.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// The wire form of a message, exchanged between peers.
///
/// Media travels inline: when a message carries an attachment all three
/// `media*` fields are set, otherwise all three are absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportEnvelope {
    pub envelope_version_id: u8,
    pub content: String,
    pub generated_timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_size: Option<i64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_bytes_opt"
    )]
    pub media_bytes: Option<Vec<u8>>,
}

impl TransportEnvelope {
    pub fn new(content: impl Into<String>, generated_timestamp: i64) -> Self {
        Self {
            envelope_version_id: ENVELOPE_VERSION,
            content: content.into(),
            generated_timestamp,
            media_mime: None,
            media_size: None,
            media_bytes: None,
        }
    }

    /// Build an outgoing envelope from a local message.  The media content
    /// must be hydrated; a metadata-only attachment cannot be sent.
    pub fn from_message(message: &Message) -> Result<Self, CryptoError> {
        let mut envelope = Self::new(message.content.clone(), message.timestamp_ms);
        if let Some(media) = &message.media {
            let bytes = media
                .content
                .clone()
                .ok_or(CryptoError::EncryptionFailed)?;
            envelope.media_mime = Some(media.mime_type.clone());
            envelope.media_size = Some(media.size_bytes);
            envelope.media_bytes = Some(bytes);
        }
        Ok(envelope)
    }

    /// Turn a received envelope into a message for the given chat.  The
    /// message id and media id are freshly generated; `seq` is assigned
    /// later at insert time.
    pub fn into_message(self, chat_id: impl Into<String>) -> Message {
        let media = match (self.media_mime, self.media_size, self.media_bytes) {
            (Some(mime), Some(size), Some(bytes)) => Some(Media {
                id: uuid::Uuid::new_v4().to_string(),
                mime_type: mime,
                size_bytes: size,
                content: Some(bytes),
            }),
            _ => None,
        };
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            chat_id: chat_id.into(),
            seq: -1,
            status: DeliveryStatus::Incoming,
            content: self.content,
            timestamp_ms: self.generated_timestamp,
            media,
            media_ref: None,
        }
    }

    /// Serialize and hybrid-encrypt for the recipient.
    pub fn encrypt(&self, recipient: &PublicKey) -> Result<Vec<u8>, CryptoError> {
        let json = serde_json::to_vec(self).map_err(|_| CryptoError::EncryptionFailed)?;
        crypto::encrypt_for_transport(recipient, &json)
    }

    /// Decrypt and parse.  Any failure, including malformed JSON inside a
    /// valid ciphertext, surfaces as [`CryptoError::DecryptionFailed`].
    pub fn decrypt(identity: &Identity, data: &[u8]) -> Result<Self, CryptoError> {
        let json = crypto::decrypt_from_transport(identity, data)?;
        serde_json::from_slice(&json).map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// The at-rest form of a message body inside the local store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageEnvelope {
    pub content: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_ref: Option<String>,
}

impl StorageEnvelope {
    pub fn from_message(message: &Message) -> Self {
        Self {
            content: message.content.clone(),
            timestamp: message.timestamp_ms,
            media_ref: message
                .media
                .as_ref()
                .map(|m| m.id.clone())
                .or_else(|| message.media_ref.clone()),
        }
    }

    pub fn encrypt(&self, identity: &Identity) -> Result<Vec<u8>, CryptoError> {
        let json = serde_json::to_vec(self).map_err(|_| CryptoError::EncryptionFailed)?;
        crypto::encrypt_for_storage(identity, &json)
    }

    pub fn decrypt(identity: &Identity, data: &[u8]) -> Result<Self, CryptoError> {
        let json = crypto::decrypt_from_storage(identity, data)?;
        serde_json::from_slice(&json).map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// Attachment metadata, stored encrypted alongside the media row.  The
/// actual bytes live in a separate encrypted file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMetadataEnvelope {
    pub mime: String,
    pub size: i64,
}

impl MediaMetadataEnvelope {
    pub fn encrypt(&self, identity: &Identity) -> Result<Vec<u8>, CryptoError> {
        let json = serde_json::to_vec(self).map_err(|_| CryptoError::EncryptionFailed)?;
        crypto::encrypt_for_storage(identity, &json)
    }

    pub fn decrypt(identity: &Identity, data: &[u8]) -> Result<Self, CryptoError> {
        let json = crypto::decrypt_from_storage(identity, data)?;
        serde_json::from_slice(&json).map_err(|_| CryptoError::DecryptionFailed)
    }
}
