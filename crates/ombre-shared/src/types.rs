use serde::{Deserialize, Serialize};

use crate::envelope::{base64_bytes, TransportEnvelope};
use crate::error::{CryptoError, KeyError};
use crate::keys::{Identity, PublicKey};

/// Delivery lifecycle of a message.
///
/// `Sent -> Delivered | Failed` on send completion, back to `Sent` on an
/// explicit resend.  `Incoming` is terminal and never transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Failed,
    Incoming,
}

impl DeliveryStatus {
    /// Stable string form, also used as the SQLite column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "SENT",
            DeliveryStatus::Delivered => "DELIVERED",
            DeliveryStatus::Failed => "FAILED",
            DeliveryStatus::Incoming => "INCOMING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SENT" => Some(DeliveryStatus::Sent),
            "DELIVERED" => Some(DeliveryStatus::Delivered),
            "FAILED" => Some(DeliveryStatus::Failed),
            "INCOMING" => Some(DeliveryStatus::Incoming),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A media attachment.  `content` is `None` when only the metadata has been
/// loaded; large or non-image media is hydrated on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Media {
    pub id: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub content: Option<Vec<u8>>,
}

/// A single chat message.
///
/// `seq` is the per-chat sequence assigned at local-insert time (`-1` until
/// then).  `timestamp_ms` (milliseconds since epoch) is the authoritative
/// ordering key across local and remote copies and the correlation key used
/// during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub seq: i64,
    pub status: DeliveryStatus,
    pub content: String,
    pub timestamp_ms: i64,
    pub media: Option<Media>,
    pub media_ref: Option<String>,
}

impl Message {
    pub fn with_seq(mut self, seq: i64) -> Self {
        self.seq = seq;
        self
    }
}

/// A push notification record: who sent something, and the transport
/// envelope they sent.  Delivered base64-encoded over both the change feed
/// and the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    #[serde(rename = "pubkeyBytes", with = "base64_bytes")]
    pub pubkey_bytes: Vec<u8>,
    #[serde(rename = "envelopeBytes", with = "base64_bytes")]
    pub envelope_bytes: Vec<u8>,
}

impl Update {
    pub fn public_key(&self) -> Result<PublicKey, KeyError> {
        PublicKey::from_bytes(&self.pubkey_bytes)
    }

    /// Open the attached transport envelope with the local identity.
    pub fn open(&self, identity: &Identity) -> Result<TransportEnvelope, CryptoError> {
        TransportEnvelope::decrypt(identity, &self.envelope_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_round_trip() {
        for status in [
            DeliveryStatus::Sent,
            DeliveryStatus::Delivered,
            DeliveryStatus::Failed,
            DeliveryStatus::Incoming,
        ] {
            assert_eq!(DeliveryStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DeliveryStatus::parse("UNKNOWN"), None);
    }

    #[test]
    fn update_json_uses_base64_fields() {
        let update = Update {
            pubkey_bytes: vec![1, 2, 3],
            envelope_bytes: vec![4, 5, 6],
        };
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains("\"pubkeyBytes\":\"AQID\""));
        let parsed: Update = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, update);
    }
}
