//! Domain models returned by the store.

use chrono::{DateTime, Utc};
use ombre_shared::PublicKey;

/// A chat with one remote party, scoped to a local identity.
///
/// `name` is decrypted on load; it defaults to the remote key's chunked
/// fingerprint until the user renames the chat.
#[derive(Debug, Clone)]
pub struct Chat {
    pub id: String,
    pub identity_id: String,
    pub seq: i64,
    pub name: String,
    pub pubkey: PublicKey,
    pub fingerprint: String,
    pub keypic: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

/// A stored identity record, before key reconstruction.
#[derive(Debug, Clone)]
pub struct IdentityRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
}
