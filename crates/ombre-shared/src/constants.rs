/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Ed25519 secret key size in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Envelope format version byte (prefixes every encrypted blob)
pub const ENVELOPE_VERSION: u8 = 1;

/// Bearer token lifetime in seconds
pub const TOKEN_TTL_SECS: i64 = 300;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_STORAGE_KEY: &str = "ombre-storage-key-v1";
pub const KDF_CONTEXT_TRANSPORT_KEY: &str = "ombre-transport-key-v1";
