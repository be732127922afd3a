use thiserror::Error;

/// Errors produced by the client layer.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The server answered with a non-success status.
    #[error("API error: status {status}: {message}")]
    Api { status: u16, message: String },

    /// Network-level failure talking to the server.
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Local store failure.
    #[error("Store error: {0}")]
    Store(#[from] ombre_store::StoreError),

    /// Envelope encryption or decryption failure.
    #[error("Crypto error: {0}")]
    Crypto(#[from] ombre_shared::CryptoError),

    /// Key parsing failure.
    #[error("Key error: {0}")]
    Key(#[from] ombre_shared::KeyError),

    /// A chat id that does not exist locally.
    #[error("Chat not found: {0}")]
    ChatNotFound(String),

    /// No identity has been created or selected yet.
    #[error("No active identity")]
    NoIdentity,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;
