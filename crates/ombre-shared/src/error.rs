use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    /// Covers tampering, wrong key, bad version byte and truncated input
    /// alike.  Callers must not be able to distinguish the cases.
    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,
}

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,
}
