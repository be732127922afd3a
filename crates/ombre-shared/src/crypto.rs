//! Envelope encryption primitives.
//!
//! Two blob formats, both prefixed with [`ENVELOPE_VERSION`]:
//!
//! - storage: `version || nonce(24) || ciphertext+tag`, XChaCha20-Poly1305
//!   under a key derived from the identity's secret key.
//! - transport: `version || ephemeral_pub(32) || nonce(24) || ciphertext+tag`,
//!   hybrid X25519 + XChaCha20-Poly1305 so only the recipient's private key
//!   can open it.
//!
//! Decryption fails closed: truncated input, an unknown version byte, a
//! wrong key and a flipped bit all surface as the same
//! [`CryptoError::DecryptionFailed`].

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use x25519_dalek::EphemeralSecret;

use crate::constants::{
    ENVELOPE_VERSION, KDF_CONTEXT_STORAGE_KEY, KDF_CONTEXT_TRANSPORT_KEY, NONCE_SIZE, PUBKEY_SIZE,
    SYMMETRIC_KEY_SIZE,
};
use crate::error::CryptoError;
use crate::keys::{Identity, PublicKey};

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

// BLAKE3 KDF with domain separation
pub fn derive_storage_key(secret: &[u8]) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_STORAGE_KEY);
    hasher.update(secret);
    *hasher.finalize().as_bytes()
}

fn derive_transport_key(shared_secret: &[u8], ephemeral_pub: &[u8]) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_TRANSPORT_KEY);
    hasher.update(shared_secret);
    hasher.update(ephemeral_pub);
    *hasher.finalize().as_bytes()
}

fn seal(key: &SymmetricKey, nonce_bytes: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .encrypt(XNonce::from_slice(nonce_bytes), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)
}

fn open(key: &SymmetricKey, nonce_bytes: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(XNonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Symmetric encryption for data at rest (messages, chat names, media).
pub fn encrypt_for_storage(identity: &Identity, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let key = identity.storage_key();
    let nonce = generate_nonce();
    let ciphertext = seal(&key, &nonce, plaintext)?;

    let mut output = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len());
    output.push(ENVELOPE_VERSION);
    output.extend_from_slice(&nonce);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

/// Inverse of [`encrypt_for_storage`].
pub fn decrypt_from_storage(identity: &Identity, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < 1 + NONCE_SIZE || data[0] != ENVELOPE_VERSION {
        return Err(CryptoError::DecryptionFailed);
    }
    let (nonce, ciphertext) = data[1..].split_at(NONCE_SIZE);
    open(&identity.storage_key(), nonce, ciphertext)
}

/// Hybrid encryption for the wire: a fresh X25519 keypair per envelope, the
/// session key derived from the Diffie-Hellman shared secret.
pub fn encrypt_for_transport(
    recipient: &PublicKey,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let recipient_x = recipient
        .x25519_public()
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let ephemeral = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_pub = x25519_dalek::PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient_x);

    let key = derive_transport_key(shared.as_bytes(), ephemeral_pub.as_bytes());
    let nonce = generate_nonce();
    let ciphertext = seal(&key, &nonce, plaintext)?;

    let mut output = Vec::with_capacity(1 + PUBKEY_SIZE + NONCE_SIZE + ciphertext.len());
    output.push(ENVELOPE_VERSION);
    output.extend_from_slice(ephemeral_pub.as_bytes());
    output.extend_from_slice(&nonce);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

/// Inverse of [`encrypt_for_transport`], using the local identity's key.
pub fn decrypt_from_transport(identity: &Identity, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < 1 + PUBKEY_SIZE + NONCE_SIZE || data[0] != ENVELOPE_VERSION {
        return Err(CryptoError::DecryptionFailed);
    }
    let (ephemeral_bytes, rest) = data[1..].split_at(PUBKEY_SIZE);
    let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);

    let mut ephemeral_pub = [0u8; PUBKEY_SIZE];
    ephemeral_pub.copy_from_slice(ephemeral_bytes);
    let ephemeral_pub = x25519_dalek::PublicKey::from(ephemeral_pub);

    let shared = identity.x25519_secret().diffie_hellman(&ephemeral_pub);
    let key = derive_transport_key(shared.as_bytes(), ephemeral_pub.as_bytes());
    open(&key, nonce, ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_round_trip() {
        let identity = Identity::generate("alice");
        let plaintext = b"attends-moi sous l'ombre";

        let encrypted = encrypt_for_storage(&identity, plaintext).unwrap();
        let decrypted = decrypt_from_storage(&identity, &encrypted).unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn storage_wrong_identity_fails() {
        let alice = Identity::generate("alice");
        let mallory = Identity::generate("mallory");

        let encrypted = encrypt_for_storage(&alice, b"secret").unwrap();
        assert!(decrypt_from_storage(&mallory, &encrypted).is_err());
    }

    #[test]
    fn storage_tamper_any_bit_fails() {
        let identity = Identity::generate("alice");
        let encrypted = encrypt_for_storage(&identity, b"payload").unwrap();

        for i in 0..encrypted.len() {
            let mut tampered = encrypted.clone();
            tampered[i] ^= 0x01;
            assert!(
                decrypt_from_storage(&identity, &tampered).is_err(),
                "bit flip at byte {i} was not rejected"
            );
        }
    }

    #[test]
    fn transport_round_trip() {
        let recipient = Identity::generate("bob");
        let plaintext = b"pour bob seulement";

        let encrypted = encrypt_for_transport(&recipient.public_key(), plaintext).unwrap();
        let decrypted = decrypt_from_transport(&recipient, &encrypted).unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn transport_only_recipient_can_open() {
        let bob = Identity::generate("bob");
        let eve = Identity::generate("eve");

        let encrypted = encrypt_for_transport(&bob.public_key(), b"secret").unwrap();
        assert!(decrypt_from_transport(&eve, &encrypted).is_err());
    }

    #[test]
    fn transport_tamper_fails() {
        let bob = Identity::generate("bob");
        let mut encrypted = encrypt_for_transport(&bob.public_key(), b"secret").unwrap();
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0xFF;
        assert!(decrypt_from_transport(&bob, &encrypted).is_err());
    }

    #[test]
    fn truncated_and_bad_version_fail() {
        let identity = Identity::generate("alice");
        assert!(decrypt_from_storage(&identity, &[]).is_err());
        assert!(decrypt_from_transport(&identity, &[ENVELOPE_VERSION; 10]).is_err());

        let mut encrypted = encrypt_for_storage(&identity, b"x").unwrap();
        encrypted[0] = 0xFE;
        assert!(decrypt_from_storage(&identity, &encrypted).is_err());
    }

    #[test]
    fn envelopes_are_randomized() {
        let identity = Identity::generate("alice");
        let a = encrypt_for_storage(&identity, b"same").unwrap();
        let b = encrypt_for_storage(&identity, b"same").unwrap();
        assert_ne!(a, b);
    }
}
