use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::constants::{PUBKEY_SIZE, SECRET_KEY_SIZE};
use crate::error::KeyError;

/// A local identity: an Ed25519 keypair plus a human-chosen identifier.
///
/// The public key and fingerprint are always derived from the secret key
/// bytes, never stored independently.  An optional pre-rendered fingerprint
/// image may be attached for display; this crate never generates one.
#[derive(Clone)]
pub struct Identity {
    id: String,
    signing_key: SigningKey,
    keypic: Option<Vec<u8>>,
}

impl Identity {
    /// Generate a new random identity under the given identifier.
    pub fn generate(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            signing_key: SigningKey::generate(&mut OsRng),
            keypic: None,
        }
    }

    /// Restore an identity from its 32 secret key bytes.
    pub fn from_secret_bytes(id: impl Into<String>, secret: &[u8]) -> Result<Self, KeyError> {
        let secret: &[u8; SECRET_KEY_SIZE] =
            secret.try_into().map_err(|_| KeyError::InvalidKeyBytes)?;
        Ok(Self {
            id: id.into(),
            signing_key: SigningKey::from_bytes(secret),
            keypic: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn secret_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        self.signing_key.as_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_verifying_key(&self.signing_key.verifying_key())
    }

    /// SHA-256 fingerprint of the public key, hex encoded.
    pub fn fingerprint(&self) -> String {
        self.public_key().fingerprint()
    }

    /// Sign a message with the identity's Ed25519 key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Clamped X25519 scalar for the hybrid transport encryption.
    pub(crate) fn x25519_secret(&self) -> x25519_dalek::StaticSecret {
        x25519_dalek::StaticSecret::from(self.signing_key.to_scalar_bytes())
    }

    /// Symmetric storage key derived from the secret key bytes.
    pub fn storage_key(&self) -> [u8; 32] {
        crate::crypto::derive_storage_key(self.signing_key.as_bytes())
    }

    pub fn keypic(&self) -> Option<&[u8]> {
        self.keypic.as_deref()
    }

    /// Attach a pre-rendered fingerprint image (produced elsewhere).
    pub fn with_keypic(mut self, keypic: Option<Vec<u8>>) -> Self {
        self.keypic = keypic;
        self
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// A remote party's Ed25519 public key (32 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    bytes: [u8; PUBKEY_SIZE],
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; PUBKEY_SIZE] =
            bytes.try_into().map_err(|_| KeyError::InvalidKeyBytes)?;
        // Reject bytes that are not a valid curve point up front.
        VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidKeyBytes)?;
        Ok(Self { bytes })
    }

    pub(crate) fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self {
            bytes: key.to_bytes(),
        }
    }

    pub fn as_bytes(&self) -> &[u8; PUBKEY_SIZE] {
        &self.bytes
    }

    /// SHA-256 of the raw key bytes, hex encoded.  Stable identity of the
    /// remote party everywhere in the system.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.bytes);
        hex::encode(hasher.finalize())
    }

    /// Fingerprint chunked into 8-character groups, used as the default
    /// display name for a chat.
    pub fn display_fingerprint(&self) -> String {
        let fp = self.fingerprint();
        fp.as_bytes()
            .chunks(8)
            .map(|c| std::str::from_utf8(c).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// PEM rendering of the raw key, used for the /register endpoint.
    pub fn to_pem(&self) -> String {
        let encoded = BASE64.encode(self.bytes);
        let mut pem = String::from("-----BEGIN PUBLIC KEY-----\n");
        for chunk in encoded.as_bytes().chunks(64) {
            pem.push_str(std::str::from_utf8(chunk).unwrap_or_default());
            pem.push('\n');
        }
        pem.push_str("-----END PUBLIC KEY-----\n");
        pem
    }

    /// Montgomery form of the key for X25519 key agreement.
    pub(crate) fn x25519_public(&self) -> Result<x25519_dalek::PublicKey, KeyError> {
        let verifying =
            VerifyingKey::from_bytes(&self.bytes).map_err(|_| KeyError::InvalidKeyBytes)?;
        Ok(x25519_dalek::PublicKey::from(
            verifying.to_montgomery().to_bytes(),
        ))
    }
}
