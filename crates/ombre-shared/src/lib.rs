//! # ombre-shared
//!
//! Cryptographic core and wire types shared by the Ombre messaging client:
//! identities (Ed25519 keypairs), the envelope codec (symmetric storage
//! encryption and hybrid transport encryption), short-lived bearer tokens,
//! and the domain/wire models exchanged between the store and sync layers.

pub mod constants;
pub mod crypto;
pub mod envelope;
pub mod keys;
pub mod token;
pub mod types;

mod error;

pub use error::{CryptoError, KeyError};
pub use keys::{Identity, PublicKey};
pub use types::{DeliveryStatus, Media, Message, Update};
