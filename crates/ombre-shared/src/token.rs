//! Bearer tokens for the sync API.
//!
//! Compact `header.payload.signature` form, each part base64url without
//! padding.  Signed with the identity's Ed25519 key; the `kid` header
//! carries the key fingerprint so the server can look up the public key.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::constants::TOKEN_TTL_SECS;
use crate::keys::Identity;

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
    kid: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// Mint a short-lived bearer token for the given identity.
///
/// Tokens are generated fresh per request and never cached; the lifetime
/// is [`TOKEN_TTL_SECS`] from `now`.
pub fn generate(identity: &Identity, issuer: &str, subject: &str) -> String {
    let now = chrono::Utc::now().timestamp();
    generate_at(identity, issuer, subject, now)
}

fn generate_at(identity: &Identity, issuer: &str, subject: &str, now: i64) -> String {
    let header = Header {
        alg: "EdDSA".to_string(),
        typ: "JWT".to_string(),
        kid: identity.fingerprint(),
    };
    let claims = Claims {
        iss: issuer.to_string(),
        sub: subject.to_string(),
        iat: now,
        exp: now + TOKEN_TTL_SECS,
    };

    // Struct serialization cannot fail here.
    let header_json = serde_json::to_vec(&header).unwrap_or_default();
    let claims_json = serde_json::to_vec(&claims).unwrap_or_default();

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header_json),
        URL_SAFE_NO_PAD.encode(claims_json)
    );
    let signature = identity.sign(signing_input.as_bytes());

    format!(
        "{}.{}",
        signing_input,
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    )
}
