//! REST sync client.
//!
//! Every request carries a freshly minted short-lived bearer token.  A 401
//! response triggers one key registration followed by a single retry; a
//! second 401 surfaces as an API error.  Send is special: it never fails,
//! it reports [`DeliveryStatus::Failed`] instead so the caller can record
//! the outcome on the message.

use std::time::Duration;

use async_trait::async_trait;
use ombre_shared::envelope::{base64_bytes, TransportEnvelope};
use ombre_shared::{token, DeliveryStatus, Identity, PublicKey, Update};
use serde::Deserialize;

use crate::error::{ClientError, Result};

/// Request timeout for all sync calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Connection parameters for the sync server.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the sync server, e.g. `https://relay.example.org`.
    pub base_url: String,
    /// Token issuer claim.
    pub issuer: String,
    /// Token subject claim.
    pub subject: String,
}

/// A message fetched from the server: who sent it, and the opened envelope.
#[derive(Debug, Clone)]
pub struct RemoteMessage {
    pub sender_fingerprint: String,
    pub envelope: TransportEnvelope,
}

impl RemoteMessage {
    /// Delivery status a fetched message should carry locally: our own
    /// echoes come back as delivered, everything else is incoming.
    pub fn status_for(&self, identity: &Identity) -> DeliveryStatus {
        if self.sender_fingerprint == identity.fingerprint() {
            DeliveryStatus::Delivered
        } else {
            DeliveryStatus::Incoming
        }
    }
}

/// Server operations needed by the reconciliation engine.  Implemented by
/// [`HttpSyncClient`] and by in-memory fakes in tests.
#[async_trait]
pub trait RemoteSync: Send + Sync {
    /// Messages exchanged with a peer, newer than `since` (exclusive).
    async fn fetch_messages(
        &self,
        peer: &PublicKey,
        limit: u32,
        since: i64,
    ) -> Result<Vec<RemoteMessage>>;

    /// Deliver an encrypted envelope to a peer.  Infallible by contract:
    /// every failure mode maps to [`DeliveryStatus::Failed`].
    async fn send_message(
        &self,
        peer: &PublicKey,
        message_id: &str,
        envelope: &[u8],
    ) -> DeliveryStatus;

    /// Change-feed records newer than `since` (exclusive).
    async fn fetch_updates(&self, since: i64) -> Result<Vec<Update>>;

    /// Publish our public key so peers and tokens can be verified.
    async fn register(&self) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    sender: String,
    #[serde(with = "base64_bytes")]
    message: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct WirePage {
    messages: Vec<WireMessage>,
    #[allow(dead_code)]
    #[serde(default)]
    total: u64,
}

/// [`RemoteSync`] over HTTP, backed by `reqwest`.
pub struct HttpSyncClient {
    http: reqwest::Client,
    config: SyncConfig,
    identity: Identity,
}

impl HttpSyncClient {
    pub fn new(config: SyncConfig, identity: Identity) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            config,
            identity,
        })
    }

    fn bearer(&self) -> String {
        format!(
            "Bearer {}",
            token::generate(&self.identity, &self.config.issuer, &self.config.subject)
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Run a GET, registering our key and retrying once on a 401.
    async fn get_with_auth(&self, url: &str) -> Result<reqwest::Response> {
        let response = self
            .http
            .get(url)
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .send()
            .await?;

        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Self::check_status(response).await;
        }

        tracing::info!("got 401, re-registering key and retrying");
        self.register().await?;

        let retried = self
            .http
            .get(url)
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .send()
            .await?;
        Self::check_status(retried).await
    }

    async fn post_envelope(&self, url: &str, envelope: &[u8]) -> reqwest::Result<reqwest::Response> {
        self.http
            .post(url)
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(envelope.to_vec())
            .send()
            .await
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ClientError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl RemoteSync for HttpSyncClient {
    async fn fetch_messages(
        &self,
        peer: &PublicKey,
        limit: u32,
        since: i64,
    ) -> Result<Vec<RemoteMessage>> {
        let url = self.url(&format!(
            "/from/{}?limit={limit}&since={since}",
            peer.fingerprint()
        ));
        let page: WirePage = self.get_with_auth(&url).await?.json().await?;

        let mut messages = Vec::with_capacity(page.messages.len());
        for entry in page.messages {
            match TransportEnvelope::decrypt(&self.identity, &entry.message) {
                Ok(envelope) => messages.push(RemoteMessage {
                    sender_fingerprint: entry.sender,
                    envelope,
                }),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping undecryptable fetched message");
                }
            }
        }
        Ok(messages)
    }

    async fn send_message(
        &self,
        peer: &PublicKey,
        message_id: &str,
        envelope: &[u8],
    ) -> DeliveryStatus {
        let url = self.url(&format!(
            "/send?fingerprint={}&msgId={message_id}",
            peer.fingerprint()
        ));

        let result = match self.post_envelope(&url, envelope).await {
            Ok(response) if response.status() == reqwest::StatusCode::UNAUTHORIZED => {
                tracing::info!(message_id, "send got 401, re-registering key and retrying");
                match self.register().await {
                    Ok(()) => self.post_envelope(&url, envelope).await,
                    Err(e) => {
                        tracing::warn!(error = %e, message_id, "re-registration failed");
                        return DeliveryStatus::Failed;
                    }
                }
            }
            other => other,
        };

        match result {
            Ok(response) if response.status() == reqwest::StatusCode::CREATED => {
                DeliveryStatus::Delivered
            }
            Ok(response) => {
                tracing::warn!(status = %response.status(), message_id, "send rejected");
                DeliveryStatus::Failed
            }
            Err(e) => {
                tracing::warn!(error = %e, message_id, "send failed");
                DeliveryStatus::Failed
            }
        }
    }

    async fn fetch_updates(&self, since: i64) -> Result<Vec<Update>> {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;

        let url = self.url(&format!("/updates?since={since}"));
        let encoded: Vec<String> = self.get_with_auth(&url).await?.json().await?;

        // Malformed records are dropped, not fatal.
        let mut updates = Vec::with_capacity(encoded.len());
        for record in encoded {
            let parsed = BASE64
                .decode(&record)
                .ok()
                .and_then(|bytes| serde_json::from_slice::<Update>(&bytes).ok());
            match parsed {
                Some(update) => updates.push(update),
                None => tracing::warn!("dropping malformed update record"),
            }
        }
        Ok(updates)
    }

    async fn register(&self) -> Result<()> {
        let url = self.url("/register");
        let response = self
            .http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-pem-file")
            .body(self.identity.public_key().to_pem())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_MODIFIED {
            tracing::debug!(fingerprint = %self.identity.fingerprint(), "key registered");
            return Ok(());
        }
        let message = response.text().await.unwrap_or_default();
        Err(ClientError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_echo_is_delivered_peer_is_incoming() {
        let alice = Identity::generate("alice");
        let envelope = TransportEnvelope::new("x", 1);

        let own = RemoteMessage {
            sender_fingerprint: alice.fingerprint(),
            envelope: envelope.clone(),
        };
        assert_eq!(own.status_for(&alice), DeliveryStatus::Delivered);

        let other = RemoteMessage {
            sender_fingerprint: "deadbeef".into(),
            envelope,
        };
        assert_eq!(other.status_for(&alice), DeliveryStatus::Incoming);
    }

    #[test]
    fn fetched_page_json_shape() {
        let json = r#"{"messages":[{"sender":"abc","message":"AQID"}],"total":1}"#;
        let page: WirePage = serde_json::from_str(json).unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].sender, "abc");
        assert_eq!(page.messages[0].message, vec![1, 2, 3]);
    }

    /// One-request-per-connection HTTP stub.  Records request paths and
    /// answers 401 to the first send, 200 to register, 201 afterwards.
    async fn spawn_stub_server() -> (String, std::sync::Arc<std::sync::Mutex<Vec<String>>>) {
        use std::sync::{Arc, Mutex};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let paths: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&paths);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 8192];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let head = String::from_utf8_lossy(&buf[..n]).to_string();
                let path = head
                    .split_whitespace()
                    .nth(1)
                    .unwrap_or_default()
                    .to_string();
                let status = {
                    let mut seen = seen.lock().unwrap();
                    seen.push(path.clone());
                    if path.starts_with("/register") {
                        "200 OK"
                    } else if seen.iter().filter(|p| p.starts_with("/send")).count() > 1 {
                        "201 Created"
                    } else {
                        "401 Unauthorized"
                    }
                };
                let reply =
                    format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
                let _ = socket.write_all(reply.as_bytes()).await;
            }
        });

        (format!("http://{addr}"), paths)
    }

    #[tokio::test]
    async fn send_reregisters_and_retries_on_401() {
        let (base_url, paths) = spawn_stub_server().await;
        let client = HttpSyncClient::new(
            SyncConfig {
                base_url,
                issuer: "ombre".into(),
                subject: "sync".into(),
            },
            Identity::generate("alice"),
        )
        .unwrap();
        let bob = Identity::generate("bob").public_key();

        let status = client.send_message(&bob, "m1", b"envelope").await;
        assert_eq!(status, DeliveryStatus::Delivered);

        let recorded = paths.lock().unwrap().clone();
        assert_eq!(recorded.len(), 3);
        assert!(recorded[0].starts_with("/send"));
        assert_eq!(recorded[1], "/register");
        assert!(recorded[2].starts_with("/send"));
    }

    #[test]
    fn url_joining_strips_trailing_slash() {
        let client = HttpSyncClient::new(
            SyncConfig {
                base_url: "https://relay.example.org/".into(),
                issuer: "ombre".into(),
                subject: "sync".into(),
            },
            Identity::generate("alice"),
        )
        .unwrap();
        assert_eq!(
            client.url("/updates?since=0"),
            "https://relay.example.org/updates?since=0"
        );
    }
}
