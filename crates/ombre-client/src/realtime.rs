//! Realtime update channel.
//!
//! A single WebSocket connection to the sync server, authenticated with the
//! same bearer tokens as the REST calls.  The channel reconnects on its own
//! with exponential backoff and republishes the key when the server signals
//! an auth problem (handshake 401, or close code 1008 after the token
//! expires mid-connection).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use ombre_shared::{token, Identity, Update};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::sync::{RemoteSync, SyncConfig};

const BACKOFF_BASE_MS: u64 = 5_000;
const BACKOFF_FACTOR: f64 = 1.5;
const BACKOFF_CAP_MS: u64 = 30_000;
const BACKOFF_JITTER: f64 = 0.2;

/// Events delivered to realtime subscribers.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Connected,
    Disconnected,
    Update(Update),
    Error(String),
}

/// Handle to the realtime connection.  Cheap to clone.
#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<Inner>,
}

struct Inner {
    config: SyncConfig,
    identity: Identity,
    sync: Arc<dyn RemoteSync>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<ChannelEvent>>>,
    connected: AtomicBool,
    running: AtomicBool,
    shutdown: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeChannel {
    pub fn new(config: SyncConfig, identity: Identity, sync: Arc<dyn RemoteSync>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                identity,
                sync,
                listeners: Mutex::new(Vec::new()),
                connected: AtomicBool::new(false),
                running: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        }
    }

    /// Register a listener.  If the channel is already up, the receiver gets
    /// a synthetic [`ChannelEvent::Connected`] immediately so new subscribers
    /// see the current state without waiting for the next transition.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.inner.connected.load(Ordering::SeqCst) {
            let _ = tx.send(ChannelEvent::Connected);
        }
        if let Ok(mut listeners) = self.inner.listeners.lock() {
            listeners.push(tx);
        }
        rx
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Start the connection loop.  A second call while the loop is alive is
    /// a no-op; the guard prevents parallel connections.
    pub fn connect(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            tracing::debug!("realtime connect already in flight, ignoring");
            return;
        }
        self.inner.shutdown.store(false, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            run_loop(&inner).await;
            inner.running.store(false, Ordering::SeqCst);
        });
        if let Ok(mut task) = self.inner.task.lock() {
            *task = Some(handle);
        }
    }

    /// Tear the connection down, stop reconnecting and drop all listeners.
    /// The instance is inert until the next [`connect`](Self::connect).
    pub fn disconnect(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        if let Ok(mut task) = self.inner.task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
        self.inner.running.store(false, Ordering::SeqCst);
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            self.inner.broadcast(ChannelEvent::Disconnected);
        }
        if let Ok(mut listeners) = self.inner.listeners.lock() {
            listeners.clear();
        }
    }
}

impl Inner {
    fn broadcast(&self, event: ChannelEvent) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    fn ws_url(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        let base = base
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{base}/ws/updates")
    }
}

async fn run_loop(inner: &Arc<Inner>) {
    let mut attempt: u32 = 0;

    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }

        let end = open_and_read(inner).await;
        match next_attempt(inner.sync.as_ref(), end, attempt).await {
            None => {
                attempt = 0;
                continue;
            }
            Some(next) => attempt = next,
        }

        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }

        let delay = backoff_delay(attempt);
        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::time::sleep(delay).await;
    }
}

enum SessionEnd {
    /// Connect failed or the socket closed normally.
    Clean,
    /// Handshake 401 or close code 1008.
    AuthRejected,
    /// A live session dropped.
    WasConnected,
}

/// Decide how to follow up a finished session.  `None` means reconnect
/// right away; `Some(n)` means wait out the backoff for attempt `n` first.
///
/// An auth rejection republishes the key: on success the next connect is
/// immediate, on failure it falls back to backoff.  A session that was
/// live before dropping starts the backoff sequence over.
async fn next_attempt(sync: &dyn RemoteSync, end: SessionEnd, attempt: u32) -> Option<u32> {
    match end {
        SessionEnd::Clean => Some(attempt.saturating_add(1)),
        SessionEnd::AuthRejected => match sync.register().await {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!(error = %e, "re-registration failed");
                Some(attempt.saturating_add(1))
            }
        },
        SessionEnd::WasConnected => Some(1),
    }
}

async fn open_and_read(inner: &Arc<Inner>) -> SessionEnd {
    let request = match build_request(inner) {
        Ok(request) => request,
        Err(e) => {
            inner.broadcast(ChannelEvent::Error(e));
            return SessionEnd::Clean;
        }
    };

    let stream = match connect_async(request).await {
        Ok((stream, _)) => stream,
        Err(WsError::Http(response))
            if response.status() == tokio_tungstenite::tungstenite::http::StatusCode::UNAUTHORIZED =>
        {
            tracing::info!("websocket handshake rejected with 401");
            return SessionEnd::AuthRejected;
        }
        Err(e) => {
            tracing::warn!(error = %e, "websocket connect failed");
            inner.broadcast(ChannelEvent::Error(e.to_string()));
            return SessionEnd::Clean;
        }
    };

    tracing::info!("realtime channel connected");
    inner.connected.store(true, Ordering::SeqCst);
    inner.broadcast(ChannelEvent::Connected);

    let (mut write, mut read) = stream.split();
    let mut auth_rejected = false;

    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_text(inner, text.as_str()),
            Ok(Message::Ping(payload)) => {
                let _ = write.send(Message::Pong(payload)).await;
            }
            Ok(Message::Close(Some(frame))) if frame.code == CloseCode::Policy => {
                tracing::info!("server closed with policy violation, token likely expired");
                auth_rejected = true;
                break;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "websocket read error");
                inner.broadcast(ChannelEvent::Error(e.to_string()));
                break;
            }
        }
    }

    inner.connected.store(false, Ordering::SeqCst);
    inner.broadcast(ChannelEvent::Disconnected);

    if auth_rejected {
        SessionEnd::AuthRejected
    } else {
        SessionEnd::WasConnected
    }
}

fn build_request(
    inner: &Inner,
) -> std::result::Result<tokio_tungstenite::tungstenite::handshake::client::Request, String> {
    let mut request = inner
        .ws_url()
        .into_client_request()
        .map_err(|e| e.to_string())?;

    let bearer = format!(
        "Bearer {}",
        token::generate(&inner.identity, &inner.config.issuer, &inner.config.subject)
    );
    let value = HeaderValue::from_str(&bearer).map_err(|e| e.to_string())?;
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(request)
}

/// Frames carry base64-encoded JSON update records.  A frame that does not
/// parse is reported to listeners but never closes the connection.
fn handle_text(inner: &Inner, text: &str) {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    let parsed = BASE64
        .decode(text.trim())
        .ok()
        .and_then(|bytes| serde_json::from_slice::<Update>(&bytes).ok());

    match parsed {
        Some(update) => inner.broadcast(ChannelEvent::Update(update)),
        None => {
            tracing::warn!("malformed realtime frame");
            inner.broadcast(ChannelEvent::Error("malformed update payload".into()));
        }
    }
}

/// Exponential backoff with jitter.  Attempt 1 waits the base delay; each
/// further attempt multiplies it by [`BACKOFF_FACTOR`] up to the cap, then
/// the result is spread +-20% so reconnecting clients do not stampede.
fn backoff_delay(attempt: u32) -> Duration {
    use rand::Rng;
    let unit: f64 = rand::thread_rng().gen();
    Duration::from_millis(jittered_delay_ms(attempt, unit))
}

fn raw_delay_ms(attempt: u32) -> u64 {
    let exp = attempt.saturating_sub(1).min(16);
    let ms = BACKOFF_BASE_MS as f64 * BACKOFF_FACTOR.powi(exp as i32);
    (ms as u64).min(BACKOFF_CAP_MS)
}

fn jittered_delay_ms(attempt: u32, unit: f64) -> u64 {
    let base = raw_delay_ms(attempt) as f64;
    let factor = 1.0 - BACKOFF_JITTER + 2.0 * BACKOFF_JITTER * unit.clamp(0.0, 1.0);
    (base * factor) as u64
}
