//! Message reconciliation.
//!
//! The local store is the source of truth for ordering; the server only
//! ever adds information.  Remote and local copies of a message are
//! correlated by their generated timestamp: a remote message whose
//! timestamp matches any local one in the same chat is treated as the same
//! message, never inserted twice.
//!
//! Status moves one way.  A matched pair can only upgrade the local status
//! (SENT to DELIVERED when our own echo comes back); INCOMING never
//! overwrites and is never overwritten.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use ombre_shared::envelope::TransportEnvelope;
use ombre_shared::{DeliveryStatus, Identity, Media, Message, PublicKey, Update};
use ombre_store::{Chat, Database};
use tokio::sync::{broadcast, watch, Mutex};

use crate::directory::ChatDirectory;
use crate::error::{ClientError, Result};
use crate::sync::{RemoteMessage, RemoteSync};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One watch cell per chat that something subscribed to, holding the newest
/// message for that chat's list preview.
type LatestCells = Arc<StdMutex<HashMap<String, watch::Sender<Option<Message>>>>>;

/// Notifications about message changes, fanned out to all subscribers.
#[derive(Debug, Clone)]
pub enum MessageEvent {
    New(Message),
    StatusChanged {
        chat_id: String,
        message_id: String,
        status: DeliveryStatus,
    },
}

/// Orchestrates the local store and the sync client.
pub struct MessageService {
    db: Arc<Mutex<Database>>,
    identity: Identity,
    sync: Arc<dyn RemoteSync>,
    events_tx: broadcast::Sender<MessageEvent>,
    chat_list: Option<Arc<ChatDirectory>>,
    latest: LatestCells,
}

impl MessageService {
    pub fn new(db: Arc<Mutex<Database>>, identity: Identity, sync: Arc<dyn RemoteSync>) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            db,
            identity,
            sync,
            events_tx,
            chat_list: None,
            latest: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Keep the given chat-list snapshot in step with message activity.
    pub fn with_chat_directory(mut self, chats: Arc<ChatDirectory>) -> Self {
        self.chat_list = Some(chats);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MessageEvent> {
        self.events_tx.subscribe()
    }

    /// Watch the newest message of one chat.  The receiver is seeded from
    /// the store and updated on every insert and status change.
    pub async fn subscribe_latest(
        &self,
        chat_id: &str,
    ) -> Result<watch::Receiver<Option<Message>>> {
        let seed = {
            let db = self.db.lock().await;
            db.latest_message(&self.identity, chat_id)?
        };

        let mut cells = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        let cell = cells
            .entry(chat_id.to_string())
            .or_insert_with(|| watch::channel(None).0);
        cell.send_replace(seed);
        Ok(cell.subscribe())
    }

    /// A page of messages for a chat, newest first.
    ///
    /// The server is consulted when `refresh` is set or when the local page
    /// comes up empty.  The fetch window starts at the timestamp of the
    /// message just above the requested page; for the newest page that is
    /// the newest local message.  With nothing stored yet the window covers
    /// everything, otherwise a missing anchor falls back to now.  A failed
    /// fetch degrades to the local page rather than erroring.
    pub async fn get_messages(
        &self,
        chat_id: &str,
        limit: u32,
        offset: u32,
        refresh: bool,
    ) -> Result<Vec<Message>> {
        let chat = self.get_chat(chat_id).await?;

        let (local, boundary) = {
            let db = self.db.lock().await;
            let page = db.get_messages_page(&self.identity, chat_id, limit, offset)?;
            let boundary = db
                .get_messages_page(&self.identity, chat_id, 1, offset.saturating_sub(1))?
                .first()
                .map(|m| m.timestamp_ms);
            (page, boundary)
        };

        if !refresh && !local.is_empty() {
            return Ok(self.hydrate_media(local).await);
        }

        let since = match boundary {
            Some(timestamp) => timestamp,
            None if local.is_empty() => 0,
            None => chrono::Utc::now().timestamp_millis(),
        };
        match self.sync.fetch_messages(&chat.pubkey, limit, since).await {
            Ok(remote) => {
                self.merge_remote(&chat, remote).await?;
            }
            Err(e) => {
                tracing::warn!(error = %e, chat_id, "remote fetch failed, serving local page");
            }
        }

        let page = {
            let db = self.db.lock().await;
            db.get_messages_page(&self.identity, chat_id, limit, offset)?
        };
        Ok(self.hydrate_media(page).await)
    }

    /// Fold a batch of fetched messages into the local store.
    ///
    /// Returns the number of newly inserted messages.
    pub async fn merge_remote(&self, chat: &Chat, remote: Vec<RemoteMessage>) -> Result<usize> {
        if remote.is_empty() {
            return Ok(0);
        }

        let timestamps: Vec<i64> = remote
            .iter()
            .map(|r| r.envelope.generated_timestamp)
            .collect();
        let local = {
            let db = self.db.lock().await;
            db.get_messages_by_timestamps(&self.identity, &chat.id, &timestamps)?
        };

        let mut inserted = 0;
        let mut changed = false;
        for record in remote {
            let status = record.status_for(&self.identity);
            let timestamp = record.envelope.generated_timestamp;

            match local.iter().find(|m| m.timestamp_ms == timestamp) {
                None => {
                    let mut message = record.envelope.into_message(chat.id.clone());
                    message.status = status;
                    let message = self.persist_message(message).await?;
                    inserted += 1;
                    changed = true;
                    let _ = self.events_tx.send(MessageEvent::New(message));
                }
                Some(existing)
                    if status != existing.status
                        && status != DeliveryStatus::Incoming
                        && existing.status != DeliveryStatus::Incoming =>
                {
                    let db = self.db.lock().await;
                    db.update_message_status(&existing.id, status)?;
                    drop(db);
                    changed = true;
                    let _ = self.events_tx.send(MessageEvent::StatusChanged {
                        chat_id: chat.id.clone(),
                        message_id: existing.id.clone(),
                        status,
                    });
                }
                Some(_) => {}
            }
        }

        if changed {
            self.touch_chat(&chat.id).await;
        }
        if inserted > 0 {
            tracing::debug!(chat_id = %chat.id, inserted, "merged remote messages");
        }
        Ok(inserted)
    }

    /// Apply one realtime update: open the envelope, find or create the
    /// sender's chat, and merge the message.
    pub async fn incoming_update(&self, update: Update) -> Result<()> {
        let pubkey = update.public_key()?;
        let envelope = update.open(&self.identity)?;

        let chat = {
            let db = self.db.lock().await;
            db.ensure_chat(&self.identity, &pubkey)?
        };

        let record = RemoteMessage {
            sender_fingerprint: pubkey.fingerprint(),
            envelope,
        };
        self.merge_remote(&chat, vec![record]).await?;
        Ok(())
    }

    /// Send a message: stored immediately as SENT, delivered in the
    /// background, status updated when the attempt resolves.
    pub async fn send_message(
        &self,
        chat_id: &str,
        content: &str,
        media: Option<Media>,
    ) -> Result<Message> {
        let chat = self.get_chat(chat_id).await?;

        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            seq: -1,
            status: DeliveryStatus::Sent,
            content: content.to_string(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            media,
            media_ref: None,
        };
        let message = self.persist_message(message).await?;
        let _ = self.events_tx.send(MessageEvent::New(message.clone()));
        self.touch_chat(chat_id).await;

        self.spawn_delivery(message.clone(), chat.pubkey);
        Ok(message)
    }

    /// Deliver an existing local message again, typically after a FAILED
    /// attempt.  Messages we did not author are left alone.
    pub async fn resend_message(&self, message_id: &str) -> Result<()> {
        let message = {
            let db = self.db.lock().await;
            db.get_message(&self.identity, message_id)?
        };
        if message.status == DeliveryStatus::Incoming {
            return Ok(());
        }

        let chat = self.get_chat(&message.chat_id).await?;
        {
            let db = self.db.lock().await;
            db.update_message_status(message_id, DeliveryStatus::Sent)?;
        }
        let _ = self.events_tx.send(MessageEvent::StatusChanged {
            chat_id: message.chat_id.clone(),
            message_id: message.id.clone(),
            status: DeliveryStatus::Sent,
        });
        self.touch_chat(&message.chat_id).await;

        let message = self.with_media_content(message).await?;
        self.spawn_delivery(message, chat.pubkey);
        Ok(())
    }

    /// The newest message of a chat, for list previews.
    pub async fn latest_message(&self, chat_id: &str) -> Result<Option<Message>> {
        let db = self.db.lock().await;
        Ok(db.latest_message(&self.identity, chat_id)?)
    }

    async fn get_chat(&self, chat_id: &str) -> Result<Chat> {
        let db = self.db.lock().await;
        match db.get_chat(chat_id) {
            Ok(chat) => Ok(chat),
            Err(ombre_store::StoreError::NotFound) => {
                Err(ClientError::ChatNotFound(chat_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Store a message and its attachment, returning the copy with the
    /// assigned sequence number.
    async fn persist_message(&self, message: Message) -> Result<Message> {
        let db = self.db.lock().await;
        if let Some(media) = &message.media {
            db.insert_media(&self.identity, media)?;
        }
        let seq = db.append_message(&self.identity, &message)?;
        Ok(message.with_seq(seq))
    }

    /// Attach metadata (and eagerly loadable content) for referenced media.
    /// Best effort; a missing attachment leaves the message bare.
    async fn hydrate_media(&self, messages: Vec<Message>) -> Vec<Message> {
        let db = self.db.lock().await;
        messages
            .into_iter()
            .map(|mut message| {
                if let Some(media_ref) = &message.media_ref {
                    match db.get_media(&self.identity, media_ref, false) {
                        Ok(media) => message.media = Some(media),
                        Err(e) => {
                            tracing::warn!(error = %e, media_ref, "media hydration failed");
                        }
                    }
                }
                message
            })
            .collect()
    }

    /// Reload the full attachment content before resending.
    async fn with_media_content(&self, mut message: Message) -> Result<Message> {
        if let Some(media_ref) = &message.media_ref {
            let db = self.db.lock().await;
            message.media = Some(db.get_media(&self.identity, media_ref, true)?);
        }
        Ok(message)
    }

    /// Refresh the chat-list snapshot and the chat's latest-message cell
    /// after activity in `chat_id`.  Best effort.
    async fn touch_chat(&self, chat_id: &str) {
        {
            let db = self.db.lock().await;
            refresh_latest_cell(&self.latest, &db, &self.identity, chat_id);
        }
        if let Some(chats) = &self.chat_list {
            if let Err(e) = chats.refresh().await {
                tracing::warn!(error = %e, "chat list refresh failed");
            }
        }
    }

    fn spawn_delivery(&self, message: Message, peer: PublicKey) {
        let db = Arc::clone(&self.db);
        let sync = Arc::clone(&self.sync);
        let events_tx = self.events_tx.clone();
        let latest = Arc::clone(&self.latest);
        let identity = self.identity.clone();

        tokio::spawn(async move {
            let status = match TransportEnvelope::from_message(&message)
                .and_then(|envelope| envelope.encrypt(&peer))
            {
                Ok(bytes) => sync.send_message(&peer, &message.id, &bytes).await,
                Err(e) => {
                    tracing::warn!(error = %e, message_id = %message.id, "envelope build failed");
                    DeliveryStatus::Failed
                }
            };

            let db = db.lock().await;
            if let Err(e) = db.update_message_status(&message.id, status) {
                tracing::error!(error = %e, message_id = %message.id, "status update failed");
            }
            refresh_latest_cell(&latest, &db, &identity, &message.chat_id);
            drop(db);

            let _ = events_tx.send(MessageEvent::StatusChanged {
                chat_id: message.chat_id,
                message_id: message.id,
                status,
            });
        });
    }
}

/// Push the store's newest message for `chat_id` into its watch cell, if
/// anything ever subscribed to it.
fn refresh_latest_cell(cells: &LatestCells, db: &Database, identity: &Identity, chat_id: &str) {
    let latest = match db.latest_message(identity, chat_id) {
        Ok(latest) => latest,
        Err(e) => {
            tracing::warn!(error = %e, chat_id, "latest-message lookup failed");
            return;
        }
    };
    let cells = cells.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(cell) = cells.get(chat_id) {
        cell.send_replace(latest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct ScriptedSync {
        messages: StdMutex<Vec<RemoteMessage>>,
        send_result: DeliveryStatus,
        sent_ids: StdMutex<Vec<String>>,
        fetch_windows: StdMutex<Vec<i64>>,
    }

    impl ScriptedSync {
        fn new(send_result: DeliveryStatus) -> Self {
            Self {
                messages: StdMutex::new(Vec::new()),
                send_result,
                sent_ids: StdMutex::new(Vec::new()),
                fetch_windows: StdMutex::new(Vec::new()),
            }
        }

        fn script(&self, messages: Vec<RemoteMessage>) {
            *self.messages.lock().unwrap() = messages;
        }
    }

    #[async_trait::async_trait]
    impl RemoteSync for ScriptedSync {
        async fn fetch_messages(
            &self,
            _peer: &PublicKey,
            _limit: u32,
            since: i64,
        ) -> crate::error::Result<Vec<RemoteMessage>> {
            self.fetch_windows.lock().unwrap().push(since);
            Ok(self.messages.lock().unwrap().clone())
        }

        async fn send_message(
            &self,
            _peer: &PublicKey,
            message_id: &str,
            _envelope: &[u8],
        ) -> DeliveryStatus {
            self.sent_ids.lock().unwrap().push(message_id.to_string());
            self.send_result
        }

        async fn fetch_updates(&self, _since: i64) -> crate::error::Result<Vec<Update>> {
            Ok(Vec::new())
        }

        async fn register(&self) -> crate::error::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<Mutex<Database>>,
        alice: Identity,
        chat: Chat,
        sync: Arc<ScriptedSync>,
        service: MessageService,
    }

    async fn fixture(send_result: DeliveryStatus) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let database = Database::open_at(&dir.path().join("test.db")).unwrap();
        let alice = Identity::generate("alice");
        database.insert_identity(&alice).unwrap();
        let chat = database
            .ensure_chat(&alice, &Identity::generate("bob").public_key())
            .unwrap();

        let db = Arc::new(Mutex::new(database));
        let sync = Arc::new(ScriptedSync::new(send_result));
        let service = MessageService::new(
            Arc::clone(&db),
            alice.clone(),
            Arc::clone(&sync) as Arc<dyn RemoteSync>,
        );
        Fixture {
            _dir: dir,
            db,
            alice,
            chat,
            sync,
            service,
        }
    }

    fn peer_record(content: &str, timestamp: i64) -> RemoteMessage {
        RemoteMessage {
            sender_fingerprint: "peer-fingerprint".into(),
            envelope: TransportEnvelope::new(content, timestamp),
        }
    }

    fn own_record(fx: &Fixture, content: &str, timestamp: i64) -> RemoteMessage {
        RemoteMessage {
            sender_fingerprint: fx.alice.fingerprint(),
            envelope: TransportEnvelope::new(content, timestamp),
        }
    }

    async fn all_messages(fx: &Fixture) -> Vec<Message> {
        let db = fx.db.lock().await;
        db.get_all_messages(&fx.alice, &fx.chat.id).unwrap()
    }

    #[tokio::test]
    async fn merge_is_idempotent() {
        let fx = fixture(DeliveryStatus::Delivered).await;
        let batch = vec![peer_record("hi", 100), peer_record("there", 200)];

        let first = fx.service.merge_remote(&fx.chat, batch.clone()).await.unwrap();
        let second = fx.service.merge_remote(&fx.chat, batch).await.unwrap();

        assert_eq!(first, 2);
        assert_eq!(second, 0);
        assert_eq!(all_messages(&fx).await.len(), 2);
    }

    #[tokio::test]
    async fn same_timestamp_collapses_to_one_message() {
        let fx = fixture(DeliveryStatus::Delivered).await;
        fx.service
            .merge_remote(&fx.chat, vec![peer_record("first", 100)])
            .await
            .unwrap();
        fx.service
            .merge_remote(&fx.chat, vec![peer_record("different body", 100)])
            .await
            .unwrap();

        let all = all_messages(&fx).await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].content, "first");
    }

    #[tokio::test]
    async fn own_echo_upgrades_sent_to_delivered() {
        let fx = fixture(DeliveryStatus::Delivered).await;
        let local = fx
            .service
            .send_message(&fx.chat.id, "hello", None)
            .await
            .unwrap();

        fx.service
            .merge_remote(&fx.chat, vec![own_record(&fx, "hello", local.timestamp_ms)])
            .await
            .unwrap();

        let db = fx.db.lock().await;
        let stored = db.get_message(&fx.alice, &local.id).unwrap();
        assert_eq!(stored.status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn incoming_is_never_overwritten() {
        let fx = fixture(DeliveryStatus::Delivered).await;
        fx.service
            .merge_remote(&fx.chat, vec![peer_record("from bob", 100)])
            .await
            .unwrap();

        // same timestamp now claimed as our own delivered echo
        fx.service
            .merge_remote(&fx.chat, vec![own_record(&fx, "from bob", 100)])
            .await
            .unwrap();

        let all = all_messages(&fx).await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, DeliveryStatus::Incoming);
    }

    #[tokio::test]
    async fn remote_incoming_does_not_downgrade() {
        let fx = fixture(DeliveryStatus::Delivered).await;
        let local = fx
            .service
            .send_message(&fx.chat.id, "hello", None)
            .await
            .unwrap();

        fx.service
            .merge_remote(&fx.chat, vec![peer_record("hello", local.timestamp_ms)])
            .await
            .unwrap();

        let db = fx.db.lock().await;
        let stored = db.get_message(&fx.alice, &local.id).unwrap();
        assert_ne!(stored.status, DeliveryStatus::Incoming);
    }

    #[tokio::test]
    async fn send_resolves_to_delivered() {
        let fx = fixture(DeliveryStatus::Delivered).await;
        let mut events = fx.service.subscribe();

        let message = fx
            .service
            .send_message(&fx.chat.id, "salut", None)
            .await
            .unwrap();
        assert_eq!(message.status, DeliveryStatus::Sent);
        assert!(message.seq > 0);

        // first event is the optimistic insert, second the delivery result
        let first = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, MessageEvent::New(_)));

        let second = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        match second {
            MessageEvent::StatusChanged { status, .. } => {
                assert_eq!(status, DeliveryStatus::Delivered)
            }
            other => panic!("unexpected event {other:?}"),
        }

        assert_eq!(fx.sync.sent_ids.lock().unwrap().as_slice(), [message.id]);
    }

    #[tokio::test]
    async fn failed_send_can_be_resent() {
        let fx = fixture(DeliveryStatus::Failed).await;
        let mut events = fx.service.subscribe();
        let message = fx
            .service
            .send_message(&fx.chat.id, "salut", None)
            .await
            .unwrap();

        // wait for the failed delivery to land
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(
                event,
                MessageEvent::StatusChanged {
                    status: DeliveryStatus::Failed,
                    ..
                }
            ) {
                break;
            }
        }

        fx.service.resend_message(&message.id).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            MessageEvent::StatusChanged { status, .. } => {
                assert_eq!(status, DeliveryStatus::Sent)
            }
            other => panic!("unexpected event {other:?}"),
        }

        // the second delivery runs in the background, wait for its outcome
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(
                event,
                MessageEvent::StatusChanged {
                    status: DeliveryStatus::Failed,
                    ..
                }
            ) {
                break;
            }
        }
        assert_eq!(fx.sync.sent_ids.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delivered_message_can_be_resent() {
        let fx = fixture(DeliveryStatus::Delivered).await;
        let mut events = fx.service.subscribe();
        let message = fx
            .service
            .send_message(&fx.chat.id, "salut", None)
            .await
            .unwrap();

        // wait for the first delivery to land
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(
                event,
                MessageEvent::StatusChanged {
                    status: DeliveryStatus::Delivered,
                    ..
                }
            ) {
                break;
            }
        }

        fx.service.resend_message(&message.id).await.unwrap();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(
                event,
                MessageEvent::StatusChanged {
                    status: DeliveryStatus::Delivered,
                    ..
                }
            ) {
                break;
            }
        }
        assert_eq!(fx.sync.sent_ids.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn resend_skips_incoming() {
        let fx = fixture(DeliveryStatus::Delivered).await;
        fx.service
            .merge_remote(&fx.chat, vec![peer_record("from bob", 100)])
            .await
            .unwrap();
        let incoming = all_messages(&fx).await.remove(0);

        fx.service.resend_message(&incoming.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.sync.sent_ids.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_messages_folds_in_remote_page() {
        let fx = fixture(DeliveryStatus::Delivered).await;
        fx.sync
            .script(vec![peer_record("a", 100), peer_record("b", 200)]);

        // local page is empty, so the server is consulted even without refresh
        let page = fx
            .service
            .get_messages(&fx.chat.id, 10, 0, false)
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].content, "b");
        assert_eq!(page[0].status, DeliveryStatus::Incoming);
    }

    #[tokio::test]
    async fn populated_page_skips_fetch_without_refresh() {
        let fx = fixture(DeliveryStatus::Delivered).await;
        fx.service
            .merge_remote(&fx.chat, vec![peer_record("local", 100)])
            .await
            .unwrap();
        fx.sync
            .script(vec![peer_record("local", 100), peer_record("newer", 200)]);

        let stale = fx
            .service
            .get_messages(&fx.chat.id, 10, 0, false)
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);

        let fresh = fx
            .service
            .get_messages(&fx.chat.id, 10, 0, true)
            .await
            .unwrap();
        assert_eq!(fresh.len(), 2);
    }

    #[tokio::test]
    async fn refresh_window_starts_at_newest_local_message() {
        let fx = fixture(DeliveryStatus::Delivered).await;
        fx.service
            .merge_remote(&fx.chat, vec![peer_record("older", 100)])
            .await
            .unwrap();

        fx.service
            .get_messages(&fx.chat.id, 10, 0, true)
            .await
            .unwrap();
        assert_eq!(fx.sync.fetch_windows.lock().unwrap().as_slice(), [100]);
    }

    #[tokio::test]
    async fn empty_chat_fetches_from_the_start_of_time() {
        let fx = fixture(DeliveryStatus::Delivered).await;
        fx.service
            .get_messages(&fx.chat.id, 10, 0, false)
            .await
            .unwrap();
        assert_eq!(fx.sync.fetch_windows.lock().unwrap().as_slice(), [0]);
    }

    #[tokio::test]
    async fn latest_cell_follows_activity() {
        let fx = fixture(DeliveryStatus::Delivered).await;
        let mut latest = fx.service.subscribe_latest(&fx.chat.id).await.unwrap();
        assert!(latest.borrow().is_none());

        fx.service
            .merge_remote(&fx.chat, vec![peer_record("hi", 100)])
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), latest.changed())
            .await
            .unwrap()
            .unwrap();
        let preview = latest.borrow_and_update().clone().unwrap();
        assert_eq!(preview.content, "hi");
        assert_eq!(preview.status, DeliveryStatus::Incoming);
    }

    #[tokio::test]
    async fn incoming_update_creates_chat_and_message() {
        let fx = fixture(DeliveryStatus::Delivered).await;
        let carol = Identity::generate("carol");

        let envelope = TransportEnvelope::new("nouveau", 500);
        let encrypted = envelope.encrypt(&fx.alice.public_key()).unwrap();
        let update = Update {
            pubkey_bytes: carol.public_key().as_bytes().to_vec(),
            envelope_bytes: encrypted,
        };

        fx.service.incoming_update(update).await.unwrap();

        let db = fx.db.lock().await;
        let chat = db
            .get_chat_by_fingerprint(&fx.alice, &carol.fingerprint())
            .unwrap()
            .expect("chat should exist");
        let messages = db.get_all_messages(&fx.alice, &chat.id).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "nouveau");
        assert_eq!(messages[0].status, DeliveryStatus::Incoming);
    }

    #[tokio::test]
    async fn media_travels_with_incoming_message() {
        let fx = fixture(DeliveryStatus::Delivered).await;
        let mut envelope = TransportEnvelope::new("photo", 700);
        envelope.media_mime = Some("image/png".into());
        envelope.media_size = Some(3);
        envelope.media_bytes = Some(vec![7, 8, 9]);

        fx.service
            .merge_remote(
                &fx.chat,
                vec![RemoteMessage {
                    sender_fingerprint: "peer".into(),
                    envelope,
                }],
            )
            .await
            .unwrap();

        let page = fx
            .service
            .get_messages(&fx.chat.id, 10, 0, true)
            .await
            .unwrap();
        let media = page[0].media.as_ref().expect("media should hydrate");
        assert_eq!(media.mime_type, "image/png");
        assert_eq!(media.content, Some(vec![7, 8, 9]));
    }
}
