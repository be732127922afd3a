//! # ombre-client
//!
//! The client core of the Ombre messenger: wires the encrypted store, the
//! REST sync client and the realtime channel into one [`ClientCore`] handle
//! that an application shell can drive.
//!
//! Incoming traffic flows one way: realtime updates and fetched pages are
//! folded into the store by the reconciliation layer, and the store is what
//! the UI reads.  Outgoing messages are written locally first and delivered
//! in the background.

pub mod directory;
pub mod realtime;
pub mod reconcile;
pub mod sync;

mod error;

use std::sync::Arc;

use ombre_shared::Identity;
use ombre_store::{config as store_config, Database};
use tokio::sync::Mutex;
use tracing_subscriber::{fmt, EnvFilter};

pub use directory::{ChatDirectory, IdentityDirectory};
pub use error::ClientError;
pub use realtime::{ChannelEvent, RealtimeChannel};
pub use reconcile::{MessageEvent, MessageService};
pub use sync::{HttpSyncClient, RemoteSync, SyncConfig};

use crate::error::Result;

/// Install the global tracing subscriber.  Call once at startup.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ombre_client=debug,ombre_store=info,warn"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Everything a running client needs, built around one identity.
pub struct ClientCore {
    db: Arc<Mutex<Database>>,
    identity: Identity,
    pub identities: IdentityDirectory,
    pub chats: Arc<ChatDirectory>,
    pub messages: Arc<MessageService>,
    pub realtime: RealtimeChannel,
    sync: Arc<dyn RemoteSync>,
}

impl ClientCore {
    /// Open the default database and build the core around the active
    /// identity.  Fails with [`ClientError::NoIdentity`] until one has been
    /// created via [`IdentityDirectory`].
    pub async fn open(config: SyncConfig) -> Result<Self> {
        let db = Arc::new(Mutex::new(Database::new()?));
        Self::with_database(db, config).await
    }

    /// Build the core on an existing database handle.
    pub async fn with_database(db: Arc<Mutex<Database>>, config: SyncConfig) -> Result<Self> {
        let identity = {
            let guard = db.lock().await;
            guard.current_identity()?.ok_or(ClientError::NoIdentity)?
        };

        let http = HttpSyncClient::new(config.clone(), identity.clone())?;
        let sync: Arc<dyn RemoteSync> = Arc::new(http);
        Self::build(db, config, identity, sync).await
    }

    /// Shared wiring, also used by tests with a fake [`RemoteSync`].
    pub async fn build(
        db: Arc<Mutex<Database>>,
        config: SyncConfig,
        identity: Identity,
        sync: Arc<dyn RemoteSync>,
    ) -> Result<Self> {
        let identities = IdentityDirectory::new(Arc::clone(&db));
        let chats = Arc::new(ChatDirectory::new(Arc::clone(&db), identity.clone()).await?);
        let messages = Arc::new(
            MessageService::new(Arc::clone(&db), identity.clone(), Arc::clone(&sync))
                .with_chat_directory(Arc::clone(&chats)),
        );
        let realtime = RealtimeChannel::new(config, identity.clone(), Arc::clone(&sync));

        Ok(Self {
            db,
            identity,
            identities,
            chats,
            messages,
            realtime,
            sync,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Bring the client online: publish the key, replay the change feed
    /// missed while offline, then keep the realtime channel running.
    pub async fn start(&self) -> Result<()> {
        if let Err(e) = self.sync.register().await {
            tracing::warn!(error = %e, "initial key registration failed");
        }

        if let Err(e) = self.catch_up().await {
            tracing::warn!(error = %e, "change-feed catch-up failed");
        }

        self.spawn_update_pump();
        self.realtime.connect();
        Ok(())
    }

    /// Replay change-feed records newer than the stored cursor.
    pub async fn catch_up(&self) -> Result<usize> {
        let cursor = {
            let db = self.db.lock().await;
            store_config::get_i64(&db, store_config::SYNC_CURSOR)?.unwrap_or(0)
        };

        let updates = self.sync.fetch_updates(cursor).await?;
        let count = updates.len();
        for update in updates {
            if let Err(e) = self.messages.incoming_update(update).await {
                tracing::warn!(error = %e, "dropping unreadable update");
            }
        }

        let db = self.db.lock().await;
        store_config::set_i64(
            &db,
            store_config::SYNC_CURSOR,
            chrono::Utc::now().timestamp_millis(),
        )?;
        drop(db);

        if count > 0 {
            tracing::info!(count, "applied change-feed updates");
            self.chats.refresh().await?;
        }
        Ok(count)
    }

    /// Forward realtime updates into the reconciliation layer and advance
    /// the cursor as they land.
    fn spawn_update_pump(&self) {
        let mut rx = self.realtime.subscribe();
        let messages = Arc::clone(&self.messages);
        let db = Arc::clone(&self.db);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    ChannelEvent::Update(update) => {
                        if let Err(e) = messages.incoming_update(update).await {
                            tracing::warn!(error = %e, "dropping unreadable realtime update");
                            continue;
                        }
                        let db = db.lock().await;
                        let now = chrono::Utc::now().timestamp_millis();
                        if let Err(e) = store_config::set_i64(&db, store_config::SYNC_CURSOR, now)
                        {
                            tracing::error!(error = %e, "cursor update failed");
                        }
                    }
                    ChannelEvent::Connected => tracing::info!("realtime channel up"),
                    ChannelEvent::Disconnected => tracing::info!("realtime channel down"),
                    ChannelEvent::Error(message) => {
                        tracing::warn!(message, "realtime channel error");
                    }
                }
            }
        });
    }
}
