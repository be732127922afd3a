//! Identity and chat directories.
//!
//! Thin async facades over the store: the identity directory manages local
//! keypairs and the active-identity pointer, the chat directory keeps a
//! `watch` snapshot of the chat list so UIs can observe it without polling.

use std::sync::Arc;

use ombre_shared::{Identity, PublicKey};
use ombre_store::{Chat, Database, IdentityRecord};
use tokio::sync::{watch, Mutex};

use crate::error::{ClientError, Result};

/// Manages local identities.
#[derive(Clone)]
pub struct IdentityDirectory {
    db: Arc<Mutex<Database>>,
}

impl IdentityDirectory {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }

    /// Generate a fresh identity and make it the active one.
    pub async fn create(&self, id: &str) -> Result<Identity> {
        let identity = Identity::generate(id);
        let db = self.db.lock().await;
        db.insert_identity(&identity)?;
        db.set_current_identity(id)?;
        tracing::info!(id, fingerprint = %identity.fingerprint(), "created identity");
        Ok(identity)
    }

    pub async fn list(&self) -> Result<Vec<IdentityRecord>> {
        Ok(self.db.lock().await.list_identities()?)
    }

    pub async fn current(&self) -> Result<Option<Identity>> {
        Ok(self.db.lock().await.current_identity()?)
    }

    pub async fn select(&self, id: &str) -> Result<Identity> {
        let db = self.db.lock().await;
        db.set_current_identity(id)?;
        Ok(db.get_identity(id)?)
    }

    /// Replace the keypair of an existing identity, discarding its chats.
    pub async fn replace_key(&self, id: &str) -> Result<Identity> {
        let identity = Identity::generate(id);
        self.db.lock().await.replace_identity_key(&identity)?;
        tracing::info!(id, fingerprint = %identity.fingerprint(), "replaced identity key");
        Ok(identity)
    }

    /// PEM rendering of an identity's public key, for sharing out of band.
    pub async fn export_pem(&self, id: &str) -> Result<String> {
        let identity = self.db.lock().await.get_identity(id)?;
        Ok(identity.public_key().to_pem())
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.db.lock().await.delete_identity(id)?)
    }
}

/// Manages the chats of one identity and publishes list snapshots.
pub struct ChatDirectory {
    db: Arc<Mutex<Database>>,
    identity: Identity,
    chats_tx: watch::Sender<Vec<Chat>>,
}

impl ChatDirectory {
    pub async fn new(db: Arc<Mutex<Database>>, identity: Identity) -> Result<Self> {
        let initial = db.lock().await.list_chats(&identity)?;
        let (chats_tx, _) = watch::channel(initial);
        Ok(Self {
            db,
            identity,
            chats_tx,
        })
    }

    /// Observe the chat list.  The receiver always holds the latest
    /// snapshot, most recently active chat first.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Chat>> {
        self.chats_tx.subscribe()
    }

    /// Reload the snapshot from the store.  Called after every mutation and
    /// by the message layer when activity reorders chats.
    pub async fn refresh(&self) -> Result<()> {
        let chats = self.db.lock().await.list_chats(&self.identity)?;
        self.chats_tx.send_replace(chats);
        Ok(())
    }

    /// Find or create the chat for a remote public key.
    pub async fn ensure_chat(&self, pubkey: &PublicKey) -> Result<Chat> {
        let chat = self.db.lock().await.ensure_chat(&self.identity, pubkey)?;
        self.refresh().await?;
        Ok(chat)
    }

    /// Explicit creation, used by the key-import flow.  If the key is
    /// already known the existing chat is reused; a provided name replaces
    /// the default fingerprint name either way.
    pub async fn add_chat(&self, pubkey: &PublicKey, name: Option<&str>) -> Result<Chat> {
        let mut chat = {
            let db = self.db.lock().await;
            let chat = db.ensure_chat(&self.identity, pubkey)?;
            if let Some(name) = name {
                db.rename_chat(&self.identity, &chat.id, name)?;
            }
            chat
        };
        if let Some(name) = name {
            chat.name = name.to_string();
        }
        self.refresh().await?;
        Ok(chat)
    }

    pub async fn get(&self, chat_id: &str) -> Result<Chat> {
        let db = self.db.lock().await;
        match db.get_chat(chat_id) {
            Ok(chat) => Ok(chat),
            Err(ombre_store::StoreError::NotFound) => {
                Err(ClientError::ChatNotFound(chat_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn rename(&self, chat_id: &str, name: &str) -> Result<()> {
        self.db
            .lock()
            .await
            .rename_chat(&self.identity, chat_id, name)?;
        self.refresh().await
    }

    pub async fn delete(&self, chat_id: &str) -> Result<bool> {
        let deleted = self.db.lock().await.delete_chat(chat_id)?;
        self.refresh().await?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_db() -> (tempfile::TempDir, Arc<Mutex<Database>>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        (dir, Arc::new(Mutex::new(db)))
    }

    #[tokio::test]
    async fn create_selects_identity() {
        let (_dir, db) = open_db().await;
        let identities = IdentityDirectory::new(db);

        let alice = identities.create("alice").await.unwrap();
        let current = identities.current().await.unwrap().unwrap();
        assert_eq!(current.id(), "alice");
        assert_eq!(current.fingerprint(), alice.fingerprint());
    }

    #[tokio::test]
    async fn chat_snapshot_tracks_mutations() {
        let (_dir, db) = open_db().await;
        let identities = IdentityDirectory::new(Arc::clone(&db));
        let alice = identities.create("alice").await.unwrap();

        let chats = ChatDirectory::new(db, alice).await.unwrap();
        let rx = chats.subscribe();
        assert!(rx.borrow().is_empty());

        let bob = Identity::generate("bob").public_key();
        let chat = chats.ensure_chat(&bob).await.unwrap();
        assert_eq!(rx.borrow().len(), 1);

        chats.rename(&chat.id, "Bob").await.unwrap();
        assert_eq!(rx.borrow()[0].name, "Bob");

        chats.delete(&chat.id).await.unwrap();
        assert!(rx.borrow().is_empty());
    }

    #[tokio::test]
    async fn add_chat_names_and_dedupes() {
        let (_dir, db) = open_db().await;
        let identities = IdentityDirectory::new(Arc::clone(&db));
        let alice = identities.create("alice").await.unwrap();
        let chats = ChatDirectory::new(db, alice).await.unwrap();

        let bob = Identity::generate("bob").public_key();
        let named = chats.add_chat(&bob, Some("Bob")).await.unwrap();
        assert_eq!(named.name, "Bob");

        // importing the same key again reuses the chat
        let again = chats.add_chat(&bob, None).await.unwrap();
        assert_eq!(again.id, named.id);
        assert_eq!(chats.subscribe().borrow().len(), 1);
    }

    #[tokio::test]
    async fn get_missing_chat_is_descriptive() {
        let (_dir, db) = open_db().await;
        let identities = IdentityDirectory::new(Arc::clone(&db));
        let alice = identities.create("alice").await.unwrap();
        let chats = ChatDirectory::new(db, alice).await.unwrap();

        assert!(matches!(
            chats.get("missing").await,
            Err(ClientError::ChatNotFound(_))
        ));
    }
}
