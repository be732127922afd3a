//! # ombre-store
//!
//! Local encrypted storage for the Ombre messaging client, backed by SQLite.
//!
//! Message bodies, chat names and media are encrypted at the application
//! layer with the owning identity's storage key before they touch the
//! database; delivery status and sequence numbers stay in the clear so they
//! can be queried.  The crate exposes a synchronous [`Database`] handle that
//! wraps a `rusqlite::Connection` and provides typed CRUD helpers for every
//! domain model.

pub mod chats;
pub mod config;
pub mod database;
pub mod identities;
pub mod media;
pub mod messages;
pub mod migrations;
pub mod models;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
