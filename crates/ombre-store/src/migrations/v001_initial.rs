//! v001 -- Initial schema creation.
//!
//! Creates the five core tables: `identities`, `chats`, `messages`, `media`,
//! and `config`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Identities (local keypairs)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS identities (
    id         TEXT PRIMARY KEY NOT NULL,   -- user-chosen identifier
    secret_key BLOB NOT NULL,               -- raw 32-byte Ed25519 seed
    keypic     BLOB,                        -- optional fingerprint image
    created_at TEXT NOT NULL                -- ISO-8601 / RFC-3339
);

-- ----------------------------------------------------------------
-- Chats (one per remote public key, per identity)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chats (
    id          TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    identity_id TEXT NOT NULL,              -- FK -> identities(id)
    seq         INTEGER NOT NULL,           -- per-identity creation order
    name        BLOB NOT NULL,              -- encrypted display name
    pubkey      BLOB NOT NULL,              -- raw 32-byte Ed25519 pubkey
    fingerprint TEXT NOT NULL,              -- hex SHA-256 of pubkey
    keypic      BLOB,                       -- optional fingerprint image
    created_at  TEXT NOT NULL,

    FOREIGN KEY (identity_id) REFERENCES identities(id) ON DELETE CASCADE,
    UNIQUE (identity_id, fingerprint)
);

CREATE INDEX IF NOT EXISTS idx_chats_identity ON chats(identity_id);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    chat_id         TEXT NOT NULL,              -- FK -> chats(id)
    chat_seq        INTEGER NOT NULL,           -- per-chat sequence, stride 10
    global_seq      INTEGER NOT NULL,           -- database-wide sequence, stride 10
    content         BLOB NOT NULL,              -- encrypted envelope (body + timestamp)
    delivery_status TEXT NOT NULL,              -- SENT / DELIVERED / FAILED / INCOMING

    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_chat_seq
    ON messages(chat_id, chat_seq DESC);

-- ----------------------------------------------------------------
-- Media (attachment metadata; content lives in encrypted files)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS media (
    id          TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    identity_id TEXT NOT NULL,              -- FK -> identities(id)
    metadata    BLOB NOT NULL,              -- encrypted mime + size

    FOREIGN KEY (identity_id) REFERENCES identities(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Config (string key/value pairs, e.g. current identity, sync cursor)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS config (
    key   TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
