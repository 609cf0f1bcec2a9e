//! Database schema for the SQLite backend.

/// Applied idempotently on every open.
///
/// `messages.internal_id` is the storage ordering key: AUTOINCREMENT keeps
/// it monotonic in insertion order, and ingestion order is time order.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS datasets (
    uuid TEXT PRIMARY KEY,
    alias TEXT NOT NULL,
    source_type TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
    ds_uuid TEXT NOT NULL REFERENCES datasets(uuid),
    id INTEGER NOT NULL,
    first_name TEXT,
    last_name TEXT,
    username TEXT,
    phone_number TEXT,
    is_myself INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (ds_uuid, id)
);

CREATE TABLE IF NOT EXISTS chats (
    ds_uuid TEXT NOT NULL REFERENCES datasets(uuid),
    id INTEGER NOT NULL,
    name TEXT,
    type TEXT NOT NULL,
    img_path TEXT,
    PRIMARY KEY (ds_uuid, id)
);

CREATE TABLE IF NOT EXISTS chat_members (
    ds_uuid TEXT NOT NULL,
    chat_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    ord INTEGER NOT NULL,
    PRIMARY KEY (ds_uuid, chat_id, user_id),
    FOREIGN KEY (ds_uuid, chat_id) REFERENCES chats(ds_uuid, id)
);

CREATE TABLE IF NOT EXISTS messages (
    internal_id INTEGER PRIMARY KEY AUTOINCREMENT,
    ds_uuid TEXT NOT NULL,
    chat_id INTEGER NOT NULL,
    source_id INTEGER,
    timestamp INTEGER NOT NULL,
    from_id INTEGER NOT NULL,
    text_json TEXT NOT NULL,
    searchable_string TEXT NOT NULL,
    typed_json TEXT NOT NULL,
    FOREIGN KEY (ds_uuid, chat_id) REFERENCES chats(ds_uuid, id)
);

CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages (ds_uuid, chat_id, internal_id);

-- Source ids are dataset-stable and must be unique within a chat; NULLs
-- (messages the export assigned no id) are exempt.
CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_source ON messages (ds_uuid, chat_id, source_id);
"#;
