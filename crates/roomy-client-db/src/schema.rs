//! Relational schema of the materialized projection.
//!
//! # Data Model Overview
//!
//! Everything materialized from a stream is an **entity** plus
//! **components** (one table per kind, keyed by entity id) plus labeled
//! **edges** between entities. The `events` table keeps every applied
//! event for dependency resolution and stash replay.
//!
//! ## Key Concepts
//!
//! - **Entity**: the universal node: room, message, user, media,
//!   reaction. Owned by its stream; owns its components (cascade).
//! - **`sort_idx`**: a fractional-index string decoupling displayed
//!   order from the immutable ulid. Every materialized entity gets one;
//!   display order is `ORDER BY sort_idx, id`.
//! - **Edges**: directed `(head, tail, label)` relations with a closed
//!   label set and label-specific JSON payload (e.g. `member.can`).
//! - **Stash**: an `events` row with `applied = 0` waiting for the
//!   entities listed in its `depends_on` JSON array.
//!
//! ## Invariants
//!
//! - `entities.id` is globally unique (ulids; derived ids use reserved
//!   timestamps 0 and 1).
//! - `events.applied = 1` iff every dependency had been applied.
//! - `comp_space.backfilled_to` is monotone non-decreasing.

use roomy_store::{Statement, Store, StoreResult};

/// Streams with a different schema version force a local cache wipe.
pub const STREAM_SCHEMA_VERSION: &str = "v2";

/// Tables dropped on a schema-version wipe, children first so foreign
/// keys never dangle mid-wipe.
pub const ALL_TABLES: &[&str] = &[
    "comp_room",
    "comp_space",
    "comp_info",
    "comp_content",
    "comp_image",
    "comp_video",
    "comp_file",
    "comp_link",
    "comp_reaction",
    "comp_comment",
    "comp_user",
    "comp_last_read",
    "comp_override_meta",
    "comp_page_edits",
    "edges",
    "events",
    "entities",
];

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    id TEXT PRIMARY KEY,
    stream_id TEXT NOT NULL,
    parent TEXT,
    sort_idx TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_entities_stream ON entities(stream_id);
CREATE INDEX IF NOT EXISTS idx_entities_sort ON entities(stream_id, sort_idx, id);
CREATE INDEX IF NOT EXISTS idx_entities_parent ON entities(parent);

CREATE TABLE IF NOT EXISTS comp_room (
    entity TEXT PRIMARY KEY REFERENCES entities(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    name TEXT,
    deleted INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS comp_space (
    entity TEXT PRIMARY KEY REFERENCES entities(id) ON DELETE CASCADE,
    space_id TEXT NOT NULL UNIQUE,
    hidden INTEGER NOT NULL DEFAULT 0,
    backfilled_to INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS comp_info (
    entity TEXT PRIMARY KEY REFERENCES entities(id) ON DELETE CASCADE,
    name TEXT,
    description TEXT,
    avatar TEXT,
    sidebar_json TEXT
);

CREATE TABLE IF NOT EXISTS comp_content (
    entity TEXT PRIMARY KEY REFERENCES entities(id) ON DELETE CASCADE,
    data BLOB NOT NULL,
    mime_type TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS comp_image (
    entity TEXT PRIMARY KEY REFERENCES entities(id) ON DELETE CASCADE,
    source TEXT NOT NULL,
    width INTEGER,
    height INTEGER,
    alt TEXT
);

CREATE TABLE IF NOT EXISTS comp_video (
    entity TEXT PRIMARY KEY REFERENCES entities(id) ON DELETE CASCADE,
    source TEXT NOT NULL,
    width INTEGER,
    height INTEGER
);

CREATE TABLE IF NOT EXISTS comp_file (
    entity TEXT PRIMARY KEY REFERENCES entities(id) ON DELETE CASCADE,
    source TEXT NOT NULL,
    name TEXT,
    mime_type TEXT,
    size INTEGER
);

CREATE TABLE IF NOT EXISTS comp_link (
    entity TEXT PRIMARY KEY REFERENCES entities(id) ON DELETE CASCADE,
    url TEXT NOT NULL,
    title TEXT,
    description TEXT
);

CREATE TABLE IF NOT EXISTS comp_reaction (
    entity TEXT PRIMARY KEY REFERENCES entities(id) ON DELETE CASCADE,
    target TEXT NOT NULL,
    emoji TEXT NOT NULL,
    reactor TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_comp_reaction_target ON comp_reaction(target);

CREATE TABLE IF NOT EXISTS comp_comment (
    entity TEXT PRIMARY KEY REFERENCES entities(id) ON DELETE CASCADE,
    target TEXT NOT NULL,
    snippet_start INTEGER,
    snippet_end INTEGER
);

CREATE TABLE IF NOT EXISTS comp_user (
    entity TEXT PRIMARY KEY REFERENCES entities(id) ON DELETE CASCADE,
    did TEXT NOT NULL,
    handle TEXT
);
CREATE INDEX IF NOT EXISTS idx_comp_user_by_did ON comp_user(did);

CREATE TABLE IF NOT EXISTS comp_last_read (
    entity TEXT PRIMARY KEY REFERENCES entities(id) ON DELETE CASCADE,
    room TEXT NOT NULL UNIQUE,
    last_read_id TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS comp_override_meta (
    entity TEXT PRIMARY KEY REFERENCES entities(id) ON DELETE CASCADE,
    author_name TEXT,
    author_avatar TEXT,
    timestamp_ms INTEGER
);

CREATE TABLE IF NOT EXISTS comp_page_edits (
    entity TEXT PRIMARY KEY REFERENCES entities(id) ON DELETE CASCADE,
    edit_count INTEGER NOT NULL DEFAULT 0,
    last_edited_at INTEGER
);

CREATE TABLE IF NOT EXISTS edges (
    head TEXT NOT NULL,
    tail TEXT NOT NULL,
    label TEXT NOT NULL CHECK (label IN (
        'member', 'author', 'reply', 'embed', 'pin', 'subscribe', 'ban',
        'link', 'reorder', 'source', 'avatar', 'parent', 'child'
    )),
    payload_json TEXT,
    PRIMARY KEY (head, tail, label)
);
CREATE INDEX IF NOT EXISTS idx_edges_tail ON edges(tail, label);

CREATE TABLE IF NOT EXISTS events (
    stream_id TEXT NOT NULL,
    idx INTEGER NOT NULL,
    user TEXT NOT NULL,
    entity_ulid TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    applied INTEGER NOT NULL DEFAULT 0,
    depends_on TEXT,
    error TEXT,
    PRIMARY KEY (stream_id, idx)
);
CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_ulid);
CREATE INDEX IF NOT EXISTS idx_events_unapplied ON events(applied) WHERE applied = 0;
"#;

pub(crate) async fn create(store: &Store) -> StoreResult<()> {
    store.with_write(|tx| {
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            tx.execute(&Statement::new(statement.to_owned(), vec![]))?;
        }
        Ok(())
    })
    .await
}

/// Drop every materialized table. Used by the schema-version wipe; the
/// caller re-creates the schema and re-backfills from the transport.
pub(crate) async fn drop_all(store: &Store) -> StoreResult<()> {
    store.with_write(|tx| {
        for table in ALL_TABLES {
            tx.execute(&Statement::new(format!("DROP TABLE IF EXISTS {table}"), vec![]))?;
        }
        Ok(())
    })
    .await
}
