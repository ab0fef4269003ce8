/// Complete schema for the indexed link cache.
///
/// Uses CREATE TABLE/INDEX IF NOT EXISTS for idempotent execution.
/// Timestamps are Unix seconds.
pub const INITIAL_SCHEMA: &str = r#"
-- One row per link, keyed by (source, target, type)
CREATE TABLE IF NOT EXISTS note_links (
    id INTEGER PRIMARY KEY,
    source_entry_id TEXT NOT NULL,
    target_entry_id TEXT NOT NULL,
    link_type TEXT NOT NULL,
    description TEXT,
    created_at INTEGER NOT NULL,
    created_by TEXT NOT NULL,
    auto_detected INTEGER,
    match_type TEXT,
    UNIQUE (source_entry_id, target_entry_id, link_type),
    CHECK (source_entry_id <> target_entry_id)
);

-- Deletions performed against the cache, consumed by pull
CREATE TABLE IF NOT EXISTS link_tombstones (
    source_entry_id TEXT NOT NULL,
    target_entry_id TEXT NOT NULL,
    link_type TEXT NOT NULL,
    deleted_at INTEGER NOT NULL,
    PRIMARY KEY (source_entry_id, target_entry_id, link_type)
);

-- Sync bookkeeping: last successful push per note
CREATE TABLE IF NOT EXISTS note_sync_state (
    entry_id TEXT PRIMARY KEY,
    last_synced_at INTEGER NOT NULL
);

-- Indexes for outgoing and incoming lookups
CREATE INDEX IF NOT EXISTS idx_note_links_source ON note_links(source_entry_id);
CREATE INDEX IF NOT EXISTS idx_note_links_target ON note_links(target_entry_id);
CREATE INDEX IF NOT EXISTS idx_note_links_type ON note_links(link_type);
"#;
