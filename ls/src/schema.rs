//! SQLite schema and connection setup

use rusqlite::{Connection, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    stream TEXT NOT NULL,
    id_ms INTEGER NOT NULL,
    id_seq INTEGER NOT NULL,
    fields_json TEXT NOT NULL,
    PRIMARY KEY (stream, id_ms, id_seq)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS stream_meta (
    stream TEXT PRIMARY KEY,
    last_ms INTEGER NOT NULL,
    last_seq INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS groups (
    stream TEXT NOT NULL,
    name TEXT NOT NULL,
    last_ms INTEGER NOT NULL,
    last_seq INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (stream, name)
);

CREATE TABLE IF NOT EXISTS pending (
    stream TEXT NOT NULL,
    group_name TEXT NOT NULL,
    id_ms INTEGER NOT NULL,
    id_seq INTEGER NOT NULL,
    consumer TEXT NOT NULL,
    delivered_at_ms INTEGER NOT NULL,
    delivery_count INTEGER NOT NULL,
    PRIMARY KEY (stream, group_name, id_ms, id_seq)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_pending_consumer
    ON pending (stream, group_name, consumer, id_ms, id_seq);
"#;

/// Apply connection pragmas
pub fn configure(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

/// Create tables if they do not exist yet
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)
}
