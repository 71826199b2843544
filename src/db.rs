use anyhow::Context;
use rusqlite::Connection;
use std::path::Path;

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        // Enable WAL mode for crash safety
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    fn migrate(&self) -> anyhow::Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }
}

const SCHEMA: &str = r#"
-- Channel candidates, keyed by node pubkey
CREATE TABLE IF NOT EXISTS candidates (
    pubkey TEXT NOT NULL PRIMARY KEY,
    alias TEXT NOT NULL DEFAULT '',
    sources TEXT NOT NULL,              -- JSON array of discovery tags
    added_at REAL NOT NULL,
    channels INTEGER NOT NULL DEFAULT 0,
    capacity_sats INTEGER NOT NULL DEFAULT 0,
    last_update REAL,
    distance INTEGER,
    min_channel_size INTEGER
);

-- Prior channel lifecycles per candidate, deduplicated by channel id
CREATE TABLE IF NOT EXISTS candidate_history (
    channel_id TEXT NOT NULL PRIMARY KEY,
    pubkey TEXT NOT NULL,
    opened_at REAL NOT NULL,
    closed_at REAL,
    capacity_sats INTEGER NOT NULL,
    fees_earned_msat INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_candidate_history_pubkey
    ON candidate_history(pubkey);

-- Append-only rejection log per candidate
CREATE TABLE IF NOT EXISTS rejections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pubkey TEXT NOT NULL,
    rejected_at REAL NOT NULL,
    reason TEXT NOT NULL,
    details TEXT,
    min_channel_size INTEGER
);
CREATE INDEX IF NOT EXISTS idx_rejections_pubkey
    ON rejections(pubkey);

-- Batch execution audit trail, one row per attempt
CREATE TABLE IF NOT EXISTS open_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    executed_at REAL NOT NULL,
    plan_json TEXT NOT NULL,
    results_json TEXT NOT NULL
);
"#;
