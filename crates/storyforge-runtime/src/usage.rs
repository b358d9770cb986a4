//! SQLite-backed [`UsageSink`] writing to a story's `usage.db` (§4.14),
//! grounded on the original's `usage_db.py`: every provider call the turn
//! pipeline or a background worker makes is logged here for later
//! cost/latency inspection. This crate is the only place in the workspace
//! that owns a concrete `UsageSink` — `storyforge-providers` only defines
//! the trait.

use async_trait::async_trait;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use storyforge_core::Workspace;
use storyforge_providers::{UsageRecord, UsageSink};
use storyforge_types::StoryId;

use crate::error::Result;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS usage_log (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp      TEXT NOT NULL,
    provider       TEXT NOT NULL,
    model          TEXT NOT NULL,
    call_type      TEXT NOT NULL,
    prompt_tokens  INTEGER,
    output_tokens  INTEGER,
    total_tokens   INTEGER,
    branch_id      TEXT NOT NULL,
    elapsed_ms     INTEGER
);
CREATE INDEX IF NOT EXISTS idx_usage_log_call_type ON usage_log(call_type);
";

/// One story's `usage.db`. Holds its own connection and serializes writes
/// behind a mutex since multiple background workers may log concurrently.
pub struct SqliteUsageSink {
    conn: Mutex<Connection>,
}

impl SqliteUsageSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| storyforge_core::CoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path).map_err(|e| crate::error::RuntimeError::ProviderError(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| crate::error::RuntimeError::ProviderError(e.to_string()))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Opens the sink for `story` under `ws`'s conventional path
    /// (`ws.story(story).usage_db()`).
    pub fn for_story(ws: &Workspace, story: &StoryId) -> Result<Self> {
        Self::open(&ws.story(story).usage_db())
    }

    /// Total tokens and calls logged for `call_type`, used by the CLI's
    /// end-of-run usage summary.
    pub fn totals_for_call_type(&self, call_type: &str) -> Result<(i64, i64)> {
        let conn = self.conn.lock().expect("usage sink mutex poisoned");
        let (calls, tokens): (i64, Option<i64>) = conn
            .query_row(
                "SELECT COUNT(*), SUM(total_tokens) FROM usage_log WHERE call_type = ?1",
                [call_type],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| crate::error::RuntimeError::ProviderError(e.to_string()))?;
        Ok((calls, tokens.unwrap_or(0)))
    }
}

#[async_trait]
impl UsageSink for SqliteUsageSink {
    async fn log(&self, _story: &StoryId, record: UsageRecord) {
        let conn = self.conn.lock().expect("usage sink mutex poisoned");
        let _ = conn.execute(
            "INSERT INTO usage_log (timestamp, provider, model, call_type, prompt_tokens, output_tokens, total_tokens, branch_id, elapsed_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                record.timestamp.to_rfc3339(),
                record.provider,
                record.model,
                record.call_type,
                record.prompt_tokens,
                record.output_tokens,
                record.total_tokens,
                record.branch_id.as_str(),
                record.elapsed_ms,
            ],
        );
    }
}
