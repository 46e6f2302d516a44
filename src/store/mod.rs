pub mod analysis;
pub mod content;
pub mod sources;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

pub use analysis::NewRequirement;
pub use sources::Source;

/// Several processes (collector, workers) share the file; wait for locks
/// instead of failing immediately.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Thread-safe SQLite store for sources, content and analysis records
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open or create the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        // journal_mode PRAGMA always returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        // Migrate on the raw connection before it goes behind the async Mutex
        Self::run_migrations(&conn)?;

        info!("Content store initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS collector (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                short_name TEXT NOT NULL UNIQUE,
                long_name TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS source (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                collector_id INTEGER NOT NULL,
                uid TEXT NOT NULL,
                friendly_name TEXT,
                user_note TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                metadata TEXT,
                FOREIGN KEY (collector_id) REFERENCES collector(id)
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_source_uid
                ON source(collector_id, uid);

            CREATE TABLE IF NOT EXISTS content (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id INTEGER NOT NULL,
                collection_time TEXT NOT NULL,
                origin_time TEXT,
                translated INTEGER NOT NULL DEFAULT 0,
                analysed INTEGER NOT NULL DEFAULT 0,
                original_text TEXT,
                translated_text TEXT,
                detected_language TEXT,
                metadata TEXT,
                FOREIGN KEY (source_id) REFERENCES source(id)
            );

            CREATE INDEX IF NOT EXISTS idx_content_source
                ON content(source_id, collection_time);

            CREATE TABLE IF NOT EXISTS analysis_requirement (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id INTEGER NOT NULL,
                llm_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                prompt TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                FOREIGN KEY (source_id) REFERENCES source(id)
            );

            CREATE INDEX IF NOT EXISTS idx_requirement_source
                ON analysis_requirement(source_id);

            CREATE TABLE IF NOT EXISTS analysis_result (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                req_id INTEGER NOT NULL,
                content_id INTEGER NOT NULL,
                analysis_time TEXT NOT NULL,
                output TEXT,
                FOREIGN KEY (req_id) REFERENCES analysis_requirement(id),
                FOREIGN KEY (content_id) REFERENCES content(id)
            );

            -- One result per requirement and message keeps redelivery idempotent
            CREATE UNIQUE INDEX IF NOT EXISTS idx_result_requirement_content
                ON analysis_result(req_id, content_id);
            ",
        )
        .context("Failed to run content store migrations")?;
        Ok(())
    }
}

/// Parse a JSON text column, treating NULL or garbage as absent.
fn parse_metadata(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|json| serde_json::from_str(&json).ok())
}
