use anyhow::{Context, Result};
use rusqlite::OptionalExtension;
use tracing::info;

use super::{parse_metadata, Store};

/// A channel or chat that content is collected from
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub id: i64,
    pub collector_id: i64,
    pub uid: String,
    pub friendly_name: Option<String>,
    pub user_note: Option<String>,
    pub enabled: bool,
    pub metadata: Option<serde_json::Value>,
}

const SOURCE_COLUMNS: &str =
    "id, collector_id, uid, friendly_name, user_note, enabled, metadata";

impl Store {
    /// Register a collector by short name if it is not there yet and return its id.
    pub async fn register_collector(&self, short_name: &str, long_name: &str) -> Result<i64> {
        let conn = self.conn.lock().await;

        let inserted = conn
            .execute(
                "INSERT INTO collector (short_name, long_name, enabled) VALUES (?1, ?2, 1)
                 ON CONFLICT(short_name) DO NOTHING",
                rusqlite::params![short_name, long_name],
            )
            .context("Failed to register collector")?;

        if inserted > 0 {
            info!("No existing collector registration found, registered '{}'", short_name);
        } else {
            info!("Existing collector registration found for '{}'", short_name);
        }

        let id = conn
            .query_row(
                "SELECT id FROM collector WHERE short_name = ?1",
                rusqlite::params![short_name],
                |row| row.get(0),
            )
            .context("Failed to look up collector id")?;
        Ok(id)
    }

    /// Add a source unless one with the same uid exists for the collector.
    /// Returns `None` when the source was already registered.
    pub async fn add_source(
        &self,
        collector_id: i64,
        uid: &str,
        friendly_name: Option<&str>,
    ) -> Result<Option<Source>> {
        let conn = self.conn.lock().await;

        let inserted = conn
            .execute(
                "INSERT INTO source (collector_id, uid, friendly_name, enabled)
                 VALUES (?1, ?2, ?3, 1)
                 ON CONFLICT(collector_id, uid) DO NOTHING",
                rusqlite::params![collector_id, uid, friendly_name],
            )
            .context("Failed to add source")?;

        if inserted == 0 {
            return Ok(None);
        }

        let id = conn.last_insert_rowid();
        info!("New source '{}' inserted with ID {}", uid, id);
        Ok(Some(Source {
            id,
            collector_id,
            uid: uid.to_string(),
            friendly_name: friendly_name.map(str::to_string),
            user_note: None,
            enabled: true,
            metadata: None,
        }))
    }

    pub async fn get_source(&self, id: i64) -> Result<Option<Source>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {} FROM source WHERE id = ?1", SOURCE_COLUMNS),
            rusqlite::params![id],
            parse_source_row,
        )
        .optional()
        .context("Failed to load source")
    }

    pub async fn get_source_by_uid(&self, collector_id: i64, uid: &str) -> Result<Option<Source>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!(
                "SELECT {} FROM source WHERE collector_id = ?1 AND uid = ?2",
                SOURCE_COLUMNS
            ),
            rusqlite::params![collector_id, uid],
            parse_source_row,
        )
        .optional()
        .context("Failed to load source by uid")
    }

    pub async fn list_sources(&self) -> Result<Vec<Source>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM source ORDER BY id",
            SOURCE_COLUMNS
        ))?;
        let sources = stmt
            .query_map([], parse_source_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list sources")?;
        Ok(sources)
    }

    /// Returns false when no source has that id.
    pub async fn set_source_enabled(&self, id: i64, enabled: bool) -> Result<bool> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE source SET enabled = ?1 WHERE id = ?2",
                rusqlite::params![enabled, id],
            )
            .context("Failed to update source")?;
        Ok(rows > 0)
    }

    pub async fn set_source_note(&self, id: i64, note: Option<&str>) -> Result<bool> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE source SET user_note = ?1 WHERE id = ?2",
                rusqlite::params![note, id],
            )
            .context("Failed to update source note")?;
        Ok(rows > 0)
    }
}

fn parse_source_row(row: &rusqlite::Row) -> rusqlite::Result<Source> {
    Ok(Source {
        id: row.get(0)?,
        collector_id: row.get(1)?,
        uid: row.get(2)?,
        friendly_name: row.get(3)?,
        user_note: row.get(4)?,
        enabled: row.get(5)?,
        metadata: parse_metadata(row.get(6)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_collector_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let first = store
            .register_collector("telegram", "Telegram Channel Monitor")
            .await
            .unwrap();
        let second = store
            .register_collector("telegram", "Telegram Channel Monitor")
            .await
            .unwrap();
        assert_eq!(first, second);

        let other = store.register_collector("rss", "RSS").await.unwrap();
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn test_add_source_once_per_collector() {
        let store = Store::open_in_memory().unwrap();
        let telegram = store.register_collector("telegram", "Telegram").await.unwrap();
        let rss = store.register_collector("rss", "RSS").await.unwrap();

        let added = store
            .add_source(telegram, "-100123", Some("News"))
            .await
            .unwrap()
            .unwrap();
        assert!(added.enabled);
        assert!(store
            .add_source(telegram, "-100123", Some("News again"))
            .await
            .unwrap()
            .is_none());

        // Same uid under another collector is a different source
        assert!(store.add_source(rss, "-100123", None).await.unwrap().is_some());

        let found = store
            .get_source_by_uid(telegram, "-100123")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, added);
        assert_eq!(store.list_sources().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_enable_disable_and_note() {
        let store = Store::open_in_memory().unwrap();
        let collector = store.register_collector("telegram", "Telegram").await.unwrap();
        let source = store
            .add_source(collector, "42", None)
            .await
            .unwrap()
            .unwrap();

        assert!(store.set_source_enabled(source.id, false).await.unwrap());
        assert!(!store.get_source(source.id).await.unwrap().unwrap().enabled);
        assert!(!store.set_source_enabled(999, true).await.unwrap());

        assert!(store.set_source_note(source.id, Some("watch")).await.unwrap());
        assert_eq!(
            store
                .get_source(source.id)
                .await
                .unwrap()
                .unwrap()
                .user_note
                .as_deref(),
            Some("watch")
        );
    }
}
