use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use tracing::info;

use super::{parse_metadata, Store};

/// A collected message and its translation state
#[derive(Debug, Clone)]
pub struct Content {
    pub id: i64,
    pub source_id: i64,
    pub collection_time: DateTime<Utc>,
    pub origin_time: Option<DateTime<Utc>>,
    pub translated: bool,
    pub analysed: bool,
    pub original_text: Option<String>,
    pub translated_text: Option<String>,
    pub detected_language: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl Content {
    /// Text handed to analysis: the translation when there is one,
    /// otherwise the original.
    pub fn analysis_text(&self) -> Option<&str> {
        self.translated_text
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| {
                self.original_text
                    .as_deref()
                    .filter(|t| !t.trim().is_empty())
            })
    }
}

impl Store {
    pub async fn add_content(
        &self,
        source_id: i64,
        origin_time: Option<DateTime<Utc>>,
        text: &str,
        metadata: &serde_json::Value,
    ) -> Result<i64> {
        let metadata_json = serde_json::to_string(metadata)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO content (source_id, collection_time, origin_time, original_text, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![source_id, Utc::now(), origin_time, text, metadata_json],
        )
        .context("Failed to add content")?;

        let id = conn.last_insert_rowid();
        info!("New content {} added for source {}", id, source_id);
        Ok(id)
    }

    pub async fn get_content(&self, id: i64) -> Result<Option<Content>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, source_id, collection_time, origin_time, translated, analysed,
                    original_text, translated_text, detected_language, metadata
             FROM content WHERE id = ?1",
            rusqlite::params![id],
            |row| {
                Ok(Content {
                    id: row.get(0)?,
                    source_id: row.get(1)?,
                    collection_time: row.get(2)?,
                    origin_time: row.get(3)?,
                    translated: row.get(4)?,
                    analysed: row.get(5)?,
                    original_text: row.get(6)?,
                    translated_text: row.get(7)?,
                    detected_language: row.get(8)?,
                    metadata: parse_metadata(row.get(9)?),
                })
            },
        )
        .optional()
        .context("Failed to load content")
    }

    pub async fn set_translation(
        &self,
        id: i64,
        translated_text: &str,
        detected_language: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE content
                 SET translated_text = ?1, detected_language = ?2, translated = 1
                 WHERE id = ?3",
                rusqlite::params![translated_text, detected_language, id],
            )
            .context("Failed to store translation")?;
        if rows == 0 {
            anyhow::bail!("No content record found with ID {}", id);
        }
        info!("Updated translated_text for content ID {}", id);
        Ok(())
    }

    pub async fn mark_analysed(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE content SET analysed = 1 WHERE id = ?1",
            rusqlite::params![id],
        )
        .context("Failed to mark content analysed")?;
        Ok(())
    }
}
