use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;

use super::Store;

/// What to ask an LLM about every message from one source
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRequirement {
    pub id: i64,
    pub source_id: i64,
    pub llm_id: i64,
    pub name: String,
    pub prompt: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct NewRequirement<'a> {
    pub source_id: i64,
    pub llm_id: i64,
    pub name: &'a str,
    pub prompt: &'a str,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub id: i64,
    pub req_id: i64,
    pub content_id: i64,
    pub analysis_time: DateTime<Utc>,
    pub output: Option<String>,
}

const REQUIREMENT_COLUMNS: &str = "id, source_id, llm_id, name, prompt, enabled";

impl Store {
    /// Enabled requirements for a source, oldest first.
    pub async fn get_analysis_requirements(&self, source_id: i64) -> Result<Vec<AnalysisRequirement>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM analysis_requirement
             WHERE source_id = ?1 AND enabled = 1
             ORDER BY id",
            REQUIREMENT_COLUMNS
        ))?;
        let requirements = stmt
            .query_map(rusqlite::params![source_id], parse_requirement_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to load analysis requirements")?;
        Ok(requirements)
    }

    /// All requirements, enabled or not, optionally narrowed to one source.
    pub async fn list_requirements(&self, source_id: Option<i64>) -> Result<Vec<AnalysisRequirement>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM analysis_requirement
             WHERE ?1 IS NULL OR source_id = ?1
             ORDER BY source_id, id",
            REQUIREMENT_COLUMNS
        ))?;
        let requirements = stmt
            .query_map(rusqlite::params![source_id], parse_requirement_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list analysis requirements")?;
        Ok(requirements)
    }

    pub async fn add_requirement(&self, requirement: &NewRequirement<'_>) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO analysis_requirement (source_id, llm_id, name, prompt, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                requirement.source_id,
                requirement.llm_id,
                requirement.name,
                requirement.prompt,
                requirement.enabled,
            ],
        )
        .with_context(|| {
            format!(
                "Failed to add analysis requirement for source {}",
                requirement.source_id
            )
        })?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn set_requirement_enabled(&self, id: i64, enabled: bool) -> Result<bool> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE analysis_requirement SET enabled = ?1 WHERE id = ?2",
                rusqlite::params![enabled, id],
            )
            .context("Failed to update analysis requirement")?;
        Ok(rows > 0)
    }

    pub async fn has_analysis_result(&self, req_id: i64, content_id: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let exists: bool = conn.query_row(
            "SELECT count(*) > 0 FROM analysis_result WHERE req_id = ?1 AND content_id = ?2",
            rusqlite::params![req_id, content_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Store a result and return its id. A second save for the same
    /// requirement and content keeps the first result.
    pub async fn save_analysis_result(&self, content_id: i64, req_id: i64, output: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        let inserted = conn
            .execute(
                "INSERT INTO analysis_result (req_id, content_id, analysis_time, output)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(req_id, content_id) DO NOTHING",
                rusqlite::params![req_id, content_id, Utc::now(), output],
            )
            .context("Failed to save analysis result")?;

        if inserted > 0 {
            return Ok(conn.last_insert_rowid());
        }

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM analysis_result WHERE req_id = ?1 AND content_id = ?2",
                rusqlite::params![req_id, content_id],
                |row| row.get(0),
            )
            .optional()?;
        existing.context("Analysis result vanished after conflicting insert")
    }

    pub async fn list_results(&self, content_id: i64) -> Result<Vec<AnalysisResult>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, req_id, content_id, analysis_time, output
             FROM analysis_result WHERE content_id = ?1
             ORDER BY id",
        )?;
        let results = stmt
            .query_map(rusqlite::params![content_id], |row| {
                Ok(AnalysisResult {
                    id: row.get(0)?,
                    req_id: row.get(1)?,
                    content_id: row.get(2)?,
                    analysis_time: row.get(3)?,
                    output: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list analysis results")?;
        Ok(results)
    }
}

fn parse_requirement_row(row: &rusqlite::Row) -> rusqlite::Result<AnalysisRequirement> {
    Ok(AnalysisRequirement {
        id: row.get(0)?,
        source_id: row.get(1)?,
        llm_id: row.get(2)?,
        name: row.get(3)?,
        prompt: row.get(4)?,
        enabled: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn requirement(source_id: i64, name: &str, enabled: bool) -> NewRequirement<'_> {
        NewRequirement {
            source_id,
            llm_id: 1,
            name,
            prompt: "Summarise",
            enabled,
        }
    }

    async fn store_with_two_sources() -> (Store, i64, i64) {
        let store = Store::open_in_memory().unwrap();
        let collector = store.register_collector("telegram", "Telegram").await.unwrap();
        let a = store.add_source(collector, "a", None).await.unwrap().unwrap();
        let b = store.add_source(collector, "b", None).await.unwrap().unwrap();
        (store, a.id, b.id)
    }

    #[tokio::test]
    async fn test_only_enabled_requirements_for_matching_source() {
        let (store, a, b) = store_with_two_sources().await;
        store.add_requirement(&requirement(a, "summary", true)).await.unwrap();
        let disabled = store
            .add_requirement(&requirement(a, "sentiment", false))
            .await
            .unwrap();
        store.add_requirement(&requirement(b, "other", true)).await.unwrap();

        let for_a = store.get_analysis_requirements(a).await.unwrap();
        assert_eq!(for_a.len(), 1);
        assert_eq!(for_a[0].name, "summary");
        assert!(for_a.iter().all(|r| r.source_id == a && r.enabled));

        assert!(store.set_requirement_enabled(disabled, true).await.unwrap());
        assert_eq!(store.get_analysis_requirements(a).await.unwrap().len(), 2);

        assert_eq!(store.list_requirements(None).await.unwrap().len(), 3);
        assert_eq!(store.list_requirements(Some(b)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_requirement_for_unknown_source_rejected() {
        let (store, a, b) = store_with_two_sources().await;
        assert!(store
            .add_requirement(&requirement(a + b + 10, "x", true))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_save_result_is_idempotent() {
        let (store, a, _) = store_with_two_sources().await;
        let req = store.add_requirement(&requirement(a, "summary", true)).await.unwrap();
        let content = store.add_content(a, None, "text", &json!({})).await.unwrap();

        assert!(!store.has_analysis_result(req, content).await.unwrap());
        let first = store.save_analysis_result(content, req, "first").await.unwrap();
        let second = store.save_analysis_result(content, req, "second").await.unwrap();
        assert_eq!(first, second);
        assert!(store.has_analysis_result(req, content).await.unwrap());

        let results = store.list_results(content).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].output.as_deref(), Some("first"));
    }
}
