//! Query history for finished runs
//!
//! Sinks receive the envelope after the caller already has it; a failing
//! sink is logged and never affects the run.

use crate::error::{PipelineError, Result};
use crate::generation::Exemplar;
use crate::orchestrator::{ResponseEnvelope, RunStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn record(&self, envelope: &ResponseEnvelope) -> Result<()>;
}

/// Logs one line per finished run.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogHistory;

#[async_trait]
impl HistorySink for LogHistory {
    async fn record(&self, envelope: &ResponseEnvelope) -> Result<()> {
        info!(
            run_id = %envelope.run_id,
            status = %envelope.status,
            retries = envelope.retry_count,
            rows = envelope.row_count,
            total_ms = envelope.timing.total_ms,
            "Run finished"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub run_id: String,
    pub recorded_at: DateTime<Utc>,
    pub question: String,
    pub status: String,
    pub final_query: Option<String>,
    pub retry_count: u32,
    pub row_count: usize,
    pub total_ms: u64,
}

/// Aggregates over recorded runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryStats {
    pub total_runs: u64,
    pub by_status: BTreeMap<String, u64>,
    pub average_ms: f64,
    pub average_retries: f64,
}

/// SQLite-backed history.
pub struct SqliteHistory {
    db: Mutex<Connection>,
}

impl SqliteHistory {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(db: Connection) -> Result<Self> {
        db.execute(
            r#"
            CREATE TABLE IF NOT EXISTS query_history (
                run_id TEXT PRIMARY KEY,
                recorded_at TEXT NOT NULL,
                question TEXT NOT NULL,
                status TEXT NOT NULL,
                final_query TEXT,
                retry_count INTEGER NOT NULL,
                row_count INTEGER NOT NULL,
                total_ms INTEGER NOT NULL,
                envelope TEXT NOT NULL
            )
            "#,
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_history_status ON query_history(status, recorded_at)",
            [],
        )?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| PipelineError::History("history connection poisoned".to_string()))
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT run_id, recorded_at, question, status, final_query, retry_count, row_count, total_ms
             FROM query_history ORDER BY recorded_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let recorded_at: String = row.get(1)?;
            Ok(HistoryEntry {
                run_id: row.get(0)?,
                recorded_at: DateTime::parse_from_rfc3339(&recorded_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_default(),
                question: row.get(2)?,
                status: row.get(3)?,
                final_query: row.get(4)?,
                retry_count: row.get::<_, i64>(5)? as u32,
                row_count: row.get::<_, i64>(6)? as usize,
                total_ms: row.get::<_, i64>(7)? as u64,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Successful past runs as worked examples, newest first.
    pub fn recent_exemplars(&self, limit: usize) -> Result<Vec<Exemplar>> {
        Ok(self
            .recent(limit.saturating_mul(4))?
            .into_iter()
            .filter(|e| e.status == RunStatus::Success.to_string())
            .filter_map(|e| {
                e.final_query.map(|sql| Exemplar {
                    question: e.question,
                    sql,
                    recorded_at: e.recorded_at,
                })
            })
            .take(limit)
            .collect())
    }

    pub fn stats(&self) -> Result<HistoryStats> {
        let db = self.conn()?;
        let (total_runs, average_ms, average_retries): (i64, f64, f64) = db.query_row(
            "SELECT COUNT(*), COALESCE(AVG(total_ms), 0), COALESCE(AVG(retry_count), 0) FROM query_history",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let mut by_status = BTreeMap::new();
        let mut stmt = db.prepare("SELECT status, COUNT(*) FROM query_history GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (status, count) = row?;
            by_status.insert(status, count as u64);
        }

        Ok(HistoryStats {
            total_runs: total_runs as u64,
            by_status,
            average_ms,
            average_retries,
        })
    }
}

#[async_trait]
impl HistorySink for SqliteHistory {
    async fn record(&self, envelope: &ResponseEnvelope) -> Result<()> {
        let serialized = serde_json::to_string(envelope)?;
        let db = self.conn()?;
        db.execute(
            r#"
            INSERT OR REPLACE INTO query_history
                (run_id, recorded_at, question, status, final_query, retry_count, row_count, total_ms, envelope)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                envelope.run_id.to_string(),
                Utc::now().to_rfc3339(),
                envelope.question,
                envelope.status.to_string(),
                envelope.final_query,
                envelope.retry_count as i64,
                envelope.row_count as i64,
                envelope.timing.total_ms as i64,
                serialized,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{Diagnostics, Timing};
    use uuid::Uuid;

    fn envelope(question: &str, status: RunStatus, query: Option<&str>, total_ms: u64) -> ResponseEnvelope {
        ResponseEnvelope {
            run_id: Uuid::new_v4(),
            status,
            message: String::new(),
            question: question.into(),
            final_query: query.map(String::from),
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            truncated: false,
            explanation: None,
            intent: None,
            validation: None,
            retry_count: 1,
            diagnostics: Diagnostics::default(),
            timing: Timing {
                started_at: Utc::now(),
                total_ms,
                stage_ms: BTreeMap::new(),
            },
        }
    }

    #[tokio::test]
    async fn test_record_and_aggregate() {
        let dir = tempfile::tempdir().unwrap();
        let history = SqliteHistory::open(dir.path().join("history.db")).unwrap();

        history
            .record(&envelope("top customers", RunStatus::Success, Some("SELECT 1"), 100))
            .await
            .unwrap();
        history
            .record(&envelope("drop it", RunStatus::SecurityViolation, None, 300))
            .await
            .unwrap();

        let stats = history.stats().unwrap();
        assert_eq!(stats.total_runs, 2);
        assert_eq!(stats.by_status.get("Success"), Some(&1));
        assert!((stats.average_ms - 200.0).abs() < 1e-9);

        let exemplars = history.recent_exemplars(5).unwrap();
        assert_eq!(exemplars.len(), 1);
        assert_eq!(exemplars[0].sql, "SELECT 1");
        assert_eq!(history.recent(10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_log_history_never_fails() {
        assert!(LogHistory
            .record(&envelope("q", RunStatus::Cancelled, None, 1))
            .await
            .is_ok());
    }
}
