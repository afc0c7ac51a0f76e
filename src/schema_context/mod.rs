//! Schema Context
//!
//! Table and column metadata, sample rows and foreign-key relationships, as
//! an immutable snapshot. Providers hand out `Arc<SchemaSnapshot>` so a run
//! keeps the snapshot it started with even when the cache refreshes.

pub mod cache;
pub mod retriever;

use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

pub use cache::CachedSchemaProvider;
pub use retriever::SchemaRetriever;

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub row_estimate: Option<u64>,
    #[serde(default)]
    pub sample_rows: Vec<serde_json::Map<String, serde_json::Value>>,
}

impl TableInfo {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub tables: Vec<TableInfo>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    #[serde(default = "Utc::now")]
    pub captured_at: DateTime<Utc>,
}

impl SchemaSnapshot {
    pub fn new(tables: Vec<TableInfo>, relationships: Vec<Relationship>) -> Self {
        Self {
            tables,
            relationships,
            captured_at: Utc::now(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Schema(format!("Failed to read schema {}: {}", path.display(), e))
        })?;
        let snapshot: SchemaSnapshot = serde_json::from_str(&content)?;
        Ok(snapshot)
    }

    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        let bare = name.rsplit('.').next().unwrap_or(name);
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(bare))
    }

    /// `(table, column)` for every column in the snapshot.
    pub fn all_columns(&self) -> impl Iterator<Item = (&TableInfo, &ColumnInfo)> {
        self.tables
            .iter()
            .flat_map(|t| t.columns.iter().map(move |c| (t, c)))
    }

    /// Tables one foreign-key hop away from `table`.
    pub fn neighbors(&self, table: &str) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for rel in &self.relationships {
            let other = if rel.from_table.eq_ignore_ascii_case(table) {
                Some(rel.to_table.as_str())
            } else if rel.to_table.eq_ignore_ascii_case(table) {
                Some(rel.from_table.as_str())
            } else {
                None
            };
            if let Some(other) = other {
                if !out.iter().any(|o| o.eq_ignore_ascii_case(other)) {
                    out.push(other);
                }
            }
        }
        out
    }

    /// A snapshot containing only `names` (case-insensitive) and the
    /// relationships among them.
    pub fn restrict(&self, names: &[String]) -> SchemaSnapshot {
        let keep = |name: &str| names.iter().any(|n| n.eq_ignore_ascii_case(name));
        SchemaSnapshot {
            tables: self.tables.iter().filter(|t| keep(&t.name)).cloned().collect(),
            relationships: self
                .relationships
                .iter()
                .filter(|r| keep(&r.from_table) && keep(&r.to_table))
                .cloned()
                .collect(),
            captured_at: self.captured_at,
        }
    }

    /// DDL-like rendering used inside prompts.
    pub fn render_for_prompt(&self, max_sample_rows: usize) -> String {
        let mut out = String::new();
        for table in &self.tables {
            if let Some(description) = &table.description {
                let _ = writeln!(out, "-- {}", description);
            }
            let _ = writeln!(out, "CREATE TABLE {} (", table.name);
            let lines: Vec<String> = table
                .columns
                .iter()
                .map(|c| {
                    let mut line = format!("  {} {}", c.name, c.data_type);
                    if table.primary_key.iter().any(|k| k.eq_ignore_ascii_case(&c.name)) {
                        line.push_str(" PRIMARY KEY");
                    } else if !c.nullable {
                        line.push_str(" NOT NULL");
                    }
                    if let Some(description) = &c.description {
                        line.push_str(&format!(" -- {}", description));
                    }
                    line
                })
                .collect();
            let _ = writeln!(out, "{}\n);", lines.join(",\n"));

            for row in table.sample_rows.iter().take(max_sample_rows) {
                let _ = writeln!(out, "-- sample: {}", serde_json::Value::Object(row.clone()));
            }
            out.push('\n');
        }

        if !self.relationships.is_empty() {
            out.push_str("-- Relationships:\n");
            for rel in &self.relationships {
                let _ = writeln!(
                    out,
                    "--   {}.{} -> {}.{}",
                    rel.from_table, rel.from_column, rel.to_table, rel.to_column
                );
            }
        }
        out
    }
}

#[async_trait]
pub trait SchemaContextProvider: Send + Sync {
    /// Current snapshot, optionally restricted to `table_filter`.
    async fn lookup(&self, table_filter: Option<&[String]>) -> Result<Arc<SchemaSnapshot>>;

    /// Drop any cached snapshot so the next lookup reads the source again.
    async fn invalidate(&self) {}
}

/// Serves a fixed snapshot, typically loaded from a JSON file.
pub struct StaticSchemaProvider {
    snapshot: Arc<SchemaSnapshot>,
}

impl StaticSchemaProvider {
    pub fn new(snapshot: SchemaSnapshot) -> Self {
        Self {
            snapshot: Arc::new(snapshot),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(SchemaSnapshot::from_file(path)?))
    }
}

#[async_trait]
impl SchemaContextProvider for StaticSchemaProvider {
    async fn lookup(&self, table_filter: Option<&[String]>) -> Result<Arc<SchemaSnapshot>> {
        Ok(match table_filter {
            Some(names) => Arc::new(self.snapshot.restrict(names)),
            None => Arc::clone(&self.snapshot),
        })
    }
}
