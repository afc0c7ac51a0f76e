//! Persistence for finished runs.

pub mod query_history;

pub use query_history::{HistoryEntry, HistorySink, HistoryStats, LogHistory, SqliteHistory};
