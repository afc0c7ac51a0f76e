//! Execution Outcome - what an executor hands back for one query

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub type Row = serde_json::Map<String, serde_json::Value>;

/// Rows returned by a successful execution, in backend order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub row_count: usize,
    /// More rows existed than the row limit allowed.
    pub truncated: bool,
    #[serde(with = "duration_ms")]
    pub latency: Duration,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Row>, truncated: bool, latency: Duration) -> Self {
        Self {
            columns,
            row_count: rows.len(),
            rows,
            truncated,
            latency,
        }
    }

    /// Build from rows alone; columns follow the first row's key order.
    pub fn from_rows(rows: Vec<Row>, latency: Duration) -> Self {
        let columns = rows
            .first()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        Self::new(columns, rows, false, latency)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Values of one column, in row order.
    pub fn column_values<'a>(&'a self, column: &'a str) -> impl Iterator<Item = &'a serde_json::Value> + 'a {
        self.rows.iter().map(move |r| r.get(column).unwrap_or(&serde_json::Value::Null))
    }
}

/// Failure reported by the backend. `message` is the raw backend text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub message: String,
    pub timed_out: bool,
}

impl ExecutionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timed_out: false,
        }
    }

    pub fn timeout(budget: Duration) -> Self {
        Self {
            message: format!("query exceeded its time budget of {} ms", budget.as_millis()),
            timed_out: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionOutcome {
    Rows(ResultSet),
    Failed(ExecutionFailure),
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_columns_follow_first_row_order() {
        let rows: Vec<Row> = vec![
            json!({"region": "West", "total": 10}).as_object().unwrap().clone(),
            json!({"region": "East", "total": 7}).as_object().unwrap().clone(),
        ];
        let set = ResultSet::from_rows(rows, Duration::from_millis(3));
        assert_eq!(set.columns, vec!["region", "total"]);
        assert_eq!(set.row_count, 2);
        let totals: Vec<_> = set.column_values("total").collect();
        assert_eq!(totals, vec![&json!(10), &json!(7)]);
        assert_eq!(set.column_values("missing").next(), Some(&serde_json::Value::Null));
    }
}
