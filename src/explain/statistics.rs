//! Column Statistics
//!
//! Per-column profile of a result set: counts, null rate and, for numeric
//! columns, min/max/mean/median/std-dev.

use crate::execution::ResultSet;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    Numeric,
    Temporal,
    Text,
    Boolean,
    /// Only nulls.
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericStatistics {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStatistics {
    pub column: String,
    pub kind: ColumnKind,
    pub count: usize,
    pub null_count: usize,
    pub null_rate: f64,
    pub distinct: usize,
    pub numeric: Option<NumericStatistics>,
}

const TIME_NAME_HINTS: [&str; 9] = [
    "date", "time", "day", "week", "month", "quarter", "year", "period", "created",
];

pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn is_temporal_text(s: &str) -> bool {
    let s = s.trim();
    DateTime::parse_from_rfc3339(s).is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").is_ok()
        || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
        || NaiveDate::parse_from_str(&format!("{}-01", s), "%Y-%m-%d").is_ok()
}

/// True when a column name suggests a time axis (`order_date`, `month`).
pub fn has_time_name(column: &str) -> bool {
    let lowered = column.to_lowercase();
    TIME_NAME_HINTS.iter().any(|hint| lowered.contains(hint))
}

fn kind_of(column: &str, values: &[&Value]) -> ColumnKind {
    if values.is_empty() {
        return ColumnKind::Empty;
    }
    if values.iter().all(|v| v.is_boolean()) {
        return ColumnKind::Boolean;
    }
    let all_text_dates = values
        .iter()
        .all(|v| v.as_str().map(is_temporal_text).unwrap_or(false));
    if all_text_dates {
        return ColumnKind::Temporal;
    }
    if values.iter().all(|v| as_number(v).is_some()) {
        // Integer years/months named as such are a time axis, not a measure.
        if has_time_name(column) && values.iter().all(|v| v.is_i64() || v.is_u64()) {
            return ColumnKind::Temporal;
        }
        return ColumnKind::Numeric;
    }
    ColumnKind::Text
}

fn numeric_statistics(values: &[f64]) -> Option<NumericStatistics> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    let median = if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    };

    Some(NumericStatistics {
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        mean,
        median,
        std_dev: variance.sqrt(),
    })
}

pub fn column_statistics(result: &ResultSet) -> Vec<ColumnStatistics> {
    result
        .columns
        .iter()
        .map(|column| {
            let non_null: Vec<&Value> = result.column_values(column).filter(|v| !v.is_null()).collect();
            let null_count = result.row_count - non_null.len();
            let kind = kind_of(column, &non_null);
            let distinct: BTreeSet<String> = non_null.iter().map(|v| v.to_string()).collect();
            let numeric = match kind {
                ColumnKind::Numeric => {
                    numeric_statistics(&non_null.iter().filter_map(|v| as_number(v)).collect::<Vec<_>>())
                }
                _ => None,
            };
            ColumnStatistics {
                column: column.clone(),
                kind,
                count: non_null.len(),
                null_count,
                null_rate: if result.row_count == 0 {
                    0.0
                } else {
                    null_count as f64 / result.row_count as f64
                },
                distinct: distinct.len(),
                numeric,
            }
        })
        .collect()
}

/// Compact text rendering for prompts.
pub fn render(stats: &[ColumnStatistics]) -> String {
    stats
        .iter()
        .map(|s| {
            let mut line = format!(
                "- {} ({:?}): {} values, {:.0}% null, {} distinct",
                s.column,
                s.kind,
                s.count,
                s.null_rate * 100.0,
                s.distinct
            );
            if let Some(n) = &s.numeric {
                line.push_str(&format!(
                    "; min {:.2}, max {:.2}, mean {:.2}, median {:.2}, std {:.2}",
                    n.min, n.max, n.mean, n.median, n.std_dev
                ));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::Row;
    use serde_json::json;
    use std::time::Duration;

    fn result(rows: Vec<Value>) -> ResultSet {
        let rows: Vec<Row> = rows.into_iter().map(|r| r.as_object().unwrap().clone()).collect();
        ResultSet::from_rows(rows, Duration::ZERO)
    }

    #[test]
    fn test_numeric_profile() {
        let set = result(vec![
            json!({"month": "2024-01", "revenue": 10, "note": null}),
            json!({"month": "2024-02", "revenue": 20, "note": "x"}),
            json!({"month": "2024-03", "revenue": "30.0", "note": null}),
            json!({"month": "2024-04", "revenue": 40, "note": null}),
        ]);
        let stats = column_statistics(&set);

        assert_eq!(stats[0].kind, ColumnKind::Temporal);
        let revenue = &stats[1];
        assert_eq!(revenue.kind, ColumnKind::Numeric);
        let n = revenue.numeric.as_ref().unwrap();
        assert_eq!((n.min, n.max, n.mean, n.median), (10.0, 40.0, 25.0, 25.0));
        assert!((n.std_dev - 125f64.sqrt()).abs() < 1e-9);

        assert_eq!(stats[2].null_count, 3);
        assert!((stats[2].null_rate - 0.75).abs() < 1e-9);
        assert!(render(&stats).contains("revenue (Numeric)"));
    }

    #[test]
    fn test_integer_years_are_temporal() {
        let set = result(vec![json!({"year": 2022, "n": 1}), json!({"year": 2023, "n": 2})]);
        let stats = column_statistics(&set);
        assert_eq!(stats[0].kind, ColumnKind::Temporal);
        assert_eq!(stats[1].kind, ColumnKind::Numeric);
    }
}
