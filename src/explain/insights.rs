//! Insight Detectors
//!
//! Trend, outlier, ranking and threshold detection over a result set. Each
//! detector emits at most one insight; the caller sorts and caps them.

use crate::execution::{ResultSet, Row};
use crate::explain::statistics::{as_number, ColumnKind, ColumnStatistics};
use crate::tokens;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InsightKind {
    Trend,
    Outlier,
    Ranking,
    Threshold,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataInsight {
    pub kind: InsightKind,
    pub description: String,
    /// 0..=1, higher is more notable.
    pub significance: f64,
    pub data_points: Vec<Value>,
}

const MIN_TREND_POINTS: usize = 3;
/// Share of steps that must move the same way for a near-monotonic trend.
const TREND_CONSISTENCY: f64 = 0.8;
const MIN_OUTLIER_POINTS: usize = 3;
const DEFAULT_RANKING_SIZE: usize = 3;

const RANK_DESC_WORDS: [&str; 7] = ["top", "highest", "best", "largest", "most", "biggest", "leading"];
const RANK_ASC_WORDS: [&str; 5] = ["bottom", "lowest", "worst", "smallest", "least"];

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{:.2}", value)
    }
}

fn label(row: &Row, label_column: Option<&str>, index: usize) -> String {
    label_column
        .and_then(|c| row.get(c))
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| format!("row {}", index + 1))
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

pub struct InsightDetector {
    outlier_sigma: f64,
    max_insights: usize,
}

impl InsightDetector {
    pub fn new(outlier_sigma: f64, max_insights: usize) -> Self {
        Self {
            outlier_sigma,
            max_insights,
        }
    }

    /// Insights for `result`, most significant first, at most `max_insights`.
    pub fn detect(&self, result: &ResultSet, stats: &[ColumnStatistics], question: &str) -> Vec<DataInsight> {
        if result.is_empty() {
            return Vec::new();
        }
        let measure = stats.iter().find(|s| s.kind == ColumnKind::Numeric);
        let label_column = stats
            .iter()
            .find(|s| s.kind == ColumnKind::Text)
            .map(|s| s.column.as_str());

        let mut insights: Vec<DataInsight> = [
            measure.and_then(|m| self.trend(result, stats, m)),
            self.outlier(result, stats, label_column),
            measure.and_then(|m| self.ranking(result, m, label_column, question)),
            measure.and_then(|m| self.threshold(result, m)),
        ]
        .into_iter()
        .flatten()
        .collect();

        insights.sort_by(|a, b| cmp_f64(b.significance, a.significance));
        insights.truncate(self.max_insights);
        insights
    }

    fn trend(&self, result: &ResultSet, stats: &[ColumnStatistics], measure: &ColumnStatistics) -> Option<DataInsight> {
        let time = stats.iter().find(|s| s.kind == ColumnKind::Temporal)?;
        let mut points: Vec<(&Value, f64)> = result
            .rows
            .iter()
            .filter_map(|r| {
                let t = r.get(&time.column).filter(|v| !v.is_null())?;
                let y = r.get(&measure.column).and_then(as_number)?;
                Some((t, y))
            })
            .collect();
        if points.len() < MIN_TREND_POINTS {
            return None;
        }
        points.sort_by(|a, b| match (as_number(a.0), as_number(b.0)) {
            (Some(x), Some(y)) => cmp_f64(x, y),
            _ => a.0.as_str().unwrap_or_default().cmp(b.0.as_str().unwrap_or_default()),
        });

        let steps = points.len() - 1;
        let ups = points.windows(2).filter(|w| w[1].1 > w[0].1).count();
        let downs = points.windows(2).filter(|w| w[1].1 < w[0].1).count();
        let (direction, consistent) = if ups >= downs { ("rose", ups) } else { ("fell", downs) };
        let consistency = consistent as f64 / steps as f64;
        if consistency < TREND_CONSISTENCY {
            return None;
        }

        let (first, last) = (points[0], points[points.len() - 1]);
        let relative = if first.1 != 0.0 {
            (last.1 - first.1) / first.1.abs()
        } else {
            1.0
        };
        let change = if first.1 != 0.0 {
            format!(" ({:+.1}%)", relative * 100.0)
        } else {
            String::new()
        };

        Some(DataInsight {
            kind: InsightKind::Trend,
            description: format!(
                "{} {} from {} to {}{} across {} {} values",
                measure.column,
                direction,
                format_number(first.1),
                format_number(last.1),
                change,
                points.len(),
                time.column
            ),
            significance: consistency * (0.5 + 0.5 * relative.abs().min(1.0)),
            data_points: vec![first.0.clone(), last.0.clone()],
        })
    }

    fn outlier(&self, result: &ResultSet, stats: &[ColumnStatistics], label_column: Option<&str>) -> Option<DataInsight> {
        let mut best: Option<(f64, &ColumnStatistics, usize, f64)> = None;
        for column in stats.iter().filter(|s| s.kind == ColumnKind::Numeric) {
            let Some(n) = column.numeric.as_ref() else { continue };
            if column.count < MIN_OUTLIER_POINTS || n.std_dev == 0.0 {
                continue;
            }
            for (index, row) in result.rows.iter().enumerate() {
                let Some(value) = row.get(&column.column).and_then(as_number) else { continue };
                let z = (value - n.mean) / n.std_dev;
                if z.abs() > self.outlier_sigma && best.map_or(true, |b| z.abs() > b.0.abs()) {
                    best = Some((z, column, index, value));
                }
            }
        }

        let (z, column, index, value) = best?;
        let n = column.numeric.as_ref()?;
        let row = &result.rows[index];
        Some(DataInsight {
            kind: InsightKind::Outlier,
            description: format!(
                "{} has {} = {}, {:.1} standard deviations {} the mean of {}",
                label(row, label_column, index),
                column.column,
                format_number(value),
                z.abs(),
                if z > 0.0 { "above" } else { "below" },
                format_number(n.mean)
            ),
            significance: (z.abs() / (2.0 * self.outlier_sigma)).min(1.0),
            data_points: vec![Value::Object(row.clone())],
        })
    }

    fn ranking(
        &self,
        result: &ResultSet,
        measure: &ColumnStatistics,
        label_column: Option<&str>,
        question: &str,
    ) -> Option<DataInsight> {
        let words = tokens::words(question);
        let descending = words.iter().any(|w| RANK_DESC_WORDS.contains(&w.as_str()));
        let ascending = words.iter().any(|w| RANK_ASC_WORDS.contains(&w.as_str()));
        if !descending && !ascending {
            return None;
        }
        let size = words
            .iter()
            .skip_while(|w| !RANK_DESC_WORDS.contains(&w.as_str()) && !RANK_ASC_WORDS.contains(&w.as_str()))
            .nth(1)
            .and_then(|w| w.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_RANKING_SIZE);

        let mut ranked: Vec<(usize, f64)> = result
            .rows
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.get(&measure.column).and_then(as_number).map(|v| (i, v)))
            .collect();
        if ranked.len() < 2 {
            return None;
        }
        if descending {
            ranked.sort_by(|a, b| cmp_f64(b.1, a.1));
        } else {
            ranked.sort_by(|a, b| cmp_f64(a.1, b.1));
        }

        let total: f64 = ranked.iter().map(|(_, v)| v.abs()).sum();
        let top: Vec<&(usize, f64)> = ranked.iter().take(size).collect();
        let top_sum: f64 = top.iter().map(|(_, v)| v.abs()).sum();
        let share = if total > 0.0 { top_sum / total } else { 0.0 };

        let listed = top
            .iter()
            .map(|(i, v)| format!("{} ({})", label(&result.rows[*i], label_column, *i), format_number(*v)))
            .collect::<Vec<_>>()
            .join(", ");

        Some(DataInsight {
            kind: InsightKind::Ranking,
            description: format!(
                "{} {} by {}: {}{}",
                if descending { "Top" } else { "Bottom" },
                top.len(),
                measure.column,
                listed,
                if ranked.len() > top.len() {
                    format!(" ({:.0}% of the total)", share * 100.0)
                } else {
                    String::new()
                }
            ),
            significance: if ranked.len() > top.len() { 0.5 + 0.5 * share } else { 0.5 },
            data_points: top.iter().map(|(i, _)| Value::Object(result.rows[*i].clone())).collect(),
        })
    }

    fn threshold(&self, result: &ResultSet, measure: &ColumnStatistics) -> Option<DataInsight> {
        let n = measure.numeric.as_ref()?;
        if n.max <= 0.0 {
            return None;
        }
        let boundary = 10f64.powi(n.max.log10().floor() as i32);
        if !(n.min < boundary && boundary <= n.max) {
            return None;
        }

        let values: Vec<f64> = result
            .column_values(&measure.column)
            .filter_map(as_number)
            .collect();
        let above = values.iter().filter(|v| **v >= boundary).count();
        if above == 0 || above == values.len() {
            return None;
        }
        let rarity = 1.0 - above as f64 / values.len() as f64;

        Some(DataInsight {
            kind: InsightKind::Threshold,
            description: format!(
                "{} of {} rows have {} at or above {}",
                above,
                values.len(),
                measure.column,
                format_number(boundary)
            ),
            significance: 0.3 + 0.4 * rarity,
            data_points: vec![Value::from(boundary)],
        })
    }
}

pub fn render(insights: &[DataInsight]) -> String {
    if insights.is_empty() {
        return "none".to_string();
    }
    insights
        .iter()
        .map(|i| format!("- [{:?}, significance {:.2}] {}", i.kind, i.significance, i.description))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::explain::statistics::column_statistics;
    use serde_json::json;
    use std::time::Duration;

    fn result(rows: Vec<Value>) -> ResultSet {
        let rows: Vec<Row> = rows.into_iter().map(|r| r.as_object().unwrap().clone()).collect();
        ResultSet::from_rows(rows, Duration::ZERO)
    }

    fn detect(set: &ResultSet, question: &str) -> Vec<DataInsight> {
        let stats = column_statistics(set);
        InsightDetector::new(2.0, 10).detect(set, &stats, question)
    }

    #[test]
    fn test_near_monotonic_trend() {
        let set = result(vec![
            json!({"month": "2024-03", "revenue": 130}),
            json!({"month": "2024-01", "revenue": 100}),
            json!({"month": "2024-02", "revenue": 120}),
            json!({"month": "2024-04", "revenue": 125}),
            json!({"month": "2024-05", "revenue": 150}),
            json!({"month": "2024-06", "revenue": 160}),
        ]);
        let insights = detect(&set, "monthly revenue");
        let trend = insights.iter().find(|i| i.kind == InsightKind::Trend).unwrap();
        assert!(trend.description.starts_with("revenue rose from 100 to 160 (+60.0%)"));
        assert_eq!(trend.data_points, vec![json!("2024-01"), json!("2024-06")]);

        // one step back in three is not a trend
        let choppy = result(vec![
            json!({"month": "2024-01", "revenue": 100}),
            json!({"month": "2024-02", "revenue": 120}),
            json!({"month": "2024-03", "revenue": 110}),
            json!({"month": "2024-04", "revenue": 130}),
        ]);
        assert!(detect(&choppy, "monthly revenue").iter().all(|i| i.kind != InsightKind::Trend));
    }

    #[test]
    fn test_outlier_and_ranking() {
        let mut rows: Vec<Value> = (0..9)
            .map(|i| json!({"customer_name": format!("c{}", i), "total": 100 + i}))
            .collect();
        rows.push(json!({"customer_name": "Acme", "total": 5000}));
        let set = result(rows);

        let insights = detect(&set, "top 2 customers by total");
        let outlier = insights.iter().find(|i| i.kind == InsightKind::Outlier).unwrap();
        assert!(outlier.description.starts_with("Acme has total = 5000"));

        let ranking = insights.iter().find(|i| i.kind == InsightKind::Ranking).unwrap();
        assert!(ranking.description.starts_with("Top 2 by total: Acme (5000), c8 (108)"));
        assert_eq!(ranking.data_points.len(), 2);

        let threshold = insights.iter().find(|i| i.kind == InsightKind::Threshold).unwrap();
        assert_eq!(threshold.description, "1 of 10 rows have total at or above 1000");
    }

    #[test]
    fn test_no_ranking_language_no_ranking() {
        let set = result(vec![json!({"total": 1}), json!({"total": 2})]);
        assert!(detect(&set, "orders per customer")
            .iter()
            .all(|i| i.kind != InsightKind::Ranking));
    }

    #[test]
    fn test_cap_and_order() {
        let mut rows: Vec<Value> = (0..9)
            .map(|i| json!({"customer_name": format!("c{}", i), "total": 100 + i}))
            .collect();
        rows.push(json!({"customer_name": "Acme", "total": 5000}));
        let set = result(rows);
        let stats = column_statistics(&set);
        let insights = InsightDetector::new(2.0, 2).detect(&set, &stats, "top customers");
        assert_eq!(insights.len(), 2);
        assert!(insights[0].significance >= insights[1].significance);
    }
}
