//! Query Guards
//!
//! Structural cost estimate for a parsed query. No statistics are consulted
//! beyond the per-table row estimates in the policy; the score is a proxy
//! (thousands of rows touched) compared against the policy ceiling.

use crate::security::ast::QueryFacts;
use crate::security::policy::ValidatorPolicy;
use serde::{Deserialize, Serialize};

const FILTERED_FRACTION: f64 = 0.1;
const CONSTRAINED_JOIN_FACTOR: f64 = 0.5;
const MIN_FAN_OUT: f64 = 10.0;
const UNBOUNDED_RESULT_PENALTY: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub score: f64,
    pub ceiling: f64,
    /// Human-readable drivers of the score, largest first.
    pub factors: Vec<String>,
}

impl CostEstimate {
    pub fn exceeds_ceiling(&self) -> bool {
        self.score > self.ceiling
    }
}

/// Query guards configuration
pub struct QueryGuards<'a> {
    policy: &'a ValidatorPolicy,
}

impl<'a> QueryGuards<'a> {
    pub fn new(policy: &'a ValidatorPolicy) -> Self {
        Self { policy }
    }

    fn scan_units(&self, table: &str) -> f64 {
        (self.policy.row_estimate(table) as f64 / 1000.0).max(1.0)
    }

    pub fn estimate(&self, facts: &QueryFacts) -> CostEstimate {
        let mut score = 0.0;
        let mut factors: Vec<(f64, String)> = Vec::new();

        for scope in &facts.scopes {
            let mut scope_cost = 0.0;
            let mut largest: f64 = 0.0;
            for table in &scope.tables {
                let units = self.scan_units(table);
                largest = largest.max(units);
                let rows = self.policy.row_estimate(table);
                if scope.filtered {
                    scope_cost += units * FILTERED_FRACTION;
                } else {
                    scope_cost += units;
                    if rows >= self.policy.large_table_rows {
                        factors.push((
                            units,
                            format!("unfiltered scan of large table {} (~{} rows)", table, rows),
                        ));
                    }
                }
            }

            if scope.constrained_joins > 0 {
                let join_cost = scope_cost * CONSTRAINED_JOIN_FACTOR * scope.constrained_joins as f64;
                scope_cost += join_cost;
            }

            for _ in 0..scope.unconstrained_joins {
                let before = scope_cost;
                scope_cost *= largest.max(MIN_FAN_OUT);
                factors.push((
                    scope_cost - before,
                    "join without a join condition multiplies row counts".to_string(),
                ));
            }

            score += scope_cost;
        }

        if !facts.has_limit && !facts.aggregated && score > 0.0 {
            let penalty = score * UNBOUNDED_RESULT_PENALTY;
            score += penalty;
            factors.push((penalty, "result size is unbounded (no LIMIT)".to_string()));
        }

        factors.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        CostEstimate {
            score: (score * 100.0).round() / 100.0,
            ceiling: self.policy.cost_ceiling,
            factors: factors.into_iter().map(|(_, f)| f).collect(),
        }
    }
}
