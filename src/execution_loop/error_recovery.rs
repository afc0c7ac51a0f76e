//! Error Recovery
//!
//! Fixes that need no model: re-pointing an unknown identifier at the
//! closest schema identifier, and bounding a query that timed out.

use crate::execution_loop::error_classifier::{IdentifierKind, UnknownIdentifier};
use crate::schema_context::SchemaSnapshot;
use crate::security::ast::{self, QueryFacts};
use regex::{Captures, Regex};
use strsim::jaro_winkler;
use tracing::debug;

/// A correction applied without a model call.
#[derive(Debug, Clone, PartialEq)]
pub struct DeterministicFix {
    pub sql: String,
    pub note: String,
    pub confidence: f64,
}

/// Fuzzy matcher for schema identifiers
pub struct SchemaAligner {
    similarity_threshold: f64,
}

impl Default for SchemaAligner {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.8,
        }
    }
}

impl SchemaAligner {
    pub fn new(threshold: f64) -> Self {
        Self {
            similarity_threshold: threshold,
        }
    }

    fn normalize(s: &str) -> String {
        s.to_lowercase().chars().filter(|c| c.is_alphanumeric()).collect()
    }

    pub fn similarity(&self, a: &str, b: &str) -> f64 {
        jaro_winkler(&Self::normalize(a), &Self::normalize(b))
    }

    /// Closest known identifier of `kind` to `unknown`, with its similarity.
    /// Columns are searched in the query's own tables first.
    pub fn closest(
        &self,
        unknown: &str,
        kind: IdentifierKind,
        sql: &str,
        schema: &SchemaSnapshot,
    ) -> Option<(String, f64)> {
        let names: Vec<&str> = match kind {
            IdentifierKind::Table => schema.tables.iter().map(|t| t.name.as_str()).collect(),
            IdentifierKind::Column => {
                let in_query: Vec<&str> = ast::referenced_tables(sql)
                    .iter()
                    .filter_map(|t| schema.table(t))
                    .flat_map(|t| t.columns.iter().map(|c| c.name.as_str()))
                    .collect();
                if in_query.is_empty() {
                    schema.all_columns().map(|(_, c)| c.name.as_str()).collect()
                } else {
                    in_query
                }
            }
        };

        if names.iter().any(|n| n.eq_ignore_ascii_case(unknown)) {
            // Exists; the problem is elsewhere (wrong table, missing join).
            return None;
        }

        names
            .into_iter()
            .map(|n| (n, self.similarity(unknown, n)))
            .filter(|(_, score)| *score >= self.similarity_threshold)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(n, score)| (n.to_string(), score))
    }

    /// Replace an unknown identifier by its closest schema match.
    pub fn align(&self, sql: &str, unknown: &UnknownIdentifier, schema: &SchemaSnapshot) -> Option<DeterministicFix> {
        let bare = ast::bare_name(&unknown.name);
        let (replacement, score) = self.closest(bare, unknown.kind, sql, schema)?;
        let fixed = replace_identifier(sql, bare, &replacement)?;
        debug!(from = bare, to = %replacement, score, "Aligned identifier with schema");
        Some(DeterministicFix {
            sql: fixed,
            note: format!("replaced unknown {:?} {} with {}", unknown.kind, bare, replacement).to_lowercase(),
            confidence: score,
        })
    }
}

/// Whole-word, case-insensitive replacement outside string literals. `None`
/// if `from` never occurs as a word outside a literal.
pub fn replace_identifier(sql: &str, from: &str, to: &str) -> Option<String> {
    let pattern = Regex::new(&format!(r"(?i)('(?:[^']|'')*')|\b{}\b", regex::escape(from))).ok()?;
    let mut replaced = false;
    let fixed = pattern.replace_all(sql, |caps: &Captures| match caps.get(1) {
        Some(literal) => literal.as_str().to_string(),
        None => {
            replaced = true;
            to.to_string()
        }
    });
    replaced.then(|| fixed.into_owned())
}

/// Add a LIMIT to a single SELECT that has none.
pub fn bound_result(sql: &str, row_limit: usize) -> Option<DeterministicFix> {
    let statements = ast::parse(sql).ok()?;
    let facts = QueryFacts::from_statements(&statements);
    if facts.statement_count != 1 || facts.has_limit || facts.aggregated {
        return None;
    }
    Some(DeterministicFix {
        sql: format!("{} LIMIT {}", sql.trim().trim_end_matches(';').trim_end(), row_limit),
        note: format!("bounded the result to {} rows", row_limit),
        confidence: 0.6,
    })
}
