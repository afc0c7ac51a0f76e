//! Worked examples (question → SQL) shown to the generator.

use crate::error::{PipelineError, Result};
use crate::tokens;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exemplar {
    pub question: String,
    pub sql: String,
    #[serde(default = "Utc::now")]
    pub recorded_at: DateTime<Utc>,
}

impl Exemplar {
    pub fn new(question: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            sql: sql.into(),
            recorded_at: Utc::now(),
        }
    }

    /// Load a JSON array of exemplars.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Vec<Exemplar>> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("Failed to read exemplars {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}

pub struct ExemplarSelector {
    max: usize,
}

impl ExemplarSelector {
    pub fn new(max: usize) -> Self {
        Self { max }
    }

    /// Up to `max` exemplars sharing tokens with `question`, best overlap
    /// first, newer first on ties.
    pub fn select<'a>(&self, question: &str, pool: &'a [Exemplar]) -> Vec<&'a Exemplar> {
        let wanted = tokens::content_tokens(question);
        let mut scored: Vec<(f64, &Exemplar)> = pool
            .iter()
            .map(|e| (tokens::overlap_score(&wanted, &tokens::content_tokens(&e.question)), e))
            .filter(|(score, _)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.1.recorded_at.cmp(&a.1.recorded_at))
        });
        scored.into_iter().take(self.max).map(|(_, e)| e).collect()
    }
}
