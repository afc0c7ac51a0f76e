//! Query Generation
//!
//! Candidates and the generator that produces the first one. Repairs
//! produce further candidates (see `execution_loop::critic`); together they
//! form the revision chain of a run.

pub mod exemplars;
pub mod generator;

use crate::security::CostEstimate;
use serde::{Deserialize, Serialize};

pub use exemplars::{Exemplar, ExemplarSelector};
pub use generator::QueryGenerator;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateOrigin {
    Generated,
    Repaired { strategy: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryCandidate {
    /// 0 for the generated query, then one per repair.
    pub revision: u32,
    pub query: String,
    pub confidence: f64,
    pub justification: String,
    pub tables: Vec<String>,
    pub cost_estimate: Option<CostEstimate>,
    pub warnings: Vec<String>,
    pub origin: CandidateOrigin,
}

impl QueryCandidate {
    /// Placeholder for a stage that could not produce a query.
    pub fn empty(revision: u32, origin: CandidateOrigin, justification: impl Into<String>) -> Self {
        Self {
            revision,
            query: String::new(),
            confidence: 0.0,
            justification: justification.into(),
            tables: Vec::new(),
            cost_estimate: None,
            warnings: Vec::new(),
            origin,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.query.trim().is_empty()
    }

    /// Worth validating: has text and some confidence behind it.
    pub fn is_viable(&self) -> bool {
        !self.is_empty() && self.confidence > 0.0
    }
}

/// Heuristic confidence when the model does not report one.
pub fn heuristic_confidence(warnings: usize) -> f64 {
    (0.8 - 0.1 * warnings as f64).max(0.3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_candidate_is_not_viable() {
        let c = QueryCandidate::empty(0, CandidateOrigin::Generated, "engine down");
        assert!(c.is_empty());
        assert!(!c.is_viable());
    }

    #[test]
    fn test_heuristic_confidence_floor() {
        assert!((heuristic_confidence(0) - 0.8).abs() < 1e-9);
        assert!((heuristic_confidence(2) - 0.6).abs() < 1e-9);
        assert!((heuristic_confidence(9) - 0.3).abs() < 1e-9);
    }
}
