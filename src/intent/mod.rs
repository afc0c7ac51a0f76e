//! Intent
//!
//! Labels a question with the route the rest of the system should take.

pub mod classifier;
pub mod keywords;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use classifier::IntentClassifier;
pub use keywords::RouteScores;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentRoute {
    StructuredQuery,
    DocumentSearch,
    Conversational,
    Hybrid,
    Unresolved,
}

impl fmt::Display for IntentRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Which part of the classifier produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionSource {
    KeywordRules,
    Model,
    /// The model answered but the answer did not fit the contract.
    ModelFallback,
    EngineFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentSignals {
    pub source: DecisionSource,
    pub matched_patterns: Vec<String>,
    pub scores: RouteScores,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentDecision {
    pub route: IntentRoute,
    pub confidence: f64,
    pub justification: String,
    pub signals: IntentSignals,
}

impl IntentDecision {
    /// Structured and hybrid questions both go through query generation.
    pub fn takes_sql_path(&self) -> bool {
        matches!(self.route, IntentRoute::StructuredQuery | IntentRoute::Hybrid)
    }
}
