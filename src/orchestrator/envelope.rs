//! Response Envelope
//!
//! The only thing a caller sees of a run.

use crate::execution::Row;
use crate::execution_loop::ErrorAnalysis;
use crate::explain::Explanation;
use crate::intent::{DecisionSource, IntentDecision, IntentRoute};
use crate::security::{ThreatCategory, ValidationLevel, ValidationVerdict};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Success,
    PartialSuccess,
    ValidationFailed,
    ExecutionFailed,
    IntentMismatch,
    SecurityViolation,
    QuotaExceeded,
    UnknownError,
    Cancelled,
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::PartialSuccess)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentSummary {
    pub route: IntentRoute,
    pub confidence: f64,
    pub justification: String,
    pub source: DecisionSource,
}

impl From<&IntentDecision> for IntentSummary {
    fn from(decision: &IntentDecision) -> Self {
        Self {
            route: decision.route,
            confidence: decision.confidence,
            justification: decision.justification.clone(),
            source: decision.signals.source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub level: ValidationLevel,
    /// Verdict of the last validated candidate.
    pub is_valid: bool,
    pub blocking: Vec<ThreatCategory>,
    /// Every category any candidate of the run triggered, in first-seen order.
    pub threats_seen: Vec<ThreatCategory>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
    pub cost_score: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub last_analysis: Option<ErrorAnalysis>,
    pub last_verdict: Option<ValidationVerdict>,
    /// Raw backend text; only present for callers allowed to see it.
    pub backend_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    pub started_at: DateTime<Utc>,
    pub total_ms: u64,
    /// Cumulative milliseconds per stage.
    pub stage_ms: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub message: String,
    pub question: String,
    pub final_query: Option<String>,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub row_count: usize,
    pub truncated: bool,
    pub explanation: Option<Explanation>,
    pub intent: Option<IntentSummary>,
    pub validation: Option<ValidationSummary>,
    pub retry_count: u32,
    pub diagnostics: Diagnostics,
    pub timing: Timing,
}
