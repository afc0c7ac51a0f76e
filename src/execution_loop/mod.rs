//! Execution Loop
//!
//! Failure taxonomy, deterministic recovery and the critic that turns one
//! failing candidate into the next. The retry budget itself belongs to the
//! orchestrator.

pub mod critic;
pub mod error_classifier;
pub mod error_recovery;

pub use critic::{AnalysisSource, Critic, ErrorAnalysis, FailureDetail};
pub use error_classifier::{ErrorClassifier, ErrorType, RepairStrategy};
