//! Critic
//!
//! Diagnoses a failing candidate and proposes exactly one corrected
//! candidate. Pattern rules and deterministic fixes come first; the model is
//! asked for what they cannot handle. The critic never retries and never
//! executes: its output goes back to the validator.

use crate::agent_prompts::{sql_repair_prompt, SQL_REPAIR_SYSTEM_PROMPT};
use crate::execution::ExecutionFailure;
use crate::execution_loop::error_classifier::{Classification, ErrorClassifier, ErrorType, RepairStrategy};
use crate::execution_loop::error_recovery::{self, DeterministicFix, SchemaAligner};
use crate::generation::{CandidateOrigin, QueryCandidate};
use crate::llm::{parse_structured, CompletionEngine, CompletionPurpose, CompletionRequest};
use crate::question::Question;
use crate::schema_context::SchemaSnapshot;
use crate::security::{ast, ValidationVerdict};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

const PROMPT_SAMPLE_ROWS: usize = 1;
const DEFAULT_MODEL_CONFIDENCE: f64 = 0.5;

/// Why the failing candidate was sent to the critic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FailureDetail {
    Validation(ValidationVerdict),
    Execution(ExecutionFailure),
}

impl FailureDetail {
    pub fn describe(&self) -> String {
        match self {
            FailureDetail::Validation(verdict) => format!("validation failed: {}", verdict.failure_summary()),
            FailureDetail::Execution(failure) if failure.timed_out => {
                format!("execution timed out: {}", failure.message)
            }
            FailureDetail::Execution(failure) => format!("execution failed: {}", failure.message),
        }
    }

    /// Like `describe` but without backend text; safe to show any caller.
    pub fn summary(&self) -> String {
        match self {
            FailureDetail::Validation(verdict) => format!("validation failed: {}", verdict.failure_summary()),
            FailureDetail::Execution(failure) if failure.timed_out => "execution timed out".to_string(),
            FailureDetail::Execution(_) => "execution failed".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisSource {
    PatternRule,
    Model,
    /// Neither a rule nor the model produced a diagnosis.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorAnalysis {
    /// Revision of the candidate this analysis is about.
    pub failing_revision: u32,
    pub error_type: ErrorType,
    pub root_cause: String,
    pub fragments: Vec<String>,
    pub strategy: RepairStrategy,
    pub confidence: f64,
    pub source: AnalysisSource,
}

impl ErrorAnalysis {
    fn from_rule(failing_revision: u32, c: &Classification) -> Self {
        Self {
            failing_revision,
            error_type: c.error_type,
            root_cause: c.root_cause.clone(),
            fragments: c.fragments.clone(),
            strategy: c.strategy,
            confidence: c.confidence,
            source: AnalysisSource::PatternRule,
        }
    }

    fn unavailable(failing_revision: u32, root_cause: String) -> Self {
        Self {
            failing_revision,
            error_type: ErrorType::UnclassifiedError,
            root_cause,
            fragments: Vec::new(),
            strategy: RepairStrategy::FullRewrite,
            confidence: 0.0,
            source: AnalysisSource::Unavailable,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RepairResponse {
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    root_cause: Option<String>,
    #[serde(default)]
    repair_strategy: Option<String>,
    #[serde(default)]
    fragments: Vec<String>,
    #[serde(default)]
    corrected_sql: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

pub struct Critic {
    engine: Arc<dyn CompletionEngine>,
    classifier: ErrorClassifier,
    aligner: SchemaAligner,
    max_result_rows: usize,
}

impl Critic {
    pub fn new(engine: Arc<dyn CompletionEngine>, max_result_rows: usize) -> Self {
        Self {
            engine,
            classifier: ErrorClassifier::new(),
            aligner: SchemaAligner::default(),
            max_result_rows,
        }
    }

    pub async fn analyze_and_repair(
        &self,
        failing: &QueryCandidate,
        failure: &FailureDetail,
        schema: &SchemaSnapshot,
        question: &Question,
    ) -> (ErrorAnalysis, QueryCandidate) {
        let classification = match failure {
            FailureDetail::Validation(verdict) => Some(self.classifier.classify_verdict(verdict)),
            FailureDetail::Execution(f) => self.classifier.classify_message(&f.message, f.timed_out),
        };

        if let Some(c) = &classification {
            if let Some(fix) = self.deterministic_fix(failing, failure, c, schema, question) {
                info!(strategy = %c.strategy, "{}", fix.note);
                let analysis = ErrorAnalysis::from_rule(failing.revision, c);
                let candidate = Self::repaired(failing, fix.sql, fix.confidence, fix.note, c.strategy);
                return (analysis, candidate);
            }
        }

        self.model_repair(failing, failure, classification.as_ref(), schema, question)
            .await
    }

    fn deterministic_fix(
        &self,
        failing: &QueryCandidate,
        failure: &FailureDetail,
        c: &Classification,
        schema: &SchemaSnapshot,
        question: &Question,
    ) -> Option<DeterministicFix> {
        if let Some(unknown) = &c.unknown_identifier {
            return self.aligner.align(&failing.query, unknown, schema);
        }
        match failure {
            FailureDetail::Execution(f) if f.timed_out => {
                error_recovery::bound_result(&failing.query, question.row_limit(self.max_result_rows))
            }
            _ => None,
        }
    }

    async fn model_repair(
        &self,
        failing: &QueryCandidate,
        failure: &FailureDetail,
        classification: Option<&Classification>,
        schema: &SchemaSnapshot,
        question: &Question,
    ) -> (ErrorAnalysis, QueryCandidate) {
        let diagnosis = classification.map(|c| format!("{} ({}): {}", c.error_type, c.strategy, c.root_cause));
        let prompt = sql_repair_prompt(
            question.text(),
            &failing.query,
            &failure.describe(),
            diagnosis.as_deref(),
            &Self::schema_for(failing, schema).render_for_prompt(PROMPT_SAMPLE_ROWS),
        );
        let request = CompletionRequest::json(CompletionPurpose::QueryRepair, prompt)
            .with_system(SQL_REPAIR_SYSTEM_PROMPT);

        let response = match self.engine.complete(&request).await {
            Ok(raw) => parse_structured::<RepairResponse>(&raw),
            Err(e) => Err(e),
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!("⚠️  Repair unavailable: {}", e);
                let analysis = match classification {
                    Some(c) => ErrorAnalysis::from_rule(failing.revision, c),
                    None => ErrorAnalysis::unavailable(failing.revision, failure.summary()),
                };
                let candidate = QueryCandidate::empty(
                    failing.revision + 1,
                    CandidateOrigin::Repaired {
                        strategy: analysis.strategy.to_string(),
                    },
                    format!("no correction produced: {}", e),
                );
                return (analysis, candidate);
            }
        };

        let model_confidence = response
            .confidence
            .unwrap_or(DEFAULT_MODEL_CONFIDENCE)
            .clamp(0.0, 1.0);
        let analysis = match classification {
            Some(c) => ErrorAnalysis::from_rule(failing.revision, c),
            None => ErrorAnalysis {
                failing_revision: failing.revision,
                error_type: response
                    .error_type
                    .as_deref()
                    .map(ErrorType::parse)
                    .unwrap_or(ErrorType::UnclassifiedError),
                root_cause: response.root_cause.clone().unwrap_or_else(|| failure.summary()),
                fragments: response.fragments.clone(),
                strategy: response
                    .repair_strategy
                    .as_deref()
                    .map(RepairStrategy::parse)
                    .unwrap_or(RepairStrategy::FullRewrite),
                confidence: model_confidence,
                source: AnalysisSource::Model,
            },
        };

        let candidate = match response.corrected_sql.filter(|s| !s.trim().is_empty()) {
            Some(sql) => Self::repaired(
                failing,
                sql,
                model_confidence,
                response.root_cause.unwrap_or_else(|| analysis.root_cause.clone()),
                analysis.strategy,
            ),
            None => {
                warn!("⚠️  Repair response carried no corrected query");
                QueryCandidate::empty(
                    failing.revision + 1,
                    CandidateOrigin::Repaired {
                        strategy: analysis.strategy.to_string(),
                    },
                    "model returned no corrected query",
                )
            }
        };

        info!(
            error_type = %analysis.error_type,
            strategy = %analysis.strategy,
            confidence = candidate.confidence,
            "Critic produced a repair"
        );
        (analysis, candidate)
    }

    /// Tables of the failing query plus one foreign-key hop; the whole
    /// snapshot when none of them is known.
    fn schema_for(failing: &QueryCandidate, schema: &SchemaSnapshot) -> SchemaSnapshot {
        let mut names: Vec<String> = failing
            .tables
            .iter()
            .filter_map(|t| schema.table(t))
            .map(|t| t.name.clone())
            .collect();
        if names.is_empty() {
            return schema.clone();
        }
        let direct = names.clone();
        for table in &direct {
            for neighbor in schema.neighbors(table) {
                if !names.iter().any(|n| n.eq_ignore_ascii_case(neighbor)) {
                    names.push(neighbor.to_string());
                }
            }
        }
        schema.restrict(&names)
    }

    fn repaired(
        failing: &QueryCandidate,
        sql: String,
        confidence: f64,
        justification: String,
        strategy: RepairStrategy,
    ) -> QueryCandidate {
        let query = sql.trim().to_string();
        QueryCandidate {
            revision: failing.revision + 1,
            tables: ast::referenced_tables(&query),
            query,
            confidence,
            justification,
            cost_estimate: None,
            warnings: Vec::new(),
            origin: CandidateOrigin::Repaired {
                strategy: strategy.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PipelineError, Result};
    use crate::schema_context::tests::sample_snapshot;
    use crate::security::{QueryValidator, UserContext, ValidationLevel};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedRepair {
        reply: Option<&'static str>,
        calls: AtomicUsize,
    }

    impl ScriptedRepair {
        fn new(reply: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CompletionEngine for ScriptedRepair {
        async fn complete(&self, request: &CompletionRequest) -> Result<String> {
            assert_eq!(request.purpose, CompletionPurpose::QueryRepair);
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply
                .map(String::from)
                .ok_or_else(|| PipelineError::Completion("model offline".into()))
        }
    }

    fn candidate(sql: &str) -> QueryCandidate {
        QueryCandidate {
            revision: 0,
            query: sql.into(),
            confidence: 0.8,
            justification: String::new(),
            tables: ast::referenced_tables(sql),
            cost_estimate: None,
            warnings: Vec::new(),
            origin: CandidateOrigin::Generated,
        }
    }

    fn question() -> Question {
        Question::new("top 5 customers by sales").unwrap()
    }

    #[tokio::test]
    async fn test_unknown_column_is_aligned_without_the_model() {
        let engine = ScriptedRepair::new(None);
        let critic = Critic::new(engine.clone(), 1000);
        let failing = candidate("SELECT customer_nme FROM customers LIMIT 5");
        let failure = FailureDetail::Execution(ExecutionFailure::new(r#"column "customer_nme" does not exist"#));

        let (analysis, repaired) = critic
            .analyze_and_repair(&failing, &failure, &sample_snapshot(), &question())
            .await;

        assert_eq!(analysis.error_type, ErrorType::SemanticError);
        assert_eq!(analysis.strategy, RepairStrategy::SchemaAlignment);
        assert_eq!(analysis.failing_revision, 0);
        assert_eq!(repaired.revision, 1);
        assert_eq!(repaired.query, "SELECT customer_name FROM customers LIMIT 5");
        assert!(repaired.is_viable());
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unmatched_error_goes_to_the_model() {
        let engine = ScriptedRepair::new(Some(
            r#"{"error_type": "LogicError", "root_cause": "division by zero on empty groups",
                "repair_strategy": "LogicRefinement", "fragments": ["a / b"],
                "corrected_sql": "SELECT NULLIF(b, 0) FROM orders", "confidence": 0.7}"#,
        ));
        let critic = Critic::new(engine.clone(), 1000);
        let failure = FailureDetail::Execution(ExecutionFailure::new("division by zero"));

        let (analysis, repaired) = critic
            .analyze_and_repair(&candidate("SELECT a / b FROM orders"), &failure, &sample_snapshot(), &question())
            .await;

        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
        assert_eq!(analysis.source, AnalysisSource::Model);
        assert_eq!(analysis.error_type, ErrorType::LogicError);
        assert_eq!(analysis.strategy, RepairStrategy::LogicRefinement);
        assert_eq!(repaired.query, "SELECT NULLIF(b, 0) FROM orders");
        assert!((repaired.confidence - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_validation_failure_keeps_rule_analysis() {
        let engine = ScriptedRepair::new(Some(r#"{"corrected_sql": "SELECT id FROM orders LIMIT 10"}"#));
        let critic = Critic::new(engine, 1000);
        let verdict = QueryValidator::default().validate_sql(
            "SELECT id FROM orders WHERE 1=1 OR 'a'='a'",
            &UserContext::default(),
            ValidationLevel::Strict,
        );
        assert!(!verdict.is_valid);

        let (analysis, repaired) = critic
            .analyze_and_repair(
                &candidate("SELECT id FROM orders WHERE 1=1 OR 'a'='a'"),
                &FailureDetail::Validation(verdict),
                &sample_snapshot(),
                &question(),
            )
            .await;
        assert_eq!(analysis.source, AnalysisSource::PatternRule);
        assert_eq!(analysis.strategy, RepairStrategy::FullRewrite);
        assert_eq!(repaired.query, "SELECT id FROM orders LIMIT 10");
        assert!((repaired.confidence - DEFAULT_MODEL_CONFIDENCE).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_no_correction_yields_zero_confidence_candidate() {
        let critic = Critic::new(ScriptedRepair::new(None), 1000);
        let failure = FailureDetail::Execution(ExecutionFailure::new("something odd happened"));
        let (analysis, repaired) = critic
            .analyze_and_repair(&candidate("SELECT 1"), &failure, &sample_snapshot(), &question())
            .await;
        assert_eq!(analysis.source, AnalysisSource::Unavailable);
        assert_eq!(analysis.error_type, ErrorType::UnclassifiedError);
        assert_eq!(repaired.confidence, 0.0);
        assert!(!repaired.is_viable());
    }

    #[tokio::test]
    async fn test_fallback_root_cause_omits_backend_text() {
        let failure = FailureDetail::Execution(ExecutionFailure::new(
            r#"FATAL: password authentication failed for user "svc""#,
        ));
        let critic = Critic::new(ScriptedRepair::new(None), 1000);
        let (analysis, _) = critic
            .analyze_and_repair(&candidate("SELECT 1"), &failure, &sample_snapshot(), &question())
            .await;
        assert_eq!(analysis.root_cause, "execution failed");

        let critic = Critic::new(ScriptedRepair::new(Some(r#"{"corrected_sql": "SELECT 2"}"#)), 1000);
        let (analysis, repaired) = critic
            .analyze_and_repair(&candidate("SELECT 1"), &failure, &sample_snapshot(), &question())
            .await;
        assert_eq!(analysis.source, AnalysisSource::Model);
        assert!(!analysis.root_cause.contains("password"));
        assert_eq!(repaired.query, "SELECT 2");
    }

    #[tokio::test]
    async fn test_timeout_adds_a_row_bound() {
        let critic = Critic::new(ScriptedRepair::new(None), 1000);
        let failure = FailureDetail::Execution(ExecutionFailure::timeout(std::time::Duration::from_secs(30)));
        let (analysis, repaired) = critic
            .analyze_and_repair(&candidate("SELECT id FROM orders"), &failure, &sample_snapshot(), &question())
            .await;
        assert_eq!(analysis.error_type, ErrorType::PerformanceError);
        assert_eq!(repaired.query, "SELECT id FROM orders LIMIT 1000");
    }
}
