//! Orchestrator
//!
//! Drives one question through intent, generation, validation, execution,
//! repair and explanation. The repair counter lives only here: each failure
//! either buys one critic pass from the shared budget or ends the run.

pub mod envelope;
pub mod run;

use crate::config::PipelineConfig;
use crate::db::{HistorySink, LogHistory};
use crate::error::Result;
use crate::execution::{ExecutionFailure, ExecutionOutcome, QueryExecutor, ResultSet};
use crate::execution_loop::{AnalysisSource, Critic, ErrorAnalysis, FailureDetail, RepairStrategy};
use crate::explain::ResultExplainer;
use crate::generation::{Exemplar, QueryGenerator};
use crate::intent::{IntentClassifier, IntentRoute};
use crate::llm::{BoundedCompletion, CompletionEngine};
use crate::question::Question;
use crate::schema_context::{SchemaContextProvider, SchemaSnapshot};
use crate::security::{QueryValidator, UserContext, ValidationLevel, ValidatorPolicy};
use itertools::Itertools;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use envelope::{Diagnostics, IntentSummary, ResponseEnvelope, RunStatus, Timing, ValidationSummary};
pub use run::{CandidateRecord, OrchestrationRun, RunState};

/// Permission that unlocks raw backend error text in envelopes.
pub const DIAGNOSTICS_PERMISSION: &str = "diagnostics:read";

/// Slack granted to an executor beyond its own time budget.
const EXECUTOR_GRACE: Duration = Duration::from_secs(1);

enum Step {
    Validate,
    Execute(String),
    Repair,
    Explain(String, ResultSet),
    Finish(RunStatus, String),
}

/// Outcome kept between the last step and envelope assembly.
struct Finished {
    status: RunStatus,
    message: String,
    final_query: Option<String>,
    result: Option<ResultSet>,
    explanation: Option<crate::explain::Explanation>,
}

pub struct Orchestrator {
    config: PipelineConfig,
    classifier: IntentClassifier,
    generator: QueryGenerator,
    validator: QueryValidator,
    critic: Critic,
    explainer: ResultExplainer,
    schema: Arc<dyn SchemaContextProvider>,
    executor: Arc<dyn QueryExecutor>,
    history: Arc<dyn HistorySink>,
    exemplars: Arc<Vec<Exemplar>>,
}

impl Orchestrator {
    /// All model calls of all runs share one bounded engine.
    pub fn new(
        config: PipelineConfig,
        policy: ValidatorPolicy,
        engine: Arc<dyn CompletionEngine>,
        schema: Arc<dyn SchemaContextProvider>,
        executor: Arc<dyn QueryExecutor>,
    ) -> Self {
        let engine: Arc<dyn CompletionEngine> = Arc::new(BoundedCompletion::new(
            engine,
            config.max_concurrent_completions,
            config.completion_timeout,
        ));
        let policy = match config.cost_ceiling {
            Some(ceiling) => policy.with_cost_ceiling(ceiling),
            None => policy,
        };

        Self {
            classifier: IntentClassifier::new(Arc::clone(&engine)),
            generator: QueryGenerator::new(Arc::clone(&engine), config.max_tables_in_prompt, config.max_exemplars),
            validator: QueryValidator::new(policy),
            critic: Critic::new(Arc::clone(&engine), config.max_result_rows),
            explainer: ResultExplainer::new(engine, config.outlier_sigma, config.max_insights),
            schema,
            executor,
            history: Arc::new(LogHistory),
            exemplars: Arc::new(Vec::new()),
            config,
        }
    }

    pub fn with_history(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = history;
        self
    }

    pub fn with_exemplars(mut self, exemplars: Vec<Exemplar>) -> Self {
        self.exemplars = Arc::new(exemplars);
        self
    }

    pub fn validator(&self) -> &QueryValidator {
        &self.validator
    }

    pub fn classifier(&self) -> &IntentClassifier {
        &self.classifier
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Validate the raw input, then run it. Input-shape problems are the
    /// only errors; everything after that is reported in the envelope.
    pub async fn ask(&self, text: &str, user: UserContext, cancel: &CancellationToken) -> Result<ResponseEnvelope> {
        let question = Question::new(text)?.with_user(user);
        Ok(self.process(question, cancel).await)
    }

    pub fn level_for(&self, user: &UserContext) -> ValidationLevel {
        user.trust_tier.unwrap_or(self.config.default_validation_level)
    }

    pub async fn process(&self, question: Question, cancel: &CancellationToken) -> ResponseEnvelope {
        let mut run = OrchestrationRun::new(question, self.config.max_repair_attempts);
        // A budget too large to represent as an instant never expires.
        let deadline = run.started.checked_add(self.config.run_timeout);
        info!(run_id = %run.id, question = %run.question.text(), "Processing question");

        let finished = self.drive(&mut run, deadline, cancel).await;
        run.transition(RunState::Terminal(finished.status));
        let envelope = self.envelope(&run, finished);

        match envelope.status {
            RunStatus::Success | RunStatus::PartialSuccess => {
                info!(run_id = %run.id, status = %envelope.status, retries = envelope.retry_count, "✅ Run finished")
            }
            RunStatus::UnknownError => error!(run_id = %run.id, "❌ Run failed: {}", envelope.message),
            _ => warn!(run_id = %run.id, status = %envelope.status, "⚠️  Run finished without a result"),
        }

        self.record_history(&envelope);
        envelope
    }

    fn checkpoint(&self, run: &OrchestrationRun, deadline: Option<Instant>, cancel: &CancellationToken) -> Option<Step> {
        if cancel.is_cancelled() {
            return Some(Step::Finish(RunStatus::Cancelled, "The request was cancelled".to_string()));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Some(Step::Finish(
                RunStatus::QuotaExceeded,
                format!(
                    "The run used its {} s time budget before finishing ({:?})",
                    self.config.run_timeout.as_secs(),
                    run.state
                ),
            ));
        }
        None
    }

    async fn drive(&self, run: &mut OrchestrationRun, deadline: Option<Instant>, cancel: &CancellationToken) -> Finished {
        let level = self.level_for(run.question.user());

        // intent
        if let Some(Step::Finish(status, message)) = self.checkpoint(run, deadline, cancel) {
            return Self::finished(status, message);
        }
        let since = Instant::now();
        let intent = self.classifier.classify(&run.question).await;
        run.time_stage("intent", since);
        run.intent = Some(intent.clone());
        run.transition(RunState::IntentResolved);
        if !intent.takes_sql_path() {
            let message = match intent.route {
                IntentRoute::Unresolved => "The question could not be classified; please rephrase it".to_string(),
                route => format!("The question was routed to {} and needs no database query", route),
            };
            return Self::finished(RunStatus::IntentMismatch, message);
        }

        // schema
        if let Some(Step::Finish(status, message)) = self.checkpoint(run, deadline, cancel) {
            return Self::finished(status, message);
        }
        let since = Instant::now();
        let schema = match tokio::time::timeout(self.config.schema_timeout, self.schema.lookup(None)).await {
            Ok(Ok(schema)) => schema,
            Ok(Err(e)) => {
                return Self::finished(RunStatus::UnknownError, format!("Schema context unavailable: {}", e));
            }
            Err(_) => {
                return Self::finished(RunStatus::UnknownError, "Schema context lookup timed out".to_string());
            }
        };
        run.time_stage("schema", since);

        // generation
        if let Some(Step::Finish(status, message)) = self.checkpoint(run, deadline, cancel) {
            return Self::finished(status, message);
        }
        let row_limit = run.question.row_limit(self.config.max_result_rows);
        let since = Instant::now();
        let candidate = self
            .generator
            .generate(&run.question, &schema, self.validator.policy(), &self.exemplars, row_limit)
            .await;
        run.time_stage("generation", since);
        if !candidate.is_viable() {
            return Self::finished(
                RunStatus::UnknownError,
                format!("No query could be generated: {}", candidate.justification),
            );
        }
        run.push_candidate(candidate);
        run.transition(RunState::Generated);

        let mut step = Step::Validate;
        loop {
            // Rows already fetched are kept; only the model call is skipped.
            if !matches!(step, Step::Finish(..) | Step::Explain(..)) {
                if let Some(stop) = self.checkpoint(run, deadline, cancel) {
                    step = stop;
                }
            }
            step = match step {
                Step::Validate => self.validate(run, level),
                Step::Execute(sql) => self.execute(run, sql, row_limit).await,
                Step::Repair => self.repair(run, &schema).await,
                Step::Explain(sql, result) => {
                    let since = Instant::now();
                    let stopped = self.checkpoint(run, deadline, cancel);
                    let explanation = match &stopped {
                        Some(_) => self.explainer.explain_offline(&result, &run.question),
                        None => self.explainer.explain(&sql, &result, &run.question).await,
                    };
                    run.time_stage("explanation", since);
                    run.transition(RunState::Explained);
                    let (status, message) = match stopped {
                        Some(Step::Finish(reason, _)) => {
                            warn!(run_id = %run.id, reason = %reason, "⚠️  Stopped before explanation, keeping rows");
                            (
                                RunStatus::PartialSuccess,
                                format!("Query succeeded; the explanation was skipped ({})", reason),
                            )
                        }
                        _ if explanation.degraded => {
                            (RunStatus::PartialSuccess, "Query succeeded; the explanation is a summary template".to_string())
                        }
                        _ => (RunStatus::Success, "Query succeeded".to_string()),
                    };
                    return Finished {
                        status,
                        message,
                        final_query: Some(sql),
                        result: Some(result),
                        explanation: Some(explanation),
                    };
                }
                Step::Finish(status, message) => {
                    return Finished {
                        status,
                        message,
                        final_query: Self::final_query(run),
                        result: None,
                        explanation: None,
                    };
                }
            };
        }
    }

    fn validate(&self, run: &mut OrchestrationRun, level: ValidationLevel) -> Step {
        let since = Instant::now();
        let Some(candidate) = run.current().map(|r| r.candidate.clone()) else {
            return Step::Finish(RunStatus::UnknownError, "No candidate to validate".to_string());
        };
        let verdict = self.validator.validate(&candidate, run.question.user(), level);
        run.time_stage("validation", since);
        info!(
            run_id = %run.id,
            revision = candidate.revision,
            is_valid = verdict.is_valid,
            blocking = ?verdict.blocking_categories(),
            "Candidate validated"
        );

        let next = if verdict.is_valid {
            Step::Execute(verdict.sanitized_query.clone())
        } else {
            let detail = FailureDetail::Validation(verdict.clone());
            run.record_failure(detail.clone());
            self.route_failure(run, detail)
        };
        run.record_verdict(verdict);
        run.transition(RunState::Validated);
        next
    }

    async fn execute(&self, run: &mut OrchestrationRun, sql: String, row_limit: usize) -> Step {
        let since = Instant::now();
        let budget = self.config.query_timeout;
        let call = self.executor.run(&sql, row_limit, budget);
        let outcome = match tokio::time::timeout(budget.saturating_add(EXECUTOR_GRACE), call).await {
            Ok(outcome) => outcome,
            Err(_) => ExecutionOutcome::Failed(ExecutionFailure::timeout(budget)),
        };
        run.time_stage("execution", since);
        run.transition(RunState::Executed);

        match outcome {
            ExecutionOutcome::Rows(result) => {
                info!(run_id = %run.id, rows = result.row_count, "Query executed");
                Step::Explain(sql, result)
            }
            ExecutionOutcome::Failed(failure) => {
                warn!(run_id = %run.id, timed_out = failure.timed_out, "⚠️  Execution failed");
                let detail = FailureDetail::Execution(failure);
                run.record_failure(detail.clone());
                self.route_failure(run, detail)
            }
        }
    }

    /// Spend one unit of budget on a critic pass, or end the run.
    async fn repair(&self, run: &mut OrchestrationRun, schema: &SchemaSnapshot) -> Step {
        run.transition(RunState::Repairing);
        run.consume_repair();
        let attempt = run.repairs;

        let Some((failing, failure)) = run.last_viable_failure() else {
            return Step::Finish(RunStatus::UnknownError, "Nothing to repair".to_string());
        };
        let (failing, failure) = (failing.clone(), failure.clone());

        let since = Instant::now();
        let (analysis, candidate) = self
            .critic
            .analyze_and_repair(&failing, &failure, schema, &run.question)
            .await;
        run.time_stage("repair", since);
        info!(
            run_id = %run.id,
            attempt,
            error_type = %analysis.error_type,
            strategy = %analysis.strategy,
            "Repair attempt"
        );
        // The backend no longer matches the snapshot; later runs refetch it.
        if matches!(failure, FailureDetail::Execution(_)) && analysis.strategy == RepairStrategy::SchemaAlignment {
            self.schema.invalidate().await;
        }
        run.attach_analysis(analysis);

        let viable = candidate.is_viable();
        run.push_candidate(candidate);
        if viable {
            Step::Validate
        } else {
            warn!(run_id = %run.id, attempt, "⚠️  Repair produced no usable candidate");
            self.route_failure(run, failure)
        }
    }

    fn route_failure(&self, run: &OrchestrationRun, failure: FailureDetail) -> Step {
        if run.can_repair() {
            return Step::Repair;
        }
        let (status, message) = Self::exhausted(run, &failure);
        Step::Finish(status, message)
    }

    fn exhausted(run: &OrchestrationRun, failure: &FailureDetail) -> (RunStatus, String) {
        let repairs = run.repairs;
        match failure {
            FailureDetail::Validation(verdict) if verdict.is_threat_based() => (
                RunStatus::SecurityViolation,
                format!(
                    "The query was blocked by security policy ({}) after {} repair attempt(s)",
                    verdict
                        .blocking_categories()
                        .iter()
                        .filter(|c| c.is_security_threat())
                        .join(", "),
                    repairs
                ),
            ),
            FailureDetail::Validation(verdict) => (
                RunStatus::ValidationFailed,
                format!(
                    "The query did not pass validation after {} repair attempt(s): {}",
                    repairs,
                    verdict.blocking_categories().iter().join(", ")
                ),
            ),
            FailureDetail::Execution(_) => {
                // Backend text stays in diagnostics.
                let cause = run
                    .analyses
                    .last()
                    .map(|a| a.error_type.to_string())
                    .unwrap_or_else(|| "database error".to_string());
                (
                    RunStatus::ExecutionFailed,
                    format!("The query could not be executed after {} repair attempt(s): {}", repairs, cause),
                )
            }
        }
    }

    /// Sanitized text of the newest valid verdict, else the newest non-empty candidate.
    fn final_query(run: &OrchestrationRun) -> Option<String> {
        run.chain
            .iter()
            .rev()
            .find_map(|r| r.verdict.as_ref().filter(|v| v.is_valid).map(|v| v.sanitized_query.clone()))
            .or_else(|| {
                run.chain
                    .iter()
                    .rev()
                    .map(|r| r.candidate.query.clone())
                    .find(|q| !q.trim().is_empty())
            })
    }

    fn finished(status: RunStatus, message: String) -> Finished {
        Finished {
            status,
            message,
            final_query: None,
            result: None,
            explanation: None,
        }
    }

    fn envelope(&self, run: &OrchestrationRun, finished: Finished) -> ResponseEnvelope {
        let user = run.question.user();
        let level = self.level_for(user);
        let validation = run.last_verdict().map(|verdict| ValidationSummary {
            level,
            is_valid: verdict.is_valid,
            blocking: verdict.blocking_categories(),
            threats_seen: run.threats_seen.clone(),
            warnings: verdict.warnings.clone(),
            suggestions: verdict.suggestions.clone(),
            cost_score: verdict.cost_estimate.as_ref().map(|c| c.score),
        });

        let may_see_backend = user.has_permission(DIAGNOSTICS_PERMISSION) || level == ValidationLevel::Administrative;
        let diagnostics = if finished.status.is_success() {
            Diagnostics::default()
        } else {
            Diagnostics {
                last_analysis: run
                    .analyses
                    .last()
                    .map(|a| if may_see_backend { a.clone() } else { Self::withhold_backend_text(run, a) }),
                last_verdict: run.last_verdict().cloned(),
                backend_error: run
                    .last_execution_failure()
                    .filter(|_| may_see_backend)
                    .map(String::from),
            }
        };

        let (columns, rows, row_count, truncated) = match finished.result {
            Some(result) => (result.columns, result.rows, result.row_count, result.truncated),
            None => (Vec::new(), Vec::new(), 0, false),
        };

        ResponseEnvelope {
            run_id: run.id,
            status: finished.status,
            message: finished.message,
            question: run.question.text().to_string(),
            final_query: finished.final_query,
            columns,
            rows,
            row_count,
            truncated,
            explanation: finished.explanation,
            intent: run.intent.as_ref().map(IntentSummary::from),
            validation,
            retry_count: run.repairs,
            diagnostics,
            timing: Timing {
                started_at: run.started_at,
                total_ms: run.started.elapsed().as_millis() as u64,
                stage_ms: run.stage_ms.clone(),
            },
        }
    }

    /// Model analyses of execution failures were written from backend text,
    /// so their cause and fragments are replaced for unprivileged callers.
    fn withhold_backend_text(run: &OrchestrationRun, analysis: &ErrorAnalysis) -> ErrorAnalysis {
        let backend = match run
            .chain
            .get(analysis.failing_revision as usize)
            .and_then(|r| r.failure.as_ref())
        {
            Some(FailureDetail::Execution(f)) => f.message.as_str(),
            _ => return analysis.clone(),
        };
        let echoes = |text: &str| !backend.trim().is_empty() && text.contains(backend.trim());
        if analysis.source != AnalysisSource::Model
            && !echoes(&analysis.root_cause)
            && !analysis.fragments.iter().any(|f| echoes(f))
        {
            return analysis.clone();
        }
        ErrorAnalysis {
            root_cause: format!("{} (details withheld)", analysis.error_type),
            fragments: Vec::new(),
            ..analysis.clone()
        }
    }

    /// Fire and forget; the caller never waits on history.
    fn record_history(&self, envelope: &ResponseEnvelope) {
        let history = Arc::clone(&self.history);
        let envelope = envelope.clone();
        let timeout = self.config.history_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, history.record(&envelope)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(run_id = %envelope.run_id, "⚠️  History sink failed: {}", e),
                Err(_) => warn!(run_id = %envelope.run_id, "⚠️  History sink timed out"),
            }
        });
    }
}
