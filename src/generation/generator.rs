//! Query Generator
//!
//! Relevant schema, a few worked examples and the caller's constraints go
//! into one prompt; one completion comes back as the first candidate.

use crate::agent_prompts::{
    sql_generation_prompt, GenerationConstraints, PromptExample, SQL_GENERATION_SYSTEM_PROMPT,
};
use crate::generation::exemplars::{Exemplar, ExemplarSelector};
use crate::generation::{heuristic_confidence, CandidateOrigin, QueryCandidate};
use crate::llm::{parse_structured, CompletionEngine, CompletionPurpose, CompletionRequest};
use crate::question::Question;
use crate::schema_context::{SchemaRetriever, SchemaSnapshot};
use crate::security::ast;
use crate::security::ValidatorPolicy;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

const PROMPT_SAMPLE_ROWS: usize = 2;

#[derive(Debug, Deserialize)]
struct GenerationResponse {
    sql: String,
    #[serde(default)]
    rationale: Option<String>,
    #[serde(default)]
    tables: Vec<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

pub struct QueryGenerator {
    engine: Arc<dyn CompletionEngine>,
    retriever: SchemaRetriever,
    exemplars: ExemplarSelector,
}

impl QueryGenerator {
    pub fn new(engine: Arc<dyn CompletionEngine>, max_tables: usize, max_exemplars: usize) -> Self {
        Self {
            engine,
            retriever: SchemaRetriever::new(max_tables),
            exemplars: ExemplarSelector::new(max_exemplars),
        }
    }

    /// The first candidate for `question`. Never fails: an engine error or an
    /// unusable answer yields an empty candidate with confidence 0.
    pub async fn generate(
        &self,
        question: &Question,
        schema: &SchemaSnapshot,
        policy: &ValidatorPolicy,
        exemplars: &[Exemplar],
        row_limit: usize,
    ) -> QueryCandidate {
        let tables = self.retriever.select_tables(schema, question);
        let relevant = schema.restrict(&tables);
        let examples: Vec<PromptExample<'_>> = self
            .exemplars
            .select(question.text(), exemplars)
            .into_iter()
            .map(|e| PromptExample {
                question: &e.question,
                sql: &e.sql,
            })
            .collect();
        debug!(tables = ?tables, examples = examples.len(), "Assembling generation prompt");

        let constraints = Self::constraints(question, policy, &tables, row_limit);
        let prompt = sql_generation_prompt(
            question.text(),
            &relevant.render_for_prompt(PROMPT_SAMPLE_ROWS),
            &examples,
            &constraints,
        );
        let request = CompletionRequest::json(CompletionPurpose::QueryGeneration, prompt)
            .with_system(SQL_GENERATION_SYSTEM_PROMPT);

        let raw = match self.engine.complete(&request).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("⚠️  Query generation call failed: {}", e);
                return QueryCandidate::empty(0, CandidateOrigin::Generated, format!("generation failed: {}", e));
            }
        };
        let response = match parse_structured::<GenerationResponse>(&raw) {
            Ok(response) if !response.sql.trim().is_empty() => response,
            Ok(_) => {
                warn!("⚠️  Model returned an empty query");
                return QueryCandidate::empty(0, CandidateOrigin::Generated, "model returned no query");
            }
            Err(e) => {
                warn!("⚠️  {}", e);
                return QueryCandidate::empty(0, CandidateOrigin::Generated, e.to_string());
            }
        };

        let candidate = Self::candidate_from(response, schema);
        info!(confidence = candidate.confidence, tables = ?candidate.tables, "Generated candidate query");
        candidate
    }

    fn constraints<'a>(
        question: &'a Question,
        policy: &ValidatorPolicy,
        tables: &[String],
        row_limit: usize,
    ) -> GenerationConstraints<'a> {
        let user = question.user();
        let mut region_columns = Vec::new();
        let mut restricted_columns = Vec::new();
        for table in tables {
            let key = table.to_lowercase();
            if let Some(column) = policy.region_column(&key) {
                region_columns.push((table.clone(), column.to_string()));
            }
            if !user.has_permission(&policy.restricted_permission) {
                restricted_columns.extend(
                    policy
                        .restricted_columns_for(&key)
                        .iter()
                        .map(|c| format!("{}.{}", table, c)),
                );
            }
        }
        GenerationConstraints {
            row_limit,
            user,
            region_columns,
            restricted_columns,
        }
    }

    fn candidate_from(response: GenerationResponse, schema: &SchemaSnapshot) -> QueryCandidate {
        let query = response.sql.trim().to_string();
        let mut warnings = Vec::new();

        let tables = if response.tables.is_empty() {
            ast::referenced_tables(&query)
        } else {
            response.tables
        };
        for table in &tables {
            if schema.table(table).is_none() {
                warnings.push(format!("table {} is not in the schema snapshot", table));
            }
        }
        if !ast::is_single_read_only_selection(&query) {
            warnings.push("query is not a single read-only SELECT".to_string());
        }

        let confidence = response
            .confidence
            .map(|c| c.clamp(0.0, 1.0))
            .unwrap_or_else(|| heuristic_confidence(warnings.len()));

        QueryCandidate {
            revision: 0,
            query,
            confidence,
            justification: response.rationale.unwrap_or_default(),
            tables,
            cost_estimate: None,
            warnings,
            origin: CandidateOrigin::Generated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PipelineError, Result};
    use crate::schema_context::tests::sample_snapshot;
    use crate::security::UserContext;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingEngine {
        reply: Result<String>,
        prompts: Mutex<Vec<String>>,
    }

    impl RecordingEngine {
        fn replying(reply: Result<String>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionEngine for RecordingEngine {
        async fn complete(&self, request: &CompletionRequest) -> Result<String> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            match &self.reply {
                Ok(s) => Ok(s.clone()),
                Err(e) => Err(PipelineError::Completion(e.to_string())),
            }
        }
    }

    fn regional_policy() -> ValidatorPolicy {
        serde_json::from_str::<ValidatorPolicy>(
            r#"{"regional_tables": {"customers": "region"},
                "restricted_columns": {"customers": ["email"]}}"#,
        )
        .unwrap()
        .normalized()
    }

    #[tokio::test]
    async fn test_generate_parses_contract_and_constrains_prompt() {
        let engine = RecordingEngine::replying(Ok(
            r#"{"sql": "SELECT c.customer_name FROM customers c WHERE c.region = 'West' LIMIT 5",
                "rationale": "filter to the caller's region", "confidence": 0.9}"#
                .to_string(),
        ));
        let generator = QueryGenerator::new(engine.clone(), 4, 2);
        let question = Question::new("list customers")
            .unwrap()
            .with_user(UserContext::default().with_region("West"));
        let exemplars = vec![Exemplar::new("list all customers", "SELECT * FROM customers LIMIT 10")];

        let candidate = generator
            .generate(&question, &sample_snapshot(), &regional_policy(), &exemplars, 50)
            .await;

        assert_eq!(candidate.revision, 0);
        assert!((candidate.confidence - 0.9).abs() < 1e-9);
        assert_eq!(candidate.tables, vec!["customers".to_string()]);
        assert!(candidate.warnings.is_empty());

        let prompts = engine.prompts.lock().unwrap();
        assert!(prompts[0].contains("customers.region = 'West'"));
        assert!(prompts[0].contains("customers.email"));
        assert!(prompts[0].contains("LIMIT 50"));
        assert!(prompts[0].contains("Q: list all customers"));
    }

    #[tokio::test]
    async fn test_heuristic_confidence_when_model_omits_it() {
        let engine = RecordingEngine::replying(Ok(r#"{"sql": "SELECT * FROM invoices"}"#.to_string()));
        let generator = QueryGenerator::new(engine, 4, 2);
        let candidate = generator
            .generate(&Question::new("invoices").unwrap(), &sample_snapshot(), &ValidatorPolicy::default(), &[], 10)
            .await;
        assert_eq!(candidate.tables, vec!["invoices".to_string()]);
        assert_eq!(candidate.warnings.len(), 1);
        assert!((candidate.confidence - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_engine_error_yields_empty_candidate() {
        let engine = RecordingEngine::replying(Err(PipelineError::Completion("503".into())));
        let generator = QueryGenerator::new(engine, 4, 2);
        let candidate = generator
            .generate(&Question::new("orders").unwrap(), &sample_snapshot(), &ValidatorPolicy::default(), &[], 10)
            .await;
        assert!(candidate.is_empty());
        assert_eq!(candidate.confidence, 0.0);

        let engine = RecordingEngine::replying(Ok("SELECT 1".to_string()));
        let candidate = QueryGenerator::new(engine, 4, 2)
            .generate(&Question::new("orders").unwrap(), &sample_snapshot(), &ValidatorPolicy::default(), &[], 10)
            .await;
        assert!(!candidate.is_viable());
    }
}
