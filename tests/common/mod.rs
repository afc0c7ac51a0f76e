//! Scripted collaborators for driving the orchestrator without a model or a
//! database.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use sqlgov::error::{PipelineError, Result};
use sqlgov::execution::{ExecutionFailure, ExecutionOutcome, QueryExecutor, ResultSet, Row};
use sqlgov::llm::{CompletionEngine, CompletionPurpose, CompletionRequest};
use sqlgov::schema_context::{ColumnInfo, Relationship, SchemaSnapshot, StaticSchemaProvider, TableInfo};
use sqlgov::security::ValidatorPolicy;
use sqlgov::{Orchestrator, PipelineConfig};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Replies by request purpose. Repairs are served in order and the last
/// reply repeats once the script runs out.
#[derive(Default)]
pub struct ScriptedEngine {
    replies: Mutex<HashMap<CompletionPurpose, Vec<String>>>,
    calls: Mutex<Vec<CompletionPurpose>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, purpose: CompletionPurpose, text: impl Into<String>) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(purpose)
            .or_default()
            .push(text.into());
        self
    }

    pub fn generates(self, sql: &str) -> Self {
        self.reply(
            CompletionPurpose::QueryGeneration,
            json!({"sql": sql, "rationale": "scripted", "confidence": 0.85}).to_string(),
        )
    }

    pub fn repairs_to(self, sql: &str) -> Self {
        self.reply(
            CompletionPurpose::QueryRepair,
            json!({
                "error_type": "SemanticError",
                "root_cause": "scripted repair",
                "repair_strategy": "FullRewrite",
                "corrected_sql": sql,
                "confidence": 0.6
            })
            .to_string(),
        )
    }

    pub fn explains(self, text: &str) -> Self {
        self.reply(
            CompletionPurpose::ResultExplanation,
            json!({"explanation": text, "recommendations": ["Look closer"]}).to_string(),
        )
    }

    pub fn calls(&self, purpose: CompletionPurpose) -> usize {
        self.calls.lock().unwrap().iter().filter(|p| **p == purpose).count()
    }
}

#[async_trait]
impl CompletionEngine for ScriptedEngine {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            let index = calls.iter().filter(|p| **p == request.purpose).count();
            calls.push(request.purpose);
            index
        };
        let replies = self.replies.lock().unwrap();
        replies
            .get(&request.purpose)
            .and_then(|script| script.get(index).or_else(|| script.last()))
            .cloned()
            .ok_or_else(|| PipelineError::Completion(format!("no scripted reply for {:?}", request.purpose)))
    }
}

type Handler = Box<dyn Fn(&str) -> ExecutionOutcome + Send + Sync>;

/// Executor backed by a closure over the sanitized query text.
pub struct FakeExecutor {
    handler: Handler,
    delay: Duration,
    seen: Mutex<Vec<String>>,
}

impl FakeExecutor {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str) -> ExecutionOutcome + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            delay: Duration::ZERO,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn returning(rows: Vec<Row>) -> Self {
        Self::new(move |_| ExecutionOutcome::Rows(ResultSet::from_rows(rows.clone(), Duration::from_millis(3))))
    }

    /// Fails with `message` whenever the query mentions `needle`.
    pub fn failing_on(needle: &'static str, message: &'static str, rows: Vec<Row>) -> Self {
        Self::new(move |sql| {
            if sql.contains(needle) {
                ExecutionOutcome::Failed(ExecutionFailure::new(message))
            } else {
                ExecutionOutcome::Rows(ResultSet::from_rows(rows.clone(), Duration::from_millis(3)))
            }
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueryExecutor for FakeExecutor {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn run(&self, sql: &str, _row_limit: usize, _time_budget: Duration) -> ExecutionOutcome {
        self.seen.lock().unwrap().push(sql.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.handler)(sql)
    }
}

pub fn rows(values: Vec<serde_json::Value>) -> Vec<Row> {
    values
        .into_iter()
        .filter_map(|v| v.as_object().cloned())
        .collect()
}

fn column(name: &str, data_type: &str) -> ColumnInfo {
    ColumnInfo {
        name: name.into(),
        data_type: data_type.into(),
        nullable: true,
        description: None,
    }
}

fn table(name: &str, columns: Vec<ColumnInfo>) -> TableInfo {
    TableInfo {
        name: name.into(),
        description: None,
        columns,
        primary_key: vec!["id".into()],
        row_estimate: None,
        sample_rows: Vec::new(),
    }
}

pub fn shop_schema() -> SchemaSnapshot {
    SchemaSnapshot::new(
        vec![
            table(
                "customers",
                vec![
                    column("id", "integer"),
                    column("customer_name", "text"),
                    column("email", "text"),
                    column("region", "text"),
                ],
            ),
            table(
                "orders",
                vec![
                    column("id", "integer"),
                    column("customer_id", "integer"),
                    column("order_date", "date"),
                    column("total_amount", "numeric"),
                ],
            ),
            table(
                "order_items",
                vec![
                    column("id", "integer"),
                    column("order_id", "integer"),
                    column("product_id", "integer"),
                    column("quantity", "integer"),
                ],
            ),
        ],
        vec![
            Relationship {
                from_table: "orders".into(),
                from_column: "customer_id".into(),
                to_table: "customers".into(),
                to_column: "id".into(),
            },
            Relationship {
                from_table: "order_items".into(),
                from_column: "order_id".into(),
                to_table: "orders".into(),
                to_column: "id".into(),
            },
        ],
    )
}

pub fn shop_policy() -> ValidatorPolicy {
    let mut policy = ValidatorPolicy::default();
    policy.table_row_estimates.insert("order_items".into(), 5_000_000);
    policy.table_row_estimates.insert("customers".into(), 2_000);
    policy.table_row_estimates.insert("orders".into(), 50_000);
    policy
}

pub fn config() -> PipelineConfig {
    PipelineConfig::default().with_max_repair_attempts(2)
}

pub fn orchestrator(
    config: PipelineConfig,
    engine: Arc<ScriptedEngine>,
    executor: Arc<FakeExecutor>,
) -> Orchestrator {
    Orchestrator::new(
        config,
        shop_policy(),
        engine,
        Arc::new(StaticSchemaProvider::new(shop_schema())),
        executor,
    )
}
