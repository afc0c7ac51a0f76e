//! Agent Prompts - prompts for every model-backed pipeline stage
//!
//! Each stage has one JSON response contract, spelled out at the end of its
//! prompt. The structs that decode those contracts live next to the stage
//! that consumes them.

use crate::question::{ExplanationStyle, PriorTurn};
use crate::security::UserContext;
use std::fmt::Write as _;

/// System prompt for intent classification
pub const INTENT_SYSTEM_PROMPT: &str =
    "You route analytics questions. Return a single JSON object and nothing else.";

/// System prompt for query generation
pub const SQL_GENERATION_SYSTEM_PROMPT: &str = r#"You are a senior analytics engineer who writes PostgreSQL.
You only ever produce one read-only SELECT statement (CTEs allowed).
Never produce INSERT, UPDATE, DELETE, DROP, ALTER, TRUNCATE, GRANT or any administrative command.
Never add SQL comments. Return a single JSON object and nothing else."#;

/// System prompt for query repair
pub const SQL_REPAIR_SYSTEM_PROMPT: &str = r#"You are a SQL reviewer fixing a query that failed validation or execution.
Fix all identified issues while keeping the original intent of the question.
The corrected query must be one read-only SELECT statement without comments.
Return a single JSON object and nothing else."#;

/// System prompt for result explanation
pub const EXPLANATION_SYSTEM_PROMPT: &str = r#"You explain query results to business stakeholders in plain language.
Only state facts supported by the statistics and insights you are given.
Return a single JSON object and nothing else."#;

/// One worked example shown to the generator.
#[derive(Debug, Clone, Copy)]
pub struct PromptExample<'a> {
    pub question: &'a str,
    pub sql: &'a str,
}

/// Caller constraints the generator must respect.
#[derive(Debug, Clone)]
pub struct GenerationConstraints<'a> {
    pub row_limit: usize,
    pub user: &'a UserContext,
    pub region_columns: Vec<(String, String)>,
    pub restricted_columns: Vec<String>,
}

pub fn intent_classification_prompt(
    question: &str,
    user: &UserContext,
    prior: Option<&PriorTurn>,
    matched_patterns: &[String],
) -> String {
    let mut context = format!("- Role: {}\n", user.role.as_str());
    if let Some(region) = &user.region {
        let _ = writeln!(context, "- Region: {}", region);
    }
    if let Some(prior) = prior {
        let _ = writeln!(context, "- Previous question: \"{}\"", prior.question);
    }
    let matched = if matched_patterns.is_empty() {
        "none".to_string()
    } else {
        matched_patterns.join(", ")
    };

    format!(
        r#"### Query Intent Classification

Classify the user question into exactly one category.

### User Question:
"{question}"

### User Context:
{context}
### Categories:
- SQL: data analysis, calculations, aggregations or retrieval of specific records
  (e.g. "total sales", "top customers", "count of orders")
- DOCUMENT: policies, procedures, definitions, compliance or best practices
- HYBRID: needs data analysis AND policy context together
  (e.g. "which suppliers don't meet our policy requirements")
- CONVERSATIONAL: greetings, thanks, questions about the assistant itself

### Keyword patterns already matched:
{matched}

### Response (JSON):
{{"category": "SQL|DOCUMENT|HYBRID|CONVERSATIONAL", "confidence": 0.0-1.0, "reasoning": "one sentence"}}"#
    )
}

pub fn sql_generation_prompt(
    question: &str,
    schema: &str,
    examples: &[PromptExample<'_>],
    constraints: &GenerationConstraints<'_>,
) -> String {
    let mut examples_section = String::new();
    if !examples.is_empty() {
        examples_section.push_str("\n### Examples:\n");
        for example in examples {
            let _ = write!(examples_section, "Q: {}\nA: {}\n\n", example.question, example.sql);
        }
    }

    let mut rules = vec![
        "Go through the question and the schema word by word; use only tables and columns that exist".to_string(),
        "Use table aliases to prevent ambiguity".to_string(),
        "Cast the numerator to a float when computing a ratio".to_string(),
        "Use JOINs that follow the listed relationships".to_string(),
        "Handle NULLs with COALESCE or IS NOT NULL checks".to_string(),
        "Give computed columns meaningful aliases".to_string(),
        format!("Always end with LIMIT {} or less unless the result is a single aggregate row", constraints.row_limit),
    ];
    if let Some(allowed) = &constraints.user.allowed_tables {
        rules.push(format!(
            "Only these tables may be queried: {}",
            allowed.iter().cloned().collect::<Vec<_>>().join(", ")
        ));
    }
    if let Some(region) = &constraints.user.region {
        for (table, column) in &constraints.region_columns {
            rules.push(format!(
                "Every SELECT reading {} must include WHERE {}.{} = '{}'",
                table, table, column, region
            ));
        }
    }
    if !constraints.restricted_columns.is_empty() {
        rules.push(format!(
            "Never select these restricted columns or use SELECT * on their tables: {}",
            constraints.restricted_columns.join(", ")
        ));
    }
    let rules = rules
        .iter()
        .map(|r| format!("- {}", r))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"### Instructions:
Convert the question into one PostgreSQL SELECT query for the schema below.
Adhere to these rules:
{rules}

### Database Schema:
{schema}
{examples_section}
### Question:
{question}

### Response (JSON):
{{"sql": "SELECT ...", "rationale": "how the query answers the question", "tables": ["table", "..."], "confidence": 0.0-1.0}}"#
    )
}

pub fn sql_repair_prompt(
    question: &str,
    failing_sql: &str,
    failure: &str,
    diagnosis: Option<&str>,
    schema: &str,
) -> String {
    let diagnosis_section = match diagnosis {
        Some(d) => format!("\n### Diagnosis:\n{}\n", d),
        None => "\nDiagnose the failure yourself before correcting it.\n".to_string(),
    };

    format!(
        r#"### SQL Repair Task

### Question:
{question}

### Failing Query:
{failing_sql}

### Failure:
{failure}
{diagnosis_section}
### Database Schema:
{schema}

### Requirements:
1. Fix all identified issues
2. Keep the original intent of the question
3. Only a single SELECT statement, no comments
4. Use only tables and columns present in the schema

### Response (JSON):
{{"error_type": "SyntaxError|SemanticError|PermissionError|PerformanceError|LogicError|TypeError|UnclassifiedError",
 "root_cause": "one sentence",
 "repair_strategy": "SyntaxCorrection|SchemaAlignment|PermissionAdjustment|PerformanceOptimization|LogicRefinement|TypeCasting|FullRewrite",
 "fragments": ["offending fragment", "..."],
 "corrected_sql": "SELECT ...",
 "confidence": 0.0-1.0}}"#
    )
}

pub fn result_explanation_prompt(
    question: &str,
    query: &str,
    style: ExplanationStyle,
    row_count: usize,
    statistics: &str,
    insights: &str,
    sample_rows: &str,
) -> String {
    let style_rules = match style {
        ExplanationStyle::Concise => "Keep the explanation to 2-4 sentences.",
        ExplanationStyle::Detailed => {
            "Write one detailed paragraph covering every insight, then the implications."
        }
        ExplanationStyle::Technical => {
            "Write for an analyst: mention the query logic, the statistics and any caveats about the data."
        }
    };

    format!(
        r#"### Query Result Explanation

### Question:
"{question}"

### Query:
{query}

### Result: {row_count} row(s)

### Column Statistics:
{statistics}

### Discovered Insights (most significant first):
{insights}

### Sample Rows:
{sample_rows}

### Requirements:
1. Summarize the key findings in plain business language
2. Highlight the insights above where they matter
3. Provide context for the numbers
4. Suggest up to three concrete follow-up actions
5. {style_rules}

### Response (JSON):
{{"explanation": "prose", "recommendations": ["action", "..."]}}"#
    )
}
