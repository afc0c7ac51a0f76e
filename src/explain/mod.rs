//! Result Explainer
//!
//! Profiles a result set, detects insights and asks the model for a
//! plain-language explanation. Falls back to a template built from the same
//! statistics when the model is unavailable, so rows never go unexplained.

pub mod insights;
pub mod statistics;

use crate::agent_prompts::{result_explanation_prompt, EXPLANATION_SYSTEM_PROMPT};
use crate::execution::ResultSet;
use crate::llm::{parse_structured, CompletionEngine, CompletionPurpose, CompletionRequest};
use crate::question::Question;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

pub use insights::{DataInsight, InsightDetector, InsightKind};
pub use statistics::{ColumnKind, ColumnStatistics};

const PROMPT_SAMPLE_ROWS: usize = 5;
const MAX_RECOMMENDATIONS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExplanationSource {
    Model,
    Template,
    NoRows,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Explanation {
    pub text: String,
    pub recommendations: Vec<String>,
    pub insights: Vec<DataInsight>,
    pub statistics: Vec<ColumnStatistics>,
    /// The model was wanted but unavailable; `text` is a template.
    pub degraded: bool,
    pub source: ExplanationSource,
}

#[derive(Debug, Deserialize)]
struct ExplanationResponse {
    explanation: String,
    #[serde(default)]
    recommendations: Vec<String>,
}

pub struct ResultExplainer {
    engine: Arc<dyn CompletionEngine>,
    detector: InsightDetector,
}

impl ResultExplainer {
    pub fn new(engine: Arc<dyn CompletionEngine>, outlier_sigma: f64, max_insights: usize) -> Self {
        Self {
            engine,
            detector: InsightDetector::new(outlier_sigma, max_insights),
        }
    }

    pub async fn explain(&self, query: &str, result: &ResultSet, question: &Question) -> Explanation {
        if result.is_empty() {
            return Self::no_rows(question);
        }

        let stats = statistics::column_statistics(result);
        let insights = self.detector.detect(result, &stats, question.text());
        debug!(insights = insights.len(), "Detected result insights");

        let sample = result
            .rows
            .iter()
            .take(PROMPT_SAMPLE_ROWS)
            .map(|r| serde_json::Value::Object(r.clone()).to_string())
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = result_explanation_prompt(
            question.text(),
            query,
            question.preferences().explanation_style,
            result.row_count,
            &statistics::render(&stats),
            &insights::render(&insights),
            &sample,
        );
        let request = CompletionRequest::json(CompletionPurpose::ResultExplanation, prompt)
            .with_system(EXPLANATION_SYSTEM_PROMPT)
            .with_temperature(0.3);

        let response = match self.engine.complete(&request).await {
            Ok(raw) => parse_structured::<ExplanationResponse>(&raw),
            Err(e) => Err(e),
        };

        match response {
            Ok(response) if !response.explanation.trim().is_empty() => Explanation {
                text: response.explanation.trim().to_string(),
                recommendations: response
                    .recommendations
                    .into_iter()
                    .filter(|r| !r.trim().is_empty())
                    .take(MAX_RECOMMENDATIONS)
                    .collect(),
                insights,
                statistics: stats,
                degraded: false,
                source: ExplanationSource::Model,
            },
            Ok(_) => {
                warn!("⚠️  Model returned an empty explanation, using template");
                Self::templated(result, stats, insights)
            }
            Err(e) => {
                warn!("⚠️  Explanation unavailable ({}), using template", e);
                Self::templated(result, stats, insights)
            }
        }
    }

    /// Statistics and insights only, without a model call.
    pub fn explain_offline(&self, result: &ResultSet, question: &Question) -> Explanation {
        if result.is_empty() {
            return Self::no_rows(question);
        }
        let stats = statistics::column_statistics(result);
        let insights = self.detector.detect(result, &stats, question.text());
        Self::templated(result, stats, insights)
    }

    fn no_rows(question: &Question) -> Explanation {
        Explanation {
            text: format!(
                "No matching rows were found for \"{}\". The query ran successfully but nothing met its conditions.",
                question.text()
            ),
            recommendations: vec![
                "Broaden the filters or the time range".to_string(),
                "Check that the names and values in the question match the data".to_string(),
            ],
            insights: Vec::new(),
            statistics: Vec::new(),
            degraded: false,
            source: ExplanationSource::NoRows,
        }
    }

    fn templated(result: &ResultSet, stats: Vec<ColumnStatistics>, insights: Vec<DataInsight>) -> Explanation {
        let mut text = format!(
            "The query returned {} row{}{}.",
            result.row_count,
            if result.row_count == 1 { "" } else { "s" },
            if result.truncated { " (truncated at the row limit)" } else { "" }
        );
        if let Some((column, n)) = stats
            .iter()
            .find_map(|s| s.numeric.as_ref().map(|n| (&s.column, n)))
        {
            text.push_str(&format!(
                " {} ranges from {:.2} to {:.2} with a mean of {:.2}.",
                column, n.min, n.max, n.mean
            ));
        }
        for insight in &insights {
            text.push(' ');
            text.push_str(&insight.description);
            text.push('.');
        }

        Explanation {
            text,
            recommendations: Vec::new(),
            insights,
            statistics: stats,
            degraded: true,
            source: ExplanationSource::Template,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PipelineError, Result};
    use crate::execution::Row;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct Reply(Option<&'static str>);

    #[async_trait]
    impl CompletionEngine for Reply {
        async fn complete(&self, request: &CompletionRequest) -> Result<String> {
            assert_eq!(request.purpose, CompletionPurpose::ResultExplanation);
            self.0
                .map(String::from)
                .ok_or_else(|| PipelineError::CompletionTimeout(Duration::from_secs(30)))
        }
    }

    fn rows() -> ResultSet {
        let rows: Vec<Row> = vec![
            json!({"region": "West", "revenue": 1200}),
            json!({"region": "East", "revenue": 800}),
        ]
        .into_iter()
        .map(|r| r.as_object().unwrap().clone())
        .collect();
        ResultSet::from_rows(rows, Duration::from_millis(4))
    }

    fn question() -> Question {
        Question::new("revenue by region").unwrap()
    }

    #[tokio::test]
    async fn test_model_explanation() {
        let explainer = ResultExplainer::new(
            Arc::new(Reply(Some(
                r#"{"explanation": "West leads with 1,200 in revenue.", "recommendations": ["Investigate East", "", "a", "b", "c"]}"#,
            ))),
            2.0,
            3,
        );
        let e = explainer.explain("SELECT ...", &rows(), &question()).await;
        assert_eq!(e.source, ExplanationSource::Model);
        assert!(!e.degraded);
        assert_eq!(e.text, "West leads with 1,200 in revenue.");
        assert_eq!(e.recommendations, vec!["Investigate East", "a", "b"]);
        assert_eq!(e.statistics.len(), 2);
    }

    #[tokio::test]
    async fn test_engine_failure_degrades_to_template() {
        let explainer = ResultExplainer::new(Arc::new(Reply(None)), 2.0, 3);
        let e = explainer.explain("SELECT ...", &rows(), &question()).await;
        assert!(e.degraded);
        assert_eq!(e.source, ExplanationSource::Template);
        assert!(e.text.starts_with("The query returned 2 rows."));
        assert!(e.text.contains("revenue ranges from 800.00 to 1200.00"));
    }

    #[tokio::test]
    async fn test_zero_rows_skip_the_model() {
        // Reply(None) would degrade; the no-rows path must not call it at all.
        let explainer = ResultExplainer::new(Arc::new(Reply(None)), 2.0, 3);
        let empty = ResultSet::from_rows(Vec::new(), Duration::ZERO);
        let e = explainer.explain("SELECT ...", &empty, &question()).await;
        assert_eq!(e.source, ExplanationSource::NoRows);
        assert!(!e.degraded);
        assert!(e.text.starts_with("No matching rows"));
    }

    #[test]
    fn test_offline_explanation_uses_the_template() {
        let explainer = ResultExplainer::new(Arc::new(Reply(Some(r#"{"explanation": "unused"}"#))), 2.0, 3);
        let e = explainer.explain_offline(&rows(), &question());
        assert_eq!(e.source, ExplanationSource::Template);
        assert!(e.degraded);
        assert!(e.text.starts_with("The query returned 2 rows."));
    }
}
