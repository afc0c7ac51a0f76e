//! Intent Classifier
//!
//! Keyword rules first; the model is asked only when the rules are partial
//! or tied. Never returns an error: a failing engine yields `Unresolved`.

use crate::agent_prompts::{intent_classification_prompt, INTENT_SYSTEM_PROMPT};
use crate::intent::keywords::{self, KeywordMatch};
use crate::intent::{DecisionSource, IntentDecision, IntentRoute, IntentSignals};
use crate::llm::{parse_structured, CompletionEngine, CompletionPurpose, CompletionRequest};
use crate::question::Question;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Ceiling for decisions recovered from a malformed model answer.
const FALLBACK_CONFIDENCE_CAP: f64 = 0.3;
const GREETING_CONFIDENCE: f64 = 0.9;

#[derive(Debug, Deserialize)]
struct ClassificationResponse {
    category: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    reasoning: Option<String>,
}

fn route_from_category(category: &str) -> Option<IntentRoute> {
    match category.trim().to_uppercase().as_str() {
        "SQL" | "STRUCTURED" | "STRUCTURED_QUERY" => Some(IntentRoute::StructuredQuery),
        "DOCUMENT" | "DOCUMENT_SEARCH" => Some(IntentRoute::DocumentSearch),
        "HYBRID" => Some(IntentRoute::Hybrid),
        "CONVERSATIONAL" | "GREETING" => Some(IntentRoute::Conversational),
        _ => None,
    }
}

pub struct IntentClassifier {
    engine: Arc<dyn CompletionEngine>,
}

impl IntentClassifier {
    pub fn new(engine: Arc<dyn CompletionEngine>) -> Self {
        Self { engine }
    }

    pub async fn classify(&self, question: &Question) -> IntentDecision {
        let rules = keywords::scan(question.text());
        if let Some(decision) = Self::decide_by_rules(&rules) {
            info!(route = %decision.route, confidence = decision.confidence, "Intent resolved by keyword rules");
            return decision;
        }

        debug!(scores = ?rules.scores, "Keyword rules ambiguous, asking the model");
        let prompt = intent_classification_prompt(
            question.text(),
            question.user(),
            question.prior_turn(),
            &rules.matched,
        );
        let request = CompletionRequest::json(CompletionPurpose::IntentClassification, prompt)
            .with_system(INTENT_SYSTEM_PROMPT)
            .with_max_tokens(200);

        let raw = match self.engine.complete(&request).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("⚠️  Intent classification call failed: {}", e);
                return Self::decision(
                    IntentRoute::Unresolved,
                    0.0,
                    format!("classification unavailable: {}", e),
                    DecisionSource::EngineFailure,
                    rules,
                );
            }
        };

        let parsed = parse_structured::<ClassificationResponse>(&raw)
            .ok()
            .and_then(|r| route_from_category(&r.category).map(|route| (route, r)));

        match parsed {
            Some((route, response)) => {
                let confidence = response.confidence.unwrap_or(0.5).clamp(0.0, 1.0);
                let justification = response
                    .reasoning
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or_else(|| format!("model classified the question as {}", response.category));
                info!(route = %route, confidence, "Intent resolved by model");
                Self::decision(route, confidence, justification, DecisionSource::Model, rules)
            }
            None => {
                warn!("⚠️  Model classification did not match the contract, using keyword fallback");
                Self::fallback(rules)
            }
        }
    }

    /// The unambiguous cases: any hybrid phrase, exactly one of
    /// structured/document, or short small talk with nothing else.
    fn decide_by_rules(rules: &KeywordMatch) -> Option<IntentDecision> {
        let s = rules.scores;
        let (route, confidence, why) = if s.hybrid > 0 {
            (
                IntentRoute::Hybrid,
                keywords::hybrid_confidence(s.hybrid),
                "question weighs data against policy context",
            )
        } else if s.structured == 0 && s.document == 0 && s.greeting > 0 && rules.short_question {
            (IntentRoute::Conversational, GREETING_CONFIDENCE, "greeting or small talk")
        } else if s.structured > 0 && s.document == 0 {
            (
                IntentRoute::StructuredQuery,
                keywords::single_route_confidence(s.structured),
                "aggregation or data retrieval phrasing",
            )
        } else if s.document > 0 && s.structured == 0 {
            (
                IntentRoute::DocumentSearch,
                keywords::single_route_confidence(s.document),
                "policy or procedure phrasing",
            )
        } else {
            return None;
        };

        Some(Self::decision(
            route,
            confidence,
            format!("{} ({})", why, rules.matched.join(", ")),
            DecisionSource::KeywordRules,
            rules.clone(),
        ))
    }

    fn fallback(rules: KeywordMatch) -> IntentDecision {
        let s = rules.scores;
        let (route, confidence) = if s.structured > 0 && s.structured >= s.document {
            (
                IntentRoute::StructuredQuery,
                keywords::single_route_confidence(s.structured).min(FALLBACK_CONFIDENCE_CAP),
            )
        } else if s.document > 0 {
            (
                IntentRoute::DocumentSearch,
                keywords::single_route_confidence(s.document).min(FALLBACK_CONFIDENCE_CAP),
            )
        } else if s.greeting > 0 {
            (IntentRoute::Conversational, FALLBACK_CONFIDENCE_CAP)
        } else {
            (IntentRoute::Unresolved, 0.0)
        };
        Self::decision(
            route,
            confidence,
            "model answer unusable; leading keyword match".to_string(),
            DecisionSource::ModelFallback,
            rules,
        )
    }

    fn decision(
        route: IntentRoute,
        confidence: f64,
        justification: String,
        source: DecisionSource,
        rules: KeywordMatch,
    ) -> IntentDecision {
        IntentDecision {
            route,
            confidence,
            justification,
            signals: IntentSignals {
                source,
                matched_patterns: rules.matched,
                scores: rules.scores,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PipelineError, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CannedEngine {
        reply: Option<&'static str>,
        calls: AtomicUsize,
    }

    impl CannedEngine {
        fn new(reply: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CompletionEngine for CannedEngine {
        async fn complete(&self, request: &CompletionRequest) -> Result<String> {
            assert_eq!(request.purpose, CompletionPurpose::IntentClassification);
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply
                .map(String::from)
                .ok_or_else(|| PipelineError::Completion("connection refused".into()))
        }
    }

    fn q(text: &str) -> Question {
        Question::new(text).unwrap()
    }

    #[tokio::test]
    async fn test_unambiguous_rules_skip_the_model() {
        let engine = CannedEngine::new(None);
        let classifier = IntentClassifier::new(engine.clone());

        let d = classifier.classify(&q("top 5 customers by total sales")).await;
        assert_eq!(d.route, IntentRoute::StructuredQuery);
        assert_eq!(d.signals.source, DecisionSource::KeywordRules);
        assert!(d.confidence >= 0.7);

        let d = classifier.classify(&q("What is our code of conduct?")).await;
        assert_eq!(d.route, IntentRoute::DocumentSearch);

        let d = classifier.classify(&q("Which vendors qualify as preferred suppliers?")).await;
        assert_eq!(d.route, IntentRoute::Hybrid);

        let d = classifier.classify(&q("hello!")).await;
        assert_eq!(d.route, IntentRoute::Conversational);

        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_tie_goes_to_the_model() {
        let engine = CannedEngine::new(Some(
            r#"{"category": "SQL", "confidence": 0.82, "reasoning": "asks for a count"}"#,
        ));
        let classifier = IntentClassifier::new(engine.clone());
        let d = classifier
            .classify(&q("count the steps in the onboarding procedure"))
            .await;
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
        assert_eq!(d.route, IntentRoute::StructuredQuery);
        assert_eq!(d.signals.source, DecisionSource::Model);
        assert!((d.confidence - 0.82).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_malformed_answer_falls_back_with_low_confidence() {
        let engine = CannedEngine::new(Some("I think this is about data."));
        let classifier = IntentClassifier::new(engine);
        let d = classifier
            .classify(&q("compare total orders against the compliance criteria"))
            .await;
        assert_eq!(d.route, IntentRoute::StructuredQuery);
        assert_eq!(d.signals.source, DecisionSource::ModelFallback);
        assert!(d.confidence <= 0.3);

        let engine = CannedEngine::new(Some(r#"{"category": "WEATHER"}"#));
        let d = IntentClassifier::new(engine).classify(&q("quarterly numbers please")).await;
        assert_eq!(d.route, IntentRoute::Unresolved);
        assert_eq!(d.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_engine_failure_is_unresolved() {
        let classifier = IntentClassifier::new(CannedEngine::new(None));
        let d = classifier.classify(&q("quarterly numbers please")).await;
        assert_eq!(d.route, IntentRoute::Unresolved);
        assert_eq!(d.confidence, 0.0);
        assert_eq!(d.signals.source, DecisionSource::EngineFailure);
    }
}
