//! Keyword Rules
//!
//! Curated phrase sets per route and the deterministic scoring over them.

use crate::tokens;
use serde::{Deserialize, Serialize};

lazy_static::lazy_static! {
    /// Aggregation verbs and data nouns.
    static ref STRUCTURED_PHRASES: Vec<&'static str> = vec![
        "total", "sum", "count", "average", "avg", "how many", "list all", "show me",
        "top", "highest", "lowest", "distribution", "calculate", "compare", "sales amount",
        "revenue", "customers", "products", "orders", "profit margin", "trend", "per month",
        "by region", "breakdown",
    ];

    /// Policy-document nouns.
    static ref DOCUMENT_PHRASES: Vec<&'static str> = vec![
        "policy", "procedure", "definition", "requirements", "steps", "compliance",
        "according to", "standards", "framework", "code of conduct", "practices",
        "measures must be implemented", "criteria", "handle claims", "guideline", "handbook",
    ];

    /// Questions that need data analysis judged against policy context.
    static ref HYBRID_PHRASES: Vec<&'static str> = vec![
        "based on our", "according to our policy", "meet our requirements", "qualify as",
        "exceed our thresholds", "comply with our", "violate our policy", "within our policy",
    ];

    static ref GREETING_PHRASES: Vec<&'static str> = vec![
        "hi", "hello", "hey", "good morning", "good afternoon", "good evening", "thanks",
        "thank you", "who are you", "what can you do", "help",
    ];
}

/// Questions longer than this are never treated as pure small talk.
const MAX_GREETING_WORDS: usize = 6;

const CONFIDENCE_CAP: f64 = 0.95;

/// Per-route match counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteScores {
    pub structured: usize,
    pub document: usize,
    pub hybrid: usize,
    pub greeting: usize,
}

impl RouteScores {
    pub fn is_empty(&self) -> bool {
        self.structured + self.document + self.hybrid + self.greeting == 0
    }
}

/// Result of the deterministic pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeywordMatch {
    pub scores: RouteScores,
    /// `route:phrase` for every phrase that matched.
    pub matched: Vec<String>,
    pub short_question: bool,
}

fn collect(haystack: &str, route: &str, phrases: &[&'static str], matched: &mut Vec<String>) -> usize {
    let mut hits = 0;
    for phrase in phrases {
        if tokens::contains_phrase(haystack, phrase) {
            matched.push(format!("{}:{}", route, phrase));
            hits += 1;
        }
    }
    hits
}

pub fn scan(text: &str) -> KeywordMatch {
    let haystack = tokens::phrase_haystack(text);
    let mut matched = Vec::new();
    let scores = RouteScores {
        hybrid: collect(&haystack, "hybrid", &HYBRID_PHRASES, &mut matched),
        structured: collect(&haystack, "sql", &STRUCTURED_PHRASES, &mut matched),
        document: collect(&haystack, "document", &DOCUMENT_PHRASES, &mut matched),
        greeting: collect(&haystack, "greeting", &GREETING_PHRASES, &mut matched),
    };
    KeywordMatch {
        scores,
        matched,
        short_question: tokens::words(text).len() <= MAX_GREETING_WORDS,
    }
}

pub fn hybrid_confidence(hits: usize) -> f64 {
    (0.8 + 0.05 * hits as f64).min(CONFIDENCE_CAP)
}

pub fn single_route_confidence(hits: usize) -> f64 {
    (0.7 + 0.05 * hits as f64).min(CONFIDENCE_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_counts_phrases_on_word_boundaries() {
        let m = scan("Show me the total sales amount by region");
        assert_eq!(m.scores.structured, 4);
        assert_eq!(m.scores.document, 0);
        assert!(m.matched.contains(&"sql:sales amount".to_string()));

        // "stepson" must not count as "steps"
        assert_eq!(scan("list the stepsons").scores.document, 0);
    }

    #[test]
    fn test_hybrid_and_greeting() {
        let m = scan("Which suppliers exceed our thresholds for late delivery?");
        assert_eq!(m.scores.hybrid, 1);

        let g = scan("hello there!");
        assert_eq!(g.scores.greeting, 1);
        assert!(g.short_question);
    }

    #[test]
    fn test_confidence_is_capped() {
        assert!((single_route_confidence(1) - 0.75).abs() < 1e-9);
        assert!((hybrid_confidence(1) - 0.85).abs() < 1e-9);
        assert_eq!(single_route_confidence(20), 0.95);
        assert_eq!(hybrid_confidence(5), 0.95);
    }
}
