//! Error Classifier
//!
//! Classifies failures into a taxonomy for recovery. Backend messages are
//! matched against known patterns; validator verdicts map by threat
//! category. Anything unmatched is left for the model to diagnose.

use crate::security::{ThreatCategory, ValidationVerdict};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorType {
    SyntaxError,
    SemanticError,
    PermissionError,
    PerformanceError,
    LogicError,
    TypeError,
    UnclassifiedError,
}

impl ErrorType {
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "SyntaxError" => ErrorType::SyntaxError,
            "SemanticError" => ErrorType::SemanticError,
            "PermissionError" => ErrorType::PermissionError,
            "PerformanceError" => ErrorType::PerformanceError,
            "LogicError" => ErrorType::LogicError,
            "TypeError" => ErrorType::TypeError,
            _ => ErrorType::UnclassifiedError,
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepairStrategy {
    SyntaxCorrection,
    SchemaAlignment,
    PermissionAdjustment,
    PerformanceOptimization,
    LogicRefinement,
    TypeCasting,
    FullRewrite,
}

impl RepairStrategy {
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "SyntaxCorrection" => RepairStrategy::SyntaxCorrection,
            "SchemaAlignment" => RepairStrategy::SchemaAlignment,
            "PermissionAdjustment" => RepairStrategy::PermissionAdjustment,
            "PerformanceOptimization" => RepairStrategy::PerformanceOptimization,
            "LogicRefinement" => RepairStrategy::LogicRefinement,
            "TypeCasting" => RepairStrategy::TypeCasting,
            _ => RepairStrategy::FullRewrite,
        }
    }
}

impl fmt::Display for RepairStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentifierKind {
    Column,
    Table,
}

/// An identifier the backend did not recognise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnknownIdentifier {
    pub name: String,
    pub kind: IdentifierKind,
}

/// Outcome of a pattern-rule match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub error_type: ErrorType,
    pub strategy: RepairStrategy,
    pub root_cause: String,
    pub fragments: Vec<String>,
    pub confidence: f64,
    pub unknown_identifier: Option<UnknownIdentifier>,
}

const RULE_CONFIDENCE: f64 = 0.9;

lazy_static::lazy_static! {
    static ref UNKNOWN_COLUMN: Vec<Regex> = vec![
        Regex::new(r#"(?i)column "([^"]+)" does not exist"#).unwrap(),
        Regex::new(r"(?i)column ([\w.]+) does not exist").unwrap(),
        Regex::new(r"(?i)no such column:\s*([\w.]+)").unwrap(),
        Regex::new(r"(?i)unknown column '([^']+)'").unwrap(),
        Regex::new(r#"(?i)column '?"?([\w.]+)'?"? not found"#).unwrap(),
    ];
    static ref UNKNOWN_TABLE: Vec<Regex> = vec![
        Regex::new(r#"(?i)relation "([^"]+)" does not exist"#).unwrap(),
        Regex::new(r"(?i)no such table:\s*([\w.]+)").unwrap(),
        Regex::new(r"(?i)table '([^']+)' doesn't exist").unwrap(),
        Regex::new(r#"(?i)table '?"?([\w.]+)'?"? not found"#).unwrap(),
    ];
    static ref SYNTAX_NEAR: Regex = Regex::new(r#"(?i)syntax error at or near "([^"]*)""#).unwrap();
}

fn first_capture(patterns: &[Regex], message: &str) -> Option<String> {
    patterns
        .iter()
        .find_map(|re| re.captures(message))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn rule(
    error_type: ErrorType,
    strategy: RepairStrategy,
    root_cause: impl Into<String>,
    fragments: Vec<String>,
) -> Classification {
    Classification {
        error_type,
        strategy,
        root_cause: root_cause.into(),
        fragments,
        confidence: RULE_CONFIDENCE,
        unknown_identifier: None,
    }
}

/// Error classifier
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify a backend error message. `None` when no rule matches.
    pub fn classify_message(&self, message: &str, timed_out: bool) -> Option<Classification> {
        let msg = message.to_lowercase();

        if timed_out || msg.contains("statement timeout") || msg.contains("timed out") || msg.contains("timeout") {
            return Some(rule(
                ErrorType::PerformanceError,
                RepairStrategy::PerformanceOptimization,
                "query exceeded its time budget",
                Vec::new(),
            ));
        }

        if let Some(name) = first_capture(&UNKNOWN_COLUMN, message) {
            let mut c = rule(
                ErrorType::SemanticError,
                RepairStrategy::SchemaAlignment,
                format!("column {} does not exist", name),
                vec![name.clone()],
            );
            c.unknown_identifier = Some(UnknownIdentifier {
                name,
                kind: IdentifierKind::Column,
            });
            return Some(c);
        }

        if let Some(name) = first_capture(&UNKNOWN_TABLE, message) {
            let mut c = rule(
                ErrorType::SemanticError,
                RepairStrategy::SchemaAlignment,
                format!("table {} does not exist", name),
                vec![name.clone()],
            );
            c.unknown_identifier = Some(UnknownIdentifier {
                name,
                kind: IdentifierKind::Table,
            });
            return Some(c);
        }

        if msg.contains("ambiguous") && msg.contains("column") {
            return Some(rule(
                ErrorType::SemanticError,
                RepairStrategy::SchemaAlignment,
                "ambiguous column reference; qualify it with a table alias",
                Vec::new(),
            ));
        }

        if msg.contains("permission denied") || msg.contains("access denied") || msg.contains("insufficient privilege") {
            return Some(rule(
                ErrorType::PermissionError,
                RepairStrategy::PermissionAdjustment,
                "backend denied access to an object in the query",
                Vec::new(),
            ));
        }

        if msg.contains("operator does not exist")
            || msg.contains("invalid input syntax for type")
            || msg.contains("cannot cast")
            || msg.contains("type mismatch")
            || msg.contains("datatype mismatch")
        {
            return Some(rule(
                ErrorType::TypeError,
                RepairStrategy::TypeCasting,
                "operands have incompatible types",
                Vec::new(),
            ));
        }

        if msg.contains("must appear in the group by clause") || msg.contains("aggregate functions are not allowed") {
            return Some(rule(
                ErrorType::LogicError,
                RepairStrategy::LogicRefinement,
                "aggregation and grouping do not agree",
                Vec::new(),
            ));
        }

        if let Some(near) = SYNTAX_NEAR.captures(message).and_then(|c| c.get(1)) {
            return Some(rule(
                ErrorType::SyntaxError,
                RepairStrategy::SyntaxCorrection,
                format!("syntax error near \"{}\"", near.as_str()),
                vec![near.as_str().to_string()],
            ));
        }

        None
    }

    /// Map a failing verdict onto the taxonomy through its first blocking
    /// threat.
    pub fn classify_verdict(&self, verdict: &ValidationVerdict) -> Classification {
        let Some(threat) = verdict.primary_threat() else {
            return rule(
                ErrorType::UnclassifiedError,
                RepairStrategy::FullRewrite,
                "validation failed without a blocking threat",
                Vec::new(),
            );
        };

        let (error_type, strategy) = match threat.category {
            ThreatCategory::MalformedQuery => (ErrorType::SyntaxError, RepairStrategy::SyntaxCorrection),
            ThreatCategory::StackedStatements | ThreatCategory::CommentTruncation => {
                (ErrorType::SyntaxError, RepairStrategy::FullRewrite)
            }
            ThreatCategory::DisallowedStatement
            | ThreatCategory::TautologyInjection
            | ThreatCategory::PrivilegedFunction
            | ThreatCategory::SystemCatalogAccess => (ErrorType::LogicError, RepairStrategy::FullRewrite),
            ThreatCategory::ForbiddenTable | ThreatCategory::PermissionViolation => {
                (ErrorType::PermissionError, RepairStrategy::PermissionAdjustment)
            }
            ThreatCategory::ExcessiveCost => (ErrorType::PerformanceError, RepairStrategy::PerformanceOptimization),
        };

        rule(
            error_type,
            strategy,
            verdict.failure_summary(),
            verdict.blocking_threats().map(|t| t.detail.clone()).collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{QueryValidator, UserContext, ValidationLevel};

    #[test]
    fn test_classify_unknown_column() {
        let classifier = ErrorClassifier::new();
        let c = classifier
            .classify_message(r#"column "c.customer_nme" does not exist"#, false)
            .unwrap();
        assert_eq!(c.error_type, ErrorType::SemanticError);
        assert_eq!(c.strategy, RepairStrategy::SchemaAlignment);
        assert_eq!(
            c.unknown_identifier,
            Some(UnknownIdentifier {
                name: "c.customer_nme".into(),
                kind: IdentifierKind::Column
            })
        );

        let c = classifier.classify_message("no such column: totl", false).unwrap();
        assert_eq!(c.unknown_identifier.unwrap().name, "totl");
    }

    #[test]
    fn test_classify_unknown_table() {
        let classifier = ErrorClassifier::new();
        let c = classifier
            .classify_message(r#"relation "order" does not exist"#, false)
            .unwrap();
        assert_eq!(c.unknown_identifier.unwrap().kind, IdentifierKind::Table);
    }

    #[test]
    fn test_classify_other_patterns() {
        let classifier = ErrorClassifier::new();
        let cases = [
            ("canceling statement due to statement timeout", RepairStrategy::PerformanceOptimization),
            ("permission denied for table salaries", RepairStrategy::PermissionAdjustment),
            ("operator does not exist: text > integer", RepairStrategy::TypeCasting),
            (
                r#"column "o.region" must appear in the GROUP BY clause or be used in an aggregate function"#,
                RepairStrategy::LogicRefinement,
            ),
            (r#"syntax error at or near "FORM""#, RepairStrategy::SyntaxCorrection),
        ];
        for (message, expected) in cases {
            assert_eq!(classifier.classify_message(message, false).unwrap().strategy, expected, "{}", message);
        }
        assert!(classifier.classify_message("division by zero", false).is_none());
        assert!(classifier.classify_message("", true).is_some());
    }

    #[test]
    fn test_classify_verdict_uses_primary_threat() {
        let validator = QueryValidator::default();
        let verdict = validator.validate_sql(
            "SELECT name FROM users; DROP TABLE users",
            &UserContext::default(),
            ValidationLevel::Moderate,
        );
        let c = ErrorClassifier::new().classify_verdict(&verdict);
        assert_eq!(c.error_type, ErrorType::LogicError);
        assert!(!c.fragments.is_empty());
    }
}
