//! Query Validator
//!
//! One pipeline for every trust tier: syntax and statement shape, injection
//! patterns, access control, cost, then sanitization. Every check always
//! runs; the run's [`ValidationLevel`] only decides, through the severity
//! table, which findings block.

use crate::generation::QueryCandidate;
use crate::security::access_control::AccessController;
use crate::security::ast::{self, QueryFacts};
use crate::security::policy::{
    Severity, SeverityTable, ThreatCategory, UserContext, ValidationLevel, ValidatorPolicy,
};
use crate::security::query_guards::{CostEstimate, QueryGuards};
use crate::security::sanitize::sanitize;
use crate::security::threats::{self, Finding, TokenScan};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threat {
    pub category: ThreatCategory,
    pub severity: Severity,
    pub detail: String,
}

impl Threat {
    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Block
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub is_valid: bool,
    pub level: ValidationLevel,
    pub sanitized_query: String,
    /// Every finding, blocking or not, in check order.
    pub threats: Vec<Threat>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
    pub cost_estimate: Option<CostEstimate>,
    pub referenced_tables: Vec<String>,
}

impl ValidationVerdict {
    pub fn blocking_threats(&self) -> impl Iterator<Item = &Threat> {
        self.threats.iter().filter(|t| t.is_blocking())
    }

    pub fn blocking_categories(&self) -> Vec<ThreatCategory> {
        let mut categories: Vec<ThreatCategory> = Vec::new();
        for threat in self.blocking_threats() {
            if !categories.contains(&threat.category) {
                categories.push(threat.category);
            }
        }
        categories
    }

    pub fn has_threat(&self, category: ThreatCategory) -> bool {
        self.threats.iter().any(|t| t.category == category)
    }

    /// True when at least one blocking finding is a security threat rather
    /// than a structural problem.
    pub fn is_threat_based(&self) -> bool {
        self.blocking_threats().any(|t| t.category.is_security_threat())
    }

    /// The blocking finding a repair should address first.
    pub fn primary_threat(&self) -> Option<&Threat> {
        self.blocking_threats().next()
    }

    pub fn failure_summary(&self) -> String {
        self.blocking_threats()
            .map(|t| format!("{}: {}", t.category, t.detail))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Stateless validator; cheap to share across runs.
#[derive(Debug, Clone)]
pub struct QueryValidator {
    policy: ValidatorPolicy,
    severity: SeverityTable,
}

impl Default for QueryValidator {
    fn default() -> Self {
        Self::new(ValidatorPolicy::default())
    }
}

impl QueryValidator {
    pub fn new(policy: ValidatorPolicy) -> Self {
        let policy = policy.normalized();
        let severity = policy.severity_table();
        Self { policy, severity }
    }

    pub fn policy(&self) -> &ValidatorPolicy {
        &self.policy
    }

    pub fn validate(
        &self,
        candidate: &QueryCandidate,
        user: &UserContext,
        level: ValidationLevel,
    ) -> ValidationVerdict {
        self.validate_sql(&candidate.query, user, level)
    }

    pub fn validate_sql(&self, sql: &str, user: &UserContext, level: ValidationLevel) -> ValidationVerdict {
        let sql = sql.trim();
        let tokens = TokenScan::of(sql);
        let (statements, parse_error) = match ast::parse(sql) {
            Ok(statements) => (Some(statements), None),
            Err(e) => (None, Some(e.to_string())),
        };
        let facts = statements.as_deref().map(QueryFacts::from_statements);

        // 1. syntax and statement shape
        let mut findings = threats::scan_statement_shape(facts.as_ref(), &tokens, parse_error.as_deref());
        // 2. injection patterns
        findings.extend(threats::scan_injection_patterns(sql, facts.as_ref(), &tokens, &self.policy));
        // 3. permissions
        if let Some(facts) = &facts {
            findings.extend(AccessController::new(user, &self.policy).check(facts));
        }
        // 4. cost
        let cost_estimate = facts.as_ref().map(|f| QueryGuards::new(&self.policy).estimate(f));
        if let Some(cost) = cost_estimate.as_ref().filter(|c| c.exceeds_ceiling()) {
            findings.push(Finding::new(
                ThreatCategory::ExcessiveCost,
                format!(
                    "estimated cost {:.1} exceeds ceiling {:.1}: {}",
                    cost.score,
                    cost.ceiling,
                    cost.factors.first().map(String::as_str).unwrap_or("large scan")
                ),
            ));
        }
        // 5. sanitization
        let mut sanitized_query = sanitize(sql, statements.as_deref());

        let mut is_valid = true;
        let mut threats: Vec<Threat> = Vec::new();
        for finding in findings {
            let severity = self.severity.severity(finding.category, level);
            is_valid &= severity == Severity::Warn;
            let threat = Threat {
                category: finding.category,
                severity,
                detail: finding.detail,
            };
            if !threats.contains(&threat) {
                threats.push(threat);
            }
        }

        // The text handed to the executor must round-trip through the parser.
        if is_valid && !ast::is_single_read_only_selection(&sanitized_query) {
            is_valid = false;
            threats.push(Threat {
                category: ThreatCategory::MalformedQuery,
                severity: Severity::Block,
                detail: "normalized query text does not re-parse".to_string(),
            });
            sanitized_query = sql.trim_end_matches(';').trim().to_string();
        }

        let warnings = self.warnings(sql, facts.as_ref(), &threats);
        let suggestions = self.suggestions(user, &threats);
        let referenced_tables = ast::referenced_tables(sql);

        debug!(
            level = %level,
            is_valid,
            threats = threats.len(),
            "Validated candidate query"
        );

        ValidationVerdict {
            is_valid,
            level,
            sanitized_query,
            threats,
            warnings,
            suggestions,
            cost_estimate,
            referenced_tables,
        }
    }

    fn warnings(&self, sql: &str, facts: Option<&QueryFacts>, threats: &[Threat]) -> Vec<String> {
        let mut warnings: Vec<String> = threats
            .iter()
            .filter(|t| !t.is_blocking())
            .map(|t| format!("{}: {}", t.category, t.detail))
            .collect();

        if let Some(facts) = facts {
            if !facts.wildcard_tables.is_empty() && !facts.has_limit {
                warnings.push("SELECT * without LIMIT may return a very large result".to_string());
            }
        } else {
            let opens = sql.matches('(').count();
            let closes = sql.matches(')').count();
            if opens != closes {
                warnings.push(format!(
                    "unbalanced parentheses ({} opening, {} closing)",
                    opens, closes
                ));
            }
        }

        if sql.chars().count() > self.policy.long_query_chars {
            warnings.push(format!(
                "query is longer than {} characters; consider simplifying",
                self.policy.long_query_chars
            ));
        }
        warnings
    }

    fn suggestions(&self, user: &UserContext, threats: &[Threat]) -> Vec<String> {
        let mut suggestions: Vec<String> = Vec::new();
        for threat in threats.iter().filter(|t| t.is_blocking()) {
            let suggestion = match threat.category {
                ThreatCategory::MalformedQuery => "Rewrite the query as a single valid SELECT statement".to_string(),
                ThreatCategory::DisallowedStatement => {
                    "Only read-only SELECT statements are permitted".to_string()
                }
                ThreatCategory::StackedStatements => "Submit exactly one statement without ';' separators".to_string(),
                ThreatCategory::TautologyInjection => "Remove always-true predicates such as 1=1".to_string(),
                ThreatCategory::CommentTruncation => "Remove SQL comments from the query".to_string(),
                ThreatCategory::PrivilegedFunction => "Avoid administrative or file-system functions".to_string(),
                ThreatCategory::SystemCatalogAccess => {
                    "Query application tables instead of system catalogs".to_string()
                }
                ThreatCategory::ForbiddenTable => match &user.allowed_tables {
                    Some(allowed) => format!(
                        "Restrict the query to the permitted tables: {}",
                        allowed.iter().cloned().collect::<Vec<_>>().join(", ")
                    ),
                    None => "Restrict the query to permitted tables".to_string(),
                },
                ThreatCategory::PermissionViolation => {
                    if threat.detail.contains("region-segregated") {
                        match threat.detail.split("; ").nth(1) {
                            Some(hint) => capitalize(hint),
                            None => "Filter on the caller's region".to_string(),
                        }
                    } else {
                        "Drop restricted columns or request the required permission".to_string()
                    }
                }
                ThreatCategory::ExcessiveCost => {
                    "Add a selective WHERE predicate, aggregate, or LIMIT the result".to_string()
                }
            };
            if !suggestions.contains(&suggestion) {
                suggestions.push(suggestion);
            }
        }
        suggestions
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
