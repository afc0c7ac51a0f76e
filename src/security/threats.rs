//! Threat Pattern Scan
//!
//! Injection idioms found on the AST and on the raw text. The token stream is
//! used for anything the parser discards (comments, statement separators);
//! regexes only stand in when the text does not even tokenize or parse.

use crate::security::ast::QueryFacts;
use crate::security::policy::{ThreatCategory, ValidatorPolicy};
use regex::Regex;
use sqlparser::dialect::GenericDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace};

lazy_static::lazy_static! {
    static ref COMMENT_MARKER: Regex = Regex::new(r"--|/\*|#").unwrap();
    static ref STACKED_SEPARATOR: Regex = Regex::new(r";\s*\S").unwrap();
    static ref OR_TAUTOLOGY: Regex =
        Regex::new(r"(?i)\bor\s+'?(\w+)'?\s*=\s*'?(\w+)'?").unwrap();
    static ref OR_TRUE: Regex = Regex::new(r"(?i)\bor\s+true\b").unwrap();
    static ref FUNCTION_CALL: Regex = Regex::new(r"(?i)\b([a-z_][a-z0-9_]*)\s*\(").unwrap();
    static ref SYSTEM_RELATION: Regex =
        Regex::new(r"(?i)\b(information_schema|pg_catalog|pg_[a-z_]+|sqlite_master)\b").unwrap();
}

/// Statement keywords that never belong in a read-only query.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "DROP", "DELETE", "INSERT", "UPDATE", "ALTER", "TRUNCATE", "CREATE", "GRANT", "REVOKE",
    "MERGE", "COPY", "VACUUM", "EXEC", "EXECUTE", "CALL", "REINDEX", "ATTACH", "DETACH", "PRAGMA",
];

/// One detected issue before severity is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub category: ThreatCategory,
    pub detail: String,
}

impl Finding {
    pub fn new(category: ThreatCategory, detail: impl Into<String>) -> Self {
        Self {
            category,
            detail: detail.into(),
        }
    }
}

/// What the token stream says about a piece of SQL text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenScan {
    pub tokenized: bool,
    pub comments: usize,
    /// Semicolons followed by more SQL.
    pub separators: usize,
    /// Unquoted forbidden statement keywords, uppercase.
    pub forbidden_keywords: Vec<String>,
}

impl TokenScan {
    pub fn of(sql: &str) -> Self {
        let dialect = GenericDialect {};
        let tokens = match Tokenizer::new(&dialect, sql).tokenize() {
            Ok(tokens) => tokens,
            Err(_) => {
                return Self {
                    tokenized: false,
                    comments: COMMENT_MARKER.find_iter(sql).count(),
                    separators: STACKED_SEPARATOR.find_iter(sql.trim_end_matches(';')).count(),
                    forbidden_keywords: Vec::new(),
                }
            }
        };

        let mut scan = Self {
            tokenized: true,
            ..Self::default()
        };
        let mut pending_separator = false;
        for token in &tokens {
            match token {
                Token::Whitespace(Whitespace::SingleLineComment { .. })
                | Token::Whitespace(Whitespace::MultiLineComment(_)) => {
                    scan.comments += 1;
                }
                Token::Whitespace(_) => {}
                Token::SemiColon => pending_separator = true,
                other => {
                    if pending_separator {
                        scan.separators += 1;
                        pending_separator = false;
                    }
                    if let Token::Word(word) = other {
                        let upper = word.value.to_uppercase();
                        if word.quote_style.is_none()
                            && word.keyword != Keyword::NoKeyword
                            && FORBIDDEN_KEYWORDS.contains(&upper.as_str())
                            && !scan.forbidden_keywords.contains(&upper)
                        {
                            scan.forbidden_keywords.push(upper);
                        }
                    }
                }
            }
        }
        scan
    }
}

/// Step 1 findings: the text must be one read-only selection.
pub fn scan_statement_shape(
    facts: Option<&QueryFacts>,
    tokens: &TokenScan,
    parse_error: Option<&str>,
) -> Vec<Finding> {
    let mut findings = Vec::new();

    match facts {
        Some(facts) => {
            if facts.statement_count == 0 {
                findings.push(Finding::new(ThreatCategory::MalformedQuery, "empty query"));
            }
            for label in &facts.disallowed_statements {
                findings.push(Finding::new(
                    ThreatCategory::DisallowedStatement,
                    format!("{} is not a read-only selection", label),
                ));
            }
        }
        None => {
            findings.push(Finding::new(
                ThreatCategory::MalformedQuery,
                parse_error.unwrap_or("query could not be parsed").to_string(),
            ));
            for keyword in &tokens.forbidden_keywords {
                findings.push(Finding::new(
                    ThreatCategory::DisallowedStatement,
                    format!("{} is not a read-only selection", keyword),
                ));
            }
        }
    }

    let statements = facts.map(|f| f.statement_count).unwrap_or(0);
    if statements > 1 || tokens.separators > 0 {
        findings.push(Finding::new(
            ThreatCategory::StackedStatements,
            format!("{} statements separated by ';'", statements.max(tokens.separators + 1)),
        ));
    }

    findings
}

/// Step 2 findings: tautologies, comment truncation, privileged calls and
/// system catalog reads.
pub fn scan_injection_patterns(
    sql: &str,
    facts: Option<&QueryFacts>,
    tokens: &TokenScan,
    policy: &ValidatorPolicy,
) -> Vec<Finding> {
    let mut findings = Vec::new();

    if tokens.comments > 0 {
        findings.push(Finding::new(
            ThreatCategory::CommentTruncation,
            format!("{} SQL comment(s) in query text", tokens.comments),
        ));
    }

    match facts {
        Some(facts) => {
            for tautology in &facts.tautologies {
                findings.push(Finding::new(
                    ThreatCategory::TautologyInjection,
                    format!("always-true predicate: {}", tautology),
                ));
            }
            for function in &facts.functions {
                if policy.is_privileged_function(function) {
                    findings.push(Finding::new(
                        ThreatCategory::PrivilegedFunction,
                        format!("call to privileged function {}", function),
                    ));
                }
            }
            for table in &facts.tables {
                if policy.is_system_relation(table) {
                    findings.push(Finding::new(
                        ThreatCategory::SystemCatalogAccess,
                        format!("reads system relation {}", table),
                    ));
                }
            }
        }
        None => {
            let tautology = OR_TAUTOLOGY
                .captures_iter(sql)
                .find(|c| c[1].eq_ignore_ascii_case(&c[2]))
                .map(|c| c[0].to_string())
                .or_else(|| OR_TRUE.find(sql).map(|m| m.as_str().to_string()));
            if let Some(tautology) = tautology {
                findings.push(Finding::new(
                    ThreatCategory::TautologyInjection,
                    format!("always-true predicate: {}", tautology),
                ));
            }

            let mut seen = Vec::new();
            for captures in FUNCTION_CALL.captures_iter(sql) {
                let name = captures[1].to_lowercase();
                if policy.is_privileged_function(&name) && !seen.contains(&name) {
                    findings.push(Finding::new(
                        ThreatCategory::PrivilegedFunction,
                        format!("call to privileged function {}", name),
                    ));
                    seen.push(name);
                }
            }

            if let Some(m) = SYSTEM_RELATION.find(sql) {
                findings.push(Finding::new(
                    ThreatCategory::SystemCatalogAccess,
                    format!("reads system relation {}", m.as_str().to_lowercase()),
                ));
            }
        }
    }

    findings
}
