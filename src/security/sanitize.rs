//! Query Sanitization
//!
//! Canonical text for a candidate: keywords uppercased, whitespace collapsed,
//! trailing semicolons dropped. A single parsed statement is re-rendered from
//! its AST; anything else is rebuilt token by token so literals and quoted
//! identifiers survive untouched.

use regex::Regex;
use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace};

lazy_static::lazy_static! {
    static ref WHITESPACE_RUN: Regex = Regex::new(r"\s+").unwrap();
}

pub fn sanitize(sql: &str, parsed: Option<&[Statement]>) -> String {
    match parsed {
        Some([statement]) => statement.to_string(),
        _ => sanitize_tokens(sql),
    }
}

fn strip_trailing(text: &str) -> String {
    text.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace()).to_string()
}

fn sanitize_tokens(sql: &str) -> String {
    let dialect = GenericDialect {};
    let tokens = match Tokenizer::new(&dialect, sql).tokenize() {
        Ok(tokens) => tokens,
        Err(_) => return strip_trailing(&WHITESPACE_RUN.replace_all(sql, " ")),
    };

    let mut out = String::with_capacity(sql.len());
    let mut pending_space = false;
    for token in tokens {
        let text = match &token {
            Token::Whitespace(Whitespace::Space)
            | Token::Whitespace(Whitespace::Newline)
            | Token::Whitespace(Whitespace::Tab) => {
                pending_space = true;
                continue;
            }
            Token::Whitespace(Whitespace::SingleLineComment { comment, prefix }) => {
                pending_space = true;
                format!("{}{}", prefix, comment.trim_end())
            }
            Token::Word(word) if word.quote_style.is_none() && word.keyword != Keyword::NoKeyword => {
                word.value.to_uppercase()
            }
            other => other.to_string(),
        };
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        out.push_str(&text);
    }
    strip_trailing(&out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::ast;

    #[test]
    fn test_parsed_statement_is_rendered_canonically() {
        let sql = "select  name,\n   total from orders\twhere region = 'west' ;";
        let statements = ast::parse(sql).unwrap();
        let clean = sanitize(sql, Some(&statements));
        assert_eq!(clean, "SELECT name, total FROM orders WHERE region = 'west'");
    }

    #[test]
    fn test_token_rebuild_keeps_literals() {
        let sql = "select * from   customers;\n drop table customers ;";
        let clean = sanitize(sql, None);
        assert_eq!(clean, "SELECT * FROM customers; DROP TABLE customers");
    }

    #[test]
    fn test_token_rebuild_does_not_uppercase_strings() {
        let clean = sanitize("selec name from t where note = 'select me'", None);
        assert!(clean.contains("'select me'"));
        assert!(clean.contains("FROM"));
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let sql = "select id from orders where total > 10 limit 5;";
        let statements = ast::parse(sql).unwrap();
        let once = sanitize(sql, Some(&statements));
        let again = sanitize(&once, Some(&ast::parse(&once).unwrap()));
        assert_eq!(once, again);
    }
}
