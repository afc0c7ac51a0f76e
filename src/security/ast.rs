//! Query Facts
//!
//! Walks a parsed statement list once and records everything the validator
//! checks need: statements that are not plain reads, every relation and
//! column touched, function calls, per-SELECT scope details (filters, joins,
//! equality predicates) and literal tautologies.

use regex::Regex;
use sqlparser::ast::{
    visit_expressions, BinaryOperator, Expr, GroupByExpr, Ident, JoinConstraint, JoinOperator,
    ObjectName, Query, Select, SelectItem, SetExpr, Statement, TableFactor, TableWithJoins, Value,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::{Parser, ParserError};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;

lazy_static::lazy_static! {
    static ref TABLE_REFERENCE: Regex =
        Regex::new(r"(?i)\b(?:from|join)\s+([a-z_][a-z0-9_]*(?:\.[a-z_][a-z0-9_]*)?)").unwrap();
}

const AGGREGATE_FUNCTIONS: &[&str] = &[
    "count", "sum", "avg", "min", "max", "stddev", "variance", "array_agg", "string_agg",
    "bool_and", "bool_or", "percentile_cont", "percentile_disc",
];

pub fn parse(sql: &str) -> Result<Vec<Statement>, ParserError> {
    Parser::parse_sql(&GenericDialect {}, sql)
}

/// True when `sql` parses to exactly one read-only SELECT.
pub fn is_single_read_only_selection(sql: &str) -> bool {
    match parse(sql) {
        Ok(statements) if statements.len() == 1 => {
            QueryFacts::from_statements(&statements).disallowed_statements.is_empty()
        }
        _ => false,
    }
}

/// Tables a query reads, from the AST when it parses and from a
/// FROM/JOIN scan otherwise. Lowercase, unqualified, in first-seen order.
pub fn referenced_tables(sql: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let names: Vec<String> = match parse(sql) {
        Ok(statements) => QueryFacts::from_statements(&statements).table_order,
        Err(_) => TABLE_REFERENCE
            .captures_iter(sql)
            .map(|c| bare_name(&c[1].to_lowercase()).to_string())
            .collect(),
    };
    names.into_iter().filter(|t| seen.insert(t.clone())).collect()
}

/// Last segment of a possibly schema-qualified name.
pub fn bare_name(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

fn object_name(name: &ObjectName) -> String {
    name.0
        .iter()
        .map(|ident| ident.value.to_lowercase())
        .collect::<Vec<_>>()
        .join(".")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub qualifier: Option<String>,
    pub name: String,
}

/// Facts about one SELECT block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectScope {
    /// Unqualified lowercase names of base tables read directly by this block.
    pub tables: Vec<String>,
    pub filtered: bool,
    pub constrained_joins: usize,
    pub unconstrained_joins: usize,
    pub aggregated: bool,
    /// Top-level `column = 'literal'` conjuncts of the WHERE clause.
    pub equality_predicates: Vec<(String, String)>,
}

impl SelectScope {
    pub fn has_equality(&self, column: &str, value: &str) -> bool {
        self.equality_predicates
            .iter()
            .any(|(c, v)| c == column && v.eq_ignore_ascii_case(value))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFacts {
    pub statement_count: usize,
    /// Labels of anything that is not a plain read (`DROP`, `SELECT INTO`, ...).
    pub disallowed_statements: Vec<String>,
    /// Lowercase, possibly qualified names of every base relation.
    pub tables: BTreeSet<String>,
    table_order: Vec<String>,
    pub ctes: BTreeSet<String>,
    /// Alias → unqualified table name.
    pub aliases: BTreeMap<String, String>,
    pub columns: Vec<ColumnRef>,
    pub functions: BTreeSet<String>,
    pub scopes: Vec<SelectScope>,
    /// Tables whose every column is projected through `*` or `t.*`.
    pub wildcard_tables: BTreeSet<String>,
    pub tautologies: Vec<String>,
    pub has_limit: bool,
    pub limit: Option<u64>,
    pub aggregated: bool,
}

impl QueryFacts {
    pub fn from_statements(statements: &[Statement]) -> Self {
        let mut facts = Self {
            statement_count: statements.len(),
            ..Self::default()
        };

        for (index, stmt) in statements.iter().enumerate() {
            match stmt {
                Statement::Query(query) => {
                    facts.analyze_query(query);
                    if index == 0 {
                        facts.has_limit = query.limit.is_some() || query.fetch.is_some();
                        facts.limit = query.limit.as_ref().and_then(literal_u64);
                        // The outermost SELECT is pushed after its CTEs and
                        // derived tables.
                        facts.aggregated = facts.scopes.last().map_or(false, |s| s.aggregated);
                    }
                }
                other => facts.disallowed_statements.push(statement_label(other)),
            }
        }

        // Subqueries inside expressions are scopes of their own; the walk
        // above only follows FROM clauses, CTEs and set operations.
        let mut nested: Vec<Query> = Vec::new();
        for stmt in statements {
            let _ = visit_expressions(stmt, |expr| {
                match expr {
                    Expr::Subquery(query) => nested.push(query.as_ref().clone()),
                    Expr::Exists { subquery, .. } | Expr::InSubquery { subquery, .. } => {
                        nested.push(subquery.as_ref().clone())
                    }
                    _ => {}
                }
                facts.analyze_expr(expr);
                ControlFlow::<()>::Continue(())
            });
        }
        for query in &nested {
            facts.analyze_query(query);
        }

        // A CTE name referenced in FROM is not a base table.
        let ctes = facts.ctes.clone();
        facts.tables.retain(|t| !ctes.contains(t));
        facts.table_order.retain(|t| !ctes.contains(t));
        for scope in &mut facts.scopes {
            scope.tables.retain(|t| !ctes.contains(t));
        }
        facts.wildcard_tables.retain(|t| !ctes.contains(t));

        facts
    }

    /// Resolve a column qualifier (alias or table name) to a table.
    pub fn resolve_qualifier(&self, qualifier: &str) -> String {
        self.aliases
            .get(qualifier)
            .cloned()
            .unwrap_or_else(|| bare_name(qualifier).to_string())
    }

    pub fn bare_tables(&self) -> BTreeSet<String> {
        self.tables.iter().map(|t| bare_name(t).to_string()).collect()
    }

    fn analyze_query(&mut self, query: &Query) {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.ctes.insert(cte.alias.name.value.to_lowercase());
                self.analyze_query(&cte.query);
            }
        }

        if !query.locks.is_empty() {
            self.disallowed_statements.push("row locking clause".to_string());
        }

        self.analyze_set_expr(&query.body);
    }

    fn analyze_set_expr(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => self.analyze_select(select),
            SetExpr::Query(query) => self.analyze_query(query),
            SetExpr::SetOperation { left, right, .. } => {
                self.analyze_set_expr(left);
                self.analyze_set_expr(right);
            }
            SetExpr::Insert(stmt) | SetExpr::Update(stmt) => {
                self.disallowed_statements.push(statement_label(stmt));
            }
            _ => {}
        }
    }

    fn analyze_select(&mut self, select: &Select) {
        let mut scope = SelectScope::default();

        if select.into.is_some() {
            self.disallowed_statements.push("SELECT INTO".to_string());
        }

        for table_with_joins in &select.from {
            self.analyze_table_with_joins(table_with_joins, &mut scope);
        }
        // Comma-separated FROM items are implicit cross joins unless the
        // WHERE clause ties them together.
        if select.from.len() > 1 {
            let implicit = select.from.len() - 1;
            if select.selection.is_some() {
                scope.constrained_joins += implicit;
            } else {
                scope.unconstrained_joins += implicit;
            }
        }

        if let Some(selection) = &select.selection {
            scope.filtered = true;
            let mut conjuncts = Vec::new();
            split_conjuncts(selection, &mut conjuncts);
            for conjunct in conjuncts {
                if let Some(predicate) = equality_predicate(conjunct) {
                    scope.equality_predicates.push(predicate);
                }
            }
        }

        scope.aggregated = match &select.group_by {
            GroupByExpr::All => true,
            GroupByExpr::Expressions(exprs) => !exprs.is_empty(),
        } || select.projection.iter().any(is_aggregate_item);

        for item in &select.projection {
            match item {
                SelectItem::Wildcard(_) => {
                    self.wildcard_tables.extend(scope.tables.iter().cloned());
                }
                SelectItem::QualifiedWildcard(name, _) => {
                    let qualifier = object_name(name);
                    let table = self.resolve_qualifier(&qualifier);
                    self.wildcard_tables.insert(table);
                }
                _ => {}
            }
        }

        self.scopes.push(scope);
    }

    fn analyze_table_with_joins(&mut self, twj: &TableWithJoins, scope: &mut SelectScope) {
        self.analyze_table_factor(&twj.relation, scope);
        for join in &twj.joins {
            self.analyze_table_factor(&join.relation, scope);
            let constraint = match &join.join_operator {
                JoinOperator::Inner(c)
                | JoinOperator::LeftOuter(c)
                | JoinOperator::RightOuter(c)
                | JoinOperator::FullOuter(c)
                | JoinOperator::LeftSemi(c)
                | JoinOperator::RightSemi(c)
                | JoinOperator::LeftAnti(c)
                | JoinOperator::RightAnti(c) => Some(c),
                _ => None,
            };
            match constraint {
                Some(JoinConstraint::On(_))
                | Some(JoinConstraint::Using(_))
                | Some(JoinConstraint::Natural) => scope.constrained_joins += 1,
                _ => scope.unconstrained_joins += 1,
            }
        }
    }

    fn analyze_table_factor(&mut self, factor: &TableFactor, scope: &mut SelectScope) {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                let full = object_name(name);
                let bare = bare_name(&full).to_string();
                if let Some(alias) = alias {
                    self.aliases.insert(alias.name.value.to_lowercase(), bare.clone());
                }
                if !self.table_order.contains(&bare) {
                    self.table_order.push(bare.clone());
                }
                self.tables.insert(full);
                scope.tables.push(bare);
            }
            TableFactor::Derived { subquery, .. } => self.analyze_query(subquery),
            TableFactor::NestedJoin { table_with_joins, .. } => {
                self.analyze_table_with_joins(table_with_joins, scope)
            }
            _ => {}
        }
    }

    fn analyze_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Identifier(ident) => self.columns.push(ColumnRef {
                qualifier: None,
                name: ident.value.to_lowercase(),
            }),
            Expr::CompoundIdentifier(parts) => {
                if let Some(column) = compound_column(parts) {
                    self.columns.push(column);
                }
            }
            Expr::Function(function) => {
                let name = object_name(&function.name);
                self.functions.insert(bare_name(&name).to_string());
            }
            Expr::BinaryOp { left, op, right } => {
                if is_tautology(left, op, right) {
                    self.tautologies.push(expr.to_string());
                }
            }
            _ => {}
        }
    }
}

fn compound_column(parts: &[Ident]) -> Option<ColumnRef> {
    let (last, rest) = parts.split_last()?;
    Some(ColumnRef {
        qualifier: rest.last().map(|q| q.value.to_lowercase()),
        name: last.value.to_lowercase(),
    })
}

fn statement_label(stmt: &Statement) -> String {
    stmt.to_string()
        .split_whitespace()
        .next()
        .unwrap_or("UNKNOWN")
        .to_uppercase()
}

fn literal_u64(expr: &Expr) -> Option<u64> {
    match expr {
        Expr::Value(Value::Number(n, _)) => n.parse().ok(),
        _ => None,
    }
}

fn split_conjuncts<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            split_conjuncts(left, out);
            split_conjuncts(right, out);
        }
        Expr::Nested(inner) => split_conjuncts(inner, out),
        other => out.push(other),
    }
}

fn column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        Expr::Nested(inner) => column_name(inner),
        _ => None,
    }
}

fn string_literal(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Value(Value::SingleQuotedString(s)) => Some(s.clone()),
        Expr::Nested(inner) => string_literal(inner),
        _ => None,
    }
}

fn equality_predicate(expr: &Expr) -> Option<(String, String)> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => column_name(left)
            .zip(string_literal(right))
            .or_else(|| column_name(right).zip(string_literal(left))),
        Expr::InList {
            expr,
            list,
            negated: false,
        } if list.len() == 1 => column_name(expr).zip(string_literal(&list[0])),
        _ => None,
    }
}

fn unwrap_nested(expr: &Expr) -> &Expr {
    match expr {
        Expr::Nested(inner) => unwrap_nested(inner),
        other => other,
    }
}

fn is_always_true_literal(expr: &Expr) -> bool {
    matches!(
        unwrap_nested(expr),
        Expr::Value(Value::Boolean(true))
    ) || matches!(unwrap_nested(expr), Expr::Value(Value::Number(n, _)) if n != "0")
}

fn is_tautology(left: &Expr, op: &BinaryOperator, right: &Expr) -> bool {
    match op {
        BinaryOperator::Eq | BinaryOperator::GtEq | BinaryOperator::LtEq => {
            match (unwrap_nested(left), unwrap_nested(right)) {
                (Expr::Value(a), Expr::Value(b)) => a.to_string() == b.to_string(),
                (a @ Expr::Identifier(_), b @ Expr::Identifier(_))
                | (a @ Expr::CompoundIdentifier(_), b @ Expr::CompoundIdentifier(_)) => {
                    a.to_string().eq_ignore_ascii_case(&b.to_string())
                }
                _ => false,
            }
        }
        BinaryOperator::Or => is_always_true_literal(left) || is_always_true_literal(right),
        _ => false,
    }
}

fn is_aggregate_item(item: &SelectItem) -> bool {
    let expr = match item {
        SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => expr,
        _ => return false,
    };
    match expr {
        Expr::Function(function) => {
            let name = object_name(&function.name);
            function.over.is_none() && AGGREGATE_FUNCTIONS.contains(&bare_name(&name))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(sql: &str) -> QueryFacts {
        QueryFacts::from_statements(&parse(sql).unwrap())
    }

    #[test]
    fn test_plain_select_facts() {
        let f = facts("SELECT c.name, SUM(o.total) FROM customers c JOIN orders o ON o.customer_id = c.id WHERE o.region = 'West' GROUP BY c.name LIMIT 5");
        assert_eq!(f.statement_count, 1);
        assert!(f.disallowed_statements.is_empty());
        assert_eq!(f.bare_tables(), ["customers", "orders"].iter().map(|s| s.to_string()).collect());
        assert_eq!(f.aliases.get("c").map(String::as_str), Some("customers"));
        assert_eq!(f.limit, Some(5));
        assert!(f.aggregated);
        assert!(f.functions.contains("sum"));

        let scope = &f.scopes[0];
        assert!(scope.filtered);
        assert_eq!(scope.constrained_joins, 1);
        assert!(scope.has_equality("region", "west"));
    }

    #[test]
    fn test_stacked_drop_is_disallowed() {
        let f = facts("SELECT * FROM customers; DROP TABLE customers");
        assert_eq!(f.statement_count, 2);
        assert_eq!(f.disallowed_statements, vec!["DROP".to_string()]);
        assert!(f.wildcard_tables.contains("customers"));
    }

    #[test]
    fn test_cte_names_are_not_tables() {
        let f = facts("WITH recent AS (SELECT * FROM orders WHERE order_date > '2024-01-01') SELECT COUNT(*) FROM recent");
        assert!(f.ctes.contains("recent"));
        assert_eq!(f.bare_tables().len(), 1);
        assert!(f.tables.contains("orders"));
    }

    #[test]
    fn test_subquery_scopes_are_collected() {
        let f = facts("SELECT name FROM customers WHERE id IN (SELECT customer_id FROM orders)");
        assert_eq!(f.scopes.len(), 2);
        assert!(!f.scopes[1].filtered);
        assert!(f.tables.contains("orders"));
    }

    #[test]
    fn test_tautologies_detected() {
        let f = facts("SELECT * FROM users WHERE name = 'a' OR 1 = 1");
        assert_eq!(f.tautologies.len(), 1);
        let f = facts("SELECT * FROM users WHERE name = 'a' OR 'x' = 'x'");
        assert_eq!(f.tautologies.len(), 1);
        let f = facts("SELECT * FROM users WHERE id = 1");
        assert!(f.tautologies.is_empty());
    }

    #[test]
    fn test_cross_join_is_unconstrained() {
        let f = facts("SELECT * FROM orders, customers");
        assert_eq!(f.scopes[0].unconstrained_joins, 1);
        let f = facts("SELECT * FROM orders CROSS JOIN customers");
        assert_eq!(f.scopes[0].unconstrained_joins, 1);
    }

    #[test]
    fn test_select_into_and_locks_are_disallowed() {
        assert!(!is_single_read_only_selection("SELECT * INTO backup FROM customers"));
        assert!(!is_single_read_only_selection("SELECT * FROM customers FOR UPDATE"));
        assert!(is_single_read_only_selection("SELECT 1"));
    }

    #[test]
    fn test_referenced_tables_fallback_scan() {
        assert_eq!(
            referenced_tables("SELECT id FROM public.Orders o JOIN customers c ON c.id = o.cid"),
            vec!["orders".to_string(), "customers".to_string()]
        );
        assert_eq!(
            referenced_tables("SELEC id FRM x FROM orders JOIN items"),
            vec!["orders".to_string(), "items".to_string()]
        );
    }
}
