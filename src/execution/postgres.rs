//! PostgreSQL Executor
//!
//! Runs each query inside a read-only transaction with a local
//! `statement_timeout`, wrapped so that rows come back as JSON objects and
//! the row cap is enforced by the backend.
//!
//! `row_to_json` keys rows by output name, so repeated names in the select
//! list get a numbered alias first. Names hidden behind `*` cannot be seen
//! before execution and still collapse to the last value. The wrapper adds
//! only a LIMIT over a subquery scan, which keeps the inner ORDER BY order.

use crate::error::Result;
use crate::security::ast;
use crate::execution::{ExecutionFailure, ExecutionOutcome, QueryExecutor, ResultSet, Row};
use async_trait::async_trait;
use sqlparser::ast::{Expr, Ident, SelectItem, SetExpr, Statement};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Extra wall-clock time granted on top of the statement timeout before the
/// client gives up on the connection.
const CLIENT_GRACE: Duration = Duration::from_millis(500);

pub struct PostgresExecutor {
    pool: PgPool,
}

impl PostgresExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        info!("Connected to PostgreSQL");
        Ok(Self::new(pool))
    }

    /// `sql` must already be a sanitized single SELECT.
    fn wrap(sql: &str, row_limit: usize) -> String {
        let sql = alias_duplicate_outputs(sql).unwrap_or_else(|| sql.to_string());
        format!(
            "SELECT row_to_json(q)::text FROM ({}) AS q LIMIT {}",
            sql,
            row_limit.saturating_add(1)
        )
    }

    async fn fetch(&self, sql: &str, row_limit: usize, time_budget: Duration) -> std::result::Result<ResultSet, sqlx::Error> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION READ ONLY").execute(&mut *tx).await?;
        sqlx::query(&format!("SET LOCAL statement_timeout = {}", time_budget.as_millis().max(1)))
            .execute(&mut *tx)
            .await?;

        let wrapped = Self::wrap(sql, row_limit);
        let raw: Vec<String> = sqlx::query_scalar(&wrapped).fetch_all(&mut *tx).await?;
        tx.rollback().await?;

        let truncated = raw.len() > row_limit;
        let mut rows: Vec<Row> = Vec::with_capacity(raw.len().min(row_limit));
        for text in raw.into_iter().take(row_limit) {
            let row: Row = serde_json::from_str(&text).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
            rows.push(row);
        }
        let columns = rows
            .first()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        Ok(ResultSet::new(columns, rows, truncated, started.elapsed()))
    }
}

#[async_trait]
impl QueryExecutor for PostgresExecutor {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn run(&self, sql: &str, row_limit: usize, time_budget: Duration) -> ExecutionOutcome {
        debug!(row_limit, budget_ms = time_budget.as_millis() as u64, "Executing query");
        match tokio::time::timeout(time_budget.saturating_add(CLIENT_GRACE), self.fetch(sql, row_limit, time_budget)).await {
            Ok(Ok(set)) => {
                info!(rows = set.row_count, truncated = set.truncated, latency_ms = set.latency.as_millis() as u64, "Query executed");
                ExecutionOutcome::Rows(set)
            }
            Ok(Err(e)) => {
                let message = match &e {
                    sqlx::Error::Database(db) => db.message().to_string(),
                    other => other.to_string(),
                };
                warn!("⚠️  Query failed: {}", message);
                ExecutionOutcome::Failed(ExecutionFailure {
                    timed_out: message.contains("statement timeout"),
                    message,
                })
            }
            Err(_) => {
                warn!("⚠️  Query exceeded its time budget");
                ExecutionOutcome::Failed(ExecutionFailure::timeout(time_budget))
            }
        }
    }
}

/// Output name PostgreSQL gives an unaliased select expression.
fn output_name(expr: &Expr) -> String {
    let folded = |ident: &Ident| match ident.quote_style {
        Some(_) => ident.value.clone(),
        None => ident.value.to_lowercase(),
    };
    match expr {
        Expr::Identifier(ident) => folded(ident),
        Expr::CompoundIdentifier(parts) => parts.last().map(folded).unwrap_or_default(),
        Expr::Function(f) => f.name.0.last().map(folded).unwrap_or_default(),
        Expr::Cast { expr, .. } | Expr::Nested(expr) => output_name(expr),
        _ => "?column?".to_string(),
    }
}

/// Rewrite the top-level select list so every output name is unique.
/// `None` when nothing needs renaming or the query is not a plain SELECT.
fn alias_duplicate_outputs(sql: &str) -> Option<String> {
    let mut statements = ast::parse(sql).ok()?;
    if statements.len() != 1 {
        return None;
    }
    let Statement::Query(query) = &mut statements[0] else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_mut() else {
        return None;
    };

    let names: Vec<Option<String>> = select
        .projection
        .iter()
        .map(|item| match item {
            SelectItem::UnnamedExpr(expr) => Some(output_name(expr)),
            SelectItem::ExprWithAlias { alias, .. } => Some(output_name(&Expr::Identifier(alias.clone()))),
            _ => None,
        })
        .collect();
    let mut taken: HashSet<String> = names.iter().flatten().cloned().collect();
    let mut seen: HashSet<String> = HashSet::new();
    let mut renamed = false;

    for (item, name) in select.projection.iter_mut().zip(names) {
        let Some(name) = name else { continue };
        if seen.insert(name.clone()) {
            continue;
        }
        let alias = (2..)
            .map(|n| format!("{}_{}", name, n))
            .find(|candidate| !taken.contains(candidate))?;
        taken.insert(alias.clone());
        let expr = match item {
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => expr.clone(),
            _ => continue,
        };
        *item = SelectItem::ExprWithAlias {
            expr,
            alias: Ident::with_quote('"', alias),
        };
        renamed = true;
    }

    renamed.then(|| statements[0].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_output_names_get_numbered_aliases() {
        let wrapped = PostgresExecutor::wrap(
            "SELECT c.id, o.id, COUNT(*), COUNT(DISTINCT o.id) FROM customers c JOIN orders o ON o.customer_id = c.id GROUP BY c.id, o.id",
            10,
        );
        assert!(wrapped.contains(r#"o.id AS "id_2""#), "{}", wrapped);
        assert!(wrapped.contains(r#"COUNT(DISTINCT o.id) AS "count_2""#), "{}", wrapped);
        assert!(wrapped.ends_with("AS q LIMIT 11"));
    }

    #[test]
    fn test_numbered_alias_skips_names_already_in_use() {
        let wrapped = PostgresExecutor::wrap("SELECT a.id, b.id, a.id_2 FROM a, b", 5);
        assert!(wrapped.contains(r#"b.id AS "id_3""#), "{}", wrapped);
    }

    #[test]
    fn test_ordered_query_is_wrapped_without_reordering() {
        let sql = "SELECT id, total_amount FROM orders ORDER BY total_amount DESC";
        assert_eq!(
            PostgresExecutor::wrap(sql, 3),
            format!("SELECT row_to_json(q)::text FROM ({}) AS q LIMIT 4", sql)
        );
    }

    #[test]
    fn test_wrap_fetches_one_extra_row_for_truncation() {
        assert_eq!(
            PostgresExecutor::wrap("SELECT id FROM orders", 100),
            "SELECT row_to_json(q)::text FROM (SELECT id FROM orders) AS q LIMIT 101"
        );
    }
}
