//! Schema Retriever
//!
//! Picks the tables worth showing the model for a question: lexical overlap
//! between the question and table/column names, a bonus for tables the prior
//! turn used, and one foreign-key hop to keep joins expressible.

use crate::question::Question;
use crate::schema_context::{SchemaSnapshot, TableInfo};
use crate::tokens;
use std::collections::BTreeSet;
use tracing::debug;

const TABLE_NAME_WEIGHT: f64 = 3.0;
const COLUMN_NAME_WEIGHT: f64 = 1.0;
const DESCRIPTION_WEIGHT: f64 = 0.5;
const PRIOR_TURN_BONUS: f64 = 2.0;

pub struct SchemaRetriever {
    max_tables: usize,
}

impl SchemaRetriever {
    pub fn new(max_tables: usize) -> Self {
        Self {
            max_tables: max_tables.max(1),
        }
    }

    fn score(&self, table: &TableInfo, question_tokens: &BTreeSet<String>, prior_tables: &[String]) -> f64 {
        let mut score = 0.0;

        let name_tokens = tokens::identifier_tokens(&table.name);
        score += TABLE_NAME_WEIGHT * name_tokens.intersection(question_tokens).count() as f64;

        let column_tokens: BTreeSet<String> = table
            .columns
            .iter()
            .flat_map(|c| tokens::identifier_tokens(&c.name))
            .filter(|t| !name_tokens.contains(t) && t != "id")
            .collect();
        score += COLUMN_NAME_WEIGHT * column_tokens.intersection(question_tokens).count() as f64;

        if let Some(description) = &table.description {
            let description_tokens = tokens::content_tokens(description);
            score += DESCRIPTION_WEIGHT * description_tokens.intersection(question_tokens).count() as f64;
        }

        if prior_tables.iter().any(|t| t.eq_ignore_ascii_case(&table.name)) {
            score += PRIOR_TURN_BONUS;
        }
        score
    }

    /// Names of the relevant tables, most relevant first.
    pub fn select_tables(&self, snapshot: &SchemaSnapshot, question: &Question) -> Vec<String> {
        let mut question_tokens = tokens::content_tokens(question.text());
        let prior_tables: Vec<String> = question
            .prior_turn()
            .map(|p| {
                question_tokens.extend(tokens::content_tokens(&p.question));
                p.tables.clone()
            })
            .unwrap_or_default();

        let mut scored: Vec<(f64, usize, &TableInfo)> = snapshot
            .tables
            .iter()
            .enumerate()
            .map(|(index, table)| (self.score(table, &question_tokens, &prior_tables), index, table))
            .filter(|(score, _, _)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });

        if scored.is_empty() {
            debug!("No table matched the question; sending the whole schema (capped)");
            return snapshot
                .tables
                .iter()
                .take(self.max_tables)
                .map(|t| t.name.clone())
                .collect();
        }

        let mut selected: Vec<String> = scored
            .iter()
            .take(self.max_tables)
            .map(|(_, _, t)| t.name.clone())
            .collect();

        let direct = selected.clone();
        for table in &direct {
            for neighbor in snapshot.neighbors(table) {
                if selected.len() >= self.max_tables {
                    break;
                }
                if !selected.iter().any(|s| s.eq_ignore_ascii_case(neighbor)) {
                    selected.push(neighbor.to_string());
                }
            }
        }

        debug!(tables = ?selected, "Selected relevant schema tables");
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::question::PriorTurn;
    use crate::schema_context::tests::sample_snapshot;

    #[test]
    fn test_table_name_match_ranks_first() {
        let retriever = SchemaRetriever::new(3);
        let question = Question::new("How many orders did each customer place?").unwrap();
        let tables = retriever.select_tables(&sample_snapshot(), &question);
        assert_eq!(&tables[..2], &["orders".to_string(), "customers".to_string()]);
        assert!(!tables.contains(&"employees".to_string()));
    }

    #[test]
    fn test_column_match_and_fk_hop() {
        let retriever = SchemaRetriever::new(4);
        let question = Question::new("total quantity sold per category").unwrap();
        let tables = retriever.select_tables(&sample_snapshot(), &question);
        assert!(tables.contains(&"order_items".to_string()));
        assert!(tables.contains(&"products".to_string()));
    }

    #[test]
    fn test_prior_turn_tables_carry_over() {
        let retriever = SchemaRetriever::new(2);
        let question = Question::new("and what about last month?")
            .unwrap()
            .with_prior_turn(PriorTurn {
                question: "revenue by week".into(),
                tables: vec!["orders".into()],
            });
        let tables = retriever.select_tables(&sample_snapshot(), &question);
        assert_eq!(tables[0], "orders");
    }

    #[test]
    fn test_no_match_falls_back_to_capped_schema() {
        let retriever = SchemaRetriever::new(2);
        let question = Question::new("hmm").unwrap();
        assert_eq!(retriever.select_tables(&sample_snapshot(), &question).len(), 2);
    }
}
