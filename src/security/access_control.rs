//! Access Control
//!
//! Table allow-lists, per-table permissions, restricted columns and regional
//! row segregation, checked against the facts of a parsed query.

use crate::security::ast::{bare_name, QueryFacts};
use crate::security::policy::{ThreatCategory, UserContext, ValidatorPolicy};
use crate::security::threats::Finding;

/// Access controller
pub struct AccessController<'a> {
    user_context: &'a UserContext,
    policy: &'a ValidatorPolicy,
}

impl<'a> AccessController<'a> {
    pub fn new(user_context: &'a UserContext, policy: &'a ValidatorPolicy) -> Self {
        Self {
            user_context,
            policy,
        }
    }

    /// Every violation of the caller's access rights in `facts`.
    pub fn check(&self, facts: &QueryFacts) -> Vec<Finding> {
        let mut findings = Vec::new();
        let tables = facts.bare_tables();

        for table in &tables {
            if !self.user_context.may_read_table(table) {
                findings.push(Finding::new(
                    ThreatCategory::ForbiddenTable,
                    format!("table {} is not in the caller's allow-list", table),
                ));
            }
            if let Some(permission) = self.policy.required_permission(table) {
                if !self.user_context.has_permission(permission) {
                    findings.push(Finding::new(
                        ThreatCategory::PermissionViolation,
                        format!("reading {} requires the {} permission", table, permission),
                    ));
                }
            }
        }

        findings.extend(self.check_restricted_columns(facts, &tables));
        findings.extend(self.check_region_predicates(facts));
        findings
    }

    fn check_restricted_columns(
        &self,
        facts: &QueryFacts,
        tables: &std::collections::BTreeSet<String>,
    ) -> Vec<Finding> {
        let permission = self.policy.restricted_permission.as_str();
        if self.user_context.has_permission(permission) {
            return Vec::new();
        }

        let mut findings = Vec::new();
        for table in tables {
            let restricted = self.policy.restricted_columns_for(table);
            if restricted.is_empty() {
                continue;
            }

            if facts.wildcard_tables.contains(table) {
                findings.push(Finding::new(
                    ThreatCategory::PermissionViolation,
                    format!(
                        "SELECT * on {} exposes restricted columns ({}) without {}",
                        table,
                        restricted.join(", "),
                        permission
                    ),
                ));
                continue;
            }

            for column in restricted {
                let touched = facts.columns.iter().any(|c| {
                    c.name == *column
                        && match &c.qualifier {
                            Some(q) => facts.resolve_qualifier(q) == *table,
                            None => true,
                        }
                });
                if touched {
                    findings.push(Finding::new(
                        ThreatCategory::PermissionViolation,
                        format!("column {}.{} requires the {} permission", table, column, permission),
                    ));
                }
            }
        }
        findings
    }

    /// Each SELECT block that reads a regional table must pin the caller's
    /// region with a top-level `region_column = '<region>'` conjunct.
    fn check_region_predicates(&self, facts: &QueryFacts) -> Vec<Finding> {
        let region = match &self.user_context.region {
            Some(region) => region,
            None => return Vec::new(),
        };

        let mut findings = Vec::new();
        for scope in &facts.scopes {
            for table in &scope.tables {
                let column = match self.policy.region_column(bare_name(table)) {
                    Some(column) => column,
                    None => continue,
                };
                if !scope.has_equality(column, region) {
                    let detail = format!(
                        "{} is region-segregated; add {} = '{}' to the WHERE clause",
                        table, column, region
                    );
                    if !findings.iter().any(|f: &Finding| f.detail == detail) {
                        findings.push(Finding::new(ThreatCategory::PermissionViolation, detail));
                    }
                }
            }
        }
        findings
    }
}
