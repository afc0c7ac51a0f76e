//! Security Policy Definitions
//!
//! Caller identity, trust tiers, the threat-severity table and the governance
//! policy that parameterises the validator.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

/// User role for access control
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Analyst,
    Finance,
    Public,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Analyst => "analyst",
            Role::Finance => "finance",
            Role::Public => "public",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "admin" => Role::Admin,
            "analyst" => Role::Analyst,
            "finance" => Role::Finance,
            _ => Role::Public,
        }
    }
}

/// User context for authorization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    pub role: Role,
    /// Region the caller is segregated to, if any.
    pub region: Option<String>,
    pub permissions: BTreeSet<String>,
    /// Lowercase table allow-list. `None` means every table.
    pub allowed_tables: Option<BTreeSet<String>>,
    /// Trust tier assigned upstream; falls back to the pipeline default.
    pub trust_tier: Option<ValidationLevel>,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            region: None,
            permissions: BTreeSet::new(),
            allowed_tables: None,
            trust_tier: None,
        }
    }

    pub fn public() -> Self {
        Self::new("public", Role::Public)
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    pub fn with_allowed_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allowed_tables = Some(
            tables
                .into_iter()
                .map(|t| t.as_ref().trim().to_lowercase())
                .collect(),
        );
        self
    }

    pub fn with_trust_tier(mut self, level: ValidationLevel) -> Self {
        self.trust_tier = Some(level);
        self
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    /// Table names are compared on their lowercase unqualified form.
    pub fn may_read_table(&self, table: &str) -> bool {
        match &self.allowed_tables {
            None => true,
            Some(allowed) => {
                let table = table.to_lowercase();
                let bare = table.rsplit('.').next().unwrap_or(&table).to_string();
                allowed.contains(&table) || allowed.contains(&bare)
            }
        }
    }
}

impl Default for UserContext {
    fn default() -> Self {
        Self::new("anonymous", Role::Analyst)
    }
}

/// Trust tier of a run. Ordered from most to least restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ValidationLevel {
    Strict,
    Moderate,
    Relaxed,
    Administrative,
}

impl ValidationLevel {
    pub const ALL: [ValidationLevel; 4] = [
        ValidationLevel::Strict,
        ValidationLevel::Moderate,
        ValidationLevel::Relaxed,
        ValidationLevel::Administrative,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationLevel::Strict => "strict",
            ValidationLevel::Moderate => "moderate",
            ValidationLevel::Relaxed => "relaxed",
            ValidationLevel::Administrative => "admin",
        }
    }
}

impl fmt::Display for ValidationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValidationLevel {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "strict" => Ok(ValidationLevel::Strict),
            "moderate" => Ok(ValidationLevel::Moderate),
            "relaxed" => Ok(ValidationLevel::Relaxed),
            "admin" | "administrative" => Ok(ValidationLevel::Administrative),
            other => Err(PipelineError::Config(format!(
                "Unknown validation level '{}' (expected strict, moderate, relaxed or admin)",
                other
            ))),
        }
    }
}

/// Category of a validator finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ThreatCategory {
    MalformedQuery,
    DisallowedStatement,
    StackedStatements,
    TautologyInjection,
    CommentTruncation,
    PrivilegedFunction,
    SystemCatalogAccess,
    ForbiddenTable,
    PermissionViolation,
    ExcessiveCost,
}

impl ThreatCategory {
    pub const ALL: [ThreatCategory; 10] = [
        ThreatCategory::MalformedQuery,
        ThreatCategory::DisallowedStatement,
        ThreatCategory::StackedStatements,
        ThreatCategory::TautologyInjection,
        ThreatCategory::CommentTruncation,
        ThreatCategory::PrivilegedFunction,
        ThreatCategory::SystemCatalogAccess,
        ThreatCategory::ForbiddenTable,
        ThreatCategory::PermissionViolation,
        ThreatCategory::ExcessiveCost,
    ];

    /// Threat-based findings end a run as a security violation when the
    /// repair budget runs out; the rest are structural.
    pub fn is_security_threat(&self) -> bool {
        !matches!(self, ThreatCategory::MalformedQuery | ThreatCategory::ExcessiveCost)
    }

    /// Categories that block at every level, Administrative included.
    fn is_mandatory(&self) -> bool {
        matches!(
            self,
            ThreatCategory::MalformedQuery
                | ThreatCategory::DisallowedStatement
                | ThreatCategory::StackedStatements
                | ThreatCategory::ForbiddenTable
                | ThreatCategory::PermissionViolation
        )
    }
}

impl fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Block,
    Warn,
}

/// Maps each threat category to the most permissive level at which it still
/// blocks. A category blocks at that level and every stricter one, which
/// makes Strict ⊇ Moderate ⊇ Relaxed ⊇ Administrative hold by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeverityTable {
    blocks_through: BTreeMap<ThreatCategory, ValidationLevel>,
}

impl Default for SeverityTable {
    fn default() -> Self {
        use ThreatCategory::*;
        use ValidationLevel::*;

        let blocks_through = [
            (MalformedQuery, Administrative),
            (DisallowedStatement, Administrative),
            (StackedStatements, Administrative),
            (ForbiddenTable, Administrative),
            (PermissionViolation, Administrative),
            (TautologyInjection, Relaxed),
            (PrivilegedFunction, Relaxed),
            (SystemCatalogAccess, Relaxed),
            (ExcessiveCost, Moderate),
            (CommentTruncation, Strict),
        ]
        .into_iter()
        .collect();

        Self { blocks_through }
    }
}

impl SeverityTable {
    /// Default table with policy overrides applied. Overrides cannot relax
    /// the categories that block at every level.
    pub fn with_overrides(overrides: &BTreeMap<ThreatCategory, ValidationLevel>) -> Self {
        let mut table = Self::default();
        for (category, level) in overrides {
            if category.is_mandatory() && *level != ValidationLevel::Administrative {
                warn!(
                    "Ignoring severity override for {}: it blocks at every level",
                    category
                );
                continue;
            }
            table.blocks_through.insert(*category, *level);
        }
        table
    }

    pub fn severity(&self, category: ThreatCategory, level: ValidationLevel) -> Severity {
        let through = self
            .blocks_through
            .get(&category)
            .copied()
            .unwrap_or(ValidationLevel::Administrative);
        if level <= through {
            Severity::Block
        } else {
            Severity::Warn
        }
    }
}

fn default_restricted_permission() -> String {
    "pii:read".to_string()
}

fn default_row_estimate() -> u64 {
    10_000
}

fn default_large_table_rows() -> u64 {
    100_000
}

fn default_cost_ceiling() -> f64 {
    1000.0
}

fn default_long_query_chars() -> usize {
    1000
}

fn default_privileged_functions() -> Vec<String> {
    [
        "pg_read_file",
        "pg_read_binary_file",
        "pg_ls_dir",
        "pg_stat_file",
        "pg_sleep",
        "pg_terminate_backend",
        "pg_cancel_backend",
        "pg_reload_conf",
        "pg_rotate_logfile",
        "lo_import",
        "lo_export",
        "dblink",
        "dblink_exec",
        "set_config",
        "xp_cmdshell",
        "sleep",
        "benchmark",
        "load_file",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_system_schemas() -> Vec<String> {
    ["information_schema", "pg_catalog", "pg_toast", "sys", "mysql", "sqlite_master"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Governance policy consumed by the validator.
///
/// Loaded from JSON; every field has a default so `{}` is a valid policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorPolicy {
    /// Table → column that carries the row's region.
    #[serde(default)]
    pub regional_tables: BTreeMap<String, String>,
    /// Table → columns only readable with `restricted_permission`.
    #[serde(default)]
    pub restricted_columns: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_restricted_permission")]
    pub restricted_permission: String,
    /// Table → permission required to read it at all.
    #[serde(default)]
    pub table_permissions: BTreeMap<String, String>,
    #[serde(default)]
    pub table_row_estimates: BTreeMap<String, u64>,
    #[serde(default = "default_row_estimate")]
    pub default_row_estimate: u64,
    #[serde(default = "default_large_table_rows")]
    pub large_table_rows: u64,
    #[serde(default = "default_cost_ceiling")]
    pub cost_ceiling: f64,
    #[serde(default = "default_privileged_functions")]
    pub privileged_functions: Vec<String>,
    #[serde(default = "default_system_schemas")]
    pub system_schemas: Vec<String>,
    #[serde(default = "default_long_query_chars")]
    pub long_query_chars: usize,
    #[serde(default)]
    pub severity_overrides: BTreeMap<ThreatCategory, ValidationLevel>,
}

impl Default for ValidatorPolicy {
    fn default() -> Self {
        Self {
            regional_tables: BTreeMap::new(),
            restricted_columns: BTreeMap::new(),
            restricted_permission: default_restricted_permission(),
            table_permissions: BTreeMap::new(),
            table_row_estimates: BTreeMap::new(),
            default_row_estimate: default_row_estimate(),
            large_table_rows: default_large_table_rows(),
            cost_ceiling: default_cost_ceiling(),
            privileged_functions: default_privileged_functions(),
            system_schemas: default_system_schemas(),
            long_query_chars: default_long_query_chars(),
            severity_overrides: BTreeMap::new(),
        }
    }
}

impl ValidatorPolicy {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("Failed to read policy {}: {}", path.display(), e))
        })?;
        let policy: ValidatorPolicy = serde_json::from_str(&content)?;
        Ok(policy.normalized())
    }

    /// Lowercase every table, column and function name so lookups can be
    /// case-insensitive.
    pub fn normalized(mut self) -> Self {
        fn lower_keys<V>(map: BTreeMap<String, V>) -> BTreeMap<String, V> {
            map.into_iter().map(|(k, v)| (k.to_lowercase(), v)).collect()
        }

        self.regional_tables = self
            .regional_tables
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v.to_lowercase()))
            .collect();
        self.restricted_columns = self
            .restricted_columns
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v.into_iter().map(|c| c.to_lowercase()).collect()))
            .collect();
        self.table_permissions = lower_keys(self.table_permissions);
        self.table_row_estimates = lower_keys(self.table_row_estimates);
        self.privileged_functions = self
            .privileged_functions
            .into_iter()
            .map(|f| f.to_lowercase())
            .collect();
        self.system_schemas = self
            .system_schemas
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        self
    }

    pub fn with_cost_ceiling(mut self, ceiling: f64) -> Self {
        self.cost_ceiling = ceiling;
        self
    }

    pub fn row_estimate(&self, table: &str) -> u64 {
        self.table_row_estimates
            .get(table)
            .copied()
            .unwrap_or(self.default_row_estimate)
    }

    pub fn region_column(&self, table: &str) -> Option<&str> {
        self.regional_tables.get(table).map(String::as_str)
    }

    pub fn restricted_columns_for(&self, table: &str) -> &[String] {
        self.restricted_columns
            .get(table)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn required_permission(&self, table: &str) -> Option<&str> {
        self.table_permissions.get(table).map(String::as_str)
    }

    pub fn is_privileged_function(&self, name: &str) -> bool {
        self.privileged_functions.iter().any(|f| f == name)
    }

    pub fn is_system_relation(&self, qualified: &str) -> bool {
        let lowered = qualified.to_lowercase();
        let mut parts = lowered.split('.');
        let first = parts.next().unwrap_or_default();
        let bare = lowered.rsplit('.').next().unwrap_or_default();
        self.system_schemas.iter().any(|s| s == first || s == bare) || bare.starts_with("pg_")
    }

    pub fn severity_table(&self) -> SeverityTable {
        SeverityTable::with_overrides(&self.severity_overrides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_ordered_strictest_first() {
        assert!(ValidationLevel::Strict < ValidationLevel::Moderate);
        assert!(ValidationLevel::Relaxed < ValidationLevel::Administrative);
        assert_eq!("ADMIN".parse::<ValidationLevel>().unwrap(), ValidationLevel::Administrative);
        assert!("lenient".parse::<ValidationLevel>().is_err());
    }

    #[test]
    fn test_severity_table_is_monotonic() {
        let table = SeverityTable::default();
        for category in ThreatCategory::ALL {
            for pair in ValidationLevel::ALL.windows(2) {
                let stricter = table.severity(category, pair[0]);
                let looser = table.severity(category, pair[1]);
                if looser == Severity::Block {
                    assert_eq!(stricter, Severity::Block, "{} at {}", category, pair[0]);
                }
            }
        }
    }

    #[test]
    fn test_excessive_cost_blocks_only_at_strict_and_moderate() {
        let table = SeverityTable::default();
        let cat = ThreatCategory::ExcessiveCost;
        assert_eq!(table.severity(cat, ValidationLevel::Strict), Severity::Block);
        assert_eq!(table.severity(cat, ValidationLevel::Moderate), Severity::Block);
        assert_eq!(table.severity(cat, ValidationLevel::Relaxed), Severity::Warn);
        assert_eq!(table.severity(cat, ValidationLevel::Administrative), Severity::Warn);
    }

    #[test]
    fn test_overrides_cannot_relax_mandatory_categories() {
        let mut overrides = BTreeMap::new();
        overrides.insert(ThreatCategory::DisallowedStatement, ValidationLevel::Strict);
        overrides.insert(ThreatCategory::CommentTruncation, ValidationLevel::Relaxed);
        let table = SeverityTable::with_overrides(&overrides);

        assert_eq!(
            table.severity(ThreatCategory::DisallowedStatement, ValidationLevel::Administrative),
            Severity::Block
        );
        assert_eq!(
            table.severity(ThreatCategory::CommentTruncation, ValidationLevel::Relaxed),
            Severity::Block
        );
    }

    #[test]
    fn test_policy_from_json_uses_defaults_and_normalizes() {
        let json = r#"{
            "regional_tables": {"Orders": "Region"},
            "restricted_columns": {"customers": ["Email", "password"]},
            "table_row_estimates": {"ORDER_ITEMS": 5000000}
        }"#;
        let policy: ValidatorPolicy = serde_json::from_str(json).unwrap();
        let policy = policy.normalized();

        assert_eq!(policy.region_column("orders"), Some("region"));
        assert_eq!(policy.restricted_columns_for("customers"), ["email", "password"]);
        assert_eq!(policy.row_estimate("order_items"), 5_000_000);
        assert_eq!(policy.row_estimate("unknown"), 10_000);
        assert_eq!(policy.restricted_permission, "pii:read");
        assert!(policy.is_privileged_function("pg_sleep"));
    }

    #[test]
    fn test_system_relations() {
        let policy = ValidatorPolicy::default();
        assert!(policy.is_system_relation("information_schema.tables"));
        assert!(policy.is_system_relation("pg_catalog.pg_user"));
        assert!(policy.is_system_relation("pg_shadow"));
        assert!(!policy.is_system_relation("public.customers"));
    }

    #[test]
    fn test_allowed_tables_compare_unqualified_names() {
        let user = UserContext::default().with_allowed_tables(["Customers", "orders"]);
        assert!(user.may_read_table("public.customers"));
        assert!(user.may_read_table("ORDERS"));
        assert!(!user.may_read_table("payroll"));
        assert!(UserContext::default().may_read_table("anything"));
    }
}
