//! Query Validation and Governance
//!
//! Static and semantic checks that stand between a generated query and the
//! database.

pub mod access_control;
pub mod ast;
pub mod policy;
pub mod query_guards;
pub mod sanitize;
pub mod threats;
pub mod validator;

pub use access_control::AccessController;
pub use policy::{Role, Severity, SeverityTable, ThreatCategory, UserContext, ValidationLevel, ValidatorPolicy};
pub use query_guards::{CostEstimate, QueryGuards};
pub use validator::{QueryValidator, Threat, ValidationVerdict};
