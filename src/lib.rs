pub mod agent_prompts;
pub mod config;
pub mod error;
pub mod execution;
pub mod execution_loop;
pub mod explain;
pub mod generation;
pub mod intent;
pub mod llm;
pub mod orchestrator;
pub mod question;
pub mod schema_context;
pub mod security;
pub mod tokens;

// Query history for finished runs
pub mod db;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use llm::{CompletionEngine, OpenAiCompletion};
pub use orchestrator::{Orchestrator, ResponseEnvelope, RunStatus};
pub use question::Question;
pub use security::{QueryValidator, UserContext, ValidationLevel, ValidatorPolicy};
