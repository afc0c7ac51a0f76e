//! Question
//!
//! The accepted input of a run. Construction validates the shape of the
//! input; once built a question is never mutated.

use crate::error::{PipelineError, Result};
use crate::security::UserContext;
use serde::{Deserialize, Serialize};

pub const MAX_QUESTION_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExplanationStyle {
    #[default]
    Concise,
    Detailed,
    Technical,
}

impl ExplanationStyle {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "detailed" => ExplanationStyle::Detailed,
            "technical" => ExplanationStyle::Technical,
            _ => ExplanationStyle::Concise,
        }
    }
}

/// The previous turn of a conversation, used to resolve follow-ups.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PriorTurn {
    pub question: String,
    pub tables: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionPreferences {
    pub explanation_style: ExplanationStyle,
    pub row_limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Question {
    text: String,
    user: UserContext,
    prior_turn: Option<PriorTurn>,
    preferences: ExecutionPreferences,
}

impl Question {
    pub fn new(text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::InvalidQuestion("question is empty".to_string()));
        }
        if trimmed.chars().count() > MAX_QUESTION_CHARS {
            return Err(PipelineError::InvalidQuestion(format!(
                "question exceeds {} characters",
                MAX_QUESTION_CHARS
            )));
        }
        if trimmed.contains('\0') {
            return Err(PipelineError::InvalidQuestion(
                "question contains a NUL character".to_string(),
            ));
        }
        Ok(Self {
            text: trimmed.to_string(),
            user: UserContext::default(),
            prior_turn: None,
            preferences: ExecutionPreferences::default(),
        })
    }

    pub fn with_user(mut self, user: UserContext) -> Self {
        self.user = user;
        self
    }

    pub fn with_prior_turn(mut self, prior: PriorTurn) -> Self {
        self.prior_turn = Some(prior);
        self
    }

    pub fn with_preferences(mut self, preferences: ExecutionPreferences) -> Result<Self> {
        if preferences.row_limit == Some(0) {
            return Err(PipelineError::InvalidQuestion(
                "row limit must be at least 1".to_string(),
            ));
        }
        self.preferences = preferences;
        Ok(self)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn user(&self) -> &UserContext {
        &self.user
    }

    pub fn prior_turn(&self) -> Option<&PriorTurn> {
        self.prior_turn.as_ref()
    }

    pub fn preferences(&self) -> &ExecutionPreferences {
        &self.preferences
    }

    /// Row cap for this question under a pipeline-wide maximum.
    pub fn row_limit(&self, max_rows: usize) -> usize {
        self.preferences
            .row_limit
            .map_or(max_rows, |limit| limit.min(max_rows))
    }
}
