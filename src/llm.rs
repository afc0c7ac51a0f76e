//! Completion Engine
//!
//! The language model is reached only through [`CompletionEngine`]: a prompt
//! goes in, text comes out. Components that need structured output ask for
//! [`ResponseShape::Json`] and decode with [`parse_structured`]; a completion
//! that does not match the component's JSON contract is a
//! [`PipelineError::MalformedCompletion`], never something to scrape.

use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Which pipeline stage issued a completion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompletionPurpose {
    IntentClassification,
    QueryGeneration,
    QueryRepair,
    ResultExplanation,
}

/// Shape the caller expects back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseShape {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub purpose: CompletionPurpose,
    pub system: Option<String>,
    pub prompt: String,
    pub shape: ResponseShape,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    /// A request whose answer must be a single JSON object.
    pub fn json(purpose: CompletionPurpose, prompt: impl Into<String>) -> Self {
        Self {
            purpose,
            system: None,
            prompt: prompt.into(),
            shape: ResponseShape::Json,
            max_tokens: 800,
            temperature: 0.1,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
pub trait CompletionEngine: Send + Sync {
    /// Complete one prompt. Implementations return the raw model text.
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// Decode a structured completion into `T`.
///
/// Markdown code fences around the object are tolerated (models add them even
/// when told not to); anything else that fails to deserialize is malformed.
pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let cleaned = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```JSON")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    serde_json::from_str(cleaned).map_err(|e| {
        let preview: String = cleaned.chars().take(200).collect();
        PipelineError::MalformedCompletion(format!("{} (response: {})", e, preview))
    })
}

/// OpenAI-compatible chat-completions client.
#[derive(Clone)]
pub struct OpenAiCompletion {
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiCompletion {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            client: reqwest::Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_body(&self, request: &CompletionRequest) -> serde_json::Value {
        let system = request.system.clone().unwrap_or_else(|| match request.shape {
            ResponseShape::Json => "Return JSON only, no text.".to_string(),
            ResponseShape::Text => "You are a concise data analyst.".to_string(),
        });

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": request.prompt}
            ],
            "temperature": request.temperature,
        });

        // Reasoning models spend tokens before answering and only accept
        // max_completion_tokens.
        if self.model.starts_with("gpt-5") || self.model.contains("o1") {
            body["max_completion_tokens"] = serde_json::json!(request.max_tokens.max(2000));
        } else if self.model.starts_with("gpt-4") {
            body["max_completion_tokens"] = serde_json::json!(request.max_tokens);
        } else {
            body["max_tokens"] = serde_json::json!(request.max_tokens);
        }

        if request.shape == ResponseShape::Json {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }

        body
    }
}

#[async_trait]
impl CompletionEngine for OpenAiCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        debug!(purpose = ?request.purpose, model = %self.model, "Calling completion API");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| PipelineError::Completion(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(PipelineError::Completion(format!(
                "LLM API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PipelineError::Completion(format!("Failed to parse LLM response: {}", e)))?;

        if let Some(error) = response_json.get("error") {
            return Err(PipelineError::Completion(format!("LLM API error: {}", error)));
        }

        let choice = response_json
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .ok_or_else(|| PipelineError::Completion("No choices in LLM response".to_string()))?;

        match choice.get("finish_reason").and_then(|r| r.as_str()) {
            Some("length") => warn!("⚠️  LLM response was truncated due to length limit"),
            Some("content_filter") => {
                return Err(PipelineError::Completion(
                    "LLM response was filtered by content policy".to_string(),
                ))
            }
            _ => {}
        }

        let content = choice["message"]["content"]
            .as_str()
            .ok_or_else(|| PipelineError::Completion("No content in LLM response".to_string()))?;

        if content.trim().is_empty() {
            return Err(PipelineError::Completion("Empty content in LLM response".to_string()));
        }

        Ok(content.to_string())
    }
}

/// Wraps any engine with a shared concurrency bound and a per-call timeout.
///
/// One instance is shared by every run, so the semaphore caps in-flight model
/// calls across the whole process. The timeout covers waiting for a permit
/// as well as the call itself.
#[derive(Clone)]
pub struct BoundedCompletion {
    inner: Arc<dyn CompletionEngine>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl BoundedCompletion {
    pub fn new(inner: Arc<dyn CompletionEngine>, max_concurrent: usize, timeout: Duration) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            timeout,
        }
    }

}

#[async_trait]
impl CompletionEngine for BoundedCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        debug!(
            purpose = ?request.purpose,
            available = self.permits.available_permits(),
            "Acquiring completion permit"
        );
        let call = async {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|e| PipelineError::Completion(format!("Completion pool closed: {}", e)))?;
            self.inner.complete(request).await
        };

        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(purpose = ?request.purpose, timeout = ?self.timeout, "Completion call timed out");
                Err(PipelineError::CompletionTimeout(self.timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowEngine {
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl CompletionEngine for SlowEngine {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok("{}".to_string())
        }
    }

    #[derive(Debug, Deserialize)]
    struct SqlReply {
        sql: String,
    }

    #[test]
    fn test_parse_structured_strips_fences() {
        let raw = "```json\n{\"sql\": \"SELECT 1\"}\n```";
        let reply: SqlReply = parse_structured(raw).unwrap();
        assert_eq!(reply.sql, "SELECT 1");
    }

    #[test]
    fn test_parse_structured_rejects_prose() {
        let raw = "Sure! Here is the query: SELECT 1";
        let err = parse_structured::<SqlReply>(raw).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedCompletion(_)));
    }

    #[test]
    fn test_request_body_uses_json_mode() {
        let client = OpenAiCompletion::new("k".into(), "gpt-4o-mini".into(), "http://x/v1/".into());
        let req = CompletionRequest::json(CompletionPurpose::QueryGeneration, "hi");
        let body = client.request_body(&req);
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["max_completion_tokens"], 800);
        assert_eq!(client.base_url, "http://x/v1");
        assert_eq!(body["messages"][0]["content"], "Return JSON only, no text.");

        let req = CompletionRequest {
            shape: ResponseShape::Text,
            ..CompletionRequest::json(CompletionPurpose::ResultExplanation, "hi")
        };
        assert!(client.request_body(&req).get("response_format").is_none());
    }

    #[tokio::test]
    async fn test_bounded_completion_times_out() {
        let engine = Arc::new(SlowEngine {
            delay: Duration::from_millis(200),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let bounded = BoundedCompletion::new(engine, 2, Duration::from_millis(20));
        let req = CompletionRequest::json(CompletionPurpose::IntentClassification, "x");
        let err = bounded.complete(&req).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_bounded_completion_limits_concurrency() {
        let engine = Arc::new(SlowEngine {
            delay: Duration::from_millis(30),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let bounded = BoundedCompletion::new(engine.clone(), 2, Duration::from_secs(5));
        let req = CompletionRequest::json(CompletionPurpose::QueryGeneration, "x");

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..6 {
            let bounded = bounded.clone();
            let req = req.clone();
            set.spawn(async move { bounded.complete(&req).await });
        }
        while let Some(joined) = set.join_next().await {
            assert!(joined.unwrap().is_ok());
        }
        assert!(engine.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(bounded.permits.available_permits(), 2);
    }
}
