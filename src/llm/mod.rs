//! LLM client abstraction.
//!
//! Defines the [`LlmClient`] trait used by every stage for structured JSON
//! generation and embeddings, plus:
//! - **[`DisabledLlm`]**: fails every call; used when no provider is configured.
//! - **[`openai::OpenAiClient`]**: OpenAI-compatible chat completions and
//!   embeddings with retry and backoff.
//!
//! Calls made through [`generate_logged`] and [`embed_logged`] are timed
//! and logged with the calling stage and operation name.
//!
//! # Retry Strategy
//!
//! The OpenAI client uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Context-length rejections → [`LlmError::ContextLengthExceeded`], never retried here
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

pub mod openai;

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use crate::config::LlmConfig;

/// Error types for LLM operations.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Backend is not available
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Request failed
    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// Rate limited by the backend
    #[error("Rate limited, retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    /// Input exceeded context length
    #[error("Context length exceeded: {max} tokens, got {actual}")]
    ContextLengthExceeded { max: u32, actual: u32 },

    /// Response did not decode
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("LLM provider is disabled")]
    Disabled,
}

/// A structured-output prompt.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub user: String,
    pub schema_name: &'static str,
    pub schema: Value,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Model identifier used in logs and structural traces.
    fn model_name(&self) -> &str;

    /// Generate a JSON object conforming to `schema`.
    async fn generate_json(
        &self,
        system: &str,
        user: &str,
        schema_name: &str,
        schema: &Value,
    ) -> Result<Value, LlmError>;

    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError>;
}

/// An LLM client that always returns errors.
pub struct DisabledLlm;

#[async_trait]
impl LlmClient for DisabledLlm {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate_json(&self, _: &str, _: &str, _: &str, _: &Value) -> Result<Value, LlmError> {
        Err(LlmError::Disabled)
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        Err(LlmError::Disabled)
    }
}

/// Instantiate the client selected by `config.provider`.
pub fn create_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledLlm)),
        "openai" => Ok(Arc::new(openai::OpenAiClient::new(config)?)),
        other => anyhow::bail!("Unknown llm provider: {}", other),
    }
}

/// Run a prompt, log its timing, and return the raw JSON.
pub async fn generate_logged(llm: &dyn LlmClient, stage: &str, op: &str, prompt: &Prompt) -> Result<Value> {
    let started = Instant::now();
    let result = llm
        .generate_json(&prompt.system, &prompt.user, prompt.schema_name, &prompt.schema)
        .await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(_) => tracing::debug!(stage, op, elapsed_ms, ok = true, model = llm.model_name(), "llm call"),
        Err(e) => tracing::warn!(stage, op, elapsed_ms, ok = false, model = llm.model_name(), error = %e, "llm call"),
    }
    Ok(result?)
}

/// Run a prompt and decode the response into `T`.
pub async fn generate_typed<T: DeserializeOwned>(
    llm: &dyn LlmClient,
    stage: &str,
    op: &str,
    prompt: &Prompt,
) -> Result<T> {
    let value = generate_logged(llm, stage, op, prompt).await?;
    serde_json::from_value(value).map_err(|e| LlmError::Parse(format!("{}: {}", op, e)).into())
}

/// Embed texts with timing, failing on empty vectors or a count mismatch.
pub async fn embed_logged(llm: &dyn LlmClient, stage: &str, op: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }
    let started = Instant::now();
    let result = llm.embed(texts).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(v) => tracing::debug!(stage, op, elapsed_ms, ok = true, count = v.len(), "embed call"),
        Err(e) => tracing::warn!(stage, op, elapsed_ms, ok = false, error = %e, "embed call"),
    }
    let vectors = result?;
    if vectors.len() != texts.len() {
        anyhow::bail!(
            "{}: embedding count mismatch: sent {}, got {}",
            op,
            texts.len(),
            vectors.len()
        );
    }
    if let Some(i) = vectors.iter().position(|v| v.is_empty()) {
        anyhow::bail!("{}: empty embedding at index {}", op, i);
    }
    Ok(vectors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_client_errors() {
        let llm = DisabledLlm;
        assert!(matches!(llm.embed(&["x".into()]).await, Err(LlmError::Disabled)));
        let prompt = Prompt {
            system: String::new(),
            user: String::new(),
            schema_name: "x",
            schema: Value::Null,
        };
        assert!(generate_logged(&llm, "test", "op", &prompt).await.is_err());
    }

    #[tokio::test]
    async fn embed_logged_skips_empty_input() {
        let out = embed_logged(&DisabledLlm, "test", "op", &[]).await.unwrap();
        assert!(out.is_empty());
    }
}
