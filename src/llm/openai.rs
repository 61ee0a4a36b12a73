//! OpenAI-compatible chat completions and embeddings.
//!
//! Requires the `OPENAI_API_KEY` environment variable. The base URL is
//! configurable so any compatible gateway can be used.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use super::{LlmClient, LlmError};
use crate::config::LlmConfig;

pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    embedding_model: String,
    dims: usize,
    max_retries: u32,
}

impl OpenAiClient {
    /// # Errors
    ///
    /// Returns an error if `model`, `embedding_model` or `embedding_dims`
    /// is not set, or if `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for OpenAI provider"))?;
        let embedding_model = config
            .embedding_model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.embedding_model required for OpenAI provider"))?;
        let dims = config
            .embedding_dims
            .ok_or_else(|| anyhow::anyhow!("llm.embedding_dims required for OpenAI provider"))?;

        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(k) => k,
            Err(_) => bail!("OPENAI_API_KEY environment variable not set"),
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model,
            embedding_model,
            dims,
            max_retries: config.max_retries,
        })
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// POST `body` to `path` with retry/backoff.
    ///
    /// - HTTP 429 or 5xx → retry with exponential backoff
    /// - HTTP 4xx (not 429) → fail immediately, classifying context-length errors
    /// - Network error → retry
    async fn post_with_retry(&self, path: &str, body: &Value) -> Result<Value, LlmError> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response
                            .json::<Value>()
                            .await
                            .map_err(|e| LlmError::Parse(e.to_string()));
                    }

                    if status.as_u16() == 429 {
                        let retry_after_ms = response
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .map(|s| s * 1000);
                        last_err = Some(LlmError::RateLimited { retry_after_ms });
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.is_server_error() {
                        last_err = Some(LlmError::RequestFailed(format!(
                            "OpenAI API error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    if is_context_length_body(&body_text) {
                        return Err(LlmError::ContextLengthExceeded { max: 0, actual: 0 });
                    }
                    return Err(LlmError::RequestFailed(format!(
                        "OpenAI API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(LlmError::Unavailable(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| LlmError::RequestFailed("failed after retries".to_string())))
    }
}

fn is_context_length_body(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("context_length_exceeded") || lower.contains("maximum context length")
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate_json(
        &self,
        system: &str,
        user: &str,
        schema_name: &str,
        schema: &Value,
    ) -> Result<Value, LlmError> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {"name": schema_name, "schema": schema, "strict": false},
            },
        });
        let resp = self.post_with_retry("/chat/completions", &body).await?;
        parse_chat_response(&resp)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let body = json!({
            "model": self.embedding_model,
            "input": texts,
            "dimensions": self.dims,
        });
        let resp = self.post_with_retry("/embeddings", &body).await?;
        parse_embedding_response(&resp)
    }
}

/// Extract and decode `choices[0].message.content` as JSON.
fn parse_chat_response(json: &Value) -> Result<Value, LlmError> {
    let choice = json
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| LlmError::Parse("missing choices".to_string()))?;
    if choice.get("finish_reason").and_then(Value::as_str) == Some("length") {
        return Err(LlmError::ContextLengthExceeded { max: 0, actual: 0 });
    }
    let content = choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .ok_or_else(|| LlmError::Parse("missing message content".to_string()))?;
    serde_json::from_str(content).map_err(|e| LlmError::Parse(format!("content is not JSON: {}", e)))
}

/// Extract `data[].embedding` arrays ordered by `index`.
fn parse_embedding_response(json: &Value) -> Result<Vec<Vec<f32>>, LlmError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| LlmError::Parse("Invalid OpenAI response: missing data array".to_string()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| LlmError::Parse("Invalid OpenAI response: missing embedding".to_string()))?;
        let index = item.get("index").and_then(Value::as_u64).map(|i| i as usize).unwrap_or(pos);
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chat_content_json() {
        let resp = json!({"choices": [{"finish_reason": "stop", "message": {"content": "{\"concepts\": []}"}}]});
        assert_eq!(parse_chat_response(&resp).unwrap(), json!({"concepts": []}));
    }

    #[test]
    fn truncated_chat_is_context_length() {
        let resp = json!({"choices": [{"finish_reason": "length", "message": {"content": "{"}}]});
        assert!(matches!(
            parse_chat_response(&resp),
            Err(LlmError::ContextLengthExceeded { .. })
        ));
    }

    #[test]
    fn embeddings_reordered_by_index() {
        let resp = json!({"data": [
            {"index": 1, "embedding": [2.0]},
            {"index": 0, "embedding": [1.0]}
        ]});
        assert_eq!(parse_embedding_response(&resp).unwrap(), vec![vec![1.0], vec![2.0]]);
    }

    #[test]
    fn context_length_body_detection() {
        assert!(is_context_length_body("{\"error\":{\"code\":\"context_length_exceeded\"}}"));
        assert!(is_context_length_body("This model's maximum context length is 8192 tokens"));
        assert!(!is_context_length_body("invalid api key"));
    }
}
