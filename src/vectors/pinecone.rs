//! Pinecone-compatible REST data plane client.
//!
//! Requires `PINECONE_API_KEY`. `vectors.base_url` is the index host
//! (e.g. `https://my-index-abc123.svc.us-east1-gcp.pinecone.io`).

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use super::{VectorFilter, VectorMatch, VectorRecord, VectorStore};
use crate::config::VectorsConfig;

/// Pinecone limits upserts to 1000 vectors per request; stay well below.
pub const UPSERT_BATCH: usize = 100;

pub struct PineconeStore {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl PineconeStore {
    pub fn new(config: &VectorsConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("vectors.base_url required for Pinecone provider"))?;
        let api_key = match std::env::var("PINECONE_API_KEY") {
            Ok(k) => k,
            Err(_) => bail!("PINECONE_API_KEY environment variable not set"),
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .header("Api-Key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .with_context(|| format!("pinecone request to {}", path))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Pinecone API error {}: {}", status, text);
        }
        let text = response.text().await.unwrap_or_default();
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl VectorStore for PineconeStore {
    async fn upsert(&self, namespace: &str, vectors: &[VectorRecord]) -> Result<()> {
        for batch in vectors.chunks(UPSERT_BATCH) {
            let body = json!({ "namespace": namespace, "vectors": batch });
            self.post("/vectors/upsert", &body).await?;
        }
        Ok(())
    }

    async fn query_matches(
        &self,
        namespace: &str,
        embedding: &[f32],
        top_k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorMatch>> {
        let mut body = json!({
            "namespace": namespace,
            "vector": embedding,
            "topK": top_k,
            "includeMetadata": false,
            "includeValues": false,
        });
        if let Some(f) = filter.to_json() {
            body["filter"] = f;
        }
        let resp = self.post("/query", &body).await?;
        Ok(parse_matches(&resp))
    }

    async fn delete_ids(&self, namespace: &str, ids: &[String]) -> Result<()> {
        for batch in ids.chunks(UPSERT_BATCH) {
            let body = json!({ "namespace": namespace, "ids": batch });
            self.post("/vectors/delete", &body).await?;
        }
        Ok(())
    }
}

fn parse_matches(resp: &Value) -> Vec<VectorMatch> {
    resp.get("matches")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|m| {
                    Some(VectorMatch {
                        id: m.get("id")?.as_str()?.to_string(),
                        score: m.get("score").and_then(Value::as_f64).unwrap_or(0.0) as f32,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_matches_and_skips_malformed() {
        let resp = json!({"matches": [
            {"id": "a", "score": 0.9},
            {"score": 0.5},
            {"id": "b"}
        ]});
        let m = parse_matches(&resp);
        assert_eq!(m.len(), 2);
        assert_eq!(m[0].id, "a");
        assert_eq!(m[1].score, 0.0);
        assert!(parse_matches(&json!({})).is_empty());
    }
}
