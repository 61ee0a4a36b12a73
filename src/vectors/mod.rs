//! Vector store abstraction.
//!
//! Vector indexes are caches over canonical rows: stages write to them
//! after commit and treat every failure as non-fatal. Two adapters exist:
//! - **[`pinecone::PineconeStore`]**: Pinecone-compatible REST data plane.
//! - **[`MemoryVectorStore`]**: brute-force cosine over an in-process map,
//!   used by tests and local runs.

pub mod pinecone;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use pathweaver_core::embedding::cosine_similarity;

use crate::config::VectorsConfig;

pub const CONCEPTS_GLOBAL_NS: &str = "concepts:global";
pub const USER_PROFILE_NS: &str = "user_profile";

pub fn chunks_ns(material_set_id: Uuid) -> String {
    format!("chunks:{}", material_set_id)
}

pub fn concepts_path_ns(path_id: Uuid) -> String {
    format!("concepts:path:{}", path_id)
}

pub fn activities_path_ns(path_id: Uuid) -> String {
    format!("activities:path:{}", path_id)
}

pub fn material_set_summaries_ns(user_id: Uuid) -> String {
    format!("material_set_summaries:{}", user_id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub values: Vec<f32>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
}

/// Metadata filter: an optional `type` equality plus `$in` constraints.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorFilter {
    pub kind: Option<String>,
    pub any_of: BTreeMap<String, Vec<String>>,
}

impl VectorFilter {
    pub fn of_type(kind: &str) -> Self {
        Self {
            kind: Some(kind.to_string()),
            any_of: BTreeMap::new(),
        }
    }

    pub fn with_in(mut self, field: &str, values: Vec<String>) -> Self {
        if !values.is_empty() {
            self.any_of.insert(field.to_string(), values);
        }
        self
    }

    /// Pinecone filter JSON, `None` when unconstrained.
    pub fn to_json(&self) -> Option<Value> {
        let mut obj = Map::new();
        if let Some(k) = &self.kind {
            obj.insert("type".to_string(), json!({"$eq": k}));
        }
        for (field, values) in &self.any_of {
            obj.insert(field.clone(), json!({"$in": values}));
        }
        (!obj.is_empty()).then_some(Value::Object(obj))
    }

    pub fn matches(&self, metadata: &Map<String, Value>) -> bool {
        if let Some(k) = &self.kind {
            if metadata.get("type").and_then(Value::as_str) != Some(k.as_str()) {
                return false;
            }
        }
        self.any_of.iter().all(|(field, values)| {
            metadata
                .get(field)
                .and_then(Value::as_str)
                .map(|v| values.iter().any(|x| x == v))
                .unwrap_or(false)
        })
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, namespace: &str, vectors: &[VectorRecord]) -> Result<()>;

    async fn query_matches(
        &self,
        namespace: &str,
        embedding: &[f32],
        top_k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorMatch>>;

    async fn query_ids(
        &self,
        namespace: &str,
        embedding: &[f32],
        top_k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<String>> {
        Ok(self
            .query_matches(namespace, embedding, top_k, filter)
            .await?
            .into_iter()
            .map(|m| m.id)
            .collect())
    }

    /// Deleting IDs that do not exist is not an error.
    async fn delete_ids(&self, namespace: &str, ids: &[String]) -> Result<()>;
}

/// Instantiate the store selected by `config.provider`; `None` when disabled.
pub fn create_store(config: &VectorsConfig) -> Result<Option<Arc<dyn VectorStore>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "memory" => Ok(Some(Arc::new(MemoryVectorStore::new()))),
        "pinecone" => Ok(Some(Arc::new(pinecone::PineconeStore::new(config)?))),
        other => bail!("Unknown vectors provider: {}", other),
    }
}

/// In-process vector store with an injectable failure switch.
#[derive(Default)]
pub struct MemoryVectorStore {
    namespaces: Mutex<HashMap<String, BTreeMap<String, VectorRecord>>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn count(&self, namespace: &str) -> usize {
        self.namespaces
            .lock()
            .map(|m| m.get(namespace).map(|ns| ns.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn ids(&self, namespace: &str) -> Vec<String> {
        self.namespaces
            .lock()
            .map(|m| m.get(namespace).map(|ns| ns.keys().cloned().collect()).unwrap_or_default())
            .unwrap_or_default()
    }

    fn check(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            bail!("vector store unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(&self, namespace: &str, vectors: &[VectorRecord]) -> Result<()> {
        self.check()?;
        let mut guard = self
            .namespaces
            .lock()
            .map_err(|_| anyhow::anyhow!("vector store lock poisoned"))?;
        let ns = guard.entry(namespace.to_string()).or_default();
        for v in vectors {
            ns.insert(v.id.clone(), v.clone());
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
        self.check()?;
        let guard = self
            .namespaces
            .lock()
            .map_err(|_| anyhow::anyhow!("vector store lock poisoned"))?;
        let Some(ns) = guard.get(namespace) else {
            return Ok(Vec::new());
        };
        let mut matches: Vec<VectorMatch> = ns
            .values()
            .filter(|r| filter.matches(&r.metadata))
            .map(|r| VectorMatch {
                id: r.id.clone(),
                score: cosine_similarity(embedding, &r.values),
            })
            .collect();
        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn delete_ids(&self, namespace: &str, ids: &[String]) -> Result<()> {
        self.check()?;
        let mut guard = self
            .namespaces
            .lock()
            .map_err(|_| anyhow::anyhow!("vector store lock poisoned"))?;
        if let Some(ns) = guard.get_mut(namespace) {
            for id in ids {
                ns.remove(id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: &str, values: Vec<f32>, kind: &str, file: &str) -> VectorRecord {
        let mut metadata = Map::new();
        metadata.insert("type".into(), json!(kind));
        metadata.insert("file_id".into(), json!(file));
        VectorRecord {
            id: id.into(),
            values,
            metadata,
        }
    }

    #[tokio::test]
    async fn memory_store_query_filters_and_ranks() {
        let store = MemoryVectorStore::new();
        store
            .upsert(
                "ns",
                &[
                    rec("a", vec![1.0, 0.0], "chunk", "f1"),
                    rec("b", vec![0.7, 0.7], "chunk", "f2"),
                    rec("c", vec![1.0, 0.0], "concept", "f1"),
                ],
            )
            .await
            .unwrap();
        let filter = VectorFilter::of_type("chunk");
        let ids = store.query_ids("ns", &[1.0, 0.0], 5, &filter).await.unwrap();
        assert_eq!(ids, vec!["a", "b"]);

        let only_f2 = VectorFilter::of_type("chunk").with_in("file_id", vec!["f2".into()]);
        let ids = store.query_ids("ns", &[1.0, 0.0], 5, &only_f2).await.unwrap();
        assert_eq!(ids, vec!["b"]);
    }

    #[tokio::test]
    async fn memory_store_failing_and_delete() {
        let store = MemoryVectorStore::new();
        store.upsert("ns", &[rec("a", vec![1.0], "chunk", "f")]).await.unwrap();
        store.delete_ids("ns", &["a".into(), "missing".into()]).await.unwrap();
        assert_eq!(store.count("ns"), 0);
        store.set_failing(true);
        assert!(store.upsert("ns", &[]).await.is_err());
    }

    #[test]
    fn filter_json_shape() {
        let f = VectorFilter::of_type("chunk").with_in("file_id", vec!["x".into()]);
        assert_eq!(
            f.to_json().unwrap(),
            json!({"type": {"$eq": "chunk"}, "file_id": {"$in": ["x"]}})
        );
        assert!(VectorFilter::default().to_json().is_none());
    }
}
