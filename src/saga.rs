//! Saga compensations.
//!
//! Stages append a compensating action for every external write they
//! intend to make after commit, inside the same transaction as the
//! canonical rows. When a job fails, [`compensate`] replays the saga's
//! actions newest-first. Individual failures are logged and skipped;
//! deletes of missing objects are no-ops, so rerunning is safe.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use pathweaver_core::artifact::canonical_json;
use pathweaver_core::keys::sha256_hex;
use pathweaver_core::models::{SagaAction, SagaActionKind};

use crate::object_store::ObjectStore;
use crate::store::{Store, StoreTx};
use crate::vectors::pinecone::UPSERT_BATCH;
use crate::vectors::VectorStore;

pub const STATUS_DONE: &str = "done";
pub const STATUS_FAILED: &str = "failed";

pub fn pinecone_delete_payload(namespace: &str, ids: &[String]) -> Value {
    json!({ "namespace": namespace, "ids": ids })
}

pub fn object_store_delete_payload(category: &str, key: &str) -> Value {
    json!({ "category": category, "key": key })
}

/// Stable key of an action: SHA-256 of `kind` plus canonical payload.
pub fn action_key(kind: SagaActionKind, payload: &Value) -> String {
    sha256_hex(format!("{}:{}", kind.as_str(), canonical_json(payload)).as_bytes())
}

/// Append one action inside `tx`. Returns false if it was already recorded.
pub async fn append(tx: &mut dyn StoreTx, saga_id: Uuid, kind: SagaActionKind, payload: Value) -> Result<bool> {
    let key = action_key(kind, &payload);
    tx.append_saga_action(saga_id, kind, &key, &payload)
        .await
        .with_context(|| format!("append saga action {}", kind.as_str()))
}

/// Append one `pinecone_delete_ids` action per upsert batch of `ids`.
pub async fn append_pinecone_deletes(
    tx: &mut dyn StoreTx,
    saga_id: Uuid,
    namespace: &str,
    ids: &[String],
) -> Result<usize> {
    let mut appended = 0;
    for batch in ids.chunks(UPSERT_BATCH) {
        if append(tx, saga_id, SagaActionKind::PineconeDeleteIds, pinecone_delete_payload(namespace, batch)).await? {
            appended += 1;
        }
    }
    Ok(appended)
}

#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct CompensationReport {
    pub total: usize,
    pub done: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Side-effect targets available to the compensator. Missing targets
/// cause the matching actions to be skipped and left pending.
pub struct Compensator {
    pub store: Arc<dyn Store>,
    pub vectors: Option<Arc<dyn VectorStore>>,
    pub objects: Option<Arc<dyn ObjectStore>>,
}

impl Compensator {
    /// Execute pending actions of `saga_id` in reverse append order.
    pub async fn compensate(&self, saga_id: Uuid) -> Result<CompensationReport> {
        let actions = self.store.saga_actions(saga_id).await?;
        let mut report = CompensationReport::default();
        for action in actions.iter().rev().filter(|a| a.status != STATUS_DONE) {
            report.total += 1;
            match self.execute(action).await {
                Ok(true) => {
                    report.done += 1;
                    self.mark(action, STATUS_DONE).await;
                }
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        saga_id = %saga_id,
                        seq = action.seq,
                        kind = action.kind.as_str(),
                        error = %e,
                        "compensation failed; continuing"
                    );
                    self.mark(action, STATUS_FAILED).await;
                }
            }
        }
        tracing::info!(saga_id = %saga_id, ?report, "saga compensated");
        Ok(report)
    }

    async fn mark(&self, action: &SagaAction, status: &str) {
        if let Err(e) = self.store.mark_saga_action(action.id, status).await {
            tracing::warn!(action_id = %action.id, error = %e, "failed to mark saga action");
        }
    }

    /// `Ok(false)` when the needed client is not configured.
    async fn execute(&self, action: &SagaAction) -> Result<bool> {
        match action.kind {
            SagaActionKind::PineconeDeleteIds => {
                let Some(vectors) = &self.vectors else {
                    return Ok(false);
                };
                let namespace = payload_str(&action.payload, "namespace")?;
                let ids: Vec<String> = action
                    .payload
                    .get("ids")
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                    .unwrap_or_default();
                if ids.is_empty() {
                    return Ok(true);
                }
                vectors.delete_ids(namespace, &ids).await?;
                Ok(true)
            }
            SagaActionKind::ObjectStoreDeleteKey => {
                let Some(objects) = &self.objects else {
                    return Ok(false);
                };
                let category = payload_str(&action.payload, "category")?;
                let key = payload_str(&action.payload, "key")?;
                objects.delete(category, key).await?;
                Ok(true)
            }
        }
    }
}

fn payload_str<'a>(payload: &'a Value, field: &str) -> Result<&'a str> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("saga payload missing {}", field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::LocalObjectStore;
    use crate::store::memory::InMemoryStore;
    use crate::vectors::{MemoryVectorStore, VectorRecord};

    #[test]
    fn action_key_ignores_key_order() {
        let a = json!({"namespace": "ns", "ids": ["1"]});
        let b: Value = serde_json::from_str(r#"{"ids":["1"],"namespace":"ns"}"#).unwrap();
        assert_eq!(
            action_key(SagaActionKind::PineconeDeleteIds, &a),
            action_key(SagaActionKind::PineconeDeleteIds, &b)
        );
        assert_ne!(
            action_key(SagaActionKind::PineconeDeleteIds, &a),
            action_key(SagaActionKind::ObjectStoreDeleteKey, &a)
        );
    }

    #[tokio::test]
    async fn compensate_runs_in_reverse_and_continues_past_errors() {
        let store = Arc::new(InMemoryStore::new());
        let vectors = Arc::new(MemoryVectorStore::new());
        let dir = tempfile::tempdir().unwrap();
        let objects = Arc::new(LocalObjectStore::new(dir.path()));
        objects.upload_file("img", "a.png", b"x").await.unwrap();
        vectors
            .upsert(
                "ns",
                &[VectorRecord {
                    id: "v1".into(),
                    values: vec![1.0],
                    metadata: Default::default(),
                }],
            )
            .await
            .unwrap();

        let saga = Uuid::new_v4();
        let mut tx = store.begin().await.unwrap();
        append_pinecone_deletes(tx.as_mut(), saga, "ns", &["v1".to_string()]).await.unwrap();
        append(
            tx.as_mut(),
            saga,
            SagaActionKind::ObjectStoreDeleteKey,
            object_store_delete_payload("img", "../escape"),
        )
        .await
        .unwrap();
        append(
            tx.as_mut(),
            saga,
            SagaActionKind::ObjectStoreDeleteKey,
            object_store_delete_payload("img", "a.png"),
        )
        .await
        .unwrap();
        // Same payload twice is one action.
        append_pinecone_deletes(tx.as_mut(), saga, "ns", &["v1".to_string()]).await.unwrap();
        tx.commit().await.unwrap();

        let compensator = Compensator {
            store: store.clone(),
            vectors: Some(vectors.clone()),
            objects: Some(objects.clone()),
        };
        let report = compensator.compensate(saga).await.unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.done, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(vectors.count("ns"), 0);
        assert!(!dir.path().join("img/a.png").exists());

        // Second run only retries the failed action.
        let again = compensator.compensate(saga).await.unwrap();
        assert_eq!(again.total, 1);
    }

    #[tokio::test]
    async fn missing_clients_leave_actions_pending() {
        let store = Arc::new(InMemoryStore::new());
        let saga = Uuid::new_v4();
        let mut tx = store.begin().await.unwrap();
        append_pinecone_deletes(tx.as_mut(), saga, "ns", &["a".to_string()]).await.unwrap();
        tx.commit().await.unwrap();
        let compensator = Compensator {
            store: store.clone(),
            vectors: None,
            objects: None,
        };
        let report = compensator.compensate(saga).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(store.saga_actions(saga).await.unwrap()[0].status, "pending");
    }
}
