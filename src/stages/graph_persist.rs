//! Concept graph persistence shared by the build and patch stages.
//!
//! Rows get deterministic IDs (`stable_id` over their natural keys), so
//! identical model output always produces identical concept, evidence and
//! edge IDs. Writes happen in one transaction under the
//! `concept_graph_build` advisory lock, together with the saga actions
//! that undo the vector upserts that follow.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{json, Map};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use pathweaver_core::edges::EdgeItem;
use pathweaver_core::inventory::ConceptItem;
use pathweaver_core::keys::{advisory_key64, parse_uuids, stable_id};
use pathweaver_core::models::{
    Concept, ConceptEdge, ConceptEvidence, ConceptMetadata, ConceptScope, EdgeEvidence,
};

use crate::error::is_unique_violation;
use crate::mirror::GraphMirror;
use crate::saga;
use crate::store::{Store, StoreTx};
use crate::vectors::{concepts_path_ns, VectorRecord};

pub const GRAPH_LOCK_NS: &str = "concept_graph_build";
pub const EVIDENCE_KIND: &str = "inventory";

const CONCEPT_NS: Uuid = Uuid::from_u128(0x9d2f_41a8_3c6e_4b07_8e15_c4a0_7f32_d003);
const EVIDENCE_NS: Uuid = Uuid::from_u128(0x51c7_0e9b_a284_4d6f_b3e1_2d58_9a0c_e004);
const EDGE_NS: Uuid = Uuid::from_u128(0xc03a_6b5d_19f2_47e8_a7c4_5e61_b8d9_f005);

pub fn path_concept_id(path_id: Uuid, key: &str) -> Uuid {
    stable_id(CONCEPT_NS, &[&path_id.to_string(), key])
}

fn evidence_id(concept_id: Uuid, chunk_id: Uuid) -> Uuid {
    stable_id(EVIDENCE_NS, &[&concept_id.to_string(), &chunk_id.to_string()])
}

fn edge_id(from: Uuid, to: Uuid, kind: &str) -> Uuid {
    stable_id(EDGE_NS, &[&from.to_string(), &to.to_string(), kind])
}

// ═══════════════════════════════════════════════════════════════════════
// Row construction
// ═══════════════════════════════════════════════════════════════════════

/// Rows ready to insert. Parent links are applied in a second pass so
/// that every concept exists before it is referenced.
#[derive(Debug, Clone, Default)]
pub struct GraphRows {
    pub concepts: Vec<Concept>,
    pub parents: Vec<(Uuid, Uuid)>,
    pub evidence: Vec<ConceptEvidence>,
    pub edges: Vec<ConceptEdge>,
}

impl GraphRows {
    /// Build rows for `items`. `existing` maps keys already stored for the
    /// path to their IDs; those items are not re-inserted but still
    /// resolve as parents and edge endpoints.
    pub fn build(path_id: Uuid, items: &[ConceptItem], edges: &[EdgeItem], existing: &HashMap<String, Uuid>) -> Self {
        let now = Utc::now();
        let mut ids: HashMap<String, Uuid> = existing.clone();
        let mut rows = GraphRows::default();
        let base_index = existing.len() as i32;
        for (i, item) in items.iter().filter(|i| !existing.contains_key(&i.key)).enumerate() {
            let concept = concept_row(path_id, item, base_index + i as i32, now);
            ids.insert(item.key.clone(), concept.id);
            for chunk_id in item.citation_ids() {
                rows.evidence.push(ConceptEvidence {
                    id: evidence_id(concept.id, chunk_id),
                    concept_id: concept.id,
                    material_chunk_id: chunk_id,
                    kind: EVIDENCE_KIND.to_string(),
                    weight: 1.0,
                    deleted_at: None,
                });
            }
            rows.concepts.push(concept);
        }
        for item in items.iter().filter(|i| !existing.contains_key(&i.key)) {
            if item.parent_key.is_empty() {
                continue;
            }
            if let (Some(&child), Some(&parent)) = (ids.get(&item.key), ids.get(&item.parent_key)) {
                rows.parents.push((child, parent));
            }
        }
        for e in edges {
            let (Some(&from), Some(&to)) = (ids.get(&e.from_key), ids.get(&e.to_key)) else {
                continue;
            };
            let kind = e.kind();
            rows.edges.push(ConceptEdge {
                id: edge_id(from, to, kind.as_str()),
                from_concept_id: from,
                to_concept_id: to,
                edge_type: kind,
                strength: e.strength,
                evidence: EdgeEvidence {
                    rationale: e.rationale.clone(),
                    citations: parse_uuids(&e.citations),
                },
                deleted_at: None,
            });
        }
        rows
    }

    pub fn vector_ids(&self) -> Vec<String> {
        self.concepts.iter().map(|c| c.vector_id.clone()).collect()
    }
}

fn concept_row(path_id: Uuid, item: &ConceptItem, sort_index: i32, now: DateTime<Utc>) -> Concept {
    let id = path_concept_id(path_id, &item.key);
    Concept {
        id,
        scope: ConceptScope::Path,
        scope_id: Some(path_id),
        parent_id: None,
        key: item.key.clone(),
        name: if item.name.trim().is_empty() {
            item.key.clone()
        } else {
            item.name.trim().to_string()
        },
        summary: item.summary.clone(),
        key_points: item.key_points.clone(),
        depth: item.depth,
        sort_index,
        vector_id: id.to_string(),
        metadata: ConceptMetadata {
            aliases: item.aliases.clone(),
            importance: item.importance,
            assumed: item.assumed,
            required_by: item.required_by.clone(),
            merged_from: item.merged_from.clone(),
            split_from: item.split_from.clone(),
            split_rationale: item.split_rationale.clone(),
        },
        canonical_concept_id: None,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    }
}

/// Vector records for path concepts in `concepts:path:<id>`.
pub fn concept_vector_records(path_id: Uuid, concepts: &[Concept], embeddings: &HashMap<String, Vec<f32>>) -> Vec<VectorRecord> {
    concepts
        .iter()
        .filter_map(|c| {
            let values = embeddings.get(&c.key)?;
            let mut metadata = Map::new();
            metadata.insert("type".into(), json!("concept"));
            metadata.insert("concept_key".into(), json!(c.key));
            metadata.insert("path_id".into(), json!(path_id.to_string()));
            Some(VectorRecord {
                id: c.vector_id.clone(),
                values: values.clone(),
                metadata,
            })
        })
        .collect()
}

/// Vector records for canonical concepts, one per global ID.
pub fn global_vector_records(
    concepts: &[Concept],
    canonical: &HashMap<Uuid, Concept>,
    embeddings: &HashMap<String, Vec<f32>>,
) -> Vec<VectorRecord> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for c in concepts {
        let (Some(global), Some(values)) = (canonical.get(&c.id), embeddings.get(&c.key)) else {
            continue;
        };
        if !seen.insert(global.id) {
            continue;
        }
        let mut metadata = Map::new();
        metadata.insert("type".into(), json!("concept"));
        metadata.insert("concept_key".into(), json!(global.key));
        out.push(VectorRecord {
            id: global.vector_id.clone(),
            values: values.clone(),
            metadata,
        });
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════
// Transactional write
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Whole-graph insert; any live concept for the path means another
    /// worker already built it.
    Fresh,
    /// Additive insert; keys that appeared meanwhile are skipped.
    Additive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    Inserted {
        concepts: usize,
        evidence: usize,
        edges: usize,
        saga_actions: usize,
    },
    /// A live graph was already present; nothing written.
    AlreadyExists,
    /// A soft-deleted graph was restored instead of reinserted.
    Restored(u64),
}

/// Write `rows` for `path_id`, recovering from a lost insert race.
pub async fn persist_graph(
    store: &dyn Store,
    path_id: Uuid,
    saga_id: Uuid,
    rows: &GraphRows,
    mode: WriteMode,
) -> Result<PersistOutcome> {
    let lock = advisory_key64(GRAPH_LOCK_NS, path_id);
    let err = match write_graph(store, lock, path_id, saga_id, rows, mode).await {
        Ok(outcome) => return Ok(outcome),
        Err(e) if is_unique_violation(&e) => e,
        Err(e) => return Err(e),
    };

    tracing::warn!(path_id = %path_id, error = %err, "concept insert lost a race; re-reading graph");
    let live = store.concepts_by_scope(ConceptScope::Path, Some(path_id)).await?;
    if !live.is_empty() || mode == WriteMode::Additive {
        return Ok(PersistOutcome::AlreadyExists);
    }

    let mut tx = store.begin().await?;
    tx.advisory_xact_lock(lock).await?;
    let restored = tx.restore_soft_deleted_graph(path_id).await?;
    if restored == 0 {
        tx.rollback().await?;
        return Err(err);
    }
    tx.commit().await?;
    tracing::info!(path_id = %path_id, restored, "restored soft-deleted concept graph");
    Ok(PersistOutcome::Restored(restored))
}

async fn write_graph(
    store: &dyn Store,
    lock: i64,
    path_id: Uuid,
    saga_id: Uuid,
    rows: &GraphRows,
    mode: WriteMode,
) -> Result<PersistOutcome> {
    let mut tx = store.begin().await?;
    tx.advisory_xact_lock(lock).await?;

    let live = tx.concepts_by_scope(ConceptScope::Path, Some(path_id)).await?;
    let filtered;
    let rows = match mode {
        WriteMode::Fresh if !live.is_empty() => {
            tx.rollback().await?;
            return Ok(PersistOutcome::AlreadyExists);
        }
        WriteMode::Fresh => rows,
        WriteMode::Additive => {
            let present: HashSet<Uuid> = live.iter().map(|c| c.id).collect();
            filtered = without_concepts(rows, &present);
            &filtered
        }
    };
    if rows.concepts.is_empty() && rows.edges.is_empty() {
        tx.rollback().await?;
        return Ok(PersistOutcome::AlreadyExists);
    }

    insert_rows(tx.as_mut(), rows).await?;
    let saga_actions =
        saga::append_pinecone_deletes(tx.as_mut(), saga_id, &concepts_path_ns(path_id), &rows.vector_ids()).await?;
    let evidence = tx.insert_evidence(&rows.evidence).await?;
    tx.commit().await?;

    Ok(PersistOutcome::Inserted {
        concepts: rows.concepts.len(),
        evidence,
        edges: rows.edges.len(),
        saga_actions,
    })
}

async fn insert_rows(tx: &mut dyn StoreTx, rows: &GraphRows) -> Result<()> {
    tx.insert_concepts(&rows.concepts).await?;
    for (child, parent) in &rows.parents {
        tx.set_concept_parent(*child, Some(*parent)).await?;
    }
    tx.upsert_edges(&rows.edges).await?;
    Ok(())
}

fn without_concepts(rows: &GraphRows, present: &HashSet<Uuid>) -> GraphRows {
    GraphRows {
        concepts: rows.concepts.iter().filter(|c| !present.contains(&c.id)).cloned().collect(),
        parents: rows.parents.iter().filter(|(c, _)| !present.contains(c)).copied().collect(),
        evidence: rows
            .evidence
            .iter()
            .filter(|e| !present.contains(&e.concept_id))
            .cloned()
            .collect(),
        edges: rows.edges.clone(),
    }
}

/// Rebuild inventory items from persisted concepts and their evidence.
pub async fn concept_items(store: &dyn Store, concepts: &[Concept]) -> Result<Vec<ConceptItem>> {
    let key_of: HashMap<Uuid, &str> = concepts.iter().map(|c| (c.id, c.key.as_str())).collect();
    let ids: Vec<Uuid> = concepts.iter().map(|c| c.id).collect();
    let mut citations: HashMap<Uuid, Vec<String>> = HashMap::new();
    for ev in store.evidence_for_concepts(&ids).await? {
        citations
            .entry(ev.concept_id)
            .or_default()
            .push(ev.material_chunk_id.to_string());
    }
    Ok(concepts
        .iter()
        .map(|c| ConceptItem {
            key: c.key.clone(),
            name: c.name.clone(),
            parent_key: c
                .parent_id
                .and_then(|p| key_of.get(&p))
                .map(|k| k.to_string())
                .unwrap_or_default(),
            summary: c.summary.clone(),
            key_points: c.key_points.clone(),
            aliases: c.metadata.aliases.clone(),
            importance: c.metadata.importance,
            citations: citations.remove(&c.id).unwrap_or_default(),
            depth: c.depth,
            assumed: c.metadata.assumed,
            required_by: c.metadata.required_by.clone(),
            merged_from: c.metadata.merged_from.clone(),
            split_from: c.metadata.split_from.clone(),
            split_rationale: c.metadata.split_rationale.clone(),
        })
        .collect())
}

/// Mirror the graph. Returns false when the mirror is absent or failed.
pub async fn mirror_graph(
    mirror: Option<&dyn GraphMirror>,
    path_id: Uuid,
    concepts: &[Concept],
    edges: &[ConceptEdge],
) -> bool {
    let Some(mirror) = mirror else {
        return false;
    };
    match mirror.upsert_path_concept_graph(path_id, concepts, edges).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(path_id = %path_id, error = %e, "graph mirror failed; continuing");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;

    fn item(key: &str, parent: &str, cites: &[Uuid]) -> ConceptItem {
        ConceptItem {
            key: key.into(),
            name: key.into(),
            parent_key: parent.into(),
            citations: cites.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    fn edge(from: &str, to: &str) -> EdgeItem {
        EdgeItem {
            from_key: from.into(),
            to_key: to.into(),
            edge_type: "prereq".into(),
            strength: 0.7,
            ..Default::default()
        }
    }

    #[test]
    fn ids_are_deterministic() {
        let path = Uuid::new_v4();
        let chunk = Uuid::new_v4();
        let items = vec![item("limits", "", &[chunk]), item("derivative", "limits", &[chunk])];
        let a = GraphRows::build(path, &items, &[edge("limits", "derivative")], &HashMap::new());
        let b = GraphRows::build(path, &items, &[edge("limits", "derivative")], &HashMap::new());
        assert_eq!(
            a.concepts.iter().map(|c| c.id).collect::<Vec<_>>(),
            b.concepts.iter().map(|c| c.id).collect::<Vec<_>>()
        );
        assert_eq!(a.edges[0].id, b.edges[0].id);
        assert_eq!(a.evidence[0].id, b.evidence[0].id);
        assert_eq!(a.parents, vec![(path_concept_id(path, "derivative"), path_concept_id(path, "limits"))]);
    }

    #[test]
    fn existing_keys_resolve_but_are_not_reinserted() {
        let path = Uuid::new_v4();
        let mut existing = HashMap::new();
        existing.insert("limits".to_string(), path_concept_id(path, "limits"));
        let rows = GraphRows::build(
            path,
            &[item("limits", "", &[]), item("series", "limits", &[])],
            &[edge("limits", "series"), edge("series", "unknown")],
            &existing,
        );
        assert_eq!(rows.concepts.len(), 1);
        assert_eq!(rows.concepts[0].key, "series");
        assert_eq!(rows.concepts[0].sort_index, 1);
        assert_eq!(rows.edges.len(), 1);
        assert_eq!(rows.parents.len(), 1);
    }

    #[tokio::test]
    async fn second_fresh_write_is_a_noop() {
        let store = InMemoryStore::new();
        let path = Uuid::new_v4();
        let rows = GraphRows::build(path, &[item("a", "", &[]), item("b", "a", &[])], &[edge("a", "b")], &HashMap::new());
        let first = persist_graph(&store, path, Uuid::new_v4(), &rows, WriteMode::Fresh).await.unwrap();
        assert!(matches!(first, PersistOutcome::Inserted { concepts: 2, edges: 1, saga_actions: 1, .. }));
        let second = persist_graph(&store, path, Uuid::new_v4(), &rows, WriteMode::Fresh).await.unwrap();
        assert_eq!(second, PersistOutcome::AlreadyExists);
        assert_eq!(store.lock_acquisitions(advisory_key64(GRAPH_LOCK_NS, path)), 2);
    }

    #[tokio::test]
    async fn soft_deleted_graph_is_restored() {
        let store = InMemoryStore::new();
        let path = Uuid::new_v4();
        let rows = GraphRows::build(path, &[item("a", "", &[]), item("b", "", &[])], &[], &HashMap::new());
        persist_graph(&store, path, Uuid::new_v4(), &rows, WriteMode::Fresh).await.unwrap();
        assert_eq!(store.soft_delete_path_graph(path).unwrap(), 2);

        let outcome = persist_graph(&store, path, Uuid::new_v4(), &rows, WriteMode::Fresh).await.unwrap();
        assert_eq!(outcome, PersistOutcome::Restored(2));
        let live = store.concepts_by_scope(ConceptScope::Path, Some(path)).await.unwrap();
        assert_eq!(live.len(), 2);
    }

    #[tokio::test]
    async fn race_lost_at_commit_becomes_noop() {
        let store = InMemoryStore::new();
        let path = Uuid::new_v4();
        let rows = GraphRows::build(path, &[item("a", "", &[])], &[], &HashMap::new());
        store.inject_concurrent_concepts(rows.concepts.clone()).unwrap();
        let outcome = persist_graph(&store, path, Uuid::new_v4(), &rows, WriteMode::Fresh).await.unwrap();
        assert_eq!(outcome, PersistOutcome::AlreadyExists);
    }
}
