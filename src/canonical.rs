//! Canonical concept linking.
//!
//! Every path-scoped concept is linked to one global concept, the
//! cross-path identity used for mastery transfer. Matching tries, in order:
//! a semantic hit in the global concepts namespace, an exact key or alias
//! match among global rows, and finally creation of a new global concept.
//! Linking runs in its own transaction under the `concept_canonicalize`
//! advisory lock so it never blocks graph builds.
//!
//! That lock is per path, so two paths may create the same global concept
//! at once. The loser sees a unique violation; linking then reruns in a
//! fresh transaction and finds the winner's row by key.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use pathweaver_core::adaptive::ContentType;
use pathweaver_core::keys::{advisory_key64, normalize_concept_key, stable_id};
use pathweaver_core::models::{Concept, ConceptMetadata, ConceptScope};

use crate::env::env_f64;
use crate::error::is_unique_violation;
use crate::store::Store;
use crate::vectors::{VectorFilter, VectorStore, CONCEPTS_GLOBAL_NS};

pub const CANONICALIZE_LOCK_NS: &str = "concept_canonicalize";
pub const SEMANTIC_MIN_SCORE_ENV: &str = "CANONICAL_CONCEPT_SEMANTIC_MIN_SCORE";
pub const DEFAULT_SEMANTIC_MIN_SCORE: f64 = 0.9;
const SEMANTIC_TOP_K: usize = 4;
const LINK_ATTEMPTS: usize = 3;

const GLOBAL_CONCEPT_NS: Uuid = Uuid::from_u128(0x3b8e_51d2_77a0_4f19_b6c4_0e9d_2f71_c002);

/// Minimum cosine for a semantic canonical match, shifted by content type.
pub fn semantic_min_score(content_type: ContentType) -> f64 {
    content_type.adjust(env_f64(SEMANTIC_MIN_SCORE_ENV, DEFAULT_SEMANTIC_MIN_SCORE))
}

/// Deterministic ID of the global concept for a normalized key.
pub fn global_concept_id(key: &str) -> Uuid {
    stable_id(GLOBAL_CONCEPT_NS, &["global", key])
}

/// Propose a global concept for each `(key, embedding)` whose best match
/// in the global namespace scores at least `min_score`. Equal scores are
/// broken by the lexically smaller ID so repeated runs agree.
pub async fn semantic_matches(
    vectors: Option<&dyn VectorStore>,
    items: &[(String, Vec<f32>)],
    min_score: f64,
) -> HashMap<String, Uuid> {
    let mut out = HashMap::new();
    let Some(vectors) = vectors else {
        return out;
    };
    let filter = VectorFilter::of_type("concept");
    for (key, embedding) in items {
        if embedding.is_empty() {
            continue;
        }
        let matches = match vectors
            .query_matches(CONCEPTS_GLOBAL_NS, embedding, SEMANTIC_TOP_K, &filter)
            .await
        {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "semantic canonical query failed; falling back to key match");
                return HashMap::new();
            }
        };
        let best = matches
            .iter()
            .filter(|m| m.score as f64 >= min_score)
            .filter_map(|m| Uuid::parse_str(&m.id).ok().map(|id| (id, m.score)))
            .min_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.0.to_string().cmp(&b.0.to_string()))
            });
        if let Some((id, _)) = best {
            out.insert(key.clone(), id);
        }
    }
    out
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CanonicalReport {
    pub linked_semantic: usize,
    pub linked_key: usize,
    pub created: usize,
}

/// Link `concepts` (path-scoped, already committed) to global concepts.
/// Returns the report and each path concept's canonical global row.
pub async fn canonicalize_path_concepts(
    store: &dyn Store,
    path_id: Uuid,
    concepts: &[Concept],
    semantic: &HashMap<String, Uuid>,
) -> Result<(CanonicalReport, HashMap<Uuid, Concept>)> {
    let mut attempt = 1;
    loop {
        match link_once(store, path_id, concepts, semantic).await {
            Err(e) if is_unique_violation(&e) && attempt < LINK_ATTEMPTS => {
                tracing::info!(path_id = %path_id, attempt, error = %e, "global concept created concurrently; relinking");
                attempt += 1;
            }
            other => return other,
        }
    }
}

async fn link_once(
    store: &dyn Store,
    path_id: Uuid,
    concepts: &[Concept],
    semantic: &HashMap<String, Uuid>,
) -> Result<(CanonicalReport, HashMap<Uuid, Concept>)> {
    let mut report = CanonicalReport::default();
    let mut linked = HashMap::new();
    if concepts.is_empty() {
        return Ok((report, linked));
    }

    // Semantic proposals must still point at live global rows.
    let proposed: Vec<Uuid> = semantic.values().copied().collect::<HashSet<_>>().into_iter().collect();
    let live: HashMap<Uuid, Concept> = store
        .concepts_by_ids(&proposed)
        .await?
        .into_iter()
        .filter(|c| c.scope == ConceptScope::Global && c.deleted_at.is_none())
        .map(|c| (c.id, c))
        .collect();

    let mut tx = store.begin().await?;
    tx.advisory_xact_lock(advisory_key64(CANONICALIZE_LOCK_NS, path_id)).await?;

    let mut lookup_keys: Vec<String> = Vec::new();
    for c in concepts {
        lookup_keys.push(c.key.clone());
        lookup_keys.extend(c.metadata.aliases.iter().map(|a| normalize_concept_key(a)));
    }
    lookup_keys.sort();
    lookup_keys.dedup();
    let mut by_key: HashMap<String, Concept> = HashMap::new();
    let mut found = tx.find_global_concepts(&lookup_keys).await?;
    found.sort_by(|a, b| a.id.cmp(&b.id));
    for g in found {
        for alias in &g.metadata.aliases {
            by_key.entry(normalize_concept_key(alias)).or_insert_with(|| g.clone());
        }
        by_key.insert(g.key.clone(), g);
    }

    let mut ordered: Vec<&Concept> = concepts.iter().collect();
    ordered.sort_by(|a, b| a.key.cmp(&b.key));
    for c in ordered {
        let global = if let Some(g) = semantic.get(&c.key).and_then(|id| live.get(id)) {
            report.linked_semantic += 1;
            g.clone()
        } else if let Some(g) = std::iter::once(&c.key)
            .chain(c.metadata.aliases.iter())
            .find_map(|k| by_key.get(&normalize_concept_key(k)))
        {
            report.linked_key += 1;
            g.clone()
        } else {
            let stored = tx
                .insert_global_concept_if_absent(&new_global_concept(c))
                .await
                .with_context(|| format!("create global concept {}", c.key))?;
            report.created += 1;
            by_key.insert(stored.key.clone(), stored.clone());
            stored
        };
        tx.set_canonical_concept(c.id, global.id).await?;
        linked.insert(c.id, global);
    }
    tx.commit().await?;
    tracing::info!(path_id = %path_id, ?report, "canonical concepts linked");
    Ok((report, linked))
}

fn new_global_concept(c: &Concept) -> Concept {
    let now = Utc::now();
    let id = global_concept_id(&c.key);
    Concept {
        id,
        scope: ConceptScope::Global,
        scope_id: None,
        parent_id: None,
        key: c.key.clone(),
        name: c.name.clone(),
        summary: c.summary.clone(),
        key_points: c.key_points.clone(),
        depth: 0,
        sort_index: 0,
        vector_id: id.to_string(),
        metadata: ConceptMetadata {
            aliases: c.metadata.aliases.clone(),
            importance: c.metadata.importance,
            ..Default::default()
        },
        canonical_concept_id: None,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use crate::vectors::{MemoryVectorStore, VectorRecord};
    use serde_json::{json, Map};

    fn path_concept(path_id: Uuid, key: &str, aliases: &[&str]) -> Concept {
        let mut c = new_global_concept(&Concept {
            id: Uuid::nil(),
            scope: ConceptScope::Path,
            scope_id: None,
            parent_id: None,
            key: key.into(),
            name: key.into(),
            summary: String::new(),
            key_points: Vec::new(),
            depth: 0,
            sort_index: 0,
            vector_id: String::new(),
            metadata: ConceptMetadata {
                aliases: aliases.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
            canonical_concept_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        });
        c.id = Uuid::new_v4();
        c.scope = ConceptScope::Path;
        c.scope_id = Some(path_id);
        c
    }

    #[tokio::test]
    async fn links_by_alias_then_creates_missing() {
        let store = InMemoryStore::new();
        let path_id = Uuid::new_v4();
        let existing = new_global_concept(&path_concept(path_id, "bayes_theorem", &[]));
        let mut tx = store.begin().await.unwrap();
        tx.insert_global_concept_if_absent(&existing).await.unwrap();
        let a = path_concept(path_id, "bayes_rule", &["bayes_theorem"]);
        let b = path_concept(path_id, "entropy", &[]);
        tx.insert_concepts(&[a.clone(), b.clone()]).await.unwrap();
        tx.commit().await.unwrap();

        let (report, linked) = canonicalize_path_concepts(&store, path_id, &[a.clone(), b.clone()], &HashMap::new())
            .await
            .unwrap();
        assert_eq!(report.linked_key, 1);
        assert_eq!(report.created, 1);
        assert_eq!(linked[&a.id].id, existing.id);
        assert_eq!(linked[&b.id].id, global_concept_id("entropy"));
        assert_eq!(store.lock_acquisitions(advisory_key64(CANONICALIZE_LOCK_NS, path_id)), 1);

        // Rerun is stable and creates nothing.
        let (again, _) = canonicalize_path_concepts(&store, path_id, &[a, b], &HashMap::new())
            .await
            .unwrap();
        assert_eq!(again.created, 0);
        assert_eq!(again.linked_key, 2);
    }

    async fn commit_path_concepts(store: &InMemoryStore, concepts: &[Concept]) {
        let mut tx = store.begin().await.unwrap();
        tx.insert_concepts(concepts).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn global_created_by_another_worker_is_linked_not_duplicated() {
        let store = InMemoryStore::new();
        let path_id = Uuid::new_v4();
        let c = path_concept(path_id, "entropy", &[]);
        commit_path_concepts(&store, &[c.clone()]).await;
        store.inject_concurrent_concepts(vec![new_global_concept(&c)]).unwrap();

        let (report, linked) = canonicalize_path_concepts(&store, path_id, &[c.clone()], &HashMap::new())
            .await
            .unwrap();
        assert_eq!(report.created, 0);
        assert_eq!(report.linked_key, 1);
        assert_eq!(linked[&c.id].id, global_concept_id("entropy"));
        assert_eq!(store.lock_acquisitions(advisory_key64(CANONICALIZE_LOCK_NS, path_id)), 2);
        let stored = store.concepts_by_ids(&[c.id]).await.unwrap();
        assert_eq!(stored[0].canonical_concept_id, Some(global_concept_id("entropy")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn paths_adding_the_same_key_share_one_global() {
        let store = InMemoryStore::new();
        for round in 0..10 {
            let key = format!("shared_key_{}", round);
            let mut handles = Vec::new();
            for _ in 0..2 {
                let path_id = Uuid::new_v4();
                let c = path_concept(path_id, &key, &[]);
                commit_path_concepts(&store, &[c.clone()]).await;
                let store = store.clone();
                handles.push(tokio::spawn(async move {
                    let (_, linked) = canonicalize_path_concepts(&store, path_id, &[c.clone()], &HashMap::new())
                        .await
                        .unwrap();
                    linked[&c.id].id
                }));
            }
            let mut ids = Vec::new();
            for h in handles {
                ids.push(h.await.unwrap());
            }
            assert_eq!(ids, vec![global_concept_id(&key); 2]);
            let globals: Vec<Concept> = store
                .concepts_by_scope(ConceptScope::Global, None)
                .await
                .unwrap()
                .into_iter()
                .filter(|g| g.key == key)
                .collect();
            assert_eq!(globals.len(), 1);
        }
    }

    #[tokio::test]
    async fn semantic_ties_break_by_id() {
        let vectors = MemoryVectorStore::new();
        let (lo, hi) = (Uuid::from_u128(1), Uuid::from_u128(2));
        let mut meta = Map::new();
        meta.insert("type".into(), json!("concept"));
        let records: Vec<VectorRecord> = [hi, lo]
            .iter()
            .map(|id| VectorRecord {
                id: id.to_string(),
                values: vec![1.0, 0.0],
                metadata: meta.clone(),
            })
            .collect();
        vectors.upsert(CONCEPTS_GLOBAL_NS, &records).await.unwrap();

        let items = vec![("k".to_string(), vec![1.0, 0.0]), ("far".to_string(), vec![0.0, 1.0])];
        let matches = semantic_matches(Some(&vectors), &items, 0.9).await;
        assert_eq!(matches.get("k"), Some(&lo));
        assert!(!matches.contains_key("far"));
    }
}
