//! Graph-assisted chunk selection.
//!
//! Combines three candidate channels and then widens them through the
//! concept graph:
//!
//! 1. **Dense**: top-`seed_k` from the chunk vector namespace, filtered to
//!    `type=chunk` and the allowed files.
//! 2. **Lexical**: top-`lexical_k` full-text hits over chunk text.
//! 3. **Local cosine**: brute force over in-memory chunk embeddings, used
//!    when the first two come back empty (or short, when asked to fill).
//!
//! Seeds are then expanded through concept evidence: chunks cited by the
//! same concepts as the seeds join the candidate set with a lower score.
//! Every failure in this module is logged and swallowed; retrieval
//! degrades to fewer candidates, never to an error.

use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use uuid::Uuid;

use pathweaver_core::adaptive::RetrievalParams;
use pathweaver_core::embedding::top_k_by_cosine;
use pathweaver_core::keys::dedupe_uuids;

use crate::store::Store;
use crate::vectors::{chunks_ns, VectorFilter, VectorStore};

/// Weight of a graph-expanded chunk relative to the top seed.
const EXPANSION_WEIGHT: f64 = 0.5;

pub struct RetrievalRequest<'a> {
    pub material_set_id: Uuid,
    pub query_text: &'a str,
    pub query_embedding: &'a [f32],
    /// Files searched by the dense and lexical channels.
    pub file_ids: &'a [Uuid],
    /// Chunks the output may contain; `None` admits any chunk.
    pub allowed_chunks: Option<&'a HashSet<Uuid>>,
    /// Local `(chunk_id, embedding)` pairs for the cosine fallback.
    pub local: &'a [(Uuid, &'a [f32])],
    /// Top up with local cosine whenever seeds fall short of `final_k`.
    pub fill_to_final_k: bool,
    pub params: &'a RetrievalParams,
}

#[derive(Debug, Clone, Default)]
pub struct Retrieved {
    pub chunk_ids: Vec<Uuid>,
    /// Per-channel timings and counts.
    pub trace: Map<String, Value>,
}

pub async fn select_chunk_ids(
    store: &dyn Store,
    vectors: Option<&dyn VectorStore>,
    req: &RetrievalRequest<'_>,
) -> Retrieved {
    let mut trace = Map::new();
    let admit = |id: &Uuid| req.allowed_chunks.map(|a| a.contains(id)).unwrap_or(true);

    let (dense, lexical) = tokio::join!(dense_channel(vectors, req), lexical_channel(store, req));
    trace.insert("dense_ms".into(), json!(dense.1));
    trace.insert("dense_count".into(), json!(dense.0.len()));
    trace.insert("lexical_ms".into(), json!(lexical.1));
    trace.insert("lexical_count".into(), json!(lexical.0.len()));

    let mut seeds: Vec<Uuid> = dedupe_uuids(dense.0.into_iter().chain(lexical.0))
        .into_iter()
        .filter(|id| admit(id))
        .collect();

    let final_k = req.params.final_k.max(1);
    let wants_local = seeds.is_empty() || (req.fill_to_final_k && seeds.len() < final_k);
    if wants_local && !req.local.is_empty() && !req.query_embedding.is_empty() {
        let candidates: Vec<(Uuid, &[f32])> = req.local.iter().filter(|(id, _)| admit(id)).copied().collect();
        let before = seeds.len();
        for (id, _) in top_k_by_cosine(req.query_embedding, &candidates, final_k) {
            if seeds.len() >= final_k.max(before) {
                break;
            }
            if !seeds.contains(&id) {
                seeds.push(id);
            }
        }
        trace.insert("local_count".into(), json!(seeds.len() - before));
    }

    let started = Instant::now();
    let scores = match expand_through_graph(store, &seeds, req).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "graph expansion failed; using seeds only");
            HashMap::new()
        }
    };
    trace.insert("expand_ms".into(), json!(started.elapsed().as_millis() as u64));
    trace.insert("expanded_count".into(), json!(scores.len()));

    let chunk_ids = if scores.is_empty() {
        seeds.into_iter().take(final_k).collect()
    } else {
        rank(scores, final_k)
    };
    trace.insert("final_count".into(), json!(chunk_ids.len()));
    Retrieved { chunk_ids, trace }
}

async fn dense_channel(vectors: Option<&dyn VectorStore>, req: &RetrievalRequest<'_>) -> (Vec<Uuid>, u64) {
    let Some(vectors) = vectors else {
        return (Vec::new(), 0);
    };
    if req.query_embedding.is_empty() || req.params.seed_k == 0 {
        return (Vec::new(), 0);
    }
    let started = Instant::now();
    let filter = VectorFilter::of_type("chunk").with_in("file_id", req.file_ids.iter().map(Uuid::to_string).collect());
    let ids = match vectors
        .query_ids(&chunks_ns(req.material_set_id), req.query_embedding, req.params.seed_k, &filter)
        .await
    {
        Ok(ids) => ids.iter().filter_map(|s| Uuid::parse_str(s).ok()).collect(),
        Err(e) => {
            tracing::warn!(error = %e, "dense retrieval failed");
            Vec::new()
        }
    };
    (ids, started.elapsed().as_millis() as u64)
}

async fn lexical_channel(store: &dyn Store, req: &RetrievalRequest<'_>) -> (Vec<Uuid>, u64) {
    if req.query_text.trim().is_empty() || req.params.lexical_k == 0 || req.file_ids.is_empty() {
        return (Vec::new(), 0);
    }
    let started = Instant::now();
    let ids = match store
        .lexical_search_chunks(req.file_ids, req.query_text, req.params.lexical_k)
        .await
    {
        Ok(ids) => ids,
        Err(e) => {
            tracing::warn!(error = %e, "lexical retrieval failed");
            Vec::new()
        }
    };
    (ids, started.elapsed().as_millis() as u64)
}

// ============ Graph expansion ============

/// Score seeds by rank, then add chunks that share concepts with them.
/// Every seed keeps a score, so expansion only ever adds candidates.
async fn expand_through_graph(
    store: &dyn Store,
    seeds: &[Uuid],
    req: &RetrievalRequest<'_>,
) -> anyhow::Result<HashMap<Uuid, f64>> {
    let mut scores: HashMap<Uuid, f64> = HashMap::new();
    for (i, id) in seeds.iter().enumerate() {
        scores.insert(*id, 1.0 / (1.0 + i as f64));
    }
    let p = req.params;
    let graph_seeds: Vec<Uuid> = seeds.iter().take(p.seed_k.max(1)).copied().collect();
    if graph_seeds.is_empty() || p.max_concepts == 0 {
        return Ok(scores);
    }

    let mut concept_weight: HashMap<Uuid, f64> = HashMap::new();
    for ev in store.evidence_for_chunks(&graph_seeds).await? {
        let seed_score = scores.get(&ev.material_chunk_id).copied().unwrap_or(0.0);
        *concept_weight.entry(ev.concept_id).or_insert(0.0) += seed_score * ev.weight.max(0.0);
    }
    let mut concepts: Vec<(Uuid, f64)> = concept_weight.into_iter().collect();
    concepts.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0)));
    concepts.truncate(p.max_concepts);
    if concepts.is_empty() {
        return Ok(scores);
    }
    let top = concepts[0].1.max(f64::EPSILON);
    let weights: HashMap<Uuid, f64> = concepts.iter().map(|(id, w)| (*id, w / top)).collect();
    let ids: Vec<Uuid> = concepts.iter().map(|(id, _)| *id).collect();

    let mut by_concept: HashMap<Uuid, Vec<(Uuid, f64)>> = HashMap::new();
    for ev in store.evidence_for_concepts(&ids).await? {
        by_concept
            .entry(ev.concept_id)
            .or_default()
            .push((ev.material_chunk_id, ev.weight.max(0.0)));
    }

    let mut added = 0usize;
    'concepts: for id in &ids {
        let Some(mut chunks) = by_concept.remove(id) else {
            continue;
        };
        chunks.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0)));
        let w = weights.get(id).copied().unwrap_or(0.0);
        for (chunk_id, ev_weight) in chunks.into_iter().take(p.max_evidence_per_concept) {
            if let Some(allowed) = req.allowed_chunks {
                if !allowed.contains(&chunk_id) {
                    continue;
                }
            }
            let is_new = !scores.contains_key(&chunk_id);
            if is_new && added >= p.max_out {
                break 'concepts;
            }
            *scores.entry(chunk_id).or_insert(0.0) += EXPANSION_WEIGHT * w * ev_weight.min(1.0);
            if is_new {
                added += 1;
            }
        }
    }
    Ok(scores)
}

fn rank(scores: HashMap<Uuid, f64>, k: usize) -> Vec<Uuid> {
    let mut ranked: Vec<(Uuid, f64)> = scores.into_iter().collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0)));
    ranked.into_iter().take(k).map(|(id, _)| id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use crate::vectors::{MemoryVectorStore, VectorRecord};
    use chrono::Utc;
    use pathweaver_core::models::{ChunkMetadata, ConceptEvidence, MaterialChunk};

    fn chunk(file: Uuid, index: i32, text: &str) -> MaterialChunk {
        MaterialChunk {
            id: Uuid::new_v4(),
            material_file_id: file,
            index,
            page: None,
            text: text.to_string(),
            embedding: Vec::new(),
            metadata: ChunkMetadata::default(),
            updated_at: Utc::now(),
        }
    }

    fn params(final_k: usize) -> RetrievalParams {
        RetrievalParams {
            final_k,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn dense_seeds_come_before_lexical() {
        let store = InMemoryStore::new();
        let vectors = MemoryVectorStore::new();
        let (set, file) = (Uuid::new_v4(), Uuid::new_v4());
        let a = chunk(file, 0, "gradient descent converges");
        let b = chunk(file, 1, "bayes rule and priors");
        for c in [&a, &b] {
            store.insert_chunk(c.clone()).unwrap();
        }
        let mut meta = Map::new();
        meta.insert("type".into(), json!("chunk"));
        meta.insert("file_id".into(), json!(file.to_string()));
        vectors
            .upsert(
                &chunks_ns(set),
                &[VectorRecord {
                    id: a.id.to_string(),
                    values: vec![1.0, 0.0],
                    metadata: meta,
                }],
            )
            .await
            .unwrap();

        let p = params(12);
        let files = [file];
        let out = select_chunk_ids(
            &store,
            Some(&vectors),
            &RetrievalRequest {
                material_set_id: set,
                query_text: "bayes priors",
                query_embedding: &[1.0, 0.0],
                file_ids: &files,
                allowed_chunks: None,
                local: &[],
                fill_to_final_k: false,
                params: &p,
            },
        )
        .await;
        assert_eq!(out.chunk_ids, vec![a.id, b.id]);
        assert_eq!(out.trace["dense_count"], json!(1));
        assert_eq!(out.trace["lexical_count"], json!(1));
    }

    #[tokio::test]
    async fn falls_back_to_local_cosine_when_channels_fail() {
        let store = InMemoryStore::new();
        let vectors = MemoryVectorStore::new();
        vectors.set_failing(true);
        let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
        let ex = [1.0f32, 0.0];
        let ey = [0.0f32, 1.0];
        let local = [(x, &ex[..]), (y, &ey[..])];
        let p = params(1);
        let out = select_chunk_ids(
            &store,
            Some(&vectors),
            &RetrievalRequest {
                material_set_id: Uuid::new_v4(),
                query_text: "",
                query_embedding: &[0.1, 0.9],
                file_ids: &[],
                allowed_chunks: None,
                local: &local,
                fill_to_final_k: false,
                params: &p,
            },
        )
        .await;
        assert_eq!(out.chunk_ids, vec![y]);
        assert_eq!(out.trace["local_count"], json!(1));
    }

    #[tokio::test]
    async fn graph_expansion_adds_related_chunks_and_keeps_seeds() {
        let store = InMemoryStore::new();
        let file = Uuid::new_v4();
        let seed = chunk(file, 0, "entropy measures uncertainty");
        let related = chunk(file, 1, "unrelated wording here");
        let blocked = chunk(file, 2, "more unrelated wording");
        for c in [&seed, &related, &blocked] {
            store.insert_chunk(c.clone()).unwrap();
        }
        let concept = Uuid::new_v4();
        let ev = |chunk_id: Uuid| ConceptEvidence {
            id: Uuid::new_v4(),
            concept_id: concept,
            material_chunk_id: chunk_id,
            kind: "citation".into(),
            weight: 1.0,
            deleted_at: None,
        };
        let mut tx = store.begin().await.unwrap();
        tx.insert_evidence(&[ev(seed.id), ev(related.id), ev(blocked.id)]).await.unwrap();
        tx.commit().await.unwrap();

        let allowed: HashSet<Uuid> = [seed.id, related.id].into_iter().collect();
        let p = params(12);
        let files = [file];
        let out = select_chunk_ids(
            &store,
            None,
            &RetrievalRequest {
                material_set_id: Uuid::new_v4(),
                query_text: "entropy uncertainty",
                query_embedding: &[],
                file_ids: &files,
                allowed_chunks: Some(&allowed),
                local: &[],
                fill_to_final_k: false,
                params: &p,
            },
        )
        .await;
        assert_eq!(out.chunk_ids, vec![seed.id, related.id]);
    }
}
