//! `concept_graph_patch`: extend an existing path graph.
//!
//! A single delta probe over a small excerpt decides whether the graph
//! already covers the material. When it does not, the coverage engine runs
//! with patch budgets and only the new concepts are embedded, persisted and
//! canonicalized. Edges are regenerated over the full concept set; edge
//! rows are upserts so existing ones are left as they are.
//!
//! Concepts an earlier run persisted but never linked are linked first.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

use pathweaver_core::adaptive::{coverage_params, inventory_params, AdaptiveMeta, CorpusSignals};
use pathweaver_core::excerpts::{stratified_excerpts, ExcerptLimits};
use pathweaver_core::inventory::{merge_inventories, normalize_concept_inventory, summarize_for_prompt, ConceptItem};
use pathweaver_core::models::{Concept, ConceptScope};

use super::concept_graph::{
    edge_limits, embed_concepts, generate_edges, link_and_upsert, relink_concepts, semantic_inputs, GraphInputs,
};
use super::graph_persist::{concept_items, mirror_graph, persist_graph, GraphRows, PersistOutcome, WriteMode};
use super::{Stage, StageContext, StageDeps, StageInput, StageName};
use crate::artifact_cache::{self, ArtifactCache, CONCEPT_GRAPH_PATCH};
use crate::canonical::{semantic_matches, semantic_min_score};
use crate::coverage::{CoverageEngine, CoverageInput};
use crate::llm::generate_logged;
use crate::prompts::{decode_delta, delta_prompt};

const STAGE: StageName = StageName::ConceptGraphPatch;

const PROBE_PER_FILE: usize = 4;
const PROBE_MAX_CHARS: usize = 600;
const PROBE_MAX_LINES: usize = 8;
const PROBE_MAX_TOTAL: usize = 12_000;
const SUMMARY_CHARS: usize = 120;

pub struct ConceptGraphPatch;

#[async_trait]
impl Stage for ConceptGraphPatch {
    fn name(&self) -> StageName {
        STAGE
    }

    async fn input_hash(&self, deps: &StageDeps, input: &StageInput) -> Result<String> {
        let store = deps.store(STAGE)?;
        let inputs = GraphInputs::load(store, STAGE, input).await?;
        Ok(ArtifactCache::new(store, &deps.settings.cache).input_hash(inputs.artifact_inputs(STAGE)))
    }

    async fn run(&self, ctx: &StageContext, deps: &StageDeps, input: &StageInput) -> Result<Value> {
        deps.require(STAGE, &["store", "llm"])?;
        let store = deps.store(STAGE)?;
        let llm = deps.llm(STAGE)?;
        let vectors = deps.vectors();
        let settings = &deps.settings;
        let progress = ctx.progress_for(STAGE);

        let inputs = GraphInputs::load(store, STAGE, input).await?;
        let path_id = inputs.path.id;
        if !inputs.meta.paths_confirmed() {
            return Ok(json!({ "path_id": path_id, "skipped": true, "reason": "paths_not_confirmed" }));
        }

        let cache = ArtifactCache::new(store, &settings.cache);
        let key = artifact_cache::key(input.owner_user_id, input.material_set_id, path_id, CONCEPT_GRAPH_PATCH);
        let input_hash = cache.input_hash(inputs.artifact_inputs(STAGE));
        if cache.lookup(key, &input_hash).await.is_some() {
            return Ok(json!({ "path_id": path_id, "cached": true, "concepts_added": 0, "edges": 0 }));
        }

        let live = store.concepts_by_scope(ConceptScope::Path, Some(path_id)).await?;
        if live.is_empty() {
            tracing::info!(path_id = %path_id, "no concept graph to patch");
            return Ok(json!({ "path_id": path_id, "skipped": true, "reason": "graph_missing", "concepts_added": 0 }));
        }
        let material = &inputs.material;
        let intent = inputs.meta.intake_md.as_str();
        let signals = CorpusSignals::from_material(&material.files, &material.chunks, live.len());
        let min_score = semantic_min_score(signals.content_type);

        // ── unlinked concepts from an earlier run ──
        let unlinked: Vec<Concept> = live.iter().filter(|c| c.canonical_concept_id.is_none()).cloned().collect();
        let relinked = if unlinked.is_empty() {
            None
        } else {
            tracing::info!(path_id = %path_id, unlinked = unlinked.len(), "linking concepts left unlinked");
            progress.update(5, "linking unlinked concepts");
            let (report, _) =
                relink_concepts(store, llm, vectors, STAGE, path_id, &unlinked, settings, min_score).await?;
            Some(report)
        };

        let existing_keys: HashMap<String, Uuid> = live.iter().map(|c| (c.key.clone(), c.id)).collect();
        let allowed = inputs.allowed_chunks();
        let existing = concept_items(store, &live).await?;
        let (existing, _) = normalize_concept_inventory(existing, None);
        let inv_params = inventory_params(&signals, &settings.inventory);
        let cov_params = coverage_params(&signals, &settings.patch_coverage);
        let mut adaptive = AdaptiveMeta::new(STAGE.as_str(), &signals);
        cov_params.record(&mut adaptive);

        // ── probe ──
        progress.update(10, "probing for missing concepts");
        let probe_excerpts = stratified_excerpts(
            &material.chunks,
            &ExcerptLimits {
                per_file: PROBE_PER_FILE,
                max_chars: PROBE_MAX_CHARS,
                max_lines_per_file: PROBE_MAX_LINES,
                max_total: PROBE_MAX_TOTAL,
            },
        );
        let summary = summarize_for_prompt(&existing, SUMMARY_CHARS);
        let value = generate_logged(
            llm,
            STAGE.as_str(),
            "probe",
            &delta_prompt(intent, &summary, &probe_excerpts.text, &[]),
        )
        .await?;
        let (proposed, probe_coverage, _) = decode_delta(&value);
        let (proposed, _) = normalize_concept_inventory(proposed, Some(&allowed));
        let probe_new: Vec<ConceptItem> = proposed
            .into_iter()
            .filter(|i| !existing_keys.contains_key(&i.key))
            .collect();
        let skip_conf = signals.content_type.adjust(settings.patch_skip_min_conf);
        if probe_new.is_empty()
            && probe_coverage.confidence >= skip_conf
            && probe_coverage.missing_topics.len() <= settings.patch_skip_max_missing
        {
            tracing::info!(
                path_id = %path_id,
                confidence = probe_coverage.confidence,
                missing = probe_coverage.missing_topics.len(),
                "graph already covers the material; patch skipped"
            );
            cache.record(key, &input_hash, json!({ "concepts_added": 0, "skipped": true })).await;
            return Ok(json!({
                "path_id": path_id,
                "skipped": true,
                "reason": "coverage_sufficient",
                "confidence": probe_coverage.confidence,
                "concepts_added": 0,
                "relinked": relinked,
                "adaptive": adaptive,
            }));
        }
        ctx.check_cancelled(STAGE)?;

        // ── coverage ──
        let (seeded, _) = merge_inventories(&existing, &probe_new, Some(&allowed));
        let mut engine = CoverageEngine::new(STAGE.as_str(), llm, vectors, input.material_set_id, &ctx.cancel, &progress)
            .with_progress_range(15, 55);
        let outcome = engine
            .run(CoverageInput {
                intent_md: intent,
                chunks: &material.chunks,
                allowed_chunks: &allowed,
                seen_chunk_ids: &probe_excerpts.chunk_ids,
                concepts: seeded,
                coverage: probe_coverage,
                seed_topics: &[],
                signals: &signals,
                params: &cov_params,
            })
            .await?;
        ctx.check_cancelled(STAGE)?;

        let new_items: Vec<ConceptItem> = outcome
            .concepts
            .iter()
            .filter(|i| !existing_keys.contains_key(&i.key))
            .cloned()
            .collect();

        // ── edges over the full set ──
        progress.update(60, "synthesizing edges");
        let edges = generate_edges(
            llm,
            STAGE,
            &outcome.concepts,
            &material.chunks,
            edge_limits(&inv_params),
            &allowed,
        )
        .await?;

        // ── embed new concepts only ──
        progress.update(75, "embedding new concepts");
        let embeddings = embed_concepts(llm, STAGE, &new_items, settings.embed_batch_size, settings.embed_concurrency).await?;
        let semantic = semantic_matches(vectors, &semantic_inputs(&new_items, &embeddings), min_score).await;

        // ── persist ──
        progress.update(85, "persisting new concepts");
        let rows = GraphRows::build(path_id, &outcome.concepts, &edges, &existing_keys);
        let (added, evidence, edge_count, saga_actions) =
            match persist_graph(store, path_id, input.saga_id, &rows, WriteMode::Additive).await? {
                PersistOutcome::Inserted {
                    concepts,
                    evidence,
                    edges,
                    saga_actions,
                } => (concepts, evidence, edges, saga_actions),
                PersistOutcome::AlreadyExists | PersistOutcome::Restored(_) => {
                    tracing::info!(path_id = %path_id, "patch raced another writer; no-op");
                    return Ok(json!({ "path_id": path_id, "skipped": true, "concepts_added": 0, "edges": 0 }));
                }
            };

        let (canonical_report, pinecone_skipped) = link_and_upsert(
            store,
            vectors,
            STAGE,
            path_id,
            &rows.concepts,
            &embeddings,
            &semantic,
            settings.embed_concurrency,
        )
        .await?;

        let all = store.concepts_by_scope(ConceptScope::Path, Some(path_id)).await?;
        let ids: Vec<Uuid> = all.iter().map(|c| c.id).collect();
        let all_edges = store.edges_for_concepts(&ids).await?;
        let mirrored = mirror_graph(deps.mirror.as_deref(), path_id, &all, &all_edges).await;

        cache
            .record(key, &input_hash, json!({ "concepts_added": added, "edges": edge_count }))
            .await;
        progress.update(100, "concept graph patched");
        Ok(json!({
            "path_id": path_id,
            "cached": false,
            "concepts_added": added,
            "evidence": evidence,
            "edges": edge_count,
            "saga_actions": saga_actions,
            "coverage_rounds": outcome.rounds,
            "coverage_confidence": outcome.coverage.confidence,
            "canonical": canonical_report,
            "relinked": relinked,
            "pinecone_skipped": pinecone_skipped,
            "mirrored": mirrored,
            "adaptive": adaptive,
        }))
    }
}
