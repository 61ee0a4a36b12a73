//! `concept_graph_build`: citation-grounded concept graph for a path.
//!
//! # Pipeline
//!
//! ```text
//! formulas ─┐
//!           ├─► per-file inventory ─► global fallback ─► coverage
//! sections ─┘                                              │
//!     ┌────────────────────────────────────────────────────┘
//!     ▼
//! assumed ∥ alignment ─► edges ─► embeddings ─► persist ─► canonicalize
//!                                                  │
//!                                vectors, mirror, artifact, trace
//! ```
//!
//! Everything up to `persist` is read-only model work. The graph is
//! written in one transaction; vectors and the mirror follow as caches.
//!
//! A run that committed the graph but stopped before its artifact row was
//! written (or with concepts still unlinked) is resumed on the next run:
//! concepts are embedded again from their persisted rows, linked, upserted,
//! mirrored and recorded. Model work before `persist` is not repeated.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use uuid::Uuid;

use pathweaver_core::adaptive::{coverage_params, inventory_params, AdaptiveMeta, CorpusSignals, InventoryParams};
use pathweaver_core::artifact::ArtifactInputs;
use pathweaver_core::edges::{normalize_concept_edges, prereq_edges_from_required_by, EdgeItem};
use pathweaver_core::excerpts::{group_by_file, stratified_excerpts, ExcerptLimits};
use pathweaver_core::formulas::{apply_formulas, formula_tasks};
use pathweaver_core::inventory::{
    apply_alignment, apply_assumed_knowledge, dedupe_topics, known_keys, merge_inventories,
    normalize_concept_inventory, summarize_for_prompt, ConceptItem, CoverageReport,
};
use pathweaver_core::models::{
    Concept, ConceptScope, MaterialChunk, MaterialFile, MaterialFileSignature, Path, StructuralDecisionTrace,
};
use pathweaver_core::path_meta::PathMeta;
use pathweaver_core::seeds::{inventory_is_weak, seeded_result_disagrees, SeedSet, SeedThresholds};

use super::graph_persist::{
    concept_items, concept_vector_records, global_vector_records, mirror_graph, persist_graph, GraphRows,
    PersistOutcome, WriteMode,
};
use super::{
    load_material, resolve_path, upsert_vectors_best_effort, Material, Stage, StageContext, StageDeps, StageInput,
    StageName, StageSettings,
};
use crate::artifact_cache::{self, ArtifactCache, CONCEPT_GRAPH};
use crate::canonical::{canonicalize_path_concepts, semantic_matches, semantic_min_score, CanonicalReport};
use crate::coverage::{CoverageEngine, CoverageInput, CONTEXT_RETRY_FLOOR};
use crate::error::{is_context_length, StageError};
use crate::llm::{embed_logged, generate_logged, LlmClient, Prompt};
use crate::prompts::{
    alignment_prompt, assumed_knowledge_prompt, decode_alignment, decode_assumed, decode_edges, decode_formulas,
    decode_inventory, edges_prompt, formula_prompt, inventory_prompt, InventoryRequest,
};
use crate::section_graph::build_section_graph;
use crate::store::{ArtifactKey, Store};
use crate::vectors::{concepts_path_ns, VectorStore, CONCEPTS_GLOBAL_NS};

const STAGE: StageName = StageName::ConceptGraphBuild;

pub const GRAPH_VERSION: &str = "concept_graph@3";
pub const EMBEDDING_VERSION: &str = "concept_doc_embed@1";
pub const TAXONOMY_VERSION: &str = "edge_types@1";
pub const CLUSTERING_VERSION: &str = "section_graph@1";
pub const CALIBRATION_VERSION: &str = "coverage_conf@1";

const FORMULA_BATCH: usize = 16;
const SUMMARY_CHARS: usize = 160;

pub struct ConceptGraphBuild;

// ═══════════════════════════════════════════════════════════════════════
// Shared inputs
// ═══════════════════════════════════════════════════════════════════════

/// Everything the graph stages read before doing model work.
pub(super) struct GraphInputs {
    pub path: Path,
    pub meta: PathMeta,
    pub material: Material,
    pub signatures: Vec<MaterialFileSignature>,
}

impl GraphInputs {
    pub async fn load(store: &dyn Store, stage: StageName, input: &StageInput) -> Result<Self> {
        let path = resolve_path(store, input).await?;
        let meta = PathMeta::from_value(&path.metadata);
        let material = load_material(store, stage, input.material_set_id, &meta.allowed_file_ids()).await?;
        let signatures = store.list_file_signatures(&material.file_ids()).await?;
        Ok(Self {
            path,
            meta,
            material,
            signatures,
        })
    }

    pub fn artifact_inputs(&self, stage: StageName) -> ArtifactInputs {
        ArtifactInputs::new(&self.material.files, &self.material.chunks, &self.signatures)
            .allow_files(&self.material.allow_files)
            .intent(&self.meta.intake_md)
            .mode(stage.as_str())
    }

    /// Chunk IDs the model may cite.
    pub fn allowed_chunks(&self) -> HashSet<Uuid> {
        self.material
            .chunks
            .iter()
            .filter(|c| c.is_usable_text())
            .map(|c| c.id)
            .collect()
    }
}

fn inventory_limits(p: &InventoryParams) -> ExcerptLimits {
    ExcerptLimits {
        per_file: p.per_file.actual,
        max_chars: p.max_chars.actual,
        max_lines_per_file: p.max_lines_per_file.actual,
        max_total: p.max_total.actual,
    }
}

pub(super) fn edge_limits(p: &InventoryParams) -> ExcerptLimits {
    ExcerptLimits {
        per_file: p.edge_per_file.actual,
        max_chars: p.max_chars.actual,
        max_lines_per_file: p.max_lines_per_file.actual,
        max_total: p.edge_max_total.actual,
    }
}

/// Run a prompt built from excerpt `limits`; on a context-length error,
/// rebuild it once with the budget halved.
async fn generate_with_shrink<F>(llm: &dyn LlmClient, stage: StageName, op: &str, limits: ExcerptLimits, build: F) -> Result<Value>
where
    F: Fn(&ExcerptLimits) -> Prompt,
{
    match generate_logged(llm, stage.as_str(), op, &build(&limits)).await {
        Err(e) if is_context_length(&e) => {
            let smaller = limits.halved(CONTEXT_RETRY_FLOOR);
            tracing::warn!(stage = stage.as_str(), op, max_total = smaller.max_total, "context length exceeded; retrying smaller");
            generate_logged(llm, stage.as_str(), op, &build(&smaller)).await
        }
        other => other,
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Formulas
// ═══════════════════════════════════════════════════════════════════════

/// Extract formulas for chunks with candidate expressions and write them
/// back into chunk metadata. Best-effort; returns chunks updated.
async fn enrich_formulas(store: &dyn Store, llm: &dyn LlmClient, chunks: &[MaterialChunk]) -> usize {
    let tasks = formula_tasks(chunks);
    if tasks.is_empty() {
        return 0;
    }
    let by_id: HashMap<Uuid, &MaterialChunk> = chunks.iter().map(|c| (c.id, c)).collect();
    let mut updated = 0;
    for batch in tasks.chunks(FORMULA_BATCH) {
        let value = match generate_logged(llm, STAGE.as_str(), "formulas", &formula_prompt(batch)).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "formula extraction failed; continuing without formulas");
                continue;
            }
        };
        let (results, dropped) = decode_formulas(&value);
        if dropped > 0 {
            tracing::debug!(dropped, "malformed formula results dropped");
        }
        for result in results {
            let Some(chunk) = Uuid::parse_str(result.chunk_id.trim()).ok().and_then(|id| by_id.get(&id)) else {
                continue;
            };
            let mut meta = chunk.metadata.clone();
            if !apply_formulas(&mut meta, &result) {
                continue;
            }
            match store.update_chunk_metadata(chunk.id, &meta).await {
                Ok(()) => updated += 1,
                Err(e) => tracing::warn!(chunk_id = %chunk.id, error = %e, "formula metadata write failed"),
            }
        }
    }
    updated
}

// ═══════════════════════════════════════════════════════════════════════
// Inventory
// ═══════════════════════════════════════════════════════════════════════

struct FileInventory {
    concepts: Vec<ConceptItem>,
    coverage: CoverageReport,
    shown: Vec<Uuid>,
    reran_unseeded: bool,
}

async fn run_inventory(
    llm: &dyn LlmClient,
    op: &str,
    req: &InventoryRequest<'_>,
    allowed: &HashSet<Uuid>,
) -> Result<(Vec<ConceptItem>, CoverageReport)> {
    let value = generate_logged(llm, STAGE.as_str(), op, &inventory_prompt(req)).await?;
    let (inv, dropped) = decode_inventory(&value);
    if dropped > 0 {
        tracing::debug!(op, dropped, "malformed concepts dropped");
    }
    let (concepts, _) = normalize_concept_inventory(inv.concepts, Some(allowed));
    Ok((concepts, inv.coverage.normalized()))
}

#[allow(clippy::too_many_arguments)]
async fn file_inventory(
    llm: &dyn LlmClient,
    intent: &str,
    charter: &str,
    file: &MaterialFile,
    chunks: &[MaterialChunk],
    limits: ExcerptLimits,
    seeds: &[String],
    allowed: &HashSet<Uuid>,
) -> Result<FileInventory> {
    let excerpts = stratified_excerpts(chunks, &limits);
    let mut req = InventoryRequest {
        intent_md: intent,
        charter,
        excerpts: &excerpts.text,
        seed_keys: seeds,
        section_graph: None,
        file_name: Some(&file.original_name),
    };
    let (mut concepts, mut coverage) = run_inventory(llm, "inventory_file", &req, allowed).await?;
    let mut reran_unseeded = false;
    if !seeds.is_empty() && (concepts.is_empty() || seeded_result_disagrees(&known_keys(&concepts), seeds)) {
        tracing::info!(file_id = %file.id, concepts = concepts.len(), "seeded inventory disagreed; rerunning unseeded");
        req.seed_keys = &[];
        (concepts, coverage) = run_inventory(llm, "inventory_file_unseeded", &req, allowed).await?;
        reran_unseeded = true;
    }
    Ok(FileInventory {
        concepts,
        coverage,
        shown: excerpts.chunk_ids,
        reran_unseeded,
    })
}

/// Union of per-file inventories plus the aggregate facts the fallback
/// decision needs.
#[derive(Default)]
struct InventoryUnion {
    concepts: Vec<ConceptItem>,
    coverage: CoverageReport,
    shown: Vec<Uuid>,
    attempted: usize,
    succeeded: usize,
    reruns: usize,
}

impl InventoryUnion {
    fn success_ratio(&self) -> f64 {
        if self.attempted == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.attempted as f64
    }

    fn absorb(&mut self, inv: FileInventory, allowed: &HashSet<Uuid>) {
        if !inv.concepts.is_empty() {
            self.succeeded += 1;
        }
        if inv.reran_unseeded {
            self.reruns += 1;
        }
        let (merged, _) = merge_inventories(&self.concepts, &inv.concepts, Some(allowed));
        self.concepts = merged;
        // Confidence averages over successful files.
        if self.succeeded > 0 && !inv.concepts.is_empty() {
            let n = self.succeeded as f64;
            self.coverage.confidence += (inv.coverage.confidence - self.coverage.confidence) / n;
        }
        let mut topics = std::mem::take(&mut self.coverage.missing_topics);
        topics.extend(inv.coverage.missing_topics);
        self.coverage.missing_topics = dedupe_topics(&topics);
        self.shown.extend(inv.shown);
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Shared graph helpers (also used by the patch stage)
// ═══════════════════════════════════════════════════════════════════════

/// Edges for `items`: model-proposed edges over the edge excerpts plus
/// prerequisite edges implied by `required_by`, normalized.
pub(super) async fn generate_edges(
    llm: &dyn LlmClient,
    stage: StageName,
    items: &[ConceptItem],
    chunks: &[MaterialChunk],
    limits: ExcerptLimits,
    allowed: &HashSet<Uuid>,
) -> Result<Vec<EdgeItem>> {
    let summary = summarize_for_prompt(items, SUMMARY_CHARS);
    let value = generate_with_shrink(llm, stage, "edges", limits, |l| {
        edges_prompt(&summary, &stratified_excerpts(chunks, l).text)
    })
    .await?;
    let (mut edges, dropped) = decode_edges(&value);
    if dropped > 0 {
        tracing::debug!(stage = stage.as_str(), dropped, "malformed edges dropped");
    }
    edges.extend(prereq_edges_from_required_by(items));
    let keys: HashSet<String> = items.iter().map(|i| i.key.clone()).collect();
    let (edges, report) = normalize_concept_edges(edges, &keys, Some(allowed));
    tracing::info!(stage = stage.as_str(), edges = edges.len(), ?report, "edges normalized");
    Ok(edges)
}

/// Embed each concept's document. Fails on any empty vector or count mismatch.
pub(super) async fn embed_concepts(
    llm: &dyn LlmClient,
    stage: StageName,
    items: &[ConceptItem],
    batch_size: usize,
    concurrency: usize,
) -> Result<HashMap<String, Vec<f32>>> {
    let jobs: Vec<_> = items
        .chunks(batch_size.max(1))
        .map(|batch| {
            let keys: Vec<String> = batch.iter().map(|i| i.key.clone()).collect();
            let docs: Vec<String> = batch.iter().map(|i| i.embedding_doc()).collect();
            async move {
                let vectors = embed_logged(llm, stage.as_str(), "concepts", &docs).await?;
                Ok::<_, anyhow::Error>(keys.into_iter().zip(vectors).collect::<Vec<_>>())
            }
        })
        .collect();
    let embedded: Vec<Vec<(String, Vec<f32>)>> = stream::iter(jobs)
        .buffered(concurrency.max(1))
        .try_collect()
        .await?;
    Ok(embedded.into_iter().flatten().collect())
}

/// `(key, embedding)` pairs for the semantic canonical lookup.
pub(super) fn semantic_inputs(items: &[ConceptItem], embeddings: &HashMap<String, Vec<f32>>) -> Vec<(String, Vec<f32>)> {
    items
        .iter()
        .filter_map(|i| embeddings.get(&i.key).map(|e| (i.key.clone(), e.clone())))
        .collect()
}

/// Canonicalize, then upsert path and global vectors. Returns the
/// canonical report and whether any vector upsert was skipped.
#[allow(clippy::too_many_arguments)]
pub(super) async fn link_and_upsert(
    store: &dyn Store,
    vectors: Option<&dyn VectorStore>,
    stage: StageName,
    path_id: Uuid,
    concepts: &[Concept],
    embeddings: &HashMap<String, Vec<f32>>,
    semantic: &HashMap<String, Uuid>,
    concurrency: usize,
) -> Result<(CanonicalReport, bool)> {
    let (report, canonical) = canonicalize_path_concepts(store, path_id, concepts, semantic).await?;
    let path_records = concept_vector_records(path_id, concepts, embeddings);
    let global_records = global_vector_records(concepts, &canonical, embeddings);
    let path_skipped =
        upsert_vectors_best_effort(vectors, stage, &concepts_path_ns(path_id), path_records, concurrency).await;
    let global_skipped =
        upsert_vectors_best_effort(vectors, stage, CONCEPTS_GLOBAL_NS, global_records, concurrency).await;
    Ok((report, path_skipped || global_skipped))
}

/// Embed already-persisted `concepts` from their rows and link them.
#[allow(clippy::too_many_arguments)]
pub(super) async fn relink_concepts(
    store: &dyn Store,
    llm: &dyn LlmClient,
    vectors: Option<&dyn VectorStore>,
    stage: StageName,
    path_id: Uuid,
    concepts: &[Concept],
    settings: &StageSettings,
    min_score: f64,
) -> Result<(CanonicalReport, bool)> {
    let items = concept_items(store, concepts).await?;
    let embeddings = embed_concepts(llm, stage, &items, settings.embed_batch_size, settings.embed_concurrency).await?;
    let semantic = semantic_matches(vectors, &semantic_inputs(&items, &embeddings), min_score).await;
    link_and_upsert(
        store,
        vectors,
        stage,
        path_id,
        concepts,
        &embeddings,
        &semantic,
        settings.embed_concurrency,
    )
    .await
}

async fn record_trace(store: &dyn Store, input: &StageInput, path_id: Uuid, inputs: Value) {
    let trace = StructuralDecisionTrace {
        id: Uuid::new_v4(),
        occurred_at: Utc::now(),
        owner_user_id: input.owner_user_id,
        path_id,
        decision_type: STAGE.as_str().to_string(),
        graph_version: GRAPH_VERSION.to_string(),
        embedding_version: EMBEDDING_VERSION.to_string(),
        taxonomy_version: TAXONOMY_VERSION.to_string(),
        clustering_version: CLUSTERING_VERSION.to_string(),
        calibration_version: CALIBRATION_VERSION.to_string(),
        inputs,
    };
    if let Err(e) = store.record_decision_trace(&trace).await {
        tracing::warn!(error = %e, "decision trace write failed");
    }
}

// ── resume ──

/// Finish a graph whose persist committed in an earlier run.
async fn resume_graph(
    deps: &StageDeps,
    input: &StageInput,
    inputs: &GraphInputs,
    live: &[Concept],
    cache: &ArtifactCache<'_>,
    key: ArtifactKey<'_>,
    input_hash: &str,
) -> Result<Value> {
    let store = deps.store(STAGE)?;
    let llm = deps.llm(STAGE)?;
    let vectors = deps.vectors();
    let path_id = inputs.path.id;
    let signals = CorpusSignals::from_material(&inputs.material.files, &inputs.material.chunks, 0);
    let (canonical_report, pinecone_skipped) = relink_concepts(
        store,
        llm,
        vectors,
        STAGE,
        path_id,
        live,
        &deps.settings,
        semantic_min_score(signals.content_type),
    )
    .await?;
    let ids: Vec<Uuid> = live.iter().map(|c| c.id).collect();
    let edges = store.edges_for_concepts(&ids).await?;
    let mirrored = mirror_graph(deps.mirror.as_deref(), path_id, live, &edges).await;
    record_trace(
        store,
        input,
        path_id,
        json!({ "input_hash": input_hash, "concepts": live.len(), "edges": edges.len(), "resumed": true }),
    )
    .await;
    cache
        .record(key, input_hash, json!({ "concepts": live.len(), "edges": edges.len() }))
        .await;
    tracing::info!(path_id = %path_id, concepts = live.len(), ?canonical_report, "concept graph resumed");
    Ok(json!({
        "path_id": path_id,
        "cached": false,
        "resumed": true,
        "concepts": live.len(),
        "edges": edges.len(),
        "canonical": canonical_report,
        "pinecone_skipped": pinecone_skipped,
        "mirrored": mirrored,
    }))
}

// ═══════════════════════════════════════════════════════════════════════
// Stage
// ═══════════════════════════════════════════════════════════════════════

#[async_trait]
impl Stage for ConceptGraphBuild {
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

        let mut inputs = GraphInputs::load(store, STAGE, input).await?;
        let path_id = inputs.path.id;
        if !inputs.meta.paths_confirmed() {
            tracing::info!(path_id = %path_id, "path not confirmed; skipping concept graph");
            return Ok(json!({ "path_id": path_id, "skipped": true, "reason": "paths_not_confirmed" }));
        }

        let cache = ArtifactCache::new(store, &settings.cache);
        let key = artifact_cache::key(input.owner_user_id, input.material_set_id, path_id, CONCEPT_GRAPH);
        let input_hash = cache.input_hash(inputs.artifact_inputs(STAGE));
        if cache.lookup(key, &input_hash).await.is_some() {
            return Ok(json!({ "path_id": path_id, "cached": true, "concepts": 0, "edges": 0 }));
        }
        let live = store.concepts_by_scope(ConceptScope::Path, Some(path_id)).await?;
        if !live.is_empty() {
            let unlinked = live.iter().filter(|c| c.canonical_concept_id.is_none()).count();
            let unrecorded = cache.enabled() && !cache.exists(key).await;
            if unlinked == 0 && !unrecorded {
                tracing::info!(path_id = %path_id, "concept graph already exists");
                return Ok(json!({ "path_id": path_id, "skipped": true, "reason": "graph_exists", "concepts": 0, "edges": 0 }));
            }
            tracing::info!(path_id = %path_id, unlinked, unrecorded, "concept graph persisted but unfinished; resuming");
            return resume_graph(deps, input, &inputs, &live, &cache, key, &input_hash).await;
        }
        progress.update(5, "extracting formulas and sections");

        // ── formulas ∥ section graph ──
        let (formulas_updated, section_graph) = tokio::join!(
            enrich_formulas(store, llm, &inputs.material.chunks),
            build_section_graph(
                &inputs.material.chunks,
                Some(llm),
                STAGE.as_str(),
                settings.section_threshold,
                settings.section_top_k,
            )
        );
        let section_graph = match section_graph {
            Ok(g) => g,
            Err(e) => {
                tracing::warn!(error = %e, "section graph failed; continuing without it");
                Default::default()
            }
        };
        let mut record_hash = input_hash.clone();
        if formulas_updated > 0 {
            inputs.material.chunks = store.list_chunks_for_files(&inputs.material.file_ids()).await?;
            record_hash = cache.input_hash(inputs.artifact_inputs(STAGE));
        }
        ctx.check_cancelled(STAGE)?;

        let material = &inputs.material;
        let intent = inputs.meta.intake_md.as_str();
        let charter = inputs.meta.charter_text();
        let allowed = inputs.allowed_chunks();
        let signals = CorpusSignals::from_material(&material.files, &material.chunks, 0);
        let inv_params = inventory_params(&signals, &settings.inventory);
        let cov_params = coverage_params(&signals, &settings.coverage);
        let mut adaptive = AdaptiveMeta::new(STAGE.as_str(), &signals);
        inv_params.record(&mut adaptive);
        cov_params.record(&mut adaptive);
        let limits = inventory_limits(&inv_params);

        // ── seeds ──
        let seeds = SeedSet::from_signatures(&inputs.signatures);
        let seed_thresholds = SeedThresholds {
            min_quality: signals.content_type.adjust(settings.seeds.min_quality),
            ..settings.seeds.clone()
        };
        let seeds_usable = seeds.is_usable(&seed_thresholds);
        let seed_keys: BTreeSet<String> = if seeds_usable { seeds.all_keys() } else { BTreeSet::new() };
        tracing::info!(
            path_id = %path_id,
            files = material.files.len(),
            chunks = material.chunks.len(),
            seeds_usable,
            seed_keys = seed_keys.len(),
            formulas_updated,
            sections = section_graph.sections.len(),
            "concept graph inputs ready"
        );

        // ── per-file inventory ──
        progress.update(15, "inventorying files");
        let grouped = group_by_file(&material.chunks);
        let files: Vec<(&MaterialFile, Vec<MaterialChunk>)> = material
            .files
            .iter()
            .filter_map(|f| grouped.get(&f.id).map(|list| (f, list.iter().map(|c| (*c).clone()).collect())))
            .collect();
        // Files without usable text still count as attempted.
        let mut union = InventoryUnion {
            attempted: material.files.len(),
            ..Default::default()
        };
        let total_files = files.len() as u64;
        let jobs: Vec<_> = files
            .into_iter()
            .enumerate()
            .map(|(i, (file, chunks))| {
                let file_seeds: &[String] = if seeds_usable { seeds.for_file(file.id) } else { &[] };
                let (allowed, charter, progress) = (&allowed, charter.as_str(), &progress);
                async move {
                    if ctx.cancel.is_cancelled() {
                        return None;
                    }
                    let out = match file_inventory(llm, intent, charter, file, &chunks, limits, file_seeds, allowed).await {
                        Ok(inv) => Some(inv),
                        Err(e) => {
                            tracing::warn!(file_id = %file.id, error = %e, "file inventory failed");
                            None
                        }
                    };
                    progress.update_range(i as u64 + 1, total_files, 15, 30, "inventorying files");
                    out
                }
            })
            .collect();
        let results: Vec<Option<FileInventory>> = stream::iter(jobs)
            .buffered(inv_params.concurrency.actual.max(1))
            .collect()
            .await;
        ctx.check_cancelled(STAGE)?;
        for inv in results.into_iter().flatten() {
            union.absorb(inv, &allowed);
        }

        // ── global fallback ──
        let weak = inventory_is_weak(&known_keys(&union.concepts), &seed_keys, union.coverage.confidence, &settings.weakness);
        let low_success = union.success_ratio() < settings.per_file_min_success;
        let ran_global = weak || low_success;
        if ran_global {
            tracing::info!(
                path_id = %path_id,
                weak,
                success_ratio = union.success_ratio(),
                concepts = union.concepts.len(),
                "running global inventory pass"
            );
            progress.update(30, "global inventory pass");
            let graph_json = (!section_graph.is_empty()).then(|| section_graph.to_json());
            let seed_list: Vec<String> = seed_keys.iter().cloned().collect();
            let value = generate_with_shrink(llm, STAGE, "inventory_global", limits, |l| {
                inventory_prompt(&InventoryRequest {
                    intent_md: intent,
                    charter: &charter,
                    excerpts: &stratified_excerpts(&material.chunks, l).text,
                    seed_keys: &seed_list,
                    section_graph: graph_json.as_ref(),
                    file_name: None,
                })
            })
            .await?;
            let (inv, _) = decode_inventory(&value);
            let global_coverage = inv.coverage.normalized();
            let (merged, _) = merge_inventories(&union.concepts, &inv.concepts, Some(&allowed));
            union.concepts = merged;
            if union.succeeded == 0 {
                union.coverage = global_coverage;
            } else {
                union.coverage.confidence = union.coverage.confidence.max(global_coverage.confidence);
                let mut topics = std::mem::take(&mut union.coverage.missing_topics);
                topics.extend(global_coverage.missing_topics);
                union.coverage.missing_topics = dedupe_topics(&topics);
            }
            union.shown.extend(stratified_excerpts(&material.chunks, &limits).chunk_ids);
        }
        if union.concepts.is_empty() {
            return Err(StageError::Validation {
                stage: STAGE.as_str(),
                detail: "concept inventory is empty".to_string(),
            }
            .into());
        }

        // ── coverage completion ──
        let missing_seeds: Vec<String> = seed_keys
            .iter()
            .filter(|k| !union.concepts.iter().any(|c| &c.key == *k))
            .map(|k| k.replace('_', " "))
            .collect();
        let mut engine = CoverageEngine::new(STAGE.as_str(), llm, vectors, input.material_set_id, &ctx.cancel, &progress)
            .with_progress_range(35, 60);
        let outcome = engine
            .run(CoverageInput {
                intent_md: intent,
                chunks: &material.chunks,
                allowed_chunks: &allowed,
                seen_chunk_ids: &union.shown,
                concepts: std::mem::take(&mut union.concepts),
                coverage: union.coverage.clone(),
                seed_topics: &missing_seeds,
                signals: &signals,
                params: &cov_params,
            })
            .await?;
        ctx.check_cancelled(STAGE)?;

        // ── assumed knowledge ∥ alignment ──
        progress.update(60, "assumed knowledge and alignment");
        let summary = summarize_for_prompt(&outcome.concepts, SUMMARY_CHARS);
        let assumed_req = assumed_knowledge_prompt(intent, &summary);
        let alignment_req = alignment_prompt(&summary);
        let (assumed, alignment) = tokio::join!(
            generate_logged(llm, STAGE.as_str(), "assumed_knowledge", &assumed_req),
            generate_logged(llm, STAGE.as_str(), "alignment", &alignment_req),
        );
        let mut items = outcome.concepts.clone();
        let mut assumed_added = 0;
        match assumed {
            Ok(v) => {
                let (assumed_items, _) = decode_assumed(&v);
                (items, assumed_added) = apply_assumed_knowledge(items, &assumed_items);
            }
            Err(e) => tracing::warn!(error = %e, "assumed-knowledge pass failed; continuing"),
        }
        let mut alignment_report = Default::default();
        match alignment {
            Ok(v) => (items, alignment_report) = apply_alignment(items, &decode_alignment(&v)),
            Err(e) => tracing::warn!(error = %e, "alignment pass failed; continuing"),
        }
        let (items, normalize_report) = normalize_concept_inventory(items, Some(&allowed));
        tracing::info!(
            path_id = %path_id,
            concepts = items.len(),
            assumed_added,
            ?alignment_report,
            ?normalize_report,
            "inventory final"
        );

        // ── edges ──
        progress.update(70, "synthesizing edges");
        let edges = generate_edges(llm, STAGE, &items, &material.chunks, edge_limits(&inv_params), &allowed).await?;
        ctx.check_cancelled(STAGE)?;

        // ── embeddings ──
        progress.update(78, "embedding concepts");
        let embeddings = embed_concepts(
            llm,
            STAGE,
            &items,
            settings.embed_batch_size,
            settings.embed_concurrency,
        )
        .await?;
        let semantic = semantic_matches(
            vectors,
            &semantic_inputs(&items, &embeddings),
            semantic_min_score(signals.content_type),
        )
        .await;

        // ── persist ──
        progress.update(88, "persisting graph");
        let rows = GraphRows::build(path_id, &items, &edges, &HashMap::new());
        let outcome_write = persist_graph(store, path_id, input.saga_id, &rows, WriteMode::Fresh).await?;
        let (evidence_count, saga_actions) = match outcome_write {
            PersistOutcome::Inserted {
                evidence, saga_actions, ..
            } => (evidence, saga_actions),
            PersistOutcome::AlreadyExists => {
                tracing::info!(path_id = %path_id, "another worker built the graph; no-op");
                return Ok(json!({ "path_id": path_id, "skipped": true, "concepts": 0, "edges": 0 }));
            }
            PersistOutcome::Restored(restored) => {
                let live = store.concepts_by_scope(ConceptScope::Path, Some(path_id)).await?;
                let ids: Vec<Uuid> = live.iter().map(|c| c.id).collect();
                let live_edges = store.edges_for_concepts(&ids).await?;
                mirror_graph(deps.mirror.as_deref(), path_id, &live, &live_edges).await;
                return Ok(json!({
                    "path_id": path_id,
                    "restored": restored,
                    "concepts": 0,
                    "edges": 0,
                }));
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
        let mirrored = mirror_graph(deps.mirror.as_deref(), path_id, &rows.concepts, &rows.edges).await;

        record_trace(
            store,
            input,
            path_id,
            json!({
                "input_hash": record_hash,
                "concepts": rows.concepts.len(),
                "edges": rows.edges.len(),
                "coverage_rounds": outcome.rounds,
                "coverage_confidence": outcome.coverage.confidence,
                "global_pass": ran_global,
                "seeds_usable": seeds_usable,
            }),
        )
        .await;

        let output = json!({
            "path_id": path_id,
            "cached": false,
            "concepts": rows.concepts.len(),
            "edges": rows.edges.len(),
            "evidence": evidence_count,
            "saga_actions": saga_actions,
            "per_file_success": union.succeeded,
            "per_file_attempted": union.attempted,
            "unseeded_reruns": union.reruns,
            "global_pass": ran_global,
            "coverage": {
                "rounds": outcome.rounds,
                "added_per_round": outcome.added_per_round,
                "stalled": outcome.stalled,
                "swept": outcome.swept,
                "sweep_added": outcome.sweep_added,
                "confidence": outcome.coverage.confidence,
                "missing_topics": outcome.coverage.missing_topics.len(),
            },
            "assumed_added": assumed_added,
            "canonical": canonical_report,
            "formulas_updated": formulas_updated,
            "section_edges": section_graph.edges.len(),
            "pinecone_skipped": pinecone_skipped,
            "mirrored": mirrored,
            "adaptive": adaptive,
        });
        cache
            .record(
                key,
                &record_hash,
                json!({ "concepts": rows.concepts.len(), "edges": rows.edges.len() }),
            )
            .await;
        progress.update(100, "concept graph ready");
        Ok(output)
    }
}
