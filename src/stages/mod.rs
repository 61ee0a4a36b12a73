//! Stage orchestration.
//!
//! A stage is one step of the learning-path DAG
//! (`embed_chunks → concept_graph_build → concept_graph_patch`, and
//! `realize_activities` once an external planner has written path nodes).
//! Every stage implements [`Stage`] and follows the same contract:
//!
//! 1. Validate its dependencies and fail fast with
//!    [`StageError::MissingDeps`] naming the stage.
//! 2. Resolve the canonical path through [`Store::ensure_path`].
//! 3. Fingerprint its inputs and return early on an artifact cache hit.
//! 4. Do LLM, embedding and retrieval work outside any transaction.
//! 5. Write canonical rows and saga actions in one transaction guarded by
//!    an advisory lock on `(stage, path)`.
//! 6. Treat vector and graph-mirror writes as caches: after commit,
//!    logged and swallowed on failure.
//! 7. Record the artifact row on success.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                   StageRegistry                      │
//! │ embed_chunks │ concept_graph_build │ concept_graph_  │
//! │              │                     │ patch │ realize │
//! └──────────────┬───────────────────────────────────────┘
//!                ▼
//!    StageDeps { store, llm, vectors, mirror, objects }
//! ```

pub mod concept_graph;
pub mod concept_graph_patch;
pub mod embed_chunks;
pub mod graph_persist;
pub mod realize_activities;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use pathweaver_core::adaptive::{CoverageCeilings, InventoryCeilings, RealizeCeilings, RetrievalParams};
use pathweaver_core::models::{MaterialChunk, MaterialFile, Path};
use pathweaver_core::seeds::{SeedThresholds, WeaknessThresholds};

use crate::artifact_cache::CacheSettings;
use crate::config::Config;
use crate::env::{env_f64, env_usize};
use crate::error::StageError;
use crate::llm::LlmClient;
use crate::mirror::GraphMirror;
use crate::object_store::ObjectStore;
use crate::progress::{ProgressSink, StageProgress};
use crate::store::Store;
use crate::vectors::pinecone::UPSERT_BATCH;
use crate::vectors::{VectorRecord, VectorStore};

// ═══════════════════════════════════════════════════════════════════════
// Names, inputs, context
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageName {
    EmbedChunks,
    ConceptGraphBuild,
    ConceptGraphPatch,
    RealizeActivities,
}

impl StageName {
    pub const ALL: [StageName; 4] = [
        StageName::EmbedChunks,
        StageName::ConceptGraphBuild,
        StageName::ConceptGraphPatch,
        StageName::RealizeActivities,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::EmbedChunks => "embed_chunks",
            StageName::ConceptGraphBuild => "concept_graph_build",
            StageName::ConceptGraphPatch => "concept_graph_patch",
            StageName::RealizeActivities => "realize_activities",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|n| n.as_str() == s)
    }
}

/// Input every stage receives from the job queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StageInput {
    pub owner_user_id: Uuid,
    pub material_set_id: Uuid,
    pub saga_id: Uuid,
    #[serde(default)]
    pub path_id: Option<Uuid>,
}

/// Per-run context: cancellation and an optional progress sink.
#[derive(Clone, Default)]
pub struct StageContext {
    pub cancel: CancellationToken,
    pub progress: Option<Arc<dyn ProgressSink>>,
}

impl StageContext {
    pub fn progress_for(&self, stage: StageName) -> StageProgress {
        StageProgress::new(stage.as_str(), self.progress.clone())
    }

    pub fn check_cancelled(&self, stage: StageName) -> Result<()> {
        if self.cancel.is_cancelled() {
            anyhow::bail!("{}: cancelled", stage.as_str());
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Settings
// ═══════════════════════════════════════════════════════════════════════

/// Tunables shared by the stages. Adaptive parameters treat most of these
/// as ceilings; [`StageSettings::from_env`] reads overrides.
#[derive(Debug, Clone)]
pub struct StageSettings {
    pub cache: CacheSettings,
    pub inventory: InventoryCeilings,
    pub coverage: CoverageCeilings,
    pub patch_coverage: CoverageCeilings,
    pub realize: RealizeCeilings,
    pub retrieval: RetrievalParams,
    pub seeds: SeedThresholds,
    pub weakness: WeaknessThresholds,
    /// Per-file inventory success ratio below which a global pass runs.
    pub per_file_min_success: f64,
    pub embed_batch_size: usize,
    pub embed_concurrency: usize,
    pub section_threshold: f32,
    pub section_top_k: usize,
    pub patch_skip_min_conf: f64,
    pub patch_skip_max_missing: usize,
    pub realize_max_attempts: usize,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            cache: CacheSettings::default(),
            inventory: InventoryCeilings::default(),
            coverage: CoverageCeilings::default(),
            patch_coverage: CoverageCeilings {
                passes: 2,
                max_missing_topics: 6,
                extra_max_total: 30_000,
                ..CoverageCeilings::default()
            },
            realize: RealizeCeilings::default(),
            retrieval: RetrievalParams::default(),
            seeds: SeedThresholds::default(),
            weakness: WeaknessThresholds::default(),
            per_file_min_success: 0.6,
            embed_batch_size: 64,
            embed_concurrency: 4,
            section_threshold: crate::section_graph::DEFAULT_THRESHOLD,
            section_top_k: crate::section_graph::DEFAULT_TOP_K,
            patch_skip_min_conf: 0.8,
            patch_skip_max_missing: 2,
            realize_max_attempts: 3,
        }
    }
}

impl StageSettings {
    pub fn from_env(cache: CacheSettings) -> Self {
        let d = Self::default();
        let inv = &d.inventory;
        let cov = &d.coverage;
        let pcov = &d.patch_coverage;
        let rl = &d.realize;
        let rt = &d.retrieval;
        Self {
            cache,
            inventory: InventoryCeilings {
                excerpt_per_file: env_usize("CONCEPT_GRAPH_EXCERPT_PER_FILE", inv.excerpt_per_file),
                excerpt_max_chars: env_usize("CONCEPT_GRAPH_EXCERPT_MAX_CHARS", inv.excerpt_max_chars),
                excerpt_max_total: env_usize("CONCEPT_GRAPH_EXCERPT_MAX_TOTAL_CHARS", inv.excerpt_max_total),
                edge_max_total: env_usize("CONCEPT_GRAPH_EDGE_MAX_TOTAL_CHARS", inv.edge_max_total),
                concurrency: env_usize("CONCEPT_GRAPH_FILE_CONCURRENCY", inv.concurrency),
            },
            coverage: CoverageCeilings {
                passes: env_usize("COVERAGE_PASSES", cov.passes),
                max_concepts: env_usize("COVERAGE_MAX_CONCEPTS", cov.max_concepts),
                extra_per_file: env_usize("COVERAGE_EXTRA_PER_FILE", cov.extra_per_file),
                extra_max_chars: env_usize("COVERAGE_EXTRA_MAX_CHARS", cov.extra_max_chars),
                extra_max_lines: env_usize("COVERAGE_EXTRA_MAX_LINES", cov.extra_max_lines),
                extra_max_total: env_usize("COVERAGE_EXTRA_MAX_TOTAL_CHARS", cov.extra_max_total),
                max_missing_topics: env_usize("COVERAGE_MAX_MISSING_TOPICS", cov.max_missing_topics),
                topic_top_k: env_usize("COVERAGE_TOPIC_TOP_K", cov.topic_top_k),
                concurrency: env_usize("COVERAGE_CONCURRENCY", cov.concurrency),
            },
            patch_coverage: CoverageCeilings {
                passes: env_usize("CONCEPT_GRAPH_PATCH_PASSES", pcov.passes),
                max_missing_topics: env_usize("CONCEPT_GRAPH_PATCH_MAX_MISSING_TOPICS", pcov.max_missing_topics),
                extra_max_total: env_usize("CONCEPT_GRAPH_PATCH_EXTRA_MAX_TOTAL_CHARS", pcov.extra_max_total),
                ..pcov.clone()
            },
            realize: RealizeCeilings {
                concurrency: env_usize("REALIZE_CONCURRENCY", rl.concurrency),
                excerpt_max_chars: env_usize("REALIZE_EXCERPT_MAX_CHARS", rl.excerpt_max_chars),
                excerpt_max_total: env_usize("REALIZE_EXCERPT_MAX_TOTAL_CHARS", rl.excerpt_max_total),
            },
            retrieval: RetrievalParams {
                seed_k: env_usize("RETRIEVAL_SEED_K", rt.seed_k),
                lexical_k: env_usize("RETRIEVAL_LEXICAL_K", rt.lexical_k),
                final_k: env_usize("RETRIEVAL_FINAL_K", rt.final_k),
                max_concepts: env_usize("RETRIEVAL_MAX_CONCEPTS", rt.max_concepts),
                max_evidence_per_concept: env_usize("RETRIEVAL_MAX_EVIDENCE_PER_CONCEPT", rt.max_evidence_per_concept),
                max_out: env_usize("RETRIEVAL_MAX_OUT", rt.max_out),
            },
            seeds: SeedThresholds {
                min_files: env_usize("CONCEPT_GRAPH_SEED_MIN_FILES", d.seeds.min_files),
                min_keys: env_usize("CONCEPT_GRAPH_SEED_MIN_KEYS", d.seeds.min_keys),
                min_quality: env_f64("CONCEPT_GRAPH_SEED_MIN_QUALITY", d.seeds.min_quality),
            },
            weakness: WeaknessThresholds {
                min_concepts: env_usize("CONCEPT_GRAPH_MIN_CONCEPTS", d.weakness.min_concepts),
                min_coverage_conf: env_f64("CONCEPT_GRAPH_MIN_COVERAGE_CONF", d.weakness.min_coverage_conf),
            },
            per_file_min_success: env_f64("CONCEPT_GRAPH_PER_FILE_MIN_SUCCESS", d.per_file_min_success),
            embed_batch_size: env_usize("EMBED_BATCH_SIZE", d.embed_batch_size),
            embed_concurrency: env_usize("EMBED_CONCURRENCY", d.embed_concurrency),
            section_threshold: env_f64("CONCEPT_GRAPH_SECTION_THRESHOLD", d.section_threshold as f64) as f32,
            section_top_k: env_usize("CONCEPT_GRAPH_SECTION_TOP_K", d.section_top_k),
            patch_skip_min_conf: env_f64("CONCEPT_GRAPH_PATCH_SKIP_MIN_CONF", d.patch_skip_min_conf),
            patch_skip_max_missing: env_usize("CONCEPT_GRAPH_PATCH_SKIP_MAX_MISSING", d.patch_skip_max_missing),
            realize_max_attempts: env_usize("REALIZE_MAX_ATTEMPTS", d.realize_max_attempts).max(1),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Dependencies
// ═══════════════════════════════════════════════════════════════════════

/// External collaborators. Absent entries are reported by
/// [`StageDeps::require`]; vectors and mirror are optional caches.
#[derive(Clone, Default)]
pub struct StageDeps {
    pub store: Option<Arc<dyn Store>>,
    pub llm: Option<Arc<dyn LlmClient>>,
    pub vectors: Option<Arc<dyn VectorStore>>,
    pub mirror: Option<Arc<dyn GraphMirror>>,
    pub objects: Option<Arc<dyn ObjectStore>>,
    pub settings: StageSettings,
}

impl StageDeps {
    /// Fail with every missing dependency in `needed` named at once.
    pub fn require(&self, stage: StageName, needed: &[&'static str]) -> Result<()> {
        let missing: Vec<&'static str> = needed
            .iter()
            .copied()
            .filter(|d| match *d {
                "store" => self.store.is_none(),
                "llm" => self.llm.is_none(),
                "vectors" => self.vectors.is_none(),
                "mirror" => self.mirror.is_none(),
                "objects" => self.objects.is_none(),
                _ => false,
            })
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(StageError::MissingDeps {
                stage: stage.as_str(),
                missing,
            }
            .into())
        }
    }

    pub fn store(&self, stage: StageName) -> Result<&dyn Store> {
        self.store.as_deref().ok_or_else(|| missing(stage, "store"))
    }

    pub fn llm(&self, stage: StageName) -> Result<&dyn LlmClient> {
        self.llm.as_deref().ok_or_else(|| missing(stage, "llm"))
    }

    pub fn vectors(&self) -> Option<&dyn VectorStore> {
        self.vectors.as_deref()
    }
}

fn missing(stage: StageName, dep: &'static str) -> anyhow::Error {
    StageError::MissingDeps {
        stage: stage.as_str(),
        missing: vec![dep],
    }
    .into()
}

// ═══════════════════════════════════════════════════════════════════════
// Stage trait and registry
// ═══════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> StageName;

    /// Run the stage. The returned JSON always carries `path_id` (when one
    /// was resolved) and the stage's counters.
    async fn run(&self, ctx: &StageContext, deps: &StageDeps, input: &StageInput) -> Result<Value>;

    /// Input fingerprint the stage would cache under, for diagnostics.
    async fn input_hash(&self, deps: &StageDeps, input: &StageInput) -> Result<String>;
}

pub struct StageRegistry {
    stages: Vec<Box<dyn Stage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(embed_chunks::EmbedChunks));
        registry.register(Box::new(concept_graph::ConceptGraphBuild));
        registry.register(Box::new(concept_graph_patch::ConceptGraphPatch));
        registry.register(Box::new(realize_activities::RealizeActivities));
        registry
    }

    pub fn register(&mut self, stage: Box<dyn Stage>) {
        self.stages.push(stage);
    }

    pub fn find(&self, name: StageName) -> Option<&dyn Stage> {
        self.stages.iter().find(|s| s.name() == name).map(|s| s.as_ref())
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Look up `name` among the built-in stages and run it.
pub async fn run_stage(name: StageName, ctx: &StageContext, deps: &StageDeps, input: &StageInput) -> Result<Value> {
    let registry = StageRegistry::with_builtins();
    let stage = registry
        .find(name)
        .with_context(|| format!("stage not registered: {}", name.as_str()))?;
    tracing::info!(
        stage = name.as_str(),
        owner = %input.owner_user_id,
        set = %input.material_set_id,
        saga = %input.saga_id,
        "stage start"
    );
    let started = std::time::Instant::now();
    let result = stage.run(ctx, deps, input).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(_) => tracing::info!(stage = name.as_str(), elapsed_ms, "stage done"),
        Err(e) => tracing::warn!(stage = name.as_str(), elapsed_ms, error = %e, "stage failed"),
    }
    result
}

/// Build dependencies from configuration.
pub fn deps_from_config(config: &Config, store: Arc<dyn Store>) -> Result<StageDeps> {
    let llm = crate::llm::create_client(&config.llm)?;
    Ok(StageDeps {
        store: Some(store),
        llm: Some(llm),
        vectors: crate::vectors::create_store(&config.vectors)?,
        mirror: Some(Arc::new(crate::mirror::NoopMirror)),
        objects: Some(Arc::new(crate::object_store::LocalObjectStore::new(&config.object_store.root))),
        settings: StageSettings::from_env(CacheSettings::from_config(&config.cache)),
    })
}

// ═══════════════════════════════════════════════════════════════════════
// Shared helpers
// ═══════════════════════════════════════════════════════════════════════

/// The canonical path for the input: the given `path_id` when it exists,
/// otherwise the `(owner, set)` path, created on demand.
pub async fn resolve_path(store: &dyn Store, input: &StageInput) -> Result<Path> {
    if let Some(id) = input.path_id {
        if let Some(path) = store.get_path(id).await? {
            return Ok(path);
        }
        tracing::warn!(path_id = %id, "requested path not found; resolving canonical path");
    }
    store.ensure_path(input.owner_user_id, input.material_set_id).await
}

/// Files and chunks of a material set after applying the path allowlist.
pub struct Material {
    pub files: Vec<MaterialFile>,
    pub chunks: Vec<MaterialChunk>,
    /// Allowlist as stored in path metadata (empty when unset).
    pub allow_files: Vec<Uuid>,
}

impl Material {
    pub fn file_ids(&self) -> Vec<Uuid> {
        self.files.iter().map(|f| f.id).collect()
    }
}

/// Load files and chunks. An allowlist that matches nothing falls back to
/// every file in the set with a warning.
pub async fn load_material(
    store: &dyn Store,
    stage: StageName,
    material_set_id: Uuid,
    allow_files: &[Uuid],
) -> Result<Material> {
    let all = store.list_material_files(material_set_id).await?;
    let mut files: Vec<MaterialFile> = if allow_files.is_empty() {
        all.clone()
    } else {
        all.iter().filter(|f| allow_files.contains(&f.id)).cloned().collect()
    };
    if files.is_empty() && !allow_files.is_empty() {
        tracing::warn!(
            stage = stage.as_str(),
            allowlist = allow_files.len(),
            "file allowlist matched nothing; using all files"
        );
        files = all;
    }
    if files.is_empty() {
        return Err(StageError::MissingInputs {
            stage: stage.as_str(),
            detail: format!("material set {} has no files", material_set_id),
        }
        .into());
    }
    files.sort_by(|a, b| a.id.cmp(&b.id));
    let ids: Vec<Uuid> = files.iter().map(|f| f.id).collect();
    let chunks = store.list_chunks_for_files(&ids).await?;
    Ok(Material {
        files,
        chunks,
        allow_files: allow_files.to_vec(),
    })
}

/// Upsert vectors in batches with bounded concurrency. Returns `true` when
/// the upsert was skipped or any batch failed.
pub async fn upsert_vectors_best_effort(
    vectors: Option<&dyn VectorStore>,
    stage: StageName,
    namespace: &str,
    records: Vec<VectorRecord>,
    concurrency: usize,
) -> bool {
    let Some(vectors) = vectors else {
        return true;
    };
    if records.is_empty() {
        return false;
    }
    let batches: Vec<Vec<VectorRecord>> = records.chunks(UPSERT_BATCH).map(<[VectorRecord]>::to_vec).collect();
    let jobs: Vec<_> = batches
        .into_iter()
        .map(|batch| async move { vectors.upsert(namespace, &batch).await })
        .collect();
    let results: Vec<Result<()>> = stream::iter(jobs)
        .buffered(concurrency.max(1))
        .collect()
        .await;
    let failed = results.iter().filter(|r| r.is_err()).count();
    if let Some(Err(e)) = results.iter().find(|r| r.is_err()) {
        tracing::warn!(stage = stage.as_str(), namespace, failed, error = %e, "vector upsert failed; continuing");
    }
    failed > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageError;
    use crate::store::memory::InMemoryStore;

    #[test]
    fn names_round_trip() {
        for n in StageName::ALL {
            assert_eq!(StageName::parse(n.as_str()), Some(n));
        }
        assert_eq!(StageName::parse("path_plan"), None);
    }

    #[test]
    fn require_lists_every_missing_dependency() {
        let deps = StageDeps::default();
        let err = deps.require(StageName::ConceptGraphBuild, &["store", "llm"]).unwrap_err();
        match err.downcast_ref::<StageError>() {
            Some(StageError::MissingDeps { stage, missing }) => {
                assert_eq!(*stage, "concept_graph_build");
                assert_eq!(missing, &vec!["store", "llm"]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn registry_has_every_builtin() {
        let registry = StageRegistry::with_builtins();
        for n in StageName::ALL {
            assert!(registry.find(n).is_some(), "{}", n.as_str());
        }
    }

    #[tokio::test]
    async fn empty_allowlist_match_falls_back_to_all_files() {
        let store = InMemoryStore::new();
        let set = Uuid::new_v4();
        let now = chrono::Utc::now();
        let file = MaterialFile {
            id: Uuid::new_v4(),
            material_set_id: set,
            original_name: "a.pdf".into(),
            mime_type: "application/pdf".into(),
            size_bytes: 1,
            storage_key: "k".into(),
            status: "extracted".into(),
            extracted_kind: "pdf_text".into(),
            created_at: now,
            updated_at: now,
            extracted_at: Some(now),
        };
        store.insert_file(file.clone()).unwrap();
        let m = load_material(&store, StageName::EmbedChunks, set, &[Uuid::new_v4()])
            .await
            .unwrap();
        assert_eq!(m.file_ids(), vec![file.id]);

        let err = load_material(&store, StageName::EmbedChunks, Uuid::new_v4(), &[])
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<StageError>(),
            Some(StageError::MissingInputs { .. })
        ));
    }
}
