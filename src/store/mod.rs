//! Storage abstraction for Pathweaver.
//!
//! The [`Store`] trait defines the reads every stage performs and opens
//! transactions; [`StoreTx`] carries the canonical writes that must commit
//! together with their saga actions. Two backends exist:
//! - **[`postgres::PgStore`]**: production, over a `sqlx` Postgres pool.
//! - **[`memory::InMemoryStore`]**: tests and local runs; emulates advisory
//!   locks, soft deletes, unique constraints and atomic commit.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Soft deletes
//!
//! Concept, evidence and edge reads return only rows with no `deleted_at`.
//! Unique constraints, however, cover soft-deleted rows too, so reinserting
//! a soft-deleted graph fails with a unique violation; callers recover with
//! [`StoreTx::restore_soft_deleted_graph`].

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use pathweaver_core::models::{
    ActivityBundle, ChunkMetadata, Concept, ConceptEdge, ConceptEvidence, ConceptScope, LearningArtifact,
    MaterialChunk, MaterialFile, MaterialFileSignature, Path, PathNode, SagaAction, SagaActionKind,
    StructuralDecisionTrace,
};

/// Key of a [`LearningArtifact`] row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArtifactKey<'a> {
    pub owner_user_id: Uuid,
    pub material_set_id: Uuid,
    /// Nil for set-level artifacts.
    pub path_id: Uuid,
    pub artifact_type: &'a str,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Open a transaction for canonical writes.
    async fn begin(&self) -> Result<Box<dyn StoreTx>>;

    // ── paths ──

    /// Return the canonical path for `(owner, set)`, creating it if absent.
    /// Idempotent and safe under concurrent callers.
    async fn ensure_path(&self, owner_user_id: Uuid, material_set_id: Uuid) -> Result<Path>;

    async fn get_path(&self, path_id: Uuid) -> Result<Option<Path>>;

    /// Merge allowlisted keys into path metadata; unknown keys are ignored.
    async fn merge_path_metadata(&self, path_id: Uuid, patch: &Map<String, Value>) -> Result<Path>;

    async fn list_path_nodes(&self, path_id: Uuid) -> Result<Vec<PathNode>>;

    /// `(path_node_id, rank)` pairs that already have an activity.
    async fn realized_slots(&self, path_id: Uuid) -> Result<Vec<(Uuid, i32)>>;

    // ── materials ──

    async fn list_material_files(&self, material_set_id: Uuid) -> Result<Vec<MaterialFile>>;

    /// Chunks of the given files ordered by `(file_id, index)`.
    async fn list_chunks_for_files(&self, file_ids: &[Uuid]) -> Result<Vec<MaterialChunk>>;

    async fn update_chunk_metadata(&self, chunk_id: Uuid, metadata: &ChunkMetadata) -> Result<()>;

    async fn update_chunk_embeddings(&self, rows: &[(Uuid, Vec<f32>)]) -> Result<()>;

    async fn list_file_signatures(&self, file_ids: &[Uuid]) -> Result<Vec<MaterialFileSignature>>;

    /// Full-text search over chunk text within `file_ids`.
    async fn lexical_search_chunks(&self, file_ids: &[Uuid], query: &str, limit: usize) -> Result<Vec<Uuid>>;

    // ── concept graph (active rows only) ──

    async fn concepts_by_scope(&self, scope: ConceptScope, scope_id: Option<Uuid>) -> Result<Vec<Concept>>;

    async fn concepts_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Concept>>;

    async fn evidence_for_chunks(&self, chunk_ids: &[Uuid]) -> Result<Vec<ConceptEvidence>>;

    async fn evidence_for_concepts(&self, concept_ids: &[Uuid]) -> Result<Vec<ConceptEvidence>>;

    /// Edges touching any of `concept_ids` on either end.
    async fn edges_for_concepts(&self, concept_ids: &[Uuid]) -> Result<Vec<ConceptEdge>>;

    // ── artifacts, saga, traces ──

    async fn get_artifact(&self, key: ArtifactKey<'_>) -> Result<Option<LearningArtifact>>;

    async fn upsert_artifact(&self, artifact: &LearningArtifact) -> Result<()>;

    /// Actions for `saga_id` in append order.
    async fn saga_actions(&self, saga_id: Uuid) -> Result<Vec<SagaAction>>;

    async fn mark_saga_action(&self, action_id: Uuid, status: &str) -> Result<()>;

    async fn record_decision_trace(&self, trace: &StructuralDecisionTrace) -> Result<()>;
}

/// A canonical write transaction. Dropping without commit rolls back.
#[async_trait]
pub trait StoreTx: Send {
    /// Transaction-scoped advisory lock; released at commit or rollback.
    async fn advisory_xact_lock(&mut self, key: i64) -> Result<()>;

    async fn concepts_by_scope(&mut self, scope: ConceptScope, scope_id: Option<Uuid>) -> Result<Vec<Concept>>;

    /// Insert concept rows. Fails with a unique violation when any
    /// `(scope, scope_id, key)` or ID already exists, soft-deleted or not.
    async fn insert_concepts(&mut self, concepts: &[Concept]) -> Result<()>;

    async fn set_concept_parent(&mut self, concept_id: Uuid, parent_id: Option<Uuid>) -> Result<()>;

    /// Insert evidence, ignoring `(concept_id, chunk_id)` duplicates.
    /// Returns rows inserted.
    async fn insert_evidence(&mut self, rows: &[ConceptEvidence]) -> Result<usize>;

    /// Upsert on `(from, to, type)`, keeping the stronger edge.
    async fn upsert_edges(&mut self, edges: &[ConceptEdge]) -> Result<()>;

    /// Active global concepts whose key or an alias is in `keys`.
    async fn find_global_concepts(&mut self, keys: &[String]) -> Result<Vec<Concept>>;

    /// Insert a global concept unless its key exists; return the stored row.
    async fn insert_global_concept_if_absent(&mut self, concept: &Concept) -> Result<Concept>;

    async fn set_canonical_concept(&mut self, concept_id: Uuid, canonical_id: Uuid) -> Result<()>;

    async fn insert_activity_bundle(&mut self, bundle: &ActivityBundle) -> Result<()>;

    /// Append a saga action; idempotent on `(saga_id, action_key)`.
    /// Returns false when the action already existed.
    async fn append_saga_action(
        &mut self,
        saga_id: Uuid,
        kind: SagaActionKind,
        action_key: &str,
        payload: &Value,
    ) -> Result<bool>;

    /// Clear `deleted_at` on the path's concepts and their evidence and
    /// edges. Returns the number of concepts restored.
    async fn restore_soft_deleted_graph(&mut self, path_id: Uuid) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
