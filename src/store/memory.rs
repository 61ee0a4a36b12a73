//! In-memory [`Store`] implementation for tests and local runs.
//!
//! All tables live behind one `std::sync::RwLock`. A transaction works on
//! a private copy of the tables and records every write in an op log; at
//! commit the log is replayed against the live tables, re-checking unique
//! constraints, and the result is swapped in atomically. Advisory locks are
//! per-key `tokio::sync::Mutex`es held until commit or rollback.
//!
//! Lexical search is term matching: a chunk matches when it contains every
//! lowercased query term.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use pathweaver_core::keys::stable_id;
use pathweaver_core::models::{
    Activity, ActivityBundle, ActivityCitation, ActivityConcept, ActivityVariant, ChunkMetadata, Concept,
    ConceptEdge, ConceptEvidence, ConceptScope, LearningArtifact, MaterialChunk, MaterialFile,
    MaterialFileSignature, MaterialSet, Path, PathNode, PathNodeActivity, SagaAction, SagaActionKind,
    StructuralDecisionTrace,
};
use pathweaver_core::path_meta::merge_allowed;

use super::{ArtifactKey, Store, StoreTx};
use crate::error::StoreError;

const PATH_NS: Uuid = Uuid::from_u128(0x6f1c_2a7e_0d4b_4c5e_9a31_7b2e_55c0_a001);

type ArtifactRowKey = (Uuid, Uuid, Uuid, String);

#[derive(Clone, Default)]
struct Tables {
    material_sets: HashMap<Uuid, MaterialSet>,
    files: HashMap<Uuid, MaterialFile>,
    chunks: HashMap<Uuid, MaterialChunk>,
    signatures: HashMap<Uuid, MaterialFileSignature>,
    paths: HashMap<Uuid, Path>,
    path_nodes: Vec<PathNode>,
    concepts: HashMap<Uuid, Concept>,
    evidence: Vec<ConceptEvidence>,
    edges: Vec<ConceptEdge>,
    activities: HashMap<Uuid, Activity>,
    variants: HashMap<Uuid, ActivityVariant>,
    activity_concepts: Vec<ActivityConcept>,
    activity_citations: Vec<ActivityCitation>,
    node_activities: Vec<PathNodeActivity>,
    artifacts: HashMap<ArtifactRowKey, LearningArtifact>,
    saga_actions: Vec<SagaAction>,
    traces: Vec<StructuralDecisionTrace>,
}

fn unique(constraint: &str) -> anyhow::Error {
    StoreError::UniqueViolation {
        constraint: constraint.to_string(),
    }
    .into()
}

fn not_found(entity: &'static str, id: Uuid) -> anyhow::Error {
    StoreError::NotFound {
        entity,
        id: id.to_string(),
    }
    .into()
}

impl Tables {
    fn active_concepts_by_scope(&self, scope: ConceptScope, scope_id: Option<Uuid>) -> Vec<Concept> {
        let mut out: Vec<Concept> = self
            .concepts
            .values()
            .filter(|c| c.deleted_at.is_none() && c.scope == scope && c.scope_id == scope_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.sort_index.cmp(&b.sort_index).then_with(|| a.key.cmp(&b.key)));
        out
    }

    fn insert_concepts(&mut self, concepts: &[Concept]) -> Result<()> {
        let mut taken: HashSet<(ConceptScope, Option<Uuid>, String)> = self
            .concepts
            .values()
            .map(|c| (c.scope, c.scope_id, c.key.clone()))
            .collect();
        for c in concepts {
            if self.concepts.contains_key(&c.id) {
                return Err(unique("concept_pkey"));
            }
            if !taken.insert((c.scope, c.scope_id, c.key.clone())) {
                return Err(unique("concept_scope_scope_id_key"));
            }
        }
        for c in concepts {
            self.concepts.insert(c.id, c.clone());
        }
        Ok(())
    }

    fn set_parent(&mut self, concept_id: Uuid, parent_id: Option<Uuid>) -> Result<()> {
        if let Some(p) = parent_id {
            if !self.concepts.contains_key(&p) {
                return Err(not_found("concept", p));
            }
        }
        let c = self
            .concepts
            .get_mut(&concept_id)
            .ok_or_else(|| not_found("concept", concept_id))?;
        c.parent_id = parent_id;
        c.updated_at = Utc::now();
        Ok(())
    }

    fn insert_evidence(&mut self, rows: &[ConceptEvidence]) -> usize {
        let mut seen: HashSet<(Uuid, Uuid)> = self
            .evidence
            .iter()
            .map(|e| (e.concept_id, e.material_chunk_id))
            .collect();
        let mut inserted = 0;
        for row in rows {
            if seen.insert((row.concept_id, row.material_chunk_id)) {
                self.evidence.push(row.clone());
                inserted += 1;
            }
        }
        inserted
    }

    fn upsert_edges(&mut self, edges: &[ConceptEdge]) {
        for edge in edges {
            match self.edges.iter_mut().find(|e| {
                e.from_concept_id == edge.from_concept_id
                    && e.to_concept_id == edge.to_concept_id
                    && e.edge_type == edge.edge_type
            }) {
                Some(existing) => {
                    if edge.strength >= existing.strength {
                        existing.strength = edge.strength;
                        existing.evidence = edge.evidence.clone();
                    }
                    existing.deleted_at = None;
                }
                None => self.edges.push(edge.clone()),
            }
        }
    }

    fn find_global(&self, keys: &[String]) -> Vec<Concept> {
        let wanted: HashSet<&str> = keys.iter().map(String::as_str).collect();
        let mut out: Vec<Concept> = self
            .concepts
            .values()
            .filter(|c| c.deleted_at.is_none() && c.scope == ConceptScope::Global)
            .filter(|c| {
                wanted.contains(c.key.as_str()) || c.metadata.aliases.iter().any(|a| wanted.contains(a.as_str()))
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// The global row holding `key`, live or soft-deleted.
    fn global_by_key(&self, key: &str) -> Option<&Concept> {
        self.concepts
            .values()
            .find(|c| c.scope == ConceptScope::Global && c.scope_id.is_none() && c.key == key)
    }

    fn restore_concept(&mut self, concept_id: Uuid) -> Result<()> {
        let c = self
            .concepts
            .get_mut(&concept_id)
            .ok_or_else(|| not_found("concept", concept_id))?;
        c.deleted_at = None;
        c.updated_at = Utc::now();
        Ok(())
    }

    fn set_canonical(&mut self, concept_id: Uuid, canonical_id: Uuid) -> Result<()> {
        match self.concepts.get(&canonical_id) {
            Some(c) if c.scope == ConceptScope::Global => {}
            _ => return Err(not_found("global concept", canonical_id)),
        }
        let c = self
            .concepts
            .get_mut(&concept_id)
            .ok_or_else(|| not_found("concept", concept_id))?;
        c.canonical_concept_id = Some(canonical_id);
        c.updated_at = Utc::now();
        Ok(())
    }

    fn insert_bundle(&mut self, bundle: &ActivityBundle) -> Result<()> {
        if self.activities.contains_key(&bundle.activity.id) {
            return Err(unique("activity_pkey"));
        }
        let link = &bundle.node_activity;
        if self
            .node_activities
            .iter()
            .any(|l| l.path_node_id == link.path_node_id && l.rank == link.rank)
        {
            return Err(unique("path_node_activity_node_rank"));
        }
        self.activities.insert(bundle.activity.id, bundle.activity.clone());
        self.variants.insert(bundle.variant.id, bundle.variant.clone());
        self.activity_concepts.extend(bundle.concepts.iter().cloned());
        self.activity_citations.extend(bundle.citations.iter().cloned());
        self.node_activities.push(link.clone());
        Ok(())
    }

    fn append_saga(&mut self, id: Uuid, saga_id: Uuid, kind: SagaActionKind, action_key: &str, payload: &Value) -> bool {
        if self
            .saga_actions
            .iter()
            .any(|a| a.saga_id == saga_id && a.action_key == action_key)
        {
            return false;
        }
        let seq = self.saga_actions.iter().filter(|a| a.saga_id == saga_id).count() as i64 + 1;
        self.saga_actions.push(SagaAction {
            id,
            saga_id,
            seq,
            kind,
            action_key: action_key.to_string(),
            payload: payload.clone(),
            status: "pending".to_string(),
            created_at: Utc::now(),
        });
        true
    }

    fn restore_graph(&mut self, path_id: Uuid) -> u64 {
        let mut restored_ids = HashSet::new();
        for c in self.concepts.values_mut() {
            if c.scope == ConceptScope::Path && c.scope_id == Some(path_id) && c.deleted_at.is_some() {
                c.deleted_at = None;
                restored_ids.insert(c.id);
            }
        }
        let path_concepts: HashSet<Uuid> = self
            .concepts
            .values()
            .filter(|c| c.scope == ConceptScope::Path && c.scope_id == Some(path_id))
            .map(|c| c.id)
            .collect();
        for e in &mut self.evidence {
            if path_concepts.contains(&e.concept_id) {
                e.deleted_at = None;
            }
        }
        for e in &mut self.edges {
            if path_concepts.contains(&e.from_concept_id) || path_concepts.contains(&e.to_concept_id) {
                e.deleted_at = None;
            }
        }
        restored_ids.len() as u64
    }

    fn apply(&mut self, op: &Op) -> Result<()> {
        match op {
            Op::InsertConcepts(c) => self.insert_concepts(c),
            Op::SetParent(id, parent) => self.set_parent(*id, *parent),
            Op::InsertEvidence(rows) => {
                self.insert_evidence(rows);
                Ok(())
            }
            Op::UpsertEdges(edges) => {
                self.upsert_edges(edges);
                Ok(())
            }
            Op::InsertGlobal(c) => self.insert_concepts(std::slice::from_ref(c)),
            Op::RestoreConcept(id) => self.restore_concept(*id),
            Op::SetCanonical(id, canonical) => self.set_canonical(*id, *canonical),
            Op::InsertBundle(b) => self.insert_bundle(b),
            Op::AppendSaga {
                id,
                saga_id,
                kind,
                action_key,
                payload,
            } => {
                self.append_saga(*id, *saga_id, *kind, action_key, payload);
                Ok(())
            }
            Op::Restore(path_id) => {
                self.restore_graph(*path_id);
                Ok(())
            }
        }
    }
}

enum Op {
    InsertConcepts(Vec<Concept>),
    SetParent(Uuid, Option<Uuid>),
    InsertEvidence(Vec<ConceptEvidence>),
    UpsertEdges(Vec<ConceptEdge>),
    /// Replays as a plain insert: a global committed by another
    /// transaction in the meantime is a unique violation.
    InsertGlobal(Concept),
    RestoreConcept(Uuid),
    SetCanonical(Uuid, Uuid),
    InsertBundle(Box<ActivityBundle>),
    AppendSaga {
        id: Uuid,
        saga_id: Uuid,
        kind: SagaActionKind,
        action_key: String,
        payload: Value,
    },
    Restore(Uuid),
}

#[derive(Default)]
struct Inner {
    tables: RwLock<Tables>,
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
    lock_acquisitions: Mutex<HashMap<i64, usize>>,
    commits: AtomicUsize,
    /// Concepts committed by a simulated concurrent worker right before
    /// a later transaction commit.
    pending_race: Mutex<Vec<Concept>>,
    /// Commits to let through before `pending_race` lands.
    race_delay: AtomicUsize,
    /// Global concept inserts left to fail.
    failing_global_inserts: AtomicUsize,
}

impl Inner {
    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>> {
        self.tables.read().map_err(|_| anyhow!("store lock poisoned"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>> {
        self.tables.write().map_err(|_| anyhow!("store lock poisoned"))
    }
}

/// In-memory store for tests and local runs.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── fixtures ──

    pub fn insert_material_set(&self, set: MaterialSet) -> Result<()> {
        self.inner.write()?.material_sets.insert(set.id, set);
        Ok(())
    }

    pub fn insert_file(&self, file: MaterialFile) -> Result<()> {
        self.inner.write()?.files.insert(file.id, file);
        Ok(())
    }

    pub fn insert_chunk(&self, chunk: MaterialChunk) -> Result<()> {
        let mut t = self.inner.write()?;
        if t
            .chunks
            .values()
            .any(|c| c.material_file_id == chunk.material_file_id && c.index == chunk.index && c.id != chunk.id)
        {
            return Err(unique("material_chunk_file_index"));
        }
        t.chunks.insert(chunk.id, chunk);
        Ok(())
    }

    pub fn insert_signature(&self, sig: MaterialFileSignature) -> Result<()> {
        self.inner.write()?.signatures.insert(sig.material_file_id, sig);
        Ok(())
    }

    pub fn insert_path_node(&self, node: PathNode) -> Result<()> {
        self.inner.write()?.path_nodes.push(node);
        Ok(())
    }

    /// Soft-delete every concept of a path graph with its evidence and edges.
    pub fn soft_delete_path_graph(&self, path_id: Uuid) -> Result<usize> {
        let mut t = self.inner.write()?;
        let now = Utc::now();
        let mut ids = HashSet::new();
        for c in t.concepts.values_mut() {
            if c.scope == ConceptScope::Path && c.scope_id == Some(path_id) {
                c.deleted_at = Some(now);
                ids.insert(c.id);
            }
        }
        for e in t.evidence.iter_mut().filter(|e| ids.contains(&e.concept_id)) {
            e.deleted_at = Some(now);
        }
        for e in t
            .edges
            .iter_mut()
            .filter(|e| ids.contains(&e.from_concept_id) || ids.contains(&e.to_concept_id))
        {
            e.deleted_at = Some(now);
        }
        Ok(ids.len())
    }

    /// Commit `concepts` on behalf of another worker just before the next
    /// transaction commits.
    pub fn inject_concurrent_concepts(&self, concepts: Vec<Concept>) -> Result<()> {
        self.inject_concurrent_concepts_after(0, concepts)
    }

    /// Like [`Self::inject_concurrent_concepts`], but only after `commits`
    /// transactions have committed.
    pub fn inject_concurrent_concepts_after(&self, commits: usize, concepts: Vec<Concept>) -> Result<()> {
        self.inner.race_delay.store(commits, Ordering::SeqCst);
        self.inner
            .pending_race
            .lock()
            .map_err(|_| anyhow!("store lock poisoned"))?
            .extend(concepts);
        Ok(())
    }

    /// Make the next `n` global concept inserts fail.
    pub fn fail_global_inserts(&self, n: usize) {
        self.inner.failing_global_inserts.store(n, Ordering::SeqCst);
    }

    // ── inspection ──

    /// How many times the advisory lock `key` was acquired.
    pub fn lock_acquisitions(&self, key: i64) -> usize {
        self.inner
            .lock_acquisitions
            .lock()
            .map(|m| m.get(&key).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn commit_count(&self) -> usize {
        self.inner.commits.load(Ordering::SeqCst)
    }

    pub fn all_concepts(&self) -> Vec<Concept> {
        self.inner
            .read()
            .map(|t| t.concepts.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn all_edges(&self) -> Vec<ConceptEdge> {
        self.inner.read().map(|t| t.edges.clone()).unwrap_or_default()
    }

    pub fn all_evidence(&self) -> Vec<ConceptEvidence> {
        self.inner.read().map(|t| t.evidence.clone()).unwrap_or_default()
    }

    pub fn activities_for_path(&self, path_id: Uuid) -> Vec<Activity> {
        let mut out: Vec<Activity> = self
            .inner
            .read()
            .map(|t| t.activities.values().filter(|a| a.path_id == path_id).cloned().collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.title.cmp(&b.title));
        out
    }

    pub fn variants_for_activity(&self, activity_id: Uuid) -> Vec<ActivityVariant> {
        self.inner
            .read()
            .map(|t| t.variants.values().filter(|v| v.activity_id == activity_id).cloned().collect())
            .unwrap_or_default()
    }

    pub fn activity_citations(&self) -> Vec<ActivityCitation> {
        self.inner.read().map(|t| t.activity_citations.clone()).unwrap_or_default()
    }

    pub fn activity_concepts(&self) -> Vec<ActivityConcept> {
        self.inner.read().map(|t| t.activity_concepts.clone()).unwrap_or_default()
    }

    pub fn chunk(&self, id: Uuid) -> Option<MaterialChunk> {
        self.inner.read().ok().and_then(|t| t.chunks.get(&id).cloned())
    }

    pub fn decision_traces(&self) -> Vec<StructuralDecisionTrace> {
        self.inner.read().map(|t| t.traces.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let snapshot = self.inner.read()?.clone();
        Ok(Box::new(InMemoryTx {
            inner: Arc::clone(&self.inner),
            working: snapshot,
            ops: Vec::new(),
            guards: Vec::new(),
        }))
    }

    async fn ensure_path(&self, owner_user_id: Uuid, material_set_id: Uuid) -> Result<Path> {
        let mut t = self.inner.write()?;
        if let Some(p) = t
            .paths
            .values()
            .find(|p| p.owner_user_id == owner_user_id && p.material_set_id == material_set_id)
        {
            return Ok(p.clone());
        }
        let now = Utc::now();
        let path = Path {
            id: stable_id(PATH_NS, &[&owner_user_id.to_string(), &material_set_id.to_string()]),
            owner_user_id,
            material_set_id,
            metadata: Value::Object(Map::new()),
            created_at: now,
            updated_at: now,
        };
        t.paths.insert(path.id, path.clone());
        Ok(path)
    }

    async fn get_path(&self, path_id: Uuid) -> Result<Option<Path>> {
        Ok(self.inner.read()?.paths.get(&path_id).cloned())
    }

    async fn merge_path_metadata(&self, path_id: Uuid, patch: &Map<String, Value>) -> Result<Path> {
        let mut t = self.inner.write()?;
        let path = t.paths.get_mut(&path_id).ok_or_else(|| not_found("path", path_id))?;
        let rejected = merge_allowed(&mut path.metadata, patch);
        if !rejected.is_empty() {
            tracing::warn!(path_id = %path_id, ?rejected, "ignored unknown path metadata keys");
        }
        path.updated_at = Utc::now();
        Ok(path.clone())
    }

    async fn list_path_nodes(&self, path_id: Uuid) -> Result<Vec<PathNode>> {
        let mut nodes: Vec<PathNode> = self
            .inner
            .read()?
            .path_nodes
            .iter()
            .filter(|n| n.path_id == path_id)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.id.cmp(&b.id)));
        Ok(nodes)
    }

    async fn realized_slots(&self, path_id: Uuid) -> Result<Vec<(Uuid, i32)>> {
        let t = self.inner.read()?;
        let nodes: HashSet<Uuid> = t.path_nodes.iter().filter(|n| n.path_id == path_id).map(|n| n.id).collect();
        let mut out: Vec<(Uuid, i32)> = t
            .node_activities
            .iter()
            .filter(|l| nodes.contains(&l.path_node_id))
            .map(|l| (l.path_node_id, l.rank))
            .collect();
        out.sort();
        Ok(out)
    }

    async fn list_material_files(&self, material_set_id: Uuid) -> Result<Vec<MaterialFile>> {
        let mut files: Vec<MaterialFile> = self
            .inner
            .read()?
            .files
            .values()
            .filter(|f| f.material_set_id == material_set_id)
            .cloned()
            .collect();
        files.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(files)
    }

    async fn list_chunks_for_files(&self, file_ids: &[Uuid]) -> Result<Vec<MaterialChunk>> {
        let wanted: HashSet<&Uuid> = file_ids.iter().collect();
        let mut chunks: Vec<MaterialChunk> = self
            .inner
            .read()?
            .chunks
            .values()
            .filter(|c| wanted.contains(&c.material_file_id))
            .cloned()
            .collect();
        chunks.sort_by(|a, b| a.material_file_id.cmp(&b.material_file_id).then(a.index.cmp(&b.index)));
        Ok(chunks)
    }

    async fn update_chunk_metadata(&self, chunk_id: Uuid, metadata: &ChunkMetadata) -> Result<()> {
        let mut t = self.inner.write()?;
        let c = t.chunks.get_mut(&chunk_id).ok_or_else(|| not_found("chunk", chunk_id))?;
        c.metadata = metadata.clone();
        c.updated_at = Utc::now();
        Ok(())
    }

    async fn update_chunk_embeddings(&self, rows: &[(Uuid, Vec<f32>)]) -> Result<()> {
        let mut t = self.inner.write()?;
        for (id, emb) in rows {
            let c = t.chunks.get_mut(id).ok_or_else(|| not_found("chunk", *id))?;
            c.embedding = emb.clone();
        }
        Ok(())
    }

    async fn list_file_signatures(&self, file_ids: &[Uuid]) -> Result<Vec<MaterialFileSignature>> {
        let t = self.inner.read()?;
        Ok(file_ids.iter().filter_map(|id| t.signatures.get(id).cloned()).collect())
    }

    async fn lexical_search_chunks(&self, file_ids: &[Uuid], query: &str, limit: usize) -> Result<Vec<Uuid>> {
        let terms: Vec<String> = query
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 2)
            .map(str::to_lowercase)
            .collect();
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let files: HashSet<&Uuid> = file_ids.iter().collect();
        let t = self.inner.read()?;
        let mut hits: Vec<(usize, Uuid)> = t
            .chunks
            .values()
            .filter(|c| files.contains(&c.material_file_id))
            .filter_map(|c| {
                let text = c.text.to_lowercase();
                let score = terms.iter().filter(|term| text.contains(term.as_str())).count();
                (score == terms.len()).then_some((score, c.id))
            })
            .collect();
        hits.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        Ok(hits.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn concepts_by_scope(&self, scope: ConceptScope, scope_id: Option<Uuid>) -> Result<Vec<Concept>> {
        Ok(self.inner.read()?.active_concepts_by_scope(scope, scope_id))
    }

    async fn concepts_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Concept>> {
        let t = self.inner.read()?;
        Ok(ids
            .iter()
            .filter_map(|id| t.concepts.get(id))
            .filter(|c| c.deleted_at.is_none())
            .cloned()
            .collect())
    }

    async fn evidence_for_chunks(&self, chunk_ids: &[Uuid]) -> Result<Vec<ConceptEvidence>> {
        let wanted: HashSet<&Uuid> = chunk_ids.iter().collect();
        Ok(self
            .inner
            .read()?
            .evidence
            .iter()
            .filter(|e| e.deleted_at.is_none() && wanted.contains(&e.material_chunk_id))
            .cloned()
            .collect())
    }

    async fn evidence_for_concepts(&self, concept_ids: &[Uuid]) -> Result<Vec<ConceptEvidence>> {
        let wanted: HashSet<&Uuid> = concept_ids.iter().collect();
        Ok(self
            .inner
            .read()?
            .evidence
            .iter()
            .filter(|e| e.deleted_at.is_none() && wanted.contains(&e.concept_id))
            .cloned()
            .collect())
    }

    async fn edges_for_concepts(&self, concept_ids: &[Uuid]) -> Result<Vec<ConceptEdge>> {
        let wanted: HashSet<&Uuid> = concept_ids.iter().collect();
        Ok(self
            .inner
            .read()?
            .edges
            .iter()
            .filter(|e| {
                e.deleted_at.is_none() && (wanted.contains(&e.from_concept_id) || wanted.contains(&e.to_concept_id))
            })
            .cloned()
            .collect())
    }

    async fn get_artifact(&self, key: ArtifactKey<'_>) -> Result<Option<LearningArtifact>> {
        let row_key = (
            key.owner_user_id,
            key.material_set_id,
            key.path_id,
            key.artifact_type.to_string(),
        );
        Ok(self.inner.read()?.artifacts.get(&row_key).cloned())
    }

    async fn upsert_artifact(&self, artifact: &LearningArtifact) -> Result<()> {
        let row_key = (
            artifact.owner_user_id,
            artifact.material_set_id,
            artifact.path_id,
            artifact.artifact_type.clone(),
        );
        self.inner.write()?.artifacts.insert(row_key, artifact.clone());
        Ok(())
    }

    async fn saga_actions(&self, saga_id: Uuid) -> Result<Vec<SagaAction>> {
        let mut out: Vec<SagaAction> = self
            .inner
            .read()?
            .saga_actions
            .iter()
            .filter(|a| a.saga_id == saga_id)
            .cloned()
            .collect();
        out.sort_by_key(|a| a.seq);
        Ok(out)
    }

    async fn mark_saga_action(&self, action_id: Uuid, status: &str) -> Result<()> {
        let mut t = self.inner.write()?;
        let a = t
            .saga_actions
            .iter_mut()
            .find(|a| a.id == action_id)
            .ok_or_else(|| not_found("saga action", action_id))?;
        a.status = status.to_string();
        Ok(())
    }

    async fn record_decision_trace(&self, trace: &StructuralDecisionTrace) -> Result<()> {
        self.inner.write()?.traces.push(trace.clone());
        Ok(())
    }
}

/// Transaction over a private copy of the tables.
struct InMemoryTx {
    inner: Arc<Inner>,
    working: Tables,
    ops: Vec<Op>,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl InMemoryTx {
    /// Apply `op` to the working copy and log it for commit.
    fn record(&mut self, op: Op) -> Result<()> {
        self.working.apply(&op)?;
        self.ops.push(op);
        Ok(())
    }

    /// Re-read committed state and re-apply this transaction's writes, so
    /// reads after a lock see what earlier lock holders committed.
    fn refresh(&mut self) -> Result<()> {
        let mut fresh = self.inner.read()?.clone();
        for op in &self.ops {
            fresh.apply(op)?;
        }
        self.working = fresh;
        Ok(())
    }
}

#[async_trait]
impl StoreTx for InMemoryTx {
    async fn advisory_xact_lock(&mut self, key: i64) -> Result<()> {
        let lock = {
            let mut locks = self.inner.locks.lock().map_err(|_| anyhow!("lock table poisoned"))?;
            Arc::clone(locks.entry(key).or_default())
        };
        let guard = lock.lock_owned().await;
        self.guards.push(guard);
        if let Ok(mut counts) = self.inner.lock_acquisitions.lock() {
            *counts.entry(key).or_default() += 1;
        }
        self.refresh()
    }

    async fn concepts_by_scope(&mut self, scope: ConceptScope, scope_id: Option<Uuid>) -> Result<Vec<Concept>> {
        Ok(self.working.active_concepts_by_scope(scope, scope_id))
    }

    async fn insert_concepts(&mut self, concepts: &[Concept]) -> Result<()> {
        self.record(Op::InsertConcepts(concepts.to_vec()))
    }

    async fn set_concept_parent(&mut self, concept_id: Uuid, parent_id: Option<Uuid>) -> Result<()> {
        self.record(Op::SetParent(concept_id, parent_id))
    }

    async fn insert_evidence(&mut self, rows: &[ConceptEvidence]) -> Result<usize> {
        let inserted = self.working.insert_evidence(rows);
        self.ops.push(Op::InsertEvidence(rows.to_vec()));
        Ok(inserted)
    }

    async fn upsert_edges(&mut self, edges: &[ConceptEdge]) -> Result<()> {
        self.record(Op::UpsertEdges(edges.to_vec()))
    }

    async fn find_global_concepts(&mut self, keys: &[String]) -> Result<Vec<Concept>> {
        Ok(self.working.find_global(keys))
    }

    async fn insert_global_concept_if_absent(&mut self, concept: &Concept) -> Result<Concept> {
        if self
            .inner
            .failing_global_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            bail!("global concept insert failed: {}", concept.key);
        }
        match self.working.global_by_key(&concept.key).cloned() {
            Some(existing) if existing.deleted_at.is_none() => Ok(existing),
            Some(deleted) => {
                self.record(Op::RestoreConcept(deleted.id))?;
                Ok(Concept {
                    deleted_at: None,
                    ..deleted
                })
            }
            None => {
                self.record(Op::InsertGlobal(concept.clone()))?;
                Ok(concept.clone())
            }
        }
    }

    async fn set_canonical_concept(&mut self, concept_id: Uuid, canonical_id: Uuid) -> Result<()> {
        self.record(Op::SetCanonical(concept_id, canonical_id))
    }

    async fn insert_activity_bundle(&mut self, bundle: &ActivityBundle) -> Result<()> {
        self.record(Op::InsertBundle(Box::new(bundle.clone())))
    }

    async fn append_saga_action(
        &mut self,
        saga_id: Uuid,
        kind: SagaActionKind,
        action_key: &str,
        payload: &Value,
    ) -> Result<bool> {
        let id = Uuid::new_v4();
        let appended = self.working.append_saga(id, saga_id, kind, action_key, payload);
        if appended {
            self.ops.push(Op::AppendSaga {
                id,
                saga_id,
                kind,
                action_key: action_key.to_string(),
                payload: payload.clone(),
            });
        }
        Ok(appended)
    }

    async fn restore_soft_deleted_graph(&mut self, path_id: Uuid) -> Result<u64> {
        let restored = self.working.restore_graph(path_id);
        self.ops.push(Op::Restore(path_id));
        Ok(restored)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        let delayed = this
            .inner
            .race_delay
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let raced: Vec<Concept> = match this.inner.pending_race.lock() {
            Ok(_) if delayed => Vec::new(),
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => bail!("store lock poisoned"),
        };
        let mut live = this.inner.write()?;
        if !raced.is_empty() {
            live.insert_concepts(&raced)?;
        }
        let mut next = live.clone();
        for op in &this.ops {
            next.apply(op)?;
        }
        *live = next;
        this.inner.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_unique_violation;
    use pathweaver_core::models::ConceptMetadata;

    fn concept(path_id: Uuid, key: &str) -> Concept {
        let now = Utc::now();
        Concept {
            id: Uuid::new_v4(),
            scope: ConceptScope::Path,
            scope_id: Some(path_id),
            parent_id: None,
            key: key.to_string(),
            name: key.to_string(),
            summary: String::new(),
            key_points: Vec::new(),
            depth: 0,
            sort_index: 0,
            vector_id: String::new(),
            metadata: ConceptMetadata::default(),
            canonical_concept_id: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn ensure_path_is_idempotent() {
        let store = InMemoryStore::new();
        let (owner, set) = (Uuid::new_v4(), Uuid::new_v4());
        let a = store.ensure_path(owner, set).await.unwrap();
        let b = store.ensure_path(owner, set).await.unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let store = InMemoryStore::new();
        let path = Uuid::new_v4();
        let mut tx = store.begin().await.unwrap();
        tx.insert_concepts(&[concept(path, "a")]).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(store.concepts_by_scope(ConceptScope::Path, Some(path)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn soft_deleted_rows_still_block_inserts() {
        let store = InMemoryStore::new();
        let path = Uuid::new_v4();
        let mut tx = store.begin().await.unwrap();
        tx.insert_concepts(&[concept(path, "a")]).await.unwrap();
        tx.commit().await.unwrap();
        store.soft_delete_path_graph(path).unwrap();
        assert!(store.concepts_by_scope(ConceptScope::Path, Some(path)).await.unwrap().is_empty());

        let mut tx = store.begin().await.unwrap();
        let err = tx.insert_concepts(&[concept(path, "a")]).await.unwrap_err();
        assert!(is_unique_violation(&err));
        tx.rollback().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.restore_soft_deleted_graph(path).await.unwrap(), 1);
        tx.commit().await.unwrap();
        assert_eq!(store.concepts_by_scope(ConceptScope::Path, Some(path)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_commit_surfaces_unique_violation() {
        let store = InMemoryStore::new();
        let path = Uuid::new_v4();
        let mut tx = store.begin().await.unwrap();
        tx.insert_concepts(&[concept(path, "a")]).await.unwrap();
        store.inject_concurrent_concepts(vec![concept(path, "a")]).unwrap();
        let err = tx.commit().await.unwrap_err();
        assert!(is_unique_violation(&err));
    }

    fn global(key: &str) -> Concept {
        Concept {
            id: Uuid::from_u128(key.len() as u128 + 0x9000),
            scope: ConceptScope::Global,
            scope_id: None,
            ..concept(Uuid::nil(), key)
        }
    }

    #[tokio::test]
    async fn global_insert_loses_to_earlier_commit() {
        let store = InMemoryStore::new();
        let mut slow = store.begin().await.unwrap();
        let mine = slow.insert_global_concept_if_absent(&global("limit")).await.unwrap();
        assert_eq!(mine.key, "limit");

        let mut fast = store.begin().await.unwrap();
        fast.insert_global_concept_if_absent(&global("limit")).await.unwrap();
        fast.commit().await.unwrap();

        let err = slow.commit().await.unwrap_err();
        assert!(is_unique_violation(&err));
        let globals = store.concepts_by_scope(ConceptScope::Global, None).await.unwrap();
        assert_eq!(globals.len(), 1);
    }

    #[tokio::test]
    async fn soft_deleted_global_is_restored_on_insert() {
        let store = InMemoryStore::new();
        let g = global("limit");
        let mut tx = store.begin().await.unwrap();
        tx.insert_global_concept_if_absent(&g).await.unwrap();
        tx.commit().await.unwrap();
        store.inner.write().unwrap().concepts.get_mut(&g.id).unwrap().deleted_at = Some(Utc::now());

        let mut tx = store.begin().await.unwrap();
        assert!(tx.find_global_concepts(&["limit".to_string()]).await.unwrap().is_empty());
        let again = Concept {
            id: Uuid::new_v4(),
            ..global("limit")
        };
        let stored = tx.insert_global_concept_if_absent(&again).await.unwrap();
        assert_eq!(stored.id, g.id);
        assert!(stored.deleted_at.is_none());
        tx.commit().await.unwrap();

        let globals = store.concepts_by_scope(ConceptScope::Global, None).await.unwrap();
        assert_eq!(globals.iter().map(|c| c.id).collect::<Vec<_>>(), vec![g.id]);
    }

    #[tokio::test]
    async fn injected_global_insert_failure_is_one_shot() {
        let store = InMemoryStore::new();
        store.fail_global_inserts(1);
        let mut tx = store.begin().await.unwrap();
        assert!(tx.insert_global_concept_if_absent(&global("limit")).await.is_err());
        assert!(tx.insert_global_concept_if_absent(&global("limit")).await.is_ok());
    }

    #[tokio::test]
    async fn saga_append_is_idempotent_and_ordered() {
        let store = InMemoryStore::new();
        let saga = Uuid::new_v4();
        let payload = serde_json::json!({"namespace": "ns", "ids": ["a"]});
        let mut tx = store.begin().await.unwrap();
        assert!(tx
            .append_saga_action(saga, SagaActionKind::PineconeDeleteIds, "k1", &payload)
            .await
            .unwrap());
        assert!(!tx
            .append_saga_action(saga, SagaActionKind::PineconeDeleteIds, "k1", &payload)
            .await
            .unwrap());
        tx.append_saga_action(saga, SagaActionKind::PineconeDeleteIds, "k2", &payload)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        let actions = store.saga_actions(saga).await.unwrap();
        assert_eq!(actions.iter().map(|a| a.seq).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn advisory_lock_serializes_transactions() {
        let store = InMemoryStore::new();
        let mut first = store.begin().await.unwrap();
        first.advisory_xact_lock(7).await.unwrap();

        let contender = store.clone();
        let handle = tokio::spawn(async move {
            let mut tx = contender.begin().await.unwrap();
            tx.advisory_xact_lock(7).await.unwrap();
            tx.commit().await.unwrap();
        });
        tokio::task::yield_now().await;
        assert_eq!(store.lock_acquisitions(7), 1);
        first.commit().await.unwrap();
        handle.await.unwrap();
        assert_eq!(store.lock_acquisitions(7), 2);
    }

    #[tokio::test]
    async fn lexical_search_matches_all_terms() {
        let store = InMemoryStore::new();
        let file = Uuid::new_v4();
        for (i, text) in ["Bayes theorem and priors", "Linear regression", "Bayes nets"].iter().enumerate() {
            store
                .insert_chunk(MaterialChunk {
                    id: Uuid::from_u128(i as u128 + 1),
                    material_file_id: file,
                    index: i as i32,
                    page: None,
                    text: text.to_string(),
                    embedding: Vec::new(),
                    metadata: ChunkMetadata::default(),
                    updated_at: Utc::now(),
                })
                .unwrap();
        }
        let hits = store.lexical_search_chunks(&[file], "bayes priors", 5).await.unwrap();
        assert_eq!(hits, vec![Uuid::from_u128(1)]);
    }

    #[tokio::test]
    async fn metadata_merge_ignores_unknown_keys() {
        let store = InMemoryStore::new();
        let path = store.ensure_path(Uuid::new_v4(), Uuid::new_v4()).await.unwrap();
        let mut patch = Map::new();
        patch.insert("intake_md".into(), Value::String("goal".into()));
        patch.insert("bogus".into(), Value::Bool(true));
        let updated = store.merge_path_metadata(path.id, &patch).await.unwrap();
        assert_eq!(updated.metadata["intake_md"], "goal");
        assert!(updated.metadata.get("bogus").is_none());
    }
}

