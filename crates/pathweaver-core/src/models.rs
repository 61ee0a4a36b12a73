//! Core data models shared by every stage.
//!
//! These types mirror the relational rows the stages read and write:
//! materials (sets, files, chunks, signatures), paths and their nodes,
//! the concept graph (concepts, evidence, edges), realized activities,
//! the artifact cache, and the saga log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A bundle of uploaded learning materials owned by one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialSet {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// One uploaded file inside a [`MaterialSet`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialFile {
    pub id: Uuid,
    pub material_set_id: Uuid,
    pub original_name: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub storage_key: String,
    /// `pending`, `uploaded`, `extracted` or `failed`.
    pub status: String,
    /// Extractor classification (`pdf_text`, `slides`, `code`, `ocr`, ...).
    pub extracted_kind: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub extracted_at: Option<DateTime<Utc>>,
}

/// Extractor metadata attached to a chunk.
///
/// Unknown keys are preserved in `extra` so that metadata refreshes
/// (formula enrichment) never drop fields written by other producers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub section_path: String,
    #[serde(default)]
    pub section_depth: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub formula_latex: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub formula_symbolic: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_json: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A contiguous passage of extracted text, the unit of retrieval and citation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialChunk {
    pub id: Uuid,
    pub material_file_id: Uuid,
    pub index: i32,
    pub page: Option<i32>,
    pub text: String,
    /// Empty until the embed stage fills it.
    #[serde(default)]
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: ChunkMetadata,
    pub updated_at: DateTime<Utc>,
}

impl MaterialChunk {
    /// Chunks the extractor flagged as non-textual (image-only pages, etc.).
    pub fn is_unextractable(&self) -> bool {
        matches!(
            self.metadata.kind.as_str(),
            "unextractable" | "image_only" | "image"
        ) || self
            .metadata
            .extra
            .get("unextractable")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Usable as inventory or coverage input.
    pub fn is_usable_text(&self) -> bool {
        !self.is_unextractable() && !self.text.trim().is_empty()
    }

    pub fn has_embedding(&self) -> bool {
        !self.embedding.is_empty()
    }
}

/// Self-reported extraction quality of a file signature.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignatureQuality {
    /// `high`, `medium` or `low`.
    #[serde(default)]
    pub text_quality: String,
    /// Fraction of the file the signature covers, in `[0, 1]`.
    #[serde(default)]
    pub coverage: f64,
}

/// Per-file summary of the concepts a file is known to contain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialFileSignature {
    pub material_file_id: Uuid,
    pub version: i32,
    pub fingerprint: String,
    #[serde(default)]
    pub concept_keys: Vec<String>,
    #[serde(default)]
    pub quality: SignatureQuality,
    pub updated_at: DateTime<Utc>,
}

/// Canonical learning path for an (owner, material set) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Path {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub material_set_id: Uuid,
    /// Additive JSON blob; see [`crate::path_meta`].
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Scope a concept row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConceptScope {
    Path,
    Global,
}

impl ConceptScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConceptScope::Path => "path",
            ConceptScope::Global => "global",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "path" => Some(ConceptScope::Path),
            "global" => Some(ConceptScope::Global),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConceptMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub importance: i32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub assumed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_from: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_rationale: Option<String>,
}

/// A node of the concept graph, either path-scoped or global.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concept {
    pub id: Uuid,
    pub scope: ConceptScope,
    pub scope_id: Option<Uuid>,
    pub parent_id: Option<Uuid>,
    pub key: String,
    pub name: String,
    pub summary: String,
    pub key_points: Vec<String>,
    pub depth: i32,
    pub sort_index: i32,
    pub vector_id: String,
    pub metadata: ConceptMetadata,
    pub canonical_concept_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Citation linking a concept to a source chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptEvidence {
    pub id: Uuid,
    pub concept_id: Uuid,
    pub material_chunk_id: Uuid,
    pub kind: String,
    pub weight: f64,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    Prereq,
    Related,
    Analogy,
    Composes,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::Prereq => "prereq",
            EdgeType::Related => "related",
            EdgeType::Analogy => "analogy",
            EdgeType::Composes => "composes",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prereq" | "prerequisite" => Some(EdgeType::Prereq),
            "related" => Some(EdgeType::Related),
            "analogy" => Some(EdgeType::Analogy),
            "composes" => Some(EdgeType::Composes),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeEvidence {
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub citations: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptEdge {
    pub id: Uuid,
    pub from_concept_id: Uuid,
    pub to_concept_id: Uuid,
    pub edge_type: EdgeType,
    pub strength: f64,
    pub evidence: EdgeEvidence,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Placeholder for an activity on a path node, identified by its rank.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivitySlot {
    pub slot: i32,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub estimated_minutes: i32,
    #[serde(default)]
    pub primary_concept_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub difficulty: String,
    #[serde(default)]
    pub concept_keys: Vec<String>,
    #[serde(default)]
    pub activity_slots: Vec<ActivitySlot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathNode {
    pub id: Uuid,
    pub path_id: Uuid,
    pub parent_node_id: Option<Uuid>,
    pub index: i32,
    pub title: String,
    pub metadata: NodeMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub path_id: Uuid,
    pub kind: String,
    pub title: String,
    pub estimated_minutes: i32,
    pub content_json: Value,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityVariant {
    pub id: Uuid,
    pub activity_id: Uuid,
    pub variant: String,
    pub content_json: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityConcept {
    pub activity_id: Uuid,
    pub concept_id: Uuid,
    pub role: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityCitation {
    pub activity_variant_id: Uuid,
    pub material_chunk_id: Uuid,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathNodeActivity {
    pub path_node_id: Uuid,
    pub activity_id: Uuid,
    pub rank: i32,
    pub is_primary: bool,
}

/// Everything realize-activities writes for one slot, committed together.
#[derive(Debug, Clone)]
pub struct ActivityBundle {
    pub activity: Activity,
    pub variant: ActivityVariant,
    pub concepts: Vec<ActivityConcept>,
    pub citations: Vec<ActivityCitation>,
    pub node_activity: PathNodeActivity,
}

/// Cached stage output keyed by `(owner, set, path, artifact_type)`.
///
/// `path_id` is the nil UUID for set-level artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningArtifact {
    pub owner_user_id: Uuid,
    pub material_set_id: Uuid,
    pub path_id: Uuid,
    pub artifact_type: String,
    pub input_hash: String,
    pub version: i32,
    pub metadata: Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaActionKind {
    PineconeDeleteIds,
    ObjectStoreDeleteKey,
}

impl SagaActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaActionKind::PineconeDeleteIds => "pinecone_delete_ids",
            SagaActionKind::ObjectStoreDeleteKey => "object_store_delete_key",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pinecone_delete_ids" => Some(SagaActionKind::PineconeDeleteIds),
            "object_store_delete_key" => Some(SagaActionKind::ObjectStoreDeleteKey),
            _ => None,
        }
    }
}

/// Deferred compensating operation recorded alongside a canonical write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaAction {
    pub id: Uuid,
    pub saga_id: Uuid,
    pub seq: i64,
    pub kind: SagaActionKind,
    /// Stable key derived from the payload; appends are idempotent on it.
    pub action_key: String,
    pub payload: Value,
    /// `pending`, `done` or `failed`.
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Record of a structural decision and the model/taxonomy versions behind it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuralDecisionTrace {
    pub id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub owner_user_id: Uuid,
    pub path_id: Uuid,
    pub decision_type: String,
    pub graph_version: String,
    pub embedding_version: String,
    pub taxonomy_version: String,
    pub clustering_version: String,
    pub calibration_version: String,
    pub inputs: Value,
}
