#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use pathweaver::llm::{LlmClient, LlmError};
use pathweaver::mirror::{GraphMirror, RecordingMirror};
use pathweaver::stages::{StageContext, StageDeps, StageInput, StageSettings};
use pathweaver::store::memory::InMemoryStore;
use pathweaver::store::Store;
use pathweaver::vectors::{MemoryVectorStore, VectorStore};
use pathweaver_core::models::{
    ActivitySlot, ChunkMetadata, MaterialChunk, MaterialFile, MaterialSet, NodeMetadata, PathNode,
};

pub const DIMS: usize = 8;

pub const CONCEPT_KEYS: [&str; 6] = [
    "limit",
    "continuity",
    "derivative",
    "rate_of_change",
    "tangent_line",
    "chain_rule",
];

/// `n` filler words.
pub fn words(n: usize) -> String {
    (0..n).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ")
}

/// A 325-word drill: 25 words short of the drill minimum, otherwise valid.
pub fn short_drill() -> Value {
    json!({
        "title": "Derivative drill",
        "estimated_minutes": 10,
        "content_json": {
            "blocks": [
                {"type": "heading", "level": 1, "text": "Derivative drill practice"},
                {"type": "paragraph", "text": words(150)},
                {"type": "paragraph", "text": words(150)},
                {"type": "callout", "variant": "tip", "title": "Tip", "text": words(21)},
            ]
        },
        "citations": [],
        "concept_keys": ["limit"],
    })
}

/// Chunk IDs quoted in a prompt as `chunk_id=<uuid>`.
pub fn prompt_chunk_ids(user: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for part in user.split("chunk_id=").skip(1) {
        let candidate: String = part.chars().take(36).collect();
        if Uuid::parse_str(&candidate).is_ok() && !out.contains(&candidate) {
            out.push(candidate);
        }
    }
    out
}

fn embedding_for(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    for (i, b) in text.bytes().enumerate() {
        v[i % DIMS] += b as f32 / 255.0;
    }
    v[0] += 1.0;
    v
}

// ═══════════════════════════════════════════════════════════════════════
// Scripted LLM
// ═══════════════════════════════════════════════════════════════════════

/// How `embed` misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedFault {
    None,
    /// One vector fewer than requested.
    DropLast,
    /// The first vector is empty.
    EmptyFirst,
}

/// Answers every prompt by schema name with canned, citation-valid JSON.
pub struct ScriptedLlm {
    calls: Mutex<HashMap<String, usize>>,
    delta_concepts: Mutex<Vec<String>>,
    activity: Mutex<Value>,
    embed_fault: Mutex<EmbedFault>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            delta_concepts: Mutex::new(Vec::new()),
            activity: Mutex::new(short_drill()),
            embed_fault: Mutex::new(EmbedFault::None),
        }
    }

    pub fn set_embed_fault(&self, fault: EmbedFault) {
        *self.embed_fault.lock().unwrap() = fault;
    }

    /// Keys the delta prompt proposes from now on.
    pub fn propose_in_delta(&self, keys: &[&str]) {
        *self.delta_concepts.lock().unwrap() = keys.iter().map(|k| k.to_string()).collect();
    }

    pub fn set_activity(&self, draft: Value) {
        *self.activity.lock().unwrap() = draft;
    }

    pub fn calls(&self, schema: &str) -> usize {
        self.calls.lock().unwrap().get(schema).copied().unwrap_or(0)
    }

    fn concept(key: &str, citations: &[String]) -> Value {
        let required_by: Vec<&str> = if key == "limit" { vec!["derivative"] } else { vec![] };
        json!({
            "key": key,
            "name": key.replace('_', " "),
            "summary": format!("What {} means and when it applies.", key.replace('_', " ")),
            "key_points": [format!("{} in one sentence", key)],
            "importance": CONCEPT_KEYS.len() - CONCEPT_KEYS.iter().position(|k| *k == key).unwrap_or(0),
            "citations": citations,
            "required_by": required_by,
        })
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn generate_json(&self, _system: &str, user: &str, schema_name: &str, _schema: &Value) -> Result<Value, LlmError> {
        *self.calls.lock().unwrap().entry(schema_name.to_string()).or_default() += 1;
        let ids = prompt_chunk_ids(user);
        let cite: Vec<String> = ids.iter().take(2).cloned().collect();
        match schema_name {
            "concept_inventory" => Ok(json!({
                "concepts": CONCEPT_KEYS.iter().map(|k| Self::concept(k, &cite)).collect::<Vec<_>>(),
                "coverage": {"confidence": 0.9, "missing_topics": []},
            })),
            "concept_inventory_delta" => {
                let keys = self.delta_concepts.lock().unwrap().clone();
                let new: Vec<Value> = if cite.is_empty() {
                    Vec::new()
                } else {
                    keys.iter().map(|k| Self::concept(k, &cite)).collect()
                };
                Ok(json!({"new_concepts": new, "missing_topics": [], "confidence": 0.95}))
            }
            "assumed_knowledge" => Ok(json!({"concepts": []})),
            "concept_alignment" => Ok(json!({"aliases": [], "splits": []})),
            "concept_edges" => Ok(json!({
                "edges": [{
                    "from_key": "derivative",
                    "to_key": "chain_rule",
                    "edge_type": "prereq",
                    "strength": 0.8,
                    "rationale": "the chain rule differentiates compositions",
                    "citations": cite,
                }]
            })),
            "formula_extraction" => Ok(json!({"formulas": []})),
            "activity_content" => {
                let mut draft = self.activity.lock().unwrap().clone();
                if let Some(first) = ids.first() {
                    draft["citations"] = json!([first]);
                }
                Ok(draft)
            }
            other => Err(LlmError::RequestFailed(format!("unscripted schema {}", other))),
        }
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        *self.calls.lock().unwrap().entry("embed".to_string()).or_default() += 1;
        let mut vectors: Vec<Vec<f32>> = texts.iter().map(|t| embedding_for(t)).collect();
        match *self.embed_fault.lock().unwrap() {
            EmbedFault::None => {}
            EmbedFault::DropLast => {
                vectors.pop();
            }
            EmbedFault::EmptyFirst => {
                if let Some(first) = vectors.first_mut() {
                    first.clear();
                }
            }
        }
        Ok(vectors)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Fixture
// ═══════════════════════════════════════════════════════════════════════

/// A confirmed path over two files of calculus notes.
pub struct Fixture {
    pub store: Arc<InMemoryStore>,
    pub vectors: Arc<MemoryVectorStore>,
    pub mirror: Arc<RecordingMirror>,
    pub llm: Arc<ScriptedLlm>,
    pub owner: Uuid,
    pub set: Uuid,
    pub path_id: Uuid,
    pub chunk_ids: Vec<Uuid>,
}

const CHUNKS_PER_FILE: i32 = 6;

fn chunk_text(file: usize, i: i32) -> String {
    let topic = CONCEPT_KEYS[(file * 3 + i as usize) % CONCEPT_KEYS.len()].replace('_', " ");
    format!(
        "Notes part {} section {} on the {}. The derivative describes the rate of change of a function \
         and is defined through the limit of difference quotients. A continuous function has no jumps, \
         and the tangent line at a point has slope equal to the derivative there.",
        file + 1,
        i + 1,
        topic
    )
}

impl Fixture {
    pub async fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let (owner, set) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();
        store
            .insert_material_set(MaterialSet {
                id: set,
                owner_user_id: owner,
                status: "ready".into(),
                created_at: now,
            })
            .unwrap();

        let mut chunk_ids = Vec::new();
        for f in 0..2usize {
            let file_id = Uuid::new_v4();
            store
                .insert_file(MaterialFile {
                    id: file_id,
                    material_set_id: set,
                    original_name: format!("calculus-{}.pdf", f + 1),
                    mime_type: "application/pdf".into(),
                    size_bytes: 4096,
                    storage_key: format!("materials/{}/{}", set, file_id),
                    status: "extracted".into(),
                    extracted_kind: "pdf_text".into(),
                    created_at: now + chrono::Duration::seconds(f as i64),
                    updated_at: now,
                    extracted_at: Some(now),
                })
                .unwrap();
            for i in 0..CHUNKS_PER_FILE {
                let id = Uuid::new_v4();
                store
                    .insert_chunk(MaterialChunk {
                        id,
                        material_file_id: file_id,
                        index: i,
                        page: Some(i + 1),
                        text: chunk_text(f, i),
                        embedding: Vec::new(),
                        metadata: ChunkMetadata::default(),
                        updated_at: now,
                    })
                    .unwrap();
                chunk_ids.push(id);
            }
        }

        let path = store.ensure_path(owner, set).await.unwrap();
        let mut patch = Map::new();
        patch.insert("intake".into(), json!({"paths_confirmed": true}));
        patch.insert("intake_md".into(), json!("Learn differential calculus from my lecture notes."));
        store.merge_path_metadata(path.id, &patch).await.unwrap();

        Self {
            store,
            vectors: Arc::new(MemoryVectorStore::new()),
            mirror: Arc::new(RecordingMirror::new()),
            llm: Arc::new(ScriptedLlm::new()),
            owner,
            set,
            path_id: path.id,
            chunk_ids,
        }
    }

    pub fn settings() -> StageSettings {
        let mut settings = StageSettings::default();
        settings.cache.enabled = true;
        settings
    }

    pub fn deps_with(&self, settings: StageSettings) -> StageDeps {
        StageDeps {
            store: Some(self.store.clone() as Arc<dyn Store>),
            llm: Some(self.llm.clone() as Arc<dyn LlmClient>),
            vectors: Some(self.vectors.clone() as Arc<dyn VectorStore>),
            mirror: Some(self.mirror.clone() as Arc<dyn GraphMirror>),
            objects: None,
            settings,
        }
    }

    pub fn deps(&self) -> StageDeps {
        self.deps_with(Self::settings())
    }

    pub fn input(&self, saga_id: Uuid) -> StageInput {
        StageInput {
            owner_user_id: self.owner,
            material_set_id: self.set,
            saga_id,
            path_id: Some(self.path_id),
        }
    }

    pub fn ctx() -> StageContext {
        StageContext {
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    pub fn add_node(&self, index: i32, title: &str, goal: &str, slots: Vec<ActivitySlot>) -> Uuid {
        let id = Uuid::new_v4();
        self.store
            .insert_path_node(PathNode {
                id,
                path_id: self.path_id,
                parent_node_id: None,
                index,
                title: title.to_string(),
                metadata: NodeMetadata {
                    goal: goal.to_string(),
                    difficulty: "intro".into(),
                    concept_keys: Vec::new(),
                    activity_slots: slots,
                },
            })
            .unwrap();
        id
    }
}

pub fn slot(slot: i32, kind: &str, keys: &[&str]) -> ActivitySlot {
    ActivitySlot {
        slot,
        kind: kind.to_string(),
        estimated_minutes: 10,
        primary_concept_keys: keys.iter().map(|k| k.to_string()).collect(),
    }
}
