//! Deterministic input fingerprints for the artifact cache.
//!
//! A stage's cache key is the SHA-256 of a canonical JSON document
//! describing everything the stage reads: file, chunk and signature
//! fingerprints, the file allowlist, the learner's intent, the run mode,
//! and the tunable environment. Lists are sorted and object keys ordered
//! so permuting inputs never changes the hash.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::keys::sha256_hex;
use crate::models::{MaterialChunk, MaterialFile, MaterialFileSignature};
use crate::text::collapse_whitespace;

/// Substrings that mark an environment variable as sensitive.
pub const SENSITIVE_ENV_MARKERS: [&str; 4] = ["KEY", "SECRET", "TOKEN", "PASSWORD"];

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct FileFingerprint {
    pub id: Uuid,
    pub updated_at: String,
    pub extracted_at: Option<String>,
    pub size_bytes: i64,
    pub mime: String,
    pub storage_key: String,
    pub extracted_kind: String,
    pub status: String,
}

impl From<&MaterialFile> for FileFingerprint {
    fn from(f: &MaterialFile) -> Self {
        Self {
            id: f.id,
            updated_at: ts(&f.updated_at),
            extracted_at: f.extracted_at.as_ref().map(ts),
            size_bytes: f.size_bytes,
            mime: f.mime_type.clone(),
            storage_key: f.storage_key.clone(),
            extracted_kind: f.extracted_kind.clone(),
            status: f.status.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ChunkFingerprint {
    pub id: Uuid,
    pub file_id: Uuid,
    pub updated_at: String,
    pub index: i32,
    pub page: Option<i32>,
    pub kind: String,
    pub provider: String,
}

impl From<&MaterialChunk> for ChunkFingerprint {
    fn from(c: &MaterialChunk) -> Self {
        Self {
            id: c.id,
            file_id: c.material_file_id,
            updated_at: ts(&c.updated_at),
            index: c.index,
            page: c.page,
            kind: c.metadata.kind.clone(),
            provider: c.metadata.provider.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct SignatureFingerprint {
    pub file_id: Uuid,
    pub updated_at: String,
    pub version: i32,
    pub fingerprint: String,
}

impl From<&MaterialFileSignature> for SignatureFingerprint {
    fn from(s: &MaterialFileSignature) -> Self {
        Self {
            file_id: s.material_file_id,
            updated_at: ts(&s.updated_at),
            version: s.version,
            fingerprint: s.fingerprint.clone(),
        }
    }
}

/// Everything that feeds an artifact input hash.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ArtifactInputs {
    pub files: Vec<FileFingerprint>,
    pub chunks: Vec<ChunkFingerprint>,
    pub signatures: Vec<SignatureFingerprint>,
    pub allow_files: Vec<Uuid>,
    pub intent_md: String,
    pub mode: String,
    pub env: BTreeMap<String, String>,
}

impl ArtifactInputs {
    pub fn new(files: &[MaterialFile], chunks: &[MaterialChunk], signatures: &[MaterialFileSignature]) -> Self {
        Self {
            files: files.iter().map(FileFingerprint::from).collect(),
            chunks: chunks.iter().map(ChunkFingerprint::from).collect(),
            signatures: signatures.iter().map(SignatureFingerprint::from).collect(),
            ..Default::default()
        }
    }

    pub fn allow_files(mut self, ids: &[Uuid]) -> Self {
        self.allow_files = ids.to_vec();
        self
    }

    pub fn intent(mut self, intent_md: &str) -> Self {
        self.intent_md = intent_md.to_string();
        self
    }

    pub fn mode(mut self, mode: &str) -> Self {
        self.mode = mode.to_string();
        self
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    fn sorted(&self) -> Self {
        let mut s = self.clone();
        s.files.sort();
        s.files.dedup();
        s.chunks.sort();
        s.chunks.dedup();
        s.signatures.sort();
        s.signatures.dedup();
        s.allow_files.sort();
        s.allow_files.dedup();
        s
    }
}

/// SHA-256 hex of the canonical JSON form of `inputs`.
pub fn compute_input_hash(inputs: &ArtifactInputs) -> String {
    let value = serde_json::to_value(inputs.sorted()).unwrap_or(Value::Null);
    sha256_hex(canonical_json(&value).as_bytes())
}

/// Serialize with lexicographically sorted object keys, no insignificant
/// whitespace, and whitespace-collapsed string values.
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&canonicalize(value)).unwrap_or_default()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for k in keys {
                out.insert(k.clone(), canonicalize(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::String(s) => Value::String(collapse_whitespace(s)),
        other => other.clone(),
    }
}

pub fn is_sensitive_env_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    SENSITIVE_ENV_MARKERS.iter().any(|m| upper.contains(m))
}

/// Keep variables matching one of `prefixes`, minus sensitive ones.
pub fn filter_env<I>(vars: I, prefixes: &[String]) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter(|(k, _)| prefixes.iter().any(|p| k.starts_with(p.as_str())))
        .filter(|(k, _)| !is_sensitive_env_key(k))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;
    use serde_json::json;

    fn file(name: &str) -> MaterialFile {
        let now = Utc::now();
        MaterialFile {
            id: Uuid::new_v4(),
            material_set_id: Uuid::nil(),
            original_name: name.into(),
            mime_type: "application/pdf".into(),
            size_bytes: 10,
            storage_key: format!("k/{}", name),
            status: "extracted".into(),
            extracted_kind: "pdf_text".into(),
            created_at: now,
            updated_at: now,
            extracted_at: Some(now),
        }
    }

    fn chunk(file_id: Uuid, index: i32) -> MaterialChunk {
        MaterialChunk {
            id: Uuid::new_v4(),
            material_file_id: file_id,
            index,
            page: Some(index),
            text: "t".into(),
            embedding: vec![],
            metadata: ChunkMetadata::default(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_hash_is_permutation_invariant() {
        let files = vec![file("a"), file("b"), file("c")];
        let chunks: Vec<MaterialChunk> = files.iter().flat_map(|f| (0..3).map(move |i| chunk(f.id, i))).collect();
        let base = compute_input_hash(&ArtifactInputs::new(&files, &chunks, &[]).intent("learn"));

        let mut rf = files.clone();
        rf.reverse();
        let mut rc = chunks.clone();
        rc.reverse();
        rc.swap(0, 4);
        assert_eq!(compute_input_hash(&ArtifactInputs::new(&rf, &rc, &[]).intent("learn")), base);
        assert_ne!(compute_input_hash(&ArtifactInputs::new(&rf, &rc, &[]).intent("other")), base);
    }

    #[test]
    fn test_hash_changes_with_chunk_update() {
        let files = vec![file("a")];
        let mut chunks = vec![chunk(files[0].id, 0)];
        let before = compute_input_hash(&ArtifactInputs::new(&files, &chunks, &[]));
        chunks[0].updated_at += chrono::Duration::nanoseconds(1);
        assert_ne!(compute_input_hash(&ArtifactInputs::new(&files, &chunks, &[])), before);
    }

    #[test]
    fn test_canonical_json_sorts_and_normalizes() {
        let a = json!({"b": 1, "a": {"y": "x  y", "x": [2, 1]}});
        let b = json!({"a": {"x": [2, 1], "y": " x y\n"}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"x":[2,1],"y":"x y"},"b":1}"#);
    }

    #[test]
    fn test_filter_env_drops_sensitive() {
        let vars = vec![
            ("CONCEPT_GRAPH_MAX".to_string(), "5".to_string()),
            ("CONCEPT_GRAPH_API_KEY".to_string(), "x".to_string()),
            ("COVERAGE_TOKEN_LIMIT".to_string(), "x".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ];
        let out = filter_env(vars, &["CONCEPT_GRAPH_".to_string(), "COVERAGE_".to_string()]);
        assert_eq!(out.len(), 1);
        assert_eq!(out["CONCEPT_GRAPH_MAX"], "5");
    }
}
