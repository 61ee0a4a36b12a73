//! Embedding codec and vector utilities.
//!
//! Chunk and concept embeddings are persisted as JSON arrays of floats.
//! The helpers here encode/decode that representation and implement the
//! local similarity math used when the vector store is unavailable.

use anyhow::{Context, Result};
use uuid::Uuid;

/// Encode a vector as a compact JSON array (`[]` for empty).
///
/// ```rust
/// use pathweaver_core::embedding::{decode_embedding_json, encode_embedding_json};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let json = encode_embedding_json(&v);
/// assert_eq!(decode_embedding_json(&json).unwrap(), v);
/// ```
pub fn encode_embedding_json(vec: &[f32]) -> String {
    serde_json::to_string(vec).unwrap_or_else(|_| "[]".to_string())
}

/// Decode a JSON float array; blank input decodes to an empty vector.
pub fn decode_embedding_json(raw: &str) -> Result<Vec<f32>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    serde_json::from_str::<Vec<f32>>(trimmed).context("invalid embedding JSON")
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors
/// of different lengths, or zero-norm vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Element-wise mean of equally sized vectors. `None` when empty or ragged.
pub fn mean_vector(vectors: &[&[f32]]) -> Option<Vec<f32>> {
    let first = vectors.first()?;
    let dims = first.len();
    if dims == 0 || vectors.iter().any(|v| v.len() != dims) {
        return None;
    }
    let mut acc = vec![0.0f32; dims];
    for v in vectors {
        for (slot, x) in acc.iter_mut().zip(v.iter()) {
            *slot += x;
        }
    }
    let n = vectors.len() as f32;
    for slot in acc.iter_mut() {
        *slot /= n;
    }
    Some(acc)
}

/// Rank candidates by cosine against `query`, best first.
///
/// Ties are broken by ID so the ordering is stable across runs. Candidates
/// with empty or mismatched vectors are skipped.
pub fn top_k_by_cosine(query: &[f32], candidates: &[(Uuid, &[f32])], k: usize) -> Vec<(Uuid, f32)> {
    if query.is_empty() || k == 0 {
        return Vec::new();
    }
    let mut scored: Vec<(Uuid, f32)> = candidates
        .iter()
        .filter(|(_, v)| v.len() == query.len())
        .map(|(id, v)| (*id, cosine_similarity(query, v)))
        .collect();
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    scored.truncate(k);
    scored
}
