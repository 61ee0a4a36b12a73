//! Cross-document section graph for the global inventory pass.
//!
//! Chunks are grouped by `(file, section_path)`. A section's vector is the
//! mean of its chunk embeddings when at least three are available,
//! otherwise the embedding of a short section summary. Sections in
//! different files are linked when their cosine similarity reaches the
//! threshold, keeping the `top_k` best links per section.

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use pathweaver_core::embedding::{cosine_similarity, mean_vector};
use pathweaver_core::models::MaterialChunk;
use pathweaver_core::text::shorten;

use crate::llm::{embed_logged, LlmClient};

pub const DEFAULT_THRESHOLD: f32 = 0.78;
pub const DEFAULT_TOP_K: usize = 3;
const MIN_CHUNKS_FOR_MEAN: usize = 3;
const SUMMARY_CHARS: usize = 600;

#[derive(Debug, Clone, Serialize)]
pub struct SectionNode {
    pub id: String,
    pub file_id: Uuid,
    pub section_path: String,
    pub chunk_count: usize,
    #[serde(skip)]
    summary: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SectionEdge {
    pub from: String,
    pub to: String,
    pub score: f32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SectionGraph {
    pub sections: Vec<SectionNode>,
    pub edges: Vec<SectionEdge>,
}

impl SectionGraph {
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Build the section graph. `llm` embeds summaries of sections with too
/// few embedded chunks; without it those sections are left out.
pub async fn build_section_graph(
    chunks: &[MaterialChunk],
    llm: Option<&dyn LlmClient>,
    stage: &str,
    threshold: f32,
    top_k: usize,
) -> Result<SectionGraph> {
    let mut groups: BTreeMap<(Uuid, String), Vec<&MaterialChunk>> = BTreeMap::new();
    for c in chunks.iter().filter(|c| c.is_usable_text()) {
        let path = c.metadata.section_path.trim();
        if path.is_empty() {
            continue;
        }
        groups.entry((c.material_file_id, path.to_string())).or_default().push(c);
    }

    let mut nodes = Vec::with_capacity(groups.len());
    let mut vectors: Vec<Option<Vec<f32>>> = Vec::with_capacity(groups.len());
    let mut need_summary = Vec::new();
    for ((file_id, path), list) in &groups {
        let embedded: Vec<&[f32]> = list
            .iter()
            .filter(|c| c.has_embedding())
            .map(|c| c.embedding.as_slice())
            .collect();
        let summary = shorten(
            &format!(
                "{}\n{}",
                path,
                list.iter().map(|c| c.text.as_str()).collect::<Vec<_>>().join(" ")
            ),
            SUMMARY_CHARS,
        );
        let vector = if embedded.len() >= MIN_CHUNKS_FOR_MEAN {
            mean_vector(&embedded)
        } else {
            need_summary.push(nodes.len());
            None
        };
        nodes.push(SectionNode {
            id: format!("{}#{}", file_id, path),
            file_id: *file_id,
            section_path: path.clone(),
            chunk_count: list.len(),
            summary,
        });
        vectors.push(vector);
    }

    if let (Some(llm), false) = (llm, need_summary.is_empty()) {
        let texts: Vec<String> = need_summary.iter().map(|&i| nodes[i].summary.clone()).collect();
        match embed_logged(llm, stage, "section_summaries", &texts).await {
            Ok(embedded) => {
                for (slot, v) in need_summary.iter().zip(embedded) {
                    vectors[*slot] = Some(v);
                }
            }
            Err(e) => tracing::warn!(error = %e, "section summary embedding failed; skipping those sections"),
        }
    }

    Ok(SectionGraph {
        edges: link_sections(&nodes, &vectors, threshold, top_k),
        sections: nodes,
    })
}

fn link_sections(nodes: &[SectionNode], vectors: &[Option<Vec<f32>>], threshold: f32, top_k: usize) -> Vec<SectionEdge> {
    let mut edges = Vec::new();
    for (i, a) in nodes.iter().enumerate() {
        let Some(va) = &vectors[i] else {
            continue;
        };
        let mut candidates: Vec<(usize, f32)> = nodes
            .iter()
            .enumerate()
            .filter(|(j, b)| *j != i && b.file_id != a.file_id)
            .filter_map(|(j, _)| vectors[j].as_ref().map(|vb| (j, cosine_similarity(va, vb))))
            .filter(|(_, s)| *s >= threshold)
            .collect();
        candidates.sort_by(|x, y| y.1.partial_cmp(&x.1).unwrap_or(std::cmp::Ordering::Equal).then(x.0.cmp(&y.0)));
        for (j, score) in candidates.into_iter().take(top_k) {
            // Undirected: keep one copy per pair.
            let (from, to) = if a.id < nodes[j].id {
                (a.id.clone(), nodes[j].id.clone())
            } else {
                (nodes[j].id.clone(), a.id.clone())
            };
            if !edges.iter().any(|e: &SectionEdge| e.from == from && e.to == to) {
                edges.push(SectionEdge { from, to, score });
            }
        }
    }
    edges.sort_by(|x, y| x.from.cmp(&y.from).then(x.to.cmp(&y.to)));
    edges
}
