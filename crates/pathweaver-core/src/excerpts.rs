//! Stratified chunk excerpts for prompts.
//!
//! Chunks are grouped by file, ordered by chunk index, and sampled evenly
//! so that every part of every file is represented. Each rendered line
//! carries the chunk ID so the model can cite it back.

use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::models::MaterialChunk;
use crate::text::shorten;

/// Size caps for one excerpt corpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExcerptLimits {
    pub per_file: usize,
    pub max_chars: usize,
    pub max_lines_per_file: usize,
    pub max_total: usize,
}

impl ExcerptLimits {
    /// Same limits with the global budget halved, never below `floor`.
    pub fn halved(&self, floor: usize) -> Self {
        Self {
            max_total: (self.max_total / 2).max(floor),
            ..*self
        }
    }
}

/// Rendered excerpt text plus the chunk IDs that made it in, in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Excerpts {
    pub text: String,
    pub chunk_ids: Vec<Uuid>,
}

impl Excerpts {
    pub fn is_empty(&self) -> bool {
        self.chunk_ids.is_empty()
    }

    fn push_line(&mut self, id: Uuid, line: &str, max_total: usize) -> bool {
        let extra = if self.text.is_empty() { line.len() } else { line.len() + 1 };
        if self.text.len() + extra > max_total {
            return false;
        }
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        self.text.push_str(line);
        self.chunk_ids.push(id);
        true
    }
}

/// Render one chunk as a citable excerpt line.
///
/// Format: `[chunk_id=<id>] [section=<path>] <text> [formulas=..] [table=..]`,
/// with the optional parts present only when the chunk carries them.
pub fn format_chunk_line(chunk: &MaterialChunk, max_chars: usize) -> String {
    let mut line = format!("[chunk_id={}]", chunk.id);
    let section = chunk.metadata.section_path.trim();
    if !section.is_empty() {
        line.push_str(&format!(" [section={}]", shorten(section, 120)));
    }
    line.push(' ');
    line.push_str(&shorten(&chunk.text, max_chars));

    let formulas: Vec<&str> = chunk
        .metadata
        .formula_latex
        .iter()
        .chain(chunk.metadata.formula_symbolic.iter())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    if !formulas.is_empty() {
        line.push_str(&format!(" [formulas={}]", shorten(&formulas.join("; "), 300)));
    }
    if let Some(table) = &chunk.metadata.table_json {
        if !table.is_null() {
            let raw = serde_json::to_string(table).unwrap_or_default();
            line.push_str(&format!(" [table={}]", shorten(&raw, 400)));
        }
    }
    line
}

/// Pick `n` items spread evenly across `items`, keeping order.
pub fn evenly_spaced<T>(items: &[T], n: usize) -> Vec<&T> {
    if n == 0 || items.is_empty() {
        return Vec::new();
    }
    if n >= items.len() {
        return items.iter().collect();
    }
    let len = items.len();
    (0..n).map(|i| &items[i * len / n]).collect()
}

/// Group usable chunks by file (files in ID order, chunks by index).
pub fn group_by_file<'a>(chunks: &'a [MaterialChunk]) -> BTreeMap<Uuid, Vec<&'a MaterialChunk>> {
    let mut by_file: BTreeMap<Uuid, Vec<&MaterialChunk>> = BTreeMap::new();
    for c in chunks.iter().filter(|c| c.is_usable_text()) {
        by_file.entry(c.material_file_id).or_default().push(c);
    }
    for list in by_file.values_mut() {
        list.sort_by(|a, b| a.index.cmp(&b.index).then(a.id.cmp(&b.id)));
    }
    by_file
}

/// Build stratified excerpts across all files.
pub fn stratified_excerpts(chunks: &[MaterialChunk], limits: &ExcerptLimits) -> Excerpts {
    let by_file = group_by_file(chunks);
    let mut out = Excerpts::default();
    let per_file = limits.per_file.min(limits.max_lines_per_file.max(1));
    'files: for list in by_file.values() {
        for chunk in evenly_spaced(list, per_file) {
            let line = format_chunk_line(chunk, limits.max_chars);
            if !out.push_line(chunk.id, &line, limits.max_total) {
                break 'files;
            }
        }
    }
    out
}

/// Stratified chunk IDs without rendering, used as a retrieval fallback.
pub fn stratified_chunk_ids(chunks: &[MaterialChunk], per_file: usize) -> Vec<Uuid> {
    group_by_file(chunks)
        .values()
        .flat_map(|list| evenly_spaced(list, per_file).into_iter().map(|c| c.id))
        .collect()
}

/// Render excerpts for `ids` in the given order.
///
/// Unknown and unusable IDs are skipped; at most `max_lines_per_file` lines
/// are taken from any one file.
pub fn excerpts_for_ids(
    by_id: &HashMap<Uuid, &MaterialChunk>,
    ids: &[Uuid],
    limits: &ExcerptLimits,
) -> Excerpts {
    let mut out = Excerpts::default();
    let mut per_file: HashMap<Uuid, usize> = HashMap::new();
    for id in ids {
        let chunk = match by_id.get(id) {
            Some(c) if c.is_usable_text() => *c,
            _ => continue,
        };
        if out.chunk_ids.contains(id) {
            continue;
        }
        let used = per_file.entry(chunk.material_file_id).or_insert(0);
        if *used >= limits.max_lines_per_file.max(1) {
            continue;
        }
        let line = format_chunk_line(chunk, limits.max_chars);
        if !out.push_line(chunk.id, &line, limits.max_total) {
            break;
        }
        *used += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;
    use chrono::Utc;
    use serde_json::json;

    fn chunk(file: Uuid, index: i32, text: &str) -> MaterialChunk {
        MaterialChunk {
            id: Uuid::new_v4(),
            material_file_id: file,
            index,
            page: None,
            text: text.to_string(),
            embedding: Vec::new(),
            metadata: ChunkMetadata::default(),
            updated_at: Utc::now(),
        }
    }

    fn limits(per_file: usize, max_total: usize) -> ExcerptLimits {
        ExcerptLimits {
            per_file,
            max_chars: 200,
            max_lines_per_file: per_file,
            max_total,
        }
    }

    #[test]
    fn test_evenly_spaced() {
        let items: Vec<i32> = (0..10).collect();
        assert_eq!(evenly_spaced(&items, 3), vec![&0, &3, &6]);
        assert_eq!(evenly_spaced(&items, 20).len(), 10);
        assert!(evenly_spaced(&items, 0).is_empty());
    }

    #[test]
    fn test_stratified_covers_every_file() {
        let f1 = Uuid::new_v4();
        let f2 = Uuid::new_v4();
        let mut chunks: Vec<MaterialChunk> = (0..20).map(|i| chunk(f1, i, "alpha text")).collect();
        chunks.extend((0..20).map(|i| chunk(f2, i, "beta text")));
        let ex = stratified_excerpts(&chunks, &limits(4, 100_000));
        assert_eq!(ex.chunk_ids.len(), 8);
        assert!(ex.text.contains("alpha"));
        assert!(ex.text.contains("beta"));
        assert!(ex.text.lines().all(|l| l.starts_with("[chunk_id=")));
    }

    #[test]
    fn test_stratified_respects_total_and_skips_unusable() {
        let f = Uuid::new_v4();
        let mut chunks: Vec<MaterialChunk> = (0..10).map(|i| chunk(f, i, &"word ".repeat(30))).collect();
        chunks[0].metadata.kind = "image_only".to_string();
        let ex = stratified_excerpts(&chunks, &limits(10, 400));
        assert!(ex.text.len() <= 400);
        assert!(!ex.chunk_ids.contains(&chunks[0].id));
        assert!(!ex.is_empty());
    }

    #[test]
    fn test_format_line_includes_metadata() {
        let mut c = chunk(Uuid::new_v4(), 0, "Bayes rule relates conditionals.");
        c.metadata.section_path = "Ch 2 > Bayes".to_string();
        c.metadata.formula_latex = vec!["P(A|B) = P(B|A)P(A)/P(B)".to_string()];
        c.metadata.table_json = Some(json!([["a", "b"]]));
        let line = format_chunk_line(&c, 200);
        assert!(line.contains("[section=Ch 2 > Bayes]"));
        assert!(line.contains("[formulas=P(A|B)"));
        assert!(line.contains("[table=[[\"a\",\"b\"]]]"));
    }

    #[test]
    fn test_excerpts_for_ids_keeps_order_and_per_file_cap() {
        let f = Uuid::new_v4();
        let chunks: Vec<MaterialChunk> = (0..5).map(|i| chunk(f, i, "text")).collect();
        let by_id: HashMap<Uuid, &MaterialChunk> = chunks.iter().map(|c| (c.id, c)).collect();
        let ids = vec![chunks[3].id, chunks[1].id, Uuid::new_v4(), chunks[3].id, chunks[0].id];
        let ex = excerpts_for_ids(&by_id, &ids, &limits(2, 10_000));
        assert_eq!(ex.chunk_ids, vec![chunks[3].id, chunks[1].id]);
    }

    #[test]
    fn test_halved_floor() {
        let l = limits(4, 20_000);
        assert_eq!(l.halved(12_000).max_total, 12_000);
        assert_eq!(limits(4, 40_000).halved(12_000).max_total, 20_000);
    }
}
