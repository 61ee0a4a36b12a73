//! Formula candidate scanning for chunk enrichment.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use uuid::Uuid;

use crate::keys::dedupe_strings;
use crate::models::{ChunkMetadata, MaterialChunk};

/// Most candidates kept per chunk.
pub const MAX_CANDIDATES_PER_CHUNK: usize = 6;

const MAX_CANDIDATE_CHARS: usize = 240;

fn formula_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(=|≤|≥|≈|≠|\\(frac|sum|int|sqrt|prod|lim|alpha|beta|theta|sigma|mu|lambda|partial|cdot|times|leq|geq|approx)\b|\$[^$]+\$)").ok()
    })
    .as_ref()
}

/// Candidate formula snippets found in `text`, at most six.
pub fn scan_formula_candidates(text: &str) -> Vec<String> {
    let Some(re) = formula_re() else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.chars().count() > MAX_CANDIDATE_CHARS {
            continue;
        }
        // Prose sentences with a stray "=" are rarely formulas.
        if !re.is_match(line) || line.split_whitespace().count() > 40 {
            continue;
        }
        out.push(line.to_string());
    }
    let mut out = dedupe_strings(out);
    out.truncate(MAX_CANDIDATES_PER_CHUNK);
    out
}

/// A chunk's candidates as sent to the formula prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormulaTask {
    pub chunk_id: Uuid,
    pub candidates: Vec<String>,
}

/// Chunks that have candidates and no formulas recorded yet.
pub fn formula_tasks(chunks: &[MaterialChunk]) -> Vec<FormulaTask> {
    let mut tasks: Vec<FormulaTask> = chunks
        .iter()
        .filter(|c| c.is_usable_text() && c.metadata.formula_latex.is_empty())
        .filter_map(|c| {
            let candidates = scan_formula_candidates(&c.text);
            (!candidates.is_empty()).then_some(FormulaTask {
                chunk_id: c.id,
                candidates,
            })
        })
        .collect();
    tasks.sort_by_key(|t| t.chunk_id);
    tasks
}

/// Formulas returned for one chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormulaResult {
    #[serde(default)]
    pub chunk_id: String,
    #[serde(default)]
    pub formula_latex: Vec<String>,
    #[serde(default)]
    pub formula_symbolic: Vec<String>,
}

/// Write returned formulas into chunk metadata. Returns whether anything changed.
pub fn apply_formulas(meta: &mut ChunkMetadata, result: &FormulaResult) -> bool {
    let mut latex = dedupe_strings(&result.formula_latex);
    latex.truncate(MAX_CANDIDATES_PER_CHUNK);
    let mut symbolic = dedupe_strings(&result.formula_symbolic);
    symbolic.truncate(MAX_CANDIDATES_PER_CHUNK);
    if latex.is_empty() && symbolic.is_empty() {
        return false;
    }
    if meta.formula_latex == latex && meta.formula_symbolic == symbolic {
        return false;
    }
    meta.formula_latex = latex;
    meta.formula_symbolic = symbolic;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_finds_formulas() {
        let text = "The posterior is given below.\nP(A|B) = P(B|A) P(A) / P(B)\n$\\frac{a}{b}$ is a ratio\nerror ≤ epsilon\nNothing here.";
        let c = scan_formula_candidates(text);
        assert_eq!(c.len(), 3);
        assert!(c[0].starts_with("P(A|B)"));
    }

    #[test]
    fn test_scan_caps_at_six() {
        let text = (0..20).map(|i| format!("x_{} = {}", i, i)).collect::<Vec<_>>().join("\n");
        assert_eq!(scan_formula_candidates(&text).len(), MAX_CANDIDATES_PER_CHUNK);
    }

    #[test]
    fn test_apply_formulas() {
        let mut meta = ChunkMetadata::default();
        let r = FormulaResult {
            chunk_id: String::new(),
            formula_latex: vec!["a = b".into(), "a = b".into()],
            formula_symbolic: vec![],
        };
        assert!(apply_formulas(&mut meta, &r));
        assert_eq!(meta.formula_latex, vec!["a = b"]);
        assert!(!apply_formulas(&mut meta, &r));
        assert!(!apply_formulas(&mut meta, &FormulaResult::default()));
    }
}
