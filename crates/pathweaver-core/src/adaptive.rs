//! Adaptive parameters derived from corpus signals.
//!
//! Every tunable is a pure function of [`CorpusSignals`] and a ceiling
//! (usually supplied by an environment variable). The result carries both
//! the value actually used and the ceiling it was clamped against, so stage
//! outputs can report `{actual, ceiling}` pairs without re-reading the
//! environment.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

use crate::models::{MaterialChunk, MaterialFile};

/// Dominant shape of the uploaded material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Code,
    Prose,
    Slides,
    Mixed,
}

impl ContentType {
    /// Shift applied to similarity/confidence thresholds for this content.
    ///
    /// Code reuses vocabulary heavily, so matches must be tighter; slides
    /// are terse, so thresholds relax.
    pub fn threshold_delta(&self) -> f64 {
        match self {
            ContentType::Code => 0.03,
            ContentType::Prose => 0.0,
            ContentType::Slides => -0.04,
            ContentType::Mixed => -0.01,
        }
    }

    /// Apply [`threshold_delta`](Self::threshold_delta) and clamp to `[0, 1]`.
    pub fn adjust(&self, base: f64) -> f64 {
        (base + self.threshold_delta()).clamp(0.0, 1.0)
    }
}

/// Corpus statistics that drive every adaptive parameter.
#[derive(Debug, Clone, Serialize)]
pub struct CorpusSignals {
    pub file_count: usize,
    pub page_count: usize,
    pub section_count: usize,
    pub chunk_count: usize,
    pub concept_count: usize,
    pub avg_chunk_chars: usize,
    pub code_ratio: f64,
    pub slide_ratio: f64,
    pub content_type: ContentType,
}

impl CorpusSignals {
    /// Compute signals from loaded files and chunks.
    pub fn from_material(files: &[MaterialFile], chunks: &[MaterialChunk], concept_count: usize) -> Self {
        let file_count = files.len();
        let chunk_count = chunks.len();

        let mut pages_per_file: HashMap<Uuid, BTreeSet<i32>> = HashMap::new();
        let mut sections: BTreeSet<(Uuid, &str)> = BTreeSet::new();
        let mut total_chars = 0usize;
        let mut code_chunks = 0usize;
        for c in chunks {
            if let Some(p) = c.page {
                pages_per_file.entry(c.material_file_id).or_default().insert(p);
            }
            if !c.metadata.section_path.is_empty() {
                sections.insert((c.material_file_id, c.metadata.section_path.as_str()));
            }
            total_chars += c.text.chars().count();
            if c.metadata.kind == "code" {
                code_chunks += 1;
            }
        }
        let page_count = pages_per_file.values().map(|p| p.len()).sum();

        let code_files = files.iter().filter(|f| is_code_file(f)).count();
        let slide_files = files.iter().filter(|f| is_slide_file(f)).count();

        let code_ratio = if chunk_count > 0 {
            let by_chunk = code_chunks as f64 / chunk_count as f64;
            let by_file = ratio(code_files, file_count);
            by_chunk.max(by_file)
        } else {
            ratio(code_files, file_count)
        };
        let slide_ratio = ratio(slide_files, file_count);

        let content_type = classify_content(code_ratio, slide_ratio);

        Self {
            file_count,
            page_count,
            section_count: sections.len(),
            chunk_count,
            concept_count,
            avg_chunk_chars: if chunk_count > 0 { total_chars / chunk_count } else { 0 },
            code_ratio,
            slide_ratio,
            content_type,
        }
    }

    /// Large corpora get stricter stall detection and a section sweep.
    pub fn is_large(&self) -> bool {
        self.page_count >= 500 || self.chunk_count >= 1500
    }

    pub fn avg_chunks_per_file(&self) -> usize {
        if self.file_count == 0 {
            self.chunk_count
        } else {
            self.chunk_count.div_ceil(self.file_count)
        }
    }
}

fn ratio(n: usize, d: usize) -> f64 {
    if d == 0 {
        0.0
    } else {
        n as f64 / d as f64
    }
}

fn is_code_file(f: &MaterialFile) -> bool {
    let name = f.original_name.to_ascii_lowercase();
    const CODE_EXT: [&str; 12] = [
        ".rs", ".py", ".js", ".ts", ".go", ".java", ".c", ".cpp", ".h", ".rb", ".ipynb", ".sql",
    ];
    f.extracted_kind == "code"
        || f.mime_type.starts_with("text/x-")
        || CODE_EXT.iter().any(|ext| name.ends_with(ext))
}

fn is_slide_file(f: &MaterialFile) -> bool {
    let name = f.original_name.to_ascii_lowercase();
    f.extracted_kind == "slides"
        || f.mime_type.contains("presentation")
        || name.ends_with(".pptx")
        || name.ends_with(".key")
}

/// Classify from code/slide ratios.
pub fn classify_content(code_ratio: f64, slide_ratio: f64) -> ContentType {
    if code_ratio >= 0.5 {
        ContentType::Code
    } else if slide_ratio >= 0.5 {
        ContentType::Slides
    } else if code_ratio < 0.15 && slide_ratio < 0.15 {
        ContentType::Prose
    } else {
        ContentType::Mixed
    }
}

/// A parameter value together with the ceiling it was clamped against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AdaptiveParam<T> {
    pub actual: T,
    pub ceiling: T,
}

/// Clamp `wanted` into `[min, max(min, ceiling)]`.
pub fn bounded(wanted: usize, min: usize, ceiling: usize) -> AdaptiveParam<usize> {
    let hi = ceiling.max(min);
    AdaptiveParam {
        actual: wanted.clamp(min, hi),
        ceiling,
    }
}

/// Float variant of [`bounded`].
pub fn bounded_f64(wanted: f64, min: f64, ceiling: f64) -> AdaptiveParam<f64> {
    let hi = ceiling.max(min);
    let wanted = if wanted.is_finite() { wanted } else { min };
    AdaptiveParam {
        actual: wanted.clamp(min, hi),
        ceiling,
    }
}

/// `adaptive` block attached to stage outputs.
#[derive(Debug, Clone, Serialize)]
pub struct AdaptiveMeta {
    pub stage: String,
    pub enabled: bool,
    pub signals: CorpusSignals,
    pub params: BTreeMap<String, serde_json::Value>,
}

impl AdaptiveMeta {
    pub fn new(stage: &str, signals: &CorpusSignals) -> Self {
        Self {
            stage: stage.to_string(),
            enabled: true,
            signals: signals.clone(),
            params: BTreeMap::new(),
        }
    }

    pub fn record<T: Serialize>(&mut self, name: &str, param: &AdaptiveParam<T>) {
        if let Ok(v) = serde_json::to_value(param) {
            self.params.insert(name.to_string(), v);
        }
    }
}

// ─── Inventory ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct InventoryCeilings {
    pub excerpt_per_file: usize,
    pub excerpt_max_chars: usize,
    pub excerpt_max_total: usize,
    pub edge_max_total: usize,
    pub concurrency: usize,
}

impl Default for InventoryCeilings {
    fn default() -> Self {
        Self {
            excerpt_per_file: 24,
            excerpt_max_chars: 900,
            excerpt_max_total: 120_000,
            edge_max_total: 60_000,
            concurrency: 6,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InventoryParams {
    pub per_file: AdaptiveParam<usize>,
    pub max_chars: AdaptiveParam<usize>,
    pub max_lines_per_file: AdaptiveParam<usize>,
    pub max_total: AdaptiveParam<usize>,
    pub edge_per_file: AdaptiveParam<usize>,
    pub edge_max_total: AdaptiveParam<usize>,
    pub concurrency: AdaptiveParam<usize>,
}

impl InventoryParams {
    pub fn record(&self, meta: &mut AdaptiveMeta) {
        meta.record("inventory_per_file", &self.per_file);
        meta.record("inventory_max_chars", &self.max_chars);
        meta.record("inventory_max_lines_per_file", &self.max_lines_per_file);
        meta.record("inventory_max_total", &self.max_total);
        meta.record("edge_per_file", &self.edge_per_file);
        meta.record("edge_max_total", &self.edge_max_total);
        meta.record("inventory_concurrency", &self.concurrency);
    }
}

pub fn inventory_params(s: &CorpusSignals, c: &InventoryCeilings) -> InventoryParams {
    let avg = s.avg_chunks_per_file().max(1);
    let per_file_wanted = ((avg as f64).sqrt() * 2.0).ceil() as usize;
    let per_file = bounded(per_file_wanted, 4, c.excerpt_per_file);

    let chars_wanted = match s.content_type {
        ContentType::Code => 900,
        ContentType::Slides => 450,
        ContentType::Mixed => 700,
        ContentType::Prose => 650,
    };
    let max_chars = bounded(chars_wanted, 200, c.excerpt_max_chars);

    let total_wanted = per_file.actual * s.file_count.max(1) * max_chars.actual;
    let max_total = bounded(total_wanted, 12_000, c.excerpt_max_total);

    let edge_per_file = bounded(per_file.actual / 2, 2, c.excerpt_per_file);
    let edge_max_total = bounded(max_total.actual / 2, 8_000, c.edge_max_total);

    InventoryParams {
        per_file,
        max_chars,
        max_lines_per_file: per_file,
        max_total,
        edge_per_file,
        edge_max_total,
        concurrency: bounded(s.file_count, 1, c.concurrency),
    }
}

// ─── Coverage ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CoverageCeilings {
    pub passes: usize,
    pub max_concepts: usize,
    pub extra_per_file: usize,
    pub extra_max_chars: usize,
    pub extra_max_lines: usize,
    pub extra_max_total: usize,
    pub max_missing_topics: usize,
    pub topic_top_k: usize,
    pub concurrency: usize,
}

impl Default for CoverageCeilings {
    fn default() -> Self {
        Self {
            passes: 4,
            max_concepts: 400,
            extra_per_file: 8,
            extra_max_chars: 800,
            extra_max_lines: 24,
            extra_max_total: 60_000,
            max_missing_topics: 12,
            topic_top_k: 6,
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoverageParams {
    pub passes: AdaptiveParam<usize>,
    pub max_concepts: AdaptiveParam<usize>,
    pub extra_per_file: AdaptiveParam<usize>,
    pub extra_max_chars: AdaptiveParam<usize>,
    pub extra_max_lines: AdaptiveParam<usize>,
    pub extra_max_total: AdaptiveParam<usize>,
    pub max_missing_topics: AdaptiveParam<usize>,
    pub topic_top_k: AdaptiveParam<usize>,
    pub targeted_only: bool,
    pub concurrency: AdaptiveParam<usize>,
}

impl CoverageParams {
    pub fn record(&self, meta: &mut AdaptiveMeta) {
        meta.record("coverage_passes", &self.passes);
        meta.record("coverage_max_concepts", &self.max_concepts);
        meta.record("coverage_extra_per_file", &self.extra_per_file);
        meta.record("coverage_extra_max_chars", &self.extra_max_chars);
        meta.record("coverage_extra_max_lines", &self.extra_max_lines);
        meta.record("coverage_extra_max_total", &self.extra_max_total);
        meta.record("coverage_max_missing_topics", &self.max_missing_topics);
        meta.record("coverage_topic_top_k", &self.topic_top_k);
        meta.record("coverage_concurrency", &self.concurrency);
    }
}

pub fn coverage_params(s: &CorpusSignals, c: &CoverageCeilings) -> CoverageParams {
    let passes = bounded(2 + s.chunk_count / 300, 1, c.passes);
    let max_concepts = bounded(40 + s.chunk_count / 4, 20, c.max_concepts);
    let extra_per_file = bounded(2 + s.avg_chunks_per_file() / 20, 1, c.extra_per_file);
    let chars_wanted = if s.content_type == ContentType::Code { 800 } else { 600 };
    let extra_max_chars = bounded(chars_wanted, 200, c.extra_max_chars);
    let extra_max_lines = bounded(extra_per_file.actual * 3, 2, c.extra_max_lines);
    let extra_max_total = bounded(
        extra_max_chars.actual * extra_max_lines.actual * s.file_count.max(1),
        12_000,
        c.extra_max_total,
    );
    let max_missing_topics = bounded(4 + s.file_count, 2, c.max_missing_topics);
    let topic_top_k = bounded(if s.is_large() { 8 } else { 4 }, 1, c.topic_top_k);

    CoverageParams {
        passes,
        max_concepts,
        extra_per_file,
        extra_max_chars,
        extra_max_lines,
        extra_max_total,
        max_missing_topics,
        topic_top_k,
        targeted_only: s.is_large(),
        concurrency: bounded(s.file_count.max(2), 1, c.concurrency),
    }
}

/// Minimum number of new keys a coverage round must add to not stall.
pub fn min_added(total: usize, s: &CorpusSignals) -> usize {
    let base = ((0.01 * total as f64).round() as usize).max(2);
    if s.is_large() {
        base.max(4)
    } else {
        base
    }
}

/// Corpora big enough to warrant a final section-driven coverage pass.
pub fn should_run_section_sweep(s: &CorpusSignals) -> bool {
    s.page_count >= 200 || s.chunk_count >= 600
}

/// Citation count under which a section counts as undercovered.
pub fn section_min_citations(total_concepts: usize) -> usize {
    (total_concepts / 60).clamp(1, 3)
}

// ─── Embeddings / realize / retrieval ───────────────────────────────

#[derive(Debug, Clone)]
pub struct EmbedParams {
    pub batch_size: AdaptiveParam<usize>,
    pub concurrency: AdaptiveParam<usize>,
}

pub fn embed_params(items: usize, avg_chars: usize, batch_ceiling: usize, concurrency_ceiling: usize) -> EmbedParams {
    // Keep a batch under ~64k chars of input.
    let per_item = avg_chars.max(1);
    let batch_wanted = (64_000 / per_item).max(1);
    let batch_size = bounded(batch_wanted, 1, batch_ceiling);
    let batches = items.div_ceil(batch_size.actual.max(1));
    EmbedParams {
        batch_size,
        concurrency: bounded(batches, 1, concurrency_ceiling),
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalParams {
    pub seed_k: usize,
    pub lexical_k: usize,
    pub final_k: usize,
    pub max_concepts: usize,
    pub max_evidence_per_concept: usize,
    pub max_out: usize,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            seed_k: 24,
            lexical_k: 12,
            final_k: 12,
            max_concepts: 16,
            max_evidence_per_concept: 4,
            max_out: 48,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RealizeCeilings {
    pub concurrency: usize,
    pub excerpt_max_chars: usize,
    pub excerpt_max_total: usize,
}

impl Default for RealizeCeilings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            excerpt_max_chars: 900,
            excerpt_max_total: 14_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RealizeParams {
    pub concurrency: AdaptiveParam<usize>,
    pub excerpt_max_chars: AdaptiveParam<usize>,
    pub excerpt_max_total: AdaptiveParam<usize>,
}

pub fn realize_params(s: &CorpusSignals, pending_slots: usize, c: &RealizeCeilings) -> RealizeParams {
    let chars_wanted = if s.content_type == ContentType::Code { 900 } else { 700 };
    RealizeParams {
        concurrency: bounded(pending_slots, 1, c.concurrency),
        excerpt_max_chars: bounded(chars_wanted, 200, c.excerpt_max_chars),
        excerpt_max_total: bounded(chars_wanted * 12, 4_000, c.excerpt_max_total),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals(files: usize, chunks: usize, pages: usize) -> CorpusSignals {
        CorpusSignals {
            file_count: files,
            page_count: pages,
            section_count: 0,
            chunk_count: chunks,
            concept_count: 0,
            avg_chunk_chars: 600,
            code_ratio: 0.0,
            slide_ratio: 0.0,
            content_type: ContentType::Prose,
        }
    }

    #[test]
    fn test_bounded_clamps_to_ceiling() {
        let p = bounded(50, 2, 10);
        assert_eq!(p.actual, 10);
        assert_eq!(p.ceiling, 10);
        assert_eq!(bounded(0, 2, 10).actual, 2);
        // A ceiling below the minimum never pushes the value under the minimum.
        assert_eq!(bounded(5, 3, 1).actual, 3);
    }

    #[test]
    fn test_bounded_f64_non_finite() {
        assert_eq!(bounded_f64(f64::NAN, 0.2, 0.9).actual, 0.2);
        assert_eq!(bounded_f64(2.0, 0.2, 0.9).actual, 0.9);
    }

    #[test]
    fn test_classify_content() {
        assert_eq!(classify_content(0.7, 0.0), ContentType::Code);
        assert_eq!(classify_content(0.0, 0.6), ContentType::Slides);
        assert_eq!(classify_content(0.05, 0.1), ContentType::Prose);
        assert_eq!(classify_content(0.3, 0.2), ContentType::Mixed);
    }

    #[test]
    fn test_min_added() {
        let small = signals(2, 80, 10);
        assert_eq!(min_added(10, &small), 2);
        assert_eq!(min_added(350, &small), 4);
        let large = signals(10, 2000, 100);
        assert_eq!(min_added(10, &large), 4);
        assert_eq!(min_added(900, &large), 9);
    }

    #[test]
    fn test_section_sweep_threshold() {
        assert!(!should_run_section_sweep(&signals(2, 80, 40)));
        assert!(should_run_section_sweep(&signals(2, 600, 40)));
        assert!(should_run_section_sweep(&signals(2, 10, 200)));
    }

    #[test]
    fn test_params_respect_ceilings() {
        let s = signals(50, 5000, 900);
        let inv = inventory_params(&s, &InventoryCeilings::default());
        assert!(inv.max_total.actual <= inv.max_total.ceiling);
        assert!(inv.per_file.actual <= 24);
        let cov = coverage_params(&s, &CoverageCeilings::default());
        assert!(cov.passes.actual <= 4);
        assert!(cov.targeted_only);
        assert!(cov.extra_max_total.actual >= 12_000);
    }

    #[test]
    fn test_threshold_adjust_clamps() {
        assert_eq!(ContentType::Code.adjust(0.99), 1.0);
        assert!((ContentType::Slides.adjust(0.8) - 0.76).abs() < 1e-9);
    }
}
