//! Coverage completion.
//!
//! Drives a concept inventory toward covering the material. Each round
//! targets the model's reported `missing_topics` at chunks it has not seen
//! yet (vector search per topic, local cosine fallback, then stratified
//! filler), asks for *new* concepts only, and merges the answers.
//!
//! The loop ends when the concept ceiling is reached, chunks run out, the
//! pass budget is spent, or two consecutive rounds stall. A round stalls
//! when it adds fewer than [`min_added`] keys and the missing-topic set did
//! not change. Large corpora then get one section sweep over sections
//! that few concepts cite.

use anyhow::{bail, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use pathweaver_core::adaptive::{min_added, section_min_citations, should_run_section_sweep, CorpusSignals, CoverageParams};
use pathweaver_core::embedding::top_k_by_cosine;
use pathweaver_core::excerpts::{evenly_spaced, excerpts_for_ids, stratified_chunk_ids, ExcerptLimits, Excerpts};
use pathweaver_core::inventory::{dedupe_topics, known_keys, merge_inventories, summarize_for_prompt, ConceptItem, CoverageReport};
use pathweaver_core::keys::dedupe_uuids;
use pathweaver_core::models::MaterialChunk;
use pathweaver_core::text::{approx_tokens, batch_by_tokens, CHARS_PER_TOKEN};

use crate::error::is_context_length;
use crate::llm::{embed_logged, generate_logged, LlmClient};
use crate::progress::StageProgress;
use crate::prompts::{decode_delta, delta_prompt};
use crate::vectors::{chunks_ns, VectorFilter, VectorStore};

pub const TOPIC_QUERY_TIMEOUT: Duration = Duration::from_secs(4);
/// Smallest excerpt budget a context-length retry will shrink to.
pub const CONTEXT_RETRY_FLOOR: usize = 12_000;
const SUMMARY_CHARS: usize = 140;
const SWEEP_CHUNKS_PER_SECTION: usize = 2;

pub struct CoverageInput<'a> {
    pub intent_md: &'a str,
    pub chunks: &'a [MaterialChunk],
    pub allowed_chunks: &'a HashSet<Uuid>,
    /// Chunks already shown to the model by earlier passes.
    pub seen_chunk_ids: &'a [Uuid],
    pub concepts: Vec<ConceptItem>,
    pub coverage: CoverageReport,
    /// Extra topics folded into the first round.
    pub seed_topics: &'a [String],
    pub signals: &'a CorpusSignals,
    pub params: &'a CoverageParams,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CoverageOutcome {
    pub concepts: Vec<ConceptItem>,
    pub coverage: CoverageReport,
    pub rounds: usize,
    /// Keys added per round, sweep excluded.
    pub added_per_round: Vec<usize>,
    pub stalled: bool,
    pub swept: bool,
    pub sweep_added: usize,
    pub skipped_tasks: usize,
    #[serde(skip)]
    pub seen: HashSet<Uuid>,
}

#[derive(Debug, Clone)]
struct DeltaTask {
    topics: Vec<String>,
    ids: Vec<Uuid>,
    excerpts: Excerpts,
}

struct DeltaAnswer {
    concepts: Vec<ConceptItem>,
    coverage: CoverageReport,
}

pub struct CoverageEngine<'a> {
    stage: &'static str,
    llm: &'a dyn LlmClient,
    vectors: Option<&'a dyn VectorStore>,
    material_set_id: Uuid,
    cancel: &'a CancellationToken,
    progress: &'a StageProgress,
    progress_range: (u8, u8),
    topic_cache: HashMap<String, Vec<f32>>,
}

impl<'a> CoverageEngine<'a> {
    pub fn new(
        stage: &'static str,
        llm: &'a dyn LlmClient,
        vectors: Option<&'a dyn VectorStore>,
        material_set_id: Uuid,
        cancel: &'a CancellationToken,
        progress: &'a StageProgress,
    ) -> Self {
        Self {
            stage,
            llm,
            vectors,
            material_set_id,
            cancel,
            progress,
            progress_range: (0, 100),
            topic_cache: HashMap::new(),
        }
    }

    pub fn with_progress_range(mut self, start: u8, end: u8) -> Self {
        self.progress_range = (start, end);
        self
    }

    pub async fn run(&mut self, input: CoverageInput<'_>) -> Result<CoverageOutcome> {
        let p = input.params;
        let passes = p.passes.actual;
        let limits = ExcerptLimits {
            per_file: p.extra_per_file.actual,
            max_chars: p.extra_max_chars.actual,
            max_lines_per_file: p.extra_max_lines.actual,
            max_total: p.extra_max_total.actual,
        };
        let by_id: HashMap<Uuid, &MaterialChunk> = input.chunks.iter().map(|c| (c.id, c)).collect();
        let file_ids: Vec<String> = input
            .chunks
            .iter()
            .filter(|c| input.allowed_chunks.contains(&c.id))
            .map(|c| c.material_file_id)
            .collect::<BTreeSet<_>>()
            .iter()
            .map(Uuid::to_string)
            .collect();

        let mut out = CoverageOutcome {
            concepts: input.concepts,
            coverage: input.coverage.normalized(),
            seen: input.seen_chunk_ids.iter().copied().collect(),
            ..Default::default()
        };
        let mut consecutive_stalls = 0;

        for round in 1..=passes {
            if self.cancel.is_cancelled() {
                bail!("{}: cancelled during coverage", self.stage);
            }
            let (start, end) = self.progress_range;
            self.progress
                .update_range((round - 1) as u64, passes as u64, start, end, "coverage completion");

            let before = known_keys(&out.concepts);
            if before.len() >= p.max_concepts.actual {
                tracing::info!(stage = self.stage, round, concepts = before.len(), "coverage: concept ceiling reached");
                break;
            }

            let candidates: Vec<MaterialChunk> = input
                .chunks
                .iter()
                .filter(|c| c.is_usable_text() && input.allowed_chunks.contains(&c.id) && !out.seen.contains(&c.id))
                .cloned()
                .collect();
            if candidates.is_empty() {
                tracing::info!(stage = self.stage, round, "coverage: no unseen chunks left");
                break;
            }

            let mut topics = out.coverage.missing_topics.clone();
            if round == 1 {
                topics.extend(input.seed_topics.iter().cloned());
            }
            let topics: Vec<String> = dedupe_topics(&topics)
                .into_iter()
                .take(p.max_missing_topics.actual * passes)
                .collect();
            if topics.is_empty() && p.targeted_only {
                tracing::info!(stage = self.stage, round, "coverage: nothing left to target");
                break;
            }
            let batches: Vec<Vec<String>> = if topics.is_empty() {
                vec![Vec::new()]
            } else {
                topics.chunks(p.max_missing_topics.actual.max(1)).map(<[String]>::to_vec).collect()
            };

            let stratified = stratified_chunk_ids(&candidates, p.extra_per_file.actual);
            let candidate_ids: HashSet<Uuid> = candidates.iter().map(|c| c.id).collect();
            let mut tasks = Vec::with_capacity(batches.len());
            for (b, batch_topics) in batches.iter().enumerate() {
                let mut ids = self
                    .target_chunks(batch_topics, &candidates, &file_ids, p.topic_top_k.actual)
                    .await;
                ids.retain(|id| candidate_ids.contains(id));
                if ids.is_empty() && !p.targeted_only {
                    ids = stratified
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| i % batches.len() == b)
                        .map(|(_, id)| *id)
                        .collect();
                }
                let excerpts = excerpts_for_ids(&by_id, &ids, &limits);
                if excerpts.is_empty() {
                    continue;
                }
                out.seen.extend(excerpts.chunk_ids.iter().copied());
                tasks.push(DeltaTask {
                    topics: batch_topics.clone(),
                    ids,
                    excerpts,
                });
            }
            if tasks.is_empty() {
                break;
            }

            let summary = summarize_for_prompt(&out.concepts, SUMMARY_CHARS);
            let answers = self
                .run_tasks(input.intent_md, &summary, tasks, &by_id, &limits, p.concurrency.actual)
                .await?;
            out.rounds = round;
            let previous_topics = topic_set(&out.coverage.missing_topics);
            let skipped = answers.iter().filter(|a| a.is_none()).count();
            out.skipped_tasks += skipped;
            let answers: Vec<DeltaAnswer> = answers.into_iter().flatten().collect();
            if answers.is_empty() {
                // Every task was skipped; count it as a stall so the loop ends.
                out.added_per_round.push(0);
                consecutive_stalls += 1;
                if consecutive_stalls >= 2 {
                    out.stalled = true;
                    break;
                }
                continue;
            }
            merge_answers(&mut out, answers, input.allowed_chunks);

            let added = known_keys(&out.concepts).difference(&before).count();
            out.added_per_round.push(added);
            let threshold = min_added(before.len(), input.signals);
            let stalled = added < threshold && topic_set(&out.coverage.missing_topics) == previous_topics;
            tracing::info!(
                stage = self.stage,
                round,
                added,
                threshold,
                stalled,
                total = out.concepts.len(),
                missing = out.coverage.missing_topics.len(),
                "coverage round"
            );
            if stalled {
                consecutive_stalls += 1;
                if consecutive_stalls >= 2 {
                    out.stalled = true;
                    break;
                }
            } else {
                consecutive_stalls = 0;
            }
        }

        if should_run_section_sweep(input.signals) {
            let before = known_keys(&out.concepts);
            let tasks = sweep_tasks(input.chunks, input.allowed_chunks, &out.concepts, p, &by_id, &limits);
            if !tasks.is_empty() {
                let summary = summarize_for_prompt(&out.concepts, SUMMARY_CHARS);
                let answers = self
                    .run_tasks(input.intent_md, &summary, tasks, &by_id, &limits, p.concurrency.actual)
                    .await?;
                out.skipped_tasks += answers.iter().filter(|a| a.is_none()).count();
                let answers: Vec<DeltaAnswer> = answers.into_iter().flatten().collect();
                if !answers.is_empty() {
                    merge_answers(&mut out, answers, input.allowed_chunks);
                }
                out.swept = true;
                out.sweep_added = known_keys(&out.concepts).difference(&before).count();
                tracing::info!(stage = self.stage, added = out.sweep_added, "coverage section sweep");
            }
        }

        let (_, end) = self.progress_range;
        self.progress.update(end, "coverage complete");
        Ok(out)
    }

    /// Chunk IDs relevant to `topics`: vector hits per topic, or local
    /// cosine over candidate embeddings when the index has nothing.
    async fn target_chunks(
        &mut self,
        topics: &[String],
        candidates: &[MaterialChunk],
        file_ids: &[String],
        top_k: usize,
    ) -> Vec<Uuid> {
        if topics.is_empty() {
            return Vec::new();
        }
        let embeddings = self.topic_embeddings(topics).await;
        if embeddings.is_empty() {
            return Vec::new();
        }

        let mut ids = Vec::new();
        if let Some(vectors) = self.vectors {
            let ns = chunks_ns(self.material_set_id);
            let filter = VectorFilter::of_type("chunk").with_in("file_id", file_ids.to_vec());
            for emb in &embeddings {
                match tokio::time::timeout(TOPIC_QUERY_TIMEOUT, vectors.query_ids(&ns, emb, top_k, &filter)).await {
                    Ok(Ok(hits)) => ids.extend(hits.iter().filter_map(|s| Uuid::parse_str(s).ok())),
                    Ok(Err(e)) => tracing::warn!(error = %e, "coverage topic query failed"),
                    Err(_) => tracing::warn!("coverage topic query timed out"),
                }
            }
        }
        if ids.is_empty() {
            let local: Vec<(Uuid, &[f32])> = candidates
                .iter()
                .filter(|c| c.has_embedding())
                .map(|c| (c.id, c.embedding.as_slice()))
                .collect();
            if !local.is_empty() {
                for emb in &embeddings {
                    ids.extend(top_k_by_cosine(emb, &local, top_k).into_iter().map(|(id, _)| id));
                }
            }
        }
        dedupe_uuids(ids)
    }

    /// Embeddings for `topics`, cached for the lifetime of the engine.
    async fn topic_embeddings(&mut self, topics: &[String]) -> Vec<Vec<f32>> {
        let missing: Vec<String> = topics
            .iter()
            .filter(|t| !self.topic_cache.contains_key(t.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            match embed_logged(self.llm, self.stage, "coverage_topics", &missing).await {
                Ok(vectors) => {
                    for (t, v) in missing.into_iter().zip(vectors) {
                        self.topic_cache.insert(t, v);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "coverage topic embedding failed"),
            }
        }
        topics.iter().filter_map(|t| self.topic_cache.get(t).cloned()).collect()
    }

    /// Run delta prompts with bounded concurrency, in task order.
    /// `None` marks a task skipped after a failed context-length retry.
    async fn run_tasks(
        &self,
        intent_md: &str,
        summary: &str,
        tasks: Vec<DeltaTask>,
        by_id: &HashMap<Uuid, &MaterialChunk>,
        limits: &ExcerptLimits,
        concurrency: usize,
    ) -> Result<Vec<Option<DeltaAnswer>>> {
        let jobs: Vec<_> = tasks
            .into_iter()
            .map(|task| async move { self.run_delta(intent_md, summary, &task, by_id, limits).await })
            .collect();
        stream::iter(jobs)
            .buffered(concurrency.max(1))
            .try_collect()
            .await
    }

    async fn run_delta(
        &self,
        intent_md: &str,
        summary: &str,
        task: &DeltaTask,
        by_id: &HashMap<Uuid, &MaterialChunk>,
        limits: &ExcerptLimits,
    ) -> Result<Option<DeltaAnswer>> {
        if self.cancel.is_cancelled() {
            bail!("{}: cancelled during coverage", self.stage);
        }
        let prompt = delta_prompt(intent_md, summary, &task.excerpts.text, &task.topics);
        let value = match generate_logged(self.llm, self.stage, "coverage_delta", &prompt).await {
            Ok(v) => v,
            Err(e) if is_context_length(&e) => {
                let smaller = limits.halved(CONTEXT_RETRY_FLOOR);
                let excerpts = excerpts_for_ids(by_id, &task.ids, &smaller);
                let prompt = delta_prompt(intent_md, summary, &excerpts.text, &task.topics);
                match generate_logged(self.llm, self.stage, "coverage_delta_retry", &prompt).await {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(
                            stage = self.stage,
                            max_total = smaller.max_total,
                            error = %e,
                            "coverage delta failed after halving excerpts; skipping task"
                        );
                        return Ok(None);
                    }
                }
            }
            Err(e) => return Err(e),
        };
        let (concepts, coverage, dropped) = decode_delta(&value);
        if dropped > 0 {
            tracing::debug!(stage = self.stage, dropped, "coverage delta: malformed items dropped");
        }
        Ok(Some(DeltaAnswer { concepts, coverage }))
    }
}

fn topic_set(topics: &[String]) -> BTreeSet<String> {
    topics.iter().map(|t| t.trim().to_lowercase()).filter(|t| !t.is_empty()).collect()
}

fn merge_answers(out: &mut CoverageOutcome, answers: Vec<DeltaAnswer>, allowed: &HashSet<Uuid>) {
    let n = answers.len() as f64;
    let confidence = answers.iter().map(|a| a.coverage.confidence).sum::<f64>() / n;
    let mut topics = Vec::new();
    let mut incoming = Vec::new();
    for a in answers {
        topics.extend(a.coverage.missing_topics);
        incoming.extend(a.concepts);
    }
    let (merged, report) = merge_inventories(&out.concepts, &incoming, Some(allowed));
    if report.dropped_citations > 0 || report.dropped_empty_key > 0 {
        tracing::debug!(?report, "coverage merge normalization");
    }
    out.concepts = merged;
    out.coverage = CoverageReport {
        confidence,
        missing_topics: topics,
    }
    .normalized();
}

/// One task per token-budgeted group of undercovered sections, each
/// section contributing a couple of evenly spaced chunks.
fn sweep_tasks(
    chunks: &[MaterialChunk],
    allowed: &HashSet<Uuid>,
    concepts: &[ConceptItem],
    p: &CoverageParams,
    by_id: &HashMap<Uuid, &MaterialChunk>,
    limits: &ExcerptLimits,
) -> Vec<DeltaTask> {
    let mut sections: BTreeMap<(Uuid, String), Vec<&MaterialChunk>> = BTreeMap::new();
    for c in chunks.iter().filter(|c| c.is_usable_text() && allowed.contains(&c.id)) {
        let path = c.metadata.section_path.trim();
        if !path.is_empty() {
            sections.entry((c.material_file_id, path.to_string())).or_default().push(c);
        }
    }
    if sections.is_empty() {
        return Vec::new();
    }

    let mut cited: HashMap<Uuid, usize> = HashMap::new();
    for id in concepts.iter().flat_map(|c| c.citation_ids()) {
        *cited.entry(id).or_insert(0) += 1;
    }
    let min_citations = section_min_citations(concepts.len());

    let mut items: Vec<(String, Vec<Uuid>)> = Vec::new();
    for ((_, path), mut list) in sections {
        let citations: usize = list.iter().map(|c| cited.get(&c.id).copied().unwrap_or(0)).sum();
        if citations >= min_citations {
            continue;
        }
        list.sort_by_key(|c| c.index);
        let ids = evenly_spaced(&list, SWEEP_CHUNKS_PER_SECTION).into_iter().map(|c| c.id).collect();
        items.push((path, ids));
    }

    let line_tokens = approx_tokens(&"x".repeat(limits.max_chars + 64));
    let budget = limits.max_total / CHARS_PER_TOKEN;
    let batches = batch_by_tokens(items, budget, p.max_missing_topics.actual, |(_, ids)| {
        ids.len() * line_tokens
    });

    batches
        .into_iter()
        .filter_map(|batch| {
            let topics: Vec<String> = batch.iter().map(|(t, _)| t.clone()).collect();
            let ids: Vec<Uuid> = batch.into_iter().flat_map(|(_, ids)| ids).collect();
            let sweep_limits = ExcerptLimits {
                max_lines_per_file: ids.len().max(1),
                ..*limits
            };
            let excerpts = excerpts_for_ids(by_id, &ids, &sweep_limits);
            (!excerpts.is_empty()).then_some(DeltaTask { topics, ids, excerpts })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use async_trait::async_trait;
    use chrono::Utc;
    use pathweaver_core::adaptive::{coverage_params, CoverageCeilings};
    use pathweaver_core::models::ChunkMetadata;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    /// Replies to delta prompts from a queue; embeds everything as `[1, 0]`.
    struct QueueLlm {
        replies: Mutex<Vec<Result<Value, LlmError>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl QueueLlm {
        fn new(replies: Vec<Result<Value, LlmError>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmClient for QueueLlm {
        fn model_name(&self) -> &str {
            "queue"
        }

        async fn generate_json(&self, _: &str, user: &str, _: &str, _: &Value) -> Result<Value, LlmError> {
            self.prompts.lock().unwrap().push(user.to_string());
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Ok(json!({"new_concepts": [], "missing_topics": ["priors"], "confidence": 0.5}));
            }
            replies.remove(0)
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn chunks(n: usize) -> Vec<MaterialChunk> {
        let file = Uuid::new_v4();
        (0..n)
            .map(|i| MaterialChunk {
                id: Uuid::new_v4(),
                material_file_id: file,
                index: i as i32,
                page: None,
                text: format!("passage number {} about probability", i),
                embedding: vec![1.0, i as f32 / n as f32],
                metadata: ChunkMetadata::default(),
                updated_at: Utc::now(),
            })
            .collect()
    }

    fn item(key: &str) -> ConceptItem {
        ConceptItem {
            key: key.into(),
            name: key.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn two_stalled_rounds_end_the_loop() {
        let chunks = chunks(40);
        let allowed: HashSet<Uuid> = chunks.iter().map(|c| c.id).collect();
        let signals = CorpusSignals::from_material(&[], &chunks, 1);
        let params = coverage_params(&signals, &CoverageCeilings::default());
        assert!(params.passes.actual >= 2);

        let llm = QueueLlm::new(Vec::new());
        let cancel = CancellationToken::new();
        let progress = StageProgress::disabled("test");
        let mut engine = CoverageEngine::new("test", &llm, None, Uuid::new_v4(), &cancel, &progress);
        let out = engine
            .run(CoverageInput {
                intent_md: "",
                chunks: &chunks,
                allowed_chunks: &allowed,
                seen_chunk_ids: &[],
                concepts: vec![item("bayes")],
                coverage: CoverageReport {
                    confidence: 0.5,
                    missing_topics: vec!["priors".into()],
                },
                seed_topics: &[],
                signals: &signals,
                params: &params,
            })
            .await
            .unwrap();
        assert!(out.stalled);
        assert_eq!(out.rounds, 2);
        assert_eq!(out.added_per_round, vec![0, 0]);
        assert_eq!(out.concepts.len(), 1);
        assert!(!out.swept);
    }

    #[tokio::test]
    async fn context_length_retries_once_then_skips() {
        let chunks = chunks(10);
        let allowed: HashSet<Uuid> = chunks.iter().map(|c| c.id).collect();
        let signals = CorpusSignals::from_material(&[], &chunks, 1);
        let mut params = coverage_params(&signals, &CoverageCeilings::default());
        params.passes.actual = 1;

        let overflow = || Err(LlmError::ContextLengthExceeded { max: 10, actual: 20 });
        let llm = QueueLlm::new(vec![overflow(), overflow()]);
        let cancel = CancellationToken::new();
        let progress = StageProgress::disabled("test");
        let mut engine = CoverageEngine::new("test", &llm, None, Uuid::new_v4(), &cancel, &progress);
        let out = engine
            .run(CoverageInput {
                intent_md: "",
                chunks: &chunks,
                allowed_chunks: &allowed,
                seen_chunk_ids: &[],
                concepts: vec![item("bayes")],
                coverage: CoverageReport {
                    confidence: 0.2,
                    missing_topics: vec!["priors".into()],
                },
                seed_topics: &[],
                signals: &signals,
                params: &params,
            })
            .await
            .unwrap();
        assert_eq!(out.skipped_tasks, 1);
        assert_eq!(llm.prompts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn new_concepts_are_merged_with_allowed_citations() {
        let chunks = chunks(10);
        let allowed: HashSet<Uuid> = chunks.iter().map(|c| c.id).collect();
        let signals = CorpusSignals::from_material(&[], &chunks, 1);
        let mut params = coverage_params(&signals, &CoverageCeilings::default());
        params.passes.actual = 1;
        let cited = chunks[0].id.to_string();
        let llm = QueueLlm::new(vec![Ok(json!({
            "new_concepts": [
                {"key": "Prior Distribution", "name": "Prior", "citations": [cited, Uuid::new_v4().to_string()]}
            ],
            "missing_topics": [],
            "confidence": 0.9
        }))]);
        let cancel = CancellationToken::new();
        let progress = StageProgress::disabled("test");
        let mut engine = CoverageEngine::new("test", &llm, None, Uuid::new_v4(), &cancel, &progress);
        let out = engine
            .run(CoverageInput {
                intent_md: "",
                chunks: &chunks,
                allowed_chunks: &allowed,
                seen_chunk_ids: &[],
                concepts: vec![item("bayes")],
                coverage: CoverageReport {
                    confidence: 0.2,
                    missing_topics: vec!["priors".into()],
                },
                seed_topics: &[],
                signals: &signals,
                params: &params,
            })
            .await
            .unwrap();
        let prior = out.concepts.iter().find(|c| c.key == "prior_distribution").unwrap();
        assert_eq!(prior.citations, vec![cited]);
        assert_eq!(out.added_per_round, vec![1]);
        assert!((out.coverage.confidence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn cancelled_token_stops_the_run() {
        let chunks = chunks(4);
        let allowed: HashSet<Uuid> = chunks.iter().map(|c| c.id).collect();
        let signals = CorpusSignals::from_material(&[], &chunks, 0);
        let params = coverage_params(&signals, &CoverageCeilings::default());
        let llm = QueueLlm::new(Vec::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let progress = StageProgress::disabled("test");
        let mut engine = CoverageEngine::new("test", &llm, None, Uuid::new_v4(), &cancel, &progress);
        let err = engine
            .run(CoverageInput {
                intent_md: "",
                chunks: &chunks,
                allowed_chunks: &allowed,
                seen_chunk_ids: &[],
                concepts: Vec::new(),
                coverage: CoverageReport::default(),
                seed_topics: &[],
                signals: &signals,
                params: &params,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }
}
