//! `realize_activities`: write grounded activity content for every open
//! slot on the path's nodes.
//!
//! Per slot: retrieve chunks for the node's concepts, prompt for content
//! blocks, repair them toward the kind's minima and validate. Failing
//! validation re-prompts with the errors attached. The bundle (activity,
//! variant, concept and citation links, node link, saga delete) commits
//! in one transaction; the variant vector and the activity mirror follow
//! best-effort.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use pathweaver_core::activity::{blocks_text, decode_blocks, encode_blocks, repair, validate, ActivityDraft};
use pathweaver_core::adaptive::{realize_params, AdaptiveMeta, CorpusSignals};
use pathweaver_core::excerpts::{excerpts_for_ids, ExcerptLimits};
use pathweaver_core::keys::{advisory_key64, normalize_concept_key, parse_uuids, sha256_hex, stable_id};
use pathweaver_core::models::{
    Activity, ActivityBundle, ActivityCitation, ActivityConcept, ActivitySlot, ActivityVariant, Concept, ConceptScope,
    MaterialChunk, PathNode, PathNodeActivity,
};
use pathweaver_core::path_meta::PathMeta;

use super::{load_material, resolve_path, upsert_vectors_best_effort, Stage, StageContext, StageDeps, StageInput, StageName};
use crate::artifact_cache::{self, ArtifactCache, REALIZE_ACTIVITIES};
use crate::error::{is_unique_violation, StageError};
use crate::llm::{embed_logged, generate_typed, LlmClient};
use crate::prompts::{activity_prompt, ActivityRequest};
use crate::retrieval::{select_chunk_ids, RetrievalRequest};
use crate::saga;
use crate::store::Store;
use crate::vectors::{activities_path_ns, VectorRecord, VectorStore};

const STAGE: StageName = StageName::RealizeActivities;

const ACTIVITY_NS: Uuid = Uuid::from_u128(0x3e8a_d174_52cb_4f19_9b06_7ad2_e41c_a006);
const VARIANT_NS: Uuid = Uuid::from_u128(0x8f14_29c3_b06e_4a5d_a2f7_61e0_3bd8_c007);

pub const DEFAULT_VARIANT: &str = "default";
const INFERRED_KEYS: usize = 3;
const EXCERPT_LINES_PER_FILE: usize = 8;

pub struct RealizeActivities;

pub fn activity_id(node_id: Uuid, slot: i32) -> Uuid {
    stable_id(ACTIVITY_NS, &[&node_id.to_string(), &slot.to_string()])
}

fn variant_id(activity_id: Uuid) -> Uuid {
    stable_id(VARIANT_NS, &[&activity_id.to_string(), DEFAULT_VARIANT])
}

/// A slot still waiting for content.
#[derive(Debug, Clone)]
struct PendingSlot<'a> {
    node: &'a PathNode,
    slot: ActivitySlot,
    concept_keys: Vec<String>,
    inferred_keys: bool,
}

#[derive(Debug, Default)]
struct SlotOutcome {
    written: bool,
    attempts: usize,
    citations: usize,
    saga_actions: usize,
    vector: Option<VectorRecord>,
    activity: Option<Activity>,
    link: Option<PathNodeActivity>,
}

/// Concept keys inferred from a node's title and goal: concepts whose key
/// tokens overlap the most, importance breaking ties.
fn infer_concept_keys(node: &PathNode, concepts: &[Concept]) -> Vec<String> {
    let text = normalize_concept_key(&format!("{} {}", node.title, node.metadata.goal));
    let tokens: HashSet<&str> = text.split('_').filter(|t| t.len() > 2).collect();
    let mut scored: Vec<(usize, i32, &str)> = concepts
        .iter()
        .map(|c| {
            let hits = c.key.split('_').filter(|t| tokens.contains(t)).count();
            (hits, c.metadata.importance, c.key.as_str())
        })
        .filter(|(hits, _, _)| *hits > 0)
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)).then(a.2.cmp(b.2)));
    scored.into_iter().take(INFERRED_KEYS).map(|(_, _, k)| k.to_string()).collect()
}

/// Open slots in node order, primary keys ordered by concept importance.
fn pending_slots<'a>(
    nodes: &'a [PathNode],
    realized: &HashSet<(Uuid, i32)>,
    concepts: &[Concept],
) -> Vec<PendingSlot<'a>> {
    let importance: HashMap<&str, i32> = concepts.iter().map(|c| (c.key.as_str(), c.metadata.importance)).collect();
    let mut out = Vec::new();
    for node in nodes {
        let mut slots = node.metadata.activity_slots.clone();
        slots.sort_by_key(|s| s.slot);
        for slot in slots {
            if realized.contains(&(node.id, slot.slot)) {
                continue;
            }
            let mut keys: Vec<String> = if !slot.primary_concept_keys.is_empty() {
                slot.primary_concept_keys.iter().map(|k| normalize_concept_key(k)).collect()
            } else {
                node.metadata.concept_keys.iter().map(|k| normalize_concept_key(k)).collect()
            };
            keys.retain(|k| !k.is_empty());
            let mut inferred_keys = false;
            if keys.is_empty() {
                keys = infer_concept_keys(node, concepts);
                inferred_keys = true;
                tracing::warn!(node_id = %node.id, slot = slot.slot, inferred = ?keys, "node has no concept keys; inferred from title and goal");
            }
            keys.sort_by(|a, b| {
                let wa = importance.get(a.as_str()).copied().unwrap_or(0);
                let wb = importance.get(b.as_str()).copied().unwrap_or(0);
                wb.cmp(&wa).then(a.cmp(b))
            });
            keys.dedup();
            out.push(PendingSlot {
                node,
                slot,
                concept_keys: keys,
                inferred_keys,
            });
        }
    }
    out
}

struct SlotEnv<'a> {
    store: &'a dyn Store,
    llm: &'a dyn LlmClient,
    vectors: Option<&'a dyn VectorStore>,
    input: &'a StageInput,
    path_id: Uuid,
    meta: &'a PathMeta,
    profile_doc: &'a str,
    knowledge_context: &'a str,
    chunks_by_id: HashMap<Uuid, &'a MaterialChunk>,
    local: Vec<(Uuid, &'a [f32])>,
    file_ids: Vec<Uuid>,
    allowed: HashSet<Uuid>,
    concept_ids: HashMap<String, Uuid>,
    limits: ExcerptLimits,
    max_attempts: usize,
    deps: &'a StageDeps,
}

impl SlotEnv<'_> {
    async fn realize(&self, pending: &PendingSlot<'_>) -> Result<SlotOutcome> {
        let node = pending.node;
        let slot = &pending.slot;
        let kind = if slot.kind.trim().is_empty() { "reading" } else { slot.kind.trim() };
        let activity_id = activity_id(node.id, slot.slot);
        let variant_id = variant_id(activity_id);

        // ── retrieval ──
        let query = format!("{}\n{}\n{}", node.title, node.metadata.goal, pending.concept_keys.join(" "));
        let query_embedding = match embed_logged(self.llm, STAGE.as_str(), "slot_query", &[query.clone()]).await {
            Ok(mut v) => v.pop().unwrap_or_default(),
            Err(e) => {
                tracing::warn!(node_id = %node.id, error = %e, "query embedding failed; lexical retrieval only");
                Vec::new()
            }
        };
        let retrieved = select_chunk_ids(
            self.store,
            self.vectors,
            &RetrievalRequest {
                material_set_id: self.input.material_set_id,
                query_text: &query,
                query_embedding: &query_embedding,
                file_ids: &self.file_ids,
                allowed_chunks: Some(&self.allowed),
                local: &self.local,
                fill_to_final_k: true,
                params: &self.deps.settings.retrieval,
            },
        )
        .await;
        let excerpts = excerpts_for_ids(&self.chunks_by_id, &retrieved.chunk_ids, &self.limits);
        let charter = self.meta.charter_text();

        // ── generate, repair, validate ──
        let mut errors: Vec<String> = Vec::new();
        let mut attempts = 0;
        let (draft, blocks) = loop {
            attempts += 1;
            let draft: ActivityDraft = generate_typed(
                self.llm,
                STAGE.as_str(),
                "activity",
                &activity_prompt(&ActivityRequest {
                    kind,
                    node_title: &node.title,
                    node_goal: &node.metadata.goal,
                    concept_keys: &pending.concept_keys,
                    excerpts: &excerpts.text,
                    user_profile_doc: self.profile_doc,
                    charter: &charter,
                    knowledge_context: self.knowledge_context,
                    estimated_minutes: slot.estimated_minutes,
                    validation_errors: &errors,
                }),
            )
            .await?;
            let title = if draft.title.trim().is_empty() { node.title.as_str() } else { draft.title.trim() };
            let (blocks, dropped) = decode_blocks(&draft.content_json);
            if dropped > 0 {
                tracing::debug!(activity_id = %activity_id, dropped, "malformed content blocks dropped");
            }
            let blocks = repair(blocks, title, kind, activity_id.as_u128() as u64);
            errors = validate(&blocks, kind);
            if errors.is_empty() {
                break (draft, blocks);
            }
            tracing::warn!(activity_id = %activity_id, attempt = attempts, errors = ?errors, "activity content failed validation");
            if attempts >= self.max_attempts.max(1) {
                return Err(StageError::Validation {
                    stage: STAGE.as_str(),
                    detail: format!("activity {} for node {}: {}", kind, node.id, errors.join("; ")),
                }
                .into());
            }
        };

        // ── bundle ──
        let now = Utc::now();
        let title = if draft.title.trim().is_empty() { node.title.clone() } else { draft.title.trim().to_string() };
        let minutes = if draft.estimated_minutes > 0 { draft.estimated_minutes } else { slot.estimated_minutes.max(1) };
        let content_json = encode_blocks(&blocks);
        let retrieved_set: HashSet<Uuid> = retrieved.chunk_ids.iter().copied().collect();
        let mut cited: Vec<Uuid> = parse_uuids(&draft.citations)
            .into_iter()
            .filter(|id| retrieved_set.contains(id))
            .collect();
        let cite_kind = if cited.is_empty() {
            cited = excerpts.chunk_ids.clone();
            "retrieved"
        } else {
            "cited"
        };
        cited.sort();
        cited.dedup();

        let mut concepts: Vec<ActivityConcept> = Vec::new();
        let mut seen: HashSet<Uuid> = HashSet::new();
        let secondary: Vec<String> = draft.concept_keys.iter().map(|k| normalize_concept_key(k)).collect();
        for (keys, role, weight) in [(&pending.concept_keys, "primary", 1.0), (&secondary, "secondary", 0.5)] {
            for key in keys {
                let Some(&concept_id) = self.concept_ids.get(key) else {
                    continue;
                };
                if seen.insert(concept_id) {
                    concepts.push(ActivityConcept {
                        activity_id,
                        concept_id,
                        role: role.to_string(),
                        weight,
                    });
                }
            }
        }

        let activity = Activity {
            id: activity_id,
            owner_user_id: self.input.owner_user_id,
            path_id: self.path_id,
            kind: kind.to_string(),
            title,
            estimated_minutes: minutes,
            content_json: content_json.clone(),
            metadata: json!({
                "node_id": node.id,
                "slot": slot.slot,
                "concept_keys": pending.concept_keys,
                "inferred_concept_keys": pending.inferred_keys,
                "attempts": attempts,
                "retrieval": Value::Object(retrieved.trace.clone()),
            }),
            created_at: now,
        };
        let link = PathNodeActivity {
            path_node_id: node.id,
            activity_id,
            rank: slot.slot,
            is_primary: slot.slot == 0,
        };
        let bundle = ActivityBundle {
            activity: activity.clone(),
            variant: ActivityVariant {
                id: variant_id,
                activity_id,
                variant: DEFAULT_VARIANT.to_string(),
                content_json,
                created_at: now,
            },
            concepts,
            citations: cited
                .iter()
                .map(|id| ActivityCitation {
                    activity_variant_id: variant_id,
                    material_chunk_id: *id,
                    kind: cite_kind.to_string(),
                })
                .collect(),
            node_activity: link.clone(),
        };

        let ns = activities_path_ns(self.path_id);
        let saga_actions = match self.write_bundle(&bundle, &ns).await {
            Ok(n) => n,
            Err(e) if is_unique_violation(&e) => {
                tracing::info!(activity_id = %activity_id, "slot realized by another worker; no-op");
                return Ok(SlotOutcome {
                    attempts,
                    ..Default::default()
                });
            }
            Err(e) => return Err(e),
        };

        let vector = match embed_logged(self.llm, STAGE.as_str(), "activity", &[blocks_text(&blocks)]).await {
            Ok(mut v) => v.pop().map(|values| {
                let mut metadata = Map::new();
                metadata.insert("type".into(), json!("activity"));
                metadata.insert("activity_id".into(), json!(activity_id.to_string()));
                metadata.insert("path_node_id".into(), json!(node.id.to_string()));
                metadata.insert("kind".into(), json!(kind));
                VectorRecord {
                    id: variant_id.to_string(),
                    values,
                    metadata,
                }
            }),
            Err(e) => {
                tracing::warn!(activity_id = %activity_id, error = %e, "activity embedding failed; vector skipped");
                None
            }
        };

        Ok(SlotOutcome {
            written: true,
            attempts,
            citations: bundle.citations.len(),
            saga_actions,
            vector,
            activity: Some(activity),
            link: Some(link),
        })
    }

    async fn write_bundle(&self, bundle: &ActivityBundle, ns: &str) -> Result<usize> {
        let mut tx = self.store.begin().await?;
        tx.advisory_xact_lock(advisory_key64(STAGE.as_str(), self.path_id)).await?;
        tx.insert_activity_bundle(bundle).await?;
        let appended = saga::append_pinecone_deletes(tx.as_mut(), self.input.saga_id, ns, &[bundle.variant.id.to_string()]).await?;
        tx.commit().await?;
        Ok(appended)
    }
}

fn nodes_fingerprint(nodes: &[PathNode]) -> String {
    let value: Vec<Value> = nodes
        .iter()
        .map(|n| json!({ "id": n.id, "title": n.title, "metadata": n.metadata }))
        .collect();
    sha256_hex(serde_json::to_string(&value).unwrap_or_default().as_bytes())
}

#[async_trait]
impl Stage for RealizeActivities {
    fn name(&self) -> StageName {
        STAGE
    }

    async fn input_hash(&self, deps: &StageDeps, input: &StageInput) -> Result<String> {
        let store = deps.store(STAGE)?;
        let path = resolve_path(store, input).await?;
        let meta = PathMeta::from_value(&path.metadata);
        let material = load_material(store, STAGE, input.material_set_id, &meta.allowed_file_ids()).await?;
        let nodes = store.list_path_nodes(path.id).await?;
        Ok(ArtifactCache::new(store, &deps.settings.cache).input_hash(
            pathweaver_core::artifact::ArtifactInputs::new(&material.files, &material.chunks, &[])
                .allow_files(&material.allow_files)
                .intent(&meta.intake_md)
                .mode(&format!("{}:{}", STAGE.as_str(), nodes_fingerprint(&nodes))),
        ))
    }

    async fn run(&self, ctx: &StageContext, deps: &StageDeps, input: &StageInput) -> Result<Value> {
        deps.require(STAGE, &["store", "llm"])?;
        let store = deps.store(STAGE)?;
        let llm = deps.llm(STAGE)?;
        let progress = ctx.progress_for(STAGE);

        let path = resolve_path(store, input).await?;
        let path_id = path.id;
        let meta = PathMeta::from_value(&path.metadata);
        let material = load_material(store, STAGE, input.material_set_id, &meta.allowed_file_ids()).await?;
        let mut nodes = store.list_path_nodes(path_id).await?;
        nodes.sort_by(|a, b| a.index.cmp(&b.index).then(a.id.cmp(&b.id)));

        let cache = ArtifactCache::new(store, &deps.settings.cache);
        let key = artifact_cache::key(input.owner_user_id, input.material_set_id, path_id, REALIZE_ACTIVITIES);
        let input_hash = self.input_hash(deps, input).await?;
        if cache.lookup(key, &input_hash).await.is_some() {
            return Ok(json!({ "path_id": path_id, "cached": true, "activities": 0 }));
        }

        let concepts = store.concepts_by_scope(ConceptScope::Path, Some(path_id)).await?;
        let realized: HashSet<(Uuid, i32)> = store.realized_slots(path_id).await?.into_iter().collect();
        let pending = pending_slots(&nodes, &realized, &concepts);
        let total_slots: usize = nodes.iter().map(|n| n.metadata.activity_slots.len()).sum();

        let signals = CorpusSignals::from_material(&material.files, &material.chunks, concepts.len());
        let params = realize_params(&signals, pending.len(), &deps.settings.realize);
        let mut adaptive = AdaptiveMeta::new(STAGE.as_str(), &signals);
        adaptive.record("concurrency", &params.concurrency);
        adaptive.record("excerpt_max_chars", &params.excerpt_max_chars);
        adaptive.record("excerpt_max_total", &params.excerpt_max_total);
        tracing::info!(
            path_id = %path_id,
            nodes = nodes.len(),
            slots = total_slots,
            pending = pending.len(),
            concurrency = params.concurrency.actual,
            "realizing activities"
        );

        let text_field = |name: &str| path.metadata.get(name).and_then(Value::as_str).unwrap_or("").to_string();
        let profile_doc = text_field("user_profile_doc");
        let knowledge_context = text_field("user_knowledge_context");
        let env = SlotEnv {
            store,
            llm,
            vectors: deps.vectors(),
            input,
            path_id,
            meta: &meta,
            profile_doc: &profile_doc,
            knowledge_context: &knowledge_context,
            chunks_by_id: material.chunks.iter().map(|c| (c.id, c)).collect(),
            local: material
                .chunks
                .iter()
                .filter(|c| c.has_embedding())
                .map(|c| (c.id, c.embedding.as_slice()))
                .collect(),
            file_ids: material.file_ids(),
            allowed: material.chunks.iter().filter(|c| c.is_usable_text()).map(|c| c.id).collect(),
            concept_ids: concepts
                .iter()
                .map(|c| (c.key.clone(), c.canonical_concept_id.unwrap_or(c.id)))
                .collect(),
            limits: ExcerptLimits {
                per_file: EXCERPT_LINES_PER_FILE,
                max_chars: params.excerpt_max_chars.actual,
                max_lines_per_file: EXCERPT_LINES_PER_FILE,
                max_total: params.excerpt_max_total.actual,
            },
            max_attempts: deps.settings.realize_max_attempts,
            deps,
        };

        let total = pending.len() as u64;
        let env = &env;
        let progress_ref = &progress;
        let jobs: Vec<_> = pending
            .iter()
            .enumerate()
            .map(|(i, slot)| async move {
                ctx.check_cancelled(STAGE)?;
                let out = env.realize(slot).await?;
                progress_ref.update_range(i as u64 + 1, total, 5, 90, "realizing activities");
                Ok::<_, anyhow::Error>(out)
            })
            .collect();
        let outcomes: Vec<SlotOutcome> = stream::iter(jobs)
            .buffered(params.concurrency.actual.max(1))
            .try_collect()
            .await?;

        let written = outcomes.iter().filter(|o| o.written).count();
        let retries: usize = outcomes.iter().map(|o| o.attempts.saturating_sub(1)).sum();
        let citations: usize = outcomes.iter().map(|o| o.citations).sum();
        let saga_actions: usize = outcomes.iter().map(|o| o.saga_actions).sum();
        let mut records = Vec::new();
        let mut activities = Vec::new();
        let mut links = Vec::new();
        for o in outcomes {
            records.extend(o.vector);
            activities.extend(o.activity);
            links.extend(o.link);
        }

        progress.update(92, "upserting activity vectors");
        let pinecone_skipped = upsert_vectors_best_effort(
            deps.vectors(),
            STAGE,
            &activities_path_ns(path_id),
            records,
            params.concurrency.actual,
        )
        .await;
        let mut mirrored = false;
        if let Some(mirror) = deps.mirror.as_deref() {
            if !activities.is_empty() {
                match mirror.upsert_path_activities_graph(path_id, &activities, &links).await {
                    Ok(()) => mirrored = true,
                    Err(e) => tracing::warn!(path_id = %path_id, error = %e, "activity mirror failed; continuing"),
                }
            }
        }

        let output = json!({
            "path_id": path_id,
            "cached": false,
            "nodes": nodes.len(),
            "slots_total": total_slots,
            "already_realized": realized.len(),
            "activities": written,
            "retries": retries,
            "citations": citations,
            "saga_actions": saga_actions,
            "pinecone_skipped": pinecone_skipped,
            "mirrored": mirrored,
            "adaptive": adaptive,
        });
        cache
            .record(key, &input_hash, json!({ "activities": written, "slots_total": total_slots }))
            .await;
        progress.update(100, "activities ready");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pathweaver_core::models::{ConceptMetadata, NodeMetadata};

    fn node(title: &str, goal: &str, slots: Vec<ActivitySlot>, keys: &[&str]) -> PathNode {
        PathNode {
            id: Uuid::new_v4(),
            path_id: Uuid::nil(),
            parent_node_id: None,
            index: 0,
            title: title.to_string(),
            metadata: NodeMetadata {
                goal: goal.to_string(),
                difficulty: String::new(),
                concept_keys: keys.iter().map(|k| k.to_string()).collect(),
                activity_slots: slots,
            },
        }
    }

    fn concept(key: &str, importance: i32) -> Concept {
        let now = Utc::now();
        Concept {
            id: Uuid::new_v4(),
            scope: ConceptScope::Path,
            scope_id: Some(Uuid::nil()),
            parent_id: None,
            key: key.to_string(),
            name: key.replace('_', " "),
            summary: String::new(),
            key_points: Vec::new(),
            depth: 0,
            sort_index: 0,
            vector_id: String::new(),
            metadata: ConceptMetadata {
                importance,
                ..Default::default()
            },
            canonical_concept_id: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    fn slot(n: i32, keys: &[&str]) -> ActivitySlot {
        ActivitySlot {
            slot: n,
            kind: "reading".into(),
            estimated_minutes: 10,
            primary_concept_keys: keys.iter().map(|k| k.to_string()).collect(),
        }
    }

    #[test]
    fn test_activity_ids_are_stable() {
        let n = Uuid::new_v4();
        assert_eq!(activity_id(n, 1), activity_id(n, 1));
        assert_ne!(activity_id(n, 1), activity_id(n, 2));
        assert_ne!(variant_id(activity_id(n, 1)), activity_id(n, 1));
    }

    #[test]
    fn test_realized_slots_are_skipped() {
        let nodes = vec![node("Limits", "", vec![slot(1, &["limit"]), slot(0, &["limit"])], &[])];
        let realized: HashSet<(Uuid, i32)> = [(nodes[0].id, 0)].into_iter().collect();
        let pending = pending_slots(&nodes, &realized, &[]);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].slot.slot, 1);
    }

    #[test]
    fn test_primary_keys_ordered_by_importance() {
        let concepts = vec![concept("limit", 3), concept("derivative", 9)];
        let nodes = vec![node("Calculus", "", vec![slot(0, &["limit", "Derivative"])], &[])];
        let pending = pending_slots(&nodes, &HashSet::new(), &concepts);
        assert_eq!(pending[0].concept_keys, vec!["derivative", "limit"]);
        assert!(!pending[0].inferred_keys);
    }

    #[test]
    fn test_missing_keys_inferred_from_title_and_goal() {
        let concepts = vec![concept("chain_rule", 5), concept("integration_by_parts", 5), concept("limit", 1)];
        let nodes = vec![node("The chain rule", "Differentiate composed functions", vec![slot(0, &[])], &[])];
        let pending = pending_slots(&nodes, &HashSet::new(), &concepts);
        assert!(pending[0].inferred_keys);
        assert_eq!(pending[0].concept_keys, vec!["chain_rule"]);
    }
}
