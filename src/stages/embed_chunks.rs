//! `embed_chunks`: fill missing chunk embeddings.
//!
//! Embeds every usable chunk of the material set that has no vector yet,
//! writes the vectors to the chunk rows, then upserts them into
//! `chunks:<material_set_id>` as a cache for dense retrieval.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use pathweaver_core::adaptive::{embed_params, AdaptiveMeta, CorpusSignals};
use pathweaver_core::artifact::ArtifactInputs;
use pathweaver_core::models::MaterialChunk;

use super::{load_material, resolve_path, upsert_vectors_best_effort, Stage, StageContext, StageDeps, StageInput, StageName};
use crate::artifact_cache::{self, ArtifactCache, EMBED_CHUNKS};
use crate::llm::embed_logged;
use crate::saga;
use crate::vectors::{chunks_ns, VectorRecord};

const STAGE: StageName = StageName::EmbedChunks;

pub struct EmbedChunks;

impl EmbedChunks {
    fn inputs(material: &super::Material) -> ArtifactInputs {
        ArtifactInputs::new(&material.files, &material.chunks, &[]).mode(STAGE.as_str())
    }
}

#[async_trait]
impl Stage for EmbedChunks {
    fn name(&self) -> StageName {
        STAGE
    }

    async fn input_hash(&self, deps: &StageDeps, input: &StageInput) -> Result<String> {
        let store = deps.store(STAGE)?;
        let material = load_material(store, STAGE, input.material_set_id, &[]).await?;
        Ok(ArtifactCache::new(store, &deps.settings.cache).input_hash(Self::inputs(&material)))
    }

    async fn run(&self, ctx: &StageContext, deps: &StageDeps, input: &StageInput) -> Result<Value> {
        deps.require(STAGE, &["store", "llm"])?;
        let store = deps.store(STAGE)?;
        let llm = deps.llm(STAGE)?;
        let progress = ctx.progress_for(STAGE);

        let path = resolve_path(store, input).await?;
        let material = load_material(store, STAGE, input.material_set_id, &[]).await?;

        // Set-level artifact: keyed on the nil path.
        let cache = ArtifactCache::new(store, &deps.settings.cache);
        let input_hash = cache.input_hash(Self::inputs(&material));
        let key = artifact_cache::key(input.owner_user_id, input.material_set_id, Uuid::nil(), EMBED_CHUNKS);
        if cache.lookup(key, &input_hash).await.is_some() {
            return Ok(json!({
                "path_id": path.id,
                "cached": true,
                "embedded": 0,
            }));
        }

        let mut pending: Vec<&MaterialChunk> = material
            .chunks
            .iter()
            .filter(|c| c.is_usable_text() && !c.has_embedding())
            .collect();
        pending.sort_by_key(|c| c.id);
        let unusable = material.chunks.iter().filter(|c| !c.is_usable_text()).count();
        let already = material.chunks.len() - pending.len() - unusable;

        let signals = CorpusSignals::from_material(&material.files, &material.chunks, 0);
        let avg_chars = if pending.is_empty() {
            0
        } else {
            pending.iter().map(|c| c.text.len()).sum::<usize>() / pending.len()
        };
        let params = embed_params(
            pending.len(),
            avg_chars,
            deps.settings.embed_batch_size,
            deps.settings.embed_concurrency,
        );
        let mut adaptive = AdaptiveMeta::new(STAGE.as_str(), &signals);
        adaptive.record("batch_size", &params.batch_size);
        adaptive.record("concurrency", &params.concurrency);

        tracing::info!(
            set = %input.material_set_id,
            pending = pending.len(),
            already,
            unusable,
            batch_size = params.batch_size.actual,
            "embedding chunks"
        );

        let batches: Vec<(Vec<Uuid>, Vec<String>)> = pending
            .chunks(params.batch_size.actual.max(1))
            .map(|b| (b.iter().map(|c| c.id).collect(), b.iter().map(|c| c.text.clone()).collect()))
            .collect();
        let total_batches = batches.len() as u64;
        let progress = &progress;
        let jobs: Vec<_> = batches
            .into_iter()
            .enumerate()
            .map(|(i, (ids, texts))| async move {
                ctx.check_cancelled(STAGE)?;
                let vectors = embed_logged(llm, STAGE.as_str(), "chunks", &texts).await?;
                progress.update_range(i as u64 + 1, total_batches, 5, 80, "embedding chunks");
                Ok::<_, anyhow::Error>(ids.into_iter().zip(vectors).collect::<Vec<_>>())
            })
            .collect();
        let embedded: Vec<Vec<(Uuid, Vec<f32>)>> = stream::iter(jobs)
            .buffered(params.concurrency.actual.max(1))
            .try_collect()
            .await?;
        let rows: Vec<(Uuid, Vec<f32>)> = embedded.into_iter().flatten().collect();
        if !rows.is_empty() {
            store.update_chunk_embeddings(&rows).await?;
        }

        let ns = chunks_ns(input.material_set_id);
        let file_of: std::collections::HashMap<Uuid, Uuid> =
            material.chunks.iter().map(|c| (c.id, c.material_file_id)).collect();
        let records: Vec<VectorRecord> = rows
            .iter()
            .map(|(id, values)| {
                let mut metadata = Map::new();
                metadata.insert("type".into(), json!("chunk"));
                if let Some(file_id) = file_of.get(id) {
                    metadata.insert("file_id".into(), json!(file_id.to_string()));
                }
                VectorRecord {
                    id: id.to_string(),
                    values: values.clone(),
                    metadata,
                }
            })
            .collect();

        let mut saga_actions = 0;
        if !records.is_empty() {
            let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
            let mut tx = store.begin().await?;
            saga_actions = saga::append_pinecone_deletes(tx.as_mut(), input.saga_id, &ns, &ids).await?;
            tx.commit().await?;
        }
        progress.update(85, "upserting chunk vectors");
        let pinecone_skipped =
            upsert_vectors_best_effort(deps.vectors(), STAGE, &ns, records, params.concurrency.actual).await;

        let output = json!({
            "path_id": path.id,
            "cached": false,
            "chunks_total": material.chunks.len(),
            "embedded": rows.len(),
            "already_embedded": already,
            "skipped_unusable": unusable,
            "saga_actions": saga_actions,
            "pinecone_skipped": pinecone_skipped,
            "adaptive": adaptive,
        });
        cache
            .record(key, &input_hash, json!({ "embedded": rows.len(), "chunks_total": material.chunks.len() }))
            .await;
        progress.update(100, "chunk embeddings ready");
        Ok(output)
    }
}
