//! Postgres [`Store`] implementation.
//!
//! Runtime-checked `sqlx::query` statements over a shared [`PgPool`].
//! JSON columns are `JSONB`; chunk embeddings are stored as JSON text
//! (see `pathweaver_core::embedding`). Schema lives in [`crate::migrate`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use pathweaver_core::embedding::{decode_embedding_json, encode_embedding_json};
use pathweaver_core::models::{
    ActivityBundle, ChunkMetadata, Concept, ConceptEdge, ConceptEvidence, ConceptMetadata, ConceptScope, EdgeEvidence,
    EdgeType, LearningArtifact, MaterialChunk, MaterialFile, MaterialFileSignature, NodeMetadata, Path, PathNode,
    SagaAction, SagaActionKind, SignatureQuality, StructuralDecisionTrace,
};
use pathweaver_core::path_meta::merge_allowed;

use super::{ArtifactKey, Store, StoreTx};
use crate::error::StoreError;

const CONCEPT_COLS: &str = "id, scope, scope_id, parent_id, key, name, summary, key_points, depth, sort_index, \
     vector_id, metadata, canonical_concept_id, created_at, updated_at, deleted_at";

const EDGE_COLS: &str = "id, from_concept_id, to_concept_id, edge_type, strength, evidence, deleted_at";

const EVIDENCE_COLS: &str = "id, concept_id, material_chunk_id, kind, weight, deleted_at";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn concept_from_row(row: &PgRow) -> Result<Concept> {
    let scope: String = row.try_get("scope")?;
    let key_points: Json<Vec<String>> = row.try_get("key_points")?;
    let metadata: Json<ConceptMetadata> = row.try_get("metadata")?;
    Ok(Concept {
        id: row.try_get("id")?,
        scope: ConceptScope::parse(&scope).ok_or_else(|| anyhow::anyhow!("unknown concept scope: {}", scope))?,
        scope_id: row.try_get("scope_id")?,
        parent_id: row.try_get("parent_id")?,
        key: row.try_get("key")?,
        name: row.try_get("name")?,
        summary: row.try_get("summary")?,
        key_points: key_points.0,
        depth: row.try_get("depth")?,
        sort_index: row.try_get("sort_index")?,
        vector_id: row.try_get("vector_id")?,
        metadata: metadata.0,
        canonical_concept_id: row.try_get("canonical_concept_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn edge_from_row(row: &PgRow) -> Result<ConceptEdge> {
    let edge_type: String = row.try_get("edge_type")?;
    let evidence: Json<EdgeEvidence> = row.try_get("evidence")?;
    Ok(ConceptEdge {
        id: row.try_get("id")?,
        from_concept_id: row.try_get("from_concept_id")?,
        to_concept_id: row.try_get("to_concept_id")?,
        edge_type: EdgeType::parse(&edge_type).unwrap_or(EdgeType::Related),
        strength: row.try_get("strength")?,
        evidence: evidence.0,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn evidence_from_row(row: &PgRow) -> Result<ConceptEvidence> {
    Ok(ConceptEvidence {
        id: row.try_get("id")?,
        concept_id: row.try_get("concept_id")?,
        material_chunk_id: row.try_get("material_chunk_id")?,
        kind: row.try_get("kind")?,
        weight: row.try_get("weight")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn path_from_row(row: &PgRow) -> Result<Path> {
    Ok(Path {
        id: row.try_get("id")?,
        owner_user_id: row.try_get("owner_user_id")?,
        material_set_id: row.try_get("material_set_id")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn chunk_from_row(row: &PgRow) -> Result<MaterialChunk> {
    let raw_embedding: String = row.try_get("embedding")?;
    let embedding = if raw_embedding.trim().is_empty() {
        Vec::new()
    } else {
        decode_embedding_json(&raw_embedding)?
    };
    let metadata: Json<ChunkMetadata> = row.try_get("metadata")?;
    Ok(MaterialChunk {
        id: row.try_get("id")?,
        material_file_id: row.try_get("material_file_id")?,
        index: row.try_get("chunk_index")?,
        page: row.try_get("page")?,
        text: row.try_get("text")?,
        embedding,
        metadata: metadata.0,
        updated_at: row.try_get("updated_at")?,
    })
}

fn saga_from_row(row: &PgRow) -> Result<SagaAction> {
    let kind: String = row.try_get("kind")?;
    Ok(SagaAction {
        id: row.try_get("id")?,
        saga_id: row.try_get("saga_id")?,
        seq: row.try_get("seq")?,
        kind: SagaActionKind::parse(&kind).ok_or_else(|| anyhow::anyhow!("unknown saga action kind: {}", kind))?,
        action_key: row.try_get("action_key")?,
        payload: row.try_get("payload")?,
        status: row.try_get("status")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Maps SQLSTATE 23505 to [`StoreError::UniqueViolation`].
fn classify(err: sqlx::Error) -> anyhow::Error {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some("23505") {
            return StoreError::UniqueViolation {
                constraint: db.constraint().unwrap_or("unknown").to_string(),
            }
            .into();
        }
    }
    err.into()
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await.context("begin transaction")?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn ensure_path(&self, owner_user_id: Uuid, material_set_id: Uuid) -> Result<Path> {
        // ON CONFLICT DO UPDATE so RETURNING yields the winning row.
        let row = sqlx::query(
            r#"
            INSERT INTO learning_paths (id, owner_user_id, material_set_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (owner_user_id, material_set_id)
            DO UPDATE SET owner_user_id = EXCLUDED.owner_user_id
            RETURNING id, owner_user_id, material_set_id, metadata, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(owner_user_id)
        .bind(material_set_id)
        .fetch_one(&self.pool)
        .await
        .context("ensure path")?;
        path_from_row(&row)
    }

    async fn get_path(&self, path_id: Uuid) -> Result<Option<Path>> {
        let row = sqlx::query(
            "SELECT id, owner_user_id, material_set_id, metadata, created_at, updated_at FROM learning_paths WHERE id = $1",
        )
        .bind(path_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(path_from_row).transpose()
    }

    async fn merge_path_metadata(&self, path_id: Uuid, patch: &Map<String, Value>) -> Result<Path> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT metadata FROM learning_paths WHERE id = $1 FOR UPDATE")
            .bind(path_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "path",
                id: path_id.to_string(),
            })?;
        let mut metadata: Value = row.try_get("metadata")?;
        let rejected = merge_allowed(&mut metadata, patch);
        if !rejected.is_empty() {
            tracing::warn!(path_id = %path_id, ?rejected, "ignored unknown path metadata keys");
        }
        let row = sqlx::query(
            r#"
            UPDATE learning_paths SET metadata = $2, updated_at = now() WHERE id = $1
            RETURNING id, owner_user_id, material_set_id, metadata, created_at, updated_at
            "#,
        )
        .bind(path_id)
        .bind(&metadata)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        path_from_row(&row)
    }

    async fn list_path_nodes(&self, path_id: Uuid) -> Result<Vec<PathNode>> {
        let rows = sqlx::query(
            "SELECT id, path_id, parent_node_id, node_index, title, metadata FROM path_nodes \
             WHERE path_id = $1 ORDER BY node_index, id",
        )
        .bind(path_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let metadata: Value = row.try_get("metadata")?;
                Ok(PathNode {
                    id: row.try_get("id")?,
                    path_id: row.try_get("path_id")?,
                    parent_node_id: row.try_get("parent_node_id")?,
                    index: row.try_get("node_index")?,
                    title: row.try_get("title")?,
                    // Malformed node metadata degrades to empty slots.
                    metadata: serde_json::from_value::<NodeMetadata>(metadata).unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn realized_slots(&self, path_id: Uuid) -> Result<Vec<(Uuid, i32)>> {
        let rows = sqlx::query(
            r#"
            SELECT pna.path_node_id, pna.rank
            FROM path_node_activities pna
            JOIN path_nodes pn ON pn.id = pna.path_node_id
            WHERE pn.path_id = $1
            ORDER BY pna.path_node_id, pna.rank
            "#,
        )
        .bind(path_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| Ok((r.try_get("path_node_id")?, r.try_get("rank")?)))
            .collect()
    }

    async fn list_material_files(&self, material_set_id: Uuid) -> Result<Vec<MaterialFile>> {
        let rows = sqlx::query(
            r#"
            SELECT id, material_set_id, original_name, mime_type, size_bytes, storage_key, status,
                   extracted_kind, created_at, updated_at, extracted_at
            FROM material_files WHERE material_set_id = $1 ORDER BY created_at, id
            "#,
        )
        .bind(material_set_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(MaterialFile {
                    id: row.try_get("id")?,
                    material_set_id: row.try_get("material_set_id")?,
                    original_name: row.try_get("original_name")?,
                    mime_type: row.try_get("mime_type")?,
                    size_bytes: row.try_get("size_bytes")?,
                    storage_key: row.try_get("storage_key")?,
                    status: row.try_get("status")?,
                    extracted_kind: row.try_get("extracted_kind")?,
                    created_at: row.try_get("created_at")?,
                    updated_at: row.try_get("updated_at")?,
                    extracted_at: row.try_get("extracted_at")?,
                })
            })
            .collect()
    }

    async fn list_chunks_for_files(&self, file_ids: &[Uuid]) -> Result<Vec<MaterialChunk>> {
        if file_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT id, material_file_id, chunk_index, page, text, embedding, metadata, updated_at
            FROM material_chunks WHERE material_file_id = ANY($1)
            ORDER BY material_file_id, chunk_index
            "#,
        )
        .bind(file_ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn update_chunk_metadata(&self, chunk_id: Uuid, metadata: &ChunkMetadata) -> Result<()> {
        sqlx::query("UPDATE material_chunks SET metadata = $2, updated_at = now() WHERE id = $1")
            .bind(chunk_id)
            .bind(Json(metadata))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_chunk_embeddings(&self, rows: &[(Uuid, Vec<f32>)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (id, embedding) in rows {
            sqlx::query("UPDATE material_chunks SET embedding = $2 WHERE id = $1")
                .bind(id)
                .bind(encode_embedding_json(embedding))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_file_signatures(&self, file_ids: &[Uuid]) -> Result<Vec<MaterialFileSignature>> {
        if file_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT material_file_id, version, fingerprint, concept_keys, quality, updated_at
            FROM material_file_signatures WHERE material_file_id = ANY($1)
            "#,
        )
        .bind(file_ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let keys: Json<Vec<String>> = row.try_get("concept_keys")?;
                let quality: Json<SignatureQuality> = row.try_get("quality")?;
                Ok(MaterialFileSignature {
                    material_file_id: row.try_get("material_file_id")?,
                    version: row.try_get("version")?,
                    fingerprint: row.try_get("fingerprint")?,
                    concept_keys: keys.0,
                    quality: quality.0,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }

    async fn lexical_search_chunks(&self, file_ids: &[Uuid], query: &str, limit: usize) -> Result<Vec<Uuid>> {
        if file_ids.is_empty() || query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM material_chunks
            WHERE material_file_id = ANY($1)
              AND to_tsvector('english', text) @@ plainto_tsquery('english', $2)
            ORDER BY ts_rank(to_tsvector('english', text), plainto_tsquery('english', $2)) DESC, id
            LIMIT $3
            "#,
        )
        .bind(file_ids)
        .bind(query)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn concepts_by_scope(&self, scope: ConceptScope, scope_id: Option<Uuid>) -> Result<Vec<Concept>> {
        let sql = format!(
            "SELECT {} FROM concepts WHERE scope = $1 AND scope_id IS NOT DISTINCT FROM $2 \
             AND deleted_at IS NULL ORDER BY sort_index, key",
            CONCEPT_COLS
        );
        let rows = sqlx::query(&sql)
            .bind(scope.as_str())
            .bind(scope_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(concept_from_row).collect()
    }

    async fn concepts_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Concept>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM concepts WHERE id = ANY($1) AND deleted_at IS NULL",
            CONCEPT_COLS
        );
        let rows = sqlx::query(&sql).bind(ids).fetch_all(&self.pool).await?;
        rows.iter().map(concept_from_row).collect()
    }

    async fn evidence_for_chunks(&self, chunk_ids: &[Uuid]) -> Result<Vec<ConceptEvidence>> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM concept_evidence WHERE material_chunk_id = ANY($1) AND deleted_at IS NULL",
            EVIDENCE_COLS
        );
        let rows = sqlx::query(&sql).bind(chunk_ids).fetch_all(&self.pool).await?;
        rows.iter().map(evidence_from_row).collect()
    }

    async fn evidence_for_concepts(&self, concept_ids: &[Uuid]) -> Result<Vec<ConceptEvidence>> {
        if concept_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM concept_evidence WHERE concept_id = ANY($1) AND deleted_at IS NULL",
            EVIDENCE_COLS
        );
        let rows = sqlx::query(&sql).bind(concept_ids).fetch_all(&self.pool).await?;
        rows.iter().map(evidence_from_row).collect()
    }

    async fn edges_for_concepts(&self, concept_ids: &[Uuid]) -> Result<Vec<ConceptEdge>> {
        if concept_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM concept_edges \
             WHERE (from_concept_id = ANY($1) OR to_concept_id = ANY($1)) AND deleted_at IS NULL",
            EDGE_COLS
        );
        let rows = sqlx::query(&sql).bind(concept_ids).fetch_all(&self.pool).await?;
        rows.iter().map(edge_from_row).collect()
    }

    async fn get_artifact(&self, key: ArtifactKey<'_>) -> Result<Option<LearningArtifact>> {
        let row = sqlx::query(
            r#"
            SELECT owner_user_id, material_set_id, path_id, artifact_type, input_hash, version, metadata, updated_at
            FROM learning_artifacts
            WHERE owner_user_id = $1 AND material_set_id = $2 AND path_id = $3 AND artifact_type = $4
            "#,
        )
        .bind(key.owner_user_id)
        .bind(key.material_set_id)
        .bind(key.path_id)
        .bind(key.artifact_type)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            Ok(LearningArtifact {
                owner_user_id: row.try_get("owner_user_id")?,
                material_set_id: row.try_get("material_set_id")?,
                path_id: row.try_get("path_id")?,
                artifact_type: row.try_get("artifact_type")?,
                input_hash: row.try_get("input_hash")?,
                version: row.try_get("version")?,
                metadata: row.try_get("metadata")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    async fn upsert_artifact(&self, artifact: &LearningArtifact) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO learning_artifacts
                (owner_user_id, material_set_id, path_id, artifact_type, input_hash, version, metadata, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (owner_user_id, material_set_id, path_id, artifact_type) DO UPDATE SET
                input_hash = EXCLUDED.input_hash,
                version = EXCLUDED.version,
                metadata = EXCLUDED.metadata,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(artifact.owner_user_id)
        .bind(artifact.material_set_id)
        .bind(artifact.path_id)
        .bind(&artifact.artifact_type)
        .bind(&artifact.input_hash)
        .bind(artifact.version)
        .bind(&artifact.metadata)
        .bind(artifact.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn saga_actions(&self, saga_id: Uuid) -> Result<Vec<SagaAction>> {
        let rows = sqlx::query(
            "SELECT id, saga_id, seq, kind, action_key, payload, status, created_at \
             FROM saga_actions WHERE saga_id = $1 ORDER BY seq",
        )
        .bind(saga_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(saga_from_row).collect()
    }

    async fn mark_saga_action(&self, action_id: Uuid, status: &str) -> Result<()> {
        sqlx::query("UPDATE saga_actions SET status = $2 WHERE id = $1")
            .bind(action_id)
            .bind(status)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_decision_trace(&self, trace: &StructuralDecisionTrace) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO structural_decision_traces
                (id, occurred_at, owner_user_id, path_id, decision_type, graph_version, embedding_version,
                 taxonomy_version, clustering_version, calibration_version, inputs)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(trace.id)
        .bind(trace.occurred_at)
        .bind(trace.owner_user_id)
        .bind(trace.path_id)
        .bind(&trace.decision_type)
        .bind(&trace.graph_version)
        .bind(&trace.embedding_version)
        .bind(&trace.taxonomy_version)
        .bind(&trace.clustering_version)
        .bind(&trace.calibration_version)
        .bind(&trace.inputs)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

impl PgTx {
    async fn insert_concept(&mut self, c: &Concept) -> Result<()> {
        self.insert_concept_with(c, "").await.map(|_| ())
    }

    /// Insert one concept row with an optional `ON CONFLICT` clause.
    /// Returns whether a row was written.
    async fn insert_concept_with(&mut self, c: &Concept, on_conflict: &str) -> Result<bool> {
        let sql = format!(
            r#"
            INSERT INTO concepts
                (id, scope, scope_id, parent_id, key, name, summary, key_points, depth, sort_index,
                 vector_id, metadata, canonical_concept_id, created_at, updated_at, deleted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            {}
            "#,
            on_conflict
        );
        let result = sqlx::query(&sql)
            .bind(c.id)
            .bind(c.scope.as_str())
            .bind(c.scope_id)
            .bind(c.parent_id)
            .bind(&c.key)
            .bind(&c.name)
            .bind(&c.summary)
            .bind(Json(&c.key_points))
            .bind(c.depth)
            .bind(c.sort_index)
            .bind(&c.vector_id)
            .bind(Json(&c.metadata))
            .bind(c.canonical_concept_id)
            .bind(c.created_at)
            .bind(c.updated_at)
            .bind(c.deleted_at)
            .execute(&mut *self.tx)
            .await
            .map_err(classify)?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl StoreTx for PgTx {
    async fn advisory_xact_lock(&mut self, key: i64) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(key)
            .execute(&mut *self.tx)
            .await
            .context("pg_advisory_xact_lock")?;
        Ok(())
    }

    async fn concepts_by_scope(&mut self, scope: ConceptScope, scope_id: Option<Uuid>) -> Result<Vec<Concept>> {
        let sql = format!(
            "SELECT {} FROM concepts WHERE scope = $1 AND scope_id IS NOT DISTINCT FROM $2 \
             AND deleted_at IS NULL ORDER BY sort_index, key",
            CONCEPT_COLS
        );
        let rows = sqlx::query(&sql)
            .bind(scope.as_str())
            .bind(scope_id)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(concept_from_row).collect()
    }

    async fn insert_concepts(&mut self, concepts: &[Concept]) -> Result<()> {
        for c in concepts {
            self.insert_concept(c).await?;
        }
        Ok(())
    }

    async fn set_concept_parent(&mut self, concept_id: Uuid, parent_id: Option<Uuid>) -> Result<()> {
        sqlx::query("UPDATE concepts SET parent_id = $2, updated_at = now() WHERE id = $1")
            .bind(concept_id)
            .bind(parent_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn insert_evidence(&mut self, rows: &[ConceptEvidence]) -> Result<usize> {
        let mut inserted = 0usize;
        for e in rows {
            let result = sqlx::query(
                r#"
                INSERT INTO concept_evidence (id, concept_id, material_chunk_id, kind, weight, deleted_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (concept_id, material_chunk_id) DO NOTHING
                "#,
            )
            .bind(e.id)
            .bind(e.concept_id)
            .bind(e.material_chunk_id)
            .bind(&e.kind)
            .bind(e.weight.max(0.0))
            .bind(e.deleted_at)
            .execute(&mut *self.tx)
            .await
            .map_err(classify)?;
            inserted += result.rows_affected() as usize;
        }
        Ok(inserted)
    }

    async fn upsert_edges(&mut self, edges: &[ConceptEdge]) -> Result<()> {
        for e in edges {
            sqlx::query(
                r#"
                INSERT INTO concept_edges (id, from_concept_id, to_concept_id, edge_type, strength, evidence)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (from_concept_id, to_concept_id, edge_type) DO UPDATE SET
                    strength = GREATEST(concept_edges.strength, EXCLUDED.strength),
                    evidence = CASE WHEN EXCLUDED.strength >= concept_edges.strength
                                    THEN EXCLUDED.evidence ELSE concept_edges.evidence END,
                    deleted_at = NULL
                "#,
            )
            .bind(e.id)
            .bind(e.from_concept_id)
            .bind(e.to_concept_id)
            .bind(e.edge_type.as_str())
            .bind(e.strength)
            .bind(Json(&e.evidence))
            .execute(&mut *self.tx)
            .await
            .map_err(classify)?;
        }
        Ok(())
    }

    async fn find_global_concepts(&mut self, keys: &[String]) -> Result<Vec<Concept>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM concepts WHERE scope = 'global' AND deleted_at IS NULL \
             AND (key = ANY($1) OR COALESCE(metadata->'aliases', '[]'::jsonb) ?| $1) \
             ORDER BY key, id",
            CONCEPT_COLS
        );
        let rows = sqlx::query(&sql).bind(keys).fetch_all(&mut *self.tx).await?;
        rows.iter().map(concept_from_row).collect()
    }

    async fn insert_global_concept_if_absent(&mut self, concept: &Concept) -> Result<Concept> {
        let sql = format!(
            "SELECT {} FROM concepts WHERE scope = 'global' AND scope_id IS NULL AND key = $1 \
             AND deleted_at IS NULL",
            CONCEPT_COLS
        );
        if let Some(row) = sqlx::query(&sql)
            .bind(&concept.key)
            .fetch_optional(&mut *self.tx)
            .await?
        {
            return concept_from_row(&row);
        }
        if self.insert_concept_with(concept, "ON CONFLICT DO NOTHING").await? {
            return Ok(concept.clone());
        }
        // The key is taken by a row committed after our lookup or by a
        // soft-deleted row. Either way that row becomes the live global.
        let sql = format!(
            "UPDATE concepts SET deleted_at = NULL, updated_at = now() \
             WHERE scope = 'global' AND scope_id IS NULL AND key = $1 RETURNING {}",
            CONCEPT_COLS
        );
        match sqlx::query(&sql)
            .bind(&concept.key)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(classify)?
        {
            Some(row) => concept_from_row(&row),
            None => Err(StoreError::Conflict(format!(
                "global concept {} conflicted on insert but no row holds its key",
                concept.key
            ))
            .into()),
        }
    }

    async fn set_canonical_concept(&mut self, concept_id: Uuid, canonical_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE concepts SET canonical_concept_id = $2, updated_at = now() WHERE id = $1")
            .bind(concept_id)
            .bind(canonical_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn insert_activity_bundle(&mut self, bundle: &ActivityBundle) -> Result<()> {
        let a = &bundle.activity;
        sqlx::query(
            r#"
            INSERT INTO activities
                (id, owner_user_id, path_id, kind, title, estimated_minutes, content_json, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(a.id)
        .bind(a.owner_user_id)
        .bind(a.path_id)
        .bind(&a.kind)
        .bind(&a.title)
        .bind(a.estimated_minutes)
        .bind(&a.content_json)
        .bind(&a.metadata)
        .bind(a.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(classify)?;

        let v = &bundle.variant;
        sqlx::query(
            "INSERT INTO activity_variants (id, activity_id, variant, content_json, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(v.id)
        .bind(v.activity_id)
        .bind(&v.variant)
        .bind(&v.content_json)
        .bind(v.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(classify)?;

        for c in &bundle.concepts {
            sqlx::query(
                "INSERT INTO activity_concepts (activity_id, concept_id, role, weight) VALUES ($1, $2, $3, $4) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(c.activity_id)
            .bind(c.concept_id)
            .bind(&c.role)
            .bind(c.weight)
            .execute(&mut *self.tx)
            .await?;
        }
        for c in &bundle.citations {
            sqlx::query(
                "INSERT INTO activity_citations (activity_variant_id, material_chunk_id, kind) VALUES ($1, $2, $3) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(c.activity_variant_id)
            .bind(c.material_chunk_id)
            .bind(&c.kind)
            .execute(&mut *self.tx)
            .await?;
        }

        let link = &bundle.node_activity;
        sqlx::query(
            "INSERT INTO path_node_activities (path_node_id, activity_id, rank, is_primary) VALUES ($1, $2, $3, $4)",
        )
        .bind(link.path_node_id)
        .bind(link.activity_id)
        .bind(link.rank)
        .bind(link.is_primary)
        .execute(&mut *self.tx)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn append_saga_action(
        &mut self,
        saga_id: Uuid,
        kind: SagaActionKind,
        action_key: &str,
        payload: &Value,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO saga_actions (id, saga_id, seq, kind, action_key, payload)
            SELECT $1, $2, COALESCE(MAX(seq), 0) + 1, $3, $4, $5 FROM saga_actions WHERE saga_id = $2
            ON CONFLICT (saga_id, action_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(saga_id)
        .bind(kind.as_str())
        .bind(action_key)
        .bind(payload)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn restore_soft_deleted_graph(&mut self, path_id: Uuid) -> Result<u64> {
        let restored = sqlx::query(
            "UPDATE concepts SET deleted_at = NULL, updated_at = now() \
             WHERE scope = 'path' AND scope_id = $1 AND deleted_at IS NOT NULL",
        )
        .bind(path_id)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();
        sqlx::query(
            "UPDATE concept_evidence SET deleted_at = NULL WHERE deleted_at IS NOT NULL AND concept_id IN \
             (SELECT id FROM concepts WHERE scope = 'path' AND scope_id = $1)",
        )
        .bind(path_id)
        .execute(&mut *self.tx)
        .await?;
        sqlx::query(
            "UPDATE concept_edges SET deleted_at = NULL WHERE deleted_at IS NOT NULL AND \
             (from_concept_id IN (SELECT id FROM concepts WHERE scope = 'path' AND scope_id = $1) \
              OR to_concept_id IN (SELECT id FROM concepts WHERE scope = 'path' AND scope_id = $1))",
        )
        .bind(path_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(restored)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(classify)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
