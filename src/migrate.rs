use anyhow::Result;
use sqlx::PgPool;

use crate::config::Config;
use crate::db;

/// Idempotent schema setup; safe to run on every deploy.
const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS material_sets (
        id UUID PRIMARY KEY,
        owner_user_id UUID NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS material_files (
        id UUID PRIMARY KEY,
        material_set_id UUID NOT NULL REFERENCES material_sets(id),
        original_name TEXT NOT NULL,
        mime_type TEXT NOT NULL DEFAULT '',
        size_bytes BIGINT NOT NULL DEFAULT 0,
        storage_key TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'pending',
        extracted_kind TEXT NOT NULL DEFAULT '',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        extracted_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS material_chunks (
        id UUID PRIMARY KEY,
        material_file_id UUID NOT NULL REFERENCES material_files(id),
        chunk_index INTEGER NOT NULL,
        page INTEGER,
        text TEXT NOT NULL,
        embedding TEXT NOT NULL DEFAULT '',
        metadata JSONB NOT NULL DEFAULT '{}',
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (material_file_id, chunk_index)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS material_file_signatures (
        material_file_id UUID PRIMARY KEY REFERENCES material_files(id),
        version INTEGER NOT NULL DEFAULT 1,
        fingerprint TEXT NOT NULL DEFAULT '',
        concept_keys JSONB NOT NULL DEFAULT '[]',
        quality JSONB NOT NULL DEFAULT '{}',
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS learning_paths (
        id UUID PRIMARY KEY,
        owner_user_id UUID NOT NULL,
        material_set_id UUID NOT NULL,
        metadata JSONB NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (owner_user_id, material_set_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS path_nodes (
        id UUID PRIMARY KEY,
        path_id UUID NOT NULL REFERENCES learning_paths(id),
        parent_node_id UUID,
        node_index INTEGER NOT NULL,
        title TEXT NOT NULL,
        metadata JSONB NOT NULL DEFAULT '{}'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS concepts (
        id UUID PRIMARY KEY,
        scope TEXT NOT NULL,
        scope_id UUID,
        parent_id UUID REFERENCES concepts(id),
        key TEXT NOT NULL,
        name TEXT NOT NULL,
        summary TEXT NOT NULL DEFAULT '',
        key_points JSONB NOT NULL DEFAULT '[]',
        depth INTEGER NOT NULL DEFAULT 0,
        sort_index INTEGER NOT NULL DEFAULT 0,
        vector_id TEXT NOT NULL DEFAULT '',
        metadata JSONB NOT NULL DEFAULT '{}',
        canonical_concept_id UUID REFERENCES concepts(id),
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        deleted_at TIMESTAMPTZ
    )
    "#,
    // Nullable scope_id would let duplicate global keys through a plain
    // UNIQUE constraint.
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_concepts_scope_key
        ON concepts (scope, COALESCE(scope_id, '00000000-0000-0000-0000-000000000000'::uuid), key)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS concept_evidence (
        id UUID PRIMARY KEY,
        concept_id UUID NOT NULL REFERENCES concepts(id),
        material_chunk_id UUID NOT NULL,
        kind TEXT NOT NULL DEFAULT 'citation',
        weight DOUBLE PRECISION NOT NULL DEFAULT 1 CHECK (weight >= 0),
        deleted_at TIMESTAMPTZ,
        UNIQUE (concept_id, material_chunk_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS concept_edges (
        id UUID PRIMARY KEY,
        from_concept_id UUID NOT NULL REFERENCES concepts(id),
        to_concept_id UUID NOT NULL REFERENCES concepts(id),
        edge_type TEXT NOT NULL,
        strength DOUBLE PRECISION NOT NULL DEFAULT 0.5,
        evidence JSONB NOT NULL DEFAULT '{}',
        deleted_at TIMESTAMPTZ,
        CHECK (from_concept_id <> to_concept_id),
        UNIQUE (from_concept_id, to_concept_id, edge_type)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS activities (
        id UUID PRIMARY KEY,
        owner_user_id UUID NOT NULL,
        path_id UUID NOT NULL,
        kind TEXT NOT NULL,
        title TEXT NOT NULL,
        estimated_minutes INTEGER NOT NULL DEFAULT 0,
        content_json JSONB NOT NULL DEFAULT '{}',
        metadata JSONB NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS activity_variants (
        id UUID PRIMARY KEY,
        activity_id UUID NOT NULL REFERENCES activities(id),
        variant TEXT NOT NULL,
        content_json JSONB NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS activity_concepts (
        activity_id UUID NOT NULL REFERENCES activities(id),
        concept_id UUID NOT NULL,
        role TEXT NOT NULL,
        weight DOUBLE PRECISION NOT NULL DEFAULT 1,
        PRIMARY KEY (activity_id, concept_id, role)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS activity_citations (
        activity_variant_id UUID NOT NULL REFERENCES activity_variants(id),
        material_chunk_id UUID NOT NULL,
        kind TEXT NOT NULL,
        PRIMARY KEY (activity_variant_id, material_chunk_id, kind)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS path_node_activities (
        path_node_id UUID NOT NULL REFERENCES path_nodes(id),
        activity_id UUID NOT NULL REFERENCES activities(id),
        rank INTEGER NOT NULL,
        is_primary BOOLEAN NOT NULL DEFAULT false,
        UNIQUE (path_node_id, rank)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS learning_artifacts (
        owner_user_id UUID NOT NULL,
        material_set_id UUID NOT NULL,
        path_id UUID NOT NULL,
        artifact_type TEXT NOT NULL,
        input_hash TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 1,
        metadata JSONB NOT NULL DEFAULT '{}',
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (owner_user_id, material_set_id, path_id, artifact_type)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS saga_actions (
        id UUID PRIMARY KEY,
        saga_id UUID NOT NULL,
        seq BIGINT NOT NULL,
        kind TEXT NOT NULL,
        action_key TEXT NOT NULL,
        payload JSONB NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (saga_id, action_key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS structural_decision_traces (
        id UUID PRIMARY KEY,
        occurred_at TIMESTAMPTZ NOT NULL,
        owner_user_id UUID NOT NULL,
        path_id UUID NOT NULL,
        decision_type TEXT NOT NULL,
        graph_version TEXT NOT NULL,
        embedding_version TEXT NOT NULL,
        taxonomy_version TEXT NOT NULL,
        clustering_version TEXT NOT NULL,
        calibration_version TEXT NOT NULL,
        inputs JSONB NOT NULL DEFAULT '{}'
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_material_files_set ON material_files(material_set_id)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_fts ON material_chunks USING GIN (to_tsvector('english', text))",
    "CREATE INDEX IF NOT EXISTS idx_path_nodes_path ON path_nodes(path_id, node_index)",
    "CREATE INDEX IF NOT EXISTS idx_evidence_chunk ON concept_evidence(material_chunk_id)",
    "CREATE INDEX IF NOT EXISTS idx_edges_to ON concept_edges(to_concept_id)",
    "CREATE INDEX IF NOT EXISTS idx_saga_actions_saga ON saga_actions(saga_id, seq)",
];

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn apply(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
