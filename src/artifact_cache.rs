//! Stage output cache keyed by input fingerprint.
//!
//! A stage hashes everything its output depends on (see
//! [`pathweaver_core::artifact`]) and looks up the row for
//! `(owner, set, path, artifact_type)`. A row whose hash and version match
//! is a hit and the stage returns without doing work. Rows are written
//! after success; reads and writes never fail a stage.

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use pathweaver_core::artifact::{compute_input_hash, filter_env, ArtifactInputs};
use pathweaver_core::models::LearningArtifact;

use crate::config::CacheConfig;
use crate::env::{all_vars, env_bool};
use crate::store::{ArtifactKey, Store};

pub const EMBED_CHUNKS: &str = "embed_chunks";
pub const CONCEPT_GRAPH: &str = "concept_graph";
pub const CONCEPT_GRAPH_PATCH: &str = "concept_graph_patch";
pub const REALIZE_ACTIVITIES: &str = "realize_activities";

/// Bumped whenever a stage's cached metadata changes shape.
pub const ARTIFACT_VERSION: i32 = 1;

pub const CACHE_ENABLED_ENV: &str = "LEARNING_ARTIFACT_CACHE_ENABLED";

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub env_prefixes: Vec<String>,
}

impl CacheSettings {
    /// Config value, overridable (off) through the environment.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            enabled: config.enabled && env_bool(CACHE_ENABLED_ENV, true),
            env_prefixes: config.env_prefixes.clone(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

pub struct ArtifactCache<'a> {
    store: &'a dyn Store,
    settings: &'a CacheSettings,
}

impl<'a> ArtifactCache<'a> {
    pub fn new(store: &'a dyn Store, settings: &'a CacheSettings) -> Self {
        Self { store, settings }
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Hash `inputs` with the tunable environment folded in.
    pub fn input_hash(&self, inputs: ArtifactInputs) -> String {
        let env = filter_env(all_vars(), &self.settings.env_prefixes);
        compute_input_hash(&inputs.env(env))
    }

    /// The cached row when it matches `input_hash`.
    pub async fn lookup(&self, key: ArtifactKey<'_>, input_hash: &str) -> Option<LearningArtifact> {
        if !self.settings.enabled {
            return None;
        }
        match self.store.get_artifact(key).await {
            Ok(Some(a)) if a.input_hash == input_hash && a.version == ARTIFACT_VERSION => {
                tracing::info!(artifact_type = key.artifact_type, path_id = %key.path_id, "artifact cache hit");
                Some(a)
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(artifact_type = key.artifact_type, error = %e, "artifact cache read failed");
                None
            }
        }
    }

    /// Whether a row exists for `key` under any input hash. A failed read
    /// counts as present.
    pub async fn exists(&self, key: ArtifactKey<'_>) -> bool {
        if !self.settings.enabled {
            return false;
        }
        match self.store.get_artifact(key).await {
            Ok(row) => row.is_some(),
            Err(e) => {
                tracing::warn!(artifact_type = key.artifact_type, error = %e, "artifact cache read failed");
                true
            }
        }
    }

    /// Best-effort write of the cache row.
    pub async fn record(&self, key: ArtifactKey<'_>, input_hash: &str, metadata: Value) {
        if !self.settings.enabled {
            return;
        }
        let artifact = LearningArtifact {
            owner_user_id: key.owner_user_id,
            material_set_id: key.material_set_id,
            path_id: key.path_id,
            artifact_type: key.artifact_type.to_string(),
            input_hash: input_hash.to_string(),
            version: ARTIFACT_VERSION,
            metadata,
            updated_at: Utc::now(),
        };
        if let Err(e) = self.store.upsert_artifact(&artifact).await {
            tracing::warn!(artifact_type = key.artifact_type, error = %e, "artifact cache write failed");
        }
    }
}

/// Artifact key helper.
pub fn key(owner_user_id: Uuid, material_set_id: Uuid, path_id: Uuid, artifact_type: &str) -> ArtifactKey<'_> {
    ArtifactKey {
        owner_user_id,
        material_set_id,
        path_id,
        artifact_type,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use serde_json::json;

    fn settings(enabled: bool) -> CacheSettings {
        CacheSettings {
            enabled,
            env_prefixes: Vec::new(),
        }
    }

    #[tokio::test]
    async fn hit_requires_matching_hash() {
        let store = InMemoryStore::new();
        let s = settings(true);
        let cache = ArtifactCache::new(&store, &s);
        let k = key(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), CONCEPT_GRAPH);
        assert!(cache.lookup(k, "h1").await.is_none());
        cache.record(k, "h1", json!({"concepts": 3})).await;
        assert_eq!(cache.lookup(k, "h1").await.unwrap().metadata["concepts"], 3);
        assert!(cache.lookup(k, "h2").await.is_none());
    }

    #[tokio::test]
    async fn disabled_cache_neither_reads_nor_writes() {
        let store = InMemoryStore::new();
        let s = settings(false);
        let cache = ArtifactCache::new(&store, &s);
        let k = key(Uuid::new_v4(), Uuid::new_v4(), Uuid::nil(), EMBED_CHUNKS);
        cache.record(k, "h", json!({})).await;
        assert!(store.get_artifact(k).await.unwrap().is_none());
    }

    #[test]
    fn input_hash_is_stable() {
        let store = InMemoryStore::new();
        let s = settings(true);
        let cache = ArtifactCache::new(&store, &s);
        let a = cache.input_hash(ArtifactInputs::new(&[], &[], &[]).intent("x"));
        let b = cache.input_hash(ArtifactInputs::new(&[], &[], &[]).intent("x"));
        assert_eq!(a, b);
        assert_ne!(a, cache.input_hash(ArtifactInputs::new(&[], &[], &[]).intent("y")));
    }
}
