use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub vectors: VectorsConfig,
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub embedding_dims: Option<usize>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            base_url: default_openai_base_url(),
            model: None,
            embedding_model: None,
            embedding_dims: None,
            max_retries: default_max_retries(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_llm_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorsConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_vector_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for VectorsConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            base_url: None,
            timeout_secs: default_vector_timeout_secs(),
        }
    }
}

fn default_vector_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ObjectStoreConfig {
    #[serde(default = "default_object_root")]
    pub root: PathBuf,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            root: default_object_root(),
        }
    }
}

fn default_object_root() -> PathBuf {
    PathBuf::from("./data/objects")
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_env_prefixes")]
    pub env_prefixes: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            env_prefixes: default_env_prefixes(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Tunable prefixes folded into artifact input hashes.
pub fn default_env_prefixes() -> Vec<String> {
    [
        "CONCEPT_GRAPH_",
        "COVERAGE_",
        "REALIZE_",
        "RETRIEVAL_",
        "CANONICAL_CONCEPT_",
        "ADAPTIVE_",
        "LEARNING_ARTIFACT_",
        "EMBED_",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.db.url.trim().is_empty() {
        anyhow::bail!("db.url must not be empty");
    }
    if config.db.max_connections == 0 {
        anyhow::bail!("db.max_connections must be > 0");
    }

    match config.llm.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.llm.model.is_none() {
                anyhow::bail!("llm.model must be specified when provider is 'openai'");
            }
            if config.llm.embedding_model.is_none() {
                anyhow::bail!("llm.embedding_model must be specified when provider is 'openai'");
            }
            if config.llm.embedding_dims.is_none() || config.llm.embedding_dims == Some(0) {
                anyhow::bail!("llm.embedding_dims must be > 0 when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    match config.vectors.provider.as_str() {
        "disabled" | "memory" => {}
        "pinecone" => {
            if config.vectors.base_url.is_none() {
                anyhow::bail!("vectors.base_url must be specified when provider is 'pinecone'");
            }
        }
        other => anyhow::bail!(
            "Unknown vectors provider: '{}'. Must be disabled, memory, or pinecone.",
            other
        ),
    }

    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}
