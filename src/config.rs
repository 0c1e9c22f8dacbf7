//! Configuration parsing and validation.
//!
//! The archivist is configured via a TOML file (default: `config/archivist.toml`).
//! The config defines the database path, chunking parameters, retrieval tuning,
//! embedding provider settings, LLM provider settings, the query cache, and the
//! ingestion size limit. Loading validates ranges and enum membership up front
//! so misconfiguration fails at startup rather than at first use.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_target_tokens")]
    pub target_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
    #[serde(default = "default_strategy")]
    pub strategy: String,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: default_target_tokens(),
            overlap_tokens: default_overlap_tokens(),
            strategy: default_strategy(),
        }
    }
}

fn default_target_tokens() -> usize {
    512
}
fn default_overlap_tokens() -> usize {
    50
}
fn default_strategy() -> String {
    "SEMANTIC".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f64,
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,
    #[serde(default = "default_max_per_doc")]
    pub max_per_doc: usize,
    #[serde(default)]
    pub enable_reranking: bool,
    #[serde(default = "default_true")]
    pub expand_query: bool,
    #[serde(default = "default_oversample")]
    pub oversample: i64,
    #[serde(default = "default_final_limit")]
    pub final_limit: i64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            vector_weight: default_vector_weight(),
            keyword_weight: default_keyword_weight(),
            recency_weight: default_recency_weight(),
            max_per_doc: default_max_per_doc(),
            enable_reranking: false,
            expand_query: true,
            oversample: default_oversample(),
            final_limit: default_final_limit(),
        }
    }
}

fn default_vector_weight() -> f64 {
    0.7
}
fn default_keyword_weight() -> f64 {
    0.3
}
fn default_recency_weight() -> f64 {
    0.7
}
fn default_max_per_doc() -> usize {
    3
}
fn default_oversample() -> i64 {
    4
}
fn default_final_limit() -> i64 {
    12
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embedding_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            batch_size: 64,
            max_retries: 3,
            timeout_secs: 30,
            url: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_embedding_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_max_retries")]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            api_base: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout_secs(),
            max_retries: default_llm_max_retries(),
        }
    }
}

fn default_llm_provider() -> String {
    "disabled".to_string()
}
fn default_temperature() -> f64 {
    0.3
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_llm_timeout_secs() -> u64 {
    60
}
fn default_llm_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_entries(),
            ttl_secs: default_cache_ttl(),
        }
    }
}

fn default_cache_entries() -> usize {
    1000
}
fn default_cache_ttl() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_file_size_bytes: default_max_file_size(),
        }
    }
}

fn default_max_file_size() -> u64 {
    50 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.target_tokens == 0 {
        anyhow::bail!("chunking.target_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.target_tokens {
        anyhow::bail!("chunking.overlap_tokens must be < chunking.target_tokens");
    }
    match config.chunking.strategy.as_str() {
        "SENTENCE" | "SEMANTIC" | "TOKEN" => {}
        other => anyhow::bail!(
            "Unknown chunking strategy: '{}'. Must be SENTENCE, SEMANTIC, or TOKEN.",
            other
        ),
    }

    if config.retrieval.final_limit < 1 {
        anyhow::bail!("retrieval.final_limit must be >= 1");
    }
    let weight_sum = config.retrieval.vector_weight + config.retrieval.keyword_weight;
    if (weight_sum - 1.0).abs() > 0.01 {
        anyhow::bail!(
            "retrieval.vector_weight + retrieval.keyword_weight must sum to ~1.0, got {}",
            weight_sum
        );
    }
    if !(0.0..=1.0).contains(&config.retrieval.recency_weight) {
        anyhow::bail!("retrieval.recency_weight must be in [0.0, 1.0]");
    }
    if config.retrieval.max_per_doc == 0 {
        anyhow::bail!("retrieval.max_per_doc must be >= 1");
    }
    if config.retrieval.oversample < 1 {
        anyhow::bail!("retrieval.oversample must be >= 1");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" | "mock" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, local, or mock.",
            other
        ),
    }

    if config.llm.is_enabled() && config.llm.model.is_none() {
        anyhow::bail!(
            "llm.model must be specified when provider is '{}'",
            config.llm.provider
        );
    }
    if !(0.0..=1.0).contains(&config.llm.temperature) {
        anyhow::bail!("llm.temperature must be in [0.0, 1.0]");
    }
    match config.llm.provider.as_str() {
        "disabled" | "openai" | "anthropic" | "mock" => {}
        other => anyhow::bail!(
            "Unknown LLM provider: '{}'. Must be disabled, openai, anthropic, or mock.",
            other
        ),
    }

    if config.cache.max_entries == 0 {
        anyhow::bail!("cache.max_entries must be >= 1");
    }

    if config.ingestion.max_file_size_bytes == 0 {
        anyhow::bail!("ingestion.max_file_size_bytes must be > 0");
    }

    Ok(config)
}
