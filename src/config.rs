use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
        }
    }
}

fn default_strategy() -> String {
    "semantic".to_string()
}
fn default_max_tokens() -> usize {
    512
}
fn default_overlap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"openai"` (OpenAI-compatible HTTP endpoint) or `"mock"` (tests,
    /// offline runs).
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pause between sub-batches, to stay under external rate limits.
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum concurrent embedding calls across all indexing tasks.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            endpoint: default_embedding_endpoint(),
            model: default_embedding_model(),
            dims: default_dims(),
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

fn default_embedding_provider() -> String {
    "openai".to_string()
}
fn default_embedding_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-large".to_string()
}
fn default_dims() -> usize {
    1536
}
fn default_batch_size() -> usize {
    64
}
fn default_batch_delay_ms() -> u64 {
    100
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_in_flight() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// `"qdrant"` (REST) or `"memory"` (in-process, tests and local runs).
    #[serde(default = "default_index_backend")]
    pub backend: String,
    #[serde(default = "default_index_url")]
    pub url: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_index_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: default_index_backend(),
            url: default_index_url(),
            collection: default_collection(),
            max_retries: default_index_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_index_backend() -> String {
    "qdrant".to_string()
}
fn default_index_url() -> String {
    "http://localhost:6333".to_string()
}
fn default_collection() -> String {
    "documents".to_string()
}
fn default_index_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
    /// Weight of vector similarity in the combined rerank score.
    #[serde(default = "default_similarity_weight")]
    pub similarity_weight: f64,
    /// Weight of query-term lexical overlap in the combined rerank score.
    #[serde(default = "default_lexical_weight")]
    pub lexical_weight: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            score_threshold: default_score_threshold(),
            similarity_weight: default_similarity_weight(),
            lexical_weight: default_lexical_weight(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_score_threshold() -> f32 {
    0.7
}
fn default_similarity_weight() -> f64 {
    0.7
}
fn default_lexical_weight() -> f64 {
    0.3
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `"openai"` (OpenAI-compatible chat completions) or `"mock"`.
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_generation_max_tokens")]
    pub max_tokens: usize,
    /// How many recent conversation turns are kept in the prompt.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            endpoint: default_embedding_endpoint(),
            model: default_generation_model(),
            temperature: default_temperature(),
            max_tokens: default_generation_max_tokens(),
            max_history: default_max_history(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

fn default_generation_provider() -> String {
    "openai".to_string()
}
fn default_generation_model() -> String {
    "gpt-4o".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_generation_max_tokens() -> usize {
    2000
}
fn default_max_history() -> usize {
    20
}
fn default_generation_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    /// Files per batch in a multi-file job; caps peak memory.
    #[serde(default = "default_file_batch_size")]
    pub file_batch_size: usize,
    /// Capacity of the progress channel a background job publishes on.
    #[serde(default = "default_progress_capacity")]
    pub progress_capacity: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            file_batch_size: default_file_batch_size(),
            progress_capacity: default_progress_capacity(),
        }
    }
}

fn default_file_batch_size() -> usize {
    16
}
fn default_progress_capacity() -> usize {
    64
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        anyhow::bail!("chunking.overlap_tokens must be < chunking.max_tokens");
    }
    match config.chunking.strategy.as_str() {
        "semantic" | "fixed" => {}
        other => anyhow::bail!("Unknown chunking strategy: '{}'. Use semantic or fixed.", other),
    }

    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.max_in_flight == 0 {
        anyhow::bail!("embedding.max_in_flight must be > 0");
    }
    match config.embedding.provider.as_str() {
        "openai" | "mock" => {}
        other => anyhow::bail!("Unknown embedding provider: '{}'. Use openai or mock.", other),
    }

    match config.index.backend.as_str() {
        "qdrant" | "memory" => {}
        other => anyhow::bail!("Unknown index backend: '{}'. Use qdrant or memory.", other),
    }

    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.score_threshold) {
        anyhow::bail!("retrieval.score_threshold must be in [0.0, 1.0]");
    }
    if config.retrieval.similarity_weight < 0.0 || config.retrieval.lexical_weight < 0.0 {
        anyhow::bail!("retrieval weights must be >= 0");
    }
    if config.retrieval.similarity_weight + config.retrieval.lexical_weight <= 0.0 {
        anyhow::bail!("retrieval weights must not both be zero");
    }

    match config.generation.provider.as_str() {
        "openai" | "mock" => {}
        other => anyhow::bail!("Unknown generation provider: '{}'. Use openai or mock.", other),
    }

    if config.indexing.file_batch_size == 0 {
        anyhow::bail!("indexing.file_batch_size must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        validate(&config).unwrap();
        assert_eq!(config.chunking.max_tokens, 512);
        assert_eq!(config.retrieval.top_k, 5);
        assert!((config.retrieval.similarity_weight - 0.7).abs() < 1e-9);
    }

    #[test]
    fn rejects_overlap_not_below_max_tokens() {
        let mut config = Config::default();
        config.chunking.overlap_tokens = config.chunking.max_tokens;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_zero_dims() {
        let mut config = Config::default();
        config.embedding.dims = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_unknown_strategy() {
        let mut config = Config::default();
        config.chunking.strategy = "recursive".into();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            [retrieval]
            top_k = 8
            score_threshold = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(config.retrieval.top_k, 8);
        assert_eq!(config.chunking.strategy, "semantic");
        assert_eq!(config.index.backend, "qdrant");
    }
}
