//! Embedding provider abstraction and the batching gateway.
//!
//! [`EmbeddingProvider`] is the seam to the external embedding capability:
//! a list of strings in, a list of fixed-dimension vectors out, same order.
//! Concrete implementations:
//! - **[`OpenAiEmbeddings`]** — OpenAI-compatible HTTP endpoint with
//!   exponential-backoff retry.
//! - **[`MockEmbeddings`]** — deterministic bag-of-words vectors for tests
//!   and offline runs.
//!
//! [`EmbedderGateway`] sits in front of a provider: it subdivides oversized
//! batches without dropping inputs, pauses between sub-batches to respect
//! external rate limits, and bounds in-flight calls with a semaphore shared
//! across all indexing tasks.
//!
//! # Retry strategy (OpenAI provider)
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::error::RagError;

/// External embedding capability.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-large"`).
    fn model_name(&self) -> &str;
    /// Embedding vector dimensionality, fixed per deployment.
    fn dims(&self) -> usize;
    /// Embed a batch of texts, order- and length-preserving.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError>;
}

/// Instantiate a provider from configuration.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>, RagError> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiEmbeddings::new(config)?)),
        "mock" => Ok(Arc::new(MockEmbeddings::new(config.dims))),
        other => Err(RagError::Config(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

// ============ OpenAI-compatible provider ============

pub struct OpenAiEmbeddings {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dims: usize,
    api_key: String,
    max_retries: u32,
}

impl OpenAiEmbeddings {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, RagError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| RagError::Config("OPENAI_API_KEY environment variable not set".into()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RagError::Config(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dims: config.dims,
            api_key,
            max_retries: config.max_retries,
        })
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        let url = format!("{}/embeddings", self.endpoint);
        let body = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let mut last_err: Option<RagError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                warn!(attempt, delay_secs = delay.as_secs(), "retrying embedding request");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let parsed: EmbeddingResponse = response
                            .json()
                            .await
                            .map_err(|e| RagError::EmbeddingService(e.to_string()))?;
                        return order_vectors(parsed, texts.len(), self.dims);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(RagError::EmbeddingService(format!(
                            "embedding API error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }
                    return Err(RagError::EmbeddingService(format!(
                        "embedding API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(RagError::EmbeddingService(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| RagError::EmbeddingService("embedding failed after retries".into())))
    }
}

/// Restore input order from the response's index field and verify the
/// batch is length- and dimension-consistent.
fn order_vectors(
    response: EmbeddingResponse,
    expected_len: usize,
    dims: usize,
) -> Result<Vec<Vec<f32>>, RagError> {
    if response.data.len() != expected_len {
        return Err(RagError::EmbeddingService(format!(
            "embedding response has {} vectors for {} inputs",
            response.data.len(),
            expected_len
        )));
    }
    let mut ordered: Vec<Option<Vec<f32>>> = vec![None; expected_len];
    for item in response.data {
        if item.index >= expected_len {
            return Err(RagError::EmbeddingService(format!(
                "embedding response index {} out of range",
                item.index
            )));
        }
        if item.embedding.len() != dims {
            return Err(RagError::EmbeddingService(format!(
                "embedding dimension {} does not match configured {}",
                item.embedding.len(),
                dims
            )));
        }
        ordered[item.index] = Some(item.embedding);
    }
    ordered
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| RagError::EmbeddingService("embedding response missing indices".into()))
}

// ============ Mock provider ============

/// Deterministic bag-of-words embeddings: each token hashes to a bucket,
/// the vector is L2-normalized. Texts sharing vocabulary land near each
/// other, which is enough to exercise retrieval in tests.
pub struct MockEmbeddings {
    dims: usize,
}

impl MockEmbeddings {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in text.to_lowercase().split_whitespace() {
            let digest = Sha256::digest(token.as_bytes());
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&digest[..8]);
            let bucket = u64::from_le_bytes(raw) as usize % self.dims;
            v[bucket] += 1.0;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddings {
    fn model_name(&self) -> &str {
        "mock"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}

// ============ Gateway ============

/// Rate-limited batching front for an [`EmbeddingProvider`].
///
/// Constructed once and injected; its semaphore is the process-wide bound
/// on in-flight embedding calls.
#[derive(Clone)]
pub struct EmbedderGateway {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    batch_delay: Duration,
    in_flight: Arc<Semaphore>,
}

impl EmbedderGateway {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        Self {
            provider,
            batch_size: config.batch_size.max(1),
            batch_delay: Duration::from_millis(config.batch_delay_ms),
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
        }
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn dims(&self) -> usize {
        self.provider.dims()
    }

    /// Embed a batch of texts, subdividing into provider-sized sub-batches.
    ///
    /// Order- and length-preserving: the result has exactly one vector per
    /// input, in input order. A failing sub-batch fails the whole call; the
    /// caller decides retry policy.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut out: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
        for (i, sub) in texts.chunks(self.batch_size).enumerate() {
            if i > 0 && !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }
            let _permit = self
                .in_flight
                .acquire()
                .await
                .map_err(|e| RagError::EmbeddingService(e.to_string()))?;
            debug!(sub_batch = i, size = sub.len(), "embedding sub-batch");
            let vectors = self.provider.embed(sub).await?;
            if vectors.len() != sub.len() {
                return Err(RagError::EmbeddingService(format!(
                    "provider returned {} vectors for {} inputs",
                    vectors.len(),
                    sub.len()
                )));
            }
            out.extend(vectors);
        }
        Ok(out)
    }

    /// Embed a single query text.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, RagError> {
        let vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| RagError::EmbeddingService("empty embedding response".into()))
    }
}

/// Cosine similarity between two vectors.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(batch_size: usize) -> EmbedderGateway {
        let config = EmbeddingConfig {
            provider: "mock".into(),
            batch_size,
            batch_delay_ms: 0,
            dims: 64,
            ..Default::default()
        };
        EmbedderGateway::new(Arc::new(MockEmbeddings::new(64)), &config)
    }

    #[tokio::test]
    async fn gateway_preserves_order_and_length_across_sub_batches() {
        let gw = gateway(2);
        let texts: Vec<String> = (0..7).map(|i| format!("text number {}", i)).collect();
        let vectors = gw.embed_batch(&texts).await.unwrap();
        assert_eq!(vectors.len(), 7);

        // Same inputs in one big batch give the same vectors in the same slots.
        let gw_big = gateway(64);
        let reference = gw_big.embed_batch(&texts).await.unwrap();
        assert_eq!(vectors, reference);
    }

    #[tokio::test]
    async fn gateway_embeds_empty_batch() {
        let gw = gateway(4);
        assert!(gw.embed_batch(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mock_embeddings_are_deterministic_and_normalized() {
        let mock = MockEmbeddings::new(32);
        let a = mock.embed(&["refund policy details".into()]).await.unwrap();
        let b = mock.embed(&["refund policy details".into()]).await.unwrap();
        assert_eq!(a, b);
        let norm: f32 = a[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn mock_embeddings_rank_shared_vocabulary_higher() {
        let mock = MockEmbeddings::new(256);
        let query = mock.vector_for("refund policy");
        let on_topic = mock.vector_for("our refund policy allows returns within thirty days");
        let off_topic = mock.vector_for("the kitchen menu lists seasonal vegetables");
        assert!(
            cosine_similarity(&query, &on_topic) > cosine_similarity(&query, &off_topic),
            "on-topic chunk should score higher"
        );
    }

    #[test]
    fn cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_empty_or_mismatched() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn order_vectors_restores_input_order() {
        let response = EmbeddingResponse {
            data: vec![
                EmbeddingItem {
                    index: 1,
                    embedding: vec![0.0, 1.0],
                },
                EmbeddingItem {
                    index: 0,
                    embedding: vec![1.0, 0.0],
                },
            ],
        };
        let ordered = order_vectors(response, 2, 2).unwrap();
        assert_eq!(ordered[0], vec![1.0, 0.0]);
        assert_eq!(ordered[1], vec![0.0, 1.0]);
    }

    #[test]
    fn order_vectors_rejects_dimension_mismatch() {
        let response = EmbeddingResponse {
            data: vec![EmbeddingItem {
                index: 0,
                embedding: vec![1.0, 0.0, 0.0],
            }],
        };
        let err = order_vectors(response, 1, 2).unwrap_err();
        assert!(matches!(err, RagError::EmbeddingService(_)));
    }
}
