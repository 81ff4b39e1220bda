//! Vector index abstraction over an external vector database.
//!
//! The [`VectorIndex`] trait defines the atomic operations the rest of the
//! engine is allowed to use — upsert, search, delete, stats — so concurrent
//! indexing jobs and queries never do client-side read-modify-write.
//! Implementations must be `Send + Sync`; the handle is constructed once
//! and injected (`Arc<dyn VectorIndex>`), with its lifecycle tied to
//! process start/stop.
//!
//! Backends:
//! - **[`QdrantIndex`]** — REST client for a Qdrant server. Transient
//!   failures are retried with exponential backoff a bounded number of
//!   times before surfacing [`RagError::VectorStoreUnavailable`].
//! - **[`MemoryIndex`]** — brute-force cosine store behind `RwLock`, for
//!   tests and local runs.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::config::IndexConfig;
use crate::embedding::cosine_similarity;
use crate::error::RagError;
use crate::models::{ChunkPoint, IndexStats, PointPayload, ScoredPoint};

/// Equality filters applied to point payloads.
pub type PayloadFilter = HashMap<String, String>;

/// Atomic operations on the vector database.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the collection if missing; verify its dimension otherwise.
    /// A dimension mismatch is a fatal configuration error.
    async fn ensure_collection(&self, dims: usize) -> Result<(), RagError>;

    /// Insert or overwrite points. Idempotent per point id: upserting the
    /// same id twice leaves one stored point with the latest payload.
    /// Returns the stored ids.
    async fn upsert(&self, points: Vec<ChunkPoint>) -> Result<Vec<String>, RagError>;

    /// Nearest-neighbor search, sorted by similarity descending.
    /// `score_threshold` is a hard cutoff — no result below it is ever
    /// returned.
    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        score_threshold: f32,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<ScoredPoint>, RagError>;

    /// Remove every point belonging to a document. Atomic from the
    /// caller's view: no query observes a partially-deleted document.
    async fn delete_by_document(&self, document_id: &str) -> Result<(), RagError>;

    /// Remove a document's points with `chunk_index >= from_ordinal`.
    /// Used after a re-index to drop ordinals past the new chunk count.
    async fn delete_stale(&self, document_id: &str, from_ordinal: usize) -> Result<(), RagError>;

    /// Point count, dimension, and distance metric of the collection.
    async fn stats(&self) -> Result<IndexStats, RagError>;
}

/// Instantiate an index backend from configuration.
pub fn create_index(config: &IndexConfig) -> Result<std::sync::Arc<dyn VectorIndex>, RagError> {
    match config.backend.as_str() {
        "qdrant" => Ok(std::sync::Arc::new(QdrantIndex::new(config)?)),
        "memory" => Ok(std::sync::Arc::new(MemoryIndex::new())),
        other => Err(RagError::Config(format!("unknown index backend: {}", other))),
    }
}

// ============ Qdrant backend ============

pub struct QdrantIndex {
    http: reqwest::Client,
    base_url: String,
    collection: String,
    api_key: Option<String>,
    max_retries: u32,
}

impl QdrantIndex {
    pub fn new(config: &IndexConfig) -> Result<Self, RagError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RagError::Config(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            collection: config.collection.clone(),
            api_key: std::env::var("QDRANT_API_KEY").ok(),
            max_retries: config.max_retries,
        })
    }

    fn collection_url(&self, suffix: &str) -> String {
        format!("{}/collections/{}{}", self.base_url, self.collection, suffix)
    }

    fn apply_key(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("api-key", key),
            None => req,
        }
    }

    /// Send a request, retrying transient failures (network errors, 5xx)
    /// with exponential backoff. Exhaustion surfaces
    /// `VectorStoreUnavailable`; a non-transient error status surfaces it
    /// immediately with the response body.
    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, RagError> {
        let mut last_err = String::new();
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_millis(250 * (1 << (attempt - 1).min(4)));
                warn!(attempt, "retrying vector store request");
                tokio::time::sleep(delay).await;
            }
            match self.apply_key(build()).send().await {
                Ok(resp) if resp.status().is_server_error() => {
                    last_err = format!("server error {}", resp.status());
                }
                Ok(resp) if !resp.status().is_success() => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(RagError::VectorStoreUnavailable(format!(
                        "{}: {}",
                        status, body
                    )));
                }
                Ok(resp) => return Ok(resp),
                Err(e) => last_err = e.to_string(),
            }
        }
        Err(RagError::VectorStoreUnavailable(last_err))
    }

    fn document_filter(document_id: &str, from_ordinal: Option<usize>) -> serde_json::Value {
        let mut must = vec![json!({ "key": "document_id", "match": { "value": document_id } })];
        if let Some(from) = from_ordinal {
            must.push(json!({ "key": "chunk_index", "range": { "gte": from } }));
        }
        json!({ "must": must })
    }

    fn search_filter(filter: &PayloadFilter) -> serde_json::Value {
        let must: Vec<serde_json::Value> = filter
            .iter()
            .map(|(key, value)| {
                // Nested metadata fields live under the payload's
                // `metadata` object; `document_id` and `chunk_index` are
                // top-level.
                let path = match key.as_str() {
                    "document_id" | "chunk_index" => key.clone(),
                    "title" | "author" => format!("metadata.{}", key),
                    other => format!("metadata.extra.{}", other),
                };
                json!({ "key": path, "match": { "value": value } })
            })
            .collect();
        json!({ "must": must })
    }
}

#[derive(Deserialize)]
struct QdrantSearchResponse {
    result: Vec<QdrantHit>,
}

#[derive(Deserialize)]
struct QdrantHit {
    score: f32,
    payload: Option<serde_json::Value>,
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn ensure_collection(&self, dims: usize) -> Result<(), RagError> {
        // PUT is idempotent here: 409 means the collection already exists,
        // and stats() verifies its dimension afterwards.
        let url = self.collection_url("");
        let body = json!({ "vectors": { "size": dims, "distance": "Cosine" } });
        let resp = self.apply_key(self.http.put(&url).json(&body)).send().await;
        match resp {
            Ok(r) if r.status().is_success() || r.status().as_u16() == 409 => Ok(()),
            Ok(r) => {
                let status = r.status();
                let body = r.text().await.unwrap_or_default();
                Err(RagError::VectorStoreUnavailable(format!(
                    "{}: {}",
                    status, body
                )))
            }
            Err(e) => Err(RagError::VectorStoreUnavailable(e.to_string())),
        }
    }

    async fn upsert(&self, points: Vec<ChunkPoint>) -> Result<Vec<String>, RagError> {
        if points.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = points.iter().map(|p| p.id.clone()).collect();
        let body_points: Vec<serde_json::Value> = points
            .iter()
            .map(|p| {
                Ok(json!({
                    "id": p.id,
                    "vector": p.vector,
                    "payload": serde_json::to_value(&p.payload)
                        .map_err(|e| RagError::VectorStoreUnavailable(e.to_string()))?,
                }))
            })
            .collect::<Result<_, RagError>>()?;
        let body = json!({ "points": body_points });
        let url = self.collection_url("/points");
        self.send_with_retry(|| {
            self.http
                .put(&url)
                .query(&[("wait", "true")])
                .json(&body)
        })
        .await?;
        Ok(ids)
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        score_threshold: f32,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<ScoredPoint>, RagError> {
        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
            "score_threshold": score_threshold,
        });
        if let Some(f) = filter {
            if !f.is_empty() {
                body["filter"] = Self::search_filter(f);
            }
        }
        let url = self.collection_url("/points/search");
        let resp = self
            .send_with_retry(|| self.http.post(&url).json(&body))
            .await?;
        let parsed: QdrantSearchResponse = resp
            .json()
            .await
            .map_err(|e| RagError::VectorStoreUnavailable(e.to_string()))?;

        let mut hits = Vec::with_capacity(parsed.result.len());
        for hit in parsed.result {
            // The server already applied the threshold; re-check so the
            // hard-cutoff invariant cannot depend on backend behavior.
            if hit.score < score_threshold {
                continue;
            }
            let Some(payload_value) = hit.payload else {
                continue;
            };
            let payload: PointPayload = serde_json::from_value(payload_value)
                .map_err(|e| RagError::VectorStoreUnavailable(e.to_string()))?;
            hits.push(ScoredPoint {
                payload,
                score: hit.score,
            });
        }
        Ok(hits)
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<(), RagError> {
        let body = json!({ "filter": Self::document_filter(document_id, None) });
        let url = self.collection_url("/points/delete");
        self.send_with_retry(|| {
            self.http
                .post(&url)
                .query(&[("wait", "true")])
                .json(&body)
        })
        .await?;
        Ok(())
    }

    async fn delete_stale(&self, document_id: &str, from_ordinal: usize) -> Result<(), RagError> {
        let body = json!({ "filter": Self::document_filter(document_id, Some(from_ordinal)) });
        let url = self.collection_url("/points/delete");
        self.send_with_retry(|| {
            self.http
                .post(&url)
                .query(&[("wait", "true")])
                .json(&body)
        })
        .await?;
        Ok(())
    }

    async fn stats(&self) -> Result<IndexStats, RagError> {
        let url = self.collection_url("");
        let resp = self.send_with_retry(|| self.http.get(&url)).await?;
        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| RagError::VectorStoreUnavailable(e.to_string()))?;
        let result = &value["result"];
        let points = result["points_count"].as_u64().unwrap_or(0);
        let vectors = &result["config"]["params"]["vectors"];
        let dimension = vectors["size"].as_u64().unwrap_or(0) as usize;
        let distance = vectors["distance"].as_str().unwrap_or("Cosine").to_string();
        Ok(IndexStats {
            points,
            dimension,
            distance,
        })
    }
}

// ============ In-memory backend ============

/// Brute-force cosine store for tests and local runs.
pub struct MemoryIndex {
    points: RwLock<HashMap<String, ChunkPoint>>,
    dims: RwLock<Option<usize>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self {
            points: RwLock::new(HashMap::new()),
            dims: RwLock::new(None),
        }
    }

    fn payload_matches(payload: &PointPayload, filter: &PayloadFilter) -> bool {
        filter.iter().all(|(key, value)| match key.as_str() {
            "document_id" => payload.document_id == *value,
            "chunk_index" => payload.chunk_index.to_string() == *value,
            "title" => payload.metadata.title.as_deref() == Some(value.as_str()),
            "author" => payload.metadata.author.as_deref() == Some(value.as_str()),
            other => payload.metadata.extra.get(other) == Some(value),
        })
    }

    fn lock_err<T>(_: T) -> RagError {
        RagError::VectorStoreUnavailable("memory index lock poisoned".into())
    }
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn ensure_collection(&self, dims: usize) -> Result<(), RagError> {
        let mut stored = self.dims.write().map_err(Self::lock_err)?;
        match *stored {
            Some(existing) if existing != dims => Err(RagError::Config(format!(
                "collection dimension {} does not match configured {}",
                existing, dims
            ))),
            _ => {
                *stored = Some(dims);
                Ok(())
            }
        }
    }

    async fn upsert(&self, points: Vec<ChunkPoint>) -> Result<Vec<String>, RagError> {
        let dims = self.dims.read().map_err(Self::lock_err)?.unwrap_or(0);
        let mut stored = self.points.write().map_err(Self::lock_err)?;
        let mut ids = Vec::with_capacity(points.len());
        for point in points {
            if dims != 0 && point.vector.len() != dims {
                return Err(RagError::Config(format!(
                    "vector dimension {} does not match collection {}",
                    point.vector.len(),
                    dims
                )));
            }
            ids.push(point.id.clone());
            stored.insert(point.id.clone(), point);
        }
        Ok(ids)
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        score_threshold: f32,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<ScoredPoint>, RagError> {
        let stored = self.points.read().map_err(Self::lock_err)?;
        let mut hits: Vec<ScoredPoint> = stored
            .values()
            .filter(|p| match filter {
                Some(f) => Self::payload_matches(&p.payload, f),
                None => true,
            })
            .map(|p| ScoredPoint {
                payload: p.payload.clone(),
                score: cosine_similarity(vector, &p.vector),
            })
            .filter(|hit| hit.score >= score_threshold)
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<(), RagError> {
        let mut stored = self.points.write().map_err(Self::lock_err)?;
        stored.retain(|_, p| p.payload.document_id != document_id);
        Ok(())
    }

    async fn delete_stale(&self, document_id: &str, from_ordinal: usize) -> Result<(), RagError> {
        let mut stored = self.points.write().map_err(Self::lock_err)?;
        stored.retain(|_, p| {
            !(p.payload.document_id == document_id && p.payload.chunk_index >= from_ordinal)
        });
        Ok(())
    }

    async fn stats(&self) -> Result<IndexStats, RagError> {
        let stored = self.points.read().map_err(Self::lock_err)?;
        let dims = self.dims.read().map_err(Self::lock_err)?.unwrap_or(0);
        Ok(IndexStats {
            points: stored.len() as u64,
            dimension: dims,
            distance: "Cosine".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentMetadata;

    fn point(id: &str, doc: &str, ordinal: usize, vector: Vec<f32>, text: &str) -> ChunkPoint {
        ChunkPoint {
            id: id.to_string(),
            payload: PointPayload {
                document_id: doc.to_string(),
                chunk_index: ordinal,
                text: text.to_string(),
                token_count: crate::chunk::count_tokens(text),
                oversized: false,
                content_hash: String::new(),
                metadata: DocumentMetadata::default(),
            },
            vector,
        }
    }

    #[tokio::test]
    async fn upsert_same_id_twice_keeps_latest_payload() {
        let index = MemoryIndex::new();
        index.ensure_collection(2).await.unwrap();
        index
            .upsert(vec![point("p1", "d1", 0, vec![1.0, 0.0], "old text")])
            .await
            .unwrap();
        index
            .upsert(vec![point("p1", "d1", 0, vec![1.0, 0.0], "new text")])
            .await
            .unwrap();

        let stats = index.stats().await.unwrap();
        assert_eq!(stats.points, 1);
        let hits = index.search(&[1.0, 0.0], 10, 0.0, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].payload.text, "new text");
    }

    #[tokio::test]
    async fn search_never_returns_below_threshold() {
        let index = MemoryIndex::new();
        index.ensure_collection(2).await.unwrap();
        index
            .upsert(vec![
                point("a", "d1", 0, vec![1.0, 0.0], "close"),
                point("b", "d1", 1, vec![0.5, 0.866], "halfway"),
                point("c", "d1", 2, vec![0.0, 1.0], "orthogonal"),
            ])
            .await
            .unwrap();

        let hits = index.search(&[1.0, 0.0], 10, 0.7, None).await.unwrap();
        assert!(!hits.is_empty());
        for hit in &hits {
            assert!(hit.score >= 0.7);
        }
        assert!(hits.iter().all(|h| h.payload.text != "orthogonal"));
    }

    #[tokio::test]
    async fn delete_by_document_cascades_to_all_chunks() {
        let index = MemoryIndex::new();
        index.ensure_collection(2).await.unwrap();
        index
            .upsert(vec![
                point("a", "d1", 0, vec![1.0, 0.0], "one"),
                point("b", "d1", 1, vec![1.0, 0.0], "two"),
                point("c", "d2", 0, vec![1.0, 0.0], "other doc"),
            ])
            .await
            .unwrap();

        index.delete_by_document("d1").await.unwrap();

        let filter = PayloadFilter::from([("document_id".to_string(), "d1".to_string())]);
        let hits = index.search(&[1.0, 0.0], 10, 0.0, Some(&filter)).await.unwrap();
        assert!(hits.is_empty());
        assert_eq!(index.stats().await.unwrap().points, 1);
    }

    #[tokio::test]
    async fn delete_stale_drops_only_high_ordinals() {
        let index = MemoryIndex::new();
        index.ensure_collection(2).await.unwrap();
        index
            .upsert(vec![
                point("a", "d1", 0, vec![1.0, 0.0], "keep"),
                point("b", "d1", 1, vec![1.0, 0.0], "keep"),
                point("c", "d1", 2, vec![1.0, 0.0], "stale"),
                point("d", "d1", 3, vec![1.0, 0.0], "stale"),
            ])
            .await
            .unwrap();

        index.delete_stale("d1", 2).await.unwrap();

        let hits = index.search(&[1.0, 0.0], 10, 0.0, None).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.payload.chunk_index < 2));
    }

    #[tokio::test]
    async fn dimension_mismatch_is_fatal_config_error() {
        let index = MemoryIndex::new();
        index.ensure_collection(4).await.unwrap();
        let err = index.ensure_collection(8).await.unwrap_err();
        assert!(matches!(err, RagError::Config(_)));

        let err = index
            .upsert(vec![point("a", "d1", 0, vec![1.0, 0.0], "wrong dims")])
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Config(_)));
    }

    #[tokio::test]
    async fn metadata_filter_matches_extra_fields() {
        let index = MemoryIndex::new();
        index.ensure_collection(2).await.unwrap();
        let mut tagged = point("a", "d1", 0, vec![1.0, 0.0], "tagged");
        tagged
            .payload
            .metadata
            .extra
            .insert("dept".into(), "legal".into());
        index
            .upsert(vec![tagged, point("b", "d2", 0, vec![1.0, 0.0], "untagged")])
            .await
            .unwrap();

        let filter = PayloadFilter::from([("dept".to_string(), "legal".to_string())]);
        let hits = index.search(&[1.0, 0.0], 10, 0.0, Some(&filter)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].payload.text, "tagged");
    }

    #[test]
    fn qdrant_filters_address_nested_metadata() {
        let filter = PayloadFilter::from([("dept".to_string(), "legal".to_string())]);
        let value = QdrantIndex::search_filter(&filter);
        let must = value["must"].as_array().unwrap();
        assert_eq!(must[0]["key"], "metadata.extra.dept");

        let doc_filter = QdrantIndex::document_filter("d1", Some(3));
        let must = doc_filter["must"].as_array().unwrap();
        assert_eq!(must.len(), 2);
        assert_eq!(must[1]["range"]["gte"], 3);
    }
}
