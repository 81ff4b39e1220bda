//! Indexing pipeline orchestration.
//!
//! Coordinates the write path: extraction → chunking → embedding → vector
//! index upsert. Multi-file jobs run off the request path as a spawned
//! task operating on bounded-size file batches, publishing progress on a
//! bounded channel. Per-file errors accumulate — one bad file never
//! aborts the job — and the job finishes with a partial-success summary.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::answer::GenerationProvider;
use crate::chunk::{self, ChunkStrategy};
use crate::config::Config;
use crate::embedding::EmbedderGateway;
use crate::error::RagError;
use crate::extract;
use crate::index::VectorIndex;
use crate::models::{
    ChunkPoint, DocumentStatus, FileError, IndexOutcome, IndexProgress, IndexRequest, JobSummary,
    PointPayload,
};

/// The engine bundles the injected collaborators: the vector index handle
/// and the embedder gateway (the only shared mutable resources), plus the
/// generation provider for the read path. Constructed once at process
/// start; dropping it releases the underlying network clients.
pub struct Engine {
    pub config: Config,
    pub index: Arc<dyn VectorIndex>,
    pub embedder: EmbedderGateway,
    pub generation: Arc<dyn GenerationProvider>,
}

impl Engine {
    /// Wire up an engine and verify the collection against the configured
    /// embedding dimension. A mismatch is a fatal configuration error.
    pub async fn new(
        config: Config,
        index: Arc<dyn VectorIndex>,
        embedder: EmbedderGateway,
        generation: Arc<dyn GenerationProvider>,
    ) -> Result<Self, RagError> {
        let dims = embedder.dims();
        index.ensure_collection(dims).await?;
        let stats = index.stats().await?;
        if stats.dimension != 0 && stats.dimension != dims {
            return Err(RagError::Config(format!(
                "vector index dimension {} does not match embedding dimension {}",
                stats.dimension, dims
            )));
        }
        info!(
            embedding_model = embedder.model_name(),
            generation_model = generation.model_name(),
            dims,
            "engine ready"
        );
        Ok(Self {
            config,
            index,
            embedder,
            generation,
        })
    }

    /// Build an engine from configuration alone, constructing the
    /// providers and index backend via their factories.
    pub async fn from_config(config: Config) -> Result<Self, RagError> {
        let index = crate::index::create_index(&config.index)?;
        let provider = crate::embedding::create_provider(&config.embedding)?;
        let embedder = EmbedderGateway::new(provider, &config.embedding);
        let generation = crate::answer::create_provider(&config.generation)?;
        Engine::new(config, index, embedder, generation).await
    }

    fn strategy(&self) -> ChunkStrategy {
        ChunkStrategy::from_name(&self.config.chunking.strategy).unwrap_or(ChunkStrategy::Semantic)
    }
}

/// Deterministic point id for `(document_id, ordinal)`, so re-indexing
/// overwrites points in place and upserts stay idempotent.
pub fn chunk_point_id(document_id: &str, ordinal: usize) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{}:{}", document_id, ordinal).as_bytes(),
    )
    .to_string()
}

fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Index one file: extract, chunk, embed, and replace the document's
/// chunk set in the vector index.
///
/// Replacement is in-place: new points overwrite their deterministic ids,
/// then ordinals past the new count are deleted. The caller decides
/// whether the file needed re-indexing; this function always indexes.
pub async fn index_document(
    engine: &Engine,
    request: &IndexRequest,
) -> Result<IndexOutcome, RagError> {
    let extracted = extract::extract(&request.path)?;
    let hash = content_hash(&extracted.text);
    let metadata = request.metadata.clone().merged_with(extracted.metadata);

    let drafts = chunk::chunk_text(
        &extracted.text,
        engine.strategy(),
        engine.config.chunking.max_tokens,
        engine.config.chunking.overlap_tokens,
    );

    if drafts.is_empty() {
        engine.index.delete_by_document(&request.document_id).await?;
        info!(document_id = %request.document_id, "document has no text; cleared");
        return Ok(IndexOutcome {
            document_id: request.document_id.clone(),
            chunks_count: 0,
            status: DocumentStatus::Indexed,
        });
    }

    let texts: Vec<String> = drafts.iter().map(|d| d.text.clone()).collect();
    let vectors = engine.embedder.embed_batch(&texts).await?;

    let points: Vec<ChunkPoint> = drafts
        .iter()
        .zip(vectors)
        .map(|(draft, vector)| ChunkPoint {
            id: chunk_point_id(&request.document_id, draft.ordinal),
            payload: PointPayload {
                document_id: request.document_id.clone(),
                chunk_index: draft.ordinal,
                text: draft.text.clone(),
                token_count: draft.token_count,
                oversized: draft.oversized,
                content_hash: hash.clone(),
                metadata: metadata.clone(),
            },
            vector,
        })
        .collect();

    let chunks_count = points.len();
    engine.index.upsert(points).await?;
    engine
        .index
        .delete_stale(&request.document_id, chunks_count)
        .await?;

    info!(
        document_id = %request.document_id,
        path = %request.path.display(),
        chunks = chunks_count,
        "document indexed"
    );

    Ok(IndexOutcome {
        document_id: request.document_id.clone(),
        chunks_count,
        status: DocumentStatus::Indexed,
    })
}

/// Index many files, accumulating per-file errors into a summary.
///
/// Files are processed in bounded-size batches to cap peak memory.
/// Progress is published best-effort on `progress` when provided.
pub async fn index_files(
    engine: &Engine,
    requests: &[IndexRequest],
    progress: Option<&mpsc::Sender<IndexProgress>>,
) -> JobSummary {
    let total = requests.len();
    if let Some(tx) = progress {
        let _ = tx.send(IndexProgress::Started { total }).await;
    }

    let mut indexed = 0usize;
    let mut errors: Vec<FileError> = Vec::new();

    for batch in requests.chunks(engine.config.indexing.file_batch_size.max(1)) {
        for request in batch {
            match index_document(engine, request).await {
                Ok(outcome) => {
                    indexed += 1;
                    if let Some(tx) = progress {
                        let _ = tx
                            .send(IndexProgress::Indexed {
                                document_id: outcome.document_id,
                                chunks: outcome.chunks_count,
                            })
                            .await;
                    }
                }
                Err(e) => {
                    warn!(
                        document_id = %request.document_id,
                        error = %e,
                        "file failed; continuing job"
                    );
                    if let Some(tx) = progress {
                        let _ = tx
                            .send(IndexProgress::Failed {
                                document_id: request.document_id.clone(),
                                error: e.to_string(),
                            })
                            .await;
                    }
                    errors.push(FileError {
                        document_id: request.document_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    let failed = errors.len();
    let status = JobSummary::status_for(indexed, failed);
    if let Some(tx) = progress {
        let _ = tx.send(IndexProgress::Finished { status }).await;
    }
    info!(total, indexed, failed, ?status, "indexing job finished");

    JobSummary {
        total,
        indexed,
        failed,
        errors,
        status,
    }
}

/// Run an indexing job as a background task, returning its join handle
/// and the bounded progress channel.
pub fn spawn_indexing_job(
    engine: Arc<Engine>,
    requests: Vec<IndexRequest>,
) -> (
    tokio::task::JoinHandle<JobSummary>,
    mpsc::Receiver<IndexProgress>,
) {
    let (tx, rx) = mpsc::channel(engine.config.indexing.progress_capacity.max(1));
    let handle = tokio::spawn(async move { index_files(&engine, &requests, Some(&tx)).await });
    (handle, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ids_are_deterministic_and_distinct() {
        let a0 = chunk_point_id("doc-a", 0);
        let a0_again = chunk_point_id("doc-a", 0);
        let a1 = chunk_point_id("doc-a", 1);
        let b0 = chunk_point_id("doc-b", 0);
        assert_eq!(a0, a0_again);
        assert_ne!(a0, a1);
        assert_ne!(a0, b0);
    }

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(content_hash("same text"), content_hash("same text"));
        assert_ne!(content_hash("same text"), content_hash("other text"));
    }
}
