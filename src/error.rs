//! Error types for the RAG engine.
//!
//! The pipeline distinguishes errors by how callers should react (see the
//! per-variant docs). Per-file errors never abort a multi-file indexing job;
//! they are recorded in the job summary and the job continues.

use thiserror::Error;

/// Errors surfaced by the indexing and query pipelines.
#[derive(Debug, Error)]
pub enum RagError {
    /// The file extension maps to no known format. The file is skipped and
    /// recorded; the job continues.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The file was recognized but could not be parsed (corrupt or
    /// unreadable). The file is skipped and recorded; the job continues.
    #[error("extraction failed for {path}: {reason}")]
    Extraction { path: String, reason: String },

    /// The embedding capability failed after retries. Fails the current
    /// batch; remaining batches continue.
    #[error("embedding service error: {0}")]
    EmbeddingService(String),

    /// The vector database could not be reached after bounded retries.
    /// Indexing marks affected files failed (retryable later); queries
    /// surface service-unavailable.
    #[error("vector store unavailable: {0}")]
    VectorStoreUnavailable(String),

    /// The generation capability failed. Mid-stream this aborts the answer
    /// stream; a truncated answer is never persisted as complete.
    #[error("generation failed: {0}")]
    Generation(String),

    /// Invalid or inconsistent configuration, including an embedding
    /// dimension that does not match the vector index. Fatal.
    #[error("configuration error: {0}")]
    Config(String),
}

impl RagError {
    pub fn extraction(path: impl Into<String>, reason: impl ToString) -> Self {
        RagError::Extraction {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
