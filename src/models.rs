//! Core data models used throughout the engine.
//!
//! These types represent the documents, chunks, retrieval results, and
//! answers that flow through the indexing and query pipelines.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::extract::FileFormat;

/// Metadata extracted from a document, merged with whatever the upstream
/// producer supplied. Serialized into every stored vector-index point.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub page_count: Option<usize>,
    /// Free-form fields the upstream producer attaches (department, tags…).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, String>,
}

impl DocumentMetadata {
    /// Merge `fallback` into `self`: fields already set on `self` win,
    /// missing ones are filled from the extractor's output.
    pub fn merged_with(mut self, fallback: DocumentMetadata) -> DocumentMetadata {
        if self.title.is_none() {
            self.title = fallback.title;
        }
        if self.author.is_none() {
            self.author = fallback.author;
        }
        if self.page_count.is_none() {
            self.page_count = fallback.page_count;
        }
        for (k, v) in fallback.extra {
            self.extra.entry(k).or_insert(v);
        }
        self
    }
}

/// Lifecycle status of a document in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Indexed,
    Failed,
}

/// A document as seen by the indexing pipeline.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub source_path: PathBuf,
    pub format: FileFormat,
    pub metadata: DocumentMetadata,
    pub content_hash: String,
    pub status: DocumentStatus,
}

/// A chunk produced by the chunker, before embedding.
///
/// Ordinals are contiguous from 0 within a document. A single sentence that
/// exceeds the token budget is kept whole and flagged `oversized` rather
/// than truncated.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDraft {
    pub ordinal: usize,
    pub text: String,
    pub token_count: usize,
    pub oversized: bool,
}

/// Payload stored alongside each vector in the index.
///
/// This is the minimum persisted point schema: everything needed to build a
/// retrieval result without a second lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointPayload {
    pub document_id: String,
    pub chunk_index: usize,
    pub text: String,
    pub token_count: usize,
    #[serde(default)]
    pub oversized: bool,
    pub content_hash: String,
    #[serde(default)]
    pub metadata: DocumentMetadata,
}

/// A chunk with its embedding, ready for upsert into the vector index.
///
/// The id is derived deterministically from `(document_id, chunk_index)`
/// so re-indexing a document overwrites its points in place.
#[derive(Debug, Clone)]
pub struct ChunkPoint {
    pub id: String,
    pub payload: PointPayload,
    pub vector: Vec<f32>,
}

/// A raw hit returned by the vector index, before reranking.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub payload: PointPayload,
    /// Cosine similarity against the query vector.
    pub score: f32,
}

/// Summary statistics reported by a vector index backend.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub points: u64,
    pub dimension: usize,
    pub distance: String,
}

/// A retrieval query against the knowledge base.
#[derive(Debug, Clone)]
pub struct RetrievalQuery {
    pub text: String,
    /// Equality filters applied to point payloads (`document_id`, `title`,
    /// `author`, or any `extra` key).
    pub filter: Option<HashMap<String, String>>,
    pub top_k: usize,
    /// Hard similarity cutoff; candidates below it are never returned.
    pub score_threshold: f32,
}

/// A reranked retrieval result.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub document_id: String,
    pub chunk_index: usize,
    pub similarity_score: f32,
    pub rerank_score: f64,
    pub text: String,
    pub title: Option<String>,
    pub author: Option<String>,
}

impl RetrievalResult {
    /// Short excerpt for display; the full text stays available for
    /// context assembly.
    pub fn preview(&self) -> String {
        self.text.chars().take(240).collect()
    }
}

/// Role of a chat message passed to the generation capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A complete (non-streamed) grounded answer.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    /// Sources that contributed text to the context, in rerank order.
    /// Never contains a source that was not injected into the context.
    pub sources: Vec<RetrievalResult>,
    /// False when the answer fell back to general knowledge because
    /// retrieval produced nothing above the threshold.
    pub grounded: bool,
}

/// Events emitted on the answer stream, in order:
/// `Sources`, zero or more `Delta`s, then `Complete` or `Error`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnswerEvent {
    Sources {
        sources: Vec<RetrievalResult>,
        no_sources: bool,
    },
    Delta {
        text: String,
    },
    Complete {
        /// Id under which the finished answer was persisted.
        message_id: String,
    },
    Error {
        message: String,
    },
}

/// One file handed to the indexing pipeline by the upstream producer.
#[derive(Debug, Clone)]
pub struct IndexRequest {
    pub path: PathBuf,
    pub document_id: String,
    pub metadata: DocumentMetadata,
}

/// Outcome of indexing a single document.
#[derive(Debug, Clone, Serialize)]
pub struct IndexOutcome {
    pub document_id: String,
    pub chunks_count: usize,
    pub status: DocumentStatus,
}

/// Final status of a multi-file indexing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    CompletedWithErrors,
    Failed,
}

/// A per-file error recorded during a job. One bad file never aborts
/// the job.
#[derive(Debug, Clone, Serialize)]
pub struct FileError {
    pub document_id: String,
    pub error: String,
}

/// Accumulated result of a multi-file indexing job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub total: usize,
    pub indexed: usize,
    pub failed: usize,
    pub errors: Vec<FileError>,
    pub status: JobStatus,
}

impl JobSummary {
    pub fn status_for(indexed: usize, failed: usize) -> JobStatus {
        if failed == 0 {
            JobStatus::Completed
        } else if indexed == 0 {
            JobStatus::Failed
        } else {
            JobStatus::CompletedWithErrors
        }
    }
}

/// Progress events published by a background indexing job on its channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IndexProgress {
    Started { total: usize },
    Indexed { document_id: String, chunks: usize },
    Failed { document_id: String, error: String },
    Finished { status: JobStatus },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_merge_prefers_existing_fields() {
        let upstream = DocumentMetadata {
            title: Some("Upstream title".into()),
            author: None,
            page_count: None,
            extra: HashMap::from([("dept".into(), "legal".into())]),
        };
        let extracted = DocumentMetadata {
            title: Some("Extracted title".into()),
            author: Some("Jane Doe".into()),
            page_count: Some(4),
            extra: HashMap::from([("dept".into(), "hr".into()), ("lang".into(), "en".into())]),
        };

        let merged = upstream.merged_with(extracted);
        assert_eq!(merged.title.as_deref(), Some("Upstream title"));
        assert_eq!(merged.author.as_deref(), Some("Jane Doe"));
        assert_eq!(merged.page_count, Some(4));
        assert_eq!(merged.extra.get("dept").map(String::as_str), Some("legal"));
        assert_eq!(merged.extra.get("lang").map(String::as_str), Some("en"));
    }

    #[test]
    fn job_status_classification() {
        assert_eq!(JobSummary::status_for(3, 0), JobStatus::Completed);
        assert_eq!(JobSummary::status_for(2, 1), JobStatus::CompletedWithErrors);
        assert_eq!(JobSummary::status_for(0, 3), JobStatus::Failed);
    }
}
