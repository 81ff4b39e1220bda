//! Retrieval and reranking.
//!
//! The rerank blends two signals:
//!
//! 1. Embed the query and over-fetch `2 × top_k` candidates from the
//!    vector index with the score threshold applied.
//! 2. Compute lexical overlap — the fraction of unique query terms
//!    (case-insensitive, split on whitespace and punctuation) present in
//!    the candidate text.
//! 3. `combined = similarity_weight × similarity + lexical_weight ×
//!    overlap` (weights are configuration, defaults 0.7/0.3).
//! 4. Sort descending by combined score; ties break by similarity, then
//!    original candidate order.
//! 5. Truncate to `top_k`.
//!
//! An empty candidate set yields an empty result list, which the answer
//! assembler treats as the ungrounded-fallback signal.

use std::collections::HashSet;

use tracing::debug;

use crate::config::RetrievalConfig;
use crate::embedding::EmbedderGateway;
use crate::error::RagError;
use crate::index::VectorIndex;
use crate::models::{RetrievalQuery, RetrievalResult};

/// How many times `top_k` to over-fetch before reranking.
const OVERFETCH_FACTOR: usize = 2;

/// Run retrieval and rerank against the index.
///
/// A query-embedding failure propagates as
/// [`RagError::EmbeddingService`]; an unreachable index propagates as
/// [`RagError::VectorStoreUnavailable`].
pub async fn retrieve(
    embedder: &EmbedderGateway,
    index: &dyn VectorIndex,
    query: &RetrievalQuery,
    config: &RetrievalConfig,
) -> Result<Vec<RetrievalResult>, RagError> {
    if query.text.trim().is_empty() || query.top_k == 0 {
        return Ok(Vec::new());
    }

    let query_vector = embedder.embed_query(&query.text).await?;
    let candidates = index
        .search(
            &query_vector,
            query.top_k * OVERFETCH_FACTOR,
            query.score_threshold,
            query.filter.as_ref(),
        )
        .await?;

    if candidates.is_empty() {
        debug!(query = %query.text, "no candidates above threshold");
        return Ok(Vec::new());
    }

    let mut results: Vec<RetrievalResult> = candidates
        .into_iter()
        .map(|hit| {
            let overlap = lexical_overlap(&query.text, &hit.payload.text);
            let combined = config.similarity_weight * hit.score as f64
                + config.lexical_weight * overlap;
            RetrievalResult {
                document_id: hit.payload.document_id,
                chunk_index: hit.payload.chunk_index,
                similarity_score: hit.score,
                rerank_score: combined,
                text: hit.payload.text,
                title: hit.payload.metadata.title,
                author: hit.payload.metadata.author,
            }
        })
        .collect();

    // Stable sort: candidates tied on both scores keep their original
    // (similarity-descending) order.
    results.sort_by(|a, b| {
        b.rerank_score
            .partial_cmp(&a.rerank_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.similarity_score
                    .partial_cmp(&a.similarity_score)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
    });
    results.truncate(query.top_k);

    debug!(
        query = %query.text,
        results = results.len(),
        top_score = results.first().map(|r| r.rerank_score).unwrap_or(0.0),
        "retrieval complete"
    );
    Ok(results)
}

/// Fraction of unique query terms present in the candidate text.
///
/// Terms are lowercased and split on any non-alphanumeric character.
pub fn lexical_overlap(query: &str, text: &str) -> f64 {
    let query_terms = terms(query);
    if query_terms.is_empty() {
        return 0.0;
    }
    let text_terms = terms(text);
    let present = query_terms
        .iter()
        .filter(|t| text_terms.contains(*t))
        .count();
    present as f64 / query_terms.len() as f64
}

fn terms(s: &str) -> HashSet<String> {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use crate::config::EmbeddingConfig;
    use crate::embedding::MockEmbeddings;
    use crate::index::MemoryIndex;
    use crate::models::{ChunkPoint, DocumentMetadata, PointPayload};

    fn mock_gateway(dims: usize) -> EmbedderGateway {
        let config = EmbeddingConfig {
            provider: "mock".into(),
            dims,
            batch_delay_ms: 0,
            ..Default::default()
        };
        EmbedderGateway::new(Arc::new(MockEmbeddings::new(dims)), &config)
    }

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

    #[test]
    fn overlap_is_case_insensitive_and_punctuation_tolerant() {
        let overlap = lexical_overlap("Refund Policy", "Our refund-policy: simple.");
        assert!((overlap - 1.0).abs() < 1e-9);
    }

    #[test]
    fn overlap_counts_fraction_of_query_terms() {
        let overlap = lexical_overlap("refund policy window", "the refund window");
        assert!((overlap - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn overlap_of_disjoint_texts_is_zero() {
        assert_eq!(lexical_overlap("refund policy", "kitchen menu"), 0.0);
    }

    #[test]
    fn overlap_with_empty_query_is_zero() {
        assert_eq!(lexical_overlap("", "anything"), 0.0);
        assert_eq!(lexical_overlap("...", "anything"), 0.0);
    }

    #[tokio::test]
    async fn empty_query_returns_no_results() {
        let embedder = mock_gateway(16);
        let index = MemoryIndex::new();
        let query = RetrievalQuery {
            text: "   ".into(),
            filter: None,
            top_k: 5,
            score_threshold: 0.0,
        };
        let results = retrieve(&embedder, &index, &query, &RetrievalConfig::default())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn empty_candidate_set_yields_empty_results() {
        let embedder = mock_gateway(16);
        let index = MemoryIndex::new();
        index.ensure_collection(16).await.unwrap();
        let query = RetrievalQuery {
            text: "refund policy".into(),
            filter: None,
            top_k: 5,
            score_threshold: 0.9,
        };
        let results = retrieve(&embedder, &index, &query, &RetrievalConfig::default())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn lexical_overlap_breaks_similarity_near_ties() {
        // Two candidates with identical vectors; only one contains the
        // query phrase. The lexical signal must rank it first.
        let embedder = mock_gateway(16);
        let index = MemoryIndex::new();
        index.ensure_collection(16).await.unwrap();

        let query_text = "refund policy";
        let qvec = embedder.embed_query(query_text).await.unwrap();
        index
            .upsert(vec![
                point("a", "d1", 0, qvec.clone(), "unrelated words entirely"),
                point("b", "d2", 0, qvec.clone(), "the refund policy explained"),
            ])
            .await
            .unwrap();

        let query = RetrievalQuery {
            text: query_text.into(),
            filter: None,
            top_k: 2,
            score_threshold: 0.0,
        };
        let results = retrieve(&embedder, &index, &query, &RetrievalConfig::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].document_id, "d2");
        assert!(results[0].rerank_score > results[1].rerank_score);
    }

    #[tokio::test]
    async fn results_are_truncated_to_top_k() {
        let embedder = mock_gateway(16);
        let index = MemoryIndex::new();
        index.ensure_collection(16).await.unwrap();
        let qvec = embedder.embed_query("topic").await.unwrap();
        let points: Vec<ChunkPoint> = (0..10)
            .map(|i| point(&format!("p{}", i), "d1", i, qvec.clone(), "topic text"))
            .collect();
        index.upsert(points).await.unwrap();

        let query = RetrievalQuery {
            text: "topic".into(),
            filter: None,
            top_k: 3,
            score_threshold: 0.0,
        };
        let results = retrieve(&embedder, &index, &query, &RetrievalConfig::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
    }

    #[tokio::test]
    async fn filter_restricts_candidates() {
        let embedder = mock_gateway(16);
        let index = MemoryIndex::new();
        index.ensure_collection(16).await.unwrap();
        let qvec = embedder.embed_query("shared").await.unwrap();
        index
            .upsert(vec![
                point("a", "d1", 0, qvec.clone(), "shared one"),
                point("b", "d2", 0, qvec.clone(), "shared two"),
            ])
            .await
            .unwrap();

        let query = RetrievalQuery {
            text: "shared".into(),
            filter: Some(HashMap::from([(
                "document_id".to_string(),
                "d2".to_string(),
            )])),
            top_k: 5,
            score_threshold: 0.0,
        };
        let results = retrieve(&embedder, &index, &query, &RetrievalConfig::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].document_id, "d2");
    }
}
