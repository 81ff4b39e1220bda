//! Read-path façade for the chat/query service.
//!
//! Retrieval runs first so retrieval errors surface before any stream
//! starts; the answer is then assembled (or streamed) from the reranked
//! results. Low-confidence retrieval is not an error: it triggers the
//! ungrounded fallback and is logged as a quality signal.

use tokio::sync::mpsc;
use tracing::info;

use crate::answer;
use crate::error::RagError;
use crate::index::PayloadFilter;
use crate::models::{Answer, AnswerEvent, ChatMessage, RetrievalQuery, RetrievalResult};
use crate::pipeline::Engine;
use crate::retrieval;

fn build_query(
    engine: &Engine,
    query: &str,
    filter: Option<PayloadFilter>,
    max_results: Option<usize>,
    score_threshold: Option<f32>,
) -> RetrievalQuery {
    RetrievalQuery {
        text: query.to_string(),
        filter,
        top_k: max_results.unwrap_or(engine.config.retrieval.top_k),
        score_threshold: score_threshold.unwrap_or(engine.config.retrieval.score_threshold),
    }
}

/// Answer a question from the knowledge base in one call.
///
/// Returns the answer and the sources that contributed to its context, in
/// rerank order.
pub async fn query_knowledge_base(
    engine: &Engine,
    query: &str,
    history: &[ChatMessage],
    filter: Option<PayloadFilter>,
    max_results: Option<usize>,
    score_threshold: Option<f32>,
) -> Result<(Answer, Vec<RetrievalResult>), RagError> {
    let retrieval_query = build_query(engine, query, filter, max_results, score_threshold);
    let results = retrieval::retrieve(
        &engine.embedder,
        engine.index.as_ref(),
        &retrieval_query,
        &engine.config.retrieval,
    )
    .await?;

    info!(query, sources = results.len(), "query retrieval complete");

    let answer = answer::assemble_answer(
        engine.generation.as_ref(),
        &engine.config.generation,
        query,
        history,
        &results,
    )
    .await?;
    Ok((answer, results))
}

/// Streaming variant: retrieval errors are returned before the stream
/// opens; afterwards the receiver yields `Sources`, `Delta`s, then
/// `Complete` or `Error`.
pub async fn stream_knowledge_base(
    engine: &Engine,
    query: &str,
    history: &[ChatMessage],
    filter: Option<PayloadFilter>,
    max_results: Option<usize>,
    score_threshold: Option<f32>,
) -> Result<mpsc::Receiver<AnswerEvent>, RagError> {
    let retrieval_query = build_query(engine, query, filter, max_results, score_threshold);
    let results = retrieval::retrieve(
        &engine.embedder,
        engine.index.as_ref(),
        &retrieval_query,
        &engine.config.retrieval,
    )
    .await?;

    Ok(answer::stream_answer(
        engine.generation.clone(),
        engine.config.generation.clone(),
        query.to_string(),
        history.to_vec(),
        results,
    ))
}
