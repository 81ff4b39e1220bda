//! Answer assembly and streaming.
//!
//! Builds the grounding context from retrieval results, invokes the
//! generation capability, and attributes sources. The streaming path is a
//! producer task feeding a bounded channel: it emits a `sources` event,
//! then incremental text deltas, then `complete` with the persisted
//! message id. Consumer disconnect (dropped receiver) cancels generation
//! cooperatively; a failed or cancelled stream never yields `complete`,
//! so partial text is never persisted as a finished answer.
//!
//! State machine: `Pending → SourcesSent → Generating → Completed |
//! Failed`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::GenerationConfig;
use crate::error::RagError;
use crate::models::{Answer, AnswerEvent, ChatMessage, RetrievalResult};

/// External generation capability: ordered message list in, full text or
/// an async delta sequence out.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn model_name(&self) -> &str;

    /// Generate the full answer text in one call.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, RagError>;

    /// Generate incrementally. The returned channel yields text deltas;
    /// an `Err` item aborts the stream. Dropping the receiver cancels the
    /// underlying call.
    async fn stream(
        &self,
        messages: &[ChatMessage],
    ) -> Result<mpsc::Receiver<Result<String, RagError>>, RagError>;
}

/// Instantiate a generation provider from configuration.
pub fn create_provider(config: &GenerationConfig) -> Result<Arc<dyn GenerationProvider>, RagError> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiGeneration::new(config)?)),
        "mock" => Ok(Arc::new(MockGeneration::default())),
        other => Err(RagError::Config(format!(
            "unknown generation provider: {}",
            other
        ))),
    }
}

// ============ Prompt assembly ============

const GROUNDED_INSTRUCTIONS: &str = "You are a helpful assistant answering questions about a \
private document corpus. Use the context below to answer. Cite the sources you used by their \
markers (for example [Source 1]). If the context does not contain the information needed, say so \
and answer from general knowledge instead.";

const UNGROUNDED_INSTRUCTIONS: &str = "You are a helpful assistant. No relevant documents were \
found for this question, so answer from general knowledge and say that the document corpus did \
not cover it.";

/// One context entry per result: a source marker with title/author when
/// present, then the chunk text.
fn build_context_block(results: &[RetrievalResult]) -> String {
    let mut out = String::new();
    for (i, result) in results.iter().enumerate() {
        let mut marker = format!("[Source {}", i + 1);
        if let Some(title) = &result.title {
            marker.push_str(": ");
            marker.push_str(title);
            if let Some(author) = &result.author {
                marker.push_str(" (");
                marker.push_str(author);
                marker.push(')');
            }
        }
        marker.push(']');
        out.push_str(&marker);
        out.push('\n');
        out.push_str(&result.text);
        out.push_str("\n\n");
    }
    out
}

/// Assemble the full message list: system instructions (with context when
/// sources exist), bounded history, then the user query.
pub fn build_messages(
    config: &GenerationConfig,
    query: &str,
    history: &[ChatMessage],
    results: &[RetrievalResult],
) -> Vec<ChatMessage> {
    let system = if results.is_empty() {
        UNGROUNDED_INSTRUCTIONS.to_string()
    } else {
        format!(
            "{}\n\nContext:\n\n{}",
            GROUNDED_INSTRUCTIONS,
            build_context_block(results)
        )
    };

    let mut messages = vec![ChatMessage::system(system)];
    let recent = history
        .iter()
        .filter(|m| !matches!(m.role, crate::models::Role::System));
    let recent: Vec<&ChatMessage> = recent.collect();
    let skip = recent.len().saturating_sub(config.max_history);
    messages.extend(recent.into_iter().skip(skip).cloned());
    messages.push(ChatMessage::user(query));
    messages
}

// ============ Non-streaming path ============

/// Produce a complete answer with attributed sources.
///
/// An empty result list skips context injection and marks the answer
/// ungrounded; it never fabricates a citation.
pub async fn assemble_answer(
    generation: &dyn GenerationProvider,
    config: &GenerationConfig,
    query: &str,
    history: &[ChatMessage],
    results: &[RetrievalResult],
) -> Result<Answer, RagError> {
    let grounded = !results.is_empty();
    if !grounded {
        info!(query, "no sources above threshold; ungrounded fallback");
    }
    let messages = build_messages(config, query, history, results);
    let text = generation.complete(&messages).await?;
    Ok(Answer {
        text,
        sources: results.to_vec(),
        grounded,
    })
}

// ============ Streaming path ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Pending,
    SourcesSent,
    Generating,
    Completed,
    Failed,
}

/// Stream an answer: `Sources`, then `Delta`s, then `Complete` or
/// `Error`. Returns the consumer half of a bounded channel.
pub fn stream_answer(
    generation: Arc<dyn GenerationProvider>,
    config: GenerationConfig,
    query: String,
    history: Vec<ChatMessage>,
    results: Vec<RetrievalResult>,
) -> mpsc::Receiver<AnswerEvent> {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(run_stream(tx, generation, config, query, history, results));
    rx
}

async fn run_stream(
    tx: mpsc::Sender<AnswerEvent>,
    generation: Arc<dyn GenerationProvider>,
    config: GenerationConfig,
    query: String,
    history: Vec<ChatMessage>,
    results: Vec<RetrievalResult>,
) {
    let mut state = StreamState::Pending;
    debug!(?state, "answer stream opened");
    let no_sources = results.is_empty();
    if no_sources {
        info!(query = %query, "streaming ungrounded answer");
    }

    if tx
        .send(AnswerEvent::Sources {
            sources: results.clone(),
            no_sources,
        })
        .await
        .is_err()
    {
        debug!("consumer disconnected before sources event");
        return;
    }
    state = StreamState::SourcesSent;
    debug!(?state, sources = results.len(), "sources sent");

    let messages = build_messages(&config, &query, &history, &results);
    let mut deltas = match generation.stream(&messages).await {
        Ok(rx) => rx,
        Err(e) => {
            state = StreamState::Failed;
            warn!(?state, error = %e, "generation stream failed to start");
            let _ = tx
                .send(AnswerEvent::Error {
                    message: e.to_string(),
                })
                .await;
            return;
        }
    };
    state = StreamState::Generating;
    debug!(?state, "generation started");

    let mut chars_streamed = 0usize;
    while let Some(item) = deltas.recv().await {
        match item {
            Ok(delta) => {
                chars_streamed += delta.len();
                if tx.send(AnswerEvent::Delta { text: delta }).await.is_err() {
                    // Consumer disconnect: drop the delta receiver, which
                    // cancels the provider task at its next send. The
                    // partial answer is discarded, never persisted.
                    debug!(chars_streamed, "consumer disconnected; cancelling generation");
                    return;
                }
            }
            Err(e) => {
                state = StreamState::Failed;
                warn!(?state, error = %e, "generation failed mid-stream");
                let _ = tx
                    .send(AnswerEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        }
    }

    state = StreamState::Completed;
    let message_id = Uuid::new_v4().to_string();
    debug!(?state, %message_id, chars_streamed, "answer complete");
    let _ = tx.send(AnswerEvent::Complete { message_id }).await;
}

// ============ OpenAI-compatible provider ============

pub struct OpenAiGeneration {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    temperature: f32,
    max_tokens: usize,
    api_key: String,
}

impl OpenAiGeneration {
    pub fn new(config: &GenerationConfig) -> Result<Self, RagError> {
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
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            api_key,
        })
    }

    fn request_body(&self, messages: &[ChatMessage], stream: bool) -> serde_json::Value {
        json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "stream": stream,
        })
    }
}

#[async_trait]
impl GenerationProvider for OpenAiGeneration {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, RagError> {
        let url = format!("{}/chat/completions", self.endpoint);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(messages, false))
            .send()
            .await
            .map_err(|e| RagError::Generation(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RagError::Generation(format!("{}: {}", status, body)));
        }
        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| RagError::Generation(e.to_string()))?;
        value["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RagError::Generation("response has no message content".into()))
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
    ) -> Result<mpsc::Receiver<Result<String, RagError>>, RagError> {
        let url = format!("{}/chat/completions", self.endpoint);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(messages, true))
            .send()
            .await
            .map_err(|e| RagError::Generation(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RagError::Generation(format!("{}: {}", status, body)));
        }

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut byte_stream = resp.bytes_stream();
            let mut buf = String::new();
            while let Some(chunk) = byte_stream.next().await {
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Err(RagError::Generation(e.to_string()))).await;
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim().to_string();
                    buf.drain(..=pos);
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        return;
                    }
                    let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
                        continue;
                    };
                    if let Some(delta) = value["choices"][0]["delta"]["content"].as_str() {
                        if !delta.is_empty()
                            && tx.send(Ok(delta.to_string())).await.is_err()
                        {
                            // Receiver dropped: cooperative cancellation.
                            return;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }
}

// ============ Mock provider ============

/// Canned generation for tests and offline runs. Echoes whether context
/// was present so assertions can distinguish grounded from fallback
/// prompts.
#[derive(Default)]
pub struct MockGeneration {
    /// When set, `complete` and `stream` emit this text verbatim.
    pub reply: Option<String>,
}

impl MockGeneration {
    fn reply_for(&self, messages: &[ChatMessage]) -> String {
        if let Some(reply) = &self.reply {
            return reply.clone();
        }
        let has_context = messages
            .first()
            .map(|m| m.content.contains("[Source 1"))
            .unwrap_or(false);
        if has_context {
            "Answer based on the provided context. [Source 1]".to_string()
        } else {
            "The document corpus did not cover this; answering from general knowledge.".to_string()
        }
    }
}

#[async_trait]
impl GenerationProvider for MockGeneration {
    fn model_name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, RagError> {
        Ok(self.reply_for(messages))
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
    ) -> Result<mpsc::Receiver<Result<String, RagError>>, RagError> {
        let reply = self.reply_for(messages);
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            for word in reply.split_inclusive(' ') {
                if tx.send(Ok(word.to_string())).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    fn result(doc: &str, text: &str, title: Option<&str>, author: Option<&str>) -> RetrievalResult {
        RetrievalResult {
            document_id: doc.to_string(),
            chunk_index: 0,
            similarity_score: 0.9,
            rerank_score: 0.9,
            text: text.to_string(),
            title: title.map(String::from),
            author: author.map(String::from),
        }
    }

    #[test]
    fn context_block_carries_markers_and_metadata() {
        let results = vec![
            result("d1", "First chunk.", Some("Handbook"), Some("Jane Doe")),
            result("d2", "Second chunk.", None, None),
        ];
        let block = build_context_block(&results);
        assert!(block.contains("[Source 1: Handbook (Jane Doe)]"));
        assert!(block.contains("[Source 2]"));
        assert!(block.contains("First chunk."));
        assert!(block.contains("Second chunk."));
    }

    #[test]
    fn messages_bound_history_and_end_with_query() {
        let config = GenerationConfig {
            max_history: 2,
            ..Default::default()
        };
        let history: Vec<ChatMessage> = (0..6)
            .map(|i| {
                if i % 2 == 0 {
                    ChatMessage::user(format!("question {}", i))
                } else {
                    ChatMessage::assistant(format!("answer {}", i))
                }
            })
            .collect();
        let messages = build_messages(&config, "latest question", &history, &[]);

        // System + 2 history turns + query.
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].content, "question 4");
        assert_eq!(messages[2].content, "answer 5");
        assert_eq!(messages.last().unwrap().content, "latest question");
    }

    #[test]
    fn empty_results_use_ungrounded_instructions() {
        let config = GenerationConfig::default();
        let messages = build_messages(&config, "anything", &[], &[]);
        assert!(messages[0].content.contains("general knowledge"));
        assert!(!messages[0].content.contains("Context:"));
    }

    #[tokio::test]
    async fn assemble_answer_marks_grounding() {
        let provider = MockGeneration::default();
        let config = GenerationConfig::default();

        let grounded = assemble_answer(
            &provider,
            &config,
            "what is the refund window?",
            &[],
            &[result("d1", "Refunds within 30 days.", None, None)],
        )
        .await
        .unwrap();
        assert!(grounded.grounded);
        assert_eq!(grounded.sources.len(), 1);

        let fallback = assemble_answer(&provider, &config, "unknown topic", &[], &[])
            .await
            .unwrap();
        assert!(!fallback.grounded);
        assert!(fallback.sources.is_empty());
    }

    #[tokio::test]
    async fn stream_emits_sources_deltas_complete_in_order() {
        let provider: Arc<dyn GenerationProvider> = Arc::new(MockGeneration::default());
        let mut rx = stream_answer(
            provider,
            GenerationConfig::default(),
            "refund window?".into(),
            vec![],
            vec![result("d1", "Refunds within 30 days.", None, None)],
        );

        let first = rx.recv().await.unwrap();
        match first {
            AnswerEvent::Sources {
                sources,
                no_sources,
            } => {
                assert_eq!(sources.len(), 1);
                assert!(!no_sources);
            }
            other => panic!("expected sources first, got {:?}", other),
        }

        let mut text = String::new();
        let mut completed = false;
        while let Some(event) = rx.recv().await {
            match event {
                AnswerEvent::Delta { text: t } => text.push_str(&t),
                AnswerEvent::Complete { message_id } => {
                    assert!(!message_id.is_empty());
                    completed = true;
                }
                AnswerEvent::Sources { .. } => panic!("duplicate sources event"),
                AnswerEvent::Error { message } => panic!("unexpected error: {}", message),
            }
        }
        assert!(completed);
        assert!(text.contains("[Source 1]"));
    }

    #[tokio::test]
    async fn stream_with_no_sources_sets_flag_and_still_completes() {
        let provider: Arc<dyn GenerationProvider> = Arc::new(MockGeneration::default());
        let mut rx = stream_answer(
            provider,
            GenerationConfig::default(),
            "nothing indexed about this".into(),
            vec![],
            vec![],
        );

        match rx.recv().await.unwrap() {
            AnswerEvent::Sources {
                sources,
                no_sources,
            } => {
                assert!(sources.is_empty());
                assert!(no_sources);
            }
            other => panic!("expected sources first, got {:?}", other),
        }

        let mut saw_complete = false;
        while let Some(event) = rx.recv().await {
            if let AnswerEvent::Complete { .. } = event {
                saw_complete = true;
            }
        }
        assert!(saw_complete);
    }

    #[tokio::test]
    async fn failing_stream_emits_error_and_never_completes() {
        struct FailingGeneration;

        #[async_trait]
        impl GenerationProvider for FailingGeneration {
            fn model_name(&self) -> &str {
                "failing"
            }
            async fn complete(&self, _messages: &[ChatMessage]) -> Result<String, RagError> {
                Err(RagError::Generation("boom".into()))
            }
            async fn stream(
                &self,
                _messages: &[ChatMessage],
            ) -> Result<mpsc::Receiver<Result<String, RagError>>, RagError> {
                let (tx, rx) = mpsc::channel(4);
                tokio::spawn(async move {
                    let _ = tx.send(Ok("partial ".to_string())).await;
                    let _ = tx.send(Err(RagError::Generation("boom".into()))).await;
                });
                Ok(rx)
            }
        }

        let provider: Arc<dyn GenerationProvider> = Arc::new(FailingGeneration);
        let mut rx = stream_answer(
            provider,
            GenerationConfig::default(),
            "q".into(),
            vec![],
            vec![],
        );

        let mut saw_error = false;
        let mut saw_complete = false;
        while let Some(event) = rx.recv().await {
            match event {
                AnswerEvent::Error { .. } => saw_error = true,
                AnswerEvent::Complete { .. } => saw_complete = true,
                _ => {}
            }
        }
        assert!(saw_error);
        assert!(!saw_complete, "partial answer must not complete");
    }

    #[tokio::test]
    async fn dropping_receiver_cancels_stream() {
        let provider: Arc<dyn GenerationProvider> = Arc::new(MockGeneration {
            reply: Some("a ".repeat(1000)),
        });
        let mut rx = stream_answer(
            provider,
            GenerationConfig::default(),
            "q".into(),
            vec![],
            vec![],
        );
        // Take the sources event and one delta, then disconnect.
        let _ = rx.recv().await;
        let _ = rx.recv().await;
        drop(rx);
        // Nothing to assert beyond not hanging: the producer task exits on
        // its next send.
        tokio::task::yield_now().await;
    }
}
