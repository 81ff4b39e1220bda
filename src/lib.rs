//! # Grounded
//!
//! A retrieval-augmented generation engine that grounds AI answers in a
//! private document corpus.
//!
//! Grounded converts heterogeneous files (PDF, DOCX, XLSX, HTML, EML,
//! plain text) into token-bounded chunks, embeds them through an external
//! embedding capability, stores the vectors in a vector database, and
//! answers questions with retrieved, cited evidence — streamed or in one
//! call, with an ungrounded fallback when the corpus has nothing relevant.
//!
//! ## Architecture
//!
//! ```text
//! write path:
//! ┌──────────┐   ┌─────────┐   ┌──────────┐   ┌─────────────┐
//! │ Extract  │──▶│  Chunk  │──▶│  Embed   │──▶│ Vector Index │
//! │ registry │   │ semantic│   │ gateway  │   │   (upsert)   │
//! └──────────┘   │ / fixed │   └──────────┘   └──────┬──────┘
//!                └─────────┘                         │
//! read path:                                         ▼
//! ┌───────┐   ┌──────────┐   ┌────────┐   ┌───────────────────┐
//! │ Query │──▶│  Embed   │──▶│ Search │──▶│ Rerank → Assemble │──▶ stream
//! └───────┘   └──────────┘   └────────┘   └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Domain error set |
//! | [`models`] | Core data types |
//! | [`extract`] | Per-format text and metadata extraction |
//! | [`chunk`] | Token-bounded chunking (semantic / fixed) |
//! | [`embedding`] | Embedding provider trait and batching gateway |
//! | [`index`] | Vector index abstraction (Qdrant / in-memory) |
//! | [`retrieval`] | Over-fetch, lexical overlap, blended rerank |
//! | [`answer`] | Context assembly, generation, answer streaming |
//! | [`pipeline`] | Write-path orchestration and background jobs |
//! | [`query`] | Read-path façade for the chat/query service |

pub mod answer;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod index;
pub mod models;
pub mod pipeline;
pub mod query;
pub mod retrieval;
