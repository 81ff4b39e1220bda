//! # Grounded CLI
//!
//! Command-line interface for the RAG engine: index files into the vector
//! index, query the knowledge base, stream an answer, inspect index
//! stats, and delete documents.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `grounded index <files>…` | Index files (extract → chunk → embed → upsert) |
//! | `grounded query "<text>"` | Retrieve sources and print a grounded answer |
//! | `grounded ask "<text>"` | Stream an answer token by token |
//! | `grounded stats` | Show vector index statistics |
//! | `grounded delete <document-id>` | Remove a document and all its chunks |
//!
//! All commands accept `--config` pointing to a TOML configuration file;
//! absent the file, built-in defaults apply (Qdrant on localhost, OpenAI
//! embeddings and generation).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use grounded::config::{self, Config};
use grounded::models::{AnswerEvent, DocumentMetadata, IndexProgress, IndexRequest};
use grounded::pipeline::{self, Engine};
use grounded::query;

/// Grounded — retrieval-augmented answers over a private document corpus.
#[derive(Parser)]
#[command(
    name = "grounded",
    about = "Ground AI answers in a private document corpus",
    version
)]
struct Cli {
    /// Path to configuration file (TOML). Defaults apply when absent.
    #[arg(long, global = true, default_value = "./grounded.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index one or more files into the knowledge base.
    Index {
        /// Files to index (pdf, docx, xlsx, html, eml, txt).
        files: Vec<PathBuf>,
        /// Attach a metadata field to every file (repeatable, key=value).
        #[arg(long = "meta", value_parser = parse_key_value)]
        meta: Vec<(String, String)>,
    },
    /// Query the knowledge base and print answer plus sources.
    Query {
        text: String,
        /// Override the configured number of results.
        #[arg(long)]
        top_k: Option<usize>,
        /// Override the configured similarity threshold.
        #[arg(long)]
        threshold: Option<f32>,
        /// Restrict to a payload field (repeatable, key=value).
        #[arg(long = "filter", value_parser = parse_key_value)]
        filter: Vec<(String, String)>,
    },
    /// Stream an answer to stdout as it is generated.
    Ask { text: String },
    /// Show vector index statistics.
    Stats,
    /// Delete a document and all of its chunks.
    Delete { document_id: String },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", s))
}

fn load_config(path: &PathBuf) -> Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        Ok(Config::default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Index { files, meta } => run_index(config, files, meta).await,
        Commands::Query {
            text,
            top_k,
            threshold,
            filter,
        } => run_query(config, &text, top_k, threshold, filter).await,
        Commands::Ask { text } => run_ask(config, &text).await,
        Commands::Stats => run_stats(config).await,
        Commands::Delete { document_id } => run_delete(config, &document_id).await,
    }
}

async fn build_engine(config: Config) -> Result<Engine> {
    Engine::from_config(config)
        .await
        .context("failed to initialize engine")
}

async fn run_index(config: Config, files: Vec<PathBuf>, meta: Vec<(String, String)>) -> Result<()> {
    if files.is_empty() {
        anyhow::bail!("no files given");
    }
    let engine = Arc::new(build_engine(config).await?);

    let metadata = DocumentMetadata {
        extra: meta.into_iter().collect(),
        ..Default::default()
    };
    let requests: Vec<IndexRequest> = files
        .into_iter()
        .map(|path| {
            // Stable per path, so re-running the command re-indexes in place.
            let document_id = uuid::Uuid::new_v5(
                &uuid::Uuid::NAMESPACE_OID,
                path.display().to_string().as_bytes(),
            )
            .to_string();
            IndexRequest {
                path,
                document_id,
                metadata: metadata.clone(),
            }
        })
        .collect();

    let (handle, mut progress) = pipeline::spawn_indexing_job(engine, requests);
    while let Some(event) = progress.recv().await {
        match event {
            IndexProgress::Started { total } => eprintln!("indexing {} file(s)...", total),
            IndexProgress::Indexed {
                document_id,
                chunks,
            } => eprintln!("  indexed {} ({} chunks)", document_id, chunks),
            IndexProgress::Failed { document_id, error } => {
                eprintln!("  failed {}: {}", document_id, error)
            }
            IndexProgress::Finished { .. } => {}
        }
    }
    let summary = handle.await.context("indexing job panicked")?;

    println!("index");
    println!("  total: {}", summary.total);
    println!("  indexed: {}", summary.indexed);
    println!("  failed: {}", summary.failed);
    println!("  status: {:?}", summary.status);
    Ok(())
}

async fn run_query(
    config: Config,
    text: &str,
    top_k: Option<usize>,
    threshold: Option<f32>,
    filter: Vec<(String, String)>,
) -> Result<()> {
    let engine = build_engine(config).await?;
    let filter: Option<HashMap<String, String>> = if filter.is_empty() {
        None
    } else {
        Some(filter.into_iter().collect())
    };

    let (answer, sources) =
        query::query_knowledge_base(&engine, text, &[], filter, top_k, threshold).await?;

    if sources.is_empty() {
        println!("(no sources above threshold — ungrounded answer)");
    } else {
        println!("sources:");
        for (i, s) in sources.iter().enumerate() {
            let title = s.title.as_deref().unwrap_or("(untitled)");
            println!(
                "  {}. [{:.2}] {} #{} — {}",
                i + 1,
                s.rerank_score,
                title,
                s.chunk_index,
                s.preview().replace('\n', " ")
            );
        }
    }
    println!();
    println!("{}", answer.text);
    Ok(())
}

async fn run_ask(config: Config, text: &str) -> Result<()> {
    use std::io::Write;

    let engine = build_engine(config).await?;
    let mut events = query::stream_knowledge_base(&engine, text, &[], None, None, None).await?;

    while let Some(event) = events.recv().await {
        match event {
            AnswerEvent::Sources { sources, no_sources } => {
                if no_sources {
                    eprintln!("(no sources above threshold)");
                } else {
                    eprintln!("({} sources)", sources.len());
                }
            }
            AnswerEvent::Delta { text } => {
                print!("{}", text);
                std::io::stdout().flush().ok();
            }
            AnswerEvent::Complete { .. } => {
                println!();
            }
            AnswerEvent::Error { message } => {
                anyhow::bail!("generation failed: {}", message);
            }
        }
    }
    Ok(())
}

async fn run_stats(config: Config) -> Result<()> {
    let engine = build_engine(config).await?;
    let stats = engine.index.stats().await?;

    println!("Grounded — Vector Index Stats");
    println!("=============================");
    println!();
    println!("  Points:     {}", stats.points);
    println!("  Dimension:  {}", stats.dimension);
    println!("  Distance:   {}", stats.distance);
    Ok(())
}

async fn run_delete(config: Config, document_id: &str) -> Result<()> {
    let engine = build_engine(config).await?;
    engine.index.delete_by_document(document_id).await?;
    println!("deleted {}", document_id);
    Ok(())
}
