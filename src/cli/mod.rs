//! repoqa CLI command definitions and implementations.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use crate::acquire::{ContentType, Document};
use crate::config::{self, PipelineConfig};
use crate::embed::{has_api_key, GeminiEmbedding};
use crate::index::create_index;
use crate::pipeline::{CancelFlag, IngestPipeline, QueryPipeline, QueryRequest};

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "repoqa")]
#[command(version, about = "RAG pipeline for repository knowledge bases", long_about = None)]
pub struct Cli {
    /// Path to a config file (default: ~/.repoqa/repoqa.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Crawl a seed URL (or take text directly) into the knowledge base
    Ingest {
        /// Seed URL to crawl
        #[arg(short, long)]
        url: Option<String>,

        /// Text content to ingest directly
        #[arg(short, long)]
        text: Option<String>,

        /// Source label for directly-ingested text
        #[arg(long, default_value = "direct-input")]
        source: String,
    },

    /// Ask a question against the knowledge base
    Ask {
        /// The question
        question: String,

        /// Number of passages to retrieve
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show configuration and index status
    Status,

    /// Write a default config file
    InitConfig,
}

// ============================================================================
// CLI Runner
// ============================================================================

/// Execute the parsed CLI command.
pub async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Ingest { url, text, source } => cmd_ingest(config, url, text, source).await,
        Commands::Ask { question, limit } => cmd_ask(config, &question, limit).await,
        Commands::Status => cmd_status(config).await,
        Commands::InitConfig => cmd_init_config(),
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<PipelineConfig> {
    match path {
        Some(p) => config::load_config_from(p)
            .with_context(|| format!("failed to load config from {}", p.display())),
        None => config::load_config().context("failed to load config"),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Ingest command: crawl a URL or store provided text.
async fn cmd_ingest(
    config: PipelineConfig,
    url: Option<String>,
    text: Option<String>,
    source: String,
) -> Result<()> {
    require_api_key()?;

    let embedding = Arc::new(GeminiEmbedding::from_env(config.embedder.vector_size)?);
    let index = create_index(&config.index)?;
    let pipeline = IngestPipeline::new(config, embedding, index);
    let cancel = CancelFlag::new();

    let report = if let Some(ref seed) = url {
        println!("[*] Crawling: {seed}");
        pipeline.run(seed, &cancel).await?
    } else if let Some(text) = text {
        println!("[*] Ingesting provided text ({} chars)", text.len());
        let doc = Document::from_text(&source, text, ContentType::Plaintext);
        pipeline.run_documents(vec![doc], &cancel).await?
    } else {
        bail!("specify --url or --text");
    };

    println!("[OK] Ingest complete");
    println!(
        "     Pages: {} fetched, {} skipped",
        report.pages_fetched, report.pages_skipped
    );
    println!(
        "     Chunks: {} produced, {} dropped",
        report.chunks_produced, report.chunks_dropped
    );
    println!(
        "     Indexed: {} ({} embed failures, {} index failures)",
        report.records_indexed, report.embed_failures, report.index_failures
    );

    Ok(())
}

/// Ask command: hybrid retrieval plus grounded generation.
async fn cmd_ask(config: PipelineConfig, question: &str, limit: Option<usize>) -> Result<()> {
    require_api_key()?;

    let embedding = Arc::new(GeminiEmbedding::from_env(config.embedder.vector_size)?);
    let generation = Arc::new(crate::answer::GeminiGeneration::from_env(
        config.answerer.clone(),
    )?);
    let index = create_index(&config.index)?;
    let pipeline = QueryPipeline::new(config, embedding, generation, index);

    println!("[*] Asking: \"{question}\"");

    let request = QueryRequest {
        question: question.to_string(),
        repository_context_id: None,
        limit,
    };
    let response = match pipeline.ask(&request, &CancelFlag::new()).await {
        Ok(r) => r,
        Err(e) => bail!("query failed ({:?}): {}", e.kind, e.message),
    };

    println!();
    println!("{}", response.answer);
    println!();

    if response.fallback_used {
        println!(
            "[!] Confidence {:.2} was below the threshold",
            response.confidence
        );
    } else {
        println!("[OK] Confidence: {:.2}", response.confidence);
    }

    if !response.sources.is_empty() {
        println!("     Sources:");
        for source in &response.sources {
            println!(
                "       [{}] {} (score {:.3})",
                source.index,
                truncate_text(&source.uri, 80),
                source.score
            );
        }
    }
    if response.limit_clamped {
        println!("[!] Requested limit exceeded the maximum and was clamped");
    }

    Ok(())
}

/// Status command.
async fn cmd_status(config: PipelineConfig) -> Result<()> {
    println!("repoqa v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("[*] Config file: {}", config::config_file_path().display());
    println!("[*] Data directory: {}", config::get_data_dir().display());

    if has_api_key() {
        println!("[OK] API key: set");
    } else {
        println!("[!] API key: not set");
        println!("    export GEMINI_API_KEY=your-key");
    }

    if config.index.endpoint.is_empty() {
        println!("[*] Index: in-memory (no endpoint configured)");
    } else {
        println!("[*] Index: {}", config.index.endpoint);
        match create_index(&config.index) {
            Ok(index) => match index.count(&config.embedder.collection).await {
                Ok(count) => {
                    println!(
                        "[OK] Collection '{}': {} records",
                        config.embedder.collection, count
                    );
                }
                Err(e) => {
                    println!("[!] Collection unreachable: {e}");
                }
            },
            Err(e) => {
                println!("[!] Index client error: {e}");
            }
        }
    }

    println!(
        "[*] Retrieval: hybrid={} (vector {:.1} / keyword {:.1}), min_score {:.2}",
        config.retriever.use_hybrid_search,
        config.retriever.vector_weight,
        config.retriever.keyword_weight,
        config.retriever.min_score
    );
    println!("[*] Model: {}", config.answerer.model);

    Ok(())
}

/// Init-config command: write the default config file.
fn cmd_init_config() -> Result<()> {
    let path = config::init_config().context("failed to write config file")?;
    println!("[OK] Wrote default config: {}", path.display());
    println!("     Edit it and rerun your command.");
    Ok(())
}

fn require_api_key() -> Result<()> {
    if !has_api_key() {
        bail!(
            "API key not set.\n\n\
             Set one of:\n  \
             export GEMINI_API_KEY=your-api-key\n  \
             export GOOGLE_AI_API_KEY=your-api-key\n\n\
             Get a key at: https://aistudio.google.com/app/apikey"
        );
    }
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// UTF-8 safe truncation for display.
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

// ============================================================================
// Tests
// ============================================================================
