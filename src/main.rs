//! # Org Archivist
//!
//! A retrieval-augmented backend for nonprofits: ingest grant proposals,
//! reports, and case studies; retrieve them with hybrid dense/lexical
//! search; and generate funder-ready prose grounded in cited excerpts.
//!
//! ## Architecture
//!
//! ```text
//! Ingest → Chunk → Embed → SQLite (vector + relational) → Retrieve → Generate → CLI
//! ```
//!
//! ## Modules
//!
//! - [`config`] — TOML configuration parsing and validation
//! - [`models`] — Core data types: documents, chunks, conversations, outputs, styles
//! - [`extract`] — PDF/DOCX/TXT text extraction
//! - [`chunk`] — Sentence/semantic/token-window chunker
//! - [`embedding`] — Embedding provider trait and implementations
//! - [`llm`] — LLM adapter trait and implementations
//! - [`vector_store`] — Chunk embedding store with filter pushdown (C1)
//! - [`store`] — Relational store: documents, programs, conversations, outputs (C2)
//! - [`bm25`] — In-memory lexical index (C8)
//! - [`ingest`] — Ingestion pipeline (C7)
//! - [`search`] — Hybrid retrieval engine (C9)
//! - [`cache`] — Query cache (C10)
//! - [`generate`] — Generation orchestrator (C11)
//! - [`style`] — Style analyzer (C12)
//! - [`db`] — SQLite connection management
//! - [`migrate`] — Database schema migrations

use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;

use archivist::config::{self, Config};
use archivist::models::{DocType, DocumentMetadata, Outcome, Role, SensitivityLevel, StyleType};
use archivist::search::RetrievalFilter;
use archivist::{bm25, cache, db, embedding, extract, generate, ingest, llm, migrate, search, store, style};

/// Operation-level timeouts for the CLI's direct library calls. Streaming
/// generation has no outer timeout here: its natural bound is the LLM
/// stream's own completion, and dropping the event stream (e.g. the
/// process exiting) is what cancels it.
const INGEST_TIMEOUT: Duration = Duration::from_secs(60);
const RETRIEVE_TIMEOUT: Duration = Duration::from_secs(10);
const GENERATE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(
    name = "archivist",
    about = "Org Archivist — a RAG backend for nonprofit grant writing and reporting",
    version
)]
struct Cli {
    #[arg(long, global = true, default_value = "./config/archivist.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema
    Init,

    /// Ingest a file as a new document
    Ingest {
        file: PathBuf,
        #[arg(long, value_enum)]
        doc_type: DocTypeArg,
        #[arg(long)]
        year: i32,
        #[arg(long, value_enum)]
        outcome: OutcomeArg,
        #[arg(long, value_delimiter = ',')]
        programs: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long)]
        sensitive: bool,
        #[arg(long, default_value = "low")]
        sensitivity_level: String,
        #[arg(long, default_value = "cli")]
        created_by: String,
        /// Re-ingest in place as this existing document id (delete-then-insert).
        #[arg(long)]
        doc_id: Option<String>,
    },

    /// Delete a document and its chunks
    DeleteDocument { id: String },

    /// List documents, optionally filtered
    ListDocuments {
        #[arg(long)]
        doc_type: Option<String>,
        #[arg(long)]
        year: Option<i32>,
        #[arg(long)]
        outcome: Option<String>,
        #[arg(long)]
        program: Option<String>,
        #[arg(long, default_value_t = 0)]
        offset: i64,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    /// Retrieve the top chunks for a query (C9)
    Retrieve {
        query: String,
        #[arg(long, default_value_t = 5)]
        top_k: i64,
        #[arg(long)]
        program: Option<String>,
        #[arg(long)]
        year_min: Option<i32>,
        #[arg(long)]
        year_max: Option<i32>,
        #[arg(long)]
        recency_weight: Option<f64>,
    },

    /// Generate a grounded answer for a query (C11)
    Generate {
        query: String,
        #[arg(long)]
        audience: Option<String>,
        #[arg(long)]
        section: Option<String>,
        #[arg(long)]
        tone: Option<String>,
        #[arg(long)]
        writing_style_id: Option<String>,
        #[arg(long, default_value_t = 5)]
        max_sources: i64,
        #[arg(long)]
        custom_instructions: Option<String>,
        #[arg(long)]
        stream: bool,
    },

    /// Send a message in a conversation and persist the reply (C13 + C11)
    Chat {
        #[arg(long)]
        conversation_id: Option<String>,
        message: String,
        #[arg(long, default_value = "cli-user")]
        owner_user_id: String,
    },

    /// Manage programs
    Program {
        #[command(subcommand)]
        action: ProgramAction,
    },

    /// Manage writing styles
    Style {
        #[command(subcommand)]
        action: StyleAction,
    },

    /// Manage drafted outputs
    Output {
        #[command(subcommand)]
        action: OutputAction,
    },
}

#[derive(Subcommand)]
enum ProgramAction {
    Add {
        name: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, default_value_t = 0)]
        display_order: i32,
    },
    List,
    Remove {
        name: String,
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum OutputAction {
    Create {
        output_type: String,
        title: String,
        #[arg(long)]
        content_file: PathBuf,
        #[arg(long)]
        writing_style_id: Option<String>,
    },
    Get {
        id: String,
    },
    SetStatus {
        id: String,
        #[arg(value_enum)]
        status: OutputStatusArg,
        /// Required to jump straight to a terminal status (e.g. draft -> awarded).
        #[arg(long)]
        skip_reason: Option<String>,
    },
    SetContent {
        id: String,
        content_file: PathBuf,
    },
}

#[derive(clap::ValueEnum, Clone)]
enum OutputStatusArg {
    Draft,
    Submitted,
    Pending,
    Awarded,
    NotAwarded,
}

impl From<OutputStatusArg> for archivist::models::OutputStatus {
    fn from(v: OutputStatusArg) -> Self {
        use archivist::models::OutputStatus;
        match v {
            OutputStatusArg::Draft => OutputStatus::Draft,
            OutputStatusArg::Submitted => OutputStatus::Submitted,
            OutputStatusArg::Pending => OutputStatus::Pending,
            OutputStatusArg::Awarded => OutputStatus::Awarded,
            OutputStatusArg::NotAwarded => OutputStatus::NotAwarded,
        }
    }
}

#[derive(Subcommand)]
enum StyleAction {
    /// Analyze sample texts (one file per sample) and persist the result
    Analyze {
        name: String,
        #[arg(long, value_enum)]
        style_type: StyleTypeArg,
        #[arg(long, value_delimiter = ',')]
        samples: Vec<PathBuf>,
        #[arg(long)]
        description: Option<String>,
    },
    List,
    Delete {
        id: String,
    },
}

#[derive(clap::ValueEnum, Clone)]
enum DocTypeArg {
    GrantProposal,
    GrantReport,
    CaseStudy,
    AnnualReport,
    Other,
}

impl From<DocTypeArg> for DocType {
    fn from(v: DocTypeArg) -> Self {
        match v {
            DocTypeArg::GrantProposal => DocType::GrantProposal,
            DocTypeArg::GrantReport => DocType::GrantReport,
            DocTypeArg::CaseStudy => DocType::CaseStudy,
            DocTypeArg::AnnualReport => DocType::AnnualReport,
            DocTypeArg::Other => DocType::Other,
        }
    }
}

#[derive(clap::ValueEnum, Clone)]
enum OutcomeArg {
    Awarded,
    NotAwarded,
    Pending,
    NA,
}

impl From<OutcomeArg> for Outcome {
    fn from(v: OutcomeArg) -> Self {
        match v {
            OutcomeArg::Awarded => Outcome::Awarded,
            OutcomeArg::NotAwarded => Outcome::NotAwarded,
            OutcomeArg::Pending => Outcome::Pending,
            OutcomeArg::NA => Outcome::NotApplicable,
        }
    }
}

#[derive(clap::ValueEnum, Clone)]
enum StyleTypeArg {
    Grant,
    Proposal,
    Report,
    General,
}

impl From<StyleTypeArg> for StyleType {
    fn from(v: StyleTypeArg) -> Self {
        match v {
            StyleTypeArg::Grant => StyleType::Grant,
            StyleTypeArg::Proposal => StyleType::Proposal,
            StyleTypeArg::Report => StyleType::Report,
            StyleTypeArg::General => StyleType::General,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            file,
            doc_type,
            year,
            outcome,
            programs,
            tags,
            notes,
            sensitive,
            sensitivity_level,
            created_by,
            doc_id,
        } => {
            run_ingest(
                &cfg, file, doc_type.into(), year, outcome.into(), programs, tags, notes, sensitive,
                sensitivity_level, created_by, doc_id,
            )
            .await?;
        }
        Commands::DeleteDocument { id } => {
            run_delete_document(&cfg, &id).await?;
        }
        Commands::ListDocuments {
            doc_type,
            year,
            outcome,
            program,
            offset,
            limit,
        } => {
            run_list_documents(&cfg, doc_type, year, outcome, program, offset, limit).await?;
        }
        Commands::Retrieve {
            query,
            top_k,
            program,
            year_min,
            year_max,
            recency_weight,
        } => {
            run_retrieve(&cfg, &query, top_k, program, year_min, year_max, recency_weight).await?;
        }
        Commands::Generate {
            query,
            audience,
            section,
            tone,
            writing_style_id,
            max_sources,
            custom_instructions,
            stream,
        } => {
            run_generate(
                &cfg, &query, audience, section, tone, writing_style_id, max_sources,
                custom_instructions, stream,
            )
            .await?;
        }
        Commands::Chat {
            conversation_id,
            message,
            owner_user_id,
        } => {
            run_chat(&cfg, conversation_id, &message, &owner_user_id).await?;
        }
        Commands::Program { action } => run_program(&cfg, action).await?,
        Commands::Style { action } => run_style(&cfg, action).await?,
        Commands::Output { action } => run_output(&cfg, action).await?,
    }

    Ok(())
}

async fn run_ingest(
    cfg: &Config,
    file: PathBuf,
    doc_type: DocType,
    year: i32,
    outcome: Outcome,
    programs: Vec<String>,
    tags: Vec<String>,
    notes: Option<String>,
    sensitive: bool,
    sensitivity_level: String,
    created_by: String,
    doc_id: Option<String>,
) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    let bm25 = bm25::Bm25Service::new();
    let provider = embedding::create_provider(&cfg.embedding)?;

    let file_bytes = std::fs::read(&file)?;
    let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload".to_string());
    let mime_hint = mime_hint_for(&file);

    let sensitivity_level = SensitivityLevel::parse(&sensitivity_level)
        .ok_or_else(|| anyhow::anyhow!("invalid sensitivity level: {}", sensitivity_level))?;

    let metadata = DocumentMetadata {
        doc_type,
        year,
        outcome,
        programs,
        tags,
        notes,
        is_sensitive: sensitive,
        sensitivity_level,
    };

    let input = ingest::IngestInput {
        file_bytes,
        filename,
        mime_hint,
        metadata,
        caller_user_id: created_by,
        doc_id,
    };

    let doc = tokio::time::timeout(
        INGEST_TIMEOUT,
        ingest::ingest(&pool, cfg, provider.as_ref(), &bm25, input),
    )
    .await
    .map_err(|_| anyhow::anyhow!("ingestion timed out after {INGEST_TIMEOUT:?}"))??;
    println!("Ingested document {} ({} chunks).", doc.id, doc.chunks_count);
    pool.close().await;
    Ok(())
}

fn mime_hint_for(path: &PathBuf) -> String {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("").to_lowercase().as_str() {
        "pdf" => extract::MIME_PDF.to_string(),
        "docx" => extract::MIME_DOCX.to_string(),
        _ => extract::MIME_TXT.to_string(),
    }
}

async fn run_delete_document(cfg: &Config, id: &str) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    let bm25 = bm25::Bm25Service::new();
    ingest::delete_document(&pool, &bm25, id).await?;
    println!("Deleted document {id}.");
    pool.close().await;
    Ok(())
}

async fn run_list_documents(
    cfg: &Config,
    doc_type: Option<String>,
    year: Option<i32>,
    outcome: Option<String>,
    program: Option<String>,
    offset: i64,
    limit: i64,
) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    let filter = store::DocumentFilter {
        doc_type: doc_type.and_then(|s| DocType::parse(&s)),
        year,
        outcome: outcome.and_then(|s| Outcome::parse(&s)),
        program,
    };
    let docs = store::list_documents(&pool, &filter, offset, limit).await?;
    for doc in docs {
        println!(
            "{}  {:<30}  {}  {}  {}",
            doc.id,
            doc.filename,
            doc.doc_type.as_str(),
            doc.year,
            doc.outcome.as_str()
        );
    }
    pool.close().await;
    Ok(())
}

fn parse_retrieval_filter(program: Option<String>, year_min: Option<i32>, year_max: Option<i32>) -> RetrievalFilter {
    RetrievalFilter {
        doc_types: None,
        outcomes: None,
        programs: program.map(|p| vec![p]),
        tags: None,
        year_min,
        year_max,
    }
}

async fn run_retrieve(
    cfg: &Config,
    query: &str,
    top_k: i64,
    program: Option<String>,
    year_min: Option<i32>,
    year_max: Option<i32>,
    recency_weight: Option<f64>,
) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    let bm25 = bm25::Bm25Service::new();
    let provider = embedding::create_provider(&cfg.embedding)?;
    let llm_provider = llm::create_provider(&cfg.llm)?;

    let results = tokio::time::timeout(
        RETRIEVE_TIMEOUT,
        search::retrieve(
            &pool,
            cfg,
            provider.as_ref(),
            &bm25,
            llm_provider.as_deref(),
            search::RetrievalParams {
                query,
                top_k,
                filter: parse_retrieval_filter(program, year_min, year_max),
                recency_weight_override: recency_weight,
                current_year: current_year(),
            },
        ),
    )
    .await
    .map_err(|_| anyhow::anyhow!("retrieval timed out after {RETRIEVE_TIMEOUT:?}"))??;

    if results.is_empty() {
        println!("No results.");
    }
    for (i, r) in results.iter().enumerate() {
        println!(
            "{}. [{:.3}] {} ({}) — {}",
            i + 1,
            r.score,
            r.filename,
            r.year,
            r.text.chars().take(160).collect::<String>()
        );
    }
    pool.close().await;
    Ok(())
}

fn current_year() -> i32 {
    chrono::Utc::now().format("%Y").to_string().parse().unwrap_or(2026)
}

#[allow(clippy::too_many_arguments)]
async fn run_generate(
    cfg: &Config,
    query: &str,
    audience: Option<String>,
    section: Option<String>,
    tone: Option<String>,
    writing_style_id: Option<String>,
    max_sources: i64,
    custom_instructions: Option<String>,
    stream: bool,
) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    let bm25 = bm25::Bm25Service::new();
    let embedding_provider = embedding::create_provider(&cfg.embedding)?;
    let llm_provider = llm::create_provider(&cfg.llm)?
        .ok_or_else(|| anyhow::anyhow!("llm.provider is disabled in config"))?;
    let cache = cache::QueryCache::new(cfg.cache.max_entries, cfg.cache.ttl_secs);

    let params = generate::GenerateParams {
        query,
        audience,
        section,
        tone,
        writing_style_id,
        filters: RetrievalFilter::default(),
        max_sources,
        recency_weight: None,
        max_tokens: cfg.llm.max_tokens,
        temperature: cfg.llm.temperature,
        custom_instructions,
        current_year: current_year(),
    };

    if stream {
        let mut events = generate::generate_streaming(
            &pool,
            cfg,
            embedding_provider.as_ref(),
            &bm25,
            llm_provider.as_ref(),
            &cache,
            params,
        )
        .await?;

        while let Some(event) = events.next().await {
            match event {
                generate::GenerationEvent::Sources(sources) => {
                    println!("[{} sources retrieved]", sources.len());
                }
                generate::GenerationEvent::Content(delta) => {
                    print!("{delta}");
                    std::io::stdout().flush().ok();
                }
                generate::GenerationEvent::Done {
                    model,
                    tokens_used,
                    invalid_citations,
                    duration_ms,
                } => {
                    println!(
                        "\n\n[done] model={model} tokens~={tokens_used} invalid_citations={invalid_citations} duration_ms={duration_ms}"
                    );
                }
                generate::GenerationEvent::Error(message) => {
                    eprintln!("\n[error] {message}");
                }
            }
        }
    } else {
        let outcome = tokio::time::timeout(
            GENERATE_TIMEOUT,
            generate::generate(
                &pool,
                cfg,
                embedding_provider.as_ref(),
                &bm25,
                llm_provider.as_ref(),
                &cache,
                params,
            ),
        )
        .await
        .map_err(|_| anyhow::anyhow!("generation timed out after {GENERATE_TIMEOUT:?}"))??;

        println!("{}", outcome.content);
        println!(
            "\n[{} sources, {} invalid citations, model={}]",
            outcome.sources.len(),
            outcome.metadata.invalid_citations,
            outcome.metadata.model
        );
    }

    pool.close().await;
    Ok(())
}

async fn run_chat(
    cfg: &Config,
    conversation_id: Option<String>,
    message: &str,
    owner_user_id: &str,
) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    let bm25 = bm25::Bm25Service::new();
    let embedding_provider = embedding::create_provider(&cfg.embedding)?;
    let llm_provider = llm::create_provider(&cfg.llm)?
        .ok_or_else(|| anyhow::anyhow!("llm.provider is disabled in config"))?;
    let cache = cache::QueryCache::new(cfg.cache.max_entries, cfg.cache.ttl_secs);

    let conversation = match conversation_id {
        Some(id) => store::get_conversation(&pool, &id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("conversation not found: {id}"))?,
        None => store::create_conversation(&pool, owner_user_id, None).await?,
    };

    store::append_message(&pool, &conversation.id, Role::User, message, &[]).await?;

    let params = generate::GenerateParams {
        query: message,
        audience: conversation.context.audience.clone(),
        section: conversation.context.section.clone(),
        tone: None,
        writing_style_id: conversation.context.writing_style_id.clone(),
        filters: RetrievalFilter::default(),
        max_sources: 5,
        recency_weight: None,
        max_tokens: cfg.llm.max_tokens,
        temperature: cfg.llm.temperature,
        custom_instructions: None,
        current_year: current_year(),
    };

    let outcome = tokio::time::timeout(
        GENERATE_TIMEOUT,
        generate::generate(
            &pool,
            cfg,
            embedding_provider.as_ref(),
            &bm25,
            llm_provider.as_ref(),
            &cache,
            params,
        ),
    )
    .await
    .map_err(|_| anyhow::anyhow!("generation timed out after {GENERATE_TIMEOUT:?}"))??;

    let reply = store::append_message(
        &pool,
        &conversation.id,
        Role::Assistant,
        &outcome.content,
        &outcome.sources,
    )
    .await?;

    println!("conversation: {}", conversation.id);
    println!("{}", reply.content);
    pool.close().await;
    Ok(())
}

async fn run_program(cfg: &Config, action: ProgramAction) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    match action {
        ProgramAction::Add {
            name,
            description,
            display_order,
        } => {
            let program = store::create_program(&pool, &name, description.as_deref(), display_order).await?;
            println!("Created program {} ({}).", program.name, program.id);
        }
        ProgramAction::List => {
            for program in store::list_programs(&pool).await? {
                println!("{}  {}", program.id, program.name);
            }
        }
        ProgramAction::Remove { name, force } => {
            store::delete_program(&pool, &name, force).await?;
            println!("Removed program {name}.");
        }
    }
    pool.close().await;
    Ok(())
}

async fn run_output(cfg: &Config, action: OutputAction) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    match action {
        OutputAction::Create {
            output_type,
            title,
            content_file,
            writing_style_id,
        } => {
            let content = std::fs::read_to_string(&content_file)?;
            let output = store::create_output(&pool, &output_type, &title, &content, writing_style_id.as_deref())
                .await?;
            println!("Created output {} ({} words, status={}).", output.id, output.word_count, output.status.as_str());
        }
        OutputAction::Get { id } => {
            let output = store::get_output(&pool, &id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("output not found: {id}"))?;
            println!("{}  {}  {}  {} words", output.id, output.title, output.status.as_str(), output.word_count);
            println!("{}", output.content);
        }
        OutputAction::SetStatus { id, status, skip_reason } => {
            let output =
                store::update_output_status(&pool, &id, status.into(), skip_reason.as_deref()).await?;
            println!("Output {} is now {}.", output.id, output.status.as_str());
        }
        OutputAction::SetContent { id, content_file } => {
            let content = std::fs::read_to_string(&content_file)?;
            let output = store::update_output_content(&pool, &id, &content).await?;
            println!("Output {} updated ({} words).", output.id, output.word_count);
        }
    }
    pool.close().await;
    Ok(())
}

async fn run_style(cfg: &Config, action: StyleAction) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    match action {
        StyleAction::Analyze {
            name,
            style_type,
            samples,
            description,
        } => {
            let llm_provider = llm::create_provider(&cfg.llm)?
                .ok_or_else(|| anyhow::anyhow!("llm.provider is disabled in config"))?;
            let sample_texts: Vec<String> = samples
                .iter()
                .map(std::fs::read_to_string)
                .collect::<std::io::Result<_>>()?;

            let style_type: StyleType = style_type.into();
            let analysis = style::analyze(llm_provider.as_ref(), &cfg.llm, style_type, &sample_texts).await?;

            let style = store::create_writing_style(
                &pool,
                &name,
                style_type,
                description.as_deref(),
                &analysis.prompt_content,
                &sample_texts,
                analysis.analysis_metadata,
            )
            .await?;

            println!(
                "Created writing style {} ({} words, {} ms).",
                style.id, analysis.word_count, analysis.generation_ms
            );
        }
        StyleAction::List => {
            for style in store::list_writing_styles(&pool).await? {
                println!("{}  {}  {}", style.id, style.name, style.style_type.as_str());
            }
        }
        StyleAction::Delete { id } => {
            store::delete_writing_style(&pool, &id).await?;
            println!("Deleted writing style {id}.");
        }
    }
    pool.close().await;
    Ok(())
}
