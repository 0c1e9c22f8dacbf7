//! # Org Archivist
//!
//! **A retrieval-augmented generation backend for nonprofit grant writing.**
//!
//! Org Archivist ingests grant proposals, reports, and case studies; chunks
//! and embeds them; retrieves them with a hybrid dense/lexical search; and
//! generates funder-ready prose grounded in cited excerpts from the
//! organization's own archive.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌───────────┐
//! │  Ingest  │──▶│ Chunk+Embed  │──▶│  SQLite   │
//! │ (upload) │   │              │   │ Vec+Rel   │
//! └──────────┘   └──────────────┘   └─────┬─────┘
//!                                         │
//!                      ┌──────────────────┴───────────────┐
//!                      ▼                                  ▼
//!               ┌─────────────┐                    ┌──────────────┐
//!               │  Retrieve   │──────────────────▶│   Generate   │
//!               │ (hybrid C9) │                    │  (C11, C4)   │
//!               └─────────────┘                    └──────────────┘
//!                      ▲
//!                      │
//!                 ┌──────────┐
//!                 │   CLI    │
//!                 │(archivist)│
//!                 └──────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. **Ingestion** ([`ingest`]) extracts text, chunks it, embeds the chunks,
//!    and writes them to the vector store before the relational store, with
//!    a compensation delete on partial failure.
//! 2. Chunks are indexed in an **in-memory BM25 index** ([`bm25`]) for
//!    lexical search and embedded via the **embedding provider**
//!    ([`embedding`]) for dense search.
//! 3. The **retrieval engine** ([`search`]) fuses dense and lexical scores,
//!    applies recency weighting and per-document diversification, and
//!    optionally reranks with the LLM.
//! 4. A **query cache** ([`cache`]) sits in front of retrieval, invalidated
//!    wholesale on any ingestion or deletion.
//! 5. The **generation orchestrator** ([`generate`]) assembles a prompt
//!    around retrieved chunks, invokes the LLM ([`llm`]) in streaming or
//!    non-streaming mode, and validates citation markers in the response.
//! 6. The **style analyzer** ([`style`]) characterizes an organization's
//!    writing voice from sample documents so generation can match it.
//! 7. All operations are exposed through the **CLI** (`archivist`).
//!
//! ## Quick Start
//!
//! ```bash
//! archivist init
//! archivist program add "Youth Mentoring"
//! archivist ingest report.pdf --doc-type grant-report --year 2025 --outcome awarded
//! archivist retrieve "program outcomes for youth mentoring"
//! archivist generate "Summarize our 2025 impact" --audience "Foundation Grant"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types: documents, chunks, conversations, outputs, styles |
//! | [`extract`] | PDF/DOCX/TXT text extraction |
//! | [`chunk`] | Sentence/semantic/token-window chunker |
//! | [`embedding`] | Embedding provider trait and implementations |
//! | [`llm`] | LLM adapter trait and implementations |
//! | [`vector_store`] | Chunk embedding store with filter pushdown (C1) |
//! | [`store`] | Relational store: documents, programs, conversations, outputs (C2) |
//! | [`bm25`] | In-memory lexical index (C8) |
//! | [`ingest`] | Ingestion pipeline (C7) |
//! | [`search`] | Hybrid retrieval engine (C9) |
//! | [`cache`] | Query cache (C10) |
//! | [`generate`] | Generation orchestrator (C11) |
//! | [`style`] | Style analyzer (C12) |
//! | [`db`] | SQLite connection pool with WAL mode |
//! | [`migrate`] | Database schema migrations (idempotent) |
//!
//! ## Configuration
//!
//! Org Archivist is configured via a TOML file (default:
//! `config/archivist.toml`). See [`config`] for all available options and
//! [`config::load_config`] for validation rules.

pub mod bm25;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod generate;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod search;
pub mod store;
pub mod style;
pub mod vector_store;
