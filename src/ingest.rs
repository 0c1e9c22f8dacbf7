//! Ingestion pipeline (C7): validate → extract → chunk → embed → store.
//!
//! Steps follow the contract directly: a document is rejected before any
//! extraction work happens if its metadata or size is invalid; the vector
//! store is written before the relational store, and a failure after the
//! vector write triggers a best-effort compensation delete so no partial
//! document is ever visible to callers.

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::bm25::Bm25Service;
use crate::chunk::{self, ChunkStrategy};
use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::error::{ArchivistError, FieldError, Result};
use crate::extract::{self, ExtractError};
use crate::models::{Document, DocumentMetadata};
use crate::store;
use crate::vector_store::{self, ChunkPoint};

pub struct IngestInput {
    pub file_bytes: Vec<u8>,
    pub filename: String,
    pub mime_hint: String,
    pub metadata: DocumentMetadata,
    pub caller_user_id: String,
    /// Re-ingest in place as this existing document, deleting its prior
    /// chunks first. Leave `None` to let content-hash dedup decide.
    pub doc_id: Option<String>,
}

fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn validate_metadata(metadata: &DocumentMetadata, pool_has_programs: &[String]) -> Result<()> {
    let mut errors = Vec::new();

    let current_year = Utc::now().format("%Y").to_string().parse::<i32>().unwrap_or(2100);
    if metadata.year < 1900 || metadata.year > current_year + 1 {
        errors.push(FieldError::new(
            "year",
            format!("year {} is out of range", metadata.year),
        ));
    }

    if metadata.sensitivity_level != crate::models::SensitivityLevel::Low && !metadata.is_sensitive {
        errors.push(FieldError::new(
            "is_sensitive",
            "is_sensitive must be true when sensitivity_level is medium or high",
        ));
    }

    for program in &metadata.programs {
        if !pool_has_programs.contains(program) {
            errors.push(FieldError::new(
                "programs",
                format!("unknown program: {}", program),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ArchivistError::Validation(errors))
    }
}

fn map_extract_error(e: ExtractError) -> ArchivistError {
    match e {
        ExtractError::UnsupportedContentType(ct) => ArchivistError::UnsupportedFormat(ct),
        ExtractError::Pdf(msg) | ExtractError::Ooxml(msg) => ArchivistError::CorruptDocument(msg),
    }
}

/// Runs the full ingestion pipeline for one document. If the file's content
/// hash matches an already-ingested document, or the caller names an
/// existing `doc_id` explicitly, the prior document's chunks are deleted
/// from both stores first and the new document reuses its id — delete-then-
/// insert, per §4.7.
pub async fn ingest(
    pool: &SqlitePool,
    config: &Config,
    embedding_provider: &dyn EmbeddingProvider,
    bm25: &Bm25Service,
    input: IngestInput,
) -> Result<Document> {
    let known_programs: Vec<String> = store::list_programs(pool)
        .await?
        .into_iter()
        .map(|p| p.name)
        .collect();
    validate_metadata(&input.metadata, &known_programs)?;

    let size = input.file_bytes.len() as u64;
    if size > config.ingestion.max_file_size_bytes {
        return Err(ArchivistError::PayloadTooLarge(
            size,
            config.ingestion.max_file_size_bytes,
        ));
    }

    let text = extract::extract_text(&input.file_bytes, &input.mime_hint).map_err(map_extract_error)?;

    let strategy = ChunkStrategy::parse(&config.chunking.strategy).unwrap_or(ChunkStrategy::Semantic);
    let chunked = chunk::chunk_text(
        &text,
        config.chunking.target_tokens,
        config.chunking.overlap_tokens,
        strategy,
    );
    if chunked.is_empty() {
        return Err(ArchivistError::EmptyDocument);
    }

    let hash = content_hash(&input.file_bytes);
    let existing = match &input.doc_id {
        Some(id) => store::get_document(pool, id).await?,
        None => store::find_document_by_hash(pool, &hash).await?,
    };

    let doc_id = if let Some(existing) = existing {
        vector_store::delete_by_document(pool, &existing.id).await?;
        store::delete_document(pool, &existing.id).await?;
        existing.id
    } else {
        input.doc_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string())
    };

    let texts: Vec<String> = chunked.iter().map(|c| c.text.clone()).collect();
    let vectors = crate::embedding::embed_texts(embedding_provider, &config.embedding, &texts).await?;

    let points: Vec<ChunkPoint> = chunked
        .iter()
        .zip(vectors.iter())
        .map(|(c, embedding)| ChunkPoint {
            chunk_id: chunk::chunk_id(&doc_id, c.chunk_index),
            document_id: doc_id.clone(),
            chunk_index: c.chunk_index,
            text: c.text.clone(),
            filename: input.filename.clone(),
            doc_type: input.metadata.doc_type,
            year: input.metadata.year,
            outcome: input.metadata.outcome,
            programs: input.metadata.programs.clone(),
            tags: input.metadata.tags.clone(),
            embedding: embedding.clone(),
        })
        .collect();

    vector_store::upsert(pool, &points).await?;

    let document = Document {
        id: doc_id.clone(),
        filename: input.filename.clone(),
        doc_type: input.metadata.doc_type,
        year: input.metadata.year,
        outcome: input.metadata.outcome,
        file_size_bytes: size,
        chunks_count: chunked.len() as i64,
        upload_timestamp: Utc::now(),
        created_by: input.caller_user_id.clone(),
        is_sensitive: input.metadata.is_sensitive,
        sensitivity_level: input.metadata.sensitivity_level,
        notes: input.metadata.notes.clone(),
        programs: input.metadata.programs.clone(),
        tags: input.metadata.tags.clone(),
        content_hash: hash,
    };

    let chunk_rows: Vec<(String, i64, String)> = chunked
        .iter()
        .map(|c| (chunk::chunk_id(&doc_id, c.chunk_index), c.chunk_index, c.text.clone()))
        .collect();

    if let Err(e) = store::insert_document_with_chunks(pool, &document, &chunk_rows).await {
        // Compensation delete: the vector store commit already succeeded,
        // so undo it before surfacing the failure (§4.7).
        let _ = vector_store::delete_by_document(pool, &doc_id).await;
        return Err(e);
    }

    bm25.mark_dirty();

    Ok(document)
}

/// Deletes a document from both stores and invalidates the BM25 index.
/// `NotFound` if the document does not exist.
pub async fn delete_document(pool: &SqlitePool, bm25: &Bm25Service, doc_id: &str) -> Result<()> {
    vector_store::delete_by_document(pool, doc_id).await?;
    let existed = store::delete_document(pool, doc_id).await?;
    if !existed {
        return Err(ArchivistError::NotFound(format!("document {}", doc_id)));
    }
    bm25.mark_dirty();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkingConfig, Config, DbConfig, EmbeddingConfig};
    use crate::db;
    use crate::embedding::DisabledProvider;
    use crate::models::{Outcome, SensitivityLevel};
    use std::path::PathBuf;

    async fn test_setup() -> (SqlitePool, Config) {
        let config = Config {
            db: DbConfig {
                path: PathBuf::from(":memory:"),
            },
            chunking: ChunkingConfig {
                target_tokens: 50,
                overlap_tokens: 5,
                strategy: "SENTENCE".to_string(),
            },
            retrieval: Default::default(),
            embedding: EmbeddingConfig {
                provider: "disabled".to_string(),
                ..Default::default()
            },
            llm: Default::default(),
            cache: Default::default(),
            ingestion: Default::default(),
            server: Default::default(),
        };
        let pool = db::connect(&config).await.unwrap();
        crate::migrate::run_migrations_on_pool(&pool).await.unwrap();
        (pool, config)
    }

    fn sample_input(programs: Vec<String>) -> IngestInput {
        IngestInput {
            file_bytes: "Our literacy program reached five hundred students this year. It was funded by a generous grant. Outcomes were strong across every measured category.".as_bytes().to_vec(),
            filename: "report.txt".to_string(),
            mime_hint: extract::MIME_TXT.to_string(),
            metadata: DocumentMetadata {
                doc_type: crate::models::DocType::GrantReport,
                year: 2024,
                outcome: Outcome::Awarded,
                programs,
                tags: vec![],
                notes: None,
                is_sensitive: false,
                sensitivity_level: SensitivityLevel::Low,
            },
            caller_user_id: "tester".to_string(),
            doc_id: None,
        }
    }

    #[tokio::test]
    async fn ingest_rejects_unknown_program_before_extraction() {
        let (pool, config) = test_setup().await;
        let bm25 = Bm25Service::new();
        let provider = DisabledProvider;
        let result = ingest(
            &pool,
            &config,
            &provider,
            &bm25,
            sample_input(vec!["Nonexistent".to_string()]),
        )
        .await;
        assert!(matches!(result, Err(ArchivistError::Validation(_))));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn ingest_rejects_oversized_payload() {
        let (pool, mut config) = test_setup().await;
        config.ingestion.max_file_size_bytes = 10;
        let bm25 = Bm25Service::new();
        let provider = DisabledProvider;
        let result = ingest(&pool, &config, &provider, &bm25, sample_input(vec![])).await;
        assert!(matches!(result, Err(ArchivistError::PayloadTooLarge(_, _))));
    }

    #[tokio::test]
    async fn reingesting_the_same_bytes_deletes_the_prior_chunks_first() {
        let (pool, mut config) = test_setup().await;
        config.embedding.provider = "mock".to_string();
        config.embedding.dims = Some(8);
        let bm25 = Bm25Service::new();
        let provider = crate::embedding::MockEmbeddingProvider { dims: 8 };

        let first = ingest(&pool, &config, &provider, &bm25, sample_input(vec![])).await.unwrap();
        let first_chunks = crate::vector_store::count(&pool).await.unwrap();
        assert!(first_chunks > 0);

        let second = ingest(&pool, &config, &provider, &bm25, sample_input(vec![])).await.unwrap();
        assert_eq!(second.id, first.id, "re-ingesting identical bytes should reuse the doc id");

        let doc_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(doc_count, 1, "delete-then-insert must not leave a duplicate document row");

        let chunk_count = crate::vector_store::count(&pool).await.unwrap();
        assert_eq!(chunk_count, first_chunks, "stale chunks from the prior ingest must not survive");
    }

    #[tokio::test]
    async fn ingest_with_disabled_embedding_provider_fails_embedding_unavailable() {
        let (pool, config) = test_setup().await;
        let bm25 = Bm25Service::new();
        let provider = DisabledProvider;
        let result = ingest(&pool, &config, &provider, &bm25, sample_input(vec![])).await;
        assert!(matches!(result, Err(ArchivistError::EmbeddingUnavailable { .. })));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
        let vcount = crate::vector_store::count(&pool).await.unwrap();
        assert_eq!(vcount, 0);
    }

    #[tokio::test]
    async fn ingest_succeeds_and_marks_bm25_dirty() {
        let (pool, mut config) = test_setup().await;
        config.embedding.provider = "mock".to_string();
        config.embedding.dims = Some(8);
        store::create_program(&pool, "Literacy", None, 0).await.unwrap();

        let bm25 = Bm25Service::new();
        let generation_before = bm25.generation();
        let provider = DisabledProvider; // inert: embed_texts dispatches on config, not this handle

        let doc = ingest(
            &pool,
            &config,
            &provider,
            &bm25,
            sample_input(vec!["Literacy".to_string()]),
        )
        .await
        .unwrap();

        assert!(doc.chunks_count >= 1);
        assert_eq!(
            store::get_document(&pool, &doc.id).await.unwrap().unwrap().filename,
            "report.txt"
        );
        let vcount = crate::vector_store::count(&pool).await.unwrap();
        assert_eq!(vcount, doc.chunks_count);
        assert!(bm25.generation() > generation_before);
    }

    #[tokio::test]
    async fn compensation_delete_removes_vectors_left_by_a_failed_relational_write() {
        // Simulates step 7 (vector upsert) succeeding and step 8 (relational
        // insert) failing, exactly as `ingest` would encounter in a program
        // deleted mid-flight: the vector rows must not survive the error.
        let (pool, mut config) = test_setup().await;
        config.embedding.provider = "mock".to_string();
        config.embedding.dims = Some(8);

        let doc_id = "orphaned-doc".to_string();
        let provider = DisabledProvider;
        let _ = &provider;
        let vectors = crate::embedding::embed_texts(
            &DisabledProvider,
            &{
                let mut e = config.embedding.clone();
                e.provider = "mock".to_string();
                e
            },
            &["sample chunk text".to_string()],
        )
        .await
        .unwrap();

        let point = ChunkPoint {
            chunk_id: chunk::chunk_id(&doc_id, 0),
            document_id: doc_id.clone(),
            chunk_index: 0,
            text: "sample chunk text".to_string(),
            filename: "f.txt".to_string(),
            doc_type: crate::models::DocType::Other,
            year: 2024,
            outcome: Outcome::Pending,
            programs: vec!["Nonexistent".to_string()],
            tags: vec![],
            embedding: vectors[0].clone(),
        };
        vector_store::upsert(&pool, &[point]).await.unwrap();
        assert_eq!(crate::vector_store::count(&pool).await.unwrap(), 1);

        let doc = Document {
            id: doc_id.clone(),
            filename: "f.txt".to_string(),
            doc_type: crate::models::DocType::Other,
            year: 2024,
            outcome: Outcome::Pending,
            file_size_bytes: 10,
            chunks_count: 1,
            upload_timestamp: Utc::now(),
            created_by: "tester".to_string(),
            is_sensitive: false,
            sensitivity_level: SensitivityLevel::Low,
            notes: None,
            programs: vec!["Nonexistent".to_string()],
            tags: vec![],
            content_hash: "deadbeef".to_string(),
        };
        let result = store::insert_document_with_chunks(&pool, &doc, &[]).await;
        assert!(result.is_err());

        vector_store::delete_by_document(&pool, &doc_id).await.unwrap();
        assert_eq!(crate::vector_store::count(&pool).await.unwrap(), 0);
    }
}
