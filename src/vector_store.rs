//! Vector store adapter (C1), backed by `chunk_vectors` in the same SQLite
//! database as the relational store. Metadata is denormalized onto each row
//! so filters push down into SQL instead of discarding candidates client-side
//! after `top_k` has already been applied.

use sqlx::sqlite::SqlitePool;
use sqlx::QueryBuilder;
use tracing::debug;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{ArchivistError, Result};
use crate::models::{DocType, Outcome};

#[derive(Debug, Clone)]
pub struct ChunkPoint {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub filename: String,
    pub doc_type: DocType,
    pub year: i32,
    pub outcome: Outcome,
    pub programs: Vec<String>,
    pub tags: Vec<String>,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub filename: String,
    pub doc_type: DocType,
    pub year: i32,
    pub outcome: Outcome,
    pub programs: Vec<String>,
    pub tags: Vec<String>,
    pub vector_score: f32,
}

#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub doc_types: Option<Vec<DocType>>,
    pub outcomes: Option<Vec<Outcome>>,
    pub programs: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub year_min: Option<i32>,
    pub year_max: Option<i32>,
    pub exclude_document_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VectorStoreInfo {
    pub count: i64,
    pub dims: usize,
}

/// Atomically upserts a batch of chunk vectors within a single transaction.
pub async fn upsert(pool: &SqlitePool, points: &[ChunkPoint]) -> Result<()> {
    let started = std::time::Instant::now();
    let mut tx = pool.begin().await?;
    for p in points {
        let programs_json = serde_json::to_string(&p.programs).unwrap_or_else(|_| "[]".into());
        let tags_json = serde_json::to_string(&p.tags).unwrap_or_else(|_| "[]".into());
        let blob = vec_to_blob(&p.embedding);

        sqlx::query(
            r#"
            INSERT INTO chunk_vectors
                (chunk_id, document_id, chunk_index, text, filename, doc_type, year, outcome, programs_json, tags_json, embedding)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                document_id = excluded.document_id,
                chunk_index = excluded.chunk_index,
                text = excluded.text,
                filename = excluded.filename,
                doc_type = excluded.doc_type,
                year = excluded.year,
                outcome = excluded.outcome,
                programs_json = excluded.programs_json,
                tags_json = excluded.tags_json,
                embedding = excluded.embedding
            "#,
        )
        .bind(&p.chunk_id)
        .bind(&p.document_id)
        .bind(p.chunk_index)
        .bind(&p.text)
        .bind(&p.filename)
        .bind(p.doc_type.as_str())
        .bind(p.year)
        .bind(p.outcome.as_str())
        .bind(programs_json)
        .bind(tags_json)
        .bind(blob)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    debug!(
        chunk_count = points.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "vector store upsert committed"
    );
    Ok(())
}

/// Brute-force cosine scan over rows matching `filter`, pushed down into SQL
/// before the scan so candidates beyond `top_k` are never silently dropped.
pub async fn search(
    pool: &SqlitePool,
    query_vector: &[f32],
    top_k: i64,
    filter: &VectorFilter,
) -> Result<Vec<SearchHit>> {
    let started = std::time::Instant::now();
    let mut qb = QueryBuilder::new(
        "SELECT chunk_id, document_id, chunk_index, text, filename, doc_type, year, outcome, programs_json, tags_json, embedding FROM chunk_vectors WHERE 1=1",
    );

    if let Some(doc_types) = &filter.doc_types {
        if !doc_types.is_empty() {
            qb.push(" AND doc_type IN (");
            let mut sep = qb.separated(", ");
            for dt in doc_types {
                sep.push_bind(dt.as_str());
            }
            qb.push(")");
        }
    }
    if let Some(outcomes) = &filter.outcomes {
        if !outcomes.is_empty() {
            qb.push(" AND outcome IN (");
            let mut sep = qb.separated(", ");
            for o in outcomes {
                sep.push_bind(o.as_str());
            }
            qb.push(")");
        }
    }
    if let Some(year_min) = filter.year_min {
        qb.push(" AND year >= ").push_bind(year_min);
    }
    if let Some(year_max) = filter.year_max {
        qb.push(" AND year <= ").push_bind(year_max);
    }
    if let Some(exclude) = &filter.exclude_document_id {
        qb.push(" AND document_id != ").push_bind(exclude.clone());
    }
    if let Some(programs) = &filter.programs {
        if !programs.is_empty() {
            qb.push(" AND (");
            let mut sep = qb.separated(" OR ");
            for program in programs {
                sep.push("programs_json LIKE ");
                sep.push_bind_unseparated(format!("%\"{}\"%", program));
            }
            qb.push(")");
        }
    }
    if let Some(tags) = &filter.tags {
        if !tags.is_empty() {
            qb.push(" AND (");
            let mut sep = qb.separated(" OR ");
            for tag in tags {
                sep.push("tags_json LIKE ");
                sep.push_bind_unseparated(format!("%\"{}\"%", tag));
            }
            qb.push(")");
        }
    }

    let rows = qb
        .build()
        .fetch_all(pool)
        .await
        .map_err(|e| ArchivistError::RetrievalUnavailable(e.into()))?;

    let mut hits: Vec<SearchHit> = Vec::with_capacity(rows.len());
    for row in rows {
        use sqlx::Row;
        let embedding_blob: Vec<u8> = row.try_get("embedding")?;
        let embedding = blob_to_vec(&embedding_blob);
        let score = cosine_similarity(query_vector, &embedding);
        let doc_type_str: String = row.try_get("doc_type")?;
        let outcome_str: String = row.try_get("outcome")?;
        let programs_json: String = row.try_get("programs_json")?;
        let tags_json: String = row.try_get("tags_json")?;

        hits.push(SearchHit {
            chunk_id: row.try_get("chunk_id")?,
            document_id: row.try_get("document_id")?,
            chunk_index: row.try_get("chunk_index")?,
            text: row.try_get("text")?,
            filename: row.try_get("filename")?,
            doc_type: DocType::parse(&doc_type_str).unwrap_or(DocType::Other),
            year: row.try_get("year")?,
            outcome: Outcome::parse(&outcome_str).unwrap_or(Outcome::NotApplicable),
            programs: serde_json::from_str(&programs_json).unwrap_or_default(),
            tags: serde_json::from_str(&tags_json).unwrap_or_default(),
            vector_score: score,
        });
    }

    hits.sort_by(|a, b| b.vector_score.total_cmp(&a.vector_score));
    hits.truncate(top_k.max(0) as usize);
    debug!(
        candidates = hits.len(),
        top_k,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "vector store search completed"
    );
    Ok(hits)
}

/// Deletes every point belonging to a document. Used for document deletion
/// and for the compensation delete of a failed two-phase ingest.
pub async fn delete_by_document(pool: &SqlitePool, document_id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
        .bind(document_id)
        .execute(pool)
        .await?;
    let deleted = result.rows_affected();
    debug!(document_id, deleted, "vector store delete by document completed");
    Ok(deleted)
}

pub async fn count(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn info(pool: &SqlitePool) -> Result<VectorStoreInfo> {
    let count = count(pool).await?;
    let dims: Option<Vec<u8>> = sqlx::query_scalar("SELECT embedding FROM chunk_vectors LIMIT 1")
        .fetch_optional(pool)
        .await?;
    let dims = dims.map(|b| b.len() / 4).unwrap_or(0);
    Ok(VectorStoreInfo { count, dims })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::config::Config;
    use std::path::PathBuf;

    async fn test_pool() -> SqlitePool {
        let config = Config {
            db: crate::config::DbConfig {
                path: PathBuf::from(":memory:"),
            },
            chunking: Default::default(),
            retrieval: Default::default(),
            embedding: Default::default(),
            llm: Default::default(),
            cache: Default::default(),
            ingestion: Default::default(),
            server: Default::default(),
        };
        let pool = db::connect(&config).await.unwrap();
        crate::migrate::run_migrations_on_pool(&pool).await.unwrap();
        pool
    }

    fn sample_point(chunk_id: &str, document_id: &str, year: i32, embedding: Vec<f32>) -> ChunkPoint {
        ChunkPoint {
            chunk_id: chunk_id.to_string(),
            document_id: document_id.to_string(),
            chunk_index: 0,
            text: "sample text".to_string(),
            filename: "file.pdf".to_string(),
            doc_type: DocType::GrantProposal,
            year,
            outcome: Outcome::Awarded,
            programs: vec!["youth".to_string()],
            tags: vec![],
            embedding,
        }
    }

    #[tokio::test]
    async fn upsert_and_search_roundtrip() {
        let pool = test_pool().await;
        upsert(
            &pool,
            &[sample_point("c1", "d1", 2022, vec![1.0, 0.0, 0.0])],
        )
        .await
        .unwrap();

        let hits = search(&pool, &[1.0, 0.0, 0.0], 10, &VectorFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "c1");
        assert!((hits[0].vector_score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn search_filters_by_year_range() {
        let pool = test_pool().await;
        upsert(
            &pool,
            &[
                sample_point("old", "d1", 2010, vec![1.0, 0.0]),
                sample_point("new", "d2", 2024, vec![1.0, 0.0]),
            ],
        )
        .await
        .unwrap();

        let filter = VectorFilter {
            year_min: Some(2020),
            ..Default::default()
        };
        let hits = search(&pool, &[1.0, 0.0], 10, &filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "new");
    }

    #[tokio::test]
    async fn delete_by_document_removes_all_its_chunks() {
        let pool = test_pool().await;
        upsert(
            &pool,
            &[
                sample_point("c1", "d1", 2022, vec![1.0]),
                sample_point("c2", "d1", 2022, vec![0.5]),
                sample_point("c3", "d2", 2022, vec![0.2]),
            ],
        )
        .await
        .unwrap();

        let deleted = delete_by_document(&pool, "d1").await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(count(&pool).await.unwrap(), 1);
    }
}
