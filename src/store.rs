//! Relational store adapter (C2): typed CRUD over every entity in the schema
//! plus the two cross-cutting queries the retrieval/BM25 path needs
//! (`list_documents` with program-join filtering, `get_all_chunks_text_by_id`).
//! Every mutating operation runs in its own transaction; there are no
//! long-held locks across suspension points.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::debug;

use crate::error::{ArchivistError, FieldError, Result};
use crate::models::{
    Conversation, ConversationContext, DocType, Document, Message, Outcome, Output, OutputStatus,
    Program, Role, SensitivityLevel, SourceRef, StyleType, WritingStyle,
};

fn ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn from_ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

// ---------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    pub doc_type: Option<DocType>,
    pub year: Option<i32>,
    pub outcome: Option<Outcome>,
    pub program: Option<String>,
}

/// Inserts a document, its program links, and its tag links in a single
/// transaction. Fails with `ValidationError` if any named program does not
/// exist in the `programs` table — no rows are written in that case.
pub async fn insert_document(pool: &SqlitePool, doc: &Document) -> Result<()> {
    let mut tx = pool.begin().await?;

    for program in &doc.programs {
        let exists: Option<String> = sqlx::query_scalar("SELECT name FROM programs WHERE name = ?")
            .bind(program)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(ArchivistError::Validation(vec![FieldError::new(
                "programs",
                format!("unknown program: {}", program),
            )]));
        }
    }

    sqlx::query(
        r#"
        INSERT INTO documents
            (id, filename, doc_type, year, outcome, file_size_bytes, chunks_count,
             upload_timestamp, created_by, is_sensitive, sensitivity_level, notes, content_hash)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&doc.id)
    .bind(&doc.filename)
    .bind(doc.doc_type.as_str())
    .bind(doc.year)
    .bind(doc.outcome.as_str())
    .bind(doc.file_size_bytes as i64)
    .bind(doc.chunks_count)
    .bind(ts(doc.upload_timestamp))
    .bind(&doc.created_by)
    .bind(doc.is_sensitive as i64)
    .bind(doc.sensitivity_level.as_str())
    .bind(&doc.notes)
    .bind(&doc.content_hash)
    .execute(&mut *tx)
    .await?;

    for program in &doc.programs {
        sqlx::query("INSERT INTO document_programs (document_id, program_name) VALUES (?, ?)")
            .bind(&doc.id)
            .bind(program)
            .execute(&mut *tx)
            .await?;
    }
    for tag in &doc.tags {
        sqlx::query("INSERT INTO document_tags (document_id, tag) VALUES (?, ?)")
            .bind(&doc.id)
            .bind(tag)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    debug!(document_id = %doc.id, "relational store transaction committed: document + program/tag links");
    Ok(())
}

/// Inserts a document's chunk rows (text only — vectors live in C1) within
/// the caller's transaction, so this composes with `insert_document`.
pub async fn insert_chunks_tx(
    tx: &mut Transaction<'_, Sqlite>,
    document_id: &str,
    chunks: &[(String, i64, String)],
) -> Result<()> {
    for (chunk_id, chunk_index, text) in chunks {
        sqlx::query(
            "INSERT INTO chunks (id, document_id, chunk_index, text) VALUES (?, ?, ?, ?)",
        )
        .bind(chunk_id)
        .bind(document_id)
        .bind(chunk_index)
        .bind(text)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Inserts the document row, its program/tag links, and its chunk rows in a
/// single transaction — the C2 half of ingestion step 8 (§4.7). Fails with
/// `ValidationError` (no rows written) if a named program does not exist.
pub async fn insert_document_with_chunks(
    pool: &SqlitePool,
    doc: &Document,
    chunks: &[(String, i64, String)],
) -> Result<()> {
    let mut tx = pool.begin().await?;

    for program in &doc.programs {
        let exists: Option<String> = sqlx::query_scalar("SELECT name FROM programs WHERE name = ?")
            .bind(program)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(ArchivistError::Validation(vec![FieldError::new(
                "programs",
                format!("unknown program: {}", program),
            )]));
        }
    }

    sqlx::query(
        r#"
        INSERT INTO documents
            (id, filename, doc_type, year, outcome, file_size_bytes, chunks_count,
             upload_timestamp, created_by, is_sensitive, sensitivity_level, notes, content_hash)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&doc.id)
    .bind(&doc.filename)
    .bind(doc.doc_type.as_str())
    .bind(doc.year)
    .bind(doc.outcome.as_str())
    .bind(doc.file_size_bytes as i64)
    .bind(doc.chunks_count)
    .bind(ts(doc.upload_timestamp))
    .bind(&doc.created_by)
    .bind(doc.is_sensitive as i64)
    .bind(doc.sensitivity_level.as_str())
    .bind(&doc.notes)
    .bind(&doc.content_hash)
    .execute(&mut *tx)
    .await?;

    for program in &doc.programs {
        sqlx::query("INSERT INTO document_programs (document_id, program_name) VALUES (?, ?)")
            .bind(&doc.id)
            .bind(program)
            .execute(&mut *tx)
            .await?;
    }
    for tag in &doc.tags {
        sqlx::query("INSERT INTO document_tags (document_id, tag) VALUES (?, ?)")
            .bind(&doc.id)
            .bind(tag)
            .execute(&mut *tx)
            .await?;
    }

    insert_chunks_tx(&mut tx, &doc.id, chunks).await?;

    tx.commit().await?;
    debug!(
        document_id = %doc.id,
        chunk_count = chunks.len(),
        "relational store transaction committed: document + links + chunks"
    );
    Ok(())
}

pub async fn get_document(pool: &SqlitePool, id: &str) -> Result<Option<Document>> {
    let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else { return Ok(None) };
    Ok(Some(document_from_row(pool, &row).await?))
}

async fn document_from_row(pool: &SqlitePool, row: &sqlx::sqlite::SqliteRow) -> Result<Document> {
    let id: String = row.try_get("id")?;
    let programs: Vec<String> = sqlx::query_scalar(
        "SELECT program_name FROM document_programs WHERE document_id = ? ORDER BY program_name",
    )
    .bind(&id)
    .fetch_all(pool)
    .await?;
    let tags: Vec<String> =
        sqlx::query_scalar("SELECT tag FROM document_tags WHERE document_id = ? ORDER BY tag")
            .bind(&id)
            .fetch_all(pool)
            .await?;

    let doc_type_str: String = row.try_get("doc_type")?;
    let outcome_str: String = row.try_get("outcome")?;
    let sensitivity_str: String = row.try_get("sensitivity_level")?;
    let is_sensitive: i64 = row.try_get("is_sensitive")?;

    Ok(Document {
        id,
        filename: row.try_get("filename")?,
        doc_type: DocType::parse(&doc_type_str).unwrap_or(DocType::Other),
        year: row.try_get("year")?,
        outcome: Outcome::parse(&outcome_str).unwrap_or(Outcome::NotApplicable),
        file_size_bytes: row.try_get::<i64, _>("file_size_bytes")? as u64,
        chunks_count: row.try_get("chunks_count")?,
        upload_timestamp: from_ts(row.try_get("upload_timestamp")?),
        created_by: row.try_get("created_by")?,
        is_sensitive: is_sensitive != 0,
        sensitivity_level: SensitivityLevel::parse(&sensitivity_str).unwrap_or(SensitivityLevel::Low),
        notes: row.try_get("notes")?,
        programs,
        tags,
        content_hash: row.try_get("content_hash")?,
    })
}

/// Looks up a document by its content hash, for ingestion dedup (§4.7).
pub async fn find_document_by_hash(pool: &SqlitePool, content_hash: &str) -> Result<Option<Document>> {
    let row = sqlx::query("SELECT * FROM documents WHERE content_hash = ?")
        .bind(content_hash)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else { return Ok(None) };
    Ok(Some(document_from_row(pool, &row).await?))
}

pub async fn list_documents(
    pool: &SqlitePool,
    filter: &DocumentFilter,
    offset: i64,
    limit: i64,
) -> Result<Vec<Document>> {
    let mut sql = String::from(
        "SELECT DISTINCT d.* FROM documents d LEFT JOIN document_programs dp ON dp.document_id = d.id WHERE 1=1",
    );
    if filter.doc_type.is_some() {
        sql.push_str(" AND d.doc_type = ?");
    }
    if filter.year.is_some() {
        sql.push_str(" AND d.year = ?");
    }
    if filter.outcome.is_some() {
        sql.push_str(" AND d.outcome = ?");
    }
    if filter.program.is_some() {
        sql.push_str(" AND dp.program_name = ?");
    }
    sql.push_str(" ORDER BY d.upload_timestamp DESC LIMIT ? OFFSET ?");

    let mut query = sqlx::query(&sql);
    if let Some(dt) = filter.doc_type {
        query = query.bind(dt.as_str());
    }
    if let Some(year) = filter.year {
        query = query.bind(year);
    }
    if let Some(outcome) = filter.outcome {
        query = query.bind(outcome.as_str());
    }
    if let Some(program) = &filter.program {
        query = query.bind(program.clone());
    }
    query = query.bind(limit).bind(offset);

    let rows = query.fetch_all(pool).await?;
    let mut docs = Vec::with_capacity(rows.len());
    for row in &rows {
        docs.push(document_from_row(pool, row).await?);
    }
    Ok(docs)
}

/// Deletes a document's relational rows (junctions, chunks, document).
/// Vector-store cleanup is the caller's responsibility (`vector_store::delete_by_document`).
pub async fn delete_document(pool: &SqlitePool, id: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let existed: Option<String> = sqlx::query_scalar("SELECT id FROM documents WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
    if existed.is_none() {
        return Ok(false);
    }

    sqlx::query("DELETE FROM document_programs WHERE document_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM document_tags WHERE document_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    debug!(document_id = id, "relational store transaction committed: document deleted");
    Ok(true)
}

#[derive(Debug, Clone)]
pub struct ChunkRecord {
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
}

/// Every chunk's text and denormalized metadata, for BM25 rebuild (C8) and
/// for client-side filtering of lexical candidates in the retrieval engine
/// (C9 stage 3), which the BM25 index itself cannot push filters into.
pub async fn get_all_chunks_text_by_id(pool: &SqlitePool) -> Result<Vec<ChunkRecord>> {
    let rows = sqlx::query(
        "SELECT chunk_id, document_id, chunk_index, text, filename, doc_type, year, outcome, programs_json, tags_json FROM chunk_vectors",
    )
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let doc_type_str: String = row.try_get("doc_type")?;
        let outcome_str: String = row.try_get("outcome")?;
        let programs_json: String = row.try_get("programs_json")?;
        let tags_json: String = row.try_get("tags_json")?;
        out.push(ChunkRecord {
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
        });
    }
    Ok(out)
}

// ---------------------------------------------------------------------
// Programs
// ---------------------------------------------------------------------

pub async fn create_program(
    pool: &SqlitePool,
    name: &str,
    description: Option<&str>,
    display_order: i32,
) -> Result<Program> {
    let existing: Option<String> = sqlx::query_scalar("SELECT name FROM programs WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    if existing.is_some() {
        return Err(ArchivistError::Conflict(format!(
            "program already exists: {}",
            name
        )));
    }

    let id = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO programs (id, name, description, display_order, active) VALUES (?, ?, ?, ?, 1)",
    )
    .bind(&id)
    .bind(name)
    .bind(description)
    .bind(display_order)
    .execute(pool)
    .await?;

    Ok(Program {
        id,
        name: name.to_string(),
        description: description.map(str::to_string),
        display_order,
        active: true,
    })
}

pub async fn list_programs(pool: &SqlitePool) -> Result<Vec<Program>> {
    let rows = sqlx::query("SELECT * FROM programs ORDER BY display_order, name")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| Program {
            id: row.get("id"),
            name: row.get("name"),
            description: row.get("description"),
            display_order: row.get("display_order"),
            active: row.get::<i64, _>("active") != 0,
        })
        .collect())
}

/// Deletes a program. Refuses with `Conflict` if any document still
/// references it unless `force` is set (§8 property 10).
pub async fn delete_program(pool: &SqlitePool, name: &str, force: bool) -> Result<()> {
    let mut tx = pool.begin().await?;
    let in_use: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM document_programs WHERE program_name = ?")
            .bind(name)
            .fetch_one(&mut *tx)
            .await?;
    if in_use > 0 && !force {
        return Err(ArchivistError::Conflict(format!(
            "program {} is referenced by {} document(s)",
            name, in_use
        )));
    }
    if in_use > 0 {
        sqlx::query("DELETE FROM document_programs WHERE program_name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
    }
    sqlx::query("DELETE FROM programs WHERE name = ?")
        .bind(name)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    debug!(program = name, force, "relational store transaction committed: program deleted");
    Ok(())
}

// ---------------------------------------------------------------------
// Conversations & messages (C13)
// ---------------------------------------------------------------------

pub async fn create_conversation(
    pool: &SqlitePool,
    owner_user_id: &str,
    name: Option<&str>,
) -> Result<Conversation> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now();
    let context = ConversationContext::default();
    let context_json = serde_json::to_string(&context).unwrap_or_else(|_| "{}".into());

    sqlx::query(
        "INSERT INTO conversations (id, name, owner_user_id, context_json, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(name)
    .bind(owner_user_id)
    .bind(&context_json)
    .bind(ts(now))
    .bind(ts(now))
    .execute(pool)
    .await?;

    Ok(Conversation {
        id,
        name: name.map(str::to_string),
        owner_user_id: owner_user_id.to_string(),
        context,
        created_at: now,
        updated_at: now,
    })
}

pub async fn get_conversation(pool: &SqlitePool, id: &str) -> Result<Option<Conversation>> {
    let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else { return Ok(None) };
    let context_json: String = row.try_get("context_json")?;
    let context: ConversationContext = serde_json::from_str(&context_json).unwrap_or_default();

    Ok(Some(Conversation {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        owner_user_id: row.try_get("owner_user_id")?,
        context,
        created_at: from_ts(row.try_get("created_at")?),
        updated_at: from_ts(row.try_get("updated_at")?),
    }))
}

/// Last-write-wins patch of a conversation's context (C13). `patch` fields
/// that are `None` leave the corresponding stored field untouched.
pub async fn update_conversation_context(
    pool: &SqlitePool,
    id: &str,
    patch: ConversationContext,
) -> Result<Conversation> {
    let mut current = get_conversation(pool, id)
        .await?
        .ok_or_else(|| ArchivistError::NotFound(format!("conversation {}", id)))?;

    if patch.audience.is_some() {
        current.context.audience = patch.audience;
    }
    if patch.section.is_some() {
        current.context.section = patch.section;
    }
    if patch.writing_style_id.is_some() {
        current.context.writing_style_id = patch.writing_style_id;
    }
    if patch.filters.is_some() {
        current.context.filters = patch.filters;
    }
    if patch.working_output_id.is_some() {
        current.context.working_output_id = patch.working_output_id;
    }

    let now = Utc::now();
    let context_json = serde_json::to_string(&current.context).unwrap_or_else(|_| "{}".into());
    sqlx::query("UPDATE conversations SET context_json = ?, updated_at = ? WHERE id = ?")
        .bind(&context_json)
        .bind(ts(now))
        .bind(id)
        .execute(pool)
        .await?;
    current.updated_at = now;
    Ok(current)
}

/// Appends a message. An assistant message's `sources` are written once at
/// creation time and are never subsequently modified (§4.13).
pub async fn append_message(
    pool: &SqlitePool,
    conversation_id: &str,
    role: Role,
    content: &str,
    sources: &[SourceRef],
) -> Result<Message> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now();
    let sources_json = serde_json::to_string(sources).unwrap_or_else(|_| "[]".into());

    sqlx::query(
        "INSERT INTO messages (id, conversation_id, role, content, sources_json, created_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(conversation_id)
    .bind(role.as_str())
    .bind(content)
    .bind(&sources_json)
    .bind(ts(now))
    .execute(pool)
    .await?;

    Ok(Message {
        id,
        conversation_id: conversation_id.to_string(),
        role,
        content: content.to_string(),
        sources: sources.to_vec(),
        created_at: now,
    })
}

pub async fn list_messages(pool: &SqlitePool, conversation_id: &str) -> Result<Vec<Message>> {
    let rows = sqlx::query("SELECT * FROM messages WHERE conversation_id = ? ORDER BY created_at ASC")
        .bind(conversation_id)
        .fetch_all(pool)
        .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let role_str: String = row.try_get("role")?;
        let sources_json: String = row.try_get("sources_json")?;
        out.push(Message {
            id: row.try_get("id")?,
            conversation_id: row.try_get("conversation_id")?,
            role: Role::parse(&role_str).unwrap_or(Role::User),
            content: row.try_get("content")?,
            sources: serde_json::from_str(&sources_json).unwrap_or_default(),
            created_at: from_ts(row.try_get("created_at")?),
        });
    }
    Ok(out)
}

// ---------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------

pub async fn create_output(
    pool: &SqlitePool,
    output_type: &str,
    title: &str,
    content: &str,
    writing_style_id: Option<&str>,
) -> Result<Output> {
    let id = uuid::Uuid::new_v4().to_string();
    let word_count = content.split_whitespace().count() as i64;

    sqlx::query(
        "INSERT INTO outputs (id, output_type, title, content, word_count, status, writing_style_id) VALUES (?, ?, ?, ?, ?, 'draft', ?)",
    )
    .bind(&id)
    .bind(output_type)
    .bind(title)
    .bind(content)
    .bind(word_count)
    .bind(writing_style_id)
    .execute(pool)
    .await?;

    Ok(Output {
        id,
        output_type: output_type.to_string(),
        title: title.to_string(),
        content: content.to_string(),
        word_count,
        status: OutputStatus::Draft,
        writing_style_id: writing_style_id.map(str::to_string),
        funder_name: None,
        requested_amount: None,
        awarded_amount: None,
        submission_date: None,
        decision_date: None,
        success_notes: None,
        status_skip_reason: None,
    })
}

pub async fn get_output(pool: &SqlitePool, id: &str) -> Result<Option<Output>> {
    let row = sqlx::query("SELECT * FROM outputs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else { return Ok(None) };
    Ok(Some(output_from_row(&row)?))
}

fn output_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Output> {
    let status_str: String = row.try_get("status")?;
    Ok(Output {
        id: row.try_get("id")?,
        output_type: row.try_get("output_type")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        word_count: row.try_get("word_count")?,
        status: OutputStatus::parse(&status_str).unwrap_or(OutputStatus::Draft),
        writing_style_id: row.try_get("writing_style_id")?,
        funder_name: row.try_get("funder_name")?,
        requested_amount: row.try_get("requested_amount")?,
        awarded_amount: row.try_get("awarded_amount")?,
        submission_date: row
            .try_get::<Option<i64>, _>("submission_date")?
            .map(from_ts),
        decision_date: row.try_get::<Option<i64>, _>("decision_date")?.map(from_ts),
        success_notes: row.try_get("success_notes")?,
        status_skip_reason: row.try_get("status_skip_reason")?,
    })
}

/// Transitions `output.status`. A direct step (`OutputStatus::can_transition_to`)
/// is always allowed. A shortcut straight to a terminal state
/// (`OutputStatus::is_shortcut_to`) is allowed only when `skip_reason` is
/// supplied, and the reason is persisted alongside the new status. Any other
/// transition fails with `ValidationError` (§8 property 9).
pub async fn update_output_status(
    pool: &SqlitePool,
    id: &str,
    next: OutputStatus,
    skip_reason: Option<&str>,
) -> Result<Output> {
    let current = get_output(pool, id)
        .await?
        .ok_or_else(|| ArchivistError::NotFound(format!("output {}", id)))?;

    let recorded_skip = if current.status.can_transition_to(next) {
        None
    } else if current.status.is_shortcut_to(next) && skip_reason.is_some() {
        skip_reason
    } else {
        return Err(ArchivistError::Validation(vec![FieldError::new(
            "status",
            format!(
                "cannot transition from {} to {} without a recorded skip reason",
                current.status.as_str(),
                next.as_str()
            ),
        )]));
    };

    sqlx::query("UPDATE outputs SET status = ?, status_skip_reason = ? WHERE id = ?")
        .bind(next.as_str())
        .bind(recorded_skip)
        .bind(id)
        .execute(pool)
        .await?;

    Ok(Output {
        status: next,
        status_skip_reason: recorded_skip.map(str::to_string),
        ..current
    })
}

pub async fn update_output_content(pool: &SqlitePool, id: &str, content: &str) -> Result<Output> {
    let word_count = content.split_whitespace().count() as i64;
    sqlx::query("UPDATE outputs SET content = ?, word_count = ? WHERE id = ?")
        .bind(content)
        .bind(word_count)
        .bind(id)
        .execute(pool)
        .await?;
    get_output(pool, id)
        .await?
        .ok_or_else(|| ArchivistError::NotFound(format!("output {}", id)))
}

// ---------------------------------------------------------------------
// Writing styles
// ---------------------------------------------------------------------

pub async fn create_writing_style(
    pool: &SqlitePool,
    name: &str,
    style_type: StyleType,
    description: Option<&str>,
    prompt_content: &str,
    samples: &[String],
    analysis_metadata: serde_json::Value,
) -> Result<WritingStyle> {
    let existing: Option<String> =
        sqlx::query_scalar("SELECT name FROM writing_styles WHERE name = ?")
            .bind(name)
            .fetch_optional(pool)
            .await?;
    if existing.is_some() {
        return Err(ArchivistError::Conflict(format!(
            "writing style already exists: {}",
            name
        )));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let samples_json = serde_json::to_string(samples).unwrap_or_else(|_| "[]".into());
    let analysis_json = analysis_metadata.to_string();

    sqlx::query(
        "INSERT INTO writing_styles (id, name, style_type, description, prompt_content, samples_json, analysis_metadata_json, active) VALUES (?, ?, ?, ?, ?, ?, ?, 1)",
    )
    .bind(&id)
    .bind(name)
    .bind(style_type.as_str())
    .bind(description)
    .bind(prompt_content)
    .bind(&samples_json)
    .bind(&analysis_json)
    .execute(pool)
    .await?;

    Ok(WritingStyle {
        id,
        name: name.to_string(),
        style_type,
        description: description.map(str::to_string),
        prompt_content: prompt_content.to_string(),
        samples: samples.to_vec(),
        analysis_metadata,
        active: true,
    })
}

pub async fn get_writing_style(pool: &SqlitePool, id: &str) -> Result<Option<WritingStyle>> {
    let row = sqlx::query("SELECT * FROM writing_styles WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else { return Ok(None) };
    Ok(Some(writing_style_from_row(&row)?))
}

fn writing_style_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<WritingStyle> {
    let style_type_str: String = row.try_get("style_type")?;
    let samples_json: String = row.try_get("samples_json")?;
    let analysis_json: String = row.try_get("analysis_metadata_json")?;
    Ok(WritingStyle {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        style_type: StyleType::parse(&style_type_str).unwrap_or(StyleType::General),
        description: row.try_get("description")?,
        prompt_content: row.try_get("prompt_content")?,
        samples: serde_json::from_str(&samples_json).unwrap_or_default(),
        analysis_metadata: serde_json::from_str(&analysis_json).unwrap_or(serde_json::json!({})),
        active: row.try_get::<i64, _>("active")? != 0,
    })
}

pub async fn list_writing_styles(pool: &SqlitePool) -> Result<Vec<WritingStyle>> {
    let rows = sqlx::query("SELECT * FROM writing_styles WHERE active = 1 ORDER BY name")
        .fetch_all(pool)
        .await?;
    rows.iter().map(writing_style_from_row).collect()
}

pub async fn delete_writing_style(pool: &SqlitePool, id: &str) -> Result<()> {
    sqlx::query("UPDATE writing_styles SET active = 0 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------
// System config & audit log
// ---------------------------------------------------------------------

pub async fn get_system_config(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM system_config WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

pub async fn set_system_config(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO system_config (key, value, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(value)
    .bind(ts(now))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn record_audit(
    pool: &SqlitePool,
    actor_user_id: &str,
    action: &str,
    entity_type: &str,
    entity_id: &str,
    detail: serde_json::Value,
) -> Result<()> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO audit_log (id, actor_user_id, action, entity_type, entity_id, detail_json, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(actor_user_id)
    .bind(action)
    .bind(entity_type)
    .bind(entity_id)
    .bind(detail.to_string())
    .bind(ts(now))
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db;
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

    fn sample_document(id: &str, programs: Vec<String>) -> Document {
        Document {
            id: id.to_string(),
            filename: "grant.pdf".to_string(),
            doc_type: DocType::GrantProposal,
            year: 2024,
            outcome: Outcome::Awarded,
            file_size_bytes: 1024,
            chunks_count: 2,
            upload_timestamp: Utc::now(),
            created_by: "tester".to_string(),
            is_sensitive: false,
            sensitivity_level: SensitivityLevel::Low,
            notes: None,
            programs,
            tags: vec!["annual".to_string()],
            content_hash: format!("hash-{id}"),
        }
    }

    #[tokio::test]
    async fn insert_document_rejects_unknown_program() {
        let pool = test_pool().await;
        let doc = sample_document("d1", vec!["Education".to_string()]);
        let result = insert_document(&pool, &doc).await;
        assert!(matches!(result, Err(ArchivistError::Validation(_))));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn insert_and_fetch_document_roundtrip() {
        let pool = test_pool().await;
        create_program(&pool, "Education", None, 0).await.unwrap();
        let doc = sample_document("d1", vec!["Education".to_string()]);
        insert_document(&pool, &doc).await.unwrap();

        let fetched = get_document(&pool, "d1").await.unwrap().unwrap();
        assert_eq!(fetched.filename, "grant.pdf");
        assert_eq!(fetched.programs, vec!["Education".to_string()]);
        assert_eq!(fetched.tags, vec!["annual".to_string()]);
    }

    #[tokio::test]
    async fn delete_program_in_use_requires_force() {
        let pool = test_pool().await;
        create_program(&pool, "Education", None, 0).await.unwrap();
        let doc = sample_document("d1", vec!["Education".to_string()]);
        insert_document(&pool, &doc).await.unwrap();

        let result = delete_program(&pool, "Education", false).await;
        assert!(matches!(result, Err(ArchivistError::Conflict(_))));

        delete_program(&pool, "Education", true).await.unwrap();
    }

    #[tokio::test]
    async fn output_status_rejects_invalid_transition() {
        let pool = test_pool().await;
        let output = create_output(&pool, "grant_proposal", "Title", "body", None)
            .await
            .unwrap();
        let result = update_output_status(&pool, &output.id, OutputStatus::NotAwarded, None).await;
        assert!(result.is_err());
        let ok = update_output_status(&pool, &output.id, OutputStatus::Submitted, None)
            .await
            .unwrap();
        assert_eq!(ok.status, OutputStatus::Submitted);
    }

    #[tokio::test]
    async fn output_status_allows_recorded_shortcut() {
        let pool = test_pool().await;
        let output = create_output(&pool, "grant_proposal", "Title", "body", None)
            .await
            .unwrap();

        let rejected = update_output_status(&pool, &output.id, OutputStatus::Awarded, None).await;
        assert!(rejected.is_err());

        let skipped = update_output_status(
            &pool,
            &output.id,
            OutputStatus::Awarded,
            Some("funder confirmed verbally before paperwork was filed"),
        )
        .await
        .unwrap();
        assert_eq!(skipped.status, OutputStatus::Awarded);
        assert_eq!(
            skipped.status_skip_reason.as_deref(),
            Some("funder confirmed verbally before paperwork was filed")
        );
    }

    #[tokio::test]
    async fn conversation_context_patch_is_last_write_wins() {
        let pool = test_pool().await;
        let conv = create_conversation(&pool, "user1", None).await.unwrap();

        let patch = ConversationContext {
            audience: Some("Foundation Grant".to_string()),
            ..Default::default()
        };
        let updated = update_conversation_context(&pool, &conv.id, patch)
            .await
            .unwrap();
        assert_eq!(updated.context.audience.as_deref(), Some("Foundation Grant"));

        let patch2 = ConversationContext {
            section: Some("Program Description".to_string()),
            ..Default::default()
        };
        let updated2 = update_conversation_context(&pool, &conv.id, patch2)
            .await
            .unwrap();
        assert_eq!(updated2.context.audience.as_deref(), Some("Foundation Grant"));
        assert_eq!(
            updated2.context.section.as_deref(),
            Some("Program Description")
        );
    }
}
