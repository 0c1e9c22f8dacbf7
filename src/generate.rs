//! Generation orchestrator (C11): retrieve via C9/C10, assemble a prompt
//! around the retrieved chunks, invoke the LLM (C4) in streaming or
//! non-streaming mode, and validate citation markers in the response.

use std::pin::Pin;
use std::time::Instant;

use futures::stream::{Stream, StreamExt};
use sqlx::SqlitePool;
use tracing::debug;

use crate::bm25::Bm25Service;
use crate::cache::{CacheKey, QueryCache};
use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::error::{ArchivistError, FieldError, Result};
use crate::llm::{self, LlmMessage, LlmProvider};
use crate::models::SourceRef;
use crate::search::{self, RetrievalFilter, RetrievedChunk};
use crate::store;

const SYSTEM_PREAMBLE: &str = "You are the organizational archivist for a nonprofit. Answer strictly \
from the provided source excerpts. Cite every claim drawn from a source using the exact marker \
[Source N], where N is the excerpt's number. Never fabricate a citation to a source that was not \
provided, and never invent facts the excerpts don't support.";

const AUDIENCE_DIRECTIVES: &[(&str, &str)] = &[
    ("Foundation Grant", "Write for a program officer evaluating measurable impact and fiscal stewardship."),
    ("Individual Donor", "Write warmly, centering on the people served rather than statistics."),
    ("Government Agency", "Write formally, citing compliance and outcome metrics precisely."),
    ("Corporate Sponsor", "Emphasize partnership value and brand alignment."),
    ("Board Member", "Write concisely, foregrounding governance and financial oversight."),
];

const SECTION_DIRECTIVES: &[(&str, &str)] = &[
    ("Executive Summary", "Summarize the organization's mission and headline outcomes in under 200 words."),
    ("Needs Statement", "Establish the problem with evidence before describing the response."),
    ("Program Description", "Describe activities, participants, and delivery model concretely."),
    ("Budget Narrative", "Tie dollar figures to specific activities and outcomes."),
    ("Outcomes", "Lead with quantified results, then qualitative supporting evidence."),
];

fn directive(table: &[(&str, &str)], value: &str, fallback: &'static str) -> &'static str {
    table
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(value))
        .map(|(_, text)| *text)
        .unwrap_or(fallback)
}

#[derive(Debug, Clone)]
pub struct GenerateParams<'a> {
    pub query: &'a str,
    pub audience: Option<String>,
    pub section: Option<String>,
    pub tone: Option<String>,
    pub writing_style_id: Option<String>,
    pub filters: RetrievalFilter,
    pub max_sources: i64,
    pub recency_weight: Option<f64>,
    pub max_tokens: u32,
    pub temperature: f64,
    pub custom_instructions: Option<String>,
    pub current_year: i32,
}

fn validate_params(params: &GenerateParams<'_>) -> Result<()> {
    let mut errors = Vec::new();
    if !(1..=15).contains(&params.max_sources) {
        errors.push(FieldError {
            field: "max_sources".to_string(),
            message: "must be between 1 and 15".to_string(),
        });
    }
    if let Some(instructions) = &params.custom_instructions {
        if instructions.chars().count() > 500 {
            errors.push(FieldError {
                field: "custom_instructions".to_string(),
                message: "must be at most 500 characters".to_string(),
            });
        }
    }
    if !errors.is_empty() {
        return Err(ArchivistError::Validation(errors));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct GenerationMetadata {
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub invalid_citations: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub content: String,
    pub sources: Vec<SourceRef>,
    pub metadata: GenerationMetadata,
}

#[derive(Debug, Clone)]
pub enum GenerationEvent {
    Sources(Vec<SourceRef>),
    Content(String),
    Done {
        model: String,
        tokens_used: u32,
        invalid_citations: usize,
        duration_ms: u64,
    },
    Error(String),
}

pub type EventStream = Pin<Box<dyn Stream<Item = GenerationEvent> + Send>>;

async fn retrieve_with_cache(
    pool: &SqlitePool,
    config: &Config,
    embedding_provider: &dyn EmbeddingProvider,
    bm25: &Bm25Service,
    llm_provider: Option<&dyn LlmProvider>,
    cache: &QueryCache,
    params: &GenerateParams<'_>,
) -> Result<Vec<RetrievedChunk>> {
    let max_sources = params.max_sources.clamp(1, 15);
    let recency_weight = params.recency_weight.unwrap_or(config.retrieval.recency_weight);
    let key = CacheKey::new(
        params.query,
        max_sources,
        &params.filters,
        recency_weight,
        config.retrieval.enable_reranking,
    );

    if let Some(cached) = cache.get(&key).await {
        return Ok(cached);
    }

    let retrieved = search::retrieve(
        pool,
        config,
        embedding_provider,
        bm25,
        llm_provider,
        search::RetrievalParams {
            query: params.query,
            top_k: max_sources,
            filter: params.filters.clone(),
            recency_weight_override: params.recency_weight,
            current_year: params.current_year,
        },
    )
    .await?;

    cache.put(key, retrieved.clone()).await;
    Ok(retrieved)
}

async fn assemble_prompt(
    pool: &SqlitePool,
    params: &GenerateParams<'_>,
    retrieved: &[RetrievedChunk],
) -> Result<Vec<LlmMessage>> {
    let mut system = String::from(SYSTEM_PREAMBLE);

    if let Some(style_id) = &params.writing_style_id {
        if let Some(style) = store::get_writing_style(pool, style_id).await? {
            system.push_str("\n\nHouse writing style:\n");
            system.push_str(&style.prompt_content);
        }
    }

    if let Some(audience) = &params.audience {
        system.push_str(&format!(
            "\n\nAudience: {}. {}",
            audience,
            directive(
                AUDIENCE_DIRECTIVES,
                audience,
                "Write clearly for this audience's context and priorities."
            )
        ));
    }
    if let Some(section) = &params.section {
        system.push_str(&format!(
            "\n\nSection: {}. {}",
            section,
            directive(
                SECTION_DIRECTIVES,
                section,
                "Write this section to fit naturally within the larger document."
            )
        ));
    }
    if let Some(tone) = &params.tone {
        system.push_str(&format!("\n\nTone: {}.", tone));
    }
    if let Some(instructions) = &params.custom_instructions {
        system.push_str(&format!("\n\nAdditional instructions: {}", instructions));
    }

    let mut user = String::new();
    for (i, chunk) in retrieved.iter().enumerate() {
        user.push_str(&format!(
            "[Source {}: {} ({})]\n{}\n\n",
            i + 1,
            chunk.filename,
            chunk.year,
            chunk.text
        ));
    }
    user.push_str(&format!("Query: {}", params.query));

    Ok(vec![LlmMessage::system(system), LlmMessage::user(user)])
}

fn to_source_refs(retrieved: &[RetrievedChunk]) -> Vec<SourceRef> {
    retrieved
        .iter()
        .map(|c| SourceRef {
            chunk_id: c.chunk_id.clone(),
            document_id: c.document_id.clone(),
            score: c.score,
        })
        .collect()
}

/// Drops `[Source N]` markers whose `N` doesn't index into `n_sources`,
/// leaving valid markers untouched. Returns the scrubbed content and the
/// count of markers dropped.
fn validate_citations(content: &str, n_sources: usize) -> (String, usize) {
    let chars: Vec<char> = content.chars().collect();
    let mut out = String::with_capacity(content.len());
    let mut invalid = 0;
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == '[' {
            if let Some((end_idx, n)) = match_source_marker(&chars, i) {
                if n >= 1 && n <= n_sources {
                    out.extend(&chars[i..=end_idx]);
                } else {
                    invalid += 1;
                }
                i = end_idx + 1;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }

    (out, invalid)
}

/// Matches `[Source <digits>]` (case-insensitive on "Source", tolerant of
/// internal spacing) starting at `chars[start] == '['`. Returns the index of
/// the closing `]` and the parsed number.
fn match_source_marker(chars: &[char], start: usize) -> Option<(usize, usize)> {
    let mut idx = start + 1;
    for expected in "source".chars() {
        if idx >= chars.len() || chars[idx].to_ascii_lowercase() != expected {
            return None;
        }
        idx += 1;
    }
    while idx < chars.len() && chars[idx] == ' ' {
        idx += 1;
    }
    let digits_start = idx;
    while idx < chars.len() && chars[idx].is_ascii_digit() {
        idx += 1;
    }
    if idx == digits_start {
        return None;
    }
    let n: usize = chars[digits_start..idx].iter().collect::<String>().parse().ok()?;
    while idx < chars.len() && chars[idx] == ' ' {
        idx += 1;
    }
    if idx >= chars.len() || chars[idx] != ']' {
        return None;
    }
    Some((idx, n))
}

/// Non-streaming generation: `{content, sources, metadata}` at completion.
pub async fn generate(
    pool: &SqlitePool,
    config: &Config,
    embedding_provider: &dyn EmbeddingProvider,
    bm25: &Bm25Service,
    llm_provider: &dyn LlmProvider,
    cache: &QueryCache,
    params: GenerateParams<'_>,
) -> Result<GenerationOutcome> {
    validate_params(&params)?;
    let started = Instant::now();

    let retrieved =
        retrieve_with_cache(pool, config, embedding_provider, bm25, Some(llm_provider), cache, &params).await?;
    let sources = to_source_refs(&retrieved);
    let messages = assemble_prompt(pool, &params, &retrieved).await?;

    let mut llm_config = config.llm.clone();
    llm_config.max_tokens = params.max_tokens;
    llm_config.temperature = params.temperature;

    let result = llm::generate(llm_provider, &llm_config, &messages).await?;
    let (content, invalid_citations) = validate_citations(&result.content, sources.len());

    Ok(GenerationOutcome {
        content,
        sources,
        metadata: GenerationMetadata {
            model: result.model,
            input_tokens: result.input_tokens,
            output_tokens: result.output_tokens,
            invalid_citations,
            duration_ms: started.elapsed().as_millis() as u64,
        },
    })
}

/// Streaming generation: `sources` (once, first), `content` (many), then a
/// terminal `done` or `error`. Citation scrubbing only affects the `done`
/// metadata's `invalid_citations` count — individual content deltas are
/// forwarded as the model produced them, since validity can only be judged
/// against the complete response.
pub async fn generate_streaming(
    pool: &SqlitePool,
    config: &Config,
    embedding_provider: &dyn EmbeddingProvider,
    bm25: &Bm25Service,
    llm_provider: &dyn LlmProvider,
    cache: &QueryCache,
    params: GenerateParams<'_>,
) -> Result<EventStream> {
    validate_params(&params)?;

    let retrieved =
        retrieve_with_cache(pool, config, embedding_provider, bm25, Some(llm_provider), cache, &params).await?;
    let sources = to_source_refs(&retrieved);
    let n_sources = sources.len();
    let messages = assemble_prompt(pool, &params, &retrieved).await?;

    let mut llm_config = config.llm.clone();
    llm_config.max_tokens = params.max_tokens;
    llm_config.temperature = params.temperature;

    let model_name = llm_provider.model_name().to_string();
    let raw = llm::generate_streaming(llm_provider, &llm_config, &messages).await?;

    let stream = async_stream::stream! {
        debug!(n_sources, "generation stream started");
        yield GenerationEvent::Sources(sources);

        let started = Instant::now();
        let mut full = String::new();
        let mut raw = raw;
        loop {
            match raw.next().await {
                Some(Ok(delta)) => {
                    full.push_str(&delta);
                    yield GenerationEvent::Content(delta);
                }
                Some(Err(e)) => {
                    debug!(error = %e, elapsed_ms = started.elapsed().as_millis() as u64, "generation stream terminated with error");
                    yield GenerationEvent::Error(e.to_string());
                    return;
                }
                None => break,
            }
        }

        let (_, invalid_citations) = validate_citations(&full, n_sources);
        let duration_ms = started.elapsed().as_millis() as u64;
        debug!(duration_ms, invalid_citations, "generation stream completed");
        yield GenerationEvent::Done {
            model: model_name,
            tokens_used: full.split_whitespace().count() as u32,
            invalid_citations,
            duration_ms,
        };
    };

    Ok(Box::pin(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_citations_keeps_in_range_markers() {
        let (content, invalid) = validate_citations("Funding grew [Source 1] last year.", 2);
        assert_eq!(content, "Funding grew [Source 1] last year.");
        assert_eq!(invalid, 0);
    }

    #[test]
    fn validate_citations_drops_out_of_range_markers() {
        let (content, invalid) = validate_citations("Funding grew [Source 5] last year.", 2);
        assert_eq!(content, "Funding grew  last year.");
        assert_eq!(invalid, 1);
    }

    #[test]
    fn validate_citations_is_case_insensitive() {
        let (content, invalid) = validate_citations("See [source 1] for detail.", 2);
        assert_eq!(content, "See [source 1] for detail.");
        assert_eq!(invalid, 0);
    }

    #[test]
    fn validate_citations_never_rewrites_invalid_to_valid() {
        let (content, invalid) = validate_citations("[Source 0] and [Source 1]", 1);
        assert_eq!(content, " and [Source 1]");
        assert_eq!(invalid, 1);
    }

    #[test]
    fn validate_params_rejects_max_sources_out_of_range() {
        let params = GenerateParams {
            query: "q",
            audience: None,
            section: None,
            tone: None,
            writing_style_id: None,
            filters: RetrievalFilter::default(),
            max_sources: 0,
            recency_weight: None,
            max_tokens: 100,
            temperature: 0.3,
            custom_instructions: None,
            current_year: 2026,
        };
        assert!(matches!(validate_params(&params), Err(ArchivistError::Validation(_))));
    }

    #[test]
    fn validate_params_rejects_long_custom_instructions() {
        let params = GenerateParams {
            query: "q",
            audience: None,
            section: None,
            tone: None,
            writing_style_id: None,
            filters: RetrievalFilter::default(),
            max_sources: 5,
            recency_weight: None,
            max_tokens: 100,
            temperature: 0.3,
            custom_instructions: Some("x".repeat(501)),
            current_year: 2026,
        };
        assert!(matches!(validate_params(&params), Err(ArchivistError::Validation(_))));
    }

    #[test]
    fn audience_directive_falls_back_for_unknown_value() {
        let text = directive(AUDIENCE_DIRECTIVES, "Martian Overlords", "fallback text");
        assert_eq!(text, "fallback text");
    }

    #[test]
    fn audience_directive_matches_known_value_case_insensitively() {
        let text = directive(AUDIENCE_DIRECTIVES, "foundation grant", "fallback text");
        assert_ne!(text, "fallback text");
    }
}
