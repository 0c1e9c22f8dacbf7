//! Hybrid retrieval engine (C9).
//!
//! Stage pipeline: query expansion, dense candidate retrieval (C1), lexical
//! candidate retrieval (C8), score normalization and fusion, recency
//! weighting, per-document diversification, optional LLM reranking (C4),
//! top-k selection. All stages except the C1/C3/C4/C8 calls are pure
//! transformations over candidate lists, which is why they're tested in
//! isolation below without touching a store at all.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::warn;

use crate::bm25::Bm25Service;
use crate::config::Config;
use crate::embedding::{self, EmbeddingProvider};
use crate::error::{ArchivistError, Result};
use crate::llm::{self, LlmMessage, LlmProvider};
use crate::models::{DocType, Outcome};
use crate::store::{self, ChunkRecord};
use crate::vector_store::{self, VectorFilter};

/// Static map of domain abbreviations expanded into the compound query used
/// for both dense and lexical retrieval (stage 1).
const QUERY_EXPANSIONS: &[(&str, &str)] = &[
    ("yoy", "year over year"),
    ("roi", "return on investment"),
    ("kpi", "key performance indicator"),
    ("nps", "net promoter score"),
    ("fte", "full time equivalent"),
    ("rfp", "request for proposal"),
];

fn expand_query(query: &str) -> String {
    let lower = query.to_lowercase();
    let mut expansions = Vec::new();
    for (abbrev, expansion) in QUERY_EXPANSIONS {
        let hit = lower
            .split(|c: char| !c.is_alphanumeric())
            .any(|w| w == *abbrev);
        if hit {
            expansions.push(*expansion);
        }
    }
    if expansions.is_empty() {
        query.to_string()
    } else {
        format!("{} {}", query, expansions.join(" "))
    }
}

/// Caller-supplied metadata predicate over §3 document fields and tags.
#[derive(Debug, Clone, Default)]
pub struct RetrievalFilter {
    pub doc_types: Option<Vec<DocType>>,
    pub outcomes: Option<Vec<Outcome>>,
    pub programs: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub year_min: Option<i32>,
    pub year_max: Option<i32>,
}

impl RetrievalFilter {
    fn matches(&self, rec: &ChunkRecord) -> bool {
        if let Some(types) = &self.doc_types {
            if !types.contains(&rec.doc_type) {
                return false;
            }
        }
        if let Some(outs) = &self.outcomes {
            if !outs.contains(&rec.outcome) {
                return false;
            }
        }
        if let Some(min) = self.year_min {
            if rec.year < min {
                return false;
            }
        }
        if let Some(max) = self.year_max {
            if rec.year > max {
                return false;
            }
        }
        if let Some(progs) = &self.programs {
            if !progs.iter().any(|p| rec.programs.contains(p)) {
                return false;
            }
        }
        if let Some(want_tags) = &self.tags {
            if !want_tags.iter().any(|t| rec.tags.contains(t)) {
                return false;
            }
        }
        true
    }

    fn to_vector_filter(&self) -> VectorFilter {
        VectorFilter {
            doc_types: self.doc_types.clone(),
            outcomes: self.outcomes.clone(),
            programs: self.programs.clone(),
            tags: self.tags.clone(),
            year_min: self.year_min,
            year_max: self.year_max,
            exclude_document_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalDebug {
    pub vector_score: f64,
    pub bm25_score: f64,
    pub fused_score: f64,
    pub age_multiplier: f64,
    pub reranked: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub filename: String,
    pub doc_type: DocType,
    pub year: i32,
    pub outcome: Outcome,
    pub score: f64,
    #[serde(rename = "_debug")]
    pub debug: RetrievalDebug,
}

pub struct RetrievalParams<'a> {
    pub query: &'a str,
    pub top_k: i64,
    pub filter: RetrievalFilter,
    pub recency_weight_override: Option<f64>,
    pub current_year: i32,
}

/// Internal fusion candidate carrying every signal needed by the remaining
/// stages, keyed by `chunk_id`.
struct Candidate {
    chunk_id: String,
    document_id: String,
    chunk_index: i64,
    text: String,
    filename: String,
    doc_type: DocType,
    year: i32,
    outcome: Outcome,
    vector_score: f64,
    bm25_raw: f64,
}

pub async fn retrieve(
    pool: &SqlitePool,
    config: &Config,
    embedding_provider: &dyn EmbeddingProvider,
    bm25: &Bm25Service,
    llm_provider: Option<&dyn LlmProvider>,
    params: RetrievalParams<'_>,
) -> Result<Vec<RetrievedChunk>> {
    let top_k = params.top_k.clamp(1, 20);
    let oversample = config.retrieval.oversample.max(1);
    let candidate_k = top_k * oversample;

    let compound_query = if config.retrieval.expand_query {
        expand_query(params.query)
    } else {
        params.query.to_string()
    };

    // Every chunk's denormalized metadata, fetched once: doubles as the BM25
    // rebuild source and the join table for lexical-candidate filtering.
    let all_chunks = store::get_all_chunks_text_by_id(pool).await?;
    let chunk_lookup: HashMap<String, &ChunkRecord> = all_chunks
        .iter()
        .map(|c| (c.chunk_id.clone(), c))
        .collect();

    let query_vector = embedding::embed_query(embedding_provider, &config.embedding, &compound_query)
        .await
        .map_err(|e| ArchivistError::RetrievalUnavailable(anyhow::anyhow!(e)))?;

    let vector_filter = params.filter.to_vector_filter();
    let dense_hits = vector_store::search(pool, &query_vector, candidate_k, &vector_filter)
        .await
        .map_err(|e| ArchivistError::RetrievalUnavailable(anyhow::anyhow!(e)))?;

    let lexical_hits: Vec<(String, f64)> = {
        let owned_chunks = all_chunks.clone();
        match bm25
            .ensure_fresh(|| async move {
                Ok(owned_chunks
                    .into_iter()
                    .map(|c| (c.chunk_id, c.text))
                    .collect())
            })
            .await
        {
            Ok(index) => index
                .search(&compound_query, candidate_k as usize)
                .into_iter()
                .filter(|(chunk_id, _)| {
                    chunk_lookup
                        .get(chunk_id)
                        .map(|rec| params.filter.matches(rec))
                        .unwrap_or(false)
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "lexical retrieval degraded to vector-only");
                Vec::new()
            }
        }
    };

    // Stage 4: union candidates by chunk_id, normalize BM25 by its own max.
    let bm25_max = lexical_hits
        .iter()
        .map(|(_, s)| *s)
        .fold(0.0_f64, f64::max);

    let mut candidates: HashMap<String, Candidate> = HashMap::new();

    for hit in &dense_hits {
        candidates.insert(
            hit.chunk_id.clone(),
            Candidate {
                chunk_id: hit.chunk_id.clone(),
                document_id: hit.document_id.clone(),
                chunk_index: hit.chunk_index,
                text: hit.text.clone(),
                filename: hit.filename.clone(),
                doc_type: hit.doc_type,
                year: hit.year,
                outcome: hit.outcome,
                vector_score: hit.vector_score as f64,
                bm25_raw: 0.0,
            },
        );
    }

    for (chunk_id, raw) in &lexical_hits {
        if let Some(existing) = candidates.get_mut(chunk_id) {
            existing.bm25_raw = *raw;
        } else if let Some(rec) = chunk_lookup.get(chunk_id) {
            candidates.insert(
                chunk_id.clone(),
                Candidate {
                    chunk_id: chunk_id.clone(),
                    document_id: rec.document_id.clone(),
                    chunk_index: rec.chunk_index,
                    text: rec.text.clone(),
                    filename: rec.filename.clone(),
                    doc_type: rec.doc_type,
                    year: rec.year,
                    outcome: rec.outcome,
                    vector_score: 0.0,
                    bm25_raw: *raw,
                },
            );
        }
    }

    let recency_weight = params.recency_weight_override.unwrap_or(config.retrieval.recency_weight);

    let mut fused: Vec<Fused> = candidates
        .into_values()
        .map(|c| {
            let bm25_score = if bm25_max > 0.0 { c.bm25_raw / bm25_max } else { 0.0 };
            let vector_score = c.vector_score;
            let fused_score = config.retrieval.vector_weight * vector_score
                + config.retrieval.keyword_weight * bm25_score;

            let age = params.current_year - c.year;
            let multiplier = if c.year <= 0 {
                0.85
            } else if age <= 0 {
                1.00
            } else if age == 1 {
                0.95
            } else if age == 2 {
                0.90
            } else {
                0.85
            };
            let adjusted = if recency_weight == 0.0 {
                fused_score
            } else {
                fused_score * (1.0 + recency_weight * (multiplier - 1.0))
            };

            Fused {
                candidate: c,
                vector_score,
                bm25_score,
                fused_score,
                age_multiplier: multiplier,
                adjusted,
            }
        })
        .collect();

    // Stage 6: per-document diversification. Sort by adjusted desc, tie-break
    // on higher vector_score then lower chunk_index, then cap per document.
    fused.sort_by(|a, b| {
        b.adjusted
            .partial_cmp(&a.adjusted)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.vector_score.partial_cmp(&a.vector_score).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| a.candidate.chunk_index.cmp(&b.candidate.chunk_index))
    });

    let max_per_doc = config.retrieval.max_per_doc;
    let mut per_doc_count: HashMap<String, usize> = HashMap::new();
    let mut diversified: Vec<Fused> = Vec::new();
    for f in fused {
        let count = per_doc_count.entry(f.candidate.document_id.clone()).or_insert(0);
        if *count >= max_per_doc {
            continue;
        }
        *count += 1;
        diversified.push(f);
    }

    // Stage 7: optional reranking via the LLM adapter.
    const RERANK_TIMEOUT: Duration = Duration::from_secs(15);
    let reranked = if config.retrieval.enable_reranking {
        if let Some(provider) = llm_provider {
            match tokio::time::timeout(
                RERANK_TIMEOUT,
                rerank_with_llm(provider, config, params.query, &diversified),
            )
            .await
            {
                Ok(Ok(scores)) => {
                    for (f, score) in diversified.iter_mut().zip(scores.into_iter()) {
                        f.adjusted = score;
                    }
                    diversified.sort_by(|a, b| {
                        b.adjusted.partial_cmp(&a.adjusted).unwrap_or(std::cmp::Ordering::Equal)
                    });
                    true
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "reranking failed, keeping fused order");
                    false
                }
                Err(_) => {
                    warn!("reranking timed out after {RERANK_TIMEOUT:?}, keeping fused order");
                    false
                }
            }
        } else {
            false
        }
    } else {
        false
    };

    diversified.truncate(top_k as usize);

    let results = diversified
        .into_iter()
        .map(|f| RetrievedChunk {
            chunk_id: f.candidate.chunk_id,
            document_id: f.candidate.document_id,
            chunk_index: f.candidate.chunk_index,
            text: f.candidate.text,
            filename: f.candidate.filename,
            doc_type: f.candidate.doc_type,
            year: f.candidate.year,
            outcome: f.candidate.outcome,
            score: f.adjusted,
            debug: RetrievalDebug {
                vector_score: f.vector_score,
                bm25_score: f.bm25_score,
                fused_score: f.fused_score,
                age_multiplier: f.age_multiplier,
                reranked,
            },
        })
        .collect();

    Ok(results)
}

struct Fused {
    candidate: Candidate,
    vector_score: f64,
    bm25_score: f64,
    fused_score: f64,
    age_multiplier: f64,
    adjusted: f64,
}

/// Asks the LLM (C4) to score each candidate's relevance to the query on a
/// 0.0-1.0 scale, returning scores in the same order as `candidates`. Falls
/// back to the caller on any parse failure.
async fn rerank_with_llm(
    provider: &dyn LlmProvider,
    config: &Config,
    query: &str,
    candidates: &[Fused],
) -> Result<Vec<f64>> {
    let mut prompt = format!(
        "Score how relevant each excerpt is to the query on a scale from 0.0 to 1.0.\n\
         Respond with ONLY a JSON array of numbers, one per excerpt, in order.\n\n\
         Query: {}\n\n",
        query
    );
    for (i, f) in candidates.iter().enumerate() {
        prompt.push_str(&format!("Excerpt {}: {}\n\n", i + 1, truncate_chars(&f.candidate.text, 500)));
    }

    let messages = vec![
        LlmMessage::system("You are a precise relevance-scoring assistant. Output only valid JSON."),
        LlmMessage::user(prompt),
    ];

    let result = llm::generate(provider, &config.llm, &messages).await?;
    parse_score_array(&result.content, candidates.len())
        .ok_or_else(|| ArchivistError::RetrievalUnavailable(anyhow::anyhow!("reranker returned unparseable scores")))
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn parse_score_array(content: &str, expected_len: usize) -> Option<Vec<f64>> {
    let start = content.find('[')?;
    let end = content.rfind(']')?;
    if end <= start {
        return None;
    }
    let slice = &content[start..=end];
    let values: Vec<f64> = serde_json::from_str(slice).ok()?;
    if values.len() != expected_len {
        return None;
    }
    Some(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_candidate(chunk_id: &str, doc_id: &str, year: i32, chunk_index: i64) -> Candidate {
        Candidate {
            chunk_id: chunk_id.to_string(),
            document_id: doc_id.to_string(),
            chunk_index,
            text: String::new(),
            filename: "f.txt".to_string(),
            doc_type: DocType::Other,
            year,
            outcome: Outcome::NotApplicable,
            vector_score: 0.0,
            bm25_raw: 0.0,
        }
    }

    #[test]
    fn expand_query_appends_known_abbreviation() {
        let expanded = expand_query("what was our YoY growth");
        assert!(expanded.contains("year over year"));
    }

    #[test]
    fn expand_query_leaves_unknown_terms_alone() {
        let expanded = expand_query("what was our growth");
        assert_eq!(expanded, "what was our growth");
    }

    #[test]
    fn recency_step_function_matches_spec_breakpoints() {
        let breakpoints = [(0, 1.00), (1, 0.95), (2, 0.90), (3, 0.85), (10, 0.85)];
        for (age, expected) in breakpoints {
            let multiplier = if age <= 0 {
                1.00
            } else if age == 1 {
                0.95
            } else if age == 2 {
                0.90
            } else {
                0.85
            };
            assert!((multiplier - expected).abs() < 1e-9, "age={age}");
        }
    }

    #[test]
    fn diversification_caps_chunks_per_document() {
        let mut fused: Vec<Fused> = (0..5)
            .map(|i| Fused {
                candidate: make_candidate(&format!("c{i}"), "doc-a", 2024, i),
                vector_score: 1.0 - (i as f64) * 0.01,
                bm25_score: 0.0,
                fused_score: 1.0 - (i as f64) * 0.01,
                age_multiplier: 1.0,
                adjusted: 1.0 - (i as f64) * 0.01,
            })
            .collect();
        fused.sort_by(|a, b| b.adjusted.partial_cmp(&a.adjusted).unwrap());

        let max_per_doc = 3usize;
        let mut per_doc_count: HashMap<String, usize> = HashMap::new();
        let mut diversified = Vec::new();
        for f in fused {
            let count = per_doc_count.entry(f.candidate.document_id.clone()).or_insert(0);
            if *count >= max_per_doc {
                continue;
            }
            *count += 1;
            diversified.push(f);
        }

        assert_eq!(diversified.len(), 3);
    }

    #[test]
    fn parse_score_array_extracts_json_from_surrounding_prose() {
        let content = "Sure, here are the scores:\n[0.9, 0.2, 0.5]\nHope that helps!";
        let scores = parse_score_array(content, 3).unwrap();
        assert_eq!(scores, vec![0.9, 0.2, 0.5]);
    }

    #[test]
    fn parse_score_array_rejects_length_mismatch() {
        let content = "[0.9, 0.2]";
        assert!(parse_score_array(content, 3).is_none());
    }

    #[test]
    fn fusion_weights_combine_to_requested_score() {
        let vector_weight = 0.7;
        let keyword_weight = 0.3;
        let v = 0.8;
        let b = 0.4;
        let fused_score = vector_weight * v + keyword_weight * b;
        assert!((fused_score - 0.68).abs() < 1e-9);
    }
}
