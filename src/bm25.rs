//! In-memory BM25 lexical index (C8).
//!
//! Modeled as an injectable service with a generation counter rather than a
//! process-wide singleton: ingestion/deletion bump the generation and set a
//! dirty flag, the next search rebuilds before querying, and the rebuild
//! swaps in a fresh `Arc<Bm25Index>` so readers that already cloned the
//! prior snapshot are unaffected.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

const K1: f64 = 1.5;
const B: f64 = 0.75;

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "is", "are", "was", "were", "be", "been", "being", "to",
    "of", "in", "on", "for", "with", "as", "at", "by", "this", "that", "it", "from", "we", "our",
    "will", "has", "have", "had", "not", "no", "do", "does", "did", "its", "their", "they", "you",
    "your",
];

/// Lowercases, splits on non-alphanumeric boundaries, strips stop words, and
/// lightly stems by dropping a handful of common suffixes.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .filter(|w| !STOPWORDS.contains(w))
        .map(stem)
        .collect()
}

fn stem(word: &str) -> String {
    for suffix in ["ing", "edly", "ed", "es", "s"] {
        if word.len() > suffix.len() + 2 && word.ends_with(suffix) {
            return word[..word.len() - suffix.len()].to_string();
        }
    }
    word.to_string()
}

#[derive(Debug, Default, Clone)]
pub struct Bm25Index {
    /// term -> chunk_id -> term frequency within that chunk
    postings: HashMap<String, HashMap<String, usize>>,
    /// term -> number of chunks containing it
    doc_freq: HashMap<String, usize>,
    doc_len: HashMap<String, usize>,
    avg_doc_len: f64,
    num_docs: usize,
}

impl Bm25Index {
    pub fn build(chunks: &[(String, String)]) -> Self {
        let mut postings: HashMap<String, HashMap<String, usize>> = HashMap::new();
        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        let mut doc_len: HashMap<String, usize> = HashMap::new();
        let mut total_len = 0usize;

        for (chunk_id, text) in chunks {
            let tokens = tokenize(text);
            doc_len.insert(chunk_id.clone(), tokens.len());
            total_len += tokens.len();

            let mut seen_terms = std::collections::HashSet::new();
            for tok in &tokens {
                *postings
                    .entry(tok.clone())
                    .or_default()
                    .entry(chunk_id.clone())
                    .or_insert(0) += 1;
                seen_terms.insert(tok.clone());
            }
            for term in seen_terms {
                *doc_freq.entry(term).or_insert(0) += 1;
            }
        }

        let num_docs = chunks.len();
        let avg_doc_len = if num_docs > 0 {
            total_len as f64 / num_docs as f64
        } else {
            0.0
        };

        Self {
            postings,
            doc_freq,
            doc_len,
            avg_doc_len,
            num_docs,
        }
    }

    /// Returns `(chunk_id, bm25_score)` pairs for the top `top_k` matches,
    /// sorted by score descending. An empty index or query yields no results.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<(String, f64)> {
        if self.num_docs == 0 {
            return Vec::new();
        }
        let query_terms = tokenize(query);
        if query_terms.is_empty() {
            return Vec::new();
        }

        let mut scores: HashMap<String, f64> = HashMap::new();

        for term in &query_terms {
            let Some(term_postings) = self.postings.get(term) else {
                continue;
            };
            let df = *self.doc_freq.get(term).unwrap_or(&0) as f64;
            let idf = ((self.num_docs as f64 - df + 0.5) / (df + 0.5) + 1.0).ln();

            for (chunk_id, &tf) in term_postings {
                let doc_len = *self.doc_len.get(chunk_id).unwrap_or(&0) as f64;
                let denom = tf as f64
                    + K1 * (1.0 - B + B * doc_len / self.avg_doc_len.max(1.0));
                let term_score = idf * (tf as f64 * (K1 + 1.0)) / denom.max(f64::EPSILON);
                *scores.entry(chunk_id.clone()).or_insert(0.0) += term_score;
            }
        }

        let mut results: Vec<(String, f64)> = scores.into_iter().collect();
        results.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        results.truncate(top_k);
        results
    }
}

/// Injectable, lazily-rebuilt BM25 index service.
pub struct Bm25Service {
    index: RwLock<Arc<Bm25Index>>,
    rebuild_lock: Mutex<()>,
    dirty: AtomicBool,
    generation: AtomicU64,
}

impl Default for Bm25Service {
    fn default() -> Self {
        Self::new()
    }
}

impl Bm25Service {
    pub fn new() -> Self {
        Self {
            index: RwLock::new(Arc::new(Bm25Index::default())),
            rebuild_lock: Mutex::new(()),
            dirty: AtomicBool::new(true),
            generation: AtomicU64::new(0),
        }
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Returns a fresh snapshot, rebuilding first if the index is stale.
    /// `source` is called only when a rebuild is actually needed, and at
    /// most one rebuild runs at a time across concurrent callers.
    pub async fn ensure_fresh<F, Fut>(&self, source: F) -> Result<Arc<Bm25Index>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<(String, String)>>>,
    {
        if !self.dirty.load(Ordering::Acquire) {
            return Ok(self.index.read().await.clone());
        }

        let _rebuild_guard = self.rebuild_lock.lock().await;
        if !self.dirty.load(Ordering::Acquire) {
            return Ok(self.index.read().await.clone());
        }

        let started = std::time::Instant::now();
        let chunks = source().await?;
        let chunk_count = chunks.len();
        let fresh = Arc::new(Bm25Index::build(&chunks));
        {
            let mut guard = self.index.write().await;
            *guard = fresh.clone();
        }
        self.dirty.store(false, Ordering::Release);
        debug!(
            chunk_count,
            generation = self.generation(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "bm25 index rebuilt"
        );
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_strips_stopwords_and_punctuation() {
        let tokens = tokenize("The Quick Fox, and the Dog!");
        assert!(!tokens.contains(&"the".to_string()));
        assert!(!tokens.contains(&"and".to_string()));
        assert!(tokens.contains(&"quick".to_string()));
        assert!(tokens.contains(&"fox".to_string()));
    }

    #[test]
    fn search_ranks_exact_term_match_highest() {
        let chunks = vec![
            ("a".to_string(), "grant funding for youth programs".to_string()),
            ("b".to_string(), "annual report on finances".to_string()),
        ];
        let index = Bm25Index::build(&chunks);
        let results = index.search("youth programs", 10);
        assert_eq!(results[0].0, "a");
    }

    #[test]
    fn empty_index_returns_no_results() {
        let index = Bm25Index::default();
        assert!(index.search("anything", 10).is_empty());
    }

    #[test]
    fn empty_query_returns_no_results() {
        let chunks = vec![("a".to_string(), "some text".to_string())];
        let index = Bm25Index::build(&chunks);
        assert!(index.search("", 10).is_empty());
    }

    #[tokio::test]
    async fn service_rebuilds_only_when_dirty() {
        let service = Bm25Service::new();
        let mut rebuild_count = 0;

        let first = service
            .ensure_fresh(|| async {
                Ok(vec![("a".to_string(), "hello world".to_string())])
            })
            .await
            .unwrap();
        rebuild_count += 1;
        assert_eq!(first.num_docs, 1);

        // Not dirty anymore — source must not be invoked again.
        let second = service
            .ensure_fresh(|| async { panic!("should not rebuild when clean") })
            .await
            .unwrap();
        assert_eq!(rebuild_count, 1);
        assert!(Arc::ptr_eq(&first, &second));

        service.mark_dirty();
        let third = service
            .ensure_fresh(|| async {
                Ok(vec![
                    ("a".to_string(), "hello world".to_string()),
                    ("b".to_string(), "goodbye".to_string()),
                ])
            })
            .await
            .unwrap();
        assert_eq!(third.num_docs, 2);
        assert!(!Arc::ptr_eq(&first, &third));
    }
}
