//! Query cache (C10): a bounded LRU with a per-entry TTL in front of the
//! retrieval engine (C9). Keyed on the canonicalized (query, top_k, filter,
//! recency_weight, rerank) tuple, so two calls with the same semantic inputs
//! hit the cache regardless of call-site ordering or casing differences.
//! Invalidated wholesale on ingestion or deletion rather than tracked
//! per-document, since a single chunk change can shift fusion and
//! diversification outcomes for any cached query.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::Mutex;

use crate::search::{RetrievalFilter, RetrievedChunk};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    query: String,
    top_k: i64,
    doc_types: Vec<String>,
    outcomes: Vec<String>,
    programs: Vec<String>,
    tags: Vec<String>,
    year_min: Option<i32>,
    year_max: Option<i32>,
    recency_weight_bits: u64,
    rerank: bool,
}

impl CacheKey {
    pub fn new(
        query: &str,
        top_k: i64,
        filter: &RetrievalFilter,
        recency_weight: f64,
        rerank: bool,
    ) -> Self {
        let mut doc_types: Vec<String> = filter
            .doc_types
            .as_ref()
            .map(|v| v.iter().map(|d| d.as_str().to_string()).collect())
            .unwrap_or_default();
        doc_types.sort();

        let mut outcomes: Vec<String> = filter
            .outcomes
            .as_ref()
            .map(|v| v.iter().map(|o| o.as_str().to_string()).collect())
            .unwrap_or_default();
        outcomes.sort();

        let mut programs = filter.programs.clone().unwrap_or_default();
        programs.sort();

        let mut tags = filter.tags.clone().unwrap_or_default();
        tags.sort();

        Self {
            query: query.trim().to_lowercase(),
            top_k,
            doc_types,
            outcomes,
            programs,
            tags,
            year_min: filter.year_min,
            year_max: filter.year_max,
            recency_weight_bits: recency_weight.to_bits(),
            rerank,
        }
    }
}

struct Entry {
    value: Vec<RetrievedChunk>,
    inserted_at: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub hit_rate: f64,
}

pub struct QueryCache {
    inner: Mutex<LruCache<CacheKey, Entry>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl QueryCache {
    pub fn new(max_entries: usize, ttl_secs: u64) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl: Duration::from_secs(ttl_secs),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub async fn get(&self, key: &CacheKey) -> Option<Vec<RetrievedChunk>> {
        let mut guard = self.inner.lock().await;
        if let Some(entry) = guard.get(key) {
            if entry.inserted_at.elapsed() <= self.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            guard.pop(key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub async fn put(&self, key: CacheKey, value: Vec<RetrievedChunk>) {
        let mut guard = self.inner.lock().await;
        let at_capacity = guard.len() == guard.cap().get();
        if at_capacity && !guard.contains(&key) {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        guard.put(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    pub async fn invalidate_all(&self) {
        let mut guard = self.inner.lock().await;
        guard.clear();
    }

    pub async fn stats(&self) -> CacheStats {
        let guard = self.inner.lock().await;
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            size: guard.len(),
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocType, Outcome};

    fn sample_chunk(id: &str) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: id.to_string(),
            document_id: "doc-1".to_string(),
            chunk_index: 0,
            text: "text".to_string(),
            filename: "f.txt".to_string(),
            doc_type: DocType::Other,
            year: 2024,
            outcome: Outcome::NotApplicable,
            score: 0.9,
            debug: crate::search::RetrievalDebug {
                vector_score: 0.9,
                bm25_score: 0.0,
                fused_score: 0.9,
                age_multiplier: 1.0,
                reranked: false,
            },
        }
    }

    #[tokio::test]
    async fn put_then_get_is_a_hit() {
        let cache = QueryCache::new(10, 3600);
        let filter = RetrievalFilter::default();
        let key = CacheKey::new("grants", 5, &filter, 0.7, false);
        cache.put(key.clone(), vec![sample_chunk("c1")]).await;

        let hit = cache.get(&key).await;
        assert!(hit.is_some());
        assert_eq!(cache.stats().await.hits, 1);
    }

    #[tokio::test]
    async fn distinct_top_k_produces_distinct_keys() {
        let filter = RetrievalFilter::default();
        let key_a = CacheKey::new("grants", 5, &filter, 0.7, false);
        let key_b = CacheKey::new("grants", 10, &filter, 0.7, false);
        assert_ne!(key_a, key_b);
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss() {
        let cache = QueryCache::new(10, 0);
        let filter = RetrievalFilter::default();
        let key = CacheKey::new("grants", 5, &filter, 0.7, false);
        cache.put(key.clone(), vec![sample_chunk("c1")]).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        let hit = cache.get(&key).await;
        assert!(hit.is_none());
    }

    #[tokio::test]
    async fn invalidate_all_clears_entries() {
        let cache = QueryCache::new(10, 3600);
        let filter = RetrievalFilter::default();
        let key = CacheKey::new("grants", 5, &filter, 0.7, false);
        cache.put(key.clone(), vec![sample_chunk("c1")]).await;
        cache.invalidate_all().await;

        assert!(cache.get(&key).await.is_none());
        assert_eq!(cache.stats().await.size, 0);
    }

    #[tokio::test]
    async fn eviction_past_capacity_is_counted() {
        let cache = QueryCache::new(1, 3600);
        let filter = RetrievalFilter::default();
        let key_a = CacheKey::new("grants", 5, &filter, 0.7, false);
        let key_b = CacheKey::new("funding", 5, &filter, 0.7, false);
        cache.put(key_a, vec![sample_chunk("c1")]).await;
        cache.put(key_b, vec![sample_chunk("c2")]).await;

        assert_eq!(cache.stats().await.evictions, 1);
    }
}
