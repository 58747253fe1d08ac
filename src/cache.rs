//! Query result cache with TTL expiry and a write generation guard.

use std::{
    num::NonZeroUsize,
    sync::{
        Arc,
        Mutex,
        PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use lru::LruCache;
use serde::Serialize;

use crate::{
    config::CacheSettings,
    model::{
        SearchFilters,
        SearchOptions,
        SearchResult,
        SortKey,
        SpellingSuggestion,
        StrategyReport,
    },
    query::QuerySyntaxError,
};

/// The ranked, unpaginated answer to one query.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedQuery {
    pub results: Vec<SearchResult>,
    pub strategies: Vec<StrategyReport>,
    pub syntax_error: Option<QuerySyntaxError>,
    pub spelling_suggestions: Vec<SpellingSuggestion>,
    pub semantic_model: Option<String>,
}

struct Entry {
    value: Arc<CachedQuery>,
    created: Instant,
}

/// Options that change the ranked list; paging is applied after the cache.
#[derive(Serialize)]
struct KeyOptions<'a> {
    exact: bool,
    fuzzy: bool,
    semantic: bool,
    filters: &'a SearchFilters,
    sort: SortKey,
    topic: Option<&'a str>,
}

pub struct ResultCache {
    entries: Mutex<LruCache<String, Entry>>,
    ttl: Duration,
    generation: AtomicU64,
}

impl ResultCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            generation: AtomicU64::new(0),
        }
    }

    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self::new(settings.capacity, Duration::from_secs(settings.ttl_secs))
    }

    /// Cache key: normalized query plus the non-paging options.
    pub fn key(normalized_query: &str, options: &SearchOptions) -> String {
        let key_options = KeyOptions {
            exact: options.enable_exact,
            fuzzy: options.enable_fuzzy,
            semantic: options.enable_semantic,
            filters: &options.filters,
            sort: options.sort,
            topic: options.topic_path.as_deref().map(|p| p.trim_matches('/')),
        };
        let encoded = serde_json::to_string(&key_options).unwrap_or_default();
        format!("{normalized_query}\u{1f}{encoded}")
    }

    /// Current write generation. Capture it before computing a result.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &str) -> Option<Arc<CachedQuery>> {
        let mut entries =
            self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let expired = match entries.get(key) {
            Some(entry) if entry.created.elapsed() < self.ttl => {
                return Some(Arc::clone(&entry.value));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        None
    }

    /// Store `value` unless a write happened since `generation` was read.
    pub fn put(&self, key: String, value: CachedQuery, generation: u64) -> bool {
        let mut entries =
            self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::trace!("discarding result computed before a write");
            return false;
        }
        entries.put(
            key,
            Entry {
                value: Arc::new(value),
                created: Instant::now(),
            },
        );
        true
    }

    /// Drop every entry and advance the generation.
    pub fn invalidate_all(&self) {
        let mut entries =
            self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        self.generation.fetch_add(1, Ordering::SeqCst);
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("ttl", &self.ttl)
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value() -> CachedQuery {
        CachedQuery {
            results: Vec::new(),
            strategies: Vec::new(),
            syntax_error: None,
            spelling_suggestions: Vec::new(),
            semantic_model: None,
        }
    }

    #[test]
    fn hit_after_put() {
        let cache = ResultCache::new(4, Duration::from_secs(60));
        assert!(cache.get("q").is_none());
        assert!(cache.put("q".into(), value(), cache.generation()));
        assert!(cache.get("q").is_some());
    }

    #[test]
    fn entries_expire() {
        let cache = ResultCache::new(4, Duration::from_millis(20));
        cache.put("q".into(), value(), cache.generation());
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get("q").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn stale_generation_is_discarded() {
        let cache = ResultCache::new(4, Duration::from_secs(60));
        let generation = cache.generation();
        cache.invalidate_all();
        assert!(!cache.put("q".into(), value(), generation));
        assert!(cache.get("q").is_none());
    }

    #[test]
    fn invalidate_clears_everything() {
        let cache = ResultCache::new(4, Duration::from_secs(60));
        cache.put("a".into(), value(), cache.generation());
        cache.put("b".into(), value(), cache.generation());
        cache.invalidate_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_is_bounded() {
        let cache = ResultCache::new(2, Duration::from_secs(60));
        for key in ["a", "b", "c"] {
            cache.put(key.into(), value(), cache.generation());
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn key_ignores_paging() {
        let base = SearchOptions::default();
        let paged = SearchOptions {
            page: 3,
            page_size: 5,
            ..SearchOptions::default()
        };
        assert_eq!(ResultCache::key("q", &base), ResultCache::key("q", &paged));

        let sorted = SearchOptions {
            sort: SortKey::Date,
            ..SearchOptions::default()
        };
        assert_ne!(ResultCache::key("q", &base), ResultCache::key("q", &sorted));
    }
}
