use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use crate::model::tag::Tag;

/// Maximum number of cached search results
pub const SEARCH_CACHE_LIMIT: usize = 50;

/// Read cache in front of the tag list.
///
/// Staleness policy: every write calls `invalidate`, and the next read
/// calls `refresh` with the authoritative list. Nothing is updated
/// incrementally.
#[derive(Debug, Default)]
pub struct TagCache {
    tags: Option<Vec<Tag>>,
    /// Insertion-ordered so the oldest query is evicted first
    search: IndexMap<String, Vec<Tag>>,
    by_usage: Option<Vec<Tag>>,
    last_refresh: Option<DateTime<Utc>>,
}

impl TagCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidate(&mut self) {
        self.tags = None;
        self.search.clear();
        self.by_usage = None;
    }

    pub fn refresh(&mut self, tags: &[Tag]) {
        self.invalidate();
        self.tags = Some(tags.to_vec());
        self.last_refresh = Some(Utc::now());
    }

    pub fn is_fresh(&self) -> bool {
        self.tags.is_some()
    }

    pub fn tags(&self) -> Option<&[Tag]> {
        self.tags.as_deref()
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.last_refresh
    }

    pub fn search(&self, key: &str) -> Option<&[Tag]> {
        self.search.get(key).map(Vec::as_slice)
    }

    pub fn store_search(&mut self, key: String, results: Vec<Tag>) {
        if !self.search.contains_key(&key) && self.search.len() >= SEARCH_CACHE_LIMIT {
            self.search.shift_remove_index(0);
        }
        self.search.insert(key, results);
    }

    pub fn search_len(&self) -> usize {
        self.search.len()
    }

    pub fn by_usage(&self) -> Option<&[Tag]> {
        self.by_usage.as_deref()
    }

    pub fn store_by_usage(&mut self, tags: Vec<Tag>) {
        self.by_usage = Some(tags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(id: &str) -> Tag {
        Tag::new(id.into(), id.into(), "#374151".into(), String::new(), Utc::now())
    }

    #[test]
    fn refresh_then_invalidate() {
        let mut cache = TagCache::new();
        assert!(!cache.is_fresh());
        cache.refresh(&[tag("a")]);
        assert!(cache.is_fresh());
        assert_eq!(cache.tags().map(|t| t.len()), Some(1));
        assert!(cache.last_refresh().is_some());

        cache.store_search("a".into(), vec![tag("a")]);
        cache.store_by_usage(vec![tag("a")]);
        cache.invalidate();
        assert!(cache.tags().is_none());
        assert!(cache.search("a").is_none());
        assert!(cache.by_usage().is_none());
    }

    #[test]
    fn search_cache_evicts_oldest() {
        let mut cache = TagCache::new();
        for i in 0..SEARCH_CACHE_LIMIT {
            cache.store_search(format!("q{}", i), Vec::new());
        }
        assert_eq!(cache.search_len(), SEARCH_CACHE_LIMIT);

        cache.store_search("extra".into(), Vec::new());
        assert_eq!(cache.search_len(), SEARCH_CACHE_LIMIT);
        assert!(cache.search("q0").is_none());
        assert!(cache.search("q1").is_some());
        assert!(cache.search("extra").is_some());
    }

    #[test]
    fn restoring_a_key_does_not_evict() {
        let mut cache = TagCache::new();
        for i in 0..SEARCH_CACHE_LIMIT {
            cache.store_search(format!("q{}", i), Vec::new());
        }
        cache.store_search("q5".into(), vec![tag("x")]);
        assert!(cache.search("q0").is_some());
        assert_eq!(cache.search("q5").map(|r| r.len()), Some(1));
    }
}
