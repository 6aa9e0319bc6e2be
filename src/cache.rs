use std::collections::HashMap;
use std::time::{Duration, Instant};

use polars::prelude::DataFrame;

#[derive(Clone)]
struct CachedFrame {
    frame: DataFrame,
    created_at: Instant,
    ttl: Duration,
}

impl CachedFrame {
    fn is_fresh(&self) -> bool {
        self.created_at.elapsed() <= self.ttl
    }
}

/// Query results keyed by statement and bound parameters, each with its own TTL.
pub struct QueryCache {
    max_entries: usize,
    entries: HashMap<String, CachedFrame>,
}

impl QueryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            entries: HashMap::new(),
        }
    }

    pub fn get(&mut self, key: &str) -> Option<DataFrame> {
        self.entries.retain(|_, v| v.is_fresh());
        self.entries.get(key).map(|v| v.frame.clone())
    }

    pub fn insert(&mut self, key: String, frame: DataFrame, ttl: Duration) {
        self.entries.retain(|_, v| v.is_fresh());
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&key) {
            if let Some(victim) = self
                .entries
                .iter()
                .min_by_key(|(_, v)| v.created_at)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&victim);
            }
        }
        self.entries.insert(
            key,
            CachedFrame {
                frame,
                created_at: Instant::now(),
                ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::df;

    fn frame(v: i64) -> DataFrame {
        df!("v" => [v]).unwrap()
    }

    #[test]
    fn hit_until_expiry() {
        let mut cache = QueryCache::new(4);
        cache.insert("a".into(), frame(1), Duration::from_secs(60));
        assert!(cache.get("a").unwrap().equals(&frame(1)));

        cache.insert("b".into(), frame(2), Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("b").is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut cache = QueryCache::new(2);
        cache.insert("a".into(), frame(1), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("b".into(), frame(2), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("c".into(), frame(3), Duration::from_secs(60));
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }
}
