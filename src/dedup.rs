//! Seen-URL filter and content-hash equivalence map (spec §4.2).
//!
//! Two-level structure: a bloom filter as a fast negative test, backed
//! by an exact set that resolves bloom false positives. Sharded so that
//! concurrent readers don't serialize behind a single lock.

use bloomfilter::Bloom;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

const BLOOM_ITEMS: usize = 100_000;
const BLOOM_FP_RATE: f64 = 0.001;
const SHARD_COUNT: usize = 16;

struct Shard {
    bloom: Bloom<String>,
    exact: HashSet<String>,
    /// normalized_url -> content_hash
    hash_by_url: HashMap<String, String>,
    /// content_hash -> first url that produced it
    url_by_hash: HashMap<String, String>,
}

impl Shard {
    fn new() -> Self {
        Shard {
            bloom: Bloom::new_for_fp_rate(BLOOM_ITEMS / SHARD_COUNT, BLOOM_FP_RATE)
                .expect("bloom filter parameters are always valid"),
            exact: HashSet::new(),
            hash_by_url: HashMap::new(),
            url_by_hash: HashMap::new(),
        }
    }
}

fn shard_index(url: &str) -> usize {
    fnv1a(url) as usize % SHARD_COUNT
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in s.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Two-level seen-URL filter plus a content-hash equivalence map.
///
/// `has_seen(x)` holds iff `x` was added; bloom false positives are
/// always resolved against the exact set, so there are never false
/// positives observable through this type's API.
pub struct Deduplicator {
    shards: Vec<Mutex<Shard>>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Deduplicator {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(Shard::new())).collect(),
        }
    }

    /// Records `url` as seen. Idempotent.
    pub fn add(&self, url: &str) {
        let mut shard = self.shards[shard_index(url)].lock().unwrap();
        shard.bloom.set(&url.to_string());
        shard.exact.insert(url.to_string());
    }

    pub fn has_seen(&self, url: &str) -> bool {
        let shard = self.shards[shard_index(url)].lock().unwrap();
        if !shard.bloom.check(&url.to_string()) {
            return false;
        }
        shard.exact.contains(url)
    }

    /// Total number of distinct URLs recorded across all shards.
    pub fn count(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().exact.len()).sum()
    }

    /// Every URL recorded as seen, across all shards — used to populate
    /// a `CrawlerState` snapshot's `visited_urls` (spec §6.5).
    pub fn urls(&self) -> Vec<String> {
        self.shards
            .iter()
            .flat_map(|s| s.lock().unwrap().exact.iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn add_batch(&self, urls: &[String]) {
        for url in urls {
            self.add(url);
        }
    }

    /// Merges another deduplicator's state into this one (e.g. when
    /// resuming from a persisted snapshot).
    pub fn merge(&self, other: &Deduplicator) {
        for other_shard in &other.shards {
            let other_shard = other_shard.lock().unwrap();
            for url in &other_shard.exact {
                self.add(url);
            }
            for (url, hash) in &other_shard.hash_by_url {
                self.set_content_hash(url, hash);
            }
        }
    }

    /// Associates `url` with `digest` for near-duplicate detection.
    pub fn set_content_hash(&self, url: &str, digest: &str) {
        let mut shard = self.shards[shard_index(url)].lock().unwrap();
        shard.hash_by_url.insert(url.to_string(), digest.to_string());
        shard
            .url_by_hash
            .entry(digest.to_string())
            .or_insert_with(|| url.to_string());
    }

    /// Returns the URL that first produced `digest`, if it differs from
    /// `url` and `digest` has already been seen — i.e. `url` is a
    /// near-duplicate of an already-processed page.
    ///
    /// `url_by_hash` is keyed on the URL's own shard, not the digest's,
    /// so this scans all shards; content-hash lookups are rare relative
    /// to `has_seen` and this keeps digest ownership local to wherever
    /// the producing URL happened to land.
    pub fn has_duplicate_content(&self, url: &str, digest: &str) -> Option<String> {
        for shard in &self.shards {
            let shard = shard.lock().unwrap();
            if let Some(existing) = shard.url_by_hash.get(digest) {
                if existing != url {
                    return Some(existing.clone());
                }
            }
        }
        None
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_seen_after_add() {
        let dedup = Deduplicator::new();
        assert!(!dedup.has_seen("https://a.test/x"));
        dedup.add("https://a.test/x");
        assert!(dedup.has_seen("https://a.test/x"));
        assert!(!dedup.has_seen("https://a.test/y"));
    }

    #[test]
    fn test_count_and_batch() {
        let dedup = Deduplicator::new();
        dedup.add_batch(&[
            "https://a.test/1".to_string(),
            "https://a.test/2".to_string(),
            "https://a.test/1".to_string(),
        ]);
        assert_eq!(dedup.count(), 2);
    }

    #[test]
    fn test_content_hash_duplicate_detection() {
        let dedup = Deduplicator::new();
        dedup.set_content_hash("https://a.test/1", "deadbeef");
        assert_eq!(dedup.has_duplicate_content("https://a.test/1", "deadbeef"), None);
        assert_eq!(
            dedup.has_duplicate_content("https://a.test/2", "deadbeef"),
            Some("https://a.test/1".to_string())
        );
    }

    #[test]
    fn test_merge() {
        let a = Deduplicator::new();
        a.add("https://a.test/1");
        let b = Deduplicator::new();
        b.add("https://a.test/2");
        a.merge(&b);
        assert!(a.has_seen("https://a.test/1"));
        assert!(a.has_seen("https://a.test/2"));
    }
}
