//! Sharded, deduplicating priority queue driving breadth-first traversal
//! with per-item priority (spec §4.5).

use crate::models::QueueItem;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

/// Heap entry ordered by `(depth asc, priority desc)`; ties among equal
/// keys are unordered (spec §4.5).
struct HeapEntry {
    key: (Reverse<u32>, i32),
    item: QueueItem,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in s.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Chooses shard count as a power of two scaled to expected capacity, per
/// §4.5 (`4` for `<10k`, `16` for `<100k`, `32` otherwise; `0` means
/// unbounded and defaults to `16`).
fn shard_count_for_capacity(capacity: usize) -> usize {
    match capacity {
        0 => 16,
        c if c < 10_000 => 4,
        c if c < 100_000 => 16,
        _ => 32,
    }
}

pub enum PushOutcome {
    Added,
    AlreadyPresent,
    AtCapacity,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrontierError {
    #[error("frontier is closed")]
    Closed,
}

/// Sharded priority queue. Each queue shard has its own lock; dedup is
/// performed by a separate array of URL-sets indexed by FNV-1a hash
/// modulo shard count, independent of which queue shard an item lands in
/// (reduces contention between pushers and the dedup check).
pub struct Frontier {
    shards: Vec<Mutex<BinaryHeap<HeapEntry>>>,
    dedup: Vec<Mutex<HashSet<String>>>,
    shard_count: usize,
    next_push_shard: AtomicUsize,
    total_len: AtomicUsize,
    capacity: usize,
    closed: AtomicBool,
    notify: Notify,
}

impl Frontier {
    pub fn new(capacity: usize) -> Self {
        Self::with_shard_count(shard_count_for_capacity(capacity), capacity)
    }

    /// Builds a frontier with an explicit shard count rather than one
    /// derived from `capacity`. Per spec §5, strict breadth-first order
    /// across all pops is only guaranteed when `shard_count == 1`; this
    /// constructor exists for callers (and tests) that need that
    /// guarantee instead of the sharded-for-throughput default.
    pub fn with_shard_count(shard_count: usize, capacity: usize) -> Self {
        let shard_count = shard_count.max(1);
        Frontier {
            shards: (0..shard_count).map(|_| Mutex::new(BinaryHeap::new())).collect(),
            dedup: (0..shard_count).map(|_| Mutex::new(HashSet::new())).collect(),
            shard_count,
            next_push_shard: AtomicUsize::new(0),
            total_len: AtomicUsize::new(0),
            capacity,
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn dedup_index(&self, url: &str) -> usize {
        (fnv1a(url) as usize) % self.shard_count
    }

    fn heap_key(item: &QueueItem) -> (Reverse<u32>, i32) {
        (Reverse(item.depth), item.priority)
    }

    /// Pushes one item. Silently drops the item if the frontier is at
    /// capacity (spec's deliberate back-pressure choice, §9 Open
    /// Questions) rather than returning an error.
    pub fn push(&self, item: QueueItem) -> Result<PushOutcome, FrontierError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FrontierError::Closed);
        }
        if self.capacity > 0 && self.total_len.load(Ordering::Acquire) >= self.capacity {
            return Ok(PushOutcome::AtCapacity);
        }

        let dedup_idx = self.dedup_index(&item.url);
        {
            let mut dedup = self.dedup[dedup_idx].lock().unwrap();
            if !dedup.insert(item.url.clone()) {
                return Ok(PushOutcome::AlreadyPresent);
            }
        }

        let push_idx =
            self.next_push_shard.fetch_add(1, Ordering::Relaxed) % self.shard_count;
        {
            let mut shard = self.shards[push_idx].lock().unwrap();
            shard.push(HeapEntry {
                key: Self::heap_key(&item),
                item,
            });
        }
        self.total_len.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_one();
        Ok(PushOutcome::Added)
    }

    /// Pushes many items, grouping the dedup check by hash shard and the
    /// insert by queue shard to amortize lock acquisition. Returns the
    /// count actually enqueued (dropped-for-capacity and duplicate items
    /// are excluded), so callers can detect silent drops without a new
    /// error variant.
    pub fn push_batch(&self, items: Vec<QueueItem>) -> Result<usize, FrontierError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FrontierError::Closed);
        }

        let mut by_queue_shard: Vec<Vec<HeapEntry>> =
            (0..self.shard_count).map(|_| Vec::new()).collect();
        let mut added = 0usize;

        for item in items {
            if self.capacity > 0 && self.total_len.load(Ordering::Acquire) + added >= self.capacity
            {
                break;
            }
            let dedup_idx = self.dedup_index(&item.url);
            let inserted = {
                let mut dedup = self.dedup[dedup_idx].lock().unwrap();
                dedup.insert(item.url.clone())
            };
            if !inserted {
                continue;
            }
            let push_idx =
                self.next_push_shard.fetch_add(1, Ordering::Relaxed) % self.shard_count;
            by_queue_shard[push_idx].push(HeapEntry {
                key: Self::heap_key(&item),
                item,
            });
            added += 1;
        }

        for (idx, entries) in by_queue_shard.into_iter().enumerate() {
            if entries.is_empty() {
                continue;
            }
            let mut shard = self.shards[idx].lock().unwrap();
            shard.extend(entries);
        }
        self.total_len.fetch_add(added, Ordering::AcqRel);
        if added > 0 {
            self.notify.notify_waiters();
        }
        Ok(added)
    }

    fn try_pop_one(&self, start: usize) -> Option<QueueItem> {
        for offset in 0..self.shard_count {
            let idx = (start + offset) % self.shard_count;
            let mut shard = self.shards[idx].lock().unwrap();
            if let Some(entry) = shard.pop() {
                drop(shard);
                let dedup_idx = self.dedup_index(&entry.item.url);
                self.dedup[dedup_idx].lock().unwrap().remove(&entry.item.url);
                self.total_len.fetch_sub(1, Ordering::AcqRel);
                return Some(entry.item);
            }
        }
        None
    }

    fn round_robin_start(&self) -> usize {
        self.next_push_shard.load(Ordering::Relaxed) % self.shard_count
    }

    /// Pops a single item starting the shard scan at a round-robin
    /// index. `Ok(None)` means empty (not closed); `Err(Closed)` once
    /// `close()` has been called and the frontier has drained.
    pub fn pop(&self) -> Result<Option<QueueItem>, FrontierError> {
        let item = self.try_pop_one(self.round_robin_start());
        if item.is_none() && self.closed.load(Ordering::Acquire) {
            return Err(FrontierError::Closed);
        }
        Ok(item)
    }

    /// Pops up to `n` items across shards, starting at a round-robin
    /// index.
    pub fn pop_batch(&self, n: usize) -> Result<Vec<QueueItem>, FrontierError> {
        let mut items = Vec::with_capacity(n);
        let start = self.round_robin_start();
        while items.len() < n {
            match self.try_pop_one(start) {
                Some(item) => items.push(item),
                None => break,
            }
        }
        if items.is_empty() && self.closed.load(Ordering::Acquire) {
            return Err(FrontierError::Closed);
        }
        Ok(items)
    }

    /// Tries `pop`; if empty, waits until an item is pushed or the
    /// frontier closes.
    pub async fn pop_wait(&self) -> Result<QueueItem, FrontierError> {
        loop {
            match self.pop()? {
                Some(item) => return Ok(item),
                None => {
                    let notified = self.notify.notified();
                    if self.is_empty() && !self.closed.load(Ordering::Acquire) {
                        notified.await;
                    }
                    if self.closed.load(Ordering::Acquire) && self.is_empty() {
                        return Err(FrontierError::Closed);
                    }
                }
            }
        }
    }

    /// Marks the frontier closed and wakes every waiter.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.total_len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn contains(&self, url: &str) -> bool {
        let idx = self.dedup_index(url);
        self.dedup[idx].lock().unwrap().contains(url)
    }

    /// Snapshot of all URLs currently queued, for introspection and
    /// state persistence.
    pub fn urls(&self) -> Vec<String> {
        self.dedup
            .iter()
            .flat_map(|shard| shard.lock().unwrap().iter().cloned().collect::<Vec<_>>())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(url: &str, depth: u32, priority: i32) -> QueueItem {
        let mut i = QueueItem::seed(url);
        i.depth = depth;
        i.priority = priority;
        i
    }

    #[test]
    fn test_dedup_on_push() {
        let f = Frontier::new(100);
        assert!(matches!(f.push(item("https://a.test/x", 0, 0)).unwrap(), PushOutcome::Added));
        assert!(matches!(
            f.push(item("https://a.test/x", 0, 0)).unwrap(),
            PushOutcome::AlreadyPresent
        ));
        assert_eq!(f.len(), 1);
    }

    #[test]
    fn test_pop_removes_from_dedup() {
        let f = Frontier::new(100);
        f.push(item("https://a.test/x", 0, 0)).unwrap();
        assert!(f.contains("https://a.test/x"));
        let popped = f.pop().unwrap().unwrap();
        assert_eq!(popped.url, "https://a.test/x");
        assert!(!f.contains("https://a.test/x"));
        assert_eq!(f.len(), 0);
    }

    #[test]
    fn test_depth_then_priority_ordering() {
        // Global (depth, priority) order across pops is only guaranteed
        // with a single shard (spec §5); the sharded default only
        // guarantees breadth-first within one shard.
        let f = Frontier::with_shard_count(1, 100);
        f.push(item("https://a.test/deep", 3, 100)).unwrap();
        f.push(item("https://a.test/shallow-low", 1, 0)).unwrap();
        f.push(item("https://a.test/shallow-high", 1, 50)).unwrap();

        let first = f.pop().unwrap().unwrap();
        assert_eq!(first.url, "https://a.test/shallow-high");
        let second = f.pop().unwrap().unwrap();
        assert_eq!(second.url, "https://a.test/shallow-low");
        let third = f.pop().unwrap().unwrap();
        assert_eq!(third.url, "https://a.test/deep");
    }

    #[test]
    fn test_push_batch_dedup_and_count() {
        let f = Frontier::new(100);
        let items = vec![
            item("https://a.test/1", 1, 0),
            item("https://a.test/2", 1, 0),
            item("https://a.test/1", 1, 0),
        ];
        let added = f.push_batch(items).unwrap();
        assert_eq!(added, 2);
        assert_eq!(f.len(), 2);
    }

    #[test]
    fn test_capacity_drops_silently() {
        let f = Frontier::new(1);
        assert!(matches!(f.push(item("https://a.test/1", 0, 0)).unwrap(), PushOutcome::Added));
        assert!(matches!(
            f.push(item("https://a.test/2", 0, 0)).unwrap(),
            PushOutcome::AtCapacity
        ));
        assert_eq!(f.len(), 1);
    }

    #[test]
    fn test_close_rejects_new_pushes() {
        let f = Frontier::new(100);
        f.close();
        assert!(f.push(item("https://a.test/1", 0, 0)).is_err());
        assert!(f.pop().is_err());
    }

    #[test]
    fn test_frontier_invariant_len_matches_dedup() {
        let f = Frontier::new(100);
        for i in 0..20 {
            f.push(item(&format!("https://a.test/{i}"), i % 4, 0)).unwrap();
        }
        let dedup_total: usize = f.dedup.iter().map(|s| s.lock().unwrap().len()).sum();
        assert_eq!(f.len(), dedup_total);
        assert_eq!(f.len(), 20);
    }

    #[tokio::test]
    async fn test_pop_wait_wakes_on_push() {
        let f = std::sync::Arc::new(Frontier::new(100));
        let f2 = f.clone();
        let handle = tokio::spawn(async move { f2.pop_wait().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        f.push(item("https://a.test/x", 0, 0)).unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("did not wake in time")
            .unwrap();
        assert_eq!(result.unwrap().url, "https://a.test/x");
    }

    #[tokio::test]
    async fn test_pop_wait_returns_closed() {
        let f = std::sync::Arc::new(Frontier::new(100));
        let f2 = f.clone();
        let handle = tokio::spawn(async move { f2.pop_wait().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        f.close();
        let result = tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("did not wake in time")
            .unwrap();
        assert!(matches!(result, Err(FrontierError::Closed)));
    }
}
