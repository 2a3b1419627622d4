use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::encoding::keycode::Locus;

/// Default number of decoded blocks a blocker keeps.
pub const READ_BLOCK_CACHE_SIZE: usize = 20;

/// A decoded block that knows which queries it can answer.
pub trait CacheEntry {
    fn good_to_read(&self, key: &Locus, end: Option<u32>) -> bool;
}

/// Strict LRU list of decoded read blocks, most recently used first.
///
/// Entries are found by predicate rather than by key, so lookup is a
/// linear scan; capacities are small. The lock is held only for the scan
/// or the insert, never across block I/O.
pub struct ReadBlockCache<H> {
    capacity: usize,
    entries: Mutex<VecDeque<Arc<H>>>,
    stats: Stats,
}

impl<H: CacheEntry> ReadBlockCache<H> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        ReadBlockCache {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            stats: Stats::new(),
        }
    }

    /// Returns the first block able to answer `(key, end)` and makes it
    /// the most recently used.
    pub fn pick(&self, key: &Locus, end: Option<u32>) -> Option<Arc<H>> {
        let mut entries = self.entries.lock();
        match entries.iter().position(|h| h.good_to_read(key, end)) {
            Some(idx) => {
                let handle = entries.remove(idx)?;
                entries.push_front(handle.clone());
                self.stats.hit();
                Some(handle)
            }
            None => {
                self.stats.miss();
                None
            }
        }
    }

    /// Inserts a block as most recently used, evicting from the back.
    pub fn push(&self, handle: Arc<H>) {
        let mut entries = self.entries.lock();
        entries.push_front(handle);
        entries.truncate(self.capacity);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// (hits, misses)
    pub fn stats(&self) -> (usize, usize) {
        self.stats.get()
    }

    /// Snapshot of the cached handles, most recent first.
    pub fn snapshot(&self) -> Vec<Arc<H>> {
        self.entries.lock().iter().cloned().collect()
    }
}

struct Stats {
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl Stats {
    fn new() -> Self {
        Stats {
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};

    use proptest::prelude::*;

    use super::*;

    /// Answers positions in `[start, end)` on chr1.
    #[derive(Debug, PartialEq)]
    struct Span {
        start: u32,
        end: u32,
    }

    impl CacheEntry for Span {
        fn good_to_read(&self, key: &Locus, end: Option<u32>) -> bool {
            end.is_none() && self.start <= key.pos && key.pos < self.end
        }
    }

    fn span(start: u32, end: u32) -> Arc<Span> {
        Arc::new(Span { start, end })
    }

    fn at(pos: u32) -> Locus {
        Locus::new("chr1", pos).unwrap()
    }

    fn starts(cache: &ReadBlockCache<Span>) -> Vec<u32> {
        cache.snapshot().iter().map(|h| h.start).collect()
    }

    #[test]
    fn test_push_and_pick() {
        let cache = ReadBlockCache::new(2);
        cache.push(span(0, 10));
        cache.push(span(10, 20));

        assert_eq!(cache.pick(&at(5), None).unwrap().start, 0);
        assert_eq!(cache.pick(&at(15), None).unwrap().start, 10);
        assert!(cache.pick(&at(25), None).is_none());
        assert!(cache.pick(&at(5), Some(8)).is_none());
    }

    #[test]
    fn test_push_removes_oldest() {
        let cache = ReadBlockCache::new(2);
        for start in [0, 10, 20, 30] {
            cache.push(span(start, start + 10));
        }

        assert_eq!(starts(&cache), vec![30, 20]);
        assert!(cache.pick(&at(5), None).is_none());
    }

    #[test]
    fn test_pick_promotes() {
        let cache = ReadBlockCache::new(3);
        for start in [0, 10, 20] {
            cache.push(span(start, start + 10));
        }
        cache.pick(&at(3), None).unwrap();
        assert_eq!(starts(&cache), vec![0, 20, 10]);

        // 10 is now least recently used
        cache.push(span(30, 40));
        assert_eq!(starts(&cache), vec![30, 0, 20]);
    }

    #[test]
    fn test_no_memory_leaks() {
        static DROP_COUNT: AtomicUsize = AtomicUsize::new(0);

        struct DropCounter;

        impl CacheEntry for DropCounter {
            fn good_to_read(&self, _key: &Locus, _end: Option<u32>) -> bool {
                false
            }
        }

        impl Drop for DropCounter {
            fn drop(&mut self) {
                DROP_COUNT.fetch_add(1, SeqCst);
            }
        }

        let n = 100;
        for _ in 0..n {
            let cache = ReadBlockCache::new(20);
            for _ in 0..n {
                cache.push(Arc::new(DropCounter));
            }
        }
        assert_eq!(DROP_COUNT.load(SeqCst), n * n);
    }

    #[test]
    fn test_hit_ratio() {
        let cap = 10;
        let cache = ReadBlockCache::new(cap);

        for i in 0..cap as u32 {
            cache.push(span(i * 10, i * 10 + 10));
        }
        for i in 0..cap as u32 {
            assert!(cache.pick(&at(i * 10 + 1), None).is_some());
        }
        assert!(cache.pick(&at(1000), None).is_none());

        assert_eq!(cache.stats(), (cap, 1));
    }

    #[test]
    fn test_concurrent_pick_and_push() {
        let cache = Arc::new(ReadBlockCache::new(4));
        let threads: Vec<_> = (0..4u32)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..100u32 {
                        let start = (t * 100 + i) * 10;
                        if cache.pick(&at(start), None).is_none() {
                            cache.push(span(start, start + 10));
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(cache.len(), 4);
    }

    proptest! {
        #[test]
        fn holds_most_recent_handles(cap in 1usize..8, ops in prop::collection::vec((any::<bool>(), 0u32..20), 0..60)) {
            let cache: ReadBlockCache<Span> = ReadBlockCache::new(cap);
            let mut model: VecDeque<u32> = VecDeque::new();
            for (is_pick, slot) in ops {
                let start = slot * 10;
                if is_pick {
                    let hit = cache.pick(&at(start), None);
                    match model.iter().position(|s| *s == start) {
                        Some(idx) => {
                            prop_assert_eq!(hit.map(|h| h.start), Some(start));
                            model.remove(idx);
                            model.push_front(start);
                        }
                        None => prop_assert!(hit.is_none()),
                    }
                } else {
                    cache.push(span(start, start + 10));
                    model.push_front(start);
                    model.truncate(cap);
                }
            }
            prop_assert_eq!(starts(&cache), model.into_iter().collect::<Vec<_>>());
        }

        #[test]
        fn pick_only_returns_valid_handles(pos in 0u32..300, end in prop::option::of(0u32..300)) {
            let cache = ReadBlockCache::new(5);
            for start in [0, 50, 100, 150, 200] {
                cache.push(span(start, start + 50));
            }
            if let Some(handle) = cache.pick(&at(pos), end) {
                prop_assert!(handle.good_to_read(&at(pos), end));
            }
        }
    }
}
