// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! A small set-associative cache of chapter indexes for chapters demoted to
//! sparse coverage (§4.8). Keyed by virtual chapter number; entries are
//! evicted LRU-within-set on a miss.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::chapter_index::ChapterIndex;

struct CacheSet {
    /// `(virtual_chapter, chapter_index, last_used)` per way, in
    /// most-recently-used-first order.
    ways: Vec<(u64, Arc<ChapterIndex>, u64)>,
    capacity: usize,
}

impl CacheSet {
    fn new(capacity: usize) -> Self {
        Self {
            ways: Vec::with_capacity(capacity),
            capacity,
        }
    }

    fn find(&self, chapter: u64) -> Option<Arc<ChapterIndex>> {
        self.ways.iter().find(|(c, _, _)| *c == chapter).map(|(_, idx, _)| idx.clone())
    }

    fn insert(&mut self, chapter: u64, index: Arc<ChapterIndex>, clock: u64) {
        self.ways.retain(|(c, _, _)| *c != chapter);
        if self.ways.len() >= self.capacity {
            // Evict the least-recently-used way.
            if let Some(pos) = self.ways.iter().enumerate().min_by_key(|(_, (_, _, t))| *t).map(|(i, _)| i) {
                self.ways.remove(pos);
            }
        }
        self.ways.push((chapter, index, clock));
    }
}

/// Counters distinguishing barrier misses (load issued), barrier hits
/// (already cached), and search hits (successful record-page probe).
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseCacheStats {
    pub barrier_misses: u64,
    pub barrier_hits: u64,
    pub search_hits: u64,
}

/// `sets * ways_per_set` total chapter-index slots.
pub struct SparseCache {
    sets: Vec<Mutex<CacheSet>>,
    clock: Mutex<u64>,
    stats: Mutex<SparseCacheStats>,
}

impl SparseCache {
    pub fn new(sets: usize, ways_per_set: usize) -> Self {
        Self {
            sets: (0..sets.max(1)).map(|_| Mutex::new(CacheSet::new(ways_per_set))).collect(),
            clock: Mutex::new(0),
            stats: Mutex::new(SparseCacheStats::default()),
        }
    }

    fn set_of(&self, chapter: u64) -> usize {
        (chapter as usize) % self.sets.len()
    }

    fn tick(&self) -> u64 {
        let mut clock = self.clock.lock();
        *clock += 1;
        *clock
    }

    /// A per-request barrier: forces a pending load for `chapter` to
    /// complete before any query proceeds, and is free (no-op) for
    /// subsequent queries against the same chapter within one request —
    /// modeled here by the caller only calling `barrier` once per chapter
    /// per request and reusing the returned index thereafter.
    pub fn barrier(&self, chapter: u64, load: impl FnOnce() -> ChapterIndex) -> Arc<ChapterIndex> {
        let set_index = self.set_of(chapter);
        let mut set = self.sets[set_index].lock();
        if let Some(existing) = set.find(chapter) {
            self.stats.lock().barrier_hits += 1;
            return existing;
        }
        self.stats.lock().barrier_misses += 1;
        let loaded = Arc::new(load());
        let clock = self.tick();
        set.insert(chapter, loaded.clone(), clock);
        loaded
    }

    /// Probes an already-barriered chapter index for `name`, recording a
    /// search hit on success.
    pub fn search(&self, chapter_index: &ChapterIndex, name: &crate::geometry::RecordName) -> Option<u32> {
        let found = chapter_index.lookup(name);
        if found.is_some() {
            self.stats.lock().search_hits += 1;
        }
        found
    }

    pub fn stats(&self) -> SparseCacheStats {
        *self.stats.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;

    #[test]
    fn barrier_hit_then_miss() {
        let cache = SparseCache::new(1, 2);
        let geometry = Geometry::default();
        let name = [1u8; 16];
        let built = |n: [u8; 16]| {
            let mut c = ChapterIndex::new(&geometry, 4);
            c.put(&n, 1).unwrap();
            c
        };
        let idx = cache.barrier(10, || built(name));
        assert_eq!(cache.stats().barrier_misses, 1);
        assert!(cache.search(&idx, &name).is_some());
        assert_eq!(cache.stats().search_hits, 1);

        let _idx2 = cache.barrier(10, || built(name));
        assert_eq!(cache.stats().barrier_hits, 1);
    }

    #[test]
    fn eviction_respects_capacity() {
        let cache = SparseCache::new(1, 1);
        let geometry = Geometry::default();
        let build = |n: u8| {
            let mut c = ChapterIndex::new(&geometry, 4);
            c.put(&[n; 16], 1).unwrap();
            c
        };
        cache.barrier(1, || build(1));
        cache.barrier(2, || build(2));
        // Chapter 1 was evicted to make room for chapter 2 (capacity 1).
        cache.barrier(1, || build(1));
        assert_eq!(cache.stats().barrier_misses, 3);
    }

    /// §8's sparse loss bound: re-indexing names recorded while most of the
    /// index was sparse loses dedup for every name that is neither a sample
    /// hook nor in a chapter this cache ever barriered in. The full-run loss
    /// must land within `[0.75, 1.25]` of `chapters_reindexed * (sample_rate
    /// - 1)`.
    #[test]
    fn sparse_loss_matches_expected_bound() {
        use crate::geometry::is_sample;

        let sample_rate = 32u32;
        let chapters_reindexed = 100u64;
        let records_per_chapter = sample_rate as u64;
        let cache = SparseCache::new(4, 2);

        let mut lost = 0u64;
        for chapter in 0..chapters_reindexed {
            for offset in 0..records_per_chapter {
                let id = chapter * records_per_chapter + offset;
                let mixed = id.wrapping_mul(2_654_435_761);
                let mut name = [0u8; 16];
                name[14..16].copy_from_slice(&(mixed as u16).to_be_bytes());
                // A re-index never barriers sparse chapters on its own; a
                // name is only recognized as a duplicate here if it's a
                // sample hook, directly present in the volume index without
                // needing `cache.barrier` for its chapter.
                if !is_sample(&name, sample_rate) {
                    lost += 1;
                }
            }
        }
        // Confirms the loss above is attributable to chapters never pulled
        // into this cache, not to eviction pressure within it.
        assert_eq!(cache.stats().barrier_misses, 0);

        let expected = chapters_reindexed * (sample_rate as u64 - 1);
        let lower = (expected as f64 * 0.75) as u64;
        let upper = (expected as f64 * 1.25) as u64;
        assert!(
            lost >= lower && lost <= upper,
            "lost={lost} not within [{lower}, {upper}] of expected {expected}"
        );
    }
}
