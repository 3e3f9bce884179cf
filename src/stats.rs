// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Process-wide mutable state is limited to statistics sinks (§9); every
//! counter here is a per-session atomic, not a global.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters accumulated over a session's lifetime. Cheap to update from any
/// zone worker; `snapshot` is the only place ordering matters, and relaxed
/// loads are fine since callers only want an approximate point-in-time view.
#[derive(Default)]
pub struct SessionStats {
    pub discard_count: AtomicU64,
    pub early_flushes: AtomicU64,
    pub overflow_count: AtomicU64,
    pub rebalance_count: AtomicU64,
    pub collision_count: AtomicU64,
    pub record_count: AtomicU64,
    pub sparse_barrier_misses: AtomicU64,
    pub sparse_barrier_hits: AtomicU64,
    pub sparse_search_hits: AtomicU64,
    pub chapters_replayed: AtomicU64,
    pub posts_found: AtomicU64,
    pub posts_not_found: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub discard_count: u64,
    pub early_flushes: u64,
    pub overflow_count: u64,
    pub rebalance_count: u64,
    pub collision_count: u64,
    pub record_count: u64,
    pub sparse_barrier_misses: u64,
    pub sparse_barrier_hits: u64,
    pub sparse_search_hits: u64,
    pub chapters_replayed: u64,
    pub posts_found: u64,
    pub posts_not_found: u64,
}

impl SessionStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            discard_count: self.discard_count.load(Ordering::Relaxed),
            early_flushes: self.early_flushes.load(Ordering::Relaxed),
            overflow_count: self.overflow_count.load(Ordering::Relaxed),
            rebalance_count: self.rebalance_count.load(Ordering::Relaxed),
            collision_count: self.collision_count.load(Ordering::Relaxed),
            record_count: self.record_count.load(Ordering::Relaxed),
            sparse_barrier_misses: self.sparse_barrier_misses.load(Ordering::Relaxed),
            sparse_barrier_hits: self.sparse_barrier_hits.load(Ordering::Relaxed),
            sparse_search_hits: self.sparse_search_hits.load(Ordering::Relaxed),
            chapters_replayed: self.chapters_replayed.load(Ordering::Relaxed),
            posts_found: self.posts_found.load(Ordering::Relaxed),
            posts_not_found: self.posts_not_found.load(Ordering::Relaxed),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let stats = SessionStats::default();
        SessionStats::incr(&stats.discard_count);
        SessionStats::incr(&stats.discard_count);
        assert_eq!(stats.snapshot().discard_count, 2);
    }
}
