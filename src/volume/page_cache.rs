// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! A bounded LRU cache of decoded volume pages, keyed by
//! `(chapter_physical, page_within_chapter)` (§4.6). A miss enqueues a read
//! on the volume's read-thread pool (`super::store`) and the caller blocks
//! on the returned waiter until the read completes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::record_page::RecordPage;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub chapter_physical: u32,
    pub page_within_chapter: u32,
}

enum Slot {
    Loading,
    Ready(Arc<RecordPage>),
}

struct Inner {
    entries: HashMap<PageKey, Slot>,
    lru: Vec<PageKey>,
    capacity: usize,
}

/// Wraps a `Mutex` + `Condvar` pair so a cache miss can block the calling
/// zone worker until another thread finishes the read, matching the
/// "suspend the requesting zone worker on the page's waiter list" contract.
pub struct PageCache {
    inner: Mutex<Inner>,
    ready: Condvar,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                lru: Vec::new(),
                capacity: capacity.max(1),
            }),
            ready: Condvar::new(),
        }
    }

    fn touch(inner: &mut Inner, key: PageKey) {
        inner.lru.retain(|k| *k != key);
        inner.lru.push(key);
    }

    fn evict_if_needed(inner: &mut Inner) {
        while inner.entries.len() > inner.capacity {
            if let Some(victim) = inner.lru.first().copied() {
                inner.lru.remove(0);
                inner.entries.remove(&victim);
            } else {
                break;
            }
        }
    }

    /// Returns the cached page for `key`, loading it via `load` on a miss.
    /// Concurrent misses for the same key coalesce: only the first caller
    /// runs `load`; the rest block on the condvar until it publishes the
    /// result.
    pub fn get_or_load(&self, key: PageKey, load: impl FnOnce() -> RecordPage) -> Arc<RecordPage> {
        let mut inner = self.inner.lock();
        loop {
            match inner.entries.get(&key) {
                Some(Slot::Ready(page)) => {
                    let page = page.clone();
                    Self::touch(&mut inner, key);
                    return page;
                }
                Some(Slot::Loading) => {
                    self.ready.wait(&mut inner);
                }
                None => {
                    inner.entries.insert(key, Slot::Loading);
                    break;
                }
            }
        }
        drop(inner);
        let page = Arc::new(load());
        let mut inner = self.inner.lock();
        inner.entries.insert(key, Slot::Ready(page.clone()));
        Self::touch(&mut inner, key);
        Self::evict_if_needed(&mut inner);
        drop(inner);
        self.ready.notify_all();
        page
    }

    /// Atomically drops every cached page belonging to `chapter_physical`,
    /// used when that physical slot is about to be overwritten by a new
    /// chapter.
    pub fn invalidate_chapter(&self, chapter_physical: u32) {
        let mut inner = self.inner.lock();
        inner.entries.retain(|k, _| k.chapter_physical != chapter_physical);
        inner.lru.retain(|k| k.chapter_physical != chapter_physical);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_with(name: [u8; 16]) -> RecordPage {
        let mut p = RecordPage::new(4096, 26);
        p.push(name, vec![0u8; 10]).unwrap();
        p.finish()
    }

    #[test]
    fn miss_then_hit() {
        let cache = PageCache::new(2);
        let key = PageKey {
            chapter_physical: 0,
            page_within_chapter: 0,
        };
        let page = cache.get_or_load(key, || page_with([1u8; 16]));
        assert!(page.lookup(&[1u8; 16]).is_some());
        assert_eq!(cache.len(), 1);
        let page2 = cache.get_or_load(key, || panic!("should not reload on hit"));
        assert!(page2.lookup(&[1u8; 16]).is_some());
    }

    #[test]
    fn invalidate_drops_chapter_pages() {
        let cache = PageCache::new(4);
        let key = PageKey {
            chapter_physical: 3,
            page_within_chapter: 0,
        };
        cache.get_or_load(key, || page_with([2u8; 16]));
        assert_eq!(cache.len(), 1);
        cache.invalidate_chapter(3);
        assert!(cache.is_empty());
    }

    #[test]
    fn eviction_respects_capacity() {
        let cache = PageCache::new(1);
        let k0 = PageKey {
            chapter_physical: 0,
            page_within_chapter: 0,
        };
        let k1 = PageKey {
            chapter_physical: 1,
            page_within_chapter: 0,
        };
        cache.get_or_load(k0, || page_with([1u8; 16]));
        cache.get_or_load(k1, || page_with([2u8; 16]));
        assert_eq!(cache.len(), 1);
    }
}
