// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The on-disk rotating log of chapters: persistent storage, bounded LRU
//! page cache, read-thread pool, and boundary discovery (§4.6).

pub mod boundary;
pub mod page_cache;
pub mod store;

pub use boundary::{find_volume_chapter_boundaries, ChapterRemap, ProbeResult};
pub use page_cache::{PageCache, PageKey};
pub use store::Volume;
