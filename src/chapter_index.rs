// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Per-chapter delta index: name's chapter-address bits → page number within
//! the chapter. Built fresh for every chapter while it is open and persisted
//! into the chapter's index pages on close (§4.3).

use crate::delta::{DeltaIndex, DeltaZone};
use crate::error::Result;
use crate::geometry::{chapter_index_hi_bits, multiply_shift, Geometry, RecordName};

/// A single chapter's delta index, sized for `geometry.records_per_chapter()`
/// entries spread across `list_count` lists.
pub struct ChapterIndex {
    index: DeltaIndex,
    list_count: u32,
}

impl ChapterIndex {
    /// `bytes_per_page * record_pages_per_chapter / 4` is a conservative
    /// estimate of the bit-packed index region; chapter indexes are small
    /// relative to the record pages they describe.
    pub fn new(geometry: &Geometry, list_count: u32) -> Self {
        let size_bytes = (geometry.bytes_per_page as usize) * 4;
        let zone = DeltaZone::initialize(size_bytes, list_count, geometry.mean_delta, page_number_bits(geometry));
        Self {
            index: DeltaIndex::new(zone),
            list_count,
        }
    }

    fn list_of(&self, name: &RecordName) -> u32 {
        multiply_shift(chapter_index_hi_bits(name), self.list_count)
    }

    pub fn put(&mut self, name: &RecordName, page_number: u32) -> Result<()> {
        let list = self.list_of(name);
        self.index
            .put_record(list, chapter_index_hi_bits(name), name, page_number as u64)
    }

    pub fn lookup(&self, name: &RecordName) -> Option<u32> {
        let list = self.list_of(name);
        let cursor = self.index.get_record(list, chapter_index_hi_bits(name), name);
        (cursor.found && cursor.key_matches).then_some(cursor.payload as u32)
    }

    pub fn record_count(&self) -> u64 {
        self.index.zone().record_count
    }
}

fn page_number_bits(geometry: &Geometry) -> u32 {
    let max_page = geometry.record_pages_per_chapter.max(1);
    (32 - max_page.leading_zeros()).max(1)
}
