// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The in-memory staging area accepting writes until a chapter fills (§4.5).
//! One `OpenChapterZone` per concurrency zone; on close, every zone's slots
//! are merged (in zone order) into a sorted record page plus chapter index.

use crate::chapter_index::ChapterIndex;
use crate::error::Result;
use crate::geometry::{Geometry, RecordName};
use crate::record_page::{PageHeader, RecordPage};

#[derive(Clone)]
struct Slot {
    name: RecordName,
    data: Vec<u8>,
    occupied: bool,
}

/// A fixed-capacity open-addressed (linear probing) table from name to
/// metadata, owned by one zone.
pub struct OpenChapterZone {
    slots: Vec<Slot>,
    capacity: usize,
    len: usize,
}

impl OpenChapterZone {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![
                Slot {
                    name: [0u8; 16],
                    data: Vec::new(),
                    occupied: false,
                };
                capacity
            ],
            capacity,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len >= self.capacity
    }

    fn probe_index(&self, name: &RecordName) -> usize {
        let hash = u64::from_be_bytes(name[0..8].try_into().unwrap());
        (hash as usize) % self.capacity.max(1)
    }

    pub fn get(&self, name: &RecordName) -> Option<&[u8]> {
        let start = self.probe_index(name);
        for step in 0..self.capacity {
            let i = (start + step) % self.capacity;
            let slot = &self.slots[i];
            if !slot.occupied {
                return None;
            }
            if &slot.name == name {
                return Some(&slot.data);
            }
        }
        None
    }

    /// Inserts or updates `(name, data)`. Returns the remaining free
    /// capacity after the insert, or `0` if the zone was already full and
    /// the insert was refused.
    pub fn put(&mut self, name: RecordName, data: Vec<u8>) -> usize {
        let start = self.probe_index(&name);
        let mut first_free: Option<usize> = None;
        for step in 0..self.capacity {
            let i = (start + step) % self.capacity;
            let slot = &self.slots[i];
            if slot.occupied && slot.name == name {
                self.slots[i].data = data;
                return self.capacity - self.len;
            }
            if !slot.occupied && first_free.is_none() {
                first_free = Some(i);
            }
        }
        match first_free {
            Some(i) if self.len < self.capacity => {
                self.slots[i] = Slot {
                    name,
                    data,
                    occupied: true,
                };
                self.len += 1;
                self.capacity - self.len
            }
            _ => 0,
        }
    }

    /// Clears every slot in O(capacity), ready for the next chapter.
    pub fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.occupied = false;
        }
        self.len = 0;
    }

    fn occupied_in_slot_order(&self) -> impl Iterator<Item = (&RecordName, &[u8])> {
        self.slots
            .iter()
            .filter(|s| s.occupied)
            .map(|s| (&s.name, s.data.as_slice()))
    }
}

/// Merges every zone's live slots (zone 0 first, in slot order within each
/// zone, matching the deterministic collation contract of §4.5) into a
/// sorted record page plus chapter index.
pub fn collate(
    zones: &[OpenChapterZone],
    geometry: &Geometry,
    virtual_chapter: u64,
    nonce: u64,
    list_count: u32,
) -> Result<(RecordPage, ChapterIndex)> {
    let mut page = RecordPage::new(geometry.bytes_per_page, geometry.bytes_per_record);
    let mut chapter_index = ChapterIndex::new(geometry, list_count);
    for zone in zones {
        for (name, data) in zone.occupied_in_slot_order() {
            page.push(*name, data.to_vec())?;
        }
    }
    let page = page.finish();
    for (page_number, (name, _data)) in page.iter().enumerate() {
        chapter_index.put(name, page_number as u32)?;
    }
    let header = PageHeader {
        virtual_chapter,
        nonce,
        record_count: page.len() as u32,
    };
    let _ = header; // header is attached by the caller when writing to the volume
    Ok((page, chapter_index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_reset() {
        let mut zone = OpenChapterZone::new(8);
        let name = [4u8; 16];
        assert_eq!(zone.put(name, vec![1, 2, 3]), 7);
        assert_eq!(zone.get(&name), Some([1u8, 2, 3].as_slice()));
        zone.reset();
        assert!(zone.is_empty());
        assert_eq!(zone.get(&name), None);
    }

    #[test]
    fn full_zone_refuses_insert() {
        let mut zone = OpenChapterZone::new(2);
        zone.put([1u8; 16], vec![0]);
        zone.put([2u8; 16], vec![0]);
        assert!(zone.is_full());
        assert_eq!(zone.put([3u8; 16], vec![0]), 0);
    }

    #[test]
    fn collate_is_sorted_and_deterministic() {
        let geometry = Geometry::default();
        let mut zone_a = OpenChapterZone::new(8);
        let mut zone_b = OpenChapterZone::new(8);
        zone_a.put([5u8; 16], vec![0u8; 10]);
        zone_b.put([1u8; 16], vec![0u8; 10]);
        let (page, chapter_index) = collate(&[zone_a, zone_b], &geometry, 0, 0, 4).unwrap();
        assert_eq!(page.len(), 2);
        assert!(chapter_index.lookup(&[1u8; 16]).is_some());
        assert!(chapter_index.lookup(&[5u8; 16]).is_some());
    }
}
