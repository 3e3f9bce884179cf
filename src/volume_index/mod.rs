// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Name → virtual-chapter map, sharded into zones (§4.7). Each zone owns a
//! fully independent `DeltaIndex`, which already gives "mutable without
//! locking against others" for free — simpler than slicing one shared list
//! space across zones and equivalent in the property that matters (no zone
//! ever touches another's delta lists). Noted as a resolved Open Question
//! in `DESIGN.md`.

use serde::{Deserialize, Serialize};

use crate::delta::{DeltaIndex, DeltaZone};
use crate::error::{Error, Result};
use crate::geometry::{is_sample, multiply_shift, volume_index_hi_bits, Geometry, RecordName};

/// A cursor-bearing lookup result. `put`/`remove`/`set_chapter` assume no
/// intervening mutation happened on the same zone's list since this record
/// was produced by `get_volume_index_record`.
#[derive(Clone, Copy, Debug)]
pub struct VolumeIndexRecord {
    pub name: RecordName,
    pub found: bool,
    pub virtual_chapter: u64,
    pub is_collision: bool,
    list_index: u32,
    key: u64,
}

/// One zone's shard of the volume index, called only from that zone's
/// worker thread (§4.9).
#[derive(Serialize, Deserialize)]
pub struct VolumeIndexZone {
    index: DeltaIndex,
    list_count: u32,
    oldest_virtual_chapter: u64,
    newest_virtual_chapter: u64,
    pub discard_count: u64,
    pub early_flushes: u64,
}

/// Width of a volume-index entry's payload: the virtual chapter number.
/// Deliberately wider than `Geometry::payload_bits` (which sizes a generic
/// delta-list payload such as the chapter index's page number) since a
/// virtual chapter is a monotonic, never-reset 64-bit counter and the
/// index must keep storing absolute numbers even after trillions of
/// chapters have rolled by. Noted in `DESIGN.md`.
const VOLUME_INDEX_PAYLOAD_BITS: u32 = 40;

/// Conservative bits-per-entry estimate (collision-flag + escape delta +
/// payload + full name) used to size a zone's delta zone from geometry.
fn entry_bits_estimate(_geometry: &Geometry) -> u64 {
    1 + 1 + 64 + VOLUME_INDEX_PAYLOAD_BITS as u64 + 128
}

impl VolumeIndexZone {
    pub fn new(geometry: &Geometry, zone_count: u32, list_count: u32) -> Self {
        let total_records = geometry.records_per_chapter() as u64 * geometry.chapters_per_volume as u64;
        let zone_records = total_records / zone_count.max(1) as u64;
        let total_bits = zone_records * entry_bits_estimate(geometry) * 5 / 4; // 25% slack
        let size_bytes = ((total_bits / 8) as usize).max(4096);
        let zone = DeltaZone::initialize(size_bytes, list_count, geometry.mean_delta, VOLUME_INDEX_PAYLOAD_BITS);
        Self::from_delta_index(DeltaIndex::new(zone))
    }

    /// Wraps an already-sized `DeltaIndex` directly, bypassing the
    /// geometry-driven sizing in `new`. Used by tests that need to control
    /// the zone's exact bit capacity.
    fn from_delta_index(index: DeltaIndex) -> Self {
        let list_count = index.zone().list_count();
        Self {
            index,
            list_count,
            oldest_virtual_chapter: 0,
            newest_virtual_chapter: 0,
            discard_count: 0,
            early_flushes: 0,
        }
    }

    fn list_of(&self, key: u64) -> u32 {
        multiply_shift(key, self.list_count)
    }

    pub fn oldest_virtual_chapter(&self) -> u64 {
        self.oldest_virtual_chapter
    }

    pub fn newest_virtual_chapter(&self) -> u64 {
        self.newest_virtual_chapter
    }

    pub fn record_count(&self) -> u64 {
        self.index.zone().record_count
    }

    pub fn collision_count(&self) -> u64 {
        self.index.zone().collision_count
    }

    pub fn memory_used(&self) -> u64 {
        self.index.zone().memory_used()
    }

    /// Count of rebalances that found no room at all and left the zone
    /// unchanged; early-flushing an old entry (`early_flushes`) is expected
    /// to keep this at zero even past nominal capacity.
    pub fn overflow_count(&self) -> u64 {
        self.index.zone().overflow_count
    }

    /// Pure lookup; side-effect free. A stale (invalidated) entry is
    /// reported as not found; it is only actually removed as a side effect
    /// of the next `put_volume_index_record` on the same list.
    pub fn get_volume_index_record(&self, name: &RecordName) -> VolumeIndexRecord {
        let key = volume_index_hi_bits(name);
        let list_index = self.list_of(key);
        let cursor = self.index.get_record(list_index, key, name);
        let mut record = VolumeIndexRecord {
            name: *name,
            found: false,
            virtual_chapter: 0,
            is_collision: false,
            list_index,
            key,
        };
        if cursor.found && cursor.key_matches && cursor.payload >= self.oldest_virtual_chapter {
            record.found = true;
            record.virtual_chapter = cursor.payload;
            record.is_collision = cursor.collision;
        }
        record
    }

    /// Inserts or updates `record`'s chapter. Lazily drops a stale entry
    /// occupying the same slot before inserting, and falls back to
    /// evicting the list's oldest entry (by chapter number) rather than
    /// surfacing `OVERFLOW`.
    pub fn put_volume_index_record(&mut self, record: &VolumeIndexRecord, virtual_chapter: u64) -> Result<()> {
        let existing = self.index.get_record(record.list_index, record.key, &record.name);
        if existing.found && !existing.key_matches {
            // A different name occupies this exact key: both become
            // collision records via put_record's own bookkeeping.
        }
        if existing.found && existing.key_matches && existing.payload < self.oldest_virtual_chapter {
            self.index.remove_record(record.list_index, record.key, &record.name)?;
        }
        match self
            .index
            .put_record(record.list_index, record.key, &record.name, virtual_chapter)
        {
            Ok(()) => Ok(()),
            Err(Error::Overflow) => {
                self.index.evict_oldest_by_payload(record.list_index)?;
                self.early_flushes += 1;
                self.index
                    .put_record(record.list_index, record.key, &record.name, virtual_chapter)
            }
            Err(e) => Err(e),
        }
    }

    pub fn remove_volume_index_record(&mut self, record: &VolumeIndexRecord) -> Result<()> {
        if self.index.remove_record(record.list_index, record.key, &record.name)? {
            self.discard_count += 1;
        }
        Ok(())
    }

    pub fn set_volume_index_record_chapter(&mut self, record: &VolumeIndexRecord, chapter: u64) -> Result<()> {
        if chapter > self.newest_virtual_chapter || chapter < self.oldest_virtual_chapter {
            return Err(Error::InvalidArgument(format!(
                "chapter {chapter} outside active window [{}, {}]",
                self.oldest_virtual_chapter, self.newest_virtual_chapter
            )));
        }
        self.index
            .set_payload(record.list_index, record.key, &record.name, chapter)?;
        Ok(())
    }

    /// Advances the zone's notion of the newest open chapter; chapters
    /// older than `chapter - chapters_per_volume` become invalidated
    /// (lazily, per lookup semantics above).
    pub fn set_volume_index_open_chapter(&mut self, chapter: u64, chapters_per_volume: u32) {
        self.newest_virtual_chapter = self.newest_virtual_chapter.max(chapter);
        let threshold = self.newest_virtual_chapter.saturating_sub(chapters_per_volume as u64);
        if threshold > self.oldest_virtual_chapter {
            self.oldest_virtual_chapter = threshold;
        }
    }

    pub fn save(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn restore(bytes: &[u8]) -> Result<Self> {
        let zone: Self = bincode::deserialize(bytes)?;
        zone.index.zone().validate()?;
        Ok(zone)
    }
}

/// The full, sharded volume index.
#[derive(Serialize, Deserialize)]
pub struct VolumeIndex {
    zones: Vec<VolumeIndexZone>,
    sparse_sample_rate: u32,
}

impl VolumeIndex {
    pub fn new(geometry: &Geometry, zone_count: u32, list_count_per_zone: u32) -> Self {
        let zones = (0..zone_count)
            .map(|_| VolumeIndexZone::new(geometry, zone_count, list_count_per_zone))
            .collect();
        Self {
            zones,
            sparse_sample_rate: geometry.sparse_sample_rate,
        }
    }

    pub fn zone_count(&self) -> u32 {
        self.zones.len() as u32
    }

    pub fn zone_of(&self, name: &RecordName) -> u32 {
        crate::geometry::zone_of(name, self.zone_count())
    }

    pub fn zone(&self, index: u32) -> &VolumeIndexZone {
        &self.zones[index as usize]
    }

    pub fn zone_mut(&mut self, index: u32) -> &mut VolumeIndexZone {
        &mut self.zones[index as usize]
    }

    pub fn is_volume_index_sample(&self, name: &RecordName) -> bool {
        is_sample(name, self.sparse_sample_rate)
    }

    pub fn total_record_count(&self) -> u64 {
        self.zones.iter().map(|z| z.record_count()).sum()
    }

    pub fn total_collision_count(&self) -> u64 {
        self.zones.iter().map(|z| z.collision_count()).sum()
    }

    pub fn save(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn restore(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
