// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Ordered key/value semantics layered on top of [`DeltaZone`]. An entry's
//! key is stored as `key - previous_key - 1` (prefix-summed on decode),
//! followed by a fixed-width payload and a collision bit. Every entry also
//! carries its full 16-byte name: production UDS omits the name on
//! non-colliding entries to save space, but doing so requires the caller to
//! reliably supply the *previous* occupant's name when a clash is first
//! detected, which this crate's call sites cannot do without re-reading the
//! record page. Storing the name unconditionally keeps lookups exact and is
//! recorded as a deliberate simplification in `DESIGN.md`.

use serde::{Deserialize, Serialize};

use crate::delta::memory::{copy_bits, get_bits, DeltaZone};
use crate::error::Result;

/// A cursor produced by [`DeltaIndex::get_record`]; valid only until the
/// next mutation of the same list.
#[derive(Clone, Copy, Debug)]
pub struct Cursor {
    pub list_index: u32,
    pub key: u64,
    pub found: bool,
    pub key_matches: bool,
    pub collision: bool,
    pub payload: u64,
}

#[derive(Clone, Debug)]
struct Entry {
    key: u64,
    payload: u64,
    name: [u8; 16],
    collision: bool,
}

/// Small MSB-first bit accumulator used while re-encoding a list.
struct BitWriter {
    bits: Vec<bool>,
}

impl BitWriter {
    fn new() -> Self {
        Self { bits: Vec::new() }
    }

    fn push_bit(&mut self, bit: bool) {
        self.bits.push(bit);
    }

    fn push_bits(&mut self, value: u64, width: u32) {
        for i in (0..width).rev() {
            self.bits.push((value >> i) & 1 == 1);
        }
    }

    fn len(&self) -> u64 {
        self.bits.len() as u64
    }

    fn into_bytes(self) -> Vec<u8> {
        let mut bytes = vec![0u8; (self.bits.len() + 7) / 8];
        for (i, bit) in self.bits.iter().enumerate() {
            if *bit {
                bytes[i / 8] |= 1 << (7 - (i % 8));
            }
        }
        bytes
    }
}

/// A delta index: ordered keys within each of a delta zone's lists.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeltaIndex {
    zone: DeltaZone,
}

/// Width, in bits, of the small (non-escape) delta field: enough to cover
/// twice the expected mean delta before falling back to a full 64-bit
/// escape code.
fn small_delta_bits(mean_delta: u32) -> u32 {
    let span = (mean_delta as u64).saturating_mul(2).max(1);
    64 - span.leading_zeros().min(63)
}

impl DeltaIndex {
    pub fn new(zone: DeltaZone) -> Self {
        Self { zone }
    }

    pub fn zone(&self) -> &DeltaZone {
        &self.zone
    }

    pub fn zone_mut(&mut self) -> &mut DeltaZone {
        &mut self.zone
    }

    pub fn into_zone(self) -> DeltaZone {
        self.zone
    }

    fn decode_list(&self, list_index: u32) -> Vec<Entry> {
        let list = *self.zone.list(list_index);
        let mem = self.zone.memory_slice();
        let small_bits = small_delta_bits(self.zone.mean_delta());
        let payload_bits = self.zone.payload_bits();
        let mut entries = Vec::new();
        let mut pos = list.start;
        let end = list.start + list.save_offset;
        let mut prev_key: i128 = -1;
        while pos < end {
            let collision = get_bits(mem, pos, 1) == 1;
            pos += 1;
            let escape = get_bits(mem, pos, 1) == 1;
            pos += 1;
            // The escape field is a signed 64-bit two's complement delta
            // (duplicate keys, i.e. collisions, encode as -1); the small
            // field is always non-negative.
            let delta: i128 = if escape {
                let v = get_bits(mem, pos, 64);
                pos += 64;
                (v as i64) as i128
            } else {
                let v = get_bits(mem, pos, small_bits);
                pos += small_bits as u64;
                v as i128
            };
            let payload = get_bits(mem, pos, payload_bits);
            pos += payload_bits as u64;
            let mut name = [0u8; 16];
            for b in name.iter_mut() {
                *b = get_bits(mem, pos, 8) as u8;
                pos += 8;
            }
            let key = (prev_key + 1 + delta) as u64;
            prev_key = key as i128;
            entries.push(Entry {
                key,
                payload,
                name,
                collision,
            });
        }
        entries
    }

    fn encode_list(&mut self, list_index: u32, entries: &[Entry]) -> Result<()> {
        let small_bits = small_delta_bits(self.zone.mean_delta());
        let payload_bits = self.zone.payload_bits();
        let mut writer = BitWriter::new();
        let mut prev_key: i128 = -1;
        for e in entries {
            let delta = (e.key as i128) - prev_key - 1;
            writer.push_bit(e.collision);
            if delta < 0 || delta >= (1i128 << small_bits.min(63)) {
                writer.push_bit(true);
                writer.push_bits(delta as u64, 64);
            } else {
                writer.push_bit(false);
                writer.push_bits(delta as u64, small_bits);
            }
            writer.push_bits(e.payload, payload_bits);
            for b in e.name {
                writer.push_bits(b as u64, 8);
            }
            prev_key = e.key as i128;
        }
        let needed_bits = writer.len();
        self.zone.ensure_capacity(list_index, needed_bits)?;
        let start = self.zone.list(list_index).start;
        let scratch = writer.into_bytes();
        copy_bits(&scratch, 0, self.zone.memory_slice_mut(), start, needed_bits);
        self.zone.list_mut(list_index).save_offset = needed_bits;
        Ok(())
    }

    /// Looks up `key` (the caller-derived delta-address for `name`) within
    /// `list_index`. Pure and side-effect free.
    pub fn get_record(&self, list_index: u32, key: u64, name: &[u8; 16]) -> Cursor {
        let entries = self.decode_list(list_index);
        match entries.iter().find(|e| e.key == key) {
            Some(e) => Cursor {
                list_index,
                key,
                found: true,
                key_matches: &e.name == name,
                collision: e.collision,
                payload: e.payload,
            },
            None => Cursor {
                list_index,
                key,
                found: false,
                key_matches: false,
                collision: false,
                payload: 0,
            },
        }
    }

    /// Inserts a new record or updates the payload of an existing one with
    /// the same `(list_index, key, name)`. If `key` is already occupied by
    /// a *different* name, both entries are flagged as collisions.
    pub fn put_record(&mut self, list_index: u32, key: u64, name: &[u8; 16], payload: u64) -> Result<()> {
        let mut entries = self.decode_list(list_index);
        let before_len = entries.len();
        let before_collisions = entries.iter().filter(|e| e.collision).count();
        if let Some(existing) = entries.iter_mut().find(|e| &e.name == name) {
            existing.payload = payload;
        } else {
            entries.push(Entry {
                key,
                payload,
                name: *name,
                collision: false,
            });
            entries.sort_by_key(|e| e.key);
        }
        recompute_collisions(&mut entries);
        let after_collisions = entries.iter().filter(|e| e.collision).count();
        let after_len = entries.len();
        self.encode_list(list_index, &entries)?;
        self.zone.record_count =
            (self.zone.record_count as i64 + (after_len as i64 - before_len as i64)) as u64;
        self.zone.collision_count = (self.zone.collision_count as i64
            + (after_collisions as i64 - before_collisions as i64)) as u64;
        Ok(())
    }

    /// Removes the entry identified by `name` within `list_index`'s `key`
    /// slot, if present. Demotes a surviving collision partner back to a
    /// non-collision record.
    pub fn remove_record(&mut self, list_index: u32, key: u64, name: &[u8; 16]) -> Result<bool> {
        let mut entries = self.decode_list(list_index);
        let before_len = entries.len();
        let before_collisions = entries.iter().filter(|e| e.collision).count();
        entries.retain(|e| !(e.key == key && &e.name == name));
        let removed = entries.len() != before_len;
        if removed {
            recompute_collisions(&mut entries);
            let after_collisions = entries.iter().filter(|e| e.collision).count();
            self.encode_list(list_index, &entries)?;
            self.zone.record_count -= 1;
            self.zone.collision_count = (self.zone.collision_count as i64
                + (after_collisions as i64 - before_collisions as i64))
                as u64;
        }
        Ok(removed)
    }

    /// Evicts the entry with the lowest payload value within `list_index`
    /// (used by the volume index's early-flush path, §4.7, where payload is
    /// the virtual chapter number and "oldest" means smallest). Returns the
    /// evicted entry's `(key, name, payload)`, or `None` if the list is
    /// empty.
    pub fn evict_oldest_by_payload(&mut self, list_index: u32) -> Result<Option<(u64, [u8; 16], u64)>> {
        let mut entries = self.decode_list(list_index);
        if entries.is_empty() {
            return Ok(None);
        }
        let before_collisions = entries.iter().filter(|e| e.collision).count();
        let victim_pos = entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.payload)
            .map(|(i, _)| i)
            .expect("non-empty");
        let victim = entries.remove(victim_pos);
        recompute_collisions(&mut entries);
        let after_collisions = entries.iter().filter(|e| e.collision).count();
        self.encode_list(list_index, &entries)?;
        self.zone.record_count -= 1;
        self.zone.collision_count = (self.zone.collision_count as i64
            + (after_collisions as i64 - before_collisions as i64))
            as u64;
        Ok(Some((victim.key, victim.name, victim.payload)))
    }

    /// Overwrites the payload of the entry identified by `name` within
    /// `list_index`'s `key` slot. Returns `false` if no such entry exists.
    pub fn set_payload(&mut self, list_index: u32, key: u64, name: &[u8; 16], payload: u64) -> Result<bool> {
        let mut entries = self.decode_list(list_index);
        let Some(existing) = entries.iter_mut().find(|e| e.key == key && &e.name == name) else {
            return Ok(false);
        };
        existing.payload = payload;
        self.encode_list(list_index, &entries)?;
        Ok(true)
    }
}

fn recompute_collisions(entries: &mut [Entry]) {
    use std::collections::HashMap;
    let mut counts: HashMap<u64, u32> = HashMap::new();
    for e in entries.iter() {
        *counts.entry(e.key).or_default() += 1;
    }
    for e in entries.iter_mut() {
        e.collision = counts[&e.key] > 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::memory::DeltaZone;

    fn fresh_index() -> DeltaIndex {
        DeltaIndex::new(DeltaZone::initialize(8192, 4, 256, 24))
    }

    #[test]
    fn put_get_remove_round_trip() {
        let mut idx = fresh_index();
        let name = [1u8; 16];
        idx.put_record(1, 100, &name, 7).unwrap();
        let cursor = idx.get_record(1, 100, &name);
        assert!(cursor.found);
        assert!(cursor.key_matches);
        assert_eq!(cursor.payload, 7);
        assert_eq!(idx.zone().record_count, 1);

        let removed = idx.remove_record(1, 100, &name).unwrap();
        assert!(removed);
        assert_eq!(idx.zone().record_count, 0);
        assert!(!idx.get_record(1, 100, &name).found);
    }

    #[test]
    fn collision_accounting() {
        let mut idx = fresh_index();
        let a = [1u8; 16];
        let b = [2u8; 16];
        idx.put_record(1, 42, &a, 1).unwrap();
        idx.put_record(1, 42, &b, 2).unwrap();
        assert_eq!(idx.zone().record_count, 2);
        assert_eq!(idx.zone().collision_count, 2);
        assert!(idx.zone().collision_count <= idx.zone().record_count);

        idx.remove_record(1, 42, &a).unwrap();
        assert_eq!(idx.zone().collision_count, 0);
        let cursor = idx.get_record(1, 42, &b);
        assert!(cursor.found && !cursor.collision);
    }

    #[test]
    fn ordered_keys_survive_out_of_order_inserts() {
        let mut idx = fresh_index();
        let names: Vec<[u8; 16]> = (0..5u8).map(|i| [i; 16]).collect();
        for (i, key) in [300u64, 10, 200, 5, 150].into_iter().enumerate() {
            idx.put_record(2, key, &names[i], i as u64).unwrap();
        }
        for (i, key) in [300u64, 10, 200, 5, 150].into_iter().enumerate() {
            let cursor = idx.get_record(2, key, &names[i]);
            assert!(cursor.found, "key {key} missing");
            assert_eq!(cursor.payload, i as u64);
        }
    }
}
