// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! A packed bit array carved into `list_count + 2` variable-length "lists":
//! two guard lists bounding usable memory, plus `list_count` data lists.
//! Mirrors the way `RocksDbConfig` (`rocks_config.rs`) centralizes sizing
//! knobs, generalized here to a hand-rolled on-disk-shaped byte buffer since
//! this crate *is* the storage layer rather than a wrapper around one.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One variable-length list's bookkeeping. `start`/`size` describe the
/// list's allocated span in bits; `save_offset` is how many of those bits
/// currently hold live entry data (`save_offset <= size`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaList {
    pub start: u64,
    pub size: u64,
    pub save_offset: u64,
}

impl DeltaList {
    fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// A `size_bytes`-long bit buffer holding `list_count` data lists plus two
/// guard lists at index `0` and `list_count + 1`. The trailing 7 bytes of
/// the buffer double as both the tail guard list's span and the over-read
/// pad that `move_bits`/`get_bits` are allowed to read into.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeltaZone {
    memory: Vec<u8>,
    lists: Vec<DeltaList>,
    list_count: u32,
    mean_delta: u32,
    payload_bits: u32,

    pub record_count: u64,
    pub collision_count: u64,
    pub rebalance_count: u64,
    pub overflow_count: u64,
}

/// Bits reserved for the tail guard (7 bytes), matching the "callers must
/// allocate a 7-byte post-guard" contract of `move_bits`.
const GUARD_BITS: u64 = 7 * 8;

impl DeltaZone {
    /// Initializes a zone with `list_count` empty data lists evenly
    /// distributed across `size_bytes` of memory, reserving the final 7
    /// bytes as guard space.
    pub fn initialize(size_bytes: usize, list_count: u32, mean_delta: u32, payload_bits: u32) -> Self {
        let memory = vec![0u8; size_bytes];
        let total_bits = (size_bytes as u64) * 8;
        let mut lists = Vec::with_capacity(list_count as usize + 2);
        // Guard list 0: zero-size sentinel at the very start of the buffer.
        lists.push(DeltaList {
            start: 0,
            size: 0,
            save_offset: 0,
        });
        let usable_end = total_bits.saturating_sub(GUARD_BITS);
        let per_list = if list_count > 0 {
            usable_end / list_count as u64
        } else {
            0
        };
        let mut cursor = 0u64;
        for _ in 0..list_count {
            lists.push(DeltaList {
                start: cursor,
                size: per_list,
                save_offset: 0,
            });
            cursor += per_list;
        }
        // Tail guard list: the last 7 bytes of the buffer.
        lists.push(DeltaList {
            start: total_bits - GUARD_BITS,
            size: GUARD_BITS,
            save_offset: 0,
        });
        Self {
            memory,
            lists,
            list_count,
            mean_delta: mean_delta.max(1),
            payload_bits,
            record_count: 0,
            collision_count: 0,
            rebalance_count: 0,
            overflow_count: 0,
        }
    }

    pub fn list_count(&self) -> u32 {
        self.list_count
    }

    pub fn mean_delta(&self) -> u32 {
        self.mean_delta
    }

    pub fn payload_bits(&self) -> u32 {
        self.payload_bits
    }

    pub fn size_bytes(&self) -> usize {
        self.memory.len()
    }

    /// Total bits in use across every data list.
    pub fn memory_used(&self) -> u64 {
        self.lists[1..=self.list_count as usize]
            .iter()
            .map(|l| l.save_offset)
            .sum()
    }

    pub fn list(&self, index: u32) -> &DeltaList {
        &self.lists[index as usize]
    }

    pub(crate) fn list_mut(&mut self, index: u32) -> &mut DeltaList {
        &mut self.lists[index as usize]
    }

    pub(crate) fn memory_slice(&self) -> &[u8] {
        &self.memory
    }

    pub(crate) fn memory_slice_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    /// Grows `list_index`'s usable length to `new_save_offset` bits, first
    /// trying to use existing slack within the list's allocated span, then
    /// falling back to a full-zone rebalance (`extend_delta_zone`).
    ///
    /// On `Overflow` the zone is left completely unchanged.
    pub fn ensure_capacity(&mut self, list_index: u32, new_save_offset: u64) -> Result<()> {
        let list = self.lists[list_index as usize];
        if new_save_offset <= list.size {
            return Ok(());
        }
        let needed = new_save_offset - list.size;
        self.extend_delta_zone(list_index, needed)
    }

    /// Rebalances the zone so that, except for the first and the (optional)
    /// growing gap, the free space between adjacent lists is equal.
    pub fn extend_delta_zone(&mut self, growing_index: u32, growing_size: u64) -> Result<()> {
        let n = self.list_count as u64;
        let gaps = n + 1;
        let usable_start = self.lists[0].end();
        let usable_end = self.lists[(n + 1) as usize].start;
        let total_bits = usable_end.saturating_sub(usable_start);
        let used_bits = self.memory_used();
        if used_bits > total_bits {
            self.overflow_count += 1;
            return Err(Error::Overflow);
        }
        let slack = total_bits - used_bits;
        let reserve = if growing_index > 0 { growing_size } else { 0 };
        if slack < reserve {
            self.overflow_count += 1;
            return Err(Error::Overflow);
        }
        let distributable = slack - reserve;
        let common = if distributable == 0 {
            0
        } else {
            (distributable + gaps - 1) / gaps // ceil
        };
        let gap0 = distributable.saturating_sub(common * (gaps - 1));

        // Compute new positions without mutating `self` until we know the
        // layout is consistent (overflow must leave the zone untouched).
        let mut new_starts = vec![0u64; n as usize + 1]; // index 1..=n used
        let mut new_sizes = vec![0u64; n as usize + 1];
        let mut cursor = usable_start + gap0;
        for i in 1..=n {
            let old = self.lists[i as usize];
            let size = if i as u32 == growing_index {
                old.save_offset + common + growing_size
            } else {
                old.save_offset + common
            };
            new_starts[i as usize] = cursor;
            new_sizes[i as usize] = size;
            cursor += size;
        }

        let mut new_memory = vec![0u8; self.memory.len()];
        for i in 1..=n {
            let old = self.lists[i as usize];
            let new_start = new_starts[i as usize];
            copy_bits(&self.memory, old.start, &mut new_memory, new_start, old.save_offset);
        }
        // Preserve the trailing guard bytes verbatim (they carry no list
        // data but keep the 7-byte over-read pad intact).
        let tail_start_byte = (self.lists[(n + 1) as usize].start / 8) as usize;
        new_memory[tail_start_byte..].copy_from_slice(&self.memory[tail_start_byte..]);

        self.memory = new_memory;
        for i in 1..=n {
            let list = &mut self.lists[i as usize];
            list.start = new_starts[i as usize];
            list.size = new_sizes[i as usize];
        }
        self.rebalance_count += 1;
        Ok(())
    }

    /// Validates every invariant from §3/§4.1. Used by tests.
    pub fn validate(&self) -> Result<()> {
        let n = self.list_count as usize;
        if self.lists.len() != n + 2 {
            return Err(Error::CorruptData("wrong list count".into()));
        }
        if self.lists[0].start != 0 {
            return Err(Error::CorruptData("list 0 must start at 0".into()));
        }
        let tail = self.lists[n + 1];
        if tail.start + tail.size != (self.memory.len() as u64) * 8 {
            return Err(Error::CorruptData("tail guard misaligned".into()));
        }
        if tail.size != GUARD_BITS {
            return Err(Error::CorruptData("tail guard wrong size".into()));
        }
        for i in 0..=n {
            if self.lists[i].end() > self.lists[i + 1].start {
                return Err(Error::CorruptData(format!("lists {i} and {} overlap", i + 1)));
            }
        }
        for i in 0..=n + 1 {
            if self.lists[i].save_offset > self.lists[i].size {
                return Err(Error::CorruptData(format!("list {i} save_offset > size")));
            }
        }
        if self.collision_count > self.record_count {
            return Err(Error::CorruptData("collision_count > record_count".into()));
        }
        Ok(())
    }
}

/// Reads a single bit (MSB-first within each byte) at `bit_index`.
pub fn get_bit(mem: &[u8], bit_index: u64) -> bool {
    let byte = mem[(bit_index / 8) as usize];
    (byte >> (7 - (bit_index % 8))) & 1 == 1
}

/// Writes a single bit (MSB-first within each byte) at `bit_index`.
pub fn set_bit(mem: &mut [u8], bit_index: u64, value: bool) {
    let idx = (bit_index / 8) as usize;
    let mask = 1u8 << (7 - (bit_index % 8));
    if value {
        mem[idx] |= mask;
    } else {
        mem[idx] &= !mask;
    }
}

/// Reads a `width`-bit (`width <= 64`) unsigned integer starting at
/// `bit_offset`, MSB-first.
pub fn get_bits(mem: &[u8], bit_offset: u64, width: u32) -> u64 {
    let mut value = 0u64;
    for i in 0..width as u64 {
        value = (value << 1) | (get_bit(mem, bit_offset + i) as u64);
    }
    value
}

/// Writes the low `width` bits of `value` starting at `bit_offset`,
/// MSB-first.
pub fn set_bits(mem: &mut [u8], bit_offset: u64, width: u32, value: u64) {
    for i in 0..width as u64 {
        let shift = width as u64 - 1 - i;
        let bit = (value >> shift) & 1 == 1;
        set_bit(mem, bit_offset + i, bit);
    }
}

/// Copies `n_bits` from `src` at `src_offset` into `dst` at `dst_offset`.
/// Source and destination are distinct buffers, so no overlap handling is
/// required.
pub fn copy_bits(src: &[u8], src_offset: u64, dst: &mut [u8], dst_offset: u64, n_bits: u64) {
    for i in 0..n_bits {
        let bit = get_bit(src, src_offset + i);
        set_bit(dst, dst_offset + i, bit);
    }
}

/// Copies `n_bits` from `src_offset` to `dst_offset` within the *same*
/// buffer, correct even when the ranges overlap (memmove semantics).
pub fn move_bits(mem: &mut [u8], src_offset: u64, dst_offset: u64, n_bits: u64) {
    if n_bits == 0 || src_offset == dst_offset {
        return;
    }
    if dst_offset < src_offset {
        for i in 0..n_bits {
            let bit = get_bit(mem, src_offset + i);
            set_bit(mem, dst_offset + i, bit);
        }
    } else {
        for i in (0..n_bits).rev() {
            let bit = get_bit(mem, src_offset + i);
            set_bit(mem, dst_offset + i, bit);
        }
    }
}

/// Returns true iff the `size`-bit fields starting at `(a, off_a)` and
/// `(b, off_b)` are bit-for-bit identical. Used by tests (§8 scenario 1).
pub fn same_bits(a: &[u8], off_a: u64, b: &[u8], off_b: u64, size: u64) -> bool {
    (0..size).all(|i| get_bit(a, off_a + i) == get_bit(b, off_b + i))
}
