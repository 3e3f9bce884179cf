// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Boundary discovery: given a callback that can probe any physical chapter
//! slot for its stored virtual chapter number, locate the contiguous run of
//! valid chapters tolerating a bounded number of unreadable slots (§4.6).

use std::collections::HashMap;

use crate::error::{Error, Result};

/// What a physical-chapter probe reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeResult {
    Valid(u64),
    Unformatted,
}

/// A correction applied to a raw probed virtual chapter number before
/// monotonicity analysis — used when a geometry upgrade changed
/// `chapters_per_volume` mid-deployment and old chapter headers still carry
/// virtual numbers in the old scheme.
#[derive(Clone, Copy, Debug)]
pub struct ChapterRemap {
    pub from: u64,
    pub to: u64,
}

fn apply_remap(raw: u64, remap: &[ChapterRemap]) -> u64 {
    remap.iter().find(|r| r.from == raw).map(|r| r.to).unwrap_or(raw)
}

/// Probes every physical slot `0..chapter_count`, applies `remap`, and
/// returns `(lowest_valid_virtual_chapter, highest_valid_virtual_chapter)`
/// for the single contiguous run of chapters consistent with physical
/// storage wrapping (`physical = virtual % chapter_count`).
///
/// Tolerates up to `max_bad_chapters` unformatted slots within the run
/// without breaking it. Fails with `CorruptData` if no run of at least
/// `chapter_count - max_bad_chapters` consistently-placed chapters exists.
pub fn find_volume_chapter_boundaries(
    chapter_count: u32,
    max_bad_chapters: u32,
    remap: &[ChapterRemap],
    probe: impl Fn(u32) -> Result<ProbeResult>,
) -> Result<(u64, u64)> {
    if chapter_count == 0 {
        return Err(Error::OutOfRange("chapter_count must be non-zero".into()));
    }
    let mut by_physical: HashMap<u32, u64> = HashMap::new();
    for physical in 0..chapter_count {
        match probe(physical)? {
            ProbeResult::Valid(virtual_chapter) => {
                let virtual_chapter = apply_remap(virtual_chapter, remap);
                // A slot's virtual chapter must be consistent with its
                // physical position, i.e. this deployment's own wrap rule;
                // a slot whose stored number doesn't land back on itself
                // after the modulo is corrupt framing, not "unformatted".
                if virtual_chapter % chapter_count as u64 == physical as u64 {
                    by_physical.insert(physical, virtual_chapter);
                }
            }
            ProbeResult::Unformatted => {}
        }
    }

    let bad = chapter_count as usize - by_physical.len();
    if by_physical.is_empty() || bad > max_bad_chapters as usize {
        return Err(Error::CorruptData(format!(
            "only {} of {chapter_count} physical chapters are valid (max_bad_chapters={max_bad_chapters})",
            by_physical.len()
        )));
    }

    let lowest = *by_physical.values().min().unwrap();
    let highest = *by_physical.values().max().unwrap();

    // The run must be contiguous in virtual-chapter space; any gap larger
    // than the tolerated bad-chapter budget is corruption, not a normal
    // not-yet-written tail.
    let expected_span = highest - lowest + 1;
    if expected_span as usize > chapter_count as usize
        || (expected_span as usize - by_physical.len()) > max_bad_chapters as usize
    {
        return Err(Error::CorruptData(
            "valid chapters do not form one contiguous run".into(),
        ));
    }

    Ok((lowest, highest))
}
