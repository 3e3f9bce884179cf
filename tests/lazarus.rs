// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! End-to-end "Lazarus" scenario (§8 scenario 5): three names colliding on
//! one delta address, spread across two chapters, with one update and two
//! live deletes of volume-index entries whose physical records are
//! untouched on disk. A rebuild must recover exactly:
//!   name1 → chapter 0 (original value)
//!   name2 → chapter 1 (updated value)
//!   name3 → chapter 0 (original value)

use uds_index::geometry::Geometry;
use uds_index::record_page::{PageHeader, RecordPage};
use uds_index::recovery::{discover_boundaries, rebuild, RebuildProgress};
use uds_index::stats::SessionStats;
use uds_index::volume::Volume;
use uds_index::volume_index::VolumeIndex;

fn geometry() -> Geometry {
    Geometry {
        bytes_per_page: 4096,
        bytes_per_record: 26,
        record_pages_per_chapter: 1,
        chapters_per_volume: 4,
        sparse_chapters_per_volume: 1,
        sparse_sample_rate: 32,
        mean_delta: 256,
        payload_bits: 24,
    }
}

#[test]
fn rebuild_restores_live_deleted_entries_from_their_original_chapter() {
    let geometry = geometry();
    let dir = tempfile::tempdir().unwrap();
    let volume = Volume::create(&dir.path().join("v.dat"), geometry, 1, 8).unwrap();

    let name1 = [1u8; 16];
    let name2 = [2u8; 16];
    let name3 = [3u8; 16];

    // Chapter 0: all three names written with their original ("OLD") data.
    let mut page0 = RecordPage::new(geometry.bytes_per_page, geometry.bytes_per_record);
    page0.push(name1, vec![b'1'; 10]).unwrap();
    page0.push(name2, vec![b'2'; 10]).unwrap();
    page0.push(name3, vec![b'3'; 10]).unwrap();
    let page0 = page0.finish();
    let header0 = PageHeader {
        virtual_chapter: 0,
        nonce: 0,
        record_count: page0.len() as u32,
    };
    volume.write_chapter(0, &[(header0, page0)]).unwrap();

    // Chapter 1: name2 is rewritten with "NEW" data; name1/name3 are
    // untouched and only live on in chapter 0.
    let mut page1 = RecordPage::new(geometry.bytes_per_page, geometry.bytes_per_record);
    page1.push(name2, vec![b'9'; 10]).unwrap();
    let page1 = page1.finish();
    let header1 = PageHeader {
        virtual_chapter: 1,
        nonce: 0,
        record_count: page1.len() as u32,
    };
    volume.write_chapter(1, &[(header1, page1)]).unwrap();

    let mut index = VolumeIndex::new(&geometry, 1, 1);
    for name in [name1, name2, name3] {
        let record = index.zone(0).get_volume_index_record(&name);
        index.zone_mut(0).put_volume_index_record(&record, 0).unwrap();
    }
    let record = index.zone(0).get_volume_index_record(&name2);
    index.zone_mut(0).put_volume_index_record(&record, 1).unwrap();

    // Live admin deletes of name1 and name3 from the in-memory volume
    // index; their on-disk records in chapter 0 are left alone.
    for name in [name1, name3] {
        let record = index.zone(0).get_volume_index_record(&name);
        index.zone_mut(0).remove_volume_index_record(&record).unwrap();
    }
    assert!(!index.zone(0).get_volume_index_record(&name1).found);
    assert!(!index.zone(0).get_volume_index_record(&name3).found);
    assert_eq!(index.zone(0).get_volume_index_record(&name2).virtual_chapter, 1);

    // Crash and rebuild from the volume alone.
    let mut rebuilt = VolumeIndex::new(&geometry, 1, 1);
    let (lowest, highest) = discover_boundaries(&geometry, &volume, 0, &[]).unwrap();
    let progress = RebuildProgress::default();
    let stats = SessionStats::default();
    rebuild(&geometry, &volume, &mut rebuilt, lowest, highest, &progress, &stats, || true).unwrap();

    let r1 = rebuilt.zone(0).get_volume_index_record(&name1);
    let r2 = rebuilt.zone(0).get_volume_index_record(&name2);
    let r3 = rebuilt.zone(0).get_volume_index_record(&name3);
    assert!(r1.found && r1.virtual_chapter == 0);
    assert!(r2.found && r2.virtual_chapter == 1);
    assert!(r3.found && r3.virtual_chapter == 0);

    // Confirm the recovered chapters actually hold the expected bytes.
    let page = volume.read_page(0, 0).unwrap();
    assert_eq!(page.lookup(&name1), Some(vec![b'1'; 10].as_slice()));
    assert_eq!(page.lookup(&name3), Some(vec![b'3'; 10].as_slice()));
    let page = volume.read_page(1, 0).unwrap();
    assert_eq!(page.lookup(&name2), Some(vec![b'9'; 10].as_slice()));
}
