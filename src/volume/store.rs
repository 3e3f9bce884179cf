// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! On-disk chapter log: a fixed-size file of `chapters_per_volume` slots,
//! each holding `record_pages_per_chapter` record pages, read by a small
//! pool of blocking read threads (§4.6 supplemented) so zone workers never
//! wait on I/O directly.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::record_page::{PageHeader, RecordPage, PAGE_HEADER_BYTES};
use crate::volume::page_cache::{PageCache, PageKey};

struct ReadRequest {
    offset: u64,
    length: usize,
    reply: flume::Sender<Result<Vec<u8>>>,
}

/// A small fixed pool of blocking-I/O worker threads, generalized from the
/// teacher's per-index `TrackingStore` cache: each worker pulls a request
/// off a shared `flume` channel and replies on a per-request oneshot
/// channel, keeping every zone worker non-blocking.
struct ReadThreadPool {
    sender: flume::Sender<ReadRequest>,
    _workers: Vec<std::thread::JoinHandle<()>>,
}

impl ReadThreadPool {
    fn new(file: Arc<Mutex<File>>, thread_count: u32) -> Self {
        let (sender, receiver) = flume::unbounded::<ReadRequest>();
        let workers = (0..thread_count.max(1))
            .map(|_| {
                let receiver = receiver.clone();
                let file = file.clone();
                std::thread::spawn(move || {
                    while let Ok(req) = receiver.recv() {
                        let result = (|| {
                            let mut file = file.lock();
                            file.seek(SeekFrom::Start(req.offset))?;
                            let mut buf = vec![0u8; req.length];
                            file.read_exact(&mut buf)?;
                            Ok(buf)
                        })();
                        let _ = req.reply.send(result);
                    }
                })
            })
            .collect();
        Self {
            sender,
            _workers: workers,
        }
    }

    fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let (reply_tx, reply_rx) = flume::bounded(1);
        self.sender
            .send(ReadRequest {
                offset,
                length,
                reply: reply_tx,
            })
            .map_err(|_| Error::OutOfRange("read thread pool shut down".into()))?;
        reply_rx
            .recv()
            .map_err(|_| Error::OutOfRange("read thread pool shut down".into()))?
    }
}

/// The persistent chapter log for one volume.
pub struct Volume {
    geometry: Geometry,
    file: Arc<Mutex<File>>,
    read_pool: ReadThreadPool,
    cache: PageCache,
}

impl Volume {
    pub fn create(path: &Path, geometry: Geometry, read_threads: u32, cache_pages: usize) -> Result<Self> {
        let file = OpenOptions::new().create(true).read(true).write(true).open(path)?;
        let total_bytes = Self::slot_bytes(&geometry) as u64 * geometry.chapters_per_volume as u64;
        file.set_len(total_bytes)?;
        Self::from_file(file, geometry, read_threads, cache_pages)
    }

    pub fn open(path: &Path, geometry: Geometry, read_threads: u32, cache_pages: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::from_file(file, geometry, read_threads, cache_pages)
    }

    fn from_file(file: File, geometry: Geometry, read_threads: u32, cache_pages: usize) -> Result<Self> {
        let file = Arc::new(Mutex::new(file));
        let read_pool = ReadThreadPool::new(file.clone(), read_threads);
        Ok(Self {
            geometry,
            file,
            read_pool,
            cache: PageCache::new(cache_pages),
        })
    }

    fn slot_bytes(geometry: &Geometry) -> usize {
        geometry.bytes_per_page as usize * (geometry.record_pages_per_chapter as usize + 1)
    }

    fn page_offset(&self, physical_chapter: u32, page_within_chapter: u32) -> u64 {
        let slot = Self::slot_bytes(&self.geometry) as u64 * physical_chapter as u64;
        slot + self.geometry.bytes_per_page as u64 * page_within_chapter as u64
    }

    /// Writes a closed chapter's record pages at `physical_chapter`,
    /// invalidating any cached pages of the chapter it replaces.
    pub fn write_chapter(&self, physical_chapter: u32, pages: &[(PageHeader, RecordPage)]) -> Result<()> {
        self.cache.invalidate_chapter(physical_chapter);
        let mut file = self.file.lock();
        for (page_within_chapter, (header, page)) in pages.iter().enumerate() {
            let offset = self.page_offset(physical_chapter, page_within_chapter as u32);
            let encoded = page.encode(header)?;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&encoded)?;
        }
        Ok(())
    }

    /// Reads and decodes one page through the page cache, issuing a
    /// blocking read on the thread pool on a miss.
    pub fn read_page(&self, physical_chapter: u32, page_within_chapter: u32) -> Result<Arc<RecordPage>> {
        let key = PageKey {
            chapter_physical: physical_chapter,
            page_within_chapter,
        };
        let offset = self.page_offset(physical_chapter, page_within_chapter);
        let length = self.geometry.bytes_per_page as usize;
        let geometry = self.geometry;
        let bytes = self.read_pool.read(offset, length)?;
        Ok(self.cache.get_or_load(key, move || {
            RecordPage::decode(&bytes, geometry.bytes_per_page, geometry.bytes_per_record)
                .map(|(_, page)| page)
                .unwrap_or_else(|_| RecordPage::new(geometry.bytes_per_page, geometry.bytes_per_record))
        }))
    }

    /// Probes a physical chapter's first page header without decoding the
    /// rest of the chapter, for boundary discovery (§4.6).
    pub fn probe_chapter_header(&self, physical_chapter: u32) -> Result<Option<PageHeader>> {
        let offset = self.page_offset(physical_chapter, 0);
        let bytes = self.read_pool.read(offset, PAGE_HEADER_BYTES)?;
        if bytes.iter().all(|b| *b == 0) {
            return Ok(None);
        }
        let mut cursor = std::io::Cursor::new(bytes);
        Ok(Some(PageHeader::read(&mut cursor)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;

    fn small_geometry() -> Geometry {
        Geometry {
            bytes_per_page: 256,
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
    fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.dat");
        let geometry = small_geometry();
        let volume = Volume::create(&path, geometry, 2, 4).unwrap();

        let mut page = RecordPage::new(geometry.bytes_per_page, geometry.bytes_per_record);
        page.push([5u8; 16], vec![1u8; 10]).unwrap();
        let page = page.finish();
        let header = PageHeader {
            virtual_chapter: 3,
            nonce: 42,
            record_count: page.len() as u32,
        };
        volume.write_chapter(0, &[(header, page)]).unwrap();

        let read = volume.read_page(0, 0).unwrap();
        assert_eq!(read.lookup(&[5u8; 16]), Some(vec![1u8; 10].as_slice()));

        let probed = volume.probe_chapter_header(0).unwrap().unwrap();
        assert_eq!(probed, header);
    }

    #[test]
    fn unwritten_chapter_probes_unformatted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.dat");
        let geometry = small_geometry();
        let volume = Volume::create(&path, geometry, 1, 4).unwrap();
        assert!(volume.probe_chapter_header(1).unwrap().is_none());
    }
}
