// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! A sorted `(name, data)` record block, the unit persisted to one physical
//! page on disk. Entries are sorted once at encode time (a radix pass over
//! the name bytes, most significant byte first) so lookups can use a
//! straight binary search.

use byteorder::{LittleEndian, WriteBytesExt};
use std::io::{Cursor as IoCursor, Read, Write};

use crate::error::{Error, Result};
use crate::geometry::RecordName;

/// Header framing every record page and chapter-index page, letting
/// boundary discovery (§4.6) probe a physical chapter without decoding the
/// full page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageHeader {
    pub virtual_chapter: u64,
    pub nonce: u64,
    pub record_count: u32,
}

pub const PAGE_HEADER_BYTES: usize = 8 + 8 + 4;

impl PageHeader {
    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u64::<LittleEndian>(self.virtual_chapter)?;
        w.write_u64::<LittleEndian>(self.nonce)?;
        w.write_u32::<LittleEndian>(self.record_count)?;
        Ok(())
    }

    pub fn read(r: &mut impl Read) -> Result<Self> {
        use byteorder::ReadBytesExt;
        let virtual_chapter = r.read_u64::<LittleEndian>()?;
        let nonce = r.read_u64::<LittleEndian>()?;
        let record_count = r.read_u32::<LittleEndian>()?;
        Ok(Self {
            virtual_chapter,
            nonce,
            record_count,
        })
    }
}

#[derive(Clone, Debug)]
struct Record {
    name: RecordName,
    data: Vec<u8>,
}

/// A record page accumulated in sort order. `bytes_per_record` bounds how
/// many records fit on one `bytes_per_page`-sized page.
pub struct RecordPage {
    records: Vec<Record>,
    bytes_per_record: usize,
    capacity: usize,
}

impl RecordPage {
    pub fn new(bytes_per_page: u32, bytes_per_record: u32) -> Self {
        let bytes_per_record = bytes_per_record as usize;
        let capacity = (bytes_per_page as usize) / bytes_per_record.max(1);
        Self {
            records: Vec::with_capacity(capacity),
            bytes_per_record,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    /// Appends `(name, data)` in whatever order the caller supplies;
    /// `finish` performs the sort.
    pub fn push(&mut self, name: RecordName, data: Vec<u8>) -> Result<()> {
        if self.is_full() {
            return Err(Error::OutOfRange("record page is full".into()));
        }
        self.records.push(Record { name, data });
        Ok(())
    }

    /// Radix-sorts (most-significant byte first) the accumulated records by
    /// name and returns `self` ready for encoding or lookup.
    pub fn finish(mut self) -> Self {
        radix_sort_by_name(&mut self.records);
        self
    }

    /// Binary search by name; records must have gone through `finish`.
    pub fn lookup(&self, name: &RecordName) -> Option<&[u8]> {
        self.records
            .binary_search_by(|r| r.name.cmp(name))
            .ok()
            .map(|i| self.records[i].data.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RecordName, &[u8])> {
        self.records.iter().map(|r| (&r.name, r.data.as_slice()))
    }

    pub fn encode(&self, header: &PageHeader) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(PAGE_HEADER_BYTES + self.records.len() * self.bytes_per_record);
        header.write(&mut buf)?;
        for r in &self.records {
            buf.write_all(&r.name)?;
            buf.write_all(&r.data)?;
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8], bytes_per_page: u32, bytes_per_record: u32) -> Result<(PageHeader, Self)> {
        let mut cursor = IoCursor::new(bytes);
        let header = PageHeader::read(&mut cursor)?;
        let data_len = bytes_per_record as usize - 16;
        let mut page = RecordPage::new(bytes_per_page, bytes_per_record);
        for _ in 0..header.record_count {
            let mut name = [0u8; 16];
            cursor
                .read_exact(&mut name)
                .map_err(|e| Error::CorruptData(format!("truncated record page: {e}")))?;
            let mut data = vec![0u8; data_len];
            cursor
                .read_exact(&mut data)
                .map_err(|e| Error::CorruptData(format!("truncated record page: {e}")))?;
            page.push(name, data)?;
        }
        Ok((header, page))
    }
}

fn radix_sort_by_name(records: &mut [Record]) {
    // 16 passes, one per name byte, most significant first; a counting
    // sort per pass keeps it stable and linear in record count.
    let mut buf = records.to_vec();
    for byte_index in (0..16).rev() {
        let mut counts = [0usize; 257];
        for r in buf.iter() {
            counts[r.name[byte_index] as usize + 1] += 1;
        }
        for i in 1..counts.len() {
            counts[i] += counts[i - 1];
        }
        let mut out = buf.clone();
        let mut next = counts;
        for r in buf.iter() {
            let b = r.name[byte_index] as usize;
            out[next[b]] = r.clone();
            next[b] += 1;
        }
        buf = out;
    }
    records.clone_from_slice(&buf);
}
