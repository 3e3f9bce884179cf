// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! A content-addressable chunk deduplication index: given a 16-byte chunk
//! name, answers "have we stored this chunk's data before, and if so in
//! which chapter" with a bounded, constant-size in-memory footprint no
//! matter how large the volume on disk grows.
//!
//! The index is organized as a rotating log of *chapters* (`volume`,
//! `record_page`), each described while open by an `open_chapter` staging
//! table and, once closed, by a bit-packed `chapter_index`. A `volume_index`
//! shards every chunk name across zones and remembers only which chapter
//! last saw it; a `sparse_cache` gives old, demoted chapters cheap
//! best-effort coverage. Concurrent access is organized around a
//! `pipeline` of per-zone worker threads, and `recovery` rebuilds the
//! volume index from the chapters on disk after an unclean shutdown. A
//! `session` ties these together behind one lifecycle-gated handle.

pub mod chapter_index;
pub mod config;
pub mod delta;
pub mod error;
pub mod geometry;
pub mod open_chapter;
pub mod pipeline;
pub mod record_page;
pub mod recovery;
pub mod session;
pub mod sparse_cache;
pub mod stats;
pub mod volume;
pub mod volume_index;

pub use config::IndexConfig;
pub use error::{Error, Result};
pub use geometry::{Geometry, RecordName};
pub use session::{OpenMode, Session, SessionState};
pub use stats::StatsSnapshot;
