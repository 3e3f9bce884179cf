// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Zoned request pipeline (§4.9): triage assigns a zone by name, one OS
//! thread per zone processes that zone's queue strictly in order, and a
//! chapter-close control message is broadcast to every other zone's queue
//! when one zone's open chapter fills.
//!
//! Zone workers are plain `std::thread`s communicating over queues, not
//! `tokio` tasks: the hot path must never await while holding a zone's own
//! state (§5), matching the blocking I/O boundary used elsewhere in this
//! crate (`volume::store::ReadThreadPool`).

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::geometry::{zone_of, RecordName};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Post,
    Update,
    Query,
    QueryNoUpdate,
    Delete,
}

#[derive(Clone, Debug)]
pub struct Request {
    pub name: RecordName,
    pub kind: RequestKind,
    /// Set when this request is being replayed ahead of fresh work (e.g.
    /// after a page-cache miss completed); requeued requests must be
    /// observed before any fresh request enqueued after them (§4.9, §8
    /// scenario 7).
    pub requeued: bool,
}

#[derive(Clone, Debug)]
pub enum ZoneMessage {
    Request(Request),
    /// Broadcast by the zone whose open chapter just filled; every other
    /// zone drains its own open chapter into the volume on receipt.
    ChapterClose { new_virtual_chapter: u64 },
}

struct QueueInner {
    items: VecDeque<ZoneMessage>,
    closed: bool,
}

/// A single zone's inbox: FIFO for fresh work, with `requeue` always
/// winning a race against `enqueue` for items submitted afterward.
pub struct ZoneQueue {
    inner: Mutex<QueueInner>,
    not_empty: Condvar,
}

impl ZoneQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
        }
    }

    pub fn enqueue(&self, message: ZoneMessage) {
        let mut inner = self.inner.lock();
        inner.items.push_back(message);
        self.not_empty.notify_one();
    }

    /// Places `message` at the head of the queue, ahead of everything
    /// enqueued so far.
    pub fn requeue(&self, message: ZoneMessage) {
        let mut inner = self.inner.lock();
        inner.items.push_front(message);
        self.not_empty.notify_one();
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.not_empty.notify_all();
    }

    /// Blocks until a message is available or the queue is closed and
    /// drained.
    pub fn dequeue(&self) -> Option<ZoneMessage> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            self.not_empty.wait(&mut inner);
        }
    }

    pub fn try_dequeue(&self) -> Option<ZoneMessage> {
        self.inner.lock().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ZoneQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes a request to the queue of the zone owning its name (§3 invariant
/// 2). A thin wrapper kept separate from `ZoneQueue` so multiple triage
/// threads can share the same zone fan-out without owning queue state.
pub struct Triage {
    zones: Vec<Arc<ZoneQueue>>,
}

impl Triage {
    pub fn new(zones: Vec<Arc<ZoneQueue>>) -> Self {
        Self { zones }
    }

    pub fn zone_count(&self) -> u32 {
        self.zones.len() as u32
    }

    pub fn dispatch(&self, request: Request) {
        let zone = zone_of(&request.name, self.zone_count()) as usize;
        self.zones[zone].enqueue(ZoneMessage::Request(request));
    }

    /// Broadcasts a chapter-close control message to every zone except
    /// `originating_zone`, which already advanced locally on fill.
    pub fn broadcast_chapter_close(&self, originating_zone: u32, new_virtual_chapter: u64) {
        debug!(originating_zone, new_virtual_chapter, "broadcasting chapter close");
        for (i, zone) in self.zones.iter().enumerate() {
            if i as u32 != originating_zone {
                zone.enqueue(ZoneMessage::ChapterClose { new_virtual_chapter });
            }
        }
    }

    pub fn zone(&self, index: u32) -> &Arc<ZoneQueue> {
        &self.zones[index as usize]
    }
}

/// Spawns one worker thread per zone, each looping `handler` over its
/// queue until the queue is closed. `handler` encapsulates the
/// TRIAGE → INDEX(zone) → MESSAGE(zone) stages of a concrete deployment
/// (volume index + open chapter + volume lookups); the pipeline itself
/// only guarantees delivery order.
pub fn spawn_zone_workers<F>(triage: &Triage, mut handler: F) -> Vec<std::thread::JoinHandle<()>>
where
    F: FnMut(u32, ZoneMessage) + Clone + Send + 'static,
{
    (0..triage.zone_count())
        .map(|zone_index| {
            let queue = triage.zone(zone_index).clone();
            let mut handler = handler.clone();
            std::thread::spawn(move || {
                while let Some(message) = queue.dequeue() {
                    handler(zone_index, message);
                }
            })
        })
        .collect()
}
