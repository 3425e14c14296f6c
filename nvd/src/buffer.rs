// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;
use std::collections::VecDeque;

use common::network::Dpid;

use crate::openflow::NO_BUFFER;

/// A packet buffered on a physical switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysicalBuffer {
    pub dpid: Dpid,
    pub buffer_id: u32,
}

/// Maps the buffer ids a virtual switch hands its controller onto the
/// physical buffers they stand for.  The table is bounded; once full, the
/// oldest mapping is evicted to make room.
#[derive(Debug)]
pub struct BufferMap {
    capacity: usize,
    next: u32,
    entries: BTreeMap<u32, PhysicalBuffer>,
    // Insertion order, oldest first
    order: VecDeque<u32>,
}

impl BufferMap {
    pub fn new(capacity: usize) -> Self {
        BufferMap {
            capacity: capacity.max(1),
            next: 0,
            entries: BTreeMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Record a physical buffer and return the virtual id standing for it.
    pub fn insert(&mut self, buffer: PhysicalBuffer) -> u32 {
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(old) => {
                    self.entries.remove(&old);
                }
                None => break,
            }
        }
        let mut id = self.next;
        while id == NO_BUFFER || self.entries.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        self.next = id.wrapping_add(1);
        self.entries.insert(id, buffer);
        self.order.push_back(id);
        id
    }

    pub fn lookup(&self, id: u32) -> Option<PhysicalBuffer> {
        self.entries.get(&id).copied()
    }

    pub fn remove(&mut self, id: u32) -> Option<PhysicalBuffer> {
        let buffer = self.entries.remove(&id)?;
        self.order.retain(|x| *x != id);
        Some(buffer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
