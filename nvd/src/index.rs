// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Allocation of small integer identifiers from a fixed range.
//!
//! Every identifier namespace in the hypervisor (tenants, virtual switches,
//! virtual ports, links, routes) hands out the lowest free value in its
//! range, so a fresh namespace allocates 1, 2, 3, ... and a freed id is the
//! next one reused.

use std::collections::BTreeSet;

use crate::types::NvdError;
use crate::types::NvdResult;

/// An IdPool represents a managed range of integers, closed on the bottom
/// and open on the top.
#[derive(Clone, Debug)]
pub struct IdPool {
    // Name of the namespace, used when reporting exhaustion
    name: &'static str,
    low: u32,
    high: u32,
    // Lowest id never handed out.  Everything at or above this is free.
    next: u32,
    // Ids below `next` that have been freed.
    recycled: BTreeSet<u32>,
}

impl IdPool {
    pub fn new(name: &'static str, low: u32, high: u32) -> Self {
        assert!(low < high, "empty id range for {name}");
        IdPool {
            name,
            low,
            high,
            next: low,
            recycled: BTreeSet::new(),
        }
    }

    /// Throw away all allocation state.  It is the caller's responsibility
    /// not to free() ids allocated prior to a reset().
    pub fn reset(&mut self) {
        self.next = self.low;
        self.recycled.clear();
    }

    /// Allocate the lowest free id.
    pub fn alloc(&mut self) -> NvdResult<u32> {
        if let Some(id) = self.recycled.pop_first() {
            return Ok(id);
        }
        if self.next >= self.high {
            return Err(NvdError::TableFull(self.name.into()));
        }
        let id = self.next;
        self.next += 1;
        Ok(id)
    }

    pub fn free(&mut self, id: u32) {
        if id < self.low || id >= self.next {
            return;
        }
        if id + 1 == self.next {
            // Shrink back over any freed ids at the top of the range.
            self.next = id;
            while self.next > self.low && self.recycled.remove(&(self.next - 1))
            {
                self.next -= 1;
            }
        } else {
            self.recycled.insert(id);
        }
    }

    /// The number of ids currently allocated.
    pub fn in_use(&self) -> usize {
        (self.next - self.low) as usize - self.recycled.len()
    }
}
