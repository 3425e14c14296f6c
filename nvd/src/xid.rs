// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Transaction id correlation for one physical switch.
//!
//! Most requests a controller sends never get a reply, so the table is
//! bounded: once full, the oldest outstanding entry is dropped to make room.

use std::collections::BTreeMap;

use crate::types::SwitchId;
use crate::types::TenantId;

/// Physical-side xids below this are left for the hypervisor's own
/// requests to the switch.
pub const MIN_XID: u32 = 256;

// The number of xids available to translated requests.
const XID_SPAN: u64 = u32::MAX as u64 - MIN_XID as u64 + 1;

/// Who asked for a physical-side transaction, and under which xid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct XidEntry {
    pub tenant_id: TenantId,
    pub switch_id: SwitchId,
    pub xid: u32,
    /// Set on the requests a single barrier was fanned out into.
    pub barrier: Option<u64>,
}

/// Outstanding translated requests on one physical switch, keyed by the
/// xid they were sent with.
#[derive(Debug)]
pub struct XidTranslator {
    capacity: usize,
    next: u32,
    // Bumped on every insert, giving the age of each entry
    seq: u64,
    pending: BTreeMap<u32, (u64, XidEntry)>,
    // Outstanding xids, oldest first
    order: BTreeMap<u64, u32>,
}

impl XidTranslator {
    pub fn new(capacity: usize) -> Self {
        XidTranslator {
            capacity: (capacity as u64).clamp(1, XID_SPAN) as usize,
            next: MIN_XID,
            seq: 0,
            pending: BTreeMap::new(),
            order: BTreeMap::new(),
        }
    }

    /// Record `entry` and return the physical xid to send it with, along
    /// with the entry evicted to make room, if any.  The counter wraps,
    /// skipping ids that are still outstanding.
    pub fn translate(&mut self, entry: XidEntry) -> (u32, Option<XidEntry>) {
        let evicted = if self.pending.len() >= self.capacity {
            self.evict_oldest()
        } else {
            None
        };
        loop {
            let xid = self.next;
            self.next = if xid == u32::MAX { MIN_XID } else { xid + 1 };
            if !self.pending.contains_key(&xid) {
                self.seq += 1;
                self.pending.insert(xid, (self.seq, entry));
                self.order.insert(self.seq, xid);
                return (xid, evicted);
            }
        }
    }

    fn evict_oldest(&mut self) -> Option<XidEntry> {
        let (_, xid) = self.order.pop_first()?;
        self.pending.remove(&xid).map(|(_, entry)| entry)
    }

    /// Consume the entry for a physical xid.  A second call for the same xid
    /// finds nothing.
    pub fn untranslate(&mut self, xid: u32) -> Option<XidEntry> {
        let (seq, entry) = self.pending.remove(&xid)?;
        self.order.remove(&seq);
        Some(entry)
    }

    fn purge(&mut self, mut doomed: impl FnMut(&XidEntry) -> bool) -> usize {
        let before = self.pending.len();
        let order = &mut self.order;
        self.pending.retain(|_, (seq, e)| {
            if doomed(e) {
                order.remove(seq);
                false
            } else {
                true
            }
        });
        before - self.pending.len()
    }

    /// Drop every outstanding entry belonging to a tenant.
    pub fn purge_tenant(&mut self, tenant_id: TenantId) -> usize {
        self.purge(|e| e.tenant_id == tenant_id)
    }

    /// Drop the outstanding entries of one virtual switch.
    pub fn purge_switch(
        &mut self,
        tenant_id: TenantId,
        switch_id: SwitchId,
    ) -> usize {
        self.purge(|e| e.tenant_id == tenant_id && e.switch_id == switch_id)
    }

    /// Whether a reply to the given barrier is still owed.
    pub fn awaits_barrier(&self, barrier: u64) -> bool {
        self.pending
            .values()
            .any(|(_, e)| e.barrier == Some(barrier))
    }

    pub fn pending_for(&self, tenant_id: TenantId) -> usize {
        self.pending
            .values()
            .filter(|(_, e)| e.tenant_id == tenant_id)
            .count()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
