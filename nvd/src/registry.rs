// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The mapping registry: the shared, tenant-scoped directory relating every
//! virtual entity to its physical counterparts.
//!
//! Locking is per tenant.  The tenant map itself is only held long enough to
//! clone out the `Arc<Tenant>` for the caller, so unrelated tenants never
//! contend.  Within a tenant the virtual network is read-mostly; topology
//! changes take the write lock and message translation takes the read lock.
//! Address and buffer tables have their own mutexes, taken after the network
//! lock when both are needed.  Transaction tables are per physical switch.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use common::network::Dpid;
use common::network::MacAddr;
use oxnet::Ipv4Net;
use slog::debug;
use slog::info;

use crate::address::tenant_of_physical_ip;
use crate::address::AddressTable;
use crate::buffer::BufferMap;
use crate::buffer::PhysicalBuffer;
use crate::config::Config;
use crate::index::IdPool;
use crate::openflow::NO_BUFFER;
use crate::physical::PhysicalPortRef;
use crate::topology::ControllerAddr;
use crate::topology::RemovedSwitch;
use crate::topology::SwitchKind;
use crate::topology::VirtualNetwork;
use crate::topology::VirtualPort;
use crate::types::NvdError;
use crate::types::NvdResult;
use crate::types::SwitchId;
use crate::types::TenantId;
use crate::xid::XidEntry;
use crate::xid::XidTranslator;

/// Everything the registry holds for one tenant.
pub struct Tenant {
    pub tenant_id: TenantId,
    pub network: RwLock<VirtualNetwork>,
    pub addresses: Mutex<AddressTable>,
    pub buffers: Mutex<BTreeMap<SwitchId, BufferMap>>,
}

/// A virtual port found on a physical port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortOwner {
    pub tenant_id: TenantId,
    pub switch_id: SwitchId,
    pub port: VirtualPort,
    pub active: bool,
}

pub struct Registry {
    log: slog::Logger,
    tenant_prefix_bits: u8,
    buffer_map_size: usize,
    xid_table_size: usize,
    tenant_ids: Mutex<IdPool>,
    tenants: RwLock<BTreeMap<TenantId, Arc<Tenant>>>,
    // Hosts attached to edge ports, and the tenant each belongs to
    host_macs: RwLock<BTreeMap<MacAddr, TenantId>>,
    xids: Mutex<BTreeMap<Dpid, Arc<Mutex<XidTranslator>>>>,
    // Next barrier group.  Held while a barrier reply is resolved, so that
    // exactly one reply completes each group.
    barriers: Mutex<u64>,
}

impl Registry {
    pub fn new(log: &slog::Logger, config: &Config) -> Self {
        Registry {
            log: log.new(slog::o!("unit" => "registry")),
            tenant_prefix_bits: config.tenant_prefix_bits,
            buffer_map_size: config.buffer_map_size,
            xid_table_size: config.xid_table_size,
            tenant_ids: Mutex::new(Self::tenant_pool(config.tenant_prefix_bits)),
            tenants: RwLock::new(BTreeMap::new()),
            host_macs: RwLock::new(BTreeMap::new()),
            xids: Mutex::new(BTreeMap::new()),
            barriers: Mutex::new(1),
        }
    }

    // A tenant id must fit in both the physical IP prefix and the two
    // tenant octets of a virtual MAC.
    fn tenant_pool(bits: u8) -> IdPool {
        let high = (1u64 << bits).min(0x1_0000) as u32;
        IdPool::new("tenants", 1, high)
    }

    /// Forget everything.  Only meant for test harnesses.
    pub fn reset(&self) {
        info!(self.log, "resetting registry");
        self.tenants.write().unwrap().clear();
        self.host_macs.write().unwrap().clear();
        self.xids.lock().unwrap().clear();
        self.tenant_ids.lock().unwrap().reset();
    }

    pub fn tenant_prefix_bits(&self) -> u8 {
        self.tenant_prefix_bits
    }

    /// Create a tenant with an empty virtual network.
    pub fn register_network(
        &self,
        controller: ControllerAddr,
        subnet: Ipv4Net,
    ) -> NvdResult<Arc<Tenant>> {
        let tenant_id = TenantId(self.tenant_ids.lock().unwrap().alloc()?);
        let addresses = match AddressTable::new(tenant_id, self.tenant_prefix_bits)
        {
            Ok(a) => a,
            Err(e) => {
                self.tenant_ids.lock().unwrap().free(tenant_id.0);
                return Err(e);
            }
        };
        let tenant = Arc::new(Tenant {
            tenant_id,
            network: RwLock::new(VirtualNetwork::new(
                tenant_id, controller, subnet,
            )),
            addresses: Mutex::new(addresses),
            buffers: Mutex::new(BTreeMap::new()),
        });
        let mut tenants = self.tenants.write().unwrap();
        if tenants.contains_key(&tenant_id) {
            // The id stays allocated: it belongs to the tenant already
            // registered under it, and is freed when that tenant goes.
            return Err(NvdError::Invariant(format!(
                "tenant id {tenant_id} allocated twice"
            )));
        }
        tenants.insert(tenant_id, tenant.clone());
        debug!(self.log, "registered network"; "tenant_id" => %tenant_id);
        Ok(tenant)
    }

    pub fn lookup_network(&self, tenant_id: TenantId) -> NvdResult<Arc<Tenant>> {
        self.tenants
            .read()
            .unwrap()
            .get(&tenant_id)
            .cloned()
            .ok_or(NvdError::InvalidTenantId(tenant_id))
    }

    pub fn tenant_ids(&self) -> Vec<TenantId> {
        self.tenants.read().unwrap().keys().copied().collect()
    }

    fn tenants(&self) -> Vec<Arc<Tenant>> {
        self.tenants.read().unwrap().values().cloned().collect()
    }

    /// Remove a tenant and every table entry belonging to it.  The tenant id
    /// becomes available for reuse.
    ///
    /// The network is retired under its write lock before the tenant's
    /// transactions are purged.  A translation still holding the read lock
    /// finishes stamping first and has its entries purged; one that takes
    /// the lock afterwards sees the retired network and stamps nothing.
    pub fn unregister_network(
        &self,
        tenant_id: TenantId,
    ) -> NvdResult<Arc<Tenant>> {
        let tenant = self
            .tenants
            .write()
            .unwrap()
            .remove(&tenant_id)
            .ok_or(NvdError::InvalidTenantId(tenant_id))?;

        let purged: usize = {
            let mut network = tenant.network.write().unwrap();
            network.retired = true;
            self.host_macs
                .write()
                .unwrap()
                .retain(|_, owner| *owner != tenant_id);
            self.translators()
                .iter()
                .map(|xt| xt.lock().unwrap().purge_tenant(tenant_id))
                .sum()
        };
        self.tenant_ids.lock().unwrap().free(tenant_id.0);
        debug!(self.log, "unregistered network";
            "tenant_id" => %tenant_id,
            "pending_transactions" => purged);
        Ok(tenant)
    }

    /// Add a virtual switch to a tenant's network, along with its buffer
    /// table.
    pub fn register_switch(
        &self,
        tenant: &Tenant,
        kind: SwitchKind,
    ) -> NvdResult<SwitchId> {
        let mut network = tenant.network.write().unwrap();
        if network.retired {
            return Err(NvdError::InvalidTenantId(tenant.tenant_id));
        }
        let switch_id = network.add_switch(kind)?;
        tenant
            .buffers
            .lock()
            .unwrap()
            .insert(switch_id, BufferMap::new(self.buffer_map_size));
        debug!(self.log, "registered switch";
            "tenant_id" => %tenant.tenant_id,
            "switch_id" => %switch_id);
        Ok(switch_id)
    }

    /// Remove a virtual switch along with everything hanging off it.  The
    /// whole removal happens under the tenant's write lock, so no reader
    /// ever sees a half-removed switch.
    pub fn unregister_switch(
        &self,
        tenant: &Tenant,
        switch_id: SwitchId,
    ) -> NvdResult<RemovedSwitch> {
        let mut network = tenant.network.write().unwrap();
        let removed = network.remove_switch(switch_id)?;
        tenant.buffers.lock().unwrap().remove(&switch_id);
        for host in &removed.hosts {
            self.forget_host(tenant, host.mac);
        }
        for xt in self.translators() {
            xt.lock().unwrap().purge_switch(tenant.tenant_id, switch_id);
        }
        Ok(removed)
    }

    /// The physical switches backing a virtual switch, in the order given
    /// when the switch was created.
    pub fn physical_switches_of(
        &self,
        tenant_id: TenantId,
        switch_id: SwitchId,
    ) -> NvdResult<Vec<Dpid>> {
        let tenant = self.lookup_network(tenant_id)?;
        let network = tenant.network.read().unwrap();
        Ok(network.switch(switch_id)?.members().to_vec())
    }

    pub fn virtual_switch_of(
        &self,
        tenant_id: TenantId,
        dpid: Dpid,
    ) -> NvdResult<Option<SwitchId>> {
        let tenant = self.lookup_network(tenant_id)?;
        let network = tenant.network.read().unwrap();
        Ok(network.switch_for_dpid(dpid))
    }

    /// Every virtual port, across all tenants, wrapping a physical port.
    pub fn port_owners(&self, physical: PhysicalPortRef) -> Vec<PortOwner> {
        self.tenants()
            .iter()
            .filter_map(|tenant| {
                let network = tenant.network.read().unwrap();
                network.port_owner(physical).map(|(sw, port)| PortOwner {
                    tenant_id: tenant.tenant_id,
                    switch_id: sw.switch_id,
                    port: port.clone(),
                    active: sw.active,
                })
            })
            .collect()
    }

    pub fn add_address_mapping(
        &self,
        tenant_id: TenantId,
        vip: Ipv4Addr,
        pip: Ipv4Addr,
    ) -> NvdResult<()> {
        let tenant = self.lookup_network(tenant_id)?;
        let mut addresses = tenant.addresses.lock().unwrap();
        addresses.insert_ip(vip, pip)
    }

    pub fn physical_ip_of(
        &self,
        vip: Ipv4Addr,
        tenant_id: TenantId,
    ) -> NvdResult<Option<Ipv4Addr>> {
        let tenant = self.lookup_network(tenant_id)?;
        let addresses = tenant.addresses.lock().unwrap();
        Ok(addresses.physical_ip(vip))
    }

    /// The tenant and virtual address a physical address stands for.
    pub fn virtual_ip_of(&self, pip: Ipv4Addr) -> Option<(TenantId, Ipv4Addr)> {
        let tenant_id = tenant_of_physical_ip(pip, self.tenant_prefix_bits);
        let tenant = self.lookup_network(tenant_id).ok()?;
        let addresses = tenant.addresses.lock().unwrap();
        addresses.virtual_ip(pip).map(|vip| (tenant_id, vip))
    }

    /// Record that a host belongs to a tenant.  A MAC may belong to only one
    /// tenant at a time.
    pub fn add_mac_mapping(
        &self,
        tenant_id: TenantId,
        mac: MacAddr,
    ) -> NvdResult<()> {
        let mut hosts = self.host_macs.write().unwrap();
        if let Some(owner) = hosts.get(&mac) {
            return Err(NvdError::Exists(format!(
                "host {mac} already belongs to tenant {owner}"
            )));
        }
        hosts.insert(mac, tenant_id);
        Ok(())
    }

    pub fn remove_mac_mapping(&self, mac: MacAddr) -> Option<TenantId> {
        self.host_macs.write().unwrap().remove(&mac)
    }

    pub fn tenant_of_mac(&self, mac: MacAddr) -> Option<TenantId> {
        self.host_macs.read().unwrap().get(&mac).copied()
    }

    /// Drop a host's MAC ownership and any translation made for its address.
    pub fn forget_host(&self, tenant: &Tenant, mac: MacAddr) {
        let removed = {
            let mut hosts = self.host_macs.write().unwrap();
            match hosts.get(&mac) {
                Some(owner) if *owner == tenant.tenant_id => hosts.remove(&mac),
                _ => None,
            }
        };
        tenant.addresses.lock().unwrap().forget_mac(mac);
        if removed.is_some() {
            debug!(self.log, "forgot host";
                "tenant_id" => %tenant.tenant_id,
                "mac" => %mac);
        }
    }

    fn translator(&self, dpid: Dpid) -> Arc<Mutex<XidTranslator>> {
        self.xids
            .lock()
            .unwrap()
            .entry(dpid)
            .or_insert_with(|| {
                Arc::new(Mutex::new(XidTranslator::new(self.xid_table_size)))
            })
            .clone()
    }

    fn translators(&self) -> Vec<Arc<Mutex<XidTranslator>>> {
        self.xids.lock().unwrap().values().cloned().collect()
    }

    /// Record an outbound request to `dpid`, returning the xid to send it
    /// with.  If the switch's table is full, its oldest unanswered request
    /// is forgotten.
    pub fn next_transaction_entry(&self, dpid: Dpid, entry: XidEntry) -> u32 {
        let (xid, evicted) = self.translator(dpid).lock().unwrap().translate(entry);
        if let Some(old) = evicted {
            debug!(self.log, "evicted unanswered transaction";
                "dpid" => %dpid,
                "tenant_id" => %old.tenant_id,
                "switch_id" => %old.switch_id,
                "xid" => old.xid);
        }
        xid
    }

    /// A fresh id tying together the requests one barrier fans out into.
    pub fn next_barrier_group(&self) -> u64 {
        let mut next = self.barriers.lock().unwrap();
        let group = *next;
        *next += 1;
        group
    }

    /// Consume the entry for a barrier reply from `dpid`.  The flag is set
    /// once no other physical switch still owes a reply to the same
    /// barrier.
    pub fn resolve_barrier_entry(
        &self,
        dpid: Dpid,
        xid: u32,
    ) -> Option<(XidEntry, bool)> {
        let _serial = self.barriers.lock().unwrap();
        let entry = self.resolve_transaction_entry(dpid, xid)?;
        let complete = match entry.barrier {
            Some(group) => !self
                .translators()
                .iter()
                .any(|xt| xt.lock().unwrap().awaits_barrier(group)),
            None => true,
        };
        Some((entry, complete))
    }

    /// Consume the entry for a reply from `dpid`.
    pub fn resolve_transaction_entry(
        &self,
        dpid: Dpid,
        xid: u32,
    ) -> Option<XidEntry> {
        let xt = self.xids.lock().unwrap().get(&dpid).cloned()?;
        let entry = xt.lock().unwrap().untranslate(xid);
        entry
    }

    pub fn pending_transactions(&self, tenant_id: TenantId) -> usize {
        self.translators()
            .iter()
            .map(|xt| xt.lock().unwrap().pending_for(tenant_id))
            .sum()
    }

    /// Drop the transaction table of a physical switch that went away.
    pub fn forget_physical_switch(&self, dpid: Dpid) {
        self.xids.lock().unwrap().remove(&dpid);
    }

    /// Remember a physical buffer for a virtual switch, returning the
    /// virtual buffer id to give its controller.
    pub fn add_buffer(
        &self,
        tenant: &Tenant,
        switch_id: SwitchId,
        dpid: Dpid,
        buffer_id: u32,
    ) -> NvdResult<u32> {
        if buffer_id == NO_BUFFER {
            return Ok(NO_BUFFER);
        }
        let mut buffers = tenant.buffers.lock().unwrap();
        let map = buffers.get_mut(&switch_id).ok_or_else(|| {
            NvdError::InvalidIdentifier(format!("no virtual switch {switch_id}"))
        })?;
        Ok(map.insert(PhysicalBuffer { dpid, buffer_id }))
    }

    pub fn lookup_buffer(
        &self,
        tenant: &Tenant,
        switch_id: SwitchId,
        buffer_id: u32,
    ) -> Option<PhysicalBuffer> {
        if buffer_id == NO_BUFFER {
            return None;
        }
        let buffers = tenant.buffers.lock().unwrap();
        buffers.get(&switch_id)?.lookup(buffer_id)
    }

    /// Count every entry any table holds for a tenant.  A removed tenant has
    /// a footprint of zero.
    pub fn tenant_footprint(&self, tenant_id: TenantId) -> usize {
        let hosts = self
            .host_macs
            .read()
            .unwrap()
            .values()
            .filter(|owner| **owner == tenant_id)
            .count();
        let owned = match self.lookup_network(tenant_id) {
            Ok(tenant) => {
                let network = tenant.network.read().unwrap();
                let buffers: usize = tenant
                    .buffers
                    .lock()
                    .unwrap()
                    .values()
                    .map(BufferMap::len)
                    .sum();
                network.switches().count()
                    + network.links().count()
                    + network.hosts().count()
                    + tenant.addresses.lock().unwrap().len()
                    + buffers
            }
            Err(_) => 0,
        };
        hosts + owned + self.pending_transactions(tenant_id)
    }
}
