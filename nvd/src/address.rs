// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Translation of tenant IP and MAC addresses to the physical addresses used
//! in the fabric.
//!
//! Every tenant owns a slice of the IPv4 space: the tenant id occupies the
//! top `tenant_prefix_bits` bits and virtual addresses are assigned host
//! offsets within it in the order they are first seen.  Because the slices
//! never overlap, a physical address alone is enough to find the tenant it
//! belongs to.  MAC addresses that do not belong to a known host get a
//! locally administered address of the form `02:TT:TT:CC:CC:CC`.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use common::network::MacAddr;
use oxnet::Ipv4Net;
use slog::debug;
use slog::trace;

use crate::openflow::BadActionCode;
use crate::registry::Registry;
use crate::registry::Tenant;
use crate::types::NvdError;
use crate::types::NvdResult;
use crate::types::TenantId;

// The highest counter value a virtual MAC can carry.
const MAC_COUNTER_MAX: u32 = 0x00ff_ffff;

/// The physical prefix reserved for a tenant.
pub fn tenant_prefix(tenant_id: TenantId, bits: u8) -> NvdResult<Ipv4Net> {
    if !(1..=24).contains(&bits) {
        return Err(NvdError::Other(format!(
            "tenant prefix length {bits} outside 1..=24"
        )));
    }
    let shift = 32 - u32::from(bits);
    if tenant_id.0 == 0 || u64::from(tenant_id.0) >= (1u64 << bits) {
        return Err(NvdError::InvalidTenantId(tenant_id));
    }
    let base = Ipv4Addr::from(tenant_id.0 << shift);
    Ipv4Net::new(base, bits).map_err(|e| NvdError::Other(e.to_string()))
}

/// The tenant whose prefix contains `pip`.
pub fn tenant_of_physical_ip(pip: Ipv4Addr, bits: u8) -> TenantId {
    TenantId(u32::from(pip) >> (32 - u32::from(bits)))
}

/// One tenant's address translations.
#[derive(Debug)]
pub struct AddressTable {
    tenant_id: TenantId,
    prefix: Ipv4Net,
    // Next host offset to hand out within `prefix`
    next_host: u32,
    ip_v2p: BTreeMap<Ipv4Addr, Ipv4Addr>,
    ip_p2v: BTreeMap<Ipv4Addr, Ipv4Addr>,
    next_mac: u32,
    mac_v2p: BTreeMap<MacAddr, MacAddr>,
    mac_p2v: BTreeMap<MacAddr, MacAddr>,
}

impl AddressTable {
    pub fn new(tenant_id: TenantId, bits: u8) -> NvdResult<Self> {
        Ok(AddressTable {
            tenant_id,
            prefix: tenant_prefix(tenant_id, bits)?,
            next_host: 1,
            ip_v2p: BTreeMap::new(),
            ip_p2v: BTreeMap::new(),
            next_mac: 1,
            mac_v2p: BTreeMap::new(),
            mac_p2v: BTreeMap::new(),
        })
    }

    pub fn prefix(&self) -> Ipv4Net {
        self.prefix
    }

    fn host_bits(&self) -> u32 {
        32 - u32::from(self.prefix.width())
    }

    fn contains(&self, pip: Ipv4Addr) -> bool {
        let shift = self.host_bits();
        u32::from(pip) >> shift == u32::from(self.prefix.addr()) >> shift
    }

    pub fn physical_ip(&self, vip: Ipv4Addr) -> Option<Ipv4Addr> {
        self.ip_v2p.get(&vip).copied()
    }

    pub fn virtual_ip(&self, pip: Ipv4Addr) -> Option<Ipv4Addr> {
        self.ip_p2v.get(&pip).copied()
    }

    /// Return the physical address for `vip`, assigning the next free one
    /// if it has none yet.
    pub fn physical_ip_or_alloc(&mut self, vip: Ipv4Addr) -> NvdResult<Ipv4Addr> {
        if let Some(pip) = self.physical_ip(vip) {
            return Ok(pip);
        }
        // The all-ones host offset is never handed out.
        let last = (1u64 << self.host_bits()) - 1;
        if u64::from(self.next_host) >= last {
            return Err(NvdError::denied(
                format!("tenant {} has no physical addresses left", self.tenant_id),
                BadActionCode::Eperm,
            ));
        }
        let pip = Ipv4Addr::from(u32::from(self.prefix.addr()) | self.next_host);
        self.next_host += 1;
        self.ip_v2p.insert(vip, pip);
        self.ip_p2v.insert(pip, vip);
        Ok(pip)
    }

    /// Record an explicit mapping.
    pub fn insert_ip(&mut self, vip: Ipv4Addr, pip: Ipv4Addr) -> NvdResult<()> {
        if !self.contains(pip) {
            return Err(NvdError::InvalidIdentifier(format!(
                "{pip} is outside tenant {}'s prefix {}",
                self.tenant_id, self.prefix
            )));
        }
        match (self.ip_v2p.get(&vip), self.ip_p2v.get(&pip)) {
            (Some(p), Some(v)) if *p == pip && *v == vip => return Ok(()),
            (None, None) => {}
            _ => {
                return Err(NvdError::Exists(format!(
                    "address mapping {vip} -> {pip}"
                )))
            }
        }
        self.ip_v2p.insert(vip, pip);
        self.ip_p2v.insert(pip, vip);
        // Keep the allocator from handing the same address out again.
        let offset = u32::from(pip) & ((1u32 << self.host_bits()) - 1);
        self.next_host = self.next_host.max(offset + 1);
        Ok(())
    }

    pub fn physical_mac(&self, vmac: MacAddr) -> Option<MacAddr> {
        self.mac_v2p.get(&vmac).copied()
    }

    pub fn virtual_mac(&self, pmac: MacAddr) -> Option<MacAddr> {
        self.mac_p2v.get(&pmac).copied()
    }

    pub fn physical_mac_or_alloc(&mut self, vmac: MacAddr) -> NvdResult<MacAddr> {
        if let Some(pmac) = self.physical_mac(vmac) {
            return Ok(pmac);
        }
        if self.next_mac > MAC_COUNTER_MAX {
            return Err(NvdError::denied(
                format!("tenant {} has no physical MACs left", self.tenant_id),
                BadActionCode::Eperm,
            ));
        }
        let t = (self.tenant_id.0 & 0xffff) as u16;
        let c = self.next_mac;
        let pmac = MacAddr::new(
            0x02,
            (t >> 8) as u8,
            t as u8,
            (c >> 16) as u8,
            (c >> 8) as u8,
            c as u8,
        );
        self.next_mac += 1;
        self.mac_v2p.insert(vmac, pmac);
        self.mac_p2v.insert(pmac, vmac);
        Ok(pmac)
    }

    /// Drop the translation for a virtual MAC.  The physical MAC is not
    /// reused.
    pub fn forget_mac(&mut self, vmac: MacAddr) -> Option<MacAddr> {
        let pmac = self.mac_v2p.remove(&vmac)?;
        self.mac_p2v.remove(&pmac);
        Some(pmac)
    }

    /// The number of live translations.
    pub fn len(&self) -> usize {
        self.ip_v2p.len() + self.mac_v2p.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lazily materializing address translation on top of the registry's
/// per-tenant tables.
pub struct AddressVirtualizer {
    log: slog::Logger,
    registry: Arc<Registry>,
}

impl AddressVirtualizer {
    pub fn new(log: &slog::Logger, registry: Arc<Registry>) -> Self {
        AddressVirtualizer {
            log: log.new(slog::o!("unit" => "addresses")),
            registry,
        }
    }

    /// The physical IP standing in for `vip` within the tenant, allocated
    /// on first use.
    pub fn virtual_to_physical(
        &self,
        vip: Ipv4Addr,
        tenant_id: TenantId,
    ) -> NvdResult<Ipv4Addr> {
        let tenant = self.registry.lookup_network(tenant_id)?;
        self.physical_ip(&tenant, vip)
    }

    /// As `virtual_to_physical()`, for a caller already holding the tenant.
    pub fn physical_ip(&self, tenant: &Tenant, vip: Ipv4Addr) -> NvdResult<Ipv4Addr> {
        let mut table = tenant.addresses.lock().unwrap();
        if let Some(pip) = table.physical_ip(vip) {
            return Ok(pip);
        }
        let pip = table.physical_ip_or_alloc(vip)?;
        debug!(self.log, "allocated physical address";
            "tenant_id" => %tenant.tenant_id,
            "virtual" => %vip,
            "physical" => %pip);
        Ok(pip)
    }

    pub fn physical_to_virtual(
        &self,
        pip: Ipv4Addr,
    ) -> Option<(TenantId, Ipv4Addr)> {
        self.registry.virtual_ip_of(pip)
    }

    /// The physical MAC standing in for `mac` within the tenant.  Hosts
    /// registered to the tenant keep their own addresses.
    pub fn virtual_to_physical_mac(
        &self,
        mac: MacAddr,
        tenant_id: TenantId,
    ) -> NvdResult<MacAddr> {
        let tenant = self.registry.lookup_network(tenant_id)?;
        self.physical_mac(&tenant, mac)
    }

    pub fn physical_mac(&self, tenant: &Tenant, mac: MacAddr) -> NvdResult<MacAddr> {
        if self.registry.tenant_of_mac(mac) == Some(tenant.tenant_id) {
            return Ok(mac);
        }
        let mut table = tenant.addresses.lock().unwrap();
        let pmac = table.physical_mac_or_alloc(mac)?;
        trace!(self.log, "virtual mac";
            "tenant_id" => %tenant.tenant_id,
            "virtual" => %mac,
            "physical" => %pmac);
        Ok(pmac)
    }

    /// The physical MAC for `mac` if one was ever assigned, without
    /// assigning one.  Used when rewriting match fields.
    pub fn existing_physical_mac(&self, tenant: &Tenant, mac: MacAddr) -> MacAddr {
        tenant.addresses.lock().unwrap().physical_mac(mac).unwrap_or(mac)
    }

    /// The inverse of `virtual_to_physical_mac()`.  Addresses with no
    /// translation are passed through unchanged.
    pub fn physical_to_virtual_mac(
        &self,
        mac: MacAddr,
        tenant_id: TenantId,
    ) -> MacAddr {
        match self.registry.lookup_network(tenant_id) {
            Ok(tenant) => self.virtual_mac(&tenant, mac),
            Err(_) => mac,
        }
    }

    pub fn virtual_mac(&self, tenant: &Tenant, mac: MacAddr) -> MacAddr {
        tenant.addresses.lock().unwrap().virtual_mac(mac).unwrap_or(mac)
    }
}
