// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The virtual topology a tenant's controller sees: switches, ports, links,
//! big-switch routes and attached hosts.

use std::collections::BTreeMap;
use std::sync::Mutex;

use common::network::Dpid;
use common::network::MacAddr;
use oxnet::Ipv4Net;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use crate::index::IdPool;
use crate::openflow::PortDesc;
use crate::openflow::PortReason;
use crate::physical::PhysicalLink;
use crate::physical::PhysicalPortRef;
use crate::routing::RoutingStrategy;
use crate::types::LinkId;
use crate::types::NvdError;
use crate::types::NvdResult;
use crate::types::PortNo;
use crate::types::RouteId;
use crate::types::SwitchId;
use crate::types::TenantId;

/// Where a tenant's controller listens.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct ControllerAddr {
    pub protocol: String,
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for ControllerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.protocol, self.host, self.port)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualPort {
    pub port_no: PortNo,
    pub physical: PhysicalPortRef,
    pub hw_addr: MacAddr,
    /// The port faces an end host rather than another virtual switch.
    pub edge: bool,
    /// Set when the port is an endpoint of a virtual link.
    pub link: Option<LinkId>,
}

impl VirtualPort {
    pub fn desc(&self) -> PortDesc {
        PortDesc {
            port_no: self.port_no,
            hw_addr: self.hw_addr,
            name: format!("vport{}", self.port_no),
        }
    }
}

/// A port added to or removed from a switch whose controller must be told.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortChange {
    pub switch_id: SwitchId,
    pub reason: PortReason,
    pub port: VirtualPort,
}

/// A path between two ports of a big switch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwitchRoute {
    pub route_id: RouteId,
    pub ingress: PortNo,
    pub egress: PortNo,
    pub forward: Vec<PhysicalLink>,
    pub reverse: Vec<PhysicalLink>,
}

pub struct RouteTable {
    ids: IdPool,
    routes: BTreeMap<RouteId, SwitchRoute>,
    by_ports: BTreeMap<(PortNo, PortNo), RouteId>,
}

impl Default for RouteTable {
    fn default() -> Self {
        RouteTable {
            ids: IdPool::new("routes", 1, u32::MAX),
            routes: BTreeMap::new(),
            by_ports: BTreeMap::new(),
        }
    }
}

impl RouteTable {
    pub fn insert(
        &mut self,
        ingress: PortNo,
        egress: PortNo,
        forward: Vec<PhysicalLink>,
        reverse: Vec<PhysicalLink>,
    ) -> NvdResult<RouteId> {
        if self.by_ports.contains_key(&(ingress, egress)) {
            return Err(NvdError::Exists(format!(
                "route from port {ingress} to port {egress}"
            )));
        }
        let route_id = RouteId(self.ids.alloc()?);
        self.by_ports.insert((ingress, egress), route_id);
        self.routes.insert(
            route_id,
            SwitchRoute {
                route_id,
                ingress,
                egress,
                forward,
                reverse,
            },
        );
        Ok(route_id)
    }

    pub fn remove(&mut self, route_id: RouteId) -> NvdResult<SwitchRoute> {
        let route = self.routes.remove(&route_id).ok_or_else(|| {
            NvdError::InvalidIdentifier(format!("no route {route_id}"))
        })?;
        self.by_ports.remove(&(route.ingress, route.egress));
        self.ids.free(route_id.0);
        Ok(route)
    }

    /// Drop every route starting or ending at `port`.
    pub fn remove_touching(&mut self, port: PortNo) -> Vec<SwitchRoute> {
        let ids: Vec<RouteId> = self
            .routes
            .values()
            .filter(|r| r.ingress == port || r.egress == port)
            .map(|r| r.route_id)
            .collect();
        ids.into_iter().filter_map(|id| self.remove(id).ok()).collect()
    }

    /// The path from `from` to `to`: either a route installed in that
    /// direction, or the reverse of one installed the other way.
    pub fn path_between(
        &self,
        from: PortNo,
        to: PortNo,
    ) -> Option<Vec<PhysicalLink>> {
        if let Some(id) = self.by_ports.get(&(from, to)) {
            return self.routes.get(id).map(|r| r.forward.clone());
        }
        self.by_ports
            .get(&(to, from))
            .and_then(|id| self.routes.get(id))
            .map(|r| r.reverse.clone())
    }

    pub fn get(&self, route_id: RouteId) -> Option<&SwitchRoute> {
        self.routes.get(&route_id)
    }

    pub fn routes(&self) -> impl Iterator<Item = &SwitchRoute> {
        self.routes.values()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// The two shapes of virtual switch.
pub enum SwitchKind {
    /// Backed by exactly one physical switch.
    Single { dpid: Dpid },
    /// Spans several physical switches, forwarding between them along
    /// routes.  The route table sits behind its own lock so routes can be
    /// computed on demand while the topology is only read-locked.
    Big {
        members: Vec<Dpid>,
        routing: RoutingStrategy,
        routes: Mutex<RouteTable>,
    },
}

impl SwitchKind {
    pub fn single(dpid: Dpid) -> Self {
        SwitchKind::Single { dpid }
    }

    pub fn big(members: Vec<Dpid>, routing: RoutingStrategy) -> Self {
        SwitchKind::Big {
            members,
            routing,
            routes: Mutex::new(RouteTable::default()),
        }
    }

    pub fn members(&self) -> &[Dpid] {
        match self {
            SwitchKind::Single { dpid } => std::slice::from_ref(dpid),
            SwitchKind::Big { members, .. } => members,
        }
    }
}

pub struct VirtualSwitch {
    pub switch_id: SwitchId,
    pub tenant_id: TenantId,
    pub kind: SwitchKind,
    /// The controller-facing side has been booted.
    pub active: bool,
    ports: BTreeMap<PortNo, VirtualPort>,
    port_ids: IdPool,
}

impl VirtualSwitch {
    fn new(tenant_id: TenantId, switch_id: SwitchId, kind: SwitchKind) -> Self {
        VirtualSwitch {
            switch_id,
            tenant_id,
            kind,
            active: false,
            ports: BTreeMap::new(),
            port_ids: IdPool::new("virtual_ports", 1, u32::from(PortNo::MAX.0) + 1),
        }
    }

    /// The datapath id presented to the tenant's controller.
    pub fn dpid(&self) -> Dpid {
        Dpid((u64::from(self.tenant_id.0) << 32) | u64::from(self.switch_id.0))
    }

    /// Whether traffic between two of this switch's ports may need to cross
    /// physical links.
    pub fn has_internal_routing(&self) -> bool {
        matches!(self.kind, SwitchKind::Big { .. })
    }

    pub fn members(&self) -> &[Dpid] {
        self.kind.members()
    }

    pub fn is_member(&self, dpid: Dpid) -> bool {
        self.members().contains(&dpid)
    }

    pub fn routing(&self) -> Option<RoutingStrategy> {
        match &self.kind {
            SwitchKind::Single { .. } => None,
            SwitchKind::Big { routing, .. } => Some(*routing),
        }
    }

    pub fn routes(&self) -> Option<&Mutex<RouteTable>> {
        match &self.kind {
            SwitchKind::Single { .. } => None,
            SwitchKind::Big { routes, .. } => Some(routes),
        }
    }

    pub fn port(&self, port_no: PortNo) -> NvdResult<&VirtualPort> {
        self.ports.get(&port_no).ok_or_else(|| {
            NvdError::InvalidIdentifier(format!(
                "switch {} has no port {port_no}",
                self.switch_id
            ))
        })
    }

    pub fn ports(&self) -> impl Iterator<Item = &VirtualPort> {
        self.ports.values()
    }

    /// The port wrapping `physical`, if this switch has one.
    pub fn port_on(&self, physical: PhysicalPortRef) -> Option<&VirtualPort> {
        self.ports.values().find(|p| p.physical == physical)
    }

    fn add_port(
        &mut self,
        physical: PhysicalPortRef,
        hw_addr: MacAddr,
        edge: bool,
        link: Option<LinkId>,
    ) -> NvdResult<VirtualPort> {
        if !self.is_member(physical.dpid) {
            return Err(NvdError::InvalidIdentifier(format!(
                "switch {} is not backed by {}",
                self.switch_id, physical.dpid
            )));
        }
        if self.port_on(physical).is_some() {
            return Err(NvdError::Exists(format!(
                "physical port {physical} already has a virtual port"
            )));
        }
        let port_no = PortNo(self.port_ids.alloc()? as u16);
        let port = VirtualPort {
            port_no,
            physical,
            hw_addr,
            edge,
            link,
        };
        self.ports.insert(port_no, port.clone());
        Ok(port)
    }

    fn remove_port(&mut self, port_no: PortNo) -> NvdResult<VirtualPort> {
        let port = self.ports.remove(&port_no).ok_or_else(|| {
            NvdError::InvalidIdentifier(format!(
                "switch {} has no port {port_no}",
                self.switch_id
            ))
        })?;
        self.port_ids.free(u32::from(port_no.0));
        if let Some(routes) = self.routes() {
            routes.lock().unwrap().remove_touching(port_no);
        }
        Ok(port)
    }

    fn change(&self, reason: PortReason, port: VirtualPort) -> Option<PortChange> {
        self.active.then_some(PortChange {
            switch_id: self.switch_id,
            reason,
            port,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualLink {
    pub link_id: LinkId,
    pub src: (SwitchId, PortNo),
    pub dst: (SwitchId, PortNo),
    pub forward: Vec<PhysicalLink>,
    pub reverse: Vec<PhysicalLink>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Host {
    pub mac: MacAddr,
    pub switch_id: SwitchId,
    pub port_no: PortNo,
}

/// Everything torn down along with a switch.
pub struct RemovedSwitch {
    pub switch: VirtualSwitch,
    pub hosts: Vec<Host>,
    pub links: Vec<VirtualLink>,
    pub changes: Vec<PortChange>,
}

/// One tenant's virtual network.
pub struct VirtualNetwork {
    pub tenant_id: TenantId,
    pub controller: ControllerAddr,
    pub subnet: Ipv4Net,
    pub booted: bool,
    /// Set once the network has been unregistered.
    pub retired: bool,
    switches: BTreeMap<SwitchId, VirtualSwitch>,
    switch_ids: IdPool,
    // Which virtual switch each backing physical switch belongs to.
    dpid_index: BTreeMap<Dpid, SwitchId>,
    links: BTreeMap<LinkId, VirtualLink>,
    link_ids: IdPool,
    hosts: BTreeMap<MacAddr, Host>,
}

impl VirtualNetwork {
    pub fn new(
        tenant_id: TenantId,
        controller: ControllerAddr,
        subnet: Ipv4Net,
    ) -> Self {
        VirtualNetwork {
            tenant_id,
            controller,
            subnet,
            booted: false,
            retired: false,
            switches: BTreeMap::new(),
            switch_ids: IdPool::new("virtual_switches", 1, u32::MAX),
            dpid_index: BTreeMap::new(),
            links: BTreeMap::new(),
            link_ids: IdPool::new("virtual_links", 1, u32::MAX),
            hosts: BTreeMap::new(),
        }
    }

    pub fn add_switch(&mut self, kind: SwitchKind) -> NvdResult<SwitchId> {
        let members = kind.members();
        if members.is_empty() {
            return Err(NvdError::InvalidIdentifier(
                "a virtual switch needs at least one physical switch".into(),
            ));
        }
        for (i, dpid) in members.iter().enumerate() {
            if members[..i].contains(dpid) {
                return Err(NvdError::InvalidIdentifier(format!(
                    "physical switch {dpid} listed twice"
                )));
            }
            if let Some(owner) = self.dpid_index.get(dpid) {
                return Err(NvdError::Exists(format!(
                    "physical switch {dpid} already backs switch {owner}"
                )));
            }
        }
        let switch_id = SwitchId(self.switch_ids.alloc()?);
        for dpid in members {
            self.dpid_index.insert(*dpid, switch_id);
        }
        let mut sw = VirtualSwitch::new(self.tenant_id, switch_id, kind);
        sw.active = self.booted;
        self.switches.insert(switch_id, sw);
        Ok(switch_id)
    }

    /// Remove a switch with all of its ports, the hosts on them, every link
    /// with an end on it, and its routes.
    pub fn remove_switch(
        &mut self,
        switch_id: SwitchId,
    ) -> NvdResult<RemovedSwitch> {
        self.switch(switch_id)?;

        let link_ids: Vec<LinkId> = self
            .links
            .values()
            .filter(|l| l.src.0 == switch_id || l.dst.0 == switch_id)
            .map(|l| l.link_id)
            .collect();
        let mut links = Vec::new();
        let mut changes = Vec::new();
        for link_id in link_ids {
            let (link, link_changes) = self.remove_link(link_id)?;
            links.push(link);
            changes.extend(
                link_changes.into_iter().filter(|c| c.switch_id != switch_id),
            );
        }

        let hosts: Vec<Host> =
            self.hosts.values().filter(|h| h.switch_id == switch_id).cloned().collect();
        for host in &hosts {
            self.hosts.remove(&host.mac);
        }

        let switch = self.switches.remove(&switch_id).ok_or_else(|| {
            NvdError::Invariant(format!("switch {switch_id} vanished"))
        })?;
        for dpid in switch.members() {
            self.dpid_index.remove(dpid);
        }
        self.switch_ids.free(switch_id.0);
        Ok(RemovedSwitch {
            switch,
            hosts,
            links,
            changes,
        })
    }

    pub fn switch(&self, switch_id: SwitchId) -> NvdResult<&VirtualSwitch> {
        self.switches.get(&switch_id).ok_or_else(|| {
            NvdError::InvalidIdentifier(format!("no virtual switch {switch_id}"))
        })
    }

    pub fn switches(&self) -> impl Iterator<Item = &VirtualSwitch> {
        self.switches.values()
    }

    /// The virtual switch a physical switch backs, if any.
    pub fn switch_for_dpid(&self, dpid: Dpid) -> Option<SwitchId> {
        self.dpid_index.get(&dpid).copied()
    }

    /// The virtual switch and port wrapping a physical port, if any.
    pub fn port_owner(
        &self,
        physical: PhysicalPortRef,
    ) -> Option<(&VirtualSwitch, &VirtualPort)> {
        let sw = self.switches.get(&self.switch_for_dpid(physical.dpid)?)?;
        sw.port_on(physical).map(|p| (sw, p))
    }

    /// Attach a host at a physical port, creating the edge port for it on
    /// whichever virtual switch the physical switch backs.
    pub fn add_edge_port(
        &mut self,
        physical: PhysicalPortRef,
        hw_addr: MacAddr,
        host_mac: MacAddr,
    ) -> NvdResult<(Host, Option<PortChange>)> {
        if self.hosts.contains_key(&host_mac) {
            return Err(NvdError::Exists(format!("host {host_mac}")));
        }
        let switch_id = self.switch_for_dpid(physical.dpid).ok_or_else(|| {
            NvdError::InvalidIdentifier(format!(
                "tenant {} has no switch on {}",
                self.tenant_id, physical.dpid
            ))
        })?;
        let sw = self.switch_mut(switch_id)?;
        let port = sw.add_port(physical, hw_addr, true, None)?;
        let change = sw.change(PortReason::Add, port.clone());
        let host = Host {
            mac: host_mac,
            switch_id,
            port_no: port.port_no,
        };
        self.hosts.insert(host_mac, host.clone());
        Ok((host, change))
    }

    /// Detach a host, removing its edge port.
    pub fn remove_host(
        &mut self,
        host_mac: MacAddr,
    ) -> NvdResult<(Host, Option<PortChange>)> {
        let host = self.hosts.remove(&host_mac).ok_or_else(|| {
            NvdError::InvalidIdentifier(format!("no host {host_mac}"))
        })?;
        let sw = self.switch_mut(host.switch_id)?;
        let port = sw.remove_port(host.port_no).map_err(|e| {
            NvdError::Invariant(format!("host {host_mac} had no port: {e}"))
        })?;
        let change = sw.change(PortReason::Delete, port);
        Ok((host, change))
    }

    /// Remove a port.  Removing an edge port removes its host, and removing
    /// a link endpoint removes the link with its other end.
    pub fn remove_port(
        &mut self,
        switch_id: SwitchId,
        port_no: PortNo,
    ) -> NvdResult<Vec<PortChange>> {
        let port = self.switch(switch_id)?.port(port_no)?.clone();
        if let Some(link_id) = port.link {
            return Ok(self.remove_link(link_id)?.1);
        }
        if port.edge {
            let mac = self
                .hosts
                .values()
                .find(|h| h.switch_id == switch_id && h.port_no == port_no)
                .map(|h| h.mac);
            if let Some(mac) = mac {
                return Ok(self.remove_host(mac)?.1.into_iter().collect());
            }
        }
        let sw = self.switch_mut(switch_id)?;
        let port = sw.remove_port(port_no)?;
        Ok(sw.change(PortReason::Delete, port).into_iter().collect())
    }

    /// Create a virtual link over `forward`, whose first hop leaves one of
    /// this tenant's switches and whose last hop arrives at another.
    pub fn add_link(
        &mut self,
        forward: Vec<PhysicalLink>,
        reverse: Vec<PhysicalLink>,
        hw_addrs: (MacAddr, MacAddr),
    ) -> NvdResult<(LinkId, Vec<PortChange>)> {
        let (first, last) = match (forward.first(), forward.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => {
                return Err(NvdError::InvalidIdentifier(
                    "a virtual link needs at least one hop".into(),
                ))
            }
        };
        let src_sw = self.switch_for_dpid(first.src.dpid).ok_or_else(|| {
            NvdError::InvalidIdentifier(format!(
                "tenant {} has no switch on {}",
                self.tenant_id, first.src.dpid
            ))
        })?;
        let dst_sw = self.switch_for_dpid(last.dst.dpid).ok_or_else(|| {
            NvdError::InvalidIdentifier(format!(
                "tenant {} has no switch on {}",
                self.tenant_id, last.dst.dpid
            ))
        })?;
        if src_sw == dst_sw {
            return Err(NvdError::InvalidIdentifier(format!(
                "link would loop back to switch {src_sw}"
            )));
        }
        for (sw, physical) in [(src_sw, first.src), (dst_sw, last.dst)] {
            if self.switch(sw)?.port_on(physical).is_some() {
                return Err(NvdError::Exists(format!(
                    "physical port {physical} already has a virtual port"
                )));
            }
        }

        let link_id = LinkId(self.link_ids.alloc()?);
        let added = self
            .switch_mut(src_sw)?
            .add_port(first.src, hw_addrs.0, false, Some(link_id))
            .and_then(|src_port| {
                self.switch_mut(dst_sw)?
                    .add_port(last.dst, hw_addrs.1, false, Some(link_id))
                    .map(|dst_port| (src_port, dst_port))
            });
        let (src_port, dst_port) = match added {
            Ok(ports) => ports,
            Err(e) => {
                // Only the first port can have been added.
                let sw = self.switch_mut(src_sw)?;
                if let Some(p) = sw.port_on(first.src).map(|p| p.port_no) {
                    let _ = sw.remove_port(p);
                }
                self.link_ids.free(link_id.0);
                return Err(e);
            }
        };

        let mut changes = Vec::new();
        changes.extend(
            self.switch(src_sw)?.change(PortReason::Add, src_port.clone()),
        );
        changes.extend(
            self.switch(dst_sw)?.change(PortReason::Add, dst_port.clone()),
        );
        self.links.insert(
            link_id,
            VirtualLink {
                link_id,
                src: (src_sw, src_port.port_no),
                dst: (dst_sw, dst_port.port_no),
                forward,
                reverse,
            },
        );
        Ok((link_id, changes))
    }

    pub fn remove_link(
        &mut self,
        link_id: LinkId,
    ) -> NvdResult<(VirtualLink, Vec<PortChange>)> {
        let link = self.links.remove(&link_id).ok_or_else(|| {
            NvdError::InvalidIdentifier(format!("no virtual link {link_id}"))
        })?;
        self.link_ids.free(link_id.0);
        let mut changes = Vec::new();
        for (switch_id, port_no) in [link.src, link.dst] {
            let sw = self.switch_mut(switch_id)?;
            let port = sw.remove_port(port_no).map_err(|e| {
                NvdError::Invariant(format!("link {link_id} endpoint: {e}"))
            })?;
            changes.extend(sw.change(PortReason::Delete, port));
        }
        Ok((link, changes))
    }

    pub fn link(&self, link_id: LinkId) -> Option<&VirtualLink> {
        self.links.get(&link_id)
    }

    pub fn links(&self) -> impl Iterator<Item = &VirtualLink> {
        self.links.values()
    }

    pub fn host(&self, mac: MacAddr) -> Option<&Host> {
        self.hosts.get(&mac)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    /// Mark the network and every switch in it booted, returning the
    /// switches whose controller channels now need opening.
    pub fn boot(&mut self) -> Vec<SwitchId> {
        self.booted = true;
        self.switches
            .values_mut()
            .filter(|sw| !sw.active)
            .map(|sw| {
                sw.active = true;
                sw.switch_id
            })
            .collect()
    }

    pub fn deactivate(&mut self, switch_ids: &[SwitchId]) {
        for id in switch_ids {
            if let Some(sw) = self.switches.get_mut(id) {
                sw.active = false;
            }
        }
        if self.switches.values().all(|sw| !sw.active) {
            self.booted = false;
        }
    }

    fn switch_mut(&mut self, switch_id: SwitchId) -> NvdResult<&mut VirtualSwitch> {
        self.switches.get_mut(&switch_id).ok_or_else(|| {
            NvdError::InvalidIdentifier(format!("no virtual switch {switch_id}"))
        })
    }
}
