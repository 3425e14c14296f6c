// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! View types, exposing a tenant's virtual network in a form suitable for
//! management clients.

use common::network::Dpid;
use common::network::MacAddr;
use oxnet::Ipv4Net;
use schemars::JsonSchema;
use serde::Serialize;

use crate::physical::PhysicalLink;
use crate::physical::PhysicalPortRef;
use crate::routing::RoutingStrategy;
use crate::topology;
use crate::topology::ControllerAddr;
use crate::types::LinkId;
use crate::types::NvdResult;
use crate::types::PortNo;
use crate::types::RouteId;
use crate::types::SwitchId;
use crate::types::TenantId;
use crate::Hypervisor;

/// A tenant's whole virtual network.
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct VirtualTopology {
    pub tenant_id: TenantId,
    /// Where the tenant's controller listens.
    pub controller: ControllerAddr,
    pub subnet: Ipv4Net,
    /// True once the network has been booted.
    pub booted: bool,
    pub switches: Vec<SwitchView>,
    pub links: Vec<LinkView>,
}

/// A virtual switch.
//
// NOTE: This is a view onto `topology::VirtualSwitch`.
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct SwitchView {
    pub switch_id: SwitchId,
    /// The datapath id the tenant's controller sees.
    pub dpid: Dpid,
    /// The physical switches backing this one, in creation order.
    pub members: Vec<Dpid>,
    /// Set for big switches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingStrategy>,
    pub active: bool,
    pub ports: Vec<PortView>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteView>,
}

impl From<&topology::VirtualSwitch> for SwitchView {
    fn from(sw: &topology::VirtualSwitch) -> Self {
        let routes = match sw.routes() {
            Some(routes) => routes
                .lock()
                .unwrap()
                .routes()
                .map(RouteView::from)
                .collect(),
            None => Vec::new(),
        };
        SwitchView {
            switch_id: sw.switch_id,
            dpid: sw.dpid(),
            members: sw.members().to_vec(),
            routing: sw.routing(),
            active: sw.active,
            ports: sw.ports().map(PortView::from).collect(),
            routes,
        }
    }
}

#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct PortView {
    pub port_no: PortNo,
    /// The physical port carrying this one's traffic.
    pub physical: PhysicalPortRef,
    pub hw_addr: MacAddr,
    pub edge: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<LinkId>,
}

impl From<&topology::VirtualPort> for PortView {
    fn from(p: &topology::VirtualPort) -> Self {
        PortView {
            port_no: p.port_no,
            physical: p.physical,
            hw_addr: p.hw_addr,
            edge: p.edge,
            link: p.link,
        }
    }
}

#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct LinkView {
    pub link_id: LinkId,
    pub src: (SwitchId, PortNo),
    pub dst: (SwitchId, PortNo),
    pub path: Vec<PhysicalLink>,
}

impl From<&topology::VirtualLink> for LinkView {
    fn from(l: &topology::VirtualLink) -> Self {
        LinkView {
            link_id: l.link_id,
            src: l.src,
            dst: l.dst,
            path: l.forward.clone(),
        }
    }
}

#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct RouteView {
    pub route_id: RouteId,
    pub ingress: PortNo,
    pub egress: PortNo,
    pub path: Vec<PhysicalLink>,
}

impl From<&topology::SwitchRoute> for RouteView {
    fn from(r: &topology::SwitchRoute) -> Self {
        RouteView {
            route_id: r.route_id,
            ingress: r.ingress,
            egress: r.egress,
            path: r.forward.clone(),
        }
    }
}

/// A host attached to an edge port.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
pub struct HostView {
    pub mac: MacAddr,
    pub switch_id: SwitchId,
    pub port_no: PortNo,
}

impl From<&topology::Host> for HostView {
    fn from(h: &topology::Host) -> Self {
        HostView {
            mac: h.mac,
            switch_id: h.switch_id,
            port_no: h.port_no,
        }
    }
}

impl Hypervisor {
    pub fn virtual_topology(
        &self,
        tenant_id: TenantId,
    ) -> NvdResult<VirtualTopology> {
        let tenant = self.registry.lookup_network(tenant_id)?;
        let network = tenant.network.read().unwrap();
        Ok(VirtualTopology {
            tenant_id,
            controller: network.controller.clone(),
            subnet: network.subnet,
            booted: network.booted,
            switches: network.switches().map(SwitchView::from).collect(),
            links: network.links().map(LinkView::from).collect(),
        })
    }

    pub fn list_hosts(&self, tenant_id: TenantId) -> NvdResult<Vec<HostView>> {
        let tenant = self.registry.lookup_network(tenant_id)?;
        let network = tenant.network.read().unwrap();
        Ok(network.hosts().map(HostView::from).collect())
    }
}
