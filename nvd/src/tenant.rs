// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Management operations: building and tearing down tenants' virtual
//! networks.
//!
//! Each operation validates everything it can before mutating anything, and
//! undoes the registry changes it already made if a later step fails.  Port
//! status notifications for active switches are sent once the tenant's
//! locks have been dropped.

use common::network::Dpid;
use common::network::MacAddr;
use oxnet::Ipv4Net;
use slog::info;
use slog::warn;

use crate::openflow::OfBody;
use crate::openflow::OfMessage;
use crate::openflow::PortStatus;
use crate::path::format_path;
use crate::path::is_contiguous;
use crate::path::parse_path;
use crate::physical::PhysicalLink;
use crate::physical::PhysicalPortRef;
use crate::routing::reverse_path;
use crate::routing::RoutingStrategy;
use crate::topology::ControllerAddr;
use crate::topology::PortChange;
use crate::topology::SwitchKind;
use crate::types::Endpoint;
use crate::types::LinkId;
use crate::types::NvdError;
use crate::types::NvdResult;
use crate::types::PortNo;
use crate::types::RouteId;
use crate::types::SwitchId;
use crate::types::TenantId;
use crate::Hypervisor;

impl Hypervisor {
    /// Create a tenant whose switches will be controlled by the controller
    /// at `protocol:host:port`.
    pub fn create_virtual_network(
        &self,
        protocol: &str,
        host: &str,
        port: u16,
        subnet: &str,
    ) -> NvdResult<TenantId> {
        let subnet: Ipv4Net = subnet.parse().map_err(|e| {
            NvdError::InvalidIdentifier(format!("bad subnet {subnet:?}: {e}"))
        })?;
        let controller = ControllerAddr {
            protocol: protocol.to_string(),
            host: host.to_string(),
            port,
        };
        let tenant = self.registry.register_network(controller.clone(), subnet)?;
        info!(self.log, "created virtual network";
            "tenant_id" => %tenant.tenant_id,
            "controller" => %controller,
            "subnet" => %subnet);
        Ok(tenant.tenant_id)
    }

    /// Create a virtual switch backed by `dpids`.  A single physical switch
    /// gives a single switch; more give a big switch routed according to the
    /// configured default.
    pub fn create_virtual_switch(
        &self,
        tenant_id: TenantId,
        dpids: &[Dpid],
    ) -> NvdResult<SwitchId> {
        self.create_virtual_switch_with_routing(
            tenant_id,
            dpids,
            self.config.default_routing,
        )
    }

    pub fn create_virtual_switch_with_routing(
        &self,
        tenant_id: TenantId,
        dpids: &[Dpid],
        routing: RoutingStrategy,
    ) -> NvdResult<SwitchId> {
        let (switch_id, controller) = {
            let physical = self.physical.read().unwrap();
            if let Some(dpid) = dpids.iter().find(|d| !physical.contains_switch(**d))
            {
                return Err(NvdError::InvalidIdentifier(format!(
                    "unknown physical switch {dpid}"
                )));
            }
            let tenant = self.registry.lookup_network(tenant_id)?;
            let kind = match dpids {
                [dpid] => SwitchKind::single(*dpid),
                _ => SwitchKind::big(dpids.to_vec(), routing),
            };
            let switch_id = self.registry.register_switch(&tenant, kind)?;
            let network = tenant.network.read().unwrap();
            let controller =
                network.booted.then(|| network.controller.clone());
            (switch_id, controller)
        };

        // Switches added to a running network come up immediately.
        if let Some(controller) = controller {
            if let Err(e) =
                self.sink.open_controller(tenant_id, switch_id, &controller)
            {
                warn!(self.log, "failed to open controller channel";
                    "tenant_id" => %tenant_id,
                    "switch_id" => %switch_id,
                    "error" => %e);
                let tenant = self.registry.lookup_network(tenant_id)?;
                self.registry.unregister_switch(&tenant, switch_id)?;
                return Err(e);
            }
        }

        info!(self.log, "created virtual switch";
            "tenant_id" => %tenant_id,
            "switch_id" => %switch_id,
            "dpids" => ?dpids);
        Ok(switch_id)
    }

    /// Attach the host `host_mac` at a physical port.  The physical switch
    /// selects the virtual switch the new edge port is added to.
    pub fn create_edge_port(
        &self,
        tenant_id: TenantId,
        dpid: Dpid,
        port: PortNo,
        host_mac: MacAddr,
    ) -> NvdResult<PortNo> {
        if host_mac.is_null() || host_mac.is_multicast() {
            return Err(NvdError::InvalidIdentifier(format!(
                "{host_mac} is not a host address"
            )));
        }
        let at = PhysicalPortRef { dpid, port };
        let (port_no, change) = {
            let physical = self.physical.read().unwrap();
            let hw_addr = physical.port(at)?.hw_addr;
            let tenant = self.registry.lookup_network(tenant_id)?;
            self.registry.add_mac_mapping(tenant_id, host_mac)?;
            let mut network = tenant.network.write().unwrap();
            match network.add_edge_port(at, hw_addr, host_mac) {
                Ok((host, change)) => (host.port_no, change),
                Err(e) => {
                    self.registry.remove_mac_mapping(host_mac);
                    return Err(e);
                }
            }
        };
        self.notify(tenant_id, change);
        info!(self.log, "created edge port";
            "tenant_id" => %tenant_id,
            "at" => %at,
            "port_no" => %port_no,
            "host" => %host_mac);
        Ok(port_no)
    }

    /// Connect two of a tenant's switches over a physical path.  Every hop
    /// must be a known link with a known reverse.
    pub fn create_virtual_link(
        &self,
        tenant_id: TenantId,
        path_spec: &str,
    ) -> NvdResult<LinkId> {
        let forward = parse_path(path_spec)?;
        if !is_contiguous(&forward) {
            return Err(NvdError::malformed(path_spec, "path is not contiguous"));
        }
        let (link_id, changes) = {
            let physical = self.physical.read().unwrap();
            for hop in &forward {
                check_link(&physical, hop)?;
                check_link(&physical, &hop.reversed())?;
            }
            let (first, last) = match (forward.first(), forward.last()) {
                (Some(first), Some(last)) => (*first, *last),
                _ => return Err(NvdError::malformed(path_spec, "empty path")),
            };
            let hw_addrs = (
                physical.port(first.src)?.hw_addr,
                physical.port(last.dst)?.hw_addr,
            );
            let reverse = reverse_path(&forward);
            let tenant = self.registry.lookup_network(tenant_id)?;
            let mut network = tenant.network.write().unwrap();
            network.add_link(forward, reverse, hw_addrs)?
        };
        for change in changes {
            self.notify(tenant_id, Some(change));
        }
        info!(self.log, "created virtual link";
            "tenant_id" => %tenant_id,
            "link_id" => %link_id,
            "path" => path_spec);
        Ok(link_id)
    }

    /// Install an explicit route between two ports of a manually routed big
    /// switch.
    pub fn create_big_switch_route(
        &self,
        tenant_id: TenantId,
        switch_id: SwitchId,
        ingress: PortNo,
        egress: PortNo,
        path_spec: &str,
    ) -> NvdResult<RouteId> {
        let path = parse_path(path_spec)?;
        let physical = self.physical.read().unwrap();
        let tenant = self.registry.lookup_network(tenant_id)?;
        let network = tenant.network.read().unwrap();
        let sw = network.switch(switch_id)?;
        let (routing, routes) = match (sw.routing(), sw.routes()) {
            (Some(routing), Some(routes)) => (routing, routes),
            _ => {
                return Err(NvdError::InvalidIdentifier(format!(
                    "switch {switch_id} is not a big switch"
                )))
            }
        };
        let from = sw.port(ingress)?.physical;
        let to = sw.port(egress)?.physical;
        let (forward, reverse) = routing.compute_route(
            &physical,
            sw.members(),
            from,
            to,
            Some(&path),
        )?;
        let route_id =
            routes.lock().unwrap().insert(ingress, egress, forward, reverse)?;
        info!(self.log, "created big switch route";
            "tenant_id" => %tenant_id,
            "switch_id" => %switch_id,
            "route_id" => %route_id,
            "ingress" => %ingress,
            "egress" => %egress,
            "path" => format_path(&path));
        Ok(route_id)
    }

    pub fn remove_big_switch_route(
        &self,
        tenant_id: TenantId,
        switch_id: SwitchId,
        route_id: RouteId,
    ) -> NvdResult<()> {
        let tenant = self.registry.lookup_network(tenant_id)?;
        let network = tenant.network.read().unwrap();
        let routes = network.switch(switch_id)?.routes().ok_or_else(|| {
            NvdError::InvalidIdentifier(format!(
                "switch {switch_id} is not a big switch"
            ))
        })?;
        routes.lock().unwrap().remove(route_id)?;
        info!(self.log, "removed big switch route";
            "tenant_id" => %tenant_id,
            "switch_id" => %switch_id,
            "route_id" => %route_id);
        Ok(())
    }

    /// Tear down a tenant along with everything registered for it.
    pub fn remove_network(&self, tenant_id: TenantId) -> NvdResult<()> {
        let tenant = self.registry.unregister_network(tenant_id)?;
        let active: Vec<SwitchId> = tenant
            .network
            .read()
            .unwrap()
            .switches()
            .filter(|sw| sw.active)
            .map(|sw| sw.switch_id)
            .collect();
        for switch_id in active {
            self.sink.close_controller(tenant_id, switch_id);
        }
        info!(self.log, "removed virtual network"; "tenant_id" => %tenant_id);
        Ok(())
    }

    pub fn remove_switch(
        &self,
        tenant_id: TenantId,
        switch_id: SwitchId,
    ) -> NvdResult<()> {
        let tenant = self.registry.lookup_network(tenant_id)?;
        let removed = self.registry.unregister_switch(&tenant, switch_id)?;
        if removed.switch.active {
            self.sink.close_controller(tenant_id, switch_id);
        }
        for change in removed.changes {
            self.notify(tenant_id, Some(change));
        }
        info!(self.log, "removed virtual switch";
            "tenant_id" => %tenant_id,
            "switch_id" => %switch_id,
            "hosts" => removed.hosts.len(),
            "links" => removed.links.len());
        Ok(())
    }

    pub fn remove_link(
        &self,
        tenant_id: TenantId,
        link_id: LinkId,
    ) -> NvdResult<()> {
        let tenant = self.registry.lookup_network(tenant_id)?;
        let (_, changes) = tenant.network.write().unwrap().remove_link(link_id)?;
        for change in changes {
            self.notify(tenant_id, Some(change));
        }
        info!(self.log, "removed virtual link";
            "tenant_id" => %tenant_id,
            "link_id" => %link_id);
        Ok(())
    }

    /// Detach a host, removing its edge port and every mapping made for it.
    pub fn remove_host(
        &self,
        tenant_id: TenantId,
        host_mac: MacAddr,
    ) -> NvdResult<()> {
        let tenant = self.registry.lookup_network(tenant_id)?;
        let (host, change) = tenant.network.write().unwrap().remove_host(host_mac)?;
        self.registry.forget_host(&tenant, host_mac);
        self.notify(tenant_id, change);
        info!(self.log, "removed host";
            "tenant_id" => %tenant_id,
            "switch_id" => %host.switch_id,
            "port_no" => %host.port_no,
            "host" => %host_mac);
        Ok(())
    }

    /// Remove one virtual port, and whatever depends on it: the host behind
    /// an edge port, or the link behind a link endpoint.
    pub fn remove_port(
        &self,
        tenant_id: TenantId,
        switch_id: SwitchId,
        port_no: PortNo,
    ) -> NvdResult<()> {
        let tenant = self.registry.lookup_network(tenant_id)?;
        let changes = {
            let mut network = tenant.network.write().unwrap();
            let host = network
                .hosts()
                .find(|h| h.switch_id == switch_id && h.port_no == port_no)
                .map(|h| h.mac);
            let changes = network.remove_port(switch_id, port_no)?;
            if let Some(mac) = host {
                self.registry.forget_host(&tenant, mac);
            }
            changes
        };
        for change in changes {
            self.notify(tenant_id, Some(change));
        }
        info!(self.log, "removed virtual port";
            "tenant_id" => %tenant_id,
            "switch_id" => %switch_id,
            "port_no" => %port_no);
        Ok(())
    }

    /// Activate every switch of a tenant and have the transport connect
    /// each to the tenant's controller.  If any channel fails to open, the
    /// ones already opened are closed again.
    pub fn boot_network(&self, tenant_id: TenantId) -> NvdResult<()> {
        let tenant = self.registry.lookup_network(tenant_id)?;
        let (controller, booted) = {
            let mut network = tenant.network.write().unwrap();
            (network.controller.clone(), network.boot())
        };

        for (i, switch_id) in booted.iter().enumerate() {
            if let Err(e) =
                self.sink.open_controller(tenant_id, *switch_id, &controller)
            {
                warn!(self.log, "failed to boot network";
                    "tenant_id" => %tenant_id,
                    "switch_id" => %switch_id,
                    "error" => %e);
                for opened in &booted[..i] {
                    self.sink.close_controller(tenant_id, *opened);
                }
                tenant.network.write().unwrap().deactivate(&booted);
                return Err(e);
            }
        }
        info!(self.log, "booted virtual network";
            "tenant_id" => %tenant_id,
            "controller" => %controller,
            "switches" => booted.len());
        Ok(())
    }

    // Tell a controller one of its switch's ports came or went.
    fn notify(&self, tenant_id: TenantId, change: Option<PortChange>) {
        let Some(change) = change else {
            return;
        };
        let msg = OfMessage::new(
            0,
            OfBody::PortStatus(PortStatus {
                reason: change.reason,
                desc: change.port.desc(),
            }),
        );
        // Failures are logged by send(), and the controller will learn the
        // port set again when it reconnects.
        let _ = self.send(
            Endpoint::Controller {
                tenant_id,
                switch_id: change.switch_id,
            },
            msg,
        );
    }
}

fn check_link(
    physical: &crate::physical::PhysicalNetwork,
    hop: &PhysicalLink,
) -> NvdResult<()> {
    if physical.has_link(hop) {
        Ok(())
    } else {
        Err(NvdError::InvalidIdentifier(format!("no physical link {hop}")))
    }
}
