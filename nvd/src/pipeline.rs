// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Translation of control messages across the virtual/physical boundary.
//!
//! Messages from a tenant's controller are "devirtualized": virtual ports,
//! addresses, buffer ids and transaction ids are replaced by their physical
//! counterparts, and a single virtual request may fan out into several
//! physical ones.  Messages from the fabric are "virtualized" on the way
//! back: replies are matched to the request that caused them, and
//! asynchronous events are routed to the tenants owning the ports involved.
//!
//! All translation happens with the relevant locks held, but nothing is sent
//! until every lock has been released.

use std::net::Ipv4Addr;

use common::network::Dpid;
use slog::debug;
use slog::error;
use slog::trace;
use slog::warn;

use crate::openflow::Action;
use crate::openflow::BadActionCode;
use crate::openflow::BadRequestCode;
use crate::openflow::ErrorKind;
use crate::openflow::FeaturesReply;
use crate::openflow::FlowMod;
use crate::openflow::FlowModFailedCode;
use crate::openflow::FlowRemoved;
use crate::openflow::Match;
use crate::openflow::OfBody;
use crate::openflow::OfMessage;
use crate::openflow::PacketIn;
use crate::openflow::PacketOut;
use crate::openflow::PortReason;
use crate::openflow::PortStatus;
use crate::openflow::NO_BUFFER;
use crate::physical::PhysicalLink;
use crate::physical::PhysicalNetwork;
use crate::physical::PhysicalPortRef;
use crate::registry::Tenant;
use crate::topology::ControllerAddr;
use crate::topology::VirtualPort;
use crate::topology::VirtualSwitch;
use crate::types::Endpoint;
use crate::types::NvdError;
use crate::types::NvdResult;
use crate::types::PortNo;
use crate::types::SwitchId;
use crate::types::TenantId;
use crate::xid::XidEntry;
use crate::Hypervisor;

/// The transport: delivers messages to physical switches and to tenant
/// controllers, and manages the controller channels.
pub trait MessageSink: Send + Sync {
    fn send(&self, to: Endpoint, msg: OfMessage) -> NvdResult<()>;

    /// Open the channel between a booted virtual switch and its tenant's
    /// controller.
    fn open_controller(
        &self,
        tenant_id: TenantId,
        switch_id: SwitchId,
        controller: &ControllerAddr,
    ) -> NvdResult<()>;

    fn close_controller(&self, tenant_id: TenantId, switch_id: SwitchId);
}

// The kind of request being devirtualized, which decides how a failure is
// reported back to the controller.
#[derive(Clone, Copy, Debug)]
enum Request {
    FlowMod,
    PacketOut,
    Barrier,
}

// What became of a controller message once translated.
enum Outcome {
    // Answered by the hypervisor itself
    Reply(OfBody),
    Rejected(Request, NvdError),
    // Physical messages, already carrying their transaction ids
    Forward(Vec<(Dpid, OfMessage)>),
}

/// The OpenFlow error returned to a controller whose request could not be
/// translated.  Failures that are not the request's fault get no reply.
fn error_reply(err: &NvdError, request: Request) -> Option<ErrorKind> {
    match (err, request) {
        (NvdError::ActionVirtualizationDenied { code, .. }, _) => {
            Some(ErrorKind::BadAction(*code))
        }
        (NvdError::RouteComputationFailed(_), _) => {
            Some(ErrorKind::BadAction(BadActionCode::BadOutPort))
        }
        (NvdError::InvalidIdentifier(_), Request::FlowMod) => {
            Some(ErrorKind::FlowModFailed(FlowModFailedCode::Eperm))
        }
        (NvdError::TableFull(_), Request::FlowMod) => {
            Some(ErrorKind::FlowModFailed(FlowModFailedCode::AllTablesFull))
        }
        (NvdError::InvalidIdentifier(_), _) | (NvdError::TableFull(_), _) => {
            Some(ErrorKind::BadRequest(BadRequestCode::Eperm))
        }
        _ => None,
    }
}

// A physical message bound for one switch, before its xid is assigned.
type Outbound = (Dpid, OfBody);

// The flow entries one virtual flow becomes on a single physical switch.
#[derive(Debug)]
struct Hop {
    dpid: Dpid,
    flow_match: Match,
    actions: Vec<Action>,
}

impl Hop {
    // Actions after the last output affect nothing.
    fn trim(&mut self) {
        while let Some(last) = self.actions.last() {
            if matches!(last, Action::Output { .. } | Action::Enqueue { .. }) {
                break;
            }
            self.actions.pop();
        }
    }
}

/// Everything needed to translate one controller message: the tenant, the
/// virtual switch it addressed, and the physical network, all locked for the
/// duration.
struct Translation<'a> {
    hv: &'a Hypervisor,
    physical: &'a PhysicalNetwork,
    tenant: &'a Tenant,
    sw: &'a VirtualSwitch,
    // Whether the switch spans physical switches
    routed: bool,
}

impl<'a> Translation<'a> {
    fn new(
        hv: &'a Hypervisor,
        physical: &'a PhysicalNetwork,
        tenant: &'a Tenant,
        sw: &'a VirtualSwitch,
    ) -> Self {
        Translation {
            hv,
            physical,
            tenant,
            sw,
            routed: sw.has_internal_routing(),
        }
    }

    // The target of an output action.  A port the switch doesn't have is
    // the action's fault, not the message's.
    fn out_port(&self, port_no: PortNo) -> NvdResult<&'a VirtualPort> {
        self.sw.port(port_no).map_err(|_| {
            NvdError::denied(
                format!("switch {} has no port {port_no}", self.sw.switch_id),
                BadActionCode::BadOutPort,
            )
        })
    }

    // Translate an action that rewrites packet headers.  Vendor actions are
    // advisory and dropped.
    fn rewrite(&self, action: &Action) -> NvdResult<Option<Action>> {
        let av = &self.hv.addresses;
        Ok(match action {
            Action::SetDlSrc(mac) => {
                Some(Action::SetDlSrc(av.physical_mac(self.tenant, *mac)?))
            }
            Action::SetDlDst(mac) => {
                Some(Action::SetDlDst(av.physical_mac(self.tenant, *mac)?))
            }
            Action::SetNwSrc(ip) => {
                Some(Action::SetNwSrc(av.physical_ip(self.tenant, *ip)?))
            }
            Action::SetNwDst(ip) => {
                Some(Action::SetNwDst(av.physical_ip(self.tenant, *ip)?))
            }
            Action::Vendor { vendor, .. } => {
                debug!(self.hv.log, "skipping vendor action";
                    "tenant_id" => %self.tenant.tenant_id,
                    "vendor" => vendor);
                None
            }
            Action::Output { .. } | Action::Enqueue { .. } => {
                return Err(NvdError::Invariant(
                    "output actions are not rewrites".into(),
                ))
            }
            other => Some(other.clone()),
        })
    }

    /// The path across the big switch from one of its ports to another,
    /// computing and caching it if the switch routes on demand.
    fn route(
        &self,
        from: &VirtualPort,
        to: &VirtualPort,
    ) -> NvdResult<Vec<PhysicalLink>> {
        let routes = self.sw.routes().ok_or_else(|| {
            NvdError::RouteComputationFailed(format!(
                "switch {} has no internal routing",
                self.sw.switch_id
            ))
        })?;
        let mut table = routes.lock().unwrap();
        let path = match table.path_between(from.port_no, to.port_no) {
            Some(path) => path,
            None => {
                let routing = self.sw.routing().unwrap_or_default();
                let (forward, reverse) = routing.compute_route(
                    self.physical,
                    self.sw.members(),
                    from.physical,
                    to.physical,
                    None,
                )?;
                let route_id = table.insert(
                    from.port_no,
                    to.port_no,
                    forward.clone(),
                    reverse,
                )?;
                debug!(self.hv.log, "computed route";
                    "tenant_id" => %self.tenant.tenant_id,
                    "switch_id" => %self.sw.switch_id,
                    "route_id" => %route_id,
                    "path" => crate::path::format_path(&forward));
                forward
            }
        };
        match (path.first(), path.last()) {
            (Some(first), Some(last))
                if first.src.dpid == from.physical.dpid
                    && last.dst.dpid == to.physical.dpid =>
            {
                Ok(path)
            }
            _ => Err(NvdError::RouteComputationFailed(format!(
                "route from port {} to port {} does not join {} to {}",
                from.port_no, to.port_no, from.physical.dpid, to.physical.dpid
            ))),
        }
    }

    fn flow_mod(&self, fm: FlowMod) -> NvdResult<Vec<Outbound>> {
        // A wildcarded input port becomes one flow per virtual port, so the
        // flow can't match another tenant's traffic.
        let ingress: Vec<&'a VirtualPort> = match fm.flow_match.in_port {
            Some(port_no) => vec![self.sw.port(port_no)?],
            None => self.sw.ports().collect(),
        };
        let out_port = if fm.out_port.is_reserved() {
            fm.out_port
        } else {
            self.sw.port(fm.out_port)?.physical.port
        };
        // The buffered packet can only be released by one flow, on the
        // switch holding it.  A missing mapping means no buffer.
        let mut buffer = self.hv.registry.lookup_buffer(
            self.tenant,
            self.sw.switch_id,
            fm.buffer_id,
        );

        let mut out = Vec::new();
        for port in ingress {
            let mut flow = FlowBuilder::new(self, port, &fm.flow_match)?;
            for action in &fm.actions {
                flow.apply(action)?;
            }
            let (local, remote) = flow.finish();

            let buffer_id = match buffer {
                Some(b) if b.dpid == local.dpid => {
                    buffer = None;
                    b.buffer_id
                }
                _ => NO_BUFFER,
            };
            out.push((
                local.dpid,
                OfBody::FlowMod(derive_flow_mod(&fm, local, buffer_id, out_port)),
            ));
            for hop in remote {
                out.push((
                    hop.dpid,
                    OfBody::FlowMod(derive_flow_mod(
                        &fm,
                        hop,
                        NO_BUFFER,
                        PortNo::NONE,
                    )),
                ));
            }
        }
        Ok(out)
    }

    // Resolve an output port of a packet-out to the physical switch and
    // port the packet leaves through.
    fn packet_out_targets(
        &self,
        port: PortNo,
        ingress: Option<&'a VirtualPort>,
    ) -> NvdResult<Vec<(Dpid, PortNo)>> {
        let local = |p: &VirtualPort| match ingress {
            Some(i) if i.port_no == p.port_no => (p.physical.dpid, PortNo::IN_PORT),
            _ => (p.physical.dpid, p.physical.port),
        };
        Ok(match port {
            PortNo::FLOOD | PortNo::ALL => self
                .sw
                .ports()
                .filter(|p| ingress.map(|i| i.port_no) != Some(p.port_no))
                .map(local)
                .collect(),
            PortNo::IN_PORT => match ingress {
                Some(i) => vec![(i.physical.dpid, PortNo::IN_PORT)],
                None => {
                    return Err(NvdError::denied(
                        "output to the input port of a packet without one",
                        BadActionCode::BadOutPort,
                    ))
                }
            },
            PortNo::CONTROLLER => {
                let dpid = match ingress {
                    Some(i) => i.physical.dpid,
                    None => self.first_member()?,
                };
                vec![(dpid, PortNo::CONTROLLER)]
            }
            PortNo::NONE => {
                return Err(NvdError::denied(
                    "output to no port",
                    BadActionCode::BadOutPort,
                ))
            }
            p if p.is_reserved() => {
                return Err(NvdError::denied(
                    format!("output to reserved port {p}"),
                    BadActionCode::Eperm,
                ))
            }
            p => vec![local(self.out_port(p)?)],
        })
    }

    /// Split a packet-out into one packet-out per physical switch with an
    /// output on it.
    fn packet_out(&self, po: PacketOut) -> NvdResult<Vec<Outbound>> {
        let ingress = if po.in_port.is_reserved() {
            None
        } else {
            Some(self.sw.port(po.in_port)?)
        };
        let buffer = self.hv.registry.lookup_buffer(
            self.tenant,
            self.sw.switch_id,
            po.buffer_id,
        );

        // Per switch: the actions so far, and how many of the shared header
        // rewrites have been applied to them.
        let mut groups: Vec<(Dpid, Vec<Action>, usize)> = Vec::new();
        let mut rewrites: Vec<Action> = Vec::new();
        let mut emit = |dpid: Dpid, action: Action, rewrites: &[Action]| {
            let idx = match groups.iter().position(|g| g.0 == dpid) {
                Some(idx) => idx,
                None => {
                    groups.push((dpid, Vec::new(), 0));
                    groups.len() - 1
                }
            };
            let group = &mut groups[idx];
            group.1.extend_from_slice(&rewrites[group.2..]);
            group.2 = rewrites.len();
            group.1.push(action);
        };

        for action in &po.actions {
            match action {
                Action::Output { port, max_len } => {
                    for (dpid, port) in self.packet_out_targets(*port, ingress)? {
                        emit(
                            dpid,
                            Action::Output {
                                port,
                                max_len: *max_len,
                            },
                            &rewrites,
                        );
                    }
                }
                Action::Enqueue { port, queue_id } => {
                    let out = self.out_port(*port)?;
                    emit(
                        out.physical.dpid,
                        Action::Enqueue {
                            port: out.physical.port,
                            queue_id: *queue_id,
                        },
                        &rewrites,
                    );
                }
                other => rewrites.extend(self.rewrite(other)?),
            }
        }

        // A buffered packet with nowhere to go is still released.
        if let Some(b) = buffer {
            if !groups.iter().any(|g| g.0 == b.dpid) {
                groups.push((b.dpid, Vec::new(), 0));
            }
        }

        let mut out = Vec::new();
        for (dpid, actions, _) in groups {
            let in_port = match ingress {
                Some(i) if i.physical.dpid == dpid => i.physical.port,
                _ => PortNo::NONE,
            };
            let mut phys = PacketOut::new(in_port, actions, po.data.clone());
            match buffer {
                Some(b) if b.dpid == dpid => phys.buffer_id = b.buffer_id,
                Some(b) if po.data.is_empty() => {
                    return Err(NvdError::denied(
                        format!(
                            "buffered packet is held by {}, not {dpid}",
                            b.dpid
                        ),
                        BadActionCode::BadOutPort,
                    ))
                }
                _ => {}
            }
            phys.compute_length();
            out.push((dpid, OfBody::PacketOut(phys)));
        }
        Ok(out)
    }

    // A barrier fences every physical switch the virtual switch may have
    // installed flows on.
    fn barrier(&self) -> NvdResult<Vec<Outbound>> {
        self.first_member()?;
        Ok(self
            .sw
            .members()
            .iter()
            .map(|dpid| (*dpid, OfBody::BarrierRequest))
            .collect())
    }

    fn first_member(&self) -> NvdResult<Dpid> {
        self.sw.members().first().copied().ok_or_else(|| {
            NvdError::Invariant(format!(
                "switch {} has no physical switches",
                self.sw.switch_id
            ))
        })
    }

    /// The switch description a controller sees.
    fn features(&self) -> FeaturesReply {
        FeaturesReply {
            datapath_id: self.sw.dpid(),
            n_buffers: u32::try_from(self.hv.config.buffer_map_size)
                .unwrap_or(u32::MAX),
            n_tables: 1,
            ports: self.sw.ports().map(VirtualPort::desc).collect(),
        }
    }
}

fn derive_flow_mod(
    fm: &FlowMod,
    hop: Hop,
    buffer_id: u32,
    out_port: PortNo,
) -> FlowMod {
    let mut phys = FlowMod {
        flow_match: hop.flow_match,
        actions: hop.actions,
        buffer_id,
        out_port,
        ..fm.clone()
    };
    phys.compute_length();
    phys
}

/// Builds the physical flows for one virtual flow entering at one port.
///
/// Header rewrites are applied on the ingress switch.  When a big switch
/// forwards across physical switches, each later switch on the route gets a
/// flow matching the packet as it arrives there, headers already rewritten.
struct FlowBuilder<'t, 'a> {
    tr: &'t Translation<'a>,
    ingress: &'a VirtualPort,
    // Network addresses as the tenant knows them
    virt_src: Option<Ipv4Addr>,
    virt_dst: Option<Ipv4Addr>,
    // The packet's headers as they cross the fabric
    headers: Match,
    local: Hop,
    remote: Vec<Hop>,
}

impl<'t, 'a> FlowBuilder<'t, 'a> {
    fn new(
        tr: &'t Translation<'a>,
        ingress: &'a VirtualPort,
        vmatch: &Match,
    ) -> NvdResult<Self> {
        let av = &tr.hv.addresses;
        let mut flow_match = vmatch.clone();
        flow_match.in_port = Some(ingress.physical.port);
        flow_match.dl_src =
            vmatch.dl_src.map(|m| av.existing_physical_mac(tr.tenant, m));
        flow_match.dl_dst =
            vmatch.dl_dst.map(|m| av.existing_physical_mac(tr.tenant, m));
        let psrc = vmatch
            .nw_src
            .map(|ip| av.physical_ip(tr.tenant, ip))
            .transpose()?;
        let pdst = vmatch
            .nw_dst
            .map(|ip| av.physical_ip(tr.tenant, ip))
            .transpose()?;

        // Packets from hosts carry tenant addresses and are rewritten on the
        // way in.  Anything else is already in fabric form.
        let mut actions = Vec::new();
        if ingress.edge {
            actions.extend(psrc.map(Action::SetNwSrc));
            actions.extend(pdst.map(Action::SetNwDst));
        } else {
            flow_match.nw_src = psrc;
            flow_match.nw_dst = pdst;
        }
        let mut headers = flow_match.clone();
        headers.nw_src = psrc;
        headers.nw_dst = pdst;

        Ok(FlowBuilder {
            tr,
            ingress,
            virt_src: vmatch.nw_src,
            virt_dst: vmatch.nw_dst,
            headers,
            local: Hop {
                dpid: ingress.physical.dpid,
                flow_match,
                actions,
            },
            remote: Vec::new(),
        })
    }

    fn apply(&mut self, action: &Action) -> NvdResult<()> {
        match action {
            Action::Output { port, max_len } => self.output(*port, *max_len),
            Action::Enqueue { port, queue_id } => {
                let out = self.tr.out_port(*port)?;
                if out.physical.dpid != self.local.dpid {
                    return Err(NvdError::denied(
                        format!("cannot enqueue on remote port {port}"),
                        BadActionCode::BadOutPort,
                    ));
                }
                self.local.actions.push(Action::Enqueue {
                    port: self.local_port(out),
                    queue_id: *queue_id,
                });
                Ok(())
            }
            other => {
                let Some(rewritten) = self.tr.rewrite(other)? else {
                    return Ok(());
                };
                match (&rewritten, other) {
                    (Action::SetDlSrc(m), _) => self.headers.dl_src = Some(*m),
                    (Action::SetDlDst(m), _) => self.headers.dl_dst = Some(*m),
                    (Action::SetNwSrc(p), Action::SetNwSrc(v)) => {
                        self.headers.nw_src = Some(*p);
                        self.virt_src = Some(*v);
                    }
                    (Action::SetNwDst(p), Action::SetNwDst(v)) => {
                        self.headers.nw_dst = Some(*p);
                        self.virt_dst = Some(*v);
                    }
                    (Action::SetVlanVid(vid), _) => {
                        self.headers.dl_vlan = Some(*vid)
                    }
                    (Action::StripVlan, _) => self.headers.dl_vlan = None,
                    (Action::SetTpSrc(p), _) => self.headers.tp_src = Some(*p),
                    (Action::SetTpDst(p), _) => self.headers.tp_dst = Some(*p),
                    _ => {}
                }
                self.local.actions.push(rewritten);
                Ok(())
            }
        }
    }

    fn output(&mut self, port: PortNo, max_len: u16) -> NvdResult<()> {
        let sw: &'a VirtualSwitch = self.tr.sw;
        match port {
            PortNo::FLOOD | PortNo::ALL => {
                let targets: Vec<&'a VirtualPort> = sw
                    .ports()
                    .filter(|p| p.port_no != self.ingress.port_no)
                    .collect();
                for target in targets {
                    self.output_to(target, max_len)?;
                }
                Ok(())
            }
            PortNo::IN_PORT => self.output_to(self.ingress, max_len),
            PortNo::CONTROLLER => {
                self.local.actions.push(Action::Output { port, max_len });
                Ok(())
            }
            PortNo::NONE => Err(NvdError::denied(
                "output to no port",
                BadActionCode::BadOutPort,
            )),
            p if p.is_reserved() => Err(NvdError::denied(
                format!("output to reserved port {p}"),
                BadActionCode::Eperm,
            )),
            p => {
                let target = self.tr.out_port(p)?;
                self.output_to(target, max_len)
            }
        }
    }

    // The physical port to name in an action on the ingress switch.
    fn local_port(&self, out: &VirtualPort) -> PortNo {
        if out.port_no == self.ingress.port_no {
            PortNo::IN_PORT
        } else {
            out.physical.port
        }
    }

    // Rewrite actions restoring the tenant's addresses, for a packet about
    // to leave the fabric.
    fn restore_virtual(&self) -> Vec<Action> {
        let mut actions = Vec::new();
        if let (Some(_), Some(v)) = (self.headers.nw_src, self.virt_src) {
            actions.push(Action::SetNwSrc(v));
        }
        if let (Some(_), Some(v)) = (self.headers.nw_dst, self.virt_dst) {
            actions.push(Action::SetNwDst(v));
        }
        actions
    }

    fn restore_physical(&self) -> Vec<Action> {
        let mut actions = Vec::new();
        if let (Some(p), Some(_)) = (self.headers.nw_src, self.virt_src) {
            actions.push(Action::SetNwSrc(p));
        }
        if let (Some(p), Some(_)) = (self.headers.nw_dst, self.virt_dst) {
            actions.push(Action::SetNwDst(p));
        }
        actions
    }

    fn output_to(&mut self, out: &'a VirtualPort, max_len: u16) -> NvdResult<()> {
        if out.physical.dpid == self.local.dpid {
            let port = self.local_port(out);
            if out.edge {
                let restore = self.restore_virtual();
                let reapply = self.restore_physical();
                self.local.actions.extend(restore);
                self.local.actions.push(Action::Output { port, max_len });
                self.local.actions.extend(reapply);
            } else {
                self.local.actions.push(Action::Output { port, max_len });
            }
            return Ok(());
        }

        if !self.tr.routed {
            return Err(NvdError::Invariant(format!(
                "port {} of switch {} is on {}, not {}",
                out.port_no, self.tr.sw.switch_id, out.physical.dpid, self.local.dpid
            )));
        }
        let path = self.tr.route(self.ingress, out)?;
        self.local.actions.push(Action::Output {
            port: path[0].src.port,
            max_len,
        });
        for (i, hop) in path.iter().enumerate() {
            let mut flow_match = self.headers.clone();
            flow_match.in_port = Some(hop.dst.port);
            let mut actions = Vec::new();
            let port = match path.get(i + 1) {
                Some(next) => next.src.port,
                None => {
                    if out.edge {
                        actions.extend(self.restore_virtual());
                    }
                    if out.physical.port == hop.dst.port {
                        PortNo::IN_PORT
                    } else {
                        out.physical.port
                    }
                }
            };
            actions.push(Action::Output { port, max_len });
            self.add_remote(hop.dst.dpid, flow_match, actions);
        }
        Ok(())
    }

    // Flows on the same switch matching the same packet are merged.
    fn add_remote(&mut self, dpid: Dpid, flow_match: Match, actions: Vec<Action>) {
        match self
            .remote
            .iter_mut()
            .find(|h| h.dpid == dpid && h.flow_match == flow_match)
        {
            Some(hop) => {
                for action in actions {
                    if !hop.actions.contains(&action) {
                        hop.actions.push(action);
                    }
                }
            }
            None => self.remote.push(Hop {
                dpid,
                flow_match,
                actions,
            }),
        }
    }

    fn finish(mut self) -> (Hop, Vec<Hop>) {
        self.local.trim();
        for hop in &mut self.remote {
            hop.trim();
        }
        (self.local, self.remote)
    }
}

impl Hypervisor {
    /// Translate a message from a tenant's controller and send the result
    /// into the fabric.
    ///
    /// Requests that cannot be translated are answered with an OpenFlow
    /// error, and the failure is also returned.
    pub fn devirtualize(
        &self,
        tenant_id: TenantId,
        switch_id: SwitchId,
        msg: OfMessage,
    ) -> NvdResult<()> {
        let origin = Endpoint::Controller {
            tenant_id,
            switch_id,
        };
        let xid = msg.xid;
        trace!(self.log, "devirtualize";
            "from" => %origin,
            "message" => msg.kind(),
            "xid" => xid);

        let outcome = match msg.body {
            OfBody::Hello | OfBody::EchoReply(_) => return Ok(()),
            OfBody::EchoRequest(data) => {
                return self
                    .send(origin, OfMessage::new(xid, OfBody::EchoReply(data)))
            }
            body => {
                let physical = self.physical.read().unwrap();
                let tenant = self.registry.lookup_network(tenant_id)?;
                let network = tenant.network.read().unwrap();
                if network.retired {
                    return Err(NvdError::InvalidTenantId(tenant_id));
                }
                let sw = network.switch(switch_id)?;
                let tr = Translation::new(self, &physical, &tenant, sw);
                let entry = XidEntry {
                    tenant_id,
                    switch_id,
                    xid,
                    barrier: None,
                };
                // Transaction entries are stamped before the tenant lock is
                // released, so a concurrent removal either sees them and
                // purges them or leaves nothing to stamp.
                match body {
                    OfBody::FeaturesRequest => {
                        Outcome::Reply(OfBody::FeaturesReply(tr.features()))
                    }
                    OfBody::BarrierRequest => {
                        self.stamp(entry, Request::Barrier, tr.barrier())
                    }
                    OfBody::FlowMod(fm) => {
                        self.stamp(entry, Request::FlowMod, tr.flow_mod(fm))
                    }
                    OfBody::PacketOut(po) => {
                        self.stamp(entry, Request::PacketOut, tr.packet_out(po))
                    }
                    other => {
                        debug!(self.log, "unexpected message from controller";
                            "from" => %origin,
                            "message" => OfMessage::new(xid, other).kind());
                        Outcome::Reply(OfBody::Error(crate::openflow::ErrorMsg {
                            kind: ErrorKind::BadRequest(BadRequestCode::BadType),
                            data: Vec::new(),
                        }))
                    }
                }
            }
        };

        match outcome {
            Outcome::Reply(body) => self.send(origin, OfMessage::new(xid, body)),
            Outcome::Rejected(request, e) => self.reject(origin, xid, request, e),
            Outcome::Forward(stamped) => {
                self.forward(tenant_id, switch_id, xid, stamped)
            }
        }
    }

    // Give each physical message a fresh transaction id.  The requests a
    // barrier fans out into share a group, so that only the last reply is
    // passed on.
    fn stamp(
        &self,
        mut entry: XidEntry,
        request: Request,
        translated: NvdResult<Vec<Outbound>>,
    ) -> Outcome {
        let out = match translated {
            Ok(out) => out,
            Err(e) => return Outcome::Rejected(request, e),
        };
        if matches!(request, Request::Barrier) && out.len() > 1 {
            entry.barrier = Some(self.registry.next_barrier_group());
        }
        Outcome::Forward(
            out.into_iter()
                .map(|(dpid, body)| {
                    let pxid = self.registry.next_transaction_entry(dpid, entry);
                    (dpid, OfMessage::new(pxid, body))
                })
                .collect(),
        )
    }

    // Send the stamped messages.  If the fabric can't take one, it and
    // everything after it is abandoned and their transaction entries
    // released.
    fn forward(
        &self,
        tenant_id: TenantId,
        switch_id: SwitchId,
        xid: u32,
        stamped: Vec<(Dpid, OfMessage)>,
    ) -> NvdResult<()> {
        let mut pending = stamped.into_iter();
        while let Some((dpid, msg)) = pending.next() {
            let pxid = msg.xid;
            trace!(self.log, "devirtualized";
                "tenant_id" => %tenant_id,
                "switch_id" => %switch_id,
                "dpid" => %dpid,
                "message" => msg.kind(),
                "xid" => xid,
                "physical_xid" => pxid);
            if let Err(e) = self.send(Endpoint::Physical(dpid), msg) {
                self.release(
                    std::iter::once((dpid, pxid))
                        .chain(pending.map(|(d, m)| (d, m.xid))),
                );
                return Err(e);
            }
        }
        Ok(())
    }

    fn release(&self, entries: impl Iterator<Item = (Dpid, u32)>) {
        for (dpid, pxid) in entries {
            self.registry.resolve_transaction_entry(dpid, pxid);
        }
    }

    fn reject(
        &self,
        origin: Endpoint,
        xid: u32,
        request: Request,
        err: NvdError,
    ) -> NvdResult<()> {
        if !err.is_recoverable() {
            error!(self.log, "registry inconsistency";
                "from" => %origin,
                "xid" => xid,
                "error" => %err);
        }
        if let Some(kind) = error_reply(&err, request) {
            warn!(self.log, "rejected request";
                "from" => %origin,
                "xid" => xid,
                "error" => %err);
            // A failure here has already been logged.
            let _ = self.send(origin, OfMessage::error(xid, kind));
        }
        Err(err)
    }

    /// Translate a message from a physical switch and deliver it to the
    /// tenants it concerns.
    pub fn virtualize(&self, dpid: Dpid, msg: OfMessage) -> NvdResult<()> {
        let xid = msg.xid;
        trace!(self.log, "virtualize";
            "dpid" => %dpid,
            "message" => msg.kind(),
            "xid" => xid);
        match msg.body {
            OfBody::Hello | OfBody::EchoReply(_) => Ok(()),
            OfBody::EchoRequest(data) => self.send(
                Endpoint::Physical(dpid),
                OfMessage::new(xid, OfBody::EchoReply(data)),
            ),
            OfBody::FeaturesReply(features) => {
                self.physical_switch_connected(&features)
            }
            OfBody::Error(e) => self.reply(dpid, xid, OfBody::Error(e)),
            OfBody::BarrierReply => self.barrier_reply(dpid, xid),
            OfBody::FlowRemoved(fr) => self.virtualize_flow_removed(dpid, xid, fr),
            OfBody::PacketIn(pi) => self.virtualize_packet_in(dpid, xid, pi),
            OfBody::PortStatus(ps) => self.virtualize_port_status(dpid, xid, ps),
            other => {
                debug!(self.log, "unexpected message from switch";
                    "dpid" => %dpid,
                    "message" => OfMessage::new(xid, other).kind());
                Ok(())
            }
        }
    }

    // Consume the transaction entry for a reply.  A reply nobody is waiting
    // for is not an error.
    fn resolve(&self, dpid: Dpid, xid: u32) -> Option<XidEntry> {
        let entry = self.registry.resolve_transaction_entry(dpid, xid);
        if entry.is_none() {
            debug!(self.log, "dropping reply with no pending request";
                "dpid" => %dpid,
                "xid" => xid);
        }
        entry
    }

    // A barrier fanned out across several physical switches is answered
    // once all of them have replied.
    fn barrier_reply(&self, dpid: Dpid, xid: u32) -> NvdResult<()> {
        let Some((entry, complete)) =
            self.registry.resolve_barrier_entry(dpid, xid)
        else {
            debug!(self.log, "dropping reply with no pending request";
                "dpid" => %dpid,
                "xid" => xid);
            return Ok(());
        };
        if !complete {
            trace!(self.log, "barrier awaiting other switches";
                "dpid" => %dpid,
                "tenant_id" => %entry.tenant_id,
                "switch_id" => %entry.switch_id,
                "xid" => entry.xid);
            return Ok(());
        }
        self.send(
            Endpoint::Controller {
                tenant_id: entry.tenant_id,
                switch_id: entry.switch_id,
            },
            OfMessage::new(entry.xid, OfBody::BarrierReply),
        )
    }

    fn reply(&self, dpid: Dpid, xid: u32, body: OfBody) -> NvdResult<()> {
        let Some(entry) = self.resolve(dpid, xid) else {
            return Ok(());
        };
        self.send(
            Endpoint::Controller {
                tenant_id: entry.tenant_id,
                switch_id: entry.switch_id,
            },
            OfMessage::new(entry.xid, body),
        )
    }

    fn virtualize_flow_removed(
        &self,
        dpid: Dpid,
        xid: u32,
        mut fr: FlowRemoved,
    ) -> NvdResult<()> {
        let Some(entry) = self.resolve(dpid, xid) else {
            return Ok(());
        };
        let Ok(tenant) = self.registry.lookup_network(entry.tenant_id) else {
            return Ok(());
        };
        {
            let network = tenant.network.read().unwrap();
            if let Some(port) = fr.flow_match.in_port {
                match network.port_owner(PhysicalPortRef { dpid, port }) {
                    Some((sw, vport)) if sw.switch_id == entry.switch_id => {
                        fr.flow_match.in_port = Some(vport.port_no);
                        if !vport.edge {
                            self.virtual_match_ips(&tenant, &mut fr.flow_match);
                        }
                    }
                    _ => {
                        // One of the flows laid along a route.  The
                        // controller only knows about the ingress flow.
                        debug!(self.log, "dropping flow removal for route hop";
                            "dpid" => %dpid,
                            "port" => %port);
                        return Ok(());
                    }
                }
            }
            self.virtual_match_macs(&tenant, &mut fr.flow_match);
        }
        self.send(
            Endpoint::Controller {
                tenant_id: entry.tenant_id,
                switch_id: entry.switch_id,
            },
            OfMessage::new(entry.xid, OfBody::FlowRemoved(fr)),
        )
    }

    fn virtual_match_ips(&self, tenant: &Tenant, m: &mut Match) {
        let addresses = tenant.addresses.lock().unwrap();
        for field in [&mut m.nw_src, &mut m.nw_dst] {
            if let Some(vip) = field.and_then(|pip| addresses.virtual_ip(pip)) {
                *field = Some(vip);
            }
        }
    }

    fn virtual_match_macs(&self, tenant: &Tenant, m: &mut Match) {
        for field in [&mut m.dl_src, &mut m.dl_dst] {
            if let Some(mac) = *field {
                *field = Some(self.addresses.virtual_mac(tenant, mac));
            }
        }
    }

    /// The tenant a punted packet belongs to: the owner of its source host,
    /// else the tenant whose prefix its source address is in, else the only
    /// tenant with a port where it arrived.
    ///
    /// Packets arriving at an edge port still carry the tenant's own
    /// addresses, so their source address says nothing about the owner.
    fn packet_owner(
        &self,
        at: PhysicalPortRef,
        headers: &Match,
    ) -> Option<TenantId> {
        if let Some(t) = headers.dl_src.and_then(|m| self.registry.tenant_of_mac(m))
        {
            return Some(t);
        }
        let owners = self.registry.port_owners(at);
        if !owners.iter().any(|owner| owner.port.edge) {
            if let Some((t, _)) =
                headers.nw_src.and_then(|ip| self.registry.virtual_ip_of(ip))
            {
                return Some(t);
            }
        }
        match owners.as_slice() {
            [only] => Some(only.tenant_id),
            _ => None,
        }
    }

    fn virtualize_packet_in(
        &self,
        dpid: Dpid,
        xid: u32,
        mut pi: PacketIn,
    ) -> NvdResult<()> {
        let at = PhysicalPortRef {
            dpid,
            port: pi.in_port,
        };
        let Some(tenant_id) = self.packet_owner(at, &pi.headers) else {
            debug!(self.log, "dropping packet with no owner"; "at" => %at);
            return Ok(());
        };
        let Ok(tenant) = self.registry.lookup_network(tenant_id) else {
            return Ok(());
        };

        let switch_id = {
            let network = tenant.network.read().unwrap();
            let Some((sw, vport)) = network.port_owner(at) else {
                debug!(self.log, "dropping packet at unmapped port";
                    "tenant_id" => %tenant_id,
                    "at" => %at);
                return Ok(());
            };
            if !sw.active {
                trace!(self.log, "dropping packet for inactive switch";
                    "tenant_id" => %tenant_id,
                    "switch_id" => %sw.switch_id);
                return Ok(());
            }
            pi.in_port = vport.port_no;
            pi.buffer_id =
                self.registry
                    .add_buffer(&tenant, sw.switch_id, dpid, pi.buffer_id)?;
            if !vport.edge {
                self.virtual_match_ips(&tenant, &mut pi.headers);
            }
            self.virtual_match_macs(&tenant, &mut pi.headers);
            pi.headers.in_port = Some(vport.port_no);
            sw.switch_id
        };

        self.send(
            Endpoint::Controller {
                tenant_id,
                switch_id,
            },
            OfMessage::new(xid, OfBody::PacketIn(pi)),
        )
    }

    fn virtualize_port_status(
        &self,
        dpid: Dpid,
        xid: u32,
        ps: PortStatus,
    ) -> NvdResult<()> {
        let at = PhysicalPortRef {
            dpid,
            port: ps.desc.port_no,
        };
        {
            let mut physical = self.physical.write().unwrap();
            let updated = match ps.reason {
                PortReason::Add | PortReason::Modify => {
                    physical.add_port(dpid, ps.desc.port_no, ps.desc.hw_addr)
                }
                PortReason::Delete => physical.remove_port(at),
            };
            if let Err(e) = updated {
                debug!(self.log, "port status for unknown port";
                    "at" => %at,
                    "error" => %e);
            }
        }

        let mut result = Ok(());
        for owner in self.registry.port_owners(at) {
            if !owner.active {
                continue;
            }
            let msg = OfMessage::new(
                xid,
                OfBody::PortStatus(PortStatus {
                    reason: ps.reason,
                    desc: owner.port.desc(),
                }),
            );
            let to = Endpoint::Controller {
                tenant_id: owner.tenant_id,
                switch_id: owner.switch_id,
            };
            if let Err(e) = self.send(to, msg) {
                result = Err(e);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Config;
    use crate::openflow::ErrorMsg;
    use crate::openflow::PacketInReason;
    use crate::test_util::hypervisor;
    use crate::test_util::test_logger;
    use crate::test_util::RecordingSink;
    use common::network::MacAddr;
    use pretty_assertions::assert_eq;

    mockall::mock! {
        pub Sink {}
        impl MessageSink for Sink {
            fn send(&self, to: Endpoint, msg: OfMessage) -> NvdResult<()>;
            fn open_controller(
                &self,
                tenant_id: TenantId,
                switch_id: SwitchId,
                controller: &ControllerAddr,
            ) -> NvdResult<()>;
            fn close_controller(&self, tenant_id: TenantId, switch_id: SwitchId);
        }
    }

    fn host(n: u8) -> MacAddr {
        MacAddr::new(0, 0, 0, 0, 0, n)
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn controller(tenant_id: TenantId, switch_id: SwitchId) -> Endpoint {
        Endpoint::Controller {
            tenant_id,
            switch_id,
        }
    }

    fn flow_mods(sent: &[(Endpoint, OfMessage)]) -> Vec<(Dpid, FlowMod)> {
        sent.iter()
            .filter_map(|(to, msg)| match (to, &msg.body) {
                (Endpoint::Physical(dpid), OfBody::FlowMod(fm)) => {
                    Some((*dpid, fm.clone()))
                }
                _ => None,
            })
            .collect()
    }

    // A booted tenant with one single switch on dpid 1 and hosts on
    // physical ports 2 and 3.
    fn single_switch() -> anyhow::Result<(Hypervisor, Arc<RecordingSink>, TenantId, SwitchId)>
    {
        let (hv, sink) = hypervisor(1, &[], Config::default());
        let t = hv.create_virtual_network("tcp", "127.0.0.1", 6633, "10.0.0.0/16")?;
        let sw = hv.create_virtual_switch(t, &[Dpid(1)])?;
        hv.create_edge_port(t, Dpid(1), PortNo(2), host(1))?;
        hv.create_edge_port(t, Dpid(1), PortNo(3), host(2))?;
        hv.boot_network(t)?;
        sink.take();
        Ok((hv, sink, t, sw))
    }

    // A booted tenant with a big switch over dpids 1 and 2, linked 1/1-2/1,
    // with hosts on 1/2 and 2/2.
    fn big_switch(
        routing: crate::routing::RoutingStrategy,
    ) -> anyhow::Result<(Hypervisor, Arc<RecordingSink>, TenantId, SwitchId)> {
        let (hv, sink) = hypervisor(2, &["1/1-2/1"], Config::default());
        let t = hv.create_virtual_network("tcp", "127.0.0.1", 6633, "10.0.0.0/16")?;
        let sw = hv.create_virtual_switch_with_routing(
            t,
            &[Dpid(1), Dpid(2)],
            routing,
        )?;
        hv.create_edge_port(t, Dpid(1), PortNo(2), host(1))?;
        hv.create_edge_port(t, Dpid(2), PortNo(2), host(2))?;
        hv.boot_network(t)?;
        sink.take();
        Ok((hv, sink, t, sw))
    }

    #[test]
    fn test_flow_mod_single_switch() -> anyhow::Result<()> {
        let (hv, sink, t, sw) = single_switch()?;
        let vmatch = Match {
            in_port: Some(PortNo(1)),
            nw_src: Some(ip("10.0.0.1")),
            ..Default::default()
        };
        let fm = FlowMod::add(vmatch, vec![Action::output(PortNo(2))]);
        hv.devirtualize(t, sw, OfMessage::new(7, OfBody::FlowMod(fm)))?;

        let sent = flow_mods(&sink.take());
        assert_eq!(sent.len(), 1);
        let (dpid, fm) = &sent[0];
        assert_eq!(*dpid, Dpid(1));
        assert_eq!(fm.flow_match.in_port, Some(PortNo(2)));
        // Edge ingress: the match keeps the tenant's address and the packet
        // is rewritten, then restored as it leaves through the other edge.
        assert_eq!(fm.flow_match.nw_src, Some(ip("10.0.0.1")));
        assert_eq!(
            fm.actions,
            vec![
                Action::SetNwSrc(ip("1.0.0.1")),
                Action::SetNwSrc(ip("10.0.0.1")),
                Action::output(PortNo(3)),
            ]
        );
        assert_eq!(fm.length, 72 + 3 * 8);
        Ok(())
    }

    #[test]
    fn test_flow_mod_wildcard_in_port() -> anyhow::Result<()> {
        let (hv, sink, t, sw) = single_switch()?;
        let fm = FlowMod::add(
            Match::default(),
            vec![Action::output(PortNo::FLOOD)],
        );
        hv.devirtualize(t, sw, OfMessage::new(1, OfBody::FlowMod(fm)))?;

        let sent = flow_mods(&sink.take());
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1.flow_match.in_port, Some(PortNo(2)));
        assert_eq!(sent[0].1.actions, vec![Action::output(PortNo(3))]);
        assert_eq!(sent[1].1.flow_match.in_port, Some(PortNo(3)));
        assert_eq!(sent[1].1.actions, vec![Action::output(PortNo(2))]);
        Ok(())
    }

    #[test]
    fn test_unknown_in_port_rejected() -> anyhow::Result<()> {
        let (hv, sink, t, sw) = single_switch()?;
        let vmatch = Match {
            in_port: Some(PortNo(9)),
            ..Default::default()
        };
        let fm = FlowMod::add(vmatch, vec![Action::output(PortNo(1))]);
        let err = hv
            .devirtualize(t, sw, OfMessage::new(3, OfBody::FlowMod(fm)))
            .unwrap_err();
        assert!(matches!(err, NvdError::InvalidIdentifier(_)));
        assert_eq!(
            sink.take(),
            vec![(
                controller(t, sw),
                OfMessage::error(
                    3,
                    ErrorKind::FlowModFailed(FlowModFailedCode::Eperm)
                )
            )]
        );
        assert_eq!(hv.registry.pending_transactions(t), 0);
        Ok(())
    }

    #[test]
    fn test_denied_action_fails_whole_message() -> anyhow::Result<()> {
        let (hv, sink, t, sw) = single_switch()?;
        let vmatch = Match {
            in_port: Some(PortNo(1)),
            ..Default::default()
        };
        let fm = FlowMod::add(
            vmatch,
            vec![Action::output(PortNo(2)), Action::output(PortNo::NORMAL)],
        );
        let err = hv
            .devirtualize(t, sw, OfMessage::new(4, OfBody::FlowMod(fm)))
            .unwrap_err();
        assert!(matches!(err, NvdError::ActionVirtualizationDenied { .. }));
        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].1,
            OfMessage::error(4, ErrorKind::BadAction(BadActionCode::Eperm))
        );
        Ok(())
    }

    #[test]
    fn test_vendor_action_skipped() -> anyhow::Result<()> {
        let (hv, sink, t, sw) = single_switch()?;
        let vmatch = Match {
            in_port: Some(PortNo(1)),
            ..Default::default()
        };
        let fm = FlowMod::add(
            vmatch,
            vec![
                Action::Vendor {
                    vendor: 0x2320,
                    data: vec![1, 2, 3],
                },
                Action::output(PortNo(2)),
            ],
        );
        hv.devirtualize(t, sw, OfMessage::new(5, OfBody::FlowMod(fm)))?;
        let sent = flow_mods(&sink.take());
        assert_eq!(sent[0].1.actions, vec![Action::output(PortNo(3))]);
        Ok(())
    }

    #[test]
    fn test_xid_round_trip() -> anyhow::Result<()> {
        let (hv, sink, t, sw) = single_switch()?;
        hv.devirtualize(t, sw, OfMessage::new(99, OfBody::BarrierRequest))?;
        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        let (to, msg) = &sent[0];
        assert_eq!(*to, Endpoint::Physical(Dpid(1)));
        assert_ne!(msg.xid, 99);

        let reply = OfMessage::new(msg.xid, OfBody::BarrierReply);
        hv.virtualize(Dpid(1), reply.clone())?;
        assert_eq!(
            sink.take(),
            vec![(controller(t, sw), OfMessage::new(99, OfBody::BarrierReply))]
        );

        // The entry was consumed
        hv.virtualize(Dpid(1), reply)?;
        assert!(sink.take().is_empty());
        Ok(())
    }

    #[test]
    fn test_barrier_fences_every_member() -> anyhow::Result<()> {
        let (hv, sink, t, sw) =
            big_switch(crate::routing::RoutingStrategy::ShortestPath)?;
        hv.devirtualize(t, sw, OfMessage::new(40, OfBody::BarrierRequest))?;
        let sent = sink.take();
        let mut members: Vec<Dpid> = sent
            .iter()
            .map(|(to, msg)| {
                assert_eq!(msg.body, OfBody::BarrierRequest);
                match to {
                    Endpoint::Physical(dpid) => *dpid,
                    other => panic!("barrier sent to {other}"),
                }
            })
            .collect();
        members.sort();
        assert_eq!(members, vec![Dpid(1), Dpid(2)]);

        // Nothing goes back until the last member has answered
        let (d0, m0) = (sent[0].0, &sent[0].1);
        let (d1, m1) = (sent[1].0, &sent[1].1);
        let dpid = |e: Endpoint| match e {
            Endpoint::Physical(dpid) => dpid,
            _ => unreachable!(),
        };
        hv.virtualize(dpid(d0), OfMessage::new(m0.xid, OfBody::BarrierReply))?;
        assert!(sink.take().is_empty());
        hv.virtualize(dpid(d1), OfMessage::new(m1.xid, OfBody::BarrierReply))?;
        assert_eq!(
            sink.take(),
            vec![(controller(t, sw), OfMessage::new(40, OfBody::BarrierReply))]
        );
        assert_eq!(hv.registry.pending_transactions(t), 0);
        Ok(())
    }

    #[test]
    fn test_barrier_survives_member_disconnect() -> anyhow::Result<()> {
        let (hv, sink, t, sw) =
            big_switch(crate::routing::RoutingStrategy::ShortestPath)?;
        hv.devirtualize(t, sw, OfMessage::new(41, OfBody::BarrierRequest))?;
        let sent = sink.take();
        let to_one = sent
            .iter()
            .find(|(to, _)| *to == Endpoint::Physical(Dpid(1)))
            .map(|(_, msg)| msg.xid)
            .unwrap();

        // Switch 2 goes away and will never answer
        hv.physical_switch_disconnected(Dpid(2));
        hv.virtualize(Dpid(1), OfMessage::new(to_one, OfBody::BarrierReply))?;
        assert_eq!(
            sink.take(),
            vec![(controller(t, sw), OfMessage::new(41, OfBody::BarrierReply))]
        );
        Ok(())
    }

    #[test]
    fn test_unanswered_requests_bounded() -> anyhow::Result<()> {
        let config = Config {
            xid_table_size: 32,
            ..Config::default()
        };
        let (hv, sink) = hypervisor(1, &[], config);
        let t = hv.create_virtual_network("tcp", "127.0.0.1", 6633, "10.0.0.0/16")?;
        let sw = hv.create_virtual_switch(t, &[Dpid(1)])?;
        hv.create_edge_port(t, Dpid(1), PortNo(2), host(1))?;
        hv.create_edge_port(t, Dpid(1), PortNo(3), host(2))?;
        hv.boot_network(t)?;

        for xid in 0..2000 {
            let po = PacketOut::new(
                PortNo(1),
                vec![Action::output(PortNo(2))],
                vec![0; 60],
            );
            hv.devirtualize(t, sw, OfMessage::new(xid, OfBody::PacketOut(po)))?;
            sink.take();
        }
        assert_eq!(hv.registry.pending_transactions(t), 32);

        // The most recent requests are still answerable
        hv.devirtualize(t, sw, OfMessage::new(5000, OfBody::BarrierRequest))?;
        let pxid = sink.take()[0].1.xid;
        hv.virtualize(Dpid(1), OfMessage::new(pxid, OfBody::BarrierReply))?;
        assert_eq!(sink.take()[0].1, OfMessage::new(5000, OfBody::BarrierReply));
        Ok(())
    }

    #[test]
    fn test_removed_tenant_stamps_nothing() -> anyhow::Result<()> {
        let (hv, sink, t, sw) = single_switch()?;
        let tenant = hv.registry.lookup_network(t)?;
        hv.remove_network(t)?;
        assert!(tenant.network.read().unwrap().retired);

        // The id is handed out again, to a tenant that shares nothing with
        // the old one
        let again = hv.create_virtual_network("tcp", "127.0.0.1", 6633, "10.0.0.0/16")?;
        assert_eq!(again, t);
        assert_eq!(hv.registry.pending_transactions(again), 0);
        sink.take();

        // The old switch is gone, so nothing is stamped on its behalf
        assert!(hv
            .devirtualize(t, sw, OfMessage::new(1, OfBody::BarrierRequest))
            .is_err());
        assert_eq!(hv.registry.pending_transactions(again), 0);
        Ok(())
    }

    #[test]
    fn test_error_reply_restamped() -> anyhow::Result<()> {
        let (hv, sink, t, sw) = single_switch()?;
        let vmatch = Match {
            in_port: Some(PortNo(1)),
            ..Default::default()
        };
        let fm = FlowMod::add(vmatch, vec![Action::output(PortNo(2))]);
        hv.devirtualize(t, sw, OfMessage::new(12, OfBody::FlowMod(fm)))?;
        let pxid = sink.take()[0].1.xid;

        let err = OfBody::Error(ErrorMsg {
            kind: ErrorKind::FlowModFailed(FlowModFailedCode::AllTablesFull),
            data: Vec::new(),
        });
        hv.virtualize(Dpid(1), OfMessage::new(pxid, err.clone()))?;
        assert_eq!(
            sink.take(),
            vec![(controller(t, sw), OfMessage::new(12, err))]
        );
        Ok(())
    }

    #[test]
    fn test_features_and_echo_answered_locally() -> anyhow::Result<()> {
        let (hv, sink, t, sw) = single_switch()?;
        hv.devirtualize(t, sw, OfMessage::new(1, OfBody::FeaturesRequest))?;
        hv.devirtualize(t, sw, OfMessage::new(2, OfBody::EchoRequest(vec![9])))?;
        let sent = sink.take();
        assert_eq!(sent.len(), 2);
        match &sent[0].1.body {
            OfBody::FeaturesReply(f) => {
                assert_eq!(f.datapath_id, Dpid((1 << 32) | 1));
                let ports: Vec<PortNo> =
                    f.ports.iter().map(|p| p.port_no).collect();
                assert_eq!(ports, vec![PortNo(1), PortNo(2)]);
            }
            other => panic!("expected features reply, got {other:?}"),
        }
        assert_eq!(
            sent[1],
            (controller(t, sw), OfMessage::new(2, OfBody::EchoReply(vec![9])))
        );
        Ok(())
    }

    #[test]
    fn test_big_switch_spans_route() -> anyhow::Result<()> {
        let (hv, sink, t, sw) =
            big_switch(crate::routing::RoutingStrategy::ShortestPath)?;
        let vmatch = Match {
            in_port: Some(PortNo(1)),
            ..Default::default()
        };
        let fm = FlowMod::add(vmatch, vec![Action::output(PortNo(2))]);
        hv.devirtualize(t, sw, OfMessage::new(1, OfBody::FlowMod(fm)))?;

        let sent = flow_mods(&sink.take());
        assert_eq!(sent.len(), 2);
        // Ingress: out over the inter-switch link
        assert_eq!(sent[0].0, Dpid(1));
        assert_eq!(sent[0].1.flow_match.in_port, Some(PortNo(2)));
        assert_eq!(sent[0].1.actions, vec![Action::output(PortNo(1))]);
        // Egress: in from the link, out to the host
        assert_eq!(sent[1].0, Dpid(2));
        assert_eq!(sent[1].1.flow_match.in_port, Some(PortNo(1)));
        assert_eq!(sent[1].1.actions, vec![Action::output(PortNo(2))]);

        // The route was computed once and cached
        let tenant = hv.registry.lookup_network(t)?;
        let network = tenant.network.read().unwrap();
        let routes = network.switch(sw)?.routes().unwrap().lock().unwrap();
        assert_eq!(routes.len(), 1);
        Ok(())
    }

    #[test]
    fn test_manual_big_switch_needs_route() -> anyhow::Result<()> {
        let (hv, sink, t, sw) =
            big_switch(crate::routing::RoutingStrategy::Manual)?;
        let vmatch = Match {
            in_port: Some(PortNo(1)),
            ..Default::default()
        };
        let fm = FlowMod::add(vmatch.clone(), vec![Action::output(PortNo(2))]);
        let err = hv
            .devirtualize(t, sw, OfMessage::new(1, OfBody::FlowMod(fm.clone())))
            .unwrap_err();
        assert!(matches!(err, NvdError::RouteComputationFailed(_)));
        assert_eq!(
            sink.take()[0].1,
            OfMessage::error(1, ErrorKind::BadAction(BadActionCode::BadOutPort))
        );

        hv.create_big_switch_route(t, sw, PortNo(1), PortNo(2), "1/1-2/1")?;
        hv.devirtualize(t, sw, OfMessage::new(2, OfBody::FlowMod(fm)))?;
        assert_eq!(flow_mods(&sink.take()).len(), 2);
        Ok(())
    }

    #[test]
    fn test_packet_out_split_by_switch() -> anyhow::Result<()> {
        let (hv, sink, t, sw) =
            big_switch(crate::routing::RoutingStrategy::ShortestPath)?;
        let po = PacketOut::new(
            PortNo::NONE,
            vec![Action::output(PortNo::FLOOD)],
            vec![0; 64],
        );
        hv.devirtualize(t, sw, OfMessage::new(1, OfBody::PacketOut(po)))?;
        let mut sent: Vec<(Endpoint, PacketOut)> = sink
            .take()
            .into_iter()
            .filter_map(|(to, msg)| match msg.body {
                OfBody::PacketOut(po) => Some((to, po)),
                _ => None,
            })
            .collect();
        sent.sort_by_key(|(to, _)| *to);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, Endpoint::Physical(Dpid(1)));
        assert_eq!(sent[0].1.actions, vec![Action::output(PortNo(2))]);
        assert_eq!(sent[1].0, Endpoint::Physical(Dpid(2)));
        assert_eq!(sent[1].1.actions, vec![Action::output(PortNo(2))]);
        assert_eq!(sent[1].1.length, 16 + 8 + 64);
        Ok(())
    }

    #[test]
    fn test_packet_in_and_buffer() -> anyhow::Result<()> {
        let (hv, sink, t, sw) = single_switch()?;
        let pi = PacketIn {
            buffer_id: 500,
            total_len: 64,
            in_port: PortNo(2),
            reason: PacketInReason::NoMatch,
            headers: Match {
                dl_src: Some(host(1)),
                ..Default::default()
            },
            data: vec![0; 64],
        };
        hv.virtualize(Dpid(1), OfMessage::new(0, OfBody::PacketIn(pi)))?;
        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, controller(t, sw));
        let vbuf = match &sent[0].1.body {
            OfBody::PacketIn(pi) => {
                assert_eq!(pi.in_port, PortNo(1));
                pi.buffer_id
            }
            other => panic!("expected packet in, got {other:?}"),
        };

        // The controller releases the buffer through a flow mod
        let vmatch = Match {
            in_port: Some(PortNo(1)),
            ..Default::default()
        };
        let mut fm = FlowMod::add(vmatch, vec![Action::output(PortNo(2))]);
        fm.buffer_id = vbuf;
        hv.devirtualize(t, sw, OfMessage::new(1, OfBody::FlowMod(fm.clone())))?;
        assert_eq!(flow_mods(&sink.take())[0].1.buffer_id, 500);

        // An unknown buffer id quietly becomes no buffer at all
        fm.buffer_id = vbuf + 1000;
        hv.devirtualize(t, sw, OfMessage::new(2, OfBody::FlowMod(fm)))?;
        assert_eq!(flow_mods(&sink.take())[0].1.buffer_id, NO_BUFFER);
        Ok(())
    }

    #[test]
    fn test_packet_in_unowned_dropped() -> anyhow::Result<()> {
        let (hv, sink, _t, _sw) = single_switch()?;
        let pi = PacketIn {
            buffer_id: NO_BUFFER,
            total_len: 64,
            in_port: PortNo(4),
            reason: PacketInReason::NoMatch,
            headers: Match::default(),
            data: vec![0; 64],
        };
        hv.virtualize(Dpid(1), OfMessage::new(0, OfBody::PacketIn(pi)))?;
        assert!(sink.take().is_empty());
        Ok(())
    }

    #[test]
    fn test_port_status_fans_out() -> anyhow::Result<()> {
        let (hv, sink, t, sw) = single_switch()?;
        let ps = PortStatus {
            reason: PortReason::Modify,
            desc: crate::openflow::PortDesc {
                port_no: PortNo(3),
                hw_addr: MacAddr::ZERO,
                name: "eth3".into(),
            },
        };
        hv.virtualize(Dpid(1), OfMessage::new(0, OfBody::PortStatus(ps)))?;
        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, controller(t, sw));
        match &sent[0].1.body {
            OfBody::PortStatus(ps) => assert_eq!(ps.desc.port_no, PortNo(2)),
            other => panic!("expected port status, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_send_failure_releases_transactions() -> anyhow::Result<()> {
        let mut sink = MockSink::new();
        sink.expect_open_controller().returning(|_, _, _| Ok(()));
        sink.expect_send()
            .withf(|to, _| matches!(to, Endpoint::Physical(_)))
            .returning(|to, _| Err(NvdError::Disconnected(to)));
        let hv = Hypervisor::new(&test_logger(), Config::default(), Arc::new(sink));
        hv.load_topology(&crate::physical::TopologySeed {
            switches: vec![crate::physical::SwitchSeed {
                dpid: 1,
                ports: vec![1, 2],
            }],
            links: Vec::new(),
        })?;
        let t = hv.create_virtual_network("tcp", "127.0.0.1", 6633, "10.0.0.0/16")?;
        let sw = hv.create_virtual_switch(t, &[Dpid(1)])?;
        hv.create_edge_port(t, Dpid(1), PortNo(1), host(1))?;
        hv.create_edge_port(t, Dpid(1), PortNo(2), host(2))?;

        let fm = FlowMod::add(Match::default(), vec![Action::output(PortNo::ALL)]);
        let err = hv
            .devirtualize(t, sw, OfMessage::new(1, OfBody::FlowMod(fm)))
            .unwrap_err();
        assert!(matches!(err, NvdError::Disconnected(Endpoint::Physical(_))));
        assert_eq!(hv.registry.pending_transactions(t), 0);
        Ok(())
    }
}
