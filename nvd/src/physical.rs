// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The physical fabric: switches, their ports, and the directed links
//! between them.

use std::collections::BTreeMap;
use std::fmt;

use common::network::Dpid;
use common::network::MacAddr;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::info;

use crate::types::NvdError;
use crate::types::NvdResult;
use crate::types::PortNo;

/// One port on one physical switch.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct PhysicalPortRef {
    pub dpid: Dpid,
    pub port: PortNo,
}

impl PhysicalPortRef {
    pub fn new(dpid: impl Into<Dpid>, port: impl Into<PortNo>) -> Self {
        PhysicalPortRef {
            dpid: dpid.into(),
            port: port.into(),
        }
    }
}

// Rendered the same way the path syntax spells it.
impl fmt::Display for PhysicalPortRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.dpid.0, self.port)
    }
}

/// A directed physical link.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct PhysicalLink {
    pub src: PhysicalPortRef,
    pub dst: PhysicalPortRef,
}

impl PhysicalLink {
    pub fn new(src: PhysicalPortRef, dst: PhysicalPortRef) -> Self {
        PhysicalLink { src, dst }
    }

    /// The same link traversed in the opposite direction.
    pub fn reversed(&self) -> Self {
        PhysicalLink {
            src: self.dst,
            dst: self.src,
        }
    }
}

impl fmt::Display for PhysicalLink {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.src, self.dst)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhysicalPort {
    pub port_no: PortNo,
    pub hw_addr: MacAddr,
}

#[derive(Clone, Debug)]
pub struct PhysicalSwitch {
    pub dpid: Dpid,
    pub connected: bool,
    ports: BTreeMap<PortNo, PhysicalPort>,
}

impl PhysicalSwitch {
    pub fn ports(&self) -> impl Iterator<Item = &PhysicalPort> {
        self.ports.values()
    }

    pub fn port(&self, port_no: PortNo) -> Option<&PhysicalPort> {
        self.ports.get(&port_no)
    }
}

/// All of the physical switches known to the hypervisor, and the links
/// discovered between them.
pub struct PhysicalNetwork {
    log: slog::Logger,
    switches: BTreeMap<Dpid, PhysicalSwitch>,
    // Each port has at most one outgoing link, keyed by its source.
    links: BTreeMap<PhysicalPortRef, PhysicalPortRef>,
}

impl PhysicalNetwork {
    pub fn new(log: &slog::Logger) -> Self {
        PhysicalNetwork {
            log: log.new(slog::o!("unit" => "physical")),
            switches: BTreeMap::new(),
            links: BTreeMap::new(),
        }
    }

    /// Record a switch, or mark a known switch as connected again.
    pub fn add_switch(&mut self, dpid: Dpid) {
        let sw = self.switches.entry(dpid).or_insert_with(|| {
            info!(self.log, "added physical switch"; "dpid" => %dpid);
            PhysicalSwitch {
                dpid,
                connected: true,
                ports: BTreeMap::new(),
            }
        });
        sw.connected = true;
    }

    pub fn set_disconnected(&mut self, dpid: Dpid) {
        if let Some(sw) = self.switches.get_mut(&dpid) {
            info!(self.log, "physical switch disconnected"; "dpid" => %dpid);
            sw.connected = false;
        }
    }

    /// Forget a switch entirely, along with every link touching it.
    pub fn remove_switch(&mut self, dpid: Dpid) -> NvdResult<PhysicalSwitch> {
        let sw = self.switches.remove(&dpid).ok_or_else(|| {
            NvdError::InvalidIdentifier(format!("unknown physical switch {dpid}"))
        })?;
        self.links
            .retain(|src, dst| src.dpid != dpid && dst.dpid != dpid);
        info!(self.log, "removed physical switch"; "dpid" => %dpid);
        Ok(sw)
    }

    pub fn switch(&self, dpid: Dpid) -> NvdResult<&PhysicalSwitch> {
        self.switches.get(&dpid).ok_or_else(|| {
            NvdError::InvalidIdentifier(format!("unknown physical switch {dpid}"))
        })
    }

    pub fn switches(&self) -> impl Iterator<Item = &PhysicalSwitch> {
        self.switches.values()
    }

    pub fn contains_switch(&self, dpid: Dpid) -> bool {
        self.switches.contains_key(&dpid)
    }

    pub fn add_port(
        &mut self,
        dpid: Dpid,
        port_no: PortNo,
        hw_addr: MacAddr,
    ) -> NvdResult<()> {
        if port_no.is_reserved() {
            return Err(NvdError::InvalidIdentifier(format!(
                "port {port_no} is reserved"
            )));
        }
        let sw = self.switches.get_mut(&dpid).ok_or_else(|| {
            NvdError::InvalidIdentifier(format!("unknown physical switch {dpid}"))
        })?;
        debug!(self.log, "added physical port";
            "dpid" => %dpid, "port" => %port_no, "hw_addr" => %hw_addr);
        sw.ports.insert(port_no, PhysicalPort { port_no, hw_addr });
        Ok(())
    }

    pub fn remove_port(&mut self, port: PhysicalPortRef) -> NvdResult<()> {
        let sw = self.switches.get_mut(&port.dpid).ok_or_else(|| {
            NvdError::InvalidIdentifier(format!(
                "unknown physical switch {}",
                port.dpid
            ))
        })?;
        if sw.ports.remove(&port.port).is_none() {
            return Err(NvdError::InvalidIdentifier(format!(
                "unknown physical port {port}"
            )));
        }
        self.links.retain(|src, dst| *src != port && *dst != port);
        debug!(self.log, "removed physical port"; "port" => %port);
        Ok(())
    }

    pub fn port(&self, port: PhysicalPortRef) -> NvdResult<&PhysicalPort> {
        self.switch(port.dpid)?.port(port.port).ok_or_else(|| {
            NvdError::InvalidIdentifier(format!("unknown physical port {port}"))
        })
    }

    /// Record a directed link.  Both endpoints must be known ports, and the
    /// source may not already lead somewhere else.
    pub fn add_link(&mut self, link: PhysicalLink) -> NvdResult<()> {
        self.port(link.src)?;
        self.port(link.dst)?;
        match self.links.get(&link.src) {
            Some(dst) if *dst == link.dst => Ok(()),
            Some(dst) => Err(NvdError::Exists(format!(
                "port {} already links to {dst}",
                link.src
            ))),
            None => {
                debug!(self.log, "added physical link"; "link" => %link);
                self.links.insert(link.src, link.dst);
                Ok(())
            }
        }
    }

    pub fn remove_link(&mut self, link: PhysicalLink) -> NvdResult<()> {
        match self.links.get(&link.src) {
            Some(dst) if *dst == link.dst => {
                self.links.remove(&link.src);
                debug!(self.log, "removed physical link"; "link" => %link);
                Ok(())
            }
            _ => Err(NvdError::InvalidIdentifier(format!(
                "unknown physical link {link}"
            ))),
        }
    }

    pub fn has_link(&self, link: &PhysicalLink) -> bool {
        self.links.get(&link.src) == Some(&link.dst)
    }

    /// All links leaving `dpid`, in port order.
    pub fn links_from(
        &self,
        dpid: Dpid,
    ) -> impl Iterator<Item = PhysicalLink> + '_ {
        let low = PhysicalPortRef::new(dpid, PortNo(0));
        let high = PhysicalPortRef::new(dpid, PortNo(u16::MAX));
        self.links
            .range(low..=high)
            .map(|(src, dst)| PhysicalLink::new(*src, *dst))
    }

    pub fn links(&self) -> impl Iterator<Item = PhysicalLink> + '_ {
        self.links
            .iter()
            .map(|(src, dst)| PhysicalLink::new(*src, *dst))
    }

    /// Apply a topology seed: every switch and port it names, and each link
    /// in both directions.
    pub fn seed(&mut self, seed: &TopologySeed) -> NvdResult<()> {
        for sw in &seed.switches {
            let dpid = Dpid(sw.dpid);
            self.add_switch(dpid);
            for port in &sw.ports {
                self.add_port(dpid, PortNo(*port), seed_hw_addr(dpid, *port))?;
            }
        }
        for spec in &seed.links {
            for link in crate::path::parse_path(spec)? {
                self.add_link(link)?;
                self.add_link(link.reversed())?;
            }
        }
        Ok(())
    }
}

/// The fabric to assume at startup, before any switch has connected.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TopologySeed {
    #[serde(default)]
    pub switches: Vec<SwitchSeed>,
    /// Path specifications; each hop becomes a link in both directions.
    #[serde(default)]
    pub links: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SwitchSeed {
    pub dpid: u64,
    pub ports: Vec<u16>,
}

// Seeded ports get a locally-administered address built from their position.
fn seed_hw_addr(dpid: Dpid, port: u16) -> MacAddr {
    let low = ((dpid.0 & 0xff_ffff) << 16) | u64::from(port);
    MacAddr::from((0x02u64 << 40) | low)
}
