// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! `nvd`, an OpenFlow network hypervisor.
//!
//! The hypervisor sits between a fabric of physical OpenFlow switches and the
//! controllers of any number of tenants, presenting each tenant with its own
//! virtual topology and translating every control message that crosses the
//! boundary.

use std::sync::Arc;
use std::sync::RwLock;

use common::network::Dpid;
use slog::info;
use slog::warn;

pub mod address;
pub mod buffer;
pub mod config;
pub mod index;
pub mod openflow;
pub mod path;
pub mod physical;
pub mod pipeline;
pub mod registry;
pub mod routing;
pub mod session;
pub mod tenant;
pub mod topology;
pub mod types;
pub mod views;
pub mod xid;

use address::AddressVirtualizer;
use config::Config;
use openflow::FeaturesReply;
use openflow::OfMessage;
use physical::PhysicalLink;
use physical::PhysicalNetwork;
use physical::TopologySeed;
use pipeline::MessageSink;
use registry::Registry;
use types::Endpoint;
use types::NvdError;
use types::NvdResult;

/// The shared state of the hypervisor.  One instance serves every physical
/// switch and tenant controller session.
pub struct Hypervisor {
    // Time this object was created.
    start_time: chrono::DateTime<chrono::Utc>,
    pub config: Config,
    pub log: slog::Logger,
    pub registry: Arc<Registry>,
    /// The physical fabric.  Always locked before any tenant state.
    pub physical: RwLock<PhysicalNetwork>,
    pub addresses: AddressVirtualizer,
    sink: Arc<dyn MessageSink>,
}

impl Hypervisor {
    pub fn new(
        log: &slog::Logger,
        config: Config,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        let registry = Arc::new(Registry::new(log, &config));
        Hypervisor {
            start_time: chrono::Utc::now(),
            addresses: AddressVirtualizer::new(log, registry.clone()),
            physical: RwLock::new(PhysicalNetwork::new(log)),
            registry,
            config,
            log: log.new(slog::o!("unit" => "hypervisor")),
            sink,
        }
    }

    pub fn start_time(&self) -> chrono::DateTime<chrono::Utc> {
        self.start_time
    }

    /// Seed the physical network from a topology description.
    pub fn load_topology(&self, seed: &TopologySeed) -> NvdResult<()> {
        self.physical.write().unwrap().seed(seed)?;
        info!(self.log, "loaded physical topology";
            "switches" => seed.switches.len(),
            "links" => seed.links.len());
        Ok(())
    }

    /// A physical switch completed its handshake.
    pub fn physical_switch_connected(
        &self,
        features: &FeaturesReply,
    ) -> NvdResult<()> {
        let dpid = features.datapath_id;
        let mut physical = self.physical.write().unwrap();
        physical.add_switch(dpid);
        for port in &features.ports {
            if port.port_no.is_reserved() {
                continue;
            }
            physical.add_port(dpid, port.port_no, port.hw_addr)?;
        }
        info!(self.log, "physical switch connected";
            "dpid" => %dpid,
            "ports" => features.ports.len());
        Ok(())
    }

    /// A physical switch's channel closed.  Its transactions can never be
    /// answered, so their correlation entries are dropped.
    pub fn physical_switch_disconnected(&self, dpid: Dpid) {
        self.physical.write().unwrap().set_disconnected(dpid);
        self.registry.forget_physical_switch(dpid);
    }

    /// Record a link discovered in the fabric.
    pub fn add_physical_link(&self, link: PhysicalLink) -> NvdResult<()> {
        self.physical.write().unwrap().add_link(link)
    }

    /// Forget a physical link.  Virtual links and routes already using it
    /// keep their copy of the path.
    pub fn remove_physical_link(&self, link: PhysicalLink) -> NvdResult<()> {
        self.physical.write().unwrap().remove_link(link)
    }

    // Hand a message to the transport.  Never called with a lock held.
    fn send(&self, to: Endpoint, msg: OfMessage) -> NvdResult<()> {
        let kind = msg.kind();
        self.sink.send(to, msg).map_err(|e| {
            warn!(self.log, "send failed";
                "to" => %to,
                "message" => kind,
                "error" => %e);
            match e {
                NvdError::Disconnected(_) => e,
                _ => NvdError::Disconnected(to),
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::Arc;
    use std::sync::Mutex;

    use super::*;
    use crate::topology::ControllerAddr;
    use crate::types::SwitchId;
    use crate::types::TenantId;

    /// A sink that remembers everything it was asked to send.
    #[derive(Default)]
    pub struct RecordingSink {
        pub sent: Mutex<Vec<(Endpoint, OfMessage)>>,
        pub opened: Mutex<Vec<(TenantId, SwitchId)>>,
    }

    impl RecordingSink {
        pub fn take(&self) -> Vec<(Endpoint, OfMessage)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl MessageSink for RecordingSink {
        fn send(&self, to: Endpoint, msg: OfMessage) -> NvdResult<()> {
            self.sent.lock().unwrap().push((to, msg));
            Ok(())
        }

        fn open_controller(
            &self,
            tenant_id: TenantId,
            switch_id: SwitchId,
            _controller: &ControllerAddr,
        ) -> NvdResult<()> {
            self.opened.lock().unwrap().push((tenant_id, switch_id));
            Ok(())
        }

        fn close_controller(&self, tenant_id: TenantId, switch_id: SwitchId) {
            self.opened
                .lock()
                .unwrap()
                .retain(|x| *x != (tenant_id, switch_id));
        }
    }

    pub fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    /// A hypervisor over switches 1..=n, each with ports 1..=4.
    pub fn hypervisor(
        n: u64,
        links: &[&str],
        config: Config,
    ) -> (Hypervisor, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let hv = Hypervisor::new(&test_logger(), config, sink.clone());
        let seed = TopologySeed {
            switches: (1..=n)
                .map(|dpid| physical::SwitchSeed {
                    dpid,
                    ports: vec![1, 2, 3, 4],
                })
                .collect(),
            links: links.iter().map(|l| l.to_string()).collect(),
        };
        hv.load_topology(&seed).unwrap();
        (hv, sink)
    }
}
