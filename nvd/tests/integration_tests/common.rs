// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::sync::Arc;
use std::sync::Mutex;

use slog::Drain;

use ::common::network::Dpid;
use ::common::network::MacAddr;
use nvd::config::Config;
use nvd::openflow::OfBody;
use nvd::openflow::OfMessage;
use nvd::physical::SwitchSeed;
use nvd::physical::TopologySeed;
use nvd::pipeline::MessageSink;
use nvd::topology::ControllerAddr;
use nvd::types::Endpoint;
use nvd::types::NvdResult;
use nvd::types::SwitchId;
use nvd::types::TenantId;
use nvd::Hypervisor;

pub type TestResult = Result<(), anyhow::Error>;

/// Stands in for the transport, keeping everything the hypervisor sends.
#[derive(Default)]
pub struct Recorder {
    sent: Mutex<Vec<(Endpoint, OfMessage)>>,
    pub controllers: Mutex<Vec<(TenantId, SwitchId)>>,
}

impl Recorder {
    pub fn take(&self) -> Vec<(Endpoint, OfMessage)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    /// Everything sent to one endpoint, in order.
    pub fn take_for(&self, to: Endpoint) -> Vec<OfMessage> {
        let mut sent = self.sent.lock().unwrap();
        let (mine, rest) = std::mem::take(&mut *sent)
            .into_iter()
            .partition::<Vec<_>, _>(|(e, _)| *e == to);
        *sent = rest;
        mine.into_iter().map(|(_, m)| m).collect()
    }
}

impl MessageSink for Recorder {
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
        self.controllers.lock().unwrap().push((tenant_id, switch_id));
        Ok(())
    }

    fn close_controller(&self, tenant_id: TenantId, switch_id: SwitchId) {
        self.controllers
            .lock()
            .unwrap()
            .retain(|c| *c != (tenant_id, switch_id));
    }
}

pub struct Fabric {
    pub hv: Hypervisor,
    pub recorder: Arc<Recorder>,
}

fn test_logger() -> slog::Logger {
    let decorator = slog_term::PlainDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

impl Fabric {
    /// Physical switches `1..=switches`, each with ports 1 through 4, joined
    /// by `links` in both directions.
    pub fn new(switches: u64, links: &[&str]) -> anyhow::Result<Self> {
        Self::with_config(switches, links, Config::default())
    }

    pub fn with_config(
        switches: u64,
        links: &[&str],
        config: Config,
    ) -> anyhow::Result<Self> {
        let recorder = Arc::new(Recorder::default());
        let hv = Hypervisor::new(&test_logger(), config, recorder.clone());
        hv.load_topology(&TopologySeed {
            switches: (1..=switches)
                .map(|dpid| SwitchSeed {
                    dpid,
                    ports: vec![1, 2, 3, 4],
                })
                .collect(),
            links: links.iter().map(|l| l.to_string()).collect(),
        })?;
        Ok(Fabric { hv, recorder })
    }

    pub fn tenant(&self) -> anyhow::Result<TenantId> {
        Ok(self
            .hv
            .create_virtual_network("tcp", "192.168.0.10", 6633, "10.0.0.0/8")?)
    }
}

pub fn host(n: u8) -> MacAddr {
    MacAddr::new(0, 0, 0, 0, 0, n)
}

pub fn dpid(n: u64) -> Dpid {
    Dpid(n)
}

pub fn controller(tenant_id: TenantId, switch_id: SwitchId) -> Endpoint {
    Endpoint::Controller {
        tenant_id,
        switch_id,
    }
}

pub fn barrier(xid: u32) -> OfMessage {
    OfMessage::new(xid, OfBody::BarrierRequest)
}
