// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Per-connection tasks, and a `MessageSink` that hands outbound messages to
//! them over channels.
//!
//! The wire side of each connection is owned by the transport.  It feeds
//! decoded messages into a session task, which runs them through the
//! pipeline, and drains the outbound receiver obtained from the
//! `ChannelSink`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use common::network::Dpid;
use slog::debug;
use slog::info;
use slog::o;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::openflow::OfMessage;
use crate::pipeline::MessageSink;
use crate::topology::ControllerAddr;
use crate::types::Endpoint;
use crate::types::NvdError;
use crate::types::NvdResult;
use crate::types::SwitchId;
use crate::types::TenantId;
use crate::Hypervisor;

/// Controller channels coming and going, for the transport to act on.
#[derive(Debug)]
pub enum SinkEvent {
    /// Connect to `controller` and relay everything from `outbound` to it.
    ControllerOpened {
        tenant_id: TenantId,
        switch_id: SwitchId,
        controller: ControllerAddr,
        outbound: mpsc::UnboundedReceiver<OfMessage>,
    },
    ControllerClosed {
        tenant_id: TenantId,
        switch_id: SwitchId,
    },
}

/// A `MessageSink` with one unbounded channel per connected endpoint.
pub struct ChannelSink {
    log: slog::Logger,
    outbound: Mutex<BTreeMap<Endpoint, mpsc::UnboundedSender<OfMessage>>>,
    events: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new(log: &slog::Logger) -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let sink = ChannelSink {
            log: log.new(o!("unit" => "sink")),
            outbound: Mutex::new(BTreeMap::new()),
            events,
        };
        (sink, rx)
    }

    /// Register a newly connected physical switch, returning the receiver
    /// for messages the hypervisor sends it.
    pub fn attach_physical(
        &self,
        dpid: Dpid,
    ) -> mpsc::UnboundedReceiver<OfMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self
            .outbound
            .lock()
            .unwrap()
            .insert(Endpoint::Physical(dpid), tx)
            .is_some()
        {
            info!(self.log, "replaced channel to physical switch"; "dpid" => %dpid);
        }
        rx
    }

    pub fn detach_physical(&self, dpid: Dpid) {
        self.outbound
            .lock()
            .unwrap()
            .remove(&Endpoint::Physical(dpid));
    }

    pub fn is_attached(&self, to: Endpoint) -> bool {
        self.outbound.lock().unwrap().contains_key(&to)
    }
}

impl MessageSink for ChannelSink {
    fn send(&self, to: Endpoint, msg: OfMessage) -> NvdResult<()> {
        let mut outbound = self.outbound.lock().unwrap();
        let tx = outbound.get(&to).ok_or(NvdError::Disconnected(to))?;
        if tx.send(msg).is_err() {
            // The session went away without detaching.
            outbound.remove(&to);
            return Err(NvdError::Disconnected(to));
        }
        Ok(())
    }

    fn open_controller(
        &self,
        tenant_id: TenantId,
        switch_id: SwitchId,
        controller: &ControllerAddr,
    ) -> NvdResult<()> {
        let (tx, outbound) = mpsc::unbounded_channel();
        self.events
            .send(SinkEvent::ControllerOpened {
                tenant_id,
                switch_id,
                controller: controller.clone(),
                outbound,
            })
            .map_err(|_| {
                NvdError::Other("controller transport has shut down".into())
            })?;
        self.outbound.lock().unwrap().insert(
            Endpoint::Controller {
                tenant_id,
                switch_id,
            },
            tx,
        );
        debug!(self.log, "opened controller channel";
            "tenant_id" => %tenant_id,
            "switch_id" => %switch_id,
            "controller" => %controller);
        Ok(())
    }

    fn close_controller(&self, tenant_id: TenantId, switch_id: SwitchId) {
        self.outbound.lock().unwrap().remove(&Endpoint::Controller {
            tenant_id,
            switch_id,
        });
        _ = self.events.send(SinkEvent::ControllerClosed {
            tenant_id,
            switch_id,
        });
        debug!(self.log, "closed controller channel";
            "tenant_id" => %tenant_id,
            "switch_id" => %switch_id);
    }
}

// Task that spins, running each message from a physical switch through the
// pipeline until the transport drops its end of the channel.
async fn physical_session(
    hv: Arc<Hypervisor>,
    dpid: Dpid,
    mut inbound: mpsc::UnboundedReceiver<OfMessage>,
) {
    let log = hv.log.new(o!("unit" => "physical_session", "dpid" => dpid.to_string()));
    debug!(log, "session started");

    while let Some(msg) = inbound.recv().await {
        if let Err(e) = hv.virtualize(dpid, msg) {
            debug!(log, "failed to virtualize message"; "error" => %e);
        }
    }

    hv.physical_switch_disconnected(dpid);
    debug!(log, "session ended");
}

pub fn spawn_physical_session(
    hv: Arc<Hypervisor>,
    dpid: Dpid,
    inbound: mpsc::UnboundedReceiver<OfMessage>,
) -> JoinHandle<()> {
    tokio::task::spawn(physical_session(hv, dpid, inbound))
}

async fn controller_session(
    hv: Arc<Hypervisor>,
    tenant_id: TenantId,
    switch_id: SwitchId,
    mut inbound: mpsc::UnboundedReceiver<OfMessage>,
) {
    let log = hv.log.new(o!(
        "unit" => "controller_session",
        "tenant_id" => tenant_id.to_string(),
        "switch_id" => switch_id.to_string()
    ));
    debug!(log, "session started");

    while let Some(msg) = inbound.recv().await {
        // Rejected requests have already been answered and logged.
        if let Err(e) = hv.devirtualize(tenant_id, switch_id, msg) {
            debug!(log, "failed to devirtualize message"; "error" => %e);
        }
    }

    debug!(log, "session ended");
}

pub fn spawn_controller_session(
    hv: Arc<Hypervisor>,
    tenant_id: TenantId,
    switch_id: SwitchId,
    inbound: mpsc::UnboundedReceiver<OfMessage>,
) -> JoinHandle<()> {
    tokio::task::spawn(controller_session(hv, tenant_id, switch_id, inbound))
}
