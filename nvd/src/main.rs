// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use futures::stream::StreamExt;
use libc::c_int;
use signal_hook::consts::SIGHUP;
use signal_hook::consts::SIGINT;
use signal_hook::consts::SIGQUIT;
use signal_hook::consts::SIGTERM;
use signal_hook_tokio::Signals;
use slog::debug;
use slog::info;
use slog::trace;
use structopt::StructOpt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use nvd::config;
use nvd::physical::TopologySeed;
use nvd::session::ChannelSink;
use nvd::session::SinkEvent;
use nvd::types::NvdError;
use nvd::types::NvdResult;
use nvd::types::SwitchId;
use nvd::types::TenantId;
use nvd::Hypervisor;

async fn load_topology<P>(path: P) -> NvdResult<TopologySeed>
where
    P: AsRef<std::path::Path>,
{
    let contents = tokio::fs::read_to_string(path).await?;
    toml::from_str(&contents)
        .map_err(|e| NvdError::Other(format!("failed to parse TOML: {e:?}")))
}

async fn handle_signals(log: &slog::Logger, mut signals: Signals) {
    let log = log.new(slog::o!("unit" => "signal_handler"));
    let handle = signals.handle();

    while let Some(signal) = signals.next().await {
        match signal {
            SIGTERM | SIGQUIT | SIGINT | SIGHUP => {
                info!(log, "received signal"; "sig" => signal);
                handle.close();
                return;
            }
            _ => unreachable!(),
        }
    }
}

// Task that spins, tracking the controller channels the hypervisor opens and
// closes.  Until a controller transport claims an outbound channel, its
// messages are drained and logged.
async fn controller_events(
    log: slog::Logger,
    mut events: mpsc::UnboundedReceiver<SinkEvent>,
) {
    let log = log.new(slog::o!("unit" => "controller_events"));
    let mut relays: BTreeMap<(TenantId, SwitchId), JoinHandle<()>> =
        BTreeMap::new();

    while let Some(event) = events.recv().await {
        match event {
            SinkEvent::ControllerOpened {
                tenant_id,
                switch_id,
                controller,
                mut outbound,
            } => {
                info!(log, "controller channel opened";
                    "tenant_id" => %tenant_id,
                    "switch_id" => %switch_id,
                    "controller" => %controller);
                let relay_log = log.clone();
                let relay = tokio::spawn(async move {
                    while let Some(msg) = outbound.recv().await {
                        trace!(relay_log, "to controller";
                            "tenant_id" => %tenant_id,
                            "switch_id" => %switch_id,
                            "message" => msg.kind(),
                            "xid" => msg.xid);
                    }
                });
                if let Some(old) = relays.insert((tenant_id, switch_id), relay) {
                    old.abort();
                }
            }
            SinkEvent::ControllerClosed {
                tenant_id,
                switch_id,
            } => {
                info!(log, "controller channel closed";
                    "tenant_id" => %tenant_id,
                    "switch_id" => %switch_id);
                if let Some(relay) = relays.remove(&(tenant_id, switch_id)) {
                    relay.abort();
                }
            }
        }
    }
    debug!(log, "event channel closed");
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let opts = config::Opt::from_args();
    let config = config::build_config(&opts).context("building config")?;
    let log = common::logging::init("nvd", &config.log_file, config.log_format)?;

    let (sink, events) = ChannelSink::new(&log);
    let sink = Arc::new(sink);
    let hv = Hypervisor::new(&log, config.clone(), sink);

    if let Some(file) = &config.topology_file {
        debug!(log, "reading physical topology"; "file" => file);
        let seed = load_topology(file)
            .await
            .with_context(|| format!("loading topology from {file}"))?;
        hv.load_topology(&seed)?;
    }

    let hv = Arc::new(hv);
    tokio::spawn(controller_events(log.clone(), events));

    info!(log, "network hypervisor running";
        "tenant_prefix_bits" => config.tenant_prefix_bits,
        "default_routing" => %config.default_routing,
        "started" => %hv.start_time());

    const SIGNALS: &[c_int] = &[SIGTERM, SIGQUIT, SIGINT, SIGHUP];
    let signals = Signals::new(SIGNALS)?;
    handle_signals(&log, signals).await;

    info!(log, "shutting down";
        "tenants" => hv.registry.tenant_ids().len());
    for tenant_id in hv.registry.tenant_ids() {
        if let Err(e) = hv.remove_network(tenant_id) {
            debug!(log, "failed to remove network";
                "tenant_id" => %tenant_id,
                "error" => %e);
        }
    }

    info!(log, "done");

    Ok(())
}
