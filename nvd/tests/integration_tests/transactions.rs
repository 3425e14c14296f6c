// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::net::Ipv4Addr;

use nvd::openflow::Action;
use nvd::openflow::FlowMod;
use nvd::openflow::FlowRemoved;
use nvd::openflow::FlowRemovedReason;
use nvd::openflow::Match;
use nvd::openflow::OfBody;
use nvd::openflow::OfMessage;
use nvd::openflow::PacketIn;
use nvd::openflow::PacketInReason;
use nvd::openflow::NO_BUFFER;
use nvd::types::Endpoint;
use nvd::types::PortNo;
use nvd::types::SwitchId;
use nvd::types::TenantId;
use pretty_assertions::assert_eq;

use crate::integration_tests::common::*;

// One tenant with a single switch on dpid 1, booted, host 1 on port 2.
fn booted_single() -> anyhow::Result<(Fabric, TenantId, SwitchId)> {
    let fabric = Fabric::new(1, &[])?;
    let t = fabric.tenant()?;
    let sw = fabric.hv.create_virtual_switch(t, &[dpid(1)])?;
    fabric.hv.create_edge_port(t, dpid(1), PortNo(2), host(1))?;
    fabric.hv.boot_network(t)?;
    fabric.recorder.take();
    Ok((fabric, t, sw))
}

// Send a barrier from the controller and return the xid it was given on
// the physical switch.
fn physical_barrier(
    fabric: &Fabric,
    t: TenantId,
    sw: SwitchId,
    xid: u32,
) -> anyhow::Result<u32> {
    fabric.hv.devirtualize(t, sw, barrier(xid))?;
    let sent = fabric.recorder.take_for(Endpoint::Physical(dpid(1)));
    assert_eq!(sent.len(), 1);
    Ok(sent[0].xid)
}

fn packet_in(port: u16, headers: Match) -> OfMessage {
    OfMessage::new(
        0,
        OfBody::PacketIn(PacketIn {
            buffer_id: NO_BUFFER,
            total_len: 60,
            in_port: PortNo(port),
            reason: PacketInReason::NoMatch,
            headers,
            data: vec![0; 60],
        }),
    )
}

#[test]
fn test_reply_delivered_once() -> TestResult {
    let (fabric, t, sw) = booted_single()?;
    let hv = &fabric.hv;
    let pxid = physical_barrier(&fabric, t, sw, 77)?;
    assert_ne!(pxid, 77);
    assert_eq!(hv.registry.pending_transactions(t), 1);

    let reply = OfMessage::new(pxid, OfBody::BarrierReply);
    hv.virtualize(dpid(1), reply.clone())?;
    assert_eq!(
        fabric.recorder.take(),
        vec![(controller(t, sw), OfMessage::new(77, OfBody::BarrierReply))]
    );
    assert_eq!(hv.registry.pending_transactions(t), 0);

    // The entry was consumed by the first reply
    hv.virtualize(dpid(1), reply)?;
    assert!(fabric.recorder.take().is_empty());
    Ok(())
}

#[test]
fn test_unknown_xid_dropped() -> TestResult {
    let (fabric, _t, _sw) = booted_single()?;
    fabric
        .hv
        .virtualize(dpid(1), OfMessage::new(12345, OfBody::BarrierReply))?;
    assert!(fabric.recorder.take().is_empty());
    Ok(())
}

#[test]
fn test_distinct_xids_per_request() -> TestResult {
    let (fabric, t, sw) = booted_single()?;
    // The same controller xid twice still gets two physical xids
    let first = physical_barrier(&fabric, t, sw, 5)?;
    let second = physical_barrier(&fabric, t, sw, 5)?;
    assert_ne!(first, second);
    assert_eq!(fabric.hv.registry.pending_transactions(t), 2);

    fabric
        .hv
        .virtualize(dpid(1), OfMessage::new(second, OfBody::BarrierReply))?;
    fabric
        .hv
        .virtualize(dpid(1), OfMessage::new(first, OfBody::BarrierReply))?;
    let xids: Vec<u32> = fabric
        .recorder
        .take_for(controller(t, sw))
        .into_iter()
        .map(|m| m.xid)
        .collect();
    assert_eq!(xids, vec![5, 5]);
    Ok(())
}

#[test]
fn test_flow_removed_correlated() -> TestResult {
    let (fabric, t, sw) = booted_single()?;
    let hv = &fabric.hv;
    let vmatch = Match {
        in_port: Some(PortNo(1)),
        dl_src: Some(host(1)),
        ..Default::default()
    };
    let mut fm = FlowMod::add(vmatch.clone(), vec![Action::output(PortNo(1))]);
    fm.cookie = 0xfeed;
    hv.devirtualize(t, sw, OfMessage::new(31, OfBody::FlowMod(fm)))?;
    let sent = fabric.recorder.take_for(Endpoint::Physical(dpid(1)));
    assert_eq!(sent.len(), 1);
    let (pxid, pmatch) = match &sent[0].body {
        OfBody::FlowMod(fm) => (sent[0].xid, fm.flow_match.clone()),
        other => panic!("expected flow mod, got {other:?}"),
    };
    assert_eq!(pmatch.in_port, Some(PortNo(2)));

    let removed = FlowRemoved {
        flow_match: pmatch,
        cookie: 0xfeed,
        priority: 0x8000,
        reason: FlowRemovedReason::IdleTimeout,
        duration_sec: 30,
        packet_count: 4,
        byte_count: 240,
    };
    hv.virtualize(dpid(1), OfMessage::new(pxid, OfBody::FlowRemoved(removed)))?;
    let sent = fabric.recorder.take_for(controller(t, sw));
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].xid, 31);
    match &sent[0].body {
        OfBody::FlowRemoved(fr) => {
            assert_eq!(fr.flow_match.in_port, Some(PortNo(1)));
            assert_eq!(fr.flow_match.dl_src, Some(host(1)));
            assert_eq!(fr.cookie, 0xfeed);
            assert_eq!(fr.packet_count, 4);
        }
        other => panic!("expected flow removed, got {other:?}"),
    }
    assert_eq!(hv.registry.pending_transactions(t), 0);
    Ok(())
}

#[test]
fn test_packet_in_owner() -> TestResult {
    let fabric = Fabric::new(2, &["1/1-2/1"])?;
    let hv = &fabric.hv;
    let t1 = fabric.tenant()?;
    let t2 = fabric.tenant()?;
    let sw1 = hv.create_virtual_switch(t1, &[dpid(1)])?;
    let sw2 = hv.create_virtual_switch(t2, &[dpid(1)])?;
    hv.create_virtual_switch(t1, &[dpid(2)])?;
    hv.create_virtual_switch(t2, &[dpid(2)])?;
    // Both tenants link their switches over 1/1-2/1 and have a host on
    // 1/2.  Port 1/3 belongs to the first tenant alone.
    hv.create_virtual_link(t1, "1/1-2/1")?;
    hv.create_virtual_link(t2, "1/1-2/1")?;
    hv.create_edge_port(t1, dpid(1), PortNo(2), host(1))?;
    hv.create_edge_port(t2, dpid(1), PortNo(2), host(2))?;
    hv.create_edge_port(t1, dpid(1), PortNo(3), host(3))?;
    hv.boot_network(t1)?;
    hv.boot_network(t2)?;
    fabric.recorder.take();

    let destinations = |msg: OfMessage| -> anyhow::Result<Vec<Endpoint>> {
        hv.virtualize(dpid(1), msg)?;
        Ok(fabric.recorder.take().into_iter().map(|(to, _)| to).collect())
    };

    // By source host
    let by_mac = Match {
        dl_src: Some(host(2)),
        ..Default::default()
    };
    assert_eq!(destinations(packet_in(2, by_mac))?, vec![controller(t2, sw2)]);

    // By the tenant prefix of the source address, on a link port
    let pip = hv.addresses.virtual_to_physical(Ipv4Addr::new(10, 0, 0, 9), t2)?;
    let by_ip = Match {
        dl_src: Some(host(9)),
        nw_src: Some(pip),
        ..Default::default()
    };
    assert_eq!(
        destinations(packet_in(1, by_ip.clone()))?,
        vec![controller(t2, sw2)]
    );

    // At an edge port the source address is the tenant's own, and proves
    // nothing about who owns the packet
    assert!(destinations(packet_in(2, by_ip))?.is_empty());

    // By the only tenant at the port
    assert_eq!(
        destinations(packet_in(3, Match::default()))?,
        vec![controller(t1, sw1)]
    );

    // Nothing identifies the owner of a shared port
    assert!(destinations(packet_in(2, Match::default()))?.is_empty());
    Ok(())
}

#[test]
fn test_disconnect_forgets_transactions() -> TestResult {
    let (fabric, t, sw) = booted_single()?;
    let hv = &fabric.hv;
    let pxid = physical_barrier(&fabric, t, sw, 8)?;
    assert_eq!(hv.registry.pending_transactions(t), 1);

    hv.physical_switch_disconnected(dpid(1));
    assert_eq!(hv.registry.pending_transactions(t), 0);

    // A reply arriving after the reconnect has nobody waiting for it
    hv.virtualize(dpid(1), OfMessage::new(pxid, OfBody::BarrierReply))?;
    assert!(fabric.recorder.take().is_empty());
    Ok(())
}
