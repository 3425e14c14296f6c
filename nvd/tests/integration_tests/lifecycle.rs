// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::net::Ipv4Addr;

use nvd::openflow::Action;
use nvd::openflow::FlowMod;
use nvd::openflow::Match;
use nvd::openflow::OfBody;
use nvd::openflow::OfMessage;
use nvd::types::PortNo;
use nvd::types::SwitchId;
use nvd::types::TenantId;
use pretty_assertions::assert_eq;

use crate::integration_tests::common::*;

#[test]
fn test_edge_port_lifecycle() -> TestResult {
    let fabric = Fabric::new(1, &[])?;
    let hv = &fabric.hv;
    let t = fabric.tenant()?;
    let sw = hv.create_virtual_switch(t, &[dpid(1)])?;

    let port = hv.create_edge_port(t, dpid(1), PortNo(2), host(1))?;
    assert_eq!(port, PortNo(1));
    assert_eq!(hv.registry.tenant_of_mac(host(1)), Some(t));
    assert_eq!(hv.addresses.virtual_to_physical_mac(host(1), t)?, host(1));

    hv.remove_host(t, host(1))?;
    assert_eq!(hv.registry.tenant_of_mac(host(1)), None);
    assert!(hv.list_hosts(t)?.is_empty());
    let topo = hv.virtual_topology(t)?;
    assert!(topo.switches[0].ports.is_empty());

    // Once unregistered, the MAC gets a translation like any other address
    assert_ne!(hv.addresses.virtual_to_physical_mac(host(1), t)?, host(1));
    assert_eq!(hv.registry.physical_switches_of(t, sw)?, vec![dpid(1)]);
    Ok(())
}

#[test]
fn test_network_removal_leaves_nothing() -> TestResult {
    let fabric = Fabric::new(3, &["1/1-2/1", "2/2-3/1"])?;
    let hv = &fabric.hv;
    let t = fabric.tenant()?;
    let big = hv.create_virtual_switch(t, &[dpid(1), dpid(2)])?;
    let single = hv.create_virtual_switch(t, &[dpid(3)])?;
    hv.create_edge_port(t, dpid(1), PortNo(2), host(1))?;
    hv.create_edge_port(t, dpid(2), PortNo(3), host(2))?;
    hv.create_edge_port(t, dpid(3), PortNo(2), host(3))?;
    hv.create_virtual_link(t, "2/2-3/1")?;
    hv.create_big_switch_route(t, big, PortNo(1), PortNo(2), "1/1-2/1")?;
    hv.boot_network(t)?;

    // Leave some state in every table
    let vmatch = Match {
        in_port: Some(PortNo(1)),
        nw_src: Some(Ipv4Addr::new(10, 0, 0, 1)),
        ..Default::default()
    };
    let fm = FlowMod::add(vmatch, vec![Action::output(PortNo(2))]);
    hv.devirtualize(t, big, OfMessage::new(1, OfBody::FlowMod(fm)))?;
    hv.devirtualize(t, single, barrier(2))?;
    assert!(hv.registry.pending_transactions(t) > 0);
    assert!(hv.registry.tenant_footprint(t) > 0);

    hv.remove_network(t)?;
    assert_eq!(hv.registry.tenant_footprint(t), 0);
    assert_eq!(hv.registry.pending_transactions(t), 0);
    assert!(fabric.recorder.controllers.lock().unwrap().is_empty());
    assert_eq!(hv.registry.tenant_of_mac(host(1)), None);

    // The id comes back with nothing attached to it
    let again = fabric.tenant()?;
    assert_eq!(again, t);
    assert!(hv.list_hosts(again)?.is_empty());
    assert!(hv.virtual_topology(again)?.switches.is_empty());
    assert_eq!(hv.registry.physical_ip_of(Ipv4Addr::new(10, 0, 0, 1), again)?, None);
    assert_eq!(hv.registry.virtual_switch_of(again, dpid(1))?, None);
    Ok(())
}

#[test]
fn test_switch_removal() -> TestResult {
    let fabric = Fabric::new(2, &["1/1-2/1"])?;
    let hv = &fabric.hv;
    let t = fabric.tenant()?;
    let sw1 = hv.create_virtual_switch(t, &[dpid(1)])?;
    let sw2 = hv.create_virtual_switch(t, &[dpid(2)])?;
    hv.create_edge_port(t, dpid(1), PortNo(2), host(1))?;
    hv.create_virtual_link(t, "1/1-2/1")?;
    hv.boot_network(t)?;
    fabric.recorder.take();

    hv.remove_switch(t, sw1)?;
    assert_eq!(hv.registry.tenant_of_mac(host(1)), None);
    let topo = hv.virtual_topology(t)?;
    assert_eq!(topo.switches.len(), 1);
    assert!(topo.links.is_empty());
    assert!(topo.switches[0].ports.is_empty());

    // The surviving switch hears its link port go away
    let sent = fabric.recorder.take_for(controller(t, sw2));
    assert_eq!(sent.len(), 1);
    assert!(matches!(sent[0].body, OfBody::PortStatus(_)));

    // The physical switch can back a new virtual switch
    assert_eq!(hv.create_virtual_switch(t, &[dpid(1)])?, SwitchId(1));
    Ok(())
}

#[test]
fn test_tenants_are_isolated() -> TestResult {
    let fabric = Fabric::new(1, &[])?;
    let hv = &fabric.hv;
    let t1 = fabric.tenant()?;
    let t2 = fabric.tenant()?;
    assert_ne!(t1, t2);

    // Both tenants may use the same physical switch and numbering
    let sw1 = hv.create_virtual_switch(t1, &[dpid(1)])?;
    let sw2 = hv.create_virtual_switch(t2, &[dpid(1)])?;
    assert_eq!(sw1, sw2);
    hv.create_edge_port(t1, dpid(1), PortNo(1), host(1))?;
    hv.create_edge_port(t2, dpid(1), PortNo(2), host(2))?;

    // but not the same host
    assert!(hv.create_edge_port(t2, dpid(1), PortNo(3), host(1)).is_err());

    assert!(hv.remove_host(t2, host(1)).is_err());
    assert_eq!(hv.registry.tenant_of_mac(host(1)), Some(t1));
    assert!(hv.remove_network(TenantId(99)).is_err());
    Ok(())
}
