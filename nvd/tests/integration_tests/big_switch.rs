// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use nvd::openflow::Action;
use nvd::openflow::FlowMod;
use nvd::openflow::Match;
use nvd::openflow::OfBody;
use nvd::openflow::OfMessage;
use nvd::routing::RoutingStrategy;
use nvd::types::Endpoint;
use nvd::types::NvdError;
use nvd::types::PortNo;
use nvd::types::RouteId;
use pretty_assertions::assert_eq;

use crate::integration_tests::common::*;

#[test]
fn test_manual_route() -> TestResult {
    let fabric = Fabric::new(3, &["1/1-2/1", "2/2-3/1"])?;
    let hv = &fabric.hv;
    let t = fabric.tenant()?;
    let sw = hv.create_virtual_switch(t, &[dpid(1), dpid(2)])?;
    hv.create_edge_port(t, dpid(1), PortNo(2), host(1))?;
    hv.create_edge_port(t, dpid(2), PortNo(3), host(2))?;

    let route = hv.create_big_switch_route(t, sw, PortNo(1), PortNo(1), "1/1-2/1")?;
    assert_eq!(route, RouteId(1));

    // Switch 3 is not a member
    let err = hv
        .create_big_switch_route(t, sw, PortNo(1), PortNo(2), "1/1-2/1,2/2-3/1")
        .unwrap_err();
    assert!(matches!(err, NvdError::RouteComputationFailed(_)));
    let topo = hv.virtual_topology(t)?;
    assert_eq!(topo.switches[0].routes.len(), 1);

    // Unknown ports and malformed paths
    assert!(matches!(
        hv.create_big_switch_route(t, sw, PortNo(9), PortNo(2), "1/1-2/1"),
        Err(NvdError::InvalidIdentifier(_))
    ));
    assert!(matches!(
        hv.create_big_switch_route(t, sw, PortNo(1), PortNo(2), "1/1-2"),
        Err(NvdError::MalformedPathSpec { .. })
    ));
    Ok(())
}

#[test]
fn test_shortest_path_refuses_explicit_routes() -> TestResult {
    let fabric = Fabric::new(2, &["1/1-2/1"])?;
    let hv = &fabric.hv;
    let t = fabric.tenant()?;
    let sw = hv.create_virtual_switch_with_routing(
        t,
        &[dpid(1), dpid(2)],
        RoutingStrategy::ShortestPath,
    )?;
    hv.create_edge_port(t, dpid(1), PortNo(2), host(1))?;
    hv.create_edge_port(t, dpid(2), PortNo(2), host(2))?;
    assert!(matches!(
        hv.create_big_switch_route(t, sw, PortNo(1), PortNo(2), "1/1-2/1"),
        Err(NvdError::RouteComputationFailed(_))
    ));
    Ok(())
}

#[test]
fn test_flow_across_three_switches() -> TestResult {
    let mut config = nvd::config::Config::default();
    config.default_routing = RoutingStrategy::ShortestPath;
    let fabric = Fabric::with_config(3, &["1/1-2/1", "2/2-3/1"], config)?;
    let hv = &fabric.hv;
    let t = fabric.tenant()?;
    let sw = hv.create_virtual_switch(t, &[dpid(1), dpid(2), dpid(3)])?;
    hv.create_edge_port(t, dpid(1), PortNo(3), host(1))?;
    hv.create_edge_port(t, dpid(3), PortNo(3), host(2))?;
    hv.boot_network(t)?;

    let vmatch = Match {
        in_port: Some(PortNo(1)),
        dl_dst: Some(host(2)),
        ..Default::default()
    };
    let fm = FlowMod::add(vmatch, vec![Action::output(PortNo(2))]);
    hv.devirtualize(t, sw, OfMessage::new(9, OfBody::FlowMod(fm)))?;

    let mut flows: Vec<(Endpoint, PortNo, Vec<Action>)> = fabric
        .recorder
        .take()
        .into_iter()
        .filter_map(|(to, msg)| match msg.body {
            OfBody::FlowMod(fm) => {
                Some((to, fm.flow_match.in_port.unwrap(), fm.actions))
            }
            _ => None,
        })
        .collect();
    flows.sort_by_key(|(to, _, _)| *to);
    assert_eq!(
        flows,
        vec![
            (
                Endpoint::Physical(dpid(1)),
                PortNo(3),
                vec![Action::output(PortNo(1))]
            ),
            (
                Endpoint::Physical(dpid(2)),
                PortNo(1),
                vec![Action::output(PortNo(2))]
            ),
            (
                Endpoint::Physical(dpid(3)),
                PortNo(1),
                vec![Action::output(PortNo(3))]
            ),
        ]
    );

    // The computed route is cached and shows up in the topology
    let topo = hv.virtual_topology(t)?;
    assert_eq!(topo.switches[0].routes.len(), 1);
    assert_eq!(topo.switches[0].routes[0].path.len(), 2);
    Ok(())
}

#[test]
fn test_disconnected_members() -> TestResult {
    let fabric = Fabric::new(2, &[])?;
    let hv = &fabric.hv;
    let t = fabric.tenant()?;
    let sw = hv.create_virtual_switch_with_routing(
        t,
        &[dpid(1), dpid(2)],
        RoutingStrategy::ShortestPath,
    )?;
    hv.create_edge_port(t, dpid(1), PortNo(2), host(1))?;
    hv.create_edge_port(t, dpid(2), PortNo(2), host(2))?;
    hv.boot_network(t)?;
    fabric.recorder.take();

    let vmatch = Match {
        in_port: Some(PortNo(1)),
        ..Default::default()
    };
    let fm = FlowMod::add(vmatch, vec![Action::output(PortNo(2))]);
    let err = hv
        .devirtualize(t, sw, OfMessage::new(3, OfBody::FlowMod(fm)))
        .unwrap_err();
    assert!(matches!(err, NvdError::RouteComputationFailed(_)));

    // Only the error reply went out, and nothing is left pending
    let sent = fabric.recorder.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, controller(t, sw));
    assert!(matches!(sent[0].1.body, OfBody::Error(_)));
    assert_eq!(hv.registry.pending_transactions(t), 0);
    Ok(())
}
