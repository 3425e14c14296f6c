// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::net::Ipv4Addr;

use nvd::address::tenant_prefix;
use pretty_assertions::assert_eq;

use crate::integration_tests::common::*;

fn vips() -> Vec<Ipv4Addr> {
    vec![
        Ipv4Addr::new(10, 0, 0, 5),
        Ipv4Addr::new(10, 0, 0, 1),
        Ipv4Addr::new(192, 168, 1, 1),
        Ipv4Addr::new(10, 0, 0, 5),
    ]
}

#[test]
fn test_same_address_twice() -> TestResult {
    let fabric = Fabric::new(1, &[])?;
    let t = fabric.tenant()?;
    let av = &fabric.hv.addresses;
    let vip = Ipv4Addr::new(10, 0, 0, 7);
    let first = av.virtual_to_physical(vip, t)?;
    assert_eq!(av.virtual_to_physical(vip, t)?, first);
    assert_eq!(av.physical_to_virtual(first), Some((t, vip)));
    Ok(())
}

#[test]
fn test_tenants_are_disjoint() -> TestResult {
    let fabric = Fabric::new(1, &[])?;
    let t1 = fabric.tenant()?;
    let t2 = fabric.tenant()?;
    let av = &fabric.hv.addresses;
    let bits = fabric.hv.config.tenant_prefix_bits;

    for vip in vips() {
        let p1 = av.virtual_to_physical(vip, t1)?;
        let p2 = av.virtual_to_physical(vip, t2)?;
        assert_ne!(p1, p2);
        assert!(tenant_prefix(t1, bits)?.contains(p1));
        assert!(tenant_prefix(t2, bits)?.contains(p2));
        assert_eq!(av.physical_to_virtual(p1), Some((t1, vip)));
        assert_eq!(av.physical_to_virtual(p2), Some((t2, vip)));
    }

    let m1 = av.virtual_to_physical_mac(host(9), t1)?;
    let m2 = av.virtual_to_physical_mac(host(9), t2)?;
    assert_ne!(m1, m2);
    assert_eq!(av.physical_to_virtual_mac(m1, t1), host(9));
    Ok(())
}

#[test]
fn test_allocation_is_deterministic() -> TestResult {
    let run = || -> anyhow::Result<Vec<Ipv4Addr>> {
        let fabric = Fabric::new(1, &[])?;
        let t = fabric.tenant()?;
        let mut pips = Vec::new();
        for vip in vips() {
            pips.push(fabric.hv.addresses.virtual_to_physical(vip, t)?);
        }
        Ok(pips)
    };
    let first = run()?;
    assert_eq!(first, run()?);
    assert_eq!(
        first,
        vec![
            Ipv4Addr::new(1, 0, 0, 1),
            Ipv4Addr::new(1, 0, 0, 2),
            Ipv4Addr::new(1, 0, 0, 3),
            Ipv4Addr::new(1, 0, 0, 1),
        ]
    );
    Ok(())
}

#[test]
fn test_explicit_mapping() -> TestResult {
    let fabric = Fabric::new(1, &[])?;
    let t = fabric.tenant()?;
    let registry = &fabric.hv.registry;
    let vip = Ipv4Addr::new(10, 0, 0, 1);
    registry.add_address_mapping(t, vip, Ipv4Addr::new(1, 0, 0, 40))?;
    assert_eq!(registry.physical_ip_of(vip, t)?, Some(Ipv4Addr::new(1, 0, 0, 40)));

    // Outside the tenant's prefix
    assert!(registry
        .add_address_mapping(t, Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(2, 0, 0, 1))
        .is_err());

    // Later allocations move past the explicit one
    let next = fabric
        .hv
        .addresses
        .virtual_to_physical(Ipv4Addr::new(10, 0, 0, 3), t)?;
    assert_eq!(next, Ipv4Addr::new(1, 0, 0, 41));
    Ok(())
}
