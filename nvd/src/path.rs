// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Parsing of textual physical paths.
//!
//! A path is a comma-separated list of hops, each naming a directed physical
//! link as `dpidA/portA-dpidB/portB`.  Datapath ids may be given in decimal
//! or in colon-separated hex.

use crate::physical::PhysicalLink;
use crate::physical::PhysicalPortRef;
use crate::types::NvdError;
use crate::types::NvdResult;
use crate::types::PortNo;

use common::network::Dpid;

/// Parse a path specification.  Any malformed token fails the whole parse.
pub fn parse_path(spec: &str) -> NvdResult<Vec<PhysicalLink>> {
    if spec.trim().is_empty() {
        return Err(NvdError::malformed(spec, "empty path"));
    }
    spec.split(',').map(|hop| parse_hop(spec, hop)).collect()
}

fn parse_hop(spec: &str, hop: &str) -> NvdResult<PhysicalLink> {
    let ends: Vec<&str> = hop.trim().split('-').collect();
    if ends.len() != 2 {
        return Err(NvdError::malformed(
            spec,
            format!("hop {hop:?} must have exactly two endpoints"),
        ));
    }
    Ok(PhysicalLink::new(
        parse_endpoint(spec, ends[0])?,
        parse_endpoint(spec, ends[1])?,
    ))
}

fn parse_endpoint(spec: &str, end: &str) -> NvdResult<PhysicalPortRef> {
    let (dpid, port) = end.trim().split_once('/').ok_or_else(|| {
        NvdError::malformed(spec, format!("endpoint {end:?} is not dpid/port"))
    })?;
    let dpid: Dpid = dpid.parse().map_err(|_| {
        NvdError::malformed(spec, format!("bad datapath id {dpid:?}"))
    })?;
    let port: u16 = port.parse().map_err(|_| {
        NvdError::malformed(spec, format!("bad port number {port:?}"))
    })?;
    let port = PortNo(port);
    if port.is_reserved() {
        return Err(NvdError::malformed(
            spec,
            format!("port {port} is reserved"),
        ));
    }
    Ok(PhysicalPortRef { dpid, port })
}

/// True if each hop leaves the switch the previous hop arrived at.
pub fn is_contiguous(path: &[PhysicalLink]) -> bool {
    path.windows(2).all(|w| w[0].dst.dpid == w[1].src.dpid)
}

/// Render a path the way `parse_path()` reads it.
pub fn format_path(path: &[PhysicalLink]) -> String {
    path.iter()
        .map(|l| l.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
