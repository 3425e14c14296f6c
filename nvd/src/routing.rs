// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Path computation inside big switches.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;

use common::network::Dpid;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use crate::path::is_contiguous;
use crate::physical::PhysicalLink;
use crate::physical::PhysicalNetwork;
use crate::physical::PhysicalPortRef;
use crate::types::NvdError;
use crate::types::NvdResult;

/// How a big switch establishes routes between its ports.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    JsonSchema,
    PartialEq,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    /// Routes are supplied explicitly and only validated.
    #[default]
    #[strum(serialize = "manual")]
    Manual,
    /// Routes are computed on demand as minimum-hop paths.
    #[strum(to_string = "shortest-path", serialize = "spf")]
    ShortestPath,
}

/// A forward path and its reverse.
pub type RoutePaths = (Vec<PhysicalLink>, Vec<PhysicalLink>);

impl RoutingStrategy {
    /// Establish the paths between two ports of a big switch whose members
    /// are `members`.
    ///
    /// Manual routing requires `requested`, and validates it.  Shortest-path
    /// routing computes the path itself and refuses a requested one.
    pub fn compute_route(
        &self,
        physical: &PhysicalNetwork,
        members: &[Dpid],
        ingress: PhysicalPortRef,
        egress: PhysicalPortRef,
        requested: Option<&[PhysicalLink]>,
    ) -> NvdResult<RoutePaths> {
        let forward = match (self, requested) {
            (RoutingStrategy::Manual, Some(path)) => {
                validate_path(physical, members, path)?;
                path.to_vec()
            }
            (RoutingStrategy::Manual, None) => {
                return Err(NvdError::RouteComputationFailed(format!(
                    "no route from {ingress} to {egress} has been configured"
                )))
            }
            (RoutingStrategy::ShortestPath, Some(_)) => {
                return Err(NvdError::RouteComputationFailed(
                    "explicit paths require manual routing".into(),
                ))
            }
            (RoutingStrategy::ShortestPath, None) => {
                shortest_path(physical, members, ingress.dpid, egress.dpid)?
            }
        };
        let reverse = reverse_path(&forward);
        Ok((forward, reverse))
    }
}

/// The path traversed backwards: hops in reverse order, each with its
/// endpoints swapped.
pub fn reverse_path(path: &[PhysicalLink]) -> Vec<PhysicalLink> {
    path.iter().rev().map(PhysicalLink::reversed).collect()
}

/// Check that a supplied path lies within `members`, follows known physical
/// links, is contiguous, and can be walked backwards.
pub fn validate_path(
    physical: &PhysicalNetwork,
    members: &[Dpid],
    path: &[PhysicalLink],
) -> NvdResult<()> {
    if path.is_empty() {
        return Err(NvdError::RouteComputationFailed("empty path".into()));
    }
    for hop in path {
        for dpid in [hop.src.dpid, hop.dst.dpid] {
            if !members.contains(&dpid) {
                return Err(NvdError::RouteComputationFailed(format!(
                    "switch {dpid} on hop {hop} is not a member"
                )));
            }
        }
        if !physical.has_link(hop) {
            return Err(NvdError::RouteComputationFailed(format!(
                "no physical link {hop}"
            )));
        }
        if !physical.has_link(&hop.reversed()) {
            return Err(NvdError::RouteComputationFailed(format!(
                "no physical link {}",
                hop.reversed()
            )));
        }
    }
    if !is_contiguous(path) {
        return Err(NvdError::RouteComputationFailed(
            "path is not contiguous".into(),
        ));
    }
    Ok(())
}

/// Breadth-first search for a minimum-hop path over the member switches,
/// using only links that exist in both directions.  Neighbors are visited
/// by ascending switch id and then port number, so equal-length paths are
/// chosen deterministically.
pub fn shortest_path(
    physical: &PhysicalNetwork,
    members: &[Dpid],
    from: Dpid,
    to: Dpid,
) -> NvdResult<Vec<PhysicalLink>> {
    for dpid in [from, to] {
        if !members.contains(&dpid) {
            return Err(NvdError::RouteComputationFailed(format!(
                "switch {dpid} is not a member"
            )));
        }
    }
    if from == to {
        return Ok(Vec::new());
    }

    let mut arrived_by: BTreeMap<Dpid, PhysicalLink> = BTreeMap::new();
    let mut seen = BTreeSet::from([from]);
    let mut queue = VecDeque::from([from]);

    while let Some(dpid) = queue.pop_front() {
        let mut hops: Vec<PhysicalLink> = physical
            .links_from(dpid)
            .filter(|l| members.contains(&l.dst.dpid))
            .filter(|l| physical.has_link(&l.reversed()))
            .collect();
        hops.sort_by_key(|l| (l.dst.dpid, l.src.port, l.dst.port));

        for hop in hops {
            if !seen.insert(hop.dst.dpid) {
                continue;
            }
            arrived_by.insert(hop.dst.dpid, hop);
            if hop.dst.dpid == to {
                let mut path = Vec::new();
                let mut at = to;
                while at != from {
                    let hop = arrived_by[&at];
                    path.push(hop);
                    at = hop.src.dpid;
                }
                path.reverse();
                return Ok(path);
            }
            queue.push_back(hop.dst.dpid);
        }
    }

    Err(NvdError::RouteComputationFailed(format!(
        "switch {to} is unreachable from {from}"
    )))
}
