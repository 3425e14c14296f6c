// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! General types used throughout the hypervisor.

use std::convert;
use std::fmt;

use common::network::Dpid;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use crate::openflow::BadActionCode;

macro_rules! id_type {
    ($(#[$attr:meta])* $name:ident, $inner:ty) => {
        $(#[$attr])*
        #[derive(
            Clone,
            Copy,
            Debug,
            Deserialize,
            Eq,
            Hash,
            JsonSchema,
            Ord,
            PartialEq,
            PartialOrd,
            Serialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$inner> for $name {
            fn from(x: $inner) -> Self {
                $name(x)
            }
        }

        impl From<$name> for $inner {
            fn from(x: $name) -> $inner {
                x.0
            }
        }
    };
}

id_type!(
    /// Identifies one tenant and the virtual network it owns.
    TenantId,
    u32
);
id_type!(
    /// A virtual switch, unique within its tenant.
    SwitchId,
    u32
);
id_type!(
    /// A virtual link, unique within its tenant.
    LinkId,
    u32
);
id_type!(
    /// A route, unique within its big switch.
    RouteId,
    u32
);
id_type!(
    /// An OpenFlow port number, on either side of the virtualization
    /// boundary.
    PortNo,
    u16
);

impl PortNo {
    /// Highest number usable for an ordinary port.
    pub const MAX: PortNo = PortNo(0xff00);
    pub const IN_PORT: PortNo = PortNo(0xfff8);
    pub const TABLE: PortNo = PortNo(0xfff9);
    pub const NORMAL: PortNo = PortNo(0xfffa);
    pub const FLOOD: PortNo = PortNo(0xfffb);
    pub const ALL: PortNo = PortNo(0xfffc);
    pub const CONTROLLER: PortNo = PortNo(0xfffd);
    pub const LOCAL: PortNo = PortNo(0xfffe);
    pub const NONE: PortNo = PortNo(0xffff);

    /// Ports above `MAX` have protocol-defined meanings rather than naming a
    /// port on a switch.
    pub fn is_reserved(self) -> bool {
        self.0 > Self::MAX.0
    }
}

/// One side of a control channel.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Endpoint {
    /// The channel to a physical switch.
    Physical(Dpid),
    /// The channel between a virtual switch and its tenant's controller.
    Controller {
        tenant_id: TenantId,
        switch_id: SwitchId,
    },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Endpoint::Physical(dpid) => write!(f, "switch {dpid}"),
            Endpoint::Controller {
                tenant_id,
                switch_id,
            } => write!(f, "controller of tenant {tenant_id} switch {switch_id}"),
        }
    }
}

pub type NvdResult<T> = Result<T, NvdError>;

#[derive(Debug, thiserror::Error)]
pub enum NvdError {
    #[error("I/O error: {0:?}")]
    Io(std::io::Error),
    #[error("Invalid tenant id: {0}")]
    InvalidTenantId(TenantId),
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("Route computation failed: {0}")]
    RouteComputationFailed(String),
    #[error("Action virtualization denied: {reason}")]
    ActionVirtualizationDenied { reason: String, code: BadActionCode },
    #[error("Malformed path specification {spec:?}: {reason}")]
    MalformedPathSpec { spec: String, reason: String },
    #[error("Resource already exists: {0}")]
    Exists(String),
    #[error("No channel to {0}")]
    Disconnected(Endpoint),
    #[error("Table {0} is full")]
    TableFull(String),
    #[error("Registry invariant violated: {0}")]
    Invariant(String),
    #[error("Error: {0}")]
    Other(String),
}

impl NvdError {
    /// Everything except a registry inconsistency can be reported back to
    /// the caller as an ordinary failed request.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, NvdError::Invariant(_))
    }

    pub(crate) fn denied(reason: impl ToString, code: BadActionCode) -> Self {
        NvdError::ActionVirtualizationDenied {
            reason: reason.to_string(),
            code,
        }
    }

    pub(crate) fn malformed(spec: &str, reason: impl ToString) -> Self {
        NvdError::MalformedPathSpec {
            spec: spec.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl convert::From<std::io::Error> for NvdError {
    fn from(err: std::io::Error) -> Self {
        NvdError::Io(err)
    }
}

impl convert::From<&str> for NvdError {
    fn from(err: &str) -> Self {
        NvdError::Other(err.to_string())
    }
}

impl convert::From<String> for NvdError {
    fn from(err: String) -> Self {
        NvdError::Other(err)
    }
}

impl convert::From<toml::de::Error> for NvdError {
    fn from(err: toml::de::Error) -> Self {
        NvdError::Other(format!("failed to parse TOML: {err}"))
    }
}
