// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The decoded OpenFlow 1.0 control messages the hypervisor translates.
//!
//! Encoding and decoding live in the transport.  These types carry exactly
//! the fields the virtualization layer reads or rewrites, plus the encoded
//! length the transport writes into the header.

use std::net::Ipv4Addr;

use common::network::Dpid;
use common::network::MacAddr;

use crate::types::PortNo;

/// Buffer id meaning "the packet is carried in the message itself".
pub const NO_BUFFER: u32 = 0xffff_ffff;

const HEADER_LEN: u16 = 8;
const FLOW_MOD_LEN: u16 = 72;
const PACKET_OUT_LEN: u16 = 16;

/// A decoded control message and its transaction id.
#[derive(Clone, Debug, PartialEq)]
pub struct OfMessage {
    pub xid: u32,
    pub body: OfBody,
}

impl OfMessage {
    pub fn new(xid: u32, body: OfBody) -> Self {
        OfMessage { xid, body }
    }

    pub fn error(xid: u32, kind: ErrorKind) -> Self {
        OfMessage::new(
            xid,
            OfBody::Error(ErrorMsg {
                kind,
                data: Vec::new(),
            }),
        )
    }

    /// Short name of the message type, for logging.
    pub fn kind(&self) -> &'static str {
        match &self.body {
            OfBody::Hello => "hello",
            OfBody::EchoRequest(_) => "echo_request",
            OfBody::EchoReply(_) => "echo_reply",
            OfBody::FeaturesRequest => "features_request",
            OfBody::FeaturesReply(_) => "features_reply",
            OfBody::FlowMod(_) => "flow_mod",
            OfBody::PacketOut(_) => "packet_out",
            OfBody::PacketIn(_) => "packet_in",
            OfBody::FlowRemoved(_) => "flow_removed",
            OfBody::PortStatus(_) => "port_status",
            OfBody::Error(_) => "error",
            OfBody::BarrierRequest => "barrier_request",
            OfBody::BarrierReply => "barrier_reply",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum OfBody {
    Hello,
    EchoRequest(Vec<u8>),
    EchoReply(Vec<u8>),
    FeaturesRequest,
    FeaturesReply(FeaturesReply),
    FlowMod(FlowMod),
    PacketOut(PacketOut),
    PacketIn(PacketIn),
    FlowRemoved(FlowRemoved),
    PortStatus(PortStatus),
    Error(ErrorMsg),
    BarrierRequest,
    BarrierReply,
}

/// A flow match.  `None` in any field means the field is wildcarded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Match {
    pub in_port: Option<PortNo>,
    pub dl_src: Option<MacAddr>,
    pub dl_dst: Option<MacAddr>,
    pub dl_vlan: Option<u16>,
    pub dl_type: Option<u16>,
    pub nw_proto: Option<u8>,
    pub nw_src: Option<Ipv4Addr>,
    pub nw_dst: Option<Ipv4Addr>,
    pub tp_src: Option<u16>,
    pub tp_dst: Option<u16>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Output { port: PortNo, max_len: u16 },
    SetVlanVid(u16),
    StripVlan,
    SetDlSrc(MacAddr),
    SetDlDst(MacAddr),
    SetNwSrc(Ipv4Addr),
    SetNwDst(Ipv4Addr),
    SetNwTos(u8),
    SetTpSrc(u16),
    SetTpDst(u16),
    Enqueue { port: PortNo, queue_id: u32 },
    Vendor { vendor: u32, data: Vec<u8> },
}

impl Action {
    pub fn output(port: PortNo) -> Self {
        Action::Output {
            port,
            max_len: 0xffff,
        }
    }

    /// Encoded length of the action.
    pub fn encoded_len(&self) -> u16 {
        match self {
            Action::SetDlSrc(_) | Action::SetDlDst(_) => 16,
            Action::Enqueue { .. } => 16,
            Action::Vendor { data, .. } => {
                let len = 8 + data.len() as u16;
                (len + 7) & !7
            }
            _ => 8,
        }
    }
}

pub fn actions_len(actions: &[Action]) -> u16 {
    actions.iter().map(Action::encoded_len).sum()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowModCommand {
    Add,
    Modify,
    ModifyStrict,
    Delete,
    DeleteStrict,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FlowMod {
    pub flow_match: Match,
    pub cookie: u64,
    pub command: FlowModCommand,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub priority: u16,
    pub buffer_id: u32,
    pub out_port: PortNo,
    pub flags: u16,
    pub actions: Vec<Action>,
    pub length: u16,
}

impl FlowMod {
    /// An unbuffered `Add` with default timeouts.
    pub fn add(flow_match: Match, actions: Vec<Action>) -> Self {
        let mut fm = FlowMod {
            flow_match,
            cookie: 0,
            command: FlowModCommand::Add,
            idle_timeout: 0,
            hard_timeout: 0,
            priority: 0x8000,
            buffer_id: NO_BUFFER,
            out_port: PortNo::NONE,
            flags: 0,
            actions,
            length: 0,
        };
        fm.compute_length();
        fm
    }

    pub fn compute_length(&mut self) {
        self.length = FLOW_MOD_LEN + actions_len(&self.actions);
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PacketOut {
    pub buffer_id: u32,
    pub in_port: PortNo,
    pub actions: Vec<Action>,
    pub data: Vec<u8>,
    pub length: u16,
}

impl PacketOut {
    pub fn new(in_port: PortNo, actions: Vec<Action>, data: Vec<u8>) -> Self {
        let mut po = PacketOut {
            buffer_id: NO_BUFFER,
            in_port,
            actions,
            data,
            length: 0,
        };
        po.compute_length();
        po
    }

    pub fn compute_length(&mut self) {
        self.length = PACKET_OUT_LEN
            + actions_len(&self.actions)
            + self.data.len() as u16;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketInReason {
    NoMatch,
    Action,
}

/// A packet punted to the control plane.
///
/// `headers` is the summary of the packet's headers produced by the
/// transport's frame decoder; the hypervisor never parses `data` itself.
#[derive(Clone, Debug, PartialEq)]
pub struct PacketIn {
    pub buffer_id: u32,
    pub total_len: u16,
    pub in_port: PortNo,
    pub reason: PacketInReason,
    pub headers: Match,
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowRemovedReason {
    IdleTimeout,
    HardTimeout,
    Delete,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FlowRemoved {
    pub flow_match: Match,
    pub cookie: u64,
    pub priority: u16,
    pub reason: FlowRemovedReason,
    pub duration_sec: u32,
    pub packet_count: u64,
    pub byte_count: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortDesc {
    pub port_no: PortNo,
    pub hw_addr: MacAddr,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FeaturesReply {
    pub datapath_id: Dpid,
    pub n_buffers: u32,
    pub n_tables: u8,
    pub ports: Vec<PortDesc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortReason {
    Add,
    Delete,
    Modify,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PortStatus {
    pub reason: PortReason,
    pub desc: PortDesc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum BadRequestCode {
    BadVersion = 0,
    BadType = 1,
    BadStat = 2,
    BadVendor = 3,
    BadSubtype = 4,
    Eperm = 5,
    BadLen = 6,
    BufferEmpty = 7,
    BufferUnknown = 8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum BadActionCode {
    BadType = 0,
    BadLen = 1,
    BadVendor = 2,
    BadVendorType = 3,
    BadOutPort = 4,
    BadArgument = 5,
    Eperm = 6,
    TooMany = 7,
    BadQueue = 8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum FlowModFailedCode {
    AllTablesFull = 0,
    Overlap = 1,
    Eperm = 2,
    BadEmergTimeout = 3,
    BadCommand = 4,
    Unsupported = 5,
}

/// The type and code of an OpenFlow error message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    HelloFailed(u16),
    BadRequest(BadRequestCode),
    BadAction(BadActionCode),
    FlowModFailed(FlowModFailedCode),
    PortModFailed(u16),
    QueueOpFailed(u16),
}

impl ErrorKind {
    pub fn err_type(&self) -> u16 {
        match self {
            ErrorKind::HelloFailed(_) => 0,
            ErrorKind::BadRequest(_) => 1,
            ErrorKind::BadAction(_) => 2,
            ErrorKind::FlowModFailed(_) => 3,
            ErrorKind::PortModFailed(_) => 4,
            ErrorKind::QueueOpFailed(_) => 5,
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            ErrorKind::HelloFailed(c)
            | ErrorKind::PortModFailed(c)
            | ErrorKind::QueueOpFailed(c) => *c,
            ErrorKind::BadRequest(c) => *c as u16,
            ErrorKind::BadAction(c) => *c as u16,
            ErrorKind::FlowModFailed(c) => *c as u16,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorMsg {
    pub kind: ErrorKind,
    pub data: Vec<u8>,
}

impl ErrorMsg {
    pub fn encoded_len(&self) -> u16 {
        HEADER_LEN + 4 + self.data.len() as u16
    }
}
