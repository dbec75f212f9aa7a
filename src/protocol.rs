//! Wire records exchanged between cluster members.
//!
//! Every logical message is a `serde` type encoded with `bincode`. Framing,
//! transport headers and encryption live behind the [`crate::transport`]
//! seam; this module only defines the records the engine reasons about and
//! the compound envelope used to batch several of them into one datagram.

use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::membership::types::NodeStateKind;

/// Estimated envelope cost of a compound message (enum tag + vector length).
pub const COMPOUND_HEADER_OVERHEAD: usize = 12;

/// Estimated per-entry cost inside a compound message (length prefix).
pub const PER_MESSAGE_OVERHEAD: usize = 8;

/// Direct health check. The receiver answers with an [`AckResp`] carrying
/// the same sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub seq_no: u32,
    /// Name of the probed node, so a misdelivered ping can be discarded.
    pub node: String,
    pub source_addr: IpAddr,
    pub source_port: u16,
    pub source_node: String,
}

/// Request to ping `node` on our behalf and relay the outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndirectPingReq {
    pub seq_no: u32,
    pub target_addr: IpAddr,
    pub target_port: u16,
    pub node: String,
    /// Whether the relay should report failures with a [`NackResp`].
    pub nack: bool,
    pub source_addr: IpAddr,
    pub source_port: u16,
    pub source_node: String,
}

/// Positive probe response, optionally carrying an application payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResp {
    pub seq_no: u32,
    pub payload: Vec<u8>,
}

/// Negative response from an indirect-ping relay that could not reach the
/// target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NackResp {
    pub seq_no: u32,
}

/// A node asserting (or a peer relaying) that `node` is alive at the given
/// incarnation.
///
/// `vsn` is empty when the sender predates version negotiation, carries at
/// least the protocol triple at `len >= 3`, and the delegate triple too at
/// `len >= 6`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alive {
    pub incarnation: u32,
    pub node: String,
    pub addr: IpAddr,
    pub port: u16,
    pub meta: Vec<u8>,
    pub vsn: Vec<u8>,
}

/// Accusation that `node` failed to answer probes, authored by `from`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suspect {
    pub incarnation: u32,
    pub node: String,
    pub from: String,
}

/// Declaration that `node` is dead. `node == from` means the node announced
/// its own departure and leaves gracefully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dead {
    pub incarnation: u32,
    pub node: String,
    pub from: String,
}

/// One membership entry inside a full-state exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushNodeState {
    pub name: String,
    pub addr: IpAddr,
    pub port: u16,
    pub meta: Vec<u8>,
    pub incarnation: u32,
    pub state: NodeStateKind,
    pub vsn: Vec<u8>,
}

impl PushNodeState {
    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

/// Everything one side contributes to an anti-entropy exchange: its full
/// membership view plus an opaque application blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub nodes: Vec<PushNodeState>,
    pub user_state: Vec<u8>,
}

/// The wire protocol for inter-node communication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Ping(Ping),
    IndirectPing(IndirectPingReq),
    AckResp(AckResp),
    NackResp(NackResp),
    Alive(Alive),
    Suspect(Suspect),
    Dead(Dead),
    /// Several already-encoded messages batched into one datagram.
    Compound(Vec<Vec<u8>>),
}

/// Encodes a message for the wire.
pub fn encode(msg: &Message) -> Result<Vec<u8>> {
    bincode::serialize(msg).context("failed to encode message")
}

/// Decodes a message received from the wire.
pub fn decode(buf: &[u8]) -> Result<Message> {
    bincode::deserialize(buf).context("failed to decode message")
}

/// Wraps pre-encoded messages into a single compound datagram.
pub fn make_compound(msgs: Vec<Vec<u8>>) -> Result<Vec<u8>> {
    encode(&Message::Compound(msgs))
}
