use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Lifecycle state of a node as seen by the local failure detector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeStateKind {
    /// The node is healthy and responsive.
    Alive,
    /// The node has missed probes and is suspected to be down. It can
    /// transition back to `Alive` if it refutes the suspicion, or to `Dead`
    /// when the suspicion timer expires.
    Suspect,
    /// The node is confirmed failed.
    Dead,
    /// The node announced its own departure.
    Left,
}

/// A member of the cluster: identity, addressing, application metadata and
/// the version ranges it speaks. This is the immutable snapshot handed to
/// delegates; liveness state lives on [`NodeState`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    /// Unique name of the node, stable across restarts.
    pub name: String,
    /// Advertised IP address.
    pub addr: IpAddr,
    /// Advertised port.
    pub port: u16,
    /// Opaque application metadata, size-bounded.
    pub meta: Vec<u8>,
    /// Minimum protocol version this node understands.
    pub pmin: u8,
    /// Maximum protocol version this node understands.
    pub pmax: u8,
    /// Protocol version this node is speaking.
    pub pcur: u8,
    /// Minimum delegate version this node understands.
    pub dmin: u8,
    /// Maximum delegate version this node understands.
    pub dmax: u8,
    /// Delegate version this node is speaking.
    pub dcur: u8,
}

impl Node {
    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    /// Version bytes in wire order: (pmin, pmax, pcur, dmin, dmax, dcur).
    pub fn version_bytes(&self) -> [u8; 6] {
        [self.pmin, self.pmax, self.pcur, self.dmin, self.dmax, self.dcur]
    }

    /// Copies a six-byte version vector into the discrete fields. Shorter
    /// vectors are ignored, matching senders that predate negotiation.
    pub fn apply_version_bytes(&mut self, vsn: &[u8]) {
        if vsn.len() >= 6 {
            self.pmin = vsn[0];
            self.pmax = vsn[1];
            self.pcur = vsn[2];
            self.dmin = vsn[3];
            self.dmax = vsn[4];
            self.dcur = vsn[5];
        }
    }
}

/// The local view of one peer: the node identity plus the liveness state
/// machine driven by incoming alive/suspect/dead records.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub node: Node,
    /// Last incarnation number heard for this node. Never decreases.
    pub incarnation: u32,
    pub state: NodeStateKind,
    /// When the last state transition was committed.
    pub state_change: Instant,
}

impl NodeState {
    pub fn address(&self) -> SocketAddr {
        self.node.address()
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }

    pub fn dead_or_left(&self) -> bool {
        self.state == NodeStateKind::Dead || self.state == NodeStateKind::Left
    }
}
