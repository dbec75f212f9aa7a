//! Optional application hooks invoked by the engine.
//!
//! Every delegate is optional; an absent delegate is a no-op. All methods
//! are synchronous and are called while the engine holds its membership
//! lock, so implementations must return quickly and never block. Event
//! notifications for a given node are delivered serially, in the order the
//! state transitions were committed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::membership::types::Node;

/// Filters incoming alive records. Returning an error prevents the node
/// from being admitted to the local view (e.g. to enforce a cluster name).
pub trait AliveDelegate: Send + Sync {
    fn notify_alive(&self, peer: &Node) -> Result<()>;
}

/// Informed when an alive record carries a known name with a conflicting
/// address while the stored entry is still live.
pub trait ConflictDelegate: Send + Sync {
    fn notify_conflict(&self, existing: &Node, other: &Node);
}

/// Consulted before merging a remote full-state snapshot. Returning an
/// error aborts the merge without mutating local state.
pub trait MergeDelegate: Send + Sync {
    fn notify_merge(&self, peers: &[Node]) -> Result<()>;
}

/// Receives membership transitions. Never invoked concurrently.
pub trait EventDelegate: Send + Sync {
    /// A node transitioned from Dead or Left to Alive.
    fn notify_join(&self, node: &Node);
    /// A node transitioned to Dead or Left.
    fn notify_leave(&self, node: &Node);
    /// A node's metadata changed without a liveness transition.
    fn notify_update(&self, node: &Node);
}

/// Observes round-trip times of completed direct probes and contributes a
/// payload to outgoing acks. Does not apply to indirect or fallback pings.
pub trait PingDelegate: Send + Sync {
    fn ack_payload(&self) -> Vec<u8>;
    fn notify_ping_complete(&self, other: &Node, rtt: Duration, payload: &[u8]);
}

/// Owns the opaque application state exchanged during anti-entropy.
pub trait StateDelegate: Send + Sync {
    fn local_state(&self, join: bool) -> Vec<u8>;
    fn merge_remote_state(&self, buf: &[u8], join: bool);
}

/// The set of hooks wired into a cluster instance.
#[derive(Clone, Default)]
pub struct Delegates {
    pub alive: Option<Arc<dyn AliveDelegate>>,
    pub conflict: Option<Arc<dyn ConflictDelegate>>,
    pub merge: Option<Arc<dyn MergeDelegate>>,
    pub event: Option<Arc<dyn EventDelegate>>,
    pub ping: Option<Arc<dyn PingDelegate>>,
    pub state: Option<Arc<dyn StateDelegate>>,
}

/// Kinds of membership events emitted by [`ChannelEventDelegate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEventKind {
    Join,
    Leave,
    Update,
}

/// A single membership event.
#[derive(Debug, Clone)]
pub struct NodeEvent {
    pub event: NodeEventKind,
    pub node: Node,
}

/// Forwards membership events over a channel instead of direct calls.
///
/// The channel is unbounded because the delegate runs under the membership
/// lock and must not block; consumers are expected to drain it promptly.
pub struct ChannelEventDelegate {
    tx: mpsc::UnboundedSender<NodeEvent>,
}

impl ChannelEventDelegate {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NodeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: NodeEventKind, node: &Node) {
        let _ = self.tx.send(NodeEvent {
            event,
            node: node.clone(),
        });
    }
}

impl EventDelegate for ChannelEventDelegate {
    fn notify_join(&self, node: &Node) {
        self.send(NodeEventKind::Join, node);
    }

    fn notify_leave(&self, node: &Node) {
        self.send(NodeEventKind::Leave, node);
    }

    fn notify_update(&self, node: &Node) {
        self.send(NodeEventKind::Update, node);
    }
}
