//! Pending-broadcast queue.
//!
//! State changes are disseminated by piggybacking queued messages onto
//! outgoing datagrams. The queue contract the engine relies on: messages
//! are keyed by node name and a newer message for the same name supersedes
//! the older one, drains are byte-budgeted, and each message is retransmitted
//! a limited number of times that scales with cluster size.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// Returns the current cluster size estimate, used to scale the
/// retransmit limit.
pub type NumNodesFn = Arc<dyn Fn() -> usize + Send + Sync>;

pub trait BroadcastQueue: Send + Sync {
    /// Enqueues an encoded message keyed by `name`, invalidating any older
    /// message with the same key. `notify` is signalled once the message has
    /// been fully transmitted or superseded.
    fn queue_broadcast(&self, name: &str, encoded: Vec<u8>, notify: Option<Arc<Notify>>);

    /// Drains up to `limit` bytes of pending broadcasts, charging `overhead`
    /// bytes per message for envelope costs. Transmit counters are bumped;
    /// exhausted messages leave the queue.
    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>>;
}

struct QueuedBroadcast {
    name: String,
    msg: Vec<u8>,
    transmits: u32,
    notify: Option<Arc<Notify>>,
}

impl QueuedBroadcast {
    fn finished(&self) {
        if let Some(notify) = &self.notify {
            notify.notify_one();
        }
    }
}

/// In-memory [`BroadcastQueue`] with the supersede-by-name property.
pub struct MessageQueue {
    retransmit_mult: u32,
    num_nodes: NumNodesFn,
    pending: Mutex<Vec<QueuedBroadcast>>,
}

impl MessageQueue {
    pub fn new(retransmit_mult: u32, num_nodes: NumNodesFn) -> Self {
        Self {
            retransmit_mult,
            num_nodes,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// How often one message is retransmitted before being dropped:
    /// `mult * ceil(log10(n + 1))`.
    fn retransmit_limit(&self) -> u32 {
        let n = (self.num_nodes)();
        let scale = ((n + 1) as f64).log10().ceil().max(1.0) as u32;
        self.retransmit_mult * scale
    }

    /// Number of messages currently queued.
    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BroadcastQueue for MessageQueue {
    fn queue_broadcast(&self, name: &str, encoded: Vec<u8>, notify: Option<Arc<Notify>>) {
        let mut pending = self.pending.lock().unwrap();
        if let Some(pos) = pending.iter().position(|b| b.name == name) {
            let old = pending.remove(pos);
            old.finished();
        }
        pending.push(QueuedBroadcast {
            name: name.to_string(),
            msg: encoded,
            transmits: 0,
            notify,
        });
    }

    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let retransmit_limit = self.retransmit_limit();
        let mut pending = self.pending.lock().unwrap();

        // Prefer the least-transmitted (newest) messages first.
        pending.sort_by_key(|b| b.transmits);

        let mut drained = Vec::new();
        let mut bytes_used = 0;
        let mut exhausted = Vec::new();

        for (i, b) in pending.iter_mut().enumerate() {
            let cost = overhead + b.msg.len();
            if bytes_used + cost > limit {
                continue;
            }
            bytes_used += cost;
            b.transmits += 1;
            drained.push(b.msg.clone());
            if b.transmits >= retransmit_limit {
                exhausted.push(i);
            }
        }

        for i in exhausted.into_iter().rev() {
            let b = pending.remove(i);
            b.finished();
        }

        drained
    }
}
