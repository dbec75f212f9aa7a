//! Registry of in-flight probe sequence numbers.
//!
//! Each outgoing ping registers handlers for the matching ack (and
//! optionally nack) responses. Entries reap themselves after a timeout;
//! probe-style entries push a `complete = false` sentinel onto the ack
//! channel when reaped so the probe round always unblocks. Channel sends
//! are non-blocking throughout, so duplicate or stale responses are
//! silently dropped.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::protocol::{AckResp, NackResp};

/// What a probe learns from the ack channel. `complete` is false only for
/// the reaper's timeout sentinel.
#[derive(Debug, Clone)]
pub(crate) struct AckMessage {
    pub complete: bool,
    pub payload: Vec<u8>,
    pub timestamp: Instant,
}

type AckFn = Box<dyn Fn(Vec<u8>, Instant) + Send + Sync>;
type NackFn = Box<dyn Fn() + Send + Sync>;

struct AckHandler {
    ack_fn: AckFn,
    nack_fn: Option<NackFn>,
    reaper: JoinHandle<()>,
}

pub(crate) struct AckRegistry {
    handlers: Arc<DashMap<u32, AckHandler>>,
}

impl AckRegistry {
    pub(crate) fn new() -> Self {
        Self {
            handlers: Arc::new(DashMap::new()),
        }
    }

    /// Installs forwarding handlers for a probe: acks go to `ack_tx`,
    /// nacks to `nack_tx`. After `timeout` the entry is removed and a
    /// sentinel is pushed so the waiting probe round terminates.
    pub(crate) fn set_probe_channels(
        &self,
        seq_no: u32,
        ack_tx: mpsc::Sender<AckMessage>,
        nack_tx: Option<mpsc::Sender<()>>,
        timeout: Duration,
    ) {
        let forward = ack_tx.clone();
        let ack_fn: AckFn = Box::new(move |payload, timestamp| {
            let _ = forward.try_send(AckMessage {
                complete: true,
                payload,
                timestamp,
            });
        });
        let nack_fn: Option<NackFn> = nack_tx.map(|tx| {
            let f: NackFn = Box::new(move || {
                let _ = tx.try_send(());
            });
            f
        });

        let handlers = self.handlers.clone();
        let reaper = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            handlers.remove(&seq_no);
            let _ = ack_tx.try_send(AckMessage {
                complete: false,
                payload: Vec::new(),
                timestamp: Instant::now(),
            });
        });

        self.handlers.insert(
            seq_no,
            AckHandler {
                ack_fn,
                nack_fn,
                reaper,
            },
        );
    }

    /// Installs a bare ack handler that reaps silently on timeout. Used for
    /// relayed indirect pings, which never produce nacks locally.
    pub(crate) fn set_ack_handler(
        &self,
        seq_no: u32,
        ack_fn: impl Fn(Vec<u8>, Instant) + Send + Sync + 'static,
        timeout: Duration,
    ) {
        let handlers = self.handlers.clone();
        let reaper = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            handlers.remove(&seq_no);
        });

        self.handlers.insert(
            seq_no,
            AckHandler {
                ack_fn: Box::new(ack_fn),
                nack_fn: None,
                reaper,
            },
        );
    }

    /// Fulfils and removes the handler for an incoming ack, if any.
    pub(crate) fn invoke_ack_handler(&self, ack: AckResp, timestamp: Instant) {
        if let Some((_, handler)) = self.handlers.remove(&ack.seq_no) {
            handler.reaper.abort();
            (handler.ack_fn)(ack.payload, timestamp);
        }
    }

    /// Invokes the nack handler for an incoming nack without removing the
    /// entry; the real ack may still arrive.
    pub(crate) fn invoke_nack_handler(&self, nack: NackResp) {
        if let Some(handler) = self.handlers.get(&nack.seq_no)
            && let Some(nack_fn) = &handler.nack_fn
        {
            nack_fn();
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.handlers.len()
    }
}
