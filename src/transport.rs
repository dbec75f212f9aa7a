//! The I/O seam between the engine and the network.
//!
//! Framing, socket management and message protection are external concerns;
//! the engine only needs best-effort datagrams plus two reliable-stream
//! operations whose codecs live with the transport implementation.

use std::fmt;
use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;

use crate::protocol::{Ping, StateSnapshot};

/// Marker wrapped around stream dial/read/write errors that were caused by
/// the remote end. The probe engine reacts to these by falling through to
/// the indirect phase immediately instead of waiting out the ack timeout.
#[derive(Debug)]
pub struct RemoteFailure(pub String);

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "remote transport failure: {}", self.0)
    }
}

impl std::error::Error for RemoteFailure {}

/// Whether an error indicates a failure on the other end.
pub fn failed_remote(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<RemoteFailure>().is_some())
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Best-effort datagram send. An error indicates a local failure unless
    /// it wraps [`RemoteFailure`].
    async fn send_packet(&self, addr: SocketAddr, payload: Vec<u8>) -> Result<()>;

    /// Pings `addr` over the reliable transport, waiting for the answer
    /// until `deadline`. Returns whether the peer was contacted.
    async fn ping_stream(&self, addr: SocketAddr, ping: &Ping, deadline: Instant)
        -> Result<bool>;

    /// Performs a full state exchange with `addr` over the reliable
    /// transport: pushes `local`, returns the peer's snapshot.
    async fn exchange_state(
        &self,
        addr: SocketAddr,
        local: StateSnapshot,
        join: bool,
    ) -> Result<StateSnapshot>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_remote_matches_wrapped_marker() {
        let err = anyhow::Error::new(RemoteFailure("dial".into()));
        assert!(failed_remote(&err));

        let wrapped = err.context("sending ping to 10.0.0.2:7946");
        assert!(failed_remote(&wrapped));
    }

    #[test]
    fn test_failed_remote_ignores_local_errors() {
        let err = anyhow::anyhow!("socket buffer full");
        assert!(!failed_remote(&err));
    }
}
