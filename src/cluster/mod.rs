//! Cluster Engine Module
//!
//! Drives the failure-detection and dissemination protocol over the
//! membership table: periodic randomized probing with indirect and
//! reliable-transport fallbacks, suspicion with confirmation-accelerated
//! timeouts, piggybacked gossip, and periodic anti-entropy exchanges.
//!
//! ## Submodules
//! - **`service`**: The [`service::Cluster`] instance: scheduling, the probe
//!   engine, gossip and push/pull rounds, leave, and the public ping.
//! - **`handlers`**: Ingest of alive/suspect/dead records and snapshot
//!   merges; the only code that mutates node state.
//! - **`acks`**: Registry mapping in-flight probe sequence numbers to their
//!   ack/nack channels.

pub mod service;

pub(crate) mod acks;
mod handlers;
