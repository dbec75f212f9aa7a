//! Membership data model and table.
//!
//! Holds the per-node view of the cluster: the public [`types::Node`]
//! snapshot, the internal [`types::NodeState`] liveness record, and the
//! indexed, shuffleable table that drives probe order.
//!
//! ## Core Mechanisms
//! - **Dual views**: a by-name index for message ingest and a randomly
//!   permuted sequence for probing, kept consistent under one lock.
//! - **Randomized probe order**: new entries splice in at a random offset
//!   and every wrap reshuffles, bounding the time between probes of any
//!   live peer.
//! - **Retention**: dead and departed entries linger until a wrap reaps
//!   them, so the cluster keeps gossiping their fate for a while and their
//!   names cannot be reclaimed instantly.

pub mod types;

pub(crate) mod table;

#[cfg(test)]
mod tests;
