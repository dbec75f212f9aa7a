//! Gossip-Based Cluster Membership Library
//!
//! This library crate implements a SWIM-style membership and failure
//! detection engine with the Lifeguard refinements: randomized probing with
//! indirect and reliable-transport fallbacks, a suspicion sub-protocol whose
//! timeouts contract under independent confirmation, local health awareness
//! that stretches timeouts when this node is struggling, piggybacked gossip
//! dissemination and periodic anti-entropy state exchange.
//!
//! ## Architecture Modules
//! The engine is composed of loosely coupled subsystems:
//!
//! - **`cluster`**: The engine itself. Owns the periodic probe/gossip/
//!   push-pull loops, the probe state machine and the state-change handlers.
//! - **`membership`**: The data model and the indexed, shuffleable table of
//!   per-node views that drives probe order.
//! - **`protocol`**: The wire records exchanged between members, encoded
//!   with bincode.
//! - **`awareness`** / **`suspicion`**: Lifeguard's local health score and
//!   the confirmation-accelerated suspicion timers.
//! - **`broadcast`**: The pending-broadcast queue contract plus an
//!   in-memory implementation with supersede-by-name semantics.
//! - **`transport`** / **`delegate`**: The seams to the network layer and
//!   to the embedding application.

pub mod awareness;
pub mod broadcast;
pub mod cluster;
pub mod config;
pub mod delegate;
pub mod membership;
pub mod protocol;
pub mod suspicion;
pub mod transport;

pub use cluster::service::Cluster;
pub use config::Config;
pub use delegate::Delegates;
pub use membership::types::{Node, NodeStateKind};
