//! Cluster configuration and the timing math derived from it.
//!
//! All tunables recognized by the engine live here, together with the two
//! cluster-size-dependent scaling functions: the suspicion timeout grows
//! logarithmically with the member count, and the anti-entropy interval is
//! stretched on large clusters to cap aggregate bandwidth.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

/// Upper bound for application metadata attached to the local node.
pub const META_MAX_SIZE: usize = 512;

/// Cluster size above which the push/pull interval starts growing.
const PUSH_PULL_SCALE_THRESHOLD: usize = 32;

/// Callback deciding whether a peer address may join our view.
pub type IpPolicy = Arc<dyn Fn(IpAddr) -> Result<()> + Send + Sync>;

/// Callback disabling the reliable-transport fallback ping per node.
pub type TcpPingPolicy = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Tunables for a cluster member.
///
/// `Config::local()` gives defaults suitable for a low-latency network;
/// applications override individual fields afterwards.
#[derive(Clone)]
pub struct Config {
    /// Unique node name. Must be non-empty and stable for the node's lifetime.
    pub name: String,
    /// Address advertised to peers.
    pub advertise_addr: IpAddr,
    /// Port advertised to peers.
    pub advertise_port: u16,
    /// Opaque application metadata carried on alive records. At most
    /// [`META_MAX_SIZE`] bytes.
    pub meta: Vec<u8>,

    /// Protocol version triple (min, max, current) spoken by this node.
    pub protocol_min: u8,
    pub protocol_max: u8,
    pub protocol_cur: u8,
    /// Delegate version triple (min, max, current).
    pub delegate_min: u8,
    pub delegate_max: u8,
    pub delegate_cur: u8,

    /// Base interval between failure-detection rounds.
    pub probe_interval: Duration,
    /// How long a direct datagram ping may go unanswered before the
    /// indirect phase starts.
    pub probe_timeout: Duration,
    /// Interval between gossip dispatches.
    pub gossip_interval: Duration,
    /// Base interval between full state exchanges, before size scaling.
    pub push_pull_interval: Duration,

    /// Number of random peers gossiped to per tick.
    pub gossip_nodes: usize,
    /// Number of peers asked to ping indirectly when a direct probe fails.
    pub indirect_checks: usize,

    /// Multiplier applied to the log-scaled suspicion timeout.
    pub suspicion_mult: u32,
    /// Ratio between the initial (max) and fully-confirmed (min) suspicion
    /// timeouts.
    pub suspicion_max_timeout_mult: u32,
    /// Retransmit multiplier handed to the broadcast queue.
    pub retransmit_mult: u32,
    /// Upper bound (exclusive) for the awareness health score.
    pub awareness_max_multiplier: u32,

    /// How long dead nodes keep receiving gossip and stay in the probe
    /// sequence before being reaped.
    pub gossip_to_the_dead_time: Duration,
    /// Minimum time a name must stay dead before another address may claim
    /// it. Zero disables reclaim entirely.
    pub dead_node_reclaim_time: Duration,

    /// Datagram payload budget used when batching broadcasts.
    pub udp_buffer_size: usize,
    /// Bytes reserved per datagram for message protection applied by the
    /// transport. Zero when messages travel in the clear.
    pub encryption_overhead: usize,
    /// Disable the reliable-transport fallback ping for every peer.
    pub disable_tcp_pings: bool,
    /// Disable the fallback ping for specific peers.
    pub disable_tcp_pings_for_node: Option<TcpPingPolicy>,
    /// Admission policy for peer addresses. `None` admits everything.
    pub ip_allowed: Option<IpPolicy>,
}

impl Config {
    /// Defaults tuned for a local / LAN environment.
    pub fn local(name: impl Into<String>, addr: IpAddr, port: u16) -> Self {
        Self {
            name: name.into(),
            advertise_addr: addr,
            advertise_port: port,
            meta: Vec::new(),
            protocol_min: 1,
            protocol_max: 5,
            protocol_cur: 2,
            delegate_min: 2,
            delegate_max: 5,
            delegate_cur: 4,
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            gossip_interval: Duration::from_millis(200),
            push_pull_interval: Duration::from_secs(30),
            gossip_nodes: 3,
            indirect_checks: 3,
            suspicion_mult: 4,
            suspicion_max_timeout_mult: 6,
            retransmit_mult: 4,
            awareness_max_multiplier: 8,
            gossip_to_the_dead_time: Duration::from_secs(30),
            dead_node_reclaim_time: Duration::ZERO,
            udp_buffer_size: 1400,
            encryption_overhead: 0,
            disable_tcp_pings: false,
            disable_tcp_pings_for_node: None,
            ip_allowed: None,
        }
    }

    /// Version bytes in wire order: (pmin, pmax, pcur, dmin, dmax, dcur).
    pub fn version_bytes(&self) -> [u8; 6] {
        [
            self.protocol_min,
            self.protocol_max,
            self.protocol_cur,
            self.delegate_min,
            self.delegate_max,
            self.delegate_cur,
        ]
    }

    /// Checks an address against the admission policy.
    pub fn ip_allowed(&self, addr: IpAddr) -> Result<()> {
        match &self.ip_allowed {
            Some(policy) => policy(addr),
            None => Ok(()),
        }
    }

    /// Whether the reliable-transport fallback ping is enabled for `node`.
    pub fn tcp_pings_enabled(&self, node: &str) -> bool {
        if self.disable_tcp_pings {
            return false;
        }
        match &self.disable_tcp_pings_for_node {
            Some(policy) => !policy(node),
            None => true,
        }
    }

    /// Validates the fields the engine depends on.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("node name must not be empty");
        }
        if self.meta.len() > META_MAX_SIZE {
            anyhow::bail!(
                "meta is {} bytes, limit is {}",
                self.meta.len(),
                META_MAX_SIZE
            );
        }
        if self.protocol_min == 0
            || self.protocol_max == 0
            || self.protocol_min > self.protocol_max
        {
            anyhow::bail!(
                "invalid protocol version range: {} <= {} <= {}",
                self.protocol_min,
                self.protocol_cur,
                self.protocol_max
            );
        }
        Ok(())
    }
}

/// Total time a node stays suspect before being declared dead, assuming no
/// independent confirmations arrive. Scales with log10 of the cluster size
/// so larger clusters get more time for refutations to propagate.
pub fn suspicion_timeout(suspicion_mult: u32, n: usize, probe_interval: Duration) -> Duration {
    let node_scale = (n.max(1) as f64).log10().max(1.0);
    probe_interval.mul_f64(suspicion_mult as f64 * node_scale)
}

/// Scales the anti-entropy interval with cluster size. Identity up to the
/// threshold, then grows with log2 of the member count.
pub fn push_pull_scale(interval: Duration, n: usize) -> Duration {
    if n <= PUSH_PULL_SCALE_THRESHOLD {
        return interval;
    }
    let multiplier =
        ((n as f64).log2() - (PUSH_PULL_SCALE_THRESHOLD as f64).log2()).ceil() + 1.0;
    interval.mul_f64(multiplier)
}
