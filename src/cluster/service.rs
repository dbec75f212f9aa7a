//! The cluster engine: periodic loops and the failure-detection round.
//!
//! A [`Cluster`] owns the membership table and runs three independent
//! periodic tasks once scheduled: the probe loop (failure detection), the
//! gossip loop (broadcast dissemination) and the push/pull loop
//! (anti-entropy). All of them observe a shared stop channel and exit
//! promptly on deschedule. The membership lock is never held across an I/O
//! or timer wait.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::acks::AckRegistry;
use crate::awareness::Awareness;
use crate::broadcast::BroadcastQueue;
use crate::config::{self, Config};
use crate::delegate::Delegates;
use crate::membership::table::MemberMap;
use crate::membership::types::{Node, NodeState, NodeStateKind};
use crate::protocol::{
    self, AckResp, Alive, COMPOUND_HEADER_OVERHEAD, Dead, IndirectPingReq, Message, NackResp,
    PER_MESSAGE_OVERHEAD, Ping, PushNodeState, StateSnapshot, Suspect,
};
use crate::transport::{Transport, failed_remote};

#[derive(Default)]
struct Tickers {
    stop: Option<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
}

/// One member's view of the cluster and the machinery that keeps it fresh.
pub struct Cluster {
    /// Back-reference handed to spawned tasks and suspicion timers, so the
    /// probe engine and the state machine can reference each other without
    /// keeping the instance alive forever.
    pub(crate) myself: Weak<Cluster>,
    pub(crate) config: Config,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) broadcasts: Arc<dyn BroadcastQueue>,
    pub(crate) delegates: Delegates,
    pub(crate) awareness: Awareness,
    /// Sole owner of every NodeState; see the lock discipline above.
    pub(crate) members: RwLock<MemberMap>,
    pub(crate) acks: AckRegistry,

    sequence_num: AtomicU32,
    incarnation: AtomicU32,
    pub(crate) num_nodes: AtomicU32,
    /// Cursor into the probe sequence. Only the probe loop advances it.
    probe_index: AtomicUsize,

    left: AtomicBool,
    /// Signalled once our own departure record has been transmitted.
    pub(crate) leave_broadcast: Arc<Notify>,

    tickers: Mutex<Tickers>,
}

impl Cluster {
    /// Builds a cluster instance and registers the local node as alive.
    /// Call [`Cluster::schedule`] to start the periodic loops.
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        broadcasts: Arc<dyn BroadcastQueue>,
        delegates: Delegates,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let awareness = Awareness::new(config.awareness_max_multiplier);

        let cluster = Arc::new_cyclic(|myself| Self {
            myself: myself.clone(),
            config,
            transport,
            broadcasts,
            delegates,
            awareness,
            members: RwLock::new(MemberMap::new()),
            acks: AckRegistry::new(),
            sequence_num: AtomicU32::new(0),
            incarnation: AtomicU32::new(0),
            num_nodes: AtomicU32::new(0),
            probe_index: AtomicUsize::new(0),
            left: AtomicBool::new(false),
            leave_broadcast: Arc::new(Notify::new()),
            tickers: Mutex::new(Tickers::default()),
        });
        cluster.set_alive();
        Ok(cluster)
    }

    fn set_alive(&self) {
        let a = Alive {
            incarnation: self.next_incarnation(),
            node: self.config.name.clone(),
            addr: self.config.advertise_addr,
            port: self.config.advertise_port,
            meta: self.config.meta.clone(),
            vsn: self.config.version_bytes().to_vec(),
        };
        self.alive_node(a, None, true);
    }

    // ---- counters ----

    pub(crate) fn next_seq_no(&self) -> u32 {
        self.sequence_num.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    pub(crate) fn next_incarnation(&self) -> u32 {
        self.incarnation.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    /// Jumps the incarnation by a positive offset, for refutations that
    /// must beat an accusation.
    pub(crate) fn skip_incarnation(&self, offset: u32) -> u32 {
        self.incarnation
            .fetch_add(offset, Ordering::SeqCst)
            .wrapping_add(offset)
    }

    /// Current estimate of the cluster size.
    pub fn est_num_nodes(&self) -> usize {
        self.num_nodes.load(Ordering::SeqCst) as usize
    }

    pub(crate) fn has_left(&self) -> bool {
        self.left.load(Ordering::SeqCst)
    }

    // ---- public view ----

    /// Snapshot of all members not known to be dead or departed.
    pub fn members(&self) -> Vec<Node> {
        let members = self.members.read().unwrap();
        members
            .nodes
            .iter()
            .filter(|n| !n.dead_or_left())
            .map(|n| n.node.clone())
            .collect()
    }

    pub fn num_members(&self) -> usize {
        let members = self.members.read().unwrap();
        members.nodes.iter().filter(|n| !n.dead_or_left()).count()
    }

    /// The local node as currently advertised.
    pub fn local_node(&self) -> Option<Node> {
        let members = self.members.read().unwrap();
        members.get(&self.config.name).map(|s| s.node.clone())
    }

    /// Current awareness score; zero is healthiest.
    pub fn health_score(&self) -> i32 {
        self.awareness.get_health_score()
    }

    // ---- scheduling ----

    /// Starts the probe, gossip and push/pull loops. Each begins with a
    /// uniform random stagger in `[0, interval)` so nodes across the
    /// cluster don't fire in lockstep. Safe to call more than once.
    pub fn schedule(&self) {
        let Some(this) = self.myself.upgrade() else {
            return;
        };
        let mut tickers = self.tickers.lock().unwrap();
        if !tickers.handles.is_empty() {
            return;
        }
        let (stop_tx, _) = watch::channel(false);

        if self.config.probe_interval > Duration::ZERO {
            let cluster = Arc::clone(&this);
            let mut stop = stop_tx.subscribe();
            let interval = self.config.probe_interval;
            tickers.handles.push(tokio::spawn(async move {
                if !stagger(interval, &mut stop).await {
                    return;
                }
                let mut ticker =
                    tokio::time::interval_at(Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => cluster.probe().await,
                        _ = stop.changed() => return,
                    }
                }
            }));
        }

        if self.config.gossip_interval > Duration::ZERO && self.config.gossip_nodes > 0 {
            let cluster = Arc::clone(&this);
            let mut stop = stop_tx.subscribe();
            let interval = self.config.gossip_interval;
            tickers.handles.push(tokio::spawn(async move {
                if !stagger(interval, &mut stop).await {
                    return;
                }
                let mut ticker =
                    tokio::time::interval_at(Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => cluster.gossip().await,
                        _ = stop.changed() => return,
                    }
                }
            }));
        }

        if self.config.push_pull_interval > Duration::ZERO {
            let cluster = Arc::clone(&this);
            let mut stop = stop_tx.subscribe();
            let interval = self.config.push_pull_interval;
            tickers.handles.push(tokio::spawn(async move {
                if !stagger(interval, &mut stop).await {
                    return;
                }
                // Unlike the fixed tickers this interval is recomputed every
                // round so it can grow with the cluster.
                loop {
                    let tick = config::push_pull_scale(interval, cluster.est_num_nodes());
                    tokio::select! {
                        _ = tokio::time::sleep(tick) => cluster.push_pull().await,
                        _ = stop.changed() => return,
                    }
                }
            }));
        }

        tickers.stop = Some(stop_tx);
    }

    /// Stops the periodic loops and waits for in-flight rounds to finish.
    /// Safe to call more than once.
    pub async fn deschedule(&self) {
        let (stop, handles) = {
            let mut tickers = self.tickers.lock().unwrap();
            (tickers.stop.take(), std::mem::take(&mut tickers.handles))
        };
        let Some(stop) = stop else { return };
        let _ = stop.send(true);
        for handle in handles {
            let _ = handle.await;
        }
    }

    // ---- probe engine ----

    /// One round of failure detection: pick the next eligible node from the
    /// probe sequence and probe it. Wrapping the sequence reaps dead
    /// entries and reshuffles.
    pub async fn probe(&self) {
        let mut num_check = 0;
        let target = loop {
            let candidate = {
                let members = self.members.read().unwrap();
                // Bounded by the sequence length so we can't loop forever
                // over a table with nothing probeable in it.
                if num_check >= members.len() {
                    return;
                }
                let idx = self.probe_index.load(Ordering::SeqCst);
                if idx >= members.len() {
                    drop(members);
                    self.reset_nodes();
                    self.probe_index.store(0, Ordering::SeqCst);
                    num_check += 1;
                    continue;
                }
                members.at(idx).cloned()
            };
            self.probe_index.fetch_add(1, Ordering::SeqCst);

            let Some(node) = candidate else {
                num_check += 1;
                continue;
            };
            if node.name() == self.config.name || node.dead_or_left() {
                num_check += 1;
                continue;
            }
            break node;
        };
        self.probe_node(&target).await;
    }

    /// Runs a full probe round against one node and applies the resulting
    /// awareness delta.
    pub async fn probe_node(&self, node: &NodeState) {
        let delta = self.probe_node_round(node).await;
        self.awareness.apply_delta(delta);
    }

    /// The probe state machine: direct ping, ack wait, indirect fan-out
    /// plus reliable-transport fallback, second ack wait, then suspicion.
    /// Returns the awareness delta for this round.
    async fn probe_node_round(&self, node: &NodeState) -> i32 {
        // A degraded node stretches the whole round, giving peers more time
        // to answer before we accuse them.
        let probe_interval = self.awareness.scale_timeout(self.config.probe_interval);
        if probe_interval > self.config.probe_interval {
            debug!(node = node.name(), "probing with degraded timeouts");
        }

        let ping = Ping {
            seq_no: self.next_seq_no(),
            node: node.name().to_string(),
            source_addr: self.config.advertise_addr,
            source_port: self.config.advertise_port,
            source_node: self.config.name.clone(),
        };
        let (ack_tx, mut ack_rx) = mpsc::channel(self.config.indirect_checks + 1);
        let (nack_tx, mut nack_rx) = mpsc::channel(self.config.indirect_checks + 1);
        self.acks
            .set_probe_channels(ping.seq_no, ack_tx.clone(), Some(nack_tx), probe_interval);

        // Mark the sent time before the syscall so RTTs cannot come out
        // negative; this over-reports slightly.
        let sent = Instant::now();
        let deadline = sent + probe_interval;
        let addr = node.address();

        let mut awareness_delta = 0;
        let mut remote_failure = false;

        if node.state == NodeStateKind::Alive {
            let packet = match protocol::encode(&Message::Ping(ping.clone())) {
                Ok(buf) => self.with_piggyback(buf),
                Err(e) => {
                    error!("failed to encode ping: {e:#}");
                    return awareness_delta;
                }
            };
            if let Err(e) = self.transport.send_packet(addr, packet).await {
                error!(node = node.name(), "failed to send ping: {e:#}");
                if failed_remote(&e) {
                    remote_failure = true;
                } else {
                    return awareness_delta;
                }
            }
        } else {
            // The target looks suspect: staple a suspect message onto the
            // ping so it learns about the accusation, and can refute,
            // without waiting for gossip to reach it.
            let suspect = Suspect {
                incarnation: node.incarnation,
                node: node.name().to_string(),
                from: self.config.name.clone(),
            };
            let parts = match (
                protocol::encode(&Message::Ping(ping.clone())),
                protocol::encode(&Message::Suspect(suspect)),
            ) {
                (Ok(p), Ok(s)) => vec![p, s],
                (Err(e), _) | (_, Err(e)) => {
                    error!("failed to encode compound probe: {e:#}");
                    return awareness_delta;
                }
            };
            let packet = match protocol::make_compound(parts) {
                Ok(buf) => buf,
                Err(e) => {
                    error!("failed to build compound probe: {e:#}");
                    return awareness_delta;
                }
            };
            if let Err(e) = self.transport.send_packet(addr, packet).await {
                error!(node = node.name(), "failed to send compound ping and suspect message: {e:#}");
                if failed_remote(&e) {
                    remote_failure = true;
                } else {
                    return awareness_delta;
                }
            }
        }

        if !remote_failure {
            // The ping went out, which is itself evidence of our health;
            // every return from here on keeps the credit unless the failure
            // handling at the bottom overwrites it.
            awareness_delta = -1;

            match tokio::time::timeout(self.config.probe_timeout, ack_rx.recv()).await {
                Ok(Some(v)) if v.complete => {
                    if let Some(ping_delegate) = &self.delegates.ping {
                        let rtt = v.timestamp.duration_since(sent);
                        ping_delegate.notify_ping_complete(&node.node, rtt, &v.payload);
                    }
                    return awareness_delta;
                }
                Ok(Some(v)) => {
                    // The reaper's sentinel landed before our own timeout.
                    // Put it back so the second wait below terminates.
                    let _ = ack_tx.try_send(v);
                }
                Ok(None) => {}
                Err(_) => {
                    // This timeout is deliberately not awareness-scaled:
                    // waiting longer won't get a dropped datagram through,
                    // while the scaled probe interval already buys the
                    // fallback paths more time.
                    debug!(node = node.name(), "failed ping (timeout reached)");
                }
            }
        }

        // Ask up to `indirect_checks` live peers to probe on our behalf.
        let peers = {
            let members = self.members.read().unwrap();
            members.k_random(self.config.indirect_checks, |n| {
                n.name() == self.config.name
                    || n.name() == node.name()
                    || n.state != NodeStateKind::Alive
            })
        };

        let mut expected_nacks = 0usize;
        for peer in &peers {
            let ind = IndirectPingReq {
                seq_no: ping.seq_no,
                target_addr: node.node.addr,
                target_port: node.node.port,
                node: node.name().to_string(),
                // Only peers speaking protocol 4+ will answer with nacks.
                nack: peer.node.pmax >= 4,
                source_addr: self.config.advertise_addr,
                source_port: self.config.advertise_port,
                source_node: self.config.name.clone(),
            };
            if ind.nack {
                expected_nacks += 1;
            }
            match protocol::encode(&Message::IndirectPing(ind)) {
                Ok(buf) => {
                    if let Err(e) = self.transport.send_packet(peer.address(), buf).await {
                        error!(peer = peer.name(), "failed to send indirect ping: {e:#}");
                    }
                }
                Err(e) => error!("failed to encode indirect ping: {e:#}"),
            }
        }

        // Concurrently try the target over the reliable transport. This
        // catches peers isolated from UDP traffic but still speaking TCP,
        // which would otherwise flap.
        let (fallback_tx, fallback_rx) = oneshot::channel::<bool>();
        if self.config.tcp_pings_enabled(node.name())
            && node.node.pmax >= 3
            && let Some(cluster) = self.myself.upgrade()
        {
            let ping = ping.clone();
            let name = node.name().to_string();
            tokio::spawn(async move {
                match cluster.transport.ping_stream(addr, &ping, deadline).await {
                    Ok(contact) => {
                        let _ = fallback_tx.send(contact);
                    }
                    Err(e) => error!(node = name.as_str(), "failed fallback ping: {e:#}"),
                }
            });
        } else {
            drop(fallback_tx);
        }

        // Wait again on the ack channel; the reaper's sentinel bounds this.
        // The fallback channel is deliberately not polled yet, so that a
        // TCP-only answer is recognized as the anomaly it is.
        if let Some(v) = ack_rx.recv().await
            && v.complete
        {
            return awareness_delta;
        }

        if let Ok(true) = fallback_rx.await {
            warn!(
                node = node.name(),
                "able to reach node over the reliable transport but not UDP, network may be misconfigured"
            );
            return awareness_delta;
        }

        // Total failure. With nack-capable peers the missing nacks measure
        // our own health; without them any failed probe costs one point.
        let mut observed_nacks = 0usize;
        while nack_rx.try_recv().is_ok() {
            observed_nacks += 1;
        }
        awareness_delta = if expected_nacks > 0 {
            expected_nacks.saturating_sub(observed_nacks) as i32
        } else {
            1
        };

        info!(node = node.name(), "suspect node has failed, no acks received");
        let s = Suspect {
            incarnation: node.incarnation,
            node: node.name().to_string(),
            from: self.config.name.clone(),
        };
        self.suspect_node(&s);
        awareness_delta
    }

    /// Issues a standalone ping and reports the round-trip time. Fails with
    /// a no-response error when no ack arrives within the probe timeout.
    pub async fn ping(&self, node: &str, addr: SocketAddr) -> Result<Duration> {
        let ping = Ping {
            seq_no: self.next_seq_no(),
            node: node.to_string(),
            source_addr: self.config.advertise_addr,
            source_port: self.config.advertise_port,
            source_node: self.config.name.clone(),
        };
        let (ack_tx, mut ack_rx) = mpsc::channel(self.config.indirect_checks + 1);
        self.acks
            .set_probe_channels(ping.seq_no, ack_tx, None, self.config.probe_interval);

        let packet = self.with_piggyback(protocol::encode(&Message::Ping(ping))?);
        self.transport.send_packet(addr, packet).await?;
        let sent = Instant::now();

        if let Ok(Some(v)) = tokio::time::timeout(self.config.probe_timeout, ack_rx.recv()).await
            && v.complete
        {
            return Ok(v.timestamp.duration_since(sent));
        }

        debug!(node, "failed UDP ping (timeout reached)");
        Err(anyhow::anyhow!("no response from node {node}"))
    }

    /// Reaps dead entries past the retention window, reshuffles the probe
    /// sequence and refreshes the size estimate. Runs on sequence wrap.
    pub(crate) fn reset_nodes(&self) {
        let mut members = self.members.write().unwrap();
        let retained = members.reap_and_shuffle(self.config.gossip_to_the_dead_time);
        self.num_nodes.store(retained as u32, Ordering::SeqCst);
    }

    // ---- gossip ----

    /// Sends pending broadcasts to a few random live, suspect or recently
    /// dead peers.
    pub async fn gossip(&self) {
        let k_nodes = {
            let members = self.members.read().unwrap();
            members.k_random(self.config.gossip_nodes, |n| {
                if n.name() == self.config.name {
                    return true;
                }
                match n.state {
                    NodeStateKind::Alive | NodeStateKind::Suspect => false,
                    // The recently dead still get gossip so their side of
                    // the cluster hears the verdict.
                    NodeStateKind::Dead => {
                        n.state_change.elapsed() > self.config.gossip_to_the_dead_time
                    }
                    NodeStateKind::Left => true,
                }
            })
        };

        let bytes_avail = self
            .config
            .udp_buffer_size
            .saturating_sub(COMPOUND_HEADER_OVERHEAD + self.config.encryption_overhead);

        for node in k_nodes {
            let msgs = self.broadcasts.get_broadcasts(PER_MESSAGE_OVERHEAD, bytes_avail);
            if msgs.is_empty() {
                return;
            }

            let packet = if msgs.len() == 1 {
                msgs.into_iter().next().unwrap()
            } else {
                match protocol::make_compound(msgs) {
                    Ok(buf) => buf,
                    Err(e) => {
                        error!("failed to build gossip compound: {e:#}");
                        continue;
                    }
                }
            };
            if let Err(e) = self.transport.send_packet(node.address(), packet).await {
                error!(node = node.name(), "failed to send gossip: {e:#}");
            }
        }
    }

    /// Attaches pending broadcasts to an outgoing datagram, space
    /// permitting.
    pub(crate) fn with_piggyback(&self, encoded: Vec<u8>) -> Vec<u8> {
        let avail = self
            .config
            .udp_buffer_size
            .saturating_sub(encoded.len())
            .saturating_sub(COMPOUND_HEADER_OVERHEAD + self.config.encryption_overhead);
        let extra = self.broadcasts.get_broadcasts(PER_MESSAGE_OVERHEAD, avail);
        if extra.is_empty() {
            return encoded;
        }

        let mut parts = Vec::with_capacity(1 + extra.len());
        parts.push(encoded.clone());
        parts.extend(extra);
        match protocol::make_compound(parts) {
            Ok(buf) => buf,
            Err(e) => {
                error!("failed to build compound message: {e:#}");
                encoded
            }
        }
    }

    // ---- anti-entropy ----

    /// One anti-entropy round: full state exchange with a random live peer.
    pub async fn push_pull(&self) {
        let peer = {
            let members = self.members.read().unwrap();
            members
                .k_random(1, |n| {
                    n.name() == self.config.name || n.state != NodeStateKind::Alive
                })
                .into_iter()
                .next()
        };
        let Some(peer) = peer else { return };

        if let Err(e) = self.push_pull_node(peer.address(), false).await {
            error!(node = peer.name(), "push/pull failed: {e:#}");
        }
    }

    /// Full state exchange with a specific peer, then merge.
    pub async fn push_pull_node(&self, addr: SocketAddr, join: bool) -> Result<()> {
        let local = self.local_snapshot(join);
        let remote = self.transport.exchange_state(addr, local, join).await?;
        self.merge_remote_state(remote, join)
    }

    /// Snapshot of the full local state for an exchange.
    pub fn local_snapshot(&self, join: bool) -> StateSnapshot {
        let nodes = {
            let members = self.members.read().unwrap();
            members
                .nodes
                .iter()
                .map(|n| PushNodeState {
                    name: n.node.name.clone(),
                    addr: n.node.addr,
                    port: n.node.port,
                    meta: n.node.meta.clone(),
                    incarnation: n.incarnation,
                    state: n.state,
                    vsn: n.node.version_bytes().to_vec(),
                })
                .collect()
        };
        let user_state = self
            .delegates
            .state
            .as_ref()
            .map(|d| d.local_state(join))
            .unwrap_or_default();
        StateSnapshot { nodes, user_state }
    }

    /// Verifies that every node, local and remote, speaks a protocol and
    /// delegate version inside the ranges the whole cluster understands.
    pub fn verify_protocol(&self, remote: &[PushNodeState]) -> Result<()> {
        let members = self.members.read().unwrap();

        // Maximum minimum and minimum maximum understood versions: the
        // common denominator of the whole cluster.
        let mut maxpmin: u8 = 0;
        let mut minpmax: u8 = u8::MAX;
        let mut maxdmin: u8 = 0;
        let mut mindmax: u8 = u8::MAX;

        for rn in remote {
            if rn.state != NodeStateKind::Alive || rn.vsn.len() < 6 {
                continue;
            }
            maxpmin = maxpmin.max(rn.vsn[0]);
            minpmax = minpmax.min(rn.vsn[1]);
            maxdmin = maxdmin.max(rn.vsn[3]);
            mindmax = mindmax.min(rn.vsn[4]);
        }
        for n in &members.nodes {
            if n.state != NodeStateKind::Alive {
                continue;
            }
            maxpmin = maxpmin.max(n.node.pmin);
            minpmax = minpmax.min(n.node.pmax);
            maxdmin = maxdmin.max(n.node.dmin);
            mindmax = mindmax.min(n.node.dmax);
        }

        for rn in remote {
            let (pcur, dcur) = if rn.vsn.len() >= 6 {
                (rn.vsn[2], rn.vsn[5])
            } else {
                (0, 0)
            };
            if pcur < maxpmin || pcur > minpmax {
                anyhow::bail!(
                    "node '{}' protocol version ({}) is incompatible: [{}, {}]",
                    rn.name,
                    pcur,
                    maxpmin,
                    minpmax
                );
            }
            if dcur < maxdmin || dcur > mindmax {
                anyhow::bail!(
                    "node '{}' delegate protocol version ({}) is incompatible: [{}, {}]",
                    rn.name,
                    dcur,
                    maxdmin,
                    mindmax
                );
            }
        }
        for n in &members.nodes {
            if n.node.pcur < maxpmin || n.node.pcur > minpmax {
                anyhow::bail!(
                    "node '{}' protocol version ({}) is incompatible: [{}, {}]",
                    n.node.name,
                    n.node.pcur,
                    maxpmin,
                    minpmax
                );
            }
            if n.node.dcur < maxdmin || n.node.dcur > mindmax {
                anyhow::bail!(
                    "node '{}' delegate protocol version ({}) is incompatible: [{}, {}]",
                    n.node.name,
                    n.node.dcur,
                    maxdmin,
                    mindmax
                );
            }
        }
        Ok(())
    }

    // ---- departure ----

    /// Announces our departure and waits up to `timeout` for the record to
    /// be transmitted at least once. Further alive messages about the local
    /// node are ignored after this.
    pub async fn leave(&self, timeout: Duration) -> Result<()> {
        if self.left.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let d = {
            let members = self.members.read().unwrap();
            let Some(state) = members.get(&self.config.name) else {
                warn!("leave requested but the local node is not in the member table");
                return Ok(());
            };
            if state.dead_or_left() {
                return Ok(());
            }
            Dead {
                incarnation: state.incarnation,
                node: state.name().to_string(),
                from: state.name().to_string(),
            }
        };
        self.dead_node(&d);

        let any_alive = {
            let members = self.members.read().unwrap();
            members
                .nodes
                .iter()
                .any(|n| !n.dead_or_left() && n.name() != self.config.name)
        };
        if any_alive {
            tokio::time::timeout(timeout, self.leave_broadcast.notified())
                .await
                .map_err(|_| anyhow::anyhow!("timeout waiting for leave broadcast"))?;
        }
        Ok(())
    }

    // ---- network-layer entry points ----

    /// Routes an incoming ack to the matching in-flight probe.
    pub fn invoke_ack_handler(&self, ack: AckResp, timestamp: Instant) {
        self.acks.invoke_ack_handler(ack, timestamp);
    }

    /// Routes an incoming nack to the matching in-flight probe.
    pub fn invoke_nack_handler(&self, nack: NackResp) {
        self.acks.invoke_nack_handler(nack);
    }

    /// Registers a bare ack callback, as used when relaying an indirect
    /// ping on behalf of another node.
    pub fn set_ack_handler(
        &self,
        seq_no: u32,
        ack_fn: impl Fn(Vec<u8>, Instant) + Send + Sync + 'static,
        timeout: Duration,
    ) {
        self.acks.set_ack_handler(seq_no, ack_fn, timeout);
    }
}

/// Sleeps a uniform random fraction of `interval`, or returns false if the
/// stop channel fires first.
async fn stagger(interval: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    let jitter = interval.mul_f64(rand::thread_rng().r#gen::<f64>());
    tokio::select! {
        _ = tokio::time::sleep(jitter) => true,
        _ = stop.changed() => false,
    }
}
