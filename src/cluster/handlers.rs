//! State-change handlers: the only mutators of node state.
//!
//! Every incoming alive/suspect/dead record funnels through here, as does
//! the merge side of anti-entropy. Each handler takes the membership write
//! lock for its whole critical section, so incarnation monotonicity and
//! the by-name/sequence consistency hold at every commit point. Event
//! delegates fire inside the critical section and are therefore serial.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::service::Cluster;
use crate::config;
use crate::membership::types::{Node, NodeState, NodeStateKind};
use crate::protocol::{self, Alive, Dead, Message, PushNodeState, StateSnapshot, Suspect};
use crate::suspicion::{Suspicion, TimeoutFn};

/// Builds the public snapshot carried by an alive record.
fn node_from_alive(a: &Alive) -> Node {
    let mut node = Node {
        name: a.node.clone(),
        addr: a.addr,
        port: a.port,
        meta: a.meta.clone(),
        pmin: 0,
        pmax: 0,
        pcur: 0,
        dmin: 0,
        dmax: 0,
        dcur: 0,
    };
    node.apply_version_bytes(&a.vsn);
    node
}

impl Cluster {
    /// Encodes a message and hands it to the broadcast queue under the
    /// node's name so newer messages supersede it.
    pub(crate) fn queue_message(&self, name: &str, msg: &Message, notify: Option<Arc<Notify>>) {
        match protocol::encode(msg) {
            Ok(buf) => self.broadcasts.queue_broadcast(name, buf, notify),
            Err(e) => error!("failed to encode broadcast: {e:#}"),
        }
    }

    /// Ingests an alive record, from gossip or a push/pull merge.
    ///
    /// `bootstrap` marks the local node's own registration at startup, which
    /// must not be treated as an accusation to refute. `notify` is signalled
    /// once the re-broadcast has been transmitted.
    pub fn alive_node(&self, a: Alive, notify: Option<Arc<Notify>>, bootstrap: bool) {
        let mut members = self.members.write().unwrap();

        // A stale alive about ourselves can still be queued while we are
        // leaving; processing it would re-join the cluster.
        if self.has_left() && a.node == self.config.name {
            return;
        }

        if a.vsn.len() >= 3 && (a.vsn[0] == 0 || a.vsn[1] == 0 || a.vsn[0] > a.vsn[1]) {
            warn!(
                node = %a.node,
                "ignoring alive message, protocol version(s) are wrong: {} <= {} <= {} should be >0",
                a.vsn[0], a.vsn[2], a.vsn[1]
            );
            return;
        }

        // The alive filter can reject peers on application logic, e.g. a
        // cluster name embedded in meta.
        if let Some(alive_delegate) = &self.delegates.alive {
            if a.vsn.len() < 6 {
                warn!(node = %a.node, "ignoring alive message, vsn is not present");
                return;
            }
            if let Err(e) = alive_delegate.notify_alive(&node_from_alive(&a)) {
                warn!(node = %a.node, "ignoring alive message: {e:#}");
                return;
            }
        }

        let mut updates_node = false;
        if !members.contains(&a.node) {
            if let Err(e) = self.config.ip_allowed(a.addr) {
                warn!(node = %a.node, addr = %a.addr, "rejected node: {e:#}");
                return;
            }

            // New nodes enter in Dead state; the transition below flips
            // them to Alive and fires the join event.
            let state = NodeState {
                node: node_from_alive(&a),
                incarnation: 0,
                state: NodeStateKind::Dead,
                state_change: Instant::now(),
            };
            members.insert(state);
            self.num_nodes
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        } else {
            let state = &members.nodes[members.index[&a.node]];
            if state.node.addr != a.addr || state.node.port != a.port {
                if let Err(e) = self.config.ip_allowed(a.addr) {
                    warn!(
                        node = %a.node, addr = %a.addr,
                        "rejected IP update for node: {e:#}"
                    );
                    return;
                }

                let can_reclaim = self.config.dead_node_reclaim_time > Duration::ZERO
                    && state.state_change.elapsed() > self.config.dead_node_reclaim_time;

                // A departed or reclaimable-dead name may be taken over by
                // a new address; a live one is a conflict.
                if state.state == NodeStateKind::Left
                    || (state.state == NodeStateKind::Dead && can_reclaim)
                {
                    info!(
                        node = %a.node,
                        "updating address for left or failed node from {}:{} to {}:{}",
                        state.node.addr, state.node.port, a.addr, a.port
                    );
                    updates_node = true;
                } else {
                    error!(
                        node = %a.node,
                        "conflicting address, mine: {}:{} theirs: {}:{} old state: {:?}",
                        state.node.addr, state.node.port, a.addr, a.port, state.state
                    );
                    if let Some(conflict) = &self.delegates.conflict {
                        conflict.notify_conflict(&state.node, &node_from_alive(&a));
                    }
                    return;
                }
            }
        }

        let idx = members.index[&a.node];
        let is_local = a.node == self.config.name;
        {
            let state = &members.nodes[idx];
            // Stale incarnations carry no news, except about ourselves
            // (where equality may still hide changed meta, handled below)
            // or when an address takeover was just approved.
            if a.incarnation <= state.incarnation && !is_local && !updates_node {
                return;
            }
            if a.incarnation < state.incarnation && is_local {
                return;
            }
        }

        // Word of the node being alive cancels any suspicion in flight.
        members.timers.remove(&a.node);

        let (old_state, old_meta) = {
            let state = &members.nodes[idx];
            (state.state, state.node.meta.clone())
        };

        if !bootstrap && is_local {
            let state = &mut members.nodes[idx];
            let versions = state.node.version_bytes();
            // Equal incarnation with identical meta and versions is a pure
            // echo. Anything else at the same incarnation means a peer
            // remembers a previous run of us, so we must out-bid it.
            if a.incarnation == state.incarnation
                && a.meta == state.node.meta
                && a.vsn == versions
            {
                return;
            }
            self.refute(state, a.incarnation);
            warn!(
                node = %a.node,
                "refuting an alive message (meta: {:?} vs {:?}, vsn: {:?} vs {:?})",
                a.meta, state.node.meta, a.vsn, versions
            );
        } else {
            self.queue_message(&a.node, &Message::Alive(a.clone()), notify);

            let state = &mut members.nodes[idx];
            state.node.apply_version_bytes(&a.vsn);
            state.incarnation = a.incarnation;
            state.node.meta = a.meta;
            state.node.addr = a.addr;
            state.node.port = a.port;
            if state.state != NodeStateKind::Alive {
                state.state = NodeStateKind::Alive;
                state.state_change = Instant::now();
            }
        }

        if let Some(event) = &self.delegates.event {
            let state = &members.nodes[idx];
            if old_state == NodeStateKind::Dead || old_state == NodeStateKind::Left {
                event.notify_join(&state.node);
            } else if old_meta != state.node.meta {
                event.notify_update(&state.node);
            }
        }
    }

    /// Ingests a suspect record. A fresh accusation arms a suspicion timer;
    /// repeated accusations from distinct peers contract it.
    pub fn suspect_node(&self, s: &Suspect) {
        let mut members = self.members.write().unwrap();
        let Some(&idx) = members.index.get(&s.node) else {
            return;
        };
        if s.incarnation < members.nodes[idx].incarnation {
            return;
        }

        // An existing timer means this may be an independent confirmation.
        // Re-gossip only if it was new information, so confirmations keep
        // flowing even for nodes already under suspicion.
        if let Some(timer) = members.timers.get_mut(&s.node) {
            if timer.confirm(&s.from) {
                self.queue_message(&s.node, &Message::Suspect(s.clone()), None);
            }
            return;
        }

        if members.nodes[idx].state != NodeStateKind::Alive {
            return;
        }

        if s.node == self.config.name {
            // Never mark ourselves suspect.
            let state = &mut members.nodes[idx];
            self.refute(state, s.incarnation);
            warn!(from = %s.from, "refuting a suspect message");
            return;
        }
        self.queue_message(&s.node, &Message::Suspect(s.clone()), None);

        let change_time = Instant::now();
        {
            let state = &mut members.nodes[idx];
            state.incarnation = s.incarnation;
            state.state = NodeStateKind::Suspect;
            state.state_change = change_time;
        }

        // We have no phase relationship with our peers, so aim the nominal
        // timeout two probe intervals short of the suspicion multiplier.
        let mut k = self.config.suspicion_mult.saturating_sub(2);
        let n = self.est_num_nodes();
        // Not enough members to possibly confirm (discounting ourselves
        // and the accused): expect none.
        if n.saturating_sub(2) < k as usize {
            k = 0;
        }

        let min = config::suspicion_timeout(self.config.suspicion_mult, n, self.config.probe_interval);
        let max = min * self.config.suspicion_max_timeout_mult;

        let cluster = self.myself.clone();
        let node_name = s.node.clone();
        let timeout_fn: TimeoutFn = Arc::new(move |num_confirmations| {
            if let Some(cluster) = cluster.upgrade() {
                cluster.handle_suspicion_timeout(&node_name, change_time, k, num_confirmations);
            }
        });
        members
            .timers
            .insert(s.node.clone(), Suspicion::new(&s.from, k, min, max, timeout_fn));
    }

    /// Fired by a suspicion timer. Declares the node dead only if it is
    /// still in the same suspect episode the timer was armed for; a
    /// concurrent alive ingest wins the race by committing first under the
    /// membership lock.
    pub(crate) fn handle_suspicion_timeout(
        &self,
        node: &str,
        change_time: Instant,
        k: u32,
        num_confirmations: u32,
    ) {
        let d = {
            let members = self.members.read().unwrap();
            members
                .get(node)
                .filter(|s| s.state == NodeStateKind::Suspect && s.state_change == change_time)
                .map(|s| Dead {
                    incarnation: s.incarnation,
                    node: s.name().to_string(),
                    from: self.config.name.clone(),
                })
        };
        let Some(d) = d else { return };

        if k > 0 && num_confirmations < k {
            debug!(node, expected = k, got = num_confirmations, "suspect timeout reached short of confirmations");
        }
        info!(
            node,
            confirmations = num_confirmations,
            "marking node as failed, suspect timeout reached"
        );
        self.dead_node(&d);
    }

    /// Ingests a dead record, either a failure verdict or a voluntary
    /// departure (`node == from`).
    pub fn dead_node(&self, d: &Dead) {
        let mut members = self.members.write().unwrap();
        let Some(&idx) = members.index.get(&d.node) else {
            return;
        };
        if d.incarnation < members.nodes[idx].incarnation {
            return;
        }

        members.timers.remove(&d.node);

        if members.nodes[idx].dead_or_left() {
            return;
        }

        if d.node == self.config.name {
            if !self.has_left() {
                // Someone thinks we are dead and we have not asked to
                // leave: out-bid the verdict.
                let state = &mut members.nodes[idx];
                self.refute(state, d.incarnation);
                warn!(from = %d.from, "refuting a dead message");
                return;
            }
            // Leaving: broadcast with a notification so leave() can await
            // the record actually going out.
            self.queue_message(
                &d.node,
                &Message::Dead(d.clone()),
                Some(self.leave_broadcast.clone()),
            );
        } else {
            self.queue_message(&d.node, &Message::Dead(d.clone()), None);
        }

        let state = &mut members.nodes[idx];
        state.incarnation = d.incarnation;
        state.state = if d.node == d.from {
            NodeStateKind::Left
        } else {
            NodeStateKind::Dead
        };
        state.state_change = Instant::now();

        if let Some(event) = &self.delegates.event {
            event.notify_leave(&state.node);
        }
    }

    /// Bumps our incarnation past an accusation and broadcasts an alive
    /// record carrying it. Must be called with the membership write lock
    /// held (it mutates the passed-in local state).
    pub(crate) fn refute(&self, me: &mut NodeState, accused_inc: u32) {
        let mut inc = self.next_incarnation();
        if accused_inc >= inc {
            inc = self.skip_incarnation(accused_inc - inc + 1);
        }
        me.incarnation = inc;

        // Being asked to refute is a sign our signals are not getting
        // through; degrade our own health estimate.
        self.awareness.apply_delta(1);

        let a = Alive {
            incarnation: inc,
            node: me.node.name.clone(),
            addr: me.node.addr,
            port: me.node.port,
            meta: me.node.meta.clone(),
            vsn: me.node.version_bytes().to_vec(),
        };
        self.queue_message(&me.node.name, &Message::Alive(a), None);
    }

    /// Applies a remote full-state snapshot: merge-delegate veto, then
    /// version check, then each record is routed through the matching
    /// handler.
    pub fn merge_remote_state(&self, remote: StateSnapshot, join: bool) -> Result<()> {
        if let Some(merge) = &self.delegates.merge {
            let peers: Vec<Node> = remote.nodes.iter().map(node_from_push).collect();
            merge.notify_merge(&peers).context("merge canceled")?;
        }

        self.verify_protocol(&remote.nodes)?;

        self.merge_state(&remote.nodes);

        if let Some(state) = &self.delegates.state
            && !remote.user_state.is_empty()
        {
            state.merge_remote_state(&remote.user_state, join);
        }
        Ok(())
    }

    /// Routes each record of a remote snapshot into the state machine.
    pub fn merge_state(&self, remote: &[PushNodeState]) {
        for r in remote {
            match r.state {
                NodeStateKind::Alive => {
                    let a = Alive {
                        incarnation: r.incarnation,
                        node: r.name.clone(),
                        addr: r.addr,
                        port: r.port,
                        meta: r.meta.clone(),
                        vsn: r.vsn.clone(),
                    };
                    self.alive_node(a, None, false);
                }
                NodeStateKind::Left => {
                    let d = Dead {
                        incarnation: r.incarnation,
                        node: r.name.clone(),
                        from: r.name.clone(),
                    };
                    self.dead_node(&d);
                }
                // A remote Dead is downgraded to a locally-authored Suspect
                // so the accused gets a chance to refute first.
                NodeStateKind::Dead | NodeStateKind::Suspect => {
                    let s = Suspect {
                        incarnation: r.incarnation,
                        node: r.name.clone(),
                        from: self.config.name.clone(),
                    };
                    self.suspect_node(&s);
                }
            }
        }
    }
}

fn node_from_push(r: &PushNodeState) -> Node {
    let mut node = Node {
        name: r.name.clone(),
        addr: r.addr,
        port: r.port,
        meta: r.meta.clone(),
        pmin: 0,
        pmax: 0,
        pcur: 0,
        dmin: 0,
        dmax: 0,
        dcur: 0,
    };
    node.apply_version_bytes(&r.vsn);
    node
}
