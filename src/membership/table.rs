//! The membership table: every peer this node knows about.
//!
//! Two views over the same entries are kept in lockstep: a by-name index
//! for message ingest and an ordered sequence that determines probe order.
//! The sequence is permuted randomly (new entries splice in at a random
//! offset, wraps reshuffle) so the worst-case time between probes of any
//! live peer stays bounded. Suspicion timers live in a side map keyed by
//! node name; the whole aggregate is guarded by one lock so the views can
//! never diverge.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use rand::seq::SliceRandom;

use super::types::NodeState;
use crate::suspicion::Suspicion;

/// Random index in `[0, n)`, or 0 for an empty sequence.
pub(crate) fn random_offset(n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..n)
}

pub(crate) struct MemberMap {
    /// Probe order. Permutation is randomized.
    pub(crate) nodes: Vec<NodeState>,
    /// Name -> position in `nodes`. Updated together with every splice,
    /// swap, shuffle and reap.
    pub(crate) index: HashMap<String, usize>,
    /// Active suspicion timers, one per currently-suspect peer. Dropping an
    /// entry cancels its timer.
    pub(crate) timers: HashMap<String, Suspicion>,
}

impl MemberMap {
    pub(crate) fn new() -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            timers: HashMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub(crate) fn get(&self, name: &str) -> Option<&NodeState> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub(crate) fn at(&self, i: usize) -> Option<&NodeState> {
        self.nodes.get(i)
    }

    /// Inserts a new entry at a random position in the probe sequence:
    /// append, then swap with the element at a random offset. Appending
    /// unconditionally would let a fresh node wait a full wrap before its
    /// first probe.
    pub(crate) fn insert(&mut self, state: NodeState) {
        debug_assert!(!self.contains(state.name()));
        let n = self.nodes.len();
        let offset = random_offset(n);

        let name = state.name().to_string();
        self.nodes.push(state);
        self.index.insert(name, n);
        self.swap(offset, n);
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.nodes.swap(a, b);
        *self.index.get_mut(&self.nodes[a].node.name).unwrap() = a;
        *self.index.get_mut(&self.nodes[b].node.name).unwrap() = b;
    }

    /// Reaps entries that have been Dead or Left for longer than
    /// `gossip_to_the_dead_time`, reshuffles the survivors and returns how
    /// many entries remain. Called when the probe index wraps.
    pub(crate) fn reap_and_shuffle(&mut self, gossip_to_the_dead_time: Duration) -> usize {
        // Partition: move expired dead entries to the tail.
        let n = self.nodes.len();
        let mut num_dead = 0;
        let mut i = 0;
        while i < n - num_dead {
            let node = &self.nodes[i];
            if node.dead_or_left() && node.state_change.elapsed() > gossip_to_the_dead_time {
                self.nodes.swap(i, n - num_dead - 1);
                num_dead += 1;
            } else {
                i += 1;
            }
        }

        for reaped in self.nodes.drain(n - num_dead..) {
            self.index.remove(&reaped.node.name);
            self.timers.remove(&reaped.node.name);
        }

        self.nodes.shuffle(&mut rand::thread_rng());
        self.rebuild_index();
        self.nodes.len()
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (i, node) in self.nodes.iter().enumerate() {
            self.index.insert(node.node.name.clone(), i);
        }
    }

    /// Selects up to `k` distinct random entries, skipping any for which
    /// `exclude` returns true. Attempts are bounded so a mostly-excluded
    /// sequence cannot spin forever.
    pub(crate) fn k_random(
        &self,
        k: usize,
        exclude: impl Fn(&NodeState) -> bool,
    ) -> Vec<NodeState> {
        let n = self.nodes.len();
        let mut picked: Vec<NodeState> = Vec::with_capacity(k);

        'outer: for _ in 0..3 * n {
            if picked.len() >= k {
                break;
            }
            let node = &self.nodes[random_offset(n)];
            if exclude(node) {
                continue;
            }
            for already in &picked {
                if already.node.name == node.node.name {
                    continue 'outer;
                }
            }
            picked.push(node.clone());
        }
        picked
    }

    /// Checks that both views reference the same entries. Debug builds only.
    #[cfg(test)]
    pub(crate) fn check_consistency(&self) {
        assert_eq!(self.index.len(), self.nodes.len());
        for (name, &i) in &self.index {
            assert_eq!(&self.nodes[i].node.name, name);
        }
    }
}
