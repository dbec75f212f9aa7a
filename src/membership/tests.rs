//! Membership Module Tests
//!
//! Validates the data model and the membership table.
//!
//! ## Test Scopes
//! - **Data Structures**: Serialization of node snapshots and version-byte handling.
//! - **Table Invariants**: By-name index and probe sequence stay consistent across
//!   inserts, swaps, reaps and shuffles.
//! - **Selection**: Random peer selection respects exclusion and distinctness.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tokio::time::Instant;

use super::table::{MemberMap, random_offset};
use super::types::{Node, NodeState, NodeStateKind};

fn node(name: &str, port: u16) -> Node {
    Node {
        name: name.into(),
        addr: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
        port,
        meta: Vec::new(),
        pmin: 1,
        pmax: 5,
        pcur: 2,
        dmin: 2,
        dmax: 5,
        dcur: 4,
    }
}

fn state(name: &str, kind: NodeStateKind) -> NodeState {
    NodeState {
        node: node(name, 7946),
        incarnation: 1,
        state: kind,
        state_change: Instant::now(),
    }
}

// ============================================================
// NODE TESTS
// ============================================================

#[test]
fn test_node_address() {
    let n = node("node-a", 7946);
    assert_eq!(n.address().to_string(), "127.0.0.1:7946");
}

#[test]
fn test_node_serialization() {
    let n = node("node-a", 7946);

    let json = serde_json::to_string(&n).expect("serialization failed");
    let restored: Node = serde_json::from_str(&json).expect("deserialization failed");
    assert_eq!(restored, n);

    let encoded = bincode::serialize(&n).expect("bincode serialization failed");
    let restored: Node = bincode::deserialize(&encoded).expect("bincode deserialization failed");
    assert_eq!(restored, n);
}

#[test]
fn test_version_bytes_roundtrip() {
    let mut n = node("node-a", 7946);
    assert_eq!(n.version_bytes(), [1, 5, 2, 2, 5, 4]);

    n.apply_version_bytes(&[2, 6, 3, 3, 6, 5]);
    assert_eq!(n.version_bytes(), [2, 6, 3, 3, 6, 5]);

    // Short vectors are ignored.
    n.apply_version_bytes(&[9, 9, 9]);
    assert_eq!(n.version_bytes(), [2, 6, 3, 3, 6, 5]);
}

#[test]
fn test_dead_or_left() {
    assert!(!state("a", NodeStateKind::Alive).dead_or_left());
    assert!(!state("a", NodeStateKind::Suspect).dead_or_left());
    assert!(state("a", NodeStateKind::Dead).dead_or_left());
    assert!(state("a", NodeStateKind::Left).dead_or_left());
}

// ============================================================
// TABLE INVARIANT TESTS
// ============================================================

#[test]
fn test_random_offset_bounds() {
    assert_eq!(random_offset(0), 0);
    for _ in 0..100 {
        assert!(random_offset(5) < 5);
    }
}

#[test]
fn test_insert_keeps_views_consistent() {
    let mut table = MemberMap::new();
    for i in 0..50 {
        table.insert(state(&format!("node-{i}"), NodeStateKind::Alive));
        table.check_consistency();
    }
    assert_eq!(table.len(), 50);
    assert!(table.contains("node-17"));
    assert_eq!(table.get("node-17").unwrap().name(), "node-17");
    assert!(table.get("node-50").is_none());
}

#[test]
fn test_insert_places_entries_at_random_offsets() {
    // With 40 sequential inserts, an append-only table would keep node-0
    // at position 0. The random splice makes that wildly unlikely across
    // several runs.
    let mut displaced = false;
    for _ in 0..10 {
        let mut table = MemberMap::new();
        for i in 0..40 {
            table.insert(state(&format!("node-{i}"), NodeStateKind::Alive));
        }
        if table.at(0).unwrap().name() != "node-0" {
            displaced = true;
            break;
        }
    }
    assert!(displaced, "inserts never displaced the first entry");
}

#[tokio::test(start_paused = true)]
async fn test_reap_respects_gossip_to_the_dead_time() {
    let mut table = MemberMap::new();
    table.insert(state("old-dead", NodeStateKind::Dead));
    table.insert(state("old-left", NodeStateKind::Left));

    tokio::time::advance(Duration::from_secs(60)).await;
    table.insert(state("alive", NodeStateKind::Alive));
    table.insert(state("fresh-dead", NodeStateKind::Dead));

    let retained = table.reap_and_shuffle(Duration::from_secs(30));
    table.check_consistency();

    assert_eq!(retained, 2);
    assert!(table.contains("alive"));
    assert!(table.contains("fresh-dead"), "recently dead still gossiped to");
    assert!(!table.contains("old-dead"));
    assert!(!table.contains("old-left"));
}

#[test]
fn test_shuffle_preserves_membership() {
    let mut table = MemberMap::new();
    for i in 0..20 {
        table.insert(state(&format!("node-{i}"), NodeStateKind::Alive));
    }
    let retained = table.reap_and_shuffle(Duration::from_secs(30));
    table.check_consistency();

    assert_eq!(retained, 20);
    for i in 0..20 {
        assert!(table.contains(&format!("node-{i}")));
    }
}

// ============================================================
// SELECTION TESTS
// ============================================================

#[test]
fn test_k_random_excludes_and_dedupes() {
    let mut table = MemberMap::new();
    table.insert(state("self", NodeStateKind::Alive));
    table.insert(state("dead", NodeStateKind::Dead));
    for i in 0..5 {
        table.insert(state(&format!("node-{i}"), NodeStateKind::Alive));
    }

    for _ in 0..20 {
        let picked = table.k_random(3, |n| n.name() == "self" || n.dead_or_left());
        assert_eq!(picked.len(), 3);
        let mut names: Vec<_> = picked.iter().map(|n| n.name().to_string()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 3, "selection must be distinct");
        assert!(!names.iter().any(|n| n == "self" || n == "dead"));
    }
}

#[test]
fn test_k_random_returns_fewer_when_starved() {
    let mut table = MemberMap::new();
    table.insert(state("self", NodeStateKind::Alive));
    table.insert(state("node-0", NodeStateKind::Alive));

    let picked = table.k_random(3, |n| n.name() == "self");
    assert_eq!(picked.len(), 1);
    assert_eq!(picked[0].name(), "node-0");
}

#[test]
fn test_k_random_empty_table() {
    let table = MemberMap::new();
    assert!(table.k_random(3, |_| false).is_empty());
}
