//! Scheduler plugin behavior across the public contract.

use std::collections::HashSet;

use netpulse::scheduler::{
    GreedyScheduler, LeastLoadRandomScheduler, LeastLoadScheduler, LoadWeightedRandomScheduler,
    NodeSnapshot, Scheduler, SchedulerRegistry,
};
use pretty_assertions::assert_eq;

fn cluster() -> Vec<NodeSnapshot> {
    vec![
        NodeSnapshot::new("node-a", 4, 3),
        NodeSnapshot::new("node-b", 4, 0),
        NodeSnapshot::new("node-c", 2, 1),
    ]
}

#[test]
fn every_builtin_returns_none_only_when_saturated() {
    let saturated = vec![
        NodeSnapshot::new("node-a", 1, 1),
        NodeSnapshot::new("node-b", 3, 3),
    ];
    let spare = cluster();

    let registry = SchedulerRegistry::with_builtins();
    for name in registry.names() {
        let scheduler = registry.get(&name).unwrap();
        assert_eq!(
            scheduler.select(&saturated, "10.0.0.9"),
            None,
            "{} must return None when every node is full",
            name
        );
        assert!(
            scheduler.select(&spare, "10.0.0.9").is_some(),
            "{} must place when capacity exists",
            name
        );
    }
}

#[test]
fn greedy_takes_first_node_with_room() {
    assert_eq!(
        GreedyScheduler.select(&cluster(), "h"),
        Some("node-a".to_string())
    );
}

#[test]
fn least_load_picks_lowest_ratio() {
    // node-b at 0/4 beats node-c at 1/2 and node-a at 3/4.
    assert_eq!(
        LeastLoadScheduler.select(&cluster(), "h"),
        Some("node-b".to_string())
    );
}

#[test]
fn least_load_breaks_exact_ties_by_id() {
    let tied = vec![
        NodeSnapshot::new("node-z", 4, 1),
        NodeSnapshot::new("node-m", 8, 2),
        NodeSnapshot::new("node-a", 16, 4),
    ];
    // All at ratio 1/4.
    assert_eq!(
        LeastLoadScheduler.select(&tied, "h"),
        Some("node-a".to_string())
    );
}

#[test]
fn least_load_random_stays_within_minimum_tier() {
    let nodes = vec![
        NodeSnapshot::new("node-a", 4, 0),
        NodeSnapshot::new("node-b", 4, 0),
        NodeSnapshot::new("node-c", 4, 3),
    ];
    let mut seen = HashSet::new();
    for _ in 0..200 {
        let pick = LeastLoadRandomScheduler.select(&nodes, "h").unwrap();
        assert_ne!(pick, "node-c", "loaded node must never win the tie tier");
        seen.insert(pick);
    }
    // Uniform choice over two tied nodes should hit both in 200 draws.
    assert_eq!(seen.len(), 2);
}

#[test]
fn weighted_random_prefers_spare_capacity() {
    let nodes = vec![
        NodeSnapshot::new("node-a", 10, 10),
        NodeSnapshot::new("node-b", 10, 0),
    ];
    for _ in 0..100 {
        assert_eq!(
            LoadWeightedRandomScheduler.select(&nodes, "h"),
            Some("node-b".to_string())
        );
    }
}

#[test]
fn batch_variant_never_exceeds_total_capacity() {
    let nodes = vec![
        NodeSnapshot::new("node-a", 2, 1),
        NodeSnapshot::new("node-b", 3, 2),
    ];
    // Total spare: 1 + 1 = 2 slots for 6 hosts.
    let hosts: Vec<String> = (1..=6).map(|i| format!("192.168.1.{}", i)).collect();

    let registry = SchedulerRegistry::with_builtins();
    for name in registry.names() {
        let scheduler = registry.get(&name).unwrap();
        let assignments = scheduler.select_batch(&nodes, &hosts);

        assert_eq!(assignments.len(), hosts.len());
        let placed: Vec<&str> = assignments
            .values()
            .flatten()
            .map(String::as_str)
            .collect();
        assert_eq!(placed.len(), 2, "{} overplaced the batch", name);
        assert!(placed.iter().filter(|n| **n == "node-a").count() <= 1);
        assert!(placed.iter().filter(|n| **n == "node-b").count() <= 1);
    }
}

#[test]
fn batch_assigns_every_host_an_entry() {
    let nodes = vec![NodeSnapshot::new("node-a", 100, 0)];
    let hosts: Vec<String> = (1..=25).map(|i| format!("10.1.0.{}", i)).collect();

    let assignments = LeastLoadScheduler.select_batch(&nodes, &hosts);
    assert_eq!(assignments.len(), 25);
    assert!(assignments.values().all(|v| v.as_deref() == Some("node-a")));
}
