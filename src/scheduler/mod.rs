//! Scheduler plugins for pinned-worker placement.
//!
//! A scheduler is a pure function: it receives a snapshot of the live nodes
//! and returns a node id (or `None` when every node is at capacity). Stale
//! snapshots are tolerated because the node worker is the authority on its
//! own capacity and rejects over-cap spawns; the dispatcher retries with a
//! refreshed snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;

use crate::error::{Error, Result};
use crate::store::NodeInfo;

/// One node's capacity snapshot handed to a scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    /// Node identity
    pub id: String,
    /// Maximum concurrent pinned workers
    pub pinned_cap: usize,
    /// Pinned workers currently alive
    pub current_pinned_count: usize,
}

impl NodeSnapshot {
    /// Creates a snapshot.
    pub fn new(id: impl Into<String>, pinned_cap: usize, current_pinned_count: usize) -> Self {
        Self {
            id: id.into(),
            pinned_cap,
            current_pinned_count,
        }
    }

    /// Remaining slots; zero when full (or when the cap is zero).
    pub fn spare(&self) -> usize {
        self.pinned_cap.saturating_sub(self.current_pinned_count)
    }

    /// Returns true while at least one slot is free.
    pub fn has_capacity(&self) -> bool {
        self.spare() > 0
    }
}

impl From<&NodeInfo> for NodeSnapshot {
    fn from(node: &NodeInfo) -> Self {
        Self {
            id: node.id.clone(),
            pinned_cap: node.capacity,
            current_pinned_count: node.current_count,
        }
    }
}

/// Compares load ratios exactly via cross-multiplication.
///
/// `count_a / cap_a < count_b / cap_b` without float rounding; a zero cap
/// sorts as fully loaded.
fn ratio_cmp(a: &NodeSnapshot, b: &NodeSnapshot) -> std::cmp::Ordering {
    match (a.pinned_cap, b.pinned_cap) {
        (0, 0) => std::cmp::Ordering::Equal,
        (0, _) => std::cmp::Ordering::Greater,
        (_, 0) => std::cmp::Ordering::Less,
        (cap_a, cap_b) => {
            let left = a.current_pinned_count as u128 * cap_b as u128;
            let right = b.current_pinned_count as u128 * cap_a as u128;
            left.cmp(&right)
        }
    }
}

/// A node-selection plugin.
pub trait Scheduler: Send + Sync + std::fmt::Debug {
    /// Unique plugin name used in configuration.
    fn name(&self) -> &str;

    /// Picks a node for one host, or `None` iff every node is at capacity.
    fn select(&self, nodes: &[NodeSnapshot], host: &str) -> Option<String>;

    /// Picks nodes for a batch of hosts, respecting capacity across the
    /// whole batch.
    ///
    /// The default implementation feeds each `select` call a snapshot that
    /// already accounts for the batch's earlier picks.
    fn select_batch(
        &self,
        nodes: &[NodeSnapshot],
        hosts: &[String],
    ) -> HashMap<String, Option<String>> {
        let mut working: Vec<NodeSnapshot> = nodes.to_vec();
        let mut assignments = HashMap::with_capacity(hosts.len());

        for host in hosts {
            let choice = self.select(&working, host);
            if let Some(node_id) = &choice {
                if let Some(node) = working.iter_mut().find(|n| &n.id == node_id) {
                    node.current_pinned_count += 1;
                }
            }
            assignments.insert(host.clone(), choice);
        }
        assignments
    }
}

/// Picks the first node with spare capacity.
#[derive(Debug, Default)]
pub struct GreedyScheduler;

impl Scheduler for GreedyScheduler {
    fn name(&self) -> &str {
        "greedy"
    }

    fn select(&self, nodes: &[NodeSnapshot], _host: &str) -> Option<String> {
        nodes
            .iter()
            .find(|n| n.has_capacity())
            .map(|n| n.id.clone())
    }
}

/// Picks the node with the lowest load ratio; ties broken by id.
#[derive(Debug, Default)]
pub struct LeastLoadScheduler;

impl Scheduler for LeastLoadScheduler {
    fn name(&self) -> &str {
        "least_load"
    }

    fn select(&self, nodes: &[NodeSnapshot], _host: &str) -> Option<String> {
        nodes
            .iter()
            .filter(|n| n.has_capacity())
            .min_by(|a, b| ratio_cmp(a, b).then_with(|| a.id.cmp(&b.id)))
            .map(|n| n.id.clone())
    }
}

/// Picks uniformly among the nodes tied at the minimum load ratio.
#[derive(Debug, Default)]
pub struct LeastLoadRandomScheduler;

impl Scheduler for LeastLoadRandomScheduler {
    fn name(&self) -> &str {
        "least_load_random"
    }

    fn select(&self, nodes: &[NodeSnapshot], _host: &str) -> Option<String> {
        let candidates: Vec<&NodeSnapshot> =
            nodes.iter().filter(|n| n.has_capacity()).collect();
        let best = candidates
            .iter()
            .min_by(|a, b| ratio_cmp(a, b))
            .copied()?;
        let tied: Vec<&NodeSnapshot> = candidates
            .into_iter()
            .filter(|n| ratio_cmp(n, best) == std::cmp::Ordering::Equal)
            .collect();
        let pick = rand::thread_rng().gen_range(0..tied.len());
        Some(tied[pick].id.clone())
    }
}

/// Picks weighted-random by spare capacity.
#[derive(Debug, Default)]
pub struct LoadWeightedRandomScheduler;

impl Scheduler for LoadWeightedRandomScheduler {
    fn name(&self) -> &str {
        "load_weighted_random"
    }

    fn select(&self, nodes: &[NodeSnapshot], _host: &str) -> Option<String> {
        let total: usize = nodes.iter().map(NodeSnapshot::spare).sum();
        if total == 0 {
            return None;
        }
        let mut remaining = rand::thread_rng().gen_range(0..total);
        for node in nodes {
            let weight = node.spare();
            if remaining < weight {
                return Some(node.id.clone());
            }
            remaining -= weight;
        }
        // Unreachable while weights sum to `total`.
        None
    }
}

/// Registry for looking up schedulers by name.
#[derive(Debug, Default)]
pub struct SchedulerRegistry {
    schedulers: HashMap<String, Arc<dyn Scheduler>>,
}

impl SchedulerRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self {
            schedulers: HashMap::new(),
        }
    }

    /// Creates a registry with all built-in schedulers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(GreedyScheduler));
        registry.register(Arc::new(LeastLoadScheduler));
        registry.register(Arc::new(LeastLoadRandomScheduler));
        registry.register(Arc::new(LoadWeightedRandomScheduler));
        registry
    }

    /// Registers a scheduler under its own name.
    pub fn register(&mut self, scheduler: Arc<dyn Scheduler>) {
        self.schedulers
            .insert(scheduler.name().to_string(), scheduler);
    }

    /// Looks up a scheduler by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Scheduler>> {
        self.schedulers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::SchedulerNotFound(name.to_string()))
    }

    /// Registered scheduler names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.schedulers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes() -> Vec<NodeSnapshot> {
        vec![
            NodeSnapshot::new("node-a", 4, 2),
            NodeSnapshot::new("node-b", 4, 1),
            NodeSnapshot::new("node-c", 8, 4),
        ]
    }

    #[test]
    fn greedy_picks_first_with_spare() {
        let scheduler = GreedyScheduler;
        assert_eq!(scheduler.select(&nodes(), "h1"), Some("node-a".to_string()));

        let full = vec![NodeSnapshot::new("node-a", 2, 2)];
        assert_eq!(scheduler.select(&full, "h1"), None);
    }

    #[test]
    fn least_load_prefers_lowest_ratio_with_id_tiebreak() {
        let scheduler = LeastLoadScheduler;
        // node-b at 1/4 beats node-a at 2/4 and node-c at 4/8.
        assert_eq!(scheduler.select(&nodes(), "h1"), Some("node-b".to_string()));

        // Exact tie (2/4 vs 4/8) resolved by id.
        let tied = vec![
            NodeSnapshot::new("node-z", 8, 4),
            NodeSnapshot::new("node-a", 4, 2),
        ];
        assert_eq!(scheduler.select(&tied, "h1"), Some("node-a".to_string()));
    }

    #[test]
    fn least_load_skips_full_nodes() {
        let scheduler = LeastLoadScheduler;
        let mixed = vec![
            NodeSnapshot::new("node-a", 2, 2),
            NodeSnapshot::new("node-b", 8, 7),
        ];
        assert_eq!(scheduler.select(&mixed, "h1"), Some("node-b".to_string()));
    }

    #[test]
    fn random_schedulers_only_pick_nodes_with_spare() {
        let mixed = vec![
            NodeSnapshot::new("node-a", 2, 2),
            NodeSnapshot::new("node-b", 2, 1),
        ];
        for _ in 0..50 {
            assert_eq!(
                LeastLoadRandomScheduler.select(&mixed, "h1"),
                Some("node-b".to_string())
            );
            assert_eq!(
                LoadWeightedRandomScheduler.select(&mixed, "h1"),
                Some("node-b".to_string())
            );
        }
    }

    #[test]
    fn random_schedulers_return_none_when_saturated() {
        let full = vec![
            NodeSnapshot::new("node-a", 1, 1),
            NodeSnapshot::new("node-b", 2, 2),
        ];
        assert_eq!(LeastLoadRandomScheduler.select(&full, "h1"), None);
        assert_eq!(LoadWeightedRandomScheduler.select(&full, "h1"), None);
    }

    #[test]
    fn batch_respects_capacity_across_the_batch() {
        // Two nodes, one slot each; ten hosts. No node may be picked twice.
        let nodes = vec![
            NodeSnapshot::new("node-a", 1, 0),
            NodeSnapshot::new("node-b", 1, 0),
        ];
        let hosts: Vec<String> = (0..10).map(|i| format!("10.0.0.{}", i)).collect();

        let registry = SchedulerRegistry::with_builtins();
        for name in registry.names() {
            let scheduler = registry.get(&name).unwrap();
            let assignments = scheduler.select_batch(&nodes, &hosts);
            let assigned: Vec<String> = assignments.values().flatten().cloned().collect();
            assert_eq!(
                assigned.len(),
                2,
                "{} assigned more hosts than total capacity",
                scheduler.name()
            );
            let a_count = assigned.iter().filter(|v| v.as_str() == "node-a").count();
            let b_count = assigned.iter().filter(|v| v.as_str() == "node-b").count();
            assert!(a_count <= 1 && b_count <= 1);
        }
    }

    #[test]
    fn zero_cap_node_is_never_selected() {
        let nodes = vec![
            NodeSnapshot::new("node-a", 0, 0),
            NodeSnapshot::new("node-b", 1, 0),
        ];
        assert_eq!(
            LeastLoadScheduler.select(&nodes, "h1"),
            Some("node-b".to_string())
        );
        assert_eq!(GreedyScheduler.select(&nodes, "h1"), Some("node-b".to_string()));
    }

    #[test]
    fn registry_holds_all_builtins() {
        let registry = SchedulerRegistry::with_builtins();
        assert_eq!(
            registry.names(),
            vec![
                "greedy",
                "least_load",
                "least_load_random",
                "load_weighted_random"
            ]
        );
        assert!(registry.get("least_load").is_ok());
        assert!(registry.get("round_robin").is_err());
    }
}
