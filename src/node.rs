//! Node bookkeeping: per-replica liveness state and the per-app node map
//! (spec §3 `NodeInfo` / `AppNodeMap`, §4.D push semantics).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use meshgate_core::prelude::*;

/// Consecutive upstream failures before a node is evicted from the candidate
/// set (spec §4.E). Reset to zero on any successful call.
pub const FAILURE_EVICTION_THRESHOLD: u32 = 3;

/// One advertised replica of an app. `used_times` and `failed_times` are
/// atomics rather than behind the outer `RwLock` because the balancer and
/// caller mutate them on the hot path without wanting a write lock on the
/// whole node map.
#[derive(Debug)]
pub struct NodeInfo {
    pub addr: Addr,
    pub weight: u32,
    used_times: AtomicU64,
    failed_times: AtomicU32,
}

impl NodeInfo {
    pub fn new(addr: Addr, weight: u32) -> Self {
        Self {
            addr,
            weight: weight.max(1),
            used_times: AtomicU64::new(0),
            failed_times: AtomicU32::new(0),
        }
    }

    pub fn used_times(&self) -> u64 {
        self.used_times.load(Ordering::Relaxed)
    }

    pub fn failed_times(&self) -> u32 {
        self.failed_times.load(Ordering::Relaxed)
    }

    /// Score used by the weighted-least-used balancer: lower is preferred.
    pub fn score(&self) -> f64 {
        self.used_times() as f64 / self.weight as f64
    }

    pub fn mark_used(&self) {
        self.used_times.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_failed(&self) -> u32 {
        self.failed_times.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn mark_success(&self) {
        self.failed_times.store(0, Ordering::Relaxed);
    }

    pub fn is_evicted(&self) -> bool {
        self.failed_times() >= FAILURE_EVICTION_THRESHOLD
    }

    fn seed_used_times(&self, value: u64) {
        self.used_times.store(value, Ordering::Relaxed);
    }
}

/// Live replica set for a single app. Guarded by the registry's single
/// `tokio::sync::RwLock` rather than an atomic-pointer swap: readers (the
/// balancer, on every call) take a read lock, and the single discovery
/// syncer task is the only writer, so contention is low and a reader can
/// never observe a half-applied `push`.
#[derive(Debug, Default)]
pub struct AppNodeMap {
    nodes: HashMap<Addr, Arc<NodeInfo>>,
}

impl AppNodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn get(&self, addr: &str) -> Option<Arc<NodeInfo>> {
        self.nodes.get(addr).cloned()
    }

    pub fn live_nodes(&self) -> Vec<Arc<NodeInfo>> {
        self.nodes
            .values()
            .filter(|n| !n.is_evicted())
            .cloned()
            .collect()
    }

    pub fn all_nodes(&self) -> Vec<Arc<NodeInfo>> {
        self.nodes.values().cloned().collect()
    }

    /// Insert, update, or remove a node (spec §4.D). A late-joining node is
    /// seeded with `avg(peer score) * new_weight` so its own score lands at
    /// the set's average instead of winning every subsequent pick by virtue
    /// of starting at zero. Updating an existing node's weight rescales its
    /// `used_times` proportionally so `score()` is continuous across the
    /// reweight.
    pub fn push(&mut self, addr: Addr, weight: Option<u32>) {
        match weight {
            None => {
                self.nodes.remove(&addr);
            }
            Some(weight) => {
                if let Some(existing) = self.nodes.get(&addr) {
                    if existing.weight != weight.max(1) {
                        let ratio = weight.max(1) as f64 / existing.weight as f64;
                        let rescaled = (existing.used_times() as f64 * ratio).round() as u64;
                        let node = NodeInfo::new(addr.clone(), weight);
                        node.seed_used_times(rescaled);
                        self.nodes.insert(addr, Arc::new(node));
                    }
                } else {
                    let fair_start = (self.average_score() * weight.max(1) as f64).round() as u64;
                    let node = NodeInfo::new(addr.clone(), weight);
                    node.seed_used_times(fair_start);
                    self.nodes.insert(addr, Arc::new(node));
                }
            }
        }
    }

    fn average_score(&self) -> f64 {
        if self.nodes.is_empty() {
            return 0.0;
        }
        let total: f64 = self.nodes.values().map(|n| n.score()).sum();
        total / self.nodes.len() as f64
    }
}

#[cfg(test)]
mod node_test {
    use super::*;

    #[test]
    fn evicts_after_threshold_consecutive_failures() {
        let node = NodeInfo::new("10.0.0.1:9000".into(), 1);
        assert!(!node.is_evicted());
        for _ in 0..FAILURE_EVICTION_THRESHOLD {
            node.mark_failed();
        }
        assert!(node.is_evicted());
    }

    #[test]
    fn success_resets_failure_streak() {
        let node = NodeInfo::new("10.0.0.1:9000".into(), 1);
        node.mark_failed();
        node.mark_failed();
        node.mark_success();
        assert_eq!(node.failed_times(), 0);
        assert!(!node.is_evicted());
    }

    #[test]
    fn late_joiner_gets_fair_initial_used_times() {
        let mut map = AppNodeMap::new();
        map.push("a:1".into(), Some(1));
        map.push("b:1".into(), Some(1));
        map.get("a:1").unwrap().mark_used();
        map.get("a:1").unwrap().mark_used();
        map.get("b:1").unwrap().mark_used();
        map.get("b:1").unwrap().mark_used();
        // average score is 2/1 = 2; a late joiner of weight 1 should start
        // at used_times 2, not 0.
        map.push("c:1".into(), Some(1));
        assert_eq!(map.get("c:1").unwrap().used_times(), 2);
    }

    #[test]
    fn late_joiner_seed_accounts_for_its_own_weight() {
        let mut map = AppNodeMap::new();
        map.push("a:2".into(), Some(2));
        for _ in 0..100 {
            map.get("a:2").unwrap().mark_used();
        }
        map.push("b:1".into(), Some(1));
        for _ in 0..50 {
            map.get("b:1").unwrap().mark_used();
        }
        // a.score() = 100/2 = 50, b.score() = 50/1 = 50, average = 50.
        // a late joiner of weight 4 should seed used_times = 50 * 4 = 200,
        // landing its score at 50 too, inside [50, 50].
        map.push("c:4".into(), Some(4));
        let c = map.get("c:4").unwrap();
        assert_eq!(c.used_times(), 200);
        assert_eq!(c.score(), 50.0);
    }

    #[test]
    fn reweight_rescales_used_times_proportionally() {
        let mut map = AppNodeMap::new();
        map.push("a:1".into(), Some(1));
        for _ in 0..10 {
            map.get("a:1").unwrap().mark_used();
        }
        map.push("a:1".into(), Some(2));
        assert_eq!(map.get("a:1").unwrap().used_times(), 5);
    }

    #[test]
    fn push_none_removes_node() {
        let mut map = AppNodeMap::new();
        map.push("a:1".into(), Some(1));
        assert_eq!(map.len(), 1);
        map.push("a:1".into(), None);
        assert!(map.is_empty());
    }

    #[test]
    fn live_nodes_excludes_evicted() {
        let mut map = AppNodeMap::new();
        map.push("a:1".into(), Some(1));
        map.push("b:1".into(), Some(1));
        for _ in 0..FAILURE_EVICTION_THRESHOLD {
            map.get("a:1").unwrap().mark_failed();
        }
        let live = map.live_nodes();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].addr, "b:1");
    }
}
