//! Component B: client-side load balancer (spec §4.B). Picks a live node
//! for an app given its current `AppNodeMap`.

use meshgate_core::prelude::*;

use crate::node::{AppNodeMap, NodeInfo};

pub trait LoadBalancer: Send + Sync {
    /// Choose a node among the live (non-evicted) candidates in `map`,
    /// excluding any address present in `exclude`. Returns `None` if no
    /// eligible candidate remains.
    fn pick(&self, map: &AppNodeMap, exclude: &[Addr]) -> Option<Arc<NodeInfo>>;
}

/// Default balancer: pick the live node with the lowest `used_times /
/// weight` score, ties broken by address so picks are deterministic given
/// identical state (useful for tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct WeightedLeastUsed;

impl LoadBalancer for WeightedLeastUsed {
    fn pick(&self, map: &AppNodeMap, exclude: &[Addr]) -> Option<Arc<NodeInfo>> {
        map.live_nodes()
            .into_iter()
            .filter(|n| !exclude.contains(&n.addr))
            .min_by(|a, b| {
                a.score()
                    .partial_cmp(&b.score())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.addr.cmp(&b.addr))
            })
    }
}

#[cfg(test)]
mod balancer_test {
    use super::*;

    #[test]
    fn picks_least_used_weighted() {
        let mut map = AppNodeMap::new();
        map.push("a:1".into(), Some(1));
        map.push("b:1".into(), Some(2));
        // a has used_times 4 -> score 4; b has used_times 4 -> score 2.
        for _ in 0..4 {
            map.get("a:1").unwrap().mark_used();
            map.get("b:1").unwrap().mark_used();
        }
        let picked = WeightedLeastUsed.pick(&map, &[]).unwrap();
        assert_eq!(picked.addr, "b:1");
    }

    #[test]
    fn excludes_requested_addresses() {
        let mut map = AppNodeMap::new();
        map.push("a:1".into(), Some(1));
        map.push("b:1".into(), Some(1));
        let picked = WeightedLeastUsed.pick(&map, &["a:1".to_string()]).unwrap();
        assert_eq!(picked.addr, "b:1");
    }

    #[test]
    fn no_candidates_returns_none() {
        let map = AppNodeMap::new();
        assert!(WeightedLeastUsed.pick(&map, &[]).is_none());
    }

    #[test]
    fn ties_break_on_address() {
        let mut map = AppNodeMap::new();
        map.push("b:1".into(), Some(1));
        map.push("a:1".into(), Some(1));
        let picked = WeightedLeastUsed.pick(&map, &[]).unwrap();
        assert_eq!(picked.addr, "a:1");
    }
}
