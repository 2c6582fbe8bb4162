//! Component E: the caller (spec §4.E). Resolves a node via the balancer,
//! issues the request through the client pool, and retries against a
//! different node on failure, up to one attempt per currently-live node.

use meshgate_core::prelude::*;
use tokio::sync::RwLock;

use crate::balancer::LoadBalancer;
use crate::config::AppConfig;
use crate::directory::Directory;
use crate::error::CallError;
use crate::metrics::{AppLabel, Metrics};
use crate::node::{AppNodeMap, NodeInfo, FAILURE_EVICTION_THRESHOLD};
use crate::pool::ClientPool;

pub struct Caller {
    pool: Arc<ClientPool>,
    balancer: Arc<dyn LoadBalancer>,
    directory: Arc<dyn Directory>,
    metrics: Metrics,
}

impl Caller {
    pub fn new(
        pool: Arc<ClientPool>,
        balancer: Arc<dyn LoadBalancer>,
        directory: Arc<dyn Directory>,
        metrics: Metrics,
    ) -> Self {
        Self {
            pool,
            balancer,
            directory,
            metrics,
        }
    }

    /// Perform `request` against `app`, retrying on a different live node
    /// for every node-level failure (transport error or 502/503/504) until
    /// either a response succeeds or every live node has been tried once.
    /// A successful response clears the winning node's failure streak; a
    /// failing one increments it and, past the eviction threshold, the node
    /// drops out of the live set for subsequent picks.
    pub async fn call(
        &self,
        app: &str,
        map: &RwLock<AppNodeMap>,
        cfg: &AppConfig,
        request: impl Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, CallError> {
        let client = self.pool.client_for(app, cfg).await?;
        let mut excluded = Vec::new();
        let live_count = map.read().await.live_nodes().len();
        if live_count == 0 {
            return Err(CallError::NoNode(app.to_string()));
        }

        for _ in 0..live_count {
            let node = {
                let guard = map.read().await;
                self.balancer.pick(&guard, &excluded)
            };
            let Some(node) = node else {
                break;
            };
            node.mark_used();

            let result = request(&client, &node.addr).send().await;
            match result {
                Ok(response) if response.status().is_success() => {
                    node.mark_success();
                    return Ok(response);
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    let is_node_failure = matches!(status, 502 | 503 | 504);
                    if is_node_failure {
                        self.note_failure(app, map, &node).await;
                        excluded.push(node.addr.clone());
                        continue;
                    }
                    node.mark_success();
                    return Ok(response);
                }
                Err(err) => {
                    self.note_failure(app, map, &node).await;
                    excluded.push(node.addr.clone());
                    debug!(app, addr = %node.addr, error = %err, "call failed, retrying another node");
                    continue;
                }
            }
        }

        Err(CallError::AllNodesFailed(app.to_string()))
    }

    /// Record a node-level failure and, once it crosses the eviction
    /// threshold, withdraw it from the directory (HDEL + `"<addr> 0"`
    /// publish, spec §4.E) and drop it from the local map so subsequent
    /// picks never see it again.
    async fn note_failure(&self, app: &str, map: &RwLock<AppNodeMap>, node: &NodeInfo) {
        let label = AppLabel {
            app: app.to_string(),
        };
        self.metrics.call_retries_total.get_or_create(&label).inc();
        if node.mark_failed() == FAILURE_EVICTION_THRESHOLD {
            self.metrics.node_evictions_total.get_or_create(&label).inc();
            if let Err(err) = self.directory.withdraw(app, &node.addr).await {
                warn!(app, addr = %node.addr, error = %err, "failed to withdraw evicted node from directory");
            }
            map.write().await.push(node.addr.clone(), None);
        }
    }
}
