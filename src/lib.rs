//! Service registry, client-side load balancer, and HTTP/websocket request
//! dispatcher runtime.

pub mod auth;
pub mod balancer;
pub mod caller;
pub mod config;
pub mod directory;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod filters;
pub mod metrics;
pub mod node;
pub mod pool;
pub mod router;
pub mod ws;

use std::collections::HashMap;

use meshgate_core::prelude::*;
use prometheus_client::registry::Registry;

use auth::TokenMapAuth;
use balancer::WeightedLeastUsed;
use caller::Caller;
use config::Config;
use directory::Directory;
use discovery::DiscoveryAgent;
use dispatcher::Dispatcher;
use filters::FilterChain;
use pool::ClientPool;
use router::RouteResolver;

/// Everything wired up and ready to serve: the discovery agent keeping
/// every called app's node map fresh, and the dispatcher that serves
/// inbound HTTP/websocket traffic against them.
pub struct Runtime {
    pub config: Config,
    pub discovery: Arc<DiscoveryAgent>,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: metrics::Metrics,
    pub registry: Arc<Registry>,
}

impl Runtime {
    pub async fn build(
        config: Config,
        directory: Arc<dyn Directory>,
        routes: RouteResolver,
    ) -> Result<Self, error::DirectoryError> {
        let discovery = Arc::new(DiscoveryAgent::new(directory.clone()));

        if config.is_service() {
            discovery
                .announce_self(&config.app, &config.addr, config.weight)
                .await?;
        }

        let mut node_maps = HashMap::new();
        for app in config.calls.keys() {
            let map = discovery.watch(app).await?;
            node_maps.insert(app.clone(), map);
        }

        let mut registry = Registry::default();
        let metrics = metrics::Metrics::new(&mut registry);

        let pool = Arc::new(ClientPool::new());
        let caller = Arc::new(Caller::new(
            pool,
            Arc::new(WeightedLeastUsed),
            directory,
            metrics.clone(),
        ));
        let auth = Arc::new(TokenMapAuth::new(config.access_tokens.clone()));
        let filters = FilterChain::new();

        let dispatcher = Arc::new(Dispatcher::new(
            routes,
            auth,
            filters,
            caller,
            config.calls.clone(),
            node_maps,
            config.clone(),
            metrics.clone(),
        ));

        Ok(Self {
            config,
            discovery,
            dispatcher,
            metrics,
            registry: Arc::new(registry),
        })
    }

    pub async fn shutdown(&self) {
        if self.config.is_service() {
            let _ = self
                .discovery
                .withdraw_self(&self.config.app, &self.config.addr)
                .await;
        }
        self.dispatcher.stop();
        self.discovery.stop();
        self.dispatcher.wait().await;
        self.discovery.wait().await;
    }
}
