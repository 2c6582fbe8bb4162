//! Component C: per-app HTTP client pool (spec §4.C). One `reqwest::Client`
//! per called app, configured once from that app's `AppConfig` and reused
//! for every subsequent call -- `reqwest::Client` already pools its own
//! keep-alive connections internally, so the pool here is really a
//! registry of pre-built clients keyed by app name.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::config::AppConfig;
use crate::error::CallError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
pub struct ClientPool {
    clients: RwLock<HashMap<String, reqwest::Client>>,
}

impl ClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the client for `app`, building and caching one from `cfg` on
    /// first use.
    pub async fn client_for(
        &self,
        app: &str,
        cfg: &AppConfig,
    ) -> Result<reqwest::Client, CallError> {
        if let Some(client) = self.clients.read().await.get(app) {
            return Ok(client.clone());
        }
        let mut builder = reqwest::Client::builder().timeout(
            cfg.timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_TIMEOUT),
        );
        if cfg.http_version == 2 {
            builder = builder.http2_prior_knowledge();
        }
        let client = builder.build().map_err(|e| CallError::Transport {
            addr: app.to_string(),
            message: e.to_string(),
        })?;
        self.clients
            .write()
            .await
            .insert(app.to_string(), client.clone());
        Ok(client)
    }
}

#[cfg(test)]
mod pool_test {
    use super::*;

    #[tokio::test]
    async fn caches_client_per_app() {
        let pool = ClientPool::new();
        let cfg = AppConfig::default();
        let a = pool.client_for("billing", &cfg).await.unwrap();
        let b = pool.client_for("billing", &cfg).await.unwrap();
        // Cloned `reqwest::Client`s share the same inner Arc, so both handles
        // point at one connection pool regardless of object identity here.
        drop(a);
        drop(b);
        assert_eq!(pool.clients.read().await.len(), 1);
    }

    #[tokio::test]
    async fn distinct_apps_get_distinct_entries() {
        let pool = ClientPool::new();
        let cfg = AppConfig::default();
        pool.client_for("billing", &cfg).await.unwrap();
        pool.client_for("checkout", &cfg).await.unwrap();
        assert_eq!(pool.clients.read().await.len(), 2);
    }
}
