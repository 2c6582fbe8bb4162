//! Component D: the discovery agent (spec §4.D). Watches one or more apps'
//! node sets in the directory and keeps a local `AppNodeMap` in sync, and
//! announces this process's own node if it is itself a service.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use meshgate_core::prelude::*;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::directory::{Directory, NodeEvent};
use crate::node::AppNodeMap;

pub struct DiscoveryAgent {
    directory: Arc<dyn Directory>,
    registries: RwLock<HashMap<AppName, Arc<RwLock<AppNodeMap>>>>,
    cancel: CancellationToken,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryAgent {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self {
            directory,
            registries: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    /// Announce this process's own node under `app` (spec §4.D register).
    pub async fn announce_self(&self, app: &str, addr: &str, weight: u32) -> Result<(), crate::error::DirectoryError> {
        self.directory.announce(app, addr, weight).await
    }

    pub async fn withdraw_self(&self, app: &str, addr: &str) -> Result<(), crate::error::DirectoryError> {
        self.directory.withdraw(app, addr).await
    }

    /// Start (idempotently) watching `app`'s node set and return the shared
    /// map the rest of the runtime reads from.
    pub async fn watch(&self, app: &str) -> Result<Arc<RwLock<AppNodeMap>>, crate::error::DirectoryError> {
        if let Some(existing) = self.registries.read().await.get(app) {
            return Ok(existing.clone());
        }
        let mut registries = self.registries.write().await;
        if let Some(existing) = registries.get(app) {
            return Ok(existing.clone());
        }
        let map = Arc::new(RwLock::new(AppNodeMap::new()));
        registries.insert(app.to_string(), map.clone());
        drop(registries);

        // Subscribe before pulling the initial snapshot: any announce that
        // lands between the two would otherwise be silently missed.
        let rx = self.directory.subscribe(app).await?;
        let snapshot = self.directory.snapshot(app).await?;
        {
            let mut guard = map.write().await;
            for (addr, weight) in snapshot {
                guard.push(addr, Some(weight));
            }
        }

        let handle = tokio::spawn(Self::sync_loop(
            self.directory.clone(),
            app.to_string(),
            map.clone(),
            rx,
            self.cancel.clone(),
        ));
        self.tasks.lock().unwrap().push(handle);
        Ok(map)
    }

    async fn sync_loop(
        directory: Arc<dyn Directory>,
        app: String,
        map: Arc<RwLock<AppNodeMap>>,
        mut rx: broadcast::Receiver<NodeEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = rx.recv() => {
                    match event {
                        Ok(event) => {
                            map.write().await.push(event.addr, event.weight);
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            warn!(app = %app, "discovery stream lagged, resyncing from snapshot");
                            if let Ok(snapshot) = directory.snapshot(&app).await {
                                let mut guard = map.write().await;
                                *guard = AppNodeMap::new();
                                for (addr, weight) in snapshot {
                                    guard.push(addr, Some(weight));
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!(app = %app, "discovery stream closed, reconnecting");
                            tokio::time::sleep(Duration::from_millis(500)).await;
                            match directory.subscribe(&app).await {
                                Ok(new_rx) => rx = new_rx,
                                Err(e) => {
                                    error!(app = %app, error = %e, "failed to resubscribe");
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Poll until `app` has at least one live node or `timeout` elapses.
    /// Returns `true` if a node appeared in time.
    pub async fn wait_discover(&self, app: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(map) = self.registries.read().await.get(app) {
                if !map.read().await.is_empty() {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
    }
}
