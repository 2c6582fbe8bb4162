//! Component A: the directory client, a thin abstraction over a KV store
//! with pub/sub (spec §4.A). HSET/HDEL advertise a node, HGETALL pulls the
//! full current state, PUBLISH/SUBSCRIBE fan out change notifications.
//!
//! Two implementations: [`RedisDirectory`] (feature `redis`, default on)
//! talks to a real Redis-compatible server; [`MemoryDirectory`] is an
//! in-process test double used by the rest of the crate's test suite so
//! tests don't need a live Redis instance.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use meshgate_core::prelude::*;
use tokio::sync::broadcast;

use crate::error::DirectoryError;

/// A change notification delivered to subscribers of an app's channel.
/// `weight: None` means the node was removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEvent {
    pub addr: Addr,
    pub weight: Option<u32>,
}

#[async_trait]
pub trait Directory: Send + Sync {
    /// HSET: advertise or update this node's weight under `app`.
    async fn announce(&self, app: &str, addr: &str, weight: u32) -> Result<(), DirectoryError>;
    /// HDEL: withdraw this node from `app`.
    async fn withdraw(&self, app: &str, addr: &str) -> Result<(), DirectoryError>;
    /// HGETALL: the full current node set for `app`.
    async fn snapshot(&self, app: &str) -> Result<HashMap<Addr, u32>, DirectoryError>;
    /// SUBSCRIBE: a stream of change notifications for `app`. Establishing
    /// the subscription must complete before the caller takes its initial
    /// `snapshot`, or an update between snapshot and subscribe would be
    /// lost (spec §4.D ordering guarantee) -- callers are responsible for
    /// calling `subscribe` first.
    async fn subscribe(&self, app: &str) -> Result<broadcast::Receiver<NodeEvent>, DirectoryError>;
}

/// In-memory directory backed by a mutex-guarded map and a per-app
/// broadcast channel. Mirrors the Redis implementation's externally visible
/// behavior exactly, so tests written against it exercise the real
/// discovery/dispatch logic.
#[derive(Default)]
pub struct MemoryDirectory {
    state: Mutex<HashMap<String, HashMap<Addr, u32>>>,
    channels: Mutex<HashMap<String, broadcast::Sender<NodeEvent>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, app: &str) -> broadcast::Sender<NodeEvent> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(app.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn announce(&self, app: &str, addr: &str, weight: u32) -> Result<(), DirectoryError> {
        self.state
            .lock()
            .unwrap()
            .entry(app.to_string())
            .or_default()
            .insert(addr.to_string(), weight);
        let _ = self.channel(app).send(NodeEvent {
            addr: addr.to_string(),
            weight: Some(weight),
        });
        Ok(())
    }

    async fn withdraw(&self, app: &str, addr: &str) -> Result<(), DirectoryError> {
        if let Some(nodes) = self.state.lock().unwrap().get_mut(app) {
            nodes.remove(addr);
        }
        let _ = self.channel(app).send(NodeEvent {
            addr: addr.to_string(),
            weight: None,
        });
        Ok(())
    }

    async fn snapshot(&self, app: &str) -> Result<HashMap<Addr, u32>, DirectoryError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .get(app)
            .cloned()
            .unwrap_or_default())
    }

    async fn subscribe(&self, app: &str) -> Result<broadcast::Receiver<NodeEvent>, DirectoryError> {
        Ok(self.channel(app).subscribe())
    }
}

#[cfg(feature = "redis")]
pub mod redis_directory {
    use super::*;
    use redis::AsyncCommands;

    /// Wraps a `redis::Client` behind a `ConnectionManager`, which
    /// transparently reconnects on transport errors, matching the
    /// "reconnect with backoff" behavior the discovery syncer expects from
    /// its directory.
    pub struct RedisDirectory {
        manager: redis::aio::ConnectionManager,
        client: redis::Client,
        prefix: String,
    }

    impl RedisDirectory {
        pub async fn connect(url: &str, prefix: &str) -> Result<Self, DirectoryError> {
            let client =
                redis::Client::open(url).map_err(|e| DirectoryError::Transport(e.to_string()))?;
            let manager = client
                .get_connection_manager()
                .await
                .map_err(|e| DirectoryError::Transport(e.to_string()))?;
            Ok(Self {
                manager,
                client,
                prefix: prefix.to_string(),
            })
        }

        fn key(&self, app: &str) -> String {
            format!("{}{}", self.prefix, app)
        }

        fn channel(&self, app: &str) -> String {
            format!("{}CH_{}", self.prefix, app)
        }
    }

    #[async_trait]
    impl Directory for RedisDirectory {
        async fn announce(
            &self,
            app: &str,
            addr: &str,
            weight: u32,
        ) -> Result<(), DirectoryError> {
            let mut conn = self.manager.clone();
            let key = self.key(app);
            conn.hset::<_, _, _, ()>(&key, addr, weight)
                .await
                .map_err(|e| DirectoryError::Transport(e.to_string()))?;
            let payload = format!("{addr} {weight}");
            conn.publish::<_, _, ()>(self.channel(app), payload)
                .await
                .map_err(|e| DirectoryError::Transport(e.to_string()))?;
            Ok(())
        }

        async fn withdraw(&self, app: &str, addr: &str) -> Result<(), DirectoryError> {
            let mut conn = self.manager.clone();
            let key = self.key(app);
            conn.hdel::<_, _, ()>(&key, addr)
                .await
                .map_err(|e| DirectoryError::Transport(e.to_string()))?;
            let payload = format!("{addr} 0");
            conn.publish::<_, _, ()>(self.channel(app), payload)
                .await
                .map_err(|e| DirectoryError::Transport(e.to_string()))?;
            Ok(())
        }

        async fn snapshot(&self, app: &str) -> Result<HashMap<Addr, u32>, DirectoryError> {
            let mut conn = self.manager.clone();
            let key = self.key(app);
            let raw: HashMap<String, u32> = conn
                .hgetall(&key)
                .await
                .map_err(|e| DirectoryError::Transport(e.to_string()))?;
            Ok(raw)
        }

        async fn subscribe(
            &self,
            app: &str,
        ) -> Result<broadcast::Receiver<NodeEvent>, DirectoryError> {
            let (tx, rx) = broadcast::channel(256);
            let channel = self.channel(app);
            let client = self.client.clone();
            tokio::spawn(async move {
                loop {
                    match client.get_async_pubsub().await {
                        Ok(mut pubsub) => {
                            if pubsub.subscribe(&channel).await.is_err() {
                                tokio::time::sleep(Duration::from_millis(500)).await;
                                continue;
                            }
                            let mut stream = pubsub.on_message();
                            use futures::StreamExt;
                            while let Some(msg) = stream.next().await {
                                let payload: String = match msg.get_payload() {
                                    Ok(p) => p,
                                    Err(_) => continue,
                                };
                                if let Some(event) = parse_payload(&payload) {
                                    if tx.send(event).is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                        Err(_) => {
                            tokio::time::sleep(Duration::from_millis(500)).await;
                        }
                    }
                }
            });
            Ok(rx)
        }
    }

    /// Parses the wire grammar `"<addr> <weight>"` (spec §4.A/§6): a single
    /// ASCII space separates the two fields, and `weight == 0` means the
    /// node was removed.
    fn parse_payload(payload: &str) -> Option<NodeEvent> {
        let (addr, weight) = payload.split_once(' ')?;
        let weight: u32 = weight.parse().ok()?;
        Some(NodeEvent {
            addr: addr.to_string(),
            weight: if weight == 0 { None } else { Some(weight) },
        })
    }

    #[cfg(test)]
    mod payload_test {
        use super::*;

        #[test]
        fn parses_announce_payload() {
            let event = parse_payload("10.0.0.1:9000 2").unwrap();
            assert_eq!(event.addr, "10.0.0.1:9000");
            assert_eq!(event.weight, Some(2));
        }

        #[test]
        fn zero_weight_means_removal() {
            let event = parse_payload("10.0.0.1:9000 0").unwrap();
            assert_eq!(event.weight, None);
        }

        #[test]
        fn malformed_payload_is_rejected() {
            assert!(parse_payload("not-a-payload").is_none());
        }
    }
}

#[cfg(feature = "redis")]
pub use redis_directory::RedisDirectory;

#[cfg(test)]
mod directory_test {
    use super::*;

    #[tokio::test]
    async fn announce_then_snapshot_roundtrips() {
        let dir = MemoryDirectory::new();
        dir.announce("billing", "10.0.0.1:9000", 2).await.unwrap();
        let snap = dir.snapshot("billing").await.unwrap();
        assert_eq!(snap.get("10.0.0.1:9000"), Some(&2));
    }

    #[tokio::test]
    async fn withdraw_removes_from_snapshot() {
        let dir = MemoryDirectory::new();
        dir.announce("billing", "10.0.0.1:9000", 2).await.unwrap();
        dir.withdraw("billing", "10.0.0.1:9000").await.unwrap();
        let snap = dir.snapshot("billing").await.unwrap();
        assert!(snap.is_empty());
    }

    #[tokio::test]
    async fn subscribers_see_announce_and_withdraw_events() {
        let dir = MemoryDirectory::new();
        let mut rx = dir.subscribe("billing").await.unwrap();
        dir.announce("billing", "10.0.0.1:9000", 3).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.weight, Some(3));
        dir.withdraw("billing", "10.0.0.1:9000").await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.weight, None);
    }

    #[tokio::test]
    async fn subscribe_before_snapshot_misses_nothing() {
        let dir = MemoryDirectory::new();
        dir.announce("billing", "a:1", 1).await.unwrap();
        // Subscribing after the first node already exists: the subscriber
        // only sees events from here on, so callers must snapshot after
        // subscribing to avoid a lost-update window.
        let mut rx = dir.subscribe("billing").await.unwrap();
        let snap = dir.snapshot("billing").await.unwrap();
        assert_eq!(snap.len(), 1);
        dir.announce("billing", "b:1", 1).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.addr, "b:1");
    }
}
