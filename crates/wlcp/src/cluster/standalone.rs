// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Single-node cluster: always the leader.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

use super::{ClusterError, ClusterNode, Role, WatchEvent, WatchEventKind};

const WATCH_BUFFER: usize = 64;

/// A cluster of one. `role()` is always [`Role::Leader`] and the key-value
/// space lives in process memory.
pub struct StandaloneNode {
    node_id: i64,
    cluster_name: String,
    registered: AtomicBool,
    kv: Mutex<BTreeMap<String, String>>,
    events: broadcast::Sender<WatchEvent>,
}

impl StandaloneNode {
    pub fn new(node_id: i64, cluster_name: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            node_id,
            cluster_name: cluster_name.into(),
            registered: AtomicBool::new(false),
            kv: Mutex::new(BTreeMap::new()),
            events,
        }
    }

    fn kv(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        match self.kv.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl ClusterNode for StandaloneNode {
    fn node_id(&self) -> i64 {
        self.node_id
    }

    async fn register(&self, address: &str) -> Result<(), ClusterError> {
        if self.registered.swap(true, Ordering::SeqCst) {
            return Err(ClusterError::AlreadyRegistered(self.node_id));
        }
        info!(node_id = self.node_id, address = %address, "Standalone node registered as leader");
        Ok(())
    }

    fn role(&self) -> Role {
        Role::Leader
    }

    async fn watch(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>, ClusterError> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let mut changes = self.events.subscribe();

        let existing: Vec<WatchEvent> = self
            .kv()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| WatchEvent {
                kind: WatchEventKind::Added,
                key: key.clone(),
                value: value.clone(),
                node_id: self.node_id,
            })
            .collect();

        let prefix = prefix.to_string();
        tokio::spawn(async move {
            for event in existing {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            loop {
                match changes.recv().await {
                    Ok(event) if event.key.starts_with(&prefix) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(rx)
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), ClusterError> {
        let previous = self.kv().insert(key.to_string(), value.to_string());
        let kind = match previous {
            None => WatchEventKind::Added,
            Some(old) if old == value => return Ok(()),
            Some(_) => WatchEventKind::Modified,
        };
        // no receivers is fine
        let _ = self.events.send(WatchEvent {
            kind,
            key: key.to_string(),
            value: value.to_string(),
            node_id: self.node_id,
        });
        Ok(())
    }

    async fn get(&self, cluster: &str, key: &str) -> Result<Vec<(i64, String)>, ClusterError> {
        if cluster != self.cluster_name {
            return Ok(Vec::new());
        }
        Ok(self
            .kv()
            .get(key)
            .map(|value| vec![(self.node_id, value.clone())])
            .unwrap_or_default())
    }

    async fn stop(&self) -> Result<(), ClusterError> {
        let removed = std::mem::take(&mut *self.kv());
        for key in removed.into_keys() {
            let _ = self.events.send(WatchEvent {
                kind: WatchEventKind::Deleted,
                key,
                value: String::new(),
                node_id: self.node_id,
            });
        }
        self.registered.store(false, Ordering::SeqCst);
        info!(node_id = self.node_id, "Standalone node stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_always_leader() {
        let node = StandaloneNode::new(1, "wlcp");
        assert_eq!(node.role(), Role::Leader);
        node.register("10.0.0.1").await.unwrap();
        assert_eq!(node.role(), Role::Leader);
        assert!(matches!(
            node.register("10.0.0.1").await,
            Err(ClusterError::AlreadyRegistered(1))
        ));
    }

    #[tokio::test]
    async fn test_put_get() {
        let node = StandaloneNode::new(4, "wlcp");
        node.put("derp", "10.0.0.4:3478").await.unwrap();
        assert_eq!(
            node.get("wlcp", "derp").await.unwrap(),
            vec![(4, "10.0.0.4:3478".to_string())]
        );
        assert!(node.get("other", "derp").await.unwrap().is_empty());
        assert!(node.get("wlcp", "missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_watch_reports_existing_then_changes() {
        let node = StandaloneNode::new(2, "wlcp");
        node.put("derp", "a").await.unwrap();
        node.put("other", "x").await.unwrap();

        let mut events = node.watch("derp").await.unwrap();
        let first = events.recv().await.unwrap();
        assert_eq!(first.kind, WatchEventKind::Added);
        assert_eq!(first.value, "a");

        node.put("other", "y").await.unwrap();
        node.put("derp", "b").await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.kind, WatchEventKind::Modified);
        assert_eq!(second.value, "b");
        assert_eq!(second.node_id, 2);

        node.stop().await.unwrap();
        let third = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(third.kind, WatchEventKind::Deleted);
        assert_eq!(third.key, "derp");
    }
}
