// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster membership over Redis.
//!
//! Keys, all with the node TTL:
//!
//! | Key                               | Value      |
//! |-----------------------------------|------------|
//! | `<cluster>/leader`                | node id    |
//! | `<cluster>/nodes/<node_id>`       | address    |
//! | `<cluster>/kv/<node_id>/<key>`    | user value |
//!
//! A keepalive task runs every third of the TTL. It refreshes the node's
//! keys, renews leadership with a compare-and-pexpire, or tries to take the
//! leader key with `SET NX PX` when it is free. Any error or a round that
//! outlives a quarter of the TTL demotes the node.
//!
//! Leadership is a lease: the node reports [`Role::Leader`] only until one
//! TTL after the start of its last successful claim or renewal, so a stalled
//! keepalive cannot keep a node leading past the key's expiry.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ::redis::Script;
use ::redis::aio::ConnectionManager;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{ClusterConfig, ClusterError, ClusterNode, Role, WatchEvent, WatchEventKind};
use crate::lock::{COMPARE_AND_DELETE, COMPARE_AND_PEXPIRE};

const WATCH_BUFFER: usize = 64;
const SCAN_COUNT: usize = 200;

/// Local view of the leader key.
struct LeaderLease {
    ttl: Duration,
    /// End of the lease; `None` when not claimed.
    deadline: Mutex<Option<Instant>>,
}

impl LeaderLease {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            deadline: Mutex::new(None),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Instant>> {
        match self.deadline.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Whether the last round claimed or renewed the key, expired or not.
    fn claimed(&self) -> bool {
        self.slot().is_some()
    }

    fn is_held(&self) -> bool {
        self.slot().is_some_and(|deadline| Instant::now() < deadline)
    }

    /// Record a claim or renewal sent at `started`. Returns whether the
    /// lease was newly claimed.
    fn grant(&self, started: Instant) -> bool {
        self.slot().replace(started + self.ttl).is_none()
    }

    /// Returns whether a claim was dropped.
    fn revoke(&self) -> bool {
        self.slot().take().is_some()
    }
}

struct Shared {
    conn: ConnectionManager,
    config: ClusterConfig,
    node_id: i64,
    lease: LeaderLease,
    /// Node-scoped keys to refresh with the lease.
    owned: Mutex<BTreeSet<String>>,
}

impl Shared {
    fn leader_key(&self) -> String {
        format!("{}/leader", self.config.cluster_name)
    }

    fn node_key(&self) -> String {
        format!("{}/nodes/{}", self.config.cluster_name, self.node_id)
    }

    fn kv_key(&self, key: &str) -> String {
        kv_key(&self.config.cluster_name, self.node_id, key)
    }

    fn ttl_ms(&self) -> u64 {
        self.config.node_ttl.as_millis().max(1) as u64
    }

    fn owned(&self) -> Vec<String> {
        match self.owned.lock() {
            Ok(guard) => guard.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    fn grant(&self, started: Instant) {
        if self.lease.grant(started) {
            info!(node_id = self.node_id, "Acquired cluster leadership");
        }
    }

    fn demote(&self) {
        if self.lease.revoke() {
            warn!(node_id = self.node_id, "Lost cluster leadership");
        }
    }

    /// One keepalive round.
    async fn keepalive(&self, address: &str) -> Result<(), ClusterError> {
        let started = Instant::now();
        let mut conn = self.conn.clone();
        let ttl_ms = self.ttl_ms();

        let _: () = ::redis::cmd("SET")
            .arg(self.node_key())
            .arg(address)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        for key in self.owned() {
            let _: i64 = ::redis::cmd("PEXPIRE")
                .arg(&key)
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await?;
        }

        let token = self.node_id.to_string();
        if self.lease.claimed() {
            let renewed: i64 = Script::new(COMPARE_AND_PEXPIRE)
                .key(self.leader_key())
                .arg(&token)
                .arg(ttl_ms)
                .invoke_async(&mut conn)
                .await?;
            if renewed == 1 {
                self.grant(started);
            } else {
                self.demote();
            }
        } else {
            let taken: Option<String> = ::redis::cmd("SET")
                .arg(self.leader_key())
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await?;
            if taken.is_some() {
                self.grant(started);
            }
        }
        Ok(())
    }
}

fn kv_key(cluster: &str, node_id: i64, key: &str) -> String {
    format!("{}/kv/{}/{}", cluster, node_id, key)
}

/// Split `<cluster>/kv/<node_id>/<key>` into `(node_id, key)`.
fn parse_kv_key<'a>(cluster: &str, full: &'a str) -> Option<(i64, &'a str)> {
    let rest = full.strip_prefix(cluster)?.strip_prefix("/kv/")?;
    let (node, key) = rest.split_once('/')?;
    Some((node.parse().ok()?, key))
}

async fn scan(conn: &mut ConnectionManager, pattern: &str) -> Result<Vec<String>, ClusterError> {
    let mut cursor: u64 = 0;
    let mut keys = Vec::new();
    loop {
        let (next, batch): (u64, Vec<String>) = ::redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(SCAN_COUNT)
            .query_async(conn)
            .await?;
        keys.extend(batch);
        if next == 0 {
            return Ok(keys);
        }
        cursor = next;
    }
}

/// Node-scoped values of a cluster, keyed by `(node_id, key)`.
async fn snapshot(
    conn: &mut ConnectionManager,
    cluster: &str,
) -> Result<HashMap<(i64, String), String>, ClusterError> {
    let keys = scan(conn, &format!("{}/kv/*", cluster)).await?;
    if keys.is_empty() {
        return Ok(HashMap::new());
    }
    let values: Vec<Option<String>> = ::redis::cmd("MGET").arg(&keys).query_async(conn).await?;

    Ok(keys
        .iter()
        .zip(values)
        .filter_map(|(full, value)| {
            let (node_id, key) = parse_kv_key(cluster, full)?;
            Some(((node_id, key.to_string()), value?))
        })
        .collect())
}

fn diff(
    before: &HashMap<(i64, String), String>,
    after: &HashMap<(i64, String), String>,
    prefix: &str,
) -> Vec<WatchEvent> {
    let mut events = Vec::new();
    for ((node_id, key), value) in after {
        if !key.starts_with(prefix) {
            continue;
        }
        let kind = match before.get(&(*node_id, key.clone())) {
            None => WatchEventKind::Added,
            Some(old) if old != value => WatchEventKind::Modified,
            Some(_) => continue,
        };
        events.push(WatchEvent {
            kind,
            key: key.clone(),
            value: value.clone(),
            node_id: *node_id,
        });
    }
    for (node_id, key) in before.keys() {
        if key.starts_with(prefix) && !after.contains_key(&(*node_id, key.clone())) {
            events.push(WatchEvent {
                kind: WatchEventKind::Deleted,
                key: key.clone(),
                value: String::new(),
                node_id: *node_id,
            });
        }
    }
    events
}

/// [`ClusterNode`] backed by Redis keys with TTLs.
pub struct RedisClusterNode {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl RedisClusterNode {
    pub fn new(conn: ConnectionManager, node_id: i64, config: ClusterConfig) -> Self {
        let lease = LeaderLease::new(config.node_ttl);
        Self {
            shared: Arc::new(Shared {
                conn,
                config,
                node_id,
                lease,
                owned: Mutex::new(BTreeSet::new()),
            }),
            cancel: CancellationToken::new(),
            keepalive: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ClusterNode for RedisClusterNode {
    fn node_id(&self) -> i64 {
        self.shared.node_id
    }

    async fn register(&self, address: &str) -> Result<(), ClusterError> {
        let mut slot = match self.keepalive.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_some() {
            return Err(ClusterError::AlreadyRegistered(self.shared.node_id));
        }

        let shared = self.shared.clone();
        let cancel = self.cancel.clone();
        let address = address.to_string();
        let period = (shared.config.node_ttl / 3).max(Duration::from_millis(10));
        let round_timeout = (shared.config.node_ttl / 4).max(Duration::from_millis(5));

        *slot = Some(tokio::spawn(async move {
            info!(
                node_id = shared.node_id,
                cluster = %shared.config.cluster_name,
                "Cluster keepalive started"
            );
            loop {
                match tokio::time::timeout(round_timeout, shared.keepalive(&address)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(node_id = shared.node_id, error = %e, "Cluster keepalive failed, demoting");
                        shared.demote();
                    }
                    Err(_) => {
                        error!(node_id = shared.node_id, "Cluster keepalive timed out, demoting");
                        shared.demote();
                    }
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
            }
            info!(node_id = shared.node_id, "Cluster keepalive stopped");
        }));
        Ok(())
    }

    fn role(&self) -> Role {
        if self.shared.lease.is_held() {
            Role::Leader
        } else {
            Role::Follower
        }
    }

    async fn watch(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>, ClusterError> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let shared = self.shared.clone();
        let cancel = self.cancel.clone();
        let prefix = prefix.to_string();

        let mut conn = shared.conn.clone();
        let mut known = snapshot(&mut conn, &shared.config.cluster_name).await?;
        let initial = diff(&HashMap::new(), &known, &prefix);

        tokio::spawn(async move {
            for event in initial {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = tx.closed() => return,
                    _ = tokio::time::sleep(shared.config.watch_interval) => {}
                }
                let current = match snapshot(&mut conn, &shared.config.cluster_name).await {
                    Ok(current) => current,
                    Err(e) => {
                        warn!(prefix = %prefix, error = %e, "Cluster watch poll failed");
                        continue;
                    }
                };
                for event in diff(&known, &current, &prefix) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                known = current;
            }
        });

        Ok(rx)
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), ClusterError> {
        let full = self.shared.kv_key(key);
        let mut conn = self.shared.conn.clone();
        let _: () = ::redis::cmd("SET")
            .arg(&full)
            .arg(value)
            .arg("PX")
            .arg(self.shared.ttl_ms())
            .query_async(&mut conn)
            .await?;
        match self.shared.owned.lock() {
            Ok(mut owned) => owned.insert(full),
            Err(poisoned) => poisoned.into_inner().insert(full),
        };
        Ok(())
    }

    async fn get(&self, cluster: &str, key: &str) -> Result<Vec<(i64, String)>, ClusterError> {
        let mut conn = self.shared.conn.clone();
        let mut values: Vec<(i64, String)> = snapshot(&mut conn, cluster)
            .await?
            .into_iter()
            .filter(|((_, k), _)| k == key)
            .map(|((node_id, _), value)| (node_id, value))
            .collect();
        values.sort();
        Ok(values)
    }

    async fn stop(&self) -> Result<(), ClusterError> {
        self.cancel.cancel();
        let handle = match self.keepalive.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(handle) = handle else {
            return Err(ClusterError::NotRegistered(self.shared.node_id));
        };
        if let Err(e) = handle.await {
            warn!(error = %e, "Cluster keepalive task panicked");
        }

        let mut conn = self.shared.conn.clone();
        let _released: i64 = Script::new(COMPARE_AND_DELETE)
            .key(self.shared.leader_key())
            .arg(self.shared.node_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        self.shared.demote();

        let mut keys = self.shared.owned();
        keys.push(self.shared.node_key());
        let _: i64 = ::redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;

        info!(node_id = self.shared.node_id, "Cluster node stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kv_key() {
        assert_eq!(parse_kv_key("wlcp", "wlcp/kv/7/derp"), Some((7, "derp")));
        assert_eq!(parse_kv_key("wlcp", "wlcp/kv/7/a/b"), Some((7, "a/b")));
        assert_eq!(parse_kv_key("wlcp", "wlcp/kv/x/derp"), None);
        assert_eq!(parse_kv_key("wlcp", "other/kv/7/derp"), None);
        assert_eq!(kv_key("wlcp", 7, "derp"), "wlcp/kv/7/derp");
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_lapses_without_renewal() {
        let lease = LeaderLease::new(Duration::from_secs(3));
        assert!(!lease.is_held());

        assert!(lease.grant(Instant::now()));
        assert!(lease.is_held());

        // a stalled round never renews
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!lease.is_held());
        assert!(lease.claimed());

        assert!(!lease.grant(Instant::now()));
        assert!(lease.is_held());
        assert!(lease.revoke());
        assert!(!lease.revoke());
        assert!(!lease.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_counts_from_round_start() {
        let lease = LeaderLease::new(Duration::from_secs(3));
        let started = Instant::now();
        tokio::time::advance(Duration::from_secs(2)).await;
        lease.grant(started);

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(lease.is_held());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!lease.is_held());
    }

    #[test]
    fn test_diff() {
        let mut before = HashMap::new();
        before.insert((1, "derp".to_string()), "a".to_string());
        before.insert((2, "derp".to_string()), "b".to_string());
        before.insert((3, "other".to_string()), "c".to_string());

        let mut after = before.clone();
        after.insert((1, "derp".to_string()), "a2".to_string());
        after.remove(&(2, "derp".to_string()));
        after.insert((4, "derp".to_string()), "d".to_string());
        after.remove(&(3, "other".to_string()));

        let mut events = diff(&before, &after, "derp");
        events.sort_by_key(|e| e.node_id);

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, WatchEventKind::Modified);
        assert_eq!(events[1].kind, WatchEventKind::Deleted);
        assert_eq!(events[1].node_id, 2);
        assert_eq!(events[2].kind, WatchEventKind::Added);
    }
}
