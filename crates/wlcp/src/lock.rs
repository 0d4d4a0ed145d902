// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Distributed lock over the cache tier.
//!
//! A lock is a key holding a random token with a TTL. The holder's guard
//! extends the TTL every half of it while alive; releasing (explicitly or by
//! dropping the guard) stops the renewer and deletes the key only if it
//! still holds the guard's token, so a lock that expired and was taken by
//! someone else is never released by the old holder.

use std::time::Duration;

use ::redis::Script;
use ::redis::aio::ConnectionManager;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Extend the TTL of `KEYS[1]` to `ARGV[2]` ms if it holds `ARGV[1]`.
pub(crate) const COMPARE_AND_PEXPIRE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Delete `KEYS[1]` if it holds `ARGV[1]`.
pub(crate) const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(8);

/// Lock errors.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another holder owns the key.
    #[error("lock {0} is held by another process")]
    Contended(String),
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Factory for locks on one Redis deployment.
#[derive(Clone)]
pub struct DistributedLock {
    conn: ConnectionManager,
    prefix: String,
}

impl DistributedLock {
    /// Locks are stored under `<prefix>/lock/<key>`.
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    /// Take `key` for `ttl`, renewing it until the guard is released.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockGuard, LockError> {
        let full_key = format!("{}/lock/{}", self.prefix, key);
        let token = Uuid::new_v4().to_string();
        let ttl_ms = ttl.as_millis().max(1) as u64;

        let mut conn = self.conn.clone();
        let acquired: Option<String> = ::redis::cmd("SET")
            .arg(&full_key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        if acquired.is_none() {
            return Err(LockError::Contended(full_key));
        }

        let cancel = CancellationToken::new();
        tokio::spawn(renew(
            self.conn.clone(),
            full_key.clone(),
            token.clone(),
            ttl,
            cancel.clone(),
        ));

        debug!(key = %full_key, "Lock acquired");
        Ok(LockGuard {
            conn: self.conn.clone(),
            key: full_key,
            token,
            cancel,
            released: false,
        })
    }
}

async fn renew(
    mut conn: ConnectionManager,
    key: String,
    token: String,
    ttl: Duration,
    cancel: CancellationToken,
) {
    let script = Script::new(COMPARE_AND_PEXPIRE);
    let ttl_ms = ttl.as_millis().max(1) as u64;
    let period = (ttl / 2).max(Duration::from_millis(1));

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => return,

            _ = tokio::time::sleep(period) => {
                let renewed: Result<i64, _> = script
                    .key(&key)
                    .arg(&token)
                    .arg(ttl_ms)
                    .invoke_async(&mut conn)
                    .await;
                match renewed {
                    Ok(1) => {}
                    Ok(_) => {
                        warn!(key = %key, "Lock lost before release");
                        return;
                    }
                    Err(e) => warn!(key = %key, error = %e, "Failed to renew lock"),
                }
            }
        }
    }
}

/// Held lock. Released on [`LockGuard::release`] or drop.
pub struct LockGuard {
    conn: ConnectionManager,
    key: String,
    token: String,
    cancel: CancellationToken,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stop renewing and delete the key if this guard still owns it.
    /// Calling it again does nothing.
    pub async fn release(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.cancel.cancel();

        let mut conn = self.conn.clone();
        let _deleted: i64 = Script::new(COMPARE_AND_DELETE)
            .key(&self.key)
            .arg(&self.token)
            .invoke_async(&mut conn)
            .await?;
        debug!(key = %self.key, "Lock released");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.cancel.cancel();

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // the key expires on its own
            return;
        };
        let mut conn = self.conn.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            let result: Result<i64, _> = Script::new(COMPARE_AND_DELETE)
                .key(&key)
                .arg(&token)
                .invoke_async(&mut conn)
                .await;
            if let Err(e) = result {
                warn!(key = %key, error = %e, "Failed to release dropped lock");
            }
        });
    }
}
