// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bus over Redis streams.
//!
//! Every subject is its own stream key, `wlcp:<stream>:<subject>`, and every
//! durable consumer a consumer group on that key. New entries are read with
//! `XREADGROUP`; entries idle in the group's pending list for longer than the
//! ack-wait are taken over with `XCLAIM`, which is how a crashed member's
//! work is redelivered.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use ::redis::aio::{ConnectionManager, MultiplexedConnection};
use ::redis::streams::{
    StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply, StreamReadOptions,
    StreamReadReply,
};
use ::redis::{AsyncCommands, RedisResult};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use super::{Acker, BusError, ConsumerSpec, Delivery, MessageBus, Subscription};
use crate::jobs::StreamSpec;

const PAYLOAD_FIELD: &str = "payload";

/// [`MessageBus`] over Redis streams.
pub struct RedisStreamsBus {
    client: ::redis::Client,
    conn: ConnectionManager,
    /// Consumer-group member name of this process.
    member: String,
    streams: RwLock<Vec<StreamSpec>>,
    consumers: RwLock<HashMap<String, ConsumerSpec>>,
}

impl RedisStreamsBus {
    /// Connect to `url`. `node_id` prefixes this process's member name.
    pub async fn connect(url: &str, node_id: i64) -> Result<Self, BusError> {
        let client = ::redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            client,
            conn,
            member: format!("{}-{}", node_id, uuid::Uuid::new_v4()),
            streams: RwLock::new(Vec::new()),
            consumers: RwLock::new(HashMap::new()),
        })
    }

    fn stream_for(&self, subject: &str) -> Result<StreamSpec, BusError> {
        let streams = match self.streams.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        streams
            .iter()
            .find(|s| s.captures(subject))
            .cloned()
            .ok_or_else(|| BusError::NoStream(subject.to_string()))
    }

    fn key(&self, subject: &str) -> Result<String, BusError> {
        let stream = self.stream_for(subject)?;
        Ok(stream_key(stream.name, subject))
    }
}

fn stream_key(stream: &str, subject: &str) -> String {
    format!("wlcp:{}:{}", stream, subject)
}

#[async_trait]
impl MessageBus for RedisStreamsBus {
    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<(), BusError> {
        let mut streams = match self.streams.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !streams.iter().any(|s| s.name == spec.name) {
            streams.push(spec.clone());
        }
        Ok(())
    }

    async fn ensure_consumer(&self, spec: &ConsumerSpec) -> Result<(), BusError> {
        let key = self.key(&spec.subject)?;
        let mut conn = self.conn.clone();

        let created: RedisResult<()> = conn.xgroup_create_mkstream(&key, &spec.name, "0").await;
        match created {
            Ok(()) => debug!(consumer = %spec.name, key = %key, "Created consumer group"),
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(e.into()),
        }

        let mut consumers = match self.consumers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        consumers.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn pull_subscribe(
        &self,
        subject: &str,
        consumer: &str,
    ) -> Result<Box<dyn Subscription>, BusError> {
        let spec = {
            let consumers = match self.consumers.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match consumers.get(consumer) {
                Some(spec) if spec.subject == subject => spec.clone(),
                _ => return Err(BusError::NoConsumer(consumer.to_string())),
            }
        };
        let key = self.key(subject)?;

        // XREADGROUP ... BLOCK stalls every command queued behind it, so each
        // subscription reads on its own connection.
        let reader = self.client.get_multiplexed_async_connection().await?;

        Ok(Box::new(RedisSubscription {
            reader,
            acks: self.conn.clone(),
            key,
            subject: subject.to_string(),
            group: spec.name,
            member: self.member.clone(),
            ack_wait: spec.ack_wait,
        }))
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        let stream = self.stream_for(subject)?;
        let key = stream_key(stream.name, subject);
        let mut conn = self.conn.clone();
        let fields = [(PAYLOAD_FIELD, payload.as_ref())];

        let _id: String = match stream.max_len {
            Some(max_len) => {
                conn.xadd_maxlen(&key, StreamMaxlen::Approx(max_len), "*", &fields)
                    .await?
            }
            None => conn.xadd(&key, "*", &fields).await?,
        };
        Ok(())
    }
}

struct RedisSubscription {
    reader: MultiplexedConnection,
    acks: ConnectionManager,
    key: String,
    subject: String,
    group: String,
    member: String,
    ack_wait: Duration,
}

impl RedisSubscription {
    fn ack_wait_ms(&self) -> usize {
        self.ack_wait.as_millis().max(1) as usize
    }

    fn delivery(&self, entry: StreamId, count: u64) -> Result<Delivery, BusError> {
        let payload: Vec<u8> = entry.get(PAYLOAD_FIELD).ok_or_else(|| {
            BusError::Malformed(format!("{} entry {} has no payload", self.key, entry.id))
        })?;
        Ok(Delivery::new(
            self.subject.clone(),
            Bytes::from(payload),
            count,
            Box::new(RedisAcker {
                conn: self.acks.clone(),
                key: self.key.clone(),
                group: self.group.clone(),
                member: self.member.clone(),
                id: entry.id,
                ack_wait_ms: self.ack_wait_ms(),
            }),
        ))
    }

    /// Take over entries whose last delivery is older than the ack-wait.
    async fn reclaim(&mut self, max: usize) -> Result<Vec<Delivery>, BusError> {
        let pending: StreamPendingCountReply = self
            .reader
            .xpending_count(&self.key, &self.group, "-", "+", max)
            .await?;

        let ack_wait_ms = self.ack_wait_ms();
        let stale: Vec<(String, u64)> = pending
            .ids
            .into_iter()
            .filter(|p| p.last_delivered_ms >= ack_wait_ms)
            .map(|p| (p.id, p.times_delivered as u64 + 1))
            .collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<&str> = stale.iter().map(|(id, _)| id.as_str()).collect();
        let claimed: StreamClaimReply = self
            .reader
            .xclaim(&self.key, &self.group, &self.member, ack_wait_ms, &ids)
            .await?;

        let mut deliveries = Vec::with_capacity(claimed.ids.len());
        for entry in claimed.ids {
            let count = stale
                .iter()
                .find(|(id, _)| *id == entry.id)
                .map_or(2, |(_, count)| *count);
            deliveries.push(self.delivery(entry, count)?);
        }
        Ok(deliveries)
    }
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn fetch(&mut self, max: usize, timeout: Duration) -> Result<Vec<Delivery>, BusError> {
        let max = max.max(1);

        let reclaimed = self.reclaim(max).await?;
        if !reclaimed.is_empty() {
            return Ok(reclaimed);
        }

        let options = StreamReadOptions::default()
            .group(&self.group, &self.member)
            .count(max)
            .block(timeout.as_millis().max(1) as usize);
        let reply: Option<StreamReadReply> = self
            .reader
            .xread_options(&[&self.key], &[">"], &options)
            .await?;

        let mut deliveries = Vec::new();
        for stream in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in stream.ids {
                deliveries.push(self.delivery(entry, 1)?);
            }
        }
        if deliveries.is_empty() {
            return Err(BusError::FetchTimeout);
        }
        Ok(deliveries)
    }
}

struct RedisAcker {
    conn: ConnectionManager,
    key: String,
    group: String,
    member: String,
    id: String,
    ack_wait_ms: usize,
}

#[async_trait]
impl Acker for RedisAcker {
    async fn ack(&self) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let acked: i64 = conn.xack(&self.key, &self.group, &[&self.id]).await?;
        if acked == 0 {
            return Err(BusError::AlreadySettled);
        }
        Ok(())
    }

    async fn nak(&self) -> Result<(), BusError> {
        // Backdate the idle time so the next fetch of any member reclaims it.
        let mut conn = self.conn.clone();
        let claimed: Vec<String> = ::redis::cmd("XCLAIM")
            .arg(&self.key)
            .arg(&self.group)
            .arg(&self.member)
            .arg(0)
            .arg(&self.id)
            .arg("IDLE")
            .arg(self.ack_wait_ms)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await?;
        if claimed.is_empty() {
            return Err(BusError::AlreadySettled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_key() {
        assert_eq!(
            stream_key("workspace", "workspace.stop"),
            "wlcp:workspace:workspace.stop"
        );
    }
}
