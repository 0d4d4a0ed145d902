// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable message bus.
//!
//! Streams group subjects; each durable consumer reads one subject with
//! explicit acks. A delivery that is neither acked nor nak'd within the
//! consumer's ack-wait is handed out again, so delivery is at-least-once
//! and handlers must be idempotent.
//!
//! Two implementations:
//!
//! - [`RedisStreamsBus`]: one Redis stream per subject, consumer groups
//!   for durable consumers. Used in cluster mode.
//! - [`InMemoryBus`]: the same semantics inside one process. Used by
//!   standalone nodes and tests.

mod memory;
mod redis_streams;

pub use memory::InMemoryBus;
pub use redis_streams::RedisStreamsBus;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::jobs::StreamSpec;

/// Bus errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BusError {
    /// No message arrived before the fetch deadline. Not a fault.
    #[error("fetch timed out")]
    FetchTimeout,
    /// The subject is not captured by any registered stream.
    #[error("no stream captures subject {0}")]
    NoStream(String),
    /// The consumer was never ensured.
    #[error("unknown consumer {0}")]
    NoConsumer(String),
    /// The delivery was already acked or nak'd.
    #[error("delivery already settled")]
    AlreadySettled,
    /// The backing store returned something unexpected.
    #[error("malformed bus entry: {0}")]
    Malformed(String),
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

impl BusError {
    /// Whether this is the benign empty-fetch outcome.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::FetchTimeout)
    }
}

/// A durable consumer: explicit acks, one subject, an ack-wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub name: String,
    pub subject: String,
    pub ack_wait: Duration,
}

impl ConsumerSpec {
    pub fn new(name: impl Into<String>, subject: impl Into<String>, ack_wait: Duration) -> Self {
        Self {
            name: name.into(),
            subject: subject.into(),
            ack_wait,
        }
    }
}

/// Message bus contract.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Register a stream. Idempotent.
    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<(), BusError>;

    /// Create a durable consumer unless it exists. Idempotent.
    async fn ensure_consumer(&self, spec: &ConsumerSpec) -> Result<(), BusError>;

    /// Pull subscription for an ensured consumer.
    async fn pull_subscribe(
        &self,
        subject: &str,
        consumer: &str,
    ) -> Result<Box<dyn Subscription>, BusError>;

    /// Append a message to `subject`.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError>;
}

/// Pull side of a durable consumer.
#[async_trait]
pub trait Subscription: Send {
    /// Up to `max` deliveries, waiting at most `timeout` for the first.
    ///
    /// Returns [`BusError::FetchTimeout`] when nothing arrived.
    async fn fetch(&mut self, max: usize, timeout: Duration) -> Result<Vec<Delivery>, BusError>;
}

/// Settles one delivery with the bus.
#[async_trait]
pub(crate) trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), BusError>;
    async fn nak(&self) -> Result<(), BusError>;
}

/// One message handed to a consumer.
pub struct Delivery {
    pub subject: String,
    pub payload: Bytes,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u64,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub(crate) fn new(
        subject: String,
        payload: Bytes,
        delivery_count: u64,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            subject,
            payload,
            delivery_count,
            acker,
        }
    }

    /// Confirm processing; the message is never delivered again.
    pub async fn ack(self) -> Result<(), BusError> {
        self.acker.ack().await
    }

    /// Ask for immediate redelivery.
    pub async fn nak(self) -> Result<(), BusError> {
        self.acker.nak().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}
