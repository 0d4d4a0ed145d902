// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process bus with durable-consumer semantics.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Acker, BusError, ConsumerSpec, Delivery, MessageBus, Subscription};
use crate::jobs::StreamSpec;

#[derive(Default)]
struct SubjectLog {
    /// Sequence number of `entries[0]`.
    base: u64,
    entries: VecDeque<Bytes>,
}

impl SubjectLog {
    fn end(&self) -> u64 {
        self.base + self.entries.len() as u64
    }

    fn get(&self, seq: u64) -> Option<&Bytes> {
        seq.checked_sub(self.base)
            .and_then(|idx| self.entries.get(idx as usize))
    }
}

struct Pending {
    redeliver_at: Instant,
    count: u64,
}

struct ConsumerState {
    subject: String,
    ack_wait: Duration,
    next: u64,
    pending: BTreeMap<u64, Pending>,
}

#[derive(Default)]
struct Inner {
    streams: Vec<StreamSpec>,
    logs: HashMap<String, SubjectLog>,
    consumers: HashMap<String, ConsumerState>,
}

impl Inner {
    fn stream_for(&self, subject: &str) -> Option<&StreamSpec> {
        self.streams.iter().find(|s| s.captures(subject))
    }

    /// Drop the head of `subject`'s log that every consumer has settled.
    fn compact(&mut self, subject: &str) {
        let floor = self
            .consumers
            .values()
            .filter(|c| c.subject == subject)
            .map(|c| c.pending.keys().next().map_or(c.next, |seq| (*seq).min(c.next)))
            .min();
        let (Some(floor), Some(log)) = (floor, self.logs.get_mut(subject)) else {
            return;
        };
        while log.base < floor && log.entries.pop_front().is_some() {
            log.base += 1;
        }
    }
}

/// In-process [`MessageBus`].
///
/// Consumers start at the beginning of their subject's log. Messages every
/// consumer of a subject has acked are dropped; subjects nobody consumes are
/// bounded by their stream's `max_len` only.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }

    /// Every retained message of `subject`, oldest first.
    pub fn published(&self, subject: &str) -> Vec<Bytes> {
        self.lock()
            .logs
            .get(subject)
            .map(|log| log.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of messages of `subject` still held.
    pub fn retained(&self, subject: &str) -> usize {
        self.lock()
            .logs
            .get(subject)
            .map_or(0, |log| log.entries.len())
    }

    /// Deliveries handed out but not yet acked.
    pub fn pending_count(&self, consumer: &str) -> usize {
        self.lock()
            .consumers
            .get(consumer)
            .map(|c| c.pending.len())
            .unwrap_or(0)
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    match inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<(), BusError> {
        let mut inner = self.lock();
        if !inner.streams.iter().any(|s| s.name == spec.name) {
            inner.streams.push(spec.clone());
        }
        Ok(())
    }

    async fn ensure_consumer(&self, spec: &ConsumerSpec) -> Result<(), BusError> {
        let mut inner = self.lock();
        if inner.stream_for(&spec.subject).is_none() {
            return Err(BusError::NoStream(spec.subject.clone()));
        }
        inner
            .consumers
            .entry(spec.name.clone())
            .or_insert_with(|| ConsumerState {
                subject: spec.subject.clone(),
                ack_wait: spec.ack_wait,
                next: 0,
                pending: BTreeMap::new(),
            });
        Ok(())
    }

    async fn pull_subscribe(
        &self,
        subject: &str,
        consumer: &str,
    ) -> Result<Box<dyn Subscription>, BusError> {
        let inner = self.lock();
        match inner.consumers.get(consumer) {
            Some(state) if state.subject == subject => Ok(Box::new(MemorySubscription {
                bus: self.clone(),
                consumer: consumer.to_string(),
            })),
            _ => Err(BusError::NoConsumer(consumer.to_string())),
        }
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        {
            let mut inner = self.lock();
            let max_len = match inner.stream_for(subject) {
                Some(stream) => stream.max_len,
                None => return Err(BusError::NoStream(subject.to_string())),
            };
            let log = inner.logs.entry(subject.to_string()).or_default();
            log.entries.push_back(payload);
            if let Some(max_len) = max_len {
                while log.entries.len() > max_len {
                    log.entries.pop_front();
                    log.base += 1;
                }
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

struct MemorySubscription {
    bus: InMemoryBus,
    consumer: String,
}

impl MemorySubscription {
    /// Hand out due redeliveries then new messages. Returns the deliveries
    /// and the earliest future redelivery time.
    fn take(&self, max: usize) -> Result<(Vec<Delivery>, Option<Instant>), BusError> {
        let now = Instant::now();
        let mut inner = self.bus.lock();
        let Inner {
            logs, consumers, ..
        } = &mut *inner;
        let state = consumers
            .get_mut(&self.consumer)
            .ok_or_else(|| BusError::NoConsumer(self.consumer.clone()))?;
        let empty = SubjectLog::default();
        let log = logs.get(&state.subject).unwrap_or(&empty);

        let mut out = Vec::new();
        let mut trimmed = Vec::new();

        for (seq, pending) in state.pending.iter_mut() {
            if out.len() >= max {
                break;
            }
            if pending.redeliver_at > now {
                continue;
            }
            let Some(payload) = log.get(*seq) else {
                trimmed.push(*seq);
                continue;
            };
            pending.count += 1;
            pending.redeliver_at = now + state.ack_wait;
            out.push(self.delivery(&state.subject, *seq, payload.clone(), pending.count));
        }
        for seq in trimmed {
            state.pending.remove(&seq);
        }

        state.next = state.next.max(log.base);
        while out.len() < max && state.next < log.end() {
            let seq = state.next;
            state.next += 1;
            if let Some(payload) = log.get(seq) {
                state.pending.insert(
                    seq,
                    Pending {
                        redeliver_at: now + state.ack_wait,
                        count: 1,
                    },
                );
                out.push(self.delivery(&state.subject, seq, payload.clone(), 1));
            }
        }

        let next_redelivery = state.pending.values().map(|p| p.redeliver_at).min();
        Ok((out, next_redelivery))
    }

    fn delivery(&self, subject: &str, seq: u64, payload: Bytes, count: u64) -> Delivery {
        Delivery::new(
            subject.to_string(),
            payload,
            count,
            Box::new(MemoryAcker {
                bus: self.bus.clone(),
                consumer: self.consumer.clone(),
                seq,
            }),
        )
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn fetch(&mut self, max: usize, timeout: Duration) -> Result<Vec<Delivery>, BusError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.bus.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (deliveries, next_redelivery) = self.take(max.max(1))?;
            if !deliveries.is_empty() {
                return Ok(deliveries);
            }
            if Instant::now() >= deadline {
                return Err(BusError::FetchTimeout);
            }

            let wake_at = next_redelivery.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }
}

struct MemoryAcker {
    bus: InMemoryBus,
    consumer: String,
    seq: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), BusError> {
        let mut inner = self.bus.lock();
        let state = inner
            .consumers
            .get_mut(&self.consumer)
            .ok_or_else(|| BusError::NoConsumer(self.consumer.clone()))?;
        if state.pending.remove(&self.seq).is_none() {
            return Err(BusError::AlreadySettled);
        }
        let subject = state.subject.clone();
        inner.compact(&subject);
        Ok(())
    }

    async fn nak(&self) -> Result<(), BusError> {
        {
            let mut inner = self.bus.lock();
            let state = inner
                .consumers
                .get_mut(&self.consumer)
                .ok_or_else(|| BusError::NoConsumer(self.consumer.clone()))?;
            let pending = state
                .pending
                .get_mut(&self.seq)
                .ok_or(BusError::AlreadySettled)?;
            pending.redeliver_at = Instant::now();
        }
        self.bus.notify.notify_waiters();
        Ok(())
    }
}
