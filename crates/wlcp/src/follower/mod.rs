// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Follower loop: drains the job subjects into a bounded worker pool.
//!
//! Every node runs the follower, leader or not. Each tick fetches at most
//! one message per durable subscription (waiting up to 50ms) and hands it
//! to a worker. When every worker is busy the remaining subscriptions are
//! left for the next tick, so messages stay on the bus instead of piling up
//! in memory.
//!
//! Jobs are always acked once handled, whatever the outcome: retries come
//! from the leader's re-publish window, not from redelivery.

mod handlers;

pub use handlers::{
    COMPENSATION_TIMEOUT, ResourceLimits, Settlement, handle_job, purge_deleted,
};

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::bus::{ConsumerSpec, Delivery, Subscription};
use crate::error::Result;
use crate::jobs::{
    self, CONSUMER_WORKSPACE_CREATE, CONSUMER_WORKSPACE_DELETE, CONSUMER_WORKSPACE_DESTROY,
    CONSUMER_WORKSPACE_START, CONSUMER_WORKSPACE_STOP, PERIODIC_SUBJECTS, STREAMS,
    SUBJECT_WORKSPACE_CREATE, SUBJECT_WORKSPACE_DELETE, SUBJECT_WORKSPACE_DESTROY,
    SUBJECT_WORKSPACE_START, SUBJECT_WORKSPACE_STOP, TransitionJob,
};
use crate::state::Core;

/// Configuration for the follower loop.
#[derive(Debug, Clone)]
pub struct FollowerConfig {
    /// Concurrent handlers (default: number of CPUs)
    pub pool_size: usize,
    /// Longest wait for a message per subscription and tick (default: 50ms)
    pub fetch_timeout: Duration,
}

impl Default for FollowerConfig {
    fn default() -> Self {
        Self {
            pool_size: num_cpus::get(),
            fetch_timeout: Duration::from_millis(50),
        }
    }
}

const WORKSPACE_CONSUMERS: [(&str, &str); 5] = [
    (SUBJECT_WORKSPACE_CREATE, CONSUMER_WORKSPACE_CREATE),
    (SUBJECT_WORKSPACE_START, CONSUMER_WORKSPACE_START),
    (SUBJECT_WORKSPACE_STOP, CONSUMER_WORKSPACE_STOP),
    (SUBJECT_WORKSPACE_DESTROY, CONSUMER_WORKSPACE_DESTROY),
    (SUBJECT_WORKSPACE_DELETE, CONSUMER_WORKSPACE_DELETE),
];

/// Every durable consumer the follower reads.
pub fn consumer_specs() -> Vec<ConsumerSpec> {
    let workspace = WORKSPACE_CONSUMERS
        .iter()
        .map(|(subject, name)| (subject.to_string(), name.to_string()));
    let periodic = PERIODIC_SUBJECTS
        .iter()
        .map(|subject| (subject.to_string(), jobs::periodic_consumer_name(subject)));

    workspace
        .chain(periodic)
        .filter_map(|(subject, name)| {
            let stream = STREAMS.iter().find(|s| s.captures(&subject))?;
            Some(ConsumerSpec::new(name, subject, stream.ack_wait))
        })
        .collect()
}

struct Route {
    subject: String,
    subscription: Box<dyn Subscription>,
}

/// Consumer side of a node.
pub struct FollowerLoop {
    core: Arc<Core>,
    routes: Vec<Route>,
    workers: Arc<Semaphore>,
    tasks: TaskTracker,
    cancel: CancellationToken,
    config: FollowerConfig,
}

impl FollowerLoop {
    /// Ensure every stream and consumer exists and subscribe to them.
    ///
    /// `cancel` is handed to every handler; cancelling it interrupts
    /// in-flight provisioner calls and sends handlers down their
    /// compensation path.
    pub async fn new(
        core: Arc<Core>,
        config: FollowerConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        for stream in STREAMS.iter() {
            core.bus.ensure_stream(stream).await?;
        }

        let mut routes = Vec::new();
        for spec in consumer_specs() {
            core.bus.ensure_consumer(&spec).await?;
            let subscription = core.bus.pull_subscribe(&spec.subject, &spec.name).await?;
            routes.push(Route {
                subject: spec.subject,
                subscription,
            });
        }

        Ok(Self {
            core,
            routes,
            workers: Arc::new(Semaphore::new(config.pool_size.max(1))),
            tasks: TaskTracker::new(),
            cancel,
            config,
        })
    }

    /// Tracker of in-flight handlers.
    pub fn tasks(&self) -> TaskTracker {
        self.tasks.clone()
    }

    /// Fetch and dispatch at most one message per subscription. Returns
    /// the number of handlers started.
    pub async fn tick(&mut self) -> usize {
        let mut started = 0;

        for route in self.routes.iter_mut() {
            let Ok(permit) = self.workers.clone().try_acquire_owned() else {
                debug!("Worker pool saturated, deferring remaining subjects");
                break;
            };

            let deliveries = match route.subscription.fetch(1, self.config.fetch_timeout).await {
                Ok(deliveries) => deliveries,
                Err(e) if e.is_timeout() => continue,
                Err(e) => {
                    error!(subject = %route.subject, error = %e, "Failed to fetch next job");
                    continue;
                }
            };

            let Some(delivery) = deliveries.into_iter().next() else {
                continue;
            };

            let core = self.core.clone();
            let cancel = self.cancel.clone();
            self.tasks.spawn(async move {
                dispatch(&core, delivery, &cancel).await;
                drop(permit);
            });
            started += 1;
        }

        started
    }
}

/// Stop accepting work on `tasks` and wait up to `timeout` for in-flight
/// handlers. Returns whether every handler finished in time.
pub async fn drain(tasks: &TaskTracker, timeout: Duration) -> bool {
    tasks.close();
    let drained = tokio::time::timeout(timeout, tasks.wait()).await.is_ok();
    if drained {
        info!("Follower worker pool drained");
    } else {
        warn!(
            in_flight = tasks.len(),
            "Follower worker pool did not drain in time"
        );
    }
    drained
}

/// Route one delivery to its handler and ack it.
pub(crate) async fn dispatch(core: &Core, delivery: Delivery, cancel: &CancellationToken) {
    let subject = delivery.subject.clone();

    let handled = AssertUnwindSafe(route(core, &subject, &delivery.payload, cancel))
        .catch_unwind()
        .await;
    if handled.is_err() {
        error!(subject = %subject, "Job handler panicked");
    }

    if let Err(e) = delivery.ack().await {
        error!(subject = %subject, error = %e, "Failed to ack job");
    }
}

async fn route(core: &Core, subject: &str, payload: &[u8], cancel: &CancellationToken) {
    if subject == SUBJECT_WORKSPACE_DELETE {
        if let Err(e) = purge_deleted(core).await {
            error!(error = %e, "Failed to purge deleted workspaces");
        }
        return;
    }

    if PERIODIC_SUBJECTS.contains(&subject) {
        if let Err(e) = core.periodic.run(subject, payload).await {
            error!(subject = %subject, error = %e, "Periodic job failed");
        }
        return;
    }

    match TransitionJob::decode(subject, payload) {
        Ok(job) => {
            let settlement = handle_job(core, job, cancel).await;
            debug!(subject = %subject, settlement = ?settlement, "Job handled");
        }
        Err(e) => error!(subject = %subject, error = %e, "Failed to decode job"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{
        CONSUMER_WORKSPACE_STOP, STREAM_MISC, STREAM_WORKSPACE, SUBJECT_MISC_SITEMAP_GENERATE,
    };

    #[test]
    fn test_consumer_specs_cover_every_subject() {
        let specs = consumer_specs();
        assert_eq!(specs.len(), WORKSPACE_CONSUMERS.len() + PERIODIC_SUBJECTS.len());

        let stop = specs
            .iter()
            .find(|s| s.name == CONSUMER_WORKSPACE_STOP)
            .unwrap();
        assert_eq!(stop.subject, SUBJECT_WORKSPACE_STOP);
        assert_eq!(stop.ack_wait, STREAM_WORKSPACE.ack_wait);

        let sitemap = specs
            .iter()
            .find(|s| s.subject == SUBJECT_MISC_SITEMAP_GENERATE)
            .unwrap();
        assert_eq!(sitemap.name, "wlcp-follower-misc-sitemap-generate");
        assert_eq!(sitemap.ack_wait, STREAM_MISC.ack_wait);
    }

    #[test]
    fn test_default_config() {
        let config = FollowerConfig::default();
        assert_eq!(config.fetch_timeout, Duration::from_millis(50));
        assert!(config.pool_size >= 1);
    }
}
