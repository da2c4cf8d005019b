//! Queue consumer and periodic producer
//!
//! The [`Worker`] is the single consumer of the publication queue. It
//! acknowledges every request it pops; retries come back later through a
//! deferred re-enqueue, never by keeping an item claimed. Cancellation is
//! only observed between items, so a dispatch pass in flight always runs to
//! completion.

use chrono::Utc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::error::{QueueError, Result};
use crate::queue::{PublicationQueue, WorkRequest};
use crate::store::ContentStore;
use crate::types::now_millis;

/// Counters shared between the worker and whoever reports on it
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub processed: AtomicU64,
    pub aborted: AtomicU64,
    pub errors: AtomicU64,
    pub consecutive_store_failures: AtomicU32,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Longest single wait on the queue
    pub pop_timeout: Duration,
    /// Consecutive aborted passes before an alert is logged
    pub store_alert_threshold: u32,
    /// Delay before an aborted item is tried again
    pub store_retry_delay: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            pop_timeout: Duration::from_secs(5),
            store_alert_threshold: 5,
            store_retry_delay: Duration::from_secs(60),
        }
    }
}

pub struct Worker {
    queue: Arc<PublicationQueue>,
    dispatcher: Dispatcher,
    settings: WorkerSettings,
    stats: Arc<WorkerStats>,
}

impl Worker {
    pub fn new(
        queue: Arc<PublicationQueue>,
        dispatcher: Dispatcher,
        settings: WorkerSettings,
        stats: Arc<WorkerStats>,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            settings,
            stats,
        }
    }

    /// Consume the queue until cancelled, or until it is closed and empty
    pub async fn run(self, token: CancellationToken) {
        info!("Worker started");

        loop {
            let popped = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                popped = self.queue.pop(self.settings.pop_timeout) => popped,
            };

            match popped {
                Some(request) => {
                    self.process(request).await;
                }
                None if self.queue.is_closed() => {
                    debug!("Queue closed and drained");
                    break;
                }
                None => {}
            }
        }

        info!("Worker stopped");
    }

    /// Dispatch one request and schedule whatever follow-up it needs
    pub async fn process(&self, request: WorkRequest) -> Option<DispatchOutcome> {
        let id = request.item_id.clone();

        match self.dispatcher.dispatch(&request).await {
            Ok(DispatchOutcome::Aborted { reason }) => {
                self.stats.aborted.fetch_add(1, Ordering::Relaxed);
                self.record_store_failure();

                let retry_delay = chrono::TimeDelta::from_std(self.settings.store_retry_delay)
                    .unwrap_or(chrono::TimeDelta::MAX);
                let at = Utc::now()
                    .checked_add_signed(retry_delay)
                    .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC);
                self.requeue(request, at);
                Some(DispatchOutcome::Aborted { reason })
            }
            Ok(outcome) => {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
                self.stats.consecutive_store_failures.store(0, Ordering::Relaxed);

                if let Some(at) = outcome.next_retry_at() {
                    self.requeue(WorkRequest::item(id), at);
                }
                Some(outcome)
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(item_id = %id, error = %e, "Dispatch failed");
                None
            }
        }
    }

    fn requeue(&self, request: WorkRequest, at: chrono::DateTime<Utc>) {
        let id = request.item_id.clone();
        match self.queue.enqueue_at(request, at) {
            Ok(()) => debug!(item_id = %id, retry_at = %at, "Re-enqueued for retry"),
            // the retry time is persisted; the next fetch cycle picks it up
            Err(QueueError::Closed) => debug!(item_id = %id, "Queue closed, retry left to fetch cycle"),
        }
    }

    fn record_store_failure(&self) {
        let failures = self
            .stats
            .consecutive_store_failures
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        let threshold = self.settings.store_alert_threshold.max(1);
        if failures % threshold == 0 {
            error!(
                alert = "store_unavailable",
                consecutive_failures = failures,
                "Content store unreachable for {} consecutive dispatch passes",
                failures
            );
        }
    }
}

/// Periodic producer: moves externally pending items into the queue
#[derive(Clone)]
pub struct FetchCycle {
    store: Arc<dyn ContentStore>,
    queue: Arc<PublicationQueue>,
    limit: usize,
}

impl FetchCycle {
    pub fn new(store: Arc<dyn ContentStore>, queue: Arc<PublicationQueue>, limit: usize) -> Self {
        Self {
            store,
            queue,
            limit,
        }
    }

    /// Fetch pending items once and enqueue them; returns how many were queued
    pub async fn run_once(&self) -> Result<usize> {
        let items = self.store.fetch_pending(self.limit, now_millis()).await?;
        if items.is_empty() {
            debug!("No pending items");
            return Ok(0);
        }

        info!(count = items.len(), "Found pending item(s)");
        let mut queued = 0;
        for item in items {
            self.queue.enqueue(WorkRequest::item(item.id))?;
            queued += 1;
        }
        Ok(queued)
    }

    /// Run a cycle every `interval` until cancelled
    pub async fn run(self, interval: Duration, token: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "Fetch cycle started");

        loop {
            if let Err(e) = self.run_once().await {
                if e.is_store_unavailable() {
                    warn!(error = %e, "Fetch cycle could not reach the store");
                } else {
                    error!(error = %e, "Fetch cycle failed");
                }
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("Fetch cycle stopped");
    }
}
