//! Publisher facade
//!
//! Owns the queue, the status service, the worker task and the periodic
//! fetch cycle, and tears them down in order on shutdown: the producer stops
//! first, the queue closes, ready work drains (bounded), then the worker
//! finishes its in-flight item and exits.

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, PublisherConfig};
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::error::{FanoutError, Result};
use crate::events::{EventBus, EventReceiver};
use crate::platforms::PlatformRegistry;
use crate::queue::{PublicationQueue, WorkRequest};
use crate::retry::RetryPolicy;
use crate::status::StatusService;
use crate::store::ContentStore;
use crate::types::{ContentItem, ItemId, PlatformKind, Report, StatusSnapshot};
use crate::worker::{FetchCycle, Worker, WorkerSettings, WorkerStats};

/// Operational snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublisherStats {
    pub queued: usize,
    pub deferred: usize,
    pub worker_running: bool,
    pub platforms: Vec<PlatformKind>,
    pub processed: u64,
    pub aborted: u64,
    pub errors: u64,
}

struct Tasks {
    worker: JoinHandle<()>,
    fetch: JoinHandle<()>,
}

pub struct Publisher {
    queue: Arc<PublicationQueue>,
    status: StatusService,
    dispatcher: Dispatcher,
    fetch: FetchCycle,
    registry: PlatformRegistry,
    settings: PublisherConfig,
    stats: Arc<WorkerStats>,
    producer_token: CancellationToken,
    worker_token: CancellationToken,
    tasks: Mutex<Option<Tasks>>,
}

impl Publisher {
    pub fn new(store: Arc<dyn ContentStore>, registry: PlatformRegistry, config: &Config) -> Self {
        let events = EventBus::default();
        let queue = Arc::new(PublicationQueue::new());
        let status = StatusService::new(store.clone(), events);
        let dispatcher = Dispatcher::new(
            registry.clone(),
            status.clone(),
            RetryPolicy::from(&config.retry),
            config.publisher.pacing_delay(),
        );
        let fetch = FetchCycle::new(store, queue.clone(), config.publisher.max_items_per_cycle);

        Self {
            queue,
            status,
            dispatcher,
            fetch,
            registry,
            settings: config.publisher.clone(),
            stats: Arc::new(WorkerStats::default()),
            producer_token: CancellationToken::new(),
            worker_token: CancellationToken::new(),
            tasks: Mutex::new(None),
        }
    }

    /// Override the fetch cycle interval (e.g. from the command line)
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.settings.poll_interval_secs = interval.as_secs().max(1);
        self
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.status.events().subscribe()
    }

    fn worker(&self) -> Worker {
        Worker::new(
            self.queue.clone(),
            self.dispatcher.clone(),
            WorkerSettings {
                pop_timeout: self.settings.pop_timeout(),
                store_alert_threshold: self.settings.store_alert_threshold,
                store_retry_delay: self.dispatcher.policy().base_delay,
            },
            self.stats.clone(),
        )
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Option<Tasks>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn the worker and the periodic fetch cycle
    pub fn start(&self) -> Result<()> {
        let mut tasks = self.tasks();
        if tasks.is_some() {
            return Err(FanoutError::InvalidInput("publisher already started".to_string()));
        }
        if self.queue.is_closed() {
            return Err(crate::error::QueueError::Closed.into());
        }

        let worker = tokio::spawn(self.worker().run(self.worker_token.clone()));
        let fetch = tokio::spawn(
            self.fetch
                .clone()
                .run(self.settings.poll_interval(), self.producer_token.clone()),
        );
        *tasks = Some(Tasks { worker, fetch });

        info!(
            platforms = ?self.registry.kinds(),
            poll_interval_secs = self.settings.poll_interval_secs,
            "Publisher started"
        );
        Ok(())
    }

    /// Schedule a dispatch pass; `platforms = None` means every selected platform
    pub fn enqueue(
        &self,
        item_id: impl Into<ItemId>,
        platforms: Option<BTreeSet<PlatformKind>>,
    ) -> Result<()> {
        self.queue.enqueue(WorkRequest {
            item_id: item_id.into(),
            platforms,
            force: false,
        })?;
        Ok(())
    }

    /// Like [`enqueue`](Self::enqueue), but also retries platforms whose
    /// failure was final or whose retry time has not come yet
    pub fn publish_now(
        &self,
        item_id: impl Into<ItemId>,
        platforms: Option<BTreeSet<PlatformKind>>,
    ) -> Result<()> {
        self.queue.enqueue(WorkRequest {
            item_id: item_id.into(),
            platforms,
            force: true,
        })?;
        Ok(())
    }

    /// Run a single dispatch pass right away, bypassing the queue
    pub async fn dispatch(&self, request: &WorkRequest) -> Result<DispatchOutcome> {
        self.dispatcher.dispatch(request).await
    }

    pub async fn report_result(
        &self,
        item_id: &ItemId,
        platform: PlatformKind,
        report: Report,
    ) -> Result<StatusSnapshot> {
        Ok(self.status.report(item_id, platform, report).await?.item.snapshot())
    }

    pub async fn get_status(&self, item_id: &ItemId) -> Result<StatusSnapshot> {
        self.status.get_status(item_id).await
    }

    pub async fn reselect(
        &self,
        item_id: &ItemId,
        platforms: BTreeSet<PlatformKind>,
    ) -> Result<StatusSnapshot> {
        Ok(self.status.reselect(item_id, platforms).await?.snapshot())
    }

    /// Items the fetch cycle would pick up now
    pub async fn pending(&self) -> Result<Vec<ContentItem>> {
        self.status
            .store()
            .fetch_pending(self.settings.max_items_per_cycle, crate::types::now_millis())
            .await
    }

    /// One fetch: enqueue every pending item; returns how many were queued
    pub async fn run_cycle(&self) -> Result<usize> {
        self.fetch.run_once().await
    }

    /// Fetch once and dispatch everything that is ready, in this task
    ///
    /// Retries scheduled during the pass stay deferred for a later run.
    pub async fn run_once(&self) -> Result<usize> {
        self.run_cycle().await?;

        let worker = self.worker();
        let mut dispatched = 0;
        while let Some(request) = self.queue.pop(Duration::ZERO).await {
            worker.process(request).await;
            dispatched += 1;
        }
        Ok(dispatched)
    }

    pub fn stats(&self) -> PublisherStats {
        let worker_running = self
            .tasks()
            .as_ref()
            .is_some_and(|t| !t.worker.is_finished());

        PublisherStats {
            queued: self.queue.len(),
            deferred: self.queue.deferred_len(),
            worker_running,
            platforms: self.registry.kinds(),
            processed: self.stats.processed.load(Ordering::Relaxed),
            aborted: self.stats.aborted.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work and wait for the worker to exit
    ///
    /// Ready work keeps draining for up to `drain_timeout`; after that the
    /// worker is cancelled, which still lets the item in flight finish.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        info!("Publisher shutting down");
        self.producer_token.cancel();
        self.queue.close();

        let tasks = self.tasks().take();
        let Some(tasks) = tasks else {
            return;
        };

        if tokio::time::timeout(drain_timeout, self.queue.wait_empty())
            .await
            .is_err()
        {
            warn!(remaining = self.queue.len(), "Drain timeout reached, abandoning queued work");
        }

        self.worker_token.cancel();
        for (name, handle) in [("fetch", tasks.fetch), ("worker", tasks.worker)] {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "Task ended abnormally");
            }
        }
        info!("Publisher stopped");
    }
}
