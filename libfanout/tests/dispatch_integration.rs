//! Integration tests for dispatch: adapter isolation, store outages,
//! retry scheduling and shutdown behaviour

use async_trait::async_trait;
use libfanout::dispatcher::{DispatchOutcome, Dispatcher};
use libfanout::error::{PlatformError, StoreError};
use libfanout::events::{Event, EventBus};
use libfanout::platforms::mock::MockPlatform;
use libfanout::platforms::{Platform, PlatformRegistry, PublishedPost};
use libfanout::queue::{PublicationQueue, WorkRequest};
use libfanout::retry::{next_retry_at, RetryDecision, RetryPolicy};
use libfanout::status::StatusService;
use libfanout::store::{ContentStore, MemoryStore};
use libfanout::types::{now_millis, PostContent};
use libfanout::worker::{Worker, WorkerSettings, WorkerStats};
use libfanout::{Config, ContentItem, ItemId, Phase, PlatformKind, PublicationStatus, Publisher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const TG: PlatformKind = PlatformKind::Telegram;
const BS: PlatformKind = PlatformKind::Bluesky;
const TW: PlatformKind = PlatformKind::Twitter;

/// Adapter that panics instead of returning
struct PanickingPlatform;

#[async_trait]
impl Platform for PanickingPlatform {
    fn kind(&self) -> PlatformKind {
        TG
    }

    async fn authenticate(&self) -> libfanout::Result<()> {
        Ok(())
    }

    async fn publish(&self, _content: &PostContent) -> libfanout::Result<PublishedPost> {
        panic!("adapter bug");
    }

    fn format_content(&self, content: &PostContent) -> String {
        content.title.clone()
    }

    fn character_limit(&self) -> Option<usize> {
        None
    }

    fn is_configured(&self) -> bool {
        true
    }
}

/// Adapter that publishes, then takes the store down before the outcome
/// can be recorded
struct StoreOutagePlatform {
    store: Arc<MemoryStore>,
}

#[async_trait]
impl Platform for StoreOutagePlatform {
    fn kind(&self) -> PlatformKind {
        TG
    }

    async fn authenticate(&self) -> libfanout::Result<()> {
        Ok(())
    }

    async fn publish(&self, _content: &PostContent) -> libfanout::Result<PublishedPost> {
        self.store.set_available(false);
        Ok(PublishedPost {
            post_id: "1".to_string(),
            post_url: None,
        })
    }

    fn format_content(&self, content: &PostContent) -> String {
        content.title.clone()
    }

    fn character_limit(&self) -> Option<usize> {
        None
    }

    fn is_configured(&self) -> bool {
        true
    }
}

/// Store whose writes fail as if another connection held the database lock
struct LockedStore {
    inner: Arc<MemoryStore>,
    failures_left: AtomicUsize,
}

impl LockedStore {
    fn new(inner: Arc<MemoryStore>, failures: usize) -> Self {
        Self {
            inner,
            failures_left: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl ContentStore for LockedStore {
    async fn fetch_pending(
        &self,
        limit: usize,
        now: chrono::DateTime<chrono::Utc>,
    ) -> libfanout::Result<Vec<ContentItem>> {
        self.inner.fetch_pending(limit, now).await
    }

    async fn load(&self, id: &ItemId) -> libfanout::Result<Option<ContentItem>> {
        self.inner.load(id).await
    }

    async fn persist(&self, item: &mut ContentItem) -> libfanout::Result<()> {
        let locked = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if locked {
            return Err(StoreError::SqlxError(sqlx::Error::Protocol("database is locked".into())).into());
        }
        self.inner.persist(item).await
    }

    async fn insert(&self, item: &ContentItem) -> libfanout::Result<()> {
        self.inner.insert(item).await
    }
}

fn dispatcher(store: Arc<MemoryStore>, registry: PlatformRegistry, events: EventBus) -> Dispatcher {
    Dispatcher::new(
        registry,
        StatusService::new(store, events),
        RetryPolicy::default(),
        Duration::ZERO,
    )
}

async fn insert(store: &MemoryStore, id: &str, platforms: &[PlatformKind]) {
    store
        .insert(&ContentItem::new(id, "Title", "Summary").with_platforms(platforms.iter().copied()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_failing_adapter_does_not_block_siblings() {
    let store = Arc::new(MemoryStore::new());
    insert(&store, "item", &[TG, BS, TW]).await;

    let bluesky = Arc::new(MockPlatform::success(BS));
    let twitter = Arc::new(MockPlatform::failing(
        TW,
        PlatformError::Validation("too long".to_string()),
    ));
    let mut registry = PlatformRegistry::new().with(PanickingPlatform);
    registry.register(bluesky.clone());
    registry.register(twitter.clone());

    let outcome = dispatcher(store.clone(), registry, EventBus::default())
        .dispatch(&WorkRequest::item("item"))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        DispatchOutcome::Completed { ref attempted, .. } if attempted == &vec![TG, BS, TW]
    ));

    let item = store.load(&ItemId::from("item")).await.unwrap().unwrap();
    assert_eq!(item.platform_results[&TG].status, PublicationStatus::Failed);
    assert!(item.platform_results[&TG].error.as_deref().unwrap().contains("panicked"));
    assert_eq!(item.platform_results[&BS].status, PublicationStatus::Success);
    assert_eq!(item.platform_results[&TW].status, PublicationStatus::Failed);
    assert_eq!(item.phase, Phase::PartiallyPublished);
    assert_eq!(bluesky.publish_call_count(), 1);
    assert_eq!(twitter.publish_call_count(), 1);
}

#[tokio::test]
async fn test_store_outage_mid_pass_records_nothing_and_requeues() {
    let store = Arc::new(MemoryStore::new());
    insert(&store, "item", &[TG, BS]).await;

    let bluesky = Arc::new(MockPlatform::success(BS));
    let mut registry = PlatformRegistry::new().with(StoreOutagePlatform {
        store: store.clone(),
    });
    registry.register(bluesky.clone());

    let events = EventBus::default();
    let mut receiver = events.subscribe();
    let queue = Arc::new(PublicationQueue::new());
    let stats = Arc::new(WorkerStats::default());
    let worker = Worker::new(
        queue.clone(),
        dispatcher(store.clone(), registry, events),
        WorkerSettings {
            pop_timeout: Duration::from_millis(10),
            store_alert_threshold: 1,
            store_retry_delay: Duration::from_secs(30),
        },
        stats.clone(),
    );

    let outcome = worker.process(WorkRequest::item("item")).await;
    assert!(matches!(outcome, Some(DispatchOutcome::Aborted { .. })));

    // the pass stopped before bluesky and left the item queued for later
    assert_eq!(bluesky.publish_call_count(), 0);
    assert_eq!(queue.deferred_len(), 1);
    assert_eq!(
        stats
            .consecutive_store_failures
            .load(Ordering::Relaxed),
        1
    );

    store.set_available(true);
    let item = store.load(&ItemId::from("item")).await.unwrap().unwrap();
    assert!(item.platform_results.is_empty());
    assert_eq!(item.phase, Phase::Ready);

    let mut saw_abort = false;
    while let Ok(event) = receiver.try_recv() {
        if matches!(event, Event::DispatchAborted { .. }) {
            saw_abort = true;
        }
    }
    assert!(saw_abort);
}

#[tokio::test]
async fn test_briefly_locked_store_records_outcome_without_reposting() {
    let memory = Arc::new(MemoryStore::new());
    insert(&memory, "item", &[TG]).await;
    let store = Arc::new(LockedStore::new(memory.clone(), 1));

    let telegram = Arc::new(MockPlatform::success(TG));
    let mut registry = PlatformRegistry::new();
    registry.register(telegram.clone());
    let dispatcher = Dispatcher::new(
        registry,
        StatusService::new(store, EventBus::default()),
        RetryPolicy::default(),
        Duration::ZERO,
    );

    let outcome = dispatcher.dispatch(&WorkRequest::item("item")).await.unwrap();
    assert!(matches!(
        outcome,
        DispatchOutcome::Completed { phase: Phase::FullyPublished, .. }
    ));

    let second = dispatcher.dispatch(&WorkRequest::item("item")).await.unwrap();
    assert!(matches!(second, DispatchOutcome::NothingDue { .. }));
    assert_eq!(telegram.publish_call_count(), 1);

    let item = memory.load(&ItemId::from("item")).await.unwrap().unwrap();
    assert_eq!(item.platform_results[&TG].status, PublicationStatus::Success);
}

#[tokio::test]
async fn test_store_refusing_writes_aborts_and_requeues() {
    let memory = Arc::new(MemoryStore::new());
    insert(&memory, "item", &[TG, BS]).await;
    let store = Arc::new(LockedStore::new(memory.clone(), usize::MAX));

    let bluesky = Arc::new(MockPlatform::success(BS));
    let mut registry = PlatformRegistry::new().with(MockPlatform::success(TG));
    registry.register(bluesky.clone());

    let queue = Arc::new(PublicationQueue::new());
    let stats = Arc::new(WorkerStats::default());
    let worker = Worker::new(
        queue.clone(),
        Dispatcher::new(
            registry,
            StatusService::new(store, EventBus::default()),
            RetryPolicy::default(),
            Duration::ZERO,
        ),
        WorkerSettings {
            pop_timeout: Duration::from_millis(10),
            store_alert_threshold: 1,
            store_retry_delay: Duration::from_secs(30),
        },
        stats.clone(),
    );

    let outcome = worker.process(WorkRequest::item("item")).await;
    assert!(matches!(outcome, Some(DispatchOutcome::Aborted { .. })));

    // the pass stopped at the first unrecorded outcome
    assert_eq!(bluesky.publish_call_count(), 0);
    assert_eq!(queue.deferred_len(), 1);
    assert_eq!(stats.aborted.load(Ordering::Relaxed), 1);

    let item = memory.load(&ItemId::from("item")).await.unwrap().unwrap();
    assert!(item.platform_results.is_empty());
    assert_eq!(item.phase, Phase::Ready);
}

#[tokio::test]
async fn test_retry_after_backoff_turns_failure_into_success() {
    let store = Arc::new(MemoryStore::new());
    insert(&store, "item", &[TG]).await;

    let telegram = Arc::new(MockPlatform::scripted(
        TG,
        [libfanout::platforms::mock::MockOutcome::Fail(
            PlatformError::RateLimit("429".to_string()),
        )],
    ));
    let mut registry = PlatformRegistry::new();
    registry.register(telegram.clone());

    let dispatcher = Dispatcher::new(
        registry,
        StatusService::new(store.clone(), EventBus::default()),
        RetryPolicy {
            base_delay: Duration::from_millis(50),
            multiplier: 1.0,
            max_attempts: 3,
            max_delay: None,
        },
        Duration::ZERO,
    );

    let first = dispatcher.dispatch(&WorkRequest::item("item")).await.unwrap();
    let retry_at = first.next_retry_at().unwrap();

    // not due yet
    let early = dispatcher.dispatch(&WorkRequest::item("item")).await.unwrap();
    assert!(matches!(early, DispatchOutcome::NothingDue { .. }));

    let wait = (retry_at - chrono::Utc::now()).to_std().unwrap_or_default();
    tokio::time::sleep(wait + Duration::from_millis(10)).await;

    let second = dispatcher.dispatch(&WorkRequest::item("item")).await.unwrap();
    assert!(matches!(
        second,
        DispatchOutcome::Completed { phase: Phase::FullyPublished, .. }
    ));

    let item = store.load(&ItemId::from("item")).await.unwrap().unwrap();
    assert_eq!(item.platform_results[&TG].attempt_count, 2);
    assert!(item.next_retry_at.is_none());
    assert_eq!(telegram.publish_call_count(), 2);
}

#[test]
fn test_backoff_grows_then_exhausts() {
    let now = now_millis();
    let base = Duration::from_secs(60);

    let first = next_retry_at(now, 0, base, 2.0, 3).at().unwrap();
    let second = next_retry_at(now, 1, base, 2.0, 3).at().unwrap();
    let third = next_retry_at(now, 2, base, 2.0, 3).at().unwrap();

    assert!(first < second && second < third);
    assert_eq!(first - now, chrono::Duration::seconds(60));
    assert_eq!(third - now, chrono::Duration::seconds(240));
    assert_eq!(next_retry_at(now, 3, base, 2.0, 3), RetryDecision::Exhausted);
}

#[tokio::test]
async fn test_shutdown_finishes_in_flight_item() {
    let store = Arc::new(MemoryStore::new());
    insert(&store, "a", &[TG]).await;
    insert(&store, "b", &[TG]).await;

    let mut config = Config::default_config();
    config.publisher.pacing_delay_ms = 0;
    config.publisher.pop_timeout_secs = 1;

    let registry =
        PlatformRegistry::new().with(MockPlatform::with_delay(TG, Duration::from_millis(300)));
    let publisher = Publisher::new(store.clone(), registry, &config);
    let mut events = publisher.subscribe();
    publisher.start().unwrap();

    let in_flight = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(Event::DispatchStarted { item_id, .. }) = events.recv().await {
                break item_id;
            }
        }
    })
    .await
    .unwrap();

    publisher.shutdown(Duration::ZERO).await;

    // the item being dispatched completed, the one behind it was not started
    let finished = store.load(&in_flight).await.unwrap().unwrap();
    assert_eq!(finished.phase, Phase::FullyPublished);

    let other_id = if in_flight.as_str() == "a" { "b" } else { "a" };
    let other = store.load(&ItemId::from(other_id)).await.unwrap().unwrap();
    assert_eq!(other.phase, Phase::Ready);
    assert!(other.platform_results.is_empty());

    // no new work after the stop signal
    assert!(publisher.enqueue(other_id, None).is_err());
    assert!(!publisher.stats().worker_running);
}

#[tokio::test]
async fn test_drain_completes_queued_work() {
    let store = Arc::new(MemoryStore::new());
    insert(&store, "a", &[TG]).await;
    insert(&store, "b", &[TG]).await;

    let mut config = Config::default_config();
    config.publisher.pacing_delay_ms = 0;
    let publisher = Publisher::new(
        store.clone(),
        PlatformRegistry::new().with(MockPlatform::success(TG)),
        &config,
    );
    publisher.enqueue("a", None).unwrap();
    publisher.enqueue("b", None).unwrap();
    publisher.start().unwrap();

    publisher.shutdown(Duration::from_secs(5)).await;

    for id in ["a", "b"] {
        let item = store.load(&ItemId::from(id)).await.unwrap().unwrap();
        assert_eq!(item.phase, Phase::FullyPublished, "item {}", id);
    }
}
