//! In-process content store
//!
//! Available in all builds (not only tests) so integration tests and the
//! binaries' test harnesses can drive the orchestrator without SQLite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

use super::{is_dispatchable, ContentStore};
use crate::error::{FanoutError, Result, StoreError};
use crate::types::{ContentItem, ItemId};

#[derive(Default)]
pub struct MemoryStore {
    items: RwLock<HashMap<ItemId, ContentItem>>,
    unavailable: AtomicBool,
    persist_delay: Option<Duration>,
    persist_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay between reading the previous copy and writing the new one,
    /// widening the window in which an unguarded read-modify-write would race
    pub fn with_persist_delay(delay: Duration) -> Self {
        Self {
            persist_delay: Some(delay),
            ..Self::default()
        }
    }

    /// Simulate the store becoming unreachable (or reachable again)
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn persist_calls(&self) -> usize {
        self.persist_calls.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(FanoutError::Store(StoreError::Unavailable(
                "memory store switched off".to_string(),
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn fetch_pending(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<ContentItem>> {
        self.check_available()?;

        let items = self.items.read().await;
        let mut pending: Vec<ContentItem> = items
            .values()
            .filter(|item| is_dispatchable(item, now))
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn load(&self, id: &ItemId) -> Result<Option<ContentItem>> {
        self.check_available()?;
        Ok(self.items.read().await.get(id).cloned())
    }

    async fn persist(&self, item: &mut ContentItem) -> Result<()> {
        self.check_available()?;
        self.persist_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.persist_delay {
            tokio::time::sleep(delay).await;
        }

        let mut items = self.items.write().await;
        let stored = items
            .get_mut(&item.id)
            .ok_or_else(|| FanoutError::NotFound(item.id.to_string()))?;
        if stored.version != item.version {
            return Err(StoreError::Conflict(item.id.to_string()).into());
        }

        // published_at is set once
        let published_at = stored.published_at.or(item.published_at);
        item.version += 1;
        item.published_at = published_at;
        *stored = item.clone();
        Ok(())
    }

    async fn insert(&self, item: &ContentItem) -> Result<()> {
        self.check_available()?;
        self.items.write().await.insert(item.id.clone(), item.clone());
        Ok(())
    }
}
