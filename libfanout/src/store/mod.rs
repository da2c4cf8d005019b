//! Content item persistence
//!
//! The orchestrator never owns item storage: it reads items that curation
//! has made ready and writes back `platform_results`, `phase` and the
//! timestamps. [`crate::db::Database`] is the SQLite implementation;
//! [`memory::MemoryStore`] keeps everything in process and can simulate an
//! unreachable store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{ContentItem, ItemId};

pub mod memory;

pub use memory::MemoryStore;

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Items ready for dispatch at `now`, oldest first
    ///
    /// That is every item in phase `ready` or `publishing`, plus items in
    /// `partially_published` or `failed` whose `next_retry_at` has passed.
    /// Items with no platform selected are skipped: a pass over them has
    /// nothing to attempt and they would hold a slot every cycle.
    async fn fetch_pending(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<ContentItem>>;

    /// Load a single item
    async fn load(&self, id: &ItemId) -> Result<Option<ContentItem>>;

    /// Durably write an item's publication state
    ///
    /// The item row and all of its platform results are written together,
    /// and only if the stored `version` still equals `item.version`.
    /// Otherwise another writer got there first and the call fails with
    /// [`StoreError::Conflict`](crate::error::StoreError::Conflict), leaving
    /// the store untouched. On success `item.version` is advanced to the
    /// newly stored version.
    async fn persist(&self, item: &mut ContentItem) -> Result<()>;

    /// Add a new item (used by curation collaborators and tests)
    async fn insert(&self, item: &ContentItem) -> Result<()>;
}

/// Shared selection rule for `fetch_pending` implementations
pub(crate) fn is_dispatchable(item: &ContentItem, now: DateTime<Utc>) -> bool {
    use crate::types::Phase;

    if item.selected_platforms.is_empty() {
        return false;
    }

    match item.phase {
        Phase::Ready | Phase::Publishing => true,
        Phase::PartiallyPublished | Phase::Failed => item.next_retry_at.is_some_and(|at| at <= now),
        Phase::Pending | Phase::Processing | Phase::FullyPublished => false,
    }
}
