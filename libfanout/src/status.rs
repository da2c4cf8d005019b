//! Status contract: the only place `platform_results` is mutated
//!
//! Every mutation is a read-modify-write of one item performed under that
//! item's lock, so concurrent reports for different platforms of the same
//! item cannot overwrite each other. Writers in other processes are caught
//! by the store's version check: on a conflict the item is reloaded and the
//! change merged again. After each merge the phase is re-derived and
//! persisted together with the results.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::error::{FanoutError, Result};
use crate::events::{Event, EventBus};
use crate::phase::derive_phase;
use crate::store::ContentStore;
use crate::types::{
    now_millis, ContentItem, ItemId, PlatformKind, PublicationResult, PublicationStatus, Report,
    StatusSnapshot,
};

/// Reload-and-merge rounds allowed when another process keeps winning the write
const MAX_CONFLICT_RETRIES: u32 = 5;

/// What `merge_report` did with a report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied,
    /// Same payload as the stored result; a resend of an earlier report
    Duplicate,
    /// The platform already succeeded and a success is never replaced
    SuccessIsPermanent,
}

impl MergeOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, MergeOutcome::Applied)
    }
}

/// Merge one platform outcome into an item and re-derive its phase
///
/// Pure with respect to the store: the caller persists the item.
pub fn merge_report(
    item: &mut ContentItem,
    platform: PlatformKind,
    report: &Report,
    now: DateTime<Utc>,
) -> MergeOutcome {
    let previous = item.platform_results.get(&platform);

    if let Some(existing) = previous {
        if is_duplicate(existing, report) {
            return MergeOutcome::Duplicate;
        }
        if existing.is_success() {
            return MergeOutcome::SuccessIsPermanent;
        }
    }

    let attempted_at = report.attempted_at.unwrap_or(now);
    let attempt_count = previous.map_or(0, |r| r.attempt_count).saturating_add(1);
    let next_retry_at = match report.status {
        PublicationStatus::Failed => report.next_retry_at,
        PublicationStatus::Success | PublicationStatus::Pending => None,
    };

    item.platform_results.insert(
        platform,
        PublicationResult {
            status: report.status,
            post_id: report.post_id.clone(),
            post_url: report.post_url.clone(),
            error: report.error.clone(),
            attempted_at,
            attempt_count,
            next_retry_at,
        },
    );

    item.attempt_count = item.attempt_count.saturating_add(1);
    item.last_attempt_at = Some(item.last_attempt_at.map_or(attempted_at, |t| t.max(attempted_at)));
    if report.status == PublicationStatus::Success && item.published_at.is_none() {
        item.published_at = Some(attempted_at);
    }
    item.next_retry_at = item.earliest_retry();
    item.phase = derive_phase(item.phase, &item.selected_platforms, &item.platform_results);

    MergeOutcome::Applied
}

fn is_duplicate(existing: &PublicationResult, report: &Report) -> bool {
    existing.status == report.status
        && existing.post_id == report.post_id
        && existing.post_url == report.post_url
        && existing.error == report.error
        && existing.next_retry_at == report.next_retry_at
        && report.attempted_at.map_or(true, |t| t == existing.attempted_at)
}

/// Per-item async locks
///
/// Entries are pruned once nobody holds or waits for them.
#[derive(Default)]
pub struct ItemLocks {
    locks: Mutex<HashMap<ItemId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ItemLocks {
    pub async fn lock(&self, id: &ItemId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.retain(|_, m| Arc::strong_count(m) > 1);
            locks
                .entry(id.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Item and what the merge did, returned by [`StatusService::report`]
#[derive(Debug, Clone)]
pub struct Merged {
    pub item: ContentItem,
    pub outcome: MergeOutcome,
}

#[derive(Clone)]
pub struct StatusService {
    store: Arc<dyn ContentStore>,
    locks: Arc<ItemLocks>,
    events: EventBus,
}

impl StatusService {
    pub fn new(store: Arc<dyn ContentStore>, events: EventBus) -> Self {
        Self {
            store,
            locks: Arc::new(ItemLocks::default()),
            events,
        }
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Read-only status view
    pub async fn get_status(&self, id: &ItemId) -> Result<StatusSnapshot> {
        Ok(self.load(id).await?.snapshot())
    }

    /// Load an item, failing with `NotFound` when it does not exist
    pub async fn load(&self, id: &ItemId) -> Result<ContentItem> {
        self.store
            .load(id)
            .await?
            .ok_or_else(|| FanoutError::NotFound(id.to_string()))
    }

    /// Merge a per-platform outcome
    ///
    /// Safe to call repeatedly with the same payload: a resend is detected
    /// and leaves the item untouched. A stored success is never replaced.
    pub async fn report(
        &self,
        id: &ItemId,
        platform: PlatformKind,
        report: Report,
    ) -> Result<Merged> {
        let _guard = self.locks.lock(id).await;
        let mut conflicts = 0;

        loop {
            let mut item = self.load(id).await?;
            ensure_owned(&item)?;

            if !item.selected_platforms.contains(&platform) {
                return Err(FanoutError::InvalidInput(format!(
                    "platform {} is not selected for item {}",
                    platform, id
                )));
            }

            let prior_phase = item.phase;
            let outcome = merge_report(&mut item, platform, &report, now_millis());

            if !outcome.is_applied() {
                let reason = match outcome {
                    MergeOutcome::Duplicate => "duplicate report",
                    _ => "platform already published; success is permanent",
                };
                info!(
                    item_id = %id,
                    platform = %platform,
                    status = %report.status,
                    reason,
                    "Report ignored"
                );
                self.events.emit(Event::ReportIgnored {
                    item_id: id.clone(),
                    platform,
                    reason: reason.to_string(),
                });
                return Ok(Merged { item, outcome });
            }

            match self.store.persist(&mut item).await {
                Ok(()) => {}
                Err(e) if e.is_conflict() && conflicts < MAX_CONFLICT_RETRIES => {
                    conflicts += 1;
                    debug!(item_id = %id, platform = %platform, conflicts, "Item changed concurrently, merging again");
                    continue;
                }
                Err(e) => return Err(e),
            }

            let attempt = item
                .platform_results
                .get(&platform)
                .map_or(0, |r| r.attempt_count);
            debug!(
                item_id = %id,
                platform = %platform,
                status = %report.status,
                attempt,
                phase = %item.phase,
                "Report merged"
            );
            self.events.emit(Event::PlatformAttempted {
                item_id: id.clone(),
                platform,
                status: report.status,
                attempt,
                error: report.error.clone(),
            });
            self.emit_phase_change(id, prior_phase, &item);

            return Ok(Merged { item, outcome });
        }
    }

    /// Replace the selected platforms of an item
    ///
    /// Results of deselected platforms are kept but stop counting toward the
    /// phase.
    pub async fn reselect(
        &self,
        id: &ItemId,
        platforms: BTreeSet<PlatformKind>,
    ) -> Result<ContentItem> {
        self.update_selection(id, platforms, false).await
    }

    /// Adopt `platforms` as the selection only if the item has none yet
    pub async fn select_if_empty(
        &self,
        id: &ItemId,
        platforms: BTreeSet<PlatformKind>,
    ) -> Result<ContentItem> {
        self.update_selection(id, platforms, true).await
    }

    async fn update_selection(
        &self,
        id: &ItemId,
        platforms: BTreeSet<PlatformKind>,
        only_if_empty: bool,
    ) -> Result<ContentItem> {
        let _guard = self.locks.lock(id).await;
        let mut conflicts = 0;

        loop {
            let mut item = self.load(id).await?;
            ensure_owned(&item)?;

            if (only_if_empty && !item.selected_platforms.is_empty())
                || item.selected_platforms == platforms
            {
                return Ok(item);
            }

            let prior_phase = item.phase;
            let dropped: Vec<String> = item
                .selected_platforms
                .difference(&platforms)
                .map(|p| p.to_string())
                .collect();
            item.selected_platforms = platforms.clone();
            item.next_retry_at = item.earliest_retry();
            item.phase = derive_phase(item.phase, &item.selected_platforms, &item.platform_results);

            match self.store.persist(&mut item).await {
                Ok(()) => {}
                Err(e) if e.is_conflict() && conflicts < MAX_CONFLICT_RETRIES => {
                    conflicts += 1;
                    debug!(item_id = %id, conflicts, "Item changed concurrently, selecting again");
                    continue;
                }
                Err(e) => return Err(e),
            }

            if !dropped.is_empty() {
                warn!(item_id = %id, dropped = ?dropped, "Platforms removed from selection");
            }
            info!(
                item_id = %id,
                platforms = ?item.selected_platforms,
                phase = %item.phase,
                "Selection updated"
            );
            self.emit_phase_change(id, prior_phase, &item);

            return Ok(item);
        }
    }

    fn emit_phase_change(&self, id: &ItemId, from: crate::types::Phase, item: &ContentItem) {
        if from != item.phase {
            info!(item_id = %id, from = %from, to = %item.phase, "Phase changed");
            self.events.emit(Event::PhaseChanged {
                item_id: id.clone(),
                from,
                to: item.phase,
            });
        }
    }
}

fn ensure_owned(item: &ContentItem) -> Result<()> {
    if item.phase.is_pre_publication() {
        return Err(FanoutError::InvalidInput(format!(
            "item {} is still in phase {}; curation has not finished",
            item.id, item.phase
        )));
    }
    Ok(())
}
