//! Publication queue
//!
//! FIFO of ready work plus a deferred set ordered by `not_before`. An item is
//! queued at most once: enqueuing it again merges the two requests, so a
//! manual publish-now and a periodic fetch never dispatch the same item
//! twice in a row.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::error::QueueError;
use crate::types::{ItemId, PlatformKind};

/// A request to run a dispatch pass for one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkRequest {
    pub item_id: ItemId,
    /// Restrict the pass to these platforms; `None` means all selected
    pub platforms: Option<BTreeSet<PlatformKind>>,
    /// Also retry platforms whose failure was final. Successes are never
    /// re-attempted.
    pub force: bool,
}

impl WorkRequest {
    pub fn item(item_id: impl Into<ItemId>) -> Self {
        Self {
            item_id: item_id.into(),
            platforms: None,
            force: false,
        }
    }

    pub fn for_platforms(
        item_id: impl Into<ItemId>,
        platforms: impl IntoIterator<Item = PlatformKind>,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            platforms: Some(platforms.into_iter().collect()),
            force: false,
        }
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    fn merge(&mut self, other: WorkRequest) {
        self.platforms = match (self.platforms.take(), other.platforms) {
            (Some(mut ours), Some(theirs)) => {
                ours.extend(theirs);
                Some(ours)
            }
            _ => None,
        };
        self.force |= other.force;
    }
}

type DeferredKey = (DateTime<Utc>, u64);

#[derive(Debug, Clone, Copy)]
enum Slot {
    Ready,
    Deferred(DeferredKey),
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<WorkRequest>,
    deferred: BTreeMap<DeferredKey, WorkRequest>,
    slots: HashMap<ItemId, Slot>,
    seq: u64,
    closed: bool,
}

impl QueueState {
    fn push_ready(&mut self, request: WorkRequest) {
        match self.slots.get(&request.item_id).copied() {
            Some(Slot::Ready) => {
                if let Some(queued) = self
                    .ready
                    .iter_mut()
                    .find(|r| r.item_id == request.item_id)
                {
                    queued.merge(request);
                }
            }
            Some(Slot::Deferred(key)) => {
                if let Some(mut queued) = self.deferred.remove(&key) {
                    queued.merge(request);
                    self.slots.insert(queued.item_id.clone(), Slot::Ready);
                    self.ready.push_back(queued);
                }
            }
            None => {
                self.slots.insert(request.item_id.clone(), Slot::Ready);
                self.ready.push_back(request);
            }
        }
    }

    fn push_deferred(&mut self, request: WorkRequest, not_before: DateTime<Utc>) {
        match self.slots.get(&request.item_id).copied() {
            Some(Slot::Ready) => self.push_ready(request),
            Some(Slot::Deferred(key)) => {
                if let Some(mut queued) = self.deferred.remove(&key) {
                    queued.merge(request);
                    let at = key.0.min(not_before);
                    self.insert_deferred(queued, at);
                }
            }
            None => self.insert_deferred(request, not_before),
        }
    }

    fn insert_deferred(&mut self, request: WorkRequest, not_before: DateTime<Utc>) {
        self.seq += 1;
        let key = (not_before, self.seq);
        self.slots.insert(request.item_id.clone(), Slot::Deferred(key));
        self.deferred.insert(key, request);
    }

    /// Move every deferred request whose time has come to the ready queue
    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(entry) = self.deferred.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let request = entry.remove();
            self.slots.insert(request.item_id.clone(), Slot::Ready);
            self.ready.push_back(request);
        }
    }

    fn pop_ready(&mut self) -> Option<WorkRequest> {
        let request = self.ready.pop_front()?;
        self.slots.remove(&request.item_id);
        Some(request)
    }

    fn next_deferred(&self) -> Option<DateTime<Utc>> {
        self.deferred.keys().next().map(|(at, _)| *at)
    }
}

#[derive(Default)]
pub struct PublicationQueue {
    state: Mutex<QueueState>,
    available: Notify,
    emptied: Notify,
}

impl PublicationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue an item for immediate dispatch
    pub fn enqueue(&self, request: WorkRequest) -> Result<(), QueueError> {
        {
            let mut state = self.state();
            if state.closed {
                return Err(QueueError::Closed);
            }
            debug!(item_id = %request.item_id, force = request.force, "Enqueued");
            state.push_ready(request);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Queue an item to become ready at `not_before`
    ///
    /// If the item is already queued the requests merge and the earlier
    /// time wins.
    pub fn enqueue_at(
        &self,
        request: WorkRequest,
        not_before: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        if not_before <= Utc::now() {
            return self.enqueue(request);
        }
        {
            let mut state = self.state();
            if state.closed {
                return Err(QueueError::Closed);
            }
            debug!(item_id = %request.item_id, %not_before, "Deferred");
            state.push_deferred(request, not_before);
        }
        // the waiting worker may need to shorten its sleep
        self.available.notify_one();
        Ok(())
    }

    /// Wait up to `timeout` for ready work
    ///
    /// Returns `None` on timeout, or as soon as the queue is closed and no
    /// ready work remains.
    pub async fn pop(&self, timeout: Duration) -> Option<WorkRequest> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut state = self.state();
                if !state.closed {
                    state.promote_due(Utc::now());
                }
                if let Some(request) = state.pop_ready() {
                    if state.ready.is_empty() {
                        self.emptied.notify_waiters();
                    }
                    return Some(request);
                }
                if state.closed {
                    self.emptied.notify_waiters();
                    return None;
                }
                state.next_deferred()
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let wait = match next_due {
                Some(at) => (at - Utc::now()).to_std().unwrap_or_default().min(remaining),
                None => remaining,
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Stop accepting work
    ///
    /// Ready requests can still be popped; deferred ones are dropped since
    /// their retry time is persisted and the next fetch finds them again.
    pub fn close(&self) {
        {
            let mut state = self.state();
            state.closed = true;
            let dropped = std::mem::take(&mut state.deferred);
            for request in dropped.values() {
                state.slots.remove(&request.item_id);
            }
            if !dropped.is_empty() {
                debug!(count = dropped.len(), "Dropped deferred requests on close");
            }
        }
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Ready requests
    pub fn len(&self) -> usize {
        self.state().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn deferred_len(&self) -> usize {
        self.state().deferred.len()
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.state().slots.contains_key(id)
    }

    /// Resolve once no ready work is left
    pub async fn wait_empty(&self) {
        loop {
            let emptied = self.emptied.notified();
            tokio::pin!(emptied);
            emptied.as_mut().enable();

            if self.state().ready.is_empty() {
                return;
            }
            emptied.await;
        }
    }
}
