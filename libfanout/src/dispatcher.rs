//! Dispatch pass over one content item
//!
//! Attempts every due platform of an item in declaration order, merges each
//! outcome through the status contract and schedules retries for transient
//! failures. Platforms are isolated from each other: an error, or even a
//! panic, in one adapter is recorded for that platform only.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{FanoutError, PlatformError, Result};
use crate::events::Event;
use crate::platforms::PlatformRegistry;
use crate::queue::WorkRequest;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::status::{Merged, StatusService};
use crate::types::{
    now_millis, ContentItem, ItemId, Phase, PlatformKind, PostContent, PublicationStatus, Report,
};

/// Writes of one outcome before the pass is aborted
const RECORD_ATTEMPTS: u32 = 3;
const RECORD_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Result of one dispatch pass
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// At least one platform was attempted
    Completed {
        phase: Phase,
        attempted: Vec<PlatformKind>,
        next_retry_at: Option<DateTime<Utc>>,
    },
    /// No selected platform was due
    NothingDue {
        phase: Phase,
        next_retry_at: Option<DateTime<Utc>>,
    },
    /// The store was unreachable or refused a write; nothing further was recorded
    Aborted { reason: String },
}

impl DispatchOutcome {
    /// When the item should be looked at again, if ever
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        match self {
            DispatchOutcome::Completed { next_retry_at, .. }
            | DispatchOutcome::NothingDue { next_retry_at, .. } => *next_retry_at,
            DispatchOutcome::Aborted { .. } => None,
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: PlatformRegistry,
    status: StatusService,
    policy: RetryPolicy,
    pacing: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: PlatformRegistry,
        status: StatusService,
        policy: RetryPolicy,
        pacing: Duration,
    ) -> Self {
        Self {
            registry,
            status,
            policy,
            pacing,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run one dispatch pass for the requested item
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown items, `InvalidInput` for items still in
    /// curation, and store errors other than unavailability while loading.
    /// An unreachable store is not an error: the pass reports
    /// [`DispatchOutcome::Aborted`], as it does for any store failure while
    /// recording an outcome.
    pub async fn dispatch(&self, request: &WorkRequest) -> Result<DispatchOutcome> {
        let id = &request.item_id;

        let mut item = match self.status.load(id).await {
            Ok(item) => item,
            Err(e) if e.is_store_unavailable() => return Ok(self.abort(request, &e)),
            Err(e) => return Err(e),
        };

        if item.phase.is_pre_publication() {
            return Err(FanoutError::InvalidInput(format!(
                "item {} is still in phase {}",
                id, item.phase
            )));
        }

        if item.selected_platforms.is_empty() {
            if let Some(platforms) = request.platforms.as_ref().filter(|p| !p.is_empty()) {
                item = match self.status.select_if_empty(id, platforms.clone()).await {
                    Ok(item) => item,
                    Err(e) if e.is_store_unavailable() => return Ok(self.abort(request, &e)),
                    Err(e) => return Err(e),
                };
            } else {
                warn!(item_id = %id, "No platforms selected, nothing to dispatch");
                return Ok(DispatchOutcome::NothingDue {
                    phase: item.phase,
                    next_retry_at: None,
                });
            }
        }

        let due = self.due_platforms(&item, request, now_millis());
        if due.is_empty() {
            debug!(item_id = %id, phase = %item.phase, "No platform due");
            return Ok(DispatchOutcome::NothingDue {
                phase: item.phase,
                next_retry_at: item.next_retry_at,
            });
        }

        info!(item_id = %id, platforms = ?due, force = request.force, "Dispatching");
        self.status.events().emit(Event::DispatchStarted {
            item_id: id.clone(),
            platforms: due.clone(),
        });

        let content = item.post_content();
        let mut attempted = Vec::with_capacity(due.len());

        for (index, platform) in due.iter().copied().enumerate() {
            if index > 0 && !self.pacing.is_zero() {
                tokio::time::sleep(self.pacing).await;
            }

            let prior_attempts = item
                .platform_results
                .get(&platform)
                .map_or(0, |r| r.attempt_count);
            let report = self.attempt(platform, &content, prior_attempts).await;
            attempted.push(platform);

            match self.record(id, platform, report).await {
                Ok(merged) => item = merged.item,
                Err(e @ FanoutError::Store(_)) => return Ok(self.abort(request, &e)),
                Err(e) => {
                    warn!(item_id = %id, platform = %platform, error = %e, "Could not record outcome");
                }
            }
        }

        info!(
            item_id = %id,
            phase = %item.phase,
            next_retry_at = ?item.next_retry_at,
            "Dispatch pass finished"
        );
        Ok(DispatchOutcome::Completed {
            phase: item.phase,
            attempted,
            next_retry_at: item.next_retry_at,
        })
    }

    /// Merge an attempt's outcome, retrying briefly while the store refuses the write
    ///
    /// The platform call has already happened, so giving up here means the
    /// next pass posts again. Resending the same report is safe: if an
    /// earlier write did land, the merge sees a duplicate.
    async fn record(&self, id: &ItemId, platform: PlatformKind, report: Report) -> Result<Merged> {
        let mut delay = RECORD_RETRY_DELAY;
        let mut attempt = 1;
        loop {
            match self.status.report(id, platform, report.clone()).await {
                Err(FanoutError::Store(e)) if attempt < RECORD_ATTEMPTS => {
                    warn!(
                        item_id = %id,
                        platform = %platform,
                        error = %e,
                        attempt,
                        "Could not record outcome, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Platforms to attempt now, in dispatch order
    fn due_platforms(
        &self,
        item: &ContentItem,
        request: &WorkRequest,
        now: DateTime<Utc>,
    ) -> Vec<PlatformKind> {
        if let Some(requested) = &request.platforms {
            let unselected: Vec<PlatformKind> = requested
                .difference(&item.selected_platforms)
                .copied()
                .collect();
            if !unselected.is_empty() {
                warn!(item_id = %item.id, platforms = ?unselected, "Ignoring platforms not selected for item");
            }
        }

        let requested = |p: &PlatformKind| {
            request
                .platforms
                .as_ref()
                .map_or(true, |set: &BTreeSet<PlatformKind>| set.contains(p))
        };

        item.selected_platforms
            .iter()
            .filter(|p| requested(p))
            .filter(|p| match item.platform_results.get(p) {
                None => true,
                Some(result) if request.force => result.status != PublicationStatus::Success,
                Some(result) => result.is_retry_due(now),
            })
            .copied()
            .collect()
    }

    /// One adapter call, turned into a report
    async fn attempt(&self, platform: PlatformKind, content: &PostContent, prior_attempts: u32) -> Report {
        let attempted_at = now_millis();

        let Some(adapter) = self.registry.get(platform) else {
            let error = PlatformError::NotConfigured(format!("no adapter registered for {}", platform));
            warn!(platform = %platform, "Platform selected but not configured");
            return Report::failed(error.to_string()).at(attempted_at);
        };

        let result = AssertUnwindSafe(adapter.publish(content)).catch_unwind().await;

        match result {
            Ok(Ok(post)) => {
                info!(platform = %platform, post_id = %post.post_id, "Published");
                Report::success(post.post_id, post.post_url).at(attempted_at)
            }
            Ok(Err(e)) => self.failure_report(platform, e, prior_attempts, attempted_at),
            Err(_) => {
                warn!(platform = %platform, "Adapter panicked");
                Report::failed(format!("{} adapter panicked", platform)).at(attempted_at)
            }
        }
    }

    fn failure_report(
        &self,
        platform: PlatformKind,
        error: FanoutError,
        prior_attempts: u32,
        attempted_at: DateTime<Utc>,
    ) -> Report {
        let transient = matches!(&error, FanoutError::Platform(e) if e.is_transient());
        let attempts = prior_attempts.saturating_add(1);

        if !transient {
            warn!(platform = %platform, error = %error, "Permanent failure");
            return Report::failed(error.to_string()).at(attempted_at);
        }

        match self.policy.next_retry_at(attempts, attempted_at) {
            RetryDecision::At(retry_at) => {
                warn!(
                    platform = %platform,
                    error = %error,
                    attempt = attempts,
                    retry_at = %retry_at,
                    "Transient failure, retry scheduled"
                );
                Report::failed(error.to_string())
                    .at(attempted_at)
                    .retry_at(retry_at)
            }
            RetryDecision::Exhausted => {
                warn!(platform = %platform, error = %error, attempt = attempts, "Retries exhausted");
                Report::failed(format!("{} (gave up after {} attempts)", error, attempts))
                    .at(attempted_at)
            }
        }
    }

    fn abort(&self, request: &WorkRequest, error: &FanoutError) -> DispatchOutcome {
        warn!(item_id = %request.item_id, error = %error, "Store failure, dispatch aborted");
        self.status.events().emit(Event::DispatchAborted {
            item_id: request.item_id.clone(),
            reason: error.to_string(),
        });
        DispatchOutcome::Aborted {
            reason: error.to_string(),
        }
    }
}
