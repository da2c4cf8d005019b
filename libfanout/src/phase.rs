//! Phase state machine
//!
//! The aggregate phase of a content item is never stored as independent
//! truth: it is recomputed from the selected platforms and their stored
//! results after every merge.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::{Phase, PlatformKind, PublicationResult, PublicationStatus};

/// Derive the lifecycle phase of an item
///
/// With an empty selection there is nothing to aggregate and `prior` is
/// returned unchanged. Otherwise the result depends only on the statuses of
/// the selected platforms; results kept for deselected platforms are ignored.
///
/// | selected platforms                          | phase                 |
/// |---------------------------------------------|-----------------------|
/// | any without a terminal status               | `publishing`          |
/// | all `success`                               | `fully_published`     |
/// | all terminal, some `success`, some `failed` | `partially_published` |
/// | all `failed`                                | `failed`              |
pub fn derive_phase(
    prior: Phase,
    selected: &BTreeSet<PlatformKind>,
    results: &BTreeMap<PlatformKind, PublicationResult>,
) -> Phase {
    if selected.is_empty() {
        return prior;
    }

    let mut successes = 0usize;
    let mut failures = 0usize;

    for platform in selected {
        match results.get(platform).map(|r| r.status) {
            Some(PublicationStatus::Success) => successes += 1,
            Some(PublicationStatus::Failed) => failures += 1,
            Some(PublicationStatus::Pending) | None => return Phase::Publishing,
        }
    }

    match (successes, failures) {
        (_, 0) => Phase::FullyPublished,
        (0, _) => Phase::Failed,
        _ => Phase::PartiallyPublished,
    }
}
