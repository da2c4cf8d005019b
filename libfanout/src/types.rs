//! Core types for Fanout

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::FanoutError;

/// Stable identifier of a content item
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A social destination. The declaration order is the dispatch order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    Telegram,
    Bluesky,
    Twitter,
    Linkedin,
}

impl PlatformKind {
    pub const ALL: [PlatformKind; 4] = [
        PlatformKind::Telegram,
        PlatformKind::Bluesky,
        PlatformKind::Twitter,
        PlatformKind::Linkedin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformKind::Telegram => "telegram",
            PlatformKind::Bluesky => "bluesky",
            PlatformKind::Twitter => "twitter",
            PlatformKind::Linkedin => "linkedin",
        }
    }
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlatformKind {
    type Err = FanoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "telegram" => Ok(PlatformKind::Telegram),
            "bluesky" => Ok(PlatformKind::Bluesky),
            "twitter" | "x" => Ok(PlatformKind::Twitter),
            "linkedin" => Ok(PlatformKind::Linkedin),
            other => Err(FanoutError::InvalidInput(format!(
                "Unknown platform '{}'. Valid options: telegram, bluesky, twitter, linkedin",
                other
            ))),
        }
    }
}

/// Per-platform publication status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicationStatus {
    Pending,
    Success,
    Failed,
}

impl PublicationStatus {
    /// `success` and `failed` are terminal; a failed platform may still be
    /// retried until its budget is exhausted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PublicationStatus::Success | PublicationStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PublicationStatus::Pending => "pending",
            PublicationStatus::Success => "success",
            PublicationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PublicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PublicationStatus {
    type Err = FanoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PublicationStatus::Pending),
            "success" => Ok(PublicationStatus::Success),
            "failed" => Ok(PublicationStatus::Failed),
            other => Err(FanoutError::InvalidInput(format!(
                "Invalid publication status '{}'. Valid options: pending, success, failed",
                other
            ))),
        }
    }
}

/// Aggregate lifecycle phase of a content item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Processing,
    Ready,
    Publishing,
    PartiallyPublished,
    FullyPublished,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Processing => "processing",
            Phase::Ready => "ready",
            Phase::Publishing => "publishing",
            Phase::PartiallyPublished => "partially_published",
            Phase::FullyPublished => "fully_published",
            Phase::Failed => "failed",
        }
    }

    /// Phases owned by the curation collaborator; the orchestrator leaves
    /// items in these phases alone.
    pub fn is_pre_publication(&self) -> bool {
        matches!(self, Phase::Pending | Phase::Processing)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = FanoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Phase::Pending),
            "processing" => Ok(Phase::Processing),
            "ready" => Ok(Phase::Ready),
            "publishing" => Ok(Phase::Publishing),
            "partially_published" => Ok(Phase::PartiallyPublished),
            "fully_published" => Ok(Phase::FullyPublished),
            "failed" => Ok(Phase::Failed),
            other => Err(FanoutError::InvalidInput(format!("Invalid phase '{}'", other))),
        }
    }
}

/// Stored outcome of the attempts made for one platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationResult {
    pub status: PublicationStatus,
    pub post_id: Option<String>,
    pub post_url: Option<String>,
    pub error: Option<String>,
    pub attempted_at: DateTime<Utc>,
    pub attempt_count: u32,
    /// Set while a failed platform still has retry budget left
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl PublicationResult {
    pub fn is_success(&self) -> bool {
        self.status == PublicationStatus::Success
    }

    /// Whether the dispatcher should attempt this platform again at `now`
    pub fn is_retry_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            PublicationStatus::Success => false,
            PublicationStatus::Pending => true,
            PublicationStatus::Failed => self.next_retry_at.is_some_and(|at| at <= now),
        }
    }
}

/// Content prepared for an adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostContent {
    pub title: String,
    pub description: String,
    pub url: Option<String>,
    pub hashtags: Vec<String>,
    pub category: Option<String>,
}

/// The unit of work: a curated item and its publication state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: ItemId,
    pub title: String,
    pub summary: String,
    pub url: Option<String>,
    pub hashtags: Vec<String>,
    pub category: Option<String>,
    pub selected_platforms: BTreeSet<PlatformKind>,
    pub platform_results: BTreeMap<PlatformKind, PublicationResult>,
    pub phase: Phase,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Write counter for optimistic concurrency; bumped by every persist
    #[serde(default)]
    pub version: u64,
}

impl ContentItem {
    /// Create an item as handed over by curation, in phase `ready`
    pub fn new(id: impl Into<ItemId>, title: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            summary: summary.into(),
            url: None,
            hashtags: Vec::new(),
            category: None,
            selected_platforms: BTreeSet::new(),
            platform_results: BTreeMap::new(),
            phase: Phase::Ready,
            attempt_count: 0,
            last_attempt_at: None,
            next_retry_at: None,
            published_at: None,
            created_at: now_millis(),
            version: 0,
        }
    }

    pub fn with_platforms(mut self, platforms: impl IntoIterator<Item = PlatformKind>) -> Self {
        self.selected_platforms = platforms.into_iter().collect();
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_hashtags(mut self, hashtags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.hashtags = hashtags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    pub fn post_content(&self) -> PostContent {
        PostContent {
            title: self.title.clone(),
            description: self.summary.clone(),
            url: self.url.clone(),
            hashtags: self.hashtags.clone(),
            category: self.category.clone(),
        }
    }

    /// Selected platforms the dispatcher should attempt at `now`, in dispatch order
    pub fn due_platforms(&self, now: DateTime<Utc>) -> Vec<PlatformKind> {
        self.selected_platforms
            .iter()
            .filter(|p| match self.platform_results.get(p) {
                None => true,
                Some(result) => result.is_retry_due(now),
            })
            .copied()
            .collect()
    }

    /// Earliest scheduled retry among the selected platforms
    pub fn earliest_retry(&self) -> Option<DateTime<Utc>> {
        self.selected_platforms
            .iter()
            .filter_map(|p| self.platform_results.get(p))
            .filter(|r| r.status == PublicationStatus::Failed)
            .filter_map(|r| r.next_retry_at)
            .min()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            item_id: self.id.clone(),
            phase: self.phase,
            selected_platforms: self.selected_platforms.clone(),
            platform_results: self.platform_results.clone(),
            attempt_count: self.attempt_count,
            last_attempt_at: self.last_attempt_at,
            next_retry_at: self.next_retry_at,
            published_at: self.published_at,
        }
    }
}

/// A per-platform outcome reported to the status contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub status: PublicationStatus,
    #[serde(default)]
    pub post_id: Option<String>,
    #[serde(default)]
    pub post_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// When the underlying attempt happened. Absent for external reports,
    /// in which case an identical payload is treated as a resend.
    #[serde(default)]
    pub attempted_at: Option<DateTime<Utc>>,
    /// Only meaningful for `failed`: when the platform may be retried
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl Report {
    pub fn success(post_id: impl Into<String>, post_url: Option<String>) -> Self {
        Self {
            status: PublicationStatus::Success,
            post_id: Some(post_id.into()),
            post_url,
            error: None,
            attempted_at: None,
            next_retry_at: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: PublicationStatus::Failed,
            post_id: None,
            post_url: None,
            error: Some(error.into()),
            attempted_at: None,
            next_retry_at: None,
        }
    }

    pub fn at(mut self, attempted_at: DateTime<Utc>) -> Self {
        self.attempted_at = Some(attempted_at.trunc_subsecs(3));
        self
    }

    pub fn retry_at(mut self, next_retry_at: DateTime<Utc>) -> Self {
        self.next_retry_at = Some(next_retry_at.trunc_subsecs(3));
        self
    }
}

/// Read-only view returned by `get_status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub item_id: ItemId,
    pub phase: Phase,
    pub selected_platforms: BTreeSet<PlatformKind>,
    pub platform_results: BTreeMap<PlatformKind, PublicationResult>,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Current time truncated to the millisecond precision the store keeps
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = ItemId::generate();
        let b = ItemId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_platform_kind_parse() {
        assert_eq!("telegram".parse::<PlatformKind>().unwrap(), PlatformKind::Telegram);
        assert_eq!("Bluesky".parse::<PlatformKind>().unwrap(), PlatformKind::Bluesky);
        assert_eq!("x".parse::<PlatformKind>().unwrap(), PlatformKind::Twitter);
        assert_eq!(" linkedin ".parse::<PlatformKind>().unwrap(), PlatformKind::Linkedin);
        assert!("myspace".parse::<PlatformKind>().is_err());
    }

    #[test]
    fn test_wire_strings() {
        assert_eq!(
            serde_json::to_string(&Phase::PartiallyPublished).unwrap(),
            "\"partially_published\""
        );
        assert_eq!(
            serde_json::to_string(&Phase::FullyPublished).unwrap(),
            "\"fully_published\""
        );
        assert_eq!(
            serde_json::to_string(&PublicationStatus::Success).unwrap(),
            "\"success\""
        );
        assert_eq!(
            serde_json::to_string(&PlatformKind::Linkedin).unwrap(),
            "\"linkedin\""
        );

        for phase in [
            Phase::Pending,
            Phase::Processing,
            Phase::Ready,
            Phase::Publishing,
            Phase::PartiallyPublished,
            Phase::FullyPublished,
            Phase::Failed,
        ] {
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), phase);
        }
    }

    #[test]
    fn test_dispatch_order_is_declaration_order() {
        let item = ContentItem::new("1", "t", "s").with_platforms([
            PlatformKind::Linkedin,
            PlatformKind::Telegram,
            PlatformKind::Twitter,
        ]);
        assert_eq!(
            item.due_platforms(Utc::now()),
            vec![PlatformKind::Telegram, PlatformKind::Twitter, PlatformKind::Linkedin]
        );
    }

    #[test]
    fn test_due_platforms_skips_success_and_future_retries() {
        let now = now_millis();
        let mut item = ContentItem::new("1", "t", "s").with_platforms([
            PlatformKind::Telegram,
            PlatformKind::Bluesky,
            PlatformKind::Twitter,
            PlatformKind::Linkedin,
        ]);
        let base = PublicationResult {
            status: PublicationStatus::Success,
            post_id: Some("1".to_string()),
            post_url: None,
            error: None,
            attempted_at: now,
            attempt_count: 1,
            next_retry_at: None,
        };
        item.platform_results.insert(PlatformKind::Telegram, base.clone());
        item.platform_results.insert(
            PlatformKind::Bluesky,
            PublicationResult {
                status: PublicationStatus::Failed,
                next_retry_at: Some(now + Duration::seconds(60)),
                ..base.clone()
            },
        );
        item.platform_results.insert(
            PlatformKind::Twitter,
            PublicationResult {
                status: PublicationStatus::Failed,
                next_retry_at: Some(now - Duration::seconds(1)),
                ..base.clone()
            },
        );

        // linkedin has never been attempted, twitter's retry is due
        assert_eq!(
            item.due_platforms(now),
            vec![PlatformKind::Twitter, PlatformKind::Linkedin]
        );
        assert_eq!(item.earliest_retry(), Some(now - Duration::seconds(1)));
    }

    #[test]
    fn test_permanently_failed_is_not_due() {
        let result = PublicationResult {
            status: PublicationStatus::Failed,
            post_id: None,
            post_url: None,
            error: Some("401".to_string()),
            attempted_at: now_millis(),
            attempt_count: 1,
            next_retry_at: None,
        };
        assert!(!result.is_retry_due(Utc::now() + Duration::days(365)));
    }

    #[test]
    fn test_report_deserializes_with_optional_fields() {
        let report: Report =
            serde_json::from_str(r#"{"status":"success","post_id":"123"}"#).unwrap();
        assert_eq!(report.status, PublicationStatus::Success);
        assert_eq!(report.post_id.as_deref(), Some("123"));
        assert!(report.attempted_at.is_none());
    }
}
